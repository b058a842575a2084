//! 翻译引擎配置
//!
//! 配置来自外部（偏好设置或 TOML 文件），引擎只在加载和翻译时读取，不做持久化。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::nmt_incremental::normalizer::NormalizerOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// 是否启用翻译缓存
    pub cache_enabled: bool,
    /// LRU 缓存容量，0 表示不缓存
    pub cache_size: usize,
    /// beam 数量
    pub beam_count: usize,
    /// 解码最大步数
    pub max_sequence_length: usize,
    /// min-p 过滤阈值，0 表示关闭
    pub min_probability: f32,
    /// 重复惩罚，0 表示关闭
    pub repetition_penalty: f32,
    /// ONNX Runtime intra-op 线程数
    pub thread_count: usize,
    /// 分词器截断 / 填充长度
    pub max_input_length: usize,
    /// 长文本是否按句子分组翻译
    pub sentence_batching: bool,
    /// 分组的最大字符数
    pub sentence_group_length: usize,
    /// KV cache 位置维度上限，达到后清空 cache
    pub kv_cache_max_positions: usize,
    pub normalizer: NormalizerOptions,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_size: 64,
            beam_count: 3,
            max_sequence_length: 128,
            min_probability: 0.0,
            repetition_penalty: 0.0,
            thread_count: 4,
            max_input_length: 512,
            sentence_batching: false,
            sentence_group_length: 192,
            kv_cache_max_positions: 512,
            normalizer: NormalizerOptions::default(),
        }
    }
}

impl TranslatorConfig {
    /// 从 TOML 文本解析，缺省字段取默认值
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.beam_count == 0 {
            return Err(EngineError::Config("beam_count must be at least 1".into()));
        }
        if self.max_sequence_length == 0 {
            return Err(EngineError::Config(
                "max_sequence_length must be at least 1".into(),
            ));
        }
        if self.max_input_length == 0 {
            return Err(EngineError::Config("max_input_length must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.min_probability) {
            return Err(EngineError::Config(format!(
                "min_probability must be in [0, 1), got {}",
                self.min_probability
            )));
        }
        if self.repetition_penalty < 0.0 || !self.repetition_penalty.is_finite() {
            return Err(EngineError::Config(format!(
                "repetition_penalty must be a non-negative number, got {}",
                self.repetition_penalty
            )));
        }
        if self.thread_count == 0 {
            return Err(EngineError::Config("thread_count must be at least 1".into()));
        }
        Ok(())
    }

    /// 实际生效的缓存容量（关闭缓存时为 0）
    pub fn effective_cache_size(&self) -> usize {
        if self.cache_enabled {
            self.cache_size
        } else {
            0
        }
    }
}

#[async_trait]
pub trait ConfigManager: Send + Sync {
    /// 重新读取配置源
    async fn load(&self) -> EngineResult<TranslatorConfig>;
    /// 最近一次加载的配置
    async fn current(&self) -> EngineResult<TranslatorConfig>;
}

/// 从 TOML 文件读取配置；文件不存在时使用默认值
pub struct FileConfigManager {
    path: PathBuf,
    current: RwLock<TranslatorConfig>,
}

impl FileConfigManager {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(TranslatorConfig::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigManager for FileConfigManager {
    async fn load(&self) -> EngineResult<TranslatorConfig> {
        let config = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => TranslatorConfig::from_toml_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "config file not found, using defaults");
                TranslatorConfig::default()
            }
            Err(e) => {
                return Err(EngineError::Config(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        info!(
            path = %self.path.display(),
            beam_count = config.beam_count,
            cache_size = config.effective_cache_size(),
            "translator config loaded"
        );
        *self.current.write() = config.clone();
        Ok(config)
    }

    async fn current(&self) -> EngineResult<TranslatorConfig> {
        Ok(self.current.read().clone())
    }
}
