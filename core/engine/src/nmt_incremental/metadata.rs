//! 模型目录描述文件（metadata.json）
//!
//! 目录由外部导入流程生成，这里只负责读取、校验并把相对路径解析成绝对路径。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::language_pair::LanguagePair;
use crate::error::{EngineError, EngineResult};

pub const METADATA_FILE_NAME: &str = "metadata.json";

/// 支持的模型结构标签
pub const MARIAN_ARCHITECTURE: &str = "MarianMTModel";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub base_model: String,
    pub source_language: String,
    pub target_language: String,
    pub architectures: Vec<String>,
    #[serde(default)]
    pub version: Option<u32>,
    pub files: MetadataFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataFiles {
    pub tokenizer: TokenizerFileNames,
    pub inference: InferenceFileNames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerFileNames {
    #[serde(default)]
    pub config: Option<String>,
    pub source_vocabulary: String,
    #[serde(default)]
    pub target_vocabulary: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceFileNames {
    pub encoder: String,
    pub decoder: String,
    #[serde(default)]
    pub config: Option<String>,
}

/// 分词器需要的文件（已解析为绝对路径）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerFiles {
    pub config: Option<PathBuf>,
    pub source_vocabulary: PathBuf,
    pub target_vocabulary: Option<PathBuf>,
    pub source_model: Option<PathBuf>,
    pub target_model: Option<PathBuf>,
}

/// 推理运行时需要的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceFiles {
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    /// 模型 config.json（层数、头数等）
    pub model_config: Option<PathBuf>,
}

/// 一个语言对模型的全部文件
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub directory: PathBuf,
    pub metadata: ModelMetadata,
    pub tokenizer: TokenizerFiles,
    pub inference: InferenceFiles,
}

impl ModelFiles {
    /// 从模型目录加载并校验 metadata.json
    ///
    /// # Arguments
    /// * `model_dir` - 模型目录路径（如 `models/nmt/marian-en-de/`）
    ///
    /// # Returns
    /// 所有引用文件都存在时返回解析后的路径集合
    pub fn from_dir(model_dir: &Path) -> EngineResult<Self> {
        let metadata_path = model_dir.join(METADATA_FILE_NAME);
        let data = fs::read_to_string(&metadata_path).map_err(|e| {
            EngineError::load(format!("failed to read {}: {e}", metadata_path.display()))
        })?;
        let metadata: ModelMetadata = serde_json::from_str(&data).map_err(|e| {
            EngineError::load(format!("malformed {}: {e}", metadata_path.display()))
        })?;
        Self::from_metadata(model_dir, metadata)
    }

    pub fn from_metadata(model_dir: &Path, metadata: ModelMetadata) -> EngineResult<Self> {
        metadata.validate()?;

        let names = &metadata.files;
        let required = |name: &str| resolve(model_dir, name);
        let optional = |name: &Option<String>| name.as_deref().map(|n| resolve(model_dir, n)).transpose();

        let tokenizer = TokenizerFiles {
            config: optional(&names.tokenizer.config)?,
            source_vocabulary: required(&names.tokenizer.source_vocabulary)?,
            target_vocabulary: optional(&names.tokenizer.target_vocabulary)?,
            source_model: optional(&names.tokenizer.source)?,
            target_model: optional(&names.tokenizer.target)?,
        };
        let inference = InferenceFiles {
            encoder: required(&names.inference.encoder)?,
            decoder: required(&names.inference.decoder)?,
            model_config: optional(&names.inference.config)?,
        };

        debug!(
            dir = %model_dir.display(),
            base_model = %metadata.base_model,
            "model files resolved"
        );

        Ok(Self {
            directory: model_dir.to_path_buf(),
            metadata,
            tokenizer,
            inference,
        })
    }

    pub fn language_pair(&self) -> EngineResult<LanguagePair> {
        self.metadata.language_pair()
    }
}

impl ModelMetadata {
    pub fn validate(&self) -> EngineResult<()> {
        if self.base_model.trim().is_empty() {
            return Err(EngineError::load("metadata has an empty base_model"));
        }
        if self.architectures.is_empty() {
            return Err(EngineError::load("metadata lists no architectures"));
        }
        if !self.architectures.iter().any(|a| a == MARIAN_ARCHITECTURE) {
            return Err(EngineError::load(format!(
                "unsupported architectures {:?}, expected {MARIAN_ARCHITECTURE}",
                self.architectures
            )));
        }
        self.language_pair()
            .map_err(|e| EngineError::load(format!("metadata language pair: {e}")))?;
        Ok(())
    }

    pub fn language_pair(&self) -> EngineResult<LanguagePair> {
        LanguagePair::from_codes(&self.source_language, &self.target_language)
    }
}

fn resolve(model_dir: &Path, name: &str) -> EngineResult<PathBuf> {
    if name.trim().is_empty() {
        return Err(EngineError::load("metadata references an empty file name"));
    }
    let path = model_dir.join(name);
    if !path.is_file() {
        return Err(EngineError::load(format!(
            "model file not found: {}",
            path.display()
        )));
    }
    Ok(path)
}
