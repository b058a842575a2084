//! ONNX Runtime 后端
//!
//! 加载 Optimum 导出的 Marian encoder 与 merged decoder（带 `use_cache_branch` 输入）。
//! 第一步不走 cache 分支，所有 `past_key_values.*` 用全零占位；之后使用上一步重排后的 cache。

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayD, ArrayView2, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::{DynValue, Tensor};
use serde::Deserialize;
use tracing::{debug, info};

use super::kv_cache::{KvCache, PAST_PREFIX, PRESENT_PREFIX};
use super::metadata::InferenceFiles;
use super::runtime::{BeamEncoderInput, DecoderStepOutput, EncoderOutput, ModelRuntime};
use crate::error::{EngineError, EngineResult};
use crate::types::{EncodedInput, TokenId};

/// 模型 config.json 中决定 KV 形状的字段（缺省为 Marian base）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DecoderGeometry {
    #[serde(default = "default_layers")]
    pub decoder_layers: usize,
    #[serde(default = "default_heads")]
    pub decoder_attention_heads: usize,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
}

fn default_layers() -> usize {
    6
}

fn default_heads() -> usize {
    8
}

fn default_d_model() -> usize {
    512
}

impl Default for DecoderGeometry {
    fn default() -> Self {
        Self {
            decoder_layers: default_layers(),
            decoder_attention_heads: default_heads(),
            d_model: default_d_model(),
        }
    }
}

impl DecoderGeometry {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
        serde_json::from_str(&data).map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.decoder_attention_heads.max(1)
    }

    /// 每层 4 个 KV 张量的名字后缀：decoder.key, decoder.value, encoder.key, encoder.value
    fn kv_names(&self) -> Vec<(usize, &'static str)> {
        let mut names = Vec::with_capacity(self.decoder_layers * 4);
        for layer in 0..self.decoder_layers {
            for suffix in ["decoder.key", "decoder.value", "encoder.key", "encoder.value"] {
                names.push((layer, suffix));
            }
        }
        names
    }
}

struct LoadedSessions {
    encoder: Session,
    decoder: Session,
    geometry: DecoderGeometry,
}

pub struct OnnxRuntime {
    thread_count: usize,
    sessions: Option<LoadedSessions>,
}

impl OnnxRuntime {
    pub fn new(thread_count: usize) -> Self {
        Self {
            thread_count: thread_count.max(1),
            sessions: None,
        }
    }

    fn build_session(&self, path: &Path) -> Result<Session> {
        Session::builder()
            .map_err(|e| anyhow!("failed to create session builder: {e}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("failed to set optimization level: {e}"))?
            .with_intra_threads(self.thread_count)
            .map_err(|e| anyhow!("failed to set intra threads: {e}"))?
            .commit_from_file(path)
            .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
    }

    fn load_sessions(&self, files: &InferenceFiles) -> Result<LoadedSessions> {
        let geometry = match &files.model_config {
            Some(path) => DecoderGeometry::from_file(path)?,
            None => DecoderGeometry::default(),
        };
        let encoder = self.build_session(&files.encoder)?;
        let decoder = self.build_session(&files.decoder)?;
        Ok(LoadedSessions {
            encoder,
            decoder,
            geometry,
        })
    }

    fn sessions(&mut self) -> EngineResult<&mut LoadedSessions> {
        self.sessions
            .as_mut()
            .ok_or_else(|| EngineError::inference("no model loaded"))
    }
}

fn to_array(value: &DynValue, name: &str) -> Result<ArrayD<f32>> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| anyhow!("failed to extract {name}: {e}"))?;
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())
        .map_err(|e| anyhow!("unexpected shape for {name}: {e}"))
}

fn f32_input(array: &ArrayD<f32>) -> Result<SessionInputValue<'static>> {
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = array.iter().copied().collect();
    let tensor = Tensor::from_array((shape, data)).map_err(|e| anyhow!("tensor: {e}"))?;
    Ok(tensor.into())
}

fn encode_inner(sessions: &mut LoadedSessions, input: &EncodedInput) -> Result<EncoderOutput> {
    let shape = vec![1i64, input.ids.len() as i64];
    let ids = Tensor::from_array((shape.clone(), input.ids.clone()))
        .map_err(|e| anyhow!("input_ids tensor: {e}"))?;
    let mask = Tensor::from_array((shape, input.attention_mask.clone()))
        .map_err(|e| anyhow!("attention_mask tensor: {e}"))?;

    let outputs = sessions
        .encoder
        .run(ort::inputs!["input_ids" => ids, "attention_mask" => mask])
        .map_err(|e| anyhow!("encoder run failed: {e}"))?;
    let value = outputs
        .get("last_hidden_state")
        .ok_or_else(|| anyhow!("encoder output last_hidden_state missing"))?;
    let hidden = to_array(value, "last_hidden_state")?;

    let shape = hidden.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 {
        return Err(anyhow!("unexpected encoder output shape {shape:?}"));
    }
    let states = Array2::from_shape_fn((shape[1], shape[2]), |(i, j)| hidden[[0, i, j]]);
    EncoderOutput::new(states, input.attention_mask.clone()).map_err(|e| anyhow!("{e}"))
}

fn decode_inner(
    sessions: &mut LoadedSessions,
    input_ids: ArrayView2<'_, TokenId>,
    encoder: &BeamEncoderInput,
    cache: &KvCache,
) -> Result<Option<DecoderStepOutput>> {
    let geometry = sessions.geometry;
    let (beams, enc_len, hidden) = encoder.hidden_states.dim();
    let use_cache = !cache.is_empty();

    let mut inputs: Vec<(Cow<'static, str>, SessionInputValue<'static>)> = Vec::new();

    let ids: Vec<i64> = input_ids.iter().copied().collect();
    let ids = Tensor::from_array((vec![beams as i64, input_ids.ncols() as i64], ids))
        .map_err(|e| anyhow!("input_ids tensor: {e}"))?;
    inputs.push(("input_ids".into(), ids.into()));

    let mask: Vec<i64> = encoder.attention_mask.iter().copied().collect();
    let mask = Tensor::from_array((vec![beams as i64, enc_len as i64], mask))
        .map_err(|e| anyhow!("encoder_attention_mask tensor: {e}"))?;
    inputs.push(("encoder_attention_mask".into(), mask.into()));

    let states: Vec<f32> = encoder.hidden_states.iter().copied().collect();
    let states = Tensor::from_array((vec![beams as i64, enc_len as i64, hidden as i64], states))
        .map_err(|e| anyhow!("encoder_hidden_states tensor: {e}"))?;
    inputs.push(("encoder_hidden_states".into(), states.into()));

    let heads = geometry.decoder_attention_heads;
    let head_dim = geometry.head_dim();
    for (layer, suffix) in geometry.kv_names() {
        let name = format!("{PAST_PREFIX}.{layer}.{suffix}");
        let value = if use_cache {
            let entry = cache
                .get(&name)
                .ok_or_else(|| anyhow!("kv cache entry {name} missing"))?;
            f32_input(&entry.tensor)?
        } else {
            // 第一步的占位：decoder 历史长度 1，encoder 长度与输入一致
            let positions = if suffix.starts_with("decoder") { 1 } else { enc_len };
            f32_input(&ArrayD::zeros(IxDyn(&[beams, heads, positions, head_dim])))?
        };
        inputs.push((name.into(), value));
    }

    let use_cache_branch = Tensor::from_array((vec![1i64], vec![use_cache]))
        .map_err(|e| anyhow!("use_cache_branch tensor: {e}"))?;
    inputs.push(("use_cache_branch".into(), use_cache_branch.into()));

    let outputs = sessions
        .decoder
        .run(inputs)
        .map_err(|e| anyhow!("decoder run failed: {e}"))?;

    let Some(logits_value) = outputs.get("logits") else {
        return Ok(None);
    };
    let logits = to_array(logits_value, "logits")?;
    let shape = logits.shape().to_vec();
    if shape.len() != 3 || shape[0] != beams || shape[1] == 0 || shape[2] == 0 {
        debug!(?shape, "decoder returned unusable logits");
        return Ok(None);
    }
    let last = shape[1] - 1;
    let logits = Array2::from_shape_fn((shape[0], shape[2]), |(b, v)| logits[[b, last, v]]);

    let mut present = Vec::with_capacity(geometry.decoder_layers * 4);
    for (layer, suffix) in geometry.kv_names() {
        let name = format!("{PRESENT_PREFIX}.{layer}.{suffix}");
        if let Some(value) = outputs.get(name.as_str()) {
            present.push((name.clone(), to_array(value, &name)?));
        }
    }

    Ok(Some(DecoderStepOutput { logits, present }))
}

impl ModelRuntime for OnnxRuntime {
    fn load(&mut self, files: &InferenceFiles) -> EngineResult<()> {
        let loaded = self
            .load_sessions(files)
            .map_err(|e| EngineError::load(e.to_string()))?;
        info!(
            encoder = %files.encoder.display(),
            decoder = %files.decoder.display(),
            layers = loaded.geometry.decoder_layers,
            threads = self.thread_count,
            "onnx sessions loaded"
        );
        // 先释放旧会话再安装新会话
        self.sessions.take();
        self.sessions = Some(loaded);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.sessions.is_some()
    }

    fn encode(&mut self, input: &EncodedInput) -> EngineResult<EncoderOutput> {
        let sessions = self.sessions()?;
        encode_inner(sessions, input).map_err(|e| EngineError::inference(e.to_string()))
    }

    fn decode_step(
        &mut self,
        input_ids: ArrayView2<'_, TokenId>,
        encoder: &BeamEncoderInput,
        cache: &KvCache,
    ) -> EngineResult<Option<DecoderStepOutput>> {
        let sessions = self.sessions()?;
        decode_inner(sessions, input_ids, encoder, cache)
            .map_err(|e| EngineError::inference(e.to_string()))
    }

    fn close(&mut self) {
        if self.sessions.take().is_some() {
            info!("onnx sessions released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_defaults_and_overrides() {
        let geometry: DecoderGeometry =
            serde_json::from_str(r#"{"decoder_layers": 3, "d_model": 256}"#).unwrap();
        assert_eq!(geometry.decoder_layers, 3);
        assert_eq!(geometry.decoder_attention_heads, 8);
        assert_eq!(geometry.head_dim(), 32);
        assert_eq!(geometry.kv_names().len(), 12);
    }

    #[test]
    fn test_unloaded_runtime_rejects_encode() {
        let mut runtime = OnnxRuntime::new(1);
        let input = EncodedInput {
            ids: vec![1],
            attention_mask: vec![1],
        };
        assert!(runtime.encode(&input).unwrap_err().is_inference());
        runtime.close();
        runtime.close();
        assert!(!runtime.is_loaded());
    }
}
