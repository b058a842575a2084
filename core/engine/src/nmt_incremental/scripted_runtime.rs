//! 确定性的进程内运行时
//!
//! 不依赖任何模型文件：解码器把每个 beam 的 token 历史存放在 KV cache 中
//! （`present.0.decoder.key`，每行一个 beam），再用调用方提供的函数从历史算出 logits。
//! 如果 cache 没有按 beam 来源正确重排，这里读到的历史就会错位，输出随之改变。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::{Array2, ArrayD, ArrayView2, IxDyn};
use parking_lot::Mutex;
use tracing::debug;

use super::kv_cache::KvCache;
use super::metadata::InferenceFiles;
use super::runtime::{BeamEncoderInput, DecoderStepOutput, EncoderOutput, ModelRuntime};
use crate::error::{EngineError, EngineResult};
use crate::types::{EncodedInput, TokenId};

pub const HISTORY_OUTPUT: &str = "present.0.decoder.key";
pub const HISTORY_INPUT: &str = "past_key_values.0.decoder.key";
pub const CROSS_OUTPUT: &str = "present.0.encoder.key";

type LogitsFn = dyn Fn(&[TokenId]) -> Option<Vec<f32>> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent {
    Load,
    Encode,
    DecodeStep,
    Close,
}

/// 调用统计，可在运行时被移交给协调器后继续观察
#[derive(Debug, Default)]
pub struct RuntimeStats {
    encode_calls: AtomicUsize,
    decode_calls: AtomicUsize,
    events: Mutex<Vec<RuntimeEvent>>,
    histories: Mutex<Vec<Vec<Vec<TokenId>>>>,
}

impl RuntimeStats {
    pub fn encode_calls(&self) -> usize {
        self.encode_calls.load(Ordering::SeqCst)
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().clone()
    }

    /// 每一步各 beam 从 cache 读到的历史（含本步输入 token）
    pub fn histories(&self) -> Vec<Vec<Vec<TokenId>>> {
        self.histories.lock().clone()
    }

    fn push(&self, event: RuntimeEvent) {
        self.events.lock().push(event);
    }
}

pub struct ScriptedRuntime {
    logits_fn: Arc<LogitsFn>,
    hidden_size: usize,
    step_delay: Option<Duration>,
    fail_load: bool,
    loaded: bool,
    stats: Arc<RuntimeStats>,
}

impl ScriptedRuntime {
    /// `logits_fn` 接收某个 beam 的完整历史（起始 token 到本步输入），
    /// 返回下一个 token 的 logits；返回 `None` 表示这一步没有可用输出。
    pub fn new<F>(logits_fn: F) -> Self
    where
        F: Fn(&[TokenId]) -> Option<Vec<f32>> + Send + Sync + 'static,
    {
        Self {
            logits_fn: Arc::new(logits_fn),
            hidden_size: 4,
            step_delay: None,
            fail_load: false,
            loaded: false,
            stats: Arc::new(RuntimeStats::default()),
        }
    }

    /// 依次强烈偏向 `script` 中的 token，用完后输出 eos
    pub fn follow_script(vocab_size: usize, script: Vec<TokenId>, eos_id: TokenId) -> Self {
        Self::new(move |history| {
            let position = history.len() - 1;
            let next = script.get(position).copied().unwrap_or(eos_id);
            let mut logits = vec![0.0; vocab_size];
            if let Some(slot) = usize::try_from(next).ok().and_then(|i| logits.get_mut(i)) {
                *slot = 10.0;
            }
            Some(logits)
        })
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    /// 让 `load` 总是失败
    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// 无需文件，直接视为已加载
    pub fn preloaded(mut self) -> Self {
        self.loaded = true;
        self
    }

    pub fn stats(&self) -> Arc<RuntimeStats> {
        Arc::clone(&self.stats)
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn load(&mut self, files: &InferenceFiles) -> EngineResult<()> {
        self.stats.push(RuntimeEvent::Load);
        if self.fail_load {
            return Err(EngineError::load("scripted runtime configured to fail"));
        }
        for path in [&files.encoder, &files.decoder] {
            if !path.is_file() {
                return Err(EngineError::load(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
        }
        self.loaded = true;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn encode(&mut self, input: &EncodedInput) -> EngineResult<EncoderOutput> {
        if !self.loaded {
            return Err(EngineError::inference("no model loaded"));
        }
        self.stats.push(RuntimeEvent::Encode);
        self.stats.encode_calls.fetch_add(1, Ordering::SeqCst);

        let ids = &input.ids;
        let hidden = Array2::from_shape_fn((ids.len(), self.hidden_size), |(i, _)| ids[i] as f32);
        EncoderOutput::new(hidden, input.attention_mask.clone())
    }

    fn decode_step(
        &mut self,
        input_ids: ArrayView2<'_, TokenId>,
        encoder: &BeamEncoderInput,
        cache: &KvCache,
    ) -> EngineResult<Option<DecoderStepOutput>> {
        if !self.loaded {
            return Err(EngineError::inference("no model loaded"));
        }
        self.stats.push(RuntimeEvent::DecodeStep);
        self.stats.decode_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.step_delay {
            std::thread::sleep(delay);
        }

        let beams = input_ids.nrows();
        let past = cache.get(HISTORY_INPUT);
        let mut histories = Vec::with_capacity(beams);
        for beam in 0..beams {
            let mut history: Vec<TokenId> = match past {
                Some(entry) => entry
                    .tensor
                    .index_axis(ndarray::Axis(0), beam)
                    .iter()
                    .map(|&v| v as TokenId)
                    .collect(),
                None => Vec::new(),
            };
            history.push(input_ids[[beam, 0]]);
            histories.push(history);
        }
        self.stats.histories.lock().push(histories.clone());

        let mut rows = Vec::with_capacity(beams);
        for history in &histories {
            match (self.logits_fn)(history) {
                Some(row) => rows.push(row),
                None => {
                    debug!(step = history.len(), "scripted runtime produced no logits");
                    return Ok(None);
                }
            }
        }
        let vocab = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != vocab) {
            return Err(EngineError::inference("logits rows differ in length"));
        }
        let logits = Array2::from_shape_vec((beams, vocab), rows.concat())
            .map_err(|e| EngineError::inference(e.to_string()))?;

        let positions = histories.first().map(Vec::len).unwrap_or(0);
        let history_tensor =
            ArrayD::from_shape_fn(IxDyn(&[beams, positions]), |ix| histories[ix[0]][ix[1]] as f32);

        // cross-attention 只在第一步产出，之后首维为 0
        let cross = if cache.is_empty() {
            let seq_len = encoder.hidden_states.dim().1;
            ArrayD::from_shape_fn(IxDyn(&[beams, seq_len]), |ix| {
                encoder.hidden_states[[ix[0], ix[1], 0]]
            })
        } else {
            ArrayD::zeros(IxDyn(&[0, 0]))
        };

        Ok(Some(DecoderStepOutput {
            logits,
            present: vec![
                (HISTORY_OUTPUT.to_string(), history_tensor),
                (CROSS_OUTPUT.to_string(), cross),
            ],
        }))
    }

    fn close(&mut self) {
        if self.loaded {
            self.stats.push(RuntimeEvent::Close);
        }
        self.loaded = false;
    }
}
