//! Beam search 解码循环
//!
//! 状态机：Initializing -> Stepping -> Complete。
//! 每次 `advance()` 执行一步解码并返回当前最优 beam，阻塞翻译与流式翻译共用这一实现。

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::beam_search::{Beam, BeamSearch, BeamSearchParams};
use super::kv_cache::KvCache;
use super::runtime::{BeamEncoderInput, DecoderStepOutput, EncoderOutput, ModelRuntime};
use crate::config_manager::TranslatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Initializing,
    Stepping,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderParams {
    pub search: BeamSearchParams,
    pub max_sequence_length: usize,
    pub kv_cache_max_positions: usize,
}

impl DecoderParams {
    /// 从引擎配置构造，起始 token 为 pad
    pub fn from_config(config: &TranslatorConfig, pad_id: TokenId, eos_id: TokenId) -> Self {
        let mut search = BeamSearchParams::new(config.beam_count, pad_id, eos_id);
        search.min_probability = config.min_probability;
        search.repetition_penalty = config.repetition_penalty;
        Self {
            search,
            max_sequence_length: config.max_sequence_length,
            kv_cache_max_positions: config.kv_cache_max_positions,
        }
    }
}

/// 一步解码后的进度
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    /// 已完成的步数（从 1 开始）
    pub step: usize,
    pub best: Beam,
    /// 这一步之后是否已经结束
    pub complete: bool,
}

pub struct BeamSearchDecoder<'r, R: ModelRuntime + ?Sized> {
    runtime: &'r mut R,
    encoder_output: Option<EncoderOutput>,
    encoder: Option<BeamEncoderInput>,
    search: BeamSearch,
    cache: KvCache,
    max_steps: usize,
    steps: usize,
    state: DecoderState,
    cancel: CancellationToken,
}

impl<'r, R: ModelRuntime + ?Sized> BeamSearchDecoder<'r, R> {
    pub fn new(
        runtime: &'r mut R,
        encoder_output: EncoderOutput,
        params: DecoderParams,
        cancel: CancellationToken,
    ) -> EngineResult<Self> {
        if params.max_sequence_length == 0 {
            return Err(EngineError::Config(
                "max_sequence_length must be at least 1".into(),
            ));
        }
        Ok(Self {
            runtime,
            encoder_output: Some(encoder_output),
            encoder: None,
            search: BeamSearch::new(params.search)?,
            cache: KvCache::new(params.kv_cache_max_positions),
            max_steps: params.max_sequence_length,
            steps: 0,
            state: DecoderState::Initializing,
            cancel,
        })
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn beams(&self) -> &[Beam] {
        self.search.beams()
    }

    pub fn best(&self) -> &Beam {
        self.search.best()
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// 执行一步
    ///
    /// # Returns
    /// - `Ok(Some(update))`：完成了一步，`update.best` 为当前最优 beam
    /// - `Ok(None)`：已经结束（包括运行时没有给出可用 logits 的提前结束）
    /// - `Err(EngineError::Cancelled)`：在这一步开始前收到取消
    pub fn advance(&mut self) -> EngineResult<Option<StepUpdate>> {
        match self.state {
            DecoderState::Complete => return Ok(None),
            DecoderState::Initializing => {
                if let Some(output) = self.encoder_output.take() {
                    self.encoder = Some(output.replicate(self.search.params().beam_count));
                }
                self.state = DecoderState::Stepping;
            }
            DecoderState::Stepping => {}
        }

        if self.steps >= self.max_steps || self.search.is_complete() {
            self.state = DecoderState::Complete;
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.state = DecoderState::Complete;
            return Err(EngineError::Cancelled);
        }
        let Some(encoder) = self.encoder.as_ref() else {
            self.state = DecoderState::Complete;
            return Err(EngineError::inference("decoder has no encoder output"));
        };

        let started = Instant::now();
        let input_ids = self.search.last_tokens();
        let output = match self.runtime.decode_step(input_ids.view(), encoder, &self.cache) {
            Ok(output) => output,
            Err(e) => {
                self.state = DecoderState::Complete;
                return Err(e);
            }
        };

        let usable = output.filter(|o| {
            o.logits.nrows() == self.search.beams().len()
                && o.logits.ncols() > 0
                && o.logits.iter().all(|v| v.is_finite())
        });
        let Some(output) = usable else {
            warn!(
                step = self.steps + 1,
                "decode step produced no usable logits, returning best beam so far"
            );
            self.state = DecoderState::Complete;
            return Ok(None);
        };

        if let Err(e) = self.apply(output) {
            self.state = DecoderState::Complete;
            return Err(e);
        }
        self.steps += 1;

        if self.search.is_complete() || self.steps >= self.max_steps {
            self.state = DecoderState::Complete;
        }

        let best = self.search.best().clone();
        debug!(
            step = self.steps,
            best_score = best.score,
            cache_entries = self.cache.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "decode step"
        );

        Ok(Some(StepUpdate {
            step: self.steps,
            best,
            complete: self.state == DecoderState::Complete,
        }))
    }

    /// 用一步的 logits 扩展 beam，并按新 beam 的来源重排 KV cache
    fn apply(&mut self, output: DecoderStepOutput) -> EngineResult<()> {
        let origins = self.search.step(output.logits.view())?;
        if self.cache.absorb(output.present) {
            self.cache.reindex(&origins)?;
        }
        Ok(())
    }

    /// 一直解码到结束，返回最优 beam
    pub fn run(mut self) -> EngineResult<Beam> {
        while self.advance()?.is_some() {}
        Ok(self.search.best().clone())
    }
}
