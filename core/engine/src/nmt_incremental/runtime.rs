use ndarray::{Array2, Array3, ArrayD, ArrayView2};

use super::kv_cache::KvCache;
use super::metadata::InferenceFiles;
use crate::error::{EngineError, EngineResult};
use crate::types::{EncodedInput, TokenId};

/// 编码器输出：`[seq_len, hidden]` 隐状态以及计算它时使用的 attention mask
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOutput {
    pub hidden_states: Array2<f32>,
    pub attention_mask: Vec<i64>,
}

impl EncoderOutput {
    pub fn new(hidden_states: Array2<f32>, attention_mask: Vec<i64>) -> EngineResult<Self> {
        if hidden_states.nrows() != attention_mask.len() {
            return Err(EngineError::inference(format!(
                "encoder produced {} positions for a mask of length {}",
                hidden_states.nrows(),
                attention_mask.len()
            )));
        }
        Ok(Self {
            hidden_states,
            attention_mask,
        })
    }

    pub fn sequence_length(&self) -> usize {
        self.hidden_states.nrows()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_states.ncols()
    }

    /// 复制成每个 beam 一份
    pub fn replicate(&self, beams: usize) -> BeamEncoderInput {
        let (seq_len, hidden) = self.hidden_states.dim();
        let states = &self.hidden_states;
        let mask = &self.attention_mask;
        BeamEncoderInput {
            hidden_states: Array3::from_shape_fn((beams, seq_len, hidden), |(_, i, j)| {
                states[[i, j]]
            }),
            attention_mask: Array2::from_shape_fn((beams, seq_len), |(_, i)| mask[i]),
        }
    }
}

/// 按 beam 复制后的编码器输出，作为每一步解码的输入
#[derive(Debug, Clone, PartialEq)]
pub struct BeamEncoderInput {
    /// `[beams, seq_len, hidden]`
    pub hidden_states: Array3<f32>,
    /// `[beams, seq_len]`
    pub attention_mask: Array2<i64>,
}

impl BeamEncoderInput {
    pub fn beams(&self) -> usize {
        self.hidden_states.dim().0
    }
}

/// 一步解码的结果
#[derive(Debug, Clone)]
pub struct DecoderStepOutput {
    /// 每个 beam 下一个 token 的 logits，`[beams, vocab]`
    pub logits: Array2<f32>,
    /// 运行时原样返回的 `present.*` 张量
    pub present: Vec<(String, ArrayD<f32>)>,
}

/// 编码器 / 解码器推理后端
///
/// 实现不要求可重入，协调器保证同一时刻只有一个调用者。
pub trait ModelRuntime: Send {
    /// 替换已加载的模型；失败时保留原状态
    fn load(&mut self, files: &InferenceFiles) -> EngineResult<()>;

    fn is_loaded(&self) -> bool;

    fn encode(&mut self, input: &EncodedInput) -> EngineResult<EncoderOutput>;

    /// 执行一步解码
    ///
    /// # Arguments
    /// * `input_ids` - 每个 beam 的最后一个 token，`[beams, 1]`
    /// * `encoder` - 按 beam 复制的编码器输出
    /// * `cache` - 为空表示第一步（不走 cache 分支）
    ///
    /// # Returns
    /// `Ok(None)` 表示这一步没有可用的 logits
    fn decode_step(
        &mut self,
        input_ids: ArrayView2<'_, TokenId>,
        encoder: &BeamEncoderInput,
        cache: &KvCache,
    ) -> EngineResult<Option<DecoderStepOutput>>;

    /// 释放模型，可重复调用
    fn close(&mut self);
}

impl<R: ModelRuntime + ?Sized> ModelRuntime for Box<R> {
    fn load(&mut self, files: &InferenceFiles) -> EngineResult<()> {
        (**self).load(files)
    }

    fn is_loaded(&self) -> bool {
        (**self).is_loaded()
    }

    fn encode(&mut self, input: &EncodedInput) -> EngineResult<EncoderOutput> {
        (**self).encode(input)
    }

    fn decode_step(
        &mut self,
        input_ids: ArrayView2<'_, TokenId>,
        encoder: &BeamEncoderInput,
        cache: &KvCache,
    ) -> EngineResult<Option<DecoderStepOutput>> {
        (**self).decode_step(input_ids, encoder, cache)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_replicate_copies_rows_per_beam() {
        let output = EncoderOutput::new(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]), vec![1, 1, 0])
            .unwrap();
        let replicated = output.replicate(2);
        assert_eq!(replicated.beams(), 2);
        assert_eq!(replicated.hidden_states.dim(), (2, 3, 2));
        assert_eq!(replicated.hidden_states[[1, 2, 1]], 6.0);
        assert_eq!(replicated.attention_mask, arr2(&[[1, 1, 0], [1, 1, 0]]));
    }

    #[test]
    fn test_encoder_output_checks_mask_length() {
        assert!(EncoderOutput::new(arr2(&[[1.0]]), vec![1, 1]).is_err());
    }
}
