//! Beam 扩展与剪枝
//!
//! 每一步：对每个 beam 取原始 logits 最大的 K 个候选，得分累加 `ln(max(p, 1e-9))`，
//! 所有候选合并后按得分稳定降序排序，保留前 `beam_count` 个。

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::TokenId;

/// 每个 beam 的候选数
pub const TOP_K: usize = 8;

/// 概率下限，避免 ln(0)
pub const PROBABILITY_FLOOR: f32 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    pub sequence: Vec<TokenId>,
    pub score: f32,
}

impl Beam {
    pub fn seed(start_token: TokenId) -> Self {
        Self {
            sequence: vec![start_token],
            score: 0.0,
        }
    }

    pub fn last_token(&self) -> Option<TokenId> {
        self.sequence.last().copied()
    }

    pub fn is_ended(&self, eos_id: TokenId) -> bool {
        self.last_token() == Some(eos_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearchParams {
    pub beam_count: usize,
    /// 起始 token（Marian 用 pad）
    pub start_id: TokenId,
    pub eos_id: TokenId,
    pub top_k: usize,
    /// 低于该概率的候选被丢弃（每个 beam 至少保留最优候选）
    pub min_probability: f32,
    /// 每次重复出现扣减的得分
    pub repetition_penalty: f32,
}

impl BeamSearchParams {
    pub fn new(beam_count: usize, start_id: TokenId, eos_id: TokenId) -> Self {
        Self {
            beam_count,
            start_id,
            eos_id,
            top_k: TOP_K,
            min_probability: 0.0,
            repetition_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    origin: usize,
    token: TokenId,
    score: f32,
}

#[derive(Debug, Clone)]
pub struct BeamSearch {
    params: BeamSearchParams,
    beams: Vec<Beam>,
}

impl BeamSearch {
    /// 所有 beam 以起始 token 开头，得分为 0
    pub fn new(params: BeamSearchParams) -> EngineResult<Self> {
        if params.beam_count == 0 {
            return Err(EngineError::Config("beam_count must be at least 1".into()));
        }
        if params.top_k == 0 {
            return Err(EngineError::Config("top_k must be at least 1".into()));
        }
        let beams = vec![Beam::seed(params.start_id); params.beam_count];
        Ok(Self { params, beams })
    }

    pub fn params(&self) -> &BeamSearchParams {
        &self.params
    }

    pub fn beams(&self) -> &[Beam] {
        &self.beams
    }

    /// 得分最高的 beam，并列时取靠前的
    pub fn best(&self) -> &Beam {
        let mut best = &self.beams[0];
        for beam in &self.beams[1..] {
            if beam.score > best.score {
                best = beam;
            }
        }
        best
    }

    /// 所有 beam 都以 eos 结尾
    pub fn is_complete(&self) -> bool {
        self.beams.iter().all(|b| b.is_ended(self.params.eos_id))
    }

    /// 解码器输入：每个 beam 的最后一个 token，`[beams, 1]`
    pub fn last_tokens(&self) -> Array2<TokenId> {
        Array2::from_shape_fn((self.beams.len(), 1), |(i, _)| {
            self.beams[i].last_token().unwrap_or(self.params.start_id)
        })
    }

    /// 用一步的 logits 扩展并剪枝
    ///
    /// # Returns
    /// 每个新 beam 来自哪个旧 beam，用于重排 KV cache
    pub fn step(&mut self, logits: ArrayView2<'_, f32>) -> EngineResult<Vec<usize>> {
        let (rows, vocab) = logits.dim();
        if rows != self.beams.len() {
            return Err(EngineError::inference(format!(
                "logits have {rows} rows for {} beams",
                self.beams.len()
            )));
        }
        if vocab == 0 {
            return Err(EngineError::inference("logits have an empty vocabulary axis"));
        }

        let mut candidates = Vec::with_capacity(rows * self.params.top_k);
        for (origin, beam) in self.beams.iter().enumerate() {
            self.expand(origin, beam, logits.row(origin), &mut candidates);
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        let selected = self.select(&candidates);

        let origins = selected.iter().map(|c| c.origin).collect();
        self.beams = selected
            .into_iter()
            .map(|c| {
                let mut sequence = self.beams[c.origin].sequence.clone();
                sequence.push(c.token);
                Beam {
                    sequence,
                    score: c.score,
                }
            })
            .collect();
        Ok(origins)
    }

    fn expand(
        &self,
        origin: usize,
        beam: &Beam,
        row: ArrayView1<'_, f32>,
        candidates: &mut Vec<Candidate>,
    ) {
        let probabilities = softmax(row);

        let mut ranked: Vec<usize> = (0..row.len()).collect();
        ranked.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
        ranked.truncate(self.params.top_k);

        for (rank, &index) in ranked.iter().enumerate() {
            let probability = probabilities[index];
            if rank > 0 && probability < self.params.min_probability {
                continue;
            }
            let token = index as TokenId;
            let mut score = beam.score + probability.max(PROBABILITY_FLOOR).ln();
            if self.params.repetition_penalty > 0.0 {
                let repeats = beam.sequence.iter().skip(1).filter(|&&t| t == token).count();
                score -= self.params.repetition_penalty * repeats as f32;
            }
            candidates.push(Candidate {
                origin,
                token,
                score,
            });
        }
    }

    /// 取前 `beam_count` 个序列不重复的候选；不够时按顺序用重复的补齐，
    /// 保证 beam 数不变
    fn select(&self, sorted: &[Candidate]) -> Vec<Candidate> {
        let wanted = self.params.beam_count;
        let mut picked: Vec<usize> = Vec::with_capacity(wanted);

        for (i, candidate) in sorted.iter().enumerate() {
            if picked.len() == wanted {
                break;
            }
            let duplicate = picked.iter().any(|&p| {
                let other = &sorted[p];
                other.token == candidate.token
                    && self.beams[other.origin].sequence == self.beams[candidate.origin].sequence
            });
            if !duplicate {
                picked.push(i);
            }
        }
        for i in 0..sorted.len() {
            if picked.len() == wanted {
                break;
            }
            if !picked.contains(&i) {
                picked.push(i);
            }
        }

        // 补齐的候选可能比已选的得分高，恢复降序
        picked.sort_unstable();
        picked.into_iter().map(|i| sorted[i].clone()).collect()
    }
}

/// 数值稳定的 softmax
pub fn softmax(row: ArrayView1<'_, f32>) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
