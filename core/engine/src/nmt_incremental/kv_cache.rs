//! Decoder 的 KV cache
//!
//! 每个条目是一个以 beam 为首维的张量。每步解码后运行时返回 `present.*`，
//! 这里把它们改名为下一步的 `past_key_values.*` 输入，并按 beam 的来源重新排列行。

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

pub const PRESENT_PREFIX: &str = "present";
pub const PAST_PREFIX: &str = "past_key_values";

/// 单个缓存张量
///
/// 四维张量的布局是 `[beam, head, position, head_dim]`；
/// 其他维度数的张量把最后一维当作位置维。
#[derive(Debug, Clone, PartialEq)]
pub struct KvCacheEntry {
    pub tensor: ArrayD<f32>,
}

impl KvCacheEntry {
    pub fn new(tensor: ArrayD<f32>) -> Self {
        Self { tensor }
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub fn beams(&self) -> usize {
        self.tensor.shape().first().copied().unwrap_or(0)
    }

    pub fn positions(&self) -> usize {
        let shape = self.tensor.shape();
        match shape.len() {
            0 => 0,
            4 => shape[2],
            n => shape[n - 1],
        }
    }
}

/// 输出名 `present.0.decoder.key` -> 输入名 `past_key_values.0.decoder.key`
pub fn past_name(output_name: &str) -> String {
    match output_name.strip_prefix(PRESENT_PREFIX) {
        Some(rest) => format!("{PAST_PREFIX}{rest}"),
        None => output_name.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct KvCache {
    entries: BTreeMap<String, KvCacheEntry>,
    /// 位置维达到该值时整体清空；0 表示不限制
    max_positions: usize,
}

impl KvCache {
    pub fn new(max_positions: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_positions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&KvCacheEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KvCacheEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 吸收一步解码的 `present.*` 输出
    ///
    /// 首维为 0 的输出（cache 分支上的 cross-attention）不覆盖已有条目。
    /// 返回 `false` 表示位置数超过上限，cache 已被清空。
    pub fn absorb<I>(&mut self, outputs: I) -> bool
    where
        I: IntoIterator<Item = (String, ArrayD<f32>)>,
    {
        for (name, tensor) in outputs {
            if tensor.shape().first() == Some(&0) {
                continue;
            }
            self.entries.insert(past_name(&name), KvCacheEntry::new(tensor));
        }

        if self.max_positions > 0 {
            let limit = self.max_positions;
            let overflow = self
                .entries
                .iter()
                .find(|(_, e)| e.positions() >= limit)
                .map(|(name, e)| (name.clone(), e.positions()));
            if let Some((name, positions)) = overflow {
                warn!(
                    entry = %name,
                    positions,
                    limit = self.max_positions,
                    "kv cache overflow, resetting"
                );
                self.entries.clear();
                return false;
            }
        }
        true
    }

    /// 按新 beam 的来源重排每个条目的首维：新的第 j 行 = 旧的第 `origins[j]` 行
    pub fn reindex(&mut self, origins: &[usize]) -> EngineResult<()> {
        for (name, entry) in self.entries.iter_mut() {
            let beams = entry.beams();
            if beams != origins.len() {
                return Err(EngineError::inference(format!(
                    "kv cache entry {name} has {beams} beam rows, expected {}",
                    origins.len()
                )));
            }
            if let Some(&bad) = origins.iter().find(|&&o| o >= beams) {
                return Err(EngineError::inference(format!(
                    "beam origin {bad} out of range for {beams} rows"
                )));
            }
            entry.tensor = entry.tensor.select(Axis(0), origins);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array, IxDyn};

    fn rows(values: &[[f32; 2]]) -> ArrayD<f32> {
        arr2(values).into_dyn()
    }

    #[test]
    fn test_absorb_renames_present_outputs() {
        let mut cache = KvCache::new(0);
        cache.absorb(vec![("present.0.decoder.key".to_string(), rows(&[[1.0, 2.0]]))]);
        assert!(cache.get("past_key_values.0.decoder.key").is_some());
        assert!(cache.get("present.0.decoder.key").is_none());
    }

    #[test]
    fn test_absorb_keeps_entry_when_output_is_empty() {
        let mut cache = KvCache::new(0);
        cache.absorb(vec![("present.0.encoder.key".to_string(), rows(&[[1.0, 2.0], [3.0, 4.0]]))]);
        let empty = Array::<f32, _>::zeros(IxDyn(&[0, 2]));
        cache.absorb(vec![("present.0.encoder.key".to_string(), empty)]);
        let entry = cache.get("past_key_values.0.encoder.key").unwrap();
        assert_eq!(entry.shape(), &[2, 2]);
    }

    #[test]
    fn test_reindex_gathers_rows_by_origin() {
        let mut cache = KvCache::new(0);
        cache.absorb(vec![(
            "present.0.decoder.key".to_string(),
            rows(&[[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]),
        )]);
        cache.reindex(&[2, 0, 0]).unwrap();
        let entry = cache.get("past_key_values.0.decoder.key").unwrap();
        assert_eq!(entry.tensor, rows(&[[3.0, 3.0], [1.0, 1.0], [1.0, 1.0]]));
    }

    #[test]
    fn test_reindex_rejects_mismatched_beams() {
        let mut cache = KvCache::new(0);
        cache.absorb(vec![("present.0.decoder.key".to_string(), rows(&[[1.0, 1.0]]))]);
        assert!(cache.reindex(&[0, 0]).unwrap_err().is_inference());
    }

    #[test]
    fn test_overflow_resets_cache() {
        let mut cache = KvCache::new(4);
        let tensor = Array::<f32, _>::zeros(IxDyn(&[2, 8, 4, 16]));
        assert!(!cache.absorb(vec![("present.0.decoder.key".to_string(), tensor)]));
        assert!(cache.is_empty());

        let tensor = Array::<f32, _>::zeros(IxDyn(&[2, 8, 3, 16]));
        assert!(cache.absorb(vec![("present.0.decoder.key".to_string(), tensor)]));
        assert_eq!(cache.len(), 1);
    }
}
