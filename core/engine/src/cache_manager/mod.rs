//! 翻译结果缓存
//!
//! 固定容量、按访问顺序淘汰的 LRU。节点存放在 arena（`Vec`）里，
//! 用下标组成双向链表，另有一个 key -> 下标的索引。
//!
//! key 是 (源文本, 语言对) 的 SHA-256 前 8 字节，而不是完整字符串。
//! 两个不同输入碰撞到同一个 key 时会共用一个条目（后写入的覆盖先写入的）；
//! 64 位空间下对本地缓存的规模来说概率可以忽略。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::nmt_incremental::language_pair::LanguagePair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(u64);

impl CacheKey {
    pub fn new(text: &str, language_pair: &LanguagePair) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(language_pair.source.as_str().as_bytes());
        hasher.update([0x1f_u8]);
        hasher.update(language_pair.target.as_str().as_bytes());
        hasher.update([0x1e_u8]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(prefix))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// 批量查询结果：已有翻译的输入和仍需计算的输入
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheLookup {
    /// (源文本, 译文)
    pub cached: Vec<(String, String)>,
    pub missing: Vec<String>,
}

impl CacheLookup {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
struct Node {
    key: CacheKey,
    value: String,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TranslationCache {
    capacity: usize,
    nodes: Vec<Node>,
    index: HashMap<CacheKey, usize>,
    /// 最久未使用
    head: Option<usize>,
    /// 最近使用
    tail: Option<usize>,
    free: Vec<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl TranslationCache {
    /// 容量为 0 时缓存关闭，所有写入被忽略
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::with_capacity(capacity.min(1024)),
            index: HashMap::with_capacity(capacity.min(1024)),
            head: None,
            tail: None,
            free: Vec::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&mut self, text: &str, language_pair: &LanguagePair) -> Option<String> {
        self.get_key(CacheKey::new(text, language_pair))
    }

    pub fn get_key(&mut self, key: CacheKey) -> Option<String> {
        match self.index.get(&key).copied() {
            Some(slot) => {
                self.hits += 1;
                self.touch(slot);
                Some(self.nodes[slot].value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// 批量查询，按输入顺序划分为命中与未命中
    pub fn get_many<S: AsRef<str>>(&mut self, texts: &[S], language_pair: &LanguagePair) -> CacheLookup {
        let mut lookup = CacheLookup::default();
        for text in texts {
            let text = text.as_ref();
            match self.get(text, language_pair) {
                Some(translation) => lookup.cached.push((text.to_string(), translation)),
                None => lookup.missing.push(text.to_string()),
            }
        }
        lookup
    }

    pub fn put(&mut self, text: &str, translation: &str, language_pair: &LanguagePair) {
        self.put_key(CacheKey::new(text, language_pair), translation.to_string());
    }

    /// 批量写入；两个切片长度不同时只写入较短的部分
    pub fn put_many<S: AsRef<str>, T: AsRef<str>>(
        &mut self,
        texts: &[S],
        translations: &[T],
        language_pair: &LanguagePair,
    ) {
        for (text, translation) in texts.iter().zip(translations) {
            self.put(text.as_ref(), translation.as_ref(), language_pair);
        }
    }

    pub fn put_key(&mut self, key: CacheKey, value: String) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&slot) = self.index.get(&key) {
            self.nodes[slot].value = value;
            self.touch(slot);
            return;
        }

        if self.index.len() >= self.capacity {
            self.evict_oldest();
        }

        let node = Node {
            key,
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_back(slot);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// 从最久未使用到最近使用
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            keys.push(self.nodes[slot].key);
            cursor = self.nodes[slot].next;
        }
        keys
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.size(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(slot) = self.head {
            self.unlink(slot);
            let key = self.nodes[slot].key;
            self.index.remove(&key);
            self.nodes[slot].value = String::new();
            self.free.push(slot);
            self.evictions += 1;
        }
    }

    fn touch(&mut self, slot: usize) {
        if self.tail != Some(slot) {
            self.unlink(slot);
            self.push_back(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[slot].prev = None;
        self.nodes[slot].next = None;
    }

    fn push_back(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = None;
        match self.tail {
            Some(t) => self.nodes[t].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> LanguagePair {
        LanguagePair::from_codes("en", "de").unwrap()
    }

    #[test]
    fn test_keeps_most_recently_used() {
        let pair = pair();
        let mut cache = TranslationCache::new(3);
        let texts: Vec<String> = (0..7).map(|i| format!("text {i}")).collect();
        for text in &texts {
            cache.put(text, &text.to_uppercase(), &pair);
        }
        assert_eq!(cache.size(), 3);
        let expected: Vec<CacheKey> = texts[4..].iter().map(|t| CacheKey::new(t, &pair)).collect();
        assert_eq!(cache.keys(), expected);
        assert_eq!(cache.stats().evictions, 4);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let pair = pair();
        let mut cache = TranslationCache::new(2);
        cache.put("a", "A", &pair);
        cache.put("b", "B", &pair);
        assert_eq!(cache.get("a", &pair).as_deref(), Some("A"));
        cache.put("c", "C", &pair);

        assert_eq!(cache.get("b", &pair), None);
        assert_eq!(cache.get("a", &pair).as_deref(), Some("A"));
        assert_eq!(cache.get("c", &pair).as_deref(), Some("C"));
    }

    #[test]
    fn test_put_updates_existing_entry() {
        let pair = pair();
        let mut cache = TranslationCache::new(2);
        cache.put("a", "first", &pair);
        cache.put("a", "second", &pair);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get("a", &pair).as_deref(), Some("second"));
    }

    #[test]
    fn test_keys_are_scoped_by_language_pair() {
        let en_de = pair();
        let en_fr = LanguagePair::from_codes("en", "fr").unwrap();
        let mut cache = TranslationCache::new(4);
        cache.put("hello", "hallo", &en_de);
        assert_eq!(cache.get("hello", &en_fr), None);
        assert_eq!(cache.get("hello", &en_de).as_deref(), Some("hallo"));
    }

    #[test]
    fn test_get_many_partitions_inputs() {
        let pair = pair();
        let mut cache = TranslationCache::new(4);
        cache.put_many(&["one", "three"], &["eins", "drei"], &pair);
        let lookup = cache.get_many(&["one", "two", "three"], &pair);
        assert_eq!(
            lookup.cached,
            vec![
                ("one".to_string(), "eins".to_string()),
                ("three".to_string(), "drei".to_string())
            ]
        );
        assert_eq!(lookup.missing, vec!["two".to_string()]);
        assert!(!lookup.is_complete());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let pair = pair();
        let mut cache = TranslationCache::new(0);
        cache.put("a", "A", &pair);
        assert!(cache.is_empty());
        assert_eq!(cache.get("a", &pair), None);
    }

    #[test]
    fn test_clear() {
        let pair = pair();
        let mut cache = TranslationCache::new(2);
        cache.put("a", "A", &pair);
        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(cache.keys().is_empty());
        cache.put("b", "B", &pair);
        assert_eq!(cache.keys(), vec![CacheKey::new("b", &pair)]);
    }

    #[test]
    fn test_hash_collision_merges_entries() {
        // key 只是内容哈希：两个不同输入一旦落在同一个 key 上就共用一个条目
        let mut cache = TranslationCache::new(4);
        let shared = CacheKey::from_raw(42);
        cache.put_key(shared, "translation of first input".to_string());
        cache.put_key(shared, "translation of second input".to_string());
        assert_eq!(cache.size(), 1);
        assert_eq!(
            cache.get_key(shared).as_deref(),
            Some("translation of second input")
        );
    }

    #[test]
    fn test_distinct_inputs_get_distinct_keys() {
        let pair = pair();
        assert_ne!(CacheKey::new("a", &pair), CacheKey::new("b", &pair));
        assert_eq!(CacheKey::new("a", &pair), CacheKey::new("a", &pair));
    }
}
