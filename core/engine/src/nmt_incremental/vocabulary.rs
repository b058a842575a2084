use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::{Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::types::TokenId;

/// 子词边界标记（SentencePiece 的 "▁"）
pub const WORD_BOUNDARY: char = '\u{2581}';

/// 词表中必须存在的特殊 token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    pub unknown: String,
    pub eos: String,
    pub pad: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            unknown: "<unk>".to_string(),
            eos: "</s>".to_string(),
            pad: "<pad>".to_string(),
        }
    }
}

/// vocab.json 的 key 列表，保持文件中的顺序
///
/// 值被忽略：token id 就是 key 在对象中的位置。
struct OrderedKeys(Vec<String>);

impl<'de> Deserialize<'de> for OrderedKeys {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KeysVisitor;

        impl<'de> Visitor<'de> for KeysVisitor {
            type Value = OrderedKeys;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object whose keys are vocabulary tokens")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut keys = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, IgnoredAny)) = map.next_entry::<String, IgnoredAny>()? {
                    keys.push(key);
                }
                Ok(OrderedKeys(keys))
            }
        }

        deserializer.deserialize_map(KeysVisitor)
    }
}

/// 有序词表：id = 下标，两个方向的查找都是 O(1)
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, TokenId>,
    unknown_id: TokenId,
    eos_id: TokenId,
    pad_id: TokenId,
}

impl Vocabulary {
    /// 由有序 token 列表构建；重复的 token 以第一次出现为准
    pub fn from_tokens(tokens: Vec<String>, specials: &SpecialTokens) -> EngineResult<Self> {
        let mut index = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            index.entry(token.clone()).or_insert(id as TokenId);
        }

        let require = |token: &str| {
            index.get(token).copied().ok_or_else(|| {
                EngineError::load(format!("vocabulary is missing special token {token:?}"))
            })
        };
        let unknown_id = require(&specials.unknown)?;
        let eos_id = require(&specials.eos)?;
        let pad_id = require(&specials.pad)?;

        Ok(Self {
            tokens,
            index,
            unknown_id,
            eos_id,
            pad_id,
        })
    }

    /// 从 JSON 文本解析（扁平对象，key 的顺序决定 id）
    pub fn from_json_str(json: &str, specials: &SpecialTokens) -> EngineResult<Self> {
        let OrderedKeys(tokens) = serde_json::from_str(json)
            .map_err(|e| EngineError::load(format!("failed to parse vocabulary: {e}")))?;
        Self::from_tokens(tokens, specials)
    }

    /// 从 vocab.json 文件加载
    pub fn from_file(path: &Path, specials: &SpecialTokens) -> EngineResult<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            EngineError::load(format!("failed to read vocabulary {}: {e}", path.display()))
        })?;
        Self::from_json_str(&data, specials)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.index.get(token).copied()
    }

    pub fn id_or_unknown(&self, token: &str) -> TokenId {
        self.id(token).unwrap_or(self.unknown_id)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.index.contains_key(token)
    }

    /// 越界 id 返回 unknown token
    pub fn token(&self, id: TokenId) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.tokens.get(i))
            .map(String::as_str)
            .unwrap_or_else(|| self.tokens[self.unknown_id as usize].as_str())
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn unknown_id(&self) -> TokenId {
        self.unknown_id
    }

    pub fn eos_id(&self) -> TokenId {
        self.eos_id
    }

    pub fn pad_id(&self) -> TokenId {
        self.pad_id
    }

    pub fn is_special(&self, id: TokenId) -> bool {
        id == self.unknown_id || id == self.eos_id || id == self.pad_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_key_order() {
        let vocab = Vocabulary::from_json_str(
            r#"{"</s>": 0, "<unk>": 1, "▁zebra": 7, "▁apple": 3, "<pad>": 2}"#,
            &SpecialTokens::default(),
        )
        .unwrap();
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.eos_id(), 0);
        assert_eq!(vocab.unknown_id(), 1);
        assert_eq!(vocab.id("▁zebra"), Some(2));
        assert_eq!(vocab.id("▁apple"), Some(3));
        assert_eq!(vocab.pad_id(), 4);
        assert_eq!(vocab.token(3), "▁apple");
    }

    #[test]
    fn test_out_of_range_maps_to_unknown() {
        let vocab = Vocabulary::from_json_str(
            r#"{"<unk>": 0, "<pad>": 1, "</s>": 2}"#,
            &SpecialTokens::default(),
        )
        .unwrap();
        assert_eq!(vocab.token(99), "<unk>");
        assert_eq!(vocab.token(-1), "<unk>");
        assert_eq!(vocab.id_or_unknown("missing"), 0);
    }

    #[test]
    fn test_missing_special_token_fails() {
        let err = Vocabulary::from_json_str(r#"{"<unk>": 0, "</s>": 1}"#, &SpecialTokens::default())
            .unwrap_err();
        assert!(err.is_load());
        assert!(err.to_string().contains("<pad>"));
    }

    #[test]
    fn test_rejects_non_object() {
        let err = Vocabulary::from_json_str(r#"["<unk>"]"#, &SpecialTokens::default()).unwrap_err();
        assert!(err.is_load());
    }
}
