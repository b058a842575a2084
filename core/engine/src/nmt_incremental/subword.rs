use std::path::Path;

use tokenizers::Tokenizer;

use super::vocabulary::{Vocabulary, WORD_BOUNDARY};
use crate::error::{EngineError, EngineResult};

/// 子词切分后端
///
/// - `Pretrained`：HuggingFace 导出的 tokenizer.json（Unigram / BPE 均可）
/// - `Greedy`：没有子词模型时，直接在词表上做最长匹配
pub enum SubwordModel {
    Pretrained(Box<Tokenizer>),
    Greedy,
}

impl SubwordModel {
    /// 从 tokenizer.json 加载
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            EngineError::load(format!("failed to load subword model {}: {e}", path.display()))
        })?;
        Ok(Self::Pretrained(Box::new(tokenizer)))
    }

    pub fn is_pretrained(&self) -> bool {
        matches!(self, Self::Pretrained(_))
    }

    /// 把一段文本切成子词字符串（不含特殊 token）
    pub fn split(&self, text: &str, vocabulary: &Vocabulary) -> EngineResult<Vec<String>> {
        match self {
            Self::Pretrained(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| EngineError::tokenization(text, e.to_string()))?;
                Ok(encoding.get_tokens().to_vec())
            }
            Self::Greedy => Ok(greedy_split(text, vocabulary)),
        }
    }
}

impl std::fmt::Debug for SubwordModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretrained(_) => f.write_str("SubwordModel::Pretrained"),
            Self::Greedy => f.write_str("SubwordModel::Greedy"),
        }
    }
}

/// 按空白拆词，每个词前加 "▁"，再在词表上做从左到右的最长匹配。
/// 匹配不到的单个字符原样输出，后续映射成 unknown。
fn greedy_split(text: &str, vocabulary: &Vocabulary) -> Vec<String> {
    let mut pieces = Vec::new();
    for word in text.split_whitespace() {
        let marked: Vec<char> = std::iter::once(WORD_BOUNDARY).chain(word.chars()).collect();
        let mut start = 0;
        while start < marked.len() {
            let mut end = marked.len();
            let mut matched = None;
            while end > start {
                let candidate: String = marked[start..end].iter().collect();
                if vocabulary.contains(&candidate) {
                    matched = Some(candidate);
                    break;
                }
                end -= 1;
            }
            match matched {
                Some(piece) => {
                    pieces.push(piece);
                    start = end;
                }
                None => {
                    pieces.push(marked[start].to_string());
                    start += 1;
                }
            }
        }
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmt_incremental::vocabulary::SpecialTokens;

    fn vocab(tokens: &[&str]) -> Vocabulary {
        let mut all = vec!["<unk>".to_string(), "<pad>".to_string(), "</s>".to_string()];
        all.extend(tokens.iter().map(|t| t.to_string()));
        Vocabulary::from_tokens(all, &SpecialTokens::default()).unwrap()
    }

    #[test]
    fn test_greedy_prefers_longest_piece() {
        let vocab = vocab(&["▁hel", "▁hello", "lo", "▁wor", "ld", "▁world"]);
        let pieces = SubwordModel::Greedy.split("hello world", &vocab).unwrap();
        assert_eq!(pieces, vec!["▁hello", "▁world"]);
    }

    #[test]
    fn test_greedy_splits_into_subwords() {
        let vocab = vocab(&["▁wor", "ld", "▁"]);
        let pieces = SubwordModel::Greedy.split("world", &vocab).unwrap();
        assert_eq!(pieces, vec!["▁wor", "ld"]);
    }

    #[test]
    fn test_greedy_unknown_characters_pass_through() {
        let vocab = vocab(&["▁a"]);
        let pieces = SubwordModel::Greedy.split("a \u{4e2d}", &vocab).unwrap();
        assert_eq!(pieces, vec!["▁a", "▁", "\u{4e2d}"]);
    }
}
