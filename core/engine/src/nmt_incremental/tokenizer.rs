use std::fs;

use serde::Deserialize;
use tracing::{debug, info};

use super::language_pair::LanguagePair;
use super::metadata::TokenizerFiles;
use super::normalizer::{MosesNormalizer, NormalizerOptions};
use super::subword::SubwordModel;
use super::vocabulary::{SpecialTokens, Vocabulary, WORD_BOUNDARY};
use crate::config_manager::TranslatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::text_segmentation::SentenceSplitter;
use crate::types::{EncodedInput, TokenId};

/// tokenizer_config.json 中我们关心的字段
#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    unk_token: Option<String>,
    #[serde(default)]
    eos_token: Option<String>,
    #[serde(default)]
    pad_token: Option<String>,
}

impl TokenizerConfig {
    fn special_tokens(self) -> SpecialTokens {
        let defaults = SpecialTokens::default();
        SpecialTokens {
            unknown: self.unk_token.unwrap_or(defaults.unknown),
            eos: self.eos_token.unwrap_or(defaults.eos),
            pad: self.pad_token.unwrap_or(defaults.pad),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenizerOptions {
    pub max_input_length: usize,
    pub normalizer: NormalizerOptions,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self {
            max_input_length: 512,
            normalizer: NormalizerOptions::default(),
        }
    }
}

impl From<&TranslatorConfig> for TokenizerOptions {
    fn from(config: &TranslatorConfig) -> Self {
        Self {
            max_input_length: config.max_input_length,
            normalizer: config.normalizer.clone(),
        }
    }
}

/// Marian 分词器：文本 <-> token id
///
/// 源语言与目标语言可以共用一个词表，也可以各自独立；解码时优先使用目标词表。
#[derive(Debug)]
pub struct MarianTokenizer {
    source_vocabulary: Vocabulary,
    target_vocabulary: Option<Vocabulary>,
    source_model: SubwordModel,
    normalizer: MosesNormalizer,
    max_input_length: usize,
    language_pair: LanguagePair,
    language_codes: Vec<String>,
}

impl MarianTokenizer {
    /// 从模型目录中的分词器文件加载
    ///
    /// # Arguments
    /// * `files` - 由 metadata.json 解析出的分词器文件
    /// * `language_pair` - 语言对，决定归一化规则
    /// * `options` - 截断长度与归一化开关
    pub fn from_files(
        files: &TokenizerFiles,
        language_pair: LanguagePair,
        options: &TokenizerOptions,
    ) -> EngineResult<Self> {
        let config = match &files.config {
            Some(path) => {
                let data = fs::read_to_string(path).map_err(|e| {
                    EngineError::load(format!("failed to read {}: {e}", path.display()))
                })?;
                serde_json::from_str::<TokenizerConfig>(&data).map_err(|e| {
                    EngineError::load(format!("malformed {}: {e}", path.display()))
                })?
            }
            None => TokenizerConfig::default(),
        };
        let specials = config.special_tokens();

        let source_vocabulary = Vocabulary::from_file(&files.source_vocabulary, &specials)?;
        let target_vocabulary = files
            .target_vocabulary
            .as_deref()
            .map(|path| Vocabulary::from_file(path, &specials))
            .transpose()?;
        let source_model = match &files.source_model {
            Some(path) => SubwordModel::from_file(path)?,
            None => SubwordModel::Greedy,
        };

        let tokenizer = Self::build(
            source_vocabulary,
            target_vocabulary,
            source_model,
            language_pair,
            options,
        )?;
        info!(
            language_pair = %tokenizer.language_pair,
            vocab_size = tokenizer.source_vocabulary.len(),
            separated = tokenizer.target_vocabulary.is_some(),
            pretrained = tokenizer.source_model.is_pretrained(),
            "marian tokenizer loaded"
        );
        Ok(tokenizer)
    }

    /// 只用一个共享词表和贪心切分构建
    pub fn from_vocabulary(
        vocabulary: Vocabulary,
        language_pair: LanguagePair,
        options: &TokenizerOptions,
    ) -> EngineResult<Self> {
        Self::build(vocabulary, None, SubwordModel::Greedy, language_pair, options)
    }

    fn build(
        source_vocabulary: Vocabulary,
        target_vocabulary: Option<Vocabulary>,
        source_model: SubwordModel,
        language_pair: LanguagePair,
        options: &TokenizerOptions,
    ) -> EngineResult<Self> {
        if options.max_input_length == 0 {
            return Err(EngineError::Config("max_input_length must be at least 1".into()));
        }
        let normalizer = MosesNormalizer::new(language_pair.source.as_str(), &options.normalizer)?;
        let language_codes = source_vocabulary
            .tokens()
            .iter()
            .filter(|t| is_language_marker(t))
            .cloned()
            .collect();

        Ok(Self {
            source_vocabulary,
            target_vocabulary,
            source_model,
            normalizer,
            max_input_length: options.max_input_length,
            language_pair,
            language_codes,
        })
    }

    pub fn language_pair(&self) -> &LanguagePair {
        &self.language_pair
    }

    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    /// 词表中出现的 `>>xx<<` 目标语言标记
    pub fn supported_language_codes(&self) -> &[String] {
        &self.language_codes
    }

    pub fn source_vocabulary(&self) -> &Vocabulary {
        &self.source_vocabulary
    }

    /// 解码使用的词表
    pub fn target_vocabulary(&self) -> &Vocabulary {
        self.target_vocabulary.as_ref().unwrap_or(&self.source_vocabulary)
    }

    pub fn pad_id(&self) -> TokenId {
        self.target_vocabulary().pad_id()
    }

    pub fn eos_id(&self) -> TokenId {
        self.target_vocabulary().eos_id()
    }

    pub fn normalize(&self, text: &str) -> String {
        self.normalizer.normalize(text)
    }

    /// 切成子词；开头的 `>>code<<` 作为单独的 token 保留
    pub fn tokenize(&self, text: &str) -> EngineResult<Vec<String>> {
        let (marker, rest) = split_language_marker(text);
        let mut tokens = Vec::new();
        if let Some(marker) = marker {
            tokens.push(marker.to_string());
        }
        tokens.extend(self.source_model.split(rest, &self.source_vocabulary)?);
        Ok(tokens)
    }

    /// 编码：token -> id，追加 eos，超长截断；`pad` 为 true 时填充到 `max_input_length`
    pub fn encode(&self, text: &str, pad: bool) -> EngineResult<EncodedInput> {
        let tokens = self.tokenize(text).map_err(|e| match e {
            EngineError::Tokenization { .. } => e,
            other => EngineError::tokenization(text, other.to_string()),
        })?;

        let vocab = &self.source_vocabulary;
        let mut ids: Vec<TokenId> = tokens.iter().map(|t| vocab.id_or_unknown(t)).collect();
        ids.push(vocab.eos_id());

        let real_len = ids.len().min(self.max_input_length);
        ids.truncate(real_len);
        if pad {
            ids.resize(self.max_input_length, vocab.pad_id());
        }
        let attention_mask = (0..ids.len())
            .map(|i| if i < real_len { 1 } else { 0 })
            .collect();

        debug!(tokens = tokens.len(), ids = ids.len(), "encoded input");
        Ok(EncodedInput {
            ids,
            attention_mask,
        })
    }

    /// 解码：id -> token，`filter_special` 时丢掉 unk/eos/pad，"▁" 还原为空格
    pub fn decode(&self, ids: &[TokenId], filter_special: bool) -> String {
        let vocab = self.target_vocabulary();
        let mut text = String::new();
        for &id in ids {
            let token = vocab.token(id);
            if filter_special && vocab.id(token).is_some_and(|i| vocab.is_special(i)) {
                continue;
            }
            text.push_str(token);
        }
        text.replace(WORD_BOUNDARY, " ").trim().to_string()
    }

    /// 切句并按 `group_length` 字符合并
    pub fn split_sentences(&self, text: &str, group_length: usize) -> Vec<String> {
        SentenceSplitter::new(group_length).split(text)
    }
}

fn is_language_marker(token: &str) -> bool {
    token.len() > 4
        && token.starts_with(">>")
        && token.ends_with("<<")
        && !token[2..token.len() - 2].contains(['<', '>'])
}

fn split_language_marker(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim_start();
    if trimmed.starts_with(">>") {
        if let Some(end) = trimmed[2..].find("<<") {
            let marker = &trimmed[..end + 4];
            if is_language_marker(marker) && !marker.contains(char::is_whitespace) {
                return (Some(marker), &trimmed[end + 4..]);
            }
        }
    }
    (None, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer(max_input_length: usize) -> MarianTokenizer {
        let tokens = ["<unk>", "<pad>", "</s>", ">>de<<", "▁hello", "▁wor", "ld", "▁!"];
        let vocab = Vocabulary::from_tokens(
            tokens.iter().map(|t| t.to_string()).collect(),
            &SpecialTokens::default(),
        )
        .unwrap();
        MarianTokenizer::from_vocabulary(
            vocab,
            LanguagePair::from_codes("en", "de").unwrap(),
            &TokenizerOptions {
                max_input_length,
                ..TokenizerOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_tokenize_keeps_language_marker() {
        let tok = tokenizer(16);
        let tokens = tok.tokenize(">>de<< hello world").unwrap();
        assert_eq!(tokens, vec![">>de<<", "▁hello", "▁wor", "ld"]);
        assert_eq!(tok.supported_language_codes(), [">>de<<".to_string()]);
    }

    #[test]
    fn test_encode_appends_eos_without_padding() {
        let tok = tokenizer(16);
        let encoded = tok.encode("hello world", false).unwrap();
        assert_eq!(encoded.ids, vec![4, 5, 6, 2]);
        assert_eq!(encoded.attention_mask, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_encode_pads_to_max_length() {
        let tok = tokenizer(6);
        let encoded = tok.encode("hello", true).unwrap();
        assert_eq!(encoded.ids, vec![4, 2, 1, 1, 1, 1]);
        assert_eq!(encoded.attention_mask, vec![1, 1, 0, 0, 0, 0]);
        assert_eq!(encoded.real_len(), 2);
    }

    #[test]
    fn test_encode_truncates() {
        let tok = tokenizer(2);
        let encoded = tok.encode("hello world", true).unwrap();
        assert_eq!(encoded.ids, vec![4, 5]);
        assert_eq!(encoded.attention_mask, vec![1, 1]);
    }

    #[test]
    fn test_encode_unknown_word() {
        let tok = tokenizer(16);
        let encoded = tok.encode("hello zz", false).unwrap();
        // "▁" "z" "z" 都不在词表中
        assert_eq!(encoded.ids, vec![4, 0, 0, 0, 2]);
    }

    #[test]
    fn test_decode_filters_special_tokens() {
        let tok = tokenizer(16);
        assert_eq!(tok.decode(&[1, 4, 5, 6, 2], true), "hello world");
        assert_eq!(tok.decode(&[4, 2], false), "hello</s>");
        assert_eq!(tok.decode(&[4, 999], false), "hello<unk>");
        assert_eq!(tok.decode(&[4, 999], true), "hello");
    }

    #[test]
    fn test_normalize_uses_source_language() {
        let tok = tokenizer(16);
        assert_eq!(tok.normalize("  hello   (world)  "), "hello (world)");
    }
}
