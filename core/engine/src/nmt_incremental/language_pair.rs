use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// ISO 639 语言代码（2~3 个小写 ASCII 字母）
///
/// Marian 模型覆盖的语言很多，这里不再枚举，只做格式校验和常用别名归一化。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: &str) -> EngineResult<Self> {
        let lowered = code.trim().to_lowercase();
        let normalized = match lowered.as_str() {
            "eng" | "english" => "en",
            "zho" | "chinese" | "中文" => "zh",
            "spa" | "spanish" | "español" => "es",
            "jpn" | "japanese" | "日本語" => "ja",
            "deu" | "ger" | "german" | "deutsch" => "de",
            "fra" | "fre" | "french" | "français" => "fr",
            other => other,
        };
        let valid = (2..=3).contains(&normalized.len())
            && normalized.chars().all(|c| c.is_ascii_lowercase());
        if !valid {
            return Err(EngineError::Config(format!("unsupported language code: {code}")));
        }
        Ok(Self(normalized.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Marian 多目标模型使用的目标语言标记，如 `>>de<<`
    pub fn marker(&self) -> String {
        format!(">>{}<<", self.0)
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LanguageCode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LanguageCode {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<LanguageCode> for String {
    fn from(code: LanguageCode) -> Self {
        code.0
    }
}

/// 语言对：源语言 -> 目标语言
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: LanguageCode,
    pub target: LanguageCode,
}

impl LanguagePair {
    pub fn new(source: LanguageCode, target: LanguageCode) -> Self {
        Self { source, target }
    }

    /// 由两个代码字符串直接构造
    pub fn from_codes(source: &str, target: &str) -> EngineResult<Self> {
        Ok(Self::new(LanguageCode::new(source)?, LanguageCode::new(target)?))
    }

    /// 转换为模型目录名（如 "marian-en-zh"）
    pub fn to_model_dir_name(&self) -> String {
        format!("marian-{}-{}", self.source, self.target)
    }

    /// 从模型目录名解析语言对，支持 "marian-en-zh" 与 "opus-mt-en-zh"
    pub fn from_model_dir_name(dir_name: &str) -> EngineResult<Self> {
        let name = dir_name
            .strip_prefix("marian-")
            .or_else(|| dir_name.strip_prefix("opus-mt-"))
            .ok_or_else(|| {
                EngineError::Config(format!("invalid model directory name: {dir_name}"))
            })?;
        name.parse()
    }

    /// 根据语言对查找模型目录
    ///
    /// # Arguments
    /// * `base_dir` - 模型基础目录（如 `models/nmt/`）
    ///
    /// # Returns
    /// 完整的模型目录路径（如 `models/nmt/marian-en-zh/`）
    pub fn find_model_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.to_model_dir_name())
    }

    /// 从模型目录路径识别语言对
    pub fn from_model_dir(model_dir: &Path) -> EngineResult<Self> {
        let dir_name = model_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "invalid model directory path: {}",
                    model_dir.display()
                ))
            })?;
        Self::from_model_dir_name(dir_name)
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

impl FromStr for LanguagePair {
    type Err = EngineError;

    /// 从字符串创建语言对（如 "en-zh", "eng-zho"）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 2 {
            return Err(EngineError::Config(format!("invalid language pair format: {s}")));
        }
        Self::from_codes(parts[0], parts[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_pair_from_str() {
        let pair: LanguagePair = "en-zh".parse().unwrap();
        assert_eq!(pair.source.as_str(), "en");
        assert_eq!(pair.target.as_str(), "zh");

        let pair: LanguagePair = "eng-deu".parse().unwrap();
        assert_eq!(pair.to_string(), "en-de");
    }

    #[test]
    fn test_language_pair_rejects_garbage() {
        assert!("en".parse::<LanguagePair>().is_err());
        assert!("en-zh-ja".parse::<LanguagePair>().is_err());
        assert!("en-z1".parse::<LanguagePair>().is_err());
    }

    #[test]
    fn test_language_pair_to_model_dir_name() {
        let pair = LanguagePair::from_codes("en", "zh").unwrap();
        assert_eq!(pair.to_model_dir_name(), "marian-en-zh");
        assert_eq!(
            pair.find_model_dir(Path::new("models/nmt")),
            PathBuf::from("models/nmt/marian-en-zh")
        );
    }

    #[test]
    fn test_language_pair_from_model_dir_name() {
        let pair = LanguagePair::from_model_dir_name("marian-en-zh").unwrap();
        assert_eq!(pair.to_string(), "en-zh");

        let pair = LanguagePair::from_model_dir(Path::new("/models/opus-mt-de-en")).unwrap();
        assert_eq!(pair.source.as_str(), "de");
        assert_eq!(pair.target.as_str(), "en");
    }

    #[test]
    fn test_language_code_marker() {
        assert_eq!(LanguageCode::new("FR").unwrap().marker(), ">>fr<<");
    }
}
