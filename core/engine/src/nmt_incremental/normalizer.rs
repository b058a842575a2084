//! Moses 风格的标点归一化
//!
//! 按语言代码选出一组有序的正则替换规则，依次作用在输入上，最后去掉首尾空白。
//! 规则顺序有意义：前面的规则会改变后面规则看到的文本。

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// 归一化开关
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerOptions {
    /// 反引号与双撇号规则（插在第一条规则之后）
    pub penn: bool,
    /// 引号后的逗号/句号移到引号内（en）或引号外（de/es/fr）
    pub norm_quote_commas: bool,
    /// 数字之间的不换行空格改成千分位符
    pub norm_numbers: bool,
    /// 预先替换全角与 CJK 标点
    pub pre_replace_unicode_punct: bool,
    /// 最后删除 `\p{C}` 类字符
    pub post_remove_control_chars: bool,
    /// 与 Perl 版 normalize-punctuation 的输出保持一致
    pub perl_parity: bool,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            penn: true,
            norm_quote_commas: true,
            norm_numbers: true,
            pre_replace_unicode_punct: false,
            post_remove_control_chars: false,
            perl_parity: false,
        }
    }
}

type Rule = (&'static str, &'static str);

const EXTRA_WHITESPACE: &[Rule] = &[
    (r"\r", ""),
    (r"\(", " ("),
    (r"\)", ") "),
    (r" +", " "),
    (r"\) ([.!:?;,])", ")$1"),
    (r"\( ", "("),
    (r" \)", ")"),
    (r"(\d) %", "$1%"),
    (r" :", ":"),
    (r" ;", ";"),
];

const PENN_QUOTES: &[Rule] = &[("`", "'"), ("''", " \" ")];

const UNICODE_QUOTES: &[Rule] = &[
    ("„", "\""),
    ("“", "\""),
    ("”", "\""),
    ("–", "-"),
    ("—", " - "),
    (r" +", " "),
    ("´", "'"),
    ("([a-zA-Z])‘([a-zA-Z])", "$1'$2"),
    ("([a-zA-Z])’([a-zA-Z])", "$1'$2"),
    ("‘", "'"),
    ("‚", "'"),
    ("’", "'"),
    ("''", "\""),
    ("´´", "\""),
    ("…", "..."),
];

/// perl 版把孤立的右单引号当成双引号
const UNICODE_QUOTES_PERL_INDEX: usize = 11;

const FRENCH_QUOTES: &[Rule] = &[
    ("\u{00A0}«\u{00A0}", "\""),
    ("«\u{00A0}", "\""),
    ("«", "\""),
    ("\u{00A0}»\u{00A0}", "\""),
    ("\u{00A0}»", "\""),
    ("»", "\""),
];

const PSEUDO_SPACES: &[Rule] = &[
    ("\u{00A0}%", "%"),
    ("nº\u{00A0}", "nº "),
    ("\u{00A0}:", ":"),
    ("\u{00A0}ºC", " ºC"),
    ("\u{00A0}cm", " cm"),
    ("\u{00A0}\\?", "?"),
    ("\u{00A0}!", "!"),
    ("\u{00A0};", ";"),
    (",\u{00A0}", ", "),
    (r" +", " "),
];

const EN_QUOTE_COMMA: &[Rule] = &[(r#""([,.]+)"#, "$1\"")];

const DE_ES_FR_QUOTE_COMMA: &[Rule] = &[
    (",\"", "\","),
    // 句末的句号保持原样
    (r#"(\.+)"(\s*[^<])"#, "\"$1$2"),
];

const NUMBERS_COMMA: &[Rule] = &[("(\\d)\u{00A0}(\\d)", "$1,$2")];

const NUMBERS_PERIOD: &[Rule] = &[("(\\d)\u{00A0}(\\d)", "$1.$2")];

const UNICODE_PUNCT: &[Rule] = &[
    ("，", ","),
    (r"。\s*", ". "),
    ("、", ","),
    ("”", "\""),
    ("“", "\""),
    ("∶", ":"),
    ("：", ":"),
    ("？", "?"),
    ("《", "\""),
    ("》", "\""),
    ("）", ")"),
    ("！", "!"),
    ("（", "("),
    ("；", ";"),
    ("」", "\""),
    ("「", "\""),
    ("０", "0"),
    ("１", "1"),
    ("２", "2"),
    ("３", "3"),
    ("４", "4"),
    ("５", "5"),
    ("６", "6"),
    ("７", "7"),
    ("８", "8"),
    ("９", "9"),
    (r"．\s*", ". "),
    ("～", "~"),
    ("’", "'"),
    ("…", "..."),
    ("━", "-"),
    ("〈", "<"),
    ("〉", ">"),
    ("【", "["),
    ("】", "]"),
    ("％", "%"),
];

fn compile(rules: &[Rule]) -> EngineResult<Vec<(Regex, &'static str)>> {
    rules
        .iter()
        .map(|(pattern, replacement)| {
            Regex::new(pattern)
                .map(|re| (re, *replacement))
                .map_err(|e| EngineError::Config(format!("bad normalizer rule {pattern:?}: {e}")))
        })
        .collect()
}

/// 标点归一化器，构造后不可变，可在线程间共享
#[derive(Debug, Clone)]
pub struct MosesNormalizer {
    language: String,
    substitutions: Vec<(Regex, &'static str)>,
    unicode_punct: Option<Vec<(Regex, &'static str)>>,
    control_chars: Option<Regex>,
}

impl MosesNormalizer {
    /// 为给定语言构建规则表
    ///
    /// # Arguments
    /// * `language` - 源语言代码（如 "en"、"de"）
    /// * `options` - 归一化开关
    pub fn new(language: &str, options: &NormalizerOptions) -> EngineResult<Self> {
        let mut unicode_quotes = UNICODE_QUOTES.to_vec();
        let mut french_quotes = FRENCH_QUOTES.to_vec();
        if options.perl_parity {
            unicode_quotes[UNICODE_QUOTES_PERL_INDEX] = ("’", "\"");
            french_quotes[0] = ("\u{00A0}«\u{00A0}", " \"");
            french_quotes[3] = ("\u{00A0}»\u{00A0}", "\" ");
        }

        let mut rules: Vec<Rule> = Vec::new();
        rules.extend_from_slice(EXTRA_WHITESPACE);
        rules.extend(unicode_quotes);
        rules.extend(french_quotes);
        rules.extend_from_slice(PSEUDO_SPACES);
        if options.penn {
            // 紧跟在 "\r" 规则之后
            for (offset, rule) in PENN_QUOTES.iter().enumerate() {
                rules.insert(1 + offset, *rule);
            }
        }

        if options.norm_quote_commas {
            match language {
                "en" => rules.extend_from_slice(EN_QUOTE_COMMA),
                "de" | "es" | "fr" => rules.extend_from_slice(DE_ES_FR_QUOTE_COMMA),
                _ => {}
            }
        }

        if options.norm_numbers {
            match language {
                "de" | "es" | "cz" | "cs" | "fr" => rules.extend_from_slice(NUMBERS_COMMA),
                _ => rules.extend_from_slice(NUMBERS_PERIOD),
            }
        }

        let unicode_punct = if options.pre_replace_unicode_punct {
            Some(compile(UNICODE_PUNCT)?)
        } else {
            None
        };
        let control_chars = if options.post_remove_control_chars {
            Some(Regex::new(r"\p{C}").map_err(|e| EngineError::Config(e.to_string()))?)
        } else {
            None
        };

        Ok(Self {
            language: language.to_string(),
            substitutions: compile(&rules)?,
            unicode_punct,
            control_chars,
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn normalize(&self, text: &str) -> String {
        let mut normalized = text.to_string();

        if let Some(rules) = &self.unicode_punct {
            normalized = apply(rules, normalized);
        }

        normalized = apply(&self.substitutions, normalized);

        if let Some(re) = &self.control_chars {
            normalized = re.replace_all(&normalized, "").into_owned();
        }

        normalized.trim().to_string()
    }
}

fn apply(rules: &[(Regex, &'static str)], mut text: String) -> String {
    for (re, replacement) in rules {
        if let std::borrow::Cow::Owned(replaced) = re.replace_all(&text, *replacement) {
            text = replaced;
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer(language: &str, options: NormalizerOptions) -> MosesNormalizer {
        MosesNormalizer::new(language, &options).unwrap()
    }

    #[test]
    fn test_documents() {
        let moses = normalizer("en", NormalizerOptions::default());
        let cases = [
            (
                "The United States in 1805 (color map)                 _Facing_     193",
                "The United States in 1805 (color map) _Facing_ 193",
            ),
            (
                "=Formation of the Constitution.=--(1) The plans before the convention,",
                "=Formation of the Constitution.=-- (1) The plans before the convention,",
            ),
            (
                "directions--(1) The infective element must be eliminated. When the ulcer",
                "directions-- (1) The infective element must be eliminated. When the ulcer",
            ),
            ("College of Surgeons, Edinburgh.)]", "College of Surgeons, Edinburgh.) ]"),
        ];
        for (input, expected) in cases {
            assert_eq!(moses.normalize(input), expected);
        }
    }

    #[test]
    fn test_quote_comma() {
        let text = "THIS EBOOK IS OTHERWISE PROVIDED TO YOU \"AS-IS\".";
        let with = normalizer("en", NormalizerOptions::default());
        assert_eq!(
            with.normalize(text),
            "THIS EBOOK IS OTHERWISE PROVIDED TO YOU \"AS-IS.\""
        );

        let without = normalizer(
            "en",
            NormalizerOptions {
                norm_quote_commas: false,
                ..NormalizerOptions::default()
            },
        );
        assert_eq!(without.normalize(text), text);
    }

    #[test]
    fn test_german_quote_comma() {
        let moses = normalizer("de", NormalizerOptions::default());
        assert_eq!(moses.normalize("Er sagte „Hallo“, dann ging er."), "Er sagte \"Hallo\", dann ging er.");
        assert_eq!(moses.normalize("„Ja,“ sagte er"), "\"Ja\", sagte er");
    }

    #[test]
    fn test_numbers() {
        let en = normalizer("en", NormalizerOptions::default());
        assert_eq!(en.normalize("12\u{00A0}123"), "12.123");

        let de = normalizer("de", NormalizerOptions::default());
        assert_eq!(de.normalize("12\u{00A0}123"), "12,123");

        let off = normalizer(
            "en",
            NormalizerOptions {
                norm_numbers: false,
                ..NormalizerOptions::default()
            },
        );
        assert_eq!(off.normalize("12 123"), "12 123");
    }

    #[test]
    fn test_single_apostrophe() {
        let moses = normalizer("en", NormalizerOptions::default());
        assert_eq!(moses.normalize("yesterday ’s reception"), "yesterday 's reception");
    }

    #[test]
    fn test_unicode_punct_and_control_chars() {
        let moses = normalizer(
            "en",
            NormalizerOptions {
                pre_replace_unicode_punct: true,
                post_remove_control_chars: true,
                ..NormalizerOptions::default()
            },
        );
        assert_eq!(
            moses.normalize("０《１２３》      ４５６％  '' 【７８９】"),
            "0\"123\" 456% \" [789]"
        );
        assert_eq!(moses.normalize("tab\u{0007}bell"), "tabbell");
    }

    #[test]
    fn test_perl_parity() {
        let moses = normalizer(
            "en",
            NormalizerOptions {
                perl_parity: true,
                ..NormalizerOptions::default()
            },
        );
        let text = "from the ‘bad bank’, Northern, wala\u{00A0}«\u{00A0}dox ci jawwu Les «\u{00A0}wagonways\u{00A0}»\u{00A0}étaient construits";
        assert_eq!(
            moses.normalize(text),
            "from the 'bad bank,\" Northern, wala \"dox ci jawwu Les \"wagonways\" étaient construits"
        );
    }
}
