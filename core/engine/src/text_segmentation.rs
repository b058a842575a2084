//! 句子切分模块
//!
//! 把长文本切成句子，再把相邻的短句合并成不超过指定长度的分组，供分批翻译使用。

/// 句子切分与分组
#[derive(Debug, Clone, Copy)]
pub struct SentenceSplitter {
    /// 分组的最大字符数
    group_length: usize,
}

impl SentenceSplitter {
    pub fn new(group_length: usize) -> Self {
        Self { group_length }
    }

    pub fn group_length(&self) -> usize {
        self.group_length
    }

    /// 按句末标点切分（保留标点）
    ///
    /// 规则：
    /// 1. `.` `!` `?` 后面跟空白（或文本结束）才算句末
    /// 2. `.` 后的下一个非空白字符是小写字母时视为缩写，不切
    /// 3. 全角 `。` `！` `？` 直接切分
    pub fn sentences(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return vec![];
        }

        let chars: Vec<char> = text.chars().collect();
        let mut sentences = Vec::new();
        let mut current = String::new();

        for (i, &ch) in chars.iter().enumerate() {
            current.push(ch);

            let should_split = match ch {
                '。' | '！' | '？' => true,
                '.' | '!' | '?' => {
                    let followed_by_space =
                        chars.get(i + 1).map(|c| c.is_whitespace()).unwrap_or(true);
                    let is_abbreviation = ch == '.'
                        && chars[i + 1..]
                            .iter()
                            .find(|c| !c.is_whitespace())
                            .map(|c| c.is_lowercase())
                            .unwrap_or(false);
                    followed_by_space && !is_abbreviation
                }
                _ => false,
            };

            if should_split {
                let sentence = current.trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                current.clear();
            }
        }

        let last = current.trim();
        if !last.is_empty() {
            sentences.push(last.to_string());
        }

        sentences
    }

    /// 切句后贪心合并：相邻短句拼成不超过 `group_length` 字符的分组，
    /// 超长句子单独成组
    pub fn split(&self, text: &str) -> Vec<String> {
        let mut groups = Vec::new();
        let mut current = String::new();

        for sentence in self.sentences(text) {
            let sentence_len = sentence.chars().count();
            if sentence_len > self.group_length {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
                groups.push(sentence);
                continue;
            }

            let current_len = current.chars().count();
            let joined_len = if current.is_empty() {
                sentence_len
            } else {
                current_len + 1 + sentence_len
            };
            if joined_len > self.group_length {
                groups.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&sentence);
        }

        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self { group_length: 192 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentences_simple() {
        let splitter = SentenceSplitter::default();
        let sentences = splitter.sentences("Hello, world. How are you? I'm fine!");
        assert_eq!(sentences, vec!["Hello, world.", "How are you?", "I'm fine!"]);
    }

    #[test]
    fn test_sentences_chinese() {
        let splitter = SentenceSplitter::default();
        let sentences = splitter.sentences("你好，世界。你好吗？我很好！");
        assert_eq!(sentences, vec!["你好，世界。", "你好吗？", "我很好！"]);
    }

    #[test]
    fn test_sentences_keep_decimals_and_abbreviations() {
        let splitter = SentenceSplitter::default();
        let sentences = splitter.sentences("Pi is 3.14 roughly. See e.g. the appendix. Done");
        assert_eq!(
            sentences,
            vec!["Pi is 3.14 roughly.", "See e.g. the appendix.", "Done"]
        );
    }

    #[test]
    fn test_split_groups_short_sentences() {
        let splitter = SentenceSplitter::new(20);
        let groups = splitter.split("One. Two. Three. Four five six seven.");
        assert_eq!(groups, vec!["One. Two. Three.", "Four five six seven."]);
    }

    #[test]
    fn test_split_keeps_long_sentence_alone() {
        let splitter = SentenceSplitter::new(10);
        let groups = splitter.split("Hi. This sentence is too long. Ok.");
        assert_eq!(groups, vec!["Hi.", "This sentence is too long.", "Ok."]);
    }

    #[test]
    fn test_split_empty() {
        assert!(SentenceSplitter::default().split("   ").is_empty());
    }
}
