use serde::{Deserialize, Serialize};

/// 词表中的 token id（与 ONNX 的 int64 输入保持一致）
pub type TokenId = i64;

/// 分词器的编码结果
///
/// `ids` 与 `attention_mask` 等长；`attention_mask[i] == 1` 表示真实位置，0 表示填充。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedInput {
    pub ids: Vec<TokenId>,
    pub attention_mask: Vec<i64>,
}

impl EncodedInput {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 非填充位置的数量
    pub fn real_len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }
}
