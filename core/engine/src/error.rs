use thiserror::Error;

/// 引擎错误分类
///
/// 调用方只需要区分三类：加载错误、分词错误、推理错误。
/// 其余变体描述协调器自身的状态（未加载、已取消、已关闭）。
#[derive(Debug, Error)]
pub enum EngineError {
    /// 模型目录、词表、元数据或推理文件无法加载
    #[error("failed to load model: {0}")]
    Load(String),

    /// 分词失败，携带出错的原文
    #[error("failed to tokenize {text:?}: {reason}")]
    Tokenization { text: String, reason: String },

    /// 编码器或解码器执行失败
    #[error("inference failed for {input:?}: {reason}")]
    Inference { input: String, reason: String },

    /// 请求的语言对没有加载模型
    #[error("no model loaded for language pair {0}")]
    NotLoaded(String),

    #[error("translation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("translator has been closed")]
    Closed,
}

impl EngineError {
    pub fn load(reason: impl Into<String>) -> Self {
        Self::Load(reason.into())
    }

    pub fn tokenization(text: &str, reason: impl Into<String>) -> Self {
        Self::Tokenization {
            text: text.to_string(),
            reason: reason.into(),
        }
    }

    /// 运行时看不到原文，先留空，由协调器通过 `with_input` 补上
    pub fn inference(reason: impl Into<String>) -> Self {
        Self::Inference {
            input: String::new(),
            reason: reason.into(),
        }
    }

    /// 给推理错误补上出错的输入文本，其他变体原样返回
    pub fn with_input(self, text: &str) -> Self {
        match self {
            Self::Inference { reason, .. } => Self::Inference {
                input: text.to_string(),
                reason,
            },
            other => other,
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(self, Self::Load(_))
    }

    pub fn is_tokenization(&self) -> bool {
        matches!(self, Self::Tokenization { .. })
    }

    pub fn is_inference(&self) -> bool {
        matches!(self, Self::Inference { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
