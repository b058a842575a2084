//! Marian 翻译推理流水线
//!
//! 分词（Moses 规范化 + 子词切分）-> 编码器 -> 带 KV cache 的 beam search 解码 -> 反分词，
//! 由 [`Translator`] 串联并加上缓存、流式输出与取消。

pub mod beam_search;
pub mod decoder;
pub mod kv_cache;
pub mod language_pair;
pub mod metadata;
pub mod normalizer;
#[cfg(feature = "onnx")]
pub mod onnx_runtime;
pub mod runtime;
pub mod scripted_runtime;
pub mod subword;
pub mod tokenizer;
pub mod translation;
pub mod vocabulary;

pub use beam_search::{softmax, Beam, BeamSearch, BeamSearchParams};
pub use decoder::{BeamSearchDecoder, DecoderParams, DecoderState, StepUpdate};
pub use kv_cache::{KvCache, KvCacheEntry};
pub use language_pair::{LanguageCode, LanguagePair};
pub use metadata::{InferenceFiles, ModelFiles, ModelMetadata, TokenizerFiles};
pub use normalizer::{MosesNormalizer, NormalizerOptions};
#[cfg(feature = "onnx")]
pub use onnx_runtime::{DecoderGeometry, OnnxRuntime};
pub use runtime::{BeamEncoderInput, DecoderStepOutput, EncoderOutput, ModelRuntime};
pub use scripted_runtime::{RuntimeEvent, RuntimeStats, ScriptedRuntime};
pub use subword::SubwordModel;
pub use tokenizer::{MarianTokenizer, TokenizerOptions};
pub use translation::Translator;
pub use vocabulary::{SpecialTokens, Vocabulary};
