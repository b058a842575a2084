pub mod cache_manager;
pub mod config_manager;
pub mod error;
pub mod nmt_incremental;
pub mod telemetry;
pub mod text_segmentation;
pub mod types;

pub use cache_manager::{CacheKey, CacheLookup, CacheStats, TranslationCache};
pub use config_manager::{ConfigManager, FileConfigManager, TranslatorConfig};
pub use error::{EngineError, EngineResult};
pub use nmt_incremental::{
    LanguageCode, LanguagePair, MarianTokenizer, ModelFiles, ModelRuntime, ScriptedRuntime, Translator,
};
#[cfg(feature = "onnx")]
pub use nmt_incremental::OnnxRuntime;
pub use telemetry::{TelemetryDatum, TelemetrySink, TracingTelemetrySink};
pub use text_segmentation::SentenceSplitter;
pub use types::{EncodedInput, TokenId};
