//! 翻译协调器
//!
//! 对外唯一入口。模型运行时不可重入，所有 分词 -> 编码 -> 解码 都在一把异步互斥锁内串行执行；
//! 缓存查询在锁外进行，拿到锁后再查一次，避免两个调用者重复翻译同一输入。
//! `load` 与翻译共用同一把锁：重新加载会等到正在进行的翻译（包括流式翻译）结束。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_stream::try_stream;
use futures::Stream;
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::decoder::{BeamSearchDecoder, DecoderParams};
use super::language_pair::LanguagePair;
use super::metadata::ModelFiles;
use super::runtime::ModelRuntime;
use super::tokenizer::{MarianTokenizer, TokenizerOptions};
use crate::cache_manager::{CacheLookup, CacheStats, TranslationCache};
use crate::config_manager::TranslatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::telemetry::{TelemetryDatum, TelemetrySink, TracingTelemetrySink};

/// 锁内状态：运行时与当前语言对的分词器
struct Engine<R> {
    runtime: R,
    tokenizer: Option<MarianTokenizer>,
    closed: bool,
}

impl<R: ModelRuntime> Engine<R> {
    fn parts(&mut self, language_pair: &LanguagePair) -> EngineResult<(&mut R, &MarianTokenizer)> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        match &self.tokenizer {
            Some(tokenizer) if tokenizer.language_pair() == language_pair => {
                Ok((&mut self.runtime, tokenizer))
            }
            _ => Err(EngineError::NotLoaded(language_pair.to_string())),
        }
    }

    /// 单段文本的完整流程，返回译文与解码步数
    async fn translate_one(
        &mut self,
        text: &str,
        language_pair: &LanguagePair,
        config: &TranslatorConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<(String, usize)> {
        let (runtime, tokenizer) = self.parts(language_pair)?;
        let encoded = tokenizer.encode(&tokenizer.normalize(text), false)?;
        let encoder_output = runtime.encode(&encoded)?;

        let params = DecoderParams::from_config(config, tokenizer.pad_id(), tokenizer.eos_id());
        let mut decoder = BeamSearchDecoder::new(runtime, encoder_output, params, cancel.clone())?;
        loop {
            // 每步之前让出调度，cancel() 与调用方的超时在步与步之间生效
            tokio::task::yield_now().await;
            if decoder.advance()?.is_none() {
                break;
            }
        }

        let steps = decoder.steps();
        Ok((tokenizer.decode(&decoder.best().sequence, true), steps))
    }
}

pub struct Translator<R: ModelRuntime> {
    config: TranslatorConfig,
    engine: tokio::sync::Mutex<Engine<R>>,
    cache: Mutex<TranslationCache>,
    cancel: Mutex<CancellationToken>,
    telemetry: Arc<dyn TelemetrySink>,
    unassigned: Regex,
}

impl<R: ModelRuntime> Translator<R> {
    /// 创建协调器，运行时此时可以尚未加载模型
    pub fn new(runtime: R, config: TranslatorConfig) -> EngineResult<Self> {
        config.validate()?;
        let unassigned = Regex::new(r"\p{Cn}")
            .map_err(|e| EngineError::Config(format!("failed to build sanitizer: {e}")))?;
        Ok(Self {
            cache: Mutex::new(TranslationCache::new(config.effective_cache_size())),
            config,
            engine: tokio::sync::Mutex::new(Engine {
                runtime,
                tokenizer: None,
                closed: false,
            }),
            cancel: Mutex::new(CancellationToken::new()),
            telemetry: Arc::new(TracingTelemetrySink),
            unassigned,
        })
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// 去掉未分配的码位
    pub fn sanitize(&self, text: &str) -> String {
        self.unassigned.replace_all(text, "").into_owned()
    }

    /// 加载语言对的分词器与模型
    ///
    /// 等待正在进行的翻译结束后执行。分词器与运行时都加载成功才会替换当前状态，
    /// 否则保留原有模型。成功后清空翻译缓存。
    pub async fn load(&self, files: &ModelFiles, language_pair: &LanguagePair) -> EngineResult<()> {
        let declared = files.language_pair()?;
        if &declared != language_pair {
            return Err(EngineError::load(format!(
                "model at {} is for {declared}, not {language_pair}",
                files.directory.display()
            )));
        }

        let mut engine = self.engine.lock().await;
        if engine.closed {
            return Err(EngineError::Closed);
        }

        let started = Instant::now();
        let tokenizer = MarianTokenizer::from_files(
            &files.tokenizer,
            language_pair.clone(),
            &TokenizerOptions::from(&self.config),
        )?;
        engine.runtime.load(&files.inference)?;
        engine.tokenizer = Some(tokenizer);
        self.cache.lock().clear();

        info!(
            language_pair = %language_pair,
            dir = %files.directory.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "translation model loaded"
        );
        Ok(())
    }

    /// 读取模型目录的 metadata.json 并加载其中声明的语言对
    pub async fn load_dir(&self, model_dir: &Path) -> EngineResult<LanguagePair> {
        let files = ModelFiles::from_dir(model_dir)?;
        let language_pair = files.language_pair()?;
        self.load(&files, &language_pair).await?;
        Ok(language_pair)
    }

    pub async fn loaded_language_pair(&self) -> Option<LanguagePair> {
        let engine = self.engine.lock().await;
        engine.tokenizer.as_ref().map(|t| t.language_pair().clone())
    }

    /// 阻塞式翻译，返回最终译文
    pub async fn translate(&self, text: &str, language_pair: &LanguagePair) -> EngineResult<String> {
        let text = self.sanitize(text);
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        if let Some(hit) = self.cached(&text, language_pair) {
            debug!(language_pair = %language_pair, "translation cache hit");
            return Ok(hit);
        }

        let mut engine = self.engine.lock().await;
        if let Some(hit) = self.cached(&text, language_pair) {
            debug!(language_pair = %language_pair, "translation cache hit after waiting");
            return Ok(hit);
        }

        let cancel = self.begin_run();
        let started = Instant::now();
        let (translation, steps) = if self.config.sentence_batching {
            self.translate_grouped(&mut engine, &text, language_pair, &cancel)
                .await?
        } else {
            engine
                .translate_one(&text, language_pair, &self.config, &cancel)
                .await
                .map_err(|e| e.with_input(&text))?
        };

        self.cache.lock().put(&text, &translation, language_pair);
        self.record(started, steps);
        Ok(translation)
    }

    /// 批量翻译，已缓存的输入直接返回，其余逐条翻译；结果与输入一一对应
    pub async fn translate_many<S: AsRef<str>>(
        &self,
        texts: &[S],
        language_pair: &LanguagePair,
    ) -> EngineResult<Vec<String>> {
        let sanitized: Vec<String> = texts.iter().map(|t| self.sanitize(t.as_ref())).collect();
        let CacheLookup { cached, missing } = self.cache.lock().get_many(&sanitized, language_pair);

        let mut done: HashMap<String, String> = cached.into_iter().collect();
        for text in missing {
            if done.contains_key(&text) {
                continue;
            }
            let translation = self.translate(&text, language_pair).await?;
            done.insert(text, translation);
        }

        Ok(sanitized
            .iter()
            .map(|t| done.get(t).cloned().unwrap_or_default())
            .collect())
    }

    /// 流式翻译：每一步解码产出一次当前最优 beam 的译文
    ///
    /// 流在整个过程中持有协调器的锁，丢弃流即释放。
    /// 只有在最优 beam 以 eos 结束时才写入缓存。
    pub fn translate_stream<'a>(
        &'a self,
        text: &str,
        language_pair: &LanguagePair,
    ) -> impl Stream<Item = EngineResult<String>> + 'a {
        let text = self.sanitize(text);
        let language_pair = language_pair.clone();

        try_stream! {
            if !text.trim().is_empty() {
                if let Some(hit) = self.cached(&text, &language_pair) {
                    yield hit;
                } else {
                    let mut guard = self.engine.lock().await;
                    if let Some(hit) = self.cached(&text, &language_pair) {
                        yield hit;
                    } else {
                        let cancel = self.begin_run();
                        let started = Instant::now();
                        let (runtime, tokenizer) = guard.parts(&language_pair)?;
                        let encoded = tokenizer.encode(&tokenizer.normalize(&text), false)?;
                        let encoder_output =
                            runtime.encode(&encoded).map_err(|e| e.with_input(&text))?;
                        let eos = tokenizer.eos_id();
                        let params = DecoderParams::from_config(&self.config, tokenizer.pad_id(), eos);
                        let mut decoder = BeamSearchDecoder::new(runtime, encoder_output, params, cancel)?;

                        loop {
                            tokio::task::yield_now().await;
                            let Some(update) = decoder.advance().map_err(|e| e.with_input(&text))? else {
                                break;
                            };
                            let partial = tokenizer.decode(&update.best.sequence, true);
                            if update.complete && update.best.is_ended(eos) {
                                self.cache.lock().put(&text, &partial, &language_pair);
                                self.record(started, update.step);
                            }
                            yield partial;
                        }
                    }
                }
            }
        }
    }

    /// 请求终止正在进行的解码，在下一步开始前生效
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
        debug!("translation cancel requested");
    }

    /// 释放运行时与分词器并清空缓存；之后的调用返回 `EngineError::Closed`
    pub async fn close(&self) {
        let mut engine = self.engine.lock().await;
        engine.runtime.close();
        engine.tokenizer = None;
        engine.closed = true;
        self.cache.lock().clear();
        info!("translator closed");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn cached(&self, text: &str, language_pair: &LanguagePair) -> Option<String> {
        self.cache.lock().get(text, language_pair)
    }

    /// 每次运行使用新的取消令牌，旧的 `cancel()` 不会影响之后的翻译
    fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    async fn translate_grouped(
        &self,
        engine: &mut Engine<R>,
        text: &str,
        language_pair: &LanguagePair,
        cancel: &CancellationToken,
    ) -> EngineResult<(String, usize)> {
        let groups = {
            let (_, tokenizer) = engine.parts(language_pair)?;
            tokenizer.split_sentences(text, self.config.sentence_group_length)
        };
        let CacheLookup { cached, missing } = self.cache.lock().get_many(&groups, language_pair);
        debug!(
            groups = groups.len(),
            cached = cached.len(),
            "translating sentence groups"
        );

        let mut done: HashMap<String, String> = cached.into_iter().collect();
        let mut steps = 0;
        for group in missing {
            if done.contains_key(&group) {
                continue;
            }
            let (translation, group_steps) = engine
                .translate_one(&group, language_pair, &self.config, cancel)
                .await
                .map_err(|e| e.with_input(&group))?;
            self.cache.lock().put(&group, &translation, language_pair);
            steps += group_steps;
            done.insert(group, translation);
        }

        let joined = groups
            .iter()
            .filter_map(|g| done.get(g).map(String::as_str))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok((joined, steps))
    }

    fn record(&self, started: Instant, steps: usize) {
        self.telemetry.record(TelemetryDatum::new(
            "nmt.translate.duration",
            started.elapsed().as_secs_f64() * 1000.0,
            "ms",
        ));
        self.telemetry
            .record(TelemetryDatum::new("nmt.translate.steps", steps as f64, "steps"));
    }
}
