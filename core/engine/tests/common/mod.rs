// tests/common/mod.rs
// 集成测试共用：在临时目录里生成一个最小的 Marian 模型目录（词表 + 空 onnx 文件）

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use nmt_engine::config_manager::TranslatorConfig;
use nmt_engine::LanguagePair;

pub const UNK: i64 = 0;
pub const PAD: i64 = 1;
pub const EOS: i64 = 2;

/// 翻译测试使用的词表：hello world -> hallo welt
pub const TOKENS: [&str; 7] = ["<unk>", "<pad>", "</s>", "▁hello", "▁world", "▁hallo", "▁welt"];
pub const HALLO: i64 = 5;
pub const WELT: i64 = 6;

pub fn en_de() -> LanguagePair {
    LanguagePair::from_codes("en", "de").unwrap()
}

pub fn en_fr() -> LanguagePair {
    LanguagePair::from_codes("en", "fr").unwrap()
}

/// beam 数和步数都调小，让测试跑得快
pub fn small_config() -> TranslatorConfig {
    TranslatorConfig {
        beam_count: 2,
        max_sequence_length: 8,
        ..TranslatorConfig::default()
    }
}

fn vocab_json(tokens: &[&str]) -> String {
    let entries: Vec<String> = tokens
        .iter()
        .enumerate()
        .map(|(id, token)| format!("{}: {id}", serde_json::to_string(token).unwrap()))
        .collect();
    format!("{{{}}}", entries.join(", "))
}

/// 写出模型目录并返回其路径
pub fn write_model_dir(root: &Path, source: &str, target: &str, tokens: &[&str]) -> PathBuf {
    let dir = root.join(format!("marian-{source}-{target}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("vocab.json"), vocab_json(tokens)).unwrap();
    fs::write(
        dir.join("tokenizer_config.json"),
        r#"{"unk_token": "<unk>", "eos_token": "</s>", "pad_token": "<pad>"}"#,
    )
    .unwrap();
    fs::write(dir.join("encoder_model.onnx"), b"onnx").unwrap();
    fs::write(dir.join("decoder_model_merged.onnx"), b"onnx").unwrap();

    let metadata = serde_json::json!({
        "base_model": format!("Helsinki-NLP/opus-mt-{source}-{target}"),
        "source_language": source,
        "target_language": target,
        "architectures": ["MarianMTModel"],
        "version": 1,
        "files": {
            "tokenizer": {
                "config": "tokenizer_config.json",
                "source_vocabulary": "vocab.json"
            },
            "inference": {
                "encoder": "encoder_model.onnx",
                "decoder": "decoder_model_merged.onnx"
            }
        }
    });
    fs::write(dir.join("metadata.json"), metadata.to_string()).unwrap();
    dir
}
