// src/bin/nmt_cli.rs
//
// 用法示例：
//   cargo run --features onnx --bin nmt_cli -- --model-dir models/marian-en-de "Hello world"
//   cargo run --features onnx --bin nmt_cli -- --model-dir models/marian-en-de --stream "Hello world"

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use futures::{pin_mut, StreamExt};
use tracing_subscriber::EnvFilter;

use nmt_engine::config_manager::{ConfigManager, FileConfigManager};
use nmt_engine::{OnnxRuntime, Translator};

#[derive(Debug, Parser)]
#[command(name = "nmt_cli", about = "Translate text with a local Marian ONNX model")]
struct Args {
    /// 含 metadata.json 的模型目录
    #[arg(long)]
    model_dir: PathBuf,

    /// TOML 配置文件，不存在时使用默认配置
    #[arg(long, default_value = "nmt.toml")]
    config: PathBuf,

    /// 逐步打印当前最优译文
    #[arg(long)]
    stream: bool,

    /// 待翻译文本，多个参数以空格拼接
    #[arg(required = true)]
    text: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = real_main(Args::parse()).await {
        eprintln!("nmt_cli error: {e}");
        std::process::exit(1);
    }
}

async fn real_main(args: Args) -> Result<()> {
    let config = FileConfigManager::new(&args.config).load().await?;
    let runtime = OnnxRuntime::new(config.thread_count);
    let translator = Translator::new(runtime, config)?;

    let language_pair = translator.load_dir(&args.model_dir).await?;
    let input = args.text.join(" ");

    if args.stream {
        let stream = translator.translate_stream(&input, &language_pair);
        pin_mut!(stream);
        let mut last = None;
        while let Some(partial) = stream.next().await {
            let partial = partial?;
            eprintln!("... {partial}");
            last = Some(partial);
        }
        let output = last.ok_or_else(|| anyhow!("no translation produced"))?;
        println!("{output}");
    } else {
        let output = translator.translate(&input, &language_pair).await?;
        println!("{output}");
    }

    translator.close().await;
    Ok(())
}
