//! Animus - Entry Point
//!
//! Interactive console driver: lines from stdin become input signals, the
//! entity's messages print to stdout. `quit` or EOF shuts down cleanly.

use animus::{OpenAiCompatClient, Orchestrator, ProviderConfig, SystemParams};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let params = SystemParams::from_env()?;

    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| params.log_level.clone())
        .to_lowercase();
    let log_level = match log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Animus v{}", env!("CARGO_PKG_VERSION"));

    let provider_config = ProviderConfig::from_env()?;
    let provider = Arc::new(OpenAiCompatClient::from_config(&provider_config));

    // Optional personality bootstrap
    let personality = std::env::var("ANIMUS_PERSONALITY_FILE")
        .ok()
        .and_then(|path| std::fs::read_to_string(path).ok());

    let entity = Arc::new(Orchestrator::new(
        provider,
        params,
        personality.as_deref(),
    )?);

    entity.on_output(|text| println!("\u{25c6} {text}"));

    entity.start().await;
    println!("Animus is awake ({}). Type a message, or 'quit' to exit.", provider_config.model);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await? {
            None => break,
            Some(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" || line == "exit" {
                    break;
                }
                entity.input_signal(line, "user");
            }
        }
    }

    entity.stop().await;
    Ok(())
}
