use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::providers::Format;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hlsget::{DownloadConfig, TaskManager};

const DEFAULT_FILE_NAME: &str = "main.ts";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hlsget=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = env::args().skip(1);
    let url = match args.next() {
        Some(url) => url,
        None => {
            eprintln!("usage: hlsget <playlist-url> [output-path]");
            std::process::exit(2);
        }
    };
    let output_path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => env::current_dir()?.join(DEFAULT_FILE_NAME),
    };

    // Load config: defaults, then hlsget.toml, then HLSGET_ env vars
    let config: DownloadConfig = figment::Figment::new()
        .merge(figment::providers::Serialized::defaults(
            DownloadConfig::default(),
        ))
        .merge(figment::providers::Toml::file("hlsget.toml"))
        .merge(figment::providers::Env::prefixed("HLSGET_"))
        .extract()?;

    tracing::info!("Starting hlsget v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Downloading {} -> {}", url, output_path.display());

    let manager = Arc::new(TaskManager::new(config));
    manager.start();
    manager
        .add_task(&url, &output_path.to_string_lossy())
        .await?;

    let final_progress = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(progress) = manager.get_task_progress(&url) else {
            break None;
        };
        tracing::info!("[{:?}] {:.1}%", progress.status, progress.progress);
        if progress.status.is_terminal() {
            break Some(progress);
        }
    };

    manager.shutdown().await;

    if let Some(progress) = final_progress {
        for warning in &progress.warnings {
            tracing::warn!("{}", warning);
        }
        println!("{}", serde_json::to_string(&progress)?);
        if let Some(error) = &progress.error {
            anyhow::bail!("download failed: {}", error);
        }
        tracing::info!("Saved {}", output_path.display());
    }

    Ok(())
}
