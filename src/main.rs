use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

mod config;
mod engine;
mod history;
mod media;
mod server;
mod utils;

use crate::engine::{DownloadEngine, SessionRegistry};
use crate::history::HistoryStore;
use crate::media::{MediaEngine, YtDlpEngine};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<String>,
}

fn get_config_path(args: &Args) -> Option<String> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }

    if let Ok(path) = std::env::var("CONFIG_FILE") {
        return Some(path);
    }

    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        let config_dir = format!("{}/fetchd", xdg_config_home);
        let config_path = format!("{}/config.toml", config_dir);
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let config_dir = format!("{}/.config/fetchd", home.display());
        let config_path = format!("{}/config.toml", config_dir);
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = get_config_path(&args) {
        crate::config::Config::from_file(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?
    } else {
        crate::config::Config::default()
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if config.get_logging_format() == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("Starting fetchd...");

    std::fs::create_dir_all(&config.downloads_dir).with_context(|| {
        format!(
            "Failed to create downloads directory {}",
            config.downloads_dir.display()
        )
    })?;

    let media = Arc::new(YtDlpEngine::new(&config.cookies_file));
    if !media.test_availability().await {
        warn!("yt-dlp or ffmpeg not found on PATH; downloads will fail");
    }

    let history = Arc::new(HistoryStore::open(config.history_file.clone())?);

    let registry = Arc::new(SessionRegistry::new(Some(config.sessions_file.clone())));
    registry.load_snapshot();

    let engine = DownloadEngine {
        registry,
        media,
        history,
        config: Arc::new(config),
    };

    server::run(engine).await
}
