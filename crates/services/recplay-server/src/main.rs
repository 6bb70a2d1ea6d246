//! Signaling server binary entry point
//!
//! Accepts browser WebSocket connections and brokers recording/playback
//! sessions against a Kurento media server.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: listen on 0.0.0.0:8443/recorder, media server at ws://localhost:8888/kurento
//! cargo run -p recplay-server
//!
//! # Point at another media server and recording target
//! cargo run -p recplay-server -- \
//!   --backend-url ws://kms.internal:8888/kurento \
//!   --media-uri file:///var/recordings/demo.webm
//!
//! # Load settings from a file; flags still override it
//! cargo run -p recplay-server -- --config ./recplay.toml --log-json
//! ```

use anyhow::Context;
use clap::Parser;
use recplay_signaling::{KurentoConnector, SignalingConfig, SignalingServer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Recording/playback signaling server
///
/// Brokers WebRTC sessions between browsers and a Kurento media server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, env = "RECPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address the WebSocket listener binds to
    #[arg(long, env = "RECPLAY_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Request path accepted for WebSocket upgrades
    #[arg(long, env = "RECPLAY_PATH")]
    path: Option<String>,

    /// Kurento media server JSON-RPC endpoint
    #[arg(long, env = "RECPLAY_BACKEND_URL")]
    backend_url: Option<String>,

    /// Recording target, also replayed by `play`
    #[arg(long, env = "RECPLAY_MEDIA_URI")]
    media_uri: Option<String>,

    /// Cookie carrying the browser session id
    #[arg(long, env = "RECPLAY_SESSION_COOKIE")]
    session_cookie: Option<String>,

    /// Media server keepalive interval in seconds (0 disables)
    #[arg(long, env = "RECPLAY_BACKEND_PING_INTERVAL")]
    backend_ping_interval: Option<u64>,

    /// ICE candidates buffered per session before its call is set up
    #[arg(long, env = "RECPLAY_MAX_BUFFERED_CANDIDATES")]
    max_buffered_candidates: Option<usize>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "RECPLAY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Config file (or defaults) with command line overrides applied
    fn into_config(self) -> anyhow::Result<SignalingConfig> {
        let mut config = match &self.config {
            Some(path) => SignalingConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SignalingConfig::default(),
        };

        if let Some(listen_addr) = self.listen_addr {
            config.listen_addr = listen_addr;
        }
        if let Some(path) = self.path {
            config.path = path;
        }
        if let Some(backend_url) = self.backend_url {
            config.backend_url = backend_url;
        }
        if let Some(media_uri) = self.media_uri {
            config.media_uri = media_uri;
        }
        if let Some(session_cookie) = self.session_cookie {
            config.session_cookie = session_cookie;
        }
        if let Some(interval) = self.backend_ping_interval {
            config.backend_ping_interval_secs = interval;
        }
        if let Some(limit) = self.max_buffered_candidates {
            config.max_buffered_candidates = limit;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");

        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("recplay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.log_json)?;

    let config = args.into_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %config.listen_addr,
        path = %config.path,
        backend_url = %config.backend_url,
        media_uri = %config.media_uri,
        "Recording/playback signaling server starting"
    );

    let connector = Arc::new(KurentoConnector::new(config.backend_ping_interval()));
    let server = SignalingServer::new(config, connector)?;
    let handle = server.start().await?;

    info!(
        "Server running on {}. Press Ctrl+C to shutdown.",
        handle.local_addr()
    );

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, cleaning up...");
    handle.shutdown().await;
    info!("Signaling server shut down gracefully");

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "recplay-server",
            "--backend-url",
            "ws://kms:8888/kurento",
            "--backend-ping-interval",
            "0",
            "--max-buffered-candidates",
            "16",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.backend_url, "ws://kms:8888/kurento");
        assert_eq!(config.backend_ping_interval(), None);
        assert_eq!(config.max_buffered_candidates, 16);
        assert_eq!(config.path, "/recorder");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = Args::parse_from(["recplay-server", "--path", "recorder"]);
        assert!(args.into_config().is_err());
    }
}
