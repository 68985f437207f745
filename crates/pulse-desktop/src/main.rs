//! # pulse-desktop
//!
//! Desktop inspector binary: loads settings, starts the Pulse server and
//! writes every routed message and session transition to stdout as one
//! JSON object per line.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_server::{BridgeEvent, ChannelBridge, PulseServer, ServerConfig};
use pulse_settings::PulseSettings;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;

/// Pulse desktop inspector.
#[derive(Parser, Debug)]
#[command(name = "pulse-desktop", about = "Pulse desktop inspector")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.pulse/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level filter, e.g. `debug` (overrides settings; `RUST_LOG` wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Forget disconnected devices idle for this many seconds. 0 disables.
    #[arg(long, default_value = "3600")]
    evict_idle_secs: u64,
}

impl Cli {
    fn load_settings(&self) -> Result<PulseSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(pulse_settings::settings_path);
        let mut settings = pulse_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

/// Encode one bridge event as a JSON line.
fn json_line(event: &BridgeEvent) -> Option<String> {
    serde_json::to_string(event).ok().map(|mut s| {
        s.push('\n');
        s
    })
}

async fn write_events(mut rx: UnboundedReceiver<BridgeEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        let Some(line) = json_line(&event) else {
            continue;
        };
        if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            tracing::warn!("stdout closed, no longer forwarding events");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    pulse_core::logging::init_subscriber(&settings.logging.level);

    let (bridge, events) = ChannelBridge::new();
    let writer = tokio::spawn(write_events(events));

    let server = PulseServer::new(ServerConfig::from(&settings.server), Arc::new(bridge));
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Pulse desktop listening on ws://{addr}");

    let evictor = (cli.evict_idle_secs > 0).then(|| {
        let sessions = server.sessions().clone();
        let max_idle = Duration::from_secs(cli.evict_idle_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle.min(Duration::from_secs(60)));
            loop {
                let _ = ticker.tick().await;
                let _ = sessions.evict_idle(max_idle);
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if let Some(evictor) = evictor {
        evictor.abort();
    }
    let _ = server.shutdown().graceful_shutdown(vec![handle], None).await;
    drop(server);
    writer.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}
