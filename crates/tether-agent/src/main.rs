//! # tether-agent
//!
//! Tether server binary. Loads settings, registers the reference routes and
//! runs the TCP and WebSocket bindings until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tether_server::handlers;
use tether_server::{LifecycleManager, Router};
use tether_settings::TetherSettings;
use tracing::{error, info, warn};

/// Tether messaging server.
#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "Tether messaging server")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Raw TCP port (overrides settings).
    #[arg(long)]
    tcp_port: Option<u16>,

    /// WebSocket port (overrides settings).
    #[arg(long)]
    ws_port: Option<u16>,

    /// Do not start the raw TCP binding.
    #[arg(long)]
    no_tcp: bool,

    /// Do not start the WebSocket binding.
    #[arg(long)]
    no_ws: bool,

    /// Log JSON lines instead of compact text.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Flags win over the file and environment layers.
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(port) = self.tcp_port {
            settings.tcp.port = port;
        }
        if let Some(port) = self.ws_port {
            settings.websocket.port = port;
        }
        if self.no_tcp {
            settings.tcp.enabled = false;
        }
        if self.no_ws {
            settings.websocket.enabled = false;
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn load(cli: &Cli) -> Result<TetherSettings> {
    let mut settings = match &cli.settings {
        Some(path) => tether_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => tether_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    if settings.logging.json {
        tether_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        tether_core::logging::init_subscriber(&settings.logging.level);
    }

    let mut router = Router::new();
    handlers::register_all(&mut router, &settings.handlers)
        .context("Failed to register reference routes")?;
    info!(routes = ?router.route_names(), "routes registered");

    let manager = LifecycleManager::new(&settings, router);
    match manager.start_all().await {
        Ok(report) => info!(started = report.started(), "all bindings started"),
        Err(err) if err.report.started() > 0 => {
            warn!(error = %err, "continuing with the bindings that started");
        }
        Err(err) => {
            for failure in err.report.failures() {
                error!(binding = %failure.binding(), error = %failure, "binding failed");
            }
            let _ = manager.shutdown_all().await;
            bail!("no binding could be started: {err}");
        }
    }

    match manager.probe_health().await {
        Ok(text) => info!(%text, "health check passed"),
        Err(e) => warn!(error = %e, "health check failed"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("interrupt received, shutting down");

    let _ = manager.shutdown_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "tether-agent",
            "--tcp-port",
            "7100",
            "--ws-port",
            "9100",
            "--no-tcp",
            "--log-json",
        ]);
        let mut settings = TetherSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.tcp.port, 7100);
        assert_eq!(settings.websocket.port, 9100);
        assert!(!settings.tcp.enabled);
        assert!(settings.websocket.enabled);
        assert!(settings.logging.json);
    }

    #[test]
    fn no_flags_keep_settings() {
        let cli = Cli::parse_from(["tether-agent"]);
        let mut settings = TetherSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.tcp.port, 7000);
        assert_eq!(settings.websocket.port, 9000);
        assert!(!settings.logging.json);
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "tether-agent",
            "--settings",
            dir.path().join("absent.json").to_str().unwrap(),
        ]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.handlers.stream_items, 10);
    }
}
