//! # vmfleet Daemon
//!
//! Runs the state engine against the configured hypervisor endpoints:
//! connects autoconnect endpoints, logs lifecycle events and periodic
//! statistics, reloads the configuration on SIGHUP and shuts down cleanly
//! on Ctrl-C / SIGTERM.
//!
//! ## Usage
//! ```bash
//! vmfleetd --config /etc/vmfleet/vmfleetd.yaml
//! vmfleetd --dev --log-level debug
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use vmfleet_common::{init_logging, LogFormat};
use vmfleet_engine::Engine;
use vmfleet_hypervisor::{Connector, MockBackend, MockCluster};

mod cli;
mod config;

use cli::Args;
use config::{Backend, Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format: LogFormat = args.log_format.parse()?;
    init_logging(&args.log_level, format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vmfleet daemon");

    let (config, config_path) = load_config(&args)?;
    config
        .engine
        .validate()
        .context("Invalid configuration")?;

    if args.check_config {
        info!(
            endpoints = config.engine.endpoints.len(),
            backend = ?config.daemon.backend,
            "Configuration is valid"
        );
        return Ok(());
    }

    let mock = (config.daemon.backend == Backend::Mock).then(|| Arc::new(MockCluster::new()));
    let connector = build_connector(&config, mock.as_ref())?;

    let engine = Engine::new(config.engine.clone(), connector).context("Failed to create engine")?;

    let connected = engine
        .start()
        .await
        .into_iter()
        .filter(|(_, result)| result.is_ok())
        .count();
    info!(
        connected,
        configured = config.engine.endpoints.len(),
        "Endpoints started"
    );

    if config.daemon.log_events {
        spawn_event_logger(&engine);
    }

    run_until_shutdown(&engine, &args, config_path, mock).await;

    engine.shutdown().await;
    info!("vmfleet daemon stopped");
    Ok(())
}

/// Load the explicit `--config`, or the default location when present,
/// or fall back to defaults. Returns the path that was read, if any.
fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    let (config, path) = match &args.config {
        Some(config_path) => {
            let config = Config::load(config_path).map_err(|e| {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                e
            })?;
            info!(config_path = %config_path, "Configuration loaded");
            (config, Some(PathBuf::from(config_path)))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(config) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                (config, Some(PathBuf::from(DEFAULT_CONFIG_PATH)))
            }
            Err(e) => {
                info!(reason = %e, "No configuration file, using defaults");
                (Config::default(), None)
            }
        },
    };

    let config = config.with_cli_overrides(args)?.with_dev_endpoints();
    Ok((config, path))
}

fn build_connector(config: &Config, mock: Option<&Arc<MockCluster>>) -> Result<Arc<dyn Connector>> {
    if let Some(cluster) = mock {
        seed_mock_hosts(cluster, config);
        warn!("Development mode: endpoints are in-memory mock hosts");
        return Ok(cluster.clone() as Arc<dyn Connector>);
    }

    #[cfg(feature = "libvirt")]
    {
        if !vmfleet_hypervisor::libvirt::is_available() {
            warn!("libvirt client library not detected, connects will likely fail");
        }
        return Ok(Arc::new(vmfleet_hypervisor::LibvirtConnector));
    }

    #[cfg(not(feature = "libvirt"))]
    {
        anyhow::bail!("Built without the libvirt feature; run with --dev or rebuild with --features libvirt")
    }
}

/// One demo host per configured URI that has no host yet.
fn seed_mock_hosts(cluster: &MockCluster, config: &Config) {
    for endpoint in &config.engine.endpoints {
        if cluster.host(&endpoint.uri).is_none() {
            cluster.insert_host(Arc::new(MockBackend::with_demo_data(endpoint.uri.as_str())));
        }
    }
}

fn spawn_event_logger(engine: &Arc<Engine>) {
    let mut events = engine.subscribe_events(None);
    tokio::spawn(async move {
        loop {
            let event = events.recv().await;
            info!(
                endpoint = %event.endpoint,
                domain = %event.domain_uuid,
                kind = ?event.kind,
                dropped = events.dropped(),
                "Domain event"
            );
        }
    });
}

/// Block until Ctrl-C or SIGTERM, reloading on SIGHUP in between.
async fn run_until_shutdown(
    engine: &Arc<Engine>,
    args: &Args,
    config_path: Option<PathBuf>,
    mock: Option<Arc<MockCluster>>,
) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut hangup, mut terminate) = match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
            (Ok(h), Ok(t)) => (h, t),
            _ => {
                warn!("Signal handlers unavailable, waiting for Ctrl-C only");
                wait_ctrl_c().await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = wait_ctrl_c() => return,
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    return;
                }
                _ = hangup.recv() => {
                    if let Err(e) = reload(engine, args, config_path.as_deref(), mock.as_ref()).await {
                        error!(error = %e, "Reload failed, keeping the current configuration");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (engine, args, config_path, mock);
        wait_ctrl_c().await;
    }
}

async fn wait_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}

#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(
    engine: &Engine,
    args: &Args,
    path: Option<&std::path::Path>,
    mock: Option<&Arc<MockCluster>>,
) -> Result<()> {
    let path = path.context("No configuration file to reload")?;
    info!(config_path = %path.display(), "Reloading configuration");

    let config = Config::load(path)?.with_cli_overrides(args)?.with_dev_endpoints();
    if let Some(cluster) = mock {
        seed_mock_hosts(cluster, &config);
    }
    engine.reload(config.engine).await?;
    Ok(())
}
