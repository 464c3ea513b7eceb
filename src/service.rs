use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::{mpsc, watch, Notify};

use crate::config::Config;
use crate::crafty::CraftyClient;
use crate::health;
use crate::monitor::Monitor;
use crate::proxy::ProxyManager;
use crate::server::Server;
use crate::webhook::WebhookNotifier;

/// Buffered wake-up requests, sessions beyond this wait on the manager.
const WAKE_QUEUE: usize = 16;

/// Build all components and run until a shutdown signal arrives.
pub async fn run(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let started_at = Instant::now();

    let crafty = CraftyClient::new(
        &config.crafty.base_url,
        &config.crafty.api_token,
        config.crafty.verify_tls,
    )
    .context("failed to build Crafty API client")?;

    // Hard gate: without the controller there is nothing to manage.
    if !crafty.check_alive().await {
        anyhow::bail!("cannot reach Crafty API at {}", config.crafty.base_url);
    }
    info!(
        target: "craftnap",
        "Crafty API reachable at {}",
        config.crafty.base_url
    );

    validate_server_ids(&crafty, &config).await;

    let servers: Vec<Arc<Server>> = config
        .servers
        .iter()
        .map(|(name, cfg)| Arc::new(Server::from_config(name, cfg)))
        .collect();

    let webhook = if config.webhook.enabled {
        info!(target: "craftnap", "Webhook notifications enabled");
        Some(Arc::new(
            WebhookNotifier::new(&config.webhook.url, &config.webhook.label)
                .context("failed to build webhook client")?,
        ))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reload = Arc::new(Notify::new());
    spawn_signal_watcher(shutdown_tx, reload.clone());

    let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE);
    let proxy = Arc::new(ProxyManager::new(
        servers.clone(),
        crafty.clone(),
        webhook.clone(),
        wake_tx,
    ));
    let proxy_task = tokio::spawn(proxy.clone().run(wake_rx, shutdown_rx.clone()));

    let health_task = config.health.enabled.then(|| {
        tokio::spawn(health::run(
            servers.clone(),
            config.health.clone(),
            started_at,
            shutdown_rx.clone(),
        ))
    });

    let monitor = Monitor::new(
        servers,
        crafty,
        proxy,
        webhook,
        config.polling.clone(),
        config.cooldowns,
        config_path,
    );
    monitor.run(shutdown_rx, reload).await;

    // The monitor only returns on shutdown, wait for the rest.
    let _ = proxy_task.await;
    if let Some(health_task) = health_task {
        let _ = health_task.await;
    }

    info!(target: "craftnap", "Shutdown complete");
    Ok(())
}

/// Cross-check configured server ids against the controller.
///
/// Unknown ids are an operator mistake worth shouting about, but the
/// server stays managed, the controller may learn about it later.
async fn validate_server_ids(crafty: &CraftyClient, config: &Config) {
    match crafty.list_servers().await {
        Ok(known) => {
            let known_ids: HashSet<String> =
                known.into_iter().map(|entry| entry.server_id).collect();
            for (name, server) in &config.servers {
                if !known_ids.contains(&server.crafty_server_id) {
                    error!(
                        target: "craftnap",
                        "Server '{}': crafty_server_id '{}' not found in Crafty",
                        name,
                        server.crafty_server_id
                    );
                }
            }
        }
        Err(err) => {
            warn!(
                target: "craftnap",
                "Could not list Crafty servers for validation: {}",
                err
            );
        }
    }
}

/// Watch for shutdown and reload signals.
///
/// INT/TERM wind the service down, HUP asks the monitor to re-read the
/// configuration.
fn spawn_signal_watcher(shutdown_tx: watch::Sender<bool>, reload: Arc<Notify>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    error!(target: "craftnap", "Cannot install SIGTERM handler: {}", err);
                    return;
                }
            };
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(hup) => hup,
                Err(err) => {
                    error!(target: "craftnap", "Cannot install SIGHUP handler: {}", err);
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!(target: "craftnap", "Received interrupt, shutting down");
                        break;
                    }
                    _ = term.recv() => {
                        info!(target: "craftnap", "Received SIGTERM, shutting down");
                        break;
                    }
                    _ = hup.recv() => {
                        info!(target: "craftnap", "Received SIGHUP, scheduling config reload");
                        reload.notify_one();
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = reload;
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "craftnap", "Received interrupt, shutting down");
        }

        let _ = shutdown_tx.send(true);
    });
}
