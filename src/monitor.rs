use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::time;

use crate::config::{Config, Cooldowns, Polling};
use crate::crafty::{CraftyClient, CraftyError, ServerStats};
use crate::proxy::ProxyManager;
use crate::server::{Server, Tuning};
use crate::state::{ServerState, State};
use crate::webhook::WebhookNotifier;

/// Controller facts reduced for the decision logic.
#[derive(Debug, Copy, Clone)]
struct Observed {
    running: bool,
    crashed: bool,
    online: u32,
    int_ping_ok: bool,
}

impl From<&ServerStats> for Observed {
    fn from(stats: &ServerStats) -> Self {
        Self {
            running: stats.running,
            crashed: stats.crashed,
            online: stats.online,
            // The controller reports its reachability probe as the
            // literal string "True".
            int_ping_ok: stats.int_ping_results == "True",
        }
    }
}

/// Follow-up the poll step asks the monitor to perform.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Drive {
    None,

    /// The server just entered CRASHED.
    Crashed,

    /// The server sits in IDLE, evaluate the idle shutdown.
    IdleCheck,
}

/// Apply one stats observation to the state machine.
///
/// Rows are evaluated top to bottom, the first match wins.
fn drive(sm: &mut ServerState, obs: Observed, start_timeout: Duration, now: Instant) -> Drive {
    if obs.crashed {
        if sm.transition(State::Crashed, now) {
            return Drive::Crashed;
        }
        return Drive::None;
    }

    if !obs.running {
        if sm.state() == State::Starting {
            let timed_out = sm
                .last_start_at()
                .map(|at| now.saturating_duration_since(at) > start_timeout)
                .unwrap_or(false);
            if timed_out {
                error!(
                    target: "craftnap::monitor",
                    "Start timed out after {}s, giving up",
                    start_timeout.as_secs()
                );
                sm.transition(State::Stopped, now);
            }
            // else: still starting, keep waiting.
            return Drive::None;
        }

        if !matches!(sm.state(), State::Stopped | State::Crashed) {
            sm.transition(State::Stopped, now);
        }
        return Drive::None;
    }

    // The server is running.
    if sm.state() == State::Starting {
        // Only truly ready once the controller-side ping succeeds.
        if obs.int_ping_ok {
            sm.transition(State::Online, now);
        }
        return Drive::None;
    }

    if matches!(
        sm.state(),
        State::Stopped | State::Crashed | State::Unknown
    ) {
        // Came up, possibly started externally.
        if obs.online > 0 {
            sm.transition(State::Online, now);
        } else {
            sm.transition(State::Idle, now);
        }
        return Drive::None;
    }

    if sm.state() == State::Stopping {
        // We asked it to stop and it is still up, keep waiting.
        return Drive::None;
    }

    if obs.online > 0 {
        if sm.state() != State::Online {
            sm.transition(State::Online, now);
        }
        return Drive::None;
    }

    if sm.state() == State::Online {
        sm.transition(State::Idle, now);
        return Drive::None;
    }

    if sm.state() == State::Idle {
        return Drive::IdleCheck;
    }

    Drive::None
}

/// Outcome of the ordered idle-shutdown checks.
#[derive(Debug, Clone, Eq, PartialEq)]
enum IdleVerdict {
    StartGrace { remaining: Duration },
    StopCooldown { remaining: Duration },
    FlapBackoff,
    NotYet { elapsed: Duration, remaining: Duration },
    Stop { idle: Duration },
}

fn idle_verdict(
    sm: &ServerState,
    idle_timeout: Duration,
    cooldowns: &Cooldowns,
    now: Instant,
) -> IdleVerdict {
    if sm.in_start_grace(cooldowns, now) {
        return IdleVerdict::StartGrace {
            remaining: sm.start_grace_remaining(cooldowns, now),
        };
    }
    if sm.in_stop_cooldown(cooldowns, now) {
        return IdleVerdict::StopCooldown {
            remaining: sm.stop_cooldown_remaining(cooldowns, now),
        };
    }
    if sm.in_flap_backoff(cooldowns, now) {
        return IdleVerdict::FlapBackoff;
    }
    let elapsed = sm.idle_elapsed(now);
    if !sm.idle_timeout_reached(idle_timeout, now) {
        return IdleVerdict::NotYet {
            elapsed,
            remaining: idle_timeout.saturating_sub(elapsed),
        };
    }
    IdleVerdict::Stop { idle: elapsed }
}

/// The polling orchestrator.
///
/// Ticks on the poll interval, reconciles observed controller stats
/// with each server's state machine, then hands over to the proxy
/// manager. Also owns config reload.
pub struct Monitor {
    servers: Vec<Arc<Server>>,
    crafty: CraftyClient,
    proxy: Arc<ProxyManager>,
    webhook: Option<Arc<WebhookNotifier>>,
    polling: Polling,
    cooldowns: Cooldowns,
    config_path: PathBuf,
    consecutive_failures: u32,
    auth_lockout: bool,
}

impl Monitor {
    pub fn new(
        servers: Vec<Arc<Server>>,
        crafty: CraftyClient,
        proxy: Arc<ProxyManager>,
        webhook: Option<Arc<WebhookNotifier>>,
        polling: Polling,
        cooldowns: Cooldowns,
        config_path: PathBuf,
    ) -> Self {
        Self {
            servers,
            crafty,
            proxy,
            webhook,
            polling,
            cooldowns,
            config_path,
            consecutive_failures: 0,
            auth_lockout: false,
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, reload: Arc<Notify>) {
        info!(
            target: "craftnap::monitor",
            "Idle monitor started (poll every {}s)",
            self.polling.interval_seconds
        );

        // Initial state discovery.
        self.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = reload.notified() => self.apply_reload().await,
                _ = time::sleep(self.polling.interval()) => self.tick().await,
            }
        }

        info!(target: "craftnap::monitor", "Idle monitor stopped");
    }

    async fn tick(&mut self) {
        self.poll_all().await;
        self.proxy.reconcile().await;
    }

    /// Poll stats for every managed server and process transitions.
    async fn poll_all(&mut self) {
        if self.auth_lockout {
            return;
        }

        for server in self.servers.clone() {
            match self.poll_one(&server).await {
                Ok(()) => self.consecutive_failures = 0,
                Err(err) if err.is_transport() => {
                    self.consecutive_failures += 1;
                    warn!(
                        target: "craftnap::monitor",
                        "Crafty API unreachable (attempt {}/{}): {}",
                        self.consecutive_failures,
                        self.polling.api_max_retries,
                        err
                    );
                    if self.consecutive_failures >= self.polling.api_max_retries {
                        error!(
                            target: "craftnap::monitor",
                            "Crafty API unreachable after {} attempts, holding current state and retrying",
                            self.consecutive_failures
                        );
                    }
                    time::sleep(self.polling.api_retry_delay()).await;
                }
                Err(err) if err.is_auth_denied() => {
                    error!(
                        target: "craftnap::monitor",
                        "Crafty API returned 403 for server '{}', the token may be invalid. \
                         Skipping all API calls until reload or restart.",
                        server.name()
                    );
                    self.auth_lockout = true;
                    return;
                }
                Err(err) => {
                    error!(
                        target: "craftnap::monitor",
                        "Crafty API error for server '{}': {}",
                        server.name(),
                        err
                    );
                }
            }
        }
    }

    /// Fetch stats for a single server and drive its state machine.
    async fn poll_one(&self, server: &Arc<Server>) -> Result<(), CraftyError> {
        let stats = self.crafty.get_stats(server.crafty_server_id()).await?;
        let now = Instant::now();
        let tuning = server.tuning().await;
        let obs = Observed::from(&stats);

        let mut sm = server.state().lock().await;
        sm.update_stats_cache(stats.online, stats.max, &stats.version, stats.icon());

        debug!(
            target: "craftnap::monitor",
            "Poll '{}': state={} running={} online={} crashed={} int_ping={}",
            server.name(),
            sm.state().as_str(),
            obs.running,
            obs.online,
            obs.crashed,
            obs.int_ping_ok
        );

        match drive(&mut sm, obs, tuning.start_timeout, now) {
            Drive::None => {}
            Drive::Crashed => {
                drop(sm);
                if let Some(webhook) = &self.webhook {
                    webhook.notify_crashed(server.name());
                }
            }
            Drive::IdleCheck => {
                self.check_idle_shutdown(server, sm, tuning.idle_timeout, now)
                    .await;
            }
        }

        Ok(())
    }

    /// Evaluate whether an idle server should be shut down.
    async fn check_idle_shutdown(
        &self,
        server: &Arc<Server>,
        mut sm: tokio::sync::MutexGuard<'_, ServerState>,
        idle_timeout: Duration,
        now: Instant,
    ) {
        let name = server.name();
        match idle_verdict(&sm, idle_timeout, &self.cooldowns, now) {
            IdleVerdict::StartGrace { remaining } => {
                info!(
                    target: "craftnap::monitor",
                    "Server '{}': in start-grace period ({}s remaining), idle check paused",
                    name,
                    remaining.as_secs()
                );
            }
            IdleVerdict::StopCooldown { remaining } => {
                info!(
                    target: "craftnap::monitor",
                    "Server '{}': in stop-cooldown ({}s remaining), idle check paused",
                    name,
                    remaining.as_secs()
                );
            }
            IdleVerdict::FlapBackoff => {
                warn!(
                    target: "craftnap::monitor",
                    "Server '{}': flap guard active, too many start/stop cycles in the last \
                     {} minutes. Waiting {} minutes before the next stop.",
                    name,
                    self.cooldowns.flap_window_minutes,
                    self.cooldowns.flap_backoff_minutes
                );
            }
            IdleVerdict::NotYet { elapsed, remaining } => {
                info!(
                    target: "craftnap::monitor",
                    "Server '{}': idle for {}s/{}s, shutdown in {}s",
                    name,
                    elapsed.as_secs(),
                    idle_timeout.as_secs(),
                    remaining.as_secs()
                );
            }
            IdleVerdict::Stop { idle } => {
                info!(
                    target: "craftnap::monitor",
                    "Server '{}' (port {}): idle for {}s, triggering shutdown",
                    name,
                    server.addr().port(),
                    idle.as_secs()
                );
                sm.transition(State::Stopping, now);
                drop(sm);

                match self.crafty.stop(server.crafty_server_id()).await {
                    Ok(_) => {
                        if let Some(webhook) = &self.webhook {
                            webhook.notify_stopped(name, idle);
                        }
                    }
                    Err(err) => {
                        error!(
                            target: "craftnap::monitor",
                            "Failed to stop server '{}' via Crafty API: {}",
                            name,
                            err
                        );
                        // The next poll sees running=true and re-evaluates.
                        server.state().lock().await.abort_stop();
                    }
                }
            }
        }
    }

    /// Re-read the configuration and apply the reloadable values.
    ///
    /// A parse failure or a changed server set keeps the current
    /// config. A successful reload also clears the 403 lockout.
    async fn apply_reload(&mut self) {
        info!(
            target: "craftnap::monitor",
            "Reloading configuration from {}",
            self.config_path.display()
        );

        let config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                error!(
                    target: "craftnap::monitor",
                    "Config reload failed, keeping current config: {}",
                    err
                );
                return;
            }
        };

        let current: BTreeSet<&str> = self.servers.iter().map(|s| s.name()).collect();
        let incoming: BTreeSet<&str> = config.servers.keys().map(String::as_str).collect();
        if current != incoming {
            error!(
                target: "craftnap::monitor",
                "Config reload rejected: the server set changed, adding or removing servers \
                 requires a restart"
            );
            return;
        }

        for server in &self.servers {
            let cfg = &config.servers[server.name()];
            server.set_tuning(Tuning::from(cfg)).await;
            info!(
                target: "craftnap::monitor",
                "Server '{}': tuning updated (idle={}m, motd='{}')",
                server.name(),
                cfg.idle_timeout_minutes,
                cfg.motd_hibernating
            );
        }
        self.cooldowns = config.cooldowns;
        self.polling = config.polling;

        if self.auth_lockout {
            self.auth_lockout = false;
            self.consecutive_failures = 0;
            info!(target: "craftnap::monitor", "Auth lockout cleared by reload");
        }

        info!(target: "craftnap::monitor", "Configuration reloaded");
    }
}
