use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;

use crate::bedrock;
use crate::config::Edition;
use crate::crafty::CraftyClient;
use crate::server::Server;
use crate::state::State;
use crate::status;
use crate::webhook::WebhookNotifier;

/// Attempts to acquire a port before giving up until the next reconcile.
const BIND_ATTEMPTS: u32 = 15;

/// Delay between bind attempts.
const BIND_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Pause between releasing the port and asking the controller to start,
/// so the kernel fully reclaims the socket.
const PORT_RELEASE_DELAY: Duration = Duration::from_secs(5);

/// Receive buffer for Bedrock datagrams, offline RakNet packets are
/// well under one MTU.
const DATAGRAM_BUF_SIZE: usize = 1500;

/// Wake-up request sent by an impersonator session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WakeRequest {
    pub server: String,
    pub player: Option<String>,
}

/// A running impersonator listener.
struct Listener {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Close the accepting socket and wait for in-flight handlers.
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// What reconcile should do for one server.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ListenerPlan {
    /// Backing server owns the port, leave everything alone.
    LeaveLocked,

    /// Backing server came down again, lift the lockout and rebind.
    ClearLockoutAndBind,

    /// Lift the lockout, a listener is already there.
    ClearLockout,

    Bind,
    Unbind,
    Keep,
}

/// Pure reconcile decision, the lockout always wins.
fn listener_plan(state: State, locked: bool, bound: bool) -> ListenerPlan {
    if locked {
        return if matches!(state, State::Stopped | State::Crashed) {
            if bound {
                ListenerPlan::ClearLockout
            } else {
                ListenerPlan::ClearLockoutAndBind
            }
        } else {
            ListenerPlan::LeaveLocked
        };
    }

    let needed = matches!(state, State::Stopped | State::Crashed);
    match (needed, bound) {
        (true, false) => ListenerPlan::Bind,
        (false, true) => ListenerPlan::Unbind,
        _ => ListenerPlan::Keep,
    }
}

struct Inner {
    listeners: HashMap<String, Listener>,
    start_lockout: HashSet<String>,
}

/// Owns the impersonator listeners and the start lockout.
///
/// All mutation of the listener map and the lockout set happens inside
/// manager methods. Sessions never touch them, they send a
/// [`WakeRequest`] which the manager task serializes with `reconcile()`
/// through the inner lock.
pub struct ProxyManager {
    servers: Vec<Arc<Server>>,
    crafty: CraftyClient,
    webhook: Option<Arc<WebhookNotifier>>,
    wake_tx: mpsc::Sender<WakeRequest>,
    inner: Mutex<Inner>,
}

impl ProxyManager {
    pub fn new(
        servers: Vec<Arc<Server>>,
        crafty: CraftyClient,
        webhook: Option<Arc<WebhookNotifier>>,
        wake_tx: mpsc::Sender<WakeRequest>,
    ) -> Self {
        Self {
            servers,
            crafty,
            webhook,
            wake_tx,
            inner: Mutex::new(Inner {
                listeners: HashMap::new(),
                start_lockout: HashSet::new(),
            }),
        }
    }

    /// Process wake-up requests until shutdown, then close all listeners.
    pub async fn run(
        self: Arc<Self>,
        mut wake_rx: mpsc::Receiver<WakeRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                request = wake_rx.recv() => match request {
                    Some(request) => self.handle_wake(request).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop_all().await;
        info!(target: "craftnap::proxy", "Proxy manager stopped");
    }

    /// Bring listeners in line with the current server states.
    pub async fn reconcile(&self) {
        for server in &self.servers {
            let name = server.name();
            let state = server.current_state().await;

            let plan = {
                let mut inner = self.inner.lock().await;
                let locked = inner.start_lockout.contains(name);
                let bound = inner.listeners.contains_key(name);
                let plan = listener_plan(state, locked, bound);

                if matches!(
                    plan,
                    ListenerPlan::ClearLockout | ListenerPlan::ClearLockoutAndBind
                ) {
                    inner.start_lockout.remove(name);
                    info!(
                        target: "craftnap::proxy",
                        "Start lockout cleared for '{}' (state={})",
                        name,
                        state.as_str()
                    );
                }
                plan
            };

            match plan {
                ListenerPlan::Bind | ListenerPlan::ClearLockoutAndBind => {
                    self.bind_listener(server).await;
                }
                ListenerPlan::Unbind => {
                    let listener = self.inner.lock().await.listeners.remove(name);
                    if let Some(listener) = listener {
                        listener.stop().await;
                        info!(
                            target: "craftnap::proxy",
                            "Impersonator stopped on port {} for server '{}'",
                            server.addr().port(),
                            name
                        );
                    }
                }
                _ => {}
            }
        }
    }

    /// Close every active listener and wait for their handlers.
    pub async fn stop_all(&self) {
        let listeners: Vec<_> = {
            let mut inner = self.inner.lock().await;
            inner.listeners.drain().collect()
        };
        join_all(listeners.into_iter().map(|(_, listener)| listener.stop())).await;
    }

    /// The port-handover sequence.
    ///
    /// Release the port, assert the lockout, give the kernel a moment,
    /// ask the controller to start. On failure undo the lockout and
    /// rebind so players still see the MOTD.
    async fn handle_wake(&self, request: WakeRequest) {
        let Some(server) = self
            .servers
            .iter()
            .find(|server| server.name() == request.server)
        else {
            return;
        };
        let name = server.name();

        // Sessions race, re-check that a wake is still warranted.
        let state = server.current_state().await;
        if !matches!(state, State::Stopped | State::Crashed) {
            return;
        }

        let listener = {
            let mut inner = self.inner.lock().await;
            if inner.start_lockout.contains(name) {
                // A handover is already in flight.
                return;
            }
            // Listener removal and lockout insertion are one atomic step
            // from reconcile's point of view.
            let listener = inner.listeners.remove(name);
            inner.start_lockout.insert(name.to_string());
            listener
        };

        if let Some(listener) = listener {
            listener.stop().await;
        }

        time::sleep(PORT_RELEASE_DELAY).await;

        match self.crafty.start(server.crafty_server_id()).await {
            Ok(_) => {
                server
                    .state()
                    .lock()
                    .await
                    .transition(State::Starting, Instant::now());
                info!(
                    target: "craftnap::proxy",
                    "Port {} released and start issued for '{}' (lockout active)",
                    server.addr().port(),
                    name
                );
                if let Some(webhook) = &self.webhook {
                    webhook.notify_started(name, request.player.clone());
                }
            }
            Err(err) => {
                error!(
                    target: "craftnap::proxy",
                    "Failed to start server '{}' via Crafty API: {}",
                    name,
                    err
                );
                self.inner.lock().await.start_lockout.remove(name);
                self.bind_listener(server).await;
            }
        }
    }

    /// Bind the impersonator for one server, retrying while the port is
    /// still held. Failure is logged and left for the next reconcile.
    async fn bind_listener(&self, server: &Arc<Server>) {
        let name = server.name();
        let addr = server.addr();

        for attempt in 1..=BIND_ATTEMPTS {
            let result = match server.edition() {
                Edition::Java => match TcpListener::bind(addr).await {
                    Ok(listener) => Ok(self.spawn_java(server.clone(), listener)),
                    Err(err) => Err(err),
                },
                Edition::Bedrock => match UdpSocket::bind(addr).await {
                    Ok(socket) => Ok(self.spawn_bedrock(server.clone(), socket)),
                    Err(err) => Err(err),
                },
            };

            match result {
                Ok(listener) => {
                    let mut inner = self.inner.lock().await;
                    if inner.start_lockout.contains(name) || inner.listeners.contains_key(name) {
                        // Lost a race against a handover, back off.
                        drop(inner);
                        listener.stop().await;
                        return;
                    }
                    inner.listeners.insert(name.to_string(), listener);
                    info!(
                        target: "craftnap::proxy",
                        "Impersonator listening on {} for server '{}'",
                        addr,
                        name
                    );
                    return;
                }
                Err(err) if attempt < BIND_ATTEMPTS => {
                    debug!(
                        target: "craftnap::proxy",
                        "Port {} not free yet (attempt {}): {}",
                        addr.port(),
                        attempt,
                        err
                    );
                    time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(err) => {
                    error!(
                        target: "craftnap::proxy",
                        "Cannot bind to {} for server '{}' after {} attempts: {}",
                        addr,
                        name,
                        BIND_ATTEMPTS,
                        err
                    );
                }
            }
        }
    }

    /// Accept loop for a Java impersonator.
    fn spawn_java(&self, server: Arc<Server>, listener: TcpListener) -> Listener {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let wake_tx = self.wake_tx.clone();

        let handle = tokio::spawn(async move {
            let mut sessions = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let server = server.clone();
                            let wake_tx = wake_tx.clone();
                            sessions.spawn(async move {
                                if let Err(err) =
                                    status::serve(server, stream, peer, wake_tx).await
                                {
                                    debug!(
                                        target: "craftnap::status",
                                        "Session from {} ended with error: {}",
                                        peer,
                                        err
                                    );
                                }
                            });
                        }
                        Err(err) => {
                            debug!(target: "craftnap::proxy", "Accept failed: {}", err);
                        }
                    }
                }

                // Reap finished sessions as we go.
                while sessions.try_join_next().is_some() {}
            }

            // Release the port before draining in-flight sessions.
            drop(listener);
            while sessions.join_next().await.is_some() {}
        });

        Listener {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Datagram loop for a Bedrock impersonator.
    fn spawn_bedrock(&self, server: Arc<Server>, socket: UdpSocket) -> Listener {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let wake_tx = self.wake_tx.clone();

        let handle = tokio::spawn(async move {
            let server_guid = bedrock::random_server_guid();
            let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = socket.recv_from(&mut buf) => {
                        let (len, peer) = match received {
                            Ok(received) => received,
                            Err(err) => {
                                debug!(target: "craftnap::proxy", "UDP receive failed: {}", err);
                                continue;
                            }
                        };
                        let data = &buf[..len];

                        if let Some((client_time, _)) = bedrock::parse_unconnected_ping(data) {
                            let motd = server.tuning().await.motd_hibernating;
                            let max_players = server.state().lock().await.last_max();
                            let pong = bedrock::build_unconnected_pong(
                                client_time,
                                server_guid,
                                &motd,
                                0,
                                max_players,
                                server.addr().port(),
                            );
                            let _ = socket.send_to(&pong, peer).await;
                        } else if bedrock::is_open_connection_request_1(data) {
                            info!(
                                target: "craftnap::proxy",
                                "Bedrock connection attempt on port {} from {}, triggering wake-up for '{}'",
                                server.addr().port(),
                                peer.ip(),
                                server.name()
                            );
                            let reject = bedrock::build_incompatible_protocol(server_guid);
                            let _ = socket.send_to(&reject, peer).await;

                            let state = server.current_state().await;
                            if matches!(state, State::Stopped | State::Crashed) {
                                // try_send: a full queue means a wake-up is
                                // already pending, and blocking would stall
                                // this loop against its own shutdown.
                                let _ = wake_tx.try_send(WakeRequest {
                                    server: server.name().to_string(),
                                    player: None,
                                });
                            }
                        }
                        // Anything else is silently dropped.
                    }
                }
            }

            drop(socket);
        });

        Listener {
            shutdown: shutdown_tx,
            handle,
        }
    }

    #[cfg(test)]
    async fn is_bound(&self, name: &str) -> bool {
        self.inner.lock().await.listeners.contains_key(name)
    }

    #[cfg(test)]
    async fn is_locked(&self, name: &str) -> bool {
        self.inner.lock().await.start_lockout.contains(name)
    }
}
