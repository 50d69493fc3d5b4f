//! The broker server: accept loop, session registry, and broadcast dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::broadcast::{Audience, BroadcastEvent};
use crate::manager::MarketManager;
use crate::protocol::{Message, Role};
use crate::session;

/// Backpressure point for the shared broadcast queue.
const BROADCAST_QUEUE_CAPACITY: usize = 1024;

/// Best-effort deadline for draining the broadcast queue on shutdown.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// One registered session's audience-routing handle: its declared role, the bounded
/// outbound queue feeding its dedicated writer task, and its last-heartbeat timestamp —
/// bumped on every message the session sends, not just explicit heartbeats, so a future
/// idle-disconnect policy has something to read even though none is wired up yet.
pub struct SessionHandle {
    pub role: Role,
    pub tx: mpsc::Sender<Message>,
    last_heartbeat_ms: AtomicU64,
}

impl SessionHandle {
    pub fn new(role: Role, tx: mpsc::Sender<Message>) -> Self {
        Self { role, tx, last_heartbeat_ms: AtomicU64::new(now_millis()) }
    }

    /// Bumps this session's last-heartbeat timestamp to now.
    pub fn touch(&self) {
        self.last_heartbeat_ms.store(now_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the Unix epoch at which this session last produced a message.
    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The session registry: a concurrent map keyed by client-id, exclusively owned by the
/// server.
pub type Registry = Arc<Mutex<HashMap<String, SessionHandle>>>;

/// Listens for new connections, spawns a Session per connection, and routes broadcast
/// notifications to the appropriate subset of registered sessions.
pub struct BrokerServer {
    manager: Arc<MarketManager>,
    registry: Registry,
    broadcast_tx: mpsc::Sender<BroadcastEvent>,
    broadcast_rx: mpsc::Receiver<BroadcastEvent>,
}

impl BrokerServer {
    /// The broadcast channel a `BrokerServer` is built from. Created ahead of the
    /// `MarketManager` so the same sender can be handed to both the manager's sweeper
    /// (which emits events into it) and the server (which dispatches them).
    pub fn channel() -> (mpsc::Sender<BroadcastEvent>, mpsc::Receiver<BroadcastEvent>) {
        mpsc::channel(BROADCAST_QUEUE_CAPACITY)
    }

    pub fn new(
        manager: Arc<MarketManager>,
        broadcast_tx: mpsc::Sender<BroadcastEvent>,
        broadcast_rx: mpsc::Receiver<BroadcastEvent>,
    ) -> Self {
        Self {
            manager,
            registry: Arc::new(Mutex::new(HashMap::new())),
            broadcast_tx,
            broadcast_rx,
        }
    }

    /// Accepts connections on `listener` until `shutdown` resolves, then stops accepting,
    /// drains the broadcast queue with a deadline, and closes the session registry —
    /// idempotent by construction since each step only touches state this call already
    /// owns.
    pub async fn run(
        mut self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "broker listening");

        let dispatcher = tokio::spawn(run_dispatcher(self.registry.clone(), self.broadcast_rx));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(%peer, "accepted connection");
                            tokio::spawn(session::run(
                                stream,
                                self.manager.clone(),
                                self.registry.clone(),
                                self.broadcast_tx.clone(),
                            ));
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested; no longer accepting connections");
                    break;
                }
            }
        }

        drop(self.broadcast_tx);
        if tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE, dispatcher)
            .await
            .is_err()
        {
            warn!("broadcast queue did not drain before the shutdown deadline");
        }
        self.registry.lock().await.clear();
        info!("broker shut down");
        Ok(())
    }
}

/// Consumes the broadcast queue for the server's lifetime. One event becomes one framed
/// message per recipient in `event.audience()`. A recipient whose outbound queue is full
/// or closed is reaped rather than allowed to stall the dispatcher; other deliveries
/// proceed regardless.
async fn run_dispatcher(registry: Registry, mut rx: mpsc::Receiver<BroadcastEvent>) {
    while let Some(event) = rx.recv().await {
        let message = event.to_message();
        let audience = event.audience();
        let target = event.target_client_id().map(str::to_string);
        let excluded = event.excluded_client_id().map(str::to_string);

        let mut dead = Vec::new();
        {
            let sessions = registry.lock().await;
            for (client_id, handle) in sessions.iter() {
                let wants_it = match audience {
                    // The originating session already has its own direct reply queued;
                    // it doesn't also need a copy of the broadcast that reply triggered.
                    Audience::Everyone => excluded.as_deref() != Some(client_id.as_str()),
                    Audience::Buyers => handle.role == Role::Buyer,
                    Audience::Seller => target.as_deref() == Some(client_id.as_str()),
                };
                if !wants_it {
                    continue;
                }
                if handle.tx.try_send(message.clone()).is_err() {
                    dead.push(client_id.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut sessions = registry.lock().await;
            for client_id in dead {
                warn!(client_id, "reaping session with a stalled or closed outbound queue");
                sessions.remove(&client_id);
            }
        }
    }
}
