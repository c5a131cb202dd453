//! Connection manager: role-driven connects, queue draining on writable,
//! inbound reassembly and reconnect after transport loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::peer::{self, Attach, Capabilities, Peer, PeerChange, PeerObserver, PeerRegistry};
use crate::queue::{self, InboundBuffer};
use crate::scheduler::jitter;
use crate::transport::{SessionEvents, SessionId, Transport};

/// Reconnect fires 50-100% of this after a session closed.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Dialled when a peer's LOCATION carries no port.
pub const DEFAULT_PEER_PORT: u16 = 7862;

/// Result of [`Connections::send`]. Success means queued, not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    UnknownTarget,
    SendFailed,
}

/// Listener for complete inbound messages.
pub trait MessageObserver: Send + Sync {
    fn message_received(&self, identity: &str, payload: &[u8]);
}

struct Session {
    identity: String,
    inbound: InboundBuffer,
}

pub struct Connections {
    me: Weak<Connections>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    roles: AtomicU8,
    default_port: AtomicU16,
    reconnect_delay: Duration,
    stopped: AtomicBool,
    sessions: Mutex<HashMap<SessionId, Session>>,
    observers: RwLock<Vec<Arc<dyn MessageObserver>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connections {
    pub fn new(
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
        runtime: Handle,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry,
            transport,
            runtime,
            roles: AtomicU8::new(Capabilities::GENERIC.bits()),
            default_port: AtomicU16::new(DEFAULT_PEER_PORT),
            reconnect_delay,
            stopped: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn roles(&self) -> Capabilities {
        Capabilities::from_bits(self.roles.load(Ordering::Acquire))
    }

    pub fn set_roles(&self, roles: Capabilities) {
        self.roles.store(roles.bits(), Ordering::Release);
    }

    /// Port used for peers that announce none; 0 leaves them unconnected.
    pub fn set_default_port(&self, port: u16) {
        self.default_port.store(port, Ordering::Relaxed);
    }

    pub fn register(&self, observer: Arc<dyn MessageObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Queue `payload` for one peer, or for every known peer when `target` is `None`.
    pub fn send(&self, target: Option<&str>, payload: &[u8]) -> SendStatus {
        if self.is_stopped() || payload.is_empty() || queue::is_flush_marker(payload) {
            return SendStatus::SendFailed;
        }
        let peers = match target {
            Some(identity) => match self.registry.get(identity) {
                Some(p) => vec![p],
                None => return SendStatus::UnknownTarget,
            },
            None => self.registry.all(),
        };
        if peers.is_empty() {
            return SendStatus::UnknownTarget;
        }
        for peer in peers {
            peer.queue().push(payload.to_vec());
            if let Some(session) = peer.session() {
                self.transport.request_writable(session);
            }
        }
        SendStatus::Success
    }

    /// Open an outbound session unless one exists or is in flight.
    pub fn connect(&self, peer: &Peer) {
        if self.is_stopped() {
            return;
        }
        // Held across connect so the outcome cannot overtake the pending mark;
        // transports never call back synchronously.
        let mut state = peer.state();
        if state.session.is_some() || state.pending.is_some() {
            return;
        }
        let Some(host) = state.host.clone() else {
            return;
        };
        let port = match state.port {
            0 => self.default_port.load(Ordering::Relaxed),
            port => port,
        };
        if port == 0 {
            return;
        }
        match self.transport.connect(peer.identity(), &host, port) {
            Ok(session) => {
                tracing::debug!(identity = peer.identity(), %host, port, %session, "connecting");
                state.pending = Some(session);
            }
            Err(e) => {
                tracing::warn!(identity = peer.identity(), %host, "connect failed: {}", e);
            }
        }
    }

    /// Connect to every known peer the current roles want and that has no session.
    pub fn connect_wanted(&self) {
        let roles = self.roles();
        for peer in self.registry.all() {
            if peer::wants_connection(roles, peer.capabilities()) {
                self.connect(&peer);
            }
        }
    }

    fn schedule_reconnect(&self, identity: String) {
        if self.is_stopped() {
            return;
        }
        let me = self.me.clone();
        let delay = jitter(self.reconnect_delay);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = me.upgrade() else {
                return;
            };
            // It may have come back through the remote side in the meantime.
            if let Some(peer) = this.registry.get(&identity) {
                tracing::debug!(%identity, "reconnecting");
                this.connect(&peer);
            }
        });
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Stop connecting, abort timers and close every session.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let sessions: Vec<SessionId> = self.sessions().drain().map(|(s, _)| s).collect();
        for session in sessions {
            self.transport.close(session);
        }
        for peer in self.registry.all() {
            let mut state = peer.state();
            if let Some(pending) = state.pending.take() {
                self.transport.close(pending);
            }
            state.session = None;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }
}

impl SessionEvents for Connections {
    fn on_established(&self, session: SessionId, identity: &str, host: &str, outbound: bool) -> bool {
        if self.is_stopped() {
            return false;
        }
        let peer = if outbound {
            let Some(peer) = self.registry.get(identity) else {
                return false;
            };
            let mut state = peer.state();
            if state.pending != Some(session) || state.session.is_some() {
                return false;
            }
            state.pending = None;
            state.session = Some(session);
            drop(state);
            peer
        } else {
            match self.registry.attach_inbound(identity, host, session) {
                Attach::Attached(peer) => peer,
                Attach::Refused => {
                    tracing::debug!(identity, %session, "inbound session refused");
                    return false;
                }
            }
        };
        tracing::info!(identity, %host, %session, outbound, "session established");
        self.sessions().insert(
            session,
            Session {
                identity: peer.identity().to_string(),
                inbound: InboundBuffer::new(),
            },
        );
        if !peer.queue().is_empty() {
            self.transport.request_writable(session);
        }
        true
    }

    fn on_readable(&self, session: SessionId, bytes: &[u8], more: bool) {
        let complete = {
            let mut sessions = self.sessions();
            let Some(s) = sessions.get_mut(&session) else {
                return;
            };
            s.inbound
                .push(bytes, more)
                .map(|message| (s.identity.clone(), message))
        };
        let Some((identity, message)) = complete else {
            return;
        };
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for o in observers {
            o.message_received(&identity, &message);
        }
        // The application usually answers.
        self.transport.request_writable(session);
    }

    fn on_writable(&self, session: SessionId) {
        let Some(peer) = self.registry.find_by_session(session) else {
            return;
        };
        if peer.session() != Some(session) {
            return;
        }
        let (message, more) = {
            let mut queue = peer.queue();
            let message = queue.pop();
            (message, !queue.is_empty())
        };
        let Some(message) = message else {
            return;
        };
        if let Err(e) = self.transport.send(session, &message.payload) {
            tracing::warn!(identity = peer.identity(), %session, "send failed: {}", e);
            return;
        }
        if more {
            self.transport.request_writable(session);
        }
    }

    fn on_closed(&self, session: SessionId) {
        self.sessions().remove(&session);
        let Some(peer) = self.registry.find_by_session(session) else {
            return;
        };
        let was_live = {
            let mut state = peer.state();
            if state.pending == Some(session) {
                state.pending = None;
            }
            if state.session == Some(session) {
                state.session = None;
                true
            } else {
                false
            }
        };
        if !was_live {
            tracing::debug!(identity = peer.identity(), %session, "connect attempt closed");
            return;
        }
        tracing::info!(identity = peer.identity(), %session, "session closed");
        self.schedule_reconnect(peer.identity().to_string());
    }
}

impl PeerObserver for Connections {
    fn peer_changed(&self, identity: &str, change: PeerChange, capabilities: Capabilities) {
        if change != PeerChange::Added || !peer::wants_connection(self.roles(), capabilities) {
            return;
        }
        if let Some(peer) = self.registry.get(identity) {
            self.connect(&peer);
        }
    }
}
