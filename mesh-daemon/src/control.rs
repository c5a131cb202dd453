//! Local control socket. A client sends NUL-terminated commands:
//!
//! - `INIT <id> <address> <name>`: start the mesh as a Player.
//! - `MESSAGE <id|ALL> <text>`: send `text` to one peer or to all.
//! - `SHUTDOWN`: stop the daemon.
//!
//! Peer and message events go back to the client that sent `INIT`.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use mesh_core::{
    Capabilities, Connections, Discovery, DiscoveryConfig, Hooks, MessageObserver, PeerChange,
    PeerObserver, SendStatus,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::config::Config;
use crate::http::{HttpNameResolver, Site};
use crate::tcp::TcpTransport;

const SEND_ATTEMPTS: u32 = 10;
const SEND_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init {
        identity: String,
        address: String,
        name: String,
    },
    /// `target` is `None` for `ALL`.
    Message {
        target: Option<String>,
        text: String,
    },
    Shutdown,
}

fn is_delimiter(c: char) -> bool {
    matches!(c, '\n' | '\r' | ' ' | '\0')
}

/// Split off one token after skipping leading delimiters.
fn token(input: &str) -> (&str, &str) {
    let input = input.trim_start_matches(is_delimiter);
    let end = input.find(is_delimiter).unwrap_or(input.len());
    input.split_at(end)
}

impl Command {
    pub fn parse(input: &str) -> Option<Self> {
        if let Some(rest) = input.strip_prefix("MESSAGE") {
            let (target, rest) = token(rest);
            if target.is_empty() {
                return None;
            }
            // One separator between target and text; the text is kept verbatim.
            let mut text = rest.chars();
            text.next();
            let target = (target != "ALL").then(|| target.to_string());
            return Some(Self::Message {
                target,
                text: text.as_str().to_string(),
            });
        }
        if let Some(rest) = input.strip_prefix("INIT") {
            let (identity, rest) = token(rest);
            let (address, rest) = token(rest);
            let rest = rest.trim_start_matches(is_delimiter);
            let name = rest.split(['\n', '\r', '\0']).next().unwrap_or_default();
            if identity.is_empty() {
                return None;
            }
            return Some(Self::Init {
                identity: identity.to_string(),
                address: address.to_string(),
                name: name.to_string(),
            });
        }
        if input.starts_with("SHUTDOWN") {
            return Some(Self::Shutdown);
        }
        None
    }
}

/// `<id>\nDEVICE\n<type>\n{ADD|DEL|UPD}\n!END!\n`
pub fn device_event(identity: &str, change: PeerChange, capabilities: Capabilities) -> Vec<u8> {
    let change = match change {
        PeerChange::Added => "ADD",
        PeerChange::Removed => "DEL",
        PeerChange::Updated => "UPD",
    };
    format!(
        "{}\nDEVICE\n{}\n{}\n!END!\n",
        identity,
        capabilities.bits(),
        change
    )
    .into_bytes()
}

/// `<id>\nMESSAGE\n<payload>\n!END!\n`
pub fn message_event(identity: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(identity.len() + payload.len() + 16);
    out.extend_from_slice(identity.as_bytes());
    out.extend_from_slice(b"\nMESSAGE\n");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n!END!\n");
    out
}

/// Forwards engine events to one control client.
struct ClientSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PeerObserver for ClientSink {
    fn peer_changed(&self, identity: &str, change: PeerChange, capabilities: Capabilities) {
        tracing::info!(identity, ?change, ?capabilities, "peer changed");
        let _ = self.tx.send(device_event(identity, change, capabilities));
    }
}

impl MessageObserver for ClientSink {
    fn message_received(&self, identity: &str, payload: &[u8]) {
        tracing::debug!(identity, len = payload.len(), "message received");
        let _ = self.tx.send(message_event(identity, payload));
    }
}

/// Retry while the target is unknown. Returns the attempt that worked; a
/// send that failed outright is not retried.
pub async fn send_with_retry<F, S>(mut send: F, mut sleep: impl FnMut() -> S) -> Option<u32>
where
    F: FnMut() -> SendStatus,
    S: Future<Output = ()>,
{
    for attempt in 0..SEND_ATTEMPTS {
        match send() {
            SendStatus::Success => return Some(attempt),
            SendStatus::SendFailed => return None,
            SendStatus::UnknownTarget => {}
        }
        if attempt + 1 < SEND_ATTEMPTS {
            sleep().await;
        }
    }
    None
}

struct Node {
    discovery: Discovery,
    transport: Arc<TcpTransport>,
}

/// The daemon: at most one running mesh node, driven by control clients.
pub struct Daemon {
    config: Config,
    node: Mutex<Option<Node>>,
    /// Send side of the running node, usable without holding `node`.
    connections: RwLock<Option<Arc<Connections>>>,
    stop: Notify,
}

impl Daemon {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            node: Mutex::new(None),
            connections: RwLock::new(None),
            stop: Notify::new(),
        })
    }

    /// Resolves once a client asked for `SHUTDOWN`.
    pub async fn stopped(&self) {
        self.stop.notified().await
    }

    /// Accept control clients on 127.0.0.1 until the task is dropped.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.config.control_port))
            .await
            .with_context(|| format!("bind control port {}", self.config.control_port))?;
        tracing::info!(port = self.config.control_port, "control socket listening");
        loop {
            let (stream, from) = listener.accept().await?;
            tracing::debug!(%from, "control client connected");
            let me = self.clone();
            tokio::spawn(async move { me.client(stream).await });
        }
    }

    async fn client(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = writer.write_all(&event).await {
                    tracing::warn!("control client write failed: {}", e);
                    break;
                }
            }
        });

        let mut commands = Commands::default();
        while let Some(raw) = commands.next(&mut reader).await {
            tracing::debug!("processing control command");
            match Command::parse(&raw) {
                Some(Command::Init {
                    identity,
                    address,
                    name,
                }) => {
                    if let Err(e) = self.init(&identity, &address, &name, tx.clone()).await {
                        tracing::warn!(%identity, "init failed: {:#}", e);
                    }
                }
                Some(Command::Message { target, text }) => {
                    self.message(target.as_deref(), text.as_bytes()).await;
                }
                Some(Command::Shutdown) => {
                    tracing::info!("shutdown requested");
                    self.stop.notify_one();
                    break;
                }
                None => tracing::warn!(command = %raw.trim_end(), "unknown command"),
            }
        }
        // The writer stays up for observers registered by INIT until a write fails.
        drop(writer_task);
    }

    async fn init(
        &self,
        identity: &str,
        address: &str,
        name: &str,
        events: mpsc::UnboundedSender<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let mut node = self.node.lock().await;
        if node.is_some() {
            anyhow::bail!("already initialized");
        }
        tracing::info!(%identity, %address, %name, "initializing");

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.transport_port))
            .await
            .context("bind transport port")?;
        let port = listener.local_addr()?.port();
        let transport = TcpTransport::new(identity, Handle::current());

        let interface = if address.is_empty() {
            self.config.interface.clone()
        } else {
            address.to_string()
        };
        let mut config = DiscoveryConfig {
            identity: identity.to_string(),
            interface,
            port,
            timing: self.config.timing.clone(),
            ..DiscoveryConfig::default()
        };
        if !name.is_empty() {
            config.friendly_name = name.to_string();
        }
        let hooks = Hooks {
            exit: Some(Box::new(|| tracing::info!("discovery exited"))),
            names: Some(Arc::new(HttpNameResolver::new()?)),
        };
        let discovery = Discovery::start(config, transport.clone(), hooks)?;

        let sink = Arc::new(ClientSink { tx: events });
        discovery.register_peer_observer(sink.clone());
        discovery.register_message_observer(sink);
        transport.serve(
            listener,
            discovery.session_events(),
            Arc::new(Site::new(discovery.profile())),
        );
        if let Some(folder) = &self.config.content_folder {
            discovery.configure(None, Some(folder.as_path()));
        }
        discovery.add_capability(Capabilities::PLAYER);

        *self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(discovery.engine().connections().clone());
        *node = Some(Node {
            discovery,
            transport,
        });
        Ok(())
    }

    async fn message(&self, target: Option<&str>, text: &[u8]) {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(connections) = connections else {
            tracing::warn!("message before INIT dropped");
            return;
        };
        let label = target.unwrap_or("ALL");
        let sent = send_with_retry(
            || connections.send(target, text),
            || tokio::time::sleep(SEND_RETRY_DELAY),
        )
        .await;
        match sent {
            Some(retries) => tracing::debug!(peer = label, retries, "message queued"),
            None => tracing::warn!(peer = label, "failed to send message"),
        }
    }

    /// Withdraw from the network and close every session.
    pub async fn shutdown(&self) {
        let connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connections) = connections {
            connections.shutdown();
        }
        let Some(node) = self.node.lock().await.take() else {
            return;
        };
        tracing::info!("shutting down mesh node");
        node.discovery.stop(true).await;
        node.transport.shutdown();
    }
}

/// Splits a control stream into NUL-terminated commands.
#[derive(Default)]
struct Commands {
    buf: Vec<u8>,
    eof: bool,
}

impl Commands {
    async fn next<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Option<String> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(end) = self.buf.iter().position(|&b| b == 0) {
                let raw: Vec<u8> = self.buf.drain(..=end).collect();
                return Some(String::from_utf8_lossy(&raw[..end]).into_owned());
            }
            if self.eof {
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return None;
                }
                let raw = std::mem::take(&mut self.buf);
                return Some(String::from_utf8_lossy(&raw).into_owned());
            }
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }
}
