//! Discovery context: one running instance of the mesh engine.
//!
//! [`Discovery::start`] opens the multicast sockets and spawns two tasks: the
//! receiver (inbound datagrams, 1 s poll) and the scheduler worker (due
//! commands, replies to our own searches). Everything else hangs off the
//! shared [`Engine`]: peer registry, connection manager, local profile.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connection::{Connections, MessageObserver, SendStatus, DEFAULT_PEER_PORT, RECONNECT_DELAY};
use crate::device::DeviceEvent;
use crate::peer::{Capabilities, Peer, PeerChange, PeerInfo, PeerObserver, PeerRegistry};
use crate::scheduler::{Effect, LocalDevice, Scheduler, Timing};
use crate::transport::{SessionEvents, Transport};
use crate::wire;

/// Longest the worker sleeps before re-checking the command list.
const MAX_WAIT: Duration = Duration::from_secs(1);
/// Receiver wakes at least this often to notice shutdown.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_FRIENDLY_NAME: &str = "PeerMesh Device";

pub type NameFuture = Pin<Box<dyn Future<Output = Option<String>> + Send>>;

/// Looks up the display name a peer publishes in its root descriptor.
pub trait NameResolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> NameFuture;
}

/// Called once when the scheduler worker has terminated.
pub type ExitNotifier = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct Hooks {
    pub exit: Option<ExitNotifier>,
    pub names: Option<Arc<dyn NameResolver>>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Our identity; the `uuid:` part of every USN we announce.
    pub identity: String,
    /// IPv4 address to announce and listen on. Empty picks the default route's address.
    pub interface: String,
    /// Transport port advertised in descriptor URLs.
    pub port: u16,
    pub discovery_port: u16,
    pub friendly_name: String,
    /// `<os>/<release>` part of the server banner.
    pub os: String,
    pub timing: Timing,
    pub reconnect_delay: Duration,
    /// Dialled for peers whose LOCATION has no port; 0 skips them.
    pub default_peer_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            interface: String::new(),
            port: 0,
            discovery_port: wire::DISCOVERY_PORT,
            friendly_name: DEFAULT_FRIENDLY_NAME.to_string(),
            os: os_name(),
            timing: Timing::default(),
            reconnect_delay: RECONNECT_DELAY,
            default_peer_port: DEFAULT_PEER_PORT,
        }
    }
}

/// `linux/6.1.0`, falling back to the bare OS name.
pub fn os_name() -> String {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if release.is_empty() {
        std::env::consts::OS.to_string()
    } else {
        format!("{}/{}", std::env::consts::OS, release)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("discovery must be started inside a tokio runtime")]
    NoRuntime,
    #[error("discovery socket: {0}")]
    Socket(#[from] io::Error),
}

/// What this process publishes about itself in descriptor documents.
#[derive(Debug)]
pub struct Profile {
    identity: String,
    address: Ipv4Addr,
    port: u16,
    friendly_name: RwLock<String>,
    content_folder: RwLock<Option<PathBuf>>,
}

impl Profile {
    pub fn new(identity: &str, address: Ipv4Addr, port: u16, friendly_name: &str) -> Self {
        Self {
            identity: identity.to_string(),
            address,
            port,
            friendly_name: RwLock::new(friendly_name.to_string()),
            content_folder: RwLock::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn friendly_name(&self) -> String {
        self.friendly_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn content_folder(&self) -> Option<PathBuf> {
        self.content_folder
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_friendly_name(&self, name: &str) {
        *self.friendly_name.write().unwrap_or_else(|e| e.into_inner()) = name.to_string();
    }

    fn set_content_folder(&self, folder: &Path) {
        *self.content_folder.write().unwrap_or_else(|e| e.into_inner()) = Some(folder.to_path_buf());
    }
}

/// Address to announce: the configured one, else the source address the
/// kernel would use towards the multicast group, else loopback.
pub fn resolve_interface(interface: &str) -> Ipv4Addr {
    if let Ok(addr) = interface.trim().parse::<Ipv4Addr>() {
        return addr;
    }
    if !interface.trim().is_empty() {
        tracing::warn!(interface, "interface is not an IPv4 address, using the default route");
    }
    let probe = || -> io::Result<Ipv4Addr> {
        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((wire::MULTICAST_ADDR, wire::DISCOVERY_PORT))?;
        match socket.local_addr()? {
            SocketAddr::V4(a) if !a.ip().is_unspecified() => Ok(*a.ip()),
            _ => Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no local address")),
        }
    };
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

fn receive_socket(interface: Ipv4Addr, port: u16) -> io::Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&wire::MULTICAST_ADDR, &interface)?;
    if !interface.is_loopback() {
        // Local processes announce over loopback too.
        if let Err(e) = socket.join_multicast_v4(&wire::MULTICAST_ADDR, &Ipv4Addr::LOCALHOST) {
            tracing::debug!("loopback multicast join failed: {}", e);
        }
    }
    Ok(socket.into())
}

fn transmit_socket(interface: Ipv4Addr) -> io::Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((interface, 0)).into())?;
    socket.set_multicast_if_v4(&interface)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket.into())
}

/// Shared state of one discovery instance, independent of sockets.
pub struct Engine {
    scheduler: Scheduler,
    registry: Arc<PeerRegistry>,
    connections: Arc<Connections>,
    profile: Arc<Profile>,
    resolver: Option<Arc<dyn NameResolver>>,
    name_tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
    wake: Notify,
    exit: Mutex<Option<ExitNotifier>>,
}

impl Engine {
    pub fn new(
        config: &DiscoveryConfig,
        address: Ipv4Addr,
        transport: Arc<dyn Transport>,
        hooks: Hooks,
        runtime: Handle,
    ) -> Arc<Self> {
        let local = LocalDevice {
            identity: config.identity.clone(),
            host: address.to_string(),
            port: config.port,
            server: wire::server_banner(&config.os),
        };
        let registry = Arc::new(PeerRegistry::new(config.identity.clone()));
        let connections = Connections::new(
            registry.clone(),
            transport,
            runtime.clone(),
            config.reconnect_delay,
        );
        connections.set_default_port(config.default_peer_port);
        registry.register(connections.clone());
        Arc::new(Self {
            scheduler: Scheduler::new(local, config.timing.clone()),
            registry,
            connections,
            profile: Arc::new(Profile::new(
                &config.identity,
                address,
                config.port,
                &config.friendly_name,
            )),
            resolver: hooks.names,
            name_tasks: Mutex::new(Vec::new()),
            runtime,
            wake: Notify::new(),
            exit: Mutex::new(hooks.exit),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    /// Feed a device table event to the peer layer.
    pub fn device_event(&self, event: &DeviceEvent) {
        if let Some((peer, change)) = self.registry.apply(event) {
            if change != PeerChange::Removed {
                self.request_name(&peer);
            }
        }
    }

    fn request_name(&self, peer: &Peer) {
        let Some(resolver) = self.resolver.clone() else {
            return;
        };
        let (host, port) = {
            let mut state = peer.state();
            if state.name.is_some() || state.name_requested {
                return;
            }
            let Some(host) = state.host.clone() else {
                return;
            };
            state.name_requested = true;
            (host, state.port)
        };
        let registry = self.registry.clone();
        let identity = peer.identity().to_string();
        let task = self.runtime.spawn(async move {
            match resolver.resolve(&host, port).await {
                Some(name) => {
                    tracing::debug!(%identity, %name, "peer name resolved");
                    registry.set_name(&identity, &name);
                }
                None => tracing::debug!(%identity, %host, port, "no peer name"),
            }
        });
        let mut tasks = self.name_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn capabilities(&self) -> Capabilities {
        self.connections.roles()
    }

    /// Start announcing the given roles and connect to peers they now want.
    /// Controllers are not announced.
    pub fn add_capability(&self, capabilities: Capabilities, now: Instant) {
        let mut roles = self.connections.roles();
        let local = self.scheduler.local().clone();
        for role in capabilities.roles() {
            if roles.contains(role) {
                continue;
            }
            roles |= role;
            let kind = match role {
                Capabilities::PLAYER => "Player",
                Capabilities::SERVER => "Server",
                _ => continue,
            };
            let Some(urn) = role.urn() else {
                continue;
            };
            self.scheduler.add_service(
                urn,
                &local.usn(urn),
                &local.server,
                &local.location(kind),
                now,
            );
        }
        self.connections.set_roles(roles);
        self.connections.connect_wanted();
        self.wake.notify_one();
        tracing::info!(?roles, "capabilities added");
    }

    pub fn remove_capability(&self, capabilities: Capabilities, now: Instant) {
        let mut roles = self.connections.roles();
        for role in capabilities.roles() {
            if let Some(urn) = role.urn() {
                self.scheduler.remove_service(urn, now);
            }
            roles.remove(role);
        }
        self.connections.set_roles(roles);
        self.wake.notify_one();
        tracing::info!(?roles, "capabilities removed");
    }

    /// Update the published profile; any change re-announces the root device.
    pub fn configure(&self, friendly_name: Option<&str>, content_folder: Option<&Path>, now: Instant) {
        if let Some(name) = friendly_name {
            self.profile.set_friendly_name(name);
        }
        if let Some(folder) = content_folder {
            self.profile.set_content_folder(folder);
        }
        if friendly_name.is_some() || content_folder.is_some() {
            self.scheduler.announce_root(now);
            self.wake.notify_one();
        }
    }

    /// Withdraw everything, close sessions and schedule the worker's exit.
    pub fn begin_shutdown(&self, now: Instant) {
        for service_type in self.scheduler.service_types() {
            self.scheduler.remove_service(&service_type, now);
        }
        self.scheduler.withdraw_root(now);
        self.scheduler.schedule_shutdown(now);
        self.connections.shutdown();
        for task in self
            .name_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.wake.notify_one();
    }

    fn finish(&self) {
        self.registry.clear_observers();
        self.registry.clear();
        let exit = self.exit.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(exit) = exit {
            exit();
        }
    }
}

struct Sockets {
    transmit: UdpSocket,
    group: SocketAddr,
}

impl Sockets {
    async fn send(&self, bytes: Vec<u8>, to: SocketAddr) {
        let bytes = wire::truncate(bytes);
        if let Err(e) = self.transmit.send_to(&bytes, to).await {
            tracing::warn!(%to, "discovery send failed: {}", e);
        }
    }
}

/// Carry out scheduler effects. Returns `true` on exit.
async fn perform(engine: &Engine, sockets: &Sockets, effects: Vec<Effect>) -> bool {
    let mut exit = false;
    for effect in effects {
        match effect {
            Effect::Multicast(bytes) => sockets.send(bytes, sockets.group).await,
            Effect::Unicast(bytes, to) => sockets.send(bytes, to).await,
            Effect::Device(event) => engine.device_event(&event),
            Effect::Exit => exit = true,
        }
    }
    exit
}

async fn worker_loop(engine: Arc<Engine>, sockets: Arc<Sockets>) {
    let mut buf = vec![0u8; wire::RECV_BUFFER_LEN];
    loop {
        let effects = engine.scheduler.poll(Instant::now());
        if perform(&engine, &sockets, effects).await {
            break;
        }
        let wait = engine
            .scheduler
            .next_due()
            .map_or(MAX_WAIT, |due| {
                due.saturating_duration_since(Instant::now()).min(MAX_WAIT)
            });
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = engine.wake.notified() => {}
            received = sockets.transmit.recv_from(&mut buf) => match received {
                // Replies to our searches arrive here, framed so the parser can tell them apart.
                Ok((n, from)) => {
                    let mut framed = Vec::with_capacity(wire::REPLY_PREFIX.len() + n);
                    framed.extend_from_slice(wire::REPLY_PREFIX);
                    framed.extend_from_slice(&buf[..n]);
                    let (_, effects) = engine.scheduler.handle_datagram(&framed, from, Instant::now());
                    perform(&engine, &sockets, effects).await;
                }
                Err(e) => tracing::debug!("search reply receive failed: {}", e),
            },
        }
    }
    tracing::info!("discovery worker stopped");
    engine.finish();
}

async fn receive_loop(engine: Arc<Engine>, sockets: Arc<Sockets>, socket: UdpSocket) {
    let mut buf = vec![0u8; wire::RECV_BUFFER_LEN];
    while !engine.scheduler.is_stopped() {
        match tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok((n, from))) => {
                let (_, effects) = engine.scheduler.handle_datagram(&buf[..n], from, Instant::now());
                perform(&engine, &sockets, effects).await;
            }
            Ok(Err(e)) => {
                tracing::warn!("discovery receive failed: {}", e);
                tokio::time::sleep(RECV_TIMEOUT).await;
            }
        }
    }
}

/// A running discovery instance.
pub struct Discovery {
    engine: Arc<Engine>,
    worker: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl Discovery {
    /// Open sockets and start announcing the root device and searching.
    /// Must be called from within a tokio runtime. Nothing keeps running on error.
    pub fn start(
        config: DiscoveryConfig,
        transport: Arc<dyn Transport>,
        hooks: Hooks,
    ) -> Result<Self, StartError> {
        if config.identity.trim().is_empty() {
            return Err(StartError::EmptyIdentity);
        }
        let runtime = Handle::try_current().map_err(|_| StartError::NoRuntime)?;
        let address = resolve_interface(&config.interface);

        let receive = UdpSocket::from_std(receive_socket(address, config.discovery_port)?)?;
        let transmit = UdpSocket::from_std(transmit_socket(address)?)?;
        let sockets = Arc::new(Sockets {
            transmit,
            group: SocketAddr::from((wire::MULTICAST_ADDR, config.discovery_port)),
        });

        let engine = Engine::new(&config, address, transport, hooks, runtime.clone());
        engine.scheduler.start(Instant::now());
        let worker = runtime.spawn(worker_loop(engine.clone(), sockets.clone()));
        let receiver = runtime.spawn(receive_loop(engine.clone(), sockets, receive));
        tracing::info!(identity = %config.identity, %address, port = config.port, "discovery started");
        Ok(Self {
            engine,
            worker,
            receiver,
        })
    }

    /// Withdraw and shut down. With `wait`, returns once the worker has sent
    /// the pending withdrawals and exited.
    pub async fn stop(self, wait: bool) {
        self.engine.begin_shutdown(Instant::now());
        if wait {
            if let Err(e) = self.worker.await {
                tracing::warn!("discovery worker ended abnormally: {}", e);
            }
            self.receiver.abort();
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn add_capability(&self, capabilities: Capabilities) {
        self.engine.add_capability(capabilities, Instant::now());
    }

    pub fn remove_capability(&self, capabilities: Capabilities) {
        self.engine.remove_capability(capabilities, Instant::now());
    }

    pub fn configure(&self, friendly_name: Option<&str>, content_folder: Option<&Path>) {
        self.engine
            .configure(friendly_name, content_folder, Instant::now());
    }

    pub fn send(&self, target: Option<&str>, payload: &[u8]) -> SendStatus {
        self.engine.connections.send(target, payload)
    }

    pub fn register_peer_observer(&self, observer: Arc<dyn PeerObserver>) {
        self.engine.registry.register(observer);
    }

    pub fn register_message_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.engine.connections.register(observer);
    }

    /// Sink for the transport's session events.
    pub fn session_events(&self) -> Arc<dyn SessionEvents> {
        self.engine.connections.clone()
    }

    pub fn profile(&self) -> Arc<Profile> {
        self.engine.profile.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.engine.capabilities()
    }

    pub fn device_list(&self, filter: Capabilities) -> Vec<PeerInfo> {
        self.engine.registry.list(filter)
    }

    /// Generic when unknown.
    pub fn device_type(&self, identity: &str) -> Capabilities {
        self.engine
            .registry
            .info(identity)
            .map(|i| i.capabilities)
            .unwrap_or_default()
    }

    pub fn device_url(&self, identity: &str) -> Option<String> {
        self.engine.registry.info(identity).and_then(|i| i.host)
    }

    /// 0 when unknown.
    pub fn device_port(&self, identity: &str) -> u16 {
        self.engine
            .registry
            .info(identity)
            .map(|i| i.port)
            .unwrap_or(0)
    }

    pub fn device_name(&self, identity: &str) -> Option<String> {
        self.engine.registry.info(identity).and_then(|i| i.name)
    }
}
