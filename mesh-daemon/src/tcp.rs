//! TCP session transport: hello handshake, length-prefixed frames, one writer
//! task per session. The same listener answers descriptor `GET`s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use mesh_core::{SessionEvents, SessionId, Transport, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::http::{self, Site};

pub const PROTOCOL_VERSION: u8 = 1;
const HELLO_MAGIC: &[u8; 4] = b"PMSH";
const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
/// Inbound payloads are handed to the engine in pieces of at most this size.
const DELIVERY_CHUNK: usize = 4096;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Encode one payload: 4 bytes LE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`: the payload and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let end = LEN_SIZE + len as usize;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..end], end))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("not a peermesh hello")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("identity is empty or not UTF-8")]
    BadIdentity,
    #[error("handshake timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Hello: magic, version, identity length (1 byte), identity.
pub fn hello_bytes(identity: &str) -> Result<Vec<u8>, HandshakeError> {
    let len = u8::try_from(identity.len()).map_err(|_| HandshakeError::BadIdentity)?;
    if len == 0 {
        return Err(HandshakeError::BadIdentity);
    }
    let mut out = Vec::with_capacity(HELLO_MAGIC.len() + 2 + identity.len());
    out.extend_from_slice(HELLO_MAGIC);
    out.push(PROTOCOL_VERSION);
    out.push(len);
    out.extend_from_slice(identity.as_bytes());
    Ok(out)
}

/// Rest of a hello whose magic has already been consumed.
async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, HandshakeError> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(HandshakeError::Version(head[0]));
    }
    if head[1] == 0 {
        return Err(HandshakeError::BadIdentity);
    }
    let mut identity = vec![0u8; head[1] as usize];
    reader.read_exact(&mut identity).await?;
    String::from_utf8(identity).map_err(|_| HandshakeError::BadIdentity)
}

/// Accept side, after the magic was read while sniffing the stream.
async fn handshake_accept<S>(stream: &mut S, own: &str) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = read_hello(stream).await?;
    stream.write_all(&hello_bytes(own)?).await?;
    stream.flush().await?;
    Ok(remote)
}

async fn handshake_connect<S>(stream: &mut S, own: &str) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&hello_bytes(own)?).await?;
    stream.flush().await?;
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    if &magic != HELLO_MAGIC {
        return Err(HandshakeError::BadMagic);
    }
    read_hello(stream).await
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, HandshakeError>>,
) -> Result<T, HandshakeError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

enum Outgoing {
    Frame(Vec<u8>),
    Writable,
}

struct SessionHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
    closing: Arc<Notify>,
}

pub struct TcpTransport {
    me: Weak<TcpTransport>,
    identity: String,
    runtime: Handle,
    next_id: AtomicU64,
    closed: AtomicBool,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    events: OnceLock<Arc<dyn SessionEvents>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(identity: &str, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            identity: identity.to_string(),
            runtime,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            events: OnceLock::new(),
            acceptor: Mutex::new(None),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> Option<Arc<dyn SessionEvents>> {
        self.events.get().cloned()
    }

    /// Register a session slot before any I/O so sends and writable requests
    /// made right after `on_established` are never lost.
    fn open_slot(&self) -> (SessionId, mpsc::UnboundedReceiver<Outgoing>, Arc<Notify>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = Arc::new(Notify::new());
        self.sessions().insert(
            id,
            SessionHandle {
                tx,
                closing: closing.clone(),
            },
        );
        (id, rx, closing)
    }

    /// Start accepting on `listener`, reporting sessions to `events` and
    /// answering HTTP requests from `site`.
    pub fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        events: Arc<dyn SessionEvents>,
        site: Arc<Site>,
    ) {
        if self.events.set(events).is_err() {
            tracing::warn!("transport already serving");
            return;
        }
        let me = self.clone();
        let task = self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        let me = me.clone();
                        let site = site.clone();
                        tokio::spawn(async move { me.accepted(stream, from, site).await });
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        *self.acceptor.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    async fn accepted(self: Arc<Self>, mut stream: TcpStream, from: SocketAddr, site: Arc<Site>) {
        let mut magic = [0u8; 4];
        if let Err(e) = with_timeout(async {
            stream.read_exact(&mut magic).await?;
            Ok::<_, HandshakeError>(())
        })
        .await
        {
            tracing::debug!(%from, "dropped connection: {}", e);
            return;
        }
        if &magic == b"GET " || &magic == b"HEAD" {
            if let Err(e) = http::serve_request(&mut stream, &magic, &site).await {
                tracing::debug!(%from, "http request failed: {}", e);
            }
            return;
        }
        if &magic != HELLO_MAGIC {
            tracing::debug!(%from, "unknown protocol");
            return;
        }
        let remote = match with_timeout(handshake_accept(&mut stream, &self.identity)).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(%from, "inbound handshake failed: {}", e);
                return;
            }
        };
        let Some(events) = self.events() else {
            return;
        };
        let (id, rx, closing) = self.open_slot();
        let host = from.ip().to_string();
        if !events.on_established(id, &remote, &host, false) {
            self.sessions().remove(&id);
            events.on_closed(id);
            return;
        }
        self.run_session(stream, id, events, rx, closing).await;
    }

    async fn outbound(
        self: Arc<Self>,
        id: SessionId,
        host: String,
        port: u16,
        rx: mpsc::UnboundedReceiver<Outgoing>,
        closing: Arc<Notify>,
    ) {
        let Some(events) = self.events() else {
            self.sessions().remove(&id);
            return;
        };
        let connected = with_timeout(async {
            let mut stream = TcpStream::connect((host.as_str(), port)).await?;
            let remote = handshake_connect(&mut stream, &self.identity).await?;
            Ok::<_, HandshakeError>((stream, remote))
        })
        .await;
        let (stream, remote) = match connected {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(%host, port, %id, "connect failed: {}", e);
                self.sessions().remove(&id);
                events.on_closed(id);
                return;
            }
        };
        if !events.on_established(id, &remote, &host, true) {
            self.sessions().remove(&id);
            events.on_closed(id);
            return;
        }
        self.run_session(stream, id, events, rx, closing).await;
    }

    async fn run_session(
        &self,
        stream: TcpStream,
        id: SessionId,
        events: Arc<dyn SessionEvents>,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
        closing: Arc<Notify>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let writer_events = events.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outgoing::Frame(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            tracing::debug!(%id, "write failed: {}", e);
                            break;
                        }
                    }
                    Outgoing::Writable => writer_events.on_writable(id),
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; 8192];
        'read: loop {
            loop {
                match decode_frame(&buf) {
                    Ok((payload, used)) => {
                        deliver(events.as_ref(), id, payload);
                        buf.drain(..used);
                    }
                    Err(FrameDecodeError::NeedMore) => break,
                    Err(FrameDecodeError::TooLarge) => {
                        tracing::warn!(%id, "peer sent an oversized frame");
                        break 'read;
                    }
                }
            }
            let n = tokio::select! {
                r = reader.read(&mut chunk) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = closing.notified() => break,
            };
            buf.extend_from_slice(&chunk[..n]);
        }

        self.sessions().remove(&id);
        writer_task.abort();
        events.on_closed(id);
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.acceptor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        for (_, handle) in self.sessions().drain() {
            handle.closing.notify_one();
        }
    }
}

fn deliver(events: &dyn SessionEvents, id: SessionId, payload: &[u8]) {
    if payload.is_empty() {
        events.on_readable(id, payload, false);
        return;
    }
    let mut pieces = payload.chunks(DELIVERY_CHUNK).peekable();
    while let Some(piece) = pieces.next() {
        events.on_readable(id, piece, pieces.peek().is_some());
    }
}

impl Transport for TcpTransport {
    fn connect(&self, identity: &str, host: &str, port: u16) -> Result<SessionId, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        if host.is_empty() || port == 0 {
            return Err(TransportError::InvalidAddress(format!("{}:{}", host, port)));
        }
        let Some(me) = self.me.upgrade().filter(|_| self.events.get().is_some()) else {
            return Err(TransportError::Shutdown);
        };
        let (id, rx, closing) = self.open_slot();
        tracing::debug!(identity, %host, port, %id, "connecting");
        self.runtime
            .spawn(me.outbound(id, host.to_string(), port, rx, closing));
        Ok(id)
    }

    fn send(&self, session: SessionId, bytes: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(bytes).map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let sessions = self.sessions();
        let handle = sessions
            .get(&session)
            .ok_or(TransportError::UnknownSession(session))?;
        handle
            .tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| TransportError::UnknownSession(session))
    }

    fn request_writable(&self, session: SessionId) {
        if let Some(handle) = self.sessions().get(&session) {
            let _ = handle.tx.send(Outgoing::Writable);
        }
    }

    fn close(&self, session: SessionId) {
        if let Some(handle) = self.sessions().remove(&session) {
            handle.closing.notify_one();
        }
    }
}
