//! Seam to the session transport. The engine never opens sockets for peer
//! traffic itself: a host-provided [`Transport`] does, and reports session
//! lifecycle back through [`SessionEvents`].

use std::fmt;

/// Opaque handle of one live transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown or closed {0}")]
    UnknownSession(SessionId),
    #[error("invalid peer address {0}")]
    InvalidAddress(String),
    #[error("transport is shut down")]
    Shutdown,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens sessions and moves bytes. Implementations must not call back into
/// [`SessionEvents`] from inside these methods.
pub trait Transport: Send + Sync {
    /// Begin an outbound session to `host:port`. Returns at once; the outcome
    /// arrives later as `on_established` or `on_closed`.
    fn connect(&self, identity: &str, host: &str, port: u16) -> Result<SessionId, TransportError>;

    /// Hand one complete message to the session.
    fn send(&self, session: SessionId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Ask for a future `on_writable` for this session.
    fn request_writable(&self, session: SessionId);

    fn close(&self, session: SessionId);
}

/// Session lifecycle as seen by the engine.
pub trait SessionEvents: Send + Sync {
    /// Handshake completed. `identity` is the remote's. Returning `false`
    /// refuses the session and the transport closes it.
    fn on_established(&self, session: SessionId, identity: &str, host: &str, outbound: bool) -> bool;

    /// A chunk of an inbound message; `more` is set while the message continues.
    fn on_readable(&self, session: SessionId, bytes: &[u8], more: bool);

    fn on_writable(&self, session: SessionId);

    /// The session is gone, including a connect attempt that never came up.
    fn on_closed(&self, session: SessionId);
}
