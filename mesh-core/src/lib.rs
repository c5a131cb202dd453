//! PeerMesh engine: LAN discovery, peer registry and per-peer messaging.
//! The discovery state machine is sans-I/O (see [`scheduler`]); [`discovery`]
//! wires it to sockets and tokio tasks. Peer sessions go through a
//! host-provided [`Transport`].

pub mod command;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod peer;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod transport;
pub mod wire;

pub use connection::{Connections, MessageObserver, SendStatus};
pub use device::{DeviceEvent, DeviceHandle, DeviceTable};
pub use discovery::{Discovery, DiscoveryConfig, Hooks, NameFuture, NameResolver, Profile, StartError};
pub use peer::{wants_connection, Capabilities, PeerChange, PeerInfo, PeerObserver, PeerRegistry};
pub use scheduler::{Effect, Scheduler, Timing};
pub use transport::{SessionEvents, SessionId, Transport, TransportError};
pub use wire::DeviceHeaders;
