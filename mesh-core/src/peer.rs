//! Peer registry: turns discovered devices into addressable peers.
//!
//! A peer is keyed by identity (case-insensitive). It is created by the first
//! discovery event or inbound session that names it, and both paths land in
//! the same record. Capabilities only ever grow until the device is removed.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::device::DeviceEvent;
use crate::queue::MessageQueue;
use crate::transport::SessionId;
use crate::wire;

/// Role bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const GENERIC: Self = Self(0);
    pub const PLAYER: Self = Self(1);
    pub const CONTROLLER: Self = Self(2);
    pub const SERVER: Self = Self(4);
    pub const ANY: Self = Self(1 | 2 | 4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ANY.0)
    }

    pub const fn is_generic(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Role named by a unique service name; generic unless it carries one of
    /// the mesh device URNs.
    pub fn from_usn(usn: &str) -> Self {
        let Some(start) = usn.find(wire::DEVICE_URN_PREFIX) else {
            return Self::GENERIC;
        };
        let tail = &usn[start..];
        if tail.contains(kind_of(wire::PLAYER_URN)) {
            Self::PLAYER
        } else if tail.contains(kind_of(wire::SERVER_URN)) {
            Self::SERVER
        } else if tail.contains(kind_of(wire::CONTROLLER_URN)) {
            Self::CONTROLLER
        } else {
            Self::GENERIC
        }
    }

    /// Device type URN for a single role.
    pub fn urn(self) -> Option<&'static str> {
        match self {
            Self::PLAYER => Some(wire::PLAYER_URN),
            Self::CONTROLLER => Some(wire::CONTROLLER_URN),
            Self::SERVER => Some(wire::SERVER_URN),
            _ => None,
        }
    }

    /// Single roles contained in this set.
    pub fn roles(self) -> impl Iterator<Item = Self> {
        [Self::PLAYER, Self::CONTROLLER, Self::SERVER]
            .into_iter()
            .filter(move |r| self.contains(*r))
    }
}

/// `urn:...:device:Player:1` -> `urn:...:device:Player`
fn kind_of(urn: &str) -> &str {
    urn.rsplit_once(':').map_or(urn, |(kind, _)| kind)
}

impl BitOr for Capabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_generic() {
            return f.write_str("Capabilities(GENERIC)");
        }
        let names: Vec<&str> = self
            .roles()
            .map(|r| match r {
                Self::PLAYER => "PLAYER",
                Self::CONTROLLER => "CONTROLLER",
                _ => "SERVER",
            })
            .collect();
        write!(f, "Capabilities({})", names.join("|"))
    }
}

/// Whether a process with roles `mine` opens a session to a peer with `theirs`.
/// No role connects to its own kind.
pub fn wants_connection(mine: Capabilities, theirs: Capabilities) -> bool {
    use Capabilities as C;
    (mine.contains(C::CONTROLLER) && theirs.intersects(C::SERVER | C::PLAYER))
        || (mine.contains(C::PLAYER) && theirs.intersects(C::SERVER | C::CONTROLLER))
        || (mine.contains(C::SERVER) && theirs.intersects(C::PLAYER | C::CONTROLLER))
}

/// Identity inside `uuid:<identity>::<urn>`.
pub fn identity_from_usn(usn: &str) -> Option<&str> {
    if usn.len() <= 7 {
        return None;
    }
    let rest = usn.strip_prefix("uuid:")?;
    let id = rest.split_once("::").map_or(rest, |(id, _)| id);
    (!id.is_empty()).then_some(id)
}

/// Host and port from a descriptor URL. Port is 0 when absent or unreadable.
pub fn split_location(location: &str) -> Option<(String, u16)> {
    let rest = match location.get(..7) {
        Some(scheme) if location.len() > 7 && scheme.eq_ignore_ascii_case("http://") => {
            &location[7..]
        }
        _ => location,
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().unwrap_or(0))),
        None => Some((authority.to_string(), 0)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    Added,
    Updated,
    Removed,
}

/// Listener for peer lifecycle. Called without any registry lock held.
pub trait PeerObserver: Send + Sync {
    fn peer_changed(&self, identity: &str, change: PeerChange, capabilities: Capabilities);
}

#[derive(Debug, Default)]
pub(crate) struct PeerState {
    pub host: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub name_requested: bool,
    pub capabilities: Capabilities,
    /// Live session.
    pub session: Option<SessionId>,
    /// Outbound connect in flight.
    pub pending: Option<SessionId>,
}

/// One remote participant.
#[derive(Debug)]
pub struct Peer {
    identity: String,
    state: Mutex<PeerState>,
    queue: Mutex<MessageQueue>,
}

impl Peer {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            state: Mutex::new(PeerState::default()),
            queue: Mutex::new(MessageQueue::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn queue(&self) -> MutexGuard<'_, MessageQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session(&self) -> Option<SessionId> {
        self.state().session
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state().capabilities
    }

    pub fn info(&self) -> PeerInfo {
        let s = self.state();
        PeerInfo {
            identity: self.identity.clone(),
            host: s.host.clone(),
            port: s.port,
            name: s.name.clone(),
            capabilities: s.capabilities,
            connected: s.session.is_some(),
        }
    }

    fn holds(&self, session: SessionId) -> bool {
        let s = self.state();
        s.session == Some(session) || s.pending == Some(session)
    }
}

/// Snapshot of a peer for queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity: String,
    pub host: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub capabilities: Capabilities,
    pub connected: bool,
}

/// Outcome of an inbound session handshake.
#[derive(Debug)]
pub enum Attach {
    Attached(Arc<Peer>),
    /// The identity already has a session, or is our own.
    Refused,
}

pub struct PeerRegistry {
    own_identity: String,
    peers: Mutex<Vec<Arc<Peer>>>,
    observers: RwLock<Vec<Arc<dyn PeerObserver>>>,
}

impl PeerRegistry {
    pub fn new(own_identity: impl Into<String>) -> Self {
        Self {
            own_identity: own_identity.into(),
            peers: Mutex::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn own_identity(&self) -> &str {
        &self.own_identity
    }

    fn peers(&self) -> MutexGuard<'_, Vec<Arc<Peer>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, observer: Arc<dyn PeerObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn clear_observers(&self) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn notify(&self, identity: &str, change: PeerChange, capabilities: Capabilities) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for o in observers {
            o.peer_changed(identity, change, capabilities);
        }
    }

    fn is_own(&self, identity: &str) -> bool {
        identity.eq_ignore_ascii_case(&self.own_identity)
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Peer>> {
        self.peers()
            .iter()
            .find(|p| p.identity.eq_ignore_ascii_case(identity))
            .cloned()
    }

    /// Peer holding `session`, live or still connecting.
    pub fn find_by_session(&self, session: SessionId) -> Option<Arc<Peer>> {
        self.peers().iter().find(|p| p.holds(session)).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers().clone()
    }

    /// Peers sharing at least one role with `filter`; `GENERIC` lists all.
    pub fn list(&self, filter: Capabilities) -> Vec<PeerInfo> {
        self.all()
            .iter()
            .map(|p| p.info())
            .filter(|i| filter.is_generic() || i.capabilities.intersects(filter))
            .collect()
    }

    pub fn info(&self, identity: &str) -> Option<PeerInfo> {
        self.get(identity).map(|p| p.info())
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }

    /// Fold one device table event into the registry and notify observers.
    /// Returns what was reported, `None` if the device is not a mesh peer.
    pub fn apply(&self, event: &DeviceEvent) -> Option<(Arc<Peer>, PeerChange)> {
        let (DeviceEvent::Updated(headers) | DeviceEvent::Removed(headers)) = event;
        let role = Capabilities::from_usn(&headers.usn);
        if role.is_generic() {
            return None;
        }
        let identity = identity_from_usn(&headers.usn)?;
        if self.is_own(identity) {
            return None;
        }

        match event {
            DeviceEvent::Updated(headers) => {
                let (peer, change, caps) = {
                    let mut peers = self.peers();
                    let peer = match peers
                        .iter()
                        .find(|p| p.identity.eq_ignore_ascii_case(identity))
                    {
                        Some(p) => p.clone(),
                        None => {
                            let p = Arc::new(Peer::new(identity));
                            peers.push(p.clone());
                            p
                        }
                    };
                    let mut state = peer.state();
                    // Generic so far means never reported.
                    let change = if state.capabilities.is_generic() {
                        PeerChange::Added
                    } else {
                        PeerChange::Updated
                    };
                    state.capabilities |= role;
                    if let Some((host, port)) = split_location(&headers.location) {
                        state.host = Some(host);
                        state.port = port;
                    }
                    let caps = state.capabilities;
                    drop(state);
                    (peer, change, caps)
                };
                tracing::debug!(identity, ?change, ?caps, "peer changed");
                self.notify(identity, change, caps);
                Some((peer, change))
            }
            DeviceEvent::Removed(_) => {
                let peer = self.get(identity)?;
                let caps = peer.capabilities();
                tracing::debug!(identity, "peer removed");
                self.notify(identity, PeerChange::Removed, caps);
                self.peers().retain(|p| !Arc::ptr_eq(p, &peer));
                peer.queue().clear();
                Some((peer, PeerChange::Removed))
            }
        }
    }

    /// Bind an inbound session to its peer, creating a generic one if needed.
    pub fn attach_inbound(&self, identity: &str, host: &str, session: SessionId) -> Attach {
        if self.is_own(identity) || identity.is_empty() {
            return Attach::Refused;
        }
        let mut peers = self.peers();
        if let Some(peer) = peers
            .iter()
            .find(|p| p.identity.eq_ignore_ascii_case(identity))
        {
            let mut state = peer.state();
            if state.session.is_some() || state.pending.is_some() {
                return Attach::Refused;
            }
            state.session = Some(session);
            if state.host.is_none() {
                state.host = Some(host.to_string());
            }
            drop(state);
            return Attach::Attached(peer.clone());
        }
        let peer = Arc::new(Peer::new(identity));
        {
            let mut state = peer.state();
            state.host = Some(host.to_string());
            state.session = Some(session);
        }
        peers.push(peer.clone());
        Attach::Attached(peer)
    }

    /// Store a display name unless one is already set. Reports `Updated`.
    pub fn set_name(&self, identity: &str, name: &str) -> bool {
        let Some(peer) = self.get(identity) else {
            return false;
        };
        let caps = {
            let mut state = peer.state();
            if state.name.is_some() {
                return false;
            }
            state.name = Some(name.to_string());
            state.capabilities
        };
        self.notify(peer.identity(), PeerChange::Updated, caps);
        true
    }

    /// Drop every peer and its queue.
    pub fn clear(&self) {
        let peers = std::mem::take(&mut *self.peers());
        for p in peers {
            p.queue().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{usn_for, DeviceHeaders, CONTROLLER_URN, PLAYER_URN, ROOT_URN, SERVER_URN};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, PeerChange, Capabilities)>>);

    impl PeerObserver for Recorder {
        fn peer_changed(&self, identity: &str, change: PeerChange, caps: Capabilities) {
            self.0.lock().unwrap().push((identity.to_string(), change, caps));
        }
    }

    fn updated(id: &str, urn: &str, location: &str) -> DeviceEvent {
        DeviceEvent::Updated(DeviceHeaders::new(urn, usn_for(id, urn), location))
    }

    fn removed(id: &str, urn: &str) -> DeviceEvent {
        DeviceEvent::Removed(DeviceHeaders::new(urn, usn_for(id, urn), ""))
    }

    fn registry() -> (PeerRegistry, Arc<Recorder>) {
        let r = PeerRegistry::new("me");
        let rec = Arc::new(Recorder::default());
        r.register(rec.clone());
        (r, rec)
    }

    #[test]
    fn role_policy() {
        use Capabilities as C;
        assert!(wants_connection(C::CONTROLLER, C::PLAYER));
        assert!(wants_connection(C::CONTROLLER, C::SERVER));
        assert!(!wants_connection(C::CONTROLLER, C::CONTROLLER));
        assert!(wants_connection(C::PLAYER, C::SERVER));
        assert!(wants_connection(C::PLAYER, C::CONTROLLER));
        assert!(!wants_connection(C::PLAYER, C::PLAYER));
        assert!(wants_connection(C::SERVER, C::PLAYER));
        assert!(!wants_connection(C::SERVER, C::SERVER));
        assert!(!wants_connection(C::GENERIC, C::ANY));
        assert!(!wants_connection(C::PLAYER, C::GENERIC));
    }

    #[test]
    fn usn_and_location_parsing() {
        assert_eq!(identity_from_usn(&usn_for("abc", PLAYER_URN)), Some("abc"));
        assert_eq!(identity_from_usn("uuid:abcdef"), Some("abcdef"));
        assert_eq!(identity_from_usn("uuid:"), None);
        assert_eq!(identity_from_usn("urn:x:y:z"), None);

        assert_eq!(
            split_location("http://10.0.0.2:7862/Player.xml"),
            Some(("10.0.0.2".into(), 7862))
        );
        assert_eq!(split_location("HTTP://host"), Some(("host".into(), 0)));
        assert_eq!(split_location("host:x"), Some(("host".into(), 0)));
        assert_eq!(split_location(""), None);

        assert_eq!(Capabilities::from_usn(&usn_for("a", SERVER_URN)), Capabilities::SERVER);
        assert!(Capabilities::from_usn(&usn_for("a", ROOT_URN)).is_generic());
        assert!(Capabilities::from_usn("uuid:a::urn:other:device:Player:1").is_generic());
    }

    #[test]
    fn discovery_adds_then_updates_and_ors_capabilities() {
        let (r, rec) = registry();
        r.apply(&updated("p", PLAYER_URN, "http://h:1/Player.xml"));
        r.apply(&updated("p", SERVER_URN, "http://h:1/Server.xml"));
        r.apply(&updated("p", PLAYER_URN, "http://h2:2/Player.xml"));

        let events = rec.0.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ("p".into(), PeerChange::Added, Capabilities::PLAYER));
        assert_eq!(events[1].1, PeerChange::Updated);
        // Never retracted by a later event naming only one role.
        assert_eq!(events[2].2, Capabilities::PLAYER | Capabilities::SERVER);

        let info = r.info("P").unwrap();
        assert_eq!(info.host.as_deref(), Some("h2"));
        assert_eq!(info.port, 2);
        assert_eq!(r.all().len(), 1);
    }

    #[test]
    fn non_mesh_and_own_devices_are_ignored() {
        let (r, rec) = registry();
        assert!(r.apply(&updated("x", ROOT_URN, "http://h:1/")).is_none());
        assert!(r
            .apply(&DeviceEvent::Updated(DeviceHeaders::new("upnp:rootdevice", "uuid:x::upnp:rootdevice", "l")))
            .is_none());
        assert!(r.apply(&updated("ME", PLAYER_URN, "http://h:1/")).is_none());
        assert!(r.is_empty());
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[test]
    fn removal_drops_peer_and_unknown_removal_is_noop() {
        let (r, rec) = registry();
        assert!(r.apply(&removed("p", PLAYER_URN)).is_none());
        r.apply(&updated("p", CONTROLLER_URN, "http://h:1/"));
        let peer = r.get("p").unwrap();
        peer.queue().push(b"x".to_vec());

        let (_, change) = r.apply(&removed("p", CONTROLLER_URN)).unwrap();
        assert_eq!(change, PeerChange::Removed);
        assert!(r.get("p").is_none());
        assert!(peer.queue().is_empty());
        assert_eq!(rec.0.lock().unwrap().last().unwrap().1, PeerChange::Removed);
    }

    #[test]
    fn inbound_session_then_discovery_is_one_peer() {
        let (r, rec) = registry();
        let s = SessionId(1);
        assert!(matches!(r.attach_inbound("p", "10.0.0.5", s), Attach::Attached(_)));
        assert!(rec.0.lock().unwrap().is_empty());

        r.apply(&updated("p", PLAYER_URN, "http://10.0.0.5:9/"));
        assert_eq!(r.all().len(), 1);
        assert_eq!(rec.0.lock().unwrap()[0].1, PeerChange::Added);
        assert_eq!(r.find_by_session(s).unwrap().identity(), "p");
        assert!(r.info("p").unwrap().connected);
    }

    #[test]
    fn duplicate_and_loopback_sessions_are_refused() {
        let (r, _) = registry();
        assert!(matches!(r.attach_inbound("p", "h", SessionId(1)), Attach::Attached(_)));
        assert!(matches!(r.attach_inbound("p", "h", SessionId(2)), Attach::Refused));
        assert!(matches!(r.attach_inbound("me", "h", SessionId(3)), Attach::Refused));
    }

    #[test]
    fn name_is_set_once_and_filters_apply() {
        let (r, rec) = registry();
        r.apply(&updated("p", PLAYER_URN, "http://h:1/"));
        r.apply(&updated("s", SERVER_URN, "http://h:2/"));
        assert!(r.set_name("p", "Kitchen"));
        assert!(!r.set_name("p", "Other"));
        assert!(!r.set_name("nobody", "x"));
        assert_eq!(r.info("p").unwrap().name.as_deref(), Some("Kitchen"));
        assert_eq!(rec.0.lock().unwrap().len(), 3);

        assert_eq!(r.list(Capabilities::GENERIC).len(), 2);
        let players = r.list(Capabilities::PLAYER);
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].identity, "p");
    }
}
