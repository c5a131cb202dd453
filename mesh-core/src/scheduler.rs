//! Discovery scheduler: one time-ordered command list, drained by one worker.
//! Host-driven: the worker passes `now` in and performs the returned effects
//! (sends, device events) after every lock here has been released.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;

use crate::command::{Command, CommandKind, CommandQueue, Target};
use crate::device::{DeviceEvent, DeviceTable, Update};
use crate::service::{ServiceId, ServiceRegistry};
use crate::wire::{self, Inbound};

/// Intervals and delays of the announce/search machinery.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Upper bound between periodic announcements; each period is 50-100% of it.
    #[serde(with = "secs")]
    pub announce_interval: Duration,
    /// Upper bound between periodic searches.
    #[serde(with = "secs")]
    pub search_interval: Duration,
    /// Second copy of every announce/withdrawal goes out 50-100% of this later.
    #[serde(skip)]
    pub retry_delay: Duration,
    /// Maximum delay of an "immediate" announcement.
    #[serde(skip)]
    pub fuzz: Duration,
    /// Delay of the shutdown command, lets pending withdrawals flush.
    #[serde(skip)]
    pub shutdown_delay: Duration,
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(120),
            search_interval: Duration::from_secs(300),
            retry_delay: Duration::from_millis(100),
            fuzz: Duration::from_millis(10),
            shutdown_delay: Duration::from_millis(100),
        }
    }
}

/// Uniform in `[base / 2, base)`.
pub fn jitter(base: Duration) -> Duration {
    let half = base / 2;
    if half.is_zero() {
        return base;
    }
    half + rand::thread_rng().gen_range(Duration::ZERO..half)
}

fn fuzz(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..max)
}

/// The root device this process announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDevice {
    pub identity: String,
    /// Address put into descriptor URLs.
    pub host: String,
    /// Port serving descriptors and sessions.
    pub port: u16,
    /// `SERVER` banner.
    pub server: String,
}

impl LocalDevice {
    pub fn location(&self, kind: &str) -> String {
        wire::location_for(&self.host, self.port, kind)
    }

    pub fn usn(&self, urn: &str) -> String {
        wire::usn_for(&self.identity, urn)
    }
}

/// Work for the host after a scheduler step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send to the discovery multicast group.
    Multicast(Vec<u8>),
    /// Answer a search.
    Unicast(Vec<u8>, SocketAddr),
    /// Fan out to the peer layer.
    Device(DeviceEvent),
    /// Shutdown ran; the worker should end.
    Exit,
}

/// Outcome of one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    DeviceUpdated,
    /// Known device, unchanged: only its deadline moved.
    DeviceRefreshed,
    DeviceRemoved,
    SearchProcessed,
    Ignored,
}

struct State {
    commands: CommandQueue,
    devices: DeviceTable,
    stopped: bool,
}

pub struct Scheduler {
    local: LocalDevice,
    timing: Timing,
    // Devices and commands share a lock: expiry commands point at device records.
    state: Mutex<State>,
    services: Mutex<ServiceRegistry>,
}

impl Scheduler {
    pub fn new(local: LocalDevice, timing: Timing) -> Self {
        Self {
            local,
            timing,
            state: Mutex::new(State {
                commands: CommandQueue::new(),
                devices: DeviceTable::new(),
                stopped: false,
            }),
            services: Mutex::new(ServiceRegistry::new()),
        }
    }

    pub fn local(&self) -> &LocalDevice {
        &self.local
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn services(&self) -> MutexGuard<'_, ServiceRegistry> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm the self-perpetuating root announcement and search.
    pub fn start(&self, now: Instant) {
        let mut state = self.state();
        state
            .commands
            .schedule(CommandKind::PeriodicAnnounce(Target::Root), now);
        state.commands.schedule(CommandKind::PeriodicSearch, now);
    }

    /// Feed one inbound datagram through the parser and the device table.
    pub fn handle_datagram(
        &self,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> (Received, Vec<Effect>) {
        match wire::decode(bytes) {
            Inbound::Alive { headers, lifetime } => {
                let Some(deadline) = now.checked_add(lifetime) else {
                    return (Received::Ignored, Vec::new());
                };
                let mut state = self.state();
                match state.devices.update(headers, deadline) {
                    Update::Refreshed => (Received::DeviceRefreshed, Vec::new()),
                    Update::Changed(headers) => {
                        tracing::debug!(usn = %headers.usn, location = %headers.location, "device updated");
                        (
                            Received::DeviceUpdated,
                            vec![Effect::Device(DeviceEvent::Updated(headers))],
                        )
                    }
                    Update::Added(handle, headers) => {
                        tracing::debug!(usn = %headers.usn, location = %headers.location, "new device discovered");
                        state
                            .commands
                            .schedule(CommandKind::ExpireDevice(handle), deadline);
                        (
                            Received::DeviceUpdated,
                            vec![Effect::Device(DeviceEvent::Updated(headers))],
                        )
                    }
                }
            }
            Inbound::ByeBye { nt, usn } => {
                let mut state = self.state();
                match state.devices.remove(&nt, &usn) {
                    Some((handle, headers)) => {
                        tracing::debug!(usn = %headers.usn, "device removed");
                        state.commands.cancel_expiry(handle);
                        (
                            Received::DeviceRemoved,
                            vec![Effect::Device(DeviceEvent::Removed(headers))],
                        )
                    }
                    None => (Received::Ignored, Vec::new()),
                }
            }
            Inbound::Search { st } => {
                tracing::debug!(%st, %from, "search received");
                let services = self.services();
                let replies = services
                    .matching(&st)
                    .into_iter()
                    .map(|s| {
                        Effect::Unicast(
                            wire::search_response(
                                &s.service_type,
                                &s.usn,
                                &s.server,
                                &s.location,
                                self.timing.announce_interval,
                            ),
                            from,
                        )
                    })
                    .collect();
                (Received::SearchProcessed, replies)
            }
            Inbound::Ignored => (Received::Ignored, Vec::new()),
        }
    }

    /// Register a service and arm its periodic announcement.
    pub fn add_service(
        &self,
        service_type: &str,
        usn: &str,
        server: &str,
        location: &str,
        now: Instant,
    ) -> ServiceId {
        let id = self.services().add(service_type, usn, server, location);
        self.schedule(CommandKind::PeriodicAnnounce(Target::Service(id)), now);
        id
    }

    /// Withdraw and unlink a service. `false` if none of that type is registered.
    pub fn remove_service(&self, service_type: &str, now: Instant) -> bool {
        let mut services = self.services();
        let Some(entry) = services.find(service_type) else {
            return false;
        };
        // Built from the live entry, before it is unlinked.
        let byebye = wire::byebye(&entry.service_type, &entry.usn);
        self.schedule_withdrawal(vec![byebye], now);
        services.remove(service_type);
        true
    }

    pub fn has_service(&self, service_type: &str) -> bool {
        self.services().find(service_type).is_some()
    }

    pub fn service_types(&self) -> Vec<String> {
        self.services()
            .iter()
            .map(|s| s.service_type.clone())
            .collect()
    }

    /// Announce the root device now (twice, with jitter).
    pub fn announce_root(&self, now: Instant) {
        let mut state = self.state();
        self.queue_announce(&mut state, Target::Root, now);
    }

    /// Withdraw the root device: all three variants, twice.
    pub fn withdraw_root(&self, now: Instant) {
        let local = &self.local;
        let root_usn = local.usn(wire::ROOT_URN);
        let uuid = format!("uuid:{}", local.identity);
        self.schedule_withdrawal(
            vec![
                wire::byebye(wire::ROOT_DEVICE_NT, &root_usn),
                wire::byebye(&uuid, &uuid),
                wire::byebye(wire::ROOT_URN, &root_usn),
            ],
            now,
        );
    }

    pub fn schedule_shutdown(&self, now: Instant) {
        self.schedule(CommandKind::Shutdown, now + self.timing.shutdown_delay);
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.state().commands.next_due()
    }

    pub fn pending(&self) -> usize {
        self.state().commands.len()
    }

    pub fn device_count(&self) -> usize {
        self.state().devices.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    fn schedule(&self, kind: CommandKind, due: Instant) {
        let mut state = self.state();
        if !state.stopped {
            state.commands.schedule(kind, due);
        }
    }

    fn queue_announce(&self, state: &mut State, target: Target, now: Instant) {
        state
            .commands
            .schedule(CommandKind::Announce(target), now + fuzz(self.timing.fuzz));
        state.commands.schedule(
            CommandKind::Announce(target),
            now + jitter(self.timing.retry_delay),
        );
    }

    fn queue_search(&self, state: &mut State, now: Instant) {
        state
            .commands
            .schedule(CommandKind::Search, now + jitter(self.timing.fuzz));
        state
            .commands
            .schedule(CommandKind::Search, now + jitter(self.timing.retry_delay));
    }

    /// Two tiers: all messages now, then all again 50-100% of the retry delay later.
    fn schedule_withdrawal(&self, messages: Vec<Vec<u8>>, now: Instant) {
        let mut state = self.state();
        if state.stopped {
            return;
        }
        let later = now + jitter(self.timing.retry_delay);
        for due in [now, later] {
            for msg in &messages {
                state
                    .commands
                    .schedule(CommandKind::Withdraw(msg.clone()), due);
            }
        }
    }

    /// Alive variants for a target. Empty if the service is no longer registered.
    fn announce_messages(&self, target: Target) -> Vec<Vec<u8>> {
        let local = &self.local;
        let max_age = self.timing.announce_interval;
        let uuid = format!("uuid:{}", local.identity);
        match target {
            Target::Root => {
                let usn = local.usn(wire::ROOT_URN);
                let location = local.location("Root");
                vec![
                    wire::alive(wire::ROOT_DEVICE_NT, &usn, &location, &local.server, max_age),
                    wire::alive(&uuid, &uuid, &location, &local.server, max_age),
                    wire::alive(wire::ROOT_URN, &usn, &location, &local.server, max_age),
                ]
            }
            Target::Service(id) => match self.services().get(id) {
                Some(s) => vec![
                    wire::alive(&uuid, &uuid, &s.location, &s.server, max_age),
                    wire::alive(&s.service_type, &s.usn, &s.location, &s.server, max_age),
                ],
                None => Vec::new(),
            },
        }
    }

    fn target_present(&self, target: Target) -> bool {
        match target {
            Target::Root => true,
            Target::Service(id) => self.services().get(id).is_some(),
        }
    }

    /// Execute everything due at `now`, in order.
    pub fn poll(&self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            let command = {
                let mut state = self.state();
                if state.stopped {
                    break;
                }
                match state.commands.pop_due(now) {
                    Some(c) => c,
                    None => break,
                }
            };
            if self.execute(command, now, &mut effects) {
                break;
            }
        }
        effects
    }

    /// Returns `true` once shutdown has run.
    fn execute(&self, command: Command, now: Instant, effects: &mut Vec<Effect>) -> bool {
        match command.kind {
            CommandKind::Announce(target) => {
                effects.extend(
                    self.announce_messages(target)
                        .into_iter()
                        .map(Effect::Multicast),
                );
            }
            CommandKind::Withdraw(msg) => effects.push(Effect::Multicast(msg)),
            CommandKind::Search => {
                effects.push(Effect::Multicast(wire::search(wire::PLAYER_URN)));
                effects.push(Effect::Multicast(wire::search(wire::SERVER_URN)));
            }
            CommandKind::PeriodicAnnounce(target) => {
                if !self.target_present(target) {
                    return false;
                }
                let mut state = self.state();
                self.queue_announce(&mut state, target, now);
                let due = command.due + jitter(self.timing.announce_interval);
                state
                    .commands
                    .schedule(CommandKind::PeriodicAnnounce(target), due);
            }
            CommandKind::PeriodicSearch => {
                let mut state = self.state();
                self.queue_search(&mut state, now);
                let due = command.due + jitter(self.timing.search_interval);
                state.commands.schedule(CommandKind::PeriodicSearch, due);
            }
            CommandKind::ExpireDevice(handle) => {
                let mut state = self.state();
                match state.devices.deadline(handle) {
                    Some(deadline) if now >= deadline => {
                        if let Some(headers) = state.devices.remove_handle(handle) {
                            tracing::debug!(usn = %headers.usn, "device expired");
                            effects.push(Effect::Device(DeviceEvent::Removed(headers)));
                        }
                    }
                    // A heartbeat moved the deadline.
                    Some(deadline) => state
                        .commands
                        .schedule(CommandKind::ExpireDevice(handle), deadline),
                    None => {}
                }
            }
            CommandKind::Shutdown => {
                let mut state = self.state();
                state.stopped = true;
                for pending in state.commands.drain() {
                    if let CommandKind::ExpireDevice(handle) = pending.kind {
                        if let Some(headers) = state.devices.remove_handle(handle) {
                            effects.push(Effect::Device(DeviceEvent::Removed(headers)));
                        }
                    }
                }
                tracing::info!("discovery scheduler shut down");
                effects.push(Effect::Exit);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{usn_for, DeviceHeaders, PLAYER_URN};

    fn scheduler() -> Scheduler {
        Scheduler::new(
            LocalDevice {
                identity: "me".into(),
                host: "10.0.0.1".into(),
                port: 7000,
                server: wire::server_banner("Linux/6.0"),
            },
            Timing::default(),
        )
    }

    fn from() -> SocketAddr {
        "10.0.0.9:1900".parse().unwrap()
    }

    fn alive(location: &str, max_age: u64) -> Vec<u8> {
        wire::alive(
            PLAYER_URN,
            &usn_for("peer", PLAYER_URN),
            location,
            "x",
            Duration::from_secs(max_age),
        )
    }

    fn multicasts(effects: &[Effect]) -> Vec<Inbound> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Multicast(bytes) => Some(wire::decode(bytes)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn announce_update_refresh() {
        let s = scheduler();
        let now = Instant::now();
        let (r, effects) = s.handle_datagram(&alive("http://a:1/", 60), from(), now);
        assert_eq!(r, Received::DeviceUpdated);
        assert_eq!(
            effects,
            vec![Effect::Device(DeviceEvent::Updated(DeviceHeaders::new(
                PLAYER_URN,
                usn_for("peer", PLAYER_URN),
                "http://a:1/"
            )))]
        );

        let (r, effects) = s.handle_datagram(&alive("http://a:1/", 60), from(), now);
        assert_eq!(r, Received::DeviceRefreshed);
        assert!(effects.is_empty());

        let (r, effects) = s.handle_datagram(&alive("http://b:2/", 60), from(), now);
        assert_eq!(r, Received::DeviceUpdated);
        match &effects[..] {
            [Effect::Device(DeviceEvent::Updated(h))] => assert_eq!(h.location, "http://b:2/"),
            other => panic!("unexpected effects {:?}", other),
        }
        assert_eq!(s.device_count(), 1);
    }

    #[test]
    fn byebye_removes_and_cancels_expiry() {
        let s = scheduler();
        let now = Instant::now();
        s.handle_datagram(&alive("http://a:1/", 60), from(), now);
        assert_eq!(s.pending(), 1);

        let bye = wire::byebye(PLAYER_URN, &usn_for("peer", PLAYER_URN));
        let (r, effects) = s.handle_datagram(&bye, from(), now);
        assert_eq!(r, Received::DeviceRemoved);
        assert!(matches!(&effects[..], [Effect::Device(DeviceEvent::Removed(_))]));
        assert_eq!(s.pending(), 0);

        let (r, effects) = s.handle_datagram(&bye, from(), now);
        assert_eq!(r, Received::Ignored);
        assert!(effects.is_empty());
    }

    #[test]
    fn expiry_waits_for_refreshed_deadline() {
        let s = scheduler();
        let t0 = Instant::now();
        s.handle_datagram(&alive("http://a:1/", 10), from(), t0);
        assert!(s.poll(t0 + Duration::from_secs(5)).is_empty());

        // Heartbeat: deadline becomes t0 + 18s, no event.
        let (r, effects) = s.handle_datagram(&alive("http://a:1/", 10), from(), t0 + Duration::from_secs(8));
        assert_eq!(r, Received::DeviceRefreshed);
        assert!(effects.is_empty());

        assert!(s.poll(t0 + Duration::from_secs(11)).is_empty());
        assert_eq!(s.device_count(), 1);
        assert_eq!(s.next_due(), Some(t0 + Duration::from_secs(18)));

        let effects = s.poll(t0 + Duration::from_secs(18));
        assert!(matches!(&effects[..], [Effect::Device(DeviceEvent::Removed(_))]));
        assert_eq!(s.device_count(), 0);
    }

    #[test]
    fn huge_max_age_is_capped() {
        let s = scheduler();
        let now = Instant::now();
        let datagram = format!(
            "NOTIFY * HTTP/1.1\r\n\
             CACHE-CONTROL: max-age=18446744073709551615\r\n\
             LOCATION: http://a:1/\r\n\
             NT: {}\r\n\
             USN: {}\r\n\
             NTS: ssdp:alive\r\n\r\n",
            PLAYER_URN,
            usn_for("peer", PLAYER_URN)
        );
        let (r, _) = s.handle_datagram(datagram.as_bytes(), from(), now);
        assert_eq!(r, Received::DeviceUpdated);
        assert_eq!(s.next_due(), Some(now + wire::MAX_LIFETIME));

        let (r, _) = s.handle_datagram(datagram.as_bytes(), from(), now);
        assert_eq!(r, Received::DeviceRefreshed);
        assert_eq!(s.device_count(), 1);
    }

    #[test]
    fn add_then_remove_withdraws_with_service_data() {
        let s = scheduler();
        let now = Instant::now();
        let usn = usn_for("me", PLAYER_URN);
        s.add_service(PLAYER_URN, &usn, "banner", "http://10.0.0.1:7000/Player.xml", now);
        assert!(s.remove_service(PLAYER_URN, now));
        assert!(!s.has_service(PLAYER_URN));

        let sent = multicasts(&s.poll(now + Duration::from_secs(1)));
        assert_eq!(sent.len(), 2);
        for packet in sent {
            assert_eq!(
                packet,
                Inbound::ByeBye {
                    nt: PLAYER_URN.into(),
                    usn: usn.clone()
                }
            );
        }
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn service_announce_uses_service_data() {
        let s = scheduler();
        let now = Instant::now();
        let usn = usn_for("me", PLAYER_URN);
        s.add_service(PLAYER_URN, &usn, "banner", "http://10.0.0.1:7000/Player.xml", now);

        let sent = multicasts(&s.poll(now + Duration::from_secs(1)));
        // Two copies of the identity-only and type-specific variants.
        assert_eq!(sent.len(), 4);
        let typed = sent
            .iter()
            .filter(|p| matches!(p, Inbound::Alive { headers, .. } if headers.nt == PLAYER_URN && headers.usn == usn))
            .count();
        assert_eq!(typed, 2);
        // The periodic announcement re-armed itself at least a minute out.
        assert_eq!(s.pending(), 1);
        assert!(s.next_due().unwrap() >= now + Duration::from_secs(60));
    }

    #[test]
    fn start_announces_root_and_searches() {
        let s = scheduler();
        let now = Instant::now();
        s.start(now);
        let sent = multicasts(&s.poll(now + Duration::from_secs(1)));
        let searches = sent
            .iter()
            .filter(|p| matches!(p, Inbound::Search { .. }))
            .count();
        let root = sent
            .iter()
            .filter(|p| matches!(p, Inbound::Alive { headers, .. } if headers.nt == wire::ROOT_DEVICE_NT))
            .count();
        assert_eq!(searches, 4);
        assert_eq!(root, 2);
        assert_eq!(s.pending(), 2);
    }

    #[test]
    fn search_is_answered_by_unicast() {
        let s = scheduler();
        let now = Instant::now();
        s.add_service(PLAYER_URN, &usn_for("me", PLAYER_URN), "b", "http://h:1/Player.xml", now);
        let (r, effects) = s.handle_datagram(&wire::search("ssdp:all"), from(), now);
        assert_eq!(r, Received::SearchProcessed);
        match &effects[..] {
            [Effect::Unicast(bytes, to)] => {
                assert_eq!(*to, from());
                assert!(bytes.starts_with(b"HTTP/1.1 200 OK"));
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn shutdown_expires_devices_and_stops() {
        let s = scheduler();
        let now = Instant::now();
        s.handle_datagram(&alive("http://a:1/", 600), from(), now);
        s.schedule_shutdown(now);
        let effects = s.poll(now + Duration::from_secs(1));
        assert!(matches!(
            &effects[..],
            [Effect::Device(DeviceEvent::Removed(_)), Effect::Exit]
        ));
        assert!(s.is_stopped());
        assert_eq!(s.device_count(), 0);
        assert!(s.poll(now + Duration::from_secs(1000)).is_empty());
    }
}
