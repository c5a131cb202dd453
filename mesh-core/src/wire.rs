//! Discovery wire format: SSDP-style header lines over UDP multicast.
//!
//! Decoding is stateless and never fails: anything that cannot be classified
//! comes back as [`Inbound::Ignored`]. Encoding produces the announce, withdrawal,
//! search and search-reply shapes, each capped at [`MAX_PACKET_LEN`].

use std::net::Ipv4Addr;
use std::time::Duration;

/// Multicast group every discovery packet is sent to.
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Discovery UDP port.
pub const DISCOVERY_PORT: u16 = 1900;
/// Outgoing packets are truncated to this size; some interfaces drop bigger datagrams.
pub const MAX_PACKET_LEN: usize = 512;
/// Receive buffer for inbound datagrams.
pub const RECV_BUFFER_LEN: usize = 1536;
/// Lifetime assumed when a packet carries no `max-age`.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(180);
/// Longest lifetime we accept from a peer's `max-age`.
pub const MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
/// `MX` value put into searches: maximum response delay in seconds.
pub const SEARCH_MX: u32 = 2;
/// Prepended to datagrams that arrive on the transmit socket so the parser
/// can tell a search reply from a real request.
pub const REPLY_PREFIX: &[u8] = b"REPLY * ";

const BOOT_ID: u32 = 1;
const CONFIG_ID: u32 = 1;

/// Common prefix of all device type URNs spoken by the mesh.
pub const DEVICE_URN_PREFIX: &str = "urn:schemas-peermesh-org:device:";
pub const ROOT_URN: &str = "urn:schemas-peermesh-org:device:Root:1";
pub const PLAYER_URN: &str = "urn:schemas-peermesh-org:device:Player:1";
pub const SERVER_URN: &str = "urn:schemas-peermesh-org:device:Server:1";
pub const CONTROLLER_URN: &str = "urn:schemas-peermesh-org:device:Controller:1";
/// `NT` of the root device announcement.
pub const ROOT_DEVICE_NT: &str = "upnp:rootdevice";

/// Leading token of a discovery datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `M-SEARCH`
    Search,
    /// `NOTIFY`
    Announce,
    /// Locally framed reply to one of our own searches.
    SearchReply,
}

/// `NTS` sub-token of an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nts {
    Alive,
    ByeBye,
}

/// The header triple that identifies a discovered device and where to reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DeviceHeaders {
    pub nt: String,
    pub usn: String,
    pub location: String,
}

impl DeviceHeaders {
    pub fn new(nt: impl Into<String>, usn: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            nt: nt.into(),
            usn: usn.into(),
            location: location.into(),
        }
    }

    /// Same device: type and unique name match byte for byte.
    pub fn same_device(&self, nt: &str, usn: &str) -> bool {
        self.nt == nt && self.usn == usn
    }
}

/// Every recognized header of one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub method: Method,
    pub nt: Option<String>,
    pub usn: Option<String>,
    pub location: Option<String>,
    pub nts: Option<Nts>,
    pub st: Option<String>,
    pub lifetime: Duration,
}

/// What a datagram asks the discovery layer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Device is alive: add it or refresh it for `lifetime`.
    Alive {
        headers: DeviceHeaders,
        lifetime: Duration,
    },
    /// Device is going away.
    ByeBye { nt: String, usn: String },
    /// Someone searches for `st`.
    Search { st: String },
    Ignored,
}

fn method_of(bytes: &[u8]) -> Option<Method> {
    let len = bytes
        .iter()
        .take_while(|b| b.is_ascii_alphabetic() || **b == b'-')
        .count();
    match &bytes[..len] {
        b"M-SEARCH" => Some(Method::Search),
        b"NOTIFY" => Some(Method::Announce),
        b"REPLY" if bytes.starts_with(b"REPLY * HTTP/1.1 200 OK") => Some(Method::SearchReply),
        _ => None,
    }
}

/// Trim whitespace and one pair of surrounding quotes.
fn clean_value(raw: &str) -> &str {
    let v = raw.trim();
    let v = v.strip_prefix('"').unwrap_or(v);
    let v = v.strip_suffix('"').unwrap_or(v);
    v.trim()
}

/// Leading decimal digits of `s`; zero when there are none, saturating on overflow.
fn leading_number(s: &str) -> u64 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return 0;
    }
    digits.parse().unwrap_or(u64::MAX)
}

/// Only `max-age` is honored; other directives are skipped. Capped at [`MAX_LIFETIME`].
fn max_age(value: &str) -> Option<Duration> {
    value.split(',').find_map(|directive| {
        let (name, v) = directive.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            Some(Duration::from_secs(leading_number(v.trim())).min(MAX_LIFETIME))
        } else {
            None
        }
    })
}

/// Parse the header lines of a datagram. `None` if the method is unknown.
pub fn parse_packet(bytes: &[u8]) -> Option<Packet> {
    let method = method_of(bytes)?;
    let text = String::from_utf8_lossy(bytes);
    let mut packet = Packet {
        method,
        nt: None,
        usn: None,
        location: None,
        nts: None,
        st: None,
        lifetime: DEFAULT_LIFETIME,
    };
    for line in text.split(['\r', '\n']) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = clean_value(value);
        if name.is_empty() || value.is_empty() {
            continue;
        }
        if name.eq_ignore_ascii_case("nt") {
            packet.nt = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("usn") {
            packet.usn = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("location") {
            packet.location = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("nts") {
            if value.eq_ignore_ascii_case("ssdp:alive") {
                packet.nts = Some(Nts::Alive);
            } else if value.eq_ignore_ascii_case("ssdp:byebye") {
                packet.nts = Some(Nts::ByeBye);
            }
        } else if name.eq_ignore_ascii_case("cache-control") {
            if let Some(age) = max_age(value) {
                packet.lifetime = age;
            }
        } else if name.eq_ignore_ascii_case("st") {
            packet.st = Some(value.to_string());
        }
    }
    Some(packet)
}

/// Classify a datagram. Never fails; malformed input is [`Inbound::Ignored`].
pub fn decode(bytes: &[u8]) -> Inbound {
    let Some(packet) = parse_packet(bytes) else {
        return Inbound::Ignored;
    };
    match packet.method {
        Method::Search => match packet.st {
            Some(st) => Inbound::Search { st },
            None => Inbound::Ignored,
        },
        Method::SearchReply => match (packet.st, packet.usn, packet.location) {
            (Some(nt), Some(usn), Some(location)) => Inbound::Alive {
                headers: DeviceHeaders { nt, usn, location },
                lifetime: packet.lifetime,
            },
            _ => Inbound::Ignored,
        },
        Method::Announce => {
            let (Some(nt), Some(usn)) = (packet.nt, packet.usn) else {
                return Inbound::Ignored;
            };
            match (packet.nts, packet.location) {
                (Some(Nts::ByeBye), _) => Inbound::ByeBye { nt, usn },
                (Some(Nts::Alive), Some(location)) => Inbound::Alive {
                    headers: DeviceHeaders { nt, usn, location },
                    lifetime: packet.lifetime,
                },
                _ => Inbound::Ignored,
            }
        }
    }
}

fn host_line() -> String {
    format!("HOST: {}:{}\r\n", MULTICAST_ADDR, DISCOVERY_PORT)
}

/// `ssdp:alive` announcement.
pub fn alive(nt: &str, usn: &str, location: &str, server: &str, max_age: Duration) -> Vec<u8> {
    format!(
        "NOTIFY * HTTP/1.1\r\n{}CACHE-CONTROL: max-age={}\r\nLOCATION: {}\r\nSERVER: {}\r\nNT: {}\r\nUSN: {}\r\nNTS: ssdp:alive\r\nBOOTID.UPNP.ORG: {}\r\nCONFIGID.UPNP.ORG: {}\r\n\r\n",
        host_line(),
        max_age.as_secs(),
        location,
        server,
        nt,
        usn,
        BOOT_ID,
        CONFIG_ID
    )
    .into_bytes()
}

/// `ssdp:byebye` withdrawal. Carries no location.
pub fn byebye(nt: &str, usn: &str) -> Vec<u8> {
    format!(
        "NOTIFY * HTTP/1.1\r\n{}NT: {}\r\nUSN: {}\r\nNTS: ssdp:byebye\r\nBOOTID.UPNP.ORG: {}\r\nCONFIGID.UPNP.ORG: {}\r\n\r\n",
        host_line(),
        nt,
        usn,
        BOOT_ID,
        CONFIG_ID
    )
    .into_bytes()
}

pub fn search(st: &str) -> Vec<u8> {
    format!(
        "M-SEARCH * HTTP/1.1\r\n{}ST: {}\r\nMAN: \"ssdp:discover\"\r\nMX: {}\r\n\r\n",
        host_line(),
        st,
        SEARCH_MX
    )
    .into_bytes()
}

/// Unicast answer to an `M-SEARCH`.
pub fn search_response(st: &str, usn: &str, server: &str, location: &str, max_age: Duration) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age={}\r\nST: {}\r\nUSN: {}\r\nEXT:\r\nSERVER: {}\r\nLOCATION: {}\r\nBOOTID.UPNP.ORG: {}\r\nCONFIGID.UPNP.ORG: {}\r\n\r\n",
        max_age.as_secs(),
        st,
        usn,
        server,
        location,
        BOOT_ID,
        CONFIG_ID
    )
    .into_bytes()
}

/// Cap an outgoing packet at [`MAX_PACKET_LEN`].
pub fn truncate(mut packet: Vec<u8>) -> Vec<u8> {
    if packet.len() > MAX_PACKET_LEN {
        tracing::debug!(len = packet.len(), "discovery packet truncated");
        packet.truncate(MAX_PACKET_LEN);
    }
    packet
}

/// `uuid:<identity>::<urn>`
pub fn usn_for(identity: &str, urn: &str) -> String {
    format!("uuid:{}::{}", identity, urn)
}

/// Descriptor URL advertised for one device kind, e.g. `http://10.0.0.2:7862/Player.xml`.
pub fn location_for(host: &str, port: u16, kind: &str) -> String {
    format!("http://{}:{}/{}.xml", host, port, kind)
}

/// `SERVER` header value.
pub fn server_banner(os: &str) -> String {
    format!("{} UPnP/1.1 peermesh/1.0", os)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIVE: &str = "NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        CACHE-CONTROL: max-age=120\r\n\
        LOCATION: http://10.0.0.7:7862/Player.xml\r\n\
        NT: urn:schemas-peermesh-org:device:Player:1\r\n\
        USN: uuid:abc::urn:schemas-peermesh-org:device:Player:1\r\n\
        NTS: ssdp:alive\r\n\r\n";

    #[test]
    fn alive_announcement_yields_headers() {
        match decode(ALIVE.as_bytes()) {
            Inbound::Alive { headers, lifetime } => {
                assert_eq!(headers.nt, PLAYER_URN);
                assert_eq!(headers.usn, usn_for("abc", PLAYER_URN));
                assert_eq!(headers.location, "http://10.0.0.7:7862/Player.xml");
                assert_eq!(lifetime, Duration::from_secs(120));
            }
            other => panic!("expected Alive, got {:?}", other),
        }
    }

    #[test]
    fn byebye_without_location() {
        let text = "NOTIFY * HTTP/1.1\r\nNT: upnp:rootdevice\r\nUSN: uuid:abc::x\r\nNTS: ssdp:byebye\r\n\r\n";
        assert_eq!(
            decode(text.as_bytes()),
            Inbound::ByeBye {
                nt: "upnp:rootdevice".into(),
                usn: "uuid:abc::x".into()
            }
        );
    }

    #[test]
    fn alive_without_location_is_ignored() {
        let text = "NOTIFY * HTTP/1.1\r\nNT: a\r\nUSN: b\r\nNTS: ssdp:alive\r\n\r\n";
        assert_eq!(decode(text.as_bytes()), Inbound::Ignored);
    }

    #[test]
    fn headers_are_case_insensitive_and_unquoted() {
        let text = "NOTIFY * HTTP/1.1\nnt:  \"a\" \nUsn: b\nlocation: c\nnts: SSDP:ALIVE\n\n";
        match decode(text.as_bytes()) {
            Inbound::Alive { headers, lifetime } => {
                assert_eq!(headers, DeviceHeaders::new("a", "b", "c"));
                assert_eq!(lifetime, DEFAULT_LIFETIME);
            }
            other => panic!("expected Alive, got {:?}", other),
        }
    }

    #[test]
    fn malformed_lines_do_not_stop_parsing() {
        let text = "NOTIFY * HTTP/1.1\r\ngarbage line\r\nNT:\r\nNT: a\r\n: nothing\r\nUSN: b\r\nLOCATION: c\r\nNTS: ssdp:alive\r\n";
        assert!(matches!(decode(text.as_bytes()), Inbound::Alive { .. }));
    }

    #[test]
    fn cache_control_reads_only_max_age() {
        let text = "NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: no-cache, max-age = 1800\r\n";
        let p = parse_packet(text.as_bytes()).unwrap();
        assert_eq!(p.lifetime, Duration::from_secs(1800));
        let p = parse_packet(b"NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: private\r\n").unwrap();
        assert_eq!(p.lifetime, DEFAULT_LIFETIME);
    }

    #[test]
    fn max_age_is_capped() {
        let p = parse_packet(b"NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: max-age=18446744073709551615\r\n")
            .unwrap();
        assert_eq!(p.lifetime, MAX_LIFETIME);
        let p = parse_packet(b"NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: max-age=99999999999999999999999\r\n")
            .unwrap();
        assert_eq!(p.lifetime, MAX_LIFETIME);
        let p = parse_packet(b"NOTIFY * HTTP/1.1\r\nCACHE-CONTROL: max-age=86399\r\n").unwrap();
        assert_eq!(p.lifetime, Duration::from_secs(86399));
    }

    #[test]
    fn search_reply_uses_st_as_type() {
        let mut datagram = REPLY_PREFIX.to_vec();
        datagram.extend_from_slice(&search_response(
            PLAYER_URN,
            "uuid:x::p",
            "Linux/6 UPnP/1.1 peermesh/1.0",
            "http://h:1/Player.xml",
            Duration::from_secs(60),
        ));
        match decode(&datagram) {
            Inbound::Alive { headers, lifetime } => {
                assert_eq!(headers.nt, PLAYER_URN);
                assert_eq!(headers.usn, "uuid:x::p");
                assert_eq!(lifetime, Duration::from_secs(60));
            }
            other => panic!("expected Alive, got {:?}", other),
        }
    }

    #[test]
    fn unframed_response_is_ignored() {
        let datagram = search_response("a", "b", "c", "d", Duration::from_secs(1));
        assert_eq!(decode(&datagram), Inbound::Ignored);
    }

    #[test]
    fn search_request() {
        assert_eq!(
            decode(&search(PLAYER_URN)),
            Inbound::Search {
                st: PLAYER_URN.into()
            }
        );
        assert_eq!(decode(b"M-SEARCH * HTTP/1.1\r\n\r\n"), Inbound::Ignored);
    }

    #[test]
    fn unknown_input_is_ignored() {
        assert_eq!(decode(b""), Inbound::Ignored);
        assert_eq!(decode(b"GET / HTTP/1.1\r\n"), Inbound::Ignored);
        assert_eq!(decode(&[0xff, 0xfe, 0x00]), Inbound::Ignored);
    }

    #[test]
    fn truncates_long_packets() {
        let long = alive(&"n".repeat(600), "u", "l", "s", Duration::from_secs(1));
        assert_eq!(truncate(long).len(), MAX_PACKET_LEN);
        let short = byebye("n", "u");
        let len = short.len();
        assert_eq!(truncate(short).len(), len);
    }
}
