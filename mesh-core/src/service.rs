//! Locally advertised services: what this process answers searches with and announces.

/// Identifies one registration. Never reused, so a stale id simply finds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: ServiceId,
    /// Device type URN (`ST`/`NT`).
    pub service_type: String,
    pub usn: String,
    /// `SERVER` banner.
    pub server: String,
    /// Descriptor URL.
    pub location: String,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
    next_id: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        service_type: impl Into<String>,
        usn: impl Into<String>,
        server: impl Into<String>,
        location: impl Into<String>,
    ) -> ServiceId {
        self.next_id += 1;
        let id = ServiceId(self.next_id);
        self.entries.push(ServiceEntry {
            id,
            service_type: service_type.into(),
            usn: usn.into(),
            server: server.into(),
            location: location.into(),
        });
        id
    }

    /// Unlink the first entry of `service_type`.
    pub fn remove(&mut self, service_type: &str) -> Option<ServiceEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.service_type == service_type)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, id: ServiceId) -> Option<&ServiceEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn find(&self, service_type: &str) -> Option<&ServiceEntry> {
        self.entries.iter().find(|e| e.service_type == service_type)
    }

    /// Entries answering a search for `st`: `ssdp:all`, a `uuid:` prefix of the
    /// unique name, or a type prefix (a trailing `:<version>` digit is ignored).
    pub fn matching(&self, st: &str) -> Vec<&ServiceEntry> {
        if st.is_empty() {
            return Vec::new();
        }
        if st == "ssdp:all" {
            return self.entries.iter().collect();
        }
        if st.len() > 5 && st.starts_with("uuid:") {
            return self.entries.iter().filter(|e| e.usn.starts_with(st)).collect();
        }
        let bytes = st.as_bytes();
        let unversioned = if bytes.len() >= 2
            && bytes[bytes.len() - 2] == b':'
            && bytes[bytes.len() - 1].is_ascii_digit()
        {
            &st[..st.len() - 2]
        } else {
            st
        };
        self.entries
            .iter()
            .filter(|e| e.service_type.starts_with(unversioned))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{usn_for, PLAYER_URN, SERVER_URN};

    fn registry() -> ServiceRegistry {
        let mut r = ServiceRegistry::new();
        r.add(PLAYER_URN, usn_for("me", PLAYER_URN), "srv", "http://h:1/Player.xml");
        r.add(SERVER_URN, usn_for("me", SERVER_URN), "srv", "http://h:1/Server.xml");
        r
    }

    #[test]
    fn search_matching() {
        let r = registry();
        assert_eq!(r.matching("ssdp:all").len(), 2);
        assert_eq!(r.matching("uuid:me").len(), 2);
        assert_eq!(r.matching("uuid:other").len(), 0);
        let players = r.matching(PLAYER_URN);
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].service_type, PLAYER_URN);
        assert_eq!(r.matching("urn:schemas-peermesh-org:device:Player:2").len(), 1);
        assert_eq!(r.matching("urn:schemas-peermesh-org:device:").len(), 2);
        assert!(r.matching("").is_empty());
    }

    #[test]
    fn ids_are_not_reused() {
        let mut r = registry();
        let old = r.find(PLAYER_URN).unwrap().id;
        assert!(r.remove(PLAYER_URN).is_some());
        assert!(r.get(old).is_none());
        let new = r.add(PLAYER_URN, "u", "s", "l");
        assert_ne!(old, new);
        assert!(r.remove("urn:none").is_none());
    }
}
