//! Per-peer outbound FIFO and inbound reassembly.

use std::collections::VecDeque;

/// One zero byte queued after every real message so the transport re-arms
/// its writable notification. Receivers drop it.
pub const FLUSH_MARKER: &[u8] = &[0];

pub fn is_flush_marker(payload: &[u8]) -> bool {
    payload == FLUSH_MARKER
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn is_marker(&self) -> bool {
        is_flush_marker(&self.payload)
    }
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    items: VecDeque<OutboundMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message followed by its flush marker.
    pub fn push(&mut self, payload: Vec<u8>) {
        self.items.push_back(OutboundMessage { payload });
        self.items.push_back(OutboundMessage {
            payload: FLUSH_MARKER.to_vec(),
        });
    }

    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Collects readable chunks until the transport reports the message complete.
#[derive(Debug, Default)]
pub struct InboundBuffer {
    partial: Vec<u8>,
}

impl InboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the complete message once `more` is false;
    /// a lone flush marker completes to nothing.
    pub fn push(&mut self, bytes: &[u8], more: bool) -> Option<Vec<u8>> {
        self.partial.extend_from_slice(bytes);
        if more {
            return None;
        }
        let message = std::mem::take(&mut self.partial);
        if message.is_empty() || is_flush_marker(&message) {
            return None;
        }
        Some(message)
    }

    /// Drop a half-received message, e.g. after the session closed.
    pub fn clear(&mut self) {
        self.partial.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_appends_marker_after_each_message() {
        let mut q = MessageQueue::new();
        q.push(b"one".to_vec());
        q.push(b"two".to_vec());
        assert_eq!(q.len(), 4);
        let items: Vec<OutboundMessage> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(items[0].payload, b"one");
        assert!(items[1].is_marker());
        assert_eq!(items[2].payload, b"two");
        assert!(items[3].is_marker());
    }

    #[test]
    fn inbound_reassembly() {
        let mut buf = InboundBuffer::new();
        assert_eq!(buf.push(b"hel", true), None);
        assert_eq!(buf.push(b"lo", false), Some(b"hello".to_vec()));
        assert!(buf.is_empty());
        assert_eq!(buf.push(FLUSH_MARKER, false), None);
        assert_eq!(buf.push(b"x", true), None);
        buf.clear();
        assert_eq!(buf.push(b"y", false), Some(b"y".to_vec()));
    }

    #[test]
    fn zero_bytes_inside_payload_are_kept() {
        let mut buf = InboundBuffer::new();
        assert_eq!(buf.push(&[0, 0], false), Some(vec![0, 0]));
        assert_eq!(buf.push(&[1, 0], false), Some(vec![1, 0]));
    }
}
