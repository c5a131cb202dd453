//! Deferred discovery actions kept in one time-ordered list.

use std::collections::VecDeque;
use std::time::Instant;

use crate::device::DeviceHandle;
use crate::service::ServiceId;

/// What an announcement is about: the root device or one registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Root,
    Service(ServiceId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Send the alive variants for the target.
    Announce(Target),
    /// Send a pre-serialized byebye. The record it was built from may be gone.
    Withdraw(Vec<u8>),
    /// Send one search per tracked device class.
    Search,
    /// Announce, then re-arm.
    PeriodicAnnounce(Target),
    /// Search, then re-arm.
    PeriodicSearch,
    /// Drop the device unless a heartbeat moved its deadline.
    ExpireDevice(DeviceHandle),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub due: Instant,
}

/// Ascending by due time; equal due times keep insertion order.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, command: Command) {
        let pos = self.entries.partition_point(|c| c.due <= command.due);
        self.entries.insert(pos, command);
    }

    pub fn schedule(&mut self, kind: CommandKind, due: Instant) {
        self.insert(Command { kind, due });
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.front().map(|c| c.due)
    }

    /// Dequeue the earliest command if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Command> {
        if self.entries.front()?.due <= now {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Drop pending expiry checks for a device that went away on its own.
    pub fn cancel_expiry(&mut self, handle: DeviceHandle) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|c| c.kind != CommandKind::ExpireDevice(handle));
        before - self.entries.len()
    }

    pub fn drain(&mut self) -> Vec<Command> {
        self.entries.drain(..).collect()
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
    use std::time::Duration;

    #[test]
    fn ordered_by_due_time() {
        let mut q = CommandQueue::new();
        let t = Instant::now();
        q.schedule(CommandKind::Search, t + Duration::from_millis(30));
        q.schedule(CommandKind::Shutdown, t + Duration::from_millis(10));
        q.schedule(CommandKind::PeriodicSearch, t + Duration::from_millis(20));
        assert_eq!(q.next_due(), Some(t + Duration::from_millis(10)));

        let later = t + Duration::from_secs(1);
        let kinds: Vec<CommandKind> = std::iter::from_fn(|| q.pop_due(later))
            .map(|c| c.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::Shutdown,
                CommandKind::PeriodicSearch,
                CommandKind::Search
            ]
        );
    }

    #[test]
    fn equal_due_times_fire_in_enqueue_order() {
        let mut q = CommandQueue::new();
        let t = Instant::now();
        for i in 0..5u8 {
            q.schedule(CommandKind::Withdraw(vec![i]), t);
        }
        q.schedule(CommandKind::Search, t - Duration::from_millis(1));
        assert_eq!(q.pop_due(t).map(|c| c.kind), Some(CommandKind::Search));
        for i in 0..5u8 {
            assert_eq!(
                q.pop_due(t).map(|c| c.kind),
                Some(CommandKind::Withdraw(vec![i]))
            );
        }
        assert!(q.is_empty());
    }

    #[test]
    fn not_due_yet() {
        let mut q = CommandQueue::new();
        let t = Instant::now();
        q.schedule(CommandKind::Search, t + Duration::from_secs(5));
        assert!(q.pop_due(t).is_none());
        assert_eq!(q.len(), 1);
    }
}
