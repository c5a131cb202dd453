//! Device table: every raw device seen on the wire, deduplicated by (type, unique name).

use std::time::Instant;

use crate::wire::DeviceHeaders;

/// Stable reference to a table slot. A handle outlives its record safely:
/// once the record is gone (or the slot reused) lookups return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    index: usize,
    generation: u64,
}

/// One discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub headers: DeviceHeaders,
    /// Removed once this passes without a refreshing announcement.
    pub deadline: Instant,
}

/// Result of [`DeviceTable::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Known device, same location: only the deadline moved.
    Refreshed,
    /// Known device announced a new location.
    Changed(DeviceHeaders),
    /// First sight. The caller arms expiry for the returned handle.
    Added(DeviceHandle, DeviceHeaders),
}

/// Change reported to the peer layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Updated(DeviceHeaders),
    Removed(DeviceHeaders),
}

struct Slot {
    generation: u64,
    device: Option<RawDevice>,
}

#[derive(Default)]
pub struct DeviceTable {
    slots: Vec<Slot>,
    next_generation: u64,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, nt: &str, usn: &str) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.device
                .as_ref()
                .is_some_and(|d| d.headers.same_device(nt, usn))
        })
    }

    fn handle_at(&self, index: usize) -> DeviceHandle {
        DeviceHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Add a device or refresh a known one.
    pub fn update(&mut self, headers: DeviceHeaders, deadline: Instant) -> Update {
        if let Some(index) = self.find(&headers.nt, &headers.usn) {
            let Some(device) = self.slots[index].device.as_mut() else {
                return Update::Refreshed;
            };
            device.deadline = deadline;
            if device.headers.location == headers.location {
                return Update::Refreshed;
            }
            device.headers.location = headers.location;
            return Update::Changed(device.headers.clone());
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let device = RawDevice {
            headers: headers.clone(),
            deadline,
        };
        let index = match self.slots.iter().position(|s| s.device.is_none()) {
            Some(free) => {
                self.slots[free] = Slot {
                    generation,
                    device: Some(device),
                };
                free
            }
            None => {
                self.slots.push(Slot {
                    generation,
                    device: Some(device),
                });
                self.slots.len() - 1
            }
        };
        Update::Added(self.handle_at(index), headers)
    }

    /// Remove by identity pair. `None` if the device was never seen.
    pub fn remove(&mut self, nt: &str, usn: &str) -> Option<(DeviceHandle, DeviceHeaders)> {
        let index = self.find(nt, usn)?;
        let handle = self.handle_at(index);
        let device = self.slots[index].device.take()?;
        Some((handle, device.headers))
    }

    /// Remove the record behind `handle`, if it is still the same record.
    pub fn remove_handle(&mut self, handle: DeviceHandle) -> Option<DeviceHeaders> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.device.take().map(|d| d.headers)
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&RawDevice> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.device.as_ref()
    }

    pub fn deadline(&self, handle: DeviceHandle) -> Option<Instant> {
        self.get(handle).map(|d| d.deadline)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.device.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
