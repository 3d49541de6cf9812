//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! GPU resources cannot be freed while a submitted frame may still read
//! them. Each frame slot owns one of these queues; entries pushed onto it
//! are consumed after the slot's fence has been waited on, which proves
//! every submission up to and including that slot's last one completed.

use std::collections::VecDeque;

use hashbrown::HashSet;
use kestrel_core::ObjectId;

use crate::acceleration::AccelerationStructure;
use crate::device::DeviceBuffer;

/// Something whose destruction waits for a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retired {
    /// Every resource held by a drawable object.
    Object(ObjectId),
    Buffer(DeviceBuffer),
    Structure(AccelerationStructure),
}

/// An entry pending deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingDeletion {
    pub target: Retired,
    /// Frame number when this entry was queued.
    pub frame_queued: u64,
}

/// Queue of deletions waiting on one frame slot.
#[derive(Debug, Default)]
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    objects: HashSet<ObjectId>,
}

impl DeferredDeletionQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `target` for deletion.
    ///
    /// Returns `false` if `target` is an object that is already queued here.
    pub fn push(&mut self, target: Retired, frame_number: u64) -> bool {
        if let Retired::Object(id) = target {
            if !self.objects.insert(id) {
                return false;
            }
        }
        self.pending.push_back(PendingDeletion {
            target,
            frame_queued: frame_number,
        });
        true
    }

    /// Take every pending entry in queue order.
    ///
    /// Only call this once the owning slot's fence is known to be signaled.
    pub fn drain(&mut self) -> Vec<PendingDeletion> {
        self.objects.clear();
        self.pending.drain(..).collect()
    }

    /// Whether an object deletion is queued here.
    pub fn contains_object(&self, id: ObjectId) -> bool {
        self.objects.contains(&id)
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::{self, Handle};

    fn buffer(raw: u64) -> DeviceBuffer {
        DeviceBuffer {
            handle: vk::Buffer::from_raw(raw),
            size: 256,
            device_address: 0,
        }
    }

    #[test]
    fn objects_are_deduplicated() {
        let mut queue = DeferredDeletionQueue::new();
        assert!(queue.push(Retired::Object(ObjectId(3)), 10));
        assert!(!queue.push(Retired::Object(ObjectId(3)), 11));
        assert!(queue.push(Retired::Object(ObjectId(4)), 11));
        assert_eq!(queue.pending_count(), 2);
        assert!(queue.contains_object(ObjectId(3)));
    }

    #[test]
    fn buffers_are_not_deduplicated_by_object_set() {
        let mut queue = DeferredDeletionQueue::new();
        assert!(queue.push(Retired::Buffer(buffer(1)), 1));
        assert!(queue.push(Retired::Buffer(buffer(2)), 1));
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn drain_preserves_order_and_empties() {
        let mut queue = DeferredDeletionQueue::new();
        queue.push(Retired::Buffer(buffer(1)), 1);
        queue.push(Retired::Object(ObjectId(9)), 2);
        queue.push(Retired::Buffer(buffer(2)), 3);

        let drained = queue.drain();
        let frames: Vec<u64> = drained.iter().map(|p| p.frame_queued).collect();
        assert_eq!(frames, vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert!(!queue.contains_object(ObjectId(9)));

        // The object may be queued again once drained.
        assert!(queue.push(Retired::Object(ObjectId(9)), 4));
    }
}
