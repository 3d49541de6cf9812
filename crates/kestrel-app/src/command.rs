//! Structural commands from producer threads.
//!
//! Producers hold a [`CommandSender`]; the render thread drains the queue
//! once per tick before recording, so commands never observe a frame that
//! is half recorded.

use std::collections::VecDeque;
use std::sync::Arc;

use glam::Mat4;
use kestrel_core::{DrawObject, MeshRef, ObjectId};
use parking_lot::Mutex;

/// A structural change applied at the start of a tick.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCommand {
    Spawn(DrawObject),
    /// Same as [`crate::FramePipeline::mark_for_delete`].
    Delete(ObjectId),
    UpdateTransform { id: ObjectId, transform: Mat4 },
    SetVisible { id: ObjectId, visible: bool },
    /// Replace geometry and rebuild the object's acceleration structure.
    UpdateGeometry { id: ObjectId, mesh: MeshRef },
    ToggleWireframe,
    SetRayTracing(bool),
    Stencil(ObjectId),
    Unstencil(ObjectId),
    /// Rebuild every bottom-level structure on the next ray traced tick.
    RebuildAccelerationStructures,
    Shutdown,
}

/// FIFO of pending commands.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Mutex<VecDeque<EngineCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, command: EngineCommand) {
        self.pending.lock().push_back(command);
    }

    /// Take every pending command in arrival order.
    pub fn drain(&self) -> Vec<EngineCommand> {
        let taken = std::mem::take(&mut *self.pending.lock());
        taken.into()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Cloneable producer handle.
#[derive(Clone, Debug)]
pub struct CommandSender {
    queue: Arc<CommandQueue>,
}

impl CommandSender {
    pub fn new(queue: Arc<CommandQueue>) -> Self {
        Self { queue }
    }

    pub fn enqueue(&self, command: EngineCommand) {
        self.queue.enqueue(command);
    }

    pub fn spawn(&self, object: DrawObject) {
        self.enqueue(EngineCommand::Spawn(object));
    }

    pub fn delete(&self, id: ObjectId) {
        self.enqueue(EngineCommand::Delete(id));
    }

    pub fn shutdown(&self) {
        self.enqueue(EngineCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_order_and_empties() {
        let queue = CommandQueue::new();
        queue.enqueue(EngineCommand::ToggleWireframe);
        queue.enqueue(EngineCommand::Delete(ObjectId(3)));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                EngineCommand::ToggleWireframe,
                EngineCommand::Delete(ObjectId(3))
            ]
        );
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn producers_on_many_threads() {
        let queue = Arc::new(CommandQueue::new());
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let sender = CommandSender::new(queue.clone());
                scope.spawn(move || {
                    for i in 0..100 {
                        sender.delete(ObjectId(t * 1000 + i));
                    }
                });
            }
        });

        let drained = queue.drain();
        assert_eq!(drained.len(), 400);
        // Each producer's commands keep their relative order.
        for t in 0..4u64 {
            let ids: Vec<u64> = drained
                .iter()
                .filter_map(|c| match c {
                    EngineCommand::Delete(id) if id.raw() / 1000 == t => Some(id.raw()),
                    _ => None,
                })
                .collect();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(ids.len(), 100);
        }
    }
}
