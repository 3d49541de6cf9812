//! Frame slots and the per-frame recording context.

use std::fmt;

use ash::vk;
use kestrel_core::{MaterialRef, MeshRef, ObjectId, PipelineId};
use kestrel_gpu::{
    AccelerationStructure, DeferredDeletionQueue, DeviceBuffer, FrameSync, GpuDevice, GpuError,
    PoolHandle, Result,
};

/// Lifecycle of one frame slot within a tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SlotState {
    #[default]
    Idle,
    Recording,
    Submitted,
    Presenting,
}

impl SlotState {
    /// Whether `self -> next` is a legal step.
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Recording)
                | (Self::Recording, Self::Submitted)
                | (Self::Submitted, Self::Presenting)
                | (Self::Presenting, Self::Idle)
        )
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of the frame ring.
///
/// A slot knows only its ring index. Everything else it touches is borrowed
/// from the pipeline for the duration of a call.
pub struct FrameSlot {
    pub index: usize,
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
    /// Deletions consumed after this slot's fence is next waited on.
    pub deletions: DeferredDeletionQueue,
    state: SlotState,
    /// Frame number of the last submission recorded in this slot.
    last_submitted_frame: Option<u64>,
}

impl FrameSlot {
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D, index: usize) -> Result<Self> {
        let sync = FrameSync::new(device)?;
        let command_buffer = match device.allocate_command_buffer() {
            Ok(cmd) => cmd,
            Err(e) => {
                sync.destroy(device);
                return Err(e);
            }
        };
        Ok(Self {
            index,
            command_buffer,
            sync,
            deletions: DeferredDeletionQueue::new(),
            state: SlotState::Idle,
            last_submitted_frame: None,
        })
    }

    pub const fn state(&self) -> SlotState {
        self.state
    }

    pub const fn last_submitted_frame(&self) -> Option<u64> {
        self.last_submitted_frame
    }

    /// Move to `next`, rejecting anything outside the slot lifecycle.
    pub fn transition(&mut self, next: SlotState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(GpuError::InvariantViolation(format!(
                "frame slot {} cannot go from {} to {}",
                self.index, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self, frame_number: u64) -> Result<()> {
        self.transition(SlotState::Submitted)?;
        self.last_submitted_frame = Some(frame_number);
        Ok(())
    }

    /// Return to `Idle` after a wait that covered every submission.
    pub(crate) fn force_idle(&mut self) {
        self.state = SlotState::Idle;
    }

    /// Release the slot's sync objects and command buffer.
    ///
    /// The device must be idle.
    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) {
        device.free_command_buffer(self.command_buffer);
        self.sync.destroy(device);
    }
}

/// One object in the draw list, resolved for the slot being recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawItem {
    pub object: ObjectId,
    pub pipeline: PipelineId,
    pub object_set: PoolHandle,
    pub primitive_sets: Vec<PoolHandle>,
    /// Byte offset of this object's uniforms in the slot's transform buffer.
    pub transform_offset: u64,
    pub mesh: MeshRef,
    pub materials: Vec<MaterialRef>,
}

/// Everything a renderer sees while recording one frame.
pub struct FrameContext<'a, P> {
    pub command_buffer: vk::CommandBuffer,
    pub slot: usize,
    /// Swapchain image this frame presents to. Always equal to `slot`.
    pub image_index: u32,
    pub frame_number: u64,
    pub items: &'a [DrawItem],
    pub pipelines: &'a [&'a P],
    /// The slot's low-frequency set, if the pool reserves one.
    pub frame_set: Option<PoolHandle>,
    pub transform_buffer: Option<&'a DeviceBuffer>,
    /// Present when ray tracing is enabled and something was traceable.
    pub top_level: Option<&'a AccelerationStructure>,
    pub wireframe: bool,
}

impl<P> FrameContext<'_, P> {
    /// Draw items paired with their resolved pipelines.
    pub fn draws(&self) -> impl Iterator<Item = (&DrawItem, &P)> {
        self.items.iter().zip(self.pipelines.iter().copied())
    }
}
