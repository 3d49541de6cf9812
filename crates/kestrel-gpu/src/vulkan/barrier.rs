//! Image layout transitions with synchronization2 barriers.

use ash::vk;

use crate::error::{GpuError, Result};

/// Stage and access masks on one side of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierScope {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl BarrierScope {
    const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }
}

fn source_scope(layout: vk::ImageLayout) -> Option<BarrierScope> {
    use vk::{AccessFlags2 as A, ImageLayout as L, PipelineStageFlags2 as S};
    let scope = match layout {
        L::UNDEFINED => BarrierScope::new(S::TOP_OF_PIPE, A::NONE),
        L::COLOR_ATTACHMENT_OPTIMAL => {
            BarrierScope::new(S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE)
        }
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => BarrierScope::new(
            S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        L::TRANSFER_DST_OPTIMAL => BarrierScope::new(S::TRANSFER, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => BarrierScope::new(S::TRANSFER, A::TRANSFER_READ),
        L::SHADER_READ_ONLY_OPTIMAL => BarrierScope::new(S::FRAGMENT_SHADER, A::SHADER_READ),
        L::GENERAL => BarrierScope::new(S::COMPUTE_SHADER, A::SHADER_STORAGE_WRITE),
        L::PRESENT_SRC_KHR => BarrierScope::new(S::BOTTOM_OF_PIPE, A::NONE),
        _ => return None,
    };
    Some(scope)
}

fn destination_scope(layout: vk::ImageLayout) -> Option<BarrierScope> {
    use vk::{AccessFlags2 as A, ImageLayout as L, PipelineStageFlags2 as S};
    let scope = match layout {
        L::COLOR_ATTACHMENT_OPTIMAL => BarrierScope::new(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => BarrierScope::new(
            S::EARLY_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        L::TRANSFER_DST_OPTIMAL => BarrierScope::new(S::TRANSFER, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => BarrierScope::new(S::TRANSFER, A::TRANSFER_READ),
        L::SHADER_READ_ONLY_OPTIMAL => BarrierScope::new(S::FRAGMENT_SHADER, A::SHADER_READ),
        L::GENERAL => BarrierScope::new(
            S::COMPUTE_SHADER,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
        ),
        L::PRESENT_SRC_KHR => BarrierScope::new(S::BOTTOM_OF_PIPE, A::NONE),
        _ => return None,
    };
    Some(scope)
}

/// Source and destination scopes for moving an image from `from` to `to`.
///
/// Transitions into `UNDEFINED` and layouts without a known scope are
/// rejected.
pub fn transition_scopes(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Result<(BarrierScope, BarrierScope)> {
    match (source_scope(from), destination_scope(to)) {
        (Some(src), Some(dst)) if from != to => Ok((src, dst)),
        _ => Err(GpuError::UnsupportedTransition { from, to }),
    }
}

/// Color image barrier for a whole single-mip, single-layer image.
pub fn image_transition<'a>(
    image: vk::Image,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageMemoryBarrier2<'a>> {
    let (src, dst) = transition_scopes(from, to)?;
    Ok(vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .old_layout(from)
        .new_layout(to)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .level_count(1)
                .layer_count(1),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_cycle_is_supported() {
        let (src, dst) = transition_scopes(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src.stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert!(dst.access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));

        let (src, dst) = transition_scopes(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        assert_eq!(src.stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dst.access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn unknown_transitions_are_rejected() {
        let err = transition_scopes(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::UNDEFINED,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            GpuError::UnsupportedTransition {
                to: vk::ImageLayout::UNDEFINED,
                ..
            }
        ));
        assert!(!err.is_fatal());

        assert!(transition_scopes(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL
        )
        .is_err());
        assert!(transition_scopes(
            vk::ImageLayout::FRAGMENT_DENSITY_MAP_OPTIMAL_EXT,
            vk::ImageLayout::GENERAL
        )
        .is_err());
    }

    #[test]
    fn barrier_carries_layouts() {
        let barrier = image_transition(
            vk::Image::null(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        )
        .unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
    }
}
