//! Batched image layout transitions using synchronization2.
//!
//! The frame loop transitions a handful of images at fixed points (render
//! target to transfer source, presentable image to present). Transitions are
//! collected per image and submitted as one `vkCmdPipelineBarrier2` call.

use std::collections::HashMap;

use ash::vk;

/// A batch of image memory barriers to submit together.
///
/// Barriers are keyed by image handle; adding a second transition for the
/// same image replaces the first. Transitions where old and new layout match
/// are skipped.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    barriers: HashMap<u64, ImageBarrierInfo>,
}

#[derive(Debug, Clone)]
struct ImageBarrierInfo {
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    aspect_mask: vk::ImageAspectFlags,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a layout transition for an image.
    pub fn add_transition(
        &mut self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        aspect_mask: vk::ImageAspectFlags,
    ) {
        if old_layout == new_layout {
            return;
        }

        use ash::vk::Handle;
        self.barriers.insert(
            image.as_raw(),
            ImageBarrierInfo {
                image,
                old_layout,
                new_layout,
                aspect_mask,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    /// Record all queued barriers as a single pipeline barrier.
    ///
    /// Does nothing if the batch is empty.
    pub fn submit(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }

        let barriers: Vec<vk::ImageMemoryBarrier2> = self
            .barriers
            .values()
            .map(|info| {
                let (src_stage, src_access) = source_sync(info.old_layout);
                let (dst_stage, dst_access) = destination_sync(info.new_layout);

                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .old_layout(info.old_layout)
                    .new_layout(info.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(info.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: info.aspect_mask,
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    })
            })
            .collect();

        let dependency_info = vk::DependencyInfo::default()
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .image_memory_barriers(&barriers);

        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    /// Drop all queued barriers.
    pub fn clear(&mut self) {
        self.barriers.clear();
    }
}

/// Record a single layout transition immediately.
pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    aspect_mask: vk::ImageAspectFlags,
) {
    let mut batch = BarrierBatch::new();
    batch.add_transition(image, old_layout, new_layout, aspect_mask);
    batch.submit(device, cmd);
}

/// Stage and access the GPU must finish before leaving a layout.
fn source_sync(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_READ,
        ),
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

/// Stage and access that must wait for a layout to become valid.
fn destination_sync(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_READ,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE)
        }
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_barrier_batch_empty() {
        let batch = BarrierBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }

    #[test]
    fn test_barrier_batch_skip_same_layout() {
        let mut batch = BarrierBatch::new();
        let image = vk::Image::from_raw(12345);

        batch.add_transition(
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );

        assert!(batch.is_empty());
    }

    #[test]
    fn test_barrier_batch_deduplicates_per_image() {
        let mut batch = BarrierBatch::new();
        let image = vk::Image::from_raw(12345);

        batch.add_transition(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        batch.add_transition(
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );

        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_barrier_batch_multiple_images() {
        let mut batch = BarrierBatch::new();

        batch.add_transition(
            vk::Image::from_raw(11111),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        batch.add_transition(
            vk::Image::from_raw(22222),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );

        assert_eq!(batch.len(), 2);

        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_undefined_source_has_no_access() {
        let (stage, access) = source_sync(vk::ImageLayout::UNDEFINED);
        assert_eq!(stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn test_present_destination_has_no_access() {
        let (stage, access) = destination_sync(vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(stage, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        assert_eq!(access, vk::AccessFlags2::NONE);
    }
}
