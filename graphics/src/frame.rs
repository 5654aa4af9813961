//! Frame pacing, per-slot synchronization objects and command recording.
//!
//! The synchronizer owns one slot per swapchain image. A slot bundles the
//! command buffer, the acquire and present semaphores, the in-flight fence
//! and a persistently mapped scene-data buffer. The CPU may run ahead of the
//! GPU by up to the slot count; the slot fence is always waited before its
//! command buffer is reused.
//!
//! A frame is recorded in four phases:
//! `begin_frame` (fence wait + acquire), `begin` (open the dynamic rendering
//! pass on the intermediate targets), `end` (close the pass and copy into the
//! presentable image), `end_frame` (submit + present + advance).

use ash::vk;

use crate::allocator::GpuAllocator;
use crate::barriers::BarrierBatch;
use crate::device::DeviceContext;
use crate::error::GraphicsError;
use crate::resources::{BufferClass, GpuBuffer};
use crate::stats::RenderStats;
use crate::swapchain::Swapchain;

/// Frame slot index arithmetic, separated out so the cycling behavior is
/// testable without a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRing {
    slot_count: usize,
    current: usize,
}

impl FrameRing {
    /// `slot_count` must be non-zero.
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0, "frame ring needs at least one slot");
        Self {
            slot_count,
            current: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Move to the next slot, wrapping at the slot count.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slot_count;
    }
}

/// Synchronization state for one in-flight frame.
struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    scene_buffer: GpuBuffer,
}

/// Owner of the frame loop: slots, acquired image index and statistics.
pub struct FrameSynchronizer {
    device: ash::Device,
    command_pool: vk::CommandPool,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    slots: Vec<FrameSlot>,
    ring: FrameRing,
    current_image: u32,
    scene_data_size: u64,
    stats: RenderStats,
}

impl FrameSynchronizer {
    /// Create one slot per swapchain image.
    ///
    /// `scene_data_size` is the byte capacity of each slot's persistently
    /// mapped scene-data buffer.
    pub fn new(
        ctx: &DeviceContext,
        allocator: &GpuAllocator,
        swapchain: &Swapchain,
        scene_data_size: u64,
    ) -> Result<Self, GraphicsError> {
        let stats = RenderStats::new(ctx.device(), ctx.capabilities().timestamp_period)?;
        let slots = create_slots(ctx, allocator, swapchain.image_count(), scene_data_size)?;

        log::info!("Created frame synchronizer with {} slots", slots.len());

        Ok(Self {
            device: ctx.device().clone(),
            command_pool: ctx.command_pool(),
            graphics_queue: ctx.graphics_queue(),
            present_queue: ctx.present_queue(),
            ring: FrameRing::new(slots.len()),
            slots,
            current_image: 0,
            scene_data_size,
            stats,
        })
    }

    /// Wait for the current slot's fence, handle resize, acquire the next
    /// presentable image and open the slot's command buffer.
    pub fn begin_frame(
        &mut self,
        ctx: &DeviceContext,
        allocator: &GpuAllocator,
        swapchain: &mut Swapchain,
    ) -> Result<(), GraphicsError> {
        if swapchain.check_resize(ctx, allocator)?
            && swapchain.image_count() != self.slots.len()
        {
            self.rebuild_slots(ctx, allocator, swapchain.image_count())?;
        }

        let slot = &self.slots[self.ring.current()];

        unsafe {
            self.device
                .wait_for_fences(&[slot.in_flight], true, u64::MAX)
        }
        .map_err(|e| GraphicsError::Internal(format!("Fence wait failed: {:?}", e)))?;

        let (image_index, suboptimal) = unsafe {
            swapchain.loader().acquire_next_image(
                swapchain.handle(),
                u64::MAX,
                slot.image_available,
                vk::Fence::null(),
            )
        }
        .map_err(map_surface_error)?;

        if suboptimal {
            log::warn!("Acquired suboptimal swapchain image");
        }
        self.current_image = image_index;

        // Reset only after a successful acquire, so an early return leaves
        // the slot still signaled.
        unsafe { self.device.reset_fences(&[slot.in_flight]) }
            .map_err(|e| GraphicsError::Internal(format!("Fence reset failed: {:?}", e)))?;

        unsafe {
            self.device
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| GraphicsError::Internal(format!("Command buffer reset failed: {:?}", e)))?;

        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe {
            self.device
                .begin_command_buffer(slot.command_buffer, &begin_info)
        }
        .map_err(|e| GraphicsError::Internal(format!("Command buffer begin failed: {:?}", e)))?;

        Ok(())
    }

    /// Open the rendering pass on the intermediate render targets.
    ///
    /// Resets the frame counters, writes the frame-start timestamp and sets
    /// viewport and scissor to the surface extent.
    pub fn begin(&mut self, swapchain: &Swapchain, clear_color: [f32; 4]) {
        let cmd = self.slots[self.ring.current()].command_buffer;
        let targets = swapchain.render_targets();
        let extent = swapchain.extent();

        self.stats.begin(cmd);

        let mut batch = BarrierBatch::new();
        batch.add_transition(
            targets.color.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        batch.add_transition(
            targets.depth.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            targets.depth.aspect_mask(),
        );
        batch.submit(&self.device, cmd);

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(targets.color.view())
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            });

        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(targets.depth.view())
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });

        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            self.device.cmd_begin_rendering(cmd, &rendering_info);
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    /// Close the rendering pass and copy the intermediate color image into
    /// the acquired presentable image, leaving it ready for present.
    pub fn end(&mut self, swapchain: &Swapchain) {
        let cmd = self.slots[self.ring.current()].command_buffer;
        let targets = swapchain.render_targets();
        let extent = swapchain.extent();
        let present_image = swapchain.image(self.current_image);

        unsafe { self.device.cmd_end_rendering(cmd) };

        self.stats.end_gpu(cmd);

        let mut batch = BarrierBatch::new();
        batch.add_transition(
            targets.color.handle(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        batch.add_transition(
            present_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        batch.submit(&self.device, cmd);

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy::default()
            .src_subresource(subresource)
            .dst_subresource(subresource)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_image(
                cmd,
                targets.color.handle(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                present_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        let mut batch = BarrierBatch::new();
        batch.add_transition(
            present_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );
        batch.submit(&self.device, cmd);
    }

    /// Submit the frame, present it and advance to the next slot.
    pub fn end_frame(&mut self, swapchain: &Swapchain) -> Result<(), GraphicsError> {
        let slot = &self.slots[self.ring.current()];
        let cmd = slot.command_buffer;

        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| GraphicsError::Internal(format!("Command buffer end failed: {:?}", e)))?;

        let wait_semaphores = [slot.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [slot.render_finished];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], slot.in_flight)
        }
        .map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
            other => GraphicsError::Internal(format!("Frame submit failed: {:?}", other)),
        })?;

        let swapchains = [swapchain.handle()];
        let image_indices = [self.current_image];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe {
            swapchain
                .loader()
                .queue_present(self.present_queue, &present_info)
        } {
            Ok(true) => log::warn!("Presented to a suboptimal swapchain"),
            Ok(false) => {}
            Err(e) => return Err(map_surface_error(e)),
        }

        self.ring.advance();
        self.stats.end_cpu()?;

        Ok(())
    }

    /// Copy scene data into the current slot's mapped buffer.
    ///
    /// Each slot has its own buffer, so data written here cannot race with a
    /// previous frame the GPU is still reading.
    pub fn set_scene_data(&mut self, data: &[u8]) -> Result<(), GraphicsError> {
        let slot = &mut self.slots[self.ring.current()];
        slot.scene_buffer.write(0, data)
    }

    /// Typed variant of [`set_scene_data`](Self::set_scene_data) for plain
    /// old data.
    pub fn set_scene<T: bytemuck::Pod>(&mut self, value: &T) -> Result<(), GraphicsError> {
        self.set_scene_data(bytemuck::bytes_of(value))
    }

    /// The current slot's scene-data buffer, for descriptor binding.
    pub fn scene_buffer(&self) -> &GpuBuffer {
        &self.slots[self.ring.current()].scene_buffer
    }

    /// The command buffer currently being recorded.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.slots[self.ring.current()].command_buffer
    }

    /// Index of the presentable image acquired by `begin_frame`.
    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RenderStats {
        &mut self.stats
    }

    fn rebuild_slots(
        &mut self,
        ctx: &DeviceContext,
        allocator: &GpuAllocator,
        count: usize,
    ) -> Result<(), GraphicsError> {
        log::info!(
            "Swapchain image count changed {} -> {}, rebuilding frame slots",
            self.slots.len(),
            count
        );

        ctx.wait_idle();
        self.destroy_slots();
        self.slots = create_slots(ctx, allocator, count, self.scene_data_size)?;
        self.ring = FrameRing::new(count);

        Ok(())
    }

    fn destroy_slots(&mut self) {
        let command_buffers: Vec<vk::CommandBuffer> =
            self.slots.iter().map(|s| s.command_buffer).collect();

        for slot in self.slots.drain(..) {
            unsafe {
                self.device.destroy_semaphore(slot.image_available, None);
                self.device.destroy_semaphore(slot.render_finished, None);
                self.device.destroy_fence(slot.in_flight, None);
            }
            // scene_buffer freed by its own Drop
        }

        if !command_buffers.is_empty() {
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &command_buffers)
            };
        }
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("device_wait_idle failed: {:?}", e);
        }
        self.destroy_slots();
    }
}

fn create_slots(
    ctx: &DeviceContext,
    allocator: &GpuAllocator,
    count: usize,
    scene_data_size: u64,
) -> Result<Vec<FrameSlot>, GraphicsError> {
    let device = ctx.device();
    let command_buffers = ctx.allocate_command_buffers(count as u32)?;

    let semaphore_info = vk::SemaphoreCreateInfo::default();
    // Signaled so the first wait on each slot passes immediately.
    let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

    let mut slots = Vec::with_capacity(count);
    for command_buffer in command_buffers {
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }
            .map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create semaphore: {:?}",
                    e
                ))
            })?;
        let render_finished = unsafe { device.create_semaphore(&semaphore_info, None) }
            .map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create semaphore: {:?}",
                    e
                ))
            })?;
        let in_flight = unsafe { device.create_fence(&fence_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create fence: {:?}", e))
        })?;

        let scene_buffer =
            allocator.create_buffer(scene_data_size, BufferClass::HostStorage, "scene data")?;

        slots.push(FrameSlot {
            command_buffer,
            image_available,
            render_finished,
            in_flight,
            scene_buffer,
        });
    }

    Ok(slots)
}

fn map_surface_error(result: vk::Result) -> GraphicsError {
    match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
            GraphicsError::SurfaceLost
        }
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        other => GraphicsError::Internal(format!("Surface operation failed: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_cycles_through_slots() {
        let mut ring = FrameRing::new(3);
        let mut observed = Vec::new();

        for _ in 0..10 {
            observed.push(ring.current());
            ring.advance();
        }

        assert_eq!(observed, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_ring_single_slot() {
        let mut ring = FrameRing::new(1);
        ring.advance();
        ring.advance();
        assert_eq!(ring.current(), 0);
    }

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn test_ring_rejects_zero_slots() {
        let _ = FrameRing::new(0);
    }

    #[test]
    fn test_surface_error_mapping() {
        assert_eq!(
            map_surface_error(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GraphicsError::SurfaceLost
        );
        assert_eq!(
            map_surface_error(vk::Result::ERROR_SURFACE_LOST_KHR),
            GraphicsError::SurfaceLost
        );
        assert_eq!(
            map_surface_error(vk::Result::ERROR_DEVICE_LOST),
            GraphicsError::DeviceLost
        );
        assert!(matches!(
            map_surface_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            GraphicsError::Internal(_)
        ));
    }
}
