//! # Vermilion Graphics
//!
//! Device, resource and frame-synchronization layer of the Vermilion
//! renderer, built on Vulkan 1.3 dynamic rendering.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`DeviceContext`] - instance, discrete-GPU device, queues and surface
//! - [`GpuAllocator`] - pooled memory, staged uploads, texture loading
//! - [`Swapchain`] - presentable surface with resize-by-recreation
//! - [`FrameSynchronizer`] - fences, semaphores and per-frame command buffers
//! - [`Pipeline`] / [`BindingTemplate`] - push-descriptor resource binding
//! - [`RenderStats`] - smoothed CPU/GPU frame times and workload counters
//!
//! ## Example
//!
//! ```ignore
//! use vermilion_graphics::{DeviceContext, FrameSynchronizer, GpuAllocator, Swapchain};
//!
//! let ctx = DeviceContext::new(&params, display_handle, window_handle)?;
//! let allocator = GpuAllocator::new(&ctx)?;
//! let mut swapchain = Swapchain::create(&ctx, &allocator, true)?;
//! let mut frames = FrameSynchronizer::new(&ctx, &allocator, &swapchain, 64 * 1024)?;
//!
//! frames.begin_frame(&ctx, &allocator, &mut swapchain)?;
//! frames.begin(&swapchain, [0.0, 0.0, 0.0, 1.0]);
//! // record draws...
//! frames.end(&swapchain);
//! frames.end_frame(&swapchain)?;
//! ```

pub mod allocator;
pub mod barriers;
pub mod bindings;
pub mod debug;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod resources;
pub mod stats;
pub mod swapchain;

// Re-export main types for convenience
pub use allocator::GpuAllocator;
pub use bindings::{BindingKind, BindingTemplate, Descriptor};
pub use device::{DeviceCapabilities, DeviceContext};
pub use error::GraphicsError;
pub use frame::{FrameRing, FrameSynchronizer};
pub use instance::InstanceParameters;
pub use pipeline::{Pipeline, PipelineSettings};
pub use resources::{BufferClass, GpuBuffer, GpuImage, ImageDesc};
pub use stats::RenderStats;
pub use swapchain::{RenderTargets, Swapchain, DEPTH_FORMAT};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// This should be called before using any graphics functionality.
pub fn init() {
    log::info!("Vermilion Graphics v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
