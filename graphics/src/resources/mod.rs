//! RAII wrappers for GPU buffers and images.
//!
//! Wrappers own their Vulkan handles and their `gpu-allocator` allocation and
//! release both exactly once on drop. Dropping a resource while the GPU may
//! still read it is prevented by the frame fence discipline, not by the
//! wrappers themselves.

mod buffer;
mod image;

pub use buffer::{BufferClass, GpuBuffer};
pub use image::{GpuImage, ImageDesc};
