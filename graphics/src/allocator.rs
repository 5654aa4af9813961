//! GPU memory allocation and staged uploads built on gpu-allocator.
//!
//! All device memory in the crate flows through one pooled [`GpuAllocator`].
//! Device-local buffers and images are filled by the staged upload paths
//! here, which record a one-time command buffer and block until the graphics
//! queue drains. These are load-time operations; the frame loop never calls
//! them.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;

use crate::barriers;
use crate::device::DeviceContext;
use crate::error::GraphicsError;
use crate::resources::{BufferClass, GpuBuffer, GpuImage, ImageDesc};

/// Pooled GPU memory allocator shared by every resource in the crate.
pub struct GpuAllocator {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    max_sampler_anisotropy: f32,
}

impl GpuAllocator {
    /// Create the allocator for a device context.
    pub fn new(ctx: &DeviceContext) -> Result<Self, GraphicsError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance().clone(),
            device: ctx.device().clone(),
            physical_device: ctx.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            GraphicsError::InitializationFailed(format!(
                "Failed to create memory allocator: {}",
                e
            ))
        })?;

        log::info!("Created GPU memory allocator");

        Ok(Self {
            device: ctx.device().clone(),
            allocator: Arc::new(Mutex::new(allocator)),
            max_sampler_anisotropy: ctx.capabilities().max_sampler_anisotropy,
        })
    }

    /// Shared handle for resource wrappers.
    pub fn inner(&self) -> &Arc<Mutex<Allocator>> {
        &self.allocator
    }

    /// Create an empty buffer of the given class.
    pub fn create_buffer(
        &self,
        size: u64,
        class: BufferClass,
        name: &str,
    ) -> Result<GpuBuffer, GraphicsError> {
        GpuBuffer::create(&self.device, &self.allocator, size, class, name)
    }

    /// Create a device-local storage buffer filled with `data`.
    pub fn create_storage_buffer(
        &self,
        ctx: &DeviceContext,
        data: &[u8],
        name: &str,
    ) -> Result<GpuBuffer, GraphicsError> {
        let buffer = self.create_buffer(data.len() as u64, BufferClass::Storage, name)?;
        self.upload_buffer(ctx, &buffer, data)?;
        Ok(buffer)
    }

    /// Create a device-local index buffer filled with `data`.
    ///
    /// `element_count` is the number of indices, used later by draw calls.
    pub fn create_index_buffer(
        &self,
        ctx: &DeviceContext,
        data: &[u8],
        element_count: u32,
        name: &str,
    ) -> Result<GpuBuffer, GraphicsError> {
        let mut buffer = self.create_buffer(data.len() as u64, BufferClass::Index, name)?;
        self.upload_buffer(ctx, &buffer, data)?;
        buffer.set_element_count(element_count);
        Ok(buffer)
    }

    /// Staged upload into a device-local buffer.
    ///
    /// Writes `data` to a transient host-visible staging buffer, records a
    /// copy in a one-time command buffer and blocks until the graphics queue
    /// is idle. The staging buffer is freed on return.
    pub fn upload_buffer(
        &self,
        ctx: &DeviceContext,
        dst: &GpuBuffer,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        debug_assert!(
            dst.class().staged_upload_target(),
            "staged upload into a host-visible buffer, write through its mapping instead"
        );
        if data.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "upload data must be non-empty".to_string(),
            ));
        }
        if data.len() as u64 > dst.size() {
            return Err(GraphicsError::InvalidParameter(format!(
                "upload of {} bytes exceeds buffer size {}",
                data.len(),
                dst.size()
            )));
        }

        let mut staging =
            self.create_buffer(data.len() as u64, BufferClass::Staging, "staging")?;
        staging.write(0, data)?;

        let cmd = ctx.begin_one_time_commands()?;
        let region = vk::BufferCopy::default().size(data.len() as u64);
        unsafe {
            self.device
                .cmd_copy_buffer(cmd, staging.handle(), dst.handle(), &[region]);
        }
        ctx.end_one_time_commands(cmd)?;

        Ok(())
    }

    /// Staged download from a device-local buffer.
    ///
    /// The mirror of [`upload_buffer`](Self::upload_buffer): copies `size`
    /// bytes into a transient readback buffer, blocks until the graphics
    /// queue is idle, and returns the contents. Load-time and test path only.
    pub fn download_buffer(
        &self,
        ctx: &DeviceContext,
        src: &GpuBuffer,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        debug_assert!(
            src.class().usage_flags().contains(vk::BufferUsageFlags::TRANSFER_SRC),
            "staged download from a buffer without transfer-source usage"
        );
        if size == 0 || size > src.size() {
            return Err(GraphicsError::InvalidParameter(format!(
                "download of {} bytes from a buffer of size {}",
                size,
                src.size()
            )));
        }

        let readback = self.create_buffer(size, BufferClass::Readback, "readback")?;

        let cmd = ctx.begin_one_time_commands()?;
        let region = vk::BufferCopy::default().size(size);
        unsafe {
            self.device
                .cmd_copy_buffer(cmd, src.handle(), readback.handle(), &[region]);
        }
        ctx.end_one_time_commands(cmd)?;

        let mut data = vec![0u8; size as usize];
        readback.read(0, &mut data)?;
        Ok(data)
    }

    /// Create an empty device-local image.
    pub fn create_image(&self, desc: &ImageDesc<'_>) -> Result<GpuImage, GraphicsError> {
        GpuImage::create(&self.device, &self.allocator, desc)
    }

    /// Staged upload of pixel data into an image, leaving it in
    /// `SHADER_READ_ONLY_OPTIMAL` layout.
    pub fn upload_image(
        &self,
        ctx: &DeviceContext,
        dst: &GpuImage,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        if data.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "upload data must be non-empty".to_string(),
            ));
        }

        let mut staging =
            self.create_buffer(data.len() as u64, BufferClass::Staging, "staging")?;
        staging.write(0, data)?;

        let extent = dst.extent();
        let cmd = ctx.begin_one_time_commands()?;

        barriers::transition_image(
            &self.device,
            cmd,
            dst.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            dst.aspect_mask(),
        );

        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: dst.aspect_mask(),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging.handle(),
                dst.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        barriers::transition_image(
            &self.device,
            cmd,
            dst.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            dst.aspect_mask(),
        );

        ctx.end_one_time_commands(cmd)?;

        Ok(())
    }

    /// Decode an image file to RGBA8, upload it and attach a sampler using
    /// the device anisotropy limit.
    pub fn load_image_from_file(
        &self,
        ctx: &DeviceContext,
        path: &Path,
    ) -> Result<GpuImage, GraphicsError> {
        let decoded = image::open(path)
            .map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to decode image {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_rgba8();

        let (width, height) = decoded.dimensions();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        let mut gpu_image = self.create_image(&ImageDesc {
            width,
            height,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            name: &name,
        })?;

        self.upload_image(ctx, &gpu_image, decoded.as_raw())?;
        gpu_image.attach_sampler(self.max_sampler_anisotropy)?;

        log::info!("Loaded texture {} ({}x{})", path.display(), width, height);

        Ok(gpu_image)
    }
}
