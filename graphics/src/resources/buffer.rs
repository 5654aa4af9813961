//! GPU buffer wrapper.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::error::GraphicsError;

/// How a buffer will be used, which decides its usage flags and memory home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    /// Device-local shader storage, filled through a staged upload.
    Storage,
    /// Device-local index data, filled through a staged upload.
    Index,
    /// Host-visible, persistently mapped shader storage. Used for per-frame
    /// scene data that the CPU rewrites every frame.
    HostStorage,
    /// Host-visible, persistently mapped. Source side of staged uploads.
    Staging,
    /// Host-visible, persistently mapped. Destination side of staged
    /// downloads (GPU readback).
    Readback,
}

impl BufferClass {
    pub(crate) fn usage_flags(self) -> vk::BufferUsageFlags {
        match self {
            Self::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            Self::HostStorage => vk::BufferUsageFlags::STORAGE_BUFFER,
            Self::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            Self::Readback => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    pub(crate) fn memory_location(self) -> MemoryLocation {
        match self {
            Self::Storage | Self::Index => MemoryLocation::GpuOnly,
            Self::HostStorage | Self::Staging => MemoryLocation::CpuToGpu,
            Self::Readback => MemoryLocation::GpuToCpu,
        }
    }

    /// Whether a staged upload may target this class. Only the device-local
    /// classes qualify; host-visible buffers are written through their
    /// mapping instead.
    pub(crate) fn staged_upload_target(self) -> bool {
        matches!(self, Self::Storage | Self::Index)
    }
}

/// A Vulkan buffer plus its sub-allocation.
pub struct GpuBuffer {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    class: BufferClass,
    element_count: u32,
}

impl GpuBuffer {
    /// Create a buffer of `size` bytes from the shared allocator.
    pub fn create(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        size: u64,
        class: BufferClass,
        name: &str,
    ) -> Result<Self, GraphicsError> {
        if size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(class.usage_flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create buffer: {:?}", e))
        })?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: class.memory_location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { device.destroy_buffer(buffer, None) };
                match e {
                    gpu_allocator::AllocationError::OutOfMemory => GraphicsError::OutOfMemory,
                    other => GraphicsError::ResourceCreationFailed(format!(
                        "Failed to allocate buffer memory: {}",
                        other
                    )),
                }
            })?;

        if let Err(e) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            let _ = allocator.lock().free(allocation);
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "Failed to bind buffer memory: {:?}",
                e
            )));
        }

        Ok(Self {
            device: device.clone(),
            allocator: Arc::clone(allocator),
            buffer,
            allocation: Some(allocation),
            size,
            class,
            element_count: 0,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn class(&self) -> BufferClass {
        self.class
    }

    /// Number of elements for index buffers; zero for other classes.
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn set_element_count(&mut self, count: u32) {
        self.element_count = count;
    }

    /// Copy `data` into a persistently mapped buffer at `offset`.
    ///
    /// Only valid for the host-visible classes ([`BufferClass::Staging`] and
    /// [`BufferClass::HostStorage`]); device-local buffers go through the
    /// staged upload path instead.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        if offset + data.len() as u64 > self.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.size
            )));
        }

        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(
                    "buffer is not host-visible, use a staged upload".to_string(),
                )
            })?;

        // SAFETY: mapped_ptr covers the whole allocation and the range check
        // above keeps the copy inside it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (mapped.as_ptr() as *mut u8).add(offset as usize),
                data.len(),
            );
        }

        Ok(())
    }

    /// Copy `out.len()` bytes out of a persistently mapped buffer at
    /// `offset`.
    ///
    /// The host-visible counterpart of [`write`](Self::write); device-local
    /// buffers are read back through a staged download instead.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        if offset + out.len() as u64 > self.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "read of {} bytes at offset {} exceeds buffer size {}",
                out.len(),
                offset,
                self.size
            )));
        }

        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(
                    "buffer is not host-visible, use a staged download".to_string(),
                )
            })?;

        // SAFETY: mapped_ptr covers the whole allocation and the range check
        // above keeps the copy inside it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (mapped.as_ptr() as *const u8).add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }

        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer allocation: {}", e);
            }
        }
        unsafe { self.device.destroy_buffer(self.buffer, None) };
    }
}
