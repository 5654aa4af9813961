//! GPU image wrapper.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::error::GraphicsError;

/// Creation parameters for a 2D device-local image.
#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    /// Allocation label shown in allocator reports.
    pub name: &'a str,
}

/// A Vulkan image with its view, sub-allocation and optional sampler.
pub struct GpuImage {
    device: ash::Device,
    allocator: Arc<Mutex<Allocator>>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    sampler: Option<vk::Sampler>,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect_mask: vk::ImageAspectFlags,
}

impl GpuImage {
    /// Create a device-local image and view.
    pub fn create(
        device: &ash::Device,
        allocator: &Arc<Mutex<Allocator>>,
        desc: &ImageDesc<'_>,
    ) -> Result<Self, GraphicsError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GraphicsError::InvalidParameter(
                "image extent must be non-zero".to_string(),
            ));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create image: {:?}", e))
        })?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: desc.name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { device.destroy_image(image, None) };
                match e {
                    gpu_allocator::AllocationError::OutOfMemory => GraphicsError::OutOfMemory,
                    other => GraphicsError::ResourceCreationFailed(format!(
                        "Failed to allocate image memory: {}",
                        other
                    )),
                }
            })?;

        if let Err(e) =
            unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        {
            let _ = allocator.lock().free(allocation);
            unsafe { device.destroy_image(image, None) };
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "Failed to bind image memory: {:?}",
                e
            )));
        }

        let aspect_mask = aspect_for_format(desc.format);

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                let _ = allocator.lock().free(allocation);
                unsafe { device.destroy_image(image, None) };
                return Err(GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create image view: {:?}",
                    e
                )));
            }
        };

        Ok(Self {
            device: device.clone(),
            allocator: Arc::clone(allocator),
            image,
            view,
            allocation: Some(allocation),
            sampler: None,
            format: desc.format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            aspect_mask,
        })
    }

    /// Attach a sampler with linear filtering, repeat addressing and the
    /// given anisotropy limit. Replaces a previously attached sampler.
    pub fn attach_sampler(&mut self, max_anisotropy: f32) -> Result<(), GraphicsError> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy > 1.0)
            .max_anisotropy(max_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create sampler: {:?}", e))
        })?;

        if let Some(old) = self.sampler.replace(sampler) {
            unsafe { self.device.destroy_sampler(old, None) };
        }

        Ok(())
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.aspect_mask
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler.take() {
                self.device.destroy_sampler(sampler, None);
            }
            self.device.destroy_image_view(self.view, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free image allocation: {}", e);
            }
        }
        unsafe { self.device.destroy_image(self.image, None) };
    }
}

/// Derive the aspect mask from the image format.
pub(crate) fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_for_color_format() {
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_aspect_for_depth_format() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
