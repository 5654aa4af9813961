//! Presentable surface lifecycle and intermediate render targets.
//!
//! The frame renders into intermediate color and depth images, then copies
//! the color image into the acquired presentable image. Resize is handled by
//! full recreation of the chain and its dependent images, never by patching
//! in place.

use ash::vk;

use crate::allocator::GpuAllocator;
use crate::device::DeviceContext;
use crate::error::GraphicsError;
use crate::resources::{GpuImage, ImageDesc};

/// Depth format used by the intermediate render targets.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Preferred 8-bit-per-channel surface formats, in order.
const PREFERRED_FORMATS: [vk::Format; 2] =
    [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

/// Pick a surface format, preferring 8-bit-per-channel UNORM.
///
/// Falls back to the first reported format when no preference matches.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    for preferred in PREFERRED_FORMATS {
        if let Some(format) = formats.iter().find(|f| f.format == preferred) {
            return Some(*format);
        }
    }
    formats.first().copied()
}

/// Pick a present mode.
///
/// With vsync on this is always FIFO. Otherwise the preference order is
/// MAILBOX, IMMEDIATE, then FIFO, restricted to what the surface reports.
pub fn choose_present_mode(
    vsync: bool,
    available: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    for preferred in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
        if available.contains(&preferred) {
            return preferred;
        }
    }

    vk::PresentModeKHR::FIFO
}

/// Whether the chain must be recreated for the reported extent.
///
/// A zero-sized extent means a minimized window; nothing can be presented,
/// so the chain is left alone.
pub fn needs_recreation(current: vk::Extent2D, reported: vk::Extent2D) -> bool {
    if reported.width == 0 || reported.height == 0 {
        return false;
    }
    current != reported
}

/// Intermediate color and depth images the frame renders into.
///
/// Recreated together with the swapchain on resize.
pub struct RenderTargets {
    pub color: GpuImage,
    pub depth: GpuImage,
}

impl RenderTargets {
    pub fn create(
        allocator: &GpuAllocator,
        extent: vk::Extent2D,
        color_format: vk::Format,
    ) -> Result<Self, GraphicsError> {
        let color = allocator.create_image(&ImageDesc {
            width: extent.width,
            height: extent.height,
            format: color_format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            name: "render target color",
        })?;

        let depth = allocator.create_image(&ImageDesc {
            width: extent.width,
            height: extent.height,
            format: DEPTH_FORMAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            name: "render target depth",
        })?;

        Ok(Self { color, depth })
    }
}

/// The swapchain, its images and views, and the render targets that depend
/// on its extent.
pub struct Swapchain {
    device: ash::Device,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    targets: RenderTargets,
    vsync: bool,
}

impl Swapchain {
    /// Create the swapchain at the surface's current extent.
    pub fn create(
        ctx: &DeviceContext,
        allocator: &GpuAllocator,
        vsync: bool,
    ) -> Result<Self, GraphicsError> {
        let (swapchain, format, extent, images, views) = create_chain(ctx, vsync)?;
        let targets = RenderTargets::create(allocator, extent, format.format)?;

        log::info!(
            "Created swapchain: {}x{}, {} images, format {:?}, vsync {}",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            vsync
        );

        Ok(Self {
            device: ctx.device().clone(),
            loader: ctx.swapchain_loader().clone(),
            swapchain,
            format,
            extent,
            images,
            views,
            targets,
            vsync,
        })
    }

    /// Recreate the chain and render targets when the surface extent no
    /// longer matches.
    ///
    /// Waits for full device idle after recreation. Returns `true` if a
    /// recreation happened.
    pub fn check_resize(
        &mut self,
        ctx: &DeviceContext,
        allocator: &GpuAllocator,
    ) -> Result<bool, GraphicsError> {
        let capabilities = ctx.surface_capabilities()?;
        let current = capabilities.current_extent;

        if !needs_recreation(self.extent, current) {
            return Ok(false);
        }

        log::info!(
            "Surface resized {}x{} -> {}x{}, recreating swapchain",
            self.extent.width,
            self.extent.height,
            current.width,
            current.height
        );

        ctx.wait_idle();
        self.destroy_chain();

        let (swapchain, format, extent, images, views) = create_chain(ctx, self.vsync)?;
        self.swapchain = swapchain;
        self.format = format;
        self.extent = extent;
        self.images = images;
        self.views = views;
        self.targets = RenderTargets::create(allocator, extent, format.format)?;

        ctx.wait_idle();

        Ok(true)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    pub fn view(&self, index: u32) -> vk::ImageView {
        self.views[index as usize]
    }

    pub fn render_targets(&self) -> &RenderTargets {
        &self.targets
    }

    pub fn loader(&self) -> &ash::khr::swapchain::Device {
        &self.loader
    }

    fn destroy_chain(&mut self) {
        unsafe {
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_chain();
    }
}

type ChainParts = (
    vk::SwapchainKHR,
    vk::SurfaceFormatKHR,
    vk::Extent2D,
    Vec<vk::Image>,
    Vec<vk::ImageView>,
);

fn create_chain(ctx: &DeviceContext, vsync: bool) -> Result<ChainParts, GraphicsError> {
    let capabilities = ctx.surface_capabilities()?;
    let formats = ctx.surface_formats()?;
    let present_modes = ctx.surface_present_modes()?;

    let format = choose_surface_format(&formats).ok_or_else(|| {
        GraphicsError::InitializationFailed("surface reports no formats".to_string())
    })?;
    let present_mode = choose_present_mode(vsync, &present_modes);
    let extent = capabilities.current_extent;

    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }

    let caps = ctx.capabilities();
    let queue_families = [caps.graphics_family, caps.present_family];

    let mut create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(ctx.surface())
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);

    // Graphics and present on different families share the images.
    create_info = if caps.graphics_family != caps.present_family {
        create_info
            .image_sharing_mode(vk::SharingMode::CONCURRENT)
            .queue_family_indices(&queue_families)
    } else {
        create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
    };

    let loader = ctx.swapchain_loader();
    let swapchain = unsafe { loader.create_swapchain(&create_info, None) }.map_err(|e| {
        GraphicsError::ResourceCreationFailed(format!("Failed to create swapchain: {:?}", e))
    })?;

    let images = unsafe { loader.get_swapchain_images(swapchain) }.map_err(|e| {
        unsafe { loader.destroy_swapchain(swapchain, None) };
        GraphicsError::ResourceCreationFailed(format!(
            "Failed to get swapchain images: {:?}",
            e
        ))
    })?;

    let mut views = Vec::with_capacity(images.len());
    for &image in &images {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { ctx.device().create_image_view(&view_info, None) } {
            Ok(view) => views.push(view),
            Err(e) => {
                unsafe {
                    for view in views {
                        ctx.device().destroy_image_view(view, None);
                    }
                    loader.destroy_swapchain(swapchain, None);
                }
                return Err(GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create swapchain image view: {:?}",
                    e
                )));
            }
        }
    }

    debug_assert_eq!(images.len(), views.len());

    Ok((swapchain, format, extent, images, views))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_format_prefers_bgra_unorm() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT),
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_UNORM),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_format_falls_back_to_first() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT),
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn test_format_empty_list() {
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_needs_recreation_on_extent_mismatch() {
        let current = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let grown = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        assert!(needs_recreation(current, grown));
        assert!(!needs_recreation(current, current));
    }

    #[test]
    fn test_needs_recreation_skips_minimized_window() {
        let current = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let minimized = vk::Extent2D {
            width: 0,
            height: 0,
        };
        assert!(!needs_recreation(current, minimized));
    }

    #[rstest]
    #[case(true, vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO], vk::PresentModeKHR::FIFO)]
    #[case(false, vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX)]
    #[case(false, vec![vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO], vk::PresentModeKHR::IMMEDIATE)]
    #[case(false, vec![vk::PresentModeKHR::FIFO], vk::PresentModeKHR::FIFO)]
    #[case(false, vec![], vk::PresentModeKHR::FIFO)]
    fn test_present_mode_selection(
        #[case] vsync: bool,
        #[case] available: Vec<vk::PresentModeKHR>,
        #[case] expected: vk::PresentModeKHR,
    ) {
        assert_eq!(choose_present_mode(vsync, &available), expected);
    }
}
