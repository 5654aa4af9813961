//! Physical device selection, logical device and the owning device context.

use std::ffi::{c_char, CStr};

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::GraphicsError;
use crate::instance::{self, InstanceParameters};

/// Device extensions every selected GPU must expose.
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 3] = [
    ash::khr::swapchain::NAME,
    ash::khr::dynamic_rendering::NAME,
    ash::khr::push_descriptor::NAME,
];

/// Immutable snapshot of the selected GPU's properties.
///
/// Captured once during device selection; consumers read it instead of
/// re-querying the driver.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Driver-reported device name.
    pub device_name: String,
    /// Queue family used for graphics and transfer submissions.
    pub graphics_family: u32,
    /// Queue family able to present to the surface. May equal `graphics_family`.
    pub present_family: u32,
    /// Memory heap and type description.
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Nanoseconds per timestamp query tick.
    pub timestamp_period: f32,
    /// Upper limit for sampler anisotropy.
    pub max_sampler_anisotropy: f32,
    /// Highest sample count supported by both color and depth framebuffers.
    pub max_msaa_samples: vk::SampleCountFlags,
}

/// Select a discrete GPU that supports the required extensions, features and
/// queue families.
///
/// There is no integrated or software fallback. When nothing qualifies the
/// returned error is meant to abort startup.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, DeviceCapabilities), GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            log::info!("Skipping non-discrete GPU: {}", device_name);
            continue;
        }

        let features = unsafe { instance.get_physical_device_features(device) };
        if features.sampler_anisotropy == vk::FALSE {
            log::info!("Skipping GPU without sampler anisotropy: {}", device_name);
            continue;
        }

        if !supports_required_extensions(instance, device) {
            log::info!("Skipping GPU missing required extensions: {}", device_name);
            continue;
        }

        let Some((graphics_family, present_family)) =
            find_queue_families(instance, surface_loader, surface, device)?
        else {
            log::info!("Skipping GPU without usable queue families: {}", device_name);
            continue;
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(device) };
        let max_msaa_samples = max_sample_count(&properties.limits);

        log::info!(
            "Selected GPU: {} (graphics family {}, present family {})",
            device_name,
            graphics_family,
            present_family
        );

        let capabilities = DeviceCapabilities {
            device_name,
            graphics_family,
            present_family,
            memory_properties,
            timestamp_period: properties.limits.timestamp_period,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            max_msaa_samples,
        };

        return Ok((device, capabilities));
    }

    Err(GraphicsError::InitializationFailed(
        "No suitable discrete GPU found".to_string(),
    ))
}

fn supports_required_extensions(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> bool {
    let available = match unsafe { instance.enumerate_device_extension_properties(device) } {
        Ok(extensions) => extensions,
        Err(_) => return false,
    };

    REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
        available.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == *required
        })
    })
}

/// Find a graphics queue family and a present-capable queue family.
///
/// Returns `Ok(None)` when the device has no usable combination.
fn find_queue_families(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Result<Option<(u32, u32)>, GraphicsError> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let mut graphics_family = None;
    let mut present_family = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;

        if graphics_family.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics_family = Some(index);
        }

        if present_family.is_none() {
            let supported = unsafe {
                surface_loader.get_physical_device_surface_support(device, index, surface)
            }
            .map_err(|e| {
                GraphicsError::InitializationFailed(format!(
                    "Failed to query surface support: {:?}",
                    e
                ))
            })?;
            if supported {
                present_family = Some(index);
            }
        }
    }

    Ok(graphics_family.zip(present_family))
}

/// Highest sample count both color and depth attachments support.
fn max_sample_count(limits: &vk::PhysicalDeviceLimits) -> vk::SampleCountFlags {
    let counts =
        limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;

    for candidate in [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ] {
        if counts.contains(candidate) {
            return candidate;
        }
    }

    vk::SampleCountFlags::TYPE_1
}

/// Create a logical device with one graphics queue and one present queue.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    capabilities: &DeviceCapabilities,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];

    let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(capabilities.graphics_family)
        .queue_priorities(&queue_priorities)];

    if capabilities.present_family != capabilities.graphics_family {
        queue_create_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(capabilities.present_family)
                .queue_priorities(&queue_priorities),
        );
    }

    let device_extensions: Vec<*const c_char> = REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .map(|name| name.as_ptr())
        .collect();

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features)
        .push_next(&mut vulkan_13_features);

    let device =
        unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
        })?;

    Ok(device)
}

/// Owner of the Vulkan instance, surface, logical device and queues.
///
/// Every other component borrows the context at construction time; nothing in
/// this crate reaches for global state. The context must outlive everything
/// created from it.
pub struct DeviceContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    capabilities: DeviceCapabilities,
    device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    swapchain_loader: ash::khr::swapchain::Device,
    push_descriptor_loader: ash::khr::push_descriptor::Device,
    command_pool: vk::CommandPool,
}

impl DeviceContext {
    /// Initialize the full device stack for a window.
    ///
    /// Ordering: entry, instance, surface, physical device, logical device,
    /// queues, extension loaders, command pool. Any failure aborts the whole
    /// construction.
    pub fn new(
        params: &InstanceParameters,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self, GraphicsError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan library: {}", e))
        })?;

        let (instance, debug_messenger, debug_utils) =
            instance::create_instance(&entry, params, display_handle)?;

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create surface: {:?}", e))
        })?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let (physical_device, capabilities) =
            select_physical_device(&instance, &surface_loader, surface)?;

        let device = create_logical_device(&instance, physical_device, &capabilities)?;

        let graphics_queue =
            unsafe { device.get_device_queue(capabilities.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(capabilities.present_family, 0) };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let push_descriptor_loader = ash::khr::push_descriptor::Device::new(&instance, &device);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(capabilities.graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| {
                GraphicsError::InitializationFailed(format!(
                    "Failed to create command pool: {:?}",
                    e
                ))
            })?;

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
            surface_loader,
            surface,
            physical_device,
            capabilities,
            device,
            graphics_queue,
            present_queue,
            swapchain_loader,
            push_descriptor_loader,
            command_pool,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    pub fn push_descriptor_loader(&self) -> &ash::khr::push_descriptor::Device {
        &self.push_descriptor_loader
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Current surface capabilities (extent, image count limits, transforms).
    pub fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR, GraphicsError> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .map_err(|e| {
            GraphicsError::Internal(format!("Failed to query surface capabilities: {:?}", e))
        })
    }

    /// Formats the surface can present.
    pub fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>, GraphicsError> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }
        .map_err(|e| GraphicsError::Internal(format!("Failed to query surface formats: {:?}", e)))
    }

    /// Present modes the surface supports.
    pub fn surface_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>, GraphicsError> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }
        .map_err(|e| {
            GraphicsError::Internal(format!("Failed to query present modes: {:?}", e))
        })
    }

    /// Allocate primary command buffers from the shared pool.
    pub fn allocate_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>, GraphicsError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.allocate_command_buffers(&alloc_info) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to allocate command buffers: {:?}",
                e
            ))
        })
    }

    /// Begin a one-time-submit command buffer for load-time transfers.
    pub fn begin_one_time_commands(&self) -> Result<vk::CommandBuffer, GraphicsError> {
        let cmd = self.allocate_command_buffers(1)?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }.map_err(|e| {
            GraphicsError::Internal(format!("Failed to begin command buffer: {:?}", e))
        })?;

        Ok(cmd)
    }

    /// Submit a one-time command buffer on the graphics queue and block until
    /// the queue drains. Load-time path only; never call inside the frame loop.
    pub fn end_one_time_commands(&self, cmd: vk::CommandBuffer) -> Result<(), GraphicsError> {
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| GraphicsError::Internal(format!("Failed to end command buffer: {:?}", e)))?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        let result = unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                .and_then(|_| self.device.queue_wait_idle(self.graphics_queue))
        };

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &command_buffers)
        };

        result.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
            other => GraphicsError::Internal(format!("Transfer submit failed: {:?}", other)),
        })
    }

    /// Block until the device is idle. Used before teardown and after
    /// swapchain recreation.
    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("device_wait_idle failed: {:?}", e);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // Teardown mirrors construction in reverse. GPU work must be done
        // before handles go away.
        self.wait_idle();

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let (Some(debug_utils), Some(messenger)) =
                (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }

        log::info!("Destroyed device context");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(DeviceCapabilities: Send, Sync);
    assert_impl_all!(DeviceContext: Send);

    #[test]
    fn test_max_sample_count_picks_highest_common() {
        let mut limits = vk::PhysicalDeviceLimits::default();
        limits.framebuffer_color_sample_counts =
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4 | vk::SampleCountFlags::TYPE_8;
        limits.framebuffer_depth_sample_counts =
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4;

        assert_eq!(max_sample_count(&limits), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn test_max_sample_count_falls_back_to_one() {
        let limits = vk::PhysicalDeviceLimits::default();
        assert_eq!(max_sample_count(&limits), vk::SampleCountFlags::TYPE_1);
    }
}
