//! Vulkan instance creation and configuration.

use std::ffi::{c_char, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::debug;
use crate::error::GraphicsError;

const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Validation layer name.
const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Startup configuration for the device context.
#[derive(Debug, Clone)]
pub struct InstanceParameters {
    /// Application name reported to the driver.
    pub application_name: String,
    /// Request the Khronos validation layer and a debug messenger.
    pub enable_validation: bool,
}

impl Default for InstanceParameters {
    fn default() -> Self {
        Self {
            application_name: "Vermilion".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

/// Create a Vulkan instance with the surface extensions the platform window
/// system requires, plus optional validation layers.
///
/// Returns the instance, debug messenger (if validation enabled), and debug
/// utils extension loader.
pub fn create_instance(
    entry: &ash::Entry,
    params: &InstanceParameters,
    display_handle: RawDisplayHandle,
) -> Result<
    (
        ash::Instance,
        Option<vk::DebugUtilsMessengerEXT>,
        Option<ash::ext::debug_utils::Instance>,
    ),
    GraphicsError,
> {
    let validation_available =
        params.enable_validation && check_validation_layer_support(entry);

    if params.enable_validation && !validation_available {
        log::warn!("Validation layers requested but not available");
    }

    let app_name = CString::new(params.application_name.as_str())
        .map_err(|_| GraphicsError::InvalidParameter("application name".to_string()))?;
    let engine_name = CString::new("Vermilion Engine").map_err(|_| {
        GraphicsError::Internal("engine name contains a null byte".to_string())
    })?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    // Surface extensions for the window system the display handle came from.
    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .map_err(|e| {
            GraphicsError::InitializationFailed(format!(
                "Failed to query surface extensions: {:?}",
                e
            ))
        })?
        .to_vec();

    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layer_names: Vec<*const c_char> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })?;

    let (debug_messenger, debug_utils) = if validation_available {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        let messenger = debug::create_debug_messenger(&debug_utils)?;
        (Some(messenger), Some(debug_utils))
    } else {
        (None, None)
    };

    log::info!(
        "Created Vulkan instance (validation: {})",
        validation_available
    );

    Ok((instance, debug_messenger, debug_utils))
}

/// Check if the validation layer is available.
fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let available_layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };

    for layer in &available_layers {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        if name == VALIDATION_LAYER_NAME {
            return true;
        }
    }

    false
}
