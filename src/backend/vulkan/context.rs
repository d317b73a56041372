// Vulkan context - instance, GPU and logical device
//
// Responsibilities:
// - Instance creation with validation layers and every available surface extension
// - Physical device selection (Vulkan 1.3, prefer discrete GPU)
// - Logical device + queue creation with dynamic rendering
// - Memory allocator setup
//
// Every Vulkan object in the backend holds an `Arc<VulkanContext>`, so the
// device outlives all of them regardless of drop order in the frontend.

use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;

use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;

use crate::rhi::{BackendKind, RhiError, RhiResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions enabled whenever the loader offers them. Which window
/// system a surface comes from is only known later, when a swap chain is built.
const SURFACE_EXTENSIONS: [&CStr; 7] = [
    ash::khr::surface::NAME,
    ash::khr::win32_surface::NAME,
    ash::khr::xlib_surface::NAME,
    ash::khr::xcb_surface::NAME,
    ash::khr::wayland_surface::NAME,
    ash::khr::android_surface::NAME,
    ash::ext::metal_surface::NAME,
];

pub struct VulkanContext {
    // Vulkan handles (destroyed explicitly in Drop, allocator first)
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles; vkQueueSubmit and vkQueuePresentKHR need external sync
    pub queue: Mutex<vk::Queue>,
    pub queue_family: u32,
    pub compute_capable: bool,

    // Extension loaders
    pub surface_loader: Option<ash::khr::surface::Instance>,
    pub swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub validation: bool,
}

fn init_err(reason: impl Into<String>) -> RhiError {
    RhiError::BackendInit {
        backend: BackendKind::Vulkan,
        reason: reason.into(),
    }
}

fn unavailable(reason: impl Into<String>) -> RhiError {
    RhiError::BackendUnavailable {
        backend: BackendKind::Vulkan,
        reason: reason.into(),
    }
}

impl VulkanContext {
    pub fn new(app_name: &str, enable_validation: bool) -> RhiResult<Self> {
        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .map_err(|e| unavailable(format!("failed to load the Vulkan loader: {e}")))?;

        // Step 2: Create instance
        let (instance, surface_enabled, validation) =
            Self::create_instance(&entry, app_name, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    log::warn!("Debug messenger unavailable: {e:?}");
                    None
                }
            }
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let picked = Self::pick_physical_device(&instance);
        let (physical_device, queue_family) = match picked {
            Ok(found) => found,
            Err(e) => {
                unsafe { Self::destroy_instance(&instance, debug_utils) };
                return Err(e);
            }
        };

        // Step 5: Create logical device
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let (device, queue) =
            match Self::create_logical_device(&instance, physical_device, queue_family, &features) {
                Ok(created) => created,
                Err(e) => {
                    unsafe { Self::destroy_instance(&instance, debug_utils) };
                    return Err(e);
                }
            };

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let family_flags = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        }[queue_family as usize]
            .queue_flags;

        log::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .map(CStr::to_string_lossy)
                .unwrap_or_default()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 7: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    Self::destroy_instance(&instance, debug_utils);
                }
                return Err(init_err(format!("failed to create memory allocator: {e}")));
            }
        };

        let surface_loader =
            surface_enabled.then(|| ash::khr::surface::Instance::new(&entry, &instance));
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            queue: Mutex::new(queue),
            queue_family,
            compute_capable: family_flags.contains(vk::QueueFlags::COMPUTE),
            surface_loader,
            swapchain_loader,
            debug_utils,
            properties,
            memory_properties,
            features,
            validation,
        })
    }

    /// Returns the instance, whether surface support is enabled, and whether
    /// validation layers are active.
    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> RhiResult<(ash::Instance, bool, bool)> {
        let app_name_cstr = CString::new(app_name).map_err(|e| init_err(e.to_string()))?;
        let engine_name = c"tri-rhi";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let available = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(|e| unavailable(format!("cannot enumerate instance extensions: {e}")))?;
        let has_extension = |name: &CStr| {
            available
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(name))
        };

        let mut extensions: Vec<*const c_char> = SURFACE_EXTENSIONS
            .iter()
            .filter(|name| has_extension(name))
            .map(|name| name.as_ptr())
            .collect();
        let surface_enabled = has_extension(ash::khr::surface::NAME);
        if !surface_enabled {
            log::warn!("VK_KHR_surface not available; window presentation disabled");
        }

        // Validation layers
        let validation = enable_validation && {
            let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
            let found = layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
            if !found {
                log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }
            found
        };
        if validation && has_extension(ash::ext::debug_utils::NAME) {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| match e {
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
                unavailable("no Vulkan 1.3 capable driver installed")
            }
            other => init_err(format!("failed to create Vulkan instance: {other}")),
        })?;

        Ok((instance, surface_enabled, validation))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), vk::Result> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> RhiResult<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| unavailable(format!("cannot enumerate GPUs: {e}")))?;

        if devices.is_empty() {
            return Err(unavailable("no Vulkan-capable GPU found"));
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if props.api_version < vk::API_VERSION_1_3 {
                continue;
            }

            // Find graphics queue family, preferring one that can also compute
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let graphics_family = queue_families
                .iter()
                .enumerate()
                .filter(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .max_by_key(|(_, props)| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| unavailable("no GPU with Vulkan 1.3 and a graphics queue"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        supported: &vk::PhysicalDeviceFeatures,
    ) -> RhiResult<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities);

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        // Optional features are enabled only where the GPU has them
        let features = vk::PhysicalDeviceFeatures::default()
            .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
            .wide_lines(supported.wide_lines == vk::TRUE)
            .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features13);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| init_err(format!("failed to create logical device: {e}")))?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    unsafe fn destroy_instance(
        instance: &ash::Instance,
        debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    ) {
        if let Some((debug_utils, messenger)) = debug_utils {
            debug_utils.destroy_debug_utils_messenger(messenger, None);
        }
        instance.destroy_instance(None);
    }

    /// Size of the largest device-local heap
    pub fn device_memory(&self) -> u64 {
        let heaps = &self.memory_properties.memory_heaps
            [..self.memory_properties.memory_heap_count as usize];
        heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .max()
            .unwrap_or(0)
    }

    pub fn device_name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "Unknown Vulkan device".to_string())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        unsafe {
            let _ = self.device.device_wait_idle();
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            Self::destroy_instance(&self.instance, self.debug_utils.take());
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = p_callback_data
        .as_ref()
        .and_then(|data| data.message_as_c_str())
        .map(CStr::to_string_lossy)
        .unwrap_or_default();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message);
        }
        _ => {
            log::debug!("[Vulkan] {}", message);
        }
    }

    vk::FALSE
}
