// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, device, queue and command pool. Everything here lives as
//! long as the renderer; per-generation objects hold an `Arc` to it.

use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::ffi::{CStr, CString};
use tracing::{debug, info};

#[cfg(debug_assertions)]
type DebugState = Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>;
#[cfg(not(debug_assertions))]
type DebugState = ();

#[cfg(debug_assertions)]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const DEPTH_CANDIDATES: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM,
];

pub struct VkContext {
    // Keeps the loader library mapped.
    _entry: Entry,
    pub(crate) instance: Instance,
    debug: DebugState,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) queue: vk::Queue,
    pub(crate) swapchain_loader: swapchain::Device,
    pub(crate) cmd_pool: vk::CommandPool,
    pub(crate) depth_format: vk::Format,
    pub(crate) memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl VkContext {
    // STRICT ORDER:
    // 1) instance with the platform WSI extensions
    // 2) surface from that instance
    // 3) physical device + queue family that can present to the surface
    // 4) device with VK_KHR_swapchain, then the command pool on its queue family
    pub fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        unsafe {
            let entry = Entry::load().context("load Vulkan loader")?;
            let (instance, validation) = create_instance(&entry, dh).context("create_instance")?;
            let mut rollback = Rollback::default();
            let inst = instance.clone();
            rollback.push(move || inst.destroy_instance(None));

            let debug = create_debug_messenger(&entry, &instance, validation);
            let mut dbg = debug.clone();
            rollback.push(move || destroy_debug_messenger(&mut dbg));

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
                .context("ash_window::create_surface")?;
            let surf_i = surface_loader.clone();
            rollback.push(move || surf_i.destroy_surface(surface, None));

            let (phys, queue_family) = pick_device_and_queue(&instance, &surface_loader, surface)?;
            let props = instance.get_physical_device_properties(phys);
            let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
            info!(
                "vk: device '{}' api {}.{} queue_family={}",
                name,
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version),
                queue_family
            );

            let (device, queue) = create_device(&instance, phys, queue_family)?;
            let dev = device.clone();
            rollback.push(move || dev.destroy_device(None));
            let swapchain_loader = swapchain::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                queue_family_index: queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let cmd_pool = device
                .create_command_pool(&pool_info, None)
                .context("create_command_pool")?;

            let depth_format = pick_depth_format(|fmt| {
                instance
                    .get_physical_device_format_properties(phys, fmt)
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            });
            let memory_props = instance.get_physical_device_memory_properties(phys);
            debug!("vk: depth format {:?}", depth_format);

            rollback.disarm();
            Ok(Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys,
                device,
                queue,
                swapchain_loader,
                cmd_pool,
                depth_format,
                memory_props,
            })
        }
    }
}

/// Teardown steps for a half-built context, run newest first on drop.
/// `disarm` once ownership has moved into the finished value.
#[derive(Default)]
struct Rollback {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Rollback {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

// Everything created from the device is owned by per-generation objects that
// hold an Arc to this context, so they are gone by the time this runs.
impl Drop for VkContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_command_pool(self.cmd_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&mut self.debug);
            self.instance.destroy_instance(None);
        }
    }
}

/// Returns the instance and whether validation (with debug utils) is enabled.
unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<(Instance, bool)> {
    let app = CString::new("kiln")?;

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_1,
        ..Default::default()
    };

    #[cfg_attr(not(debug_assertions), allow(unused_mut))]
    let mut ext_vec = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();

    #[cfg(debug_assertions)]
    let layers: Vec<*const std::ffi::c_char> = {
        let available = entry
            .enumerate_instance_layer_properties()
            .unwrap_or_default();
        let has_validation = available
            .iter()
            .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
        if has_validation {
            ext_vec.push(ext_debug::NAME.as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            tracing::warn!("vk: validation layer not installed; running without it");
            Vec::new()
        }
    };
    #[cfg(not(debug_assertions))]
    let layers: Vec<*const std::ffi::c_char> = Vec::new();

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_vec.len() as u32,
        pp_enabled_extension_names: ext_vec.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    let instance = entry.create_instance(&create_info, None)?;
    Ok((instance, !layers.is_empty()))
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance, enabled: bool) -> DebugState {
    if !enabled {
        return None;
    }
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match loader.create_debug_utils_messenger(&ci, None) {
        Ok(m) => Some((loader, m)),
        Err(e) => {
            debug!("vk: no debug messenger ({e:?})");
            None
        }
    }
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance, _enabled: bool) -> DebugState {}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(dbg: &mut DebugState) {
    if let Some((loader, m)) = dbg.take() {
        loader.destroy_debug_utils_messenger(m, None);
    }
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_dbg: &mut DebugState) {}

unsafe fn pick_device_and_queue(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    for phys in instance.enumerate_physical_devices()? {
        let has_swapchain = instance
            .enumerate_device_extension_properties(phys)
            .unwrap_or_default()
            .iter()
            .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);
        if !has_swapchain {
            continue;
        }

        let qprops = instance.get_physical_device_queue_family_properties(phys);
        for (i, q) in qprops.iter().enumerate() {
            if q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && surf_i
                    .get_physical_device_surface_support(phys, i as u32, surface)
                    .unwrap_or(false)
            {
                return Ok((phys, i as u32));
            }
        }
    }
    Err(anyhow!("no suitable physical device/queue family"))
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };
    let device_exts = [swapchain::NAME.as_ptr()];

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    let device = instance
        .create_device(phys, &dinfo, None)
        .context("create_device")?;
    let queue = device.get_device_queue(queue_family, 0);
    Ok((device, queue))
}

/// First depth format the device can use as an optimal-tiling attachment.
/// Prefers 32f, then 24+S8, then 32f+S8, then 16.
pub(crate) fn pick_depth_format(supported: impl Fn(vk::Format) -> bool) -> vk::Format {
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&fmt| supported(fmt))
        // most desktop GPUs support it
        .unwrap_or(vk::Format::D32_SFLOAT)
}

pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0 && props.memory_types[i as usize].property_flags.contains(req)
    })
}
