//! Instance, device and queue bootstrap.

use std::ffi::{CStr, c_char};

use ash::{khr, vk};
use tracing::{debug, info, warn};
use wgprobe_core::error::{ProbeError, Result};

/// Map an `ash` call failure into a driver error.
pub(crate) fn vk_err(call: &'static str) -> impl FnOnce(vk::Result) -> ProbeError {
    move |result| ProbeError::Driver {
        call,
        detail: format!("{result:?}"),
    }
}

/// Decode a fixed-size, NUL-terminated driver string.
pub(crate) fn fixed_str(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Everything up to and including the logical device.
pub struct VulkanContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Present only when the device was created for counter acquisition.
    pub perf: Option<PerfQueryFns>,
}

/// `VK_KHR_performance_query` entry points.
#[derive(Clone)]
pub struct PerfQueryFns {
    pub instance: khr::performance_query::Instance,
    pub device: khr::performance_query::Device,
}

impl std::fmt::Debug for VulkanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanContext")
            .field("physical_device", &self.physical_device)
            .field("queue_family", &self.queue_family)
            .field("measured", &self.perf.is_some())
            .finish()
    }
}

impl VulkanContext {
    /// Bring up a Vulkan 1.1 instance on the first physical device and its
    /// first compute-capable queue family.
    ///
    /// With `measured`, the device is created with `VK_KHR_performance_query`,
    /// `performanceCounterQueryPools` and `pipelineStatisticsQuery`; missing
    /// support is a [`ProbeError::MissingExtension`].
    pub fn new(measured: bool) -> Result<Self> {
        // SAFETY: loading the system Vulkan loader has no preconditions
        // beyond the library being a conforming loader.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| ProbeError::Loader(format!("failed to load Vulkan: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"wgprobe")
            .application_version(vk::make_api_version(0, 0, 3, 0))
            .engine_name(c"wgprobe")
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        // SAFETY: create_info and app_info outlive the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(vk_err("vkCreateInstance"))?;

        match Self::with_instance(entry, instance, measured) {
            Ok(ctx) => Ok(ctx),
            Err((instance, err)) => {
                // SAFETY: nothing created from the instance survived.
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    fn with_instance(
        entry: ash::Entry,
        instance: ash::Instance,
        measured: bool,
    ) -> std::result::Result<Self, (ash::Instance, ProbeError)> {
        macro_rules! bail {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(err) => return Err((instance, err)),
                }
            };
        }

        // SAFETY: instance is valid for the duration of these queries.
        let physical_devices = bail!(
            unsafe { instance.enumerate_physical_devices() }
                .map_err(vk_err("vkEnumeratePhysicalDevices"))
        );
        let Some(&physical_device) = physical_devices.first() else {
            return Err((instance, ProbeError::Device("no Vulkan physical device".into())));
        };
        // SAFETY: physical_device was returned by this instance.
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        info!(
            device = %fixed_str(&properties.device_name),
            api = format!(
                "{}.{}.{}",
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version),
                vk::api_version_patch(properties.api_version)
            ),
            "selected physical device"
        );

        // SAFETY: as above.
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let Some(queue_family) = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|i| i as u32)
        else {
            return Err((instance, ProbeError::Device("no compute queue family".into())));
        };
        debug!(queue_family, "using compute queue family");

        if measured {
            bail!(require_perf_support(&instance, physical_device));
        }

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)];
        let extensions = [khr::performance_query::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default().pipeline_statistics_query(measured);
        let mut perf_features = vk::PhysicalDevicePerformanceQueryFeaturesKHR::default()
            .performance_counter_query_pools(true);

        let mut device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_features(&features);
        if measured {
            device_info = device_info
                .enabled_extension_names(&extensions)
                .push_next(&mut perf_features);
        }
        // SAFETY: every pointer in device_info refers to locals alive here.
        let device = bail!(
            unsafe { instance.create_device(physical_device, &device_info, None) }
                .map_err(vk_err("vkCreateDevice"))
        );
        // SAFETY: queue 0 of queue_family was requested above.
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        // SAFETY: physical_device belongs to instance.
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let perf = measured.then(|| PerfQueryFns {
            instance: khr::performance_query::Instance::new(&entry, &instance),
            device: khr::performance_query::Device::new(&instance, &device),
        });

        Ok(Self {
            entry,
            instance,
            physical_device,
            queue_family,
            device,
            queue,
            memory_properties,
            perf,
        })
    }

    pub fn perf(&self) -> Result<&PerfQueryFns> {
        self.perf.as_ref().ok_or_else(|| {
            ProbeError::MissingExtension(format!(
                "{} (device created without counter support)",
                khr::performance_query::NAME.to_string_lossy()
            ))
        })
    }

    /// Memory type index with all of `flags` among `type_bits`.
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Result<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && props.memory_types[i as usize].property_flags.contains(flags)
            })
            .ok_or_else(|| ProbeError::Device(format!("no memory type with {flags:?}")))
    }
}

fn require_perf_support(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Result<()> {
    let wanted: &CStr = khr::performance_query::NAME;
    // SAFETY: physical_device belongs to instance.
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .map_err(vk_err("vkEnumerateDeviceExtensionProperties"))?;
    let supported = extensions
        .iter()
        .any(|ext| fixed_str(&ext.extension_name).as_bytes() == wanted.to_bytes());
    if !supported {
        return Err(ProbeError::MissingExtension(
            wanted.to_string_lossy().into_owned(),
        ));
    }

    let mut perf_features = vk::PhysicalDevicePerformanceQueryFeaturesKHR::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut perf_features);
    // SAFETY: features chain only references locals.
    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
    let pipeline_statistics = features.features.pipeline_statistics_query == vk::TRUE;
    if perf_features.performance_counter_query_pools != vk::TRUE {
        return Err(ProbeError::MissingExtension(
            "performanceCounterQueryPools feature".into(),
        ));
    }
    if !pipeline_statistics {
        return Err(ProbeError::MissingExtension(
            "pipelineStatisticsQuery feature".into(),
        ));
    }
    Ok(())
}

/// Teardown has nowhere to propagate errors; log and carry on.
pub(crate) fn teardown_ok(call: &'static str, result: ash::prelude::VkResult<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(call, error = ?e, "teardown call failed");
            false
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        // SAFETY: owners of device-level objects destroy them before the
        // context; nothing else holds these handles.
        unsafe {
            teardown_ok("vkDeviceWaitIdle", self.device.device_wait_idle());
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_teardown_is_reported_not_dropped() {
        assert!(teardown_ok("vkDeviceWaitIdle", Ok(())));
        assert!(!teardown_ok("vkDeviceWaitIdle", Err(vk::Result::ERROR_DEVICE_LOST)));
    }

    #[test]
    fn fixed_str_stops_at_nul() {
        let mut raw = [0 as c_char; 16];
        for (dst, src) in raw.iter_mut().zip(b"EU Active\0junk") {
            *dst = *src as c_char;
        }
        assert_eq!(fixed_str(&raw), "EU Active");
    }

    #[test]
    #[ignore = "requires a Vulkan driver with VK_KHR_performance_query"]
    fn measured_context_exposes_perf_entry_points() {
        let ctx = VulkanContext::new(true).expect("measured context");
        assert!(ctx.perf().is_ok());
    }
}
