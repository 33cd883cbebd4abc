use std::ffi::{c_char, CStr};
use ash::vk;
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use crate::renderer::backend::DeviceLimits;

/// Physical device chosen for rendering, with the queue family used for
/// graphics and presentation
pub struct SelectedDevice {
    pub physical: vk::PhysicalDevice,
    pub queue_family: u32,
    pub name: String,
    pub limits: DeviceLimits,
    pub sampler_anisotropy: bool,
}

pub fn required_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::swapchain::NAME,

        #[cfg(target_os = "macos")]
        ash::khr::portability_subset::NAME,
    ]
}

/// Lower is better
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        vk::PhysicalDeviceType::OTHER => 4,
        _ => 5,
    }
}

/// First queue family that supports graphics and can present to the surface
pub fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .find(|(i, family)| {
            family.queue_count > 0
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && supports_present(*i as u32)
        })
        .map(|(i, _)| i as u32)
}

pub fn limits_from_properties(limits: &vk::PhysicalDeviceLimits, sampler_anisotropy: bool) -> DeviceLimits {
    DeviceLimits {
        min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment.max(1),
        max_sampler_anisotropy: if sampler_anisotropy { limits.max_sampler_anisotropy } else { 1.0 },
        framebuffer_sample_counts: limits.framebuffer_color_sample_counts
            & limits.framebuffer_depth_sample_counts,
    }
}

pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<SelectedDevice> {
    let required = required_device_extensions();
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let (physical, queue_family) = devices
        .into_iter()
        // Filter out devices that do not contain the required device extensions
        .filter(|device| {
            let supported = unsafe {
                instance
                    .enumerate_device_extension_properties(*device)
                    .unwrap_or_default()
            };
            required.iter().all(|req| {
                supported
                    .iter()
                    .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *req))
            })
        })
        // Filter out devices without a graphics queue that can present
        .filter_map(|device| {
            let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
            let family = find_queue_family(&families, |index| unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .unwrap_or(false)
            })?;
            Some((device, family))
        })
        .min_by_key(|(device, _)| {
            let props = unsafe { instance.get_physical_device_properties(*device) };
            device_type_rank(props.device_type)
        })
        .ok_or_eyre("No suitable physical device found")?;

    let props = unsafe { instance.get_physical_device_properties(physical) };
    let features = unsafe { instance.get_physical_device_features(physical) };
    let sampler_anisotropy = features.sampler_anisotropy == vk::TRUE;
    let name = props
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown device".to_string());

    log::info!("Selected physical device {} ({:?})", name, props.device_type);

    Ok(SelectedDevice {
        physical,
        queue_family,
        name,
        limits: limits_from_properties(&props.limits, sampler_anisotropy),
        sampler_anisotropy,
    })
}

pub fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priorities = [1.0];
    let queue_create_infos = [
        vk::DeviceQueueCreateInfo::default()
            .queue_family_index(selected.queue_family)
            .queue_priorities(&queue_priorities),
    ];

    let enabled_extension_names = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect::<Vec<*const c_char>>();

    let enabled_features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(selected.sampler_anisotropy);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&enabled_extension_names)
        .enabled_features(&enabled_features);

    let device = unsafe { instance.create_device(selected.physical, &device_create_info, None)? };
    let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };

    Ok((device, queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn discrete_gpus_rank_first() {
        let mut types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        types.sort_by_key(|t| device_type_rank(*t));
        assert_eq!(types[0], vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(types[2], vk::PhysicalDeviceType::CPU);
    }

    #[test]
    fn queue_family_must_present() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(find_queue_family(&families, |_| true), Some(1));
        assert_eq!(find_queue_family(&families, |i| i == 2), Some(2));
        assert_eq!(find_queue_family(&families, |i| i == 0), None);
    }

    #[test]
    fn limits_keep_common_sample_counts() {
        let limits = vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: 64,
            max_sampler_anisotropy: 16.0,
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4,
            ..Default::default()
        };
        let converted = limits_from_properties(&limits, false);
        assert_eq!(converted.min_uniform_buffer_offset_alignment, 64);
        assert_eq!(converted.max_sampler_anisotropy, 1.0);
        assert_eq!(
            converted.framebuffer_sample_counts,
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4
        );
    }
}
