use std::path::PathBuf;
use ash::vk;

pub const ENV_VSYNC: &str = "IRONFRAME_VSYNC";
pub const ENV_MSAA: &str = "IRONFRAME_MSAA";
pub const ENV_VALIDATION: &str = "IRONFRAME_VALIDATION";
pub const ENV_SHADER_DIR: &str = "IRONFRAME_SHADER_DIR";

/// Contains configuration options for the context like vsync, multisampling and
/// where shaders are loaded from
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub app_name: String,
    pub vsync: bool,
    /// Requested MSAA sample count; clamped to what the device supports
    pub msaa_samples: vk::SampleCountFlags,
    pub swapchain_image_count: u32,
    pub validation: bool,
    pub shader_dir: PathBuf,
    pub clear_color: [f32; 4],
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "ironframe".to_string(),
            vsync: true,
            msaa_samples: vk::SampleCountFlags::TYPE_4,
            swapchain_image_count: 3,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from("shaders"),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl ContextConfig {
    /// Defaults overridden by `IRONFRAME_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from a variable lookup; unparsable values are logged and ignored
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(ENV_VSYNC) {
            match parse_flag(&value) {
                Some(vsync) => self.vsync = vsync,
                None => log::warn!("Ignoring {}={:?}, expected a boolean", ENV_VSYNC, value),
            }
        }
        if let Some(value) = lookup(ENV_MSAA) {
            match value.trim().parse::<u32>().ok().and_then(sample_count_flags) {
                Some(samples) => self.msaa_samples = samples,
                None => log::warn!("Ignoring {}={:?}, expected 1, 2, 4, 8, 16, 32 or 64", ENV_MSAA, value),
            }
        }
        if let Some(value) = lookup(ENV_VALIDATION) {
            match parse_flag(&value) {
                Some(validation) => self.validation = validation,
                None => log::warn!("Ignoring {}={:?}, expected a boolean", ENV_VALIDATION, value),
            }
        }
        if let Some(value) = lookup(ENV_SHADER_DIR) {
            if !value.is_empty() {
                self.shader_dir = PathBuf::from(value);
            }
        }
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_msaa_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.msaa_samples = samples;
        self
    }

    pub fn with_swapchain_image_count(mut self, count: u32) -> Self {
        self.swapchain_image_count = count;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

pub fn sample_count_flags(count: u32) -> Option<vk::SampleCountFlags> {
    match count {
        1 => Some(vk::SampleCountFlags::TYPE_1),
        2 => Some(vk::SampleCountFlags::TYPE_2),
        4 => Some(vk::SampleCountFlags::TYPE_4),
        8 => Some(vk::SampleCountFlags::TYPE_8),
        16 => Some(vk::SampleCountFlags::TYPE_16),
        32 => Some(vk::SampleCountFlags::TYPE_32),
        64 => Some(vk::SampleCountFlags::TYPE_64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn overrides_apply() {
        let config = ContextConfig::default().with_overrides(lookup(&[
            (ENV_VSYNC, "off"),
            (ENV_MSAA, "8"),
            (ENV_VALIDATION, "1"),
            (ENV_SHADER_DIR, "/tmp/spv"),
        ]));
        assert!(!config.vsync);
        assert_eq!(config.msaa_samples, vk::SampleCountFlags::TYPE_8);
        assert!(config.validation);
        assert_eq!(config.shader_dir, PathBuf::from("/tmp/spv"));
    }

    #[test]
    fn bad_values_keep_defaults() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ContextConfig::default().with_overrides(lookup(&[(ENV_VSYNC, "maybe"), (ENV_MSAA, "3")]));
        let defaults = ContextConfig::default();
        assert_eq!(config.vsync, defaults.vsync);
        assert_eq!(config.msaa_samples, defaults.msaa_samples);
    }
}
