pub mod manga_ocr;

use anyhow::Result;
use candle_core::{Device, utils::metal_is_available};
use tracing::info;

pub use fukidashi_core::hf_hub::set_cache_dir;

/// Hub repository the recognition weights are fetched from unless configured otherwise.
pub const DEFAULT_MODEL: &str = "mayocream/manga-ocr";

/// Upper bound on generated tokens per image.
pub const DEFAULT_MAX_LENGTH: usize = 300;

/// Name of the compute device being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceName {
    Cpu,
    Cuda,
    Metal,
}

impl std::fmt::Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceName::Cpu => write!(f, "CPU"),
            DeviceName::Cuda => write!(f, "CUDA"),
            DeviceName::Metal => write!(f, "Metal"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DevicePreference {
    /// First available of CUDA, Metal, CPU.
    #[default]
    Auto,
    Cpu,
}

/// Fixed construction parameters of the recognition model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrConfig {
    pub model: String,
    pub device: DevicePreference,
    pub max_length: usize,
    pub warmup: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            device: DevicePreference::Auto,
            max_length: DEFAULT_MAX_LENGTH,
            warmup: true,
        }
    }
}

/// Returns the name of the device that would be selected.
pub fn device_name(preference: DevicePreference) -> DeviceName {
    match preference {
        DevicePreference::Cpu => DeviceName::Cpu,
        DevicePreference::Auto if cuda_is_available() => DeviceName::Cuda,
        DevicePreference::Auto if metal_is_available() => DeviceName::Metal,
        DevicePreference::Auto => DeviceName::Cpu,
    }
}

pub fn device(preference: DevicePreference) -> Result<Device> {
    let name = device_name(preference);
    info!("using {name} device");
    match name {
        DeviceName::Cpu => Ok(Device::Cpu),
        DeviceName::Cuda => Ok(Device::new_cuda(0)?),
        DeviceName::Metal => Ok(Device::new_metal(0)?),
    }
}

pub fn cuda_is_available() -> bool {
    cfg!(feature = "cuda")
        && unsafe {
            libloading::Library::new(if cfg!(target_os = "windows") {
                "nvcuda.dll"
            } else {
                "libcuda.so"
            })
            .is_ok()
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_preference_always_selects_cpu() -> anyhow::Result<()> {
        assert_eq!(device_name(DevicePreference::Cpu), DeviceName::Cpu);
        assert!(matches!(device(DevicePreference::Cpu)?, Device::Cpu));
        Ok(())
    }

    #[test]
    fn default_config_targets_manga_ocr() {
        let config = OcrConfig::default();
        assert_eq!(config.model, "mayocream/manga-ocr");
        assert_eq!(config.device, DevicePreference::Auto);
        assert_eq!(config.max_length, 300);
        assert!(config.warmup);
    }

    #[test]
    fn device_names_display() {
        assert_eq!(DeviceName::Cpu.to_string(), "CPU");
        assert_eq!(DeviceName::Cuda.to_string(), "CUDA");
        assert_eq!(DeviceName::Metal.to_string(), "Metal");
    }
}
