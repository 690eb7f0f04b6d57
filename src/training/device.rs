//! Device selection and the accelerator confirmation gate

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

/// Device preference for training and generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    #[default]
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Select device based on preference
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cuda => {
            #[cfg(feature = "cuda")]
            {
                tracing::info!("Attempting to use CUDA device...");
                match Device::new_cuda(0) {
                    Ok(device) => {
                        tracing::info!("CUDA device selected");
                        Ok(device)
                    }
                    Err(e) => {
                        tracing::warn!("CUDA initialization failed: {}", e);
                        tracing::warn!("Falling back to CPU");
                        Ok(Device::Cpu)
                    }
                }
            }
            #[cfg(not(feature = "cuda"))]
            {
                tracing::warn!("CUDA requested but not compiled with 'cuda' feature");
                tracing::warn!("Falling back to CPU");
                Ok(Device::Cpu)
            }
        }

        DevicePreference::Metal => {
            #[cfg(feature = "metal")]
            {
                tracing::info!("Attempting to use Metal device...");
                match Device::new_metal(0) {
                    Ok(device) => {
                        tracing::info!("Metal device selected");
                        Ok(device)
                    }
                    Err(e) => {
                        tracing::warn!("Metal initialization failed: {}", e);
                        tracing::warn!("Falling back to CPU");
                        Ok(Device::Cpu)
                    }
                }
            }
            #[cfg(not(feature = "metal"))]
            {
                tracing::warn!("Metal requested but not compiled with 'metal' feature");
                tracing::warn!("Falling back to CPU");
                Ok(Device::Cpu)
            }
        }

        DevicePreference::Cpu => {
            tracing::info!("CPU device selected");
            Ok(Device::Cpu)
        }

        DevicePreference::Auto => {
            tracing::info!("Auto-selecting best available device...");

            #[cfg(feature = "cuda")]
            {
                if let Ok(device) = Device::new_cuda(0) {
                    tracing::info!("Auto-selected: CUDA GPU");
                    return Ok(device);
                }
            }

            #[cfg(feature = "metal")]
            {
                if let Ok(device) = Device::new_metal(0) {
                    tracing::info!("Auto-selected: Metal GPU");
                    return Ok(device);
                }
            }

            tracing::info!("Auto-selected: CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Check if CUDA is available
pub fn is_cuda_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        Device::new_cuda(0).is_ok()
    }
    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

/// Check if a Metal device is available
pub fn is_metal_available() -> bool {
    #[cfg(feature = "metal")]
    {
        Device::new_metal(0).is_ok()
    }
    #[cfg(not(feature = "metal"))]
    {
        false
    }
}

/// Whether the operator has to confirm a slow CPU run.
///
/// An explicit CPU choice is never questioned.
pub fn needs_cpu_confirmation(preference: DevicePreference, accelerator_available: bool) -> bool {
    preference != DevicePreference::Cpu && !accelerator_available
}

/// Ask the operator whether to continue training without CUDA.
///
/// Only an explicit `y` proceeds; anything else (including EOF) aborts.
pub fn confirm_cpu_training<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<bool> {
    writeln!(output, "WARNING: CUDA not found! Training on CPU will be very slow.")?;
    write!(output, "Continue? (y/n): ")?;
    output.flush()?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("Failed to read confirmation from stdin")?;

    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

/// Accelerator gate for interactive training runs.
///
/// Returns `Ok(true)` when training may proceed.
pub fn ensure_accelerator_or_confirm(preference: DevicePreference, assume_yes: bool) -> Result<bool> {
    let accelerator = match preference {
        DevicePreference::Cpu => false,
        DevicePreference::Cuda => is_cuda_available(),
        DevicePreference::Metal => is_metal_available(),
        DevicePreference::Auto => is_cuda_available() || is_metal_available(),
    };
    if !needs_cpu_confirmation(preference, accelerator) {
        return Ok(true);
    }
    if assume_yes {
        tracing::warn!("No accelerator found, continuing on CPU (--yes given)");
        return Ok(true);
    }

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();
    confirm_cpu_training(&mut input, &mut output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_device_preference_from_str() {
        assert_eq!(
            "cuda".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cuda
        );
        assert_eq!(
            "CPU".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cpu
        );
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_always_available() {
        let device = select_device(DevicePreference::Cpu);
        assert!(device.is_ok());
    }

    #[test]
    fn test_confirmation_only_for_implicit_cpu_fallback() {
        assert!(!needs_cpu_confirmation(DevicePreference::Cpu, false));
        assert!(!needs_cpu_confirmation(DevicePreference::Auto, true));
        assert!(!needs_cpu_confirmation(DevicePreference::Metal, true));
        assert!(needs_cpu_confirmation(DevicePreference::Auto, false));
        assert!(needs_cpu_confirmation(DevicePreference::Cuda, false));
    }

    #[test]
    fn test_explicit_cpu_skips_prompt() {
        assert!(ensure_accelerator_or_confirm(DevicePreference::Cpu, false).unwrap());
    }

    #[test]
    fn test_confirm_accepts_only_y() {
        let mut out = Vec::new();
        assert!(confirm_cpu_training(&mut Cursor::new("y\n"), &mut out).unwrap());
        assert!(confirm_cpu_training(&mut Cursor::new("Y\n"), &mut out).unwrap());
        assert!(!confirm_cpu_training(&mut Cursor::new("n\n"), &mut out).unwrap());
        assert!(!confirm_cpu_training(&mut Cursor::new("yes please\n"), &mut out).unwrap());
        assert!(!confirm_cpu_training(&mut Cursor::new(""), &mut out).unwrap());

        let prompt = String::from_utf8(out).unwrap();
        assert!(prompt.contains("CUDA not found"));
    }
}
