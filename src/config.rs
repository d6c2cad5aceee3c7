// src/config.rs

//! Defines the configuration structures for the CPU render device.
//!
//! The configuration is a tree of serde structs with sensible defaults, so a
//! partial JSON file (or no file at all) still yields a complete `Config`.
//! The process-wide instance lives in [`CONFIG`] and is loaded lazily on
//! first access from the file named by `RENDER_DEVICE_CONFIG`, falling back
//! to defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use log::{info, warn};
use once_cell::sync::Lazy;

use crate::error::{DeviceError, DeviceResult};

/// Environment variable naming an optional JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "RENDER_DEVICE_CONFIG";

/// Process-wide configuration, loaded on first use.
pub static CONFIG: Lazy<Config> = Lazy::new(|| match std::env::var(CONFIG_ENV_VAR) {
    Ok(path) => match Config::load(&path) {
        Ok(config) => {
            info!("Loaded configuration from '{}'", path);
            config
        }
        Err(e) => {
            warn!("Failed to load configuration from '{}': {}. Using defaults.", path, e);
            Config::default()
        }
    },
    Err(_) => Config::default(),
});

// --- Top-Level Configuration Structure ---

/// The complete configuration of the render device.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Worker pool and ISA dispatch settings.
    pub device: DeviceConfig,
    /// Denoiser settings.
    pub denoise: DenoiseConfig,
    /// Film conversion settings.
    pub film: FilmConfig,
    /// Settings used by the demo binary.
    pub demo: DemoConfig,
}

impl Config {
    /// Parses a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> DeviceResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json(text: &str) -> DeviceResult<Self> {
        serde_json::from_str(text).map_err(|e| DeviceError::Config(e.to_string()))
    }
}

// --- Device Configuration ---

/// Worker pool and kernel dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of worker threads. `None` uses the detected hardware concurrency.
    pub threads: Option<usize>,
    /// Worker threads are named "{prefix}-{id}".
    pub thread_name_prefix: String,
    /// Upper bound on shader-evaluation sub-range length when splitting tasks.
    pub shader_chunk_size: usize,
    /// Per-ISA switches for debugging the dispatcher.
    pub debug_cpu: CpuDebugFlags,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            threads: None,
            thread_name_prefix: "render-worker".to_string(),
            shader_chunk_size: 256,
            debug_cpu: CpuDebugFlags::default(),
        }
    }
}

/// Allows masking out instruction sets the CPU supports, e.g. to compare
/// kernel variants on one machine. A `false` entry hides that level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CpuDebugFlags {
    pub sse2: bool,
    pub sse3: bool,
    pub sse41: bool,
    pub avx: bool,
    pub avx2: bool,
}

impl Default for CpuDebugFlags {
    fn default() -> Self {
        CpuDebugFlags {
            sse2: true,
            sse3: true,
            sse41: true,
            avx: true,
            avx2: true,
        }
    }
}

// --- Denoise Configuration ---

/// Settings of the denoising engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DenoiseConfig {
    /// Half width of the regression window in pixels.
    pub half_window: i32,
    /// Append x², y² and xy to the feature vector.
    pub second_order_screen: bool,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        DenoiseConfig {
            half_window: 8,
            second_order_screen: false,
        }
    }
}

// --- Film Configuration ---

/// Settings of the film conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilmConfig {
    /// Linear exposure multiplier applied before display mapping.
    pub exposure: f32,
}

impl Default for FilmConfig {
    fn default() -> Self {
        FilmConfig { exposure: 1.0 }
    }
}

// --- Demo Configuration ---

/// Frame settings for the demo binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    pub width: i32,
    pub height: i32,
    pub tile_size: i32,
    pub samples: u32,
    /// Guard pixels rendered around each tile for inline denoising. Zero disables.
    pub overscan: i32,
    /// Run denoising as a separate pass over 3×3 tile neighbourhoods.
    pub separate_denoise: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            width: 128,
            height: 96,
            tile_size: 32,
            samples: 16,
            overscan: 0,
            separate_denoise: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "denoise": { "half_window": 4 } }"#).unwrap();
        assert_eq!(config.denoise.half_window, 4);
        assert!(!config.denoise.second_order_screen);
        assert_eq!(config.device.shader_chunk_size, 256);
        assert_eq!(config.film, FilmConfig::default());
    }

    #[test]
    fn debug_flags_can_mask_levels() {
        let config = Config::from_json(r#"{ "device": { "debug_cpu": { "avx2": false } } }"#).unwrap();
        assert!(!config.device.debug_cpu.avx2);
        assert!(config.device.debug_cpu.avx);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        match Config::from_json("{ not json") {
            Err(DeviceError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
