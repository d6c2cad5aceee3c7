// src/lib.rs

//! CPU rendering backend: ISA-dispatched kernels, a worker pool with a tile
//! acquisition protocol, and a feature-guided denoiser.

pub mod config;
pub mod cpu;
pub mod device;
pub mod error;
pub mod filter;
pub mod kernel;
pub mod task_pool;

pub use config::{Config, CONFIG};
pub use device::{CpuDevice, DeviceTask, RenderTile, TileManager, TileSource};
pub use error::{DeviceError, DeviceResult};
