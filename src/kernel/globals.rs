// src/kernel/globals.rs

//! Kernel constants, the device-wide globals and the per-task context.
//!
//! [`KernelGlobals`] is owned by the device and cloned into a fresh
//! [`ThreadKernelGlobals`] each time a worker starts a task. The per-task
//! context owns the scratch arrays integrators may ask for and releases them
//! when the task returns.

use std::fmt;
use std::sync::Arc;

use log::trace;

use super::shader::{ShaderEvalType, ShaderInput};
use super::texture::TextureTable;
use crate::config::Config;

/// Film constants used by the conversion kernels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelFilm {
    pub exposure: f32,
}

impl Default for KernelFilm {
    fn default() -> Self {
        KernelFilm { exposure: 1.0 }
    }
}

/// Denoiser constants used by the reconstruction kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelIntegrator {
    /// Half width of the regression window.
    pub half_window: i32,
    pub second_order_screen: bool,
}

impl Default for KernelIntegrator {
    fn default() -> Self {
        KernelIntegrator {
            half_window: 8,
            second_order_screen: false,
        }
    }
}

/// Constant data uploaded with `const_copy_to`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KernelData {
    pub film: KernelFilm,
    pub integrator: KernelIntegrator,
}

impl From<&Config> for KernelData {
    fn from(config: &Config) -> Self {
        KernelData {
            film: KernelFilm { exposure: config.film.exposure },
            integrator: KernelIntegrator {
                half_window: config.denoise.half_window,
                second_order_screen: config.denoise.second_order_screen,
            },
        }
    }
}

/// Surface features recorded alongside a path sample for the denoiser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathFeatures {
    pub normal: [f32; 3],
    pub albedo: [f32; 3],
    pub depth: f32,
    /// Light visibility in `[0, 1]`; 1 is fully lit.
    pub shadow: f32,
}

impl Default for PathFeatures {
    fn default() -> Self {
        PathFeatures {
            normal: [0.0; 3],
            albedo: [0.0; 3],
            depth: 0.0,
            shadow: 1.0,
        }
    }
}

/// Result of tracing one camera path.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PathSample {
    pub radiance: [f32; 3],
    pub alpha: f32,
    pub features: Option<PathFeatures>,
}

/// Produces the radiance estimate of one pixel sample.
pub trait Integrator: Send + Sync {
    fn trace(&self, kg: &mut ThreadKernelGlobals, sample: u32, x: i32, y: i32) -> PathSample;
}

/// Evaluates a shader for one input record.
pub trait ShaderEvaluator: Send + Sync {
    fn evaluate(
        &self,
        kg: &mut ThreadKernelGlobals,
        input: &ShaderInput,
        eval_type: ShaderEvalType,
        filter: u32,
        sample: u32,
    ) -> [f32; 4];
}

/// Device-wide kernel state.
#[derive(Clone, Default)]
pub struct KernelGlobals {
    pub data: KernelData,
    pub textures: TextureTable,
    pub integrator: Option<Arc<dyn Integrator>>,
    pub shader: Option<Arc<dyn ShaderEvaluator>>,
}

impl fmt::Debug for KernelGlobals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelGlobals")
            .field("data", &self.data)
            .field("textures", &self.textures.len())
            .field("integrator", &self.integrator.is_some())
            .field("shader", &self.shader.is_some())
            .finish()
    }
}

/// A transparent surface hit recorded while tracing a shadow ray.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Intersection {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub prim: i32,
    pub object: i32,
}

/// One step of a decoupled volume ray march.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VolumeStep {
    pub sigma_s: [f32; 3],
    pub sigma_t: [f32; 3],
    pub transmittance: [f32; 3],
    pub t: f32,
    pub shade_t: f32,
}

/// Number of independent decoupled volume step buffers per task.
pub const DECOUPLED_VOLUME_STEP_SLOTS: usize = 4;

/// Per-task kernel context. Never shared between workers.
pub struct ThreadKernelGlobals {
    globals: KernelGlobals,
    transparent_shadow_intersections: Option<Vec<Intersection>>,
    decoupled_volume_steps: [Option<Vec<VolumeStep>>; DECOUPLED_VOLUME_STEP_SLOTS],
    decoupled_volume_steps_index: usize,
}

impl ThreadKernelGlobals {
    pub fn new(globals: KernelGlobals) -> Self {
        ThreadKernelGlobals {
            globals,
            transparent_shadow_intersections: None,
            decoupled_volume_steps: Default::default(),
            decoupled_volume_steps_index: 0,
        }
    }

    pub fn data(&self) -> &KernelData {
        &self.globals.data
    }

    pub fn textures(&self) -> &TextureTable {
        &self.globals.textures
    }

    pub fn integrator(&self) -> Option<Arc<dyn Integrator>> {
        self.globals.integrator.clone()
    }

    pub fn shader(&self) -> Option<Arc<dyn ShaderEvaluator>> {
        self.globals.shader.clone()
    }

    /// Scratch for transparent shadow hits, allocated on first use and
    /// cleared on every call.
    pub fn transparent_shadow_intersections(&mut self, max_hits: usize) -> &mut Vec<Intersection> {
        let hits = self
            .transparent_shadow_intersections
            .get_or_insert_with(|| Vec::with_capacity(max_hits));
        hits.clear();
        hits
    }

    /// Claims the next decoupled volume step buffer, round robin.
    pub fn next_decoupled_volume_steps(&mut self) -> &mut Vec<VolumeStep> {
        let slot = self.decoupled_volume_steps_index;
        self.decoupled_volume_steps_index = (slot + 1) % DECOUPLED_VOLUME_STEP_SLOTS;
        let steps = self.decoupled_volume_steps[slot].get_or_insert_with(Vec::new);
        steps.clear();
        steps
    }

    /// Bytes currently held by the scratch arrays.
    pub fn scratch_bytes(&self) -> usize {
        let hits = self
            .transparent_shadow_intersections
            .as_ref()
            .map_or(0, |v| v.capacity() * std::mem::size_of::<Intersection>());
        let steps: usize = self
            .decoupled_volume_steps
            .iter()
            .flatten()
            .map(|v| v.capacity() * std::mem::size_of::<VolumeStep>())
            .sum();
        hits + steps
    }
}

impl Drop for ThreadKernelGlobals {
    fn drop(&mut self) {
        let bytes = self.scratch_bytes();
        if bytes > 0 {
            trace!("Releasing {} bytes of kernel scratch", bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_data_follows_config() {
        let mut config = Config::default();
        config.film.exposure = 2.0;
        config.denoise.half_window = 3;
        let data = KernelData::from(&config);
        assert_eq!(data.film.exposure, 2.0);
        assert_eq!(data.integrator.half_window, 3);
    }

    #[test]
    fn scratch_is_lazy() {
        let mut kg = ThreadKernelGlobals::new(KernelGlobals::default());
        assert_eq!(kg.scratch_bytes(), 0);
        kg.transparent_shadow_intersections(16).push(Intersection::default());
        assert!(kg.scratch_bytes() >= 16 * std::mem::size_of::<Intersection>());
        // Handed out empty again.
        assert!(kg.transparent_shadow_intersections(16).is_empty());
    }

    #[test]
    fn volume_step_slots_rotate() {
        let mut kg = ThreadKernelGlobals::new(KernelGlobals::default());
        for i in 0..DECOUPLED_VOLUME_STEP_SLOTS {
            kg.next_decoupled_volume_steps().push(VolumeStep { t: i as f32, ..Default::default() });
        }
        // Fifth claim reuses slot zero, cleared.
        assert!(kg.next_decoupled_volume_steps().is_empty());
        assert_eq!(kg.decoupled_volume_steps.iter().flatten().count(), DECOUPLED_VOLUME_STEP_SLOTS);
    }
}
