// src/kernel/mod.rs

//! Kernel variant tables.
//!
//! Every dispatch point of the device (path tracing, film conversion, shader
//! evaluation and the six denoise sub-kernels) exists once per compiled
//! [`IsaLevel`]. The bodies are shared generic functions; each level's table
//! instantiates them inside `#[target_feature]` wrappers so the compiler can
//! vectorize for that instruction set, and the non-local-means kernel runs on
//! the level's native lane width.
//!
//! A table is only reachable through [`KernelFunctions::for_level`] or
//! [`KernelFunctions::select`], both of which check the CPU first.

pub mod film;
pub mod globals;
pub mod passes;
pub mod path_trace;
pub mod shader;
pub(crate) mod simd;
pub mod texture;

use std::sync::OnceLock;

use half::f16;
use log::info;

use crate::cpu::{best_level, compiled_levels, cpu_flags, IsaLevel};
use crate::filter::{FilterBuffer, FilterOutput, FilterStorage, Neighborhood, NlmParams, PlaneArea, Rect, ShadowPlanes};
use globals::{Integrator, KernelFilm, KernelIntegrator, ShaderEvaluator, ThreadKernelGlobals};
use passes::BufferAddress;
use shader::{ShaderEvalType, ShaderInput};

pub type PathTraceKernel = fn(&mut ThreadKernelGlobals, &dyn Integrator, &mut [f32], &BufferAddress, u32, i32, i32);
pub type ConvertToByteKernel = fn(&KernelFilm, &[f32], &BufferAddress, f32, i32, i32) -> [u8; 4];
pub type ConvertToHalfFloatKernel = fn(&KernelFilm, &[f32], &BufferAddress, f32, i32, i32) -> [f16; 4];
pub type ShaderKernel = fn(
    &mut ThreadKernelGlobals,
    &dyn ShaderEvaluator,
    &ShaderInput,
    &mut [f32; 4],
    Option<&mut f32>,
    ShaderEvalType,
    u32,
    u32,
);
pub type DivideShadowKernel = fn(u32, &Neighborhood<'_>, usize, &PlaneArea, ShadowPlanes<'_>);
pub type GetFeatureKernel = fn(u32, &Neighborhood<'_>, usize, usize, usize, &PlaneArea, &mut [f32], &mut [f32]);
pub type NonLocalMeansKernel = fn(&[f32], &[f32], &[f32], &mut [f32], &PlaneArea, NlmParams);
pub type CombineHalvesKernel = fn(Option<&mut [f32]>, Option<&mut [f32]>, &[f32], &[f32], &PlaneArea, usize);
pub type EstimateParamsKernel = fn(&FilterBuffer, &KernelIntegrator, Rect, &mut [FilterStorage]);
pub type FinalPassKernel = fn(&FilterBuffer, &KernelIntegrator, Rect, &mut [FilterStorage], u32, &mut FilterOutput<'_>);

/// One function pointer per dispatch point, all compiled for `level`.
pub struct KernelFunctions {
    pub level: IsaLevel,
    pub path_trace: PathTraceKernel,
    pub convert_to_byte: ConvertToByteKernel,
    pub convert_to_half_float: ConvertToHalfFloatKernel,
    pub shader: ShaderKernel,
    pub filter_divide_shadow: DivideShadowKernel,
    pub filter_get_feature: GetFeatureKernel,
    pub filter_non_local_means: NonLocalMeansKernel,
    pub filter_combine_halves: CombineHalvesKernel,
    pub filter_estimate_params: EstimateParamsKernel,
    pub filter_final_pass: FinalPassKernel,
}

impl std::fmt::Debug for KernelFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelFunctions").field("level", &self.level).finish_non_exhaustive()
    }
}

static SCALAR: KernelFunctions = KernelFunctions {
    level: IsaLevel::Scalar,
    path_trace: path_trace::path_trace,
    convert_to_byte: film::convert_to_byte,
    convert_to_half_float: film::convert_to_half_float,
    shader: shader::shader,
    filter_divide_shadow: crate::filter::prefilter::divide_shadow,
    filter_get_feature: crate::filter::prefilter::get_feature,
    filter_non_local_means: crate::filter::nlm::non_local_means::<simd::Scalar>,
    filter_combine_halves: crate::filter::prefilter::combine_halves,
    filter_estimate_params: crate::filter::reconstruction::estimate_params,
    filter_final_pass: crate::filter::reconstruction::final_pass,
};

/// Defines `fn $name(args) -> ret` that calls `$body` with `$features` enabled.
#[allow(unused_macros)]
macro_rules! feature_fn {
    ($features:literal, $name:ident = $body:expr, ($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)?) => {
        #[allow(clippy::too_many_arguments)]
        fn $name($($arg: $ty),*) $(-> $ret)? {
            #[target_feature(enable = $features)]
            #[allow(clippy::too_many_arguments)]
            unsafe fn enabled($($arg: $ty),*) $(-> $ret)? {
                ($body)($($arg),*)
            }
            // SAFETY: this function is only reachable through a kernel table
            // handed out after checking the CPU supports `$features`.
            unsafe { enabled($($arg),*) }
        }
    };
}

/// Builds the kernel table of one ISA level in module `$module`.
#[allow(unused_macros)]
macro_rules! isa_kernels {
    ($module:ident, $level:expr, $lanes:ty, $features:literal) => {
        mod $module {
            use super::*;

            feature_fn!($features, path_trace = super::path_trace::path_trace, (
                kg: &mut ThreadKernelGlobals,
                integrator: &dyn Integrator,
                buffer: &mut [f32],
                address: &BufferAddress,
                sample: u32,
                x: i32,
                y: i32,
            ));
            feature_fn!($features, convert_to_byte = super::film::convert_to_byte, (
                film: &KernelFilm,
                buffer: &[f32],
                address: &BufferAddress,
                sample_scale: f32,
                x: i32,
                y: i32,
            ) -> [u8; 4]);
            feature_fn!($features, convert_to_half_float = super::film::convert_to_half_float, (
                film: &KernelFilm,
                buffer: &[f32],
                address: &BufferAddress,
                sample_scale: f32,
                x: i32,
                y: i32,
            ) -> [f16; 4]);
            feature_fn!($features, shader = super::shader::shader, (
                kg: &mut ThreadKernelGlobals,
                evaluator: &dyn ShaderEvaluator,
                input: &ShaderInput,
                output: &mut [f32; 4],
                output_luma: Option<&mut f32>,
                eval_type: ShaderEvalType,
                filter: u32,
                sample: u32,
            ));
            feature_fn!($features, divide_shadow = crate::filter::prefilter::divide_shadow, (
                sample: u32,
                src: &Neighborhood<'_>,
                frame: usize,
                area: &PlaneArea,
                out: ShadowPlanes<'_>,
            ));
            feature_fn!($features, get_feature = crate::filter::prefilter::get_feature, (
                sample: u32,
                src: &Neighborhood<'_>,
                frame: usize,
                mean_from: usize,
                variance_from: usize,
                area: &PlaneArea,
                mean: &mut [f32],
                variance: &mut [f32],
            ));
            feature_fn!($features, non_local_means = crate::filter::nlm::non_local_means::<$lanes>, (
                noisy: &[f32],
                weight: &[f32],
                variance: &[f32],
                out: &mut [f32],
                area: &PlaneArea,
                params: NlmParams,
            ));
            feature_fn!($features, combine_halves = crate::filter::prefilter::combine_halves, (
                mean: Option<&mut [f32]>,
                variance: Option<&mut [f32]>,
                a: &[f32],
                b: &[f32],
                area: &PlaneArea,
                r: usize,
            ));
            feature_fn!($features, estimate_params = crate::filter::reconstruction::estimate_params, (
                buf: &FilterBuffer,
                settings: &KernelIntegrator,
                area: Rect,
                storage: &mut [FilterStorage],
            ));
            feature_fn!($features, final_pass = crate::filter::reconstruction::final_pass, (
                buf: &FilterBuffer,
                settings: &KernelIntegrator,
                area: Rect,
                storage: &mut [FilterStorage],
                sample: u32,
                out: &mut FilterOutput<'_>,
            ));

            pub(super) static TABLE: KernelFunctions = KernelFunctions {
                level: $level,
                path_trace,
                convert_to_byte,
                convert_to_half_float,
                shader,
                filter_divide_shadow: divide_shadow,
                filter_get_feature: get_feature,
                filter_non_local_means: non_local_means,
                filter_combine_halves: combine_halves,
                filter_estimate_params: estimate_params,
                filter_final_pass: final_pass,
            };
        }
    };
}

#[cfg(all(target_arch = "x86_64", feature = "optimized-sse2"))]
isa_kernels!(sse2, IsaLevel::Sse2, simd::F32x4, "sse2");
#[cfg(all(target_arch = "x86_64", feature = "optimized-sse3"))]
isa_kernels!(sse3, IsaLevel::Sse3, simd::F32x4, "sse2,sse3");
#[cfg(all(target_arch = "x86_64", feature = "optimized-sse41"))]
isa_kernels!(sse41, IsaLevel::Sse41, simd::F32x4, "sse2,sse3,sse4.1");
#[cfg(all(target_arch = "x86_64", feature = "optimized-avx"))]
isa_kernels!(avx, IsaLevel::Avx, simd::F32x8, "sse2,sse3,sse4.1,avx");
#[cfg(all(target_arch = "x86_64", feature = "optimized-avx2"))]
isa_kernels!(avx2, IsaLevel::Avx2, simd::F32x8, "sse2,sse3,sse4.1,avx,avx2");

fn compiled_table(level: IsaLevel) -> Option<&'static KernelFunctions> {
    match level {
        IsaLevel::Scalar => Some(&SCALAR),
        #[cfg(all(target_arch = "x86_64", feature = "optimized-sse2"))]
        IsaLevel::Sse2 => Some(&sse2::TABLE),
        #[cfg(all(target_arch = "x86_64", feature = "optimized-sse3"))]
        IsaLevel::Sse3 => Some(&sse3::TABLE),
        #[cfg(all(target_arch = "x86_64", feature = "optimized-sse41"))]
        IsaLevel::Sse41 => Some(&sse41::TABLE),
        #[cfg(all(target_arch = "x86_64", feature = "optimized-avx"))]
        IsaLevel::Avx => Some(&avx::TABLE),
        #[cfg(all(target_arch = "x86_64", feature = "optimized-avx2"))]
        IsaLevel::Avx2 => Some(&avx2::TABLE),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

static SELECTED: OnceLock<&'static KernelFunctions> = OnceLock::new();

impl KernelFunctions {
    /// The table compiled for `level`, if it is part of this build and the
    /// CPU can run it.
    pub fn for_level(level: IsaLevel) -> Option<&'static KernelFunctions> {
        if !level.is_supported() {
            return None;
        }
        compiled_table(level)
    }

    /// The best table for this process, resolved on first call.
    pub fn select() -> &'static KernelFunctions {
        SELECTED.get_or_init(|| {
            let level = best_level(cpu_flags(), compiled_levels());
            info!("Using {} CPU kernels", level);
            Self::for_level(level).unwrap_or(&SCALAR)
        })
    }

    /// Every table that can run here, lowest level first.
    pub fn all_supported() -> Vec<&'static KernelFunctions> {
        IsaLevel::ALL.iter().filter_map(|&level| Self::for_level(level)).collect()
    }
}
