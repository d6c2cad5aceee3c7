// src/kernel/path_trace.rs

//! Accumulates one path sample into the render buffer.

use super::globals::{Integrator, PathFeatures, ThreadKernelGlobals};
use super::passes::{denoising, BufferAddress, COMBINED};

#[inline(always)]
fn add_moments(pass: &mut [f32], sum: usize, sum_sq: usize, values: &[f32]) {
    for (i, v) in values.iter().enumerate() {
        pass[sum + i] += v;
        pass[sum_sq + i] += v * v;
    }
}

/// Traces `(sample, x, y)` and adds the result to the pixel's passes.
///
/// Even samples feed shadow half A, odd samples half B.
#[inline(always)]
pub fn path_trace(
    kg: &mut ThreadKernelGlobals,
    integrator: &dyn Integrator,
    buffer: &mut [f32],
    address: &BufferAddress,
    sample: u32,
    x: i32,
    y: i32,
) {
    let result = integrator.trace(kg, sample, x, y);
    let start = address.pixel_index(x, y);
    let pixel = &mut buffer[start..start + address.layout.pass_stride];

    let combined = &mut pixel[COMBINED..COMBINED + 4];
    for (c, r) in combined.iter_mut().zip(result.radiance) {
        *c += r;
    }
    combined[3] += result.alpha;

    let Some(offset) = address.layout.denoising_offset else {
        return;
    };
    let features = result.features.unwrap_or_default();
    let pass = &mut pixel[offset..offset + denoising::COUNT];
    add_moments(pass, denoising::NORMAL, denoising::NORMAL_SQ, &features.normal);
    add_moments(pass, denoising::ALBEDO, denoising::ALBEDO_SQ, &features.albedo);
    add_moments(pass, denoising::DEPTH, denoising::DEPTH_SQ, &[features.depth]);
    add_moments(pass, denoising::COLOR, denoising::COLOR_SQ, &result.radiance);

    let half = if sample % 2 == 0 { denoising::SHADOW_A } else { denoising::SHADOW_B };
    let PathFeatures { shadow, .. } = features;
    pass[half] += 1.0;
    pass[half + 1] += shadow;
    pass[half + 2] += shadow * shadow;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::globals::{KernelGlobals, PathSample};
    use crate::kernel::passes::PassLayout;

    struct Flat;

    impl Integrator for Flat {
        fn trace(&self, _: &mut ThreadKernelGlobals, sample: u32, _: i32, _: i32) -> PathSample {
            PathSample {
                radiance: [0.5, 0.25, 1.0],
                alpha: 1.0,
                features: Some(PathFeatures {
                    normal: [0.0, 0.0, 1.0],
                    albedo: [0.8; 3],
                    depth: 2.0,
                    shadow: if sample % 2 == 0 { 1.0 } else { 0.0 },
                }),
            }
        }
    }

    #[test]
    fn samples_alternate_shadow_halves() {
        let layout = PassLayout::new(true);
        let address = BufferAddress::new(0, 1, layout);
        let mut buffer = vec![0.0; layout.pass_stride];
        let mut kg = ThreadKernelGlobals::new(KernelGlobals::default());
        for sample in 0..4 {
            path_trace(&mut kg, &Flat, &mut buffer, &address, sample, 0, 0);
        }
        assert_eq!(&buffer[..4], &[2.0, 1.0, 4.0, 4.0]);
        let d = &buffer[4..];
        assert_eq!(d[denoising::DEPTH], 8.0);
        assert_eq!(d[denoising::DEPTH_SQ], 16.0);
        assert_eq!(d[denoising::NORMAL + 2], 4.0);
        assert_eq!(&d[denoising::SHADOW_A..denoising::SHADOW_A + 3], &[2.0, 2.0, 2.0]);
        assert_eq!(&d[denoising::SHADOW_B..denoising::SHADOW_B + 3], &[2.0, 0.0, 0.0]);
        assert_eq!(d[denoising::COLOR_SQ], 1.0);
    }

    #[test]
    fn plain_buffers_only_get_combined() {
        let layout = PassLayout::new(false);
        let address = BufferAddress::new(0, 2, layout);
        let mut buffer = vec![0.0; 2 * layout.pass_stride];
        let mut kg = ThreadKernelGlobals::new(KernelGlobals::default());
        path_trace(&mut kg, &Flat, &mut buffer, &address, 0, 1, 0);
        assert_eq!(&buffer[..4], &[0.0; 4]);
        assert_eq!(&buffer[4..], &[0.5, 0.25, 1.0, 1.0]);
    }
}
