// src/filter/prefilter.rs

//! Per-pixel prefilter kernels: feature extraction, shadow half division and
//! the combine-halves reducer.
//!
//! All kernels iterate `area.rect` and write planes laid out by `area`.

use super::buffer::PlaneArea;
use super::neighborhood::Neighborhood;
use crate::kernel::passes::denoising;

/// Largest window radius [`combine_halves`] supports.
pub const MAX_COMBINE_RADIUS: usize = 4;

/// Output planes of [`divide_shadow`].
pub struct ShadowPlanes<'a> {
    pub unfiltered_a: &'a mut [f32],
    pub unfiltered_b: &'a mut [f32],
    pub sample_variance: &'a mut [f32],
    pub sample_variance_v: &'a mut [f32],
    pub buffer_variance: &'a mut [f32],
}

/// Mean and variance of the mean from a sum and a sum of squares over `n` samples.
#[inline(always)]
fn mean_and_variance(sum: f32, sum_sq: f32, n: f32) -> (f32, f32) {
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0) / (n - 1.0).max(1.0);
    (mean, variance)
}

/// Extracts one feature's mean and variance from the render buffers.
///
/// `mean_from`/`variance_from` index the denoising passes of a pixel.
#[inline(always)]
#[allow(clippy::too_many_arguments)]
pub fn get_feature(
    sample: u32,
    src: &Neighborhood<'_>,
    frame: usize,
    mean_from: usize,
    variance_from: usize,
    area: &PlaneArea,
    mean: &mut [f32],
    variance: &mut [f32],
) {
    let n = sample.max(1) as f32;
    let rect = area.rect;
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let pixel = src.pixel(frame, x, y);
            let (m, v) = mean_and_variance(pixel[mean_from], pixel[variance_from], n);
            let i = area.index(x, y);
            mean[i] = m;
            variance[i] = v;
        }
    }
}

/// Splits the shadow pass into its two independently sampled halves and
/// derives the variance estimates the shadow prefilter needs.
#[inline(always)]
pub fn divide_shadow(
    _sample: u32,
    src: &Neighborhood<'_>,
    frame: usize,
    area: &PlaneArea,
    out: ShadowPlanes<'_>,
) {
    let rect = area.rect;
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let pixel = src.pixel(frame, x, y);
            let half = |base: usize| {
                let count = pixel[base].max(1e-7);
                let (mean, variance) = mean_and_variance(pixel[base + 1], pixel[base + 2], count);
                (mean, variance)
            };
            let (a, var_a) = half(denoising::SHADOW_A);
            let (b, var_b) = half(denoising::SHADOW_B);

            let i = area.index(x, y);
            out.unfiltered_a[i] = a;
            out.unfiltered_b[i] = b;
            out.sample_variance[i] = 0.5 * (var_a + var_b);
            let dv = var_a - var_b;
            out.sample_variance_v[i] = 0.5 * dv * dv;
            let d = a - b;
            out.buffer_variance[i] = 0.5 * d * d;
        }
    }
}

/// Combines two filtered halves into a mean and/or a variance.
///
/// With `r == 0` the variance is `¼(a−b)²` per pixel; otherwise it is the
/// 7/8-quantile of that value over the `(2r+1)²` window, which makes the
/// residual estimate robust to single outliers.
#[inline(always)]
pub fn combine_halves(
    mut mean: Option<&mut [f32]>,
    mut variance: Option<&mut [f32]>,
    a: &[f32],
    b: &[f32],
    area: &PlaneArea,
    r: usize,
) {
    assert!(r <= MAX_COMBINE_RADIUS, "combine radius {} too large", r);
    let rect = area.rect;
    let r = r as i32;
    let mut values = [0.0f32; (2 * MAX_COMBINE_RADIUS + 1) * (2 * MAX_COMBINE_RADIUS + 1)];

    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let i = area.index(x, y);
            if let Some(mean) = mean.as_deref_mut() {
                mean[i] = 0.5 * (a[i] + b[i]);
            }
            let Some(variance) = variance.as_deref_mut() else {
                continue;
            };
            if r == 0 {
                let d = a[i] - b[i];
                variance[i] = 0.25 * d * d;
                continue;
            }
            let mut n = 0;
            for qy in (y - r).max(rect.y0)..(y + r + 1).min(rect.y1) {
                for qx in (x - r).max(rect.x0)..(x + r + 1).min(rect.x1) {
                    let q = area.index(qx, qy);
                    let d = a[q] - b[q];
                    values[n] = 0.25 * d * d;
                    n += 1;
                }
            }
            let window = &mut values[..n];
            window.sort_unstable_by(f32::total_cmp);
            variance[i] = window[(7 * n) / 8];
        }
    }
}
