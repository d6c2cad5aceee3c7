// src/filter/nlm.rs

//! Non-local means over a filter-buffer plane, vectorized across a row.
//!
//! `LANES` consecutive centre pixels are processed together. For every
//! neighbour offset the patch distance is accumulated in exactly the order
//! the one-lane instantiation uses, with invalid lanes multiplied by zero, so
//! scalar and vector tables agree to the last bit.

use super::buffer::PlaneArea;
use crate::kernel::simd::SimdF32;

/// Parameters of one non-local-means pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NlmParams {
    /// Search window radius.
    pub radius: i32,
    /// Patch radius.
    pub patch: i32,
    /// Variance cancellation factor.
    pub alpha: f32,
    /// Squared damping factor.
    pub k_2: f32,
}

impl NlmParams {
    pub const fn new(radius: i32, patch: i32, alpha: f32, k_2: f32) -> Self {
        NlmParams { radius, patch, alpha, k_2 }
    }
}

/// Lanes `l < active` with `0 <= start + l < width`.
#[inline(always)]
fn lane_range(start: i32, width: i32, active: i32) -> (i32, i32) {
    let lo = (-start).max(0);
    let hi = active.min(width - start);
    (lo, hi.max(lo))
}

/// Filters `noisy` with weights from patch distances on `weight`, normalized
/// by `variance`, writing the result to `out`.
#[inline(always)]
pub(crate) fn non_local_means<V: SimdF32>(
    noisy: &[f32],
    weight: &[f32],
    variance: &[f32],
    out: &mut [f32],
    area: &PlaneArea,
    params: NlmParams,
) {
    let w = area.rect.width();
    let h = area.rect.height();
    let lanes = V::LANES as i32;
    let NlmParams { radius: r, patch: f, alpha, k_2 } = params;

    let zero = V::splat(0.0);
    let one = V::splat(1.0);
    let alpha_v = V::splat(alpha);
    let k_2_v = V::splat(k_2);
    let eps = V::splat(1e-10);

    for y in 0..h {
        let mut x0 = 0;
        while x0 < w {
            let active = lanes.min(w - x0);
            let mut sum_weight = zero;
            let mut sum_value = zero;

            for oy in -r..=r {
                let qy = y + oy;
                if qy < 0 || qy >= h {
                    continue;
                }
                for ox in -r..=r {
                    let (nlo, nhi) = lane_range(x0 + ox, w, active);
                    if nlo >= nhi {
                        continue;
                    }

                    let mut dist = zero;
                    let mut count = zero;
                    for dy in -f..=f {
                        let py = y + dy;
                        let sy = qy + dy;
                        if py < 0 || py >= h || sy < 0 || sy >= h {
                            continue;
                        }
                        let wc_row = area.row(weight, py as usize);
                        let wp_row = area.row(weight, sy as usize);
                        let vc_row = area.row(variance, py as usize);
                        let vp_row = area.row(variance, sy as usize);
                        for dx in -f..=f {
                            let (lo1, hi1) = lane_range(x0 + dx, w, active);
                            let (lo2, hi2) = lane_range(x0 + ox + dx, w, active);
                            let lo = nlo.max(lo1).max(lo2);
                            let hi = nhi.min(hi1).min(hi2);
                            if lo >= hi {
                                continue;
                            }
                            let mask = V::lane_mask(lo as usize, hi as usize);
                            let c = (x0 + dx) as isize;
                            let p = (x0 + ox + dx) as isize;
                            let wc = V::load_window(wc_row, c);
                            let wp = V::load_window(wp_row, p);
                            let vc = V::load_window(vc_row, c);
                            let vp = V::load_window(vp_row, p);

                            let diff = wc - wp;
                            let term = (diff * diff - alpha_v * (vc + vc.min(vp))) / (eps + k_2_v * (vc + vp));
                            dist = dist + term * mask;
                            count = count + mask;
                        }
                    }

                    let d = dist / count.max(one);
                    let neighbor_mask = V::lane_mask(nlo as usize, nhi as usize);
                    let wgt = (zero - d.max(zero)).exp() * neighbor_mask;
                    let value = V::load_window(area.row(noisy, qy as usize), (x0 + ox) as isize);
                    sum_weight = sum_weight + wgt;
                    sum_value = sum_value + wgt * value;
                }
            }

            let result = sum_value / sum_weight.max(eps);
            let start = y as usize * area.stride + x0 as usize;
            result.store_partial(&mut out[start..start + active as usize]);
            x0 += lanes;
        }
    }
}
