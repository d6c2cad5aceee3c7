// src/filter/reconstruction.rs

//! Parameter estimation and the final weighted local regression.
//!
//! For each output pixel, [`estimate_params`] reduces the scaled feature space
//! of its window to the directions that carry more than noise and picks a
//! per-direction bandwidth. [`final_pass`] then fits a local linear model of
//! the color with Epanechnikov weights, tries a few global bandwidth
//! multipliers and keeps the one with the lowest leave-one-out error. The
//! intercept of that fit is the denoised color.

use super::buffer::{FilterBuffer, Rect};
use super::features::{
    firefly_rejected, pixel_color, pixel_variance, FeatureLayout, FeatureVector, MAX_FEATURES,
};
use super::linalg::{symmetric_eigen, SymMatrix, MAX_DIM};
use crate::kernel::globals::KernelIntegrator;
use crate::kernel::passes::COMBINED;

/// Global bandwidth multipliers tried by the final pass.
pub const BANDWIDTH_MULTIPLIERS: [f32; 5] = [0.5, 0.75, 1.0, 1.5, 2.0];

/// Regression state of one output pixel.
#[derive(Debug, Clone, Default)]
pub struct FilterStorage {
    /// Number of retained feature-space directions.
    pub rank: usize,
    /// Row `d` maps a centred raw feature vector to coordinate `d`.
    pub transform: [FeatureVector; MAX_FEATURES],
    pub scales: FeatureVector,
    pub singular: FeatureVector,
    /// Inverse bandwidth per retained direction.
    pub bandwidth: FeatureVector,
    pub singular_threshold: f32,
    pub feature_matrix_norm: f32,
    /// Multiplier chosen by the final pass.
    pub global_bandwidth: f32,
    pub sum_weight: f32,
    pub log_rmse: f32,
}

/// Destination of the final pass: the combined pass of the target tile.
pub struct FilterOutput<'a> {
    pub data: &'a mut [f32],
    pub offset: i32,
    pub stride: i32,
    pub pass_stride: usize,
}

impl FilterOutput<'_> {
    /// Stores `color * sample` into the RGB channels; alpha is left alone.
    #[inline(always)]
    fn write(&mut self, x: i32, y: i32, color: [f32; 3], sample: u32) {
        let index = self.offset + x + y * self.stride;
        assert!(index >= 0, "output pixel ({}, {}) lies before the buffer start", x, y);
        let start = index as usize * self.pass_stride + COMBINED;
        let scale = sample as f32;
        for (dst, c) in self.data[start..start + 3].iter_mut().zip(color) {
            *dst = c * scale;
        }
    }
}

/// Weight a neighbour received in the regression of a pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborWeight {
    pub x: i32,
    pub y: i32,
    pub frame: usize,
    pub weight: f32,
}

struct RegressionSample {
    x: i32,
    y: i32,
    frame: usize,
    coords: FeatureVector,
    target: [f32; 3],
    rejected: bool,
}

fn window(buf: &FilterBuffer, half_window: i32, x: i32, y: i32) -> Rect {
    Rect::new(x - half_window, y - half_window, x + half_window + 1, y + half_window + 1).intersect(&buf.rect())
}

#[inline(always)]
fn project(transform: &[FeatureVector; MAX_FEATURES], rank: usize, f: &FeatureVector) -> FeatureVector {
    let mut coords = [0.0; MAX_FEATURES];
    for (d, c) in coords.iter_mut().enumerate().take(rank) {
        *c = transform[d].iter().zip(f).map(|(t, v)| t * v).sum();
    }
    coords
}

/// Product of per-direction Epanechnikov kernels; zero outside the support.
#[inline(always)]
fn epanechnikov(coords: &FeatureVector, rank: usize, factors: Option<&FeatureVector>) -> f32 {
    let mut weight = 1.0f32;
    for d in 0..rank {
        let mut x2 = coords[d] * coords[d];
        if let Some(factors) = factors {
            x2 *= factors[d] * factors[d];
        }
        if x2 < 1.0 {
            weight *= 0.75 * (1.0 - x2);
        } else {
            return 0.0;
        }
    }
    weight
}

/// Estimates the feature transform and bandwidths of pixel `(x, y)`.
#[inline(always)]
pub fn estimate_pixel(buf: &FilterBuffer, layout: &FeatureLayout, half_window: i32, x: i32, y: i32) -> FilterStorage {
    let n = layout.count();
    let win = window(buf, half_window, x, y);
    let center = layout.pixel_features(buf, 0, x, y);

    let mut spread = layout.spread();
    for frame in 0..buf.frames() {
        for (qx, qy) in win.pixels() {
            let mut f = layout.pixel_features(buf, frame, qx, qy);
            layout.center(&mut f, &center);
            spread.add(&f);
        }
    }
    let scales = spread.scales();

    let mut gram = SymMatrix::zeros(n);
    let mut norm = 0.0f64;
    let mut row = [0.0f64; MAX_DIM];
    for frame in 0..buf.frames() {
        for (qx, qy) in win.pixels() {
            let mut f = layout.pixel_features(buf, frame, qx, qy);
            layout.center(&mut f, &center);
            for i in 0..n {
                row[i] = (f[i] * scales[i]) as f64;
            }
            gram.add_outer(&row[..n], 1.0);

            let v = layout.pixel_variances(buf, frame, qx, qy);
            norm += (0..n).map(|i| (v[i] * scales[i] * scales[i]) as f64).sum::<f64>();
        }
    }

    let eigen = symmetric_eigen(&gram);
    let threshold = 0.01 + 2.0 * norm.sqrt();
    let mut storage = FilterStorage {
        scales,
        singular_threshold: threshold as f32,
        feature_matrix_norm: norm as f32,
        ..FilterStorage::default()
    };
    let mut rank = 0;
    for k in 0..n {
        let sigma = eigen.values[k].max(0.0).sqrt();
        storage.singular[k] = sigma as f32;
        if sigma > threshold {
            rank += 1;
        }
    }
    let rank = rank.max(n.min(2));
    storage.rank = rank;
    for d in 0..rank {
        for j in 0..n {
            storage.transform[d][j] = (eigen.vectors[d][j] * scales[j] as f64) as f32;
        }
    }

    storage.bandwidth = estimate_bandwidth(buf, layout, &storage, &win, &center, x, y);
    storage
}

/// Per-direction inverse bandwidth from the curvature of a quadratic fit:
/// `h = (r σ² / (4 c² Σw))^(1/(r+4))`, clamped to `[0.05, 1]`.
fn estimate_bandwidth(
    buf: &FilterBuffer,
    layout: &FeatureLayout,
    storage: &FilterStorage,
    win: &Rect,
    center: &FeatureVector,
    x: i32,
    y: i32,
) -> FeatureVector {
    let rank = storage.rank;
    let dim = 1 + 2 * rank;
    let center_color = pixel_color(buf, 0, x, y);
    let sqrt_center_variance = pixel_variance(buf, 0, x, y).max(0.0).sqrt();

    let mut xtwx = SymMatrix::zeros(dim);
    let mut xtwy = [[0.0f64; MAX_DIM]; 3];
    let mut sum_weight = 0.0f64;
    let mut design = [0.0f64; MAX_DIM];
    for frame in 0..buf.frames() {
        for (qx, qy) in win.pixels() {
            let color = pixel_color(buf, frame, qx, qy);
            if firefly_rejected(&color, pixel_variance(buf, frame, qx, qy), &center_color, sqrt_center_variance) {
                continue;
            }
            let mut f = layout.pixel_features(buf, frame, qx, qy);
            layout.center(&mut f, center);
            let coords = project(&storage.transform, rank, &f);
            let weight = epanechnikov(&coords, rank, None);
            if weight == 0.0 {
                continue;
            }
            design[0] = 1.0;
            for d in 0..rank {
                design[1 + d] = coords[d] as f64;
                design[1 + rank + d] = (coords[d] * coords[d]) as f64;
            }
            let w = weight as f64;
            xtwx.add_outer(&design[..dim], w);
            for (ch, rhs) in xtwy.iter_mut().enumerate() {
                let t = (color[ch] - center_color[ch]) as f64;
                for i in 0..dim {
                    rhs[i] += w * design[i] * t;
                }
            }
            sum_weight += w;
        }
    }

    let mut bandwidth = [1.0f32; MAX_FEATURES];
    let Some(factor) = xtwx.cholesky() else {
        return bandwidth;
    };
    let coefficients = xtwy.map(|rhs| factor.solve(&rhs[..dim]));
    let sigma2 = pixel_variance(buf, 0, x, y).max(0.0) as f64;
    for (d, b) in bandwidth.iter_mut().enumerate().take(rank) {
        let c2 = coefficients.iter().map(|c| c[1 + rank + d] * c[1 + rank + d]).sum::<f64>() / 3.0;
        let denom = 4.0 * c2 * sum_weight;
        let h = if denom > 1e-10 {
            (rank as f64 * sigma2 / denom).powf(1.0 / (rank as f64 + 4.0)).clamp(0.05, 1.0)
        } else {
            1.0
        };
        *b = (1.0 / h) as f32;
    }
    bandwidth
}

fn gather_samples(
    buf: &FilterBuffer,
    layout: &FeatureLayout,
    half_window: i32,
    storage: &FilterStorage,
    x: i32,
    y: i32,
    samples: &mut Vec<RegressionSample>,
) {
    samples.clear();
    let win = window(buf, half_window, x, y);
    let center = layout.pixel_features(buf, 0, x, y);
    let center_color = pixel_color(buf, 0, x, y);
    let sqrt_center_variance = pixel_variance(buf, 0, x, y).max(0.0).sqrt();

    for frame in 0..buf.frames() {
        for (qx, qy) in win.pixels() {
            let color = pixel_color(buf, frame, qx, qy);
            let rejected = firefly_rejected(&color, pixel_variance(buf, frame, qx, qy), &center_color, sqrt_center_variance);
            let mut f = layout.pixel_features(buf, frame, qx, qy);
            layout.center(&mut f, &center);
            samples.push(RegressionSample {
                x: qx,
                y: qy,
                frame,
                coords: project(&storage.transform, storage.rank, &f),
                target: [0, 1, 2].map(|ch| color[ch] - center_color[ch]),
                rejected,
            });
        }
    }
}

fn bandwidth_factors(storage: &FilterStorage, multiplier: f32) -> FeatureVector {
    storage.bandwidth.map(|b| b / multiplier)
}

struct Fit {
    intercept: [f64; 3],
    score: f64,
    sum_weight: f64,
}

/// Weighted linear fit of the samples and its leave-one-out RMSE.
fn fit(samples: &[RegressionSample], rank: usize, factors: &FeatureVector) -> Fit {
    let dim = 1 + rank;
    let mut xtwx = SymMatrix::zeros(dim);
    let mut xtwy = [[0.0f64; MAX_DIM]; 3];
    let mut sum_weight = 0.0f64;
    let mut design = [0.0f64; MAX_DIM];
    let design_row = |s: &RegressionSample, design: &mut [f64; MAX_DIM]| {
        design[0] = 1.0;
        for d in 0..rank {
            design[1 + d] = s.coords[d] as f64;
        }
    };

    for s in samples.iter().filter(|s| !s.rejected) {
        let w = epanechnikov(&s.coords, rank, Some(factors)) as f64;
        if w == 0.0 {
            continue;
        }
        design_row(s, &mut design);
        xtwx.add_outer(&design[..dim], w);
        for (ch, rhs) in xtwy.iter_mut().enumerate() {
            for i in 0..dim {
                rhs[i] += w * design[i] * s.target[ch] as f64;
            }
        }
        sum_weight += w;
    }

    let Some(factor) = xtwx.cholesky() else {
        // Degenerate design: fall back to the weighted mean.
        let intercept = if sum_weight > 0.0 {
            [0, 1, 2].map(|ch| xtwy[ch][0] / sum_weight)
        } else {
            [0.0; 3]
        };
        let mut err = 0.0;
        let mut err_weight = 0.0;
        for s in samples.iter().filter(|s| !s.rejected) {
            let w = epanechnikov(&s.coords, rank, Some(factors)) as f64;
            let h = if sum_weight > 0.0 { w / sum_weight } else { 1.0 };
            if w == 0.0 || h >= 1.0 - 1e-6 {
                continue;
            }
            let e: f64 = (0..3).map(|ch| ((s.target[ch] as f64 - intercept[ch]) / (1.0 - h)).powi(2)).sum::<f64>() / 3.0;
            err += w * e;
            err_weight += w;
        }
        let score = if err_weight > 0.0 { (err / err_weight).sqrt() } else { f64::INFINITY };
        return Fit { intercept, score, sum_weight };
    };

    let beta = xtwy.map(|rhs| factor.solve(&rhs[..dim]));
    let mut err = 0.0;
    let mut err_weight = 0.0;
    for s in samples.iter().filter(|s| !s.rejected) {
        let w = epanechnikov(&s.coords, rank, Some(factors)) as f64;
        if w == 0.0 {
            continue;
        }
        design_row(s, &mut design);
        let h = w * factor.inverse_quadratic_form(&design[..dim]);
        if h >= 1.0 - 1e-6 {
            continue;
        }
        let mut e = 0.0;
        for ch in 0..3 {
            let prediction: f64 = (0..dim).map(|i| design[i] * beta[ch][i]).sum();
            let residual = (s.target[ch] as f64 - prediction) / (1.0 - h);
            e += residual * residual;
        }
        err += w * e / 3.0;
        err_weight += w;
    }
    let score = if err_weight > 0.0 { (err / err_weight).sqrt() } else { f64::INFINITY };
    Fit {
        intercept: [beta[0][0], beta[1][0], beta[2][0]],
        score,
        sum_weight,
    }
}

/// Estimates parameters for every pixel of `area` (row-major into `storage`).
#[inline(always)]
pub fn estimate_params(buf: &FilterBuffer, settings: &KernelIntegrator, area: Rect, storage: &mut [FilterStorage]) {
    let layout = FeatureLayout::new(buf.frames(), settings.second_order_screen);
    for ((x, y), st) in area.pixels().zip(storage.iter_mut()) {
        *st = estimate_pixel(buf, &layout, settings.half_window, x, y);
    }
}

/// Runs the regression for every pixel of `area` and writes the result.
#[inline(always)]
pub fn final_pass(
    buf: &FilterBuffer,
    settings: &KernelIntegrator,
    area: Rect,
    storage: &mut [FilterStorage],
    sample: u32,
    out: &mut FilterOutput<'_>,
) {
    let layout = FeatureLayout::new(buf.frames(), settings.second_order_screen);
    let mut samples = Vec::new();
    for ((x, y), st) in area.pixels().zip(storage.iter_mut()) {
        gather_samples(buf, &layout, settings.half_window, st, x, y, &mut samples);

        let mut best: Option<(f32, Fit)> = None;
        for multiplier in BANDWIDTH_MULTIPLIERS {
            let candidate = fit(&samples, st.rank, &bandwidth_factors(st, multiplier));
            let better = match &best {
                Some((_, b)) => candidate.score < b.score,
                None => true,
            };
            if better {
                best = Some((multiplier, candidate));
            }
        }
        let Some((multiplier, fit)) = best else { continue };

        st.global_bandwidth = multiplier;
        st.sum_weight = fit.sum_weight as f32;
        st.log_rmse = fit.score.max(1e-10).ln() as f32;

        let center_color = pixel_color(buf, 0, x, y);
        let color = [0, 1, 2].map(|ch| center_color[ch] + fit.intercept[ch] as f32);
        out.write(x, y, color, sample);
    }
}

/// Weights the final regression of pixel `(x, y)` gives its neighbours at
/// the bandwidth the final pass selected. Rejected fireflies weigh zero.
pub fn regression_weights(
    buf: &FilterBuffer,
    settings: &KernelIntegrator,
    storage: &FilterStorage,
    x: i32,
    y: i32,
) -> Vec<NeighborWeight> {
    let layout = FeatureLayout::new(buf.frames(), settings.second_order_screen);
    let mut samples = Vec::new();
    gather_samples(buf, &layout, settings.half_window, storage, x, y, &mut samples);
    let multiplier = if storage.global_bandwidth > 0.0 { storage.global_bandwidth } else { 1.0 };
    let factors = bandwidth_factors(storage, multiplier);
    samples
        .iter()
        .map(|s| NeighborWeight {
            x: s.x,
            y: s.y,
            frame: s.frame,
            weight: if s.rejected { 0.0 } else { epanechnikov(&s.coords, storage.rank, Some(&factors)) },
        })
        .collect()
}
