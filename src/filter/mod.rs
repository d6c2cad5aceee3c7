// src/filter/mod.rs

//! The denoising engine.
//!
//! Denoising a region happens in two halves:
//!
//! 1. [`fill_filter_buffer`] reads the sample statistics of up to nine tiles
//!    and produces the 22-plane [`FilterBuffer`]: prefiltered features, a
//!    twice cross-filtered shadow feature and the unfiltered color.
//! 2. [`run_reconstruction`] estimates a local feature-space model per output
//!    pixel and writes the regression result into the target tile.
//!
//! Every arithmetic step goes through the selected [`KernelFunctions`] table.

pub mod buffer;
pub mod features;
pub mod linalg;
pub mod neighborhood;
pub mod nlm;
pub mod prefilter;
pub mod reconstruction;


pub use buffer::{Feature, FilterBuffer, Plane, PlaneArea, Rect, NUM_PLANES};
pub use neighborhood::{Neighborhood, TileSlice};
pub use nlm::NlmParams;
pub use prefilter::ShadowPlanes;
pub use reconstruction::{regression_weights, FilterOutput, FilterStorage, NeighborWeight};

use log::trace;

use crate::error::{try_alloc_zeroed, DeviceError, DeviceResult};
use crate::kernel::globals::KernelIntegrator;
use crate::kernel::passes::denoising;
use crate::kernel::KernelFunctions;

/// Smoothing of the seven general features.
pub const FEATURE_PREFILTER: NlmParams = NlmParams::new(2, 2, 1.0, 0.25);
/// Smoothing of the shadow buffer variance, guided by the sample variance.
pub const SHADOW_VARIANCE_SMOOTHING: NlmParams = NlmParams::new(6, 3, 4.0, 1.0);
/// First cross filter of the two shadow halves.
pub const SHADOW_CROSS_FILTER: NlmParams = NlmParams::new(5, 3, 1.0, 0.25);
/// Second cross filter, driven by the residual variance.
pub const SHADOW_SECOND_PASS: NlmParams = NlmParams::new(4, 2, 1.0, 0.5);
/// Window radius of the residual-variance quantile.
pub const RESIDUAL_RADIUS: usize = 2;

/// Render-buffer mean/variance passes and the feature they prefilter into.
const PREFILTERED_FEATURES: [(usize, usize, Feature); 7] = [
    (denoising::NORMAL, denoising::NORMAL_SQ, Feature::NormalX),
    (denoising::NORMAL + 1, denoising::NORMAL_SQ + 1, Feature::NormalY),
    (denoising::NORMAL + 2, denoising::NORMAL_SQ + 2, Feature::NormalZ),
    (denoising::ALBEDO, denoising::ALBEDO_SQ, Feature::AlbedoR),
    (denoising::ALBEDO + 1, denoising::ALBEDO_SQ + 1, Feature::AlbedoG),
    (denoising::ALBEDO + 2, denoising::ALBEDO_SQ + 2, Feature::AlbedoB),
    (denoising::DEPTH, denoising::DEPTH_SQ, Feature::Depth),
];

/// The rectangle of sample data needed to denoise `area`: grown by the
/// regression half window (one extra pixel on the high side) and clamped to
/// the data actually available.
pub fn filter_rect(area: Rect, half_window: i32, bounds: Rect) -> Rect {
    area.grow(half_window, half_window + 1).intersect(&bounds)
}

/// Builds the filter buffer for `rect` from the tiles in `src`.
pub fn fill_filter_buffer(
    kernels: &KernelFunctions,
    sample: u32,
    src: &Neighborhood<'_>,
    rect: Rect,
    frames: usize,
    prev_frames: usize,
) -> DeviceResult<FilterBuffer> {
    if rect.is_empty() || !src.bounds().contains_rect(&rect) {
        return Err(DeviceError::InvalidRegion(format!(
            "filter rect {:?} is empty or outside the neighbourhood {:?}",
            rect,
            src.bounds()
        )));
    }
    let mut buf = FilterBuffer::new(rect, frames, prev_frames)?;
    let area = *buf.area();
    trace!("Filling filter buffer for {:?} ({} frames, {} samples)", rect, buf.frames(), sample);

    for frame in 0..buf.frames() {
        prefilter_features(kernels, sample, src, frame, &area, &mut buf);
        prefilter_shadow(kernels, sample, src, frame, &area, &mut buf);
        copy_color(kernels, sample, src, frame, &area, &mut buf);
    }
    Ok(buf)
}

fn prefilter_features(
    kernels: &KernelFunctions,
    sample: u32,
    src: &Neighborhood<'_>,
    frame: usize,
    area: &PlaneArea,
    buf: &mut FilterBuffer,
) {
    let unfiltered = Plane::scratch(0);
    for (mean_from, variance_from, feature) in PREFILTERED_FEATURES {
        {
            let ([], [mean, variance]) = buf.planes(frame, [], [unfiltered, feature.variance()]);
            (kernels.filter_get_feature)(sample, src, frame, mean_from, variance_from, area, mean, variance);
        }
        let ([noisy, variance], [out]) = buf.planes(frame, [unfiltered, feature.variance()], [feature.mean()]);
        (kernels.filter_non_local_means)(noisy, noisy, variance, out, area, FEATURE_PREFILTER);
    }
}

fn prefilter_shadow(
    kernels: &KernelFunctions,
    sample: u32,
    src: &Neighborhood<'_>,
    frame: usize,
    area: &PlaneArea,
    buf: &mut FilterBuffer,
) {
    let sample_v = Plane::scratch(0);
    let sample_vv = Plane::scratch(1);
    let buffer_v = Plane::scratch(2);
    let clean_v = Plane::scratch(3);
    let half_a = Plane::scratch(4);
    let half_b = Plane::scratch(5);

    {
        let ([], [a, b, sv, svv, bv]) = buf.planes(frame, [], [half_a, half_b, sample_v, sample_vv, buffer_v]);
        let out = ShadowPlanes {
            unfiltered_a: a,
            unfiltered_b: b,
            sample_variance: sv,
            sample_variance_v: svv,
            buffer_variance: bv,
        };
        (kernels.filter_divide_shadow)(sample, src, frame, area, out);
    }

    // The buffer variance is noisy; smooth it using the sample variance as guide.
    {
        let ([bv, sv, svv], [cv]) = buf.planes(frame, [buffer_v, sample_v, sample_vv], [clean_v]);
        (kernels.filter_non_local_means)(bv, sv, svv, cv, area, SHADOW_VARIANCE_SMOOTHING);
    }

    // Filter each half with the other one providing the weights.
    // Filtered A lands in sample_v, filtered B in buffer_v.
    {
        let ([a, b, cv], [fa, fb]) = buf.planes(frame, [half_a, half_b, clean_v], [sample_v, buffer_v]);
        (kernels.filter_non_local_means)(a, b, cv, fa, area, SHADOW_CROSS_FILTER);
        (kernels.filter_non_local_means)(b, a, cv, fb, area, SHADOW_CROSS_FILTER);
    }

    {
        let ([fa, fb], [residual]) = buf.planes(frame, [sample_v, buffer_v], [sample_vv]);
        (kernels.filter_combine_halves)(None, Some(residual), fa, fb, area, RESIDUAL_RADIUS);
    }

    {
        let ([fa, fb, residual], [a, b]) = buf.planes(frame, [sample_v, buffer_v, sample_vv], [half_a, half_b]);
        (kernels.filter_non_local_means)(fa, fb, residual, a, area, SHADOW_SECOND_PASS);
        (kernels.filter_non_local_means)(fb, fa, residual, b, area, SHADOW_SECOND_PASS);
    }

    let ([a, b], [mean, variance]) =
        buf.planes(frame, [half_a, half_b], [Feature::Shadow.mean(), Feature::Shadow.variance()]);
    (kernels.filter_combine_halves)(Some(mean), Some(variance), a, b, area, 0);
}

/// Copies the color statistics unfiltered; this overwrites the scratch planes.
fn copy_color(
    kernels: &KernelFunctions,
    sample: u32,
    src: &Neighborhood<'_>,
    frame: usize,
    area: &PlaneArea,
    buf: &mut FilterBuffer,
) {
    for (i, feature) in Feature::COLOR.into_iter().enumerate() {
        let ([], [mean, variance]) = buf.planes(frame, [], [feature.mean(), feature.variance()]);
        (kernels.filter_get_feature)(
            sample,
            src,
            frame,
            denoising::COLOR + i,
            denoising::COLOR_SQ + i,
            area,
            mean,
            variance,
        );
    }
}

/// Estimates parameters and runs the final pass over `area`, writing the
/// denoised color into `out`. Returns the per-pixel regression state.
pub fn run_reconstruction(
    kernels: &KernelFunctions,
    settings: &KernelIntegrator,
    buf: &FilterBuffer,
    area: Rect,
    sample: u32,
    out: &mut FilterOutput<'_>,
) -> DeviceResult<Vec<FilterStorage>> {
    if !buf.rect().contains_rect(&area) {
        return Err(DeviceError::InvalidRegion(format!(
            "filter area {:?} is not covered by the filter buffer {:?}",
            area,
            buf.rect()
        )));
    }
    let mut storage = try_alloc_zeroed::<FilterStorage>(area.area(), "filter storage")?;
    (kernels.filter_estimate_params)(buf, settings, area, &mut storage);
    (kernels.filter_final_pass)(buf, settings, area, &mut storage, sample, out);
    Ok(storage)
}
