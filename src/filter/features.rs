// src/filter/features.rs

//! Per-pixel feature vectors used as regression covariates.
//!
//! Order: `x, y, [t], depth, normal xyz, shadow, albedo rgb, [x², y², xy]`.

use super::buffer::{Feature, FilterBuffer};

/// Longest feature vector: three positional, eight buffer features and three
/// second-order screen terms.
pub const MAX_FEATURES: usize = 14;

pub type FeatureVector = [f32; MAX_FEATURES];

/// Which optional dimensions are part of the feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLayout {
    pub temporal: bool,
    pub second_order: bool,
}

impl FeatureLayout {
    pub fn new(frames: usize, second_order: bool) -> Self {
        FeatureLayout { temporal: frames > 1, second_order }
    }

    /// Index of the depth feature; everything before it is positional.
    fn base(&self) -> usize {
        2 + self.temporal as usize
    }

    pub fn count(&self) -> usize {
        self.base() + 8 + if self.second_order { 3 } else { 0 }
    }

    fn second_order_index(&self) -> usize {
        self.base() + 8
    }

    /// Raw feature values of a pixel, second-order terms left at zero.
    #[inline(always)]
    pub fn pixel_features(&self, buf: &FilterBuffer, frame: usize, x: i32, y: i32) -> FeatureVector {
        let mut f = [0.0; MAX_FEATURES];
        f[0] = x as f32;
        f[1] = y as f32;
        if self.temporal {
            f[2] = buf.frame_time(frame) as f32;
        }
        let b = self.base();
        f[b] = buf.value(frame, Feature::Depth.mean(), x, y);
        for (i, n) in Feature::NORMAL.iter().enumerate() {
            f[b + 1 + i] = buf.value(frame, n.mean(), x, y);
        }
        f[b + 4] = buf.value(frame, Feature::Shadow.mean(), x, y);
        for (i, a) in Feature::ALBEDO.iter().enumerate() {
            f[b + 5 + i] = buf.value(frame, a.mean(), x, y);
        }
        f
    }

    /// Variance of each feature. Positional terms are exact and the shadow
    /// feature is treated as noise free.
    #[inline(always)]
    pub fn pixel_variances(&self, buf: &FilterBuffer, frame: usize, x: i32, y: i32) -> FeatureVector {
        let mut v = [0.0; MAX_FEATURES];
        let b = self.base();
        v[b] = buf.value(frame, Feature::Depth.variance(), x, y);
        for (i, n) in Feature::NORMAL.iter().enumerate() {
            v[b + 1 + i] = buf.value(frame, n.variance(), x, y);
        }
        for (i, a) in Feature::ALBEDO.iter().enumerate() {
            v[b + 5 + i] = buf.value(frame, a.variance(), x, y);
        }
        v
    }

    /// Subtracts the centre pixel's features and fills the second-order terms.
    #[inline(always)]
    pub fn center(&self, f: &mut FeatureVector, center: &FeatureVector) {
        let n = self.second_order_index();
        for i in 0..n {
            f[i] -= center[i];
        }
        if self.second_order {
            f[n] = f[0] * f[0];
            f[n + 1] = f[1] * f[1];
            f[n + 2] = f[0] * f[1];
        }
    }

    /// Starts collecting the spread of centred features over a window.
    pub fn spread(&self) -> Spread {
        Spread { layout: *self, max: [0.0; MAX_FEATURES] }
    }
}

/// Largest deviation from the centre pixel seen per feature. Normals and
/// albedo are measured as 3-vectors so their scale is rotation invariant.
#[derive(Debug, Clone)]
pub struct Spread {
    layout: FeatureLayout,
    max: FeatureVector,
}

impl Spread {
    #[inline(always)]
    pub fn add(&mut self, centred: &FeatureVector) {
        let b = self.layout.base();
        let count = self.layout.count();
        for i in 0..count {
            let in_triple = (b + 1..b + 4).contains(&i) || (b + 5..b + 8).contains(&i);
            if !in_triple {
                self.max[i] = self.max[i].max(centred[i].abs());
            }
        }
        for start in [b + 1, b + 5] {
            let len_sq: f32 = centred[start..start + 3].iter().map(|v| v * v).sum();
            for i in start..start + 3 {
                self.max[i] = self.max[i].max(len_sq);
            }
        }
    }

    /// Per-feature scale `1 / max(spread, 0.01)`.
    pub fn scales(&self) -> FeatureVector {
        let b = self.layout.base();
        let mut scale = [0.0; MAX_FEATURES];
        for (i, s) in scale.iter_mut().enumerate().take(self.layout.count()) {
            let in_triple = (b + 1..b + 4).contains(&i) || (b + 5..b + 8).contains(&i);
            let spread = if in_triple { self.max[i].sqrt() } else { self.max[i] };
            *s = 1.0 / spread.max(0.01);
        }
        scale
    }
}

/// Filtered color of a pixel.
#[inline(always)]
pub fn pixel_color(buf: &FilterBuffer, frame: usize, x: i32, y: i32) -> [f32; 3] {
    Feature::COLOR.map(|c| buf.value(frame, c.mean(), x, y))
}

/// Average color variance of a pixel.
#[inline(always)]
pub fn pixel_variance(buf: &FilterBuffer, frame: usize, x: i32, y: i32) -> f32 {
    let sum: f32 = Feature::COLOR.iter().map(|c| buf.value(frame, c.variance(), x, y)).sum();
    sum * (1.0 / 3.0)
}

/// True if a neighbour's color is too far from the centre to be trusted.
#[inline(always)]
pub fn firefly_rejected(color: &[f32; 3], variance: f32, center: &[f32; 3], sqrt_center_variance: f32) -> bool {
    let diff = ((color[0] - center[0]).abs() + (color[1] - center[1]).abs() + (color[2] - center[2]).abs()) / 3.0;
    let noise = sqrt_center_variance + variance.max(0.0).sqrt() + 0.005;
    diff > 3.0 * noise
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_counts() {
        assert_eq!(FeatureLayout::new(1, false).count(), 10);
        assert_eq!(FeatureLayout::new(3, false).count(), 11);
        assert_eq!(FeatureLayout::new(3, true).count(), MAX_FEATURES);
    }

    #[test]
    fn centring_fills_second_order_terms() {
        let layout = FeatureLayout::new(1, true);
        let mut f = [0.0; MAX_FEATURES];
        f[0] = 5.0;
        f[1] = 7.0;
        let mut c = [0.0; MAX_FEATURES];
        c[0] = 3.0;
        c[1] = 4.0;
        layout.center(&mut f, &c);
        assert_eq!(&f[..2], &[2.0, 3.0]);
        assert_eq!(&f[10..13], &[4.0, 9.0, 6.0]);
    }

    #[test]
    fn normal_spread_uses_vector_length() {
        let layout = FeatureLayout::new(1, false);
        let mut spread = layout.spread();
        let mut f = [0.0; MAX_FEATURES];
        f[3] = 0.3;
        f[4] = 0.4;
        spread.add(&f);
        let s = spread.scales();
        assert!((s[3] - 2.0).abs() < 1e-5);
        assert!((s[5] - 2.0).abs() < 1e-5);
        // Untouched features clamp to 1 / 0.01.
        assert_eq!(s[2], 100.0);
    }

    #[test]
    fn firefly_threshold() {
        let c = [0.5; 3];
        assert!(!firefly_rejected(&[0.52; 3], 0.0001, &c, 0.01));
        assert!(firefly_rejected(&[50.0; 3], 0.0001, &c, 0.01));
    }
}
