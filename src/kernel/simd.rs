//! Lane types the vectorized kernels are generic over.
//!
//! Every implementation computes the same IEEE operations lane by lane, so a
//! kernel instantiated with [`Scalar`] and with [`F32x4`]/[`F32x8`] produces the
//! same numbers as long as it accumulates in the same order.

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;
use core::ops::{Add, Div, Mul, Sub};

/// Minimal f32 vector interface used by the filter kernels.
pub(crate) trait SimdF32:
    Copy + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> + Div<Output = Self>
{
    const LANES: usize;

    fn splat(val: f32) -> Self;

    /// Loads `LANES` values starting at `start`; lanes outside `src` read zero.
    fn load_window(src: &[f32], start: isize) -> Self;

    /// Stores the first `min(LANES, dst.len())` lanes.
    fn store_partial(self, dst: &mut [f32]);

    fn min(self, rhs: Self) -> Self;

    fn max(self, rhs: Self) -> Self;

    /// `1.0` in lanes `lo..hi`, `0.0` elsewhere.
    fn lane_mask(lo: usize, hi: usize) -> Self;

    /// Lane-wise `exp`, evaluated with the scalar libm routine.
    fn exp(self) -> Self;
}

#[inline(always)]
fn window_array<const N: usize>(src: &[f32], start: isize) -> [f32; N] {
    let mut arr = [0.0f32; N];
    for (l, v) in arr.iter_mut().enumerate() {
        let i = start + l as isize;
        if i >= 0 && (i as usize) < src.len() {
            *v = src[i as usize];
        }
    }
    arr
}

#[inline(always)]
fn mask_array<const N: usize>(lo: usize, hi: usize) -> [f32; N] {
    let mut arr = [0.0f32; N];
    for (l, v) in arr.iter_mut().enumerate() {
        if l >= lo && l < hi {
            *v = 1.0;
        }
    }
    arr
}

// ============================================================================
// Scalar
// ============================================================================

/// One-lane fallback used by the portable kernel table.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(transparent)]
pub(crate) struct Scalar(pub(crate) f32);

impl Add for Scalar {
    type Output = Self;
    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        Scalar(self.0 + rhs.0)
    }
}

impl Sub for Scalar {
    type Output = Self;
    #[inline(always)]
    fn sub(self, rhs: Self) -> Self {
        Scalar(self.0 - rhs.0)
    }
}

impl Mul for Scalar {
    type Output = Self;
    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        Scalar(self.0 * rhs.0)
    }
}

impl Div for Scalar {
    type Output = Self;
    #[inline(always)]
    fn div(self, rhs: Self) -> Self {
        Scalar(self.0 / rhs.0)
    }
}

impl SimdF32 for Scalar {
    const LANES: usize = 1;

    #[inline(always)]
    fn splat(val: f32) -> Self {
        Scalar(val)
    }

    #[inline(always)]
    fn load_window(src: &[f32], start: isize) -> Self {
        if start >= 0 && (start as usize) < src.len() {
            Scalar(src[start as usize])
        } else {
            Scalar(0.0)
        }
    }

    #[inline(always)]
    fn store_partial(self, dst: &mut [f32]) {
        if let Some(v) = dst.first_mut() {
            *v = self.0;
        }
    }

    #[inline(always)]
    fn min(self, rhs: Self) -> Self {
        Scalar(self.0.min(rhs.0))
    }

    #[inline(always)]
    fn max(self, rhs: Self) -> Self {
        Scalar(self.0.max(rhs.0))
    }

    #[inline(always)]
    fn lane_mask(lo: usize, hi: usize) -> Self {
        Scalar(if lo == 0 && hi >= 1 { 1.0 } else { 0.0 })
    }

    #[inline(always)]
    fn exp(self) -> Self {
        Scalar(self.0.exp())
    }
}

// ============================================================================
// SSE (4 lanes)
// ============================================================================

/// 4-lane f32 vector for the SSE kernel tables. Crate-private like [`F32x8`].
#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone)]
#[repr(transparent)]
pub(crate) struct F32x4(__m128);

#[cfg(target_arch = "x86_64")]
impl F32x4 {
    #[inline(always)]
    fn from_array(arr: [f32; 4]) -> Self {
        unsafe { Self(_mm_loadu_ps(arr.as_ptr())) }
    }

    #[inline(always)]
    pub(crate) fn to_array(self) -> [f32; 4] {
        let mut arr = [0.0f32; 4];
        unsafe { _mm_storeu_ps(arr.as_mut_ptr(), self.0) };
        arr
    }
}

#[cfg(target_arch = "x86_64")]
impl core::fmt::Debug for F32x4 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "F32x4({:?})", self.to_array())
    }
}

#[cfg(target_arch = "x86_64")]
impl Add for F32x4 {
    type Output = Self;
    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        unsafe { Self(_mm_add_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl Sub for F32x4 {
    type Output = Self;
    #[inline(always)]
    fn sub(self, rhs: Self) -> Self {
        unsafe { Self(_mm_sub_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl Mul for F32x4 {
    type Output = Self;
    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        unsafe { Self(_mm_mul_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl Div for F32x4 {
    type Output = Self;
    #[inline(always)]
    fn div(self, rhs: Self) -> Self {
        unsafe { Self(_mm_div_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl SimdF32 for F32x4 {
    const LANES: usize = 4;

    #[inline(always)]
    fn splat(val: f32) -> Self {
        unsafe { Self(_mm_set1_ps(val)) }
    }

    #[inline(always)]
    fn load_window(src: &[f32], start: isize) -> Self {
        if start >= 0 && start as usize + 4 <= src.len() {
            // SAFETY: bounds checked above.
            unsafe { Self(_mm_loadu_ps(src.as_ptr().add(start as usize))) }
        } else {
            Self::from_array(window_array::<4>(src, start))
        }
    }

    #[inline(always)]
    fn store_partial(self, dst: &mut [f32]) {
        if dst.len() >= 4 {
            // SAFETY: at least four writable floats.
            unsafe { _mm_storeu_ps(dst.as_mut_ptr(), self.0) }
        } else {
            let arr = self.to_array();
            let n = dst.len();
            dst.copy_from_slice(&arr[..n]);
        }
    }

    #[inline(always)]
    fn min(self, rhs: Self) -> Self {
        unsafe { Self(_mm_min_ps(self.0, rhs.0)) }
    }

    #[inline(always)]
    fn max(self, rhs: Self) -> Self {
        unsafe { Self(_mm_max_ps(self.0, rhs.0)) }
    }

    #[inline(always)]
    fn lane_mask(lo: usize, hi: usize) -> Self {
        Self::from_array(mask_array::<4>(lo, hi))
    }

    #[inline(always)]
    fn exp(self) -> Self {
        Self::from_array(self.to_array().map(f32::exp))
    }
}

// ============================================================================
// AVX (8 lanes)
// ============================================================================

/// 8-lane f32 vector for the AVX kernel tables.
///
/// Crate-private: every method uses AVX intrinsics, so values may only be
/// created inside the `#[target_feature(enable = "avx")]` table wrappers,
/// which are only reachable after runtime detection.
#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone)]
#[repr(transparent)]
pub(crate) struct F32x8(__m256);

#[cfg(target_arch = "x86_64")]
impl F32x8 {
    #[inline(always)]
    fn from_array(arr: [f32; 8]) -> Self {
        unsafe { Self(_mm256_loadu_ps(arr.as_ptr())) }
    }

    #[inline(always)]
    pub(crate) fn to_array(self) -> [f32; 8] {
        let mut arr = [0.0f32; 8];
        unsafe { _mm256_storeu_ps(arr.as_mut_ptr(), self.0) };
        arr
    }
}

#[cfg(target_arch = "x86_64")]
impl Add for F32x8 {
    type Output = Self;
    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        unsafe { Self(_mm256_add_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl Sub for F32x8 {
    type Output = Self;
    #[inline(always)]
    fn sub(self, rhs: Self) -> Self {
        unsafe { Self(_mm256_sub_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl Mul for F32x8 {
    type Output = Self;
    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        unsafe { Self(_mm256_mul_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl Div for F32x8 {
    type Output = Self;
    #[inline(always)]
    fn div(self, rhs: Self) -> Self {
        unsafe { Self(_mm256_div_ps(self.0, rhs.0)) }
    }
}

#[cfg(target_arch = "x86_64")]
impl SimdF32 for F32x8 {
    const LANES: usize = 8;

    #[inline(always)]
    fn splat(val: f32) -> Self {
        unsafe { Self(_mm256_set1_ps(val)) }
    }

    #[inline(always)]
    fn load_window(src: &[f32], start: isize) -> Self {
        if start >= 0 && start as usize + 8 <= src.len() {
            // SAFETY: bounds checked above.
            unsafe { Self(_mm256_loadu_ps(src.as_ptr().add(start as usize))) }
        } else {
            Self::from_array(window_array::<8>(src, start))
        }
    }

    #[inline(always)]
    fn store_partial(self, dst: &mut [f32]) {
        if dst.len() >= 8 {
            // SAFETY: at least eight writable floats.
            unsafe { _mm256_storeu_ps(dst.as_mut_ptr(), self.0) }
        } else {
            let arr = self.to_array();
            let n = dst.len();
            dst.copy_from_slice(&arr[..n]);
        }
    }

    #[inline(always)]
    fn min(self, rhs: Self) -> Self {
        unsafe { Self(_mm256_min_ps(self.0, rhs.0)) }
    }

    #[inline(always)]
    fn max(self, rhs: Self) -> Self {
        unsafe { Self(_mm256_max_ps(self.0, rhs.0)) }
    }

    #[inline(always)]
    fn lane_mask(lo: usize, hi: usize) -> Self {
        Self::from_array(mask_array::<8>(lo, hi))
    }

    #[inline(always)]
    fn exp(self) -> Self {
        Self::from_array(self.to_array().map(f32::exp))
    }
}
