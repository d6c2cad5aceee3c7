//! Per-pixel layout of render buffers.
//!
//! A pixel holds `pass_stride` floats: the combined RGBA accumulation first,
//! then, when denoising data is enabled, [`denoising::COUNT`] floats of
//! feature moments.

/// Offset of the combined RGBA pass inside a pixel.
pub const COMBINED: usize = 0;

/// Offsets of the denoising data, relative to `PassLayout::denoising_offset`.
pub mod denoising {
    /// Sum of normals (3).
    pub const NORMAL: usize = 0;
    /// Sum of squared normals (3).
    pub const NORMAL_SQ: usize = 3;
    /// Sum of albedo (3).
    pub const ALBEDO: usize = 6;
    /// Sum of squared albedo (3).
    pub const ALBEDO_SQ: usize = 9;
    pub const DEPTH: usize = 12;
    pub const DEPTH_SQ: usize = 13;
    /// Shadow half A (even samples): count, visibility sum, visibility² sum.
    pub const SHADOW_A: usize = 14;
    /// Shadow half B (odd samples), same layout as A.
    pub const SHADOW_B: usize = 17;
    /// Sum of color (3).
    pub const COLOR: usize = 20;
    /// Sum of squared color (3).
    pub const COLOR_SQ: usize = 23;
    pub const COUNT: usize = 26;
}

/// Which passes a render buffer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassLayout {
    pub pass_stride: usize,
    pub denoising_offset: Option<usize>,
}

impl PassLayout {
    pub fn new(denoising_data: bool) -> Self {
        if denoising_data {
            PassLayout {
                pass_stride: 4 + denoising::COUNT,
                denoising_offset: Some(4),
            }
        } else {
            PassLayout {
                pass_stride: 4,
                denoising_offset: None,
            }
        }
    }
}

/// Addressing of a tile inside its render buffer: pixel `(x, y)` starts at
/// `(offset + x + y * stride) * pass_stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAddress {
    pub offset: i32,
    pub stride: i32,
    pub layout: PassLayout,
}

impl BufferAddress {
    pub fn new(offset: i32, stride: i32, layout: PassLayout) -> Self {
        BufferAddress { offset, stride, layout }
    }

    /// Linear pixel number of `(x, y)` inside the buffer.
    #[inline(always)]
    pub fn pixel(&self, x: i32, y: i32) -> usize {
        let index = self.offset + x + y * self.stride;
        assert!(index >= 0, "pixel ({}, {}) lies before the buffer start", x, y);
        index as usize
    }

    /// Index of pixel `(x, y)`'s first float.
    #[inline(always)]
    pub fn pixel_index(&self, x: i32, y: i32) -> usize {
        self.pixel(x, y) * self.layout.pass_stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denoising_layout_is_contiguous() {
        let layout = PassLayout::new(true);
        assert_eq!(layout.pass_stride, 30);
        assert_eq!(layout.denoising_offset, Some(4));
        assert_eq!(denoising::COLOR_SQ + 3, denoising::COUNT);
        assert_eq!(PassLayout::new(false).pass_stride, 4);
    }

    #[test]
    fn address_applies_offset_and_stride() {
        // Tile origin at (10, 20) in a buffer 8 pixels wide.
        let address = BufferAddress::new(-10 - 20 * 8, 8, PassLayout::new(false));
        assert_eq!(address.pixel_index(10, 20), 0);
        assert_eq!(address.pixel_index(11, 21), 9 * 4);
    }
}
