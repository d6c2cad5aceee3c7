//! Read access to the render buffers of a 3×3 tile neighbourhood.

use super::buffer::Rect;
use crate::kernel::passes::denoising;

/// One tile's render buffer as seen by the prefilter kernels.
#[derive(Debug, Clone, Copy)]
pub struct TileSlice<'a> {
    pub data: &'a [f32],
    pub offset: i32,
    pub stride: i32,
    /// Floats between consecutive frames of this buffer.
    pub frame_stride: usize,
}

/// The 3×3 grid of tiles around the tile being denoised (self at index 4).
///
/// `tile_x`/`tile_y` are the column and row boundaries of the grid; several
/// entries may share one buffer, and border entries may be empty.
#[derive(Debug, Clone)]
pub struct Neighborhood<'a> {
    pub tile_x: [i32; 4],
    pub tile_y: [i32; 4],
    pub tiles: [TileSlice<'a>; 9],
    pub pass_stride: usize,
    pub denoising_offset: usize,
}

impl<'a> Neighborhood<'a> {
    /// A neighbourhood where a single buffer covers all of `bounds`.
    pub fn single(tile: TileSlice<'a>, bounds: Rect, pass_stride: usize, denoising_offset: usize) -> Self {
        Neighborhood {
            tile_x: [bounds.x0, bounds.x0, bounds.x1, bounds.x1],
            tile_y: [bounds.y0, bounds.y0, bounds.y1, bounds.y1],
            tiles: [tile; 9],
            pass_stride,
            denoising_offset,
        }
    }

    /// Outer extent of the grid.
    pub fn bounds(&self) -> Rect {
        Rect::new(self.tile_x[0], self.tile_y[0], self.tile_x[3], self.tile_y[3])
    }

    /// The denoising passes of pixel `(x, y)` in `frame`.
    #[inline(always)]
    pub fn pixel(&self, frame: usize, x: i32, y: i32) -> &'a [f32] {
        let ix = (x >= self.tile_x[1]) as usize + (x >= self.tile_x[2]) as usize;
        let iy = (y >= self.tile_y[1]) as usize + (y >= self.tile_y[2]) as usize;
        let tile = &self.tiles[ix + 3 * iy];
        let index = tile.offset + x + y * tile.stride;
        assert!(index >= 0, "pixel ({}, {}) lies outside its tile buffer", x, y);
        let start = index as usize * self.pass_stride + frame * tile.frame_stride + self.denoising_offset;
        &tile.data[start..start + denoising::COUNT]
    }
}
