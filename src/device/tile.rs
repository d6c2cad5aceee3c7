// src/device/tile.rs

//! Render tiles, the buffers behind them and the tile acquisition protocol.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{try_alloc_zeroed, DeviceResult};
use crate::filter::Rect;
use crate::kernel::passes::{BufferAddress, PassLayout};

/// Geometry and pass configuration of a render buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferParams {
    /// Image position of the buffer's first pixel.
    pub full_x: i32,
    pub full_y: i32,
    pub width: i32,
    pub height: i32,
    /// Guard pixels around the nominal tile used for inline denoising.
    pub overscan: i32,
    /// Frames stored back to back; frame 0 is the current one.
    pub frames: usize,
    /// How many of the remaining frames precede the current one.
    pub prev_frames: usize,
    pub denoising_data: bool,
}

impl BufferParams {
    pub fn new(rect: Rect, denoising_data: bool) -> Self {
        BufferParams {
            full_x: rect.x0,
            full_y: rect.y0,
            width: rect.width(),
            height: rect.height(),
            overscan: 0,
            frames: 1,
            prev_frames: 0,
            denoising_data,
        }
    }

    pub fn layout(&self) -> PassLayout {
        PassLayout::new(self.denoising_data)
    }

    /// Image rectangle covered by the buffer.
    pub fn rect(&self) -> Rect {
        Rect::from_xywh(self.full_x, self.full_y, self.width, self.height)
    }

    /// Floats between consecutive frames.
    pub fn frame_stride(&self) -> usize {
        self.width as usize * self.height as usize * self.layout().pass_stride
    }

    pub fn len(&self) -> usize {
        self.frame_stride() * self.frames.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addressing of image pixels inside this buffer.
    pub fn address(&self) -> BufferAddress {
        BufferAddress::new(-self.full_x - self.full_y * self.width, self.width, self.layout())
    }
}

/// Accumulation buffer shared by the tiles that render into it.
#[derive(Debug)]
pub struct RenderBuffers {
    params: BufferParams,
    data: RwLock<Vec<f32>>,
}

impl RenderBuffers {
    pub fn new(params: BufferParams) -> DeviceResult<Self> {
        let data = try_alloc_zeroed(params.len(), "render buffer")?;
        Ok(RenderBuffers { params, data: RwLock::new(data) })
    }

    pub fn params(&self) -> &BufferParams {
        &self.params
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        self.write().fill(0.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileKind {
    PathTrace,
    Denoise,
}

/// One unit of tile work handed to a worker.
#[derive(Debug, Clone)]
pub struct RenderTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub start_sample: u32,
    pub num_samples: u32,
    /// Samples accumulated so far.
    pub sample: u32,
    pub offset: i32,
    pub stride: i32,
    pub kind: TileKind,
    /// Producer-assigned identifier.
    pub index: usize,
    pub buffers: Arc<RenderBuffers>,
}

impl RenderTile {
    pub fn new(index: usize, rect: Rect, kind: TileKind, start_sample: u32, num_samples: u32, buffers: Arc<RenderBuffers>) -> Self {
        let address = buffers.params().address();
        RenderTile {
            x: rect.x0,
            y: rect.y0,
            w: rect.width(),
            h: rect.height(),
            start_sample,
            num_samples,
            sample: start_sample,
            offset: address.offset,
            stride: address.stride,
            kind,
            index,
            buffers,
        }
    }

    pub fn rect(&self) -> Rect {
        Rect::from_xywh(self.x, self.y, self.w, self.h)
    }

    pub fn end_sample(&self) -> u32 {
        self.start_sample + self.num_samples
    }

    pub fn address(&self) -> BufferAddress {
        BufferAddress::new(self.offset, self.stride, self.buffers.params().layout())
    }

    /// A copy of this tile moved to `rect`, still pointing at this buffer.
    pub fn with_rect(&self, rect: Rect) -> Self {
        RenderTile {
            x: rect.x0,
            y: rect.y0,
            w: rect.width(),
            h: rect.height(),
            ..self.clone()
        }
    }

    /// The 3×3 neighbourhood of a tile without neighbours: every border entry
    /// is an empty tile on the corresponding edge of this one.
    pub fn degenerate_neighbors(&self) -> [RenderTile; 9] {
        let xs = [(self.x, 0), (self.x, self.w), (self.x + self.w, 0)];
        let ys = [(self.y, 0), (self.y, self.h), (self.y + self.h, 0)];
        std::array::from_fn(|i| {
            let (x, w) = xs[i % 3];
            let (y, h) = ys[i / 3];
            self.with_rect(Rect::from_xywh(x, y, w, h))
        })
    }
}

/// Producer of tile work for render tasks. Must be safe to call from every
/// worker at once.
pub trait TileSource: Send + Sync {
    /// Claims the next tile, or `None` when no more work will come.
    fn acquire_tile(&self) -> Option<RenderTile>;

    /// Returns a finished (or abandoned) tile to the producer.
    fn release_tile(&self, tile: RenderTile);

    /// The 3×3 grid around `tile`, which sits at index 4. Entries on the
    /// frame border may be empty tiles sharing `tile`'s buffer.
    fn neighbor_tiles(&self, tile: &RenderTile) -> [RenderTile; 9];
}
