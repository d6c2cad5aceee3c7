// src/device/tile_manager.rs

//! Reference tile producer: a frame split into a grid of tiles.
//!
//! Every tile owns its own [`RenderBuffers`], covering the tile grown by the
//! overscan border. Workers first receive PATH_TRACE tiles in row-major
//! order. With separate denoising enabled, a tile becomes a DENOISE tile once
//! it and every existing neighbour have been released from PATH_TRACE.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};

use super::tile::{BufferParams, RenderBuffers, RenderTile, TileKind, TileSource};
use crate::config::DemoConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::filter::Rect;
use crate::kernel::passes::COMBINED;

/// How a frame is split into tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    pub width: i32,
    pub height: i32,
    pub tile_size: i32,
    pub num_samples: u32,
    pub overscan: i32,
    pub denoising_data: bool,
    pub separate_denoise: bool,
}

impl From<&DemoConfig> for TileLayout {
    fn from(config: &DemoConfig) -> Self {
        TileLayout {
            width: config.width,
            height: config.height,
            tile_size: config.tile_size,
            num_samples: config.samples,
            overscan: config.overscan,
            denoising_data: true,
            separate_denoise: config.separate_denoise,
        }
    }
}

struct GridTile {
    rect: Rect,
    buffers: Arc<RenderBuffers>,
}

#[derive(Default)]
struct ProducerState {
    next_render: usize,
    render_in_flight: usize,
    render_done: Vec<bool>,
    denoise_scheduled: Vec<bool>,
    denoise_queue: VecDeque<usize>,
    released: usize,
}

/// Grid producer implementing [`TileSource`].
pub struct TileManager {
    layout: TileLayout,
    tiles_x: i32,
    tiles_y: i32,
    tiles: Vec<GridTile>,
    state: Mutex<ProducerState>,
    ready: Condvar,
}

impl TileManager {
    pub fn new(mut layout: TileLayout) -> DeviceResult<Self> {
        if layout.width <= 0 || layout.height <= 0 || layout.tile_size <= 0 || layout.overscan < 0 {
            return Err(DeviceError::InvalidRegion(format!(
                "cannot tile a {}x{} frame with tile size {} and overscan {}",
                layout.width, layout.height, layout.tile_size, layout.overscan
            )));
        }
        if layout.separate_denoise && !layout.denoising_data {
            warn!("Separate denoising needs denoising data; disabling it");
            layout.separate_denoise = false;
        }
        if layout.separate_denoise && layout.overscan > 0 {
            warn!("Overscan tiles are denoised inline; disabling separate denoising");
            layout.separate_denoise = false;
        }

        let tiles_x = (layout.width + layout.tile_size - 1) / layout.tile_size;
        let tiles_y = (layout.height + layout.tile_size - 1) / layout.tile_size;
        let frame = Rect::from_xywh(0, 0, layout.width, layout.height);
        let mut tiles = Vec::with_capacity((tiles_x * tiles_y) as usize);
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let rect = Rect::from_xywh(tx * layout.tile_size, ty * layout.tile_size, layout.tile_size, layout.tile_size)
                    .intersect(&frame);
                let mut params = BufferParams::new(rect.grow(layout.overscan, layout.overscan), layout.denoising_data);
                params.overscan = layout.overscan;
                tiles.push(GridTile {
                    rect,
                    buffers: Arc::new(RenderBuffers::new(params)?),
                });
            }
        }
        debug!(
            "Tile manager: {}x{} frame in {}x{} tiles of {} px (overscan {}, separate denoise {})",
            layout.width, layout.height, tiles_x, tiles_y, layout.tile_size, layout.overscan, layout.separate_denoise
        );

        let count = tiles.len();
        Ok(TileManager {
            layout,
            tiles_x,
            tiles_y,
            tiles,
            state: Mutex::new(ProducerState {
                render_done: vec![false; count],
                denoise_scheduled: vec![false; count],
                ..ProducerState::default()
            }),
            ready: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProducerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Number of release calls seen so far.
    pub fn released_count(&self) -> usize {
        self.lock().released
    }

    /// Nominal rect of tile `index`.
    pub fn tile_rect(&self, index: usize) -> Option<Rect> {
        self.tiles.get(index).map(|t| t.rect)
    }

    /// Buffers of tile `index`.
    pub fn tile_buffers(&self, index: usize) -> Option<&Arc<RenderBuffers>> {
        self.tiles.get(index).map(|t| &t.buffers)
    }

    fn grid_index(&self, tx: i32, ty: i32) -> Option<usize> {
        ((0..self.tiles_x).contains(&tx) && (0..self.tiles_y).contains(&ty)).then(|| (ty * self.tiles_x + tx) as usize)
    }

    fn render_tile(&self, index: usize) -> RenderTile {
        let tile = &self.tiles[index];
        let rect = tile.buffers.params().rect();
        RenderTile::new(index, rect, TileKind::PathTrace, 0, self.layout.num_samples, Arc::clone(&tile.buffers))
    }

    fn denoise_tile(&self, index: usize) -> RenderTile {
        let tile = &self.tiles[index];
        RenderTile::new(index, tile.rect, TileKind::Denoise, 0, self.layout.num_samples, Arc::clone(&tile.buffers))
    }

    /// Queues every tile around `index` whose whole neighbourhood is rendered.
    fn schedule_denoise(&self, state: &mut ProducerState, index: usize) {
        let (tx, ty) = ((index as i32) % self.tiles_x, (index as i32) / self.tiles_x);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let Some(candidate) = self.grid_index(tx + dx, ty + dy) else { continue };
                if state.denoise_scheduled[candidate] {
                    continue;
                }
                let (cx, cy) = (tx + dx, ty + dy);
                let ready = (-1..=1).all(|ny| {
                    (-1..=1).all(|nx| self.grid_index(cx + nx, cy + ny).map_or(true, |n| state.render_done[n]))
                });
                if ready {
                    trace!("Tile {} ready for denoising", candidate);
                    state.denoise_scheduled[candidate] = true;
                    state.denoise_queue.push_back(candidate);
                }
            }
        }
    }

    /// Copies the combined pass of every tile's nominal rect into one
    /// frame-sized buffer without denoising data.
    pub fn frame_buffers(&self) -> DeviceResult<Arc<RenderBuffers>> {
        let frame = Rect::from_xywh(0, 0, self.layout.width, self.layout.height);
        let params = BufferParams::new(frame, false);
        let out = RenderBuffers::new(params)?;
        {
            let mut dst = out.write();
            let dst_address = params.address();
            for tile in &self.tiles {
                let src = tile.buffers.read();
                let src_address = tile.buffers.params().address();
                for (x, y) in tile.rect.pixels() {
                    let s = src_address.pixel_index(x, y) + COMBINED;
                    let d = dst_address.pixel_index(x, y) + COMBINED;
                    dst[d..d + 4].copy_from_slice(&src[s..s + 4]);
                }
            }
        }
        Ok(Arc::new(out))
    }
}

impl TileSource for TileManager {
    fn acquire_tile(&self) -> Option<RenderTile> {
        let mut state = self.lock();
        loop {
            if let Some(index) = state.denoise_queue.pop_front() {
                return Some(self.denoise_tile(index));
            }
            if state.next_render < self.tiles.len() {
                let index = state.next_render;
                state.next_render += 1;
                state.render_in_flight += 1;
                return Some(self.render_tile(index));
            }
            // Only a PATH_TRACE release can unlock more denoise work.
            if !self.layout.separate_denoise || state.render_in_flight == 0 {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release_tile(&self, tile: RenderTile) {
        let mut state = self.lock();
        state.released += 1;
        if tile.kind == TileKind::PathTrace {
            state.render_in_flight = state.render_in_flight.saturating_sub(1);
            if let Some(done) = state.render_done.get_mut(tile.index) {
                *done = true;
            }
            if self.layout.separate_denoise && tile.index < self.tiles.len() {
                self.schedule_denoise(&mut state, tile.index);
            }
        }
        trace!("Released {:?} tile {} at sample {}", tile.kind, tile.index, tile.sample);
        self.ready.notify_all();
    }

    fn neighbor_tiles(&self, tile: &RenderTile) -> [RenderTile; 9] {
        let Some(center) = self.tiles.get(tile.index) else {
            return tile.degenerate_neighbors();
        };
        let (tx, ty) = ((tile.index as i32) % self.tiles_x, (tile.index as i32) / self.tiles_x);
        let rect = center.rect;

        // Missing columns and rows collapse onto the centre tile's edges.
        let column = |dx: i32| match self.grid_index(tx + dx, ty) {
            Some(n) if dx != 0 => (self.tiles[n].rect.x0, self.tiles[n].rect.width()),
            _ if dx < 0 => (rect.x0, 0),
            _ if dx > 0 => (rect.x1, 0),
            _ => (rect.x0, rect.width()),
        };
        let row = |dy: i32| match self.grid_index(tx, ty + dy) {
            Some(n) if dy != 0 => (self.tiles[n].rect.y0, self.tiles[n].rect.height()),
            _ if dy < 0 => (rect.y0, 0),
            _ if dy > 0 => (rect.y1, 0),
            _ => (rect.y0, rect.height()),
        };

        std::array::from_fn(|i| {
            let (dx, dy) = ((i % 3) as i32 - 1, (i / 3) as i32 - 1);
            let (x, w) = column(dx);
            let (y, h) = row(dy);
            let index = self.grid_index(tx + dx, ty + dy).unwrap_or(tile.index);
            let mut neighbor = self.denoise_tile(index);
            neighbor.x = x;
            neighbor.y = y;
            neighbor.w = w;
            neighbor.h = h;
            neighbor
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(width: i32, height: i32, tile_size: i32) -> TileLayout {
        TileLayout {
            width,
            height,
            tile_size,
            num_samples: 2,
            overscan: 0,
            denoising_data: true,
            separate_denoise: true,
        }
    }

    #[test]
    fn edge_tiles_are_clipped_to_the_frame() {
        let manager = TileManager::new(layout(10, 6, 4)).unwrap();
        assert_eq!(manager.tile_count(), 6);
        assert_eq!(manager.tile_rect(2), Some(Rect::new(8, 0, 10, 4)));
        assert_eq!(manager.tile_rect(5), Some(Rect::new(8, 4, 10, 6)));
    }

    #[test]
    fn denoise_waits_for_the_whole_neighbourhood() {
        let manager = TileManager::new(layout(8, 4, 4)).unwrap();
        let first = manager.acquire_tile().unwrap();
        let second = manager.acquire_tile().unwrap();
        assert_eq!((first.kind, second.kind), (TileKind::PathTrace, TileKind::PathTrace));

        manager.release_tile(first);
        // Tile 0 still has a rendering neighbour.
        assert!(manager.lock().denoise_queue.is_empty());
        manager.release_tile(second);

        let mut denoised: Vec<usize> = (0..2)
            .map(|_| {
                let t = manager.acquire_tile().unwrap();
                assert_eq!(t.kind, TileKind::Denoise);
                t.index
            })
            .collect();
        denoised.sort_unstable();
        assert_eq!(denoised, vec![0, 1]);
        assert!(manager.acquire_tile().is_none());
    }

    #[test]
    fn neighbours_on_the_border_collapse_onto_the_tile() {
        let manager = TileManager::new(layout(8, 4, 4)).unwrap();
        let tile = manager.denoise_tile(0);
        let n = manager.neighbor_tiles(&tile);
        assert_eq!((n[3].x, n[3].w), (0, 0));
        assert_eq!((n[5].x, n[5].w), (4, 4));
        assert!(Arc::ptr_eq(&n[5].buffers, manager.tile_buffers(1).unwrap()));
        assert_eq!((n[1].y, n[1].h), (0, 0));
        assert_eq!((n[7].y, n[7].h), (4, 0));
        assert!(Arc::ptr_eq(&n[7].buffers, &tile.buffers));
    }

    #[test]
    fn overscan_disables_separate_denoise() {
        let mut l = layout(8, 8, 4);
        l.overscan = 2;
        let manager = TileManager::new(l).unwrap();
        assert!(!manager.layout().separate_denoise);
        let tile = manager.acquire_tile().unwrap();
        assert_eq!(tile.rect(), Rect::new(-2, -2, 6, 6));
        assert_eq!(tile.buffers.params().overscan, 2);
    }

    #[test]
    fn frame_buffers_gather_nominal_regions() {
        let manager = TileManager::new(layout(8, 4, 4)).unwrap();
        {
            let buffers = manager.tile_buffers(1).unwrap();
            let address = buffers.params().address();
            buffers.write()[address.pixel_index(5, 2)] = 3.0;
        }
        let frame = manager.frame_buffers().unwrap();
        let address = frame.params().address();
        assert_eq!(frame.read()[address.pixel_index(5, 2)], 3.0);
        assert_eq!(frame.params().layout().pass_stride, 4);
    }
}
