// src/device/denoise.rs

//! Denoising of one tile region from its 3×3 neighbourhood.

use std::sync::{Arc, RwLockReadGuard};

use log::trace;

use super::tile::{RenderBuffers, RenderTile};
use crate::error::{DeviceError, DeviceResult};
use crate::filter::{self, FilterOutput, Neighborhood, Rect, TileSlice};
use crate::kernel::globals::KernelIntegrator;
use crate::kernel::KernelFunctions;

/// Column and row boundaries of a neighbourhood, taken from the tiles on
/// the middle row and middle column.
fn grid_bounds(neighbors: &[RenderTile; 9]) -> ([i32; 4], [i32; 4]) {
    let tile_x = [neighbors[3].x, neighbors[4].x, neighbors[5].x, neighbors[5].x + neighbors[5].w];
    let tile_y = [neighbors[1].y, neighbors[4].y, neighbors[7].y, neighbors[7].y + neighbors[7].h];
    (tile_x, tile_y)
}

/// Denoises `area` of the centre tile (index 4) in place.
///
/// The sample data of every neighbour is read, the filter buffer is built for
/// `area` grown by the regression window, and the denoised color scaled by
/// `sample` replaces the RGB of the centre tile's combined pass.
pub fn denoise_region(
    kernels: &KernelFunctions,
    settings: &KernelIntegrator,
    neighbors: &[RenderTile; 9],
    area: Rect,
    sample: u32,
) -> DeviceResult<()> {
    let center = &neighbors[4];
    let params = *center.buffers.params();
    let layout = params.layout();
    let Some(denoising_offset) = layout.denoising_offset else {
        return Err(DeviceError::InvalidRegion(format!(
            "tile {} has no denoising data",
            center.index
        )));
    };
    if area.is_empty() {
        return Ok(());
    }

    let (tile_x, tile_y) = grid_bounds(neighbors);
    let bounds = Rect::new(tile_x[0], tile_y[0], tile_x[3], tile_y[3]);
    if !bounds.contains_rect(&area) {
        return Err(DeviceError::InvalidRegion(format!(
            "denoise area {:?} lies outside the neighbourhood {:?}",
            area, bounds
        )));
    }
    let rect = filter::filter_rect(area, settings.half_window, bounds);

    let filter_buffer = {
        // Lock every distinct buffer once, in address order.
        let mut unique: Vec<&Arc<RenderBuffers>> = Vec::with_capacity(9);
        for tile in neighbors {
            if tile.buffers.params().layout() != layout {
                return Err(DeviceError::InvalidRegion(format!(
                    "neighbour tile {} uses a different pass layout",
                    tile.index
                )));
            }
            if !unique.iter().any(|b| Arc::ptr_eq(b, &tile.buffers)) {
                unique.push(&tile.buffers);
            }
        }
        unique.sort_by_key(|b| Arc::as_ptr(b) as usize);
        let guards: Vec<(&Arc<RenderBuffers>, RwLockReadGuard<'_, Vec<f32>>)> =
            unique.into_iter().map(|b| (b, b.read())).collect();

        let tiles: [TileSlice<'_>; 9] = std::array::from_fn(|i| {
            let tile = &neighbors[i];
            let data = guards
                .iter()
                .find(|(b, _)| Arc::ptr_eq(b, &tile.buffers))
                .map_or(&[][..], |(_, guard)| guard.as_slice());
            TileSlice {
                data,
                offset: tile.offset,
                stride: tile.stride,
                frame_stride: tile.buffers.params().frame_stride(),
            }
        });
        let neighborhood = Neighborhood {
            tile_x,
            tile_y,
            tiles,
            pass_stride: layout.pass_stride,
            denoising_offset,
        };
        trace!("Denoising {:?} of tile {} from {:?}", area, center.index, rect);
        filter::fill_filter_buffer(kernels, sample, &neighborhood, rect, params.frames, params.prev_frames)?
    };

    let mut target = center.buffers.write();
    let mut out = FilterOutput {
        data: target.as_mut_slice(),
        offset: center.offset,
        stride: center.stride,
        pass_stride: layout.pass_stride,
    };
    filter::run_reconstruction(kernels, settings, &filter_buffer, area, sample, &mut out)?;
    Ok(())
}
