//! End-to-end behaviour of the device: tile acquisition, cancellation and the
//! two denoising paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use render_device::config::Config;
use render_device::device::{
    denoise_region, BufferParams, CpuDevice, DeviceTask, RenderBuffers, RenderTile, TileKind, TileLayout,
    TileManager, TileSource,
};
use render_device::filter::Rect;
use render_device::kernel::globals::{
    Integrator, Intersection, KernelGlobals, KernelIntegrator, PathFeatures, PathSample, ThreadKernelGlobals,
    VolumeStep,
};
use render_device::kernel::KernelFunctions;
use render_device::task_pool::CancelToken;
use test_log::test;

fn config(threads: usize) -> Config {
    let mut config = Config::default();
    config.device.threads = Some(threads);
    config.denoise.half_window = 3;
    config
}

fn layout(width: i32, height: i32, tile_size: i32) -> TileLayout {
    TileLayout {
        width,
        height,
        tile_size,
        num_samples: 4,
        overscan: 0,
        denoising_data: true,
        separate_denoise: false,
    }
}

struct Flat(f32);

impl Integrator for Flat {
    fn trace(&self, _kg: &mut ThreadKernelGlobals, _sample: u32, _x: i32, _y: i32) -> PathSample {
        PathSample {
            radiance: [self.0; 3],
            alpha: 1.0,
            features: Some(PathFeatures {
                normal: [0.0, 1.0, 0.0],
                albedo: [0.3, 0.6, 0.9],
                depth: 3.0,
                shadow: 1.0,
            }),
        }
    }
}

/// Cancels `token` as soon as the first sample is traced.
struct CancelOnFirstSample {
    token: CancelToken,
}

impl Integrator for CancelOnFirstSample {
    fn trace(&self, kg: &mut ThreadKernelGlobals, sample: u32, x: i32, y: i32) -> PathSample {
        self.token.cancel();
        Flat(1.0).trace(kg, sample, x, y)
    }
}

/// Fills both scratch arrays on every sample and counts the calls that found
/// leftovers from an earlier sample.
#[derive(Default)]
struct ScratchUser {
    traced: AtomicUsize,
    dirty: AtomicUsize,
}

impl Integrator for ScratchUser {
    fn trace(&self, kg: &mut ThreadKernelGlobals, sample: u32, x: i32, y: i32) -> PathSample {
        self.traced.fetch_add(1, Ordering::SeqCst);
        let hits = kg.transparent_shadow_intersections(8);
        if !hits.is_empty() {
            self.dirty.fetch_add(1, Ordering::SeqCst);
        }
        hits.extend((0..3).map(|i| Intersection { t: i as f32, ..Default::default() }));
        let steps = kg.next_decoupled_volume_steps();
        if !steps.is_empty() {
            self.dirty.fetch_add(1, Ordering::SeqCst);
        }
        steps.push(VolumeStep::default());
        assert!(kg.scratch_bytes() >= 3 * std::mem::size_of::<Intersection>());
        Flat(0.5).trace(kg, sample, x, y)
    }
}

/// Counts what passes through a tile source.
struct Counting {
    inner: TileManager,
    acquired: AtomicUsize,
    sampled: Mutex<Vec<u32>>,
}

impl TileSource for Counting {
    fn acquire_tile(&self) -> Option<RenderTile> {
        let tile = self.inner.acquire_tile()?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Some(tile)
    }

    fn release_tile(&self, tile: RenderTile) {
        self.sampled.lock().unwrap().push(tile.sample);
        self.inner.release_tile(tile);
    }

    fn neighbor_tiles(&self, tile: &RenderTile) -> [RenderTile; 9] {
        self.inner.neighbor_tiles(tile)
    }
}

#[test]
fn every_tile_is_acquired_exactly_once() {
    let manager = Arc::new(TileManager::new(layout(40, 24, 4)).unwrap());
    let n = manager.tile_count();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(tile) = manager.acquire_tile() {
                    claimed.push(tile.index);
                    manager.release_tile(tile);
                }
                claimed
            })
        })
        .collect();
    let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..n).collect::<Vec<_>>());
    assert!(manager.acquire_tile().is_none());
}

#[test]
fn canceled_render_releases_every_acquired_tile() {
    let device = CpuDevice::new(&config(2));
    let token = CancelToken::new();
    device.set_integrator(Arc::new(CancelOnFirstSample { token: token.clone() }));
    let tiles = Arc::new(Counting {
        inner: TileManager::new(layout(32, 32, 4)).unwrap(),
        acquired: AtomicUsize::new(0),
        sampled: Mutex::new(Vec::new()),
    });

    device.task_add(DeviceTask::render(tiles.clone()).with_cancel(token)).unwrap();
    // Cancellation is not an error: the task just stops early.
    assert_eq!(device.task_wait(), Ok(()));

    let acquired = tiles.acquired.load(Ordering::SeqCst);
    let sampled = tiles.sampled.lock().unwrap();
    assert_eq!(sampled.len(), acquired);
    assert!(acquired < tiles.inner.tile_count());
    // Sampling stops at the first sample boundary after the cancel.
    assert!(sampled.iter().all(|&s| s <= 1));
}

#[test]
fn finish_queue_drains_all_tiles_without_sampling() {
    let device = CpuDevice::new(&config(2));
    let token = CancelToken::new();
    device.set_integrator(Arc::new(CancelOnFirstSample { token: token.clone() }));
    let tiles = Arc::new(Counting {
        inner: TileManager::new(layout(32, 32, 4)).unwrap(),
        acquired: AtomicUsize::new(0),
        sampled: Mutex::new(Vec::new()),
    });

    device
        .task_add(DeviceTask::render(tiles.clone()).with_cancel(token).with_finish_queue(true))
        .unwrap();
    device.task_wait().unwrap();

    assert_eq!(tiles.acquired.load(Ordering::SeqCst), tiles.inner.tile_count());
    assert_eq!(tiles.inner.released_count(), tiles.inner.tile_count());
    let sampled = tiles.sampled.lock().unwrap();
    assert!(sampled.iter().filter(|&&s| s == 0).count() >= tiles.inner.tile_count() - 2);
}

#[test]
fn integrator_scratch_is_cleared_between_samples() {
    let device = CpuDevice::new(&config(3));
    let integrator = Arc::new(ScratchUser::default());
    device.set_integrator(integrator.clone());
    let manager = Arc::new(TileManager::new(layout(16, 8, 4)).unwrap());
    device.task_add(DeviceTask::render(manager.clone())).unwrap();
    assert_eq!(device.task_wait(), Ok(()));

    assert_eq!(integrator.traced.load(Ordering::SeqCst), 16 * 8 * 4);
    assert_eq!(integrator.dirty.load(Ordering::SeqCst), 0);
    let frame = manager.frame_buffers().unwrap();
    for px in frame.read().chunks(4) {
        assert_eq!(px[0], 2.0);
    }
}

#[test]
fn overscan_render_reproduces_a_flat_frame() {
    let device = CpuDevice::new(&config(3));
    device.set_integrator(Arc::new(Flat(0.25)));
    let mut l = layout(16, 12, 8);
    l.overscan = 4;
    let manager = Arc::new(TileManager::new(l).unwrap());
    device.task_add(DeviceTask::render(manager.clone())).unwrap();
    device.task_wait().unwrap();

    let frame = manager.frame_buffers().unwrap();
    for px in frame.read().chunks(4) {
        for c in &px[..3] {
            assert!((c - 1.0).abs() < 1e-4, "{:?}", px);
        }
        assert_eq!(px[3], 4.0);
    }
}

/// A noisy render buffer covering `rect`.
fn noisy_buffers(rect: Rect) -> Arc<RenderBuffers> {
    struct Noise;
    impl Integrator for Noise {
        fn trace(&self, _kg: &mut ThreadKernelGlobals, sample: u32, x: i32, y: i32) -> PathSample {
            let h = (sample.wrapping_mul(7919) ^ (x as u32).wrapping_mul(104_729) ^ (y as u32).wrapping_mul(1_299_709))
                .wrapping_mul(2_654_435_761);
            let u = (h >> 8) as f32 / (1u32 << 24) as f32;
            let albedo = if x < 8 { [0.7, 0.7, 0.2] } else { [0.2, 0.4, 0.8] };
            let shadow = if u < 0.75 { 1.0 } else { 0.0 };
            PathSample {
                radiance: albedo.map(|a| a * shadow * (0.5 + u)),
                alpha: 1.0,
                features: Some(PathFeatures {
                    normal: [0.0, 0.0, 1.0],
                    albedo,
                    depth: 2.0,
                    shadow,
                }),
            }
        }
    }

    let buffers = Arc::new(RenderBuffers::new(BufferParams::new(rect, true)).unwrap());
    let kernels = KernelFunctions::select();
    let address = buffers.params().address();
    let mut kg = ThreadKernelGlobals::new(KernelGlobals::default());
    let mut data = buffers.write();
    for sample in 0..8 {
        for (x, y) in rect.pixels() {
            (kernels.path_trace)(&mut kg, &Noise, data.as_mut_slice(), &address, sample, x, y);
        }
    }
    drop(data);
    buffers
}

#[test]
fn inline_and_neighbourhood_denoise_agree() {
    let rect = Rect::new(0, 0, 16, 16);
    let area = Rect::new(4, 4, 12, 12);
    let settings = KernelIntegrator {
        half_window: 3,
        second_order_screen: false,
    };
    let kernels = KernelFunctions::select();

    // Inline path: one tile with a 4 pixel overscan border.
    let inline = RenderTile::new(0, rect, TileKind::PathTrace, 0, 8, noisy_buffers(rect));
    denoise_region(kernels, &settings, &inline.degenerate_neighbors(), area, 8).unwrap();

    // Neighbourhood path: the same pixels split into a 3×3 grid on one buffer.
    let center = RenderTile::new(4, area, TileKind::Denoise, 0, 8, noisy_buffers(rect));
    let xs = [(0, 4), (4, 8), (12, 4)];
    let neighbors: [RenderTile; 9] = std::array::from_fn(|i| {
        let (x, w) = xs[i % 3];
        let (y, h) = xs[i / 3];
        center.with_rect(Rect::from_xywh(x, y, w, h))
    });
    denoise_region(kernels, &settings, &neighbors, area, 8).unwrap();

    let a = inline.buffers.read();
    let b = center.buffers.read();
    assert_eq!(*a, *b);

    // Only the area was rewritten.
    let untouched = noisy_buffers(rect);
    let original = untouched.read();
    let address = center.address();
    let outside = address.pixel_index(2, 2);
    assert_eq!(b[outside..outside + 4], original[outside..outside + 4]);
    let inside = address.pixel_index(6, 6);
    assert_ne!(b[inside..inside + 3], original[inside..inside + 3]);
}
