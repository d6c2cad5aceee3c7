// src/device/tests.rs

use super::*;
use crate::filter::Rect;
use crate::kernel::globals::{PathFeatures, PathSample};
use crate::kernel::shader::{ShaderEvalType, ShaderInput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use test_log::test;

struct Constant(f32);

impl Integrator for Constant {
    fn trace(&self, _kg: &mut ThreadKernelGlobals, _sample: u32, _x: i32, _y: i32) -> PathSample {
        PathSample {
            radiance: [self.0; 3],
            alpha: 1.0,
            features: Some(PathFeatures {
                normal: [0.0, 0.0, 1.0],
                albedo: [0.5; 3],
                depth: 1.0,
                shadow: 1.0,
            }),
        }
    }
}

/// Returns the input's first word as the value, plus the sample index in alpha.
struct Echo;

impl ShaderEvaluator for Echo {
    fn evaluate(
        &self,
        _kg: &mut ThreadKernelGlobals,
        input: &ShaderInput,
        _eval_type: ShaderEvalType,
        _filter: u32,
        sample: u32,
    ) -> [f32; 4] {
        let v = input[0] as f32;
        [v, v, v, sample as f32]
    }
}

fn config(threads: usize) -> Config {
    let mut config = Config::default();
    config.device.threads = Some(threads);
    config.device.thread_name_prefix = "device-test".to_string();
    config.denoise.half_window = 3;
    config
}

fn layout(separate_denoise: bool) -> TileLayout {
    TileLayout {
        width: 12,
        height: 8,
        tile_size: 4,
        num_samples: 4,
        overscan: 0,
        denoising_data: true,
        separate_denoise,
    }
}

#[test]
fn render_task_samples_every_tile() {
    let device = CpuDevice::new(&config(3));
    device.set_integrator(Arc::new(Constant(0.5)));
    let manager = Arc::new(TileManager::new(layout(false)).unwrap());
    let (tx, rx) = mpsc::channel();

    device.task_add(DeviceTask::render(manager.clone()).with_progress(tx)).unwrap();
    device.task_wait().unwrap();

    assert_eq!(manager.released_count(), manager.tile_count());
    let frame = manager.frame_buffers().unwrap();
    let data = frame.read();
    let address = frame.params().address();
    for (x, y) in Rect::from_xywh(0, 0, 12, 8).pixels() {
        let p = address.pixel_index(x, y);
        assert_eq!(&data[p..p + 4], &[2.0, 2.0, 2.0, 4.0]);
    }

    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    let done = events.iter().filter(|e| matches!(e, ProgressEvent::TileDone { .. })).count();
    assert_eq!(done, manager.tile_count());
    assert!(events.contains(&ProgressEvent::TileSample { tile: 0, sample: 4 }));
}

#[test]
fn separate_denoise_keeps_a_flat_frame() {
    let device = CpuDevice::new(&config(2));
    device.set_integrator(Arc::new(Constant(0.25)));
    let manager = Arc::new(TileManager::new(layout(true)).unwrap());

    device.task_add(DeviceTask::render(manager.clone())).unwrap();
    device.task_wait().unwrap();

    // One PATH_TRACE and one DENOISE release per tile.
    assert_eq!(manager.released_count(), 2 * manager.tile_count());
    let frame = manager.frame_buffers().unwrap();
    let data = frame.read();
    for px in data.chunks(4) {
        for c in &px[..3] {
            assert!((c - 1.0).abs() < 1e-4, "{:?}", px);
        }
        assert_eq!(px[3], 4.0);
    }
}

#[test]
fn render_without_integrator_is_rejected() {
    let device = CpuDevice::new(&config(1));
    let manager = Arc::new(TileManager::new(layout(false)).unwrap());
    let result = device.task_add(DeviceTask::render(manager.clone()));
    assert_eq!(result, Err(DeviceError::MissingKernel("integrator")));
    assert_eq!(manager.released_count(), 0);
}

#[test]
fn film_convert_scales_by_sample_count() {
    let device = CpuDevice::new(&config(2));
    let params = BufferParams::new(Rect::from_xywh(0, 0, 4, 3), false);
    let buffers = Arc::new(RenderBuffers::new(params).unwrap());
    {
        let mut data = buffers.write();
        for px in data.chunks_mut(4) {
            px.copy_from_slice(&[2.0, 4.0, 8.0, 4.0]);
        }
    }
    let output = Arc::new(Mutex::new(vec![[half::f16::ZERO; 4]; 12]));
    device
        .task_add(DeviceTask::film_convert(FilmConvertTask {
            x: 0,
            y: 0,
            w: 4,
            h: 3,
            sample: 3,
            buffers,
            output: FilmOutput::Half(output.clone()),
        }))
        .unwrap();
    device.task_wait().unwrap();

    for px in lock(&output).iter() {
        assert_eq!(px.map(f32::from), [0.5, 1.0, 2.0, 1.0]);
    }
}

#[test]
fn film_region_outside_the_buffer_is_rejected() {
    let device = CpuDevice::new(&config(1));
    let buffers = Arc::new(RenderBuffers::new(BufferParams::new(Rect::from_xywh(0, 0, 2, 2), false)).unwrap());
    let result = device.task_add(DeviceTask::film_convert(FilmConvertTask {
        x: 1,
        y: 0,
        w: 2,
        h: 2,
        sample: 0,
        buffers,
        output: FilmOutput::Byte(Arc::new(Mutex::new(vec![[0; 4]; 4]))),
    }));
    assert!(matches!(result, Err(DeviceError::InvalidRegion(_))));
}

#[test]
fn bake_shader_averages_samples() {
    let mut config = config(2);
    config.device.shader_chunk_size = 3;
    let device = CpuDevice::new(&config);
    device.set_shader_evaluator(Arc::new(Echo));

    let input: Vec<ShaderInput> = (0..10).map(|i| [i, 0, 0, 0]).collect();
    let output = Arc::new(Mutex::new(vec![[0.0; 4]; 10]));
    let (tx, rx) = mpsc::channel();
    device
        .task_add(
            DeviceTask::shader(ShaderTask {
                input: Arc::new(input),
                output: output.clone(),
                output_luma: None,
                eval_type: ShaderEvalType::Bake,
                filter: 0,
                shader_x: 0,
                shader_w: 10,
                num_samples: 3,
            })
            .with_progress(tx),
        )
        .unwrap();
    device.task_wait().unwrap();

    for (i, px) in lock(&output).iter().enumerate() {
        assert_eq!(px[0], i as f32);
        // Running mean of the sample indices 0, 1, 2.
        assert!((px[3] - 1.0).abs() < 1e-6);
    }
    // Four chunks, three samples each.
    assert_eq!(rx.try_iter().count(), 12);
}

#[test]
fn background_shader_accumulates_and_writes_luma() {
    let device = CpuDevice::new(&config(1));
    device.set_shader_evaluator(Arc::new(Echo));
    let output = Arc::new(Mutex::new(vec![[0.0; 4]; 2]));
    let luma = Arc::new(Mutex::new(vec![0.0; 2]));
    device
        .task_add(DeviceTask::shader(ShaderTask {
            input: Arc::new(vec![[2, 0, 0, 0], [4, 0, 0, 0]]),
            output: output.clone(),
            output_luma: Some(luma.clone()),
            eval_type: ShaderEvalType::Background,
            filter: 0,
            shader_x: 0,
            shader_w: 2,
            num_samples: 2,
        }))
        .unwrap();
    device.task_wait().unwrap();

    assert_eq!(lock(&output)[1][0], 8.0);
    assert!((lock(&luma)[1] - 8.0).abs() < 1e-5);
}

/// Hands out DENOISE tiles for a buffer without denoising passes.
struct BrokenTiles {
    remaining: AtomicUsize,
    released: AtomicUsize,
}

impl TileSource for BrokenTiles {
    fn acquire_tile(&self) -> Option<RenderTile> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        let rect = Rect::from_xywh(0, 0, 4, 4);
        let buffers = Arc::new(RenderBuffers::new(BufferParams::new(rect, false)).ok()?);
        Some(RenderTile::new(0, rect, TileKind::Denoise, 0, 1, buffers))
    }

    fn release_tile(&self, _tile: RenderTile) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn neighbor_tiles(&self, tile: &RenderTile) -> [RenderTile; 9] {
        tile.degenerate_neighbors()
    }
}

#[test]
fn worker_errors_surface_in_task_wait() {
    let device = CpuDevice::new(&config(2));
    device.set_integrator(Arc::new(Constant(1.0)));
    let tiles = Arc::new(BrokenTiles {
        remaining: AtomicUsize::new(3),
        released: AtomicUsize::new(0),
    });
    device.task_add(DeviceTask::render(tiles.clone())).unwrap();
    assert!(matches!(device.task_wait(), Err(DeviceError::InvalidRegion(_))));
    // Every tile that was handed out came back.
    assert_eq!(tiles.released.load(Ordering::SeqCst), 3 - tiles.remaining.load(Ordering::SeqCst));

    // The device is usable again.
    let manager = Arc::new(TileManager::new(layout(false)).unwrap());
    device.task_add(DeviceTask::render(manager.clone())).unwrap();
    device.task_wait().unwrap();
    assert_eq!(manager.released_count(), manager.tile_count());
}

#[test]
fn textures_are_registered_and_accounted() {
    let device = CpuDevice::new(&config(1));
    let mut mem = DeviceMemory::from_host("ramp", 2, 1, 1, vec![0.0, 1.0]);
    let slot = device.tex_alloc("ramp", &mut mem, InterpolationType::Closest, ExtensionType::Extend);
    assert_eq!(device.stats().mem_used(), 8);
    {
        let globals = device.shared.globals_snapshot();
        let texture = globals.textures.get(slot).unwrap();
        assert_eq!(texture.lookup(0.9, 0.5)[0], 1.0);
    }
    device.tex_free(&mut mem);
    assert_eq!(device.stats().mem_used(), 0);
    assert_eq!(device.stats().mem_peak(), 8);
    assert!(device.shared.globals_snapshot().textures.is_empty());
}

#[test]
fn memory_contract_tracks_allocations() {
    let device = CpuDevice::new(&config(1));
    let mut mem = DeviceMemory::new("buffer", 4, 4, 1, 4);
    device.mem_alloc(&mut mem);
    device.mem_alloc(&mut mem);
    assert_eq!(device.stats().mem_used(), 256);
    mem.host[5] = 3.0;
    device.mem_copy_to(&mem);
    device.mem_zero(&mut mem);
    assert_eq!(mem.host[5], 0.0);
    device.mem_free(&mut mem);
    assert_eq!(device.stats().mem_used(), 0);
}

#[test]
fn const_copy_updates_kernel_data() {
    let device = CpuDevice::new(&config(1));
    let mut data = device.kernel_data();
    assert_eq!(data.integrator.half_window, 3);
    data.film.exposure = 2.0;
    device.const_copy_to(data);
    assert_eq!(device.kernel_data().film.exposure, 2.0);
    assert_eq!(device.info().id, "CPU");
}
