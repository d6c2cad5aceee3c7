// src/main.rs

//! Demo: renders a procedural noisy scene through path trace, denoise and
//! film conversion, and reports how much the denoiser reduced the error.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::{info, warn};

use render_device::config::{Config, CONFIG};
use render_device::device::{
    device_cpu_capabilities, CpuDevice, DeviceMemory, DeviceTask, FilmConvertTask, FilmOutput, RenderBuffers,
    TileLayout, TileManager,
};
use render_device::kernel::globals::{
    Integrator, Intersection, PathFeatures, PathSample, ThreadKernelGlobals, VolumeStep,
};
use render_device::kernel::texture::{ExtensionType, InterpolationType};

const CHECKER_SIZE: usize = 8;
const MAX_SHADOW_HITS: usize = 4;
const FOG_SIGMA_T: f32 = 0.05;
const FOG_STEPS: usize = 4;

/// Integer hash of a sample coordinate, mapped to [0, 1).
fn hash01(sample: u32, x: i32, y: i32, salt: u32) -> f32 {
    let mut h = sample
        .wrapping_mul(0x9E37_79B9)
        ^ (x as u32).wrapping_mul(0x85EB_CA6B)
        ^ (y as u32).wrapping_mul(0xC2B2_AE35)
        ^ salt.wrapping_mul(0x27D4_EB2F);
    h ^= h >> 16;
    h = h.wrapping_mul(0x7FEB_352D);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846C_A68B);
    h ^= h >> 16;
    (h >> 8) as f32 / (1u32 << 24) as f32
}

/// Lambertian-looking checkerboard lit by a soft light with noisy visibility.
struct CheckerScene {
    width: i32,
    height: i32,
    texture: usize,
}

impl CheckerScene {
    fn albedo(&self, kg: &ThreadKernelGlobals, x: i32, y: i32) -> [f32; 3] {
        let u = (x as f32 + 0.5) / self.width as f32;
        let v = (y as f32 + 0.5) / self.height as f32;
        let texel = kg.textures().get(self.texture).map_or([0.5; 4], |t| t.lookup(u, v));
        [texel[0], texel[1], texel[2]]
    }

    fn expected(&self, kg: &ThreadKernelGlobals, x: i32, y: i32) -> [f32; 3] {
        let fog = (-FOG_SIGMA_T * FOG_STEPS as f32).exp();
        self.albedo(kg, x, y).map(|a| a * 0.8 * fog)
    }
}

/// Marches the camera ray through a thin homogeneous haze in front of the
/// checkerboard and returns the transmittance at the surface.
fn march_fog(kg: &mut ThreadKernelGlobals) -> f32 {
    let steps = kg.next_decoupled_volume_steps();
    let mut transmittance = 1.0f32;
    for i in 0..FOG_STEPS {
        transmittance *= (-FOG_SIGMA_T).exp();
        steps.push(VolumeStep {
            sigma_s: [0.0; 3],
            sigma_t: [FOG_SIGMA_T; 3],
            transmittance: [transmittance; 3],
            t: (i + 1) as f32,
            shade_t: i as f32 + 0.5,
        });
    }
    steps.last().map_or(1.0, |s| s.transmittance[0])
}

impl Integrator for CheckerScene {
    fn trace(&self, kg: &mut ThreadKernelGlobals, sample: u32, x: i32, y: i32) -> PathSample {
        let albedo = self.albedo(kg, x, y);
        let fog = march_fog(kg);
        // An opaque blocker sits on 20% of the shadow rays, so the light is
        // visible 80% of the time and the mean radiance is 0.8 * albedo * fog.
        let hits = kg.transparent_shadow_intersections(MAX_SHADOW_HITS);
        if hash01(sample, x, y, 1) >= 0.8 {
            hits.push(Intersection {
                t: 0.5,
                object: 1,
                ..Default::default()
            });
        }
        let shadow = if hits.is_empty() { 1.0 } else { 0.0 };
        let jitter = 0.75 + 0.5 * hash01(sample, x, y, 2);
        PathSample {
            radiance: albedo.map(|a| a * shadow * fog * jitter),
            alpha: 1.0,
            features: Some(PathFeatures {
                normal: [0.0, 0.0, 1.0],
                albedo,
                depth: 1.0,
                shadow,
            }),
        }
    }
}

fn checker_texture() -> DeviceMemory {
    let mut host = Vec::with_capacity(CHECKER_SIZE * CHECKER_SIZE * 3);
    for y in 0..CHECKER_SIZE {
        for x in 0..CHECKER_SIZE {
            let c = if (x + y) % 2 == 0 { [0.9, 0.6, 0.2] } else { [0.1, 0.3, 0.7] };
            host.extend_from_slice(&c);
        }
    }
    DeviceMemory::from_host("checker", CHECKER_SIZE, CHECKER_SIZE, 3, host)
}

/// Root-mean-square error of the per-sample average against the scene.
fn rmse(frame: &RenderBuffers, scene: &CheckerScene, kg: &ThreadKernelGlobals, samples: u32) -> f64 {
    let data = frame.read();
    let address = frame.params().address();
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for y in 0..scene.height {
        for x in 0..scene.width {
            let p = address.pixel_index(x, y);
            let expected = scene.expected(kg, x, y);
            for c in 0..3 {
                let d = (data[p + c] / samples as f32 - expected[c]) as f64;
                sum += d * d;
                count += 1;
            }
        }
    }
    (sum / count.max(1) as f64).sqrt()
}

fn render(device: &CpuDevice, layout: TileLayout) -> anyhow::Result<Arc<RenderBuffers>> {
    let tiles = Arc::new(TileManager::new(layout).context("Failed to create tile manager")?);
    device
        .task_add(DeviceTask::render(tiles.clone()))
        .context("Failed to queue render task")?;
    device.task_wait().context("Render task failed")?;
    info!("Rendered {} tile passes", tiles.released_count());
    tiles.frame_buffers().context("Failed to assemble frame buffers")
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let config: Config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("Failed to load configuration '{}'", path))?,
        None => (*CONFIG).clone(),
    };
    let demo = config.demo.clone();

    let device = CpuDevice::new(&config);
    info!("Device: {} ({})", device.info().description, device.info().id);
    info!("Capabilities: '{}'", device_cpu_capabilities());

    let mut texture = checker_texture();
    let slot = device.tex_alloc("checker", &mut texture, InterpolationType::Closest, ExtensionType::Repeat);
    let scene = Arc::new(CheckerScene {
        width: demo.width,
        height: demo.height,
        texture: slot,
    });
    device.set_integrator(scene.clone());

    let noisy_layout = TileLayout {
        overscan: 0,
        separate_denoise: false,
        ..TileLayout::from(&demo)
    };
    let denoised_layout = TileLayout::from(&demo);
    if denoised_layout.overscan == 0 && !denoised_layout.separate_denoise {
        warn!("Neither overscan nor separate denoising is enabled; the output will stay noisy");
    }

    let noisy = render(&device, noisy_layout)?;
    let denoised = render(&device, denoised_layout)?;

    let kg = ThreadKernelGlobals::new(device.kernel_globals());
    let before = rmse(&noisy, &scene, &kg, demo.samples);
    let after = rmse(&denoised, &scene, &kg, demo.samples);
    info!("RMSE before denoising: {:.5}, after: {:.5}", before, after);

    let pixels = (demo.width * demo.height) as usize;
    let output = Arc::new(Mutex::new(vec![[0u8; 4]; pixels]));
    device
        .task_add(DeviceTask::film_convert(FilmConvertTask {
            x: 0,
            y: 0,
            w: demo.width,
            h: demo.height,
            sample: demo.samples.saturating_sub(1),
            buffers: denoised,
            output: FilmOutput::Byte(output.clone()),
        }))
        .context("Failed to queue film conversion")?;
    device.task_wait().context("Film conversion failed")?;

    let bytes = output.lock().map_err(|_| anyhow::anyhow!("film output lock poisoned"))?;
    let mean = bytes.iter().map(|p| p[..3].iter().map(|&c| c as f64).sum::<f64>() / 3.0).sum::<f64>() / pixels.max(1) as f64;
    info!("Converted {} pixels, mean display value {:.1}", bytes.len(), mean);

    device.tex_free(&mut texture);
    info!(
        "Device memory: {} bytes in use, peak {} bytes",
        device.stats().mem_used(),
        device.stats().mem_peak()
    );
    Ok(())
}
