//! Cross-checks every kernel table this CPU can run against the scalar one.
//!
//! The tables share their generic bodies, so on identical input they must
//! agree: bit for bit for accumulation and film conversion, and within a
//! small tolerance for the denoiser.

use render_device::cpu::IsaLevel;
use render_device::filter::{self, FilterOutput, Neighborhood, Rect, TileSlice};
use render_device::kernel::globals::{
    Integrator, KernelFilm, KernelGlobals, KernelIntegrator, PathFeatures, PathSample, ThreadKernelGlobals,
};
use render_device::kernel::passes::{BufferAddress, PassLayout};
use render_device::kernel::KernelFunctions;

const SAMPLES: u32 = 8;

fn hash01(sample: u32, x: i32, y: i32, salt: u32) -> f32 {
    let mut h = sample.wrapping_mul(0x9E37_79B9)
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

/// A vertical edge between two albedos, with noisy visibility.
struct Edge;

impl Integrator for Edge {
    fn trace(&self, _kg: &mut ThreadKernelGlobals, sample: u32, x: i32, y: i32) -> PathSample {
        let albedo = if x < 7 { [0.8, 0.4, 0.2] } else { [0.1, 0.5, 0.9] };
        let shadow = if hash01(sample, x, y, 1) < 0.7 { 1.0 } else { 0.0 };
        let jitter = 0.5 + hash01(sample, x, y, 2);
        PathSample {
            radiance: albedo.map(|a| a * shadow * jitter),
            alpha: 1.0,
            features: Some(PathFeatures {
                normal: [0.0, 0.0, 1.0],
                albedo,
                depth: 1.0 + 0.1 * y as f32,
                shadow,
            }),
        }
    }
}

fn render(kernels: &KernelFunctions, rect: Rect) -> Vec<f32> {
    let layout = PassLayout::new(true);
    let address = BufferAddress::new(-rect.x0 - rect.y0 * rect.width(), rect.width(), layout);
    let mut data = vec![0.0; rect.area() * layout.pass_stride];
    let mut kg = ThreadKernelGlobals::new(KernelGlobals::default());
    for sample in 0..SAMPLES {
        for (x, y) in rect.pixels() {
            (kernels.path_trace)(&mut kg, &Edge, &mut data, &address, sample, x, y);
        }
    }
    data
}

fn denoise(kernels: &KernelFunctions, data: &[f32], rect: Rect, area: Rect) -> Vec<f32> {
    let layout = PassLayout::new(true);
    let tile = TileSlice {
        data,
        offset: -rect.x0 - rect.y0 * rect.width(),
        stride: rect.width(),
        frame_stride: data.len(),
    };
    let src = Neighborhood::single(tile, rect, layout.pass_stride, layout.denoising_offset.unwrap());
    let settings = KernelIntegrator {
        half_window: 3,
        second_order_screen: false,
    };
    let buf = filter::fill_filter_buffer(kernels, SAMPLES, &src, rect, 1, 0).unwrap();
    let mut result = data.to_vec();
    let mut out = FilterOutput {
        data: &mut result,
        offset: tile.offset,
        stride: tile.stride,
        pass_stride: layout.pass_stride,
    };
    filter::run_reconstruction(kernels, &settings, &buf, area, SAMPLES, &mut out).unwrap();
    result
}

fn scalar() -> &'static KernelFunctions {
    KernelFunctions::for_level(IsaLevel::Scalar).unwrap()
}

#[test]
fn path_trace_tables_agree() {
    let rect = Rect::new(0, 0, 14, 6);
    let reference = render(scalar(), rect);
    for kernels in KernelFunctions::all_supported() {
        assert_eq!(render(kernels, rect), reference, "{} path trace differs", kernels.level);
    }
}

#[test]
fn denoise_tables_agree() {
    let rect = Rect::new(0, 0, 14, 12);
    let area = Rect::new(2, 2, 12, 10);
    let data = render(scalar(), rect);
    let reference = denoise(scalar(), &data, rect, area);
    assert_ne!(reference, data);
    for kernels in KernelFunctions::all_supported() {
        let result = denoise(kernels, &data, rect, area);
        for (i, (a, b)) in result.iter().zip(&reference).enumerate() {
            assert!(
                (a - b).abs() <= 1e-4 * b.abs().max(1.0),
                "{} differs at {}: {} vs {}",
                kernels.level,
                i,
                a,
                b
            );
        }
    }
}

#[test]
fn film_tables_agree() {
    let rect = Rect::new(0, 0, 14, 4);
    let data = render(scalar(), rect);
    let address = BufferAddress::new(0, rect.width(), PassLayout::new(true));
    let film = KernelFilm { exposure: 1.5 };
    let scale = 1.0 / SAMPLES as f32;
    let s = scalar();
    for kernels in KernelFunctions::all_supported() {
        for (x, y) in rect.pixels() {
            assert_eq!(
                (kernels.convert_to_byte)(&film, &data, &address, scale, x, y),
                (s.convert_to_byte)(&film, &data, &address, scale, x, y)
            );
            assert_eq!(
                (kernels.convert_to_half_float)(&film, &data, &address, scale, x, y),
                (s.convert_to_half_float)(&film, &data, &address, scale, x, y)
            );
        }
    }
}

#[test]
fn film_output_is_the_scaled_average() {
    let layout = PassLayout::new(false);
    let data = vec![2.0, 1.0, 0.5, 4.0];
    let address = BufferAddress::new(0, 1, layout);
    let film = KernelFilm::default();
    // sample index 3: four accumulated samples.
    let half = (scalar().convert_to_half_float)(&film, &data, &address, 1.0 / 4.0, 0, 0);
    assert_eq!(half.map(f32::from), [0.5, 0.25, 0.125, 1.0]);
}
