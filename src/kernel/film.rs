// src/kernel/film.rs

//! Film conversion: accumulated render buffer to display pixels.

use half::f16;

use super::globals::KernelFilm;
use super::passes::{BufferAddress, COMBINED};

/// Combined RGBA of a pixel, scaled by `sample_scale` and the film exposure.
/// Alpha is not exposed.
#[inline(always)]
fn film_map(film: &KernelFilm, buffer: &[f32], address: &BufferAddress, sample_scale: f32, x: i32, y: i32) -> [f32; 4] {
    let start = address.pixel_index(x, y) + COMBINED;
    let p = &buffer[start..start + 4];
    [
        (p[0] * sample_scale) * film.exposure,
        (p[1] * sample_scale) * film.exposure,
        (p[2] * sample_scale) * film.exposure,
        p[3] * sample_scale,
    ]
}

#[inline(always)]
fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.0031308 {
        12.92 * c.max(0.0)
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

#[inline(always)]
fn unit_to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// sRGB encoded 8-bit RGBA with linear alpha.
#[inline(always)]
pub fn convert_to_byte(
    film: &KernelFilm,
    buffer: &[f32],
    address: &BufferAddress,
    sample_scale: f32,
    x: i32,
    y: i32,
) -> [u8; 4] {
    let rgba = film_map(film, buffer, address, sample_scale, x, y);
    [
        unit_to_byte(linear_to_srgb(rgba[0])),
        unit_to_byte(linear_to_srgb(rgba[1])),
        unit_to_byte(linear_to_srgb(rgba[2])),
        unit_to_byte(rgba[3]),
    ]
}

/// Linear half-float RGBA.
#[inline(always)]
pub fn convert_to_half_float(
    film: &KernelFilm,
    buffer: &[f32],
    address: &BufferAddress,
    sample_scale: f32,
    x: i32,
    y: i32,
) -> [f16; 4] {
    film_map(film, buffer, address, sample_scale, x, y).map(f16::from_f32)
}
