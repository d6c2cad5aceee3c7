// src/kernel/shader.rs

//! Shader evaluation kernel: displacement, background and bake requests.

use super::globals::{ShaderEvaluator, ThreadKernelGlobals};

/// Opaque input record handed to the evaluator (object, primitive, u, v).
pub type ShaderInput = [u32; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderEvalType {
    Displace,
    Background,
    Bake,
}

impl ShaderEvalType {
    pub fn is_bake(self) -> bool {
        matches!(self, ShaderEvalType::Bake)
    }
}

/// Rec. 709 luminance.
#[inline(always)]
pub fn linear_rgb_to_gray(rgb: &[f32]) -> f32 {
    0.2126 * rgb[0] + 0.7152 * rgb[1] + 0.0722 * rgb[2]
}

/// Evaluates one input for `sample` and folds it into `output`.
///
/// Bake output is a running mean over samples. Displacement and background
/// output accumulate, and also write their luminance when `output_luma` is
/// given.
#[inline(always)]
#[allow(clippy::too_many_arguments)]
pub fn shader(
    kg: &mut ThreadKernelGlobals,
    evaluator: &dyn ShaderEvaluator,
    input: &ShaderInput,
    output: &mut [f32; 4],
    output_luma: Option<&mut f32>,
    eval_type: ShaderEvalType,
    filter: u32,
    sample: u32,
) {
    let value = evaluator.evaluate(kg, input, eval_type, filter, sample);
    if sample == 0 {
        *output = value;
    } else if eval_type.is_bake() {
        let inv = 1.0 / (sample as f32 + 1.0);
        for (out, v) in output.iter_mut().zip(value) {
            *out += (v - *out) * inv;
        }
    } else {
        for (out, v) in output.iter_mut().zip(value) {
            *out += v;
        }
    }

    if !eval_type.is_bake() {
        if let Some(luma) = output_luma {
            *luma = linear_rgb_to_gray(&output[..3]);
        }
    }
}
