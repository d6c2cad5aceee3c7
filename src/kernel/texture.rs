// src/kernel/texture.rs

//! Named image textures registered with the kernel globals.
//!
//! Texels are stored as `channels` f32 values per pixel, row-major. Lookups
//! return RGBA: missing channels read 0 for color and 1 for alpha.

use std::sync::Arc;

/// Filtering applied by [`TextureInfo::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterpolationType {
    Closest,
    #[default]
    Linear,
    Cubic,
    /// Cubic when magnified, which on the CPU always means cubic.
    Smart,
}

/// How coordinates outside `[0, 1)` are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExtensionType {
    #[default]
    Repeat,
    Extend,
    /// Outside texels read as transparent black.
    Clip,
    Mirror,
}

/// One registered texture.
#[derive(Debug, Clone)]
pub struct TextureInfo {
    pub name: String,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Arc<[f32]>,
    pub interpolation: InterpolationType,
    pub extension: ExtensionType,
}

impl TextureInfo {
    /// Resolves texel coordinate `i` of an axis of length `n`, or `None` if
    /// the extension mode leaves it empty.
    fn wrap(&self, i: i64, n: usize) -> Option<usize> {
        let n = n as i64;
        match self.extension {
            ExtensionType::Repeat => Some(i.rem_euclid(n) as usize),
            ExtensionType::Extend => Some(i.clamp(0, n - 1) as usize),
            ExtensionType::Clip => (0..n).contains(&i).then_some(i as usize),
            ExtensionType::Mirror => {
                let m = i.rem_euclid(2 * n);
                let m = if m < n { m } else { 2 * n - 1 - m };
                Some(m as usize)
            }
        }
    }

    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let (Some(x), Some(y)) = (self.wrap(x, self.width), self.wrap(y, self.height)) else {
            return [0.0; 4];
        };
        let start = (y * self.width + x) * self.channels;
        let mut rgba = [0.0, 0.0, 0.0, 1.0];
        for (c, v) in self.data[start..start + self.channels.min(4)].iter().enumerate() {
            rgba[c] = *v;
        }
        if self.channels == 1 {
            rgba[1] = rgba[0];
            rgba[2] = rgba[0];
        }
        rgba
    }

    /// Samples the texture at normalized coordinates `(u, v)`.
    pub fn lookup(&self, u: f32, v: f32) -> [f32; 4] {
        if self.width == 0 || self.height == 0 {
            return [0.0; 4];
        }
        let px = u * self.width as f32;
        let py = v * self.height as f32;
        match self.interpolation {
            InterpolationType::Closest => self.texel(px.floor() as i64, py.floor() as i64),
            InterpolationType::Linear => {
                let (ix, tx) = split(px - 0.5);
                let (iy, ty) = split(py - 0.5);
                let wx = [1.0 - tx, tx];
                let wy = [1.0 - ty, ty];
                self.weighted(ix, iy, &wx, &wy)
            }
            InterpolationType::Cubic | InterpolationType::Smart => {
                let (ix, tx) = split(px - 0.5);
                let (iy, ty) = split(py - 0.5);
                self.weighted(ix - 1, iy - 1, &bspline_weights(tx), &bspline_weights(ty))
            }
        }
    }

    fn weighted<const N: usize>(&self, x0: i64, y0: i64, wx: &[f32; N], wy: &[f32; N]) -> [f32; 4] {
        let mut out = [0.0f32; 4];
        for (j, wy) in wy.iter().enumerate() {
            for (i, wx) in wx.iter().enumerate() {
                let t = self.texel(x0 + i as i64, y0 + j as i64);
                let w = wx * wy;
                for c in 0..4 {
                    out[c] += w * t[c];
                }
            }
        }
        out
    }
}

fn split(p: f32) -> (i64, f32) {
    let f = p.floor();
    (f as i64, p - f)
}

/// Uniform cubic B-spline weights for fractional offset `t`.
fn bspline_weights(t: f32) -> [f32; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        (1.0 - t) * (1.0 - t) * (1.0 - t) / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ]
}

/// Slot table of textures. Slots of freed textures are reused.
#[derive(Debug, Clone, Default)]
pub struct TextureTable {
    slots: Vec<Option<TextureInfo>>,
}

impl TextureTable {
    /// Registers a texture and returns its slot.
    pub fn insert(&mut self, info: TextureInfo) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(info);
                slot
            }
            None => {
                self.slots.push(Some(info));
                self.slots.len() - 1
            }
        }
    }

    pub fn remove(&mut self, slot: usize) -> Option<TextureInfo> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn get(&self, slot: usize) -> Option<&TextureInfo> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Slot of the texture registered under `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|t| t.name == name))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
