// src/filter/buffer.rs

//! The 22-plane filter buffer and its typed plane accessor.
//!
//! Plane order:
//!
//! ```text
//! Normal[X, XVar, Y, YVar, Z, ZVar] Depth DepthVar Shadow ShadowVar
//!        0  1     2  3     4  5     6     7        8      9
//! Albedo[R, RVar, G, GVar, B, BVar] Color[R, RVar, G, GVar, B, BVar]
//!        10 11    12 13    14 15          16 17    18 19    20 21
//! ```
//!
//! Planes 16..22 double as scratch space until the color copy runs last.

use crate::error::{try_alloc_zeroed, DeviceResult};

/// Number of planes in a filter buffer.
pub const NUM_PLANES: usize = 22;

/// Rows of every plane are padded to a multiple of this many floats.
pub const ROW_ALIGN: usize = 8;

/// Half-open pixel rectangle `[x0, x1) × [y0, y1)` in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Rect {
    pub const fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Rect { x0, y0, x1, y1 }
    }

    pub const fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Rect { x0: x, y0: y, x1: x + w, y1: y + h }
    }

    pub fn width(&self) -> i32 {
        (self.x1 - self.x0).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y1 - self.y0).max(0)
    }

    pub fn area(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.x0 >= self.x0 && other.x1 <= self.x1 && other.y0 >= self.y0 && other.y1 <= self.y1)
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    /// Grows the rectangle by `low` on the top/left and `high` on the bottom/right.
    pub fn grow(&self, low: i32, high: i32) -> Rect {
        Rect {
            x0: self.x0 - low,
            y0: self.y0 - low,
            x1: self.x1 + high,
            y1: self.y1 + high,
        }
    }

    /// Pixels of the rectangle in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        (self.y0..self.y1).flat_map(move |y| (self.x0..self.x1).map(move |x| (x, y)))
    }
}

/// Denoising features stored as mean/variance plane pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    NormalX = 0,
    NormalY,
    NormalZ,
    Depth,
    Shadow,
    AlbedoR,
    AlbedoG,
    AlbedoB,
    ColorR,
    ColorG,
    ColorB,
}

impl Feature {
    pub const NORMAL: [Feature; 3] = [Feature::NormalX, Feature::NormalY, Feature::NormalZ];
    pub const ALBEDO: [Feature; 3] = [Feature::AlbedoR, Feature::AlbedoG, Feature::AlbedoB];
    pub const COLOR: [Feature; 3] = [Feature::ColorR, Feature::ColorG, Feature::ColorB];

    /// Plane holding the feature's mean. Always even.
    pub const fn mean(self) -> Plane {
        Plane(2 * self as usize)
    }

    /// Plane holding the feature's variance, directly after its mean.
    pub const fn variance(self) -> Plane {
        Plane(2 * self as usize + 1)
    }
}

/// Index of one plane of a [`FilterBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Plane(usize);

impl Plane {
    /// Scratch plane `i` (0..6), aliasing the color planes.
    pub const fn scratch(i: usize) -> Plane {
        assert!(i < 6, "only six scratch planes exist");
        Plane(16 + i)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// Geometry shared by all planes of one frame: the image rectangle covered
/// and the padded row stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneArea {
    pub rect: Rect,
    pub stride: usize,
}

impl PlaneArea {
    /// Offset of image pixel `(x, y)` inside a plane.
    #[inline(always)]
    pub fn index(&self, x: i32, y: i32) -> usize {
        debug_assert!(self.rect.contains(x, y));
        (y - self.rect.y0) as usize * self.stride + (x - self.rect.x0) as usize
    }

    /// The unpadded row `y` (local, 0-based) of a plane.
    #[inline(always)]
    pub fn row<'a>(&self, plane: &'a [f32], y: usize) -> &'a [f32] {
        let start = y * self.stride;
        &plane[start..start + self.rect.width() as usize]
    }
}

/// Per-invocation scratch holding all filter planes for every frame.
///
/// Each plane spans `pass_stride = stride * height * frames` floats; frame `t`
/// occupies `[t * frame_stride, (t + 1) * frame_stride)` of every plane.
#[derive(Debug, Clone)]
pub struct FilterBuffer {
    area: PlaneArea,
    frames: usize,
    prev_frames: usize,
    frame_stride: usize,
    pass_stride: usize,
    data: Vec<f32>,
}

impl FilterBuffer {
    pub fn new(rect: Rect, frames: usize, prev_frames: usize) -> DeviceResult<Self> {
        let frames = frames.max(1);
        let stride = (rect.width() as usize).next_multiple_of(ROW_ALIGN);
        let frame_stride = stride * rect.height() as usize;
        let pass_stride = frame_stride * frames;
        let data = try_alloc_zeroed(NUM_PLANES * pass_stride, "filter buffer")?;
        Ok(FilterBuffer {
            area: PlaneArea { rect, stride },
            frames,
            prev_frames,
            frame_stride,
            pass_stride,
            data,
        })
    }

    pub fn area(&self) -> &PlaneArea {
        &self.area
    }

    pub fn rect(&self) -> Rect {
        self.area.rect
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn pass_stride(&self) -> usize {
        self.pass_stride
    }

    /// Time coordinate of a frame: 0 for the current frame, negative for the
    /// `prev_frames` frames before it, positive for the ones after.
    pub fn frame_time(&self, frame: usize) -> i32 {
        let t = frame as i32;
        let prev = self.prev_frames as i32;
        if t == 0 {
            0
        } else if t <= prev {
            t - prev - 1
        } else {
            t - prev
        }
    }

    fn frame_range(&self, frame: usize) -> std::ops::Range<usize> {
        assert!(frame < self.frames, "frame {} out of range", frame);
        frame * self.frame_stride..(frame + 1) * self.frame_stride
    }

    /// One frame of a plane.
    pub fn plane(&self, frame: usize, plane: Plane) -> &[f32] {
        let range = self.frame_range(frame);
        let base = plane.index() * self.pass_stride;
        &self.data[base + range.start..base + range.end]
    }

    /// Mutable access to one frame of a plane.
    pub fn plane_mut(&mut self, frame: usize, plane: Plane) -> &mut [f32] {
        let range = self.frame_range(frame);
        let base = plane.index() * self.pass_stride;
        &mut self.data[base + range.start..base + range.end]
    }

    /// Value of a plane at image pixel `(x, y)`.
    #[inline(always)]
    pub fn value(&self, frame: usize, plane: Plane, x: i32, y: i32) -> f32 {
        self.data[plane.index() * self.pass_stride + frame * self.frame_stride + self.area.index(x, y)]
    }

    /// Borrows `R` planes for reading and `W` distinct planes for writing.
    ///
    /// A plane may be read several times but never be both read and written.
    pub fn planes<const R: usize, const W: usize>(
        &mut self,
        frame: usize,
        reads: [Plane; R],
        writes: [Plane; W],
    ) -> ([&[f32]; R], [&mut [f32]; W]) {
        let range = self.frame_range(frame);
        let mut slots: Vec<Option<&mut [f32]>> = self
            .data
            .chunks_mut(self.pass_stride.max(1))
            .map(|plane| Some(&mut plane[range.clone()]))
            .collect();

        let written = writes.map(|p| {
            slots[p.index()]
                .take()
                .unwrap_or_else(|| panic!("plane {} written twice", p.index()))
        });
        let shared: Vec<Option<&[f32]>> = slots.into_iter().map(|s| s.map(|s| &*s)).collect();
        let read = reads.map(|p| {
            shared[p.index()].unwrap_or_else(|| panic!("plane {} is both read and written", p.index()))
        });
        (read, written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_variance_planes_are_adjacent() {
        let all = [
            Feature::NormalX,
            Feature::NormalY,
            Feature::NormalZ,
            Feature::Depth,
            Feature::Shadow,
            Feature::AlbedoR,
            Feature::AlbedoG,
            Feature::AlbedoB,
            Feature::ColorR,
            Feature::ColorG,
            Feature::ColorB,
        ];
        for f in all {
            assert_eq!(f.mean().index() % 2, 0);
            assert_eq!(f.variance().index(), f.mean().index() + 1);
            assert!(f.variance().index() < NUM_PLANES);
        }
        assert_eq!(Feature::Depth.mean().index(), 6);
        assert_eq!(Feature::Shadow.mean().index(), 8);
        assert_eq!(Feature::AlbedoR.mean().index(), 10);
        assert_eq!(Feature::ColorR.mean().index(), 16);
        assert_eq!(Plane::scratch(0), Feature::ColorR.mean());
    }

    #[test]
    fn rows_are_padded() {
        let buf = FilterBuffer::new(Rect::new(3, 4, 13, 9), 2, 1).unwrap();
        assert_eq!(buf.area().stride, 16);
        assert_eq!(buf.pass_stride(), 16 * 5 * 2);
        assert_eq!(buf.plane(1, Feature::Depth.mean()).len(), 16 * 5);
    }

    #[test]
    fn frame_times_put_current_frame_first() {
        let buf = FilterBuffer::new(Rect::new(0, 0, 4, 4), 4, 2).unwrap();
        let times: Vec<i32> = (0..4).map(|t| buf.frame_time(t)).collect();
        assert_eq!(times, vec![0, -2, -1, 1]);
    }

    #[test]
    fn planes_hands_out_disjoint_slices() {
        let mut buf = FilterBuffer::new(Rect::new(0, 0, 2, 2), 1, 0).unwrap();
        {
            let ([], [a, b]) = buf.planes(0, [], [Plane::scratch(0), Plane::scratch(1)]);
            a.fill(1.0);
            b.fill(2.0);
        }
        let ([a, a_again, b], [out]) = buf.planes(
            0,
            [Plane::scratch(0), Plane::scratch(0), Plane::scratch(1)],
            [Feature::Depth.mean()],
        );
        out[0] = a[0] + a_again[0] + b[0];
        assert_eq!(buf.value(0, Feature::Depth.mean(), 0, 0), 4.0);
    }

    #[test]
    #[should_panic(expected = "both read and written")]
    fn aliasing_read_and_write_panics() {
        let mut buf = FilterBuffer::new(Rect::new(0, 0, 2, 2), 1, 0).unwrap();
        let _ = buf.planes(0, [Plane::scratch(2)], [Plane::scratch(2)]);
    }

    #[test]
    fn filter_rect_helpers() {
        let r = Rect::from_xywh(2, 3, 4, 5);
        assert_eq!(r.grow(1, 2), Rect::new(1, 2, 8, 10));
        assert_eq!(r.intersect(&Rect::new(0, 0, 4, 4)), Rect::new(2, 3, 4, 4));
        assert_eq!(r.pixels().count(), 20);
        assert!(Rect::new(0, 0, 10, 10).contains_rect(&r));
    }
}
