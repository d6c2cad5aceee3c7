// src/device/task.rs

//! Device tasks and how they split across workers.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use half::f16;
use log::trace;

use super::tile::{RenderBuffers, TileSource};
use crate::kernel::shader::{ShaderEvalType, ShaderInput};
use crate::task_pool::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTaskType {
    Render,
    FilmConvert,
    Shader,
}

/// Progress messages sent while a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// `tile` now holds `sample` samples.
    TileSample { tile: usize, sample: u32 },
    /// `tile` was released back to its producer.
    TileDone { tile: usize },
    /// The shader range starting at `shader_x` finished `sample` samples.
    ShaderSample { shader_x: usize, sample: u32 },
}

/// Destination of a film conversion, indexed like the source buffer's pixels.
#[derive(Debug, Clone)]
pub enum FilmOutput {
    Byte(Arc<Mutex<Vec<[u8; 4]>>>),
    Half(Arc<Mutex<Vec<[f16; 4]>>>),
}

impl FilmOutput {
    pub fn len(&self) -> usize {
        match self {
            FilmOutput::Byte(out) => out.lock().map_or_else(|e| e.into_inner().len(), |v| v.len()),
            FilmOutput::Half(out) => out.lock().map_or_else(|e| e.into_inner().len(), |v| v.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct RenderTask {
    pub tiles: Arc<dyn TileSource>,
}

/// Converts rows `y..y + h` (columns `x..x + w`) of `buffers`.
#[derive(Debug, Clone)]
pub struct FilmConvertTask {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    /// Index of the last accumulated sample; pixels are scaled by `1 / (sample + 1)`.
    pub sample: u32,
    pub buffers: Arc<RenderBuffers>,
    pub output: FilmOutput,
}

/// Evaluates inputs `shader_x..shader_x + shader_w` for `num_samples` samples.
#[derive(Debug, Clone)]
pub struct ShaderTask {
    pub input: Arc<Vec<ShaderInput>>,
    pub output: Arc<Mutex<Vec<[f32; 4]>>>,
    pub output_luma: Option<Arc<Mutex<Vec<f32>>>>,
    pub eval_type: ShaderEvalType,
    pub filter: u32,
    pub shader_x: usize,
    pub shader_w: usize,
    pub num_samples: u32,
}

#[derive(Clone)]
pub enum TaskWork {
    Render(RenderTask),
    FilmConvert(FilmConvertTask),
    Shader(ShaderTask),
}

/// A unit of work submitted to the device.
#[derive(Clone)]
pub struct DeviceTask {
    pub work: TaskWork,
    /// Keep acquiring (and releasing) tiles after a cancel instead of stopping.
    pub need_finish_queue: bool,
    pub progress: Option<Sender<ProgressEvent>>,
    /// Caller-side cancellation, polled alongside the device's own.
    pub cancel: Option<CancelToken>,
}

impl DeviceTask {
    fn new(work: TaskWork) -> Self {
        DeviceTask {
            work,
            need_finish_queue: false,
            progress: None,
            cancel: None,
        }
    }

    pub fn render(tiles: Arc<dyn TileSource>) -> Self {
        Self::new(TaskWork::Render(RenderTask { tiles }))
    }

    pub fn film_convert(task: FilmConvertTask) -> Self {
        Self::new(TaskWork::FilmConvert(task))
    }

    pub fn shader(task: ShaderTask) -> Self {
        Self::new(TaskWork::Shader(task))
    }

    pub fn with_progress(mut self, progress: Sender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_finish_queue(mut self, need_finish_queue: bool) -> Self {
        self.need_finish_queue = need_finish_queue;
        self
    }

    pub fn kind(&self) -> DeviceTaskType {
        match self.work {
            TaskWork::Render(_) => DeviceTaskType::Render,
            TaskWork::FilmConvert(_) => DeviceTaskType::FilmConvert,
            TaskWork::Shader(_) => DeviceTaskType::Shader,
        }
    }

    /// Whether the caller canceled this task.
    pub fn canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_canceled)
    }

    /// Sends a progress event. The caller may stop listening at any time.
    pub(crate) fn report(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            if let Err(e) = progress.send(event) {
                trace!("Progress receiver dropped, discarding {:?}", e.0);
            }
        }
    }

    /// How many subtasks [`split`](Self::split) produces. `max_size` bounds
    /// the shader range, or the number of pixels, of one subtask.
    pub fn subtask_count(&self, num: usize, max_size: Option<usize>) -> usize {
        let mut num = num.max(1);
        if let Some(max_size) = max_size.filter(|&m| m > 0) {
            let max_size_num = match &self.work {
                TaskWork::Shader(s) => s.shader_w.div_ceil(max_size),
                TaskWork::FilmConvert(f) => {
                    let rows = (max_size / f.w.max(1) as usize).max(1);
                    (f.h.max(0) as usize).div_ceil(rows)
                }
                TaskWork::Render(_) => 0,
            };
            num = num.max(max_size_num);
        }
        match &self.work {
            TaskWork::Shader(s) => num.min(s.shader_w),
            TaskWork::FilmConvert(f) => num.min(f.h.max(0) as usize),
            TaskWork::Render(_) => num,
        }
    }

    /// Splits into at most `num` (or more, when `max_size` demands) subtasks.
    ///
    /// Render tasks are duplicated, every copy pulling from the same tile
    /// source. Film conversion splits by rows and shader evaluation by input
    /// range; the last piece takes the remainder.
    pub fn split(&self, num: usize, max_size: Option<usize>) -> Vec<DeviceTask> {
        let num = self.subtask_count(num, max_size);
        let with_work = |work: TaskWork| DeviceTask { work, ..self.clone() };
        match &self.work {
            TaskWork::Render(_) => (0..num).map(|_| self.clone()).collect(),
            TaskWork::FilmConvert(f) => {
                let rows = f.h as usize / num.max(1);
                (0..num)
                    .map(|i| {
                        let y = f.y + (rows * i) as i32;
                        let h = if i == num - 1 { f.h - (rows * i) as i32 } else { rows as i32 };
                        with_work(TaskWork::FilmConvert(FilmConvertTask { y, h, ..f.clone() }))
                    })
                    .collect()
            }
            TaskWork::Shader(s) => {
                let width = s.shader_w / num.max(1);
                (0..num)
                    .map(|i| {
                        let shader_x = s.shader_x + width * i;
                        let shader_w = if i == num - 1 { s.shader_w - width * i } else { width };
                        with_work(TaskWork::Shader(ShaderTask { shader_x, shader_w, ..s.clone() }))
                    })
                    .collect()
            }
        }
    }
}
