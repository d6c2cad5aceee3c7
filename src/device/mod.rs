// src/device/mod.rs

//! The CPU device: memory and texture bookkeeping, task submission and the
//! worker entry points for rendering, film conversion and shader evaluation.
//!
//! Submitted tasks are split into subtasks and pushed onto the [`TaskPool`].
//! Each subtask builds its own [`ThreadKernelGlobals`] from a snapshot of the
//! device globals, so per-worker scratch never crosses threads.

pub mod denoise;
pub mod memory;
pub mod task;
pub mod tile;
pub mod tile_manager;

#[cfg(test)]
mod tests;

pub use denoise::denoise_region;
pub use memory::{DeviceMemory, Stats};
pub use task::{DeviceTask, DeviceTaskType, FilmConvertTask, FilmOutput, ProgressEvent, ShaderTask, TaskWork};
pub use tile::{BufferParams, RenderBuffers, RenderTile, TileKind, TileSource};
pub use tile_manager::{TileLayout, TileManager};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, error, info, trace};

use crate::config::Config;
use crate::cpu;
use crate::error::{DeviceError, DeviceResult};
use crate::kernel::globals::{Integrator, KernelData, KernelGlobals, ShaderEvaluator, ThreadKernelGlobals};
use crate::kernel::texture::{ExtensionType, InterpolationType, TextureInfo};
use crate::kernel::KernelFunctions;
use crate::task_pool::{CancelToken, TaskPool, TaskPoolConfig};
use task::RenderTask;

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub description: String,
    pub id: String,
    pub num: usize,
    pub advanced_shading: bool,
    pub pack_images: bool,
}

/// The single CPU device of this machine.
pub fn device_cpu_info() -> DeviceInfo {
    DeviceInfo {
        description: cpu::cpu_brand_string(),
        id: "CPU".to_string(),
        num: 0,
        advanced_shading: true,
        pack_images: false,
    }
}

/// Instruction set extensions the device can use.
pub fn device_cpu_capabilities() -> String {
    cpu::capabilities_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State the workers share with the device.
struct DeviceShared {
    kernels: &'static KernelFunctions,
    kernel_globals: RwLock<KernelGlobals>,
    stats: Stats,
    /// First fatal error raised by a worker since the last `task_wait`.
    error: Mutex<Option<DeviceError>>,
}

impl DeviceShared {
    fn globals_snapshot(&self) -> KernelGlobals {
        self.kernel_globals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_globals(&self, f: impl FnOnce(&mut KernelGlobals)) {
        f(&mut self.kernel_globals.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn record_error(&self, e: DeviceError) {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

/// CPU rendering device backed by a fixed worker pool.
pub struct CpuDevice {
    info: DeviceInfo,
    shared: Arc<DeviceShared>,
    pool: TaskPool,
    shader_chunk_size: usize,
}

impl CpuDevice {
    /// Creates a device using the best kernel table for this CPU.
    pub fn new(config: &Config) -> Self {
        Self::with_kernels(config, KernelFunctions::select())
    }

    /// Creates a device bound to a specific kernel table.
    pub fn with_kernels(config: &Config, kernels: &'static KernelFunctions) -> Self {
        let pool = TaskPool::new(TaskPoolConfig::from(&config.device));
        let info = device_cpu_info();
        info!(
            "CPU device '{}': {} threads, {} kernels",
            info.description,
            pool.num_threads(),
            kernels.level
        );
        let globals = KernelGlobals {
            data: KernelData::from(config),
            ..KernelGlobals::default()
        };
        CpuDevice {
            info,
            shared: Arc::new(DeviceShared {
                kernels,
                kernel_globals: RwLock::new(globals),
                stats: Stats::default(),
                error: Mutex::new(None),
            }),
            pool,
            shader_chunk_size: config.device.shader_chunk_size,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn kernels(&self) -> &'static KernelFunctions {
        self.shared.kernels
    }

    pub fn stats(&self) -> &Stats {
        &self.shared.stats
    }

    pub fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }

    pub fn set_integrator(&self, integrator: Arc<dyn Integrator>) {
        self.shared.update_globals(|kg| kg.integrator = Some(integrator));
    }

    pub fn set_shader_evaluator(&self, shader: Arc<dyn ShaderEvaluator>) {
        self.shared.update_globals(|kg| kg.shader = Some(shader));
    }

    /// Uploads the kernel constants used by subsequently started tasks.
    pub fn const_copy_to(&self, data: KernelData) {
        debug!("Kernel constants updated: {:?}", data);
        self.shared.update_globals(|kg| kg.data = data);
    }

    pub fn kernel_data(&self) -> KernelData {
        self.shared.globals_snapshot().data
    }

    /// A snapshot of the globals new tasks start from.
    pub fn kernel_globals(&self) -> KernelGlobals {
        self.shared.globals_snapshot()
    }

    /// The device side of `mem` is its host data; this only accounts for it.
    pub fn mem_alloc(&self, mem: &mut DeviceMemory) {
        if mem.is_allocated() {
            return;
        }
        let bytes = mem.mark_allocated();
        trace!("Buffer allocate: {}, {} bytes", mem.name, bytes);
        self.shared.stats.mem_alloc(bytes);
    }

    pub fn mem_copy_to(&self, mem: &DeviceMemory) {
        trace!("Buffer copy to device: {} (shared with host)", mem.name);
    }

    pub fn mem_copy_from(&self, mem: &DeviceMemory, y: usize, w: usize, h: usize) {
        trace!("Buffer copy from device: {} rows {}..{} x {} (shared with host)", mem.name, y, y + h, w);
    }

    pub fn mem_zero(&self, mem: &mut DeviceMemory) {
        if let Some(data) = mem.device_pointer_mut() {
            data.fill(0.0);
        }
    }

    pub fn mem_free(&self, mem: &mut DeviceMemory) {
        if let Some(bytes) = mem.mark_freed() {
            trace!("Buffer free: {}, {} bytes", mem.name, bytes);
            self.shared.stats.mem_free(bytes);
        }
    }

    /// Registers `mem` as a texture and returns its slot.
    pub fn tex_alloc(
        &self,
        name: &str,
        mem: &mut DeviceMemory,
        interpolation: InterpolationType,
        extension: ExtensionType,
    ) -> usize {
        debug!("Texture allocate: {}, {} bytes", name, mem.memory_size());
        let info = TextureInfo {
            name: name.to_string(),
            width: mem.data_width,
            height: mem.data_height,
            channels: mem.channels,
            data: Arc::from(mem.host.as_slice()),
            interpolation,
            extension,
        };
        let mut slot = 0;
        self.shared.update_globals(|kg| slot = kg.textures.insert(info));
        mem.texture_slot = Some(slot);
        if !mem.is_allocated() {
            self.shared.stats.mem_alloc(mem.mark_allocated());
        }
        slot
    }

    pub fn tex_free(&self, mem: &mut DeviceMemory) {
        if let Some(slot) = mem.texture_slot.take() {
            self.shared.update_globals(|kg| {
                kg.textures.remove(slot);
            });
        }
        self.mem_free(mem);
    }

    fn validate(&self, task: &DeviceTask) -> DeviceResult<()> {
        let globals = self.shared.globals_snapshot();
        match &task.work {
            TaskWork::Render(_) => {
                if globals.integrator.is_none() {
                    return Err(DeviceError::MissingKernel("integrator"));
                }
            }
            TaskWork::FilmConvert(f) => {
                let params = f.buffers.params();
                let rect = crate::filter::Rect::from_xywh(f.x, f.y, f.w, f.h);
                if !params.rect().contains_rect(&rect) {
                    return Err(DeviceError::InvalidRegion(format!(
                        "film region {:?} lies outside the buffer {:?}",
                        rect,
                        params.rect()
                    )));
                }
                let pixels = (params.width * params.height) as usize;
                if f.output.len() < pixels {
                    return Err(DeviceError::InvalidRegion(format!(
                        "film output holds {} pixels, buffer has {}",
                        f.output.len(),
                        pixels
                    )));
                }
            }
            TaskWork::Shader(s) => {
                if globals.shader.is_none() {
                    return Err(DeviceError::MissingKernel("shader evaluator"));
                }
                let end = s.shader_x + s.shader_w;
                let luma_len = s.output_luma.as_ref().map_or(usize::MAX, |l| lock(l).len());
                if s.input.len() < end || lock(&s.output).len() < end || luma_len < end {
                    return Err(DeviceError::InvalidRegion(format!(
                        "shader range {}..{} exceeds its input or output",
                        s.shader_x, end
                    )));
                }
            }
        }
        Ok(())
    }

    /// Splits `task` across the workers and queues the pieces.
    pub fn task_add(&self, task: DeviceTask) -> DeviceResult<()> {
        self.validate(&task)?;
        let max_size = match task.kind() {
            DeviceTaskType::Shader => Some(self.shader_chunk_size),
            _ => None,
        };
        let subtasks = task.split(self.pool.num_threads(), max_size);
        debug!("Queued {:?} task as {} subtasks", task.kind(), subtasks.len());
        for subtask in subtasks {
            let shared = Arc::clone(&self.shared);
            self.pool.push(move |cancel| {
                if let Err(e) = run_task(&shared, &subtask, cancel) {
                    error!("{:?} task failed: {}", subtask.kind(), e);
                    shared.record_error(e);
                    cancel.cancel();
                }
            });
        }
        Ok(())
    }

    /// Blocks until every queued task finished. Returns the first error a
    /// worker hit; the remaining work was canceled.
    pub fn task_wait(&self) -> DeviceResult<()> {
        self.pool.wait();
        match lock(&self.shared.error).take() {
            Some(e) => {
                self.pool.cancel_token().reset();
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Cancels queued and running tasks and waits for the workers to stop.
    pub fn task_cancel(&self) {
        self.pool.cancel();
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        self.pool.cancel();
    }
}

fn run_task(shared: &DeviceShared, task: &DeviceTask, cancel: &CancelToken) -> DeviceResult<()> {
    match &task.work {
        TaskWork::Render(render) => thread_render(shared, task, render, cancel),
        TaskWork::FilmConvert(film) => thread_film_convert(shared, task, film, cancel),
        TaskWork::Shader(s) => thread_shader(shared, task, s, cancel),
    }
}

fn thread_render(shared: &DeviceShared, task: &DeviceTask, render: &RenderTask, cancel: &CancelToken) -> DeviceResult<()> {
    let globals = shared.globals_snapshot();
    let settings = globals.data.integrator;
    let mut kg = ThreadKernelGlobals::new(globals);
    let integrator = kg.integrator().ok_or(DeviceError::MissingKernel("integrator"))?;
    let kernels = shared.kernels;
    let canceled = || cancel.is_canceled() || task.canceled();

    loop {
        if canceled() && !task.need_finish_queue {
            break;
        }
        let Some(mut tile) = render.tiles.acquire_tile() else { break };

        let result = if canceled() {
            Ok(())
        } else {
            match tile.kind {
                TileKind::PathTrace => {
                    render_path_trace(kernels, &mut kg, integrator.as_ref(), task, &mut tile, &canceled);
                    let overscan = tile.buffers.params().overscan;
                    if overscan > 0 && !canceled() {
                        let area = tile.rect().grow(-overscan, -overscan);
                        denoise_region(kernels, &settings, &tile.degenerate_neighbors(), area, tile.sample)
                    } else {
                        Ok(())
                    }
                }
                TileKind::Denoise => {
                    let neighbors = render.tiles.neighbor_tiles(&tile);
                    let sample = tile.end_sample();
                    let result = denoise_region(kernels, &settings, &neighbors, tile.rect(), sample);
                    tile.sample = sample;
                    result
                }
            }
        };

        let index = tile.index;
        render.tiles.release_tile(tile);
        task.report(ProgressEvent::TileDone { tile: index });
        result?;
    }
    Ok(())
}

/// Runs the sample loop of one PATH_TRACE tile, stopping early on cancel.
fn render_path_trace(
    kernels: &KernelFunctions,
    kg: &mut ThreadKernelGlobals,
    integrator: &dyn Integrator,
    task: &DeviceTask,
    tile: &mut RenderTile,
    canceled: &dyn Fn() -> bool,
) {
    let address = tile.address();
    let rect = tile.rect();
    for sample in tile.start_sample..tile.end_sample() {
        if canceled() {
            break;
        }
        {
            let mut data = tile.buffers.write();
            for (x, y) in rect.pixels() {
                (kernels.path_trace)(kg, integrator, data.as_mut_slice(), &address, sample, x, y);
            }
        }
        tile.sample = sample + 1;
        task.report(ProgressEvent::TileSample {
            tile: tile.index,
            sample: tile.sample,
        });
    }
}

fn thread_film_convert(
    shared: &DeviceShared,
    task: &DeviceTask,
    film_task: &FilmConvertTask,
    cancel: &CancelToken,
) -> DeviceResult<()> {
    let film = shared.globals_snapshot().data.film;
    let kernels = shared.kernels;
    let sample_scale = 1.0 / (film_task.sample as f32 + 1.0);
    let data = film_task.buffers.read();
    let address = film_task.buffers.params().address();
    let xs = film_task.x..film_task.x + film_task.w;

    for y in film_task.y..film_task.y + film_task.h {
        if cancel.is_canceled() || task.canceled() {
            break;
        }
        let start = address.pixel(film_task.x, y);
        match &film_task.output {
            FilmOutput::Byte(out) => {
                let row: Vec<[u8; 4]> = xs
                    .clone()
                    .map(|x| (kernels.convert_to_byte)(&film, data.as_slice(), &address, sample_scale, x, y))
                    .collect();
                lock(out)[start..start + row.len()].copy_from_slice(&row);
            }
            FilmOutput::Half(out) => {
                let row: Vec<_> = xs
                    .clone()
                    .map(|x| (kernels.convert_to_half_float)(&film, data.as_slice(), &address, sample_scale, x, y))
                    .collect();
                lock(out)[start..start + row.len()].copy_from_slice(&row);
            }
        }
    }
    Ok(())
}

fn thread_shader(shared: &DeviceShared, task: &DeviceTask, s: &ShaderTask, cancel: &CancelToken) -> DeviceResult<()> {
    let mut kg = ThreadKernelGlobals::new(shared.globals_snapshot());
    let evaluator = kg.shader().ok_or(DeviceError::MissingKernel("shader evaluator"))?;
    let kernels = shared.kernels;
    let range = s.shader_x..s.shader_x + s.shader_w;

    let mut output = lock(&s.output)[range.clone()].to_vec();
    let mut luma = s.output_luma.as_ref().map(|l| lock(l)[range.clone()].to_vec());

    for sample in 0..s.num_samples {
        for (i, x) in range.clone().enumerate() {
            let luma_out = luma.as_mut().map(|l| &mut l[i]);
            (kernels.shader)(&mut kg, evaluator.as_ref(), &s.input[x], &mut output[i], luma_out, s.eval_type, s.filter, sample);
        }
        lock(&s.output)[range.clone()].copy_from_slice(&output);
        if let (Some(dst), Some(src)) = (&s.output_luma, &luma) {
            lock(dst)[range.clone()].copy_from_slice(src);
        }

        if cancel.is_canceled() || task.canceled() {
            break;
        }
        task.report(ProgressEvent::ShaderSample {
            shader_x: s.shader_x,
            sample: sample + 1,
        });
    }
    Ok(())
}
