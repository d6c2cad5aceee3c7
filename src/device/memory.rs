// src/device/memory.rs

//! Device memory descriptors and allocation statistics.
//!
//! The CPU backend has no separate address space: a descriptor's device side
//! is its host vector, so allocation only records ownership and size.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Running totals of device memory in bytes.
#[derive(Debug, Default)]
pub struct Stats {
    mem_used: AtomicUsize,
    mem_peak: AtomicUsize,
}

impl Stats {
    pub fn mem_alloc(&self, size: usize) {
        let used = self.mem_used.fetch_add(size, Ordering::Relaxed) + size;
        self.mem_peak.fetch_max(used, Ordering::Relaxed);
    }

    pub fn mem_free(&self, size: usize) {
        let _ = self
            .mem_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| Some(used.saturating_sub(size)));
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    pub fn mem_peak(&self) -> usize {
        self.mem_peak.load(Ordering::Relaxed)
    }
}

/// A block of f32 data the device may use as a buffer or texture.
#[derive(Debug, Clone, Default)]
pub struct DeviceMemory {
    pub name: String,
    pub data_width: usize,
    pub data_height: usize,
    pub data_depth: usize,
    /// Floats per element.
    pub channels: usize,
    pub host: Vec<f32>,
    /// Bytes accounted to the device while allocated, zero otherwise.
    pub device_size: usize,
    /// Texture slot when registered through `tex_alloc`.
    pub texture_slot: Option<usize>,
    allocated: bool,
}

impl DeviceMemory {
    /// A zeroed `width × height × depth` block of `channels`-float elements.
    pub fn new(name: impl Into<String>, width: usize, height: usize, depth: usize, channels: usize) -> Self {
        let len = width * height * depth.max(1) * channels;
        DeviceMemory {
            name: name.into(),
            data_width: width,
            data_height: height,
            data_depth: depth.max(1),
            channels,
            host: vec![0.0; len],
            ..Default::default()
        }
    }

    /// Wraps existing host data.
    pub fn from_host(name: impl Into<String>, width: usize, height: usize, channels: usize, host: Vec<f32>) -> Self {
        DeviceMemory {
            name: name.into(),
            data_width: width,
            data_height: height,
            data_depth: 1,
            channels,
            host,
            ..Default::default()
        }
    }

    pub fn memory_size(&self) -> usize {
        self.host.len() * std::mem::size_of::<f32>()
    }

    /// The device view, which aliases the host data while allocated.
    pub fn device_pointer(&self) -> Option<&[f32]> {
        self.allocated.then_some(self.host.as_slice())
    }

    pub fn device_pointer_mut(&mut self) -> Option<&mut [f32]> {
        if self.allocated {
            Some(self.host.as_mut_slice())
        } else {
            None
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub(crate) fn mark_allocated(&mut self) -> usize {
        self.allocated = true;
        self.device_size = self.memory_size();
        self.device_size
    }

    /// Clears the device side; returns the bytes that were accounted.
    pub(crate) fn mark_freed(&mut self) -> Option<usize> {
        if !self.allocated {
            return None;
        }
        self.allocated = false;
        Some(std::mem::take(&mut self.device_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_survives_frees() {
        let stats = Stats::default();
        stats.mem_alloc(100);
        stats.mem_alloc(50);
        stats.mem_free(100);
        assert_eq!(stats.mem_used(), 50);
        assert_eq!(stats.mem_peak(), 150);
        stats.mem_free(1000);
        assert_eq!(stats.mem_used(), 0);
    }

    #[test]
    fn device_pointer_aliases_host_only_while_allocated() {
        let mut mem = DeviceMemory::new("buf", 4, 2, 1, 4);
        assert_eq!(mem.memory_size(), 4 * 2 * 4 * 4);
        assert!(mem.device_pointer().is_none());
        assert_eq!(mem.mark_allocated(), 128);
        mem.device_pointer_mut().unwrap()[3] = 2.0;
        assert_eq!(mem.host[3], 2.0);
        assert_eq!(mem.mark_freed(), Some(128));
        assert_eq!(mem.mark_freed(), None);
        assert_eq!(mem.device_size, 0);
    }
}
