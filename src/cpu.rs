// src/cpu.rs

//! Runtime CPU capability probe.
//!
//! The probe runs once per process ([`cpu_flags`] caches it in a `OnceLock`)
//! and answers which vector instruction sets the kernels may use. Kernel
//! selection is a pure function of these flags, see
//! [`crate::kernel::KernelFunctions::select`].

use bitflags::bitflags;
use std::sync::OnceLock;

use crate::config::{CpuDebugFlags, CONFIG};

bitflags! {
    /// Vector extensions relevant to the kernel variants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuFlags: u32 {
        const SSE2 = 1 << 0;
        const SSE3 = 1 << 1;
        const SSE41 = 1 << 2;
        const AVX = 1 << 3;
        const AVX2 = 1 << 4;
    }
}

impl CpuFlags {
    /// Queries the running CPU.
    pub fn run_time_detect() -> Self {
        #[allow(unused_mut)]
        let mut flags = Self::empty();

        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if is_x86_feature_detected!("sse2") {
                flags |= Self::SSE2;
            }
            if is_x86_feature_detected!("sse3") {
                flags |= Self::SSE3;
            }
            if is_x86_feature_detected!("sse4.1") {
                flags |= Self::SSE41;
            }
            if is_x86_feature_detected!("avx") {
                flags |= Self::AVX;
            }
            if is_x86_feature_detected!("avx2") {
                flags |= Self::AVX2;
            }
        }

        flags
    }

    /// Removes the levels the debug switches turn off.
    pub fn masked(self, debug: &CpuDebugFlags) -> Self {
        let mut flags = self;
        if !debug.sse2 {
            flags.remove(Self::SSE2);
        }
        if !debug.sse3 {
            flags.remove(Self::SSE3);
        }
        if !debug.sse41 {
            flags.remove(Self::SSE41);
        }
        if !debug.avx {
            flags.remove(Self::AVX);
        }
        if !debug.avx2 {
            flags.remove(Self::AVX2);
        }
        flags
    }
}

/// Instruction set level a kernel variant is compiled for. Ordered from the
/// portable baseline to the widest vector unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsaLevel {
    Scalar,
    Sse2,
    Sse3,
    Sse41,
    Avx,
    Avx2,
}

impl IsaLevel {
    /// All levels, lowest first.
    pub const ALL: [IsaLevel; 6] = [
        IsaLevel::Scalar,
        IsaLevel::Sse2,
        IsaLevel::Sse3,
        IsaLevel::Sse41,
        IsaLevel::Avx,
        IsaLevel::Avx2,
    ];

    /// Flags that must all be present to run this level. Each level implies
    /// the ones below it.
    pub fn required_flags(self) -> CpuFlags {
        match self {
            IsaLevel::Scalar => CpuFlags::empty(),
            IsaLevel::Sse2 => CpuFlags::SSE2,
            IsaLevel::Sse3 => CpuFlags::SSE2 | CpuFlags::SSE3,
            IsaLevel::Sse41 => CpuFlags::SSE2 | CpuFlags::SSE3 | CpuFlags::SSE41,
            IsaLevel::Avx => CpuFlags::SSE2 | CpuFlags::SSE3 | CpuFlags::SSE41 | CpuFlags::AVX,
            IsaLevel::Avx2 => CpuFlags::all(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IsaLevel::Scalar => "regular",
            IsaLevel::Sse2 => "SSE2",
            IsaLevel::Sse3 => "SSE3",
            IsaLevel::Sse41 => "SSE4.1",
            IsaLevel::Avx => "AVX",
            IsaLevel::Avx2 => "AVX2",
        }
    }

    /// Whether a kernel table for this level is part of the build.
    pub fn is_compiled(self) -> bool {
        compiled_levels().contains(&self)
    }

    /// Whether this level can run on the current CPU (after debug masking).
    pub fn is_supported(self) -> bool {
        cpu_flags().contains(self.required_flags())
    }
}

impl std::fmt::Display for IsaLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Levels with a kernel table in this build, lowest first.
pub fn compiled_levels() -> &'static [IsaLevel] {
    const LEVELS: &[IsaLevel] = &[
        IsaLevel::Scalar,
        #[cfg(all(target_arch = "x86_64", feature = "optimized-sse2"))]
        IsaLevel::Sse2,
        #[cfg(all(target_arch = "x86_64", feature = "optimized-sse3"))]
        IsaLevel::Sse3,
        #[cfg(all(target_arch = "x86_64", feature = "optimized-sse41"))]
        IsaLevel::Sse41,
        #[cfg(all(target_arch = "x86_64", feature = "optimized-avx"))]
        IsaLevel::Avx,
        #[cfg(all(target_arch = "x86_64", feature = "optimized-avx2"))]
        IsaLevel::Avx2,
    ];
    LEVELS
}

static CPU_FLAGS: OnceLock<CpuFlags> = OnceLock::new();

/// The detected flags with debug masking applied, computed once.
pub fn cpu_flags() -> CpuFlags {
    *CPU_FLAGS.get_or_init(|| CpuFlags::run_time_detect().masked(&CONFIG.device.debug_cpu))
}

/// Highest level in `compiled` whose requirements are met by `flags`.
pub fn best_level(flags: CpuFlags, compiled: &[IsaLevel]) -> IsaLevel {
    compiled
        .iter()
        .copied()
        .filter(|level| flags.contains(level.required_flags()))
        .max()
        .unwrap_or(IsaLevel::Scalar)
}

/// Space separated list of supported extensions, e.g. "SSE2 SSE3 AVX".
pub fn capabilities_string() -> String {
    format_capabilities(cpu_flags())
}

pub(crate) fn format_capabilities(flags: CpuFlags) -> String {
    let names = [
        (CpuFlags::SSE2, "SSE2"),
        (CpuFlags::SSE3, "SSE3"),
        (CpuFlags::SSE41, "SSE41"),
        (CpuFlags::AVX, "AVX"),
        (CpuFlags::AVX2, "AVX2"),
    ];
    names
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Marketing name of the processor.
pub fn cpu_brand_string() -> String {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::__cpuid;

        // SAFETY: CPUID is available on every x86_64 processor.
        let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_extended >= 0x8000_0004 {
            let mut bytes = Vec::with_capacity(48);
            for leaf in 0x8000_0002u32..=0x8000_0004 {
                // SAFETY: leaf is within the reported extended range.
                let r = unsafe { __cpuid(leaf) };
                for reg in [r.eax, r.ebx, r.ecx, r.edx] {
                    bytes.extend_from_slice(&reg.to_le_bytes());
                }
            }
            let brand = String::from_utf8_lossy(&bytes);
            let brand = brand.trim_matches(char::from(0)).trim();
            if !brand.is_empty() {
                return brand.to_string();
            }
        }
    }
    "Unknown CPU".to_string()
}

/// Hardware concurrency, at least one.
pub fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
