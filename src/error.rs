//! Error types for the render device.

/// Errors surfaced by the device, the denoiser and the configuration layer.
///
/// Numeric edge cases (zero variance, singular systems) never show up here;
/// the kernels clamp them locally. What remains are conditions a caller can
/// act on, or that must stop the task pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A filter buffer or per-pixel storage could not be allocated.
    OutOfMemory { what: &'static str, bytes: usize },
    /// A tile, rectangle or buffer did not satisfy the region contract.
    InvalidRegion(String),
    /// A task needs an external kernel collaborator that was never set.
    MissingKernel(&'static str),
    /// Configuration file could not be read or parsed.
    Config(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::OutOfMemory { what, bytes } => {
                write!(f, "out of memory allocating {} ({} bytes)", what, bytes)
            }
            DeviceError::InvalidRegion(msg) => write!(f, "invalid region: {}", msg),
            DeviceError::MissingKernel(name) => write!(f, "no {} has been set on the device", name),
            DeviceError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Result type used throughout the crate.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Allocates a zero-filled vector, reporting failure instead of aborting.
pub(crate) fn try_alloc_zeroed<T: Clone + Default>(
    len: usize,
    what: &'static str,
) -> DeviceResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| DeviceError::OutOfMemory {
        what,
        bytes: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    v.resize(len, T::default());
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_allocations_fail_gracefully() {
        let result = try_alloc_zeroed::<f32>(usize::MAX / 2, "filter buffer");
        assert!(matches!(result, Err(DeviceError::OutOfMemory { what: "filter buffer", .. })));
    }

    #[test]
    fn display_mentions_the_allocation() {
        let e = DeviceError::OutOfMemory { what: "filter storage", bytes: 64 };
        assert_eq!(e.to_string(), "out of memory allocating filter storage (64 bytes)");
    }
}
