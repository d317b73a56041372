// RHI errors
//
// One error type for every fallible RHI call. Creation and submission
// failures are always surfaced to the caller, never papered over with
// fallback resources.

use std::fmt;

use super::types::BackendKind;

/// Kind of object a creation call was building
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
    Shader,
    Pipeline,
    Framebuffer,
    DescriptorSet,
    CommandBuffer,
    Semaphore,
    Surface,
    SwapChain,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Buffer => "buffer",
            ResourceKind::Texture => "texture",
            ResourceKind::Sampler => "sampler",
            ResourceKind::Shader => "shader",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::Framebuffer => "framebuffer",
            ResourceKind::DescriptorSet => "descriptor set",
            ResourceKind::CommandBuffer => "command buffer",
            ResourceKind::Semaphore => "semaphore",
            ResourceKind::Surface => "surface",
            ResourceKind::SwapChain => "swap chain",
        };
        f.write_str(name)
    }
}

/// Why a create call failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationFailure {
    /// The descriptor itself is malformed (zero size, mismatched extents, ...)
    InvalidDesc(String),
    OutOfDeviceMemory,
    /// Valid request the active backend cannot honor
    Unsupported(String),
}

impl fmt::Display for CreationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationFailure::InvalidDesc(reason) => write!(f, "invalid descriptor: {reason}"),
            CreationFailure::OutOfDeviceMemory => f.write_str("out of device memory"),
            CreationFailure::Unsupported(reason) => write!(f, "unsupported: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// No adapter or driver for the requested backend, or backend not built in
    BackendUnavailable { backend: BackendKind, reason: String },
    /// Driver present but device initialization failed
    BackendInit { backend: BackendKind, reason: String },
    ResourceCreation { kind: ResourceKind, reason: CreationFailure },
    InvalidUsage(String),
    /// Write past the requested buffer size; nothing was written
    BufferOverflow { offset: u64, len: u64, size: u64 },
    Submission(String),
    SurfaceLost,
    Timeout,
    /// The swap chain was invalidated by surface loss or resize and must be recreated
    StaleSwapChain,
    /// Rejected by runtime validation (only raised when validation is enabled)
    Validation(String),
    /// Fatal. Every later call on the device returns the same error.
    DeviceLost(String),
    DeviceDestroyed,
    /// The device was destroyed while these resources were still alive
    ResourceLeak { outstanding: Vec<String> },
}

pub type RhiResult<T> = Result<T, RhiError>;

impl RhiError {
    pub fn invalid_desc(kind: ResourceKind, reason: impl Into<String>) -> Self {
        RhiError::ResourceCreation {
            kind,
            reason: CreationFailure::InvalidDesc(reason.into()),
        }
    }

    pub fn unsupported(kind: ResourceKind, reason: impl Into<String>) -> Self {
        RhiError::ResourceCreation {
            kind,
            reason: CreationFailure::Unsupported(reason.into()),
        }
    }

    pub fn out_of_memory(kind: ResourceKind) -> Self {
        RhiError::ResourceCreation {
            kind,
            reason: CreationFailure::OutOfDeviceMemory,
        }
    }

    /// True for errors after which the device can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, RhiError::DeviceLost(_) | RhiError::DeviceDestroyed)
    }
}

impl fmt::Display for RhiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RhiError::BackendUnavailable { backend, reason } => {
                write!(f, "{backend} backend unavailable: {reason}")
            }
            RhiError::BackendInit { backend, reason } => {
                write!(f, "{backend} backend failed to initialize: {reason}")
            }
            RhiError::ResourceCreation { kind, reason } => {
                write!(f, "failed to create {kind}: {reason}")
            }
            RhiError::InvalidUsage(msg) => write!(f, "invalid usage: {msg}"),
            RhiError::BufferOverflow { offset, len, size } => write!(
                f,
                "write of {len} bytes at offset {offset} overflows buffer of {size} bytes"
            ),
            RhiError::Submission(msg) => write!(f, "submission error: {msg}"),
            RhiError::SurfaceLost => f.write_str("surface lost"),
            RhiError::Timeout => f.write_str("timed out"),
            RhiError::StaleSwapChain => f.write_str("swap chain is stale and must be recreated"),
            RhiError::Validation(msg) => write!(f, "validation error: {msg}"),
            RhiError::DeviceLost(reason) => write!(f, "device lost: {reason}"),
            RhiError::DeviceDestroyed => f.write_str("device has been destroyed"),
            RhiError::ResourceLeak { outstanding } => write!(
                f,
                "device destroyed with {} live resource(s): {}",
                outstanding.len(),
                outstanding.join(", ")
            ),
        }
    }
}

impl std::error::Error for RhiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failing_resource() {
        let err = RhiError::unsupported(ResourceKind::Shader, "MSL source on Vulkan");
        assert_eq!(
            err.to_string(),
            "failed to create shader: unsupported: MSL source on Vulkan"
        );
    }

    #[test]
    fn only_device_loss_and_destruction_are_fatal() {
        assert!(RhiError::DeviceLost("hang".into()).is_fatal());
        assert!(RhiError::DeviceDestroyed.is_fatal());
        assert!(!RhiError::Timeout.is_fatal());
        assert!(!RhiError::SurfaceLost.is_fatal());
    }
}
