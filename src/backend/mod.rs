// Backend implementations
//
// One module per native API, each implementing the `rhi::hal` traits.
// Native backends are behind cargo features; the headless backend is always
// available.

pub mod headless;

#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(feature = "webgpu")]
pub mod webgpu;

#[cfg(all(feature = "metal", target_os = "macos"))]
pub mod metal;

pub use headless::HeadlessOptions;

use crate::rhi::device::DeviceDesc;
use crate::rhi::hal::DeviceBackend;
use crate::rhi::{BackendKind, RhiError, RhiResult};

/// Initialize the requested backend. Never falls back to another one.
pub(crate) fn create(kind: BackendKind, desc: &DeviceDesc) -> RhiResult<Box<dyn DeviceBackend>> {
    if !kind.is_compiled_in() {
        return Err(RhiError::BackendUnavailable {
            backend: kind,
            reason: "support for this backend is not compiled in on this platform".into(),
        });
    }
    match kind {
        BackendKind::Headless => Ok(Box::new(headless::HeadlessDevice::new(desc))),
        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => Ok(Box::new(vulkan::VulkanDevice::new(desc)?)),
        #[cfg(feature = "webgpu")]
        BackendKind::WebGpu => Ok(Box::new(webgpu::WebGpuDevice::new(desc)?)),
        #[cfg(all(feature = "metal", target_os = "macos"))]
        BackendKind::Metal => Ok(Box::new(metal::MetalDevice::new(desc)?)),
        #[allow(unreachable_patterns)]
        other => Err(RhiError::BackendUnavailable {
            backend: other,
            reason: "support for this backend is not compiled in on this platform".into(),
        }),
    }
}
