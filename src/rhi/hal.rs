// Backend capability traits
//
// One trait per resource kind, implemented once per backend. The frontend
// (`GraphicsDevice` and the handle types) owns validation, lifetime and
// bookkeeping; backends only talk to their native API.
//
// Backends receive frontend handles inside commands and descriptors and
// downcast the raw objects back to their own concrete types with `as_any`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use super::command::Command;
use super::error::{ResourceKind, RhiError, RhiResult};
use super::resource::{Buffer, DescriptorSetDesc, FramebufferDesc, PipelineDesc, Sampler, Texture};
use super::surface::WindowTarget;
use super::types::*;

/// Type-erased native object owned by one backend
pub trait BackendObject: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> BackendObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Recover a backend's concrete type from a raw object, rejecting objects
/// created by a different backend.
pub fn downcast<T: Any>(raw: &dyn Any, kind: ResourceKind) -> RhiResult<&T> {
    raw.downcast_ref::<T>().ok_or_else(|| {
        RhiError::InvalidUsage(format!("{kind} was created by a different backend"))
    })
}

pub trait DeviceBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;
    fn info(&self) -> DeviceInfo;
    fn capabilities(&self) -> &Capabilities;

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Box<dyn BufferBackend>>;
    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<Box<dyn TextureBackend>>;
    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<Box<dyn SamplerBackend>>;
    fn create_shader(&self, desc: &ShaderDesc) -> RhiResult<Box<dyn ShaderBackend>>;
    fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<Box<dyn PipelineBackend>>;
    fn create_framebuffer(&self, desc: &FramebufferDesc)
        -> RhiResult<Box<dyn FramebufferBackend>>;
    fn create_descriptor_set(
        &self,
        desc: &DescriptorSetDesc,
    ) -> RhiResult<Box<dyn DescriptorSetBackend>>;
    fn create_semaphore(&self) -> RhiResult<Box<dyn SemaphoreBackend>>;

    /// Wrap a native window. Offscreen targets never reach the backend.
    fn create_surface(&self, target: &WindowTarget) -> RhiResult<Arc<dyn SurfaceBackend>>;

    /// Build a swap chain on `surface`. `old` is the chain being replaced, if any.
    fn create_swap_chain(
        &self,
        surface: &Arc<dyn SurfaceBackend>,
        desc: &SwapChainDesc,
        old: Option<&dyn SwapChainBackend>,
    ) -> RhiResult<Box<dyn SwapChainBackend>>;

    /// Queue work without blocking. Commands execute in the given order.
    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()>;

    /// Highest submission index known to have completed
    fn poll(&self) -> RhiResult<SubmissionIndex>;

    /// Block until `index` completes or `timeout` elapses. Returns whether it completed.
    fn wait(&self, index: SubmissionIndex, timeout: Duration) -> RhiResult<bool>;

    fn wait_idle(&self) -> RhiResult<()>;
}

/// A batch of recorded commands headed for one queue
pub struct Submission<'a> {
    pub index: SubmissionIndex,
    pub queue: QueueType,
    pub commands: &'a [Command],
    pub wait: &'a [&'a (dyn SemaphoreBackend + 'static)],
    pub signal: &'a [&'a (dyn SemaphoreBackend + 'static)],
}

pub trait BufferBackend: BackendObject {
    /// Mapped write. Only called for host-visible memory and in-bounds ranges.
    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()>;
    /// Mapped read. Only called for host-visible memory and in-bounds ranges.
    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()>;
}

pub trait TextureBackend: BackendObject {}

pub trait SamplerBackend: BackendObject {}

pub trait ShaderBackend: BackendObject {}

pub trait PipelineBackend: BackendObject {}

pub trait FramebufferBackend: BackendObject {}

pub trait SemaphoreBackend: BackendObject {}

pub trait DescriptorSetBackend: BackendObject {
    fn write_buffer(&self, binding: &DescriptorBinding, buffer: &Buffer) -> RhiResult<()>;
    fn write_texture(
        &self,
        binding: &DescriptorBinding,
        texture: &Texture,
        sampler: &Sampler,
    ) -> RhiResult<()>;
}

pub trait SurfaceBackend: BackendObject {}

pub trait SwapChainBackend: BackendObject {
    fn format(&self) -> Format;
    fn extent(&self) -> (u32, u32);
    fn image_usage(&self) -> TextureUsage;
    /// Most images the application may hold at once
    fn max_acquired(&self) -> u32;
    /// Hand over the presentable images. Called exactly once, right after creation.
    fn take_images(&self) -> RhiResult<Vec<Box<dyn TextureBackend>>>;
    /// Returns (image index, suboptimal). `signal` fires when the image is ready.
    fn acquire(&self, timeout: Duration, signal: &dyn SemaphoreBackend) -> RhiResult<(u32, bool)>;
    /// Returns whether the surface reported itself suboptimal.
    fn present(&self, index: u32, wait: &[&dyn SemaphoreBackend]) -> RhiResult<bool>;
}
