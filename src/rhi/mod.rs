// Render hardware interface
//
// Backend-independent frontend: handle types, validation, lifetime tracking
// and the presentation protocol. Native work is delegated to the traits in
// `hal`, implemented once per backend under `crate::backend`.

pub mod command;
pub mod device;
pub mod error;
pub mod hal;
mod offscreen;
pub mod resource;
pub mod surface;
pub mod swapchain;
pub mod sync;
mod tracker;
pub mod types;

pub use command::{Command, CommandBuffer, CommandBufferState};
pub use device::{DeviceDesc, GraphicsDevice, SubmitInfo};
pub use error::{CreationFailure, ResourceKind, RhiError, RhiResult};
pub use resource::{
    BoundResource, Buffer, ComputePipelineDesc, DescriptorSet, DescriptorSetDesc, Framebuffer,
    FramebufferDesc, GraphicsPipelineDesc, Pipeline, PipelineDesc, PipelineKind, Sampler, Shader,
    Texture,
};
pub use surface::{OffscreenTarget, SurfaceProvider, SurfaceTarget, WindowTarget};
pub use swapchain::{AcquiredImage, SwapChain};
pub use sync::Semaphore;
pub use types::*;
