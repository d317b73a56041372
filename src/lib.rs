//! One GPU API over Vulkan, Metal, WebGPU and a CPU reference backend.
//!
//! Create a [`GraphicsDevice`], build resources through it, record work into
//! a [`CommandBuffer`], submit, and present through the device's
//! [`SwapChain`]. The `scene` module is a small consumer that keeps a light
//! list in a uniform buffer.

pub mod backend;
pub mod config;
pub mod logging;
pub mod rhi;
pub mod scene;

pub use rhi::*;
