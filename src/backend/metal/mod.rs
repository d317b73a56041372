// Metal backend
//
// Native driver API on Apple platforms through metal-rs. Everything runs on
// one command queue; Metal executes its command buffers in commit order, so
// semaphores carry no information and completion is read from each command
// buffer's status.

mod conv;
mod encoder;
mod pipeline;
mod resources;
mod swapchain;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metal::MTLCommandBufferStatus;
use parking_lot::Mutex;

use encoder::{Encoder, MAX_PUSH_CONSTANT_SIZE};
pub use resources::{BUFFER_SLOT_OFFSET, PUSH_CONSTANT_SLOT};
use resources::{
    MetalBuffer, MetalDescriptorSet, MetalFramebuffer, MetalSampler, MetalSemaphore, MetalShader,
    MetalTexture,
};
use swapchain::{MetalSurface, MetalSwapChain};

use crate::rhi::device::DeviceDesc;
use crate::rhi::hal::*;
use crate::rhi::resource::{DescriptorSetDesc, FramebufferDesc, PipelineDesc};
use crate::rhi::surface::WindowTarget;
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

const POLL_INTERVAL: Duration = Duration::from_micros(200);

pub struct MetalDevice {
    device: metal::Device,
    queue: metal::CommandQueue,
    info: DeviceInfo,
    caps: Capabilities,
    in_flight: Mutex<VecDeque<(SubmissionIndex, metal::CommandBuffer)>>,
    completed: AtomicU64,
}

impl MetalDevice {
    pub fn new(desc: &DeviceDesc) -> RhiResult<Self> {
        let device = metal::Device::system_default().ok_or_else(|| RhiError::BackendUnavailable {
            backend: BackendKind::Metal,
            reason: "no Metal device found".into(),
        })?;
        let queue = device.new_command_queue();
        queue.set_label(&desc.app_name);

        log::info!("Selected Metal device: {}", device.name());
        log::info!(
            "  Recommended working set: {} MB",
            device.recommended_max_working_set_size() / (1024 * 1024)
        );
        log::info!(
            "  Unified memory: {}",
            if device.has_unified_memory() { "Yes" } else { "No" }
        );
        if desc.validation {
            log::debug!("Metal validation is controlled by MTL_DEBUG_LAYER, not by the RHI");
        }

        let caps = capabilities(&device, desc.validation);
        let info = DeviceInfo {
            name: device.name().to_string(),
            backend: BackendKind::Metal,
            api_version: "Metal".to_string(),
            device_memory: device.recommended_max_working_set_size(),
        };
        Ok(Self {
            device,
            queue,
            info,
            caps,
            in_flight: Mutex::new(VecDeque::new()),
            completed: AtomicU64::new(0),
        })
    }

    fn completed(&self) -> SubmissionIndex {
        SubmissionIndex(self.completed.load(Ordering::Acquire))
    }

    /// Retire finished command buffers in order
    fn retire(&self) -> RhiResult<SubmissionIndex> {
        let mut in_flight = self.in_flight.lock();
        while let Some((index, command_buffer)) = in_flight.front() {
            match command_buffer.status() {
                MTLCommandBufferStatus::Completed => {
                    self.completed.fetch_max(index.0, Ordering::AcqRel);
                    in_flight.pop_front();
                }
                MTLCommandBufferStatus::Error => {
                    let index = *index;
                    in_flight.pop_front();
                    // The buffer is done either way; later waits must not hang on it
                    self.completed.fetch_max(index.0, Ordering::AcqRel);
                    return Err(RhiError::Submission(format!(
                        "Metal command buffer for submission {} failed",
                        index.0
                    )));
                }
                _ => break,
            }
        }
        Ok(self.completed())
    }
}

fn capabilities(device: &metal::Device, validation: bool) -> Capabilities {
    let color = TextureUsage::SAMPLED
        | TextureUsage::STORAGE
        | TextureUsage::COLOR_ATTACHMENT
        | TextureUsage::TRANSFER_SRC
        | TextureUsage::TRANSFER_DST;
    let depth = TextureUsage::SAMPLED
        | TextureUsage::DEPTH_STENCIL_ATTACHMENT
        | TextureUsage::TRANSFER_SRC
        | TextureUsage::TRANSFER_DST;
    let formats = Format::ALL
        .into_iter()
        .filter(|format| *format != Format::D24UnormS8Uint || device.d24_s8_supported())
        .map(|format| {
            let usage = if format.is_depth() {
                depth
            } else if format.is_srgb() {
                color - TextureUsage::STORAGE
            } else {
                color
            };
            FormatSupport { format, usage }
        })
        .collect();

    Capabilities {
        max_buffer_size: device.max_buffer_length(),
        max_texture_dimension_2d: 16384,
        max_uniform_buffer_range: 64 * 1024,
        max_push_constant_size: MAX_PUSH_CONSTANT_SIZE as u32,
        max_color_attachments: 8,
        max_bound_descriptor_sets: 4,
        supports_compute: true,
        supports_readback: true,
        validation,
        shader_sources: vec![ShaderSourceKind::Msl],
        formats,
        queues: vec![QueueType::Graphics, QueueType::Compute, QueueType::Transfer],
    }
}

impl DeviceBackend for MetalDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Metal
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Box<dyn BufferBackend>> {
        Ok(Box::new(MetalBuffer::new(&self.device, desc)?))
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<Box<dyn TextureBackend>> {
        Ok(Box::new(MetalTexture::new(&self.device, desc)?))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<Box<dyn SamplerBackend>> {
        Ok(Box::new(MetalSampler::new(&self.device, desc)?))
    }

    fn create_shader(&self, desc: &ShaderDesc) -> RhiResult<Box<dyn ShaderBackend>> {
        Ok(Box::new(MetalShader::new(&self.device, desc)?))
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<Box<dyn PipelineBackend>> {
        Ok(Box::new(pipeline::create_pipeline(&self.device, desc)?))
    }

    fn create_framebuffer(
        &self,
        desc: &FramebufferDesc,
    ) -> RhiResult<Box<dyn FramebufferBackend>> {
        for texture in desc.attachments() {
            downcast::<MetalTexture>(texture.raw().as_any(), ResourceKind::Texture)?;
        }
        Ok(Box::new(MetalFramebuffer))
    }

    fn create_descriptor_set(
        &self,
        desc: &DescriptorSetDesc,
    ) -> RhiResult<Box<dyn DescriptorSetBackend>> {
        Ok(Box::new(MetalDescriptorSet::new(&desc.layout)?))
    }

    fn create_semaphore(&self) -> RhiResult<Box<dyn SemaphoreBackend>> {
        Ok(Box::new(MetalSemaphore))
    }

    fn create_surface(&self, target: &WindowTarget) -> RhiResult<Arc<dyn SurfaceBackend>> {
        Ok(Arc::new(MetalSurface::new(&self.device, target)?))
    }

    fn create_swap_chain(
        &self,
        surface: &Arc<dyn SurfaceBackend>,
        desc: &SwapChainDesc,
        _old: Option<&dyn SwapChainBackend>,
    ) -> RhiResult<Box<dyn SwapChainBackend>> {
        Ok(Box::new(MetalSwapChain::new(
            &self.device,
            &self.queue,
            surface,
            desc,
        )?))
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let mut encoder = Encoder::new(&self.queue);
        for command in submission.commands {
            encoder.encode(command)?;
        }
        let command_buffer = encoder.finish();
        command_buffer.commit();
        self.in_flight
            .lock()
            .push_back((submission.index, command_buffer));
        Ok(())
    }

    fn poll(&self) -> RhiResult<SubmissionIndex> {
        self.retire()
    }

    fn wait(&self, index: SubmissionIndex, timeout: Duration) -> RhiResult<bool> {
        let start = Instant::now();
        loop {
            if self.retire()? >= index {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        // The queue is in order: once an empty buffer finishes, so has everything before it
        let command_buffer = self.queue.new_command_buffer();
        command_buffer.commit();
        command_buffer.wait_until_completed();
        self.retire().map(|_| ())
    }
}
