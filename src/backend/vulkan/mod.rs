// Vulkan backend
//
// Explicit API through ash, memory through gpu-allocator, presentation
// through ash-window surfaces. Rendering uses Vulkan 1.3 dynamic rendering.
// One graphics queue serves every queue type.

mod context;
mod conv;
mod encoder;
mod pipeline;
mod resources;
mod swapchain;

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

pub use context::VulkanContext;
use encoder::Submitter;
use resources::{
    VulkanBuffer, VulkanDescriptorSet, VulkanFramebuffer, VulkanSampler, VulkanSemaphore,
    VulkanShader, VulkanTexture,
};
use swapchain::{VulkanSurface, VulkanSwapChain};

use crate::rhi::device::DeviceDesc;
use crate::rhi::hal::*;
use crate::rhi::resource::{DescriptorSetDesc, FramebufferDesc, PipelineDesc};
use crate::rhi::surface::WindowTarget;
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiResult};

pub struct VulkanDevice {
    // Dropped before the context it records into
    submitter: Submitter,
    ctx: Arc<VulkanContext>,
    info: DeviceInfo,
    caps: Capabilities,
}

impl VulkanDevice {
    pub fn new(desc: &DeviceDesc) -> RhiResult<Self> {
        let ctx = Arc::new(VulkanContext::new(&desc.app_name, desc.validation)?);
        let submitter = Submitter::new(&ctx)?;
        let caps = capabilities(&ctx);
        let info = DeviceInfo {
            name: ctx.device_name(),
            backend: BackendKind::Vulkan,
            api_version: format!(
                "{}.{}.{}",
                vk::api_version_major(ctx.properties.api_version),
                vk::api_version_minor(ctx.properties.api_version),
                vk::api_version_patch(ctx.properties.api_version)
            ),
            device_memory: ctx.device_memory(),
        };
        log::debug!(
            "Vulkan limits: 2D textures up to {}, {} color attachments, {} push constant bytes",
            caps.max_texture_dimension_2d,
            caps.max_color_attachments,
            caps.max_push_constant_size
        );

        Ok(Self {
            submitter,
            ctx,
            info,
            caps,
        })
    }
}

fn capabilities(ctx: &VulkanContext) -> Capabilities {
    let limits = &ctx.properties.limits;
    let formats = Format::ALL
        .into_iter()
        .filter_map(|format| {
            let props = unsafe {
                ctx.instance
                    .get_physical_device_format_properties(ctx.physical_device, conv::format(format))
            };
            let usage = conv::format_features_to_usage(props.optimal_tiling_features);
            (!usage.is_empty()).then_some(FormatSupport { format, usage })
        })
        .collect();

    let mut queues = vec![QueueType::Graphics, QueueType::Transfer];
    if ctx.compute_capable {
        queues.push(QueueType::Compute);
    }

    Capabilities {
        max_buffer_size: ctx.device_memory().max(u64::from(limits.max_storage_buffer_range)),
        max_texture_dimension_2d: limits.max_image_dimension2_d,
        max_uniform_buffer_range: limits.max_uniform_buffer_range,
        max_push_constant_size: limits.max_push_constants_size,
        max_color_attachments: limits.max_color_attachments,
        max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
        supports_compute: ctx.compute_capable,
        supports_readback: true,
        validation: ctx.validation,
        shader_sources: vec![ShaderSourceKind::SpirV],
        formats,
        queues,
    }
}

impl DeviceBackend for VulkanDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Box<dyn BufferBackend>> {
        Ok(Box::new(VulkanBuffer::new(&self.ctx, desc)?))
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<Box<dyn TextureBackend>> {
        Ok(Box::new(VulkanTexture::new(&self.ctx, desc)?))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<Box<dyn SamplerBackend>> {
        Ok(Box::new(VulkanSampler::new(&self.ctx, desc)?))
    }

    fn create_shader(&self, desc: &ShaderDesc) -> RhiResult<Box<dyn ShaderBackend>> {
        Ok(Box::new(VulkanShader::new(&self.ctx, desc)?))
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<Box<dyn PipelineBackend>> {
        Ok(Box::new(pipeline::create_pipeline(&self.ctx, desc)?))
    }

    fn create_framebuffer(
        &self,
        desc: &FramebufferDesc,
    ) -> RhiResult<Box<dyn FramebufferBackend>> {
        for texture in desc.attachments() {
            downcast::<VulkanTexture>(texture.raw().as_any(), ResourceKind::Texture)?;
        }
        Ok(Box::new(VulkanFramebuffer))
    }

    fn create_descriptor_set(
        &self,
        desc: &DescriptorSetDesc,
    ) -> RhiResult<Box<dyn DescriptorSetBackend>> {
        Ok(Box::new(VulkanDescriptorSet::new(&self.ctx, &desc.layout)?))
    }

    fn create_semaphore(&self) -> RhiResult<Box<dyn SemaphoreBackend>> {
        Ok(Box::new(VulkanSemaphore::new(&self.ctx)?))
    }

    fn create_surface(&self, target: &WindowTarget) -> RhiResult<Arc<dyn SurfaceBackend>> {
        Ok(Arc::new(VulkanSurface::new(&self.ctx, target)?))
    }

    fn create_swap_chain(
        &self,
        surface: &Arc<dyn SurfaceBackend>,
        desc: &SwapChainDesc,
        old: Option<&dyn SwapChainBackend>,
    ) -> RhiResult<Box<dyn SwapChainBackend>> {
        Ok(Box::new(VulkanSwapChain::new(&self.ctx, surface, desc, old)?))
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        self.submitter.submit(submission)
    }

    fn poll(&self) -> RhiResult<SubmissionIndex> {
        self.submitter.poll()
    }

    fn wait(&self, index: SubmissionIndex, timeout: Duration) -> RhiResult<bool> {
        self.submitter.wait(index, timeout)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.submitter.wait_idle()
    }
}
