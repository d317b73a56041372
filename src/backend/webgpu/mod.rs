// WebGPU backend
//
// Sandboxed API through wgpu on a native adapter, via wgpu's own Vulkan,
// Metal or DX12 path. Validation errors arrive asynchronously in WebGPU, so
// every creation call runs inside an error scope and is reported back
// synchronously. Browser targets are refused: they cannot block on a promise.

mod conv;
mod encoder;
mod pipeline;
mod resources;
mod swapchain;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use encoder::Encoder;
pub use resources::SAMPLER_BINDING_OFFSET;
use resources::{
    WebGpuBuffer, WebGpuDescriptorSet, WebGpuFramebuffer, WebGpuSampler, WebGpuSemaphore,
    WebGpuShader, WebGpuTexture,
};
use swapchain::{WebGpuSurface, WebGpuSwapChain};

use crate::rhi::device::DeviceDesc;
use crate::rhi::hal::*;
use crate::rhi::resource::{DescriptorSetDesc, FramebufferDesc, PipelineDesc};
use crate::rhi::surface::WindowTarget;
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

/// Optional features used when the adapter has them
fn wanted_features() -> wgpu::Features {
    wgpu::Features::PUSH_CONSTANTS
        | wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER
        | wgpu::Features::POLYGON_MODE_LINE
        | wgpu::Features::POLYGON_MODE_POINT
        | wgpu::Features::DEPTH32FLOAT_STENCIL8
}

/// Run a wgpu creation call inside error scopes and turn captured errors
/// into creation failures
pub(crate) fn scoped<T>(
    device: &wgpu::Device,
    kind: ResourceKind,
    create: impl FnOnce() -> T,
) -> RhiResult<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());

    if out_of_memory.is_some() {
        return Err(RhiError::out_of_memory(kind));
    }
    if let Some(err) = validation {
        log::error!("wgpu rejected {}: {}", kind, err);
        return Err(RhiError::unsupported(kind, err.to_string()));
    }
    Ok(value)
}

pub(crate) fn poll_error(err: wgpu::PollError) -> RhiError {
    match err {
        wgpu::PollError::Timeout => RhiError::Timeout,
        other => RhiError::Submission(other.to_string()),
    }
}

pub struct WebGpuDevice {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    info: DeviceInfo,
    caps: Capabilities,
    completed: Arc<AtomicU64>,
    lost: Arc<Mutex<Option<String>>>,
}

impl WebGpuDevice {
    pub fn new(desc: &DeviceDesc) -> RhiResult<Self> {
        if cfg!(target_arch = "wasm32") {
            return Err(RhiError::BackendUnavailable {
                backend: BackendKind::WebGpu,
                reason: "browser targets cannot block on device creation or submission".into(),
            });
        }
        let init_error = |reason: String| RhiError::BackendInit {
            backend: BackendKind::WebGpu,
            reason,
        };

        let flags = if desc.validation {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| RhiError::BackendUnavailable {
            backend: BackendKind::WebGpu,
            reason: e.to_string(),
        })?;
        let adapter_info = adapter.get_info();
        log::info!(
            "Selected WebGPU adapter: {} ({:?}, {})",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.driver
        );

        let features = adapter.features() & wanted_features();
        let mut limits = wgpu::Limits::default().using_resolution(adapter.limits());
        if features.contains(wgpu::Features::PUSH_CONSTANTS) {
            limits.max_push_constant_size = adapter.limits().max_push_constant_size.min(256);
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some(&desc.app_name),
            required_features: features,
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| init_error(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("Uncaptured wgpu error: {}", error);
        }));
        let lost = Arc::new(Mutex::new(None));
        {
            let lost = Arc::clone(&lost);
            device.set_device_lost_callback(move |reason, message| {
                log::error!("WebGPU device lost ({:?}): {}", reason, message);
                *lost.lock() = Some(message);
            });
        }

        let caps = capabilities(&adapter, features, &limits, desc.validation);
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: BackendKind::WebGpu,
            api_version: format!("wgpu ({:?})", adapter_info.backend),
            device_memory: 0,
        };

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            features,
            info,
            caps,
            completed: Arc::new(AtomicU64::new(0)),
            lost,
        })
    }

    fn check_lost(&self) -> RhiResult<()> {
        match &*self.lost.lock() {
            Some(reason) => Err(RhiError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn completed(&self) -> SubmissionIndex {
        SubmissionIndex(self.completed.load(Ordering::Acquire))
    }
}

fn capabilities(
    adapter: &wgpu::Adapter,
    features: wgpu::Features,
    limits: &wgpu::Limits,
    validation: bool,
) -> Capabilities {
    let formats = Format::ALL
        .into_iter()
        .filter(|format| {
            *format != Format::D32SfloatS8Uint
                || features.contains(wgpu::Features::DEPTH32FLOAT_STENCIL8)
        })
        .filter_map(|format| {
            let allowed = adapter
                .get_texture_format_features(conv::format(format))
                .allowed_usages;
            let usage = conv::allowed_usage(format, allowed);
            (!usage.is_empty()).then_some(FormatSupport { format, usage })
        })
        .collect();

    let compute = adapter
        .get_downlevel_capabilities()
        .flags
        .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
    let mut queues = vec![QueueType::Graphics, QueueType::Transfer];
    if compute {
        queues.push(QueueType::Compute);
    }

    Capabilities {
        max_buffer_size: limits.max_buffer_size,
        max_texture_dimension_2d: limits.max_texture_dimension_2d,
        max_uniform_buffer_range: limits.max_uniform_buffer_binding_size,
        max_push_constant_size: if features.contains(wgpu::Features::PUSH_CONSTANTS) {
            limits.max_push_constant_size
        } else {
            0
        },
        max_color_attachments: limits.max_color_attachments,
        max_bound_descriptor_sets: limits.max_bind_groups,
        supports_compute: compute,
        supports_readback: true,
        validation,
        shader_sources: vec![ShaderSourceKind::Wgsl, ShaderSourceKind::SpirV],
        formats,
        queues,
    }
}

impl DeviceBackend for WebGpuDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::WebGpu
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Box<dyn BufferBackend>> {
        Ok(Box::new(WebGpuBuffer::new(&self.device, &self.queue, desc)?))
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<Box<dyn TextureBackend>> {
        Ok(Box::new(WebGpuTexture::new(&self.device, desc)?))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<Box<dyn SamplerBackend>> {
        Ok(Box::new(WebGpuSampler::new(&self.device, self.features, desc)?))
    }

    fn create_shader(&self, desc: &ShaderDesc) -> RhiResult<Box<dyn ShaderBackend>> {
        Ok(Box::new(WebGpuShader::new(&self.device, desc)?))
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<Box<dyn PipelineBackend>> {
        Ok(Box::new(pipeline::create_pipeline(
            &self.device,
            self.features,
            desc,
        )?))
    }

    fn create_framebuffer(
        &self,
        desc: &FramebufferDesc,
    ) -> RhiResult<Box<dyn FramebufferBackend>> {
        for texture in desc.attachments() {
            downcast::<WebGpuTexture>(texture.raw().as_any(), ResourceKind::Texture)?;
        }
        Ok(Box::new(WebGpuFramebuffer))
    }

    fn create_descriptor_set(
        &self,
        desc: &DescriptorSetDesc,
    ) -> RhiResult<Box<dyn DescriptorSetBackend>> {
        Ok(Box::new(WebGpuDescriptorSet::new(&self.device, &desc.layout)?))
    }

    fn create_semaphore(&self) -> RhiResult<Box<dyn SemaphoreBackend>> {
        Ok(Box::new(WebGpuSemaphore))
    }

    fn create_surface(&self, target: &WindowTarget) -> RhiResult<Arc<dyn SurfaceBackend>> {
        Ok(Arc::new(WebGpuSurface::new(&self.instance, target)?))
    }

    fn create_swap_chain(
        &self,
        surface: &Arc<dyn SurfaceBackend>,
        desc: &SwapChainDesc,
        _old: Option<&dyn SwapChainBackend>,
    ) -> RhiResult<Box<dyn SwapChainBackend>> {
        Ok(Box::new(WebGpuSwapChain::new(
            &self.adapter,
            &self.device,
            &self.queue,
            surface,
            desc,
        )?))
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        self.check_lost()?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = Encoder::new(&self.device);
        let encoded = submission
            .commands
            .iter()
            .try_for_each(|command| encoder.encode(command));
        let commands = encoder.finish();
        if encoded.is_ok() {
            self.queue.submit([commands]);
        }
        let scope = pollster::block_on(self.device.pop_error_scope());
        encoded?;
        if let Some(err) = scope {
            return Err(RhiError::Submission(err.to_string()));
        }

        let completed = Arc::clone(&self.completed);
        let index = submission.index.0;
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(index, Ordering::AcqRel);
        });
        Ok(())
    }

    fn poll(&self) -> RhiResult<SubmissionIndex> {
        self.check_lost()?;
        self.device.poll(wgpu::PollType::Poll).map_err(poll_error)?;
        Ok(self.completed())
    }

    fn wait(&self, index: SubmissionIndex, timeout: Duration) -> RhiResult<bool> {
        self.check_lost()?;
        if self.completed() >= index {
            return Ok(true);
        }
        // wgpu cannot bound a wait by time; waiting drains the whole queue
        log::trace!("Waiting for submission {} (timeout {:?} not enforced)", index.0, timeout);
        self.device.poll(wgpu::PollType::Wait).map_err(poll_error)?;
        self.check_lost()?;
        Ok(self.completed() >= index)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.check_lost()?;
        self.device.poll(wgpu::PollType::Wait).map_err(poll_error)?;
        self.check_lost()
    }
}
