// Graphics device
//
// Root owner of everything the RHI creates:
// - picks and initializes exactly one backend
// - validates descriptors before they reach the backend
// - numbers submissions and keeps their resources alive until they retire
// - owns the swap chain
// - audits live resources when destroyed

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::command::{Command, CommandBuffer, ResourceRef};
use super::error::{ResourceKind, RhiError, RhiResult};
use super::hal::{DeviceBackend, SemaphoreBackend, Submission};
use super::resource::*;
use super::surface::SurfaceProvider;
use super::swapchain::SwapChain;
use super::sync::{self, Semaphore};
use super::tracker::ResourceTracker;
use super::types::*;
use crate::backend::{self, HeadlessOptions};

/// How to build a device
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    /// `None` picks `BackendKind::platform_default()`
    pub backend: Option<BackendKind>,
    pub app_name: String,
    /// Enable debug layers and host-access hazard checks
    pub validation: bool,
    pub headless: HeadlessOptions,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            backend: None,
            app_name: "tri-rhi".to_string(),
            validation: cfg!(debug_assertions),
            headless: HeadlessOptions::default(),
        }
    }
}

impl DeviceDesc {
    pub fn with_backend(backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }
}

/// Semaphores a submission waits on before executing and signals when done
#[derive(Default, Clone, Copy)]
pub struct SubmitInfo<'a> {
    pub wait: &'a [&'a Semaphore],
    pub signal: &'a [&'a Semaphore],
}

#[derive(Debug, Clone)]
enum DeviceStatus {
    Active,
    Lost(String),
    Destroyed,
}

/// Work the GPU may still be reading; dropped once its index completes
struct InFlight {
    index: SubmissionIndex,
    _commands: Arc<Vec<Command>>,
}

#[derive(Default)]
struct QueueState {
    last_submitted: SubmissionIndex,
    in_flight: VecDeque<InFlight>,
}

/// State shared between a device and every handle it issued
pub(crate) struct DeviceShared {
    pub(crate) id: DeviceId,
    pub(crate) backend: Box<dyn DeviceBackend>,
    pub(crate) validation: bool,
    pub(crate) tracker: ResourceTracker,
    status: RwLock<DeviceStatus>,
    queue: Mutex<QueueState>,
    completed: AtomicU64,
}

impl DeviceShared {
    /// Fail fast once the device is lost or destroyed
    pub(crate) fn check(&self) -> RhiResult<()> {
        match &*self.status.read() {
            DeviceStatus::Active => Ok(()),
            DeviceStatus::Lost(reason) => Err(RhiError::DeviceLost(reason.clone())),
            DeviceStatus::Destroyed => Err(RhiError::DeviceDestroyed),
        }
    }

    /// Pass a backend result through, latching device loss
    pub(crate) fn observe<T>(&self, result: RhiResult<T>) -> RhiResult<T> {
        if let Err(RhiError::DeviceLost(reason)) = &result {
            let mut status = self.status.write();
            if matches!(*status, DeviceStatus::Active) {
                log::error!("{} lost: {}", self.id, reason);
                *status = DeviceStatus::Lost(reason.clone());
            }
        }
        result
    }

    pub(crate) fn completed_index(&self) -> SubmissionIndex {
        SubmissionIndex(self.completed.load(Ordering::Acquire))
    }

    pub(crate) fn last_submitted(&self) -> SubmissionIndex {
        self.queue.lock().last_submitted
    }

    fn mark_destroyed(&self) {
        *self.status.write() = DeviceStatus::Destroyed;
    }

    fn is_destroyed(&self) -> bool {
        matches!(*self.status.read(), DeviceStatus::Destroyed)
    }

    /// Forget every pending submission without waiting for it. Only valid
    /// once the GPU is idle or gone.
    fn abandon_in_flight(&self) {
        let pending: Vec<InFlight> = self.queue.lock().in_flight.drain(..).collect();
        if !pending.is_empty() {
            log::warn!("{} dropping {} unfinished submission(s)", self.id, pending.len());
        }
        drop(pending);
    }

    /// Queue `commands`, returning the submission index.
    pub(crate) fn submit_commands(
        &self,
        queue_type: QueueType,
        commands: Arc<Vec<Command>>,
        wait: &[&Semaphore],
        signal: &[&Semaphore],
    ) -> RhiResult<SubmissionIndex> {
        self.check()?;
        self.validate_commands(&commands)?;
        sync::check_semaphores(self.id, wait, signal)?;

        let raw_wait: Vec<&(dyn SemaphoreBackend + 'static)> =
            wait.iter().map(|s| s.raw()).collect();
        let raw_signal: Vec<&(dyn SemaphoreBackend + 'static)> =
            signal.iter().map(|s| s.raw()).collect();

        let mut queue = self.queue.lock();
        let index = queue.last_submitted.next();
        self.observe(self.backend.submit(&Submission {
            index,
            queue: queue_type,
            commands: &commands,
            wait: &raw_wait,
            signal: &raw_signal,
        }))?;
        queue.last_submitted = index;
        sync::commit_semaphores(wait, signal);
        mark_resources_used(&commands, index);
        queue.in_flight.push_back(InFlight {
            index,
            _commands: commands,
        });
        log::debug!("{} submission {} queued on {:?}", self.id, index.0, queue_type);
        Ok(index)
    }

    fn validate_commands(&self, commands: &[Command]) -> RhiResult<()> {
        let mut failure = None;
        for command in commands {
            command.for_each_resource(&mut |resource| {
                if failure.is_some() {
                    return;
                }
                failure = self.validate_resource(resource).err();
            });
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate_resource(&self, resource: ResourceRef<'_>) -> RhiResult<()> {
        let foreign = || {
            RhiError::Submission("command references a resource from a different device".into())
        };
        match resource {
            ResourceRef::Buffer(b) if b.device_id() != self.id => Err(foreign()),
            ResourceRef::Pipeline(p) if p.device_id() != self.id => Err(foreign()),
            ResourceRef::DescriptorSet(s) if s.device_id() != self.id => Err(foreign()),
            ResourceRef::DescriptorSet(s) => {
                for (_, bound) in s.bound_resources() {
                    let owner = match &bound {
                        BoundResource::Buffer(b) => b.device_id(),
                        BoundResource::Texture(t, _) => t.device_id(),
                    };
                    if owner != self.id {
                        return Err(foreign());
                    }
                }
                Ok(())
            }
            ResourceRef::Texture { texture, .. } if texture.device_id() != self.id => Err(foreign()),
            ResourceRef::Texture { texture, .. } if texture.is_retired() => Err(RhiError::Submission(
                "command references an image of a swap chain that has been recreated".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Refresh the completed index and release retired submissions
    pub(crate) fn poll(&self) -> RhiResult<SubmissionIndex> {
        self.check()?;
        let completed = self.observe(self.backend.poll())?;
        Ok(self.retire_up_to(completed))
    }

    pub(crate) fn wait(&self, index: SubmissionIndex, timeout: Duration) -> RhiResult<bool> {
        self.check()?;
        if index <= self.completed_index() {
            return Ok(true);
        }
        let done = self.observe(self.backend.wait(index, timeout))?;
        if done {
            self.retire_up_to(index);
        }
        Ok(done)
    }

    pub(crate) fn wait_idle(&self) -> RhiResult<()> {
        self.check()?;
        self.observe(self.backend.wait_idle())?;
        let last = self.last_submitted();
        self.retire_up_to(last);
        Ok(())
    }

    fn retire_up_to(&self, completed: SubmissionIndex) -> SubmissionIndex {
        let completed = SubmissionIndex(
            self.completed
                .fetch_max(completed.0, Ordering::AcqRel)
                .max(completed.0),
        );
        let retired: Vec<InFlight> = {
            let mut queue = self.queue.lock();
            let keep = queue
                .in_flight
                .iter()
                .position(|f| f.index > completed)
                .unwrap_or(queue.in_flight.len());
            queue.in_flight.drain(..keep).collect()
        };
        // Handles may release native objects; do it outside the queue lock
        drop(retired);
        completed
    }

    /// Fill part of a GPU-only buffer through a temporary upload buffer
    pub(crate) fn upload_via_staging(
        self: &Arc<Self>,
        dst: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> RhiResult<()> {
        let desc = BufferDesc::new(
            data.len() as u64,
            BufferUsage::TRANSFER_SRC,
            MemoryUsage::CpuToGpu,
        )
        .with_label("staging");
        let raw = self.observe(self.backend.create_buffer(&desc))?;
        let staging = Buffer::new(ResourceCommon::untracked(self), desc, raw);
        self.observe(staging.raw().write(0, data))?;

        let commands = Arc::new(vec![Command::CopyBuffer {
            src: staging,
            src_offset: 0,
            dst: dst.clone(),
            dst_offset: offset,
            size: data.len() as u64,
        }]);
        let index = self.submit_commands(QueueType::Graphics, commands, &[], &[])?;
        log::trace!(
            "staged {} byte upload into '{}' (submission {})",
            data.len(),
            dst.label().unwrap_or("unnamed"),
            index.0
        );
        Ok(())
    }
}

fn mark_resources_used(commands: &[Command], index: SubmissionIndex) {
    for command in commands {
        command.for_each_resource(&mut |resource| match resource {
            ResourceRef::Buffer(buffer) => buffer.mark_used(index),
            ResourceRef::Texture { texture, written } => {
                if written {
                    texture.mark_written(index);
                }
            }
            ResourceRef::DescriptorSet(set) => {
                set.mark_used(index);
                for (_, bound) in set.bound_resources() {
                    if let BoundResource::Buffer(buffer) = bound {
                        buffer.mark_used(index);
                    }
                }
            }
            ResourceRef::Pipeline(_) => {}
        });
    }
}

// =============================================================================
// GRAPHICS DEVICE
// =============================================================================

/// Factory and lifetime root for one backend instance.
///
/// Dropping the device waits for the GPU, retires the swap chain and logs any
/// resources still alive. `destroy` does the same but reports leaks as an error.
pub struct GraphicsDevice {
    shared: Arc<DeviceShared>,
    swap_chain: Mutex<Option<SwapChain>>,
}

impl GraphicsDevice {
    pub fn new(desc: &DeviceDesc) -> RhiResult<Self> {
        let kind = desc.backend.unwrap_or_else(BackendKind::platform_default);
        log::info!("Creating graphics device: {} ({})", desc.app_name, kind);

        let backend = backend::create(kind, desc)?;
        let info = backend.info();
        log::info!(
            "Selected adapter: {} [{} {}]",
            info.name,
            info.backend,
            info.api_version
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                id: DeviceId::next(),
                validation: desc.validation,
                backend,
                tracker: ResourceTracker::default(),
                status: RwLock::new(DeviceStatus::Active),
                queue: Mutex::new(QueueState::default()),
                completed: AtomicU64::new(0),
            }),
            swap_chain: Mutex::new(None),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    pub fn backend(&self) -> BackendKind {
        self.shared.backend.kind()
    }

    pub fn info(&self) -> DeviceInfo {
        self.shared.backend.info()
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.shared.backend.capabilities()
    }

    /// Number of tracked resources still alive
    pub fn live_resource_count(&self) -> usize {
        self.shared.tracker.live_count()
    }

    /// Descriptions of tracked resources still alive
    pub fn live_resources(&self) -> Vec<String> {
        self.shared.tracker.outstanding()
    }

    // -------------------------------------------------------------------------
    // Resource creation
    // -------------------------------------------------------------------------

    pub fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Buffer> {
        self.shared.check()?;
        let caps = self.capabilities();
        if desc.size == 0 {
            return Err(RhiError::invalid_desc(ResourceKind::Buffer, "size must be non-zero"));
        }
        if desc.usage.is_empty() {
            return Err(RhiError::invalid_desc(ResourceKind::Buffer, "usage must not be empty"));
        }
        if desc.size > caps.max_buffer_size {
            return Err(RhiError::unsupported(
                ResourceKind::Buffer,
                format!("{} bytes exceeds max buffer size {}", desc.size, caps.max_buffer_size),
            ));
        }
        if desc.memory == MemoryUsage::GpuToCpu && !caps.supports_readback {
            return Err(RhiError::unsupported(
                ResourceKind::Buffer,
                "host readback memory is not available",
            ));
        }
        let raw = self.shared.observe(self.shared.backend.create_buffer(desc))?;
        let common = ResourceCommon::tracked(&self.shared, ResourceKind::Buffer, desc.label.as_deref());
        Ok(Buffer::new(common, desc.clone(), raw))
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> RhiResult<Texture> {
        self.shared.check()?;
        validate_texture(desc, self.capabilities())?;
        let raw = self.shared.observe(self.shared.backend.create_texture(desc))?;
        let common = ResourceCommon::tracked(&self.shared, ResourceKind::Texture, desc.label.as_deref());
        Ok(Texture::new(common, desc.clone(), raw))
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<Sampler> {
        self.shared.check()?;
        if desc.min_lod > desc.max_lod {
            return Err(RhiError::invalid_desc(ResourceKind::Sampler, "min_lod exceeds max_lod"));
        }
        if desc.max_anisotropy.is_some_and(|a| a < 1.0) {
            return Err(RhiError::invalid_desc(
                ResourceKind::Sampler,
                "max_anisotropy must be at least 1",
            ));
        }
        let raw = self.shared.observe(self.shared.backend.create_sampler(desc))?;
        let common = ResourceCommon::tracked(&self.shared, ResourceKind::Sampler, desc.label.as_deref());
        Ok(Sampler::new(common, desc.clone(), raw))
    }

    pub fn create_shader(&self, desc: &ShaderDesc) -> RhiResult<Shader> {
        self.shared.check()?;
        let kind = desc.source.kind();
        if !self.capabilities().accepts_shader(kind) {
            return Err(RhiError::unsupported(
                ResourceKind::Shader,
                format!("{kind:?} shaders are not accepted by the {} backend", self.backend()),
            ));
        }
        if desc.entry_point.is_empty() {
            return Err(RhiError::invalid_desc(ResourceKind::Shader, "empty entry point"));
        }
        match &desc.source {
            ShaderSource::SpirV(words) if words.first() != Some(&SPIRV_MAGIC) => {
                return Err(RhiError::invalid_desc(
                    ResourceKind::Shader,
                    "SPIR-V module is missing the magic number",
                ))
            }
            ShaderSource::Msl(code) | ShaderSource::Wgsl(code) if code.trim().is_empty() => {
                return Err(RhiError::invalid_desc(ResourceKind::Shader, "empty shader source"))
            }
            _ => {}
        }
        let raw = self.shared.observe(self.shared.backend.create_shader(desc))?;
        let common = ResourceCommon::tracked(&self.shared, ResourceKind::Shader, desc.label.as_deref());
        Ok(Shader::new(common, desc.clone(), raw))
    }

    pub fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<Pipeline> {
        self.shared.check()?;
        self.validate_pipeline(desc)?;
        let raw = self.shared.observe(self.shared.backend.create_pipeline(desc))?;
        let common = ResourceCommon::tracked(&self.shared, ResourceKind::Pipeline, desc.label());
        Ok(Pipeline::new(common, desc.clone(), raw))
    }

    pub fn create_framebuffer(&self, desc: &FramebufferDesc) -> RhiResult<Framebuffer> {
        self.shared.check()?;
        let invalid = |msg: &str| RhiError::invalid_desc(ResourceKind::Framebuffer, msg);
        if desc.color_attachments.is_empty() && desc.depth_attachment.is_none() {
            return Err(invalid("framebuffer needs at least one attachment"));
        }
        if desc.color_attachments.len() as u32 > self.capabilities().max_color_attachments {
            return Err(invalid("too many color attachments"));
        }
        if desc.attachments().any(|t| t.device_id() != self.id()) {
            return Err(invalid("attachment belongs to a different device"));
        }
        if desc
            .color_attachments
            .iter()
            .any(|t| !t.usage().contains(TextureUsage::COLOR_ATTACHMENT))
        {
            return Err(invalid("color attachment lacks COLOR_ATTACHMENT usage"));
        }
        if let Some(depth) = &desc.depth_attachment {
            if !depth.format().is_depth()
                || !depth.usage().contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT)
            {
                return Err(invalid("depth attachment needs a depth format and DEPTH_STENCIL_ATTACHMENT usage"));
            }
        }
        let extent = desc
            .extent()
            .ok_or_else(|| invalid("attachments differ in size"))?;
        let raw = self.shared.observe(self.shared.backend.create_framebuffer(desc))?;
        let common =
            ResourceCommon::tracked(&self.shared, ResourceKind::Framebuffer, desc.label.as_deref());
        Ok(Framebuffer::new(common, desc.clone(), extent, raw))
    }

    pub fn create_descriptor_set(&self, desc: &DescriptorSetDesc) -> RhiResult<DescriptorSet> {
        self.shared.check()?;
        validate_layout(&desc.layout, ResourceKind::DescriptorSet)?;
        let raw = self.shared.observe(self.shared.backend.create_descriptor_set(desc))?;
        let common =
            ResourceCommon::tracked(&self.shared, ResourceKind::DescriptorSet, desc.label.as_deref());
        Ok(DescriptorSet::new(common, desc.clone(), raw))
    }

    pub fn create_semaphore(&self) -> RhiResult<Semaphore> {
        self.shared.check()?;
        let raw = self.shared.observe(self.shared.backend.create_semaphore())?;
        let common = ResourceCommon::tracked(&self.shared, ResourceKind::Semaphore, None);
        Ok(Semaphore::new(common, raw))
    }

    pub fn create_command_buffer(&self, queue: QueueType) -> RhiResult<CommandBuffer> {
        self.create_command_buffer_labeled(queue, None)
    }

    pub fn create_command_buffer_labeled(
        &self,
        queue: QueueType,
        label: Option<&str>,
    ) -> RhiResult<CommandBuffer> {
        self.shared.check()?;
        if !self.capabilities().supports_queue(queue) {
            return Err(RhiError::unsupported(
                ResourceKind::CommandBuffer,
                format!("{queue:?} queue is not available"),
            ));
        }
        let common = ResourceCommon::tracked(&self.shared, ResourceKind::CommandBuffer, label);
        Ok(CommandBuffer::new(common, queue, label.map(str::to_owned)))
    }

    fn validate_pipeline(&self, desc: &PipelineDesc) -> RhiResult<()> {
        let caps = self.capabilities();
        let invalid = |msg: String| RhiError::invalid_desc(ResourceKind::Pipeline, msg);

        for shader in desc.shaders() {
            if shader.device_id() != self.id() {
                return Err(invalid("shader belongs to a different device".into()));
            }
        }
        if desc.descriptor_layouts().len() as u32 > caps.max_bound_descriptor_sets {
            return Err(RhiError::unsupported(
                ResourceKind::Pipeline,
                format!(
                    "{} descriptor sets exceed the limit of {}",
                    desc.descriptor_layouts().len(),
                    caps.max_bound_descriptor_sets
                ),
            ));
        }
        for layout in desc.descriptor_layouts() {
            validate_layout(layout, ResourceKind::Pipeline)?;
        }
        if let Some(range) = desc.push_constants() {
            if range.size == 0 || range.size % 4 != 0 || range.offset % 4 != 0 {
                return Err(invalid("push constant range must be non-empty and 4-byte aligned".into()));
            }
            if range.offset + range.size > caps.max_push_constant_size {
                return Err(RhiError::unsupported(
                    ResourceKind::Pipeline,
                    format!(
                        "push constants of {} bytes exceed the limit of {}",
                        range.offset + range.size,
                        caps.max_push_constant_size
                    ),
                ));
            }
        }

        match desc {
            PipelineDesc::Graphics(g) => {
                if g.vertex_shader.stage() != ShaderStage::Vertex {
                    return Err(invalid("vertex shader has the wrong stage".into()));
                }
                if g.fragment_shader.as_ref().is_some_and(|s| s.stage() != ShaderStage::Fragment) {
                    return Err(invalid("fragment shader has the wrong stage".into()));
                }
                if g.color_targets.len() as u32 > caps.max_color_attachments {
                    return Err(invalid("too many color targets".into()));
                }
                for target in &g.color_targets {
                    if !caps.supports_format(target.format, TextureUsage::COLOR_ATTACHMENT) {
                        return Err(RhiError::unsupported(
                            ResourceKind::Pipeline,
                            format!("{:?} cannot be rendered to", target.format),
                        ));
                    }
                }
                match (g.depth_stencil, g.depth_format) {
                    (Some(_), None) => {
                        return Err(invalid("depth state given without a depth format".into()))
                    }
                    (_, Some(format)) if !format.is_depth() => {
                        return Err(invalid(format!("{format:?} is not a depth format")))
                    }
                    _ => {}
                }
                for attr in &g.vertex_attributes {
                    let binding = g
                        .vertex_bindings
                        .iter()
                        .find(|b| b.binding == attr.binding)
                        .ok_or_else(|| {
                            invalid(format!(
                                "attribute {} references missing binding {}",
                                attr.location, attr.binding
                            ))
                        })?;
                    if attr.offset + attr.format.size() > binding.stride {
                        return Err(invalid(format!(
                            "attribute {} does not fit in its binding stride",
                            attr.location
                        )));
                    }
                }
                if g.rasterization.line_width <= 0.0 {
                    return Err(invalid("line width must be positive".into()));
                }
            }
            PipelineDesc::Compute(c) => {
                if !caps.supports_compute {
                    return Err(RhiError::unsupported(ResourceKind::Pipeline, "compute pipelines"));
                }
                if c.shader.stage() != ShaderStage::Compute {
                    return Err(invalid("compute shader has the wrong stage".into()));
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Queue a finished command buffer. Returns immediately; completion is
    /// observed through `poll`, `wait` or `wait_idle`.
    pub fn submit(&self, cmd: &CommandBuffer, info: &SubmitInfo<'_>) -> RhiResult<SubmissionIndex> {
        self.shared.check()?;
        if cmd.device_id() != self.id() {
            return Err(RhiError::Submission(
                "command buffer belongs to a different device".into(),
            ));
        }
        let commands = cmd.take_for_submit()?;
        match self
            .shared
            .submit_commands(cmd.queue(), commands, info.wait, info.signal)
        {
            Ok(index) => {
                cmd.mark_submitted(index);
                Ok(index)
            }
            Err(e) => {
                cmd.cancel_submit();
                Err(e)
            }
        }
    }

    /// Highest completed submission. Also releases resources held by retired work.
    pub fn poll(&self) -> RhiResult<SubmissionIndex> {
        self.shared.poll()
    }

    pub fn wait(&self, index: SubmissionIndex, timeout: Duration) -> RhiResult<bool> {
        self.shared.wait(index, timeout)
    }

    /// Drain the queue. Used for teardown and resize.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.shared.wait_idle()
    }

    pub fn last_submitted(&self) -> SubmissionIndex {
        self.shared.last_submitted()
    }

    pub fn completed(&self) -> SubmissionIndex {
        self.shared.completed_index()
    }

    // -------------------------------------------------------------------------
    // Presentation
    // -------------------------------------------------------------------------

    /// Build the device's swap chain, replacing (and retiring) any previous one
    pub fn create_swap_chain(
        &self,
        provider: &dyn SurfaceProvider,
        desc: &SwapChainDesc,
    ) -> RhiResult<SwapChain> {
        self.shared.check()?;
        let target = provider.surface_target()?;
        let mut slot = self.swap_chain.lock();
        if let Some(old) = slot.take() {
            self.shared.wait_idle()?;
            old.retire();
        }
        let chain = SwapChain::create(&self.shared, &target, desc)?;
        *slot = Some(chain.clone());
        Ok(chain)
    }

    pub fn swap_chain(&self) -> Option<SwapChain> {
        self.swap_chain.lock().clone()
    }

    /// Present `index` on the device's current swap chain once `wait` signals.
    /// Returns whether the surface reported itself suboptimal.
    pub fn present(&self, index: u32, wait: &[&Semaphore]) -> RhiResult<bool> {
        self.shared.check()?;
        let chain = self
            .swap_chain()
            .ok_or_else(|| RhiError::InvalidUsage("device has no swap chain to present".into()))?;
        chain.present(index, wait)
    }

    /// Replace the swap chain after a resize or surface loss. The surface is
    /// kept; images of the old chain are retired and can no longer be submitted.
    pub fn recreate_swap_chain(&self, width: u32, height: u32) -> RhiResult<SwapChain> {
        self.shared.check()?;
        let mut slot = self.swap_chain.lock();
        let old = slot
            .as_ref()
            .ok_or_else(|| RhiError::InvalidUsage("no swap chain to recreate".into()))?
            .clone();
        log::info!("Recreating swap chain: {}x{}", width, height);
        self.shared.wait_idle()?;
        let new = old.recreate(width, height)?;
        old.retire();
        *slot = Some(new.clone());
        Ok(new)
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Tear the device down, reporting resources that are still alive.
    /// Any later use of those resources fails with `DeviceDestroyed`.
    pub fn destroy(mut self) -> RhiResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> RhiResult<()> {
        if self.shared.is_destroyed() {
            return Ok(());
        }
        log::info!("Destroying graphics device {}...", self.shared.id);
        if let Err(e) = self.shared.wait_idle() {
            log::warn!("wait_idle during teardown failed: {e}");
        }
        if let Some(chain) = self.swap_chain.get_mut().take() {
            chain.retire();
        }
        // Recorded commands hold their resources; release them before auditing
        self.shared.abandon_in_flight();
        self.shared.mark_destroyed();

        let outstanding = self.shared.tracker.outstanding();
        if outstanding.is_empty() {
            return Ok(());
        }
        log::error!(
            "{} destroyed with {} live resource(s): {}",
            self.shared.id,
            outstanding.len(),
            outstanding.join(", ")
        );
        Err(RhiError::ResourceLeak { outstanding })
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        // Leaks were already logged by shutdown
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("id", &self.shared.id)
            .field("backend", &self.backend())
            .finish()
    }
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

fn validate_texture(desc: &TextureDesc, caps: &Capabilities) -> RhiResult<()> {
    let invalid = |msg: String| RhiError::invalid_desc(ResourceKind::Texture, msg);
    if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
        return Err(invalid("extent must be non-zero".into()));
    }
    if desc.usage.is_empty() {
        return Err(invalid("usage must not be empty".into()));
    }
    if desc.array_layers == 0 {
        return Err(invalid("array_layers must be at least 1".into()));
    }
    let largest = desc.width.max(desc.height).max(desc.depth);
    let max_mips = 32 - largest.leading_zeros();
    if desc.mip_levels == 0 || desc.mip_levels > max_mips {
        return Err(invalid(format!(
            "mip_levels must be between 1 and {max_mips} for this extent"
        )));
    }
    match desc.texture_type {
        TextureType::D2 if desc.depth != 1 => {
            return Err(invalid("2D textures must have depth 1".into()))
        }
        TextureType::Cube if desc.width != desc.height || desc.depth != 1 => {
            return Err(invalid("cube faces must be square with depth 1".into()))
        }
        TextureType::D3 if desc.array_layers != 1 => {
            return Err(invalid("3D textures cannot be arrayed".into()))
        }
        _ => {}
    }
    if desc.format.is_depth() && desc.usage.intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::STORAGE) {
        return Err(invalid("depth formats cannot be color or storage targets".into()));
    }
    if !desc.format.is_depth() && desc.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
        return Err(invalid("DEPTH_STENCIL_ATTACHMENT requires a depth format".into()));
    }
    if largest > caps.max_texture_dimension_2d {
        return Err(RhiError::unsupported(
            ResourceKind::Texture,
            format!("{largest} texels exceeds the limit of {}", caps.max_texture_dimension_2d),
        ));
    }
    if !caps.supports_format(desc.format, desc.usage) {
        return Err(RhiError::unsupported(
            ResourceKind::Texture,
            format!("{:?} does not support {:?}", desc.format, desc.usage),
        ));
    }
    Ok(())
}

fn validate_layout(layout: &DescriptorSetLayoutDesc, kind: ResourceKind) -> RhiResult<()> {
    for (i, binding) in layout.bindings.iter().enumerate() {
        if layout.bindings[..i].iter().any(|b| b.binding == binding.binding) {
            return Err(RhiError::invalid_desc(
                kind,
                format!("binding {} declared twice", binding.binding),
            ));
        }
        if binding.stages.is_empty() {
            return Err(RhiError::invalid_desc(
                kind,
                format!("binding {} is visible to no shader stage", binding.binding),
            ));
        }
    }
    Ok(())
}
