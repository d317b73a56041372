// Resource handles
//
// Every resource is a cheap, cloneable handle around an `Arc`. The native
// object belongs to the backend that created it and is released exactly once,
// when the last clone drops. Handles remember their device, so using one after
// the device is gone fails with `DeviceDestroyed` instead of touching freed
// native state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::device::DeviceShared;
use super::error::{ResourceKind, RhiError, RhiResult};
use super::hal::{
    BufferBackend, DescriptorSetBackend, FramebufferBackend, PipelineBackend, SamplerBackend,
    ShaderBackend, TextureBackend,
};
use super::types::*;

/// Device back-reference plus leak-tracker registration shared by all handles
pub(crate) struct ResourceCommon {
    pub(crate) device: Arc<DeviceShared>,
    tracked: Option<u64>,
}

impl ResourceCommon {
    pub(crate) fn tracked(device: &Arc<DeviceShared>, kind: ResourceKind, label: Option<&str>) -> Self {
        let id = device.tracker.register(kind, label);
        Self {
            device: Arc::clone(device),
            tracked: Some(id),
        }
    }

    /// Internal objects (staging buffers, swap chain images) never count as leaks
    pub(crate) fn untracked(device: &Arc<DeviceShared>) -> Self {
        Self {
            device: Arc::clone(device),
            tracked: None,
        }
    }

    pub(crate) fn device_id(&self) -> DeviceId {
        self.device.id
    }
}

impl Drop for ResourceCommon {
    fn drop(&mut self) {
        if let Some(id) = self.tracked {
            self.device.tracker.release(id);
        }
    }
}

// =============================================================================
// BUFFER
// =============================================================================

#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    common: ResourceCommon,
    desc: BufferDesc,
    raw: Box<dyn BufferBackend>,
    /// Last submission that referenced this buffer
    last_use: AtomicU64,
}

impl Buffer {
    pub(crate) fn new(common: ResourceCommon, desc: BufferDesc, raw: Box<dyn BufferBackend>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                common,
                desc,
                raw,
                last_use: AtomicU64::new(0),
            }),
        }
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.inner.desc
    }

    /// Requested size in bytes; every bounds check uses this value
    pub fn size(&self) -> u64 {
        self.inner.desc.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.desc.usage
    }

    pub fn memory(&self) -> MemoryUsage {
        self.inner.desc.memory
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.desc.label.as_deref()
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &dyn BufferBackend {
        &*self.inner.raw
    }

    pub(crate) fn last_use(&self) -> SubmissionIndex {
        SubmissionIndex(self.inner.last_use.load(Ordering::Acquire))
    }

    pub(crate) fn mark_used(&self, index: SubmissionIndex) {
        self.inner.last_use.fetch_max(index.0, Ordering::AcqRel);
    }

    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy `data` to the start of the buffer.
    ///
    /// Host-visible buffers are written through their mapping immediately.
    /// `GpuOnly` buffers with `TRANSFER_DST` usage are filled through a
    /// temporary staging buffer and a device-side copy queued behind all
    /// previous submissions; the staging buffer is released once that copy
    /// completes.
    ///
    /// Writing a mapped buffer that an incomplete submission still uses is a
    /// data race: rejected with `RhiError::Validation` when validation is on,
    /// otherwise logged and the GPU sees undefined contents.
    pub fn copy_data(&self, data: &[u8]) -> RhiResult<()> {
        self.copy_data_at(0, data)
    }

    pub fn copy_data_at(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        let device = &self.inner.common.device;
        device.check()?;

        let len = data.len() as u64;
        let size = self.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(RhiError::BufferOverflow { offset, len, size });
        }
        if data.is_empty() {
            return Ok(());
        }

        if self.memory().is_host_visible() {
            self.check_host_access("write")?;
            return device.observe(self.raw().write(offset, data));
        }

        if !self.usage().contains(BufferUsage::TRANSFER_DST) {
            return Err(RhiError::InvalidUsage(format!(
                "cannot upload to GPU-only buffer '{}' without TRANSFER_DST usage",
                self.label().unwrap_or("unnamed")
            )));
        }
        device.upload_via_staging(self, offset, data)
    }

    /// Write one plain-old-data value at the start of the buffer
    pub fn write_pod<T: bytemuck::Pod>(&self, value: &T) -> RhiResult<()> {
        self.copy_data(bytemuck::bytes_of(value))
    }

    /// Read back from a host-visible buffer
    pub fn read_data(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let device = &self.inner.common.device;
        device.check()?;

        let len = out.len() as u64;
        let size = self.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(RhiError::BufferOverflow { offset, len, size });
        }
        if !self.memory().is_host_visible() {
            return Err(RhiError::InvalidUsage(
                "GPU-only buffers cannot be read by the host; copy into a GpuToCpu buffer".into(),
            ));
        }
        self.check_host_access("read")?;
        device.observe(self.raw().read(offset, out))
    }

    pub fn read_to_vec(&self) -> RhiResult<Vec<u8>> {
        let mut out = vec![0u8; self.size() as usize];
        self.read_data(0, &mut out)?;
        Ok(out)
    }

    fn check_host_access(&self, what: &str) -> RhiResult<()> {
        let device = &self.inner.common.device;
        let last_use = self.last_use();
        if last_use <= device.completed_index() {
            return Ok(());
        }
        let msg = format!(
            "host {what} of buffer '{}' while submission {} may still use it",
            self.label().unwrap_or("unnamed"),
            last_use.0
        );
        if device.validation {
            Err(RhiError::Validation(msg))
        } else {
            log::warn!("{msg}");
            Ok(())
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label())
            .field("size", &self.size())
            .field("memory", &self.memory())
            .finish()
    }
}

// =============================================================================
// TEXTURE
// =============================================================================

/// Extra state carried by swap chain images
pub(crate) struct SwapImageState {
    pub(crate) index: u32,
    pub(crate) retired: AtomicBool,
    pub(crate) last_write: AtomicU64,
}

#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

struct TextureInner {
    common: ResourceCommon,
    desc: TextureDesc,
    raw: Box<dyn TextureBackend>,
    swap: Option<SwapImageState>,
}

impl Texture {
    pub(crate) fn new(common: ResourceCommon, desc: TextureDesc, raw: Box<dyn TextureBackend>) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                common,
                desc,
                raw,
                swap: None,
            }),
        }
    }

    pub(crate) fn new_swap_image(
        common: ResourceCommon,
        desc: TextureDesc,
        raw: Box<dyn TextureBackend>,
        index: u32,
    ) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                common,
                desc,
                raw,
                swap: Some(SwapImageState {
                    index,
                    retired: AtomicBool::new(false),
                    last_write: AtomicU64::new(0),
                }),
            }),
        }
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.inner.desc
    }

    pub fn width(&self) -> u32 {
        self.inner.desc.width
    }

    pub fn height(&self) -> u32 {
        self.inner.desc.height
    }

    pub fn format(&self) -> Format {
        self.inner.desc.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.inner.desc.usage
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.desc.label.as_deref()
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &dyn TextureBackend {
        &*self.inner.raw
    }

    pub fn is_swap_chain_image(&self) -> bool {
        self.inner.swap.is_some()
    }

    /// Index within the owning swap chain, for swap chain images
    pub fn swap_chain_index(&self) -> Option<u32> {
        self.inner.swap.as_ref().map(|s| s.index)
    }

    /// True once the swap chain owning this image was recreated or destroyed
    pub fn is_retired(&self) -> bool {
        self.inner
            .swap
            .as_ref()
            .is_some_and(|s| s.retired.load(Ordering::Acquire))
    }

    pub(crate) fn retire(&self) {
        if let Some(swap) = &self.inner.swap {
            swap.retired.store(true, Ordering::Release);
        }
    }

    pub(crate) fn mark_written(&self, index: SubmissionIndex) {
        if let Some(swap) = &self.inner.swap {
            swap.last_write.fetch_max(index.0, Ordering::AcqRel);
        }
    }

    pub(crate) fn last_write(&self) -> SubmissionIndex {
        SubmissionIndex(
            self.inner
                .swap
                .as_ref()
                .map_or(0, |s| s.last_write.load(Ordering::Acquire)),
        )
    }

    pub fn ptr_eq(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("label", &self.label())
            .field("extent", &(self.width(), self.height()))
            .field("format", &self.format())
            .finish()
    }
}

// =============================================================================
// SAMPLER & SHADER
// =============================================================================

#[derive(Clone)]
pub struct Sampler {
    inner: Arc<SamplerInner>,
}

struct SamplerInner {
    common: ResourceCommon,
    desc: SamplerDesc,
    raw: Box<dyn SamplerBackend>,
}

impl Sampler {
    pub(crate) fn new(common: ResourceCommon, desc: SamplerDesc, raw: Box<dyn SamplerBackend>) -> Self {
        Self {
            inner: Arc::new(SamplerInner { common, desc, raw }),
        }
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.inner.desc
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &dyn SamplerBackend {
        &*self.inner.raw
    }
}

#[derive(Clone)]
pub struct Shader {
    inner: Arc<ShaderInner>,
}

struct ShaderInner {
    common: ResourceCommon,
    desc: ShaderDesc,
    raw: Box<dyn ShaderBackend>,
}

impl Shader {
    pub(crate) fn new(common: ResourceCommon, desc: ShaderDesc, raw: Box<dyn ShaderBackend>) -> Self {
        Self {
            inner: Arc::new(ShaderInner { common, desc, raw }),
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.inner.desc.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.inner.desc.entry_point
    }

    pub fn source_kind(&self) -> ShaderSourceKind {
        self.inner.desc.source.kind()
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &dyn ShaderBackend {
        &*self.inner.raw
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

#[derive(Clone)]
pub struct GraphicsPipelineDesc {
    pub label: Option<String>,
    pub vertex_shader: Shader,
    pub fragment_shader: Option<Shader>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: PrimitiveTopology,
    pub rasterization: RasterizationState,
    /// `None` disables depth testing entirely
    pub depth_stencil: Option<DepthStencilState>,
    pub depth_format: Option<Format>,
    pub color_targets: Vec<ColorTargetState>,
    pub descriptor_layouts: Vec<DescriptorSetLayoutDesc>,
    pub push_constants: Option<PushConstantRange>,
}

impl GraphicsPipelineDesc {
    pub fn new(vertex_shader: Shader, fragment_shader: Option<Shader>) -> Self {
        Self {
            label: None,
            vertex_shader,
            fragment_shader,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: PrimitiveTopology::TriangleList,
            rasterization: RasterizationState::default(),
            depth_stencil: None,
            depth_format: None,
            color_targets: Vec::new(),
            descriptor_layouts: Vec::new(),
            push_constants: None,
        }
    }
}

#[derive(Clone)]
pub struct ComputePipelineDesc {
    pub label: Option<String>,
    pub shader: Shader,
    pub descriptor_layouts: Vec<DescriptorSetLayoutDesc>,
    pub push_constants: Option<PushConstantRange>,
    /// Threads per workgroup. SPIR-V and WGSL declare this in the shader;
    /// Metal needs it at dispatch time.
    pub threadgroup_size: [u32; 3],
}

impl ComputePipelineDesc {
    pub fn new(shader: Shader) -> Self {
        Self {
            label: None,
            shader,
            descriptor_layouts: Vec::new(),
            push_constants: None,
            threadgroup_size: [64, 1, 1],
        }
    }
}

#[derive(Clone)]
pub enum PipelineDesc {
    Graphics(GraphicsPipelineDesc),
    Compute(ComputePipelineDesc),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

impl PipelineDesc {
    pub fn kind(&self) -> PipelineKind {
        match self {
            PipelineDesc::Graphics(_) => PipelineKind::Graphics,
            PipelineDesc::Compute(_) => PipelineKind::Compute,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            PipelineDesc::Graphics(d) => d.label.as_deref(),
            PipelineDesc::Compute(d) => d.label.as_deref(),
        }
    }

    pub fn descriptor_layouts(&self) -> &[DescriptorSetLayoutDesc] {
        match self {
            PipelineDesc::Graphics(d) => &d.descriptor_layouts,
            PipelineDesc::Compute(d) => &d.descriptor_layouts,
        }
    }

    pub fn push_constants(&self) -> Option<PushConstantRange> {
        match self {
            PipelineDesc::Graphics(d) => d.push_constants,
            PipelineDesc::Compute(d) => d.push_constants,
        }
    }

    pub(crate) fn shaders(&self) -> Vec<&Shader> {
        match self {
            PipelineDesc::Graphics(d) => {
                let mut shaders = vec![&d.vertex_shader];
                shaders.extend(d.fragment_shader.as_ref());
                shaders
            }
            PipelineDesc::Compute(d) => vec![&d.shader],
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    common: ResourceCommon,
    desc: PipelineDesc,
    raw: Box<dyn PipelineBackend>,
}

impl Pipeline {
    pub(crate) fn new(common: ResourceCommon, desc: PipelineDesc, raw: Box<dyn PipelineBackend>) -> Self {
        Self {
            inner: Arc::new(PipelineInner { common, desc, raw }),
        }
    }

    pub fn desc(&self) -> &PipelineDesc {
        &self.inner.desc
    }

    pub fn kind(&self) -> PipelineKind {
        self.inner.desc.kind()
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &dyn PipelineBackend {
        &*self.inner.raw
    }
}

// =============================================================================
// FRAMEBUFFER
// =============================================================================

#[derive(Clone, Default)]
pub struct FramebufferDesc {
    pub label: Option<String>,
    pub color_attachments: Vec<Texture>,
    pub depth_attachment: Option<Texture>,
}

impl FramebufferDesc {
    pub fn attachments(&self) -> impl Iterator<Item = &Texture> {
        self.color_attachments.iter().chain(self.depth_attachment.iter())
    }

    /// Shared extent of all attachments, or `None` if they disagree or there are none
    pub fn extent(&self) -> Option<(u32, u32)> {
        let mut attachments = self.attachments();
        let first = attachments.next()?;
        let extent = (first.width(), first.height());
        attachments
            .all(|t| (t.width(), t.height()) == extent)
            .then_some(extent)
    }
}

#[derive(Clone)]
pub struct Framebuffer {
    inner: Arc<FramebufferInner>,
}

struct FramebufferInner {
    common: ResourceCommon,
    desc: FramebufferDesc,
    extent: (u32, u32),
    raw: Box<dyn FramebufferBackend>,
}

impl Framebuffer {
    pub(crate) fn new(
        common: ResourceCommon,
        desc: FramebufferDesc,
        extent: (u32, u32),
        raw: Box<dyn FramebufferBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(FramebufferInner {
                common,
                desc,
                extent,
                raw,
            }),
        }
    }

    pub fn desc(&self) -> &FramebufferDesc {
        &self.inner.desc
    }

    pub fn color_attachments(&self) -> &[Texture] {
        &self.inner.desc.color_attachments
    }

    pub fn depth_attachment(&self) -> Option<&Texture> {
        self.inner.desc.depth_attachment.as_ref()
    }

    pub fn extent(&self) -> (u32, u32) {
        self.inner.extent
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &dyn FramebufferBackend {
        &*self.inner.raw
    }
}

// =============================================================================
// DESCRIPTOR SET
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct DescriptorSetDesc {
    pub label: Option<String>,
    pub layout: DescriptorSetLayoutDesc,
}

/// Resource currently written into a descriptor binding
#[derive(Clone)]
pub enum BoundResource {
    Buffer(Buffer),
    Texture(Texture, Sampler),
}

#[derive(Clone)]
pub struct DescriptorSet {
    inner: Arc<DescriptorSetInner>,
}

struct DescriptorSetInner {
    common: ResourceCommon,
    desc: DescriptorSetDesc,
    raw: Box<dyn DescriptorSetBackend>,
    bound: Mutex<Vec<(u32, BoundResource)>>,
    /// Replaced bindings kept until the submission that last read them retires
    superseded: Mutex<Vec<(SubmissionIndex, BoundResource)>>,
    last_use: AtomicU64,
}

impl DescriptorSet {
    pub(crate) fn new(
        common: ResourceCommon,
        desc: DescriptorSetDesc,
        raw: Box<dyn DescriptorSetBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(DescriptorSetInner {
                common,
                desc,
                raw,
                bound: Mutex::new(Vec::new()),
                superseded: Mutex::new(Vec::new()),
                last_use: AtomicU64::new(0),
            }),
        }
    }

    pub fn layout(&self) -> &DescriptorSetLayoutDesc {
        &self.inner.desc.layout
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    pub fn raw(&self) -> &dyn DescriptorSetBackend {
        &*self.inner.raw
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.desc.label.as_deref()
    }

    pub(crate) fn last_use(&self) -> SubmissionIndex {
        SubmissionIndex(self.inner.last_use.load(Ordering::Acquire))
    }

    pub(crate) fn mark_used(&self, index: SubmissionIndex) {
        self.inner.last_use.fetch_max(index.0, Ordering::AcqRel);
    }

    /// Snapshot of everything written so far, by binding
    pub fn bound_resources(&self) -> Vec<(u32, BoundResource)> {
        self.inner.bound.lock().clone()
    }

    /// Point `binding` at `buffer`.
    ///
    /// Rewriting a set that an incomplete submission has bound is rejected
    /// with `RhiError::Validation` when validation is on. Otherwise it is
    /// logged, and the replaced resource stays alive until that submission
    /// completes.
    pub fn write_buffer(&self, binding: u32, buffer: &Buffer) -> RhiResult<()> {
        let device = &self.inner.common.device;
        device.check()?;
        if buffer.device_id() != self.device_id() {
            return Err(RhiError::InvalidUsage(
                "buffer belongs to a different device than the descriptor set".into(),
            ));
        }
        let slot = self.binding(binding)?;
        let required = match slot.ty {
            DescriptorType::UniformBuffer => BufferUsage::UNIFORM,
            DescriptorType::StorageBuffer => BufferUsage::STORAGE,
            DescriptorType::CombinedImageSampler => {
                return Err(RhiError::InvalidUsage(format!(
                    "binding {binding} expects a texture, not a buffer"
                )))
            }
        };
        if !buffer.usage().contains(required) {
            return Err(RhiError::InvalidUsage(format!(
                "binding {binding} needs a buffer with {required:?} usage"
            )));
        }
        self.check_not_in_flight(binding)?;
        device.observe(self.raw().write_buffer(slot, buffer))?;
        self.remember(binding, BoundResource::Buffer(buffer.clone()));
        Ok(())
    }

    pub fn write_texture(&self, binding: u32, texture: &Texture, sampler: &Sampler) -> RhiResult<()> {
        let device = &self.inner.common.device;
        device.check()?;
        if texture.device_id() != self.device_id() || sampler.device_id() != self.device_id() {
            return Err(RhiError::InvalidUsage(
                "texture or sampler belongs to a different device than the descriptor set".into(),
            ));
        }
        let slot = self.binding(binding)?;
        if slot.ty != DescriptorType::CombinedImageSampler {
            return Err(RhiError::InvalidUsage(format!(
                "binding {binding} expects a buffer, not a texture"
            )));
        }
        if !texture.usage().contains(TextureUsage::SAMPLED) {
            return Err(RhiError::InvalidUsage(format!(
                "binding {binding} needs a texture with SAMPLED usage"
            )));
        }
        self.check_not_in_flight(binding)?;
        device.observe(self.raw().write_texture(slot, texture, sampler))?;
        self.remember(
            binding,
            BoundResource::Texture(texture.clone(), sampler.clone()),
        );
        Ok(())
    }

    fn binding(&self, binding: u32) -> RhiResult<&DescriptorBinding> {
        self.inner.desc.layout.binding(binding).ok_or_else(|| {
            RhiError::InvalidUsage(format!("descriptor set has no binding {binding}"))
        })
    }

    fn check_not_in_flight(&self, binding: u32) -> RhiResult<()> {
        let device = &self.inner.common.device;
        let last_use = self.last_use();
        if last_use <= device.completed_index() {
            return Ok(());
        }
        let msg = format!(
            "rewriting binding {binding} of descriptor set '{}' while submission {} may still use it",
            self.label().unwrap_or("unnamed"),
            last_use.0
        );
        if device.validation {
            Err(RhiError::Validation(msg))
        } else {
            log::warn!("{msg}");
            Ok(())
        }
    }

    fn remember(&self, binding: u32, resource: BoundResource) {
        let completed = self.inner.common.device.completed_index();
        let last_use = self.last_use();
        let mut superseded = self.inner.superseded.lock();
        superseded.retain(|(index, _)| *index > completed);

        let mut bound = self.inner.bound.lock();
        if let Some(pos) = bound.iter().position(|(b, _)| *b == binding) {
            let (_, old) = bound.remove(pos);
            if last_use > completed {
                superseded.push((last_use, old));
            }
        }
        bound.push((binding, resource));
    }
}
