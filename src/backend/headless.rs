// Headless backend
//
// CPU reference implementation of the full backend contract. Memory lives in
// host vectors, submissions queue up and execute in order on `poll`/`wait`,
// clears and copies are performed byte-for-byte, draws and dispatches are only
// counted. Used by tools without a GPU and by the test suite.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::rhi::command::Command;
use crate::rhi::device::DeviceDesc;
use crate::rhi::hal::*;
use crate::rhi::resource::{
    Buffer, DescriptorSetDesc, Framebuffer, FramebufferDesc, PipelineDesc, Sampler, Texture,
};
use crate::rhi::surface::WindowTarget;
use crate::rhi::{ResourceKind, RhiError, RhiResult};
use crate::rhi::types::*;

/// Knobs for the simulated device
#[derive(Debug, Clone, Default)]
pub struct HeadlessOptions {
    /// Reported adapter name
    pub adapter_name: Option<String>,
    /// Total bytes buffers and textures may occupy; beyond it creation fails
    /// with out-of-device-memory
    pub memory_budget: Option<u64>,
    /// Report device loss on the submission after this many
    pub lose_device_after_submissions: Option<u64>,
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Debug)]
struct MemoryBudget {
    used: Mutex<u64>,
    limit: Option<u64>,
}

impl MemoryBudget {
    fn allocate(&self, size: u64, kind: ResourceKind) -> RhiResult<()> {
        let mut used = self.used.lock();
        if let Some(limit) = self.limit {
            if *used + size > limit {
                log::warn!(
                    "Headless memory budget exhausted: {} + {} > {} bytes",
                    *used,
                    size,
                    limit
                );
                return Err(RhiError::out_of_memory(kind));
            }
        }
        *used += size;
        Ok(())
    }

    fn free(&self, size: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(size);
    }
}

/// Host bytes charged against the device budget until dropped
struct Allocation {
    bytes: RwLock<Vec<u8>>,
    budget: Arc<MemoryBudget>,
}

impl Allocation {
    fn new(budget: &Arc<MemoryBudget>, size: u64, kind: ResourceKind) -> RhiResult<Self> {
        budget.allocate(size, kind)?;
        Ok(Self {
            bytes: RwLock::new(vec![0; size as usize]),
            budget: Arc::clone(budget),
        })
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.budget.free(self.bytes.get_mut().len() as u64);
    }
}

// =============================================================================
// RESOURCES
// =============================================================================

struct HeadlessBuffer {
    memory: Allocation,
}

impl BufferBackend for HeadlessBuffer {
    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        let start = offset as usize;
        self.memory.bytes.write()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let start = offset as usize;
        out.copy_from_slice(&self.memory.bytes.read()[start..start + out.len()]);
        Ok(())
    }
}

/// Mip levels stored back to back, each tightly packed
struct HeadlessTexture {
    memory: Allocation,
    mip_offsets: Vec<(usize, usize)>,
}

impl HeadlessTexture {
    fn mip_range(&self, level: u32) -> RhiResult<std::ops::Range<usize>> {
        let (start, len) = self
            .mip_offsets
            .get(level as usize)
            .copied()
            .ok_or_else(|| RhiError::InvalidUsage(format!("texture has no mip level {level}")))?;
        Ok(start..start + len)
    }
}

impl TextureBackend for HeadlessTexture {}

struct HeadlessSampler;
impl SamplerBackend for HeadlessSampler {}

struct HeadlessShader;
impl ShaderBackend for HeadlessShader {}

struct HeadlessPipeline;
impl PipelineBackend for HeadlessPipeline {}

struct HeadlessFramebuffer;
impl FramebufferBackend for HeadlessFramebuffer {}

struct HeadlessSemaphore;
impl SemaphoreBackend for HeadlessSemaphore {}

struct HeadlessDescriptorSet;

impl DescriptorSetBackend for HeadlessDescriptorSet {
    fn write_buffer(&self, _binding: &DescriptorBinding, buffer: &Buffer) -> RhiResult<()> {
        downcast::<HeadlessBuffer>(buffer.raw().as_any(), ResourceKind::Buffer).map(|_| ())
    }

    fn write_texture(
        &self,
        _binding: &DescriptorBinding,
        texture: &Texture,
        sampler: &Sampler,
    ) -> RhiResult<()> {
        downcast::<HeadlessTexture>(texture.raw().as_any(), ResourceKind::Texture)?;
        downcast::<HeadlessSampler>(sampler.raw().as_any(), ResourceKind::Sampler)?;
        Ok(())
    }
}

// =============================================================================
// DEVICE
// =============================================================================

struct PendingSubmission {
    index: SubmissionIndex,
    commands: Vec<Command>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingSubmission>,
    completed: SubmissionIndex,
    submitted: u64,
    lost: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ExecutionStats {
    draws: u64,
    dispatches: u64,
    copies: u64,
    clears: u64,
}

pub struct HeadlessDevice {
    info: DeviceInfo,
    caps: Capabilities,
    budget: Arc<MemoryBudget>,
    lose_after: Option<u64>,
    queue: Mutex<QueueState>,
}

impl HeadlessDevice {
    pub fn new(desc: &DeviceDesc) -> Self {
        let options = &desc.headless;
        let info = DeviceInfo {
            name: options
                .adapter_name
                .clone()
                .unwrap_or_else(|| "Headless Reference Device".to_string()),
            backend: BackendKind::Headless,
            api_version: env!("CARGO_PKG_VERSION").to_string(),
            device_memory: options.memory_budget.unwrap_or(0),
        };
        Self {
            info,
            caps: capabilities(desc.validation),
            budget: Arc::new(MemoryBudget {
                used: Mutex::new(0),
                limit: options.memory_budget,
            }),
            lose_after: options.lose_device_after_submissions,
            queue: Mutex::new(QueueState::default()),
        }
    }

    /// Run queued submissions up to and including `until`
    fn execute_until(&self, until: SubmissionIndex) -> RhiResult<SubmissionIndex> {
        let mut queue = self.queue.lock();
        if queue.lost {
            return Err(RhiError::DeviceLost("simulated device loss".into()));
        }
        while queue.pending.front().is_some_and(|s| s.index <= until) {
            let Some(submission) = queue.pending.pop_front() else {
                break;
            };
            let mut stats = ExecutionStats::default();
            for command in &submission.commands {
                if let Err(err) = execute(command, &mut stats) {
                    log::error!(
                        "Headless submission {}: {} failed: {}",
                        submission.index.0,
                        command.name(),
                        err
                    );
                }
            }
            log::trace!(
                "Headless submission {} executed: {:?}",
                submission.index.0,
                stats
            );
            queue.completed = submission.index;
        }
        Ok(queue.completed)
    }
}

fn capabilities(validation: bool) -> Capabilities {
    let formats = Format::ALL
        .into_iter()
        .map(|format| {
            let attachment = if format.is_depth() {
                TextureUsage::DEPTH_STENCIL_ATTACHMENT
            } else {
                TextureUsage::COLOR_ATTACHMENT | TextureUsage::STORAGE
            };
            FormatSupport {
                format,
                usage: attachment
                    | TextureUsage::SAMPLED
                    | TextureUsage::TRANSFER_SRC
                    | TextureUsage::TRANSFER_DST,
            }
        })
        .collect();
    Capabilities {
        max_buffer_size: 1 << 30,
        max_texture_dimension_2d: 16384,
        max_uniform_buffer_range: 65536,
        max_push_constant_size: 256,
        max_color_attachments: 8,
        max_bound_descriptor_sets: 4,
        supports_compute: true,
        supports_readback: true,
        validation,
        shader_sources: vec![
            ShaderSourceKind::SpirV,
            ShaderSourceKind::Msl,
            ShaderSourceKind::Wgsl,
        ],
        formats,
        queues: vec![QueueType::Graphics, QueueType::Compute, QueueType::Transfer],
    }
}

impl DeviceBackend for HeadlessDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<Box<dyn BufferBackend>> {
        Ok(Box::new(HeadlessBuffer {
            memory: Allocation::new(&self.budget, desc.size, ResourceKind::Buffer)?,
        }))
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<Box<dyn TextureBackend>> {
        let mut mip_offsets = Vec::with_capacity(desc.mip_levels as usize);
        let mut total = 0usize;
        for level in 0..desc.mip_levels {
            let len = desc.mip_byte_size(level) as usize;
            mip_offsets.push((total, len));
            total += len;
        }
        Ok(Box::new(HeadlessTexture {
            memory: Allocation::new(&self.budget, total as u64, ResourceKind::Texture)?,
            mip_offsets,
        }))
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> RhiResult<Box<dyn SamplerBackend>> {
        Ok(Box::new(HeadlessSampler))
    }

    fn create_shader(&self, _desc: &ShaderDesc) -> RhiResult<Box<dyn ShaderBackend>> {
        Ok(Box::new(HeadlessShader))
    }

    fn create_pipeline(&self, _desc: &PipelineDesc) -> RhiResult<Box<dyn PipelineBackend>> {
        Ok(Box::new(HeadlessPipeline))
    }

    fn create_framebuffer(
        &self,
        desc: &FramebufferDesc,
    ) -> RhiResult<Box<dyn FramebufferBackend>> {
        for texture in desc.attachments() {
            downcast::<HeadlessTexture>(texture.raw().as_any(), ResourceKind::Texture)?;
        }
        Ok(Box::new(HeadlessFramebuffer))
    }

    fn create_descriptor_set(
        &self,
        _desc: &DescriptorSetDesc,
    ) -> RhiResult<Box<dyn DescriptorSetBackend>> {
        Ok(Box::new(HeadlessDescriptorSet))
    }

    fn create_semaphore(&self) -> RhiResult<Box<dyn SemaphoreBackend>> {
        Ok(Box::new(HeadlessSemaphore))
    }

    fn create_surface(&self, _target: &WindowTarget) -> RhiResult<Arc<dyn SurfaceBackend>> {
        Err(RhiError::unsupported(
            ResourceKind::Surface,
            "the headless backend cannot present to windows; use an OffscreenTarget",
        ))
    }

    fn create_swap_chain(
        &self,
        _surface: &Arc<dyn SurfaceBackend>,
        _desc: &SwapChainDesc,
        _old: Option<&dyn SwapChainBackend>,
    ) -> RhiResult<Box<dyn SwapChainBackend>> {
        Err(RhiError::unsupported(
            ResourceKind::SwapChain,
            "the headless backend has no native surfaces",
        ))
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let mut queue = self.queue.lock();
        if queue.lost {
            return Err(RhiError::DeviceLost("simulated device loss".into()));
        }
        if self.lose_after.is_some_and(|limit| queue.submitted >= limit) {
            queue.lost = true;
            queue.pending.clear();
            return Err(RhiError::DeviceLost(format!(
                "simulated device loss after {} submissions",
                queue.submitted
            )));
        }
        for sem in submission.wait.iter().chain(submission.signal) {
            downcast::<HeadlessSemaphore>((**sem).as_any(), ResourceKind::Semaphore)?;
        }
        queue.submitted += 1;
        queue.pending.push_back(PendingSubmission {
            index: submission.index,
            commands: submission.commands.to_vec(),
        });
        Ok(())
    }

    fn poll(&self) -> RhiResult<SubmissionIndex> {
        self.execute_until(SubmissionIndex(u64::MAX))
    }

    fn wait(&self, index: SubmissionIndex, _timeout: Duration) -> RhiResult<bool> {
        Ok(self.execute_until(index)? >= index)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.execute_until(SubmissionIndex(u64::MAX)).map(|_| ())
    }
}

// =============================================================================
// EXECUTION
// =============================================================================

fn buffer(buffer: &Buffer) -> RhiResult<&HeadlessBuffer> {
    downcast::<HeadlessBuffer>(buffer.raw().as_any(), ResourceKind::Buffer)
}

fn texture(texture: &Texture) -> RhiResult<&HeadlessTexture> {
    downcast::<HeadlessTexture>(texture.raw().as_any(), ResourceKind::Texture)
}

fn execute(command: &Command, stats: &mut ExecutionStats) -> RhiResult<()> {
    match command {
        Command::BeginRendering {
            framebuffer,
            load_ops,
        } => clear_attachments(framebuffer, load_ops, stats)?,
        Command::Draw { .. } | Command::DrawIndexed { .. } => stats.draws += 1,
        Command::Dispatch { .. } => stats.dispatches += 1,
        Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => {
            let (src_start, dst_start, len) =
                (*src_offset as usize, *dst_offset as usize, *size as usize);
            if src.ptr_eq(dst) {
                buffer(src)?
                    .memory
                    .bytes
                    .write()
                    .copy_within(src_start..src_start + len, dst_start);
            } else {
                let from = buffer(src)?.memory.bytes.read();
                buffer(dst)?.memory.bytes.write()[dst_start..dst_start + len]
                    .copy_from_slice(&from[src_start..src_start + len]);
            }
            stats.copies += 1;
        }
        Command::CopyBufferToTexture {
            src,
            src_offset,
            dst,
            mip_level,
        } => {
            let target = texture(dst)?;
            let range = target.mip_range(*mip_level)?;
            let start = *src_offset as usize;
            let from = buffer(src)?.memory.bytes.read();
            target.memory.bytes.write()[range.clone()]
                .copy_from_slice(&from[start..start + range.len()]);
            stats.copies += 1;
        }
        Command::CopyTextureToBuffer {
            src,
            mip_level,
            dst,
            dst_offset,
        } => {
            let source = texture(src)?;
            let range = source.mip_range(*mip_level)?;
            let start = *dst_offset as usize;
            let from = source.memory.bytes.read();
            buffer(dst)?.memory.bytes.write()[start..start + range.len()]
                .copy_from_slice(&from[range]);
            stats.copies += 1;
        }
        Command::EndRendering
        | Command::BindPipeline(_)
        | Command::SetViewport(_)
        | Command::SetScissor(_)
        | Command::BindVertexBuffer { .. }
        | Command::BindIndexBuffer { .. }
        | Command::BindDescriptorSet { .. }
        | Command::PushConstants { .. }
        | Command::BufferBarrier { .. }
        | Command::TextureBarrier { .. } => {}
    }
    Ok(())
}

fn clear_attachments(
    framebuffer: &Framebuffer,
    load_ops: &[LoadOp],
    stats: &mut ExecutionStats,
) -> RhiResult<()> {
    for (attachment, op) in framebuffer.desc().attachments().zip(load_ops) {
        let LoadOp::Clear(value) = op else {
            continue;
        };
        let target = texture(attachment)?;
        let range = target.mip_range(0)?;
        let pixel = encode_pixel(attachment.format(), *value);
        let mut bytes = target.memory.bytes.write();
        for chunk in bytes[range].chunks_exact_mut(pixel.len()) {
            chunk.copy_from_slice(&pixel);
        }
        stats.clears += 1;
    }
    Ok(())
}

/// Byte pattern of one texel holding `value` in `format`
pub(crate) fn encode_pixel(format: Format, value: ClearValue) -> Vec<u8> {
    let unorm8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    match value {
        ClearValue::Color([r, g, b, a]) => {
            let (r, g, b) = if format.is_srgb() {
                (linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(b))
            } else {
                (r, g, b)
            };
            match format {
                Format::R8Unorm => vec![unorm8(r)],
                Format::R8G8Unorm => vec![unorm8(r), unorm8(g)],
                Format::R8G8B8A8Unorm | Format::R8G8B8A8Srgb => {
                    vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)]
                }
                Format::B8G8R8A8Unorm | Format::B8G8R8A8Srgb => {
                    vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)]
                }
                Format::R16Sfloat => f16_bytes(&[r]),
                Format::R16G16Sfloat => f16_bytes(&[r, g]),
                Format::R16G16B16A16Sfloat => f16_bytes(&[r, g, b, a]),
                Format::R32Uint => (r as u32).to_le_bytes().to_vec(),
                Format::R32Sfloat => r.to_le_bytes().to_vec(),
                Format::R32G32Sfloat => [r, g].iter().flat_map(|c| c.to_le_bytes()).collect(),
                Format::R32G32B32A32Sfloat => {
                    [r, g, b, a].iter().flat_map(|c| c.to_le_bytes()).collect()
                }
                depth => vec![0; depth.bytes_per_pixel() as usize],
            }
        }
        ClearValue::DepthStencil { depth, stencil } => {
            let depth = depth.clamp(0.0, 1.0);
            match format {
                Format::D16Unorm => ((depth * 65535.0 + 0.5) as u16).to_le_bytes().to_vec(),
                Format::D32Sfloat => depth.to_le_bytes().to_vec(),
                Format::D24UnormS8Uint => {
                    let d = (f64::from(depth) * 16_777_215.0 + 0.5).min(16_777_215.0) as u32;
                    (d | (stencil & 0xff) << 24).to_le_bytes().to_vec()
                }
                Format::D32SfloatS8Uint => {
                    let mut bytes = depth.to_le_bytes().to_vec();
                    bytes.extend_from_slice(&[stencil as u8, 0, 0, 0]);
                    bytes
                }
                color => vec![0; color.bytes_per_pixel() as usize],
            }
        }
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    let c = c.clamp(0.0, 1.0);
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn f16_bytes(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|v| f32_to_f16(*v).to_le_bytes())
        .collect()
}

/// IEEE binary16, truncating mantissa bits; good enough for clear colors
fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32 - 127 + 15;
    let mantissa = bits & 0x007f_ffff;
    if value.is_nan() {
        return sign | 0x7e00;
    }
    if exponent >= 0x1f {
        return sign | 0x7c00;
    }
    if exponent <= 0 {
        if exponent < -10 {
            return sign;
        }
        let mantissa = (mantissa | 0x0080_0000) >> (1 - exponent);
        return sign | (mantissa >> 13) as u16;
    }
    sign | ((exponent as u16) << 10) | (mantissa >> 13) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_colors_follow_channel_order() {
        let red = ClearValue::Color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(encode_pixel(Format::R8G8B8A8Unorm, red), vec![255, 0, 0, 255]);
        assert_eq!(encode_pixel(Format::B8G8R8A8Unorm, red), vec![0, 0, 255, 255]);
    }

    #[test]
    fn srgb_clears_are_gamma_encoded() {
        let grey = ClearValue::Color([0.5, 0.5, 0.5, 0.5]);
        let bytes = encode_pixel(Format::R8G8B8A8Srgb, grey);
        assert_eq!(bytes[0], 188);
        // Alpha stays linear
        assert_eq!(bytes[3], 128);
    }

    #[test]
    fn half_floats() {
        assert_eq!(f32_to_f16(1.0), 0x3c00);
        assert_eq!(f32_to_f16(-2.0), 0xc000);
        assert_eq!(f32_to_f16(0.0), 0);
        assert_eq!(f32_to_f16(f32::INFINITY), 0x7c00);
    }

    #[test]
    fn depth_stencil_packing() {
        let value = ClearValue::DepthStencil {
            depth: 1.0,
            stencil: 3,
        };
        assert_eq!(
            encode_pixel(Format::D24UnormS8Uint, value),
            vec![0xff, 0xff, 0xff, 3]
        );
        assert_eq!(encode_pixel(Format::D16Unorm, value), vec![0xff, 0xff]);

        // Depth never carries into the stencil byte
        let half = ClearValue::DepthStencil {
            depth: 0.5,
            stencil: 0xff,
        };
        assert_eq!(
            encode_pixel(Format::D24UnormS8Uint, half),
            vec![0x00, 0x00, 0x80, 0xff]
        );
    }

    #[test]
    fn budget_rejects_oversized_allocations() {
        let budget = Arc::new(MemoryBudget {
            used: Mutex::new(0),
            limit: Some(100),
        });
        let first = Allocation::new(&budget, 60, ResourceKind::Buffer);
        assert!(first.is_ok());
        assert_eq!(
            Allocation::new(&budget, 60, ResourceKind::Buffer).err(),
            Some(RhiError::out_of_memory(ResourceKind::Buffer))
        );
        drop(first);
        assert!(Allocation::new(&budget, 60, ResourceKind::Buffer).is_ok());
    }
}
