// Command recording
//
// A command buffer is an append-only list of operations bound to one device
// and one queue type. Backends translate the list in order at submission, so
// program order is whatever order the caller recorded in.
//
// Lifecycle: Recording -> Ready (finish) -> Submitted -> Completed.
// `reset` returns to Recording and is only legal once the submission has
// completed on the GPU.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::device::DeviceShared;
use super::error::{RhiError, RhiResult};
use super::resource::{
    Buffer, DescriptorSet, Framebuffer, Pipeline, PipelineKind, ResourceCommon, Texture,
};
use super::types::*;

/// One recorded GPU operation. Holds clones of every handle it references,
/// which keeps them alive until the submission retires.
#[derive(Clone)]
pub enum Command {
    /// `load_ops` has one entry per color attachment, then one for depth if present
    BeginRendering {
        framebuffer: Framebuffer,
        load_ops: Vec<LoadOp>,
    },
    EndRendering,
    BindPipeline(Pipeline),
    SetViewport(Viewport),
    SetScissor(Rect2D),
    BindVertexBuffer {
        slot: u32,
        buffer: Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: Buffer,
        offset: u64,
        format: IndexFormat,
    },
    BindDescriptorSet {
        index: u32,
        set: DescriptorSet,
    },
    PushConstants {
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: Buffer,
        src_offset: u64,
        dst: Buffer,
        dst_offset: u64,
        size: u64,
    },
    /// Whole mip level, tightly packed rows starting at `src_offset`
    CopyBufferToTexture {
        src: Buffer,
        src_offset: u64,
        dst: Texture,
        mip_level: u32,
    },
    /// Whole mip level, tightly packed rows starting at `dst_offset`
    CopyTextureToBuffer {
        src: Texture,
        mip_level: u32,
        dst: Buffer,
        dst_offset: u64,
    },
    BufferBarrier {
        buffer: Buffer,
        from: ResourceState,
        to: ResourceState,
    },
    TextureBarrier {
        texture: Texture,
        from: ResourceState,
        to: ResourceState,
    },
}

/// Borrowed view of a handle referenced by a command
pub enum ResourceRef<'a> {
    Buffer(&'a Buffer),
    /// `written` is true when the command stores into the texture
    Texture { texture: &'a Texture, written: bool },
    Pipeline(&'a Pipeline),
    DescriptorSet(&'a DescriptorSet),
}

impl Command {
    /// Visit every resource the command touches, including framebuffer attachments
    pub fn for_each_resource(&self, f: &mut dyn FnMut(ResourceRef<'_>)) {
        match self {
            Command::BeginRendering { framebuffer, .. } => {
                for texture in framebuffer.desc().attachments() {
                    f(ResourceRef::Texture {
                        texture,
                        written: true,
                    });
                }
            }
            Command::BindPipeline(pipeline) => f(ResourceRef::Pipeline(pipeline)),
            Command::BindVertexBuffer { buffer, .. } | Command::BindIndexBuffer { buffer, .. } => {
                f(ResourceRef::Buffer(buffer))
            }
            Command::BindDescriptorSet { set, .. } => f(ResourceRef::DescriptorSet(set)),
            Command::CopyBuffer { src, dst, .. } => {
                f(ResourceRef::Buffer(src));
                f(ResourceRef::Buffer(dst));
            }
            Command::CopyBufferToTexture { src, dst, .. } => {
                f(ResourceRef::Buffer(src));
                f(ResourceRef::Texture {
                    texture: dst,
                    written: true,
                });
            }
            Command::CopyTextureToBuffer { src, dst, .. } => {
                f(ResourceRef::Texture {
                    texture: src,
                    written: false,
                });
                f(ResourceRef::Buffer(dst));
            }
            Command::BufferBarrier { buffer, .. } => f(ResourceRef::Buffer(buffer)),
            Command::TextureBarrier { texture, .. } => f(ResourceRef::Texture {
                texture,
                written: false,
            }),
            Command::EndRendering
            | Command::SetViewport(_)
            | Command::SetScissor(_)
            | Command::PushConstants { .. }
            | Command::Draw { .. }
            | Command::DrawIndexed { .. }
            | Command::Dispatch { .. } => {}
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::BeginRendering { .. } => "begin_rendering",
            Command::EndRendering => "end_rendering",
            Command::BindPipeline(_) => "bind_pipeline",
            Command::SetViewport(_) => "set_viewport",
            Command::SetScissor(_) => "set_scissor",
            Command::BindVertexBuffer { .. } => "bind_vertex_buffer",
            Command::BindIndexBuffer { .. } => "bind_index_buffer",
            Command::BindDescriptorSet { .. } => "bind_descriptor_set",
            Command::PushConstants { .. } => "push_constants",
            Command::Draw { .. } => "draw",
            Command::DrawIndexed { .. } => "draw_indexed",
            Command::Dispatch { .. } => "dispatch",
            Command::CopyBuffer { .. } => "copy_buffer",
            Command::CopyBufferToTexture { .. } => "copy_buffer_to_texture",
            Command::CopyTextureToBuffer { .. } => "copy_texture_to_buffer",
            Command::BufferBarrier { .. } => "buffer_barrier",
            Command::TextureBarrier { .. } => "texture_barrier",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// COMMAND BUFFER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Recording,
    Ready,
    Submitted,
    Completed,
}

impl fmt::Display for CommandBufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandBufferState::Recording => "recording",
            CommandBufferState::Ready => "ready",
            CommandBufferState::Submitted => "submitted",
            CommandBufferState::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Status {
    Recording,
    Ready,
    /// Claimed by one `submit` call that has not returned yet
    Submitting,
    Submitted(SubmissionIndex),
}

#[derive(Clone, Copy)]
struct RenderingScope {
    extent: (u32, u32),
}

#[derive(Clone, Copy)]
struct BoundPipeline {
    kind: PipelineKind,
    push_constants: Option<PushConstantRange>,
    set_count: u32,
}

struct Recorder {
    status: Status,
    commands: Arc<Vec<Command>>,
    rendering: Option<RenderingScope>,
    pipeline: Option<BoundPipeline>,
    index_bound: bool,
}

impl Recorder {
    fn new() -> Self {
        Self {
            status: Status::Recording,
            commands: Arc::new(Vec::new()),
            rendering: None,
            pipeline: None,
            index_bound: false,
        }
    }
}

#[derive(Clone)]
pub struct CommandBuffer {
    inner: Arc<CommandBufferInner>,
}

struct CommandBufferInner {
    common: ResourceCommon,
    queue: QueueType,
    label: Option<String>,
    recorder: Mutex<Recorder>,
}

impl CommandBuffer {
    pub(crate) fn new(common: ResourceCommon, queue: QueueType, label: Option<String>) -> Self {
        Self {
            inner: Arc::new(CommandBufferInner {
                common,
                queue,
                label,
                recorder: Mutex::new(Recorder::new()),
            }),
        }
    }

    pub fn queue(&self) -> QueueType {
        self.inner.queue
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.common.device_id()
    }

    fn device(&self) -> &Arc<DeviceShared> {
        &self.inner.common.device
    }

    pub fn state(&self) -> CommandBufferState {
        let status = self.inner.recorder.lock().status;
        self.resolve(status)
    }

    fn resolve(&self, status: Status) -> CommandBufferState {
        match status {
            Status::Recording => CommandBufferState::Recording,
            Status::Ready => CommandBufferState::Ready,
            Status::Submitting => CommandBufferState::Submitted,
            Status::Submitted(index) if index <= self.device().completed_index() => {
                CommandBufferState::Completed
            }
            Status::Submitted(_) => CommandBufferState::Submitted,
        }
    }

    /// Number of recorded operations
    pub fn len(&self) -> usize {
        self.inner.recorder.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Close recording. The buffer becomes ready for submission.
    pub fn finish(&self) -> RhiResult<()> {
        self.device().check()?;
        let mut rec = self.inner.recorder.lock();
        self.ensure_recording(&rec, "finish")?;
        if rec.rendering.is_some() {
            return Err(RhiError::InvalidUsage(
                "finish called inside a rendering scope; call end_rendering first".into(),
            ));
        }
        rec.status = Status::Ready;
        Ok(())
    }

    /// Discard the recorded operations and start recording again.
    /// Only legal after the last submission completed.
    pub fn reset(&self) -> RhiResult<()> {
        self.device().check()?;
        let mut rec = self.inner.recorder.lock();
        let state = self.resolve(rec.status);
        if state != CommandBufferState::Completed {
            return Err(RhiError::Submission(format!(
                "command buffer can only be reset after completion (currently {state})"
            )));
        }
        *rec = Recorder::new();
        Ok(())
    }

    /// Commands to hand to the backend. Fails unless the buffer is ready, and
    /// claims it so concurrent submits of a clone fail. Follow up with
    /// `mark_submitted` or `cancel_submit`.
    pub(crate) fn take_for_submit(&self) -> RhiResult<Arc<Vec<Command>>> {
        let mut rec = self.inner.recorder.lock();
        match self.resolve(rec.status) {
            CommandBufferState::Ready => {
                rec.status = Status::Submitting;
                Ok(Arc::clone(&rec.commands))
            }
            state => Err(RhiError::Submission(format!(
                "only finished command buffers can be submitted (currently {state})"
            ))),
        }
    }

    pub(crate) fn mark_submitted(&self, index: SubmissionIndex) {
        self.inner.recorder.lock().status = Status::Submitted(index);
    }

    pub(crate) fn cancel_submit(&self) {
        let mut rec = self.inner.recorder.lock();
        if matches!(rec.status, Status::Submitting) {
            rec.status = Status::Ready;
        }
    }

    fn ensure_recording(&self, rec: &Recorder, op: &str) -> RhiResult<()> {
        match rec.status {
            Status::Recording => Ok(()),
            status => Err(RhiError::Submission(format!(
                "cannot record {op}: command buffer is {}",
                self.resolve(status)
            ))),
        }
    }

    fn record(
        &self,
        op: &str,
        build: impl FnOnce(&mut Recorder) -> RhiResult<Command>,
    ) -> RhiResult<()> {
        self.device().check()?;
        let mut rec = self.inner.recorder.lock();
        self.ensure_recording(&rec, op)?;
        let command = build(&mut rec)?;
        Arc::make_mut(&mut rec.commands).push(command);
        Ok(())
    }

    fn require_queue(&self, op: &str, allowed: &[QueueType]) -> RhiResult<()> {
        if allowed.contains(&self.queue()) {
            Ok(())
        } else {
            Err(RhiError::InvalidUsage(format!(
                "{op} is not allowed on a {:?} queue",
                self.queue()
            )))
        }
    }

    fn outside_rendering(rec: &Recorder, op: &str) -> RhiResult<()> {
        if rec.rendering.is_some() {
            return Err(RhiError::InvalidUsage(format!(
                "{op} is not allowed inside a rendering scope"
            )));
        }
        Ok(())
    }

    fn inside_rendering(rec: &Recorder, op: &str) -> RhiResult<RenderingScope> {
        rec.rendering.ok_or_else(|| {
            RhiError::InvalidUsage(format!("{op} requires an open rendering scope"))
        })
    }

    fn same_device(&self, other: DeviceId, what: &str) -> RhiResult<()> {
        if other != self.device_id() {
            return Err(RhiError::InvalidUsage(format!(
                "{what} belongs to a different device than the command buffer"
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    /// Open a rendering scope on `framebuffer`. `load_ops` lists one entry per
    /// color attachment followed by one for the depth attachment; missing
    /// entries default to `LoadOp::Load`. Viewport and scissor start out
    /// covering the whole framebuffer.
    pub fn begin_rendering(&self, framebuffer: &Framebuffer, load_ops: &[LoadOp]) -> RhiResult<()> {
        self.require_queue("begin_rendering", &[QueueType::Graphics])?;
        self.same_device(framebuffer.device_id(), "framebuffer")?;
        let color_count = framebuffer.color_attachments().len();
        let attachment_count = color_count + usize::from(framebuffer.depth_attachment().is_some());
        if load_ops.len() > attachment_count {
            return Err(RhiError::InvalidUsage(format!(
                "{} load ops given for {attachment_count} attachments",
                load_ops.len()
            )));
        }
        for (i, op) in load_ops.iter().enumerate() {
            let is_depth = i >= color_count;
            match op {
                LoadOp::Clear(ClearValue::Color(_)) if is_depth => {
                    return Err(RhiError::InvalidUsage(
                        "depth attachment cleared with a color value".into(),
                    ))
                }
                LoadOp::Clear(ClearValue::DepthStencil { .. }) if !is_depth => {
                    return Err(RhiError::InvalidUsage(format!(
                        "color attachment {i} cleared with a depth value"
                    )))
                }
                _ => {}
            }
        }
        let mut ops = load_ops.to_vec();
        ops.resize(attachment_count, LoadOp::Load);

        self.record("begin_rendering", |rec| {
            Self::outside_rendering(rec, "begin_rendering")?;
            rec.rendering = Some(RenderingScope {
                extent: framebuffer.extent(),
            });
            Ok(Command::BeginRendering {
                framebuffer: framebuffer.clone(),
                load_ops: ops,
            })
        })
    }

    pub fn end_rendering(&self) -> RhiResult<()> {
        self.record("end_rendering", |rec| {
            Self::inside_rendering(rec, "end_rendering")?;
            rec.rendering = None;
            Ok(Command::EndRendering)
        })
    }

    pub fn bind_pipeline(&self, pipeline: &Pipeline) -> RhiResult<()> {
        self.same_device(pipeline.device_id(), "pipeline")?;
        match pipeline.kind() {
            PipelineKind::Graphics => self.require_queue("graphics pipeline", &[QueueType::Graphics])?,
            PipelineKind::Compute => self.require_queue(
                "compute pipeline",
                &[QueueType::Graphics, QueueType::Compute],
            )?,
        }
        self.record("bind_pipeline", |rec| {
            rec.pipeline = Some(BoundPipeline {
                kind: pipeline.kind(),
                push_constants: pipeline.desc().push_constants(),
                set_count: pipeline.desc().descriptor_layouts().len() as u32,
            });
            Ok(Command::BindPipeline(pipeline.clone()))
        })
    }

    pub fn set_viewport(&self, viewport: Viewport) -> RhiResult<()> {
        if viewport.width <= 0.0 || viewport.height <= 0.0 {
            return Err(RhiError::InvalidUsage("viewport must have a positive size".into()));
        }
        self.record("set_viewport", |rec| {
            Self::inside_rendering(rec, "set_viewport")?;
            Ok(Command::SetViewport(viewport))
        })
    }

    pub fn set_scissor(&self, scissor: Rect2D) -> RhiResult<()> {
        self.record("set_scissor", |rec| {
            let scope = Self::inside_rendering(rec, "set_scissor")?;
            let right = i64::from(scissor.x) + i64::from(scissor.width);
            let bottom = i64::from(scissor.y) + i64::from(scissor.height);
            if scissor.x < 0
                || scissor.y < 0
                || right > i64::from(scope.extent.0)
                || bottom > i64::from(scope.extent.1)
            {
                return Err(RhiError::InvalidUsage(
                    "scissor rectangle exceeds the framebuffer".into(),
                ));
            }
            Ok(Command::SetScissor(scissor))
        })
    }

    pub fn bind_vertex_buffer(&self, slot: u32, buffer: &Buffer, offset: u64) -> RhiResult<()> {
        self.same_device(buffer.device_id(), "vertex buffer")?;
        if !buffer.usage().contains(BufferUsage::VERTEX) {
            return Err(RhiError::InvalidUsage("buffer lacks VERTEX usage".into()));
        }
        if offset >= buffer.size() {
            return Err(RhiError::InvalidUsage("vertex buffer offset past the end".into()));
        }
        self.record("bind_vertex_buffer", |_| {
            Ok(Command::BindVertexBuffer {
                slot,
                buffer: buffer.clone(),
                offset,
            })
        })
    }

    pub fn bind_index_buffer(&self, buffer: &Buffer, offset: u64, format: IndexFormat) -> RhiResult<()> {
        self.same_device(buffer.device_id(), "index buffer")?;
        if !buffer.usage().contains(BufferUsage::INDEX) {
            return Err(RhiError::InvalidUsage("buffer lacks INDEX usage".into()));
        }
        if offset >= buffer.size() || offset % format.size() != 0 {
            return Err(RhiError::InvalidUsage(
                "index buffer offset out of range or misaligned".into(),
            ));
        }
        self.record("bind_index_buffer", |rec| {
            rec.index_bound = true;
            Ok(Command::BindIndexBuffer {
                buffer: buffer.clone(),
                offset,
                format,
            })
        })
    }

    /// Bind `set` at `index` of the currently bound pipeline's layout
    pub fn bind_descriptor_set(&self, index: u32, set: &DescriptorSet) -> RhiResult<()> {
        self.same_device(set.device_id(), "descriptor set")?;
        self.record("bind_descriptor_set", |rec| {
            let pipeline = rec.pipeline.ok_or_else(|| {
                RhiError::InvalidUsage("bind a pipeline before binding descriptor sets".into())
            })?;
            if index >= pipeline.set_count {
                return Err(RhiError::InvalidUsage(format!(
                    "pipeline layout has {} descriptor set(s), cannot bind index {index}",
                    pipeline.set_count
                )));
            }
            Ok(Command::BindDescriptorSet {
                index,
                set: set.clone(),
            })
        })
    }

    pub fn push_constants(&self, stages: ShaderStages, offset: u32, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() || data.len() % 4 != 0 || offset % 4 != 0 {
            return Err(RhiError::InvalidUsage(
                "push constant data and offset must be non-empty multiples of 4 bytes".into(),
            ));
        }
        self.record("push_constants", |rec| {
            let range = rec
                .pipeline
                .and_then(|p| p.push_constants)
                .ok_or_else(|| {
                    RhiError::InvalidUsage("bound pipeline declares no push constants".into())
                })?;
            let end = u64::from(offset) + data.len() as u64;
            if offset < range.offset || end > u64::from(range.offset) + u64::from(range.size) {
                return Err(RhiError::InvalidUsage(
                    "push constant write exceeds the pipeline's push constant range".into(),
                ));
            }
            if !range.stages.contains(stages) {
                return Err(RhiError::InvalidUsage(
                    "push constant stages not declared by the pipeline".into(),
                ));
            }
            Ok(Command::PushConstants {
                stages,
                offset,
                data: data.to_vec(),
            })
        })
    }

    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.record("draw", |rec| {
            Self::inside_rendering(rec, "draw")?;
            Self::require_pipeline(rec, PipelineKind::Graphics, "draw")?;
            Ok(Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            })
        })
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.record("draw_indexed", |rec| {
            Self::inside_rendering(rec, "draw_indexed")?;
            Self::require_pipeline(rec, PipelineKind::Graphics, "draw_indexed")?;
            if !rec.index_bound {
                return Err(RhiError::InvalidUsage(
                    "draw_indexed requires a bound index buffer".into(),
                ));
            }
            Ok(Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            })
        })
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.require_queue("dispatch", &[QueueType::Graphics, QueueType::Compute])?;
        if !self.device().backend.capabilities().supports_compute {
            return Err(RhiError::InvalidUsage(
                "compute is not supported by this backend".into(),
            ));
        }
        self.record("dispatch", |rec| {
            Self::outside_rendering(rec, "dispatch")?;
            Self::require_pipeline(rec, PipelineKind::Compute, "dispatch")?;
            Ok(Command::Dispatch { x, y, z })
        })
    }

    fn require_pipeline(rec: &Recorder, kind: PipelineKind, op: &str) -> RhiResult<()> {
        match rec.pipeline {
            Some(p) if p.kind == kind => Ok(()),
            _ => Err(RhiError::InvalidUsage(format!(
                "{op} requires a bound {kind:?} pipeline"
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Transfers & barriers
    // -------------------------------------------------------------------------

    pub fn copy_buffer(
        &self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        self.same_device(src.device_id(), "copy source")?;
        self.same_device(dst.device_id(), "copy destination")?;
        if !src.usage().contains(BufferUsage::TRANSFER_SRC) {
            return Err(RhiError::InvalidUsage("copy source lacks TRANSFER_SRC usage".into()));
        }
        if !dst.usage().contains(BufferUsage::TRANSFER_DST) {
            return Err(RhiError::InvalidUsage(
                "copy destination lacks TRANSFER_DST usage".into(),
            ));
        }
        if size == 0 {
            return Err(RhiError::InvalidUsage("copy size must be non-zero".into()));
        }
        check_range(src_offset, size, src.size())?;
        check_range(dst_offset, size, dst.size())?;
        if src.ptr_eq(dst) && src_offset < dst_offset + size && dst_offset < src_offset + size {
            return Err(RhiError::InvalidUsage("overlapping copy within one buffer".into()));
        }
        self.record("copy_buffer", |rec| {
            Self::outside_rendering(rec, "copy_buffer")?;
            Ok(Command::CopyBuffer {
                src: src.clone(),
                src_offset,
                dst: dst.clone(),
                dst_offset,
                size,
            })
        })
    }

    pub fn copy_buffer_to_texture(
        &self,
        src: &Buffer,
        src_offset: u64,
        dst: &Texture,
        mip_level: u32,
    ) -> RhiResult<()> {
        self.same_device(src.device_id(), "copy source")?;
        self.same_device(dst.device_id(), "copy destination")?;
        if !src.usage().contains(BufferUsage::TRANSFER_SRC) {
            return Err(RhiError::InvalidUsage("copy source lacks TRANSFER_SRC usage".into()));
        }
        if !dst.usage().contains(TextureUsage::TRANSFER_DST) {
            return Err(RhiError::InvalidUsage(
                "copy destination lacks TRANSFER_DST usage".into(),
            ));
        }
        if mip_level >= dst.desc().mip_levels {
            return Err(RhiError::InvalidUsage(format!("texture has no mip level {mip_level}")));
        }
        check_range(src_offset, dst.desc().mip_byte_size(mip_level), src.size())?;
        self.record("copy_buffer_to_texture", |rec| {
            Self::outside_rendering(rec, "copy_buffer_to_texture")?;
            Ok(Command::CopyBufferToTexture {
                src: src.clone(),
                src_offset,
                dst: dst.clone(),
                mip_level,
            })
        })
    }

    pub fn copy_texture_to_buffer(
        &self,
        src: &Texture,
        mip_level: u32,
        dst: &Buffer,
        dst_offset: u64,
    ) -> RhiResult<()> {
        self.same_device(src.device_id(), "copy source")?;
        self.same_device(dst.device_id(), "copy destination")?;
        if !src.usage().contains(TextureUsage::TRANSFER_SRC) {
            return Err(RhiError::InvalidUsage("copy source lacks TRANSFER_SRC usage".into()));
        }
        if !dst.usage().contains(BufferUsage::TRANSFER_DST) {
            return Err(RhiError::InvalidUsage(
                "copy destination lacks TRANSFER_DST usage".into(),
            ));
        }
        if mip_level >= src.desc().mip_levels {
            return Err(RhiError::InvalidUsage(format!("texture has no mip level {mip_level}")));
        }
        check_range(dst_offset, src.desc().mip_byte_size(mip_level), dst.size())?;
        self.record("copy_texture_to_buffer", |rec| {
            Self::outside_rendering(rec, "copy_texture_to_buffer")?;
            Ok(Command::CopyTextureToBuffer {
                src: src.clone(),
                mip_level,
                dst: dst.clone(),
                dst_offset,
            })
        })
    }

    pub fn buffer_barrier(&self, buffer: &Buffer, from: ResourceState, to: ResourceState) -> RhiResult<()> {
        self.same_device(buffer.device_id(), "buffer")?;
        self.record("buffer_barrier", |rec| {
            Self::outside_rendering(rec, "buffer_barrier")?;
            Ok(Command::BufferBarrier {
                buffer: buffer.clone(),
                from,
                to,
            })
        })
    }

    pub fn texture_barrier(&self, texture: &Texture, from: ResourceState, to: ResourceState) -> RhiResult<()> {
        self.same_device(texture.device_id(), "texture")?;
        self.record("texture_barrier", |rec| {
            Self::outside_rendering(rec, "texture_barrier")?;
            Ok(Command::TextureBarrier {
                texture: texture.clone(),
                from,
                to,
            })
        })
    }
}

fn check_range(offset: u64, len: u64, size: u64) -> RhiResult<()> {
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(RhiError::BufferOverflow { offset, len, size });
    }
    Ok(())
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("label", &self.label())
            .field("queue", &self.queue())
            .field("state", &self.state())
            .finish()
    }
}
