// Command translation
//
// Metal records through one encoder at a time: render encoders live for a
// rendering scope, compute and blit encoders are opened on demand and closed
// as soon as a different kind of work arrives. Bindings recorded outside an
// encoder are remembered and replayed when the next one opens. Barriers are
// dropped; Metal tracks hazards on tracked resources itself.

use std::collections::BTreeMap;
use std::ffi::c_void;

use metal::{MTLBlitOption, MTLOrigin, MTLScissorRect, MTLSize, MTLViewport};

use super::conv;
use super::pipeline::{ComputeState, MetalPipeline, RenderState};
use super::resources::{
    buffer, texture, MetalBinding, MetalDescriptorSet, MetalTexture, BUFFER_SLOT_OFFSET,
    PUSH_CONSTANT_SLOT,
};
use crate::rhi::command::Command;
use crate::rhi::hal::downcast;
use crate::rhi::resource::{Buffer, Framebuffer, Texture};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

/// Largest push constant block; what `setBytes` accepts
pub const MAX_PUSH_CONSTANT_SIZE: usize = 4096;

type SetEntries = Vec<(u32, ShaderStages, MetalBinding)>;

enum Active {
    None,
    Render(metal::RenderCommandEncoder),
    Compute(metal::ComputeCommandEncoder),
    Blit(metal::BlitCommandEncoder),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BindPoint {
    Render,
    Compute,
}

#[derive(Default)]
struct RenderBindings {
    pipeline: Option<RenderState>,
    sets: BTreeMap<u32, SetEntries>,
    vertex_buffers: BTreeMap<u32, (metal::Buffer, u64)>,
    index_buffer: Option<(metal::Buffer, u64, IndexFormat)>,
}

#[derive(Default)]
struct ComputeBindings {
    pipeline: Option<ComputeState>,
    sets: BTreeMap<u32, SetEntries>,
}

/// Push constants accumulate into one block that is re-sent whole
#[derive(Default)]
struct PushConstants {
    data: Vec<u8>,
    stages: ShaderStages,
}

impl PushConstants {
    fn write(&mut self, stages: ShaderStages, offset: u32, bytes: &[u8]) -> RhiResult<()> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > MAX_PUSH_CONSTANT_SIZE {
            return Err(RhiError::Submission(format!(
                "push constants end at byte {end}, Metal accepts at most {MAX_PUSH_CONSTANT_SIZE}"
            )));
        }
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        self.stages |= stages;
        Ok(())
    }

    fn ptr(&self) -> *const c_void {
        self.data.as_ptr() as *const c_void
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct Encoder {
    command_buffer: metal::CommandBuffer,
    active: Active,
    bind_point: BindPoint,
    render: RenderBindings,
    compute: ComputeBindings,
    push_constants: PushConstants,
}

impl Encoder {
    pub fn new(queue: &metal::CommandQueue) -> Self {
        let command_buffer = queue.new_command_buffer().to_owned();
        command_buffer.set_label("rhi submission");
        Self {
            command_buffer,
            active: Active::None,
            bind_point: BindPoint::Render,
            render: RenderBindings::default(),
            compute: ComputeBindings::default(),
            push_constants: PushConstants::default(),
        }
    }

    pub fn encode(&mut self, command: &Command) -> RhiResult<()> {
        match command {
            Command::BeginRendering {
                framebuffer,
                load_ops,
            } => self.begin_rendering(framebuffer, load_ops)?,
            Command::EndRendering => self.close(),
            Command::BindPipeline(pipeline) => {
                match downcast::<MetalPipeline>(pipeline.raw().as_any(), ResourceKind::Pipeline)? {
                    MetalPipeline::Render(state) => {
                        self.bind_point = BindPoint::Render;
                        if let Active::Render(encoder) = &self.active {
                            apply_render_state(encoder, state);
                        }
                        self.render.pipeline = Some(state.clone());
                    }
                    MetalPipeline::Compute(state) => {
                        self.bind_point = BindPoint::Compute;
                        self.compute.pipeline = Some(state.clone());
                    }
                }
            }
            Command::SetViewport(v) => {
                if let Active::Render(encoder) = &self.active {
                    encoder.set_viewport(MTLViewport {
                        originX: f64::from(v.x),
                        originY: f64::from(v.y),
                        width: f64::from(v.width),
                        height: f64::from(v.height),
                        znear: f64::from(v.min_depth),
                        zfar: f64::from(v.max_depth),
                    });
                }
            }
            Command::SetScissor(rect) => {
                if let Active::Render(encoder) = &self.active {
                    encoder.set_scissor_rect(MTLScissorRect {
                        x: rect.x.max(0) as u64,
                        y: rect.y.max(0) as u64,
                        width: u64::from(rect.width),
                        height: u64::from(rect.height),
                    });
                }
            }
            Command::BindVertexBuffer {
                slot,
                buffer: vertex_buffer,
                offset,
            } => {
                if u64::from(*slot) >= BUFFER_SLOT_OFFSET {
                    return Err(RhiError::Submission(format!(
                        "vertex buffer slot {slot} collides with descriptor buffer slots"
                    )));
                }
                let raw = buffer(vertex_buffer)?.raw.clone();
                if let Active::Render(encoder) = &self.active {
                    encoder.set_vertex_buffer(u64::from(*slot), Some(&*raw), *offset);
                }
                self.render.vertex_buffers.insert(*slot, (raw, *offset));
            }
            Command::BindIndexBuffer {
                buffer: index_buffer,
                offset,
                format,
            } => {
                // Metal takes the index buffer with each indexed draw
                let raw = buffer(index_buffer)?.raw.clone();
                self.render.index_buffer = Some((raw, *offset, *format));
            }
            Command::BindDescriptorSet { index, set } => {
                let entries = downcast::<MetalDescriptorSet>(
                    set.raw().as_any(),
                    ResourceKind::DescriptorSet,
                )?
                .entries();
                match self.bind_point {
                    BindPoint::Render => {
                        if let Active::Render(encoder) = &self.active {
                            bind_render_set(encoder, &entries);
                        }
                        self.render.sets.insert(*index, entries);
                    }
                    BindPoint::Compute => {
                        self.compute.sets.insert(*index, entries);
                    }
                }
            }
            Command::PushConstants {
                stages,
                offset,
                data,
            } => {
                self.push_constants.write(*stages, *offset, data)?;
                if let Active::Render(encoder) = &self.active {
                    push_render_constants(encoder, &self.push_constants);
                }
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                let (encoder, state) = self.render_target("draw")?;
                encoder.draw_primitives_instanced_base_instance(
                    state.primitive,
                    u64::from(*first_vertex),
                    u64::from(*vertex_count),
                    u64::from(*instance_count),
                    u64::from(*first_instance),
                );
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                let (raw, offset, format) = self
                    .render
                    .index_buffer
                    .clone()
                    .ok_or_else(|| RhiError::Submission("indexed draw without an index buffer".into()))?;
                let (encoder, state) = self.render_target("draw_indexed")?;
                encoder.draw_indexed_primitives_instanced_base_instance(
                    state.primitive,
                    u64::from(*index_count),
                    conv::index_type(format),
                    &raw,
                    offset + u64::from(*first_index) * format.size(),
                    u64::from(*instance_count),
                    i64::from(*vertex_offset),
                    u64::from(*first_instance),
                );
            }
            Command::Dispatch { x, y, z } => self.dispatch(*x, *y, *z)?,
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = buffer(src)?;
                let dst = buffer(dst)?;
                self.blit().copy_from_buffer(&src.raw, *src_offset, &dst.raw, *dst_offset, *size);
            }
            Command::CopyBufferToTexture {
                src,
                src_offset,
                dst,
                mip_level,
            } => self.copy_buffer_to_texture(src, *src_offset, dst, *mip_level)?,
            Command::CopyTextureToBuffer {
                src,
                mip_level,
                dst,
                dst_offset,
            } => self.copy_texture_to_buffer(src, *mip_level, dst, *dst_offset)?,
            Command::BufferBarrier { .. } | Command::TextureBarrier { .. } => {}
        }
        Ok(())
    }

    /// End encoding and hand back the command buffer, ready to commit
    pub fn finish(mut self) -> metal::CommandBuffer {
        self.close();
        self.command_buffer.clone()
    }

    fn close(&mut self) {
        match std::mem::replace(&mut self.active, Active::None) {
            Active::None => {}
            Active::Render(encoder) => encoder.end_encoding(),
            Active::Compute(encoder) => encoder.end_encoding(),
            Active::Blit(encoder) => encoder.end_encoding(),
        }
    }

    fn render_target(&self, what: &str) -> RhiResult<(&metal::RenderCommandEncoderRef, &RenderState)> {
        let Active::Render(encoder) = &self.active else {
            return Err(RhiError::Submission(format!("{what} recorded outside a render pass")));
        };
        let state = self
            .render
            .pipeline
            .as_ref()
            .ok_or_else(|| RhiError::Submission(format!("{what} without a graphics pipeline")))?;
        Ok((encoder, state))
    }

    fn blit(&mut self) -> &metal::BlitCommandEncoderRef {
        if !matches!(self.active, Active::Blit(_)) {
            self.close();
            self.active = Active::Blit(self.command_buffer.new_blit_command_encoder().to_owned());
        }
        match &self.active {
            Active::Blit(encoder) => encoder,
            _ => unreachable!("blit encoder was just opened"),
        }
    }

    fn begin_rendering(&mut self, framebuffer: &Framebuffer, load_ops: &[LoadOp]) -> RhiResult<()> {
        self.close();
        let descriptor = metal::RenderPassDescriptor::new();

        let color_count = framebuffer.color_attachments().len();
        for (i, color) in framebuffer.color_attachments().iter().enumerate() {
            let raw = texture(color)?;
            let attachment = descriptor
                .color_attachments()
                .object_at(i as u64)
                .ok_or_else(|| RhiError::Submission("too many color attachments".into()))?;
            let load = load_ops.get(i).copied().unwrap_or(LoadOp::Load);
            attachment.set_texture(Some(&*raw.raw));
            attachment.set_load_action(conv::load_action(load));
            attachment.set_store_action(metal::MTLStoreAction::Store);
            if let LoadOp::Clear(ClearValue::Color([r, g, b, a])) = load {
                attachment.set_clear_color(metal::MTLClearColor::new(
                    f64::from(r),
                    f64::from(g),
                    f64::from(b),
                    f64::from(a),
                ));
            }
        }

        if let Some(depth) = framebuffer.depth_attachment() {
            let raw = texture(depth)?;
            let load = load_ops.get(color_count).copied().unwrap_or(LoadOp::Load);
            let (clear_depth, clear_stencil) = match load {
                LoadOp::Clear(ClearValue::DepthStencil { depth, stencil }) => (depth, stencil),
                _ => (1.0, 0),
            };
            if let Some(attachment) = descriptor.depth_attachment() {
                attachment.set_texture(Some(&*raw.raw));
                attachment.set_load_action(conv::load_action(load));
                attachment.set_store_action(metal::MTLStoreAction::Store);
                attachment.set_clear_depth(f64::from(clear_depth));
            }
            if raw.format.has_stencil() {
                if let Some(attachment) = descriptor.stencil_attachment() {
                    attachment.set_texture(Some(&*raw.raw));
                    attachment.set_load_action(conv::load_action(load));
                    attachment.set_store_action(metal::MTLStoreAction::Store);
                    attachment.set_clear_stencil(clear_stencil);
                }
            }
        }

        let encoder = self
            .command_buffer
            .new_render_command_encoder(descriptor)
            .to_owned();

        // Replay state bound before the pass opened
        let bindings = &self.render;
        if let Some(state) = &bindings.pipeline {
            apply_render_state(&encoder, state);
        }
        for entries in bindings.sets.values() {
            bind_render_set(&encoder, entries);
        }
        for (slot, (raw, offset)) in &bindings.vertex_buffers {
            encoder.set_vertex_buffer(u64::from(*slot), Some(&**raw), *offset);
        }
        push_render_constants(&encoder, &self.push_constants);

        self.active = Active::Render(encoder);
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        let state = self
            .compute
            .pipeline
            .clone()
            .ok_or_else(|| RhiError::Submission("dispatch without a compute pipeline".into()))?;
        if !matches!(self.active, Active::Compute(_)) {
            self.close();
            self.active = Active::Compute(self.command_buffer.new_compute_command_encoder().to_owned());
        }
        let Active::Compute(encoder) = &self.active else {
            unreachable!("compute encoder was just opened");
        };

        encoder.set_compute_pipeline_state(&state.state);
        for entries in self.compute.sets.values() {
            for (binding, stages, entry) in entries {
                if !stages.contains(ShaderStages::COMPUTE) {
                    continue;
                }
                let slot = u64::from(*binding);
                match entry {
                    MetalBinding::Buffer(raw) => {
                        encoder.set_buffer(slot + BUFFER_SLOT_OFFSET, Some(&**raw), 0)
                    }
                    MetalBinding::Texture(raw, sampler) => {
                        encoder.set_texture(slot, Some(&**raw));
                        encoder.set_sampler_state(slot, Some(&**sampler));
                    }
                }
            }
        }
        let push = &self.push_constants;
        if !push.is_empty() && push.stages.contains(ShaderStages::COMPUTE) {
            encoder.set_bytes(PUSH_CONSTANT_SLOT, push.len(), push.ptr());
        }
        encoder.dispatch_thread_groups(
            MTLSize::new(u64::from(x), u64::from(y), u64::from(z)),
            state.threadgroup,
        );
        Ok(())
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Texture,
        mip_level: u32,
    ) -> RhiResult<()> {
        let raw_src = buffer(src)?.raw.clone();
        let raw_dst = texture(dst)?;
        let layout = SliceLayout::new(dst, raw_dst, mip_level)?;
        let blit = self.blit();
        for slice in 0..layout.slices {
            blit.copy_from_buffer_to_texture(
                &raw_src,
                src_offset + slice * layout.image_bytes,
                layout.row_bytes,
                layout.image_bytes,
                layout.size,
                &raw_dst.raw,
                slice,
                u64::from(mip_level),
                MTLOrigin { x: 0, y: 0, z: 0 },
                MTLBlitOption::empty(),
            );
        }
        Ok(())
    }

    fn copy_texture_to_buffer(
        &mut self,
        src: &Texture,
        mip_level: u32,
        dst: &Buffer,
        dst_offset: u64,
    ) -> RhiResult<()> {
        let raw_src = texture(src)?;
        let raw_dst = buffer(dst)?.raw.clone();
        let layout = SliceLayout::new(src, raw_src, mip_level)?;
        let blit = self.blit();
        for slice in 0..layout.slices {
            blit.copy_from_texture_to_buffer(
                &raw_src.raw,
                slice,
                u64::from(mip_level),
                MTLOrigin { x: 0, y: 0, z: 0 },
                layout.size,
                &raw_dst,
                dst_offset + slice * layout.image_bytes,
                layout.row_bytes,
                layout.image_bytes,
                MTLBlitOption::empty(),
            );
        }
        Ok(())
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        // A command buffer must not be released with an encoder still open
        self.close();
    }
}

fn apply_render_state(encoder: &metal::RenderCommandEncoderRef, state: &RenderState) {
    encoder.set_render_pipeline_state(&state.state);
    encoder.set_cull_mode(state.cull);
    encoder.set_front_facing_winding(state.winding);
    encoder.set_triangle_fill_mode(state.fill);
    if let Some(depth) = &state.depth {
        encoder.set_depth_stencil_state(depth);
    }
    let (constant, slope) = state.depth_bias.unwrap_or((0.0, 0.0));
    encoder.set_depth_bias(constant, slope, 0.0);
}

fn bind_render_set(encoder: &metal::RenderCommandEncoderRef, entries: &SetEntries) {
    for (binding, stages, entry) in entries {
        let slot = u64::from(*binding);
        match entry {
            MetalBinding::Buffer(raw) => {
                if stages.contains(ShaderStages::VERTEX) {
                    encoder.set_vertex_buffer(slot + BUFFER_SLOT_OFFSET, Some(&**raw), 0);
                }
                if stages.contains(ShaderStages::FRAGMENT) {
                    encoder.set_fragment_buffer(slot + BUFFER_SLOT_OFFSET, Some(&**raw), 0);
                }
            }
            MetalBinding::Texture(raw, sampler) => {
                if stages.contains(ShaderStages::VERTEX) {
                    encoder.set_vertex_texture(slot, Some(&**raw));
                    encoder.set_vertex_sampler_state(slot, Some(&**sampler));
                }
                if stages.contains(ShaderStages::FRAGMENT) {
                    encoder.set_fragment_texture(slot, Some(&**raw));
                    encoder.set_fragment_sampler_state(slot, Some(&**sampler));
                }
            }
        }
    }
}

fn push_render_constants(encoder: &metal::RenderCommandEncoderRef, push: &PushConstants) {
    if push.is_empty() {
        return;
    }
    if push.stages.contains(ShaderStages::VERTEX) {
        encoder.set_vertex_bytes(PUSH_CONSTANT_SLOT, push.len(), push.ptr());
    }
    if push.stages.contains(ShaderStages::FRAGMENT) {
        encoder.set_fragment_bytes(PUSH_CONSTANT_SLOT, push.len(), push.ptr());
    }
}

/// Geometry of a whole-mip blit between a texture and tightly packed rows,
/// one image per array slice
struct SliceLayout {
    size: MTLSize,
    row_bytes: u64,
    image_bytes: u64,
    slices: u64,
}

impl SliceLayout {
    fn new(texture: &Texture, raw: &MetalTexture, mip_level: u32) -> RhiResult<Self> {
        let desc = texture.desc();
        if desc.format.has_stencil() {
            return Err(RhiError::Submission(
                "Metal cannot copy combined depth-stencil textures through buffers".into(),
            ));
        }
        let (width, height, depth) = desc.mip_extent(mip_level);
        let row_bytes = u64::from(width) * u64::from(desc.format.bytes_per_pixel());
        let image_bytes = row_bytes * u64::from(height);
        Ok(Self {
            size: MTLSize::new(u64::from(width), u64::from(height), u64::from(depth)),
            row_bytes,
            image_bytes,
            slices: raw.slice_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_accumulate_into_one_block() {
        let mut push = PushConstants::default();
        push.write(ShaderStages::VERTEX, 16, &[1, 2, 3, 4]).unwrap();
        push.write(ShaderStages::FRAGMENT, 0, &[9; 4]).unwrap();
        assert_eq!(push.len(), 20);
        assert_eq!(&push.data[0..4], &[9; 4]);
        assert_eq!(&push.data[4..16], &[0; 12]);
        assert_eq!(push.stages, ShaderStages::ALL_GRAPHICS);
    }

    #[test]
    fn push_constants_are_capped() {
        let mut push = PushConstants::default();
        let err = push
            .write(ShaderStages::COMPUTE, MAX_PUSH_CONSTANT_SIZE as u32, &[0; 4])
            .unwrap_err();
        assert!(matches!(err, RhiError::Submission(_)));
        assert!(push.is_empty());
    }
}
