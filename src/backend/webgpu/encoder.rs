// Command translation
//
// RHI command lists are flat; WebGPU groups draws into render passes and
// dispatches into compute passes. Bindings made outside a pass are remembered
// and replayed when the next pass opens. Barriers are dropped since wgpu
// tracks resource usage itself.

use std::collections::BTreeMap;

use super::conv;
use super::pipeline::{RawPipeline, WebGpuPipeline};
use super::resources::{buffer, texture, WebGpuDescriptorSet};
use crate::rhi::command::Command;
use crate::rhi::hal::downcast;
use crate::rhi::resource::{Buffer, Framebuffer, Texture};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

#[derive(Default)]
struct RenderBindings {
    pipeline: Option<wgpu::RenderPipeline>,
    sets: BTreeMap<u32, wgpu::BindGroup>,
    vertex_buffers: BTreeMap<u32, (wgpu::Buffer, u64)>,
    index_buffer: Option<(wgpu::Buffer, u64, wgpu::IndexFormat)>,
    push_constants: Vec<(wgpu::ShaderStages, u32, Vec<u8>)>,
}

#[derive(Default)]
struct ComputeBindings {
    pipeline: Option<wgpu::ComputePipeline>,
    sets: BTreeMap<u32, wgpu::BindGroup>,
    push_constants: Vec<(u32, Vec<u8>)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BindPoint {
    Render,
    Compute,
}

pub struct Encoder<'a> {
    device: &'a wgpu::Device,
    encoder: wgpu::CommandEncoder,
    pass: Option<wgpu::RenderPass<'static>>,
    pass_extent: (u32, u32),
    bind_point: BindPoint,
    render: RenderBindings,
    compute: ComputeBindings,
}

impl<'a> Encoder<'a> {
    pub fn new(device: &'a wgpu::Device) -> Self {
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("rhi submission"),
        });
        Self {
            device,
            encoder,
            pass: None,
            pass_extent: (0, 0),
            bind_point: BindPoint::Render,
            render: RenderBindings::default(),
            compute: ComputeBindings::default(),
        }
    }

    pub fn encode(&mut self, command: &Command) -> RhiResult<()> {
        match command {
            Command::BeginRendering {
                framebuffer,
                load_ops,
            } => self.begin_rendering(framebuffer, load_ops)?,
            Command::EndRendering => {
                // Dropping the pass ends it
                self.pass = None;
            }
            Command::BindPipeline(pipeline) => {
                let raw = downcast::<WebGpuPipeline>(pipeline.raw().as_any(), ResourceKind::Pipeline)?;
                match &raw.raw {
                    RawPipeline::Render(p) => {
                        self.bind_point = BindPoint::Render;
                        if let Some(pass) = &mut self.pass {
                            pass.set_pipeline(p);
                        }
                        self.render.pipeline = Some(p.clone());
                    }
                    RawPipeline::Compute(p) => {
                        self.bind_point = BindPoint::Compute;
                        self.compute.pipeline = Some(p.clone());
                    }
                }
            }
            Command::SetViewport(v) => {
                if let Some(pass) = &mut self.pass {
                    pass.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
                }
            }
            Command::SetScissor(rect) => {
                let (x, y, width, height) = clamp_scissor(*rect, self.pass_extent);
                if let Some(pass) = &mut self.pass {
                    pass.set_scissor_rect(x, y, width, height);
                }
            }
            Command::BindVertexBuffer {
                slot,
                buffer: vertex_buffer,
                offset,
            } => {
                let raw = buffer(vertex_buffer)?.raw.clone();
                if let Some(pass) = &mut self.pass {
                    pass.set_vertex_buffer(*slot, raw.slice(*offset..));
                }
                self.render.vertex_buffers.insert(*slot, (raw, *offset));
            }
            Command::BindIndexBuffer {
                buffer: index_buffer,
                offset,
                format,
            } => {
                let raw = buffer(index_buffer)?.raw.clone();
                let format = conv::index_format(*format);
                if let Some(pass) = &mut self.pass {
                    pass.set_index_buffer(raw.slice(*offset..), format);
                }
                self.render.index_buffer = Some((raw, *offset, format));
            }
            Command::BindDescriptorSet { index, set } => {
                let group = downcast::<WebGpuDescriptorSet>(set.raw().as_any(), ResourceKind::DescriptorSet)?
                    .bind_group()?;
                match self.bind_point {
                    BindPoint::Render => {
                        if let Some(pass) = &mut self.pass {
                            pass.set_bind_group(*index, &group, &[]);
                        }
                        self.render.sets.insert(*index, group);
                    }
                    BindPoint::Compute => {
                        self.compute.sets.insert(*index, group);
                    }
                }
            }
            Command::PushConstants {
                stages,
                offset,
                data,
            } => match self.bind_point {
                BindPoint::Render => {
                    let stages = conv::shader_stages(*stages);
                    if let Some(pass) = &mut self.pass {
                        pass.set_push_constants(stages, *offset, data);
                    }
                    let pushed = &mut self.render.push_constants;
                    pushed.retain(|(s, o, _)| !(*s == stages && *o == *offset));
                    pushed.push((stages, *offset, data.clone()));
                }
                BindPoint::Compute => {
                    let pushed = &mut self.compute.push_constants;
                    pushed.retain(|(o, _)| *o != *offset);
                    pushed.push((*offset, data.clone()));
                }
            },
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                let pass = self.pass_mut("draw")?;
                pass.draw(
                    *first_vertex..first_vertex + vertex_count,
                    *first_instance..first_instance + instance_count,
                );
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                let pass = self.pass_mut("draw_indexed")?;
                pass.draw_indexed(
                    *first_index..first_index + index_count,
                    *vertex_offset,
                    *first_instance..first_instance + instance_count,
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
                if (src_offset | dst_offset | size) % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
                    return Err(RhiError::Submission(format!(
                        "WebGPU buffer copies need 4-byte aligned offsets and sizes \
                         (src {src_offset}, dst {dst_offset}, size {size})"
                    )));
                }
                self.encoder.copy_buffer_to_buffer(
                    &buffer(src)?.raw,
                    *src_offset,
                    &buffer(dst)?.raw,
                    *dst_offset,
                    *size,
                );
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

    pub fn finish(mut self) -> wgpu::CommandBuffer {
        self.pass = None;
        self.encoder.finish()
    }

    fn pass_mut(&mut self, what: &str) -> RhiResult<&mut wgpu::RenderPass<'static>> {
        self.pass
            .as_mut()
            .ok_or_else(|| RhiError::Submission(format!("{what} recorded outside a render pass")))
    }

    fn begin_rendering(&mut self, framebuffer: &Framebuffer, load_ops: &[LoadOp]) -> RhiResult<()> {
        let colors = framebuffer
            .color_attachments()
            .iter()
            .map(texture)
            .collect::<RhiResult<Vec<_>>>()?;
        let depth = framebuffer.depth_attachment().map(texture).transpose()?;

        let color_attachments: Vec<_> = colors
            .iter()
            .enumerate()
            .map(|(i, color)| {
                let load = load_ops.get(i).copied().unwrap_or(LoadOp::Load);
                Some(wgpu::RenderPassColorAttachment {
                    view: &color.attachment_view,
                    depth_slice: color.is_3d.then_some(0),
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: conv::color_load(load),
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_stencil_attachment = depth.map(|depth| {
            let load = load_ops.get(colors.len()).copied().unwrap_or(LoadOp::Load);
            let (depth_load, stencil_load) = conv::depth_load(load);
            wgpu::RenderPassDepthStencilAttachment {
                view: &depth.attachment_view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: depth.format.has_stencil().then_some(wgpu::Operations {
                    load: stencil_load,
                    store: wgpu::StoreOp::Store,
                }),
            }
        });

        let mut pass = self
            .encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: None,
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            })
            .forget_lifetime();

        // Replay state bound before the pass opened
        let bindings = &self.render;
        if let Some(pipeline) = &bindings.pipeline {
            pass.set_pipeline(pipeline);
            for (stages, offset, data) in &bindings.push_constants {
                pass.set_push_constants(*stages, *offset, data);
            }
        }
        for (index, group) in &bindings.sets {
            pass.set_bind_group(*index, group, &[]);
        }
        for (slot, (raw, offset)) in &bindings.vertex_buffers {
            pass.set_vertex_buffer(*slot, raw.slice(*offset..));
        }
        if let Some((raw, offset, format)) = &bindings.index_buffer {
            pass.set_index_buffer(raw.slice(*offset..), *format);
        }

        self.pass_extent = framebuffer.extent();
        self.pass = Some(pass);
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        let bindings = &self.compute;
        let pipeline = bindings
            .pipeline
            .as_ref()
            .ok_or_else(|| RhiError::Submission("dispatch without a compute pipeline".into()))?;
        let mut pass = self.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        for (index, group) in &bindings.sets {
            pass.set_bind_group(*index, group, &[]);
        }
        for (offset, data) in &bindings.push_constants {
            pass.set_push_constants(*offset, data);
        }
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Texture,
        mip_level: u32,
    ) -> RhiResult<()> {
        let layout = CopyLayout::new(dst, mip_level);
        let raw_src = buffer(src)?.raw.clone();
        let raw_dst = texture(dst)?;

        let (staging, offset) = if layout.is_aligned() {
            (raw_src, src_offset)
        } else {
            // Re-pitch tightly packed rows into a 256-byte aligned staging buffer
            layout.check_row_copies(src_offset)?;
            let staging = self.padded_staging(&layout);
            for row in 0..layout.row_count() {
                self.encoder.copy_buffer_to_buffer(
                    &raw_src,
                    src_offset + row * layout.row_bytes(),
                    &staging,
                    row * layout.padded_row_bytes(),
                    layout.row_bytes(),
                );
            }
            (staging, 0)
        };

        self.encoder.copy_buffer_to_texture(
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: layout.buffer_layout(offset),
            },
            wgpu::TexelCopyTextureInfo {
                texture: &raw_dst.raw,
                mip_level,
                origin: wgpu::Origin3d::ZERO,
                aspect: conv::aspect(raw_dst.format),
            },
            layout.extent,
        );
        Ok(())
    }

    fn copy_texture_to_buffer(
        &mut self,
        src: &Texture,
        mip_level: u32,
        dst: &Buffer,
        dst_offset: u64,
    ) -> RhiResult<()> {
        let layout = CopyLayout::new(src, mip_level);
        let raw_src = texture(src)?;
        let raw_dst = buffer(dst)?.raw.clone();

        let source = wgpu::TexelCopyTextureInfo {
            texture: &raw_src.raw,
            mip_level,
            origin: wgpu::Origin3d::ZERO,
            aspect: conv::aspect(raw_src.format),
        };
        if layout.is_aligned() {
            self.encoder.copy_texture_to_buffer(
                source,
                wgpu::TexelCopyBufferInfo {
                    buffer: &raw_dst,
                    layout: layout.buffer_layout(dst_offset),
                },
                layout.extent,
            );
            return Ok(());
        }

        layout.check_row_copies(dst_offset)?;
        let staging = self.padded_staging(&layout);
        self.encoder.copy_texture_to_buffer(
            source,
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: layout.buffer_layout(0),
            },
            layout.extent,
        );
        for row in 0..layout.row_count() {
            self.encoder.copy_buffer_to_buffer(
                &staging,
                row * layout.padded_row_bytes(),
                &raw_dst,
                dst_offset + row * layout.row_bytes(),
                layout.row_bytes(),
            );
        }
        Ok(())
    }

    fn padded_staging(&self, layout: &CopyLayout) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("row-pitch staging"),
            size: layout.padded_size(),
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }
}

/// Scissor rectangles must lie inside the render target in WebGPU
fn clamp_scissor(rect: Rect2D, extent: (u32, u32)) -> (u32, u32, u32, u32) {
    let x = rect.x.max(0) as u32;
    let y = rect.y.max(0) as u32;
    let right = (i64::from(rect.x) + i64::from(rect.width)).clamp(0, i64::from(extent.0)) as u32;
    let bottom = (i64::from(rect.y) + i64::from(rect.height)).clamp(0, i64::from(extent.1)) as u32;
    let x = x.min(extent.0);
    let y = y.min(extent.1);
    (x, y, right.saturating_sub(x), bottom.saturating_sub(y))
}

/// Geometry of a whole-mip copy between a texture and tightly packed rows
struct CopyLayout {
    extent: wgpu::Extent3d,
    bytes_per_pixel: u32,
}

impl CopyLayout {
    fn new(texture: &Texture, mip_level: u32) -> Self {
        let desc = texture.desc();
        let (width, height, depth) = desc.mip_extent(mip_level);
        let depth_or_array_layers = match desc.texture_type {
            TextureType::D3 => depth,
            TextureType::D2 | TextureType::Cube => desc.layer_count(),
        };
        Self {
            extent: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers,
            },
            bytes_per_pixel: desc.format.bytes_per_pixel(),
        }
    }

    fn row_bytes(&self) -> u64 {
        u64::from(self.extent.width * self.bytes_per_pixel)
    }

    fn padded_row_bytes(&self) -> u64 {
        let align = u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        self.row_bytes().div_ceil(align) * align
    }

    fn row_count(&self) -> u64 {
        u64::from(self.extent.height) * u64::from(self.extent.depth_or_array_layers)
    }

    fn padded_size(&self) -> u64 {
        self.padded_row_bytes() * self.row_count()
    }

    fn is_aligned(&self) -> bool {
        self.row_bytes() == self.padded_row_bytes()
    }

    fn check_row_copies(&self, offset: u64) -> RhiResult<()> {
        if (self.row_bytes() | offset) % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(RhiError::Submission(format!(
                "texture rows of {} bytes at offset {} cannot be re-pitched on WebGPU",
                self.row_bytes(),
                offset
            )));
        }
        Ok(())
    }

    fn buffer_layout(&self, offset: u64) -> wgpu::TexelCopyBufferLayout {
        wgpu::TexelCopyBufferLayout {
            offset,
            bytes_per_row: Some(self.padded_row_bytes() as u32),
            rows_per_image: Some(self.extent.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scissor_is_clipped_to_the_target() {
        let rect = Rect2D {
            x: -10,
            y: 5,
            width: 100,
            height: 100,
        };
        assert_eq!(clamp_scissor(rect, (64, 64)), (0, 5, 64, 59));
        let outside = Rect2D {
            x: 80,
            y: 0,
            width: 10,
            height: 10,
        };
        assert_eq!(clamp_scissor(outside, (64, 64)), (64, 0, 0, 10));
    }

    #[test]
    fn row_pitch_rounds_to_256_bytes() {
        let layout = CopyLayout {
            extent: wgpu::Extent3d {
                width: 3,
                height: 2,
                depth_or_array_layers: 1,
            },
            bytes_per_pixel: 4,
        };
        assert_eq!(layout.row_bytes(), 12);
        assert_eq!(layout.padded_row_bytes(), 256);
        assert_eq!(layout.padded_size(), 512);
        assert!(!layout.is_aligned());
        assert!(layout.check_row_copies(0).is_ok());
        assert!(layout.check_row_copies(2).is_err());
    }
}
