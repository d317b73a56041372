// Command recording and queue submission
//
// Each submission records into one primary command buffer from a shared pool
// and is tracked by its own fence. Fences complete in submission order on the
// single queue, so the completed index is the last signalled fence.
//
// Image layouts are tracked per texture at record time. Submissions are
// recorded in the same order they execute, which keeps the tracked layout
// equal to the layout the GPU will see.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;

use super::context::VulkanContext;
use super::conv;
use super::pipeline::VulkanPipeline;
use super::resources::{semaphore, VulkanBuffer, VulkanDescriptorSet, VulkanTexture};
use crate::rhi::command::Command;
use crate::rhi::hal::{downcast, Submission};
use crate::rhi::resource::{BoundResource, Buffer, DescriptorSet, Framebuffer, Texture};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

struct InFlight {
    index: SubmissionIndex,
    fence: vk::Fence,
    cmd: vk::CommandBuffer,
}

struct SubmitState {
    pool: vk::CommandPool,
    free_cmds: Vec<vk::CommandBuffer>,
    free_fences: Vec<vk::Fence>,
    in_flight: VecDeque<InFlight>,
    completed: SubmissionIndex,
}

pub struct Submitter {
    ctx: Arc<VulkanContext>,
    state: Mutex<SubmitState>,
}

impl Submitter {
    pub fn new(ctx: &Arc<VulkanContext>) -> RhiResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.queue_family);
        let pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }.map_err(|e| {
            RhiError::BackendInit {
                backend: BackendKind::Vulkan,
                reason: format!("failed to create command pool: {e}"),
            }
        })?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            state: Mutex::new(SubmitState {
                pool,
                free_cmds: Vec::new(),
                free_fences: Vec::new(),
                in_flight: VecDeque::new(),
                completed: SubmissionIndex::NONE,
            }),
        })
    }

    pub fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let device = &self.ctx.device;
        let wait_semaphores = submission
            .wait
            .iter()
            .map(|s| semaphore(*s).map(|s| s.raw))
            .collect::<RhiResult<Vec<_>>>()?;
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let signal_semaphores = submission
            .signal
            .iter()
            .map(|s| semaphore(*s).map(|s| s.raw))
            .collect::<RhiResult<Vec<_>>>()?;

        let mut state = self.state.lock();
        Self::reclaim(device, &mut state)?;

        let cmd = match state.free_cmds.pop() {
            Some(cmd) => cmd,
            None => {
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(state.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let cmds = unsafe { device.allocate_command_buffers(&alloc_info) }
                    .map_err(|e| conv::queue_error("vkAllocateCommandBuffers", e))?;
                cmds.first().copied().ok_or_else(|| {
                    RhiError::Submission("driver returned no command buffer".into())
                })?
            }
        };
        let fence = match state.free_fences.pop() {
            Some(fence) => fence,
            None => unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
                .map_err(|e| conv::queue_error("vkCreateFence", e))?,
        };

        let recorded = self.record(cmd, submission.commands);
        if let Err(err) = recorded {
            state.free_cmds.push(cmd);
            state.free_fences.push(fence);
            return Err(err);
        }

        let cmds = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal_semaphores);

        let result = {
            let queue = self.ctx.queue.lock();
            unsafe { device.queue_submit(*queue, &[submit_info], fence) }
        };
        if let Err(e) = result {
            state.free_cmds.push(cmd);
            state.free_fences.push(fence);
            return Err(conv::queue_error("vkQueueSubmit", e));
        }

        state.in_flight.push_back(InFlight {
            index: submission.index,
            fence,
            cmd,
        });
        Ok(())
    }

    /// Retire every batch whose fence has signalled
    fn reclaim(device: &ash::Device, state: &mut SubmitState) -> RhiResult<()> {
        while let Some(front) = state.in_flight.front() {
            let signalled = unsafe { device.get_fence_status(front.fence) }
                .map_err(|e| conv::queue_error("vkGetFenceStatus", e))?;
            if !signalled {
                break;
            }
            let Some(done) = state.in_flight.pop_front() else {
                break;
            };
            unsafe {
                device
                    .reset_fences(&[done.fence])
                    .map_err(|e| conv::queue_error("vkResetFences", e))?;
                device
                    .reset_command_buffer(done.cmd, vk::CommandBufferResetFlags::empty())
                    .map_err(|e| conv::queue_error("vkResetCommandBuffer", e))?;
            }
            state.completed = done.index;
            state.free_fences.push(done.fence);
            state.free_cmds.push(done.cmd);
        }
        Ok(())
    }

    pub fn poll(&self) -> RhiResult<SubmissionIndex> {
        let mut state = self.state.lock();
        Self::reclaim(&self.ctx.device, &mut state)?;
        Ok(state.completed)
    }

    pub fn wait(&self, index: SubmissionIndex, timeout: Duration) -> RhiResult<bool> {
        let fence = {
            let mut state = self.state.lock();
            Self::reclaim(&self.ctx.device, &mut state)?;
            if index <= state.completed {
                return Ok(true);
            }
            match state.in_flight.iter().find(|b| b.index >= index) {
                Some(batch) => batch.fence,
                // Never submitted here, e.g. an index from the future
                None => return Ok(false),
            }
        };

        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.ctx.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(self.poll()? >= index),
            // The fence may have been recycled by a concurrent poll
            Err(vk::Result::TIMEOUT) => Ok(self.poll()? >= index),
            Err(e) => Err(conv::queue_error("vkWaitForFences", e)),
        }
    }

    pub fn wait_idle(&self) -> RhiResult<()> {
        {
            let queue = self.ctx.queue.lock();
            unsafe { self.ctx.device.queue_wait_idle(*queue) }
                .map_err(|e| conv::queue_error("vkQueueWaitIdle", e))?;
        }
        self.poll().map(|_| ())
    }

    fn record(&self, cmd: vk::CommandBuffer, commands: &[Command]) -> RhiResult<()> {
        let device = &self.ctx.device;
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| conv::queue_error("vkBeginCommandBuffer", e))?;

        let mut encoder = Encoder {
            device,
            cmd,
            pipeline: None,
            rendering: false,
            presented: Vec::new(),
        };
        let recorded = commands
            .iter()
            .enumerate()
            .try_for_each(|(i, command)| encoder.encode(command, &commands[i + 1..]));
        let finished = recorded.and_then(|()| encoder.finish());

        let ended = unsafe { device.end_command_buffer(cmd) }
            .map_err(|e| conv::queue_error("vkEndCommandBuffer", e));
        finished.and(ended)
    }
}

impl Drop for Submitter {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        let state = self.state.get_mut();
        unsafe {
            let _ = device.device_wait_idle();
            for batch in state.in_flight.drain(..) {
                device.destroy_fence(batch.fence, None);
            }
            for fence in state.free_fences.drain(..) {
                device.destroy_fence(fence, None);
            }
            // Command buffers go with their pool
            device.destroy_command_pool(state.pool, None);
        }
    }
}

// =============================================================================
// ENCODER
// =============================================================================

fn buffer(buffer: &Buffer) -> RhiResult<&VulkanBuffer> {
    downcast::<VulkanBuffer>(buffer.raw().as_any(), ResourceKind::Buffer)
}

fn texture(texture: &Texture) -> RhiResult<&VulkanTexture> {
    downcast::<VulkanTexture>(texture.raw().as_any(), ResourceKind::Texture)
}

struct Encoder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
    pipeline: Option<&'a VulkanPipeline>,
    rendering: bool,
    /// Swap chain images rendered to, moved to PRESENT_SRC at the end
    presented: Vec<&'a VulkanTexture>,
}

impl<'a> Encoder<'a> {
    fn encode(&mut self, command: &'a Command, rest: &'a [Command]) -> RhiResult<()> {
        let device = self.device;
        let cmd = self.cmd;
        match command {
            Command::BeginRendering {
                framebuffer,
                load_ops,
            } => self.begin_rendering(framebuffer, load_ops, rest)?,
            Command::EndRendering => {
                unsafe { device.cmd_end_rendering(cmd) };
                self.rendering = false;
            }
            Command::BindPipeline(pipeline) => {
                let raw = downcast::<VulkanPipeline>(pipeline.raw().as_any(), ResourceKind::Pipeline)?;
                unsafe { device.cmd_bind_pipeline(cmd, raw.bind_point, raw.raw) };
                self.pipeline = Some(raw);
            }
            Command::SetViewport(viewport) => {
                let viewport = vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                };
                unsafe { device.cmd_set_viewport(cmd, 0, &[viewport]) };
            }
            Command::SetScissor(rect) => {
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D {
                        x: rect.x,
                        y: rect.y,
                    },
                    extent: vk::Extent2D {
                        width: rect.width,
                        height: rect.height,
                    },
                };
                unsafe { device.cmd_set_scissor(cmd, 0, &[scissor]) };
            }
            Command::BindVertexBuffer {
                slot,
                buffer: vb,
                offset,
            } => {
                let raw = buffer(vb)?;
                unsafe { device.cmd_bind_vertex_buffers(cmd, *slot, &[raw.raw], &[*offset]) };
            }
            Command::BindIndexBuffer {
                buffer: ib,
                offset,
                format,
            } => {
                let raw = buffer(ib)?;
                unsafe {
                    device.cmd_bind_index_buffer(cmd, raw.raw, *offset, conv::index_type(*format))
                };
            }
            Command::BindDescriptorSet { index, set } => {
                let pipeline = self.bound_pipeline()?;
                if !self.rendering {
                    self.prepare_sampled(set)?;
                }
                let raw = downcast::<VulkanDescriptorSet>(set.raw().as_any(), ResourceKind::DescriptorSet)?;
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        pipeline.bind_point,
                        pipeline.layout,
                        *index,
                        &[raw.raw],
                        &[],
                    )
                };
            }
            Command::PushConstants {
                stages,
                offset,
                data,
            } => {
                let pipeline = self.bound_pipeline()?;
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        conv::shader_stages(*stages),
                        *offset,
                        data,
                    )
                };
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                device.cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance)
            },
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                )
            },
            Command::Dispatch { x, y, z } => {
                self.memory_barrier();
                unsafe { device.cmd_dispatch(cmd, *x, *y, *z) };
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let (src, dst) = (buffer(src)?, buffer(dst)?);
                self.memory_barrier();
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                unsafe { device.cmd_copy_buffer(cmd, src.raw, dst.raw, &[region]) };
            }
            Command::CopyBufferToTexture {
                src,
                src_offset,
                dst,
                mip_level,
            } => {
                let (src, dst) = (buffer(src)?, texture(dst)?);
                self.memory_barrier();
                self.transition(dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                let region = Self::image_copy(dst, *src_offset, *mip_level);
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src.raw,
                        dst.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            Command::CopyTextureToBuffer {
                src,
                mip_level,
                dst,
                dst_offset,
            } => {
                let (src, dst) = (texture(src)?, buffer(dst)?);
                self.memory_barrier();
                self.transition(src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                let region = Self::image_copy(src, *dst_offset, *mip_level);
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        src.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.raw,
                        &[region],
                    )
                };
            }
            Command::BufferBarrier {
                buffer: target,
                from,
                to,
            } => {
                let raw = buffer(target)?;
                let (src_access, src_stage) = conv::state_access(*from);
                let (dst_access, dst_stage) = conv::state_access(*to);
                let barrier = vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(raw.raw)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier],
                        &[],
                    )
                };
            }
            Command::TextureBarrier {
                texture: target,
                from,
                to,
            } => {
                let raw = texture(target)?;
                let (src_access, src_stage) = conv::state_access(*from);
                let (dst_access, dst_stage) = conv::state_access(*to);
                let mut layout = raw.layout.lock();
                let new_layout = conv::state_layout(*to);
                let barrier = vk::ImageMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(*layout)
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(raw.image)
                    .subresource_range(raw.full_range());
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    )
                };
                *layout = new_layout;
                if target.is_swap_chain_image() && *to == ResourceState::Present {
                    self.presented.retain(|t| !std::ptr::eq(*t, raw));
                }
            }
        }
        Ok(())
    }

    fn bound_pipeline(&self) -> RhiResult<&'a VulkanPipeline> {
        self.pipeline
            .ok_or_else(|| RhiError::Submission("no pipeline bound".into()))
    }

    fn begin_rendering(
        &mut self,
        framebuffer: &'a Framebuffer,
        load_ops: &[LoadOp],
        rest: &'a [Command],
    ) -> RhiResult<()> {
        // Layout transitions are illegal inside the scope, so sampled textures
        // used by sets bound before EndRendering are prepared now
        for command in rest {
            match command {
                Command::EndRendering => break,
                Command::BindDescriptorSet { set, .. } => self.prepare_sampled(set)?,
                _ => {}
            }
        }
        self.memory_barrier();

        let (width, height) = framebuffer.extent();
        let mut ops = load_ops.iter().copied();
        let mut colors = Vec::with_capacity(framebuffer.color_attachments().len());
        for attachment in framebuffer.color_attachments() {
            let raw = texture(attachment)?;
            self.transition(raw, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            if attachment.is_swap_chain_image() && !self.presented.iter().any(|t| std::ptr::eq(*t, raw)) {
                self.presented.push(raw);
            }
            colors.push(Self::attachment_info(
                raw,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ops.next().unwrap_or(LoadOp::Load),
            ));
        }
        let depth = match framebuffer.depth_attachment() {
            Some(attachment) => {
                let raw = texture(attachment)?;
                self.transition(raw, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
                Some((
                    raw,
                    Self::attachment_info(
                        raw,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        ops.next().unwrap_or(LoadOp::Load),
                    ),
                ))
            }
            None => None,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            })
            .layer_count(1)
            .color_attachments(&colors);
        if let Some((raw, info)) = &depth {
            rendering_info = rendering_info.depth_attachment(info);
            if raw.format.has_stencil() {
                rendering_info = rendering_info.stencil_attachment(info);
            }
        }
        let full = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_begin_rendering(self.cmd, &rendering_info);
            self.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(self.cmd, 0, &[full]);
        }
        self.rendering = true;
        Ok(())
    }

    fn attachment_info(
        texture: &VulkanTexture,
        layout: vk::ImageLayout,
        load: LoadOp,
    ) -> vk::RenderingAttachmentInfo<'static> {
        let mut info = vk::RenderingAttachmentInfo::default()
            .image_view(texture.attachment_view)
            .image_layout(layout)
            .load_op(conv::load_op(load))
            .store_op(vk::AttachmentStoreOp::STORE);
        if let LoadOp::Clear(value) = load {
            info = info.clear_value(conv::clear_value(value));
        }
        info
    }

    fn image_copy(texture: &VulkanTexture, buffer_offset: u64, mip_level: u32) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: texture.copy_aspect(),
                mip_level,
                base_array_layer: 0,
                layer_count: texture.layers,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: texture.mip_extent(mip_level),
        }
    }

    /// Move every sampled texture of `set` to SHADER_READ_ONLY
    fn prepare_sampled(&mut self, set: &DescriptorSet) -> RhiResult<()> {
        for (_, resource) in set.bound_resources() {
            if let BoundResource::Texture(bound, _) = resource {
                let raw = texture(&bound)?;
                self.transition(raw, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
        }
        Ok(())
    }

    /// Full execution and memory dependency on everything recorded before
    fn memory_barrier(&self) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
    }

    fn transition(&self, texture: &VulkanTexture, new_layout: vk::ImageLayout) {
        let mut layout = texture.layout.lock();
        if *layout == new_layout {
            return;
        }
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .old_layout(*layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.image)
            .subresource_range(texture.full_range());
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
        *layout = new_layout;
    }

    /// Hand rendered swap images to the presentation engine and make device
    /// writes visible to host reads after the fence
    fn finish(&mut self) -> RhiResult<()> {
        for texture in std::mem::take(&mut self.presented) {
            self.transition(texture, vk::ImageLayout::PRESENT_SRC_KHR);
        }
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ);
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
        Ok(())
    }
}
