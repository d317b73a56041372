// Graphics and compute pipeline creation
//
// Graphics pipelines target dynamic rendering: attachment formats are baked in
// through VkPipelineRenderingCreateInfo instead of a render pass, and viewport
// and scissor are dynamic state set while recording.

use std::sync::Arc;

use ash::vk;

use super::context::VulkanContext;
use super::conv;
use super::resources::{create_set_layout, VulkanShader};
use crate::rhi::hal::{downcast, PipelineBackend};
use crate::rhi::resource::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineDesc, Shader};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

pub struct VulkanPipeline {
    ctx: Arc<VulkanContext>,
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pub bind_point: vk::PipelineBindPoint,
}

impl PipelineBackend for VulkanPipeline {}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            if self.raw != vk::Pipeline::null() {
                self.ctx.device.destroy_pipeline(self.raw, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                self.ctx.device.destroy_pipeline_layout(self.layout, None);
            }
            for layout in &self.set_layouts {
                self.ctx.device.destroy_descriptor_set_layout(*layout, None);
            }
        }
    }
}

fn shader(shader: &Shader) -> RhiResult<&VulkanShader> {
    downcast::<VulkanShader>(shader.raw().as_any(), ResourceKind::Shader)
}

fn pipeline_error(result: vk::Result) -> RhiError {
    conv::creation_error(ResourceKind::Pipeline, result)
}

pub fn create_pipeline(ctx: &Arc<VulkanContext>, desc: &PipelineDesc) -> RhiResult<VulkanPipeline> {
    let bind_point = match desc {
        PipelineDesc::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
        PipelineDesc::Compute(_) => vk::PipelineBindPoint::COMPUTE,
    };
    let mut pipeline = VulkanPipeline {
        ctx: Arc::clone(ctx),
        raw: vk::Pipeline::null(),
        layout: vk::PipelineLayout::null(),
        set_layouts: Vec::new(),
        bind_point,
    };

    // Layouts are rebuilt from the same descriptions the sets were created
    // with, which makes them compatible with every matching descriptor set
    for layout in desc.descriptor_layouts() {
        let set_layout = create_set_layout(&ctx.device, layout)?;
        pipeline.set_layouts.push(set_layout);
    }

    let push_constant_ranges: Vec<_> = desc
        .push_constants()
        .map(|range| {
            vk::PushConstantRange::default()
                .stage_flags(conv::shader_stages(range.stages))
                .offset(range.offset)
                .size(range.size)
        })
        .into_iter()
        .collect();

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&pipeline.set_layouts)
        .push_constant_ranges(&push_constant_ranges);
    pipeline.layout = unsafe { ctx.device.create_pipeline_layout(&layout_info, None) }
        .map_err(pipeline_error)?;

    pipeline.raw = match desc {
        PipelineDesc::Graphics(graphics) => create_graphics(ctx, graphics, pipeline.layout)?,
        PipelineDesc::Compute(compute) => create_compute(ctx, compute, pipeline.layout)?,
    };

    log::debug!(
        "Created {:?} pipeline '{}'",
        desc.kind(),
        desc.label().unwrap_or("unnamed")
    );
    Ok(pipeline)
}

fn create_graphics(
    ctx: &VulkanContext,
    desc: &GraphicsPipelineDesc,
    layout: vk::PipelineLayout,
) -> RhiResult<vk::Pipeline> {
    // Shader stages
    let mut modules = vec![shader(&desc.vertex_shader)?];
    if let Some(fragment) = &desc.fragment_shader {
        modules.push(shader(fragment)?);
    }
    let shader_stages: Vec<_> = modules
        .iter()
        .map(|module| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(module.stage)
                .module(module.module)
                .name(&module.entry_point)
        })
        .collect();

    // Vertex input
    let bindings: Vec<_> = desc
        .vertex_bindings
        .iter()
        .map(|b| {
            vk::VertexInputBindingDescription::default()
                .binding(b.binding)
                .stride(b.stride)
                .input_rate(conv::input_rate(b.input_rate))
        })
        .collect();
    let attributes: Vec<_> = desc
        .vertex_attributes
        .iter()
        .map(|a| {
            vk::VertexInputAttributeDescription::default()
                .binding(a.binding)
                .location(a.location)
                .format(conv::vertex_format(a.format))
                .offset(a.offset)
        })
        .collect();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(conv::topology(desc.topology))
        .primitive_restart_enable(false);

    // Viewport and scissor are set while recording
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    // Rasterization
    let raster = &desc.rasterization;
    let mut polygon_mode = raster.polygon_mode;
    if polygon_mode != PolygonMode::Fill && ctx.features.fill_mode_non_solid != vk::TRUE {
        log::warn!("GPU lacks fillModeNonSolid, falling back to filled polygons");
        polygon_mode = PolygonMode::Fill;
    }
    let mut line_width = raster.line_width;
    if line_width != 1.0 && ctx.features.wide_lines != vk::TRUE {
        log::warn!("GPU lacks wideLines, line width {} clamped to 1.0", line_width);
        line_width = 1.0;
    }
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(conv::polygon_mode(polygon_mode))
        .line_width(line_width)
        .cull_mode(conv::cull_mode(raster.cull_mode))
        .front_face(conv::front_face(raster.front_face))
        .depth_bias_enable(raster.depth_bias_enable)
        .depth_bias_constant_factor(raster.depth_bias_constant)
        .depth_bias_slope_factor(raster.depth_bias_slope);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth = desc.depth_stencil.unwrap_or(DepthStencilState {
        depth_test: false,
        depth_write: false,
        compare: CompareOp::Always,
    });
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth.depth_test)
        .depth_write_enable(depth.depth_write)
        .depth_compare_op(conv::compare_op(depth.compare))
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Source-over alpha blending where enabled
    let blend_attachments: Vec<_> = desc
        .color_targets
        .iter()
        .map(|target| {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(target.blend_enable)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
        })
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&blend_attachments);

    // Attachment formats for dynamic rendering
    let color_formats: Vec<_> = desc
        .color_targets
        .iter()
        .map(|target| conv::format(target.format))
        .collect();
    let depth_format = desc.depth_format.map_or(vk::Format::UNDEFINED, conv::format);
    let stencil_format = desc
        .depth_format
        .filter(|f| f.has_stencil())
        .map_or(vk::Format::UNDEFINED, conv::format);
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format)
        .stencil_attachment_format(stencil_format);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        ctx.device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| pipeline_error(e))?;

    pipelines
        .first()
        .copied()
        .ok_or_else(|| RhiError::unsupported(ResourceKind::Pipeline, "driver returned no pipeline"))
}

fn create_compute(
    ctx: &VulkanContext,
    desc: &ComputePipelineDesc,
    layout: vk::PipelineLayout,
) -> RhiResult<vk::Pipeline> {
    let module = shader(&desc.shader)?;
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module.module)
        .name(&module.entry_point);
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let pipelines = unsafe {
        ctx.device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| pipeline_error(e))?;

    pipelines
        .first()
        .copied()
        .ok_or_else(|| RhiError::unsupported(ResourceKind::Pipeline, "driver returned no pipeline"))
}
