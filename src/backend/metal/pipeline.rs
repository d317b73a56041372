// Render and compute pipeline states
//
// Metal bakes less into a pipeline than Vulkan does: culling, winding, fill
// mode and depth bias are encoder state. The pipeline keeps them and the
// encoder applies them whenever the pipeline is bound.

use metal::{
    MTLBlendFactor, MTLBlendOperation, MTLCullMode, MTLPixelFormat, MTLPrimitiveType, MTLSize,
    MTLTriangleFillMode, MTLWinding,
};

use super::conv;
use super::resources::{MetalShader, BUFFER_SLOT_OFFSET};
use crate::rhi::hal::{downcast, PipelineBackend};
use crate::rhi::resource::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineDesc, Shader};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

#[derive(Clone)]
pub struct RenderState {
    pub state: metal::RenderPipelineState,
    pub depth: Option<metal::DepthStencilState>,
    pub primitive: MTLPrimitiveType,
    pub cull: MTLCullMode,
    pub winding: MTLWinding,
    pub fill: MTLTriangleFillMode,
    /// (constant, slope) when depth bias is enabled
    pub depth_bias: Option<(f32, f32)>,
}

#[derive(Clone)]
pub struct ComputeState {
    pub state: metal::ComputePipelineState,
    pub threadgroup: MTLSize,
}

pub enum MetalPipeline {
    Render(RenderState),
    Compute(ComputeState),
}

impl PipelineBackend for MetalPipeline {}

fn function(shader: &Shader) -> RhiResult<&metal::Function> {
    Ok(&downcast::<MetalShader>(shader.raw().as_any(), ResourceKind::Shader)?.function)
}

fn creation_error(err: String) -> RhiError {
    log::error!("Metal pipeline creation failed: {}", err);
    RhiError::unsupported(ResourceKind::Pipeline, err)
}

pub fn create_pipeline(device: &metal::Device, desc: &PipelineDesc) -> RhiResult<MetalPipeline> {
    let pipeline = match desc {
        PipelineDesc::Graphics(graphics) => MetalPipeline::Render(create_render(device, graphics)?),
        PipelineDesc::Compute(compute) => MetalPipeline::Compute(create_compute(device, compute)?),
    };
    log::debug!(
        "Created {:?} pipeline '{}'",
        desc.kind(),
        desc.label().unwrap_or("unnamed")
    );
    Ok(pipeline)
}

fn create_render(device: &metal::Device, desc: &GraphicsPipelineDesc) -> RhiResult<RenderState> {
    let raster = &desc.rasterization;
    let cull = match raster.cull_mode {
        CullMode::None => MTLCullMode::None,
        CullMode::Front => MTLCullMode::Front,
        CullMode::Back => MTLCullMode::Back,
        CullMode::FrontAndBack => {
            return Err(RhiError::unsupported(
                ResourceKind::Pipeline,
                "Metal cannot cull both faces",
            ))
        }
    };
    let fill = match raster.polygon_mode {
        PolygonMode::Fill => MTLTriangleFillMode::Fill,
        PolygonMode::Line => MTLTriangleFillMode::Lines,
        PolygonMode::Point => {
            log::warn!("Metal has no point fill mode, falling back to filled polygons");
            MTLTriangleFillMode::Fill
        }
    };
    if raster.line_width != 1.0 {
        log::warn!("Metal has no wide lines, line width {} ignored", raster.line_width);
    }

    let descriptor = metal::RenderPipelineDescriptor::new();
    if let Some(label) = &desc.label {
        descriptor.set_label(label);
    }
    descriptor.set_vertex_function(Some(&**function(&desc.vertex_shader)?));
    if let Some(fragment) = &desc.fragment_shader {
        descriptor.set_fragment_function(Some(&**function(fragment)?));
    }

    if !desc.vertex_bindings.is_empty() {
        let vertex_descriptor = metal::VertexDescriptor::new();
        for attribute in &desc.vertex_attributes {
            let slot = vertex_descriptor
                .attributes()
                .object_at(u64::from(attribute.location))
                .ok_or_else(|| {
                    RhiError::invalid_desc(
                        ResourceKind::Pipeline,
                        format!("vertex attribute location {} out of range", attribute.location),
                    )
                })?;
            slot.set_format(conv::vertex_format(attribute.format));
            slot.set_offset(u64::from(attribute.offset));
            slot.set_buffer_index(u64::from(attribute.binding));
        }
        for binding in &desc.vertex_bindings {
            if u64::from(binding.binding) >= BUFFER_SLOT_OFFSET {
                return Err(RhiError::unsupported(
                    ResourceKind::Pipeline,
                    format!(
                        "vertex buffer slot {} collides with descriptor buffer slots",
                        binding.binding
                    ),
                ));
            }
            let layout = vertex_descriptor
                .layouts()
                .object_at(u64::from(binding.binding))
                .ok_or_else(|| {
                    RhiError::invalid_desc(ResourceKind::Pipeline, "vertex buffer slot out of range")
                })?;
            layout.set_stride(u64::from(binding.stride));
            layout.set_step_function(conv::step_function(binding.input_rate));
            layout.set_step_rate(1);
        }
        descriptor.set_vertex_descriptor(Some(vertex_descriptor));
    }

    for (i, target) in desc.color_targets.iter().enumerate() {
        let attachment = descriptor
            .color_attachments()
            .object_at(i as u64)
            .ok_or_else(|| {
                RhiError::invalid_desc(ResourceKind::Pipeline, "too many color targets")
            })?;
        attachment.set_pixel_format(conv::pixel_format(target.format));
        attachment.set_blending_enabled(target.blend_enable);
        if target.blend_enable {
            attachment.set_rgb_blend_operation(MTLBlendOperation::Add);
            attachment.set_alpha_blend_operation(MTLBlendOperation::Add);
            attachment.set_source_rgb_blend_factor(MTLBlendFactor::SourceAlpha);
            attachment.set_destination_rgb_blend_factor(MTLBlendFactor::OneMinusSourceAlpha);
            attachment.set_source_alpha_blend_factor(MTLBlendFactor::One);
            attachment.set_destination_alpha_blend_factor(MTLBlendFactor::OneMinusSourceAlpha);
        }
    }

    if let Some(format) = desc.depth_format {
        descriptor.set_depth_attachment_pixel_format(conv::pixel_format(format));
        if format.has_stencil() {
            descriptor.set_stencil_attachment_pixel_format(conv::pixel_format(format));
        } else {
            descriptor.set_stencil_attachment_pixel_format(MTLPixelFormat::Invalid);
        }
    }

    let state = device
        .new_render_pipeline_state(&descriptor)
        .map_err(creation_error)?;

    let depth = match (desc.depth_format, desc.depth_stencil) {
        (Some(_), Some(depth_state)) => {
            let depth_descriptor = metal::DepthStencilDescriptor::new();
            if depth_state.depth_test {
                depth_descriptor.set_depth_compare_function(conv::compare(depth_state.compare));
                depth_descriptor.set_depth_write_enabled(depth_state.depth_write);
            } else {
                depth_descriptor.set_depth_compare_function(metal::MTLCompareFunction::Always);
                depth_descriptor.set_depth_write_enabled(false);
            }
            Some(device.new_depth_stencil_state(&depth_descriptor))
        }
        _ => None,
    };

    Ok(RenderState {
        state,
        depth,
        primitive: conv::primitive_type(desc.topology),
        cull,
        winding: conv::winding(raster.front_face),
        fill,
        depth_bias: raster
            .depth_bias_enable
            .then_some((raster.depth_bias_constant, raster.depth_bias_slope)),
    })
}

fn create_compute(device: &metal::Device, desc: &ComputePipelineDesc) -> RhiResult<ComputeState> {
    let [x, y, z] = desc.threadgroup_size;
    if x == 0 || y == 0 || z == 0 {
        return Err(RhiError::invalid_desc(
            ResourceKind::Pipeline,
            "threadgroup size must be non-zero in every dimension",
        ));
    }
    let state = device
        .new_compute_pipeline_state_with_function(function(&desc.shader)?)
        .map_err(creation_error)?;
    let threads = u64::from(x) * u64::from(y) * u64::from(z);
    if threads > state.max_total_threads_per_threadgroup() {
        return Err(RhiError::unsupported(
            ResourceKind::Pipeline,
            format!(
                "threadgroup of {threads} threads exceeds the pipeline limit of {}",
                state.max_total_threads_per_threadgroup()
            ),
        ));
    }
    Ok(ComputeState {
        state,
        threadgroup: MTLSize::new(u64::from(x), u64::from(y), u64::from(z)),
    })
}
