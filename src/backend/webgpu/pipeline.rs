// Render and compute pipelines

use super::conv;
use super::resources::{create_bind_group_layout, WebGpuShader};
use super::scoped;
use crate::rhi::hal::{downcast, PipelineBackend};
use crate::rhi::resource::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineDesc, Shader};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

pub enum RawPipeline {
    Render(wgpu::RenderPipeline),
    Compute(wgpu::ComputePipeline),
}

pub struct WebGpuPipeline {
    pub raw: RawPipeline,
}

impl PipelineBackend for WebGpuPipeline {}

fn shader(shader: &Shader) -> RhiResult<&WebGpuShader> {
    downcast::<WebGpuShader>(shader.raw().as_any(), ResourceKind::Shader)
}

pub fn create_pipeline(
    device: &wgpu::Device,
    features: wgpu::Features,
    desc: &PipelineDesc,
) -> RhiResult<WebGpuPipeline> {
    let set_layouts: Vec<_> = desc
        .descriptor_layouts()
        .iter()
        .map(|layout| create_bind_group_layout(device, layout))
        .collect();
    let set_layout_refs: Vec<_> = set_layouts.iter().collect();

    let push_constant_ranges: Vec<_> = desc
        .push_constants()
        .map(|range| wgpu::PushConstantRange {
            stages: conv::shader_stages(range.stages),
            range: range.offset..range.offset + range.size,
        })
        .into_iter()
        .collect();
    if !push_constant_ranges.is_empty() && !features.contains(wgpu::Features::PUSH_CONSTANTS) {
        return Err(RhiError::unsupported(
            ResourceKind::Pipeline,
            "push constants are not available on this adapter",
        ));
    }

    let raw = scoped(device, ResourceKind::Pipeline, || {
        device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: desc.label(),
            bind_group_layouts: &set_layout_refs,
            push_constant_ranges: &push_constant_ranges,
        })
    })
    .and_then(|layout| match desc {
        PipelineDesc::Graphics(graphics) => {
            create_render(device, features, graphics, &layout).map(RawPipeline::Render)
        }
        PipelineDesc::Compute(compute) => {
            create_compute(device, compute, &layout).map(RawPipeline::Compute)
        }
    })?;

    log::debug!(
        "Created {:?} pipeline '{}'",
        desc.kind(),
        desc.label().unwrap_or("unnamed")
    );
    Ok(WebGpuPipeline { raw })
}

fn create_render(
    device: &wgpu::Device,
    features: wgpu::Features,
    desc: &GraphicsPipelineDesc,
    layout: &wgpu::PipelineLayout,
) -> RhiResult<wgpu::RenderPipeline> {
    let raster = &desc.rasterization;
    let cull_mode = match raster.cull_mode {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
        CullMode::FrontAndBack => {
            return Err(RhiError::unsupported(
                ResourceKind::Pipeline,
                "WebGPU cannot cull both faces",
            ))
        }
    };
    let polygon_mode = match raster.polygon_mode {
        PolygonMode::Line if !features.contains(wgpu::Features::POLYGON_MODE_LINE) => {
            log::warn!("Adapter lacks line polygon mode, falling back to filled polygons");
            PolygonMode::Fill
        }
        PolygonMode::Point if !features.contains(wgpu::Features::POLYGON_MODE_POINT) => {
            log::warn!("Adapter lacks point polygon mode, falling back to filled polygons");
            PolygonMode::Fill
        }
        mode => mode,
    };
    if raster.line_width != 1.0 {
        log::warn!("WebGPU has no wide lines, line width {} ignored", raster.line_width);
    }

    // wgpu addresses vertex buffers by array position, so fill the gaps
    let slot_count = desc
        .vertex_bindings
        .iter()
        .map(|b| b.binding + 1)
        .max()
        .unwrap_or(0) as usize;
    let attributes: Vec<Vec<wgpu::VertexAttribute>> = (0..slot_count as u32)
        .map(|slot| {
            desc.vertex_attributes
                .iter()
                .filter(|a| a.binding == slot)
                .map(|a| wgpu::VertexAttribute {
                    format: conv::vertex_format(a.format),
                    offset: u64::from(a.offset),
                    shader_location: a.location,
                })
                .collect()
        })
        .collect();
    let buffers: Vec<_> = (0..slot_count)
        .map(|slot| {
            let binding = desc.vertex_bindings.iter().find(|b| b.binding as usize == slot);
            wgpu::VertexBufferLayout {
                array_stride: binding.map_or(0, |b| u64::from(b.stride)),
                step_mode: binding.map_or(wgpu::VertexStepMode::Vertex, |b| {
                    conv::step_mode(b.input_rate)
                }),
                attributes: &attributes[slot],
            }
        })
        .collect();

    let depth_stencil = desc.depth_format.map(|format| {
        let state = desc.depth_stencil.unwrap_or(DepthStencilState {
            depth_test: false,
            depth_write: false,
            compare: CompareOp::Always,
        });
        wgpu::DepthStencilState {
            format: conv::format(format),
            depth_write_enabled: state.depth_test && state.depth_write,
            depth_compare: if state.depth_test {
                conv::compare(state.compare)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: if raster.depth_bias_enable {
                wgpu::DepthBiasState {
                    constant: raster.depth_bias_constant as i32,
                    slope_scale: raster.depth_bias_slope,
                    clamp: 0.0,
                }
            } else {
                wgpu::DepthBiasState::default()
            },
        }
    });

    let targets: Vec<_> = desc
        .color_targets
        .iter()
        .map(|target| {
            Some(wgpu::ColorTargetState {
                format: conv::format(target.format),
                blend: target.blend_enable.then_some(wgpu::BlendState::ALPHA_BLENDING),
                write_mask: wgpu::ColorWrites::ALL,
            })
        })
        .collect();

    let vertex = shader(&desc.vertex_shader)?;
    let fragment = desc.fragment_shader.as_ref().map(shader).transpose()?;

    scoped(device, ResourceKind::Pipeline, || {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: desc.label.as_deref(),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: &vertex.module,
                entry_point: Some(&vertex.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &buffers,
            },
            primitive: wgpu::PrimitiveState {
                topology: conv::topology(desc.topology),
                strip_index_format: None,
                front_face: conv::front_face(raster.front_face),
                cull_mode,
                unclipped_depth: false,
                polygon_mode: conv::polygon_mode(polygon_mode),
                conservative: false,
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            fragment: fragment.map(|fragment| wgpu::FragmentState {
                module: &fragment.module,
                entry_point: Some(&fragment.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &targets,
            }),
            multiview: None,
            cache: None,
        })
    })
}

fn create_compute(
    device: &wgpu::Device,
    desc: &ComputePipelineDesc,
    layout: &wgpu::PipelineLayout,
) -> RhiResult<wgpu::ComputePipeline> {
    let module = shader(&desc.shader)?;
    scoped(device, ResourceKind::Pipeline, || {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: desc.label.as_deref(),
            layout: Some(layout),
            module: &module.module,
            entry_point: Some(&module.entry_point),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        })
    })
}
