// wgpu resource wrappers
//
// wgpu handles are reference counted, so wrappers hold plain clones and need
// no Drop impls. Combined image samplers are split in two bindings: the
// texture at the declared binding and the sampler at
// `binding + SAMPLER_BINDING_OFFSET`. WGSL shaders must follow that layout.

use std::borrow::Cow;
use std::num::NonZeroU64;

use parking_lot::Mutex;

use super::conv;
use super::{poll_error, scoped};
use crate::rhi::hal::*;
use crate::rhi::resource::{Buffer, Sampler, Texture};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

/// Binding slot of the sampler half of a combined image sampler
pub const SAMPLER_BINDING_OFFSET: u32 = 64;

fn align4(value: u64) -> u64 {
    value.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

// =============================================================================
// BUFFER
// =============================================================================

pub struct WebGpuBuffer {
    pub raw: wgpu::Buffer,
    device: wgpu::Device,
    queue: wgpu::Queue,
    memory: MemoryUsage,
    // CPU copy of upload buffers; queue writes must cover whole words
    shadow: Mutex<Vec<u8>>,
}

impl WebGpuBuffer {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, desc: &BufferDesc) -> RhiResult<Self> {
        let usage = match desc.memory {
            MemoryUsage::GpuOnly | MemoryUsage::CpuToGpu => {
                conv::buffer_usage(desc.usage) | wgpu::BufferUsages::COPY_DST
            }
            MemoryUsage::GpuToCpu => {
                if !(desc.usage - BufferUsage::TRANSFER_DST).is_empty() {
                    return Err(RhiError::unsupported(
                        ResourceKind::Buffer,
                        "WebGPU readback buffers can only be copy destinations",
                    ));
                }
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST
            }
        };
        let size = align4(desc.size);
        let raw = scoped(device, ResourceKind::Buffer, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: desc.label.as_deref(),
                size,
                usage,
                mapped_at_creation: false,
            })
        })?;

        let shadow = match desc.memory {
            MemoryUsage::CpuToGpu => vec![0; size as usize],
            _ => Vec::new(),
        };
        Ok(Self {
            raw,
            device: device.clone(),
            queue: queue.clone(),
            memory: desc.memory,
            shadow: Mutex::new(shadow),
        })
    }

    fn read_mapped(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let slice = self.raw.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::PollType::Wait).map_err(poll_error)?;
        receiver
            .recv()
            .map_err(|_| RhiError::Submission("buffer mapping was cancelled".into()))?
            .map_err(|e| RhiError::Submission(format!("failed to map readback buffer: {e}")))?;

        {
            let mapped = slice.get_mapped_range();
            let start = offset as usize;
            out.copy_from_slice(&mapped[start..start + out.len()]);
        }
        self.raw.unmap();
        Ok(())
    }
}

impl BufferBackend for WebGpuBuffer {
    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        if self.memory != MemoryUsage::CpuToGpu {
            if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
                || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0
            {
                return Err(RhiError::InvalidUsage(
                    "CPU writes into WebGPU readback buffers must be 4-byte aligned".into(),
                ));
            }
            self.queue.write_buffer(&self.raw, offset, data);
            return Ok(());
        }

        let mut shadow = self.shadow.lock();
        let start = offset as usize;
        shadow[start..start + data.len()].copy_from_slice(data);
        let aligned_start = offset - offset % wgpu::COPY_BUFFER_ALIGNMENT;
        let aligned_end = align4(offset + data.len() as u64).min(shadow.len() as u64);
        self.queue.write_buffer(
            &self.raw,
            aligned_start,
            &shadow[aligned_start as usize..aligned_end as usize],
        );
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        match self.memory {
            MemoryUsage::CpuToGpu => {
                let shadow = self.shadow.lock();
                let start = offset as usize;
                out.copy_from_slice(&shadow[start..start + out.len()]);
                Ok(())
            }
            _ => self.read_mapped(offset, out),
        }
    }
}

// =============================================================================
// TEXTURE
// =============================================================================

pub struct WebGpuTexture {
    pub raw: wgpu::Texture,
    /// Every mip and layer, for sampling
    pub view: wgpu::TextureView,
    /// Mip 0, layer 0, for rendering
    pub attachment_view: wgpu::TextureView,
    pub format: Format,
    pub is_3d: bool,
}

impl WebGpuTexture {
    pub fn new(device: &wgpu::Device, desc: &TextureDesc) -> RhiResult<Self> {
        let (dimension, depth_or_array_layers) = match desc.texture_type {
            TextureType::D2 | TextureType::Cube => (wgpu::TextureDimension::D2, desc.layer_count()),
            TextureType::D3 => (wgpu::TextureDimension::D3, desc.depth),
        };
        let raw = scoped(device, ResourceKind::Texture, || {
            device.create_texture(&wgpu::TextureDescriptor {
                label: desc.label.as_deref(),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers,
                },
                mip_level_count: desc.mip_levels,
                sample_count: 1,
                dimension,
                format: conv::format(desc.format),
                usage: conv::texture_usage(desc.usage),
                view_formats: &[],
            })
        })?;
        Ok(Self::with_views(raw, desc))
    }

    pub fn with_views(raw: wgpu::Texture, desc: &TextureDesc) -> Self {
        let view_dimension = match desc.texture_type {
            TextureType::D2 if desc.array_layers > 1 => wgpu::TextureViewDimension::D2Array,
            TextureType::D2 => wgpu::TextureViewDimension::D2,
            TextureType::Cube if desc.array_layers > 1 => wgpu::TextureViewDimension::CubeArray,
            TextureType::Cube => wgpu::TextureViewDimension::Cube,
            TextureType::D3 => wgpu::TextureViewDimension::D3,
        };
        let is_3d = desc.texture_type == TextureType::D3;
        let view = raw.create_view(&wgpu::TextureViewDescriptor {
            label: desc.label.as_deref(),
            dimension: Some(view_dimension),
            ..Default::default()
        });
        let attachment_view = raw.create_view(&wgpu::TextureViewDescriptor {
            label: desc.label.as_deref(),
            dimension: Some(if is_3d {
                wgpu::TextureViewDimension::D3
            } else {
                wgpu::TextureViewDimension::D2
            }),
            base_mip_level: 0,
            mip_level_count: Some(1),
            base_array_layer: 0,
            array_layer_count: Some(1),
            ..Default::default()
        });
        Self {
            raw,
            view,
            attachment_view,
            format: desc.format,
            is_3d,
        }
    }
}

impl TextureBackend for WebGpuTexture {}

pub fn texture(texture: &Texture) -> RhiResult<&WebGpuTexture> {
    downcast::<WebGpuTexture>(texture.raw().as_any(), ResourceKind::Texture)
}

pub fn buffer(buffer: &Buffer) -> RhiResult<&WebGpuBuffer> {
    downcast::<WebGpuBuffer>(buffer.raw().as_any(), ResourceKind::Buffer)
}

// =============================================================================
// SAMPLER
// =============================================================================

pub struct WebGpuSampler {
    pub raw: wgpu::Sampler,
}

impl WebGpuSampler {
    pub fn new(device: &wgpu::Device, features: wgpu::Features, desc: &SamplerDesc) -> RhiResult<Self> {
        if desc.mip_lod_bias != 0.0 {
            log::warn!("WebGPU samplers have no LOD bias, ignoring {}", desc.mip_lod_bias);
        }
        let border = features.contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        let address = |mode: AddressMode| match mode {
            AddressMode::ClampToBorder if !border => {
                log::warn!("Clamp-to-border not supported by this adapter, clamping to edge");
                wgpu::AddressMode::ClampToEdge
            }
            other => conv::address_mode(other),
        };
        let uses_border = [desc.address_u, desc.address_v, desc.address_w]
            .contains(&AddressMode::ClampToBorder);

        // Anisotropy requires linear filtering everywhere
        let linear = desc.mag_filter == Filter::Linear
            && desc.min_filter == Filter::Linear
            && desc.mipmap_mode == MipmapMode::Linear;
        let anisotropy_clamp = match desc.max_anisotropy {
            Some(max) if linear => max.clamp(1.0, 16.0) as u16,
            Some(_) => {
                log::warn!("Anisotropic filtering needs linear filters, disabling it");
                1
            }
            None => 1,
        };

        let raw = scoped(device, ResourceKind::Sampler, || {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: desc.label.as_deref(),
                address_mode_u: address(desc.address_u),
                address_mode_v: address(desc.address_v),
                address_mode_w: address(desc.address_w),
                mag_filter: conv::filter(desc.mag_filter),
                min_filter: conv::filter(desc.min_filter),
                mipmap_filter: conv::mipmap_filter(desc.mipmap_mode),
                lod_min_clamp: desc.min_lod,
                lod_max_clamp: desc.max_lod,
                compare: desc.compare.map(conv::compare),
                anisotropy_clamp,
                border_color: (uses_border && border)
                    .then_some(wgpu::SamplerBorderColor::TransparentBlack),
            })
        })?;
        Ok(Self { raw })
    }
}

impl SamplerBackend for WebGpuSampler {}

// =============================================================================
// SHADER
// =============================================================================

pub struct WebGpuShader {
    pub module: wgpu::ShaderModule,
    pub entry_point: String,
    pub stage: ShaderStage,
}

impl WebGpuShader {
    pub fn new(device: &wgpu::Device, desc: &ShaderDesc) -> RhiResult<Self> {
        let source = match &desc.source {
            ShaderSource::Wgsl(code) => wgpu::ShaderSource::Wgsl(Cow::Borrowed(code.as_str())),
            ShaderSource::SpirV(words) => wgpu::ShaderSource::SpirV(Cow::Borrowed(words.as_slice())),
            ShaderSource::Msl(_) => {
                return Err(RhiError::unsupported(
                    ResourceKind::Shader,
                    "the WebGPU backend accepts WGSL or SPIR-V",
                ))
            }
        };
        let module = scoped(device, ResourceKind::Shader, || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: desc.label.as_deref(),
                source,
            })
        })?;
        Ok(Self {
            module,
            entry_point: desc.entry_point.clone(),
            stage: desc.stage,
        })
    }
}

impl ShaderBackend for WebGpuShader {}

pub struct WebGpuFramebuffer;

impl FramebufferBackend for WebGpuFramebuffer {}

/// WebGPU orders queue work implicitly; semaphores only satisfy the API
pub struct WebGpuSemaphore;

impl SemaphoreBackend for WebGpuSemaphore {}

// =============================================================================
// DESCRIPTOR SET
// =============================================================================

pub fn create_bind_group_layout(
    device: &wgpu::Device,
    layout: &DescriptorSetLayoutDesc,
) -> wgpu::BindGroupLayout {
    let mut entries = Vec::with_capacity(layout.bindings.len());
    for binding in &layout.bindings {
        let visibility = conv::shader_stages(binding.stages);
        match binding.ty {
            DescriptorType::UniformBuffer | DescriptorType::StorageBuffer => {
                let ty = if binding.ty == DescriptorType::UniformBuffer {
                    wgpu::BufferBindingType::Uniform
                } else {
                    wgpu::BufferBindingType::Storage { read_only: false }
                };
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: binding.binding,
                    visibility,
                    ty: wgpu::BindingType::Buffer {
                        ty,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                });
            }
            DescriptorType::CombinedImageSampler => {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: binding.binding,
                    visibility,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                });
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: binding.binding + SAMPLER_BINDING_OFFSET,
                    visibility,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                });
            }
        }
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: None,
        entries: &entries,
    })
}

enum Entry {
    Buffer { buffer: wgpu::Buffer, size: u64 },
    Texture { view: wgpu::TextureView, sampler: wgpu::Sampler },
}

/// Bind groups are immutable in WebGPU, so writes are collected and the group
/// is rebuilt on the next bind after any change.
pub struct WebGpuDescriptorSet {
    device: wgpu::Device,
    layout: wgpu::BindGroupLayout,
    layout_desc: DescriptorSetLayoutDesc,
    entries: Mutex<Vec<(u32, Entry)>>,
    cached: Mutex<Option<wgpu::BindGroup>>,
}

impl WebGpuDescriptorSet {
    pub fn new(device: &wgpu::Device, layout_desc: &DescriptorSetLayoutDesc) -> RhiResult<Self> {
        if let Some(b) = layout_desc
            .bindings
            .iter()
            .find(|b| b.binding >= SAMPLER_BINDING_OFFSET)
        {
            return Err(RhiError::unsupported(
                ResourceKind::DescriptorSet,
                format!(
                    "binding {} collides with WebGPU sampler slots (>= {})",
                    b.binding, SAMPLER_BINDING_OFFSET
                ),
            ));
        }
        let layout = scoped(device, ResourceKind::DescriptorSet, || {
            create_bind_group_layout(device, layout_desc)
        })?;
        Ok(Self {
            device: device.clone(),
            layout,
            layout_desc: layout_desc.clone(),
            entries: Mutex::new(Vec::new()),
            cached: Mutex::new(None),
        })
    }

    fn store(&self, binding: u32, entry: Entry) {
        let mut entries = self.entries.lock();
        entries.retain(|(b, _)| *b != binding);
        entries.push((binding, entry));
        *self.cached.lock() = None;
    }

    /// Current bind group, rebuilt if bindings changed since the last call
    pub fn bind_group(&self) -> RhiResult<wgpu::BindGroup> {
        let mut cached = self.cached.lock();
        if let Some(group) = &*cached {
            return Ok(group.clone());
        }

        let entries = self.entries.lock();
        if let Some(missing) = self
            .layout_desc
            .bindings
            .iter()
            .find(|b| !entries.iter().any(|(bound, _)| *bound == b.binding))
        {
            return Err(RhiError::Submission(format!(
                "descriptor binding {} was never written",
                missing.binding
            )));
        }

        let mut group_entries = Vec::with_capacity(entries.len() * 2);
        for (binding, entry) in entries.iter() {
            match entry {
                Entry::Buffer { buffer, size } => group_entries.push(wgpu::BindGroupEntry {
                    binding: *binding,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: 0,
                        size: NonZeroU64::new(*size),
                    }),
                }),
                Entry::Texture { view, sampler } => {
                    group_entries.push(wgpu::BindGroupEntry {
                        binding: *binding,
                        resource: wgpu::BindingResource::TextureView(view),
                    });
                    group_entries.push(wgpu::BindGroupEntry {
                        binding: *binding + SAMPLER_BINDING_OFFSET,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    });
                }
            }
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.layout,
            entries: &group_entries,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RhiError::Submission(format!("invalid bind group: {err}")));
        }
        *cached = Some(group.clone());
        Ok(group)
    }
}

impl DescriptorSetBackend for WebGpuDescriptorSet {
    fn write_buffer(&self, binding: &DescriptorBinding, buffer: &Buffer) -> RhiResult<()> {
        let raw = self::buffer(buffer)?;
        self.store(
            binding.binding,
            Entry::Buffer {
                buffer: raw.raw.clone(),
                size: buffer.size(),
            },
        );
        Ok(())
    }

    fn write_texture(
        &self,
        binding: &DescriptorBinding,
        texture: &Texture,
        sampler: &Sampler,
    ) -> RhiResult<()> {
        let view = self::texture(texture)?.view.clone();
        let sampler = downcast::<WebGpuSampler>(sampler.raw().as_any(), ResourceKind::Sampler)?
            .raw
            .clone();
        self.store(binding.binding, Entry::Texture { view, sampler });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_sizes_round_up_to_words() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(1040), 1040);
        assert_eq!(align4(1041), 1044);
    }
}
