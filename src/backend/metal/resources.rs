// Metal resource wrappers
//
// metal-rs objects are retained Objective-C references; cloning retains and
// dropping releases, so none of these wrappers need a Drop impl.
//
// Binding model: Metal has flat per-stage argument tables instead of
// descriptor sets. A descriptor buffer at binding N lands in buffer slot
// N + BUFFER_SLOT_OFFSET (slots below it belong to vertex buffers), textures
// and samplers at slot N, push constants in PUSH_CONSTANT_SLOT.

use std::collections::BTreeMap;

use metal::{MTLResourceOptions, MTLStorageMode, MTLTextureType};
use parking_lot::Mutex;

use super::conv;
use crate::rhi::hal::*;
use crate::rhi::resource::{Buffer, Sampler, Texture};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

/// First buffer slot used by descriptor buffers; vertex buffers sit below it
pub const BUFFER_SLOT_OFFSET: u64 = 10;
/// Buffer slot receiving push constant bytes
pub const PUSH_CONSTANT_SLOT: u64 = 30;

// =============================================================================
// BUFFER
// =============================================================================

pub struct MetalBuffer {
    pub raw: metal::Buffer,
}

impl MetalBuffer {
    pub fn new(device: &metal::Device, desc: &BufferDesc) -> RhiResult<Self> {
        let options = match desc.memory {
            MemoryUsage::GpuOnly => MTLResourceOptions::StorageModePrivate,
            MemoryUsage::CpuToGpu => {
                MTLResourceOptions::StorageModeShared | MTLResourceOptions::CPUCacheModeWriteCombined
            }
            MemoryUsage::GpuToCpu => MTLResourceOptions::StorageModeShared,
        };
        if desc.size > device.max_buffer_length() {
            return Err(RhiError::out_of_memory(ResourceKind::Buffer));
        }
        let raw = device.new_buffer(desc.size, options);
        if let Some(label) = &desc.label {
            raw.set_label(label);
        }
        Ok(Self { raw })
    }

    fn contents(&self) -> RhiResult<*mut u8> {
        let ptr = self.raw.contents() as *mut u8;
        if ptr.is_null() {
            return Err(RhiError::InvalidUsage("Metal buffer has no CPU mapping".into()));
        }
        Ok(ptr)
    }
}

impl BufferBackend for MetalBuffer {
    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        let ptr = self.contents()?;
        // The frontend checked offset + len against the buffer size
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let ptr = self.contents()?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

pub fn buffer(buffer: &Buffer) -> RhiResult<&MetalBuffer> {
    downcast::<MetalBuffer>(buffer.raw().as_any(), ResourceKind::Buffer)
}

// =============================================================================
// TEXTURE
// =============================================================================

pub struct MetalTexture {
    pub raw: metal::Texture,
    pub format: Format,
    pub texture_type: TextureType,
}

impl MetalTexture {
    pub fn new(device: &metal::Device, desc: &TextureDesc) -> RhiResult<Self> {
        let descriptor = metal::TextureDescriptor::new();
        let (texture_type, array_length) = match (desc.texture_type, desc.array_layers) {
            (TextureType::D2, 1) => (MTLTextureType::D2, 1),
            (TextureType::D2, layers) => (MTLTextureType::D2Array, layers),
            (TextureType::Cube, 1) => (MTLTextureType::Cube, 1),
            (TextureType::Cube, layers) => (MTLTextureType::CubeArray, layers),
            (TextureType::D3, _) => (MTLTextureType::D3, 1),
        };
        descriptor.set_texture_type(texture_type);
        descriptor.set_pixel_format(conv::pixel_format(desc.format));
        descriptor.set_width(u64::from(desc.width));
        descriptor.set_height(u64::from(desc.height));
        descriptor.set_depth(u64::from(desc.depth.max(1)));
        descriptor.set_mipmap_level_count(u64::from(desc.mip_levels));
        descriptor.set_array_length(u64::from(array_length));
        descriptor.set_usage(conv::texture_usage(desc.usage));
        // Host uploads and readbacks always go through blit copies
        descriptor.set_storage_mode(MTLStorageMode::Private);

        let raw = device.new_texture(&descriptor);
        if let Some(label) = &desc.label {
            raw.set_label(label);
        }
        Ok(Self {
            raw,
            format: desc.format,
            texture_type: desc.texture_type,
        })
    }

    /// Slices a blit copy walks: array layers, or cube faces times layers
    pub fn slice_count(&self) -> u64 {
        match self.raw.texture_type() {
            MTLTextureType::D3 => 1,
            MTLTextureType::Cube | MTLTextureType::CubeArray => self.raw.array_length() * 6,
            _ => self.raw.array_length(),
        }
    }
}

impl TextureBackend for MetalTexture {}

pub fn texture(texture: &Texture) -> RhiResult<&MetalTexture> {
    downcast::<MetalTexture>(texture.raw().as_any(), ResourceKind::Texture)
}

// =============================================================================
// SAMPLER & SHADER
// =============================================================================

pub struct MetalSampler {
    pub raw: metal::SamplerState,
}

impl MetalSampler {
    pub fn new(device: &metal::Device, desc: &SamplerDesc) -> RhiResult<Self> {
        let descriptor = metal::SamplerDescriptor::new();
        descriptor.set_min_filter(conv::filter(desc.min_filter));
        descriptor.set_mag_filter(conv::filter(desc.mag_filter));
        descriptor.set_mip_filter(conv::mip_filter(desc.mipmap_mode));
        descriptor.set_address_mode_s(conv::address_mode(desc.address_u));
        descriptor.set_address_mode_t(conv::address_mode(desc.address_v));
        descriptor.set_address_mode_r(conv::address_mode(desc.address_w));
        descriptor.set_lod_min_clamp(desc.min_lod);
        descriptor.set_lod_max_clamp(desc.max_lod);
        if let Some(anisotropy) = desc.max_anisotropy {
            descriptor.set_max_anisotropy(anisotropy.clamp(1.0, 16.0) as u64);
        }
        if let Some(compare) = desc.compare {
            descriptor.set_compare_function(conv::compare(compare));
        }
        if desc.mip_lod_bias != 0.0 {
            log::warn!("Metal samplers have no LOD bias, ignoring {}", desc.mip_lod_bias);
        }
        Ok(Self {
            raw: device.new_sampler(&descriptor),
        })
    }
}

impl SamplerBackend for MetalSampler {}

pub fn sampler(sampler: &Sampler) -> RhiResult<&MetalSampler> {
    downcast::<MetalSampler>(sampler.raw().as_any(), ResourceKind::Sampler)
}

pub struct MetalShader {
    pub function: metal::Function,
}

impl MetalShader {
    pub fn new(device: &metal::Device, desc: &ShaderDesc) -> RhiResult<Self> {
        let ShaderSource::Msl(source) = &desc.source else {
            return Err(RhiError::unsupported(
                ResourceKind::Shader,
                format!("Metal consumes MSL source, got {:?}", desc.source.kind()),
            ));
        };
        let options = metal::CompileOptions::new();
        let library = device
            .new_library_with_source(source, &options)
            .map_err(|e| {
                log::error!("MSL compilation failed: {}", e);
                RhiError::invalid_desc(ResourceKind::Shader, e)
            })?;
        let function = library.get_function(&desc.entry_point, None).map_err(|e| {
            RhiError::invalid_desc(
                ResourceKind::Shader,
                format!("entry point '{}' not found: {e}", desc.entry_point),
            )
        })?;
        Ok(Self { function })
    }
}

impl ShaderBackend for MetalShader {}

pub struct MetalFramebuffer;

impl FramebufferBackend for MetalFramebuffer {}

/// Commands on one Metal queue execute in submission order, so there is
/// nothing for a semaphore to order.
pub struct MetalSemaphore;

impl SemaphoreBackend for MetalSemaphore {}

// =============================================================================
// DESCRIPTOR SET
// =============================================================================

#[derive(Clone)]
pub enum MetalBinding {
    Buffer(metal::Buffer),
    Texture(metal::Texture, metal::SamplerState),
}

pub struct MetalDescriptorSet {
    entries: Mutex<BTreeMap<u32, (ShaderStages, MetalBinding)>>,
}

impl MetalDescriptorSet {
    pub fn new(layout: &DescriptorSetLayoutDesc) -> RhiResult<Self> {
        let collides = |b: &&DescriptorBinding| {
            b.ty != DescriptorType::CombinedImageSampler
                && u64::from(b.binding) + BUFFER_SLOT_OFFSET >= PUSH_CONSTANT_SLOT
        };
        if let Some(binding) = layout.bindings.iter().find(collides) {
            return Err(RhiError::unsupported(
                ResourceKind::DescriptorSet,
                format!(
                    "buffer binding {} collides with the push constant slot",
                    binding.binding
                ),
            ));
        }
        Ok(Self {
            entries: Mutex::new(BTreeMap::new()),
        })
    }

    /// Snapshot of the written bindings, in binding order
    pub fn entries(&self) -> Vec<(u32, ShaderStages, MetalBinding)> {
        self.entries
            .lock()
            .iter()
            .map(|(binding, (stages, entry))| (*binding, *stages, entry.clone()))
            .collect()
    }
}

impl DescriptorSetBackend for MetalDescriptorSet {
    fn write_buffer(&self, binding: &DescriptorBinding, target: &Buffer) -> RhiResult<()> {
        let raw = buffer(target)?.raw.clone();
        self.entries
            .lock()
            .insert(binding.binding, (binding.stages, MetalBinding::Buffer(raw)));
        Ok(())
    }

    fn write_texture(
        &self,
        binding: &DescriptorBinding,
        target: &Texture,
        target_sampler: &Sampler,
    ) -> RhiResult<()> {
        let raw = texture(target)?.raw.clone();
        let state = sampler(target_sampler)?.raw.clone();
        self.entries.lock().insert(
            binding.binding,
            (binding.stages, MetalBinding::Texture(raw, state)),
        );
        Ok(())
    }
}
