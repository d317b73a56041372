// Vulkan resource objects
//
// Memory comes from gpu-allocator; every object keeps the context alive and
// destroys its native handles on drop.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::{AllocationError, MemoryLocation};
use parking_lot::Mutex;

use super::context::VulkanContext;
use super::conv;
use crate::rhi::hal::*;
use crate::rhi::resource::{Buffer, Sampler, Texture};
use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError, RhiResult};

fn allocation_error(kind: ResourceKind, err: AllocationError) -> RhiError {
    match err {
        AllocationError::OutOfMemory => RhiError::out_of_memory(kind),
        other => RhiError::unsupported(kind, other.to_string()),
    }
}

fn memory_location(memory: MemoryUsage) -> MemoryLocation {
    match memory {
        MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
        MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
        MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
    }
}

// =============================================================================
// BUFFER
// =============================================================================

pub struct VulkanBuffer {
    ctx: Arc<VulkanContext>,
    pub raw: vk::Buffer,
    allocation: Mutex<Option<Allocation>>,
}

impl VulkanBuffer {
    pub fn new(ctx: &Arc<VulkanContext>, desc: &BufferDesc) -> RhiResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(conv::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = unsafe { ctx.device.create_buffer(&buffer_info, None) }
            .map_err(|e| conv::creation_error(ResourceKind::Buffer, e))?;
        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(raw) };

        let allocation = ctx.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.label.as_deref().unwrap_or("buffer"),
            requirements,
            location: memory_location(desc.memory),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_buffer(raw, None) };
                return Err(allocation_error(ResourceKind::Buffer, e));
            }
        };

        let bound =
            unsafe { ctx.device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) };
        let buffer = Self {
            ctx: Arc::clone(ctx),
            raw,
            allocation: Mutex::new(Some(allocation)),
        };
        bound.map_err(|e| conv::creation_error(ResourceKind::Buffer, e))?;
        Ok(buffer)
    }
}

impl BufferBackend for VulkanBuffer {
    fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut allocation = self.allocation.lock();
        let mapped = allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| RhiError::InvalidUsage("buffer memory is not mapped".into()))?;
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let allocation = self.allocation.lock();
        let mapped = allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| RhiError::InvalidUsage("buffer memory is not mapped".into()))?;
        let start = offset as usize;
        out.copy_from_slice(&mapped[start..start + out.len()]);
        Ok(())
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take() {
            if let Err(e) = self.ctx.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
        unsafe { self.ctx.device.destroy_buffer(self.raw, None) };
    }
}

// =============================================================================
// TEXTURE
// =============================================================================

pub struct VulkanTexture {
    ctx: Arc<VulkanContext>,
    pub image: vk::Image,
    /// Every mip and layer, used for sampling
    pub view: vk::ImageView,
    /// Mip 0, layer 0, used as a render target
    pub attachment_view: vk::ImageView,
    allocation: Mutex<Option<Allocation>>,
    pub format: Format,
    pub aspect: vk::ImageAspectFlags,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub layers: u32,
    /// Layout as of the last recorded command; submissions are recorded in queue order
    pub layout: Mutex<vk::ImageLayout>,
    /// Swap chain images belong to the swap chain, not to us
    owned: bool,
}

impl VulkanTexture {
    pub fn new(ctx: &Arc<VulkanContext>, desc: &TextureDesc) -> RhiResult<Self> {
        let (image_type, flags) = match desc.texture_type {
            TextureType::D2 => (vk::ImageType::TYPE_2D, vk::ImageCreateFlags::empty()),
            TextureType::Cube => (vk::ImageType::TYPE_2D, vk::ImageCreateFlags::CUBE_COMPATIBLE),
            TextureType::D3 => (vk::ImageType::TYPE_3D, vk::ImageCreateFlags::empty()),
        };
        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(conv::format(desc.format))
            .extent(extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.layer_count())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { ctx.device.create_image(&image_info, None) }
            .map_err(|e| conv::creation_error(ResourceKind::Texture, e))?;
        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };

        let allocation = ctx.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.label.as_deref().unwrap_or("texture"),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                return Err(allocation_error(ResourceKind::Texture, e));
            }
        };

        let mut texture = Self {
            ctx: Arc::clone(ctx),
            image,
            view: vk::ImageView::null(),
            attachment_view: vk::ImageView::null(),
            allocation: Mutex::new(Some(allocation)),
            format: desc.format,
            aspect: conv::aspect(desc.format),
            extent,
            mip_levels: desc.mip_levels,
            layers: desc.layer_count(),
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            owned: true,
        };
        // From here on Drop cleans up whatever was created
        if let Some(allocation) = texture.allocation.get_mut().as_ref() {
            unsafe { ctx.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
                .map_err(|e| conv::creation_error(ResourceKind::Texture, e))?;
        }

        let view_type = match desc.texture_type {
            TextureType::D2 if desc.array_layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
            TextureType::D2 => vk::ImageViewType::TYPE_2D,
            TextureType::Cube if desc.array_layers > 1 => vk::ImageViewType::CUBE_ARRAY,
            TextureType::Cube => vk::ImageViewType::CUBE,
            TextureType::D3 => vk::ImageViewType::TYPE_3D,
        };
        texture.view = texture.create_view(view_type, texture.mip_levels, texture.layers)?;
        let attachment_type = match desc.texture_type {
            TextureType::D3 => vk::ImageViewType::TYPE_3D,
            _ => vk::ImageViewType::TYPE_2D,
        };
        texture.attachment_view = texture.create_view(attachment_type, 1, 1)?;
        Ok(texture)
    }

    /// Wrap an image owned by a swap chain
    pub fn from_swap_image(
        ctx: &Arc<VulkanContext>,
        image: vk::Image,
        format: Format,
        extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let mut texture = Self {
            ctx: Arc::clone(ctx),
            image,
            view: vk::ImageView::null(),
            attachment_view: vk::ImageView::null(),
            allocation: Mutex::new(None),
            format,
            aspect: vk::ImageAspectFlags::COLOR,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            layers: 1,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            owned: false,
        };
        texture.view = texture.create_view(vk::ImageViewType::TYPE_2D, 1, 1)?;
        texture.attachment_view = texture.view;
        Ok(texture)
    }

    fn create_view(&self, view_type: vk::ImageViewType, mips: u32, layers: u32) -> RhiResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(view_type)
            .format(conv::format(self.format))
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: mips,
                base_array_layer: 0,
                layer_count: layers,
            });

        unsafe { self.ctx.device.create_image_view(&create_info, None) }
            .map_err(|e| conv::creation_error(ResourceKind::Texture, e))
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    /// Aspect used by buffer <-> image copies, which take one aspect at a time
    pub fn copy_aspect(&self) -> vk::ImageAspectFlags {
        if self.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> level).max(1),
            height: (self.extent.height >> level).max(1),
            depth: (self.extent.depth >> level).max(1),
        }
    }
}

impl TextureBackend for VulkanTexture {}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            if self.attachment_view != self.view && self.attachment_view != vk::ImageView::null() {
                self.ctx.device.destroy_image_view(self.attachment_view, None);
            }
            if self.view != vk::ImageView::null() {
                self.ctx.device.destroy_image_view(self.view, None);
            }
        }
        if !self.owned {
            return;
        }
        if let Some(allocation) = self.allocation.get_mut().take() {
            if let Err(e) = self.ctx.allocator.lock().free(allocation) {
                log::error!("Failed to free texture memory: {}", e);
            }
        }
        unsafe { self.ctx.device.destroy_image(self.image, None) };
    }
}

// =============================================================================
// SAMPLER, SHADER, FRAMEBUFFER, SEMAPHORE
// =============================================================================

pub struct VulkanSampler {
    ctx: Arc<VulkanContext>,
    pub raw: vk::Sampler,
}

impl VulkanSampler {
    pub fn new(ctx: &Arc<VulkanContext>, desc: &SamplerDesc) -> RhiResult<Self> {
        let anisotropy = desc
            .max_anisotropy
            .filter(|_| ctx.features.sampler_anisotropy == vk::TRUE)
            .map(|max| max.min(ctx.properties.limits.max_sampler_anisotropy));
        if desc.max_anisotropy.is_some() && anisotropy.is_none() {
            log::warn!("Anisotropic filtering not supported by this GPU, sampler created without it");
        }

        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(conv::filter(desc.mag_filter))
            .min_filter(conv::filter(desc.min_filter))
            .mipmap_mode(conv::mipmap_mode(desc.mipmap_mode))
            .address_mode_u(conv::address_mode(desc.address_u))
            .address_mode_v(conv::address_mode(desc.address_v))
            .address_mode_w(conv::address_mode(desc.address_w))
            .mip_lod_bias(desc.mip_lod_bias)
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare.is_some())
            .compare_op(conv::compare_op(desc.compare.unwrap_or(CompareOp::Always)))
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);

        let raw = unsafe { ctx.device.create_sampler(&create_info, None) }
            .map_err(|e| conv::creation_error(ResourceKind::Sampler, e))?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
        })
    }
}

impl SamplerBackend for VulkanSampler {}

impl Drop for VulkanSampler {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_sampler(self.raw, None) };
    }
}

pub struct VulkanShader {
    ctx: Arc<VulkanContext>,
    pub module: vk::ShaderModule,
    pub entry_point: CString,
    pub stage: vk::ShaderStageFlags,
}

impl VulkanShader {
    pub fn new(ctx: &Arc<VulkanContext>, desc: &ShaderDesc) -> RhiResult<Self> {
        let ShaderSource::SpirV(code) = &desc.source else {
            return Err(RhiError::unsupported(
                ResourceKind::Shader,
                format!("Vulkan consumes SPIR-V, got {:?}", desc.source.kind()),
            ));
        };
        let entry_point = CString::new(desc.entry_point.as_str()).map_err(|_| {
            RhiError::invalid_desc(ResourceKind::Shader, "entry point contains a NUL byte")
        })?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { ctx.device.create_shader_module(&create_info, None) }
            .map_err(|e| conv::creation_error(ResourceKind::Shader, e))?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            module,
            entry_point,
            stage: conv::shader_stage(desc.stage),
        })
    }
}

impl ShaderBackend for VulkanShader {}

impl Drop for VulkanShader {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_shader_module(self.module, None) };
    }
}

/// Dynamic rendering needs no framebuffer object; attachments are read from
/// the frontend framebuffer when rendering begins.
pub struct VulkanFramebuffer;

impl FramebufferBackend for VulkanFramebuffer {}

pub struct VulkanSemaphore {
    ctx: Arc<VulkanContext>,
    pub raw: vk::Semaphore,
}

impl VulkanSemaphore {
    pub fn new(ctx: &Arc<VulkanContext>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let raw = unsafe { ctx.device.create_semaphore(&create_info, None) }
            .map_err(|e| conv::creation_error(ResourceKind::Semaphore, e))?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw,
        })
    }
}

impl SemaphoreBackend for VulkanSemaphore {}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_semaphore(self.raw, None) };
    }
}

pub fn semaphore(raw: &dyn SemaphoreBackend) -> RhiResult<&VulkanSemaphore> {
    downcast::<VulkanSemaphore>(raw.as_any(), ResourceKind::Semaphore)
}

// =============================================================================
// DESCRIPTOR SET
// =============================================================================

pub fn create_set_layout(
    device: &ash::Device,
    layout: &DescriptorSetLayoutDesc,
) -> RhiResult<vk::DescriptorSetLayout> {
    let bindings: Vec<_> = layout
        .bindings
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.binding)
                .descriptor_type(conv::descriptor_type(b.ty))
                .descriptor_count(1)
                .stage_flags(conv::shader_stages(b.stages))
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None) }
        .map_err(|e| conv::creation_error(ResourceKind::DescriptorSet, e))
}

/// One pool per set keeps sets independent of each other's lifetimes
pub struct VulkanDescriptorSet {
    ctx: Arc<VulkanContext>,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub raw: vk::DescriptorSet,
}

impl VulkanDescriptorSet {
    pub fn new(ctx: &Arc<VulkanContext>, layout_desc: &DescriptorSetLayoutDesc) -> RhiResult<Self> {
        let layout = create_set_layout(&ctx.device, layout_desc)?;
        let mut set = Self {
            ctx: Arc::clone(ctx),
            layout,
            pool: vk::DescriptorPool::null(),
            raw: vk::DescriptorSet::null(),
        };

        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &layout_desc.bindings {
            let ty = conv::descriptor_type(binding.ty);
            match sizes.iter_mut().find(|s| s.ty == ty) {
                Some(size) => size.descriptor_count += 1,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: 1,
                }),
            }
        }
        if sizes.is_empty() {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            });
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&sizes);
        set.pool = unsafe { ctx.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| conv::creation_error(ResourceKind::DescriptorSet, e))?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(set.pool)
            .set_layouts(&layouts);
        let sets = unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| conv::creation_error(ResourceKind::DescriptorSet, e))?;
        set.raw = sets.first().copied().unwrap_or_default();
        Ok(set)
    }
}

impl DescriptorSetBackend for VulkanDescriptorSet {
    fn write_buffer(&self, binding: &DescriptorBinding, buffer: &Buffer) -> RhiResult<()> {
        let raw = downcast::<VulkanBuffer>(buffer.raw().as_any(), ResourceKind::Buffer)?;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: raw.raw,
            offset: 0,
            range: buffer.size(),
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.raw)
            .dst_binding(binding.binding)
            .descriptor_type(conv::descriptor_type(binding.ty))
            .buffer_info(&buffer_info);
        unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn write_texture(
        &self,
        binding: &DescriptorBinding,
        texture: &Texture,
        sampler: &Sampler,
    ) -> RhiResult<()> {
        let raw_texture = downcast::<VulkanTexture>(texture.raw().as_any(), ResourceKind::Texture)?;
        let raw_sampler = downcast::<VulkanSampler>(sampler.raw().as_any(), ResourceKind::Sampler)?;
        let image_info = [vk::DescriptorImageInfo {
            sampler: raw_sampler.raw,
            image_view: raw_texture.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.raw)
            .dst_binding(binding.binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }
}

impl Drop for VulkanDescriptorSet {
    fn drop(&mut self) {
        unsafe {
            if self.pool != vk::DescriptorPool::null() {
                self.ctx.device.destroy_descriptor_pool(self.pool, None);
            }
            self.ctx.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
