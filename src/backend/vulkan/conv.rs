// RHI -> Vulkan enum and flag conversions

use ash::vk;

use crate::rhi::types::*;
use crate::rhi::{ResourceKind, RhiError};

pub fn format(format: Format) -> vk::Format {
    match format {
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R8G8Unorm => vk::Format::R8G8_UNORM,
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::R16Sfloat => vk::Format::R16_SFLOAT,
        Format::R16G16Sfloat => vk::Format::R16G16_SFLOAT,
        Format::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Sfloat => vk::Format::R32_SFLOAT,
        Format::R32G32Sfloat => vk::Format::R32G32_SFLOAT,
        Format::R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Sfloat => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Inverse of `format`, for surface formats reported by the driver
pub fn format_from_vk(format: vk::Format) -> Option<Format> {
    Format::ALL.into_iter().find(|f| self::format(*f) == format)
}

pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    let table = [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    let table = [
        (TextureUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (TextureUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (TextureUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (
            TextureUsage::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ),
        (TextureUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (TextureUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// Texture usages a format supports with optimal tiling
pub fn format_features_to_usage(features: vk::FormatFeatureFlags) -> TextureUsage {
    let mut usage = TextureUsage::empty();
    let table = [
        (vk::FormatFeatureFlags::SAMPLED_IMAGE, TextureUsage::SAMPLED),
        (vk::FormatFeatureFlags::STORAGE_IMAGE, TextureUsage::STORAGE),
        (vk::FormatFeatureFlags::COLOR_ATTACHMENT, TextureUsage::COLOR_ATTACHMENT),
        (
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            TextureUsage::DEPTH_STENCIL_ATTACHMENT,
        ),
        (vk::FormatFeatureFlags::TRANSFER_SRC, TextureUsage::TRANSFER_SRC),
        (vk::FormatFeatureFlags::TRANSFER_DST, TextureUsage::TRANSFER_DST),
    ];
    for (theirs, ours) in table {
        if features.contains(theirs) {
            usage |= ours;
        }
    }
    usage
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    shader_stages(stage.into())
}

pub fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Uint32 => vk::Format::R32_UINT,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
    }
}

pub fn input_rate(rate: VertexInputRate) -> vk::VertexInputRate {
    match rate {
        VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
        VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
    }
}

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub fn polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

pub fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode(mode: MipmapMode) -> vk::SamplerMipmapMode {
    match mode {
        MipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        MipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

pub fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

pub fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

pub fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear(_) => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

/// Access mask and pipeline stages a resource state implies
pub fn state_access(state: ResourceState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    use vk::AccessFlags as A;
    use vk::PipelineStageFlags as S;
    match state {
        ResourceState::Undefined => (A::empty(), S::TOP_OF_PIPE),
        ResourceState::TransferSrc => (A::TRANSFER_READ, S::TRANSFER),
        ResourceState::TransferDst => (A::TRANSFER_WRITE, S::TRANSFER),
        ResourceState::VertexBuffer => (A::VERTEX_ATTRIBUTE_READ, S::VERTEX_INPUT),
        ResourceState::IndexBuffer => (A::INDEX_READ, S::VERTEX_INPUT),
        ResourceState::UniformBuffer => (
            A::UNIFORM_READ,
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
        ),
        ResourceState::ShaderRead => (
            A::SHADER_READ,
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
        ),
        ResourceState::ShaderWrite => (
            A::SHADER_WRITE,
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
        ),
        ResourceState::ColorAttachment => (
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        ResourceState::DepthAttachment => (
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
        ),
        ResourceState::HostRead => (A::HOST_READ, S::HOST),
        ResourceState::Present => (A::empty(), S::BOTTOM_OF_PIPE),
    }
}

/// Image layout a texture is expected to be in for `state`
pub fn state_layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
        ResourceState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ResourceState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::DepthAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        ResourceState::ShaderWrite
        | ResourceState::HostRead
        | ResourceState::VertexBuffer
        | ResourceState::IndexBuffer
        | ResourceState::UniformBuffer => vk::ImageLayout::GENERAL,
    }
}

/// Map a failed creation call onto the RHI error taxonomy
pub fn creation_error(kind: ResourceKind, result: vk::Result) -> RhiError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            RhiError::out_of_memory(kind)
        }
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost(result.to_string()),
        other => RhiError::unsupported(kind, other.to_string()),
    }
}

/// Map a failed queue or synchronization call
pub fn queue_error(what: &str, result: vk::Result) -> RhiError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost(format!("{what}: {result}")),
        vk::Result::TIMEOUT | vk::Result::NOT_READY => RhiError::Timeout,
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
            RhiError::SurfaceLost
        }
        other => RhiError::Submission(format!("{what} failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_format_round_trips() {
        for format in Format::ALL {
            assert_eq!(format_from_vk(self::format(format)), Some(format));
        }
    }

    #[test]
    fn depth_stencil_aspects() {
        assert_eq!(aspect(Format::D32Sfloat), vk::ImageAspectFlags::DEPTH);
        assert!(aspect(Format::D24UnormS8Uint).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(aspect(Format::B8G8R8A8Srgb), vk::ImageAspectFlags::COLOR);
    }
}
