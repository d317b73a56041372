// RHI -> Metal conversions

use metal::*;

use crate::rhi::types::*;

pub fn pixel_format(format: Format) -> MTLPixelFormat {
    match format {
        Format::R8Unorm => MTLPixelFormat::R8Unorm,
        Format::R8G8Unorm => MTLPixelFormat::RG8Unorm,
        Format::R8G8B8A8Unorm => MTLPixelFormat::RGBA8Unorm,
        Format::R8G8B8A8Srgb => MTLPixelFormat::RGBA8Unorm_sRGB,
        Format::B8G8R8A8Unorm => MTLPixelFormat::BGRA8Unorm,
        Format::B8G8R8A8Srgb => MTLPixelFormat::BGRA8Unorm_sRGB,
        Format::R16Sfloat => MTLPixelFormat::R16Float,
        Format::R16G16Sfloat => MTLPixelFormat::RG16Float,
        Format::R16G16B16A16Sfloat => MTLPixelFormat::RGBA16Float,
        Format::R32Uint => MTLPixelFormat::R32Uint,
        Format::R32Sfloat => MTLPixelFormat::R32Float,
        Format::R32G32Sfloat => MTLPixelFormat::RG32Float,
        Format::R32G32B32A32Sfloat => MTLPixelFormat::RGBA32Float,
        Format::D16Unorm => MTLPixelFormat::Depth16Unorm,
        Format::D32Sfloat => MTLPixelFormat::Depth32Float,
        Format::D24UnormS8Uint => MTLPixelFormat::Depth24Unorm_Stencil8,
        Format::D32SfloatS8Uint => MTLPixelFormat::Depth32Float_Stencil8,
    }
}

pub fn texture_usage(usage: TextureUsage) -> MTLTextureUsage {
    let mut flags = MTLTextureUsage::Unknown;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= MTLTextureUsage::ShaderRead;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= MTLTextureUsage::ShaderRead | MTLTextureUsage::ShaderWrite;
    }
    if usage.intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
        flags |= MTLTextureUsage::RenderTarget;
    }
    flags
}

pub fn vertex_format(format: VertexFormat) -> MTLVertexFormat {
    match format {
        VertexFormat::Float32 => MTLVertexFormat::Float,
        VertexFormat::Float32x2 => MTLVertexFormat::Float2,
        VertexFormat::Float32x3 => MTLVertexFormat::Float3,
        VertexFormat::Float32x4 => MTLVertexFormat::Float4,
        VertexFormat::Uint32 => MTLVertexFormat::UInt,
        VertexFormat::Unorm8x4 => MTLVertexFormat::UChar4Normalized,
    }
}

pub fn step_function(rate: VertexInputRate) -> MTLVertexStepFunction {
    match rate {
        VertexInputRate::Vertex => MTLVertexStepFunction::PerVertex,
        VertexInputRate::Instance => MTLVertexStepFunction::PerInstance,
    }
}

pub fn primitive_type(topology: PrimitiveTopology) -> MTLPrimitiveType {
    match topology {
        PrimitiveTopology::PointList => MTLPrimitiveType::Point,
        PrimitiveTopology::LineList => MTLPrimitiveType::Line,
        PrimitiveTopology::LineStrip => MTLPrimitiveType::LineStrip,
        PrimitiveTopology::TriangleList => MTLPrimitiveType::Triangle,
        PrimitiveTopology::TriangleStrip => MTLPrimitiveType::TriangleStrip,
    }
}

pub fn winding(face: FrontFace) -> MTLWinding {
    match face {
        FrontFace::CounterClockwise => MTLWinding::CounterClockwise,
        FrontFace::Clockwise => MTLWinding::Clockwise,
    }
}

pub fn compare(op: CompareOp) -> MTLCompareFunction {
    match op {
        CompareOp::Never => MTLCompareFunction::Never,
        CompareOp::Less => MTLCompareFunction::Less,
        CompareOp::Equal => MTLCompareFunction::Equal,
        CompareOp::LessOrEqual => MTLCompareFunction::LessEqual,
        CompareOp::Greater => MTLCompareFunction::Greater,
        CompareOp::NotEqual => MTLCompareFunction::NotEqual,
        CompareOp::GreaterOrEqual => MTLCompareFunction::GreaterEqual,
        CompareOp::Always => MTLCompareFunction::Always,
    }
}

pub fn filter(filter: Filter) -> MTLSamplerMinMagFilter {
    match filter {
        Filter::Nearest => MTLSamplerMinMagFilter::Nearest,
        Filter::Linear => MTLSamplerMinMagFilter::Linear,
    }
}

pub fn mip_filter(mode: MipmapMode) -> MTLSamplerMipFilter {
    match mode {
        MipmapMode::Nearest => MTLSamplerMipFilter::Nearest,
        MipmapMode::Linear => MTLSamplerMipFilter::Linear,
    }
}

pub fn address_mode(mode: AddressMode) -> MTLSamplerAddressMode {
    match mode {
        AddressMode::Repeat => MTLSamplerAddressMode::Repeat,
        AddressMode::MirroredRepeat => MTLSamplerAddressMode::MirrorRepeat,
        AddressMode::ClampToEdge => MTLSamplerAddressMode::ClampToEdge,
        AddressMode::ClampToBorder => MTLSamplerAddressMode::ClampToBorderColor,
    }
}

pub fn index_type(format: IndexFormat) -> MTLIndexType {
    match format {
        IndexFormat::U16 => MTLIndexType::UInt16,
        IndexFormat::U32 => MTLIndexType::UInt32,
    }
}

pub fn load_action(op: LoadOp) -> MTLLoadAction {
    match op {
        LoadOp::Load => MTLLoadAction::Load,
        LoadOp::Clear(_) => MTLLoadAction::Clear,
        LoadOp::DontCare => MTLLoadAction::DontCare,
    }
}
