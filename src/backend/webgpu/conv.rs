// RHI -> wgpu conversions

use crate::rhi::types::*;

pub fn format(format: Format) -> wgpu::TextureFormat {
    use wgpu::TextureFormat as T;
    match format {
        Format::R8Unorm => T::R8Unorm,
        Format::R8G8Unorm => T::Rg8Unorm,
        Format::R8G8B8A8Unorm => T::Rgba8Unorm,
        Format::R8G8B8A8Srgb => T::Rgba8UnormSrgb,
        Format::B8G8R8A8Unorm => T::Bgra8Unorm,
        Format::B8G8R8A8Srgb => T::Bgra8UnormSrgb,
        Format::R16Sfloat => T::R16Float,
        Format::R16G16Sfloat => T::Rg16Float,
        Format::R16G16B16A16Sfloat => T::Rgba16Float,
        Format::R32Uint => T::R32Uint,
        Format::R32Sfloat => T::R32Float,
        Format::R32G32Sfloat => T::Rg32Float,
        Format::R32G32B32A32Sfloat => T::Rgba32Float,
        Format::D16Unorm => T::Depth16Unorm,
        Format::D32Sfloat => T::Depth32Float,
        Format::D24UnormS8Uint => T::Depth24PlusStencil8,
        Format::D32SfloatS8Uint => T::Depth32FloatStencil8,
    }
}

pub fn format_from_wgpu(format: wgpu::TextureFormat) -> Option<Format> {
    Format::ALL.into_iter().find(|f| self::format(*f) == format)
}

pub fn buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut flags = wgpu::BufferUsages::empty();
    let table = [
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
        (BufferUsage::TRANSFER_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::TRANSFER_DST, wgpu::BufferUsages::COPY_DST),
    ];
    for (ours, theirs) in table {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub fn texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
    let mut flags = wgpu::TextureUsages::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if usage.intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
        flags |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(TextureUsage::TRANSFER_SRC) {
        flags |= wgpu::TextureUsages::COPY_SRC;
    }
    if usage.contains(TextureUsage::TRANSFER_DST) {
        flags |= wgpu::TextureUsages::COPY_DST;
    }
    flags
}

/// Usages a format allows on this adapter, in RHI terms
pub fn allowed_usage(format: Format, allowed: wgpu::TextureUsages) -> TextureUsage {
    let mut usage = TextureUsage::empty();
    if allowed.contains(wgpu::TextureUsages::TEXTURE_BINDING) {
        usage |= TextureUsage::SAMPLED;
    }
    if allowed.contains(wgpu::TextureUsages::STORAGE_BINDING) {
        usage |= TextureUsage::STORAGE;
    }
    if allowed.contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
        usage |= if format.is_depth() {
            TextureUsage::DEPTH_STENCIL_ATTACHMENT
        } else {
            TextureUsage::COLOR_ATTACHMENT
        };
    }
    if allowed.contains(wgpu::TextureUsages::COPY_SRC) {
        usage |= TextureUsage::TRANSFER_SRC;
    }
    if allowed.contains(wgpu::TextureUsages::COPY_DST) {
        usage |= TextureUsage::TRANSFER_DST;
    }
    usage
}

pub fn shader_stages(stages: ShaderStages) -> wgpu::ShaderStages {
    let mut flags = wgpu::ShaderStages::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        flags |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= wgpu::ShaderStages::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= wgpu::ShaderStages::COMPUTE;
    }
    flags
}

pub fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
    }
}

pub fn step_mode(rate: VertexInputRate) -> wgpu::VertexStepMode {
    match rate {
        VertexInputRate::Vertex => wgpu::VertexStepMode::Vertex,
        VertexInputRate::Instance => wgpu::VertexStepMode::Instance,
    }
}

pub fn topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

pub fn polygon_mode(mode: PolygonMode) -> wgpu::PolygonMode {
    match mode {
        PolygonMode::Fill => wgpu::PolygonMode::Fill,
        PolygonMode::Line => wgpu::PolygonMode::Line,
        PolygonMode::Point => wgpu::PolygonMode::Point,
    }
}

pub fn front_face(face: FrontFace) -> wgpu::FrontFace {
    match face {
        FrontFace::CounterClockwise => wgpu::FrontFace::Ccw,
        FrontFace::Clockwise => wgpu::FrontFace::Cw,
    }
}

pub fn compare(op: CompareOp) -> wgpu::CompareFunction {
    match op {
        CompareOp::Never => wgpu::CompareFunction::Never,
        CompareOp::Less => wgpu::CompareFunction::Less,
        CompareOp::Equal => wgpu::CompareFunction::Equal,
        CompareOp::LessOrEqual => wgpu::CompareFunction::LessEqual,
        CompareOp::Greater => wgpu::CompareFunction::Greater,
        CompareOp::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareOp::GreaterOrEqual => wgpu::CompareFunction::GreaterEqual,
        CompareOp::Always => wgpu::CompareFunction::Always,
    }
}

pub fn filter(filter: Filter) -> wgpu::FilterMode {
    match filter {
        Filter::Nearest => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    }
}

pub fn mipmap_filter(mode: MipmapMode) -> wgpu::FilterMode {
    match mode {
        MipmapMode::Nearest => wgpu::FilterMode::Nearest,
        MipmapMode::Linear => wgpu::FilterMode::Linear,
    }
}

pub fn address_mode(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::ClampToBorder => wgpu::AddressMode::ClampToBorder,
    }
}

pub fn present_mode(mode: PresentMode) -> wgpu::PresentMode {
    match mode {
        PresentMode::Immediate => wgpu::PresentMode::Immediate,
        PresentMode::Mailbox => wgpu::PresentMode::Mailbox,
        PresentMode::Fifo => wgpu::PresentMode::Fifo,
        PresentMode::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
    }
}

pub fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::U16 => wgpu::IndexFormat::Uint16,
        IndexFormat::U32 => wgpu::IndexFormat::Uint32,
    }
}

pub fn color_load(op: LoadOp) -> wgpu::LoadOp<wgpu::Color> {
    match op {
        LoadOp::Load => wgpu::LoadOp::Load,
        LoadOp::Clear(ClearValue::Color([r, g, b, a])) => wgpu::LoadOp::Clear(wgpu::Color {
            r: f64::from(r),
            g: f64::from(g),
            b: f64::from(b),
            a: f64::from(a),
        }),
        // No "don't care" in WebGPU; clearing is the cheapest defined choice
        LoadOp::Clear(ClearValue::DepthStencil { .. }) | LoadOp::DontCare => {
            wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
        }
    }
}

pub fn depth_load(op: LoadOp) -> (wgpu::LoadOp<f32>, wgpu::LoadOp<u32>) {
    match op {
        LoadOp::Load => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
        LoadOp::Clear(ClearValue::DepthStencil { depth, stencil }) => {
            (wgpu::LoadOp::Clear(depth), wgpu::LoadOp::Clear(stencil))
        }
        LoadOp::Clear(ClearValue::Color(_)) | LoadOp::DontCare => {
            (wgpu::LoadOp::Clear(1.0), wgpu::LoadOp::Clear(0))
        }
    }
}

pub fn aspect(format: Format) -> wgpu::TextureAspect {
    if format.is_depth() {
        wgpu::TextureAspect::DepthOnly
    } else {
        wgpu::TextureAspect::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_format_round_trips() {
        for format in Format::ALL {
            assert_eq!(format_from_wgpu(self::format(format)), Some(format));
        }
    }

    #[test]
    fn dont_care_becomes_a_clear() {
        assert!(matches!(color_load(LoadOp::DontCare), wgpu::LoadOp::Clear(_)));
        assert!(matches!(
            depth_load(LoadOp::Clear(ClearValue::DepthStencil {
                depth: 0.5,
                stencil: 3
            })),
            (wgpu::LoadOp::Clear(d), wgpu::LoadOp::Clear(3)) if d == 0.5
        ));
    }
}
