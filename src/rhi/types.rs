// RHI value types
//
// Plain descriptions shared by every backend. Nothing in here owns a GPU
// object; descriptors that reference handles live next to the handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use serde::Deserialize;

// =============================================================================
// BACKEND & DEVICE IDENTITY
// =============================================================================

/// Native graphics stack a device runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Explicit API: ash + gpu-allocator
    Vulkan,
    /// Native driver API, Apple platforms
    Metal,
    /// Sandboxed API through wgpu on a native adapter
    #[serde(alias = "wgpu")]
    WebGpu,
    /// CPU reference implementation, no GPU required
    Headless,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Vulkan,
        BackendKind::Metal,
        BackendKind::WebGpu,
        BackendKind::Headless,
    ];

    /// Backend used when none is requested explicitly
    pub fn platform_default() -> Self {
        if cfg!(all(feature = "metal", target_os = "macos")) {
            BackendKind::Metal
        } else if cfg!(feature = "vulkan") {
            BackendKind::Vulkan
        } else if cfg!(feature = "webgpu") {
            BackendKind::WebGpu
        } else {
            BackendKind::Headless
        }
    }

    /// Whether support for this backend was compiled into the crate
    pub fn is_compiled_in(self) -> bool {
        match self {
            BackendKind::Vulkan => cfg!(feature = "vulkan"),
            BackendKind::Metal => cfg!(all(feature = "metal", target_os = "macos")),
            BackendKind::WebGpu => cfg!(feature = "webgpu"),
            BackendKind::Headless => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Vulkan => "Vulkan",
            BackendKind::Metal => "Metal",
            BackendKind::WebGpu => "WebGPU",
            BackendKind::Headless => "Headless",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of one `GraphicsDevice` instance. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DeviceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Monotonic index of a queue submission. Index 0 means "nothing submitted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SubmissionIndex(pub u64);

impl SubmissionIndex {
    pub const NONE: SubmissionIndex = SubmissionIndex(0);

    pub fn next(self) -> Self {
        SubmissionIndex(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: BackendKind,
    pub api_version: String,
    /// Dedicated device memory in bytes, 0 when unknown
    pub device_memory: u64,
}

/// Formats a backend accepts and what they can be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSupport {
    pub format: Format,
    pub usage: TextureUsage,
}

/// Feature gaps and limits of the active backend
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub max_buffer_size: u64,
    pub max_texture_dimension_2d: u32,
    pub max_uniform_buffer_range: u32,
    pub max_push_constant_size: u32,
    pub max_color_attachments: u32,
    pub max_bound_descriptor_sets: u32,
    pub supports_compute: bool,
    /// CPU-readable (`GpuToCpu`) buffers are available
    pub supports_readback: bool,
    /// Runtime validation (debug layers, hazard checks) is active
    pub validation: bool,
    pub shader_sources: Vec<ShaderSourceKind>,
    pub formats: Vec<FormatSupport>,
    pub queues: Vec<QueueType>,
}

impl Capabilities {
    pub fn supports_format(&self, format: Format, usage: TextureUsage) -> bool {
        self.formats
            .iter()
            .any(|f| f.format == format && f.usage.contains(usage))
    }

    pub fn accepts_shader(&self, kind: ShaderSourceKind) -> bool {
        self.shader_sources.contains(&kind)
    }

    pub fn supports_queue(&self, queue: QueueType) -> bool {
        self.queues.contains(&queue)
    }
}

// =============================================================================
// BUFFERS
// =============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

/// Where buffer memory lives and who may touch it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device-local, not mappable
    GpuOnly,
    /// Host-visible upload memory
    CpuToGpu,
    /// Host-visible readback memory
    GpuToCpu,
}

impl MemoryUsage {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: Option<String>,
    /// Requested size in bytes. Backends may round the allocation up, never down.
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryUsage,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage, memory: MemoryUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            memory,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

// =============================================================================
// TEXTURES & SAMPLERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16Sfloat,
    R16G16Sfloat,
    R16G16B16A16Sfloat,
    R32Uint,
    R32Sfloat,
    R32G32Sfloat,
    R32G32B32A32Sfloat,
    D16Unorm,
    D32Sfloat,
    D24UnormS8Uint,
    D32SfloatS8Uint,
}

impl Format {
    pub const ALL: [Format; 17] = [
        Format::R8Unorm,
        Format::R8G8Unorm,
        Format::R8G8B8A8Unorm,
        Format::R8G8B8A8Srgb,
        Format::B8G8R8A8Unorm,
        Format::B8G8R8A8Srgb,
        Format::R16Sfloat,
        Format::R16G16Sfloat,
        Format::R16G16B16A16Sfloat,
        Format::R32Uint,
        Format::R32Sfloat,
        Format::R32G32Sfloat,
        Format::R32G32B32A32Sfloat,
        Format::D16Unorm,
        Format::D32Sfloat,
        Format::D24UnormS8Uint,
        Format::D32SfloatS8Uint,
    ];

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::R8G8Unorm | Format::R16Sfloat | Format::D16Unorm => 2,
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8Srgb
            | Format::B8G8R8A8Unorm
            | Format::B8G8R8A8Srgb
            | Format::R16G16Sfloat
            | Format::R32Uint
            | Format::R32Sfloat
            | Format::D32Sfloat
            | Format::D24UnormS8Uint => 4,
            Format::R16G16B16A16Sfloat | Format::R32G32Sfloat | Format::D32SfloatS8Uint => 8,
            Format::R32G32B32A32Sfloat => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D32Sfloat | Format::D24UnormS8Uint | Format::D32SfloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32SfloatS8Uint)
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::R8G8B8A8Srgb | Format::B8G8R8A8Srgb)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    D2,
    Cube,
    D3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: Option<String>,
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: Format, usage: TextureUsage) -> Self {
        Self {
            label: None,
            texture_type: TextureType::D2,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Size of mip `level` in texels (width, height, depth)
    pub fn mip_extent(&self, level: u32) -> (u32, u32, u32) {
        (
            (self.width >> level).max(1),
            (self.height >> level).max(1),
            (self.depth >> level).max(1),
        )
    }

    /// Tightly packed byte size of mip `level` across all layers
    pub fn mip_byte_size(&self, level: u32) -> u64 {
        let (w, h, d) = self.mip_extent(level);
        u64::from(w)
            * u64::from(h)
            * u64::from(d)
            * u64::from(self.layer_count())
            * u64::from(self.format.bytes_per_pixel())
    }

    /// Array layers including the six faces of a cube
    pub fn layer_count(&self) -> u32 {
        match self.texture_type {
            TextureType::Cube => self.array_layers * 6,
            _ => self.array_layers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MipmapMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDesc {
    pub label: Option<String>,
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_mode: MipmapMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    /// `None` disables anisotropic filtering
    pub max_anisotropy: Option<f32>,
    pub compare: Option<CompareOp>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mipmap_mode: MipmapMode::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            mip_lod_bias: 0.0,
            min_lod: 0.0,
            max_lod: 1000.0,
            max_anisotropy: None,
            compare: None,
        }
    }
}

// =============================================================================
// SHADERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

impl From<ShaderStage> for ShaderStages {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderSourceKind {
    SpirV,
    Msl,
    Wgsl,
}

/// Precompiled or source shader code. No compiler lives in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    SpirV(Vec<u32>),
    Msl(String),
    Wgsl(String),
}

impl ShaderSource {
    pub fn kind(&self) -> ShaderSourceKind {
        match self {
            ShaderSource::SpirV(_) => ShaderSourceKind::SpirV,
            ShaderSource::Msl(_) => ShaderSourceKind::Msl,
            ShaderSource::Wgsl(_) => ShaderSourceKind::Wgsl,
        }
    }

    /// Interpret raw SPIR-V bytes, rejecting anything that is not a whole number of words
    pub fn spirv_from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 || bytes.is_empty() {
            return None;
        }
        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(ShaderSource::SpirV(words))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDesc {
    pub label: Option<String>,
    pub stage: ShaderStage,
    pub source: ShaderSource,
    pub entry_point: String,
}

impl ShaderDesc {
    pub fn new(stage: ShaderStage, source: ShaderSource) -> Self {
        Self {
            label: None,
            stage,
            source,
            entry_point: "main".to_string(),
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
}

// =============================================================================
// PIPELINE STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Unorm8x4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Unorm8x4 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_bias_enable: bool,
    pub depth_bias_constant: f32,
    pub depth_bias_slope: f32,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_bias_enable: false,
            depth_bias_constant: 0.0,
            depth_bias_slope: 0.0,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare: CompareOp::Less,
        }
    }
}

/// One color output of a graphics pipeline. Blending is standard
/// source-over alpha blending when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTargetState {
    pub format: Format,
    pub blend_enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutDesc {
    pub fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

// =============================================================================
// COMMAND PARAMETERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// What happens to an attachment's previous contents when rendering begins.
/// Contents are always stored at the end of rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Load,
    Clear(ClearValue),
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// How a resource is about to be (or was last) used. Barriers move a resource
/// between states; backends derive access masks, stages and image layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Undefined,
    TransferSrc,
    TransferDst,
    VertexBuffer,
    IndexBuffer,
    UniformBuffer,
    ShaderRead,
    ShaderWrite,
    ColorAttachment,
    DepthAttachment,
    HostRead,
    Present,
}

// =============================================================================
// PRESENTATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// No vsync, may tear
    Immediate,
    /// No vsync, no tearing
    Mailbox,
    /// Vsync, always available
    Fifo,
    FifoRelaxed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    /// Preferred mode. Falls back to `Fifo` when the surface lacks it.
    pub present_mode: PresentMode,
    /// Preferred image count, clamped to what the surface allows. 0 lets the backend choose.
    pub image_count: u32,
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: u32,
}

impl Default for SwapChainDesc {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            present_mode: PresentMode::Fifo,
            image_count: 0,
            frames_in_flight: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_are_classified() {
        assert!(Format::D32Sfloat.is_depth());
        assert!(!Format::D32Sfloat.has_stencil());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(!Format::B8G8R8A8Srgb.is_depth());
        assert_eq!(Format::R32G32B32A32Sfloat.bytes_per_pixel(), 16);
    }

    #[test]
    fn mip_extents_never_reach_zero() {
        let desc = TextureDesc::new_2d(8, 2, Format::R8G8B8A8Unorm, TextureUsage::SAMPLED);
        assert_eq!(desc.mip_extent(0), (8, 2, 1));
        assert_eq!(desc.mip_extent(2), (2, 1, 1));
        assert_eq!(desc.mip_extent(5), (1, 1, 1));
        assert_eq!(desc.mip_byte_size(1), 4 * 1 * 4);
    }

    #[test]
    fn sampler_defaults_are_linear_repeat() {
        let desc = SamplerDesc::default();
        assert_eq!(desc.min_filter, Filter::Linear);
        assert_eq!(desc.address_w, AddressMode::Repeat);
        assert_eq!(desc.max_lod, 1000.0);
        assert!(desc.max_anisotropy.is_none());
    }

    #[test]
    fn spirv_bytes_must_be_word_aligned() {
        assert!(ShaderSource::spirv_from_bytes(&[1, 2, 3]).is_none());
        let source = ShaderSource::spirv_from_bytes(&[0x03, 0x02, 0x23, 0x07]).unwrap();
        assert_eq!(source, ShaderSource::SpirV(vec![0x0723_0203]));
    }

    #[test]
    fn platform_default_is_compiled_in() {
        let kind = BackendKind::platform_default();
        assert!(kind.is_compiled_in());
        if cfg!(feature = "vulkan") {
            assert_ne!(kind, BackendKind::WebGpu);
        }
    }

    #[test]
    fn submission_indices_are_ordered() {
        let first = SubmissionIndex::NONE.next();
        assert!(first > SubmissionIndex::NONE);
        assert_eq!(first.next(), SubmissionIndex(2));
    }
}
