//! Software implementation of a WebGPU-style object model.
//!
//! Every GPU-visible object is an owning, explicitly reference-counted handle.
//! Commands are recorded through encoders into immutable command buffers,
//! submitted to a queue and executed by a CPU timeline. Asynchronous
//! operations complete through callbacks that are only delivered by
//! [`Device::tick`] (or [`Instance::process_events`] for instance-level
//! requests). Validation failures never panic: they are routed through error
//! scopes or the uncaptured-error callback, and failed creations return
//! inert error objects.

#![allow(
    // Descriptors mirror the WebGPU field sets.
    clippy::too_many_arguments,
    clippy::new_without_default
)]

mod binding;
mod bundle;
mod command;
pub mod completion;
mod device;
mod error;
mod handle;
mod hub;
mod instance;
mod pass;
mod pipeline;
mod resource;
mod surface;
mod timeline;
mod track;
pub mod traits;

pub use binding::{BindGroup, BindGroupLayout, PipelineLayout};
pub use bundle::{RenderBundle, RenderBundleEncoder};
pub use command::{
    BufferCopy, ColorAttachmentRecord, Command, CommandBuffer, CommandEncoder, ComputeCommand,
    DepthStencilRecord, RenderCommand, RenderPassRecord, TextureCopy, TimestampRecord,
};
pub use completion::{oneshot, Completion};
pub use device::{Device, Queue};
pub use error::{
    BufferMapError, CompilationInfoError, CreatePipelineError, DeviceLostReason, Error,
    ErrorFilter, ErrorType, HandleError, LoggingType, MapError, PopErrorScopeError,
    QueueWorkDoneError, RequestAdapterError, RequestDeviceError,
};
pub use hub::{
    AnyKey, BindGroupKey, BindGroupLayoutKey, BufferKey, CommandBufferKey, CommandEncoderKey,
    ComputePassKey, ComputePipelineKey, ExternalTextureKey, PipelineLayoutKey, QuerySetKey,
    RenderBundleEncoderKey, RenderBundleKey, RenderPassKey, RenderPipelineKey, SamplerKey,
    ShaderModuleKey, TextureKey, TextureViewKey,
};
pub use instance::{Adapter, Instance};
pub use pass::{ComputePassEncoder, RenderPassEncoder};
pub use pipeline::{ComputePipeline, RenderPipeline, ShaderModule};
pub use resource::{Buffer, ExternalTexture, QuerySet, Sampler, Texture, TextureView};
pub use surface::{Surface, SwapChain};

use std::borrow::Cow;

/// Required alignment of `bytes_per_row` for buffer/texture copies recorded on an encoder.
pub const COPY_BYTES_PER_ROW_ALIGNMENT: u32 = 256;
/// Required alignment of buffer copy offsets and sizes.
pub const COPY_BUFFER_ALIGNMENT: u64 = 4;
/// Required alignment of the destination offset of `resolve_query_set`.
pub const QUERY_RESOLVE_BUFFER_ALIGNMENT: u64 = 256;
/// Size of a single resolved query value.
pub const QUERY_SIZE: u64 = 8;
/// Upper bound on the number of queries in one set.
pub const MAX_QUERY_COUNT: u32 = 4096;
/// Alignment of the offset passed to `Buffer::map_async`.
pub const MAP_ALIGNMENT: u64 = 8;

//=============================================================================
// Flags
//=============================================================================

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;
        const INDIRECT = 1 << 8;
        const QUERY_RESOLVE = 1 << 9;
    }

    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct MapMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }

    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct TextureUsages: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }

    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }

    #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
    pub struct ColorWrites: u32 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const COLOR = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits();
        const ALL = Self::COLOR.bits() | Self::ALPHA.bits();
    }

    /// Aspects of a texel that a format carries.
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct TexelAspects: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }

    /// Optional capabilities an adapter may expose and a device may require.
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct Features: u32 {
        const DEPTH_CLIP_CONTROL = 1 << 0;
        const DEPTH32FLOAT_STENCIL8 = 1 << 1;
        const TIMESTAMP_QUERY = 1 << 2;
        const PIPELINE_STATISTICS_QUERY = 1 << 3;
        const TEXTURE_COMPRESSION_BC = 1 << 4;
        const TEXTURE_COMPRESSION_ETC2 = 1 << 5;
        const TEXTURE_COMPRESSION_ASTC = 1 << 6;
        const INDIRECT_FIRST_INSTANCE = 1 << 7;
        const MULTI_PLANAR_FORMATS = 1 << 8;
    }

    /// Device behavior switches, enabled or disabled by name at device creation.
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct Toggles: u32 {
        /// Skip pass-state validation (pipeline/bind group/vertex buffer readiness,
        /// debug group balance). Memory-safety checks always run.
        const SKIP_VALIDATION = 1 << 0;
        /// Log every submitted command at `trace` level.
        const DUMP_COMMANDS = 1 << 1;
        /// Allocate texture storage on first use rather than at creation.
        const LAZY_CLEAR_RESOURCE_ON_FIRST_USE = 1 << 2;
    }
}

impl Toggles {
    /// Looks up a toggle by its snake_case name, as passed in [`DeviceDesc`].
    pub fn from_toggle_name(name: &str) -> Option<Self> {
        match name {
            "skip_validation" => Some(Self::SKIP_VALIDATION),
            "dump_commands" => Some(Self::DUMP_COMMANDS),
            "lazy_clear_resource_on_first_use" => Some(Self::LAZY_CLEAR_RESOURCE_ON_FIRST_USE),
            _ => None,
        }
    }
}

//=============================================================================
// Limits
//=============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_texture_dimension_1d: u32,
    pub max_texture_dimension_2d: u32,
    pub max_texture_dimension_3d: u32,
    pub max_texture_array_layers: u32,
    pub max_bind_groups: u32,
    pub max_bindings_per_bind_group: u32,
    pub max_dynamic_uniform_buffers_per_pipeline_layout: u32,
    pub max_dynamic_storage_buffers_per_pipeline_layout: u32,
    pub max_uniform_buffer_binding_size: u64,
    pub max_storage_buffer_binding_size: u64,
    pub min_uniform_buffer_offset_alignment: u32,
    pub min_storage_buffer_offset_alignment: u32,
    pub max_vertex_buffers: u32,
    pub max_buffer_size: u64,
    pub max_vertex_attributes: u32,
    pub max_vertex_buffer_array_stride: u32,
    pub max_color_attachments: u32,
    pub max_compute_invocations_per_workgroup: u32,
    pub max_compute_workgroup_size_x: u32,
    pub max_compute_workgroup_size_y: u32,
    pub max_compute_workgroup_size_z: u32,
    pub max_compute_workgroups_per_dimension: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_texture_dimension_1d: 8192,
            max_texture_dimension_2d: 8192,
            max_texture_dimension_3d: 2048,
            max_texture_array_layers: 256,
            max_bind_groups: 4,
            max_bindings_per_bind_group: 1000,
            max_dynamic_uniform_buffers_per_pipeline_layout: 8,
            max_dynamic_storage_buffers_per_pipeline_layout: 4,
            max_uniform_buffer_binding_size: 64 << 10,
            max_storage_buffer_binding_size: 128 << 20,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
            max_vertex_buffers: 8,
            max_buffer_size: 256 << 20,
            max_vertex_attributes: 16,
            max_vertex_buffer_array_stride: 2048,
            max_color_attachments: 8,
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_compute_workgroups_per_dimension: 65535,
        }
    }
}

impl Limits {
    /// Checks that every limit in `self` can be satisfied by `allowed`.
    ///
    /// Maximum limits must not exceed the allowed value; alignment limits must be
    /// powers of two no smaller than the allowed value.
    pub fn check_within(&self, allowed: &Limits) -> Result<(), String> {
        macro_rules! check_max {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field > allowed.$field {
                        return Err(format!(
                            "required limit {} = {} exceeds the supported {}",
                            stringify!($field), self.$field, allowed.$field
                        ));
                    }
                )*
            };
        }
        check_max!(
            max_texture_dimension_1d,
            max_texture_dimension_2d,
            max_texture_dimension_3d,
            max_texture_array_layers,
            max_bind_groups,
            max_bindings_per_bind_group,
            max_dynamic_uniform_buffers_per_pipeline_layout,
            max_dynamic_storage_buffers_per_pipeline_layout,
            max_uniform_buffer_binding_size,
            max_storage_buffer_binding_size,
            max_vertex_buffers,
            max_buffer_size,
            max_vertex_attributes,
            max_vertex_buffer_array_stride,
            max_color_attachments,
            max_compute_invocations_per_workgroup,
            max_compute_workgroup_size_x,
            max_compute_workgroup_size_y,
            max_compute_workgroup_size_z,
            max_compute_workgroups_per_dimension,
        );
        for (name, required, supported) in [
            (
                "min_uniform_buffer_offset_alignment",
                self.min_uniform_buffer_offset_alignment,
                allowed.min_uniform_buffer_offset_alignment,
            ),
            (
                "min_storage_buffer_offset_alignment",
                self.min_storage_buffer_offset_alignment,
                allowed.min_storage_buffer_offset_alignment,
            ),
        ] {
            if !required.is_power_of_two() || required < supported {
                return Err(format!(
                    "required limit {name} = {required} is not a power of two at least {supported}"
                ));
            }
        }
        Ok(())
    }
}

//=============================================================================
// Adapter & Device Configuration
//=============================================================================

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum BackendType {
    #[default]
    Null,
    WebGpu,
    D3D11,
    D3D12,
    Metal,
    Vulkan,
    OpenGl,
    OpenGlEs,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum AdapterType {
    DiscreteGpu,
    IntegratedGpu,
    Cpu,
    #[default]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum PowerPreference {
    #[default]
    Undefined,
    LowPower,
    HighPerformance,
}

/// Immutable description of an adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterProperties {
    pub vendor_id: u32,
    pub device_id: u32,
    pub name: String,
    pub driver_description: String,
    pub adapter_type: AdapterType,
    pub backend_type: BackendType,
}

/// Adapter injected into an [`Instance`], or discovered by default.
#[derive(Clone, Debug)]
pub struct AdapterDesc {
    pub properties: AdapterProperties,
    pub features: Features,
    pub limits: Limits,
    /// Total bytes of buffer and texture storage devices of this adapter may hold.
    /// Allocations past the budget fail with an out-of-memory error.
    pub memory_budget: u64,
}

impl AdapterDesc {
    /// The CPU adapter every instance exposes when no adapters are injected.
    pub fn software() -> Self {
        Self {
            properties: AdapterProperties {
                vendor_id: 0,
                device_id: 0,
                name: "Strata Software Rasterizer".to_string(),
                driver_description: concat!("strata ", env!("CARGO_PKG_VERSION")).to_string(),
                adapter_type: AdapterType::Cpu,
                backend_type: BackendType::Null,
            },
            features: Features::all(),
            limits: Limits::default(),
            memory_budget: 1 << 30,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InstanceDesc {
    /// Adapters to expose. When empty, [`AdapterDesc::software`] is discovered.
    pub adapters: Vec<AdapterDesc>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestAdapterOptions<'a> {
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
    pub backend_type: Option<BackendType>,
    pub compatible_surface: Option<&'a Surface>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDesc<'a> {
    pub label: &'a str,
    pub required_features: Features,
    /// Limits the device must support. `None` means [`Limits::default`].
    pub required_limits: Option<&'a Limits>,
    pub default_queue_label: &'a str,
    /// Toggle names forced on, see [`Toggles::from_toggle_name`].
    pub force_enabled_toggles: &'a [&'a str],
    pub force_disabled_toggles: &'a [&'a str],
}

//=============================================================================
// Textures
//=============================================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TextureFormat {
    R8Unorm,
    R8Snorm,
    R8Uint,
    R8Sint,
    R16Uint,
    R16Sint,
    R16Float,
    Rg8Unorm,
    R32Float,
    R32Uint,
    R32Sint,
    Rg16Float,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba8Snorm,
    Rgba8Uint,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgb10a2Unorm,
    Rg32Float,
    Rgba16Float,
    Rgba32Float,
    Rgba32Uint,
    Stencil8,
    Depth16Unorm,
    Depth24Plus,
    Depth24PlusStencil8,
    Depth32Float,
    Depth32FloatStencil8,
    Bc1RgbaUnorm,
    Bc1RgbaUnormSrgb,
    Bc3RgbaUnorm,
    Bc7RgbaUnorm,
    Etc2Rgba8Unorm,
    Astc4x4Unorm,
}

/// Storage layout of one block of a texture format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatBlock {
    pub bytes: u32,
    pub width: u32,
    pub height: u32,
}

impl TextureFormat {
    pub fn block(self) -> FormatBlock {
        use TextureFormat as Tf;
        let (bytes, dim) = match self {
            Tf::R8Unorm | Tf::R8Snorm | Tf::R8Uint | Tf::R8Sint | Tf::Stencil8 => (1, 1),
            Tf::R16Uint | Tf::R16Sint | Tf::R16Float | Tf::Rg8Unorm | Tf::Depth16Unorm => (2, 1),
            Tf::R32Float
            | Tf::R32Uint
            | Tf::R32Sint
            | Tf::Rg16Float
            | Tf::Rgba8Unorm
            | Tf::Rgba8UnormSrgb
            | Tf::Rgba8Snorm
            | Tf::Rgba8Uint
            | Tf::Bgra8Unorm
            | Tf::Bgra8UnormSrgb
            | Tf::Rgb10a2Unorm
            | Tf::Depth24Plus
            | Tf::Depth24PlusStencil8
            | Tf::Depth32Float => (4, 1),
            Tf::Rg32Float | Tf::Rgba16Float | Tf::Depth32FloatStencil8 => (8, 1),
            Tf::Rgba32Float | Tf::Rgba32Uint => (16, 1),
            Tf::Bc1RgbaUnorm | Tf::Bc1RgbaUnormSrgb => (8, 4),
            Tf::Bc3RgbaUnorm | Tf::Bc7RgbaUnorm | Tf::Etc2Rgba8Unorm | Tf::Astc4x4Unorm => (16, 4),
        };
        FormatBlock {
            bytes,
            width: dim,
            height: dim,
        }
    }

    pub fn aspects(self) -> TexelAspects {
        match self {
            Self::Stencil8 => TexelAspects::STENCIL,
            Self::Depth16Unorm | Self::Depth24Plus | Self::Depth32Float => TexelAspects::DEPTH,
            Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8 => {
                TexelAspects::DEPTH | TexelAspects::STENCIL
            }
            _ => TexelAspects::COLOR,
        }
    }

    pub fn is_depth_stencil(self) -> bool {
        !self.aspects().contains(TexelAspects::COLOR)
    }

    pub fn is_compressed(self) -> bool {
        self.block().width > 1
    }

    /// Features a device needs to create textures of this format.
    pub fn required_features(self) -> Features {
        match self {
            Self::Depth32FloatStencil8 => Features::DEPTH32FLOAT_STENCIL8,
            Self::Bc1RgbaUnorm | Self::Bc1RgbaUnormSrgb | Self::Bc3RgbaUnorm | Self::Bc7RgbaUnorm => {
                Features::TEXTURE_COMPRESSION_BC
            }
            Self::Etc2Rgba8Unorm => Features::TEXTURE_COMPRESSION_ETC2,
            Self::Astc4x4Unorm => Features::TEXTURE_COMPRESSION_ASTC,
            _ => Features::empty(),
        }
    }

    pub fn is_renderable(self) -> bool {
        !self.is_compressed() && !matches!(self, Self::R8Snorm | Self::Rgba8Snorm)
    }

    /// Multi-aspect and opaque depth formats cannot take part in copies.
    pub fn is_copyable(self) -> bool {
        !matches!(
            self,
            Self::Depth24Plus | Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8
        )
    }

    /// Returns the format with the sRGB encoding toggled, if one exists.
    pub fn srgb_counterpart(self) -> Option<Self> {
        match self {
            Self::Rgba8Unorm => Some(Self::Rgba8UnormSrgb),
            Self::Rgba8UnormSrgb => Some(Self::Rgba8Unorm),
            Self::Bgra8Unorm => Some(Self::Bgra8UnormSrgb),
            Self::Bgra8UnormSrgb => Some(Self::Bgra8Unorm),
            Self::Bc1RgbaUnorm => Some(Self::Bc1RgbaUnormSrgb),
            Self::Bc1RgbaUnormSrgb => Some(Self::Bc1RgbaUnorm),
            _ => None,
        }
    }

    pub(crate) fn is_view_compatible(self, other: Self) -> bool {
        self == other || self.srgb_counterpart() == Some(other)
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TextureViewDimension {
    D1,
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum TextureAspect {
    #[default]
    All,
    StencilOnly,
    DepthOnly,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
}

impl Default for Extent3d {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        }
    }
}

impl Extent3d {
    /// Size of the given mip level. Array layers are not reduced for non-3D textures.
    pub fn mip_level_size(&self, level: u32, dimension: TextureDimension) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: match dimension {
                TextureDimension::D1 => 1,
                _ => (self.height >> level).max(1),
            },
            depth_or_array_layers: match dimension {
                TextureDimension::D3 => (self.depth_or_array_layers >> level).max(1),
                _ => self.depth_or_array_layers,
            },
        }
    }

    /// Number of mip levels in a full chain for this extent.
    pub fn max_mips(&self, dimension: TextureDimension) -> u32 {
        let largest = match dimension {
            TextureDimension::D1 => return 1,
            TextureDimension::D2 => self.width.max(self.height),
            TextureDimension::D3 => self.width.max(self.height).max(self.depth_or_array_layers),
        };
        32 - largest.leading_zeros()
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Origin3d {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsages,
    pub mapped_at_creation: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub size: Extent3d,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub dimension: TextureDimension,
    pub format: TextureFormat,
    pub usage: TextureUsages,
    /// Formats views of this texture may use besides `format`.
    pub view_formats: &'a [TextureFormat],
}

/// `None` fields inherit from the texture: whole mip chain, all layers, same format.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextureViewDesc<'a> {
    pub label: &'a str,
    pub format: Option<TextureFormat>,
    pub dimension: Option<TextureViewDimension>,
    pub aspect: TextureAspect,
    pub base_mip_level: u32,
    pub mip_level_count: Option<u32>,
    pub base_array_layer: u32,
    pub array_layer_count: Option<u32>,
}

//=============================================================================
// Samplers & Queries
//=============================================================================

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc<'a> {
    pub label: &'a str,
    pub address_modes: [AddressMode; 3],
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
    pub compare: Option<CompareFunction>,
    pub max_anisotropy: u16,
}

impl Default for SamplerDesc<'_> {
    fn default() -> Self {
        Self {
            label: "",
            address_modes: [AddressMode::ClampToEdge; 3],
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            lod_min_clamp: 0.0,
            lod_max_clamp: 32.0,
            compare: None,
            max_anisotropy: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum QueryType {
    Occlusion,
    Timestamp,
}

#[derive(Clone, Copy, Debug)]
pub struct QuerySetDesc<'a> {
    pub label: &'a str,
    pub ty: QueryType,
    pub count: u32,
}

/// Wraps one or two planes of video content for sampling.
#[derive(Clone, Copy, Debug)]
pub struct ExternalTextureDesc<'a> {
    pub label: &'a str,
    pub plane0: &'a TextureView,
    pub plane1: Option<&'a TextureView>,
}

//=============================================================================
// Binding Model
//=============================================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BufferBindingType {
    Uniform,
    Storage { read_only: bool },
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SamplerBindingType {
    Filtering,
    NonFiltering,
    Comparison,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TextureSampleType {
    Float { filterable: bool },
    Depth,
    Sint,
    Uint,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum StorageTextureAccess {
    WriteOnly,
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BindingType {
    Buffer {
        ty: BufferBindingType,
        has_dynamic_offset: bool,
        min_binding_size: Option<u64>,
    },
    Sampler(SamplerBindingType),
    Texture {
        sample_type: TextureSampleType,
        view_dimension: TextureViewDimension,
        multisampled: bool,
    },
    StorageTexture {
        access: StorageTextureAccess,
        format: TextureFormat,
        view_dimension: TextureViewDimension,
    },
    ExternalTexture,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStages,
    pub ty: BindingType,
}

#[derive(Clone, Copy, Debug)]
pub struct BindGroupLayoutDesc<'a> {
    pub label: &'a str,
    pub entries: &'a [BindGroupLayoutEntry],
}

#[derive(Clone, Copy, Debug)]
pub struct BufferBinding<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
    /// `None` binds the rest of the buffer.
    pub size: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
pub enum BindingResource<'a> {
    Buffer(BufferBinding<'a>),
    Sampler(&'a Sampler),
    TextureView(&'a TextureView),
    ExternalTexture(&'a ExternalTexture),
}

#[derive(Clone, Copy, Debug)]
pub struct BindGroupEntry<'a> {
    pub binding: u32,
    pub resource: BindingResource<'a>,
}

#[derive(Clone, Copy, Debug)]
pub struct BindGroupDesc<'a> {
    pub label: &'a str,
    pub layout: &'a BindGroupLayout,
    pub entries: &'a [BindGroupEntry<'a>],
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineLayoutDesc<'a> {
    pub label: &'a str,
    pub bind_group_layouts: &'a [&'a BindGroupLayout],
}

//=============================================================================
// Shaders & Pipelines
//=============================================================================

/// Shader code handed to [`Device::create_shader_module`].
///
/// New source kinds are added as variants.
#[derive(Clone, Debug)]
pub enum ShaderSource<'a> {
    Wgsl(Cow<'a, str>),
}

#[derive(Clone, Debug)]
pub struct ShaderModuleDesc<'a> {
    pub label: &'a str,
    pub source: ShaderSource<'a>,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CompilationMessageType {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompilationMessage {
    pub message: String,
    pub message_type: CompilationMessageType,
    /// 1-based, 0 when the location is unknown.
    pub line_num: u32,
    pub line_pos: u32,
    pub offset: u32,
    pub length: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ProgrammableStage<'a> {
    pub module: &'a ShaderModule,
    pub entry_point: &'a str,
    /// Values for pipeline-overridable constants, keyed by name or numeric id.
    pub constants: &'a [(&'a str, f64)],
}

#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    /// `None` derives the layout from the shader.
    pub layout: Option<&'a PipelineLayout>,
    pub compute: ProgrammableStage<'a>,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum VertexFormat {
    Uint8x2,
    Uint8x4,
    Unorm8x4,
    Uint16x2,
    Float16x2,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
}

impl VertexFormat {
    pub fn size(self) -> u64 {
        match self {
            Self::Uint8x2 => 2,
            Self::Uint8x4 | Self::Unorm8x4 | Self::Uint16x2 | Self::Float16x2 => 4,
            Self::Float32 | Self::Uint32 | Self::Sint32 => 4,
            Self::Float32x2 | Self::Uint32x2 | Self::Sint32x2 => 8,
            Self::Float32x3 | Self::Uint32x3 | Self::Sint32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 | Self::Sint32x4 => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct VertexAttribute {
    pub format: VertexFormat,
    pub offset: u64,
    pub shader_location: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct VertexBufferLayout<'a> {
    pub array_stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: &'a [VertexAttribute],
}

#[derive(Clone, Copy, Debug)]
pub struct VertexState<'a> {
    pub module: &'a ShaderModule,
    pub entry_point: &'a str,
    pub constants: &'a [(&'a str, f64)],
    pub buffers: &'a [VertexBufferLayout<'a>],
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub fn is_strip(self) -> bool {
        matches!(self, Self::LineStrip | Self::TriangleStrip)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Face {
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct PrimitiveState {
    pub topology: PrimitiveTopology,
    pub strip_index_format: Option<IndexFormat>,
    pub front_face: FrontFace,
    pub cull_mode: Option<Face>,
    /// Requires [`Features::DEPTH_CLIP_CONTROL`].
    pub unclipped_depth: bool,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum StencilOperation {
    #[default]
    Keep,
    Zero,
    Replace,
    Invert,
    IncrementClamp,
    DecrementClamp,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct StencilFaceState {
    pub compare: CompareFunction,
    pub fail_op: StencilOperation,
    pub depth_fail_op: StencilOperation,
    pub pass_op: StencilOperation,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            compare: CompareFunction::Always,
            fail_op: StencilOperation::Keep,
            depth_fail_op: StencilOperation::Keep,
            pass_op: StencilOperation::Keep,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct StencilState {
    pub front: StencilFaceState,
    pub back: StencilFaceState,
    pub read_mask: u32,
    pub write_mask: u32,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            front: StencilFaceState::default(),
            back: StencilFaceState::default(),
            read_mask: !0,
            write_mask: !0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthBiasState {
    pub constant: i32,
    pub slope_scale: f32,
    pub clamp: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
    pub stencil: StencilState,
    pub bias: DepthBiasState,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct MultisampleState {
    pub count: u32,
    pub mask: u32,
    pub alpha_to_coverage_enabled: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
    SrcAlphaSaturated,
    Constant,
    OneMinusConstant,
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum BlendOperation {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl BlendComponent {
    pub const REPLACE: Self = Self {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::Zero,
        operation: BlendOperation::Add,
    };
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub const REPLACE: Self = Self {
        color: BlendComponent::REPLACE,
        alpha: BlendComponent::REPLACE,
    };
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

impl From<TextureFormat> for ColorTargetState {
    fn from(format: TextureFormat) -> Self {
        Self {
            format,
            blend: None,
            write_mask: ColorWrites::ALL,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FragmentState<'a> {
    pub module: &'a ShaderModule,
    pub entry_point: &'a str,
    pub constants: &'a [(&'a str, f64)],
    pub targets: &'a [Option<ColorTargetState>],
}

#[derive(Clone, Copy, Debug)]
pub struct RenderPipelineDesc<'a> {
    pub label: &'a str,
    pub layout: Option<&'a PipelineLayout>,
    pub vertex: VertexState<'a>,
    pub primitive: PrimitiveState,
    pub depth_stencil: Option<DepthStencilState>,
    pub multisample: MultisampleState,
    pub fragment: Option<FragmentState<'a>>,
}

//=============================================================================
// Command Encoding
//=============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

impl Color {
    pub const TRANSPARENT: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };
    pub const BLACK: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };
    pub const WHITE: Self = Self {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };
}

/// Initial contents of an attachment for the duration of a pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp<V> {
    Clear(V),
    Load,
}

/// Whether the contents written by a pass persist after it ends.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum StoreOp {
    #[default]
    Store,
    Discard,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Operations<V> {
    pub load: LoadOp<V>,
    pub store: StoreOp,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderPassColorAttachment<'a> {
    pub view: &'a TextureView,
    /// Only valid when `view` is multisampled.
    pub resolve_target: Option<&'a TextureView>,
    pub ops: Operations<Color>,
}

/// `None` operations mark the aspect as read-only for the pass.
#[derive(Clone, Copy, Debug)]
pub struct RenderPassDepthStencilAttachment<'a> {
    pub view: &'a TextureView,
    pub depth_ops: Option<Operations<f32>>,
    pub stencil_ops: Option<Operations<u32>>,
}

#[derive(Clone, Copy, Debug)]
pub struct PassTimestampWrites<'a> {
    pub query_set: &'a QuerySet,
    pub beginning_of_pass_write_index: Option<u32>,
    pub end_of_pass_write_index: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RenderPassDesc<'a> {
    pub label: &'a str,
    pub color_attachments: &'a [Option<RenderPassColorAttachment<'a>>],
    pub depth_stencil_attachment: Option<RenderPassDepthStencilAttachment<'a>>,
    pub occlusion_query_set: Option<&'a QuerySet>,
    pub timestamp_writes: Option<PassTimestampWrites<'a>>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ComputePassDesc<'a> {
    pub label: &'a str,
    pub timestamp_writes: Option<PassTimestampWrites<'a>>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommandEncoderDesc<'a> {
    pub label: &'a str,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommandBufferDesc<'a> {
    pub label: &'a str,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderBundleEncoderDesc<'a> {
    pub label: &'a str,
    pub color_formats: &'a [Option<TextureFormat>],
    pub depth_stencil_format: Option<TextureFormat>,
    pub sample_count: u32,
    pub depth_read_only: bool,
    pub stencil_read_only: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RenderBundleDesc<'a> {
    pub label: &'a str,
}

/// Layout of texel data in a buffer or host slice.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct TextureDataLayout {
    pub offset: u64,
    pub bytes_per_row: Option<u32>,
    pub rows_per_image: Option<u32>,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageCopyBuffer<'a> {
    pub buffer: &'a Buffer,
    pub layout: TextureDataLayout,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageCopyTexture<'a> {
    pub texture: &'a Texture,
    pub mip_level: u32,
    pub origin: Origin3d,
    pub aspect: TextureAspect,
}

//=============================================================================
// Presentation
//=============================================================================

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    #[default]
    Fifo,
}

#[derive(Clone, Copy, Debug)]
pub struct SwapChainDesc<'a> {
    pub label: &'a str,
    pub usage: TextureUsages,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub present_mode: PresentMode,
}

/// Where a [`Surface`] presents to.
#[derive(Clone, Copy, Debug)]
pub enum SurfaceTarget {
    /// No window; frames are produced and discarded.
    Headless { width: u32, height: u32 },
    Window {
        window: raw_window_handle::RawWindowHandle,
        display: raw_window_handle::RawDisplayHandle,
    },
}

impl SurfaceTarget {
    pub fn from_window<W>(window: &W) -> Result<Self, raw_window_handle::HandleError>
    where
        W: raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle,
    {
        Ok(Self::Window {
            window: window.window_handle()?.as_raw(),
            display: window.display_handle()?.as_raw(),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SurfaceDesc<'a> {
    pub label: &'a str,
    pub target: SurfaceTarget,
}

/// Observable mapping state of a buffer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BufferMapState {
    Unmapped,
    Pending,
    Mapped,
}
