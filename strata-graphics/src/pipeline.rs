//! Shader modules and pipelines.
//!
//! WGSL is parsed and validated with naga. Pipelines without an explicit
//! layout derive one from the bindings their entry points use.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    binding::{make_group_layout, BindGroupLayout, PipelineLayoutEntry},
    completion::Outcome,
    device::DeviceShared,
    handle::{resource_handle, DeviceChild, HubEntry},
    hub::Hub,
    AnyKey, BindGroupLayoutEntry, BindingType, BufferBindingType, CompilationInfoError,
    CompilationMessage, CompilationMessageType, ComputePipelineDesc, CreatePipelineError,
    Features, IndexFormat, PipelineLayout, PrimitiveTopology, ProgrammableStage,
    RenderPipelineDesc, SamplerBindingType, ShaderModuleDesc, ShaderSource, ShaderStages,
    StorageTextureAccess, TextureFormat, TextureSampleType, TextureViewDimension, VertexStepMode,
};

//=============================================================================
// Shader Modules
//=============================================================================

pub(crate) struct ParsedShader {
    pub module: naga::Module,
    pub info: naga::valid::ModuleInfo,
}

pub(crate) struct ShaderModuleEntry {
    /// `None` when compilation failed.
    pub parsed: Option<Arc<ParsedShader>>,
    pub messages: Vec<CompilationMessage>,
}

impl HubEntry for ShaderModuleEntry {
    fn is_valid(&self) -> bool {
        self.parsed.is_some()
    }
}

fn compilation_error(message: String, location: Option<naga::SourceLocation>) -> CompilationMessage {
    let location = location.unwrap_or(naga::SourceLocation {
        line_number: 0,
        line_position: 0,
        offset: 0,
        length: 0,
    });
    CompilationMessage {
        message,
        message_type: CompilationMessageType::Error,
        line_num: location.line_number,
        line_pos: location.line_position,
        offset: location.offset,
        length: location.length,
    }
}

/// Parses and validates WGSL. On failure returns the diagnostic both as a
/// structured message and as a rendered report.
fn compile_wgsl(source: &str) -> Result<ParsedShader, (CompilationMessage, String)> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        (
            compilation_error(e.message().to_string(), e.location(source)),
            e.emit_to_string(source),
        )
    })?;
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| {
        (
            compilation_error(e.as_inner().to_string(), e.location(source)),
            e.emit_to_string(source),
        )
    })?;
    Ok(ParsedShader { module, info })
}

resource_handle!(ShaderModule, ShaderModuleKey, shader_modules);
resource_handle!(ComputePipeline, ComputePipelineKey, compute_pipelines);
resource_handle!(RenderPipeline, RenderPipelineKey, render_pipelines);

impl ShaderModule {
    /// Delivers the compiler messages on the next device tick.
    pub fn get_compilation_info(
        &self,
        callback: impl FnOnce(Result<Vec<CompilationMessage>, CompilationInfoError>) + Send + 'static,
    ) {
        let messages = self
            .shared
            .hub
            .read()
            .unwrap()
            .shader_modules
            .peek(self.key)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default();
        self.shared.enqueue(Box::new(move |outcome| {
            callback(match outcome {
                Outcome::Ready => Ok(messages),
                Outcome::Lost => Err(CompilationInfoError::DeviceLost),
            })
        }));
    }
}

//=============================================================================
// Reflection
//=============================================================================

fn map_storage_format(format: naga::StorageFormat) -> Option<TextureFormat> {
    use naga::StorageFormat as Sf;
    Some(match format {
        Sf::R8Unorm => TextureFormat::R8Unorm,
        Sf::R32Float => TextureFormat::R32Float,
        Sf::R32Uint => TextureFormat::R32Uint,
        Sf::R32Sint => TextureFormat::R32Sint,
        Sf::Rgba8Unorm => TextureFormat::Rgba8Unorm,
        Sf::Rgba8Snorm => TextureFormat::Rgba8Snorm,
        Sf::Rgba8Uint => TextureFormat::Rgba8Uint,
        Sf::Bgra8Unorm => TextureFormat::Bgra8Unorm,
        Sf::Rgba16Float => TextureFormat::Rgba16Float,
        Sf::Rg32Float => TextureFormat::Rg32Float,
        Sf::Rgba32Float => TextureFormat::Rgba32Float,
        Sf::Rgba32Uint => TextureFormat::Rgba32Uint,
        _ => return None,
    })
}

fn reflect_binding(module: &naga::Module, var: &naga::GlobalVariable) -> Result<Option<BindingType>, String> {
    Ok(Some(match var.space {
        naga::AddressSpace::Uniform => BindingType::Buffer {
            ty: BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        naga::AddressSpace::Storage { access } => BindingType::Buffer {
            ty: BufferBindingType::Storage {
                read_only: !access.contains(naga::StorageAccess::STORE),
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        naga::AddressSpace::Handle => match module.types[var.ty].inner {
            naga::TypeInner::Sampler { comparison } => BindingType::Sampler(if comparison {
                SamplerBindingType::Comparison
            } else {
                SamplerBindingType::Filtering
            }),
            naga::TypeInner::Image {
                dim,
                arrayed,
                class,
            } => {
                let view_dimension = match (dim, arrayed) {
                    (naga::ImageDimension::D1, _) => TextureViewDimension::D1,
                    (naga::ImageDimension::D2, false) => TextureViewDimension::D2,
                    (naga::ImageDimension::D2, true) => TextureViewDimension::D2Array,
                    (naga::ImageDimension::D3, _) => TextureViewDimension::D3,
                    (naga::ImageDimension::Cube, false) => TextureViewDimension::Cube,
                    (naga::ImageDimension::Cube, true) => TextureViewDimension::CubeArray,
                };
                match class {
                    naga::ImageClass::Sampled { kind, multi } => BindingType::Texture {
                        sample_type: match kind {
                            naga::ScalarKind::Sint => TextureSampleType::Sint,
                            naga::ScalarKind::Uint => TextureSampleType::Uint,
                            _ => TextureSampleType::Float { filterable: !multi },
                        },
                        view_dimension,
                        multisampled: multi,
                    },
                    naga::ImageClass::Depth { multi } => BindingType::Texture {
                        sample_type: TextureSampleType::Depth,
                        view_dimension,
                        multisampled: multi,
                    },
                    naga::ImageClass::Storage { format, access } => BindingType::StorageTexture {
                        access: if access.contains(naga::StorageAccess::LOAD | naga::StorageAccess::STORE) {
                            StorageTextureAccess::ReadWrite
                        } else if access.contains(naga::StorageAccess::STORE) {
                            StorageTextureAccess::WriteOnly
                        } else {
                            StorageTextureAccess::ReadOnly
                        },
                        format: map_storage_format(format)
                            .ok_or_else(|| format!("storage format {:?} is not supported", format))?,
                        view_dimension,
                    },
                    #[allow(unreachable_patterns)]
                    _ => BindingType::ExternalTexture,
                }
            }
            _ => return Ok(None),
        },
        _ => return Ok(None),
    }))
}

/// Bindings used by a set of entry points, keyed by `(group, binding)`.
type ReflectedBindings = BTreeMap<(u32, u32), BindGroupLayoutEntry>;

/// Checks that a shader-side binding can be served by a layout entry.
fn binding_compatible(declared: BindingType, used: BindingType) -> bool {
    match (declared, used) {
        (BindingType::Buffer { ty: a, .. }, BindingType::Buffer { ty: b, .. }) => a == b,
        (BindingType::Sampler(declared), BindingType::Sampler(used)) => {
            (declared == SamplerBindingType::Comparison) == (used == SamplerBindingType::Comparison)
        }
        (
            BindingType::Texture {
                sample_type: declared_type,
                view_dimension: declared_dim,
                multisampled: declared_ms,
            },
            BindingType::Texture {
                sample_type: used_type,
                view_dimension: used_dim,
                multisampled: used_ms,
            },
        ) => {
            declared_dim == used_dim
                && declared_ms == used_ms
                && match (declared_type, used_type) {
                    (TextureSampleType::Float { .. }, TextureSampleType::Float { .. }) => true,
                    (a, b) => a == b,
                }
        }
        (
            BindingType::StorageTexture {
                access: a,
                format: fa,
                view_dimension: da,
            },
            BindingType::StorageTexture {
                access: b,
                format: fb,
                view_dimension: db,
            },
        ) => a == b && fa == fb && da == db,
        (BindingType::ExternalTexture, BindingType::ExternalTexture) => true,
        _ => false,
    }
}

/// What pipeline creation learns from one programmable stage.
struct StageInfo {
    ep_index: usize,
    workgroup_size: [u32; 3],
}

fn resolve_stage(
    parsed: &ParsedShader,
    entry_point: &str,
    constants: &[(&str, f64)],
    stage: naga::ShaderStage,
    visibility: ShaderStages,
    bindings: &mut ReflectedBindings,
) -> Result<StageInfo, String> {
    let module = &parsed.module;
    let ep_index = module
        .entry_points
        .iter()
        .position(|ep| ep.name == entry_point)
        .ok_or_else(|| format!("entry point '{}' does not exist", entry_point))?;
    let ep = &module.entry_points[ep_index];
    if ep.stage != stage {
        return Err(format!(
            "entry point '{}' is a {:?} shader, expected {:?}",
            entry_point, ep.stage, stage
        ));
    }

    for &(key, value) in constants {
        if !value.is_finite() {
            return Err(format!("constant '{}' is not finite", key));
        }
        let known = module.overrides.iter().any(|(_, o)| {
            o.name.as_deref() == Some(key) || o.id.is_some_and(|id| id.to_string() == key)
        });
        if !known {
            return Err(format!("constant '{}' is not overridable in the module", key));
        }
    }
    if let Some((_, missing)) = module.overrides.iter().find(|(_, o)| {
        o.init.is_none()
            && !constants.iter().any(|&(key, _)| {
                o.name.as_deref() == Some(key) || o.id.is_some_and(|id| id.to_string() == key)
            })
    }) {
        return Err(format!(
            "overridable constant '{}' has no default and was not given",
            missing.name.as_deref().unwrap_or("?")
        ));
    }

    let ep_info = parsed.info.get_entry_point(ep_index);
    for (handle, var) in module.global_variables.iter() {
        let Some(ref resource) = var.binding else {
            continue;
        };
        if ep_info[handle].is_empty() {
            continue;
        }
        let Some(ty) = reflect_binding(module, var)? else {
            continue;
        };
        let slot = (resource.group, resource.binding);
        match bindings.get_mut(&slot) {
            Some(existing) if existing.ty == ty => existing.visibility |= visibility,
            Some(existing) => {
                return Err(format!(
                    "binding {:?} is used as {:?} and as {:?}",
                    slot, existing.ty, ty
                ))
            }
            None => {
                bindings.insert(
                    slot,
                    BindGroupLayoutEntry {
                        binding: resource.binding,
                        visibility,
                        ty,
                    },
                );
            }
        }
    }

    Ok(StageInfo {
        ep_index,
        workgroup_size: ep.workgroup_size,
    })
}

/// Looks up a valid shader module owned by this device.
fn parsed_module(
    shared: &Arc<DeviceShared>,
    hub: &Hub,
    stage: &ProgrammableStage,
) -> Result<Arc<ParsedShader>, String> {
    if !stage.module.same_device(shared) {
        return Err("shader module belongs to another device".to_string());
    }
    match hub.shader_modules.get(stage.module.key) {
        Ok(entry) => entry
            .parsed
            .clone()
            .ok_or_else(|| "shader module failed to compile".to_string()),
        Err(e) => Err(format!("{}: {}", hub.shader_modules.describe(stage.module.key), e)),
    }
}

/// Produces the pipeline layout: either the explicit one, checked against the
/// reflected bindings, or a new one derived from them.
fn resolve_layout(
    shared: &Arc<DeviceShared>,
    hub: &mut Hub,
    explicit: Option<&PipelineLayout>,
    bindings: &ReflectedBindings,
) -> Result<crate::PipelineLayoutKey, String> {
    if let Some(layout) = explicit {
        if !layout.same_device(shared) {
            return Err("pipeline layout belongs to another device".to_string());
        }
        let entry = hub
            .pipeline_layouts
            .get(layout.key)
            .map_err(|e| format!("{}: {}", hub.pipeline_layouts.describe(layout.key), e))?;
        for (&(group, binding), used) in bindings.iter() {
            let declared = entry
                .groups
                .get(group as usize)
                .and_then(|&key| hub.bind_group_layouts.get(key).ok())
                .and_then(|group_layout| group_layout.find(binding))
                .ok_or_else(|| {
                    format!("binding {} of group {} is missing from the layout", binding, group)
                })?;
            if !binding_compatible(declared.ty, used.ty)
                || !declared.visibility.contains(used.visibility)
            {
                return Err(format!(
                    "binding {} of group {}: layout declares {:?} visible to {:?}, shader uses {:?} in {:?}",
                    binding, group, declared.ty, declared.visibility, used.ty, used.visibility
                ));
            }
        }
        hub.pipeline_layouts.retain(layout.key);
        return Ok(layout.key);
    }

    let group_count = bindings
        .keys()
        .map(|&(group, _)| group + 1)
        .max()
        .unwrap_or(0);
    if group_count > shared.limits.max_bind_groups {
        return Err(format!(
            "shader uses {} bind groups, the limit is {}",
            group_count, shared.limits.max_bind_groups
        ));
    }
    let mut group_entries = Vec::with_capacity(group_count as usize);
    for group in 0..group_count {
        let entries: Vec<_> = bindings
            .range((group, 0)..=(group, u32::MAX))
            .map(|(_, entry)| *entry)
            .collect();
        group_entries.push(make_group_layout(&entries, &shared.limits)?);
    }
    let groups = group_entries
        .into_iter()
        .map(|entry| hub.bind_group_layouts.insert("", entry))
        .collect();
    Ok(hub
        .pipeline_layouts
        .insert("", PipelineLayoutEntry { groups }))
}

fn bind_group_layout_of(
    shared: &Arc<DeviceShared>,
    layout: Result<crate::PipelineLayoutKey, crate::HandleError>,
    index: u32,
) -> BindGroupLayout {
    let mut hub = shared.hub.write().unwrap();
    let group = layout.and_then(|layout| {
        hub.pipeline_layouts
            .get(layout)
            .map(|entry| entry.groups.get(index as usize).copied())
    });
    match group {
        Ok(Some(key)) => {
            hub.bind_group_layouts.retain(key);
            BindGroupLayout::from_parts(shared, key)
        }
        other => {
            let key = hub.bind_group_layouts.insert_error("");
            drop(hub);
            shared.validation(match other {
                Err(e) => format!("get_bind_group_layout({}): pipeline {}", index, e),
                _ => format!("get_bind_group_layout({}): index is out of range", index),
            });
            BindGroupLayout::from_parts(shared, key)
        }
    }
}

//=============================================================================
// Compute Pipelines
//=============================================================================

pub(crate) struct ComputePipelineEntry {
    pub layout: crate::PipelineLayoutKey,
    pub workgroup_size: [u32; 3],
}

impl HubEntry for ComputePipelineEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        vec![self.layout.into()]
    }
}

impl ComputePipeline {
    /// Returns the bind group layout at `index` of the pipeline layout.
    pub fn get_bind_group_layout(&self, index: u32) -> BindGroupLayout {
        let layout = self
            .shared
            .hub
            .read()
            .unwrap()
            .compute_pipelines
            .get(self.key)
            .map(|entry| entry.layout);
        bind_group_layout_of(&self.shared, layout, index)
    }
}

fn make_compute_pipeline(
    shared: &Arc<DeviceShared>,
    hub: &mut Hub,
    desc: &ComputePipelineDesc,
) -> Result<ComputePipelineEntry, String> {
    let parsed = parsed_module(shared, hub, &desc.compute)?;
    let mut bindings = ReflectedBindings::new();
    let stage = resolve_stage(
        &parsed,
        desc.compute.entry_point,
        desc.compute.constants,
        naga::ShaderStage::Compute,
        ShaderStages::COMPUTE,
        &mut bindings,
    )?;
    let limits = &shared.limits;
    let [x, y, z] = stage.workgroup_size;
    if x > limits.max_compute_workgroup_size_x
        || y > limits.max_compute_workgroup_size_y
        || z > limits.max_compute_workgroup_size_z
        || x * y * z > limits.max_compute_invocations_per_workgroup
    {
        return Err(format!(
            "workgroup size {:?} exceeds the device limits",
            stage.workgroup_size
        ));
    }
    let layout = resolve_layout(shared, hub, desc.layout, &bindings)?;
    Ok(ComputePipelineEntry {
        layout,
        workgroup_size: stage.workgroup_size,
    })
}

//=============================================================================
// Render Pipelines
//=============================================================================

pub(crate) struct RenderPipelineEntry {
    pub layout: crate::PipelineLayoutKey,
    pub color_formats: Vec<Option<TextureFormat>>,
    pub depth_stencil_format: Option<TextureFormat>,
    pub sample_count: u32,
    /// Stride and step mode of every vertex buffer slot the pipeline reads.
    pub vertex_buffers: Vec<(u64, VertexStepMode)>,
    pub topology: PrimitiveTopology,
    pub strip_index_format: Option<IndexFormat>,
    pub writes_depth: bool,
    pub writes_stencil: bool,
}

impl HubEntry for RenderPipelineEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        vec![self.layout.into()]
    }
}

impl RenderPipeline {
    /// Returns the bind group layout at `index` of the pipeline layout.
    pub fn get_bind_group_layout(&self, index: u32) -> BindGroupLayout {
        let layout = self
            .shared
            .hub
            .read()
            .unwrap()
            .render_pipelines
            .get(self.key)
            .map(|entry| entry.layout);
        bind_group_layout_of(&self.shared, layout, index)
    }
}

/// Shader input locations of a vertex entry point.
fn vertex_input_locations(module: &naga::Module, ep_index: usize) -> Vec<u32> {
    let mut locations = Vec::new();
    for argument in module.entry_points[ep_index].function.arguments.iter() {
        match argument.binding {
            Some(naga::Binding::Location { location, .. }) => locations.push(location),
            Some(_) => {}
            None => {
                if let naga::TypeInner::Struct { ref members, .. } = module.types[argument.ty].inner
                {
                    locations.extend(members.iter().filter_map(|member| match member.binding {
                        Some(naga::Binding::Location { location, .. }) => Some(location),
                        _ => None,
                    }));
                }
            }
        }
    }
    locations
}

fn make_render_pipeline(
    shared: &Arc<DeviceShared>,
    hub: &mut Hub,
    desc: &RenderPipelineDesc,
) -> Result<RenderPipelineEntry, String> {
    let limits = &shared.limits;
    let mut bindings = ReflectedBindings::new();

    let vertex_stage = ProgrammableStage {
        module: desc.vertex.module,
        entry_point: desc.vertex.entry_point,
        constants: desc.vertex.constants,
    };
    let vertex_module = parsed_module(shared, hub, &vertex_stage)?;
    let vertex = resolve_stage(
        &vertex_module,
        desc.vertex.entry_point,
        desc.vertex.constants,
        naga::ShaderStage::Vertex,
        ShaderStages::VERTEX,
        &mut bindings,
    )?;

    if desc.vertex.buffers.len() > limits.max_vertex_buffers as usize {
        return Err(format!(
            "{} vertex buffers exceed the limit of {}",
            desc.vertex.buffers.len(),
            limits.max_vertex_buffers
        ));
    }
    let mut provided = Vec::new();
    for (slot, layout) in desc.vertex.buffers.iter().enumerate() {
        if layout.array_stride > limits.max_vertex_buffer_array_stride as u64
            || layout.array_stride % 4 != 0
        {
            return Err(format!(
                "vertex buffer {}: stride {} must be a multiple of 4 up to {}",
                slot, layout.array_stride, limits.max_vertex_buffer_array_stride
            ));
        }
        for attribute in layout.attributes.iter() {
            let end = attribute.offset + attribute.format.size();
            if (layout.array_stride != 0 && end > layout.array_stride)
                || attribute.offset % attribute.format.size().min(4) != 0
            {
                return Err(format!(
                    "vertex buffer {}: attribute at location {} does not fit the stride",
                    slot, attribute.shader_location
                ));
            }
            if attribute.shader_location >= limits.max_vertex_attributes
                || provided.contains(&attribute.shader_location)
            {
                return Err(format!(
                    "shader location {} is out of range or declared twice",
                    attribute.shader_location
                ));
            }
            provided.push(attribute.shader_location);
        }
    }
    if provided.len() > limits.max_vertex_attributes as usize {
        return Err(format!(
            "{} vertex attributes exceed the limit of {}",
            provided.len(),
            limits.max_vertex_attributes
        ));
    }
    if let Some(location) = vertex_input_locations(&vertex_module.module, vertex.ep_index)
        .into_iter()
        .find(|location| !provided.contains(location))
    {
        return Err(format!(
            "vertex shader input at location {} is not provided by any buffer",
            location
        ));
    }

    let primitive = desc.primitive;
    if primitive.strip_index_format.is_some() && !primitive.topology.is_strip() {
        return Err(format!(
            "strip index format is only valid for strip topologies, not {:?}",
            primitive.topology
        ));
    }
    if primitive.unclipped_depth && !shared.features.contains(Features::DEPTH_CLIP_CONTROL) {
        return Err("unclipped depth requires Features::DEPTH_CLIP_CONTROL".to_string());
    }

    let multisample = desc.multisample;
    if multisample.count != 1 && multisample.count != 4 {
        return Err(format!("sample count {} must be 1 or 4", multisample.count));
    }
    if multisample.alpha_to_coverage_enabled && multisample.count == 1 {
        return Err("alpha to coverage requires multisampling".to_string());
    }

    let mut color_formats = Vec::new();
    if let Some(ref fragment) = desc.fragment {
        let fragment_stage = ProgrammableStage {
            module: fragment.module,
            entry_point: fragment.entry_point,
            constants: fragment.constants,
        };
        let fragment_module = parsed_module(shared, hub, &fragment_stage)?;
        resolve_stage(
            &fragment_module,
            fragment.entry_point,
            fragment.constants,
            naga::ShaderStage::Fragment,
            ShaderStages::FRAGMENT,
            &mut bindings,
        )?;
        if fragment.targets.len() > limits.max_color_attachments as usize {
            return Err(format!(
                "{} color targets exceed the limit of {}",
                fragment.targets.len(),
                limits.max_color_attachments
            ));
        }
        for target in fragment.targets.iter() {
            if let Some(target) = target {
                if target.format.is_depth_stencil() || !target.format.is_renderable() {
                    return Err(format!(
                        "format {:?} is not a renderable color format",
                        target.format
                    ));
                }
            }
            color_formats.push(target.map(|target| target.format));
        }
    }

    let mut writes_depth = false;
    let mut writes_stencil = false;
    if let Some(ref depth_stencil) = desc.depth_stencil {
        let aspects = depth_stencil.format.aspects();
        if !depth_stencil.format.is_depth_stencil() {
            return Err(format!(
                "depth-stencil format {:?} has no depth or stencil aspect",
                depth_stencil.format
            ));
        }
        let missing = depth_stencil.format.required_features() - shared.features;
        if !missing.is_empty() {
            return Err(format!(
                "format {:?} requires features {:?}",
                depth_stencil.format, missing
            ));
        }
        if depth_stencil.depth_write_enabled && !aspects.contains(crate::TexelAspects::DEPTH) {
            return Err("depth writes need a format with a depth aspect".to_string());
        }
        writes_depth = depth_stencil.depth_write_enabled;
        let stencil = depth_stencil.stencil;
        writes_stencil = aspects.contains(crate::TexelAspects::STENCIL)
            && stencil.write_mask != 0
            && (stencil.front != crate::StencilFaceState::default()
                || stencil.back != crate::StencilFaceState::default());
    }
    if color_formats.iter().all(Option::is_none) && desc.depth_stencil.is_none() {
        return Err("render pipeline has no color target and no depth-stencil state".to_string());
    }

    let layout = resolve_layout(shared, hub, desc.layout, &bindings)?;
    Ok(RenderPipelineEntry {
        layout,
        color_formats,
        depth_stencil_format: desc.depth_stencil.map(|ds| ds.format),
        sample_count: multisample.count,
        vertex_buffers: desc
            .vertex
            .buffers
            .iter()
            .map(|layout| (layout.array_stride, layout.step_mode))
            .collect(),
        topology: primitive.topology,
        strip_index_format: primitive.strip_index_format,
        writes_depth,
        writes_stencil,
    })
}

//=============================================================================
// Device Entry Points
//=============================================================================

impl crate::Device {
    fn build_compute_pipeline(&self, desc: &ComputePipelineDesc) -> (ComputePipeline, Result<(), String>) {
        let mut hub = self.shared.hub.write().unwrap();
        let (key, result) = match make_compute_pipeline(&self.shared, &mut hub, desc) {
            Ok(entry) => (hub.compute_pipelines.insert(desc.label, entry), Ok(())),
            Err(message) => (hub.compute_pipelines.insert_error(desc.label), Err(message)),
        };
        (ComputePipeline::from_parts(&self.shared, key), result)
    }

    fn build_render_pipeline(&self, desc: &RenderPipelineDesc) -> (RenderPipeline, Result<(), String>) {
        let mut hub = self.shared.hub.write().unwrap();
        let (key, result) = match make_render_pipeline(&self.shared, &mut hub, desc) {
            Ok(entry) => (hub.render_pipelines.insert(desc.label, entry), Ok(())),
            Err(message) => (hub.render_pipelines.insert_error(desc.label), Err(message)),
        };
        (RenderPipeline::from_parts(&self.shared, key), result)
    }

    /// Builds the pipeline and hands it over on the next tick. Failures go to
    /// the callback rather than the error scopes.
    pub fn create_compute_pipeline_async(
        &self,
        desc: &ComputePipelineDesc,
        callback: impl FnOnce(Result<ComputePipeline, CreatePipelineError>) + Send + 'static,
    ) {
        let (pipeline, result) = self.build_compute_pipeline(desc);
        self.shared.enqueue(Box::new(move |outcome| {
            callback(match (outcome, result) {
                (Outcome::Lost, _) => Err(CreatePipelineError::DeviceLost),
                (Outcome::Ready, Ok(())) => Ok(pipeline),
                (Outcome::Ready, Err(message)) => Err(CreatePipelineError::Validation(message)),
            })
        }));
    }

    pub fn create_render_pipeline_async(
        &self,
        desc: &RenderPipelineDesc,
        callback: impl FnOnce(Result<RenderPipeline, CreatePipelineError>) + Send + 'static,
    ) {
        let (pipeline, result) = self.build_render_pipeline(desc);
        self.shared.enqueue(Box::new(move |outcome| {
            callback(match (outcome, result) {
                (Outcome::Lost, _) => Err(CreatePipelineError::DeviceLost),
                (Outcome::Ready, Ok(())) => Ok(pipeline),
                (Outcome::Ready, Err(message)) => Err(CreatePipelineError::Validation(message)),
            })
        }));
    }
}

#[hidden_trait::expose]
impl crate::traits::ShaderDevice for crate::Device {
    fn create_shader_module(&self, desc: &ShaderModuleDesc) -> ShaderModule {
        let ShaderSource::Wgsl(ref source) = desc.source;
        let entry = match compile_wgsl(source) {
            Ok(parsed) => {
                log::debug!(
                    "Compiled shader module '{}' with {} entry points",
                    desc.label,
                    parsed.module.entry_points.len()
                );
                ShaderModuleEntry {
                    parsed: Some(Arc::new(parsed)),
                    messages: Vec::new(),
                }
            }
            Err((message, report)) => {
                self.shared.validation(format!(
                    "create_shader_module '{}': {}",
                    desc.label, report
                ));
                ShaderModuleEntry {
                    parsed: None,
                    messages: vec![message],
                }
            }
        };
        let key = self
            .shared
            .hub
            .write()
            .unwrap()
            .shader_modules
            .insert(desc.label, entry);
        ShaderModule::from_parts(&self.shared, key)
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> ComputePipeline {
        let (pipeline, result) = self.build_compute_pipeline(desc);
        if let Err(message) = result {
            self.shared.validation(format!(
                "create_compute_pipeline '{}': {}",
                desc.label, message
            ));
        }
        pipeline
    }

    fn create_render_pipeline(&self, desc: &RenderPipelineDesc) -> RenderPipeline {
        let (pipeline, result) = self.build_render_pipeline(desc);
        if let Err(message) = result {
            self.shared.validation(format!(
                "create_render_pipeline '{}': {}",
                desc.label, message
            ));
        }
        pipeline
    }
}
