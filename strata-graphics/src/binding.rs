//! Bind group layouts, bind groups and pipeline layouts.

use crate::{
    handle::{resource_handle, DeviceChild, HubEntry},
    hub::Hub,
    AnyKey, BindGroupDesc, BindGroupLayoutDesc, BindingResource, BindingType, BufferBindingType,
    BufferUsages, Limits, PipelineLayoutDesc, SamplerBindingType, ShaderStages,
    StorageTextureAccess, TextureFormat, TextureSampleType, TextureUsages,
};

pub(crate) struct GroupLayoutEntry {
    /// Sorted by binding number.
    pub entries: Vec<crate::BindGroupLayoutEntry>,
    pub dynamic_uniform_count: u32,
    pub dynamic_storage_count: u32,
}

impl HubEntry for GroupLayoutEntry {}

impl GroupLayoutEntry {
    /// Layouts are interchangeable when they declare the same bindings.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.entries == other.entries
    }

    pub fn find(&self, binding: u32) -> Option<&crate::BindGroupLayoutEntry> {
        self.entries
            .binary_search_by_key(&binding, |entry| entry.binding)
            .ok()
            .map(|index| &self.entries[index])
    }
}

/// A buffer binding whose offset is supplied when the group is set.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DynamicBinding {
    pub buffer_size: u64,
    pub offset: u64,
    pub size: u64,
    pub alignment: u32,
}

pub(crate) struct GroupEntry {
    pub layout: crate::BindGroupLayoutKey,
    pub resources: Vec<AnyKey>,
    /// Ordered by binding number.
    pub dynamic_bindings: Vec<DynamicBinding>,
}

impl HubEntry for GroupEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        let mut keys = self.resources.clone();
        keys.push(self.layout.into());
        keys
    }
}

impl GroupEntry {
    pub fn check_dynamic_offsets(&self, offsets: &[u32]) -> Result<(), String> {
        if offsets.len() != self.dynamic_bindings.len() {
            return Err(format!(
                "{} dynamic offsets given, the layout expects {}",
                offsets.len(),
                self.dynamic_bindings.len()
            ));
        }
        for (&offset, binding) in offsets.iter().zip(self.dynamic_bindings.iter()) {
            if offset % binding.alignment != 0 {
                return Err(format!(
                    "dynamic offset {} is not a multiple of {}",
                    offset, binding.alignment
                ));
            }
            if binding.offset + binding.size + offset as u64 > binding.buffer_size {
                return Err(format!(
                    "dynamic offset {} moves the binding past the end of a buffer of {} bytes",
                    offset, binding.buffer_size
                ));
            }
        }
        Ok(())
    }
}

pub(crate) struct PipelineLayoutEntry {
    pub groups: Vec<crate::BindGroupLayoutKey>,
}

impl HubEntry for PipelineLayoutEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.groups.iter().map(|&key| key.into()).collect()
    }
}

resource_handle!(BindGroupLayout, BindGroupLayoutKey, bind_group_layouts);
resource_handle!(BindGroup, BindGroupKey, bind_groups);
resource_handle!(PipelineLayout, PipelineLayoutKey, pipeline_layouts);

//=============================================================================
// Validation
//=============================================================================

pub(crate) fn make_group_layout(
    entries: &[crate::BindGroupLayoutEntry],
    limits: &Limits,
) -> Result<GroupLayoutEntry, String> {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|entry| entry.binding);
    if let Some(pair) = sorted.windows(2).find(|pair| pair[0].binding == pair[1].binding) {
        return Err(format!("binding {} is declared twice", pair[0].binding));
    }
    if let Some(entry) = sorted
        .iter()
        .find(|entry| entry.binding >= limits.max_bindings_per_bind_group)
    {
        return Err(format!(
            "binding {} exceeds the limit of {}",
            entry.binding, limits.max_bindings_per_bind_group
        ));
    }
    let mut dynamic_uniform_count = 0;
    let mut dynamic_storage_count = 0;
    for entry in sorted.iter() {
        match entry.ty {
            BindingType::Buffer {
                ty,
                has_dynamic_offset,
                ..
            } => {
                if has_dynamic_offset {
                    match ty {
                        BufferBindingType::Uniform => dynamic_uniform_count += 1,
                        BufferBindingType::Storage { .. } => dynamic_storage_count += 1,
                    }
                }
                if ty == (BufferBindingType::Storage { read_only: false })
                    && entry.visibility.contains(ShaderStages::VERTEX)
                {
                    return Err(format!(
                        "binding {}: writable storage buffers are not allowed in the vertex stage",
                        entry.binding
                    ));
                }
            }
            BindingType::Texture {
                sample_type,
                view_dimension,
                multisampled,
            } => {
                if multisampled
                    && (view_dimension != crate::TextureViewDimension::D2
                        || sample_type == (TextureSampleType::Float { filterable: true }))
                {
                    return Err(format!(
                        "binding {}: multisampled textures must be 2D and non-filterable",
                        entry.binding
                    ));
                }
            }
            BindingType::StorageTexture { access, .. } => {
                if access != StorageTextureAccess::ReadOnly
                    && entry.visibility.contains(ShaderStages::VERTEX)
                {
                    return Err(format!(
                        "binding {}: writable storage textures are not allowed in the vertex stage",
                        entry.binding
                    ));
                }
            }
            BindingType::Sampler(_) | BindingType::ExternalTexture => {}
        }
    }
    if dynamic_uniform_count > limits.max_dynamic_uniform_buffers_per_pipeline_layout
        || dynamic_storage_count > limits.max_dynamic_storage_buffers_per_pipeline_layout
    {
        return Err(format!(
            "{} dynamic uniform and {} dynamic storage buffers exceed the limits",
            dynamic_uniform_count, dynamic_storage_count
        ));
    }
    Ok(GroupLayoutEntry {
        entries: sorted,
        dynamic_uniform_count,
        dynamic_storage_count,
    })
}

/// Sample type a texture of this format produces in a shader.
pub(crate) fn format_sample_type(format: TextureFormat) -> TextureSampleType {
    use TextureFormat as Tf;
    match format {
        Tf::R8Uint | Tf::R16Uint | Tf::R32Uint | Tf::Rgba8Uint | Tf::Rgba32Uint | Tf::Stencil8 => {
            TextureSampleType::Uint
        }
        Tf::R8Sint | Tf::R16Sint | Tf::R32Sint => TextureSampleType::Sint,
        Tf::Depth16Unorm
        | Tf::Depth24Plus
        | Tf::Depth24PlusStencil8
        | Tf::Depth32Float
        | Tf::Depth32FloatStencil8 => TextureSampleType::Depth,
        Tf::R32Float | Tf::Rg32Float | Tf::Rgba32Float => {
            TextureSampleType::Float { filterable: false }
        }
        _ => TextureSampleType::Float { filterable: true },
    }
}

fn sample_type_compatible(layout: TextureSampleType, format: TextureSampleType) -> bool {
    match (layout, format) {
        (TextureSampleType::Float { filterable: false }, TextureSampleType::Float { .. }) => true,
        // Depth textures may also be read as unfilterable floats.
        (TextureSampleType::Float { filterable: false }, TextureSampleType::Depth) => true,
        (a, b) => a == b,
    }
}

fn resource_kind(resource: &BindingResource) -> &'static str {
    match *resource {
        BindingResource::Buffer(_) => "buffer",
        BindingResource::Sampler(_) => "sampler",
        BindingResource::TextureView(_) => "texture view",
        BindingResource::ExternalTexture(_) => "external texture",
    }
}

fn make_group(hub: &Hub, desc: &BindGroupDesc, limits: &Limits) -> Result<GroupEntry, String> {
    let layout = hub
        .bind_group_layouts
        .get(desc.layout.key)
        .map_err(|e| format!("{}: {}", hub.bind_group_layouts.describe(desc.layout.key), e))?;
    if desc.entries.len() != layout.entries.len() {
        return Err(format!(
            "{} entries given, the layout declares {}",
            desc.entries.len(),
            layout.entries.len()
        ));
    }
    let mut seen = Vec::with_capacity(desc.entries.len());
    let mut resources = Vec::with_capacity(desc.entries.len());
    let mut dynamic_bindings = Vec::new();
    for entry in desc.entries.iter() {
        if seen.contains(&entry.binding) {
            return Err(format!("binding {} is given twice", entry.binding));
        }
        seen.push(entry.binding);
        let declared = layout
            .find(entry.binding)
            .ok_or_else(|| format!("binding {} is not in the layout", entry.binding))?;
        let fail = |what: String| Err(format!("binding {}: {}", entry.binding, what));
        match (entry.resource, declared.ty) {
            (
                BindingResource::Buffer(binding),
                BindingType::Buffer {
                    ty,
                    has_dynamic_offset,
                    min_binding_size,
                },
            ) => {
                let buffer = hub
                    .buffers
                    .get(binding.buffer.key)
                    .map_err(|e| format!("binding {}: buffer {}", entry.binding, e))?;
                let (usage, alignment, max_size) = match ty {
                    BufferBindingType::Uniform => (
                        BufferUsages::UNIFORM,
                        limits.min_uniform_buffer_offset_alignment,
                        limits.max_uniform_buffer_binding_size,
                    ),
                    BufferBindingType::Storage { .. } => (
                        BufferUsages::STORAGE,
                        limits.min_storage_buffer_offset_alignment,
                        limits.max_storage_buffer_binding_size,
                    ),
                };
                if !buffer.usage.contains(usage) {
                    return fail(format!("buffer usage {:?} lacks {:?}", buffer.usage, usage));
                }
                if binding.offset % alignment as u64 != 0 {
                    return fail(format!(
                        "offset {} is not a multiple of {}",
                        binding.offset, alignment
                    ));
                }
                let size = binding
                    .size
                    .unwrap_or(buffer.size.saturating_sub(binding.offset));
                if size == 0 {
                    return fail("bound range is empty".to_string());
                }
                buffer
                    .check_range(binding.offset, size)
                    .map_err(|message| format!("binding {}: {}", entry.binding, message))?;
                if size > max_size {
                    return fail(format!("size {} exceeds the limit of {}", size, max_size));
                }
                if matches!(ty, BufferBindingType::Storage { .. }) && size % 4 != 0 {
                    return fail(format!("storage binding size {} is not a multiple of 4", size));
                }
                if let Some(min) = min_binding_size {
                    if size < min {
                        return fail(format!(
                            "size {} is below the minimum binding size {}",
                            size, min
                        ));
                    }
                }
                if has_dynamic_offset {
                    dynamic_bindings.push((
                        entry.binding,
                        DynamicBinding {
                            buffer_size: buffer.size,
                            offset: binding.offset,
                            size,
                            alignment,
                        },
                    ));
                }
                resources.push(binding.buffer.key.into());
            }
            (BindingResource::Sampler(sampler), BindingType::Sampler(ty)) => {
                let entry_sampler = hub
                    .samplers
                    .get(sampler.key)
                    .map_err(|e| format!("binding {}: sampler {}", entry.binding, e))?;
                let ok = match ty {
                    SamplerBindingType::Comparison => entry_sampler.comparison,
                    SamplerBindingType::Filtering => !entry_sampler.comparison,
                    SamplerBindingType::NonFiltering => {
                        !entry_sampler.comparison && !entry_sampler.filtering
                    }
                };
                if !ok {
                    return fail(format!("sampler does not match {:?}", ty));
                }
                resources.push(sampler.key.into());
            }
            (
                BindingResource::TextureView(view),
                BindingType::Texture {
                    sample_type,
                    view_dimension,
                    multisampled,
                },
            ) => {
                let entry_view = hub
                    .texture_views
                    .get(view.key)
                    .map_err(|e| format!("binding {}: view {}", entry.binding, e))?;
                if !entry_view.usage.contains(TextureUsages::TEXTURE_BINDING) {
                    return fail("texture lacks TEXTURE_BINDING usage".to_string());
                }
                if entry_view.dimension != view_dimension {
                    return fail(format!(
                        "view dimension {:?} does not match {:?}",
                        entry_view.dimension, view_dimension
                    ));
                }
                if (entry_view.sample_count > 1) != multisampled {
                    return fail("multisampling does not match the layout".to_string());
                }
                if !sample_type_compatible(sample_type, format_sample_type(entry_view.format)) {
                    return fail(format!(
                        "format {:?} cannot be sampled as {:?}",
                        entry_view.format, sample_type
                    ));
                }
                resources.push(view.key.into());
            }
            (
                BindingResource::TextureView(view),
                BindingType::StorageTexture {
                    format,
                    view_dimension,
                    ..
                },
            ) => {
                let entry_view = hub
                    .texture_views
                    .get(view.key)
                    .map_err(|e| format!("binding {}: view {}", entry.binding, e))?;
                if !entry_view.usage.contains(TextureUsages::STORAGE_BINDING) {
                    return fail("texture lacks STORAGE_BINDING usage".to_string());
                }
                if entry_view.format != format
                    || entry_view.dimension != view_dimension
                    || entry_view.mip_level_count != 1
                {
                    return fail(format!(
                        "storage view must be a single-level {:?} {:?} view",
                        view_dimension, format
                    ));
                }
                resources.push(view.key.into());
            }
            (BindingResource::ExternalTexture(external), BindingType::ExternalTexture) => {
                hub.external_textures
                    .get(external.key)
                    .map_err(|e| format!("binding {}: external texture {}", entry.binding, e))?;
                resources.push(external.key.into());
            }
            (resource, ty) => {
                return fail(format!(
                    "a {} does not match the declared {:?}",
                    resource_kind(&resource),
                    ty
                ))
            }
        }
    }
    dynamic_bindings.sort_by_key(|&(binding, _)| binding);
    Ok(GroupEntry {
        layout: desc.layout.key,
        resources,
        dynamic_bindings: dynamic_bindings
            .into_iter()
            .map(|(_, binding)| binding)
            .collect(),
    })
}

fn make_pipeline_layout(
    hub: &Hub,
    desc: &PipelineLayoutDesc,
    limits: &Limits,
) -> Result<PipelineLayoutEntry, String> {
    if desc.bind_group_layouts.len() > limits.max_bind_groups as usize {
        return Err(format!(
            "{} bind group layouts exceed the limit of {}",
            desc.bind_group_layouts.len(),
            limits.max_bind_groups
        ));
    }
    let mut dynamic_uniform = 0;
    let mut dynamic_storage = 0;
    for (index, layout) in desc.bind_group_layouts.iter().enumerate() {
        let entry = hub
            .bind_group_layouts
            .get(layout.key)
            .map_err(|e| format!("bind group layout {}: {}", index, e))?;
        dynamic_uniform += entry.dynamic_uniform_count;
        dynamic_storage += entry.dynamic_storage_count;
    }
    if dynamic_uniform > limits.max_dynamic_uniform_buffers_per_pipeline_layout
        || dynamic_storage > limits.max_dynamic_storage_buffers_per_pipeline_layout
    {
        return Err(format!(
            "{} dynamic uniform and {} dynamic storage buffers exceed the limits",
            dynamic_uniform, dynamic_storage
        ));
    }
    Ok(PipelineLayoutEntry {
        groups: desc.bind_group_layouts.iter().map(|layout| layout.key).collect(),
    })
}

#[hidden_trait::expose]
impl crate::traits::BindingDevice for crate::Device {
    fn create_bind_group_layout(&self, desc: &BindGroupLayoutDesc) -> BindGroupLayout {
        let mut hub = self.shared.hub.write().unwrap();
        match make_group_layout(desc.entries, &self.shared.limits) {
            Ok(entry) => {
                let key = hub.bind_group_layouts.insert(desc.label, entry);
                BindGroupLayout::from_parts(&self.shared, key)
            }
            Err(message) => {
                let key = hub.bind_group_layouts.insert_error(desc.label);
                drop(hub);
                self.shared.validation(format!(
                    "create_bind_group_layout '{}': {}",
                    desc.label, message
                ));
                BindGroupLayout::from_parts(&self.shared, key)
            }
        }
    }

    fn create_bind_group(&self, desc: &BindGroupDesc) -> BindGroup {
        let mut hub = self.shared.hub.write().unwrap();
        let foreign = !desc.layout.same_device(&self.shared)
            || desc.entries.iter().any(|entry| match entry.resource {
                BindingResource::Buffer(binding) => !binding.buffer.same_device(&self.shared),
                BindingResource::Sampler(sampler) => !sampler.same_device(&self.shared),
                BindingResource::TextureView(view) => !view.same_device(&self.shared),
                BindingResource::ExternalTexture(external) => {
                    !external.same_device(&self.shared)
                }
            });
        let result = if foreign {
            Err("objects from another device were given".to_string())
        } else {
            make_group(&hub, desc, &self.shared.limits)
        };
        match result {
            Ok(entry) => {
                for &key in entry.resources.iter() {
                    hub.retain(key);
                }
                hub.bind_group_layouts.retain(entry.layout);
                let key = hub.bind_groups.insert(desc.label, entry);
                BindGroup::from_parts(&self.shared, key)
            }
            Err(message) => {
                let key = hub.bind_groups.insert_error(desc.label);
                drop(hub);
                self.shared
                    .validation(format!("create_bind_group '{}': {}", desc.label, message));
                BindGroup::from_parts(&self.shared, key)
            }
        }
    }

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> PipelineLayout {
        let mut hub = self.shared.hub.write().unwrap();
        let result = if desc
            .bind_group_layouts
            .iter()
            .any(|layout| !layout.same_device(&self.shared))
        {
            Err("bind group layouts from another device were given".to_string())
        } else {
            make_pipeline_layout(&hub, desc, &self.shared.limits)
        };
        match result {
            Ok(entry) => {
                for &key in entry.groups.iter() {
                    hub.bind_group_layouts.retain(key);
                }
                let key = hub.pipeline_layouts.insert(desc.label, entry);
                PipelineLayout::from_parts(&self.shared, key)
            }
            Err(message) => {
                let key = hub.pipeline_layouts.insert_error(desc.label);
                drop(hub);
                self.shared.validation(format!(
                    "create_pipeline_layout '{}': {}",
                    desc.label, message
                ));
                PipelineLayout::from_parts(&self.shared, key)
            }
        }
    }
}
