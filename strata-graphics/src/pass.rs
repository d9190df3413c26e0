//! Compute and render pass encoders.
//!
//! A pass locks its parent encoder until `end`. Recording errors are stored
//! in the parent and surface at `finish`.

use std::sync::Arc;

use crate::{
    command::{
        timestamp_target, usable_buffer, ColorAttachmentRecord, Command, CommandEncoder,
        ComputeCommand, DepthStencilRecord, EncoderEntry, EncoderState, RenderCommand,
        RenderPassRecord, TimestampRecord,
    },
    device::DeviceShared,
    handle::{resource_handle, DeviceChild, HubEntry, Registry},
    hub::Hub,
    pipeline::RenderPipelineEntry,
    resource::TextureViewEntry,
    track::Tracker,
    AnyKey, BindGroup, BindGroupKey, Buffer, BufferUsages, Color, CommandEncoderKey,
    ComputePassDesc, ComputePassKey, ComputePipeline, ComputePipelineKey, IndexFormat,
    PassTimestampWrites, PipelineLayoutKey, QuerySet, QuerySetKey, QueryType, RenderBundle,
    RenderPassDesc, RenderPassKey, RenderPipeline, RenderPipelineKey, TexelAspects,
    TextureAspect, TextureFormat, TextureUsages, TextureView, VertexStepMode,
};

//=============================================================================
// Shared State
//=============================================================================

/// Formats and sample count a render pipeline or bundle must agree with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AttachmentSignature {
    /// Trailing empty slots are trimmed.
    pub colors: Vec<Option<TextureFormat>>,
    pub depth_stencil: Option<TextureFormat>,
    pub sample_count: u32,
}

impl AttachmentSignature {
    pub fn new(
        colors: impl IntoIterator<Item = Option<TextureFormat>>,
        depth_stencil: Option<TextureFormat>,
        sample_count: u32,
    ) -> Self {
        let mut colors: Vec<_> = colors.into_iter().collect();
        while let Some(None) = colors.last() {
            colors.pop();
        }
        Self {
            colors,
            depth_stencil,
            sample_count,
        }
    }
}

/// Borrowed device state needed to validate and record one command.
pub(crate) struct Recorder<'a> {
    pub shared: &'a Arc<DeviceShared>,
    pub hub: &'a mut Hub,
    pub tracker: &'a mut Tracker,
}

#[derive(Clone, Copy)]
pub(crate) struct RenderTarget<'a> {
    pub signature: &'a AttachmentSignature,
    pub depth_read_only: bool,
    pub stencil_read_only: bool,
}

/// Checks that the bound groups satisfy a pipeline layout.
fn check_bind_groups(
    hub: &Hub,
    layout: PipelineLayoutKey,
    bound: &[Option<BindGroupKey>],
) -> Result<(), String> {
    let layout = hub
        .pipeline_layouts
        .get(layout)
        .map_err(|e| format!("pipeline layout: {}", e))?;
    for (index, &expected) in layout.groups.iter().enumerate() {
        let group = bound
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| format!("bind group {} is not set", index))?;
        let group = hub
            .bind_groups
            .get(group)
            .map_err(|e| format!("bind group {}: {}", index, e))?;
        if group.layout == expected {
            continue;
        }
        match (
            hub.bind_group_layouts.get(group.layout),
            hub.bind_group_layouts.get(expected),
        ) {
            (Ok(a), Ok(b)) if a.is_compatible(b) => {}
            _ => {
                return Err(format!(
                    "bind group {} is incompatible with the pipeline layout",
                    index
                ))
            }
        }
    }
    Ok(())
}

fn set_bind_group(
    rec: &mut Recorder,
    slots: &mut Vec<Option<BindGroupKey>>,
    index: u32,
    group: Option<&BindGroup>,
    offsets: &[u32],
) -> Result<Option<BindGroupKey>, String> {
    if index >= rec.shared.limits.max_bind_groups {
        return Err(format!(
            "index {} exceeds the limit of {} bind groups",
            index, rec.shared.limits.max_bind_groups
        ));
    }
    let key = match group {
        None if offsets.is_empty() => None,
        None => return Err("dynamic offsets given without a bind group".to_string()),
        Some(group) => {
            let name = rec.hub.bind_groups.describe(group.key);
            if !group.same_device(rec.shared) {
                return Err(format!("{} belongs to another device", name));
            }
            let entry = rec
                .hub
                .bind_groups
                .get(group.key)
                .map_err(|e| format!("{}: {}", name, e))?;
            entry.check_dynamic_offsets(offsets)?;
            let resources = entry.resources.clone();
            rec.tracker.track(rec.hub, group.key);
            rec.tracker.track_all(rec.hub, resources);
            Some(group.key)
        }
    };
    let index = index as usize;
    if slots.len() <= index {
        slots.resize(index + 1, None);
    }
    slots[index] = key;
    Ok(key)
}

fn pass_timestamps(
    shared: &Arc<DeviceShared>,
    hub: &Hub,
    writes: &PassTimestampWrites,
) -> Result<TimestampRecord, String> {
    let indices: Vec<u32> = writes
        .beginning_of_pass_write_index
        .into_iter()
        .chain(writes.end_of_pass_write_index)
        .collect();
    match indices[..] {
        [] => return Err("timestamp writes name no query index".to_string()),
        [a, b] if a == b => return Err(format!("query index {} is written twice", a)),
        _ => {}
    }
    let query_set = timestamp_target(shared, hub, writes.query_set, &indices)?;
    Ok(TimestampRecord {
        query_set,
        beginning_of_pass: writes.beginning_of_pass_write_index,
        end_of_pass: writes.end_of_pass_write_index,
    })
}

/// Render state common to render passes and render bundles.
#[derive(Default)]
pub(crate) struct RenderState {
    pipeline: Option<RenderPipelineKey>,
    bind_groups: Vec<Option<BindGroupKey>>,
    /// Bound size per vertex buffer slot.
    vertex_buffers: Vec<Option<u64>>,
    index_buffer: Option<(IndexFormat, u64)>,
    pub debug_depth: u32,
}

impl RenderState {
    /// Forgets bound pipeline and resources, as executing bundles does.
    pub fn reset(&mut self) {
        *self = Self {
            debug_depth: self.debug_depth,
            ..Self::default()
        };
    }

    fn ready<'h>(&self, hub: &'h Hub) -> Result<&'h RenderPipelineEntry, String> {
        let key = self.pipeline.ok_or("no pipeline is set")?;
        let pipeline = hub
            .render_pipelines
            .get(key)
            .map_err(|e| format!("pipeline: {}", e))?;
        check_bind_groups(hub, pipeline.layout, &self.bind_groups)?;
        Ok(pipeline)
    }

    fn check_vertex_buffers(
        &self,
        pipeline: &RenderPipelineEntry,
        vertex_end: u64,
        instance_end: u64,
    ) -> Result<(), String> {
        for (slot, &(stride, step_mode)) in pipeline.vertex_buffers.iter().enumerate() {
            let bound = self
                .vertex_buffers
                .get(slot)
                .copied()
                .flatten()
                .ok_or_else(|| format!("vertex buffer slot {} is not set", slot))?;
            let end = match step_mode {
                VertexStepMode::Vertex => vertex_end,
                VertexStepMode::Instance => instance_end,
            };
            if stride * end > bound {
                return Err(format!(
                    "vertex buffer slot {} holds {} bytes, {} are read",
                    slot,
                    bound,
                    stride * end
                ));
            }
        }
        Ok(())
    }

    pub fn set_pipeline(
        &mut self,
        rec: &mut Recorder,
        target: RenderTarget,
        pipeline: &RenderPipeline,
    ) -> Result<RenderCommand, String> {
        let name = rec.hub.render_pipelines.describe(pipeline.key);
        if !pipeline.same_device(rec.shared) {
            return Err(format!("{} belongs to another device", name));
        }
        let entry = rec
            .hub
            .render_pipelines
            .get(pipeline.key)
            .map_err(|e| format!("{}: {}", name, e))?;
        let signature = AttachmentSignature::new(
            entry.color_formats.iter().copied(),
            entry.depth_stencil_format,
            entry.sample_count,
        );
        if signature != *target.signature {
            return Err(format!(
                "{} renders to {:?}, the targets are {:?}",
                name, signature, target.signature
            ));
        }
        if entry.writes_depth && target.depth_read_only {
            return Err(format!("{} writes depth to a read-only target", name));
        }
        if entry.writes_stencil && target.stencil_read_only {
            return Err(format!("{} writes stencil to a read-only target", name));
        }
        rec.tracker.track(rec.hub, pipeline.key);
        self.pipeline = Some(pipeline.key);
        Ok(RenderCommand::SetPipeline(pipeline.key))
    }

    pub fn set_bind_group(
        &mut self,
        rec: &mut Recorder,
        index: u32,
        group: Option<&BindGroup>,
        offsets: &[u32],
    ) -> Result<RenderCommand, String> {
        let group = set_bind_group(rec, &mut self.bind_groups, index, group, offsets)?;
        Ok(RenderCommand::SetBindGroup {
            index,
            group,
            offsets: offsets.to_vec(),
        })
    }

    pub fn set_vertex_buffer(
        &mut self,
        rec: &mut Recorder,
        slot: u32,
        buffer: &Buffer,
        offset: u64,
        size: Option<u64>,
    ) -> Result<RenderCommand, String> {
        if slot >= rec.shared.limits.max_vertex_buffers {
            return Err(format!(
                "slot {} exceeds the limit of {} vertex buffers",
                slot, rec.shared.limits.max_vertex_buffers
            ));
        }
        let entry = usable_buffer(rec.shared, rec.hub, buffer, BufferUsages::VERTEX)?;
        let size = size.unwrap_or(entry.size.saturating_sub(offset));
        if offset % 4 != 0 {
            return Err(format!("offset {} is not a multiple of 4", offset));
        }
        entry.check_range(offset, size)?;
        rec.tracker.track(rec.hub, buffer.key);
        let slot_index = slot as usize;
        if self.vertex_buffers.len() <= slot_index {
            self.vertex_buffers.resize(slot_index + 1, None);
        }
        self.vertex_buffers[slot_index] = Some(size);
        Ok(RenderCommand::SetVertexBuffer {
            slot,
            buffer: buffer.key,
            offset,
            size,
        })
    }

    pub fn set_index_buffer(
        &mut self,
        rec: &mut Recorder,
        buffer: &Buffer,
        format: IndexFormat,
        offset: u64,
        size: Option<u64>,
    ) -> Result<RenderCommand, String> {
        let entry = usable_buffer(rec.shared, rec.hub, buffer, BufferUsages::INDEX)?;
        let size = size.unwrap_or(entry.size.saturating_sub(offset));
        if offset % format.size() != 0 {
            return Err(format!(
                "offset {} is not a multiple of the {:?} index size",
                offset, format
            ));
        }
        entry.check_range(offset, size)?;
        rec.tracker.track(rec.hub, buffer.key);
        self.index_buffer = Some((format, size));
        Ok(RenderCommand::SetIndexBuffer {
            buffer: buffer.key,
            format,
            offset,
            size,
        })
    }

    pub fn draw(
        &mut self,
        rec: &mut Recorder,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<RenderCommand, String> {
        if !rec.shared.skips_validation() {
            let pipeline = self.ready(rec.hub)?;
            self.check_vertex_buffers(
                pipeline,
                first_vertex as u64 + vertex_count as u64,
                first_instance as u64 + instance_count as u64,
            )?;
        }
        Ok(RenderCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    pub fn draw_indexed(
        &mut self,
        rec: &mut Recorder,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> Result<RenderCommand, String> {
        if !rec.shared.skips_validation() {
            let pipeline = self.ready(rec.hub)?;
            let (format, size) = self.index_buffer.ok_or("no index buffer is set")?;
            let end = (first_index as u64 + index_count as u64) * format.size();
            if end > size {
                return Err(format!(
                    "indices up to byte {} are read from an index buffer of {} bytes",
                    end, size
                ));
            }
            if let Some(strip) = pipeline.strip_index_format {
                if strip != format {
                    return Err(format!(
                        "pipeline strip index format {:?} differs from the bound {:?}",
                        strip, format
                    ));
                }
            }
            self.check_vertex_buffers(pipeline, 0, first_instance as u64 + instance_count as u64)?;
        }
        Ok(RenderCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        })
    }

    fn indirect(
        &mut self,
        rec: &mut Recorder,
        buffer: &Buffer,
        offset: u64,
        indexed: bool,
    ) -> Result<(), String> {
        let entry = usable_buffer(rec.shared, rec.hub, buffer, BufferUsages::INDIRECT)?;
        if offset % 4 != 0 {
            return Err(format!("indirect offset {} is not a multiple of 4", offset));
        }
        entry.check_range(offset, if indexed { 20 } else { 16 })?;
        if !rec.shared.skips_validation() {
            self.ready(rec.hub)?;
            if indexed && self.index_buffer.is_none() {
                return Err("no index buffer is set".to_string());
            }
        }
        rec.tracker.track(rec.hub, buffer.key);
        Ok(())
    }

    pub fn draw_indirect(
        &mut self,
        rec: &mut Recorder,
        buffer: &Buffer,
        offset: u64,
    ) -> Result<RenderCommand, String> {
        self.indirect(rec, buffer, offset, false)?;
        Ok(RenderCommand::DrawIndirect {
            buffer: buffer.key,
            offset,
        })
    }

    pub fn draw_indexed_indirect(
        &mut self,
        rec: &mut Recorder,
        buffer: &Buffer,
        offset: u64,
    ) -> Result<RenderCommand, String> {
        self.indirect(rec, buffer, offset, true)?;
        Ok(RenderCommand::DrawIndexedIndirect {
            buffer: buffer.key,
            offset,
        })
    }

    pub fn push_debug_group(&mut self, label: &str) -> RenderCommand {
        self.debug_depth += 1;
        RenderCommand::PushDebugGroup(label.to_string())
    }

    pub fn pop_debug_group(&mut self, skip_validation: bool) -> Result<Option<RenderCommand>, String> {
        match self.debug_depth {
            0 if skip_validation => Ok(None),
            0 => Err("no debug group is open".to_string()),
            _ => {
                self.debug_depth -= 1;
                Ok(Some(RenderCommand::PopDebugGroup))
            }
        }
    }
}

//=============================================================================
// Hub Entries
//=============================================================================

pub(crate) trait PassEntry: HubEntry {
    /// `None` when the pass failed to begin.
    fn parent(&self) -> Option<CommandEncoderKey>;
    fn is_ended(&self) -> bool;
}

pub(crate) struct ComputePassEntry {
    parent: Option<CommandEncoderKey>,
    ended: bool,
    pipeline: Option<ComputePipelineKey>,
    bind_groups: Vec<Option<BindGroupKey>>,
    debug_depth: u32,
}

impl HubEntry for ComputePassEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.parent.map(AnyKey::from).into_iter().collect()
    }
}

impl PassEntry for ComputePassEntry {
    fn parent(&self) -> Option<CommandEncoderKey> {
        self.parent
    }
    fn is_ended(&self) -> bool {
        self.ended
    }
}

pub(crate) struct RenderPassEntry {
    parent: Option<CommandEncoderKey>,
    ended: bool,
    signature: AttachmentSignature,
    depth_read_only: bool,
    stencil_read_only: bool,
    /// Width and height shared by all attachments.
    extent: (u32, u32),
    occlusion_query_set: Option<(QuerySetKey, u32)>,
    occlusion_active: Option<u32>,
    occlusion_used: Vec<u32>,
    state: RenderState,
}

impl HubEntry for RenderPassEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.parent.map(AnyKey::from).into_iter().collect()
    }
}

impl PassEntry for RenderPassEntry {
    fn parent(&self) -> Option<CommandEncoderKey> {
        self.parent
    }
    fn is_ended(&self) -> bool {
        self.ended
    }
}

impl RenderPassEntry {
    fn target(&self) -> RenderTarget<'_> {
        RenderTarget {
            signature: &self.signature,
            depth_read_only: self.depth_read_only,
            stencil_read_only: self.stencil_read_only,
        }
    }
}

resource_handle!(ComputePassEncoder, ComputePassKey, compute_passes);
resource_handle!(RenderPassEncoder, RenderPassKey, render_passes);

fn compute_passes(hub: &mut Hub) -> &mut Registry<ComputePassKey, ComputePassEntry> {
    &mut hub.compute_passes
}

fn render_passes(hub: &mut Hub) -> &mut Registry<RenderPassKey, RenderPassEntry> {
    &mut hub.render_passes
}

/// Runs `f` against an open pass and its parent encoder.
fn record_pass<K: slotmap::Key, T: PassEntry>(
    shared: &Arc<DeviceShared>,
    op: &str,
    key: K,
    registry: fn(&mut Hub) -> &mut Registry<K, T>,
    f: impl FnOnce(&mut Hub, &mut T, &mut EncoderEntry) -> Result<(), String>,
) {
    if shared.is_lost() {
        return;
    }
    let mut guard = shared.hub.write().unwrap();
    let hub = &mut *guard;
    let name = registry(hub).describe(key);
    let mut pass = match registry(hub).take(key) {
        Ok(pass) => pass,
        Err(e) => {
            drop(guard);
            shared.validation(format!("{} on {}: {}", op, name, e));
            return;
        }
    };
    let direct = match pass.parent() {
        _ if pass.is_ended() => Some("the pass has already ended"),
        None => None,
        Some(parent) => match hub.command_encoders.take(parent) {
            Ok(mut encoder) => {
                let direct = if encoder.state == EncoderState::Finished {
                    Some("the parent encoder is finished")
                } else {
                    if let Err(message) = f(hub, &mut pass, &mut encoder) {
                        encoder.defer(format!("{} on {}: {}", op, name, message));
                    }
                    None
                };
                hub.command_encoders.restore(parent, encoder);
                direct
            }
            Err(_) => Some("the parent encoder is unavailable"),
        },
    };
    registry(hub).restore(key, pass);
    drop(guard);
    if let Some(message) = direct {
        shared.validation(format!("{} on {}: {}", op, name, message));
    }
}

//=============================================================================
// Beginning Passes
//=============================================================================

fn attachment_view<'h>(
    shared: &Arc<DeviceShared>,
    hub: &'h Hub,
    view: &TextureView,
) -> Result<&'h TextureViewEntry, String> {
    let name = hub.texture_views.describe(view.key);
    if !view.same_device(shared) {
        return Err(format!("{} belongs to another device", name));
    }
    let entry = hub
        .texture_views
        .get(view.key)
        .map_err(|e| format!("{}: {}", name, e))?;
    if !entry.usage.contains(TextureUsages::RENDER_ATTACHMENT) {
        return Err(format!("{} lacks RENDER_ATTACHMENT usage", name));
    }
    if entry.mip_level_count != 1 || entry.array_layer_count != 1 {
        return Err(format!("{} must view a single mip level and layer", name));
    }
    if entry.aspect != TextureAspect::All {
        return Err(format!("{} must view every aspect of its texture", name));
    }
    Ok(entry)
}

/// Size and sample count every attachment of a pass must share.
#[derive(Default)]
struct SharedShape {
    shape: Option<(u32, u32, u32)>,
}

impl SharedShape {
    fn check(&mut self, view: &TextureViewEntry) -> Result<(), String> {
        let shape = (view.extent.width, view.extent.height, view.sample_count);
        match self.shape {
            None => {
                self.shape = Some(shape);
                Ok(())
            }
            Some(expected) if expected == shape => Ok(()),
            Some(expected) => Err(format!(
                "attachment of {}x{} with {} samples differs from {}x{} with {} samples",
                shape.0, shape.1, shape.2, expected.0, expected.1, expected.2
            )),
        }
    }
}

struct RenderPassSetup {
    record: RenderPassRecord,
    entry: RenderPassEntry,
    keys: Vec<AnyKey>,
}

fn setup_render_pass(
    shared: &Arc<DeviceShared>,
    hub: &Hub,
    desc: &RenderPassDesc,
) -> Result<RenderPassSetup, String> {
    let limits = &shared.limits;
    if desc.color_attachments.len() > limits.max_color_attachments as usize {
        return Err(format!(
            "{} color attachments exceed the limit of {}",
            desc.color_attachments.len(),
            limits.max_color_attachments
        ));
    }
    let mut shape = SharedShape::default();
    let mut keys: Vec<AnyKey> = Vec::new();
    let mut colors = Vec::new();
    let mut color_records = Vec::new();
    for (index, attachment) in desc.color_attachments.iter().enumerate() {
        let Some(attachment) = attachment else {
            colors.push(None);
            color_records.push(None);
            continue;
        };
        let view = attachment_view(shared, hub, attachment.view)?;
        if view.format.is_depth_stencil() || !view.format.is_renderable() {
            return Err(format!(
                "color attachment {}: {:?} is not a renderable color format",
                index, view.format
            ));
        }
        shape.check(view)?;
        if let Some(resolve) = attachment.resolve_target {
            let target = attachment_view(shared, hub, resolve)?;
            if view.sample_count == 1 {
                return Err(format!(
                    "color attachment {}: resolve target given for a single-sampled view",
                    index
                ));
            }
            if target.sample_count != 1
                || target.format != view.format
                || target.extent.width != view.extent.width
                || target.extent.height != view.extent.height
            {
                return Err(format!(
                    "color attachment {}: resolve target must be single-sampled with the same format and size",
                    index
                ));
            }
            keys.push(resolve.key.into());
        }
        keys.push(attachment.view.key.into());
        colors.push(Some(view.format));
        color_records.push(Some(ColorAttachmentRecord {
            view: attachment.view.key,
            resolve_target: attachment.resolve_target.map(|target| target.key),
            ops: attachment.ops,
        }));
    }

    let mut depth_stencil = None;
    let mut depth_read_only = true;
    let mut stencil_read_only = true;
    if let Some(ref attachment) = desc.depth_stencil_attachment {
        let view = attachment_view(shared, hub, attachment.view)?;
        let aspects = view.format.aspects();
        if !view.format.is_depth_stencil() {
            return Err(format!(
                "depth-stencil attachment format {:?} has no depth or stencil aspect",
                view.format
            ));
        }
        if attachment.depth_ops.is_some() && !aspects.contains(TexelAspects::DEPTH) {
            return Err(format!("{:?} has no depth aspect to load or store", view.format));
        }
        if attachment.stencil_ops.is_some() && !aspects.contains(TexelAspects::STENCIL) {
            return Err(format!(
                "{:?} has no stencil aspect to load or store",
                view.format
            ));
        }
        shape.check(view)?;
        depth_read_only = attachment.depth_ops.is_none();
        stencil_read_only = attachment.stencil_ops.is_none();
        keys.push(attachment.view.key.into());
        depth_stencil = Some((view.format, DepthStencilRecord {
            view: attachment.view.key,
            depth_ops: attachment.depth_ops,
            stencil_ops: attachment.stencil_ops,
        }));
    }

    let (depth_stencil, depth_stencil_record) = match depth_stencil {
        Some((format, record)) => (Some(format), Some(record)),
        None => (None, None),
    };
    let Some((width, height, sample_count)) = shape.shape else {
        return Err("a render pass needs at least one attachment".to_string());
    };
    let views: Vec<_> = keys.iter().collect();
    if (1..views.len()).any(|i| views[..i].contains(&views[i])) {
        return Err("a view is used as more than one attachment".to_string());
    }

    let occlusion_query_set = match desc.occlusion_query_set {
        Some(query_set) => {
            let name = hub.query_sets.describe(query_set.key);
            if !query_set.same_device(shared) {
                return Err(format!("{} belongs to another device", name));
            }
            let entry = hub
                .query_sets
                .get(query_set.key)
                .map_err(|e| format!("{}: {}", name, e))?;
            if entry.ty != QueryType::Occlusion {
                return Err(format!("{} does not hold occlusion queries", name));
            }
            keys.push(query_set.key.into());
            Some((query_set.key, entry.count))
        }
        None => None,
    };
    let timestamp_writes = desc
        .timestamp_writes
        .as_ref()
        .map(|writes| pass_timestamps(shared, hub, writes))
        .transpose()?;
    if let Some(ref writes) = timestamp_writes {
        keys.push(writes.query_set.into());
    }

    Ok(RenderPassSetup {
        record: RenderPassRecord {
            label: desc.label.to_string(),
            color_attachments: color_records,
            depth_stencil_attachment: depth_stencil_record,
            occlusion_query_set: occlusion_query_set.map(|(key, _)| key),
            timestamp_writes,
        },
        entry: RenderPassEntry {
            parent: None,
            ended: false,
            signature: AttachmentSignature::new(colors, depth_stencil, sample_count),
            depth_read_only,
            stencil_read_only,
            extent: (width, height),
            occlusion_query_set,
            occlusion_active: None,
            occlusion_used: Vec::new(),
            state: RenderState::default(),
        },
        keys,
    })
}

impl CommandEncoder {
    /// Opens a compute pass. The encoder is locked until the pass ends.
    pub fn begin_compute_pass(&self, desc: &ComputePassDesc) -> ComputePassEncoder {
        let shared = &self.shared;
        let mut guard = shared.hub.write().unwrap();
        let hub = &mut *guard;
        let name = hub.command_encoders.describe(self.key);
        let mut parent = None;
        let mut direct = None;
        match hub.command_encoders.take(self.key) {
            Err(e) => direct = Some(e.to_string()),
            Ok(mut encoder) => {
                match encoder.state {
                    EncoderState::Finished => direct = Some("the encoder is finished".to_string()),
                    EncoderState::Locked => {
                        encoder.defer(format!("begin_compute_pass: a pass is already open on {}", name))
                    }
                    EncoderState::Recording => {
                        let timestamp_writes = desc
                            .timestamp_writes
                            .as_ref()
                            .map(|writes| pass_timestamps(shared, hub, writes))
                            .transpose()
                            .unwrap_or_else(|message| {
                                encoder.defer(format!("begin_compute_pass: {}", message));
                                None
                            });
                        if let Some(ref writes) = timestamp_writes {
                            encoder.tracker.track(hub, writes.query_set);
                        }
                        encoder.commands.push(Command::BeginComputePass {
                            label: desc.label.to_string(),
                            timestamp_writes,
                        });
                        encoder.state = EncoderState::Locked;
                        parent = Some(self.key);
                    }
                }
                hub.command_encoders.restore(self.key, encoder);
            }
        }
        if parent.is_some() {
            hub.command_encoders.retain(self.key);
        }
        let key = hub.compute_passes.insert(
            desc.label,
            ComputePassEntry {
                parent,
                ended: false,
                pipeline: None,
                bind_groups: Vec::new(),
                debug_depth: 0,
            },
        );
        drop(guard);
        if let Some(message) = direct {
            shared.validation(format!("begin_compute_pass on {}: {}", name, message));
        }
        ComputePassEncoder::from_parts(shared, key)
    }

    /// Opens a render pass over the given attachments. The encoder is locked
    /// until the pass ends.
    pub fn begin_render_pass(&self, desc: &RenderPassDesc) -> RenderPassEncoder {
        let shared = &self.shared;
        let mut guard = shared.hub.write().unwrap();
        let hub = &mut *guard;
        let name = hub.command_encoders.describe(self.key);
        let mut direct = None;
        let mut pass = None;
        let mut began = false;
        match hub.command_encoders.take(self.key) {
            Err(e) => direct = Some(e.to_string()),
            Ok(mut encoder) => {
                match encoder.state {
                    EncoderState::Finished => direct = Some("the encoder is finished".to_string()),
                    EncoderState::Locked => {
                        encoder.defer(format!("begin_render_pass: a pass is already open on {}", name))
                    }
                    EncoderState::Recording => {
                        match setup_render_pass(shared, hub, desc) {
                            Ok(setup) => {
                                encoder.tracker.track_all(hub, setup.keys);
                                encoder.commands.push(Command::BeginRenderPass(setup.record));
                                pass = Some(setup.entry);
                            }
                            Err(message) => {
                                encoder.defer(format!("begin_render_pass: {}", message));
                                encoder.commands.push(Command::BeginRenderPass(RenderPassRecord {
                                    label: desc.label.to_string(),
                                    color_attachments: Vec::new(),
                                    depth_stencil_attachment: None,
                                    occlusion_query_set: None,
                                    timestamp_writes: None,
                                }));
                            }
                        }
                        encoder.state = EncoderState::Locked;
                        began = true;
                    }
                }
                hub.command_encoders.restore(self.key, encoder);
            }
        }
        let mut entry = pass.unwrap_or_else(|| RenderPassEntry {
            parent: None,
            ended: false,
            signature: AttachmentSignature::new(std::iter::empty(), None, 1),
            depth_read_only: true,
            stencil_read_only: true,
            extent: (0, 0),
            occlusion_query_set: None,
            occlusion_active: None,
            occlusion_used: Vec::new(),
            state: RenderState::default(),
        });
        if began {
            entry.parent = Some(self.key);
            hub.command_encoders.retain(self.key);
        }
        let key = hub.render_passes.insert(desc.label, entry);
        drop(guard);
        if let Some(message) = direct {
            shared.validation(format!("begin_render_pass on {}: {}", name, message));
        }
        RenderPassEncoder::from_parts(shared, key)
    }
}

//=============================================================================
// Compute Passes
//=============================================================================

impl ComputePassEncoder {
    fn record(
        &self,
        op: &str,
        f: impl FnOnce(&mut Recorder, &mut ComputePassEntry) -> Result<Option<ComputeCommand>, String>,
    ) {
        let shared = &self.shared;
        record_pass(shared, op, self.key, compute_passes, |hub, pass, encoder| {
            let mut rec = Recorder {
                shared,
                hub,
                tracker: &mut encoder.tracker,
            };
            if let Some(command) = f(&mut rec, pass)? {
                encoder.commands.push(Command::Compute(command));
            }
            Ok(())
        })
    }

    pub fn set_pipeline(&self, pipeline: &ComputePipeline) {
        self.record("set_pipeline", |rec, pass| {
            let name = rec.hub.compute_pipelines.describe(pipeline.key);
            if !pipeline.same_device(rec.shared) {
                return Err(format!("{} belongs to another device", name));
            }
            rec.hub
                .compute_pipelines
                .get(pipeline.key)
                .map_err(|e| format!("{}: {}", name, e))?;
            rec.tracker.track(rec.hub, pipeline.key);
            pass.pipeline = Some(pipeline.key);
            Ok(Some(ComputeCommand::SetPipeline(pipeline.key)))
        })
    }

    pub fn set_bind_group(&self, index: u32, group: Option<&BindGroup>, offsets: &[u32]) {
        self.record("set_bind_group", |rec, pass| {
            let group = set_bind_group(rec, &mut pass.bind_groups, index, group, offsets)?;
            Ok(Some(ComputeCommand::SetBindGroup {
                index,
                group,
                offsets: offsets.to_vec(),
            }))
        })
    }

    fn check_ready(rec: &Recorder, pass: &ComputePassEntry) -> Result<(), String> {
        if rec.shared.skips_validation() {
            return Ok(());
        }
        let key = pass.pipeline.ok_or("no pipeline is set")?;
        let pipeline = rec
            .hub
            .compute_pipelines
            .get(key)
            .map_err(|e| format!("pipeline: {}", e))?;
        check_bind_groups(rec.hub, pipeline.layout, &pass.bind_groups)
    }

    pub fn dispatch_workgroups(&self, x: u32, y: u32, z: u32) {
        self.record("dispatch_workgroups", |rec, pass| {
            let max = rec.shared.limits.max_compute_workgroups_per_dimension;
            if x > max || y > max || z > max {
                return Err(format!(
                    "workgroup count {:?} exceeds the limit of {} per dimension",
                    [x, y, z],
                    max
                ));
            }
            Self::check_ready(rec, pass)?;
            Ok(Some(ComputeCommand::DispatchWorkgroups([x, y, z])))
        })
    }

    pub fn dispatch_workgroups_indirect(&self, buffer: &Buffer, offset: u64) {
        self.record("dispatch_workgroups_indirect", |rec, pass| {
            let entry = usable_buffer(rec.shared, rec.hub, buffer, BufferUsages::INDIRECT)?;
            if offset % 4 != 0 {
                return Err(format!("indirect offset {} is not a multiple of 4", offset));
            }
            entry.check_range(offset, 12)?;
            Self::check_ready(rec, pass)?;
            rec.tracker.track(rec.hub, buffer.key);
            Ok(Some(ComputeCommand::DispatchWorkgroupsIndirect {
                buffer: buffer.key,
                offset,
            }))
        })
    }

    pub fn write_timestamp(&self, query_set: &QuerySet, index: u32) {
        self.record("write_timestamp", |rec, _| {
            let key = timestamp_target(rec.shared, rec.hub, query_set, &[index])?;
            rec.tracker.track(rec.hub, key);
            Ok(Some(ComputeCommand::WriteTimestamp {
                query_set: key,
                index,
            }))
        })
    }

    pub fn push_debug_group(&self, label: &str) {
        self.record("push_debug_group", |_, pass| {
            pass.debug_depth += 1;
            Ok(Some(ComputeCommand::PushDebugGroup(label.to_string())))
        })
    }

    pub fn pop_debug_group(&self) {
        self.record("pop_debug_group", |rec, pass| match pass.debug_depth {
            0 if rec.shared.skips_validation() => Ok(None),
            0 => Err("no debug group is open".to_string()),
            _ => {
                pass.debug_depth -= 1;
                Ok(Some(ComputeCommand::PopDebugGroup))
            }
        })
    }

    pub fn insert_debug_marker(&self, label: &str) {
        self.record("insert_debug_marker", |_, _| {
            Ok(Some(ComputeCommand::InsertDebugMarker(label.to_string())))
        })
    }

    /// Closes the pass and unlocks the parent encoder.
    pub fn end(&self) {
        let skip = self.shared.skips_validation();
        record_pass(&self.shared, "end", self.key, compute_passes, |_, pass, encoder| {
            pass.ended = true;
            encoder.state = EncoderState::Recording;
            encoder.commands.push(Command::EndComputePass);
            if pass.debug_depth != 0 && !skip {
                return Err(format!("{} debug groups are still open", pass.debug_depth));
            }
            Ok(())
        })
    }
}

//=============================================================================
// Render Passes
//=============================================================================

impl RenderPassEncoder {
    fn record(
        &self,
        op: &str,
        f: impl FnOnce(&mut Recorder, &mut RenderPassEntry) -> Result<Option<RenderCommand>, String>,
    ) {
        let shared = &self.shared;
        record_pass(shared, op, self.key, render_passes, |hub, pass, encoder| {
            let mut rec = Recorder {
                shared,
                hub,
                tracker: &mut encoder.tracker,
            };
            if let Some(command) = f(&mut rec, pass)? {
                encoder.commands.push(Command::Render(command));
            }
            Ok(())
        })
    }

    pub fn set_pipeline(&self, pipeline: &RenderPipeline) {
        self.record("set_pipeline", |rec, pass| {
            let target = RenderTarget {
                signature: &pass.signature,
                depth_read_only: pass.depth_read_only,
                stencil_read_only: pass.stencil_read_only,
            };
            pass.state.set_pipeline(rec, target, pipeline).map(Some)
        })
    }

    pub fn set_bind_group(&self, index: u32, group: Option<&BindGroup>, offsets: &[u32]) {
        self.record("set_bind_group", |rec, pass| {
            pass.state.set_bind_group(rec, index, group, offsets).map(Some)
        })
    }

    pub fn set_vertex_buffer(&self, slot: u32, buffer: &Buffer, offset: u64, size: Option<u64>) {
        self.record("set_vertex_buffer", |rec, pass| {
            pass.state
                .set_vertex_buffer(rec, slot, buffer, offset, size)
                .map(Some)
        })
    }

    pub fn set_index_buffer(
        &self,
        buffer: &Buffer,
        format: IndexFormat,
        offset: u64,
        size: Option<u64>,
    ) {
        self.record("set_index_buffer", |rec, pass| {
            pass.state
                .set_index_buffer(rec, buffer, format, offset, size)
                .map(Some)
        })
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record("draw", |rec, pass| {
            pass.state
                .draw(rec, vertex_count, instance_count, first_vertex, first_instance)
                .map(Some)
        })
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.record("draw_indexed", |rec, pass| {
            pass.state
                .draw_indexed(
                    rec,
                    index_count,
                    instance_count,
                    first_index,
                    base_vertex,
                    first_instance,
                )
                .map(Some)
        })
    }

    pub fn draw_indirect(&self, buffer: &Buffer, offset: u64) {
        self.record("draw_indirect", |rec, pass| {
            pass.state.draw_indirect(rec, buffer, offset).map(Some)
        })
    }

    pub fn draw_indexed_indirect(&self, buffer: &Buffer, offset: u64) {
        self.record("draw_indexed_indirect", |rec, pass| {
            pass.state.draw_indexed_indirect(rec, buffer, offset).map(Some)
        })
    }

    pub fn set_viewport(&self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        self.record("set_viewport", |_, pass| {
            let (w, h) = pass.extent;
            if ![x, y, width, height, min_depth, max_depth]
                .iter()
                .all(|value| value.is_finite())
            {
                return Err("viewport values must be finite".to_string());
            }
            if x < 0.0
                || y < 0.0
                || width < 0.0
                || height < 0.0
                || x + width > w as f32
                || y + height > h as f32
            {
                return Err(format!(
                    "viewport {}x{} at ({}, {}) leaves the {}x{} attachments",
                    width, height, x, y, w, h
                ));
            }
            if !(0.0..=1.0).contains(&min_depth)
                || !(0.0..=1.0).contains(&max_depth)
                || min_depth > max_depth
            {
                return Err(format!("depth range {}..{} is invalid", min_depth, max_depth));
            }
            Ok(Some(RenderCommand::SetViewport {
                x,
                y,
                width,
                height,
                min_depth,
                max_depth,
            }))
        })
    }

    pub fn set_scissor_rect(&self, x: u32, y: u32, width: u32, height: u32) {
        self.record("set_scissor_rect", |_, pass| {
            let (w, h) = pass.extent;
            let fits = |origin: u32, size: u32, limit: u32| {
                origin.checked_add(size).is_some_and(|end| end <= limit)
            };
            if !fits(x, width, w) || !fits(y, height, h) {
                return Err(format!(
                    "scissor {}x{} at ({}, {}) leaves the {}x{} attachments",
                    width, height, x, y, w, h
                ));
            }
            Ok(Some(RenderCommand::SetScissorRect {
                x,
                y,
                width,
                height,
            }))
        })
    }

    pub fn set_blend_constant(&self, color: Color) {
        self.record("set_blend_constant", |_, _| {
            Ok(Some(RenderCommand::SetBlendConstant(color)))
        })
    }

    pub fn set_stencil_reference(&self, reference: u32) {
        self.record("set_stencil_reference", |_, _| {
            Ok(Some(RenderCommand::SetStencilReference(reference)))
        })
    }

    pub fn begin_occlusion_query(&self, index: u32) {
        self.record("begin_occlusion_query", |_, pass| {
            let (_, count) = pass
                .occlusion_query_set
                .ok_or("the pass has no occlusion query set")?;
            if index >= count {
                return Err(format!(
                    "query index {} is out of range for {} queries",
                    index, count
                ));
            }
            if let Some(active) = pass.occlusion_active {
                return Err(format!("occlusion query {} is still active", active));
            }
            if pass.occlusion_used.contains(&index) {
                return Err(format!("occlusion query {} was already used in this pass", index));
            }
            pass.occlusion_active = Some(index);
            pass.occlusion_used.push(index);
            Ok(Some(RenderCommand::BeginOcclusionQuery(index)))
        })
    }

    pub fn end_occlusion_query(&self) {
        self.record("end_occlusion_query", |_, pass| {
            pass.occlusion_active
                .take()
                .ok_or("no occlusion query is active")?;
            Ok(Some(RenderCommand::EndOcclusionQuery))
        })
    }

    pub fn write_timestamp(&self, query_set: &QuerySet, index: u32) {
        self.record("write_timestamp", |rec, _| {
            let key = timestamp_target(rec.shared, rec.hub, query_set, &[index])?;
            rec.tracker.track(rec.hub, key);
            Ok(Some(RenderCommand::WriteTimestamp {
                query_set: key,
                index,
            }))
        })
    }

    pub fn push_debug_group(&self, label: &str) {
        self.record("push_debug_group", |_, pass| {
            Ok(Some(pass.state.push_debug_group(label)))
        })
    }

    pub fn pop_debug_group(&self) {
        self.record("pop_debug_group", |rec, pass| {
            pass.state.pop_debug_group(rec.shared.skips_validation())
        })
    }

    pub fn insert_debug_marker(&self, label: &str) {
        self.record("insert_debug_marker", |_, _| {
            Ok(Some(RenderCommand::InsertDebugMarker(label.to_string())))
        })
    }

    /// Replays pre-recorded bundles. Pipeline, bind groups and buffers must
    /// be set again afterwards.
    pub fn execute_bundles(&self, bundles: &[&RenderBundle]) {
        let shared = &self.shared;
        record_pass(shared, "execute_bundles", self.key, render_passes, |hub, pass, encoder| {
            let target = pass.target();
            let mut replays = Vec::with_capacity(bundles.len());
            for bundle in bundles.iter() {
                let name = hub.render_bundles.describe(bundle.key);
                if !bundle.same_device(shared) {
                    return Err(format!("{} belongs to another device", name));
                }
                let entry = hub
                    .render_bundles
                    .get(bundle.key)
                    .map_err(|e| format!("{}: {}", name, e))?;
                if entry.signature != *target.signature {
                    return Err(format!(
                        "{} renders to {:?}, the pass targets are {:?}",
                        name, entry.signature, target.signature
                    ));
                }
                if (target.depth_read_only && !entry.depth_read_only)
                    || (target.stencil_read_only && !entry.stencil_read_only)
                {
                    return Err(format!(
                        "{} may write to a read-only depth-stencil attachment",
                        name
                    ));
                }
                replays.push((
                    bundle.key,
                    Arc::clone(&entry.commands),
                    entry.tracker.keys().collect::<Vec<_>>(),
                ));
            }
            for (key, commands, keys) in replays {
                encoder.tracker.track(hub, key);
                encoder.tracker.track_all(hub, keys);
                encoder
                    .commands
                    .push(Command::Render(RenderCommand::ExecuteBundle {
                        bundle: key,
                        commands,
                    }));
            }
            pass.state.reset();
            Ok(())
        })
    }

    /// Closes the pass and unlocks the parent encoder.
    pub fn end(&self) {
        let skip = self.shared.skips_validation();
        record_pass(&self.shared, "end", self.key, render_passes, |_, pass, encoder| {
            pass.ended = true;
            encoder.state = EncoderState::Recording;
            encoder.commands.push(Command::EndRenderPass);
            if let Some(active) = pass.occlusion_active {
                return Err(format!("occlusion query {} is still active", active));
            }
            if pass.state.debug_depth != 0 && !skip {
                return Err(format!(
                    "{} debug groups are still open",
                    pass.state.debug_depth
                ));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_trailing_empty_slots() {
        let a = AttachmentSignature::new(
            [Some(TextureFormat::Rgba8Unorm), None, None],
            None,
            1,
        );
        let b = AttachmentSignature::new([Some(TextureFormat::Rgba8Unorm)], None, 1);
        assert_eq!(a, b);
        let c = AttachmentSignature::new([None, Some(TextureFormat::Rgba8Unorm)], None, 1);
        assert_ne!(a, c);
    }

    #[test]
    fn open_pass_keeps_its_encoder_alive() {
        let device = crate::Device::from_shared(crate::device::tests::test_shared());
        let encoder = device.create_command_encoder(&Default::default());
        let encoder_key = encoder.key();
        let pass = encoder.begin_compute_pass(&Default::default());
        drop(encoder);
        pass.insert_debug_marker("orphaned");
        pass.end();
        {
            let hub = device.shared.hub.read().unwrap();
            let entry = hub.command_encoders.peek(encoder_key).expect("encoder entry");
            assert_eq!(entry.state, EncoderState::Recording);
            assert!(entry.error.is_none());
            assert_eq!(
                entry.commands.last(),
                Some(&Command::EndComputePass)
            );
        }
        drop(pass);
        assert!(device.shared.hub.read().unwrap().command_encoders.peek(encoder_key).is_none());
    }

    #[test]
    fn reset_keeps_debug_depth() {
        let mut state = RenderState::default();
        state.push_debug_group("outer");
        state.index_buffer = Some((IndexFormat::Uint16, 12));
        state.reset();
        assert_eq!(state.debug_depth, 1);
        assert!(state.index_buffer.is_none());
        assert_eq!(state.pop_debug_group(false), Ok(Some(RenderCommand::PopDebugGroup)));
        assert!(state.pop_debug_group(false).is_err());
        assert_eq!(state.pop_debug_group(true), Ok(None));
    }
}
