//! Command encoders, command buffers and queue submission.

use std::sync::Arc;

use crate::{
    device::{DeviceShared, Queue},
    handle::{resource_handle, DeviceChild, HubEntry},
    hub::Hub,
    resource::{resolve_linear_layout, BufferEntry, MapState, TextureEntry},
    timeline,
    track::Tracker,
    AnyKey, Buffer, BufferKey, BufferUsages, Color, CommandBufferDesc, CommandEncoderDesc,
    ComputePipelineKey, Extent3d, HandleError, ImageCopyBuffer, ImageCopyTexture, IndexFormat,
    Operations, Origin3d, QuerySet, QuerySetKey, RenderBundleKey, RenderPipelineKey,
    Texture, TextureAspect, TextureDataLayout, TextureKey, TextureUsages, TextureViewKey,
    BindGroupKey, COPY_BUFFER_ALIGNMENT, COPY_BYTES_PER_ROW_ALIGNMENT,
    QUERY_RESOLVE_BUFFER_ALIGNMENT, QUERY_SIZE,
};

//=============================================================================
// Recorded Commands
//=============================================================================

/// Buffer side of a buffer/texture copy, with the layout fully resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub buffer: BufferKey,
    pub layout: TextureDataLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureCopy {
    pub texture: TextureKey,
    pub mip_level: u32,
    pub origin: Origin3d,
    pub aspect: TextureAspect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampRecord {
    pub query_set: QuerySetKey,
    pub beginning_of_pass: Option<u32>,
    pub end_of_pass: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorAttachmentRecord {
    pub view: TextureViewKey,
    pub resolve_target: Option<TextureViewKey>,
    pub ops: Operations<Color>,
}

/// `None` ops leave that aspect read-only.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilRecord {
    pub view: TextureViewKey,
    pub depth_ops: Option<Operations<f32>>,
    pub stencil_ops: Option<Operations<u32>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderPassRecord {
    pub label: String,
    pub color_attachments: Vec<Option<ColorAttachmentRecord>>,
    pub depth_stencil_attachment: Option<DepthStencilRecord>,
    pub occlusion_query_set: Option<QuerySetKey>,
    pub timestamp_writes: Option<TimestampRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputeCommand {
    SetPipeline(ComputePipelineKey),
    SetBindGroup {
        index: u32,
        group: Option<BindGroupKey>,
        offsets: Vec<u32>,
    },
    DispatchWorkgroups([u32; 3]),
    DispatchWorkgroupsIndirect {
        buffer: BufferKey,
        offset: u64,
    },
    WriteTimestamp {
        query_set: QuerySetKey,
        index: u32,
    },
    PushDebugGroup(String),
    PopDebugGroup,
    InsertDebugMarker(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RenderCommand {
    SetPipeline(RenderPipelineKey),
    SetBindGroup {
        index: u32,
        group: Option<BindGroupKey>,
        offsets: Vec<u32>,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferKey,
        offset: u64,
        size: u64,
    },
    SetIndexBuffer {
        buffer: BufferKey,
        format: IndexFormat,
        offset: u64,
        size: u64,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: BufferKey,
        offset: u64,
    },
    DrawIndexedIndirect {
        buffer: BufferKey,
        offset: u64,
    },
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        min_depth: f32,
        max_depth: f32,
    },
    SetScissorRect {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    SetBlendConstant(Color),
    SetStencilReference(u32),
    BeginOcclusionQuery(u32),
    EndOcclusionQuery,
    WriteTimestamp {
        query_set: QuerySetKey,
        index: u32,
    },
    PushDebugGroup(String),
    PopDebugGroup,
    InsertDebugMarker(String),
    /// Commands of a render bundle, shared with every other replay.
    ExecuteBundle {
        bundle: RenderBundleKey,
        commands: Arc<[RenderCommand]>,
    },
}

impl RenderCommand {
    pub fn is_draw(&self) -> bool {
        matches!(
            *self,
            Self::Draw { .. }
                | Self::DrawIndexed { .. }
                | Self::DrawIndirect { .. }
                | Self::DrawIndexedIndirect { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    CopyBufferToBuffer {
        src: BufferKey,
        src_offset: u64,
        dst: BufferKey,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferCopy,
        dst: TextureCopy,
        size: Extent3d,
    },
    CopyTextureToBuffer {
        src: TextureCopy,
        dst: BufferCopy,
        size: Extent3d,
    },
    CopyTextureToTexture {
        src: TextureCopy,
        dst: TextureCopy,
        size: Extent3d,
    },
    ClearBuffer {
        buffer: BufferKey,
        offset: u64,
        size: u64,
    },
    WriteBuffer {
        buffer: BufferKey,
        offset: u64,
        data: Vec<u8>,
    },
    WriteTimestamp {
        query_set: QuerySetKey,
        index: u32,
    },
    ResolveQuerySet {
        query_set: QuerySetKey,
        first_query: u32,
        query_count: u32,
        destination: BufferKey,
        destination_offset: u64,
    },
    PushDebugGroup(String),
    PopDebugGroup,
    InsertDebugMarker(String),
    BeginComputePass {
        label: String,
        timestamp_writes: Option<TimestampRecord>,
    },
    Compute(ComputeCommand),
    EndComputePass,
    BeginRenderPass(RenderPassRecord),
    Render(RenderCommand),
    EndRenderPass,
}

//=============================================================================
// Hub Entries
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EncoderState {
    Recording,
    /// A pass is open. Only the pass may record.
    Locked,
    Finished,
}

pub(crate) struct EncoderEntry {
    pub state: EncoderState,
    pub commands: Vec<Command>,
    pub tracker: Tracker,
    /// First validation error hit while recording, reported at `finish`.
    pub error: Option<String>,
    pub debug_depth: u32,
}

impl HubEntry for EncoderEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.tracker.keys().collect()
    }
}

impl EncoderEntry {
    pub fn defer(&mut self, message: String) {
        if self.error.is_none() {
            log::debug!("Encoder error deferred to finish: {}", message);
            self.error = Some(message);
        }
    }
}

pub(crate) struct CommandBufferEntry {
    pub commands: Vec<Command>,
    pub tracker: Tracker,
    pub submitted: bool,
}

impl HubEntry for CommandBufferEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.tracker.keys().collect()
    }
}

resource_handle!(
    /// Records commands into a single command buffer.
    CommandEncoder,
    CommandEncoderKey,
    command_encoders
);
resource_handle!(CommandBuffer, CommandBufferKey, command_buffers);

impl CommandBuffer {
    /// Copy of the recorded command list.
    pub fn commands(&self) -> Result<Vec<Command>, HandleError> {
        if self.shared.is_lost() {
            return Err(HandleError::DeviceLost);
        }
        let hub = self.shared.hub.read().unwrap();
        hub.command_buffers
            .get(self.key)
            .map(|entry| entry.commands.clone())
    }
}

//=============================================================================
// Shared Checks
//=============================================================================

/// Looks up a buffer used by a command and checks its usage.
pub(crate) fn usable_buffer<'h>(
    shared: &Arc<DeviceShared>,
    hub: &'h Hub,
    buffer: &Buffer,
    usage: BufferUsages,
) -> Result<&'h BufferEntry, String> {
    let name = hub.buffers.describe(buffer.key);
    if !buffer.same_device(shared) {
        return Err(format!("{} belongs to another device", name));
    }
    let entry = hub
        .buffers
        .get(buffer.key)
        .map_err(|e| format!("{}: {}", name, e))?;
    if !entry.usage.contains(usage) {
        return Err(format!(
            "{} usage {:?} lacks {:?}",
            name, entry.usage, usage
        ));
    }
    Ok(entry)
}

pub(crate) fn usable_texture<'h>(
    shared: &Arc<DeviceShared>,
    hub: &'h Hub,
    texture: &Texture,
    usage: TextureUsages,
) -> Result<&'h TextureEntry, String> {
    let name = hub.textures.describe(texture.key);
    if !texture.same_device(shared) {
        return Err(format!("{} belongs to another device", name));
    }
    let entry = hub
        .textures
        .get(texture.key)
        .map_err(|e| format!("{}: {}", name, e))?;
    if !entry.usage.contains(usage) {
        return Err(format!(
            "{} usage {:?} lacks {:?}",
            name, entry.usage, usage
        ));
    }
    Ok(entry)
}

/// Checks a timestamp write target and returns its key.
pub(crate) fn timestamp_target(
    shared: &Arc<DeviceShared>,
    hub: &Hub,
    query_set: &QuerySet,
    indices: &[u32],
) -> Result<QuerySetKey, String> {
    let name = hub.query_sets.describe(query_set.key);
    if !query_set.same_device(shared) {
        return Err(format!("{} belongs to another device", name));
    }
    let entry = hub
        .query_sets
        .get(query_set.key)
        .map_err(|e| format!("{}: {}", name, e))?;
    if entry.ty != crate::QueryType::Timestamp {
        return Err(format!("{} does not hold timestamp queries", name));
    }
    if let Some(&index) = indices.iter().find(|&&index| index >= entry.count) {
        return Err(format!(
            "query index {} is out of range for {} of {} queries",
            index, name, entry.count
        ));
    }
    Ok(query_set.key)
}

fn check_copy_alignment(values: &[u64]) -> Result<(), String> {
    match values.iter().find(|&&value| value % COPY_BUFFER_ALIGNMENT != 0) {
        Some(value) => Err(format!(
            "{} is not a multiple of {}",
            value, COPY_BUFFER_ALIGNMENT
        )),
        None => Ok(()),
    }
}

fn texture_copy(destination: &ImageCopyTexture) -> TextureCopy {
    TextureCopy {
        texture: destination.texture.key,
        mip_level: destination.mip_level,
        origin: destination.origin,
        aspect: destination.aspect,
    }
}

/// Validates the buffer and texture sides of a buffer/texture copy.
fn buffer_texture_copy(
    shared: &Arc<DeviceShared>,
    hub: &Hub,
    buffer: &ImageCopyBuffer,
    buffer_usage: BufferUsages,
    texture: &ImageCopyTexture,
    texture_usage: TextureUsages,
    size: Extent3d,
) -> Result<(BufferCopy, TextureCopy), String> {
    let buffer_entry = usable_buffer(shared, hub, buffer.buffer, buffer_usage)?;
    let texture_entry = usable_texture(shared, hub, texture.texture, texture_usage)?;
    texture_entry.check_copy_region(texture.mip_level, texture.origin, size, texture.aspect)?;
    let linear = resolve_linear_layout(
        texture_entry.format,
        size,
        &buffer.layout,
        buffer_entry.size,
        COPY_BYTES_PER_ROW_ALIGNMENT,
    )?;
    Ok((
        BufferCopy {
            buffer: buffer.buffer.key,
            layout: TextureDataLayout {
                offset: linear.offset,
                bytes_per_row: Some(linear.bytes_per_row as u32),
                rows_per_image: Some(linear.rows_per_image as u32),
            },
        },
        texture_copy(texture),
    ))
}

//=============================================================================
// Encoding
//=============================================================================

impl CommandEncoder {
    /// Runs `f` against the encoder if it is recording. Errors are deferred
    /// to `finish`; use of a finished encoder is reported right away.
    fn record(
        &self,
        op: &str,
        f: impl FnOnce(&Arc<DeviceShared>, &mut Hub, &mut EncoderEntry) -> Result<(), String>,
    ) {
        if self.shared.is_lost() {
            return;
        }
        let mut hub = self.shared.hub.write().unwrap();
        let name = hub.command_encoders.describe(self.key);
        let mut entry = match hub.command_encoders.take(self.key) {
            Ok(entry) => entry,
            Err(e) => {
                drop(hub);
                self.shared.validation(format!("{} on {}: {}", op, name, e));
                return;
            }
        };
        let finished = match entry.state {
            EncoderState::Finished => true,
            EncoderState::Locked => {
                entry.defer(format!("{}: a pass is open on {}", op, name));
                false
            }
            EncoderState::Recording => {
                if let Err(message) = f(&self.shared, &mut hub, &mut entry) {
                    entry.defer(format!("{}: {}", op, message));
                }
                false
            }
        };
        hub.command_encoders.restore(self.key, entry);
        drop(hub);
        if finished {
            self.shared
                .validation(format!("{} on {}: the encoder is finished", op, name));
        }
    }

    pub fn copy_buffer_to_buffer(
        &self,
        source: &Buffer,
        source_offset: u64,
        destination: &Buffer,
        destination_offset: u64,
        size: u64,
    ) {
        self.record("copy_buffer_to_buffer", |shared, hub, entry| {
            let src = usable_buffer(shared, hub, source, BufferUsages::COPY_SRC)?;
            let dst = usable_buffer(shared, hub, destination, BufferUsages::COPY_DST)?;
            if source.key == destination.key {
                return Err("source and destination are the same buffer".to_string());
            }
            check_copy_alignment(&[source_offset, destination_offset, size])?;
            src.check_range(source_offset, size)?;
            dst.check_range(destination_offset, size)?;
            entry.tracker.track(hub, source.key);
            entry.tracker.track(hub, destination.key);
            entry.commands.push(Command::CopyBufferToBuffer {
                src: source.key,
                src_offset: source_offset,
                dst: destination.key,
                dst_offset: destination_offset,
                size,
            });
            Ok(())
        })
    }

    pub fn copy_buffer_to_texture(
        &self,
        source: &ImageCopyBuffer,
        destination: &ImageCopyTexture,
        size: Extent3d,
    ) {
        self.record("copy_buffer_to_texture", |shared, hub, entry| {
            let (src, dst) = buffer_texture_copy(
                shared,
                hub,
                source,
                BufferUsages::COPY_SRC,
                destination,
                TextureUsages::COPY_DST,
                size,
            )?;
            entry.tracker.track(hub, src.buffer);
            entry.tracker.track(hub, dst.texture);
            entry
                .commands
                .push(Command::CopyBufferToTexture { src, dst, size });
            Ok(())
        })
    }

    pub fn copy_texture_to_buffer(
        &self,
        source: &ImageCopyTexture,
        destination: &ImageCopyBuffer,
        size: Extent3d,
    ) {
        self.record("copy_texture_to_buffer", |shared, hub, entry| {
            let (dst, src) = buffer_texture_copy(
                shared,
                hub,
                destination,
                BufferUsages::COPY_DST,
                source,
                TextureUsages::COPY_SRC,
                size,
            )?;
            entry.tracker.track(hub, src.texture);
            entry.tracker.track(hub, dst.buffer);
            entry
                .commands
                .push(Command::CopyTextureToBuffer { src, dst, size });
            Ok(())
        })
    }

    pub fn copy_texture_to_texture(
        &self,
        source: &ImageCopyTexture,
        destination: &ImageCopyTexture,
        size: Extent3d,
    ) {
        self.record("copy_texture_to_texture", |shared, hub, entry| {
            let src = usable_texture(shared, hub, source.texture, TextureUsages::COPY_SRC)?;
            let dst = usable_texture(shared, hub, destination.texture, TextureUsages::COPY_DST)?;
            src.check_copy_region(source.mip_level, source.origin, size, source.aspect)?;
            dst.check_copy_region(
                destination.mip_level,
                destination.origin,
                size,
                destination.aspect,
            )?;
            if !src.format.is_view_compatible(dst.format) {
                return Err(format!(
                    "formats {:?} and {:?} are not copy-compatible",
                    src.format, dst.format
                ));
            }
            let layers = |origin: Origin3d| origin.z..origin.z + size.depth_or_array_layers;
            let (a, b) = (layers(source.origin), layers(destination.origin));
            if source.texture.key == destination.texture.key
                && source.mip_level == destination.mip_level
                && a.start < b.end
                && b.start < a.end
            {
                return Err("source and destination subresources overlap".to_string());
            }
            entry.tracker.track(hub, source.texture.key);
            entry.tracker.track(hub, destination.texture.key);
            entry.commands.push(Command::CopyTextureToTexture {
                src: texture_copy(source),
                dst: texture_copy(destination),
                size,
            });
            Ok(())
        })
    }

    /// Zeroes `offset..offset + size`, or up to the end when `size` is `None`.
    pub fn clear_buffer(&self, buffer: &Buffer, offset: u64, size: Option<u64>) {
        self.record("clear_buffer", |shared, hub, entry| {
            let target = usable_buffer(shared, hub, buffer, BufferUsages::COPY_DST)?;
            let size = size.unwrap_or(target.size.saturating_sub(offset));
            check_copy_alignment(&[offset, size])?;
            target.check_range(offset, size)?;
            entry.tracker.track(hub, buffer.key);
            entry.commands.push(Command::ClearBuffer {
                buffer: buffer.key,
                offset,
                size,
            });
            Ok(())
        })
    }

    /// Records an inline upload, executed in order with the other commands.
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) {
        self.record("write_buffer", |shared, hub, entry| {
            let target = usable_buffer(shared, hub, buffer, BufferUsages::COPY_DST)?;
            check_copy_alignment(&[offset, data.len() as u64])?;
            target.check_range(offset, data.len() as u64)?;
            entry.tracker.track(hub, buffer.key);
            entry.commands.push(Command::WriteBuffer {
                buffer: buffer.key,
                offset,
                data: data.to_vec(),
            });
            Ok(())
        })
    }

    pub fn write_timestamp(&self, query_set: &QuerySet, index: u32) {
        self.record("write_timestamp", |shared, hub, entry| {
            let key = timestamp_target(shared, hub, query_set, &[index])?;
            entry.tracker.track(hub, key);
            entry
                .commands
                .push(Command::WriteTimestamp { query_set: key, index });
            Ok(())
        })
    }

    /// Copies query results as little-endian `u64`s into `destination`.
    pub fn resolve_query_set(
        &self,
        query_set: &QuerySet,
        first_query: u32,
        query_count: u32,
        destination: &Buffer,
        destination_offset: u64,
    ) {
        self.record("resolve_query_set", |shared, hub, entry| {
            let name = hub.query_sets.describe(query_set.key);
            if !query_set.same_device(shared) {
                return Err(format!("{} belongs to another device", name));
            }
            let set = hub
                .query_sets
                .get(query_set.key)
                .map_err(|e| format!("{}: {}", name, e))?;
            if first_query as u64 + query_count as u64 > set.count as u64 {
                return Err(format!(
                    "queries {}..{} exceed the {} queries of {}",
                    first_query,
                    first_query as u64 + query_count as u64,
                    set.count,
                    name
                ));
            }
            let dst = usable_buffer(shared, hub, destination, BufferUsages::QUERY_RESOLVE)?;
            if destination_offset % QUERY_RESOLVE_BUFFER_ALIGNMENT != 0 {
                return Err(format!(
                    "destination offset {} is not a multiple of {}",
                    destination_offset, QUERY_RESOLVE_BUFFER_ALIGNMENT
                ));
            }
            dst.check_range(destination_offset, query_count as u64 * QUERY_SIZE)?;
            entry.tracker.track(hub, query_set.key);
            entry.tracker.track(hub, destination.key);
            entry.commands.push(Command::ResolveQuerySet {
                query_set: query_set.key,
                first_query,
                query_count,
                destination: destination.key,
                destination_offset,
            });
            Ok(())
        })
    }

    pub fn push_debug_group(&self, label: &str) {
        self.record("push_debug_group", |_, _, entry| {
            entry.debug_depth += 1;
            entry.commands.push(Command::PushDebugGroup(label.to_string()));
            Ok(())
        })
    }

    pub fn pop_debug_group(&self) {
        self.record("pop_debug_group", |shared, _, entry| {
            if entry.debug_depth == 0 {
                if shared.skips_validation() {
                    return Ok(());
                }
                return Err("no debug group is open".to_string());
            }
            entry.debug_depth -= 1;
            entry.commands.push(Command::PopDebugGroup);
            Ok(())
        })
    }

    pub fn insert_debug_marker(&self, label: &str) {
        self.record("insert_debug_marker", |_, _, entry| {
            entry
                .commands
                .push(Command::InsertDebugMarker(label.to_string()));
            Ok(())
        })
    }

    /// Marks the encoder invalid with `message`, as a failed command would.
    pub fn inject_validation_error(&self, message: &str) {
        self.record("inject_validation_error", |_, _, _| Err(message.to_string()))
    }

    /// Ends recording. A second call, or an encoder holding a recording
    /// error, yields an invalid command buffer.
    pub fn finish(&self, desc: &CommandBufferDesc) -> CommandBuffer {
        let shared = &self.shared;
        let mut hub = shared.hub.write().unwrap();
        let name = hub.command_encoders.describe(self.key);
        let skip = shared.skips_validation();
        let (outcome, leftover) = match hub.command_encoders.get_mut(self.key) {
            Err(e) => (Err(e.to_string()), Vec::new()),
            Ok(entry) => {
                let previous = std::mem::replace(&mut entry.state, EncoderState::Finished);
                let outcome = match previous {
                    EncoderState::Finished => Err("finish was already called".to_string()),
                    EncoderState::Locked => Err("a pass is still open".to_string()),
                    EncoderState::Recording => {
                        if entry.debug_depth != 0 && !skip {
                            entry.defer(format!(
                                "{} debug groups are still open",
                                entry.debug_depth
                            ));
                        }
                        match entry.error.take() {
                            Some(message) => Err(message),
                            None => Ok((
                                std::mem::take(&mut entry.commands),
                                std::mem::take(&mut entry.tracker),
                            )),
                        }
                    }
                };
                entry.commands.clear();
                (outcome, entry.tracker.take())
            }
        };
        for key in leftover {
            hub.release(key);
        }
        let (key, error) = match outcome {
            Ok((commands, tracker)) => {
                log::debug!(
                    "Finished {} with {} commands, {} tracked objects",
                    name,
                    commands.len(),
                    tracker.len()
                );
                let entry = CommandBufferEntry {
                    commands,
                    tracker,
                    submitted: false,
                };
                (hub.command_buffers.insert(desc.label, entry), None)
            }
            Err(message) => (hub.command_buffers.insert_error(desc.label), Some(message)),
        };
        drop(hub);
        if let Some(message) = error {
            shared.validation(format!("finish on {}: {}", name, message));
        }
        CommandBuffer::from_parts(shared, key)
    }
}

#[hidden_trait::expose]
impl crate::traits::CommandDevice for crate::Device {
    fn create_command_encoder(&self, desc: &CommandEncoderDesc) -> CommandEncoder {
        let key = self.shared.hub.write().unwrap().command_encoders.insert(
            desc.label,
            EncoderEntry {
                state: EncoderState::Recording,
                commands: Vec::new(),
                tracker: Tracker::default(),
                error: None,
                debug_depth: 0,
            },
        );
        CommandEncoder::from_parts(&self.shared, key)
    }

    fn create_render_bundle_encoder(
        &self,
        desc: &crate::RenderBundleEncoderDesc,
    ) -> crate::RenderBundleEncoder {
        crate::bundle::create_render_bundle_encoder(&self.shared, desc)
    }
}

//=============================================================================
// Submission
//=============================================================================

/// Checks that every object a command buffer uses is still usable.
fn check_tracked(hub: &Hub, tracker: &Tracker) -> Result<(), String> {
    for key in tracker.keys() {
        let problem = match key {
            AnyKey::Buffer(buffer) => match hub.buffers.get(buffer) {
                Ok(entry) if entry.destroyed => Some("is destroyed"),
                Ok(entry) if entry.map != MapState::Unmapped => Some("is mapped or pending a map"),
                Ok(_) => None,
                Err(_) => Some("is invalid"),
            },
            AnyKey::Texture(texture) => match hub.textures.get(texture) {
                Ok(entry) if entry.destroyed => Some("is destroyed"),
                Ok(_) => None,
                Err(_) => Some("is invalid"),
            },
            AnyKey::TextureView(view) => match hub
                .texture_views
                .get(view)
                .and_then(|view| hub.textures.get(view.texture))
            {
                Ok(texture) if texture.destroyed => Some("views a destroyed texture"),
                Ok(_) => None,
                Err(_) => Some("is invalid"),
            },
            AnyKey::QuerySet(query_set) => match hub.query_sets.get(query_set) {
                Ok(entry) if entry.destroyed => Some("is destroyed"),
                Ok(_) => None,
                Err(_) => Some("is invalid"),
            },
            AnyKey::ExternalTexture(external) => match hub.external_textures.get(external) {
                Ok(entry) if entry.destroyed => Some("is destroyed"),
                Ok(_) => None,
                Err(_) => Some("is invalid"),
            },
            _ => None,
        };
        if let Some(problem) = problem {
            return Err(format!("{} {}", hub.describe(key), problem));
        }
    }
    Ok(())
}

impl Queue {
    /// Executes the command buffers in order. If any of them is unusable the
    /// whole submission is rejected; every given buffer is consumed either way.
    #[profiling::function]
    pub fn submit(&self, command_buffers: &[&CommandBuffer]) {
        if self.shared.is_lost() {
            return;
        }
        let shared = &self.shared;
        let mut hub = shared.hub.write().unwrap();

        let mut problem = None;
        for (index, command_buffer) in command_buffers.iter().enumerate() {
            let name = hub.command_buffers.describe(command_buffer.key);
            let checked = if !command_buffer.same_device(shared) {
                Err("belongs to another device".to_string())
            } else {
                match hub.command_buffers.get(command_buffer.key) {
                    Ok(entry) if entry.submitted => Err("was already submitted".to_string()),
                    Ok(entry) => check_tracked(&hub, &entry.tracker),
                    Err(e) => Err(e.to_string()),
                }
            };
            if let Err(message) = checked {
                problem = Some(format!("command buffer {} {}: {}", index, name, message));
                break;
            }
            if command_buffers[..index]
                .iter()
                .any(|other| other.key == command_buffer.key)
            {
                problem = Some(format!("command buffer {} {} is given twice", index, name));
                break;
            }
        }

        let mut batches = Vec::with_capacity(command_buffers.len());
        for command_buffer in command_buffers.iter() {
            if !command_buffer.same_device(shared) {
                continue;
            }
            if let Ok(entry) = hub.command_buffers.get_mut(command_buffer.key) {
                if !entry.submitted {
                    entry.submitted = true;
                    batches.push((
                        std::mem::take(&mut entry.commands),
                        entry.tracker.take(),
                    ));
                }
            }
        }

        if problem.is_none() {
            for (commands, _) in batches.iter() {
                timeline::execute(shared, &mut hub, commands);
            }
        }
        for (_, keys) in batches {
            for key in keys {
                hub.release(key);
            }
        }
        drop(hub);

        match problem {
            Some(message) => shared.validation(format!("submit: {}", message)),
            None => {
                let serial = shared.advance_serial();
                log::debug!(
                    "Submitted {} command buffers as serial {}",
                    command_buffers.len(),
                    serial
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_draws_count_as_draws() {
        assert!(RenderCommand::Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
        .is_draw());
        assert!(!RenderCommand::SetStencilReference(1).is_draw());
    }

    #[test]
    fn copy_alignment() {
        assert!(check_copy_alignment(&[0, 4, 256]).is_ok());
        assert!(check_copy_alignment(&[0, 6]).is_err());
    }
}
