//! Applies submitted commands to buffer, texture and query storage.
//!
//! Shaders are not run: dispatches and draws only matter for queries.
//! Everything else (copies, clears, load and store ops, resolves,
//! timestamps) changes memory the way a GPU would.

use std::sync::Arc;

use crate::{
    command::{BufferCopy, Command, ComputeCommand, RenderCommand, RenderPassRecord, TextureCopy},
    device::DeviceShared,
    hub::Hub,
    resource::{LinearLayout, TextureEntry},
    BufferKey, Color, Extent3d, LoadOp, LoggingType, Origin3d, QuerySetKey, StoreOp,
    TextureFormat, TextureViewKey, Toggles,
};

//=============================================================================
// Texel Copies
//=============================================================================

/// Byte offsets of every block row a copy touches, as (linear, texture) pairs.
fn row_spans(
    entry: &TextureEntry,
    mip_level: u32,
    origin: Origin3d,
    size: Extent3d,
    linear: LinearLayout,
) -> (usize, Vec<(usize, usize)>) {
    let block = entry.format.block();
    let layout = entry.mip_layout(mip_level);
    let row_bytes = (size.width / block.width) as u64 * block.bytes as u64;
    let rows = (size.height / block.height) as u64;
    let x = (origin.x / block.width) as u64 * block.bytes as u64;
    let y = (origin.y / block.height) as u64;
    let mut spans = Vec::with_capacity((rows * size.depth_or_array_layers as u64) as usize);
    for z in 0..size.depth_or_array_layers as u64 {
        for row in 0..rows {
            let linear_offset =
                linear.offset + z * linear.bytes_per_row * linear.rows_per_image + row * linear.bytes_per_row;
            let texture_offset =
                (origin.z as u64 + z) * layout.image_pitch() + (y + row) * layout.row_pitch + x;
            spans.push((linear_offset as usize, texture_offset as usize));
        }
    }
    (row_bytes as usize, spans)
}

/// Writes `size` texels from linear `data` into a mip level. The region
/// must already be validated.
pub(crate) fn copy_linear_to_texture(
    data: &[u8],
    linear: LinearLayout,
    entry: &mut TextureEntry,
    mip_level: u32,
    origin: Origin3d,
    size: Extent3d,
) {
    let (row_bytes, spans) = row_spans(entry, mip_level, origin, size, linear);
    let mip = entry.mip_mut(mip_level);
    for (src, dst) in spans {
        mip[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
    }
}

/// Reads `size` texels of a mip level into linear `data`.
pub(crate) fn copy_texture_to_linear(
    entry: &TextureEntry,
    mip_level: u32,
    origin: Origin3d,
    size: Extent3d,
    data: &mut [u8],
    linear: LinearLayout,
) {
    let (row_bytes, spans) = row_spans(entry, mip_level, origin, size, linear);
    let mip = entry.mip(mip_level);
    for (dst, src) in spans {
        let out = &mut data[dst..dst + row_bytes];
        match mip {
            Some(mip) => out.copy_from_slice(&mip[src..src + row_bytes]),
            None => out.fill(0),
        }
    }
}

fn linear_of(copy: &BufferCopy) -> LinearLayout {
    LinearLayout {
        offset: copy.layout.offset,
        bytes_per_row: copy.layout.bytes_per_row.unwrap_or(0) as u64,
        rows_per_image: copy.layout.rows_per_image.unwrap_or(0) as u64,
    }
}

fn buffer_to_texture(hub: &mut Hub, src: &BufferCopy, dst: &TextureCopy, size: Extent3d) {
    let (Ok(buffer), Ok(texture)) = (hub.buffers.get(src.buffer), hub.textures.get_mut(dst.texture))
    else {
        return;
    };
    copy_linear_to_texture(&buffer.data, linear_of(src), texture, dst.mip_level, dst.origin, size);
}

fn texture_to_buffer(hub: &mut Hub, src: &TextureCopy, dst: &BufferCopy, size: Extent3d) {
    let (Ok(texture), Ok(buffer)) = (hub.textures.get(src.texture), hub.buffers.get_mut(dst.buffer))
    else {
        return;
    };
    copy_texture_to_linear(texture, src.mip_level, src.origin, size, &mut buffer.data, linear_of(dst));
}

fn texture_to_texture(hub: &mut Hub, src: &TextureCopy, dst: &TextureCopy, size: Extent3d) {
    let Ok(source) = hub.textures.get(src.texture) else {
        return;
    };
    let block = source.format.block();
    let linear = LinearLayout {
        offset: 0,
        bytes_per_row: (size.width / block.width) as u64 * block.bytes as u64,
        rows_per_image: (size.height / block.height) as u64,
    };
    let mut staging =
        vec![0; (linear.bytes_per_row * linear.rows_per_image * size.depth_or_array_layers as u64) as usize];
    copy_texture_to_linear(source, src.mip_level, src.origin, size, &mut staging, linear);
    if let Ok(target) = hub.textures.get_mut(dst.texture) {
        copy_linear_to_texture(&staging, linear, target, dst.mip_level, dst.origin, size);
    }
}

//=============================================================================
// Buffers and Queries
//=============================================================================

fn buffer_range(hub: &mut Hub, key: BufferKey, offset: u64, size: u64) -> Option<&mut [u8]> {
    let entry = hub.buffers.get_mut(key).ok()?;
    entry
        .data
        .get_mut(offset as usize..offset.checked_add(size)? as usize)
}

fn copy_buffer(hub: &mut Hub, src: BufferKey, src_offset: u64, dst: BufferKey, dst_offset: u64, size: u64) {
    let Some(bytes) = hub
        .buffers
        .get(src)
        .ok()
        .and_then(|entry| entry.data.get(src_offset as usize..(src_offset + size) as usize))
        .map(<[u8]>::to_vec)
    else {
        return;
    };
    if let Some(target) = buffer_range(hub, dst, dst_offset, size) {
        target.copy_from_slice(&bytes);
    }
}

fn write_timestamp(shared: &DeviceShared, hub: &mut Hub, query_set: QuerySetKey, index: u32) {
    if let Ok(entry) = hub.query_sets.get_mut(query_set) {
        if let Some(value) = entry.values.get_mut(index as usize) {
            *value = shared.timestamp();
        }
    }
}

fn write_query(hub: &mut Hub, query_set: QuerySetKey, index: u32, value: u64) {
    if let Ok(entry) = hub.query_sets.get_mut(query_set) {
        if let Some(slot) = entry.values.get_mut(index as usize) {
            *slot = value;
        }
    }
}

fn resolve_query_set(
    hub: &mut Hub,
    query_set: QuerySetKey,
    first_query: u32,
    query_count: u32,
    destination: BufferKey,
    destination_offset: u64,
) {
    let Some(values) = hub.query_sets.get(query_set).ok().and_then(|entry| {
        entry
            .values
            .get(first_query as usize..(first_query + query_count) as usize)
            .map(<[u64]>::to_vec)
    }) else {
        return;
    };
    let bytes: &[u8] = bytemuck::cast_slice(&values);
    if let Some(target) = buffer_range(hub, destination, destination_offset, bytes.len() as u64) {
        target.copy_from_slice(bytes);
    }
}

//=============================================================================
// Attachments
//=============================================================================

fn unorm8(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn snorm8(value: f64) -> u8 {
    (value.clamp(-1.0, 1.0) * 127.0).round() as i8 as u8
}

fn srgb8(value: f64) -> u8 {
    let value = value.clamp(0.0, 1.0);
    let encoded = if value <= 0.0031308 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    };
    unorm8(encoded)
}

fn f16_bytes(value: f64) -> [u8; 2] {
    half::f16::from_f64(value).to_le_bytes()
}

/// Texel bytes of a clear color in the given format.
fn encode_color(format: TextureFormat, color: Color) -> Vec<u8> {
    use TextureFormat as Tf;
    let Color { r, g, b, a } = color;
    match format {
        Tf::R8Unorm => vec![unorm8(r)],
        Tf::R8Snorm => vec![snorm8(r)],
        Tf::R8Uint => vec![r as u8],
        Tf::R8Sint => vec![r as i8 as u8],
        Tf::R16Uint => (r as u16).to_le_bytes().to_vec(),
        Tf::R16Sint => (r as i16).to_le_bytes().to_vec(),
        Tf::R16Float => f16_bytes(r).to_vec(),
        Tf::Rg8Unorm => vec![unorm8(r), unorm8(g)],
        Tf::R32Float => (r as f32).to_le_bytes().to_vec(),
        Tf::R32Uint => (r as u32).to_le_bytes().to_vec(),
        Tf::R32Sint => (r as i32).to_le_bytes().to_vec(),
        Tf::Rg16Float => [f16_bytes(r), f16_bytes(g)].concat(),
        Tf::Rgba8Unorm => vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)],
        Tf::Rgba8UnormSrgb => vec![srgb8(r), srgb8(g), srgb8(b), unorm8(a)],
        Tf::Rgba8Snorm => vec![snorm8(r), snorm8(g), snorm8(b), snorm8(a)],
        Tf::Rgba8Uint => vec![r as u8, g as u8, b as u8, a as u8],
        Tf::Bgra8Unorm => vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)],
        Tf::Bgra8UnormSrgb => vec![srgb8(b), srgb8(g), srgb8(r), unorm8(a)],
        Tf::Rgb10a2Unorm => {
            let channel = |value: f64, max: f64| (value.clamp(0.0, 1.0) * max).round() as u32;
            let packed = channel(r, 1023.0)
                | channel(g, 1023.0) << 10
                | channel(b, 1023.0) << 20
                | channel(a, 3.0) << 30;
            packed.to_le_bytes().to_vec()
        }
        Tf::Rg32Float => [(r as f32).to_le_bytes(), (g as f32).to_le_bytes()].concat(),
        Tf::Rgba16Float => [f16_bytes(r), f16_bytes(g), f16_bytes(b), f16_bytes(a)].concat(),
        Tf::Rgba32Float => [r, g, b, a]
            .iter()
            .flat_map(|&value| (value as f32).to_le_bytes())
            .collect(),
        Tf::Rgba32Uint => [r, g, b, a]
            .iter()
            .flat_map(|&value| (value as u32).to_le_bytes())
            .collect(),
        _ => vec![0; format.block().bytes as usize],
    }
}

fn write_depth(format: TextureFormat, texel: &mut [u8], depth: f32) {
    let depth = depth.clamp(0.0, 1.0);
    match format {
        TextureFormat::Depth16Unorm => {
            texel[..2].copy_from_slice(&((depth * 65535.0).round() as u16).to_le_bytes())
        }
        TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8 => {
            let value = (depth as f64 * 16_777_215.0).round() as u32;
            texel[..3].copy_from_slice(&value.to_le_bytes()[..3]);
        }
        TextureFormat::Depth32Float | TextureFormat::Depth32FloatStencil8 => {
            texel[..4].copy_from_slice(&depth.to_le_bytes())
        }
        _ => {}
    }
}

fn write_stencil(format: TextureFormat, texel: &mut [u8], stencil: u32) {
    let index = match format {
        TextureFormat::Stencil8 => 0,
        TextureFormat::Depth24PlusStencil8 => 3,
        TextureFormat::Depth32FloatStencil8 => 4,
        _ => return,
    };
    texel[index] = stencil as u8;
}

/// Runs `f` on every texel of the subresource a view renders to.
fn for_each_texel(hub: &mut Hub, view: TextureViewKey, mut f: impl FnMut(TextureFormat, &mut [u8])) {
    let Ok(view) = hub.texture_views.get(view) else {
        return;
    };
    let (texture, mip_level, layer) = (view.texture, view.base_mip_level, view.base_array_layer);
    let Ok(entry) = hub.textures.get_mut(texture) else {
        return;
    };
    let format = entry.format;
    let texel_bytes = format.block().bytes as usize;
    let pitch = entry.mip_layout(mip_level).image_pitch() as usize;
    let start = layer as usize * pitch;
    let mip = entry.mip_mut(mip_level);
    if let Some(image) = mip.get_mut(start..start + pitch) {
        for texel in image.chunks_exact_mut(texel_bytes) {
            f(format, texel);
        }
    }
}

fn view_image(hub: &Hub, view: TextureViewKey) -> Option<Vec<u8>> {
    let view = hub.texture_views.get(view).ok()?;
    let entry = hub.textures.get(view.texture).ok()?;
    let pitch = entry.mip_layout(view.base_mip_level).image_pitch() as usize;
    let start = view.base_array_layer as usize * pitch;
    Some(match entry.mip(view.base_mip_level) {
        Some(mip) => mip.get(start..start + pitch)?.to_vec(),
        None => vec![0; pitch],
    })
}

fn begin_render_pass(shared: &DeviceShared, hub: &mut Hub, record: &RenderPassRecord) {
    for attachment in record.color_attachments.iter().flatten() {
        if let LoadOp::Clear(color) = attachment.ops.load {
            let Ok(view) = hub.texture_views.get(attachment.view) else {
                continue;
            };
            let encoded = encode_color(view.format, color);
            for_each_texel(hub, attachment.view, |_, texel| texel.copy_from_slice(&encoded));
        }
    }
    if let Some(ref attachment) = record.depth_stencil_attachment {
        let depth = attachment.depth_ops.and_then(|ops| match ops.load {
            LoadOp::Clear(value) => Some(value),
            LoadOp::Load => None,
        });
        let stencil = attachment.stencil_ops.and_then(|ops| match ops.load {
            LoadOp::Clear(value) => Some(value),
            LoadOp::Load => None,
        });
        if depth.is_some() || stencil.is_some() {
            for_each_texel(hub, attachment.view, |format, texel| {
                if let Some(depth) = depth {
                    write_depth(format, texel, depth);
                }
                if let Some(stencil) = stencil {
                    write_stencil(format, texel, stencil);
                }
            });
        }
    }
    if let Some(ref writes) = record.timestamp_writes {
        if let Some(index) = writes.beginning_of_pass {
            write_timestamp(shared, hub, writes.query_set, index);
        }
    }
}

fn end_render_pass(shared: &DeviceShared, hub: &mut Hub, record: &RenderPassRecord) {
    for attachment in record.color_attachments.iter().flatten() {
        if let Some(target) = attachment.resolve_target {
            if let Some(image) = view_image(hub, attachment.view) {
                let mut source = image.into_iter();
                for_each_texel(hub, target, |_, texel| {
                    for byte in texel.iter_mut() {
                        *byte = source.next().unwrap_or(0);
                    }
                });
            }
        }
        if attachment.ops.store == StoreOp::Discard {
            for_each_texel(hub, attachment.view, |_, texel| texel.fill(0));
        }
    }
    if let Some(ref attachment) = record.depth_stencil_attachment {
        let discard_depth = attachment
            .depth_ops
            .is_some_and(|ops| ops.store == StoreOp::Discard);
        let discard_stencil = attachment
            .stencil_ops
            .is_some_and(|ops| ops.store == StoreOp::Discard);
        if discard_depth || discard_stencil {
            for_each_texel(hub, attachment.view, |format, texel| {
                if discard_depth {
                    write_depth(format, texel, 0.0);
                }
                if discard_stencil {
                    write_stencil(format, texel, 0);
                }
            });
        }
    }
    if let Some(ref writes) = record.timestamp_writes {
        if let Some(index) = writes.end_of_pass {
            write_timestamp(shared, hub, writes.query_set, index);
        }
    }
}

/// Occlusion query of the render pass being executed.
#[derive(Default)]
struct Occlusion {
    query_set: Option<QuerySetKey>,
    active: Option<u32>,
    /// Whether a draw happened since the query began.
    passed: bool,
}

fn execute_render(shared: &DeviceShared, hub: &mut Hub, occlusion: &mut Occlusion, command: &RenderCommand) {
    match *command {
        ref draw if draw.is_draw() => occlusion.passed = true,
        RenderCommand::ExecuteBundle { ref commands, .. } => {
            if commands.iter().any(RenderCommand::is_draw) {
                occlusion.passed = true;
            }
        }
        RenderCommand::BeginOcclusionQuery(index) => {
            occlusion.active = Some(index);
            occlusion.passed = false;
        }
        RenderCommand::EndOcclusionQuery => {
            if let (Some(query_set), Some(index)) = (occlusion.query_set, occlusion.active.take()) {
                write_query(hub, query_set, index, occlusion.passed as u64);
            }
        }
        RenderCommand::WriteTimestamp { query_set, index } => {
            write_timestamp(shared, hub, query_set, index)
        }
        _ => {}
    }
}

//=============================================================================
// Execution
//=============================================================================

/// Executes a validated command list in order.
#[profiling::function]
pub(crate) fn execute(shared: &Arc<DeviceShared>, hub: &mut Hub, commands: &[Command]) {
    let dump = shared.toggles.contains(Toggles::DUMP_COMMANDS);
    let mut render_pass: Option<&RenderPassRecord> = None;
    let mut compute_end: Option<(QuerySetKey, u32)> = None;
    let mut occlusion = Occlusion::default();
    for command in commands {
        if dump {
            shared.log(LoggingType::Verbose, &format!("{:?}", command));
        }
        match *command {
            Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => copy_buffer(hub, src, src_offset, dst, dst_offset, size),
            Command::CopyBufferToTexture {
                ref src,
                ref dst,
                size,
            } => buffer_to_texture(hub, src, dst, size),
            Command::CopyTextureToBuffer {
                ref src,
                ref dst,
                size,
            } => texture_to_buffer(hub, src, dst, size),
            Command::CopyTextureToTexture {
                ref src,
                ref dst,
                size,
            } => texture_to_texture(hub, src, dst, size),
            Command::ClearBuffer {
                buffer,
                offset,
                size,
            } => {
                if let Some(range) = buffer_range(hub, buffer, offset, size) {
                    range.fill(0);
                }
            }
            Command::WriteBuffer {
                buffer,
                offset,
                ref data,
            } => {
                if let Some(range) = buffer_range(hub, buffer, offset, data.len() as u64) {
                    range.copy_from_slice(data);
                }
            }
            Command::WriteTimestamp { query_set, index } => {
                write_timestamp(shared, hub, query_set, index)
            }
            Command::ResolveQuerySet {
                query_set,
                first_query,
                query_count,
                destination,
                destination_offset,
            } => resolve_query_set(
                hub,
                query_set,
                first_query,
                query_count,
                destination,
                destination_offset,
            ),
            Command::PushDebugGroup(_) | Command::PopDebugGroup | Command::InsertDebugMarker(_) => {}
            Command::BeginComputePass {
                ref timestamp_writes,
                ..
            } => {
                if let Some(ref writes) = *timestamp_writes {
                    if let Some(index) = writes.beginning_of_pass {
                        write_timestamp(shared, hub, writes.query_set, index);
                    }
                    compute_end = writes.end_of_pass.map(|index| (writes.query_set, index));
                }
            }
            Command::Compute(ComputeCommand::WriteTimestamp { query_set, index }) => {
                write_timestamp(shared, hub, query_set, index)
            }
            Command::Compute(_) => {}
            Command::EndComputePass => {
                if let Some((query_set, index)) = compute_end.take() {
                    write_timestamp(shared, hub, query_set, index);
                }
            }
            Command::BeginRenderPass(ref record) => {
                begin_render_pass(shared, hub, record);
                occlusion = Occlusion {
                    query_set: record.occlusion_query_set,
                    ..Occlusion::default()
                };
                render_pass = Some(record);
            }
            Command::Render(ref render) => execute_render(shared, hub, &mut occlusion, render),
            Command::EndRenderPass => {
                if let Some(record) = render_pass.take() {
                    end_render_pass(shared, hub, record);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_colors_follow_the_format() {
        let color = Color {
            r: 1.0,
            g: 0.5,
            b: 0.0,
            a: 1.0,
        };
        assert_eq!(encode_color(TextureFormat::Rgba8Unorm, color), [255, 128, 0, 255]);
        assert_eq!(encode_color(TextureFormat::Bgra8Unorm, color), [0, 128, 255, 255]);
        assert_eq!(encode_color(TextureFormat::Rgba8UnormSrgb, color), [255, 188, 0, 255]);
        assert_eq!(encode_color(TextureFormat::R32Float, color), 1.0f32.to_le_bytes());
        assert_eq!(encode_color(TextureFormat::R16Float, color), [0x00, 0x3c]);
        assert_eq!(
            encode_color(TextureFormat::Rgb10a2Unorm, color),
            (1023u32 | 512 << 10 | 3 << 30).to_le_bytes()
        );
    }

    #[test]
    fn depth_and_stencil_share_texels() {
        let mut texel = [0u8; 4];
        write_depth(TextureFormat::Depth24PlusStencil8, &mut texel, 1.0);
        write_stencil(TextureFormat::Depth24PlusStencil8, &mut texel, 7);
        assert_eq!(texel, [0xff, 0xff, 0xff, 7]);
        write_depth(TextureFormat::Depth24PlusStencil8, &mut texel, 0.0);
        assert_eq!(texel, [0, 0, 0, 7]);

        let mut texel = [0u8; 2];
        write_depth(TextureFormat::Depth16Unorm, &mut texel, 0.5);
        assert_eq!(u16::from_le_bytes(texel), 32768);
    }
}
