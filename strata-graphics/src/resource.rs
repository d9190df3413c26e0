//! Buffers, textures, views, samplers, query sets and external textures.

use std::sync::{Arc, Weak};

use crate::{
    device::{DeviceShared, Queue},
    handle::{resource_handle, DeviceChild, HubEntry},
    timeline, AnyKey, BufferDesc, BufferMapError, BufferMapState, BufferUsages, Extent3d,
    ExternalTextureDesc, HandleError, ImageCopyTexture, MapError, MapMode, QueryType,
    QuerySetDesc, SamplerDesc, TextureAspect, TextureDataLayout, TextureDesc, TextureDimension,
    TextureFormat, TextureUsages, TextureViewDesc, TextureViewDimension, COPY_BUFFER_ALIGNMENT,
    MAP_ALIGNMENT, MAX_QUERY_COUNT,
};

//=============================================================================
// Hub Entries
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MapState {
    Unmapped,
    Pending {
        id: u64,
        mode: MapMode,
        offset: u64,
        size: u64,
    },
    Mapped {
        mode: MapMode,
        offset: u64,
        size: u64,
    },
}

pub(crate) struct BufferEntry {
    pub size: u64,
    pub usage: BufferUsages,
    /// Backing storage, empty once destroyed.
    pub data: Vec<u8>,
    pub map: MapState,
    pub destroyed: bool,
    next_map_id: u64,
}

impl HubEntry for BufferEntry {
    fn memory(&self) -> u64 {
        self.data.len() as u64
    }
}

impl BufferEntry {
    pub fn check_range(&self, offset: u64, size: u64) -> Result<(), String> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(format!(
                "range {}..{} is out of bounds of a buffer of size {}",
                offset,
                offset.saturating_add(size),
                self.size
            )),
        }
    }
}

/// Row and image pitches of one mip level, in bytes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MipLayout {
    pub row_pitch: u64,
    pub rows_per_image: u64,
    pub images: u64,
}

impl MipLayout {
    pub fn image_pitch(&self) -> u64 {
        self.row_pitch * self.rows_per_image
    }

    pub fn total(&self) -> u64 {
        self.image_pitch() * self.images
    }
}

pub(crate) struct TextureEntry {
    pub size: Extent3d,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub dimension: TextureDimension,
    pub format: TextureFormat,
    pub usage: TextureUsages,
    pub view_formats: Vec<TextureFormat>,
    pub destroyed: bool,
    /// Bytes charged against the memory budget.
    allocated: u64,
    /// One tightly packed vector per mip level. Empty until first use when
    /// storage is allocated lazily.
    mips: Vec<Vec<u8>>,
}

impl HubEntry for TextureEntry {
    fn memory(&self) -> u64 {
        self.allocated
    }
}

impl TextureEntry {
    fn new(desc: &TextureDesc, lazy: bool) -> Self {
        let mut entry = Self {
            size: desc.size,
            mip_level_count: desc.mip_level_count,
            sample_count: desc.sample_count,
            dimension: desc.dimension,
            format: desc.format,
            usage: desc.usage,
            view_formats: desc.view_formats.to_vec(),
            destroyed: false,
            allocated: 0,
            mips: Vec::new(),
        };
        entry.allocated = (0..entry.mip_level_count)
            .map(|level| entry.mip_layout(level).total())
            .sum();
        if !lazy {
            entry.allocate();
        }
        entry
    }

    fn allocate(&mut self) {
        if self.mips.is_empty() {
            self.mips = (0..self.mip_level_count)
                .map(|level| vec![0; self.mip_layout(level).total() as usize])
                .collect();
        }
    }

    pub fn mip_size(&self, level: u32) -> Extent3d {
        self.size.mip_level_size(level, self.dimension)
    }

    pub fn mip_layout(&self, level: u32) -> MipLayout {
        let block = self.format.block();
        let size = self.mip_size(level);
        MipLayout {
            row_pitch: size.width.div_ceil(block.width) as u64 * block.bytes as u64,
            rows_per_image: size.height.div_ceil(block.height) as u64,
            images: size.depth_or_array_layers as u64,
        }
    }

    /// Storage of a mip level; `None` while lazily unallocated (reads as zeros).
    pub fn mip(&self, level: u32) -> Option<&[u8]> {
        self.mips.get(level as usize).map(Vec::as_slice)
    }

    pub fn mip_mut(&mut self, level: u32) -> &mut [u8] {
        self.allocate();
        &mut self.mips[level as usize]
    }

    fn release_storage(&mut self) -> u64 {
        self.mips = Vec::new();
        std::mem::take(&mut self.allocated)
    }

    /// Checks that a copy region lies inside a mip level and respects block alignment.
    pub fn check_copy_region(
        &self,
        mip_level: u32,
        origin: crate::Origin3d,
        size: Extent3d,
        aspect: TextureAspect,
    ) -> Result<(), String> {
        if mip_level >= self.mip_level_count {
            return Err(format!(
                "mip level {} is out of range ({} levels)",
                mip_level, self.mip_level_count
            ));
        }
        if self.sample_count != 1 {
            return Err("multisampled textures cannot be copied".to_string());
        }
        if !self.format.is_copyable() {
            return Err(format!("format {:?} cannot be copied", self.format));
        }
        check_aspect(self.format, aspect)?;
        let block = self.format.block();
        let mip = self.mip_size(mip_level);
        // Compressed mips are addressed by their size rounded up to whole blocks.
        let physical = Extent3d {
            width: mip.width.next_multiple_of(block.width),
            height: mip.height.next_multiple_of(block.height),
            depth_or_array_layers: mip.depth_or_array_layers,
        };
        let fits = |origin: u32, extent: u32, limit: u32| {
            origin.checked_add(extent).is_some_and(|end| end <= limit)
        };
        if !fits(origin.x, size.width, physical.width)
            || !fits(origin.y, size.height, physical.height)
            || !fits(origin.z, size.depth_or_array_layers, physical.depth_or_array_layers)
        {
            return Err(format!(
                "copy region {:?} at {:?} exceeds mip level {} of size {:?}",
                size, origin, mip_level, mip
            ));
        }
        if origin.x % block.width != 0
            || origin.y % block.height != 0
            || size.width % block.width != 0
            || size.height % block.height != 0
        {
            return Err(format!(
                "copy region is not aligned to the {}x{} blocks of {:?}",
                block.width, block.height, self.format
            ));
        }
        Ok(())
    }
}

fn check_aspect(format: TextureFormat, aspect: TextureAspect) -> Result<(), String> {
    let aspects = format.aspects();
    let ok = match aspect {
        TextureAspect::All => true,
        TextureAspect::DepthOnly => aspects.contains(crate::TexelAspects::DEPTH),
        TextureAspect::StencilOnly => aspects.contains(crate::TexelAspects::STENCIL),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("aspect {:?} is not present in {:?}", aspect, format))
    }
}

/// Resolved placement of texel data in linear memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LinearLayout {
    pub offset: u64,
    pub bytes_per_row: u64,
    pub rows_per_image: u64,
}

/// Validates a buffer or host layout for a texture copy of `size` and
/// returns it with defaults filled in.
pub(crate) fn resolve_linear_layout(
    format: TextureFormat,
    size: Extent3d,
    layout: &TextureDataLayout,
    byte_len: u64,
    row_alignment: u32,
) -> Result<LinearLayout, String> {
    let block = format.block();
    let row_bytes = (size.width / block.width) as u64 * block.bytes as u64;
    let rows = (size.height / block.height) as u64;
    let images = size.depth_or_array_layers as u64;
    let bytes_per_row = match layout.bytes_per_row {
        Some(bpr) => {
            if bpr % row_alignment != 0 {
                return Err(format!(
                    "bytes_per_row {} is not a multiple of {}",
                    bpr, row_alignment
                ));
            }
            if (bpr as u64) < row_bytes {
                return Err(format!(
                    "bytes_per_row {} is smaller than a row of {} bytes",
                    bpr, row_bytes
                ));
            }
            bpr as u64
        }
        None if rows > 1 || images > 1 => {
            return Err("bytes_per_row is required for multi-row copies".to_string())
        }
        None => row_bytes,
    };
    let rows_per_image = match layout.rows_per_image {
        Some(rpi) if (rpi as u64) < rows => {
            return Err(format!(
                "rows_per_image {} is smaller than the {} rows copied",
                rpi, rows
            ))
        }
        Some(rpi) => rpi as u64,
        None if images > 1 => {
            return Err("rows_per_image is required for multi-image copies".to_string())
        }
        None => rows,
    };
    if layout.offset % block.bytes as u64 != 0 {
        return Err(format!(
            "offset {} is not a multiple of the texel block size {}",
            layout.offset, block.bytes
        ));
    }
    let required = if rows == 0 || images == 0 || row_bytes == 0 {
        Some(0)
    } else {
        bytes_per_row
            .checked_mul(rows_per_image)
            .and_then(|image| image.checked_mul(images - 1))
            .and_then(|head| {
                bytes_per_row
                    .checked_mul(rows - 1)
                    .and_then(|rows| head.checked_add(rows))
            })
            .and_then(|head| head.checked_add(row_bytes))
    };
    let required = required.ok_or("copy size overflows")?;
    if layout.offset.saturating_add(required) > byte_len {
        return Err(format!(
            "copy needs {} bytes at offset {}, only {} available",
            required, layout.offset, byte_len
        ));
    }
    Ok(LinearLayout {
        offset: layout.offset,
        bytes_per_row,
        rows_per_image,
    })
}

pub(crate) struct TextureViewEntry {
    pub texture: crate::TextureKey,
    pub format: TextureFormat,
    pub dimension: TextureViewDimension,
    pub aspect: TextureAspect,
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
    pub sample_count: u32,
    pub usage: TextureUsages,
    /// Size of the base mip level.
    pub extent: Extent3d,
}

impl HubEntry for TextureViewEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        vec![self.texture.into()]
    }
}

pub(crate) struct SamplerEntry {
    pub comparison: bool,
    pub filtering: bool,
}

impl HubEntry for SamplerEntry {}

pub(crate) struct QuerySetEntry {
    pub ty: QueryType,
    pub count: u32,
    pub values: Vec<u64>,
    pub destroyed: bool,
}

impl HubEntry for QuerySetEntry {}

pub(crate) struct ExternalTextureEntry {
    pub planes: Vec<crate::TextureViewKey>,
    pub destroyed: bool,
}

impl HubEntry for ExternalTextureEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.planes.iter().map(|&key| key.into()).collect()
    }
}

//=============================================================================
// Handles
//=============================================================================

resource_handle!(
    /// Linear GPU memory that can be mapped for host access.
    Buffer,
    BufferKey,
    buffers
);
resource_handle!(Texture, TextureKey, textures);
resource_handle!(TextureView, TextureViewKey, texture_views);
resource_handle!(Sampler, SamplerKey, samplers);
resource_handle!(QuerySet, QuerySetKey, query_sets);
resource_handle!(
    /// One or two planes of video content sampled as a single texture.
    ExternalTexture,
    ExternalTextureKey,
    external_textures
);

impl Buffer {
    fn read_entry<R>(&self, f: impl FnOnce(&BufferEntry) -> R) -> Result<R, HandleError> {
        if self.shared.is_lost() {
            return Err(HandleError::DeviceLost);
        }
        let hub = self.shared.hub.read().unwrap();
        hub.buffers.get(self.key).map(f)
    }

    pub fn size(&self) -> Result<u64, HandleError> {
        self.read_entry(|entry| entry.size)
    }

    pub fn usage(&self) -> Result<BufferUsages, HandleError> {
        self.read_entry(|entry| entry.usage)
    }

    pub fn map_state(&self) -> Result<BufferMapState, HandleError> {
        self.read_entry(|entry| match entry.map {
            MapState::Unmapped => BufferMapState::Unmapped,
            MapState::Pending { .. } => BufferMapState::Pending,
            MapState::Mapped { .. } => BufferMapState::Mapped,
        })
    }

    /// Requests host access to `offset..offset + size` (the rest of the buffer
    /// when `size` is `None`). The callback runs on the device tick that
    /// completes the work submitted before this call.
    pub fn map_async(
        &self,
        mode: MapMode,
        offset: u64,
        size: Option<u64>,
        callback: impl FnOnce(Result<(), BufferMapError>) + Send + 'static,
    ) {
        let request = self.begin_map(mode, offset, size);
        if let Err(ref error) = request {
            let name = self.shared.hub.read().unwrap().buffers.describe(self.key);
            self.shared
                .validation(format!("map_async on {}: {}", name, error));
        }
        let shared = Arc::downgrade(&self.shared);
        let key = self.key;
        self.shared.enqueue(Box::new(move |outcome| {
            let result = match outcome {
                crate::completion::Outcome::Lost => Err(BufferMapError::DeviceLost),
                crate::completion::Outcome::Ready => {
                    request.and_then(|id| finish_map(&shared, key, id))
                }
            };
            callback(result)
        }));
    }

    fn begin_map(&self, mode: MapMode, offset: u64, size: Option<u64>) -> Result<u64, BufferMapError> {
        let mut hub = self.shared.hub.write().unwrap();
        let entry = hub
            .buffers
            .get_mut(self.key)
            .map_err(|e| BufferMapError::Validation(e.to_string()))?;
        if entry.destroyed {
            return Err(BufferMapError::Validation("buffer is destroyed".to_string()));
        }
        match entry.map {
            MapState::Unmapped => {}
            MapState::Pending { .. } => return Err(BufferMapError::AlreadyPending),
            MapState::Mapped { .. } => {
                return Err(BufferMapError::Validation("buffer is already mapped".to_string()))
            }
        }
        let required_usage = if mode == MapMode::READ {
            BufferUsages::MAP_READ
        } else if mode == MapMode::WRITE {
            BufferUsages::MAP_WRITE
        } else {
            return Err(BufferMapError::Validation(format!(
                "map mode {:?} must be exactly one of READ or WRITE",
                mode
            )));
        };
        if !entry.usage.contains(required_usage) {
            return Err(BufferMapError::Validation(format!(
                "usage {:?} does not include {:?}",
                entry.usage, required_usage
            )));
        }
        let size = size.unwrap_or(entry.size.saturating_sub(offset));
        if offset % MAP_ALIGNMENT != 0 || size % COPY_BUFFER_ALIGNMENT != 0 {
            return Err(BufferMapError::Validation(format!(
                "offset {} must be a multiple of {} and size {} a multiple of {}",
                offset, MAP_ALIGNMENT, size, COPY_BUFFER_ALIGNMENT
            )));
        }
        entry.check_range(offset, size).map_err(BufferMapError::Validation)?;
        let id = entry.next_map_id;
        entry.next_map_id += 1;
        entry.map = MapState::Pending {
            id,
            mode,
            offset,
            size,
        };
        Ok(id)
    }

    fn mapped_range(
        entry: &BufferEntry,
        offset: u64,
        size: Option<u64>,
    ) -> Result<(MapMode, std::ops::Range<usize>), MapError> {
        let MapState::Mapped {
            mode,
            offset: map_offset,
            size: map_size,
        } = entry.map
        else {
            return Err(MapError::NotMapped);
        };
        let map_end = map_offset + map_size;
        let size = size.unwrap_or(map_end.saturating_sub(offset));
        let end = offset.checked_add(size).ok_or(MapError::OutOfRange)?;
        if offset < map_offset || end > map_end || offset % MAP_ALIGNMENT != 0 {
            return Err(MapError::OutOfRange);
        }
        Ok((mode, offset as usize..end as usize))
    }

    /// Copies out the mapped bytes in `offset..offset + size`.
    pub fn get_mapped_range(&self, offset: u64, size: Option<u64>) -> Result<Vec<u8>, MapError> {
        if self.shared.is_lost() {
            return Err(HandleError::DeviceLost.into());
        }
        let hub = self.shared.hub.read().unwrap();
        let entry = hub.buffers.get(self.key)?;
        if entry.destroyed {
            return Err(HandleError::Destroyed.into());
        }
        let (_, range) = Self::mapped_range(entry, offset, size)?;
        Ok(entry.data[range].to_vec())
    }

    /// Writes into a range mapped for writing.
    pub fn write_mapped_range(&self, offset: u64, data: &[u8]) -> Result<(), MapError> {
        if self.shared.is_lost() {
            return Err(HandleError::DeviceLost.into());
        }
        let mut hub = self.shared.hub.write().unwrap();
        let entry = hub.buffers.get_mut(self.key)?;
        if entry.destroyed {
            return Err(HandleError::Destroyed.into());
        }
        let (mode, range) = Self::mapped_range(entry, offset, Some(data.len() as u64))?;
        if !mode.contains(MapMode::WRITE) {
            return Err(MapError::ReadOnly);
        }
        entry.data[range].copy_from_slice(data);
        Ok(())
    }

    /// Returns host access to the device. A pending mapping is aborted.
    pub fn unmap(&self) {
        let mut hub = self.shared.hub.write().unwrap();
        match hub.buffers.get_mut(self.key) {
            Ok(entry) => entry.map = MapState::Unmapped,
            Err(e) => {
                let name = hub.buffers.describe(self.key);
                drop(hub);
                self.shared.validation(format!("unmap on {}: {}", name, e));
            }
        }
    }

    /// Frees the storage now. Later use of the buffer is a validation error.
    pub fn destroy(&self) {
        let mut hub = self.shared.hub.write().unwrap();
        let freed = match hub.buffers.get_mut(self.key) {
            Ok(entry) if !entry.destroyed => {
                entry.destroyed = true;
                entry.map = MapState::Unmapped;
                std::mem::take(&mut entry.data).len() as u64
            }
            _ => 0,
        };
        hub.free(freed);
        log::debug!("Destroyed buffer {:?}", self.key);
    }
}

fn finish_map(shared: &Weak<DeviceShared>, key: crate::BufferKey, id: u64) -> Result<(), BufferMapError> {
    let shared = shared.upgrade().ok_or(BufferMapError::DeviceLost)?;
    let mut hub = shared.hub.write().unwrap();
    let entry = match hub.buffers.get_mut(key) {
        Ok(entry) if !entry.destroyed => entry,
        _ => return Err(BufferMapError::DestroyedBeforeCallback),
    };
    match entry.map {
        MapState::Pending {
            id: pending,
            mode,
            offset,
            size,
        } if pending == id => {
            entry.map = MapState::Mapped { mode, offset, size };
            Ok(())
        }
        _ => Err(BufferMapError::UnmappedBeforeCallback),
    }
}

impl Texture {
    fn read_entry<R>(&self, f: impl FnOnce(&TextureEntry) -> R) -> Result<R, HandleError> {
        if self.shared.is_lost() {
            return Err(HandleError::DeviceLost);
        }
        let hub = self.shared.hub.read().unwrap();
        hub.textures.get(self.key).map(f)
    }

    pub fn size(&self) -> Result<Extent3d, HandleError> {
        self.read_entry(|entry| entry.size)
    }

    pub fn width(&self) -> Result<u32, HandleError> {
        self.read_entry(|entry| entry.size.width)
    }

    pub fn height(&self) -> Result<u32, HandleError> {
        self.read_entry(|entry| entry.size.height)
    }

    pub fn depth_or_array_layers(&self) -> Result<u32, HandleError> {
        self.read_entry(|entry| entry.size.depth_or_array_layers)
    }

    pub fn mip_level_count(&self) -> Result<u32, HandleError> {
        self.read_entry(|entry| entry.mip_level_count)
    }

    pub fn sample_count(&self) -> Result<u32, HandleError> {
        self.read_entry(|entry| entry.sample_count)
    }

    pub fn dimension(&self) -> Result<TextureDimension, HandleError> {
        self.read_entry(|entry| entry.dimension)
    }

    pub fn format(&self) -> Result<TextureFormat, HandleError> {
        self.read_entry(|entry| entry.format)
    }

    pub fn usage(&self) -> Result<TextureUsages, HandleError> {
        self.read_entry(|entry| entry.usage)
    }

    pub fn destroy(&self) {
        let mut hub = self.shared.hub.write().unwrap();
        let freed = match hub.textures.get_mut(self.key) {
            Ok(entry) if !entry.destroyed => {
                entry.destroyed = true;
                entry.release_storage()
            }
            _ => 0,
        };
        hub.free(freed);
        log::debug!("Destroyed texture {:?}", self.key);
    }

    pub fn create_view(&self, desc: &TextureViewDesc) -> TextureView {
        let mut hub = self.shared.hub.write().unwrap();
        let result = hub
            .textures
            .get(self.key)
            .map_err(|e| format!("{}: {}", hub.textures.describe(self.key), e))
            .and_then(|texture| {
                if texture.destroyed {
                    Err(format!("{} is destroyed", hub.textures.describe(self.key)))
                } else {
                    make_view(self.key, texture, desc)
                }
            });
        let key = match result {
            Ok(entry) => {
                hub.textures.retain(self.key);
                hub.texture_views.insert(desc.label, entry)
            }
            Err(message) => {
                let key = hub.texture_views.insert_error(desc.label);
                drop(hub);
                self.shared
                    .validation(format!("create_view '{}': {}", desc.label, message));
                return TextureView::from_parts(&self.shared, key);
            }
        };
        TextureView::from_parts(&self.shared, key)
    }
}

fn make_view(
    key: crate::TextureKey,
    texture: &TextureEntry,
    desc: &TextureViewDesc,
) -> Result<TextureViewEntry, String> {
    let format = desc.format.unwrap_or(texture.format);
    if format != texture.format && !texture.view_formats.contains(&format) {
        return Err(format!(
            "view format {:?} is not {:?} or one of its view formats",
            format, texture.format
        ));
    }
    check_aspect(format, desc.aspect)?;
    if desc.base_mip_level >= texture.mip_level_count {
        return Err(format!(
            "base mip level {} is out of range ({} levels)",
            desc.base_mip_level, texture.mip_level_count
        ));
    }
    let mip_level_count = desc
        .mip_level_count
        .unwrap_or(texture.mip_level_count - desc.base_mip_level);
    if mip_level_count == 0 || desc.base_mip_level + mip_level_count > texture.mip_level_count {
        return Err(format!(
            "mip range {}..{} exceeds {} levels",
            desc.base_mip_level,
            desc.base_mip_level + mip_level_count,
            texture.mip_level_count
        ));
    }
    let layers = match texture.dimension {
        TextureDimension::D3 => 1,
        _ => texture.size.depth_or_array_layers,
    };
    let dimension = desc.dimension.unwrap_or(match texture.dimension {
        TextureDimension::D1 => TextureViewDimension::D1,
        TextureDimension::D2 if layers == 1 => TextureViewDimension::D2,
        TextureDimension::D2 => TextureViewDimension::D2Array,
        TextureDimension::D3 => TextureViewDimension::D3,
    });
    let compatible = matches!(
        (dimension, texture.dimension),
        (TextureViewDimension::D1, TextureDimension::D1)
            | (
                TextureViewDimension::D2
                    | TextureViewDimension::D2Array
                    | TextureViewDimension::Cube
                    | TextureViewDimension::CubeArray,
                TextureDimension::D2
            )
            | (TextureViewDimension::D3, TextureDimension::D3)
    );
    if !compatible {
        return Err(format!(
            "view dimension {:?} is incompatible with a {:?} texture",
            dimension, texture.dimension
        ));
    }
    let array_layer_count = desc.array_layer_count.unwrap_or(match dimension {
        TextureViewDimension::D1 | TextureViewDimension::D2 | TextureViewDimension::D3 => 1,
        TextureViewDimension::Cube => 6,
        TextureViewDimension::D2Array | TextureViewDimension::CubeArray => {
            layers.saturating_sub(desc.base_array_layer)
        }
    });
    let count_ok = match dimension {
        TextureViewDimension::D1 | TextureViewDimension::D2 | TextureViewDimension::D3 => {
            array_layer_count == 1
        }
        TextureViewDimension::Cube => array_layer_count == 6,
        TextureViewDimension::CubeArray => array_layer_count % 6 == 0 && array_layer_count != 0,
        TextureViewDimension::D2Array => array_layer_count != 0,
    };
    if !count_ok || desc.base_array_layer + array_layer_count > layers {
        return Err(format!(
            "{} layers from {} do not fit a {:?} view of a texture with {} layers",
            array_layer_count, desc.base_array_layer, dimension, layers
        ));
    }
    Ok(TextureViewEntry {
        texture: key,
        format,
        dimension,
        aspect: desc.aspect,
        base_mip_level: desc.base_mip_level,
        mip_level_count,
        base_array_layer: desc.base_array_layer,
        array_layer_count,
        sample_count: texture.sample_count,
        usage: texture.usage,
        extent: texture.mip_size(desc.base_mip_level),
    })
}

impl TextureView {
    pub fn texture_key(&self) -> Result<crate::TextureKey, HandleError> {
        let hub = self.shared.hub.read().unwrap();
        hub.texture_views.get(self.key).map(|view| view.texture)
    }
}

impl QuerySet {
    pub fn count(&self) -> Result<u32, HandleError> {
        let hub = self.shared.hub.read().unwrap();
        hub.query_sets.get(self.key).map(|entry| entry.count)
    }

    pub fn query_type(&self) -> Result<QueryType, HandleError> {
        let hub = self.shared.hub.read().unwrap();
        hub.query_sets.get(self.key).map(|entry| entry.ty)
    }

    pub fn destroy(&self) {
        let mut hub = self.shared.hub.write().unwrap();
        if let Ok(entry) = hub.query_sets.get_mut(self.key) {
            entry.destroyed = true;
            entry.values = Vec::new();
        }
    }
}

impl ExternalTexture {
    pub fn destroy(&self) {
        let mut hub = self.shared.hub.write().unwrap();
        if let Ok(entry) = hub.external_textures.get_mut(self.key) {
            entry.destroyed = true;
        }
    }
}

//=============================================================================
// Creation
//=============================================================================

fn validate_buffer(desc: &BufferDesc, limits: &crate::Limits) -> Result<(), String> {
    if desc.usage.is_empty() {
        return Err("usage must not be empty".to_string());
    }
    if desc.usage.contains(BufferUsages::MAP_READ)
        && !(BufferUsages::MAP_READ | BufferUsages::COPY_DST).contains(desc.usage)
    {
        return Err(format!(
            "MAP_READ may only be combined with COPY_DST, got {:?}",
            desc.usage
        ));
    }
    if desc.usage.contains(BufferUsages::MAP_WRITE)
        && !(BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC).contains(desc.usage)
    {
        return Err(format!(
            "MAP_WRITE may only be combined with COPY_SRC, got {:?}",
            desc.usage
        ));
    }
    if desc.size > limits.max_buffer_size {
        return Err(format!(
            "size {} exceeds the limit of {}",
            desc.size, limits.max_buffer_size
        ));
    }
    if desc.mapped_at_creation && desc.size % COPY_BUFFER_ALIGNMENT != 0 {
        return Err(format!(
            "size {} of a buffer mapped at creation must be a multiple of {}",
            desc.size, COPY_BUFFER_ALIGNMENT
        ));
    }
    Ok(())
}

fn validate_texture(desc: &TextureDesc, shared: &DeviceShared) -> Result<(), String> {
    let limits = &shared.limits;
    let size = desc.size;
    if desc.usage.is_empty() {
        return Err("usage must not be empty".to_string());
    }
    if size.width == 0 || size.height == 0 || size.depth_or_array_layers == 0 {
        return Err(format!("size {:?} must not be empty", size));
    }
    let within = match desc.dimension {
        TextureDimension::D1 => {
            size.width <= limits.max_texture_dimension_1d
                && size.height == 1
                && size.depth_or_array_layers == 1
        }
        TextureDimension::D2 => {
            size.width <= limits.max_texture_dimension_2d
                && size.height <= limits.max_texture_dimension_2d
                && size.depth_or_array_layers <= limits.max_texture_array_layers
        }
        TextureDimension::D3 => {
            size.width <= limits.max_texture_dimension_3d
                && size.height <= limits.max_texture_dimension_3d
                && size.depth_or_array_layers <= limits.max_texture_dimension_3d
        }
    };
    if !within {
        return Err(format!(
            "size {:?} exceeds the limits of a {:?} texture",
            size, desc.dimension
        ));
    }
    let missing = desc.format.required_features() - shared.features;
    if !missing.is_empty() {
        return Err(format!(
            "format {:?} requires features {:?}",
            desc.format, missing
        ));
    }
    if desc.mip_level_count == 0 || desc.mip_level_count > size.max_mips(desc.dimension) {
        return Err(format!(
            "mip level count {} is outside 1..={}",
            desc.mip_level_count,
            size.max_mips(desc.dimension)
        ));
    }
    match desc.sample_count {
        1 => {}
        4 => {
            if desc.dimension != TextureDimension::D2
                || desc.mip_level_count != 1
                || size.depth_or_array_layers != 1
                || !desc.usage.contains(TextureUsages::RENDER_ATTACHMENT)
                || desc.usage.contains(TextureUsages::STORAGE_BINDING)
                || !desc.format.is_renderable()
            {
                return Err(
                    "multisampled textures must be single-level, single-layer 2D render attachments"
                        .to_string(),
                );
            }
        }
        other => return Err(format!("sample count {} must be 1 or 4", other)),
    }
    if desc.format.is_compressed() {
        let block = desc.format.block();
        if desc.dimension != TextureDimension::D2
            || size.width % block.width != 0
            || size.height % block.height != 0
        {
            return Err(format!(
                "compressed format {:?} needs a 2D size that is a multiple of its block",
                desc.format
            ));
        }
    }
    if desc.usage.contains(TextureUsages::RENDER_ATTACHMENT)
        && (!desc.format.is_renderable() || desc.dimension == TextureDimension::D1)
    {
        return Err(format!(
            "{:?} {:?} textures cannot be render attachments",
            desc.dimension, desc.format
        ));
    }
    if desc.usage.contains(TextureUsages::STORAGE_BINDING) && desc.format.is_depth_stencil() {
        return Err("depth-stencil textures cannot be storage bindings".to_string());
    }
    if let Some(&bad) = desc
        .view_formats
        .iter()
        .find(|&&format| !desc.format.is_view_compatible(format))
    {
        return Err(format!(
            "view format {:?} is incompatible with {:?}",
            bad, desc.format
        ));
    }
    Ok(())
}

fn validate_sampler(desc: &SamplerDesc) -> Result<(), String> {
    if desc.lod_min_clamp < 0.0 || desc.lod_max_clamp < desc.lod_min_clamp {
        return Err(format!(
            "lod clamp {}..{} is invalid",
            desc.lod_min_clamp, desc.lod_max_clamp
        ));
    }
    if desc.max_anisotropy == 0 {
        return Err("max_anisotropy must be at least 1".to_string());
    }
    if desc.max_anisotropy > 1
        && [desc.mag_filter, desc.min_filter, desc.mipmap_filter]
            .iter()
            .any(|&filter| filter != crate::FilterMode::Linear)
    {
        return Err("anisotropic filtering requires all filters to be linear".to_string());
    }
    Ok(())
}

pub(crate) fn create_texture(shared: &Arc<DeviceShared>, desc: &TextureDesc) -> Texture {
    let mut hub = shared.hub.write().unwrap();
    let result = validate_texture(desc, shared)
        .map_err(crate::Error::Validation)
        .and_then(|()| {
            let lazy = shared
                .toggles
                .contains(crate::Toggles::LAZY_CLEAR_RESOURCE_ON_FIRST_USE);
            let entry = TextureEntry::new(desc, lazy);
            hub.allocate(entry.allocated, shared.memory_budget)?;
            Ok(entry)
        });
    match result {
        Ok(entry) => {
            let key = hub.textures.insert(desc.label, entry);
            log::debug!("Created texture '{}' {:?}", desc.label, key);
            Texture::from_parts(shared, key)
        }
        Err(error) => {
            let key = hub.textures.insert_error(desc.label);
            drop(hub);
            shared.report(prefix_error(error, "create_texture", desc.label));
            Texture::from_parts(shared, key)
        }
    }
}

pub(crate) fn prefix_error(error: crate::Error, operation: &str, label: &str) -> crate::Error {
    let message = format!("{} '{}': {}", operation, label, error.message());
    match error {
        crate::Error::Validation(_) => crate::Error::Validation(message),
        crate::Error::OutOfMemory(_) => crate::Error::OutOfMemory(message),
        crate::Error::Internal(_) => crate::Error::Internal(message),
    }
}

impl crate::Device {
    /// Returns an invalid buffer without reporting an error.
    pub fn create_error_buffer(&self, desc: &BufferDesc) -> Buffer {
        let key = self.shared.hub.write().unwrap().buffers.insert_error(desc.label);
        Buffer::from_parts(&self.shared, key)
    }
}

#[hidden_trait::expose]
impl crate::traits::ResourceDevice for crate::Device {
    fn create_buffer(&self, desc: &BufferDesc) -> Buffer {
        let shared = &self.shared;
        let mut hub = shared.hub.write().unwrap();
        let result = validate_buffer(desc, &shared.limits)
            .map_err(crate::Error::Validation)
            .and_then(|()| hub.allocate(desc.size, shared.memory_budget));
        match result {
            Ok(()) => {
                let entry = BufferEntry {
                    size: desc.size,
                    usage: desc.usage,
                    data: vec![0; desc.size as usize],
                    map: if desc.mapped_at_creation {
                        MapState::Mapped {
                            mode: MapMode::WRITE,
                            offset: 0,
                            size: desc.size,
                        }
                    } else {
                        MapState::Unmapped
                    },
                    destroyed: false,
                    next_map_id: 0,
                };
                let key = hub.buffers.insert(desc.label, entry);
                log::debug!(
                    "Created buffer '{}' {:?} of {} bytes",
                    desc.label,
                    key,
                    desc.size
                );
                Buffer::from_parts(shared, key)
            }
            Err(error) => {
                let key = hub.buffers.insert_error(desc.label);
                drop(hub);
                shared.report(prefix_error(error, "create_buffer", desc.label));
                Buffer::from_parts(shared, key)
            }
        }
    }

    fn create_texture(&self, desc: &TextureDesc) -> Texture {
        create_texture(&self.shared, desc)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Sampler {
        let mut hub = self.shared.hub.write().unwrap();
        match validate_sampler(desc) {
            Ok(()) => {
                let key = hub.samplers.insert(
                    desc.label,
                    SamplerEntry {
                        comparison: desc.compare.is_some(),
                        filtering: [desc.mag_filter, desc.min_filter, desc.mipmap_filter]
                            .contains(&crate::FilterMode::Linear),
                    },
                );
                Sampler::from_parts(&self.shared, key)
            }
            Err(message) => {
                let key = hub.samplers.insert_error(desc.label);
                drop(hub);
                self.shared
                    .validation(format!("create_sampler '{}': {}", desc.label, message));
                Sampler::from_parts(&self.shared, key)
            }
        }
    }

    fn create_query_set(&self, desc: &QuerySetDesc) -> QuerySet {
        let result = if desc.count > MAX_QUERY_COUNT {
            Err(format!(
                "count {} exceeds the maximum of {}",
                desc.count, MAX_QUERY_COUNT
            ))
        } else if desc.ty == QueryType::Timestamp
            && !self.shared.features.contains(crate::Features::TIMESTAMP_QUERY)
        {
            Err("timestamp queries require Features::TIMESTAMP_QUERY".to_string())
        } else {
            Ok(())
        };
        let mut hub = self.shared.hub.write().unwrap();
        match result {
            Ok(()) => {
                let key = hub.query_sets.insert(
                    desc.label,
                    QuerySetEntry {
                        ty: desc.ty,
                        count: desc.count,
                        values: vec![0; desc.count as usize],
                        destroyed: false,
                    },
                );
                QuerySet::from_parts(&self.shared, key)
            }
            Err(message) => {
                let key = hub.query_sets.insert_error(desc.label);
                drop(hub);
                self.shared
                    .validation(format!("create_query_set '{}': {}", desc.label, message));
                QuerySet::from_parts(&self.shared, key)
            }
        }
    }

    fn create_external_texture(&self, desc: &ExternalTextureDesc) -> ExternalTexture {
        let mut hub = self.shared.hub.write().unwrap();
        let planes: Vec<&TextureView> = std::iter::once(desc.plane0).chain(desc.plane1).collect();
        let mut result = Ok(());
        for plane in planes.iter() {
            let checked = if !plane.same_device(&self.shared) {
                Err("plane belongs to another device".to_string())
            } else {
                match hub.texture_views.get(plane.key) {
                    Ok(view) if view.sample_count != 1 => {
                        Err("planes must not be multisampled".to_string())
                    }
                    Ok(view) if !view.usage.contains(TextureUsages::TEXTURE_BINDING) => {
                        Err("planes need TEXTURE_BINDING usage".to_string())
                    }
                    Ok(view) if view.dimension != TextureViewDimension::D2 => {
                        Err("planes must be 2D views".to_string())
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(format!("{}: {}", hub.texture_views.describe(plane.key), e)),
                }
            };
            if checked.is_err() {
                result = checked;
                break;
            }
        }
        match result {
            Ok(()) => {
                for plane in planes.iter() {
                    hub.texture_views.retain(plane.key);
                }
                let key = hub.external_textures.insert(
                    desc.label,
                    ExternalTextureEntry {
                        planes: planes.iter().map(|plane| plane.key).collect(),
                        destroyed: false,
                    },
                );
                ExternalTexture::from_parts(&self.shared, key)
            }
            Err(message) => {
                let key = hub.external_textures.insert_error(desc.label);
                drop(hub);
                self.shared.validation(format!(
                    "create_external_texture '{}': {}",
                    desc.label, message
                ));
                ExternalTexture::from_parts(&self.shared, key)
            }
        }
    }
}

//=============================================================================
// Queue Writes
//=============================================================================

impl Queue {
    /// Writes `data` into the buffer immediately, ordered after every prior submission.
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) {
        if self.shared.is_lost() {
            return;
        }
        let mut hub = self.shared.hub.write().unwrap();
        let name = hub.buffers.describe(buffer.key);
        let result = if !buffer.same_device(&self.shared) {
            Err("buffer belongs to another device".to_string())
        } else {
            hub.buffers
                .get_mut(buffer.key)
                .map_err(|e| e.to_string())
                .and_then(|entry| {
                    if entry.destroyed {
                        return Err("buffer is destroyed".to_string());
                    }
                    if !entry.usage.contains(BufferUsages::COPY_DST) {
                        return Err(format!("usage {:?} lacks COPY_DST", entry.usage));
                    }
                    if entry.map != MapState::Unmapped {
                        return Err("buffer is mapped".to_string());
                    }
                    if offset % COPY_BUFFER_ALIGNMENT != 0
                        || data.len() as u64 % COPY_BUFFER_ALIGNMENT != 0
                    {
                        return Err(format!(
                            "offset {} and size {} must be multiples of {}",
                            offset,
                            data.len(),
                            COPY_BUFFER_ALIGNMENT
                        ));
                    }
                    entry.check_range(offset, data.len() as u64)?;
                    let start = offset as usize;
                    entry.data[start..start + data.len()].copy_from_slice(data);
                    Ok(())
                })
        };
        drop(hub);
        if let Err(message) = result {
            self.shared
                .validation(format!("write_buffer to {}: {}", name, message));
        }
    }

    /// Writes texel data into a texture region immediately.
    pub fn write_texture(
        &self,
        destination: &ImageCopyTexture,
        data: &[u8],
        layout: TextureDataLayout,
        size: Extent3d,
    ) {
        if self.shared.is_lost() {
            return;
        }
        let texture = destination.texture;
        let mut hub = self.shared.hub.write().unwrap();
        let name = hub.textures.describe(texture.key);
        let result = if !texture.same_device(&self.shared) {
            Err("texture belongs to another device".to_string())
        } else {
            hub.textures
                .get_mut(texture.key)
                .map_err(|e| e.to_string())
                .and_then(|entry| {
                    if entry.destroyed {
                        return Err("texture is destroyed".to_string());
                    }
                    if !entry.usage.contains(TextureUsages::COPY_DST) {
                        return Err(format!("usage {:?} lacks COPY_DST", entry.usage));
                    }
                    entry.check_copy_region(
                        destination.mip_level,
                        destination.origin,
                        size,
                        destination.aspect,
                    )?;
                    let linear =
                        resolve_linear_layout(entry.format, size, &layout, data.len() as u64, 1)?;
                    timeline::copy_linear_to_texture(
                        data,
                        linear,
                        entry,
                        destination.mip_level,
                        destination.origin,
                        size,
                    );
                    Ok(())
                })
        };
        drop(hub);
        if let Err(message) = result {
            self.shared
                .validation(format!("write_texture to {}: {}", name, message));
        }
    }
}
