//! Render bundles: render commands validated once and replayed by passes.

use std::sync::Arc;

use crate::{
    command::RenderCommand,
    device::DeviceShared,
    handle::{resource_handle, HubEntry},
    pass::{AttachmentSignature, Recorder, RenderState, RenderTarget},
    track::Tracker,
    AnyKey, BindGroup, Buffer, IndexFormat, RenderBundleDesc, RenderBundleEncoderDesc,
    RenderPipeline,
};

pub(crate) struct BundleEncoderEntry {
    signature: AttachmentSignature,
    depth_read_only: bool,
    stencil_read_only: bool,
    state: RenderState,
    commands: Vec<RenderCommand>,
    tracker: Tracker,
    error: Option<String>,
    finished: bool,
}

impl HubEntry for BundleEncoderEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.tracker.keys().collect()
    }
}

impl BundleEncoderEntry {
    fn defer(&mut self, message: String) {
        if self.error.is_none() {
            log::debug!("Bundle error deferred to finish: {}", message);
            self.error = Some(message);
        }
    }
}

pub(crate) struct RenderBundleEntry {
    pub commands: Arc<[RenderCommand]>,
    pub signature: AttachmentSignature,
    pub depth_read_only: bool,
    pub stencil_read_only: bool,
    pub tracker: Tracker,
}

impl HubEntry for RenderBundleEntry {
    fn dependencies(&self) -> Vec<AnyKey> {
        self.tracker.keys().collect()
    }
}

resource_handle!(
    /// Records render commands into a [`RenderBundle`].
    RenderBundleEncoder,
    RenderBundleEncoderKey,
    render_bundle_encoders
);
resource_handle!(RenderBundle, RenderBundleKey, render_bundles);

fn bundle_signature(
    shared: &DeviceShared,
    desc: &RenderBundleEncoderDesc,
) -> Result<AttachmentSignature, String> {
    if desc.color_formats.len() > shared.limits.max_color_attachments as usize {
        return Err(format!(
            "{} color formats exceed the limit of {}",
            desc.color_formats.len(),
            shared.limits.max_color_attachments
        ));
    }
    for &format in desc.color_formats.iter().flatten() {
        if format.is_depth_stencil() || !format.is_renderable() {
            return Err(format!("{:?} is not a renderable color format", format));
        }
        if !shared.features.contains(format.required_features()) {
            return Err(format!(
                "{:?} requires {:?}",
                format,
                format.required_features()
            ));
        }
    }
    if let Some(format) = desc.depth_stencil_format {
        if !format.is_depth_stencil() {
            return Err(format!("{:?} is not a depth-stencil format", format));
        }
    }
    if desc.sample_count != 1 && desc.sample_count != 4 {
        return Err(format!("sample count {} is not 1 or 4", desc.sample_count));
    }
    let signature = AttachmentSignature::new(
        desc.color_formats.iter().copied(),
        desc.depth_stencil_format,
        desc.sample_count,
    );
    if signature.colors.is_empty() && signature.depth_stencil.is_none() {
        return Err("a render bundle needs at least one attachment format".to_string());
    }
    Ok(signature)
}

pub(crate) fn create_render_bundle_encoder(
    shared: &Arc<DeviceShared>,
    desc: &RenderBundleEncoderDesc,
) -> RenderBundleEncoder {
    let (signature, error) = match bundle_signature(shared, desc) {
        Ok(signature) => (signature, None),
        Err(message) => (AttachmentSignature::new(std::iter::empty(), None, 1), Some(message)),
    };
    let entry = BundleEncoderEntry {
        signature,
        depth_read_only: desc.depth_read_only,
        stencil_read_only: desc.stencil_read_only,
        state: RenderState::default(),
        commands: Vec::new(),
        tracker: Tracker::default(),
        error: error.clone(),
        finished: false,
    };
    let key = shared
        .hub
        .write()
        .unwrap()
        .render_bundle_encoders
        .insert(desc.label, entry);
    if let Some(message) = error {
        shared.validation(format!("create_render_bundle_encoder: {}", message));
    }
    RenderBundleEncoder::from_parts(shared, key)
}

impl RenderBundleEncoder {
    fn record(
        &self,
        op: &str,
        f: impl FnOnce(&mut Recorder, &mut RenderState, RenderTarget) -> Result<Option<RenderCommand>, String>,
    ) {
        let shared = &self.shared;
        if shared.is_lost() {
            return;
        }
        let mut guard = shared.hub.write().unwrap();
        let hub = &mut *guard;
        let name = hub.render_bundle_encoders.describe(self.key);
        let mut entry = match hub.render_bundle_encoders.take(self.key) {
            Ok(entry) => entry,
            Err(e) => {
                drop(guard);
                shared.validation(format!("{} on {}: {}", op, name, e));
                return;
            }
        };
        let finished = entry.finished;
        if !finished {
            let target = RenderTarget {
                signature: &entry.signature,
                depth_read_only: entry.depth_read_only,
                stencil_read_only: entry.stencil_read_only,
            };
            let mut rec = Recorder {
                shared,
                hub,
                tracker: &mut entry.tracker,
            };
            match f(&mut rec, &mut entry.state, target) {
                Ok(Some(command)) => entry.commands.push(command),
                Ok(None) => {}
                Err(message) => entry.defer(format!("{}: {}", op, message)),
            }
        }
        hub.render_bundle_encoders.restore(self.key, entry);
        drop(guard);
        if finished {
            shared.validation(format!("{} on {}: the encoder is finished", op, name));
        }
    }

    pub fn set_pipeline(&self, pipeline: &RenderPipeline) {
        self.record("set_pipeline", |rec, state, target| {
            state.set_pipeline(rec, target, pipeline).map(Some)
        })
    }

    pub fn set_bind_group(&self, index: u32, group: Option<&BindGroup>, offsets: &[u32]) {
        self.record("set_bind_group", |rec, state, _| {
            state.set_bind_group(rec, index, group, offsets).map(Some)
        })
    }

    pub fn set_vertex_buffer(&self, slot: u32, buffer: &Buffer, offset: u64, size: Option<u64>) {
        self.record("set_vertex_buffer", |rec, state, _| {
            state.set_vertex_buffer(rec, slot, buffer, offset, size).map(Some)
        })
    }

    pub fn set_index_buffer(
        &self,
        buffer: &Buffer,
        format: IndexFormat,
        offset: u64,
        size: Option<u64>,
    ) {
        self.record("set_index_buffer", |rec, state, _| {
            state.set_index_buffer(rec, buffer, format, offset, size).map(Some)
        })
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record("draw", |rec, state, _| {
            state
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
        self.record("draw_indexed", |rec, state, _| {
            state
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
        self.record("draw_indirect", |rec, state, _| {
            state.draw_indirect(rec, buffer, offset).map(Some)
        })
    }

    pub fn draw_indexed_indirect(&self, buffer: &Buffer, offset: u64) {
        self.record("draw_indexed_indirect", |rec, state, _| {
            state.draw_indexed_indirect(rec, buffer, offset).map(Some)
        })
    }

    pub fn push_debug_group(&self, label: &str) {
        self.record("push_debug_group", |_, state, _| {
            Ok(Some(state.push_debug_group(label)))
        })
    }

    pub fn pop_debug_group(&self) {
        self.record("pop_debug_group", |rec, state, _| {
            state.pop_debug_group(rec.shared.skips_validation())
        })
    }

    pub fn insert_debug_marker(&self, label: &str) {
        self.record("insert_debug_marker", |_, _, _| {
            Ok(Some(RenderCommand::InsertDebugMarker(label.to_string())))
        })
    }

    /// Seals the recorded commands. The encoder cannot be used afterwards.
    pub fn finish(&self, desc: &RenderBundleDesc) -> RenderBundle {
        let shared = &self.shared;
        let skip = shared.skips_validation();
        let mut hub = shared.hub.write().unwrap();
        let name = hub.render_bundle_encoders.describe(self.key);
        let (outcome, leftover) = match hub.render_bundle_encoders.get_mut(self.key) {
            Err(e) => (Err(e.to_string()), Vec::new()),
            Ok(entry) if entry.finished => (Err("finish was already called".to_string()), Vec::new()),
            Ok(entry) => {
                entry.finished = true;
                if entry.state.debug_depth != 0 && !skip {
                    entry.defer(format!(
                        "{} debug groups are still open",
                        entry.state.debug_depth
                    ));
                }
                let outcome = match entry.error.take() {
                    Some(message) => Err(message),
                    None => Ok(RenderBundleEntry {
                        commands: std::mem::take(&mut entry.commands).into(),
                        signature: entry.signature.clone(),
                        depth_read_only: entry.depth_read_only,
                        stencil_read_only: entry.stencil_read_only,
                        tracker: std::mem::take(&mut entry.tracker),
                    }),
                };
                entry.commands.clear();
                (outcome, entry.tracker.take())
            }
        };
        for key in leftover {
            hub.release(key);
        }
        let (key, error) = match outcome {
            Ok(bundle) => {
                log::debug!(
                    "Finished {} with {} commands",
                    name,
                    bundle.commands.len()
                );
                (hub.render_bundles.insert(desc.label, bundle), None)
            }
            Err(message) => (hub.render_bundles.insert_error(desc.label), Some(message)),
        };
        drop(hub);
        if let Some(message) = error {
            shared.validation(format!("finish on {}: {}", name, message));
        }
        RenderBundle::from_parts(shared, key)
    }
}

impl RenderBundle {
    /// Number of recorded commands, not counting debug markers.
    pub fn command_count(&self) -> Result<usize, crate::HandleError> {
        let hub = self.shared.hub.read().unwrap();
        let entry = hub.render_bundles.get(self.key)?;
        Ok(entry
            .commands
            .iter()
            .filter(|command| {
                !matches!(
                    command,
                    RenderCommand::PushDebugGroup(_)
                        | RenderCommand::PopDebugGroup
                        | RenderCommand::InsertDebugMarker(_)
                )
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TextureFormat;

    fn desc(colors: &[Option<TextureFormat>], sample_count: u32) -> RenderBundleEncoderDesc<'_> {
        RenderBundleEncoderDesc {
            label: "",
            color_formats: colors,
            depth_stencil_format: None,
            sample_count,
            depth_read_only: false,
            stencil_read_only: false,
        }
    }

    #[test]
    fn bundle_targets() {
        let shared = crate::device::tests::test_shared();
        let colors = [Some(TextureFormat::Rgba8Unorm)];
        assert!(bundle_signature(&shared, &desc(&colors, 1)).is_ok());
        assert!(bundle_signature(&shared, &desc(&colors, 3)).is_err());
        assert!(bundle_signature(&shared, &desc(&[None], 1)).is_err());
        let depth = [Some(TextureFormat::Depth32Float)];
        assert!(bundle_signature(&shared, &desc(&depth, 1)).is_err());
    }
}
