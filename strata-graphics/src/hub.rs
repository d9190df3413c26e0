//! Per-device storage of every object category.

use slotmap::new_key_type;

use crate::handle::{HubEntry, Registry, Released};

macro_rules! define_hub {
    ($(
        $(#[$meta:meta])*
        $variant:ident: $key:ident => $field:ident: $entry:ty,
    )*) => {
        new_key_type! {
            $(
                $(#[$meta])*
                pub struct $key;
            )*
        }

        /// Key of any object stored in a device hub.
        #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
        pub enum AnyKey {
            $($variant($key),)*
        }

        $(
            impl From<$key> for AnyKey {
                fn from(key: $key) -> Self {
                    Self::$variant(key)
                }
            }
        )*

        /// Central storage for all objects of one device.
        ///
        /// Command recording takes `read()` access, creation and destruction
        /// take `write()` access.
        pub(crate) struct Hub {
            $(pub $field: Registry<$key, $entry>,)*
            /// Bytes of buffer and texture storage currently allocated.
            pub memory_used: u64,
        }

        impl Hub {
            pub fn new() -> Self {
                Self {
                    $($field: Registry::new(stringify!($variant)),)*
                    memory_used: 0,
                }
            }

            pub fn retain(&mut self, key: AnyKey) -> bool {
                match key {
                    $(AnyKey::$variant(key) => self.$field.retain(key),)*
                }
            }

            /// Drops one reference, freeing the object and, transitively,
            /// whatever it kept alive.
            pub fn release(&mut self, key: AnyKey) {
                let mut work = vec![key];
                while let Some(key) = work.pop() {
                    let freed = match key {
                        $(AnyKey::$variant(key) => match self.$field.release(key) {
                            Released::Freed(value) => value.map(|entry| {
                                (entry.memory(), entry.dependencies())
                            }),
                            Released::Alive | Released::Stale => continue,
                        },)*
                    };
                    log::debug!("Freed {:?}", key);
                    if let Some((memory, dependencies)) = freed {
                        self.memory_used = self.memory_used.saturating_sub(memory);
                        work.extend(dependencies);
                    }
                }
            }

            pub fn is_valid(&self, key: AnyKey) -> bool {
                match key {
                    $(AnyKey::$variant(key) => self.$field.is_valid(key),)*
                }
            }

            pub fn describe(&self, key: AnyKey) -> String {
                match key {
                    $(AnyKey::$variant(key) => self.$field.describe(key),)*
                }
            }

            /// Number of live objects across all categories.
            pub fn object_count(&self) -> usize {
                0 $(+ self.$field.len())*
            }
        }
    };
}

define_hub! {
    Buffer: BufferKey => buffers: crate::resource::BufferEntry,
    Texture: TextureKey => textures: crate::resource::TextureEntry,
    TextureView: TextureViewKey => texture_views: crate::resource::TextureViewEntry,
    Sampler: SamplerKey => samplers: crate::resource::SamplerEntry,
    QuerySet: QuerySetKey => query_sets: crate::resource::QuerySetEntry,
    ExternalTexture: ExternalTextureKey => external_textures: crate::resource::ExternalTextureEntry,
    BindGroupLayout: BindGroupLayoutKey => bind_group_layouts: crate::binding::GroupLayoutEntry,
    BindGroup: BindGroupKey => bind_groups: crate::binding::GroupEntry,
    PipelineLayout: PipelineLayoutKey => pipeline_layouts: crate::binding::PipelineLayoutEntry,
    ShaderModule: ShaderModuleKey => shader_modules: crate::pipeline::ShaderModuleEntry,
    ComputePipeline: ComputePipelineKey => compute_pipelines: crate::pipeline::ComputePipelineEntry,
    RenderPipeline: RenderPipelineKey => render_pipelines: crate::pipeline::RenderPipelineEntry,
    CommandEncoder: CommandEncoderKey => command_encoders: crate::command::EncoderEntry,
    /// Open or ended compute pass of a command encoder.
    ComputePass: ComputePassKey => compute_passes: crate::pass::ComputePassEntry,
    /// Open or ended render pass of a command encoder.
    RenderPass: RenderPassKey => render_passes: crate::pass::RenderPassEntry,
    CommandBuffer: CommandBufferKey => command_buffers: crate::command::CommandBufferEntry,
    RenderBundleEncoder: RenderBundleEncoderKey => render_bundle_encoders: crate::bundle::BundleEncoderEntry,
    RenderBundle: RenderBundleKey => render_bundles: crate::bundle::RenderBundleEntry,
}

impl Hub {
    /// Charges `size` bytes against `budget`, failing if it would be exceeded.
    pub fn allocate(&mut self, size: u64, budget: u64) -> Result<(), crate::Error> {
        match self.memory_used.checked_add(size) {
            Some(total) if total <= budget => {
                self.memory_used = total;
                Ok(())
            }
            _ => Err(crate::Error::OutOfMemory(format!(
                "allocation of {size} bytes exceeds the remaining budget of {} bytes",
                budget.saturating_sub(self.memory_used)
            ))),
        }
    }

    pub fn free(&mut self, size: u64) {
        self.memory_used = self.memory_used.saturating_sub(size);
    }
}
