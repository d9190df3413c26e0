//! Presentation: surfaces and the swap chains that render into them.

use std::sync::{Arc, Mutex, Weak};

use crate::{
    device::DeviceShared,
    instance::InstanceShared,
    resource::create_texture,
    Device, Extent3d, PresentMode, SurfaceDesc, SurfaceTarget, SwapChainDesc, Texture,
    TextureDesc, TextureDimension, TextureFormat, TextureUsages, TextureView, TextureViewDesc,
};

/// Window handles of a surface, kept only to be handed back to the caller.
#[derive(Clone, Copy, Debug)]
struct Target(SurfaceTarget);

// SAFETY: the raw window handles are never dereferenced by this crate.
unsafe impl Send for Target {}
unsafe impl Sync for Target {}

struct SurfaceShared {
    instance: Weak<InstanceShared>,
    target: Target,
    label: Mutex<String>,
}

/// A presentation target created from an instance.
pub struct Surface {
    shared: Arc<SurfaceShared>,
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("label", &self.label())
            .field("target", &self.shared.target.0)
            .finish()
    }
}

impl Surface {
    pub(crate) fn new(instance: &Arc<InstanceShared>, desc: &SurfaceDesc) -> Self {
        log::debug!("Created surface '{}' for {:?}", desc.label, desc.target);
        Self {
            shared: Arc::new(SurfaceShared {
                instance: Arc::downgrade(instance),
                target: Target(desc.target),
                label: Mutex::new(desc.label.to_string()),
            }),
        }
    }

    pub(crate) fn belongs_to(&self, instance: &Arc<InstanceShared>) -> bool {
        Weak::as_ptr(&self.shared.instance) == Arc::as_ptr(instance)
    }

    pub fn reference(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn release(self) {}

    pub fn set_label(&self, label: &str) {
        *self.shared.label.lock().unwrap() = label.to_string();
    }

    pub fn label(&self) -> String {
        self.shared.label.lock().unwrap().clone()
    }

    pub fn target(&self) -> SurfaceTarget {
        self.shared.target.0
    }
}

//=============================================================================
// Swap Chain
//=============================================================================

#[derive(Clone, Debug)]
struct Config {
    label: String,
    format: TextureFormat,
    usage: TextureUsages,
    width: u32,
    height: u32,
    present_mode: PresentMode,
}

#[derive(Default)]
struct Frames {
    /// `None` after a failed configuration.
    config: Option<Config>,
    current: Option<(Texture, TextureView)>,
    presented: u64,
}

/// Hands out one presentable texture view at a time.
pub struct SwapChain {
    device: Arc<DeviceShared>,
    surface: Surface,
    frames: Mutex<Frames>,
}

impl std::fmt::Debug for SwapChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapChain")
            .field("surface", &self.surface)
            .field("presented", &self.presented_count())
            .finish()
    }
}

fn check_config(shared: &DeviceShared, desc: &SwapChainDesc) -> Result<Config, String> {
    let max = shared.limits.max_texture_dimension_2d;
    if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
        return Err(format!(
            "size {}x{} is outside 1..={}",
            desc.width, desc.height, max
        ));
    }
    if !desc.usage.contains(TextureUsages::RENDER_ATTACHMENT) {
        return Err(format!("usage {:?} lacks RENDER_ATTACHMENT", desc.usage));
    }
    if desc.format.is_depth_stencil() || !desc.format.is_renderable() {
        return Err(format!("{:?} cannot be presented", desc.format));
    }
    Ok(Config {
        label: desc.label.to_string(),
        format: desc.format,
        usage: desc.usage,
        width: desc.width,
        height: desc.height,
        present_mode: desc.present_mode,
    })
}

impl Device {
    pub fn create_swap_chain(&self, surface: &Surface, desc: &SwapChainDesc) -> SwapChain {
        let swap_chain = SwapChain {
            device: Arc::clone(&self.shared),
            surface: surface.reference(),
            frames: Mutex::new(Frames::default()),
        };
        swap_chain.configure(desc);
        swap_chain
    }
}

impl SwapChain {
    /// Replaces the configuration. A frame that was not presented is dropped.
    pub fn configure(&self, desc: &SwapChainDesc) {
        let config = check_config(&self.device, desc);
        let mut frames = self.frames.lock().unwrap();
        if frames.current.take().is_some() {
            log::warn!(
                "Reconfiguring '{}' drops a frame that was never presented",
                desc.label
            );
        }
        match config {
            Ok(config) => {
                log::info!(
                    "Configured swap chain '{}' on surface '{}': {}x{} {:?}, {:?}",
                    config.label,
                    self.surface.label(),
                    config.width,
                    config.height,
                    config.format,
                    config.present_mode
                );
                frames.config = Some(config);
            }
            Err(message) => {
                frames.config = None;
                drop(frames);
                self.device
                    .validation(format!("configure swap chain '{}': {}", desc.label, message));
            }
        }
    }

    /// Returns the view to render the next frame into. Repeated calls before
    /// `present` return the same view.
    pub fn get_current_texture_view(&self) -> TextureView {
        let frames = self.frames.lock().unwrap();
        if let Some((_, ref view)) = frames.current {
            return view.reference();
        }
        let config = frames.config.clone();
        let presented = frames.presented;
        drop(frames);
        let Some(config) = config else {
            let key = self.device.hub.write().unwrap().texture_views.insert_error("");
            self.device
                .validation("get_current_texture_view: the swap chain is not configured");
            return TextureView::from_parts(&self.device, key);
        };
        let label = format!("{} frame {}", config.label, presented);
        let texture = create_texture(
            &self.device,
            &TextureDesc {
                label: &label,
                size: Extent3d {
                    width: config.width,
                    height: config.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: TextureDimension::D2,
                format: config.format,
                usage: config.usage,
                view_formats: &[],
            },
        );
        let view = texture.create_view(&TextureViewDesc {
            label: &label,
            ..Default::default()
        });

        let mut frames = self.frames.lock().unwrap();
        // Another caller may have installed a frame while the lock was released.
        if let Some((_, ref current)) = frames.current {
            let current = current.reference();
            drop(frames);
            texture.destroy();
            return current;
        }
        let handed_out = view.reference();
        frames.current = Some((texture, view));
        handed_out
    }

    /// Shows the current frame and retires its texture.
    pub fn present(&self) {
        let mut frames = self.frames.lock().unwrap();
        let Some((texture, view)) = frames.current.take() else {
            drop(frames);
            self.device
                .validation("present: there is no current texture to present");
            return;
        };
        frames.presented += 1;
        let presented = frames.presented;
        drop(frames);
        texture.destroy();
        drop(view);
        log::trace!("Presented frame {} on '{}'", presented, self.surface.label());
    }

    /// Number of frames presented so far.
    pub fn presented_count(&self) -> u64 {
        self.frames.lock().unwrap().presented
    }
}
