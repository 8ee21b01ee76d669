// src/kms/framebuffer.rs

//! Scanout framebuffers.
//!
//! A `Framebuffer` owns a kernel fb id and unregisters it when dropped.
//! Framebuffers built from an imported GEM handle also own that handle and
//! close it after the fb id is gone.
//! Buffers coming from the surface backends are described by a
//! `BufferLayout`; registration prefers the explicit-modifier path and
//! falls back to an implicit single-plane registration.

use std::fmt;
use std::num::NonZeroU32;
use std::rc::Rc;

use drm::buffer::{DrmFourcc, DrmModifier, Handle, PlanarBuffer};
use log::{debug, warn};

use crate::error::{PresentError, Result};
use crate::kms::adapter::{FbId, KmsAdapter};

pub const MOD_LINEAR: u64 = 0;
pub const MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Bytes per pixel of the only format the pipeline scans out (XRGB8888).
pub const BYTES_PER_PIXEL: u32 = 4;

/// Geometry, per-plane memory description and layout modifier of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: Option<u64>,
}

impl BufferLayout {
    pub fn single_plane(width: u32, height: u32, handle: u32, pitch: u32) -> Self {
        BufferLayout {
            width,
            height,
            format: DrmFourcc::Xrgb8888,
            handles: [handle, 0, 0, 0],
            pitches: [pitch, 0, 0, 0],
            offsets: [0; 4],
            modifier: None,
        }
    }

    pub fn plane_count(&self) -> usize {
        self.handles.iter().take_while(|&&h| h != 0).count()
    }

    /// Modifier worth passing to the kernel. Linear and invalid are what the
    /// kernel assumes without one.
    pub fn explicit_modifier(&self) -> Option<u64> {
        self.modifier
            .filter(|&m| m != MOD_LINEAR && m != MOD_INVALID)
    }

    /// First plane only, no modifier.
    pub fn implicit(&self) -> Self {
        BufferLayout::single_plane(self.width, self.height, self.handles[0], self.pitches[0])
    }
}

impl PlanarBuffer for BufferLayout {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.modifier.map(DrmModifier::from)
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<Handle>; 4] {
        self.handles.map(|h| NonZeroU32::new(h).map(Handle::from))
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

pub struct Framebuffer {
    id: FbId,
    layout: BufferLayout,
    /// GEM handle closed on drop, for buffers imported into this device.
    gem: Option<u32>,
    kms: Rc<dyn KmsAdapter>,
}

impl Framebuffer {
    /// Registers `layout` as a scanout object.
    ///
    /// A layout carrying an explicit modifier is registered with it when the
    /// kernel supports modifiers. Any other outcome (no support, or the
    /// kernel rejecting the multi-plane description) retries with the first
    /// plane and no modifier, and says so in the log.
    pub fn register(kms: &Rc<dyn KmsAdapter>, layout: BufferLayout) -> Result<Self> {
        let first_try = match layout.explicit_modifier() {
            Some(modifier) if kms.supports_modifiers() => {
                debug!("Framebuffer: registering with modifier {modifier:#x}");
                kms.add_framebuffer(&layout, true)
                    .map_err(|err| format!("modifier {modifier:#x} rejected: {err}"))
            }
            Some(modifier) => Err(format!(
                "modifier {modifier:#x} present but the kernel has no modifier support"
            )),
            None => kms
                .add_framebuffer(&layout, false)
                .map_err(|err| format!("{}-plane registration failed: {err}", layout.plane_count())),
        };

        let id = match first_try {
            Ok(id) => id,
            Err(reason) => {
                warn!("Framebuffer: {reason}, falling back to implicit single-plane layout");
                kms.add_framebuffer(&layout.implicit(), false)
                    .map_err(PresentError::op("drmModeAddFB2"))?
            }
        };
        debug!("Framebuffer: {id} registered ({}x{})", layout.width, layout.height);
        Ok(Framebuffer {
            id,
            layout,
            gem: None,
            kms: Rc::clone(kms),
        })
    }

    /// Registers a single-plane buffer imported as the GEM handle in
    /// `layout.handles[0]`, with the pitch and offset the allocation reported.
    ///
    /// Takes ownership of the handle: it is closed if registration fails,
    /// otherwise when the framebuffer is dropped.
    pub fn from_gem(kms: &Rc<dyn KmsAdapter>, layout: BufferLayout) -> Result<Self> {
        let gem = layout.handles[0];
        let id = match kms.add_framebuffer(&layout, false) {
            Ok(id) => id,
            Err(err) => {
                close_gem(kms.as_ref(), gem);
                return Err(PresentError::resource("drmModeAddFB2", err));
            }
        };
        debug!(
            "Framebuffer: {id} registered from gem {gem} (pitch {})",
            layout.pitches[0]
        );
        Ok(Framebuffer {
            id,
            layout,
            gem: Some(gem),
            kms: Rc::clone(kms),
        })
    }

    pub fn gem_handle(&self) -> Option<u32> {
        self.gem
    }

    pub fn id(&self) -> FbId {
        self.id
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("width", &self.layout.width)
            .field("height", &self.layout.height)
            .finish()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Err(err) = self.kms.remove_framebuffer(self.id) {
            warn!("Framebuffer: failed to remove {}: {err}", self.id);
        }
        if let Some(gem) = self.gem {
            close_gem(self.kms.as_ref(), gem);
        }
    }
}

fn close_gem(kms: &dyn KmsAdapter, gem: u32) {
    if let Err(err) = kms.close_buffer(gem) {
        warn!("Framebuffer: failed to close gem handle {gem}: {err}");
    }
}
