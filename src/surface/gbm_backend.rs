// src/surface/gbm_backend.rs

//! GBM backend: a driver-managed rendering surface.
//!
//! The driver decides which of its buffers becomes the next front buffer.
//! Each underlying buffer is registered as a framebuffer the first time it
//! shows up; the wrapper is stored on the buffer itself, so later sightings
//! reuse it.

use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::rc::Rc;

use log::{debug, info};

use crate::config::BackendKind;
use crate::error::{PresentError, Result};
use crate::kms::framebuffer::MOD_LINEAR;
use crate::kms::{BufferLayout, Framebuffer, KmsAdapter};
use crate::render::RenderContext;
use crate::surface::{PresentableBuffer, SurfaceBackend, SurfaceRequest};

/// How the driver surface is asked to lay out its buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceLayout {
    /// Pick one of these modifiers.
    Modifiers(Vec<u64>),
    /// Scanout-capable, layout left to the driver.
    Implicit,
}

impl SurfaceLayout {
    /// A requested modifier is honored or init fails; it never silently
    /// degrades to an unmodified layout.
    pub fn negotiate(requested: Option<u64>, supports_modifiers: bool) -> Result<Self> {
        match (requested, supports_modifiers) {
            (Some(modifier), true) => Ok(SurfaceLayout::Modifiers(vec![modifier])),
            (Some(modifier), false) => Err(PresentError::capability(format!(
                "modifier {modifier:#x} requested but the device has no modifier support"
            ))),
            (None, true) => Ok(SurfaceLayout::Modifiers(vec![MOD_LINEAR])),
            (None, false) => Ok(SurfaceLayout::Implicit),
        }
    }
}

/// Creates driver rendering surfaces on the allocation device.
pub trait SurfaceSource: fmt::Debug {
    fn create_surface(
        &self,
        width: u32,
        height: u32,
        layout: &SurfaceLayout,
    ) -> anyhow::Result<Box<dyn FrontBufferSurface>>;
}

pub trait FrontBufferSurface: fmt::Debug {
    /// Locks the buffer the renderer just finished. Only valid after the
    /// frame was swapped.
    fn lock_front_buffer(&mut self) -> anyhow::Result<Box<dyn LockedBuffer>>;

    /// Native window handle for the rendering context's window surface.
    fn native_window(&self) -> *mut c_void {
        ptr::null_mut()
    }
}

/// A locked front buffer. Dropping it hands the buffer back to the surface.
pub trait LockedBuffer: fmt::Debug {
    fn layout(&self) -> BufferLayout;

    /// Framebuffer attached on an earlier sighting of the same buffer.
    fn framebuffer(&self) -> Option<Rc<Framebuffer>>;

    fn attach_framebuffer(&mut self, framebuffer: Rc<Framebuffer>);
}

pub struct GbmBackend {
    locked: Vec<Box<dyn LockedBuffer>>,
    surface: Box<dyn FrontBufferSurface>,
    _source: Box<dyn SurfaceSource>,
    kms: Rc<dyn KmsAdapter>,
    layout: SurfaceLayout,
}

impl GbmBackend {
    pub fn new(
        source: Box<dyn SurfaceSource>,
        kms: Rc<dyn KmsAdapter>,
        request: &SurfaceRequest,
    ) -> Result<Self> {
        let layout = SurfaceLayout::negotiate(request.modifier, kms.supports_modifiers())?;
        let surface = source
            .create_surface(request.width, request.height, &layout)
            .map_err(PresentError::op("gbm_surface_create"))?;
        info!(
            "GbmBackend: {}x{} surface, layout {:?}",
            request.width, request.height, layout
        );
        Ok(GbmBackend {
            locked: Vec::new(),
            surface,
            _source: source,
            kms,
            layout,
        })
    }

    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }

    pub fn native_window(&self) -> *mut c_void {
        self.surface.native_window()
    }

    pub fn locked_count(&self) -> usize {
        self.locked.len()
    }
}

impl fmt::Debug for GbmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmBackend")
            .field("layout", &self.layout)
            .field("locked", &self.locked.len())
            .finish()
    }
}

impl SurfaceBackend for GbmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gbm
    }

    fn prepare_render_targets(&mut self, _render: &mut dyn RenderContext) -> Result<()> {
        Ok(())
    }

    fn next_buffer(&mut self) -> Result<PresentableBuffer> {
        let mut locked = self
            .surface
            .lock_front_buffer()
            .map_err(|err| PresentError::NoBuffer(format!("gbm_surface_lock_front_buffer: {err:#}")))?;
        let framebuffer = match locked.framebuffer() {
            Some(framebuffer) => framebuffer,
            None => {
                let framebuffer = Rc::new(Framebuffer::register(&self.kms, locked.layout())?);
                debug!("GbmBackend: wrapped new buffer as {}", framebuffer.id());
                locked.attach_framebuffer(Rc::clone(&framebuffer));
                framebuffer
            }
        };
        self.locked.push(locked);
        Ok(PresentableBuffer::new(framebuffer, None))
    }

    fn release(&mut self, buffer: &PresentableBuffer) -> Result<()> {
        let position = self
            .locked
            .iter()
            .position(|locked| locked.framebuffer().map(|fb| fb.id()) == Some(buffer.fb_id()))
            .ok_or_else(|| PresentError::NoBuffer(format!("{} is not locked", buffer.fb_id())))?;
        drop(self.locked.remove(position));
        Ok(())
    }

    fn flush_frame(&mut self, render: &mut dyn RenderContext) -> Result<()> {
        render.swap_buffers().map_err(PresentError::op("eglSwapBuffers"))
    }
}
