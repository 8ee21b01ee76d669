// src/surface/gbm_device.rs

//! `SurfaceSource` on a real GBM device, via the `gbm` crate.

use std::ffi::c_void;
use std::fmt;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use drm::buffer::PlanarBuffer;
use gbm::{AsRaw, BufferObject, BufferObjectFlags, Format, Modifier, Surface};

use crate::kms::{BufferLayout, Framebuffer};
use crate::surface::gbm_backend::{FrontBufferSurface, LockedBuffer, SurfaceLayout, SurfaceSource};

pub struct GbmSurfaceSource {
    device: gbm::Device<OwnedFd>,
}

impl GbmSurfaceSource {
    pub fn new(fd: OwnedFd) -> Result<Self> {
        let device = gbm::Device::new(fd).context("gbm_create_device")?;
        Ok(GbmSurfaceSource { device })
    }
}

impl fmt::Debug for GbmSurfaceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmSurfaceSource")
            .field("backend", &self.device.backend_name())
            .finish()
    }
}

impl SurfaceSource for GbmSurfaceSource {
    fn create_surface(
        &self,
        width: u32,
        height: u32,
        layout: &SurfaceLayout,
    ) -> Result<Box<dyn FrontBufferSurface>> {
        let surface = match layout {
            SurfaceLayout::Modifiers(modifiers) => self
                .device
                .create_surface_with_modifiers::<Rc<Framebuffer>>(
                    width,
                    height,
                    Format::Xrgb8888,
                    modifiers.iter().map(|&m| Modifier::from(m)),
                )
                .context("gbm_surface_create_with_modifiers")?,
            SurfaceLayout::Implicit => self
                .device
                .create_surface::<Rc<Framebuffer>>(
                    width,
                    height,
                    Format::Xrgb8888,
                    BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
                )
                .context("gbm_surface_create")?,
        };
        Ok(Box::new(GbmFrontBuffers { surface }))
    }
}

struct GbmFrontBuffers {
    surface: Surface<Rc<Framebuffer>>,
}

impl fmt::Debug for GbmFrontBuffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmFrontBuffers").finish_non_exhaustive()
    }
}

impl FrontBufferSurface for GbmFrontBuffers {
    fn lock_front_buffer(&mut self) -> Result<Box<dyn LockedBuffer>> {
        // SAFETY: the surface manager locks only after end_frame swapped the surface.
        let bo = unsafe { self.surface.lock_front_buffer() }
            .map_err(|err| anyhow!("no front buffer available: {err:?}"))?;
        Ok(Box::new(GbmLockedBuffer { bo }))
    }

    fn native_window(&self) -> *mut c_void {
        self.surface.as_raw() as *mut c_void
    }
}

struct GbmLockedBuffer {
    bo: BufferObject<Rc<Framebuffer>>,
}

impl fmt::Debug for GbmLockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmLockedBuffer")
            .field("size", &PlanarBuffer::size(&self.bo))
            .finish()
    }
}

impl LockedBuffer for GbmLockedBuffer {
    fn layout(&self) -> BufferLayout {
        let (width, height) = PlanarBuffer::size(&self.bo);
        BufferLayout {
            width,
            height,
            format: PlanarBuffer::format(&self.bo),
            handles: PlanarBuffer::handles(&self.bo).map(|h| h.map_or(0, u32::from)),
            pitches: PlanarBuffer::pitches(&self.bo),
            offsets: PlanarBuffer::offsets(&self.bo),
            modifier: PlanarBuffer::modifier(&self.bo).map(u64::from),
        }
    }

    fn framebuffer(&self) -> Option<Rc<Framebuffer>> {
        self.bo.userdata().cloned()
    }

    fn attach_framebuffer(&mut self, framebuffer: Rc<Framebuffer>) {
        let _ = self.bo.set_userdata(framebuffer);
    }
}
