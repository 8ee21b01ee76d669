// src/surface/mod.rs

//! Buffer lifecycle management.
//!
//! `SurfaceManager` hands out presentable buffers, tracks their state and
//! recycles them once superseded on screen. The buffers come from exactly
//! one backend, chosen at init:
//!
//! - **GBM**: a driver surface, implicitly multi-buffered; buffers are
//!   wrapped into framebuffers on first sight and memoized on the buffer.
//! - **Allocator**: a fixed pool of explicitly allocated buffers cycled
//!   round-robin; everything is wired before the first frame.

use std::rc::Rc;

use crate::config::BackendKind;
use crate::error::Result;
use crate::kms::{FbId, Framebuffer};
use crate::render::RenderContext;

pub mod allocator;
pub mod gbm_backend;
pub mod gbm_device;
mod manager;

#[cfg(test)]
pub(crate) mod mock;

pub use allocator::{AllocatorBackend, AllocatorDevice};
pub use gbm_backend::{GbmBackend, SurfaceSource};
pub use gbm_device::GbmSurfaceSource;
pub use manager::{BackendSources, SurfaceManager};

/// Where a buffer is in its `Free -> Rendering -> Posted -> Free` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Rendering,
    Posted,
}

/// A scanout-registered buffer handed to the commit engine.
///
/// Cheap to clone; clones refer to the same framebuffer.
#[derive(Debug, Clone)]
pub struct PresentableBuffer {
    framebuffer: Rc<Framebuffer>,
    slot: Option<usize>,
}

impl PresentableBuffer {
    pub fn new(framebuffer: Rc<Framebuffer>, slot: Option<usize>) -> Self {
        PresentableBuffer { framebuffer, slot }
    }

    pub fn fb_id(&self) -> FbId {
        self.framebuffer.id()
    }

    /// Pool slot (Allocator backend only).
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn is_same(&self, other: &PresentableBuffer) -> bool {
        Rc::ptr_eq(&self.framebuffer, &other.framebuffer)
    }
}

/// Dimensions and layout wish for the buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceRequest {
    pub width: u32,
    pub height: u32,
    pub modifier: Option<u64>,
}

/// Operations every backend provides to the manager.
pub trait SurfaceBackend {
    fn kind(&self) -> BackendKind;

    /// One-time GPU-side setup before the first frame.
    fn prepare_render_targets(&mut self, render: &mut dyn RenderContext) -> Result<()>;

    fn next_buffer(&mut self) -> Result<PresentableBuffer>;

    fn release(&mut self, buffer: &PresentableBuffer) -> Result<()>;

    /// Backend half of end-of-frame: swap (GBM) or rebind and flush (Allocator).
    fn flush_frame(&mut self, render: &mut dyn RenderContext) -> Result<()>;
}

/// The one backend a manager is bound to.
#[derive(Debug)]
pub enum Backend {
    Gbm(GbmBackend),
    Allocator(AllocatorBackend),
}

impl Backend {
    fn as_dyn(&mut self) -> &mut dyn SurfaceBackend {
        match self {
            Backend::Gbm(backend) => backend,
            Backend::Allocator(backend) => backend,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Gbm(_) => BackendKind::Gbm,
            Backend::Allocator(_) => BackendKind::Allocator,
        }
    }
}

impl SurfaceBackend for Backend {
    fn kind(&self) -> BackendKind {
        Backend::kind(self)
    }

    fn prepare_render_targets(&mut self, render: &mut dyn RenderContext) -> Result<()> {
        self.as_dyn().prepare_render_targets(render)
    }

    fn next_buffer(&mut self) -> Result<PresentableBuffer> {
        self.as_dyn().next_buffer()
    }

    fn release(&mut self, buffer: &PresentableBuffer) -> Result<()> {
        self.as_dyn().release(buffer)
    }

    fn flush_frame(&mut self, render: &mut dyn RenderContext) -> Result<()> {
        self.as_dyn().flush_frame(render)
    }
}
