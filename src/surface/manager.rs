// src/surface/manager.rs

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::rc::Rc;

use log::{debug, info, trace, warn};

use crate::config::BackendKind;
use crate::error::{PresentError, Result};
use crate::kms::{FbId, FenceFd, KmsAdapter};
use crate::render::{FenceSupport, RenderContext};
use crate::surface::allocator::{AllocatorBackend, AllocatorDevice};
use crate::surface::gbm_backend::{GbmBackend, SurfaceSource};
use crate::surface::{Backend, BufferState, PresentableBuffer, SurfaceBackend, SurfaceRequest};

/// Backends the bootstrap could open on the allocation device.
#[derive(Debug, Default)]
pub struct BackendSources {
    pub allocator: Option<Box<dyn AllocatorDevice>>,
    pub gbm: Option<Box<dyn SurfaceSource>>,
}

/// Backend-agnostic buffer lifecycle facade handed to the commit engine.
#[derive(Debug)]
pub struct SurfaceManager {
    backend: Backend,
    width: u32,
    height: u32,
    states: HashMap<FbId, BufferState>,
}

impl SurfaceManager {
    /// Binds the manager to the first backend that initializes, trying
    /// `preference` before the other one.
    pub fn init(
        kms: Rc<dyn KmsAdapter>,
        mut sources: BackendSources,
        request: &SurfaceRequest,
        preference: BackendKind,
    ) -> Result<Self> {
        for kind in [preference, preference.other()] {
            let attempt = match kind {
                BackendKind::Allocator => match sources.allocator.take() {
                    Some(device) => {
                        AllocatorBackend::new(device, Rc::clone(&kms), request).map(Backend::Allocator)
                    }
                    None => {
                        debug!("SurfaceManager: allocator backend not available");
                        continue;
                    }
                },
                BackendKind::Gbm => match sources.gbm.take() {
                    Some(source) => GbmBackend::new(source, Rc::clone(&kms), request).map(Backend::Gbm),
                    None => {
                        debug!("SurfaceManager: GBM backend not available");
                        continue;
                    }
                },
            };
            match attempt {
                Ok(backend) => {
                    info!("SurfaceManager: using the {kind:?} backend");
                    return Ok(Self::with_backend(backend, request));
                }
                Err(err) => warn!("SurfaceManager: {kind:?} backend failed ({err}), trying the next one"),
            }
        }
        Err(PresentError::NoUsableBackend)
    }

    pub fn with_backend(backend: Backend, request: &SurfaceRequest) -> Self {
        SurfaceManager {
            backend,
            width: request.width,
            height: request.height,
            states: HashMap::new(),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Native window for the renderer's window surface (GBM backend only).
    pub fn native_window(&self) -> *mut c_void {
        match &self.backend {
            Backend::Gbm(gbm) => gbm.native_window(),
            Backend::Allocator(_) => ptr::null_mut(),
        }
    }

    pub fn prepare_render_targets(&mut self, render: &mut dyn RenderContext) -> Result<()> {
        self.backend.prepare_render_targets(render)
    }

    /// The buffer that was just rendered, now ready to post.
    pub fn next_buffer(&mut self) -> Result<PresentableBuffer> {
        let buffer = self.backend.next_buffer()?;
        if let Some(BufferState::Posted) = self.states.insert(buffer.fb_id(), BufferState::Rendering) {
            warn!("SurfaceManager: {} handed out while still posted", buffer.fb_id());
        }
        trace!("SurfaceManager: {} rendering", buffer.fb_id());
        Ok(buffer)
    }

    /// Records that `buffer` is referenced by the latest commit.
    pub fn mark_posted(&mut self, buffer: &PresentableBuffer) {
        self.states.insert(buffer.fb_id(), BufferState::Posted);
    }

    /// Gives a superseded buffer back. Call only after a newer buffer was committed.
    pub fn release_buffer(&mut self, buffer: PresentableBuffer) -> Result<()> {
        match self.states.get(&buffer.fb_id()) {
            Some(BufferState::Posted) => {}
            state => warn!(
                "SurfaceManager: releasing {} from state {:?}",
                buffer.fb_id(),
                state
            ),
        }
        self.backend.release(&buffer)?;
        self.states.insert(buffer.fb_id(), BufferState::Free);
        trace!("SurfaceManager: {} free", buffer.fb_id());
        Ok(())
    }

    /// Finishes GPU work for the frame.
    ///
    /// Returns the GPU completion fence when the renderer can export one.
    /// Otherwise waits for the GPU to go idle and returns `None`.
    pub fn end_frame(&mut self, render: &mut dyn RenderContext) -> Result<Option<FenceFd>> {
        let sync = if render.fence_support().contains(FenceSupport::NATIVE_FENCE_FD) {
            render
                .insert_gpu_fence()
                .map_err(PresentError::op("eglCreateSyncKHR"))?
        } else {
            None
        };
        self.backend.flush_frame(render)?;
        match sync {
            Some(sync) => {
                let fence = render
                    .export_fence_fd(sync)
                    .map_err(PresentError::op("eglDupNativeFenceFDANDROID"))?;
                Ok(Some(fence))
            }
            None => {
                render.finish().map_err(PresentError::op("glFinish"))?;
                Ok(None)
            }
        }
    }

    pub fn buffer_state(&self, fb: FbId) -> BufferState {
        self.states.get(&fb).copied().unwrap_or(BufferState::Free)
    }
}
