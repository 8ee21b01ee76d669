// src/engine/atomic.rs

//! Atomic commit engine.
//!
//! One transaction per frame. The GPU completion fence of the frame is
//! attached to the plane as its in-fence, and the kernel hands back an
//! out-fence that signals once the commit's resources are free. Before the
//! next commit the engine waits for that out-fence, so there is never more
//! than one commit outstanding on the CRTC.
//!
//! Per-frame order:
//!
//! 1. Turn the previous out-fence into a GPU-side wait (or keep it for a CPU wait).
//! 2. Draw and end the frame, yielding the GPU fence.
//! 3. Take the buffer just rendered.
//! 4. Block until the previous out-fence has signaled.
//! 5. Commit the buffer; mode-set on the first commit only.
//! 6. Release the buffer the commit superseded.

use std::rc::Rc;

use log::{debug, info, trace, warn};

use crate::engine::{EngineOptions, RunStatus};
use crate::error::{PresentError, Result};
use crate::kms::{
    CommitFlags, CommitRequest, DisplayTarget, FenceFd, KmsAdapter, ObjectId, ObjectKind,
    ObjectProperties, PropertyId,
};
use crate::render::{FenceSupport, RenderContext, SyncHandle};
use crate::surface::{PresentableBuffer, SurfaceManager};

/// The previous commit's out-fence, in whichever form it is being waited on.
#[derive(Debug)]
enum PendingWait {
    Gpu(SyncHandle),
    Cpu(FenceFd),
}

#[derive(Debug)]
pub struct AtomicEngine {
    kms: Rc<dyn KmsAdapter>,
    target: DisplayTarget,
    plane: ObjectId,
    props: ObjectProperties,
    options: EngineOptions,
    /// `None` until fence support was negotiated.
    nonblocking: Option<bool>,
    gpu_wait: bool,
    modeset_pending: bool,
    out_fence: Option<FenceFd>,
}

impl AtomicEngine {
    pub fn new(kms: Rc<dyn KmsAdapter>, target: DisplayTarget, options: EngineOptions) -> Result<Self> {
        kms.enable_atomic().map_err(|err| {
            PresentError::capability(format!("no atomic modesetting support ({err})"))
        })?;
        let plane = target
            .plane
            .ok_or_else(|| PresentError::capability("could not find a suitable plane"))?;
        let props = ObjectProperties {
            plane: kms
                .object_properties(plane, ObjectKind::Plane)
                .map_err(PresentError::op("drmModeObjectGetProperties(plane)"))?,
            crtc: kms
                .object_properties(target.crtc, ObjectKind::Crtc)
                .map_err(PresentError::op("drmModeObjectGetProperties(crtc)"))?,
            connector: kms
                .object_properties(target.connector, ObjectKind::Connector)
                .map_err(PresentError::op("drmModeObjectGetProperties(connector)"))?,
        };
        debug!(
            "AtomicEngine: {} plane, {} crtc, {} connector properties",
            props.plane.len(),
            props.crtc.len(),
            props.connector.len()
        );
        Ok(AtomicEngine {
            kms,
            target,
            plane,
            props,
            options,
            nonblocking: None,
            gpu_wait: false,
            modeset_pending: true,
            out_fence: None,
        })
    }

    /// Decides the commit policy once; later calls keep the first answer.
    pub fn negotiate(&mut self, support: FenceSupport) -> bool {
        if let Some(nonblocking) = self.nonblocking {
            return nonblocking;
        }
        let nonblocking = support.contains(FenceSupport::PIPELINED);
        if nonblocking {
            info!("AtomicEngine: fence extensions present, using non-blocking commits");
        } else {
            warn!(
                "AtomicEngine: missing fence support {:?}, falling back to blocking commits",
                FenceSupport::PIPELINED.difference(support)
            );
        }
        self.gpu_wait = support.contains(FenceSupport::GPU_WAIT);
        self.nonblocking = Some(nonblocking);
        nonblocking
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.unwrap_or(false)
    }

    pub fn target(&self) -> &DisplayTarget {
        &self.target
    }

    pub fn run(&mut self, surfaces: &mut SurfaceManager, render: &mut dyn RenderContext) -> Result<RunStatus> {
        self.negotiate(render.fence_support());
        surfaces.prepare_render_targets(render)?;

        let mut posted: Option<PresentableBuffer> = None;
        let mut frames = 0u64;
        loop {
            if self.options.limit_reached(frames) {
                info!("AtomicEngine: frame limit reached after {frames} frames");
                return Ok(RunStatus::Completed { frames });
            }

            let pending = match self.out_fence.take() {
                Some(fence) => Some(self.begin_wait(render, fence)?),
                None => None,
            };

            let (gpu_fence, buffer) = match render_frame(surfaces, render, frames) {
                Ok(rendered) => rendered,
                Err(err) => {
                    if let Some(PendingWait::Gpu(sync)) = pending {
                        render.destroy_sync(sync);
                    }
                    return Err(err);
                }
            };

            if let Some(pending) = pending {
                self.finish_wait(render, pending)?;
            }

            self.commit(&buffer, gpu_fence)?;
            surfaces.mark_posted(&buffer);
            if let Some(previous) = posted.replace(buffer) {
                surfaces.release_buffer(previous)?;
            }
            frames += 1;
        }
    }

    fn begin_wait(&mut self, render: &mut dyn RenderContext, fence: FenceFd) -> Result<PendingWait> {
        if !self.gpu_wait {
            return Ok(PendingWait::Cpu(fence));
        }
        let sync = render
            .import_fence(fence)
            .map_err(PresentError::op("eglCreateSyncKHR(native fence)"))?;
        if let Err(err) = render.wait_on_gpu(sync) {
            render.destroy_sync(sync);
            return Err(PresentError::resource("eglWaitSyncKHR", err));
        }
        Ok(PendingWait::Gpu(sync))
    }

    fn finish_wait(&mut self, render: &mut dyn RenderContext, pending: PendingWait) -> Result<()> {
        match pending {
            PendingWait::Gpu(sync) => {
                let waited = render.client_wait(sync);
                render.destroy_sync(sync);
                waited.map_err(PresentError::op("eglClientWaitSyncKHR"))
            }
            PendingWait::Cpu(fence) => {
                fence.wait(None).map_err(PresentError::op("poll(out fence)"))?;
                Ok(())
            }
        }
    }

    fn prop(&self, kind: ObjectKind, name: &str) -> Result<PropertyId> {
        self.props.lookup(kind, name)
    }

    /// Builds the full request for this frame from scratch and submits it.
    fn commit(&mut self, buffer: &PresentableBuffer, in_fence: Option<FenceFd>) -> Result<()> {
        let (width, height) = self.target.size();
        let crtc = self.target.crtc;

        let mut flags = if self.is_nonblocking() {
            CommitFlags::NONBLOCK
        } else {
            CommitFlags::empty()
        };
        if self.modeset_pending {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        let mut request = CommitRequest::new(flags);

        let mut blob = None;
        if self.modeset_pending {
            let connector_crtc = self.prop(ObjectKind::Connector, "CRTC_ID")?;
            let mode_id = self.prop(ObjectKind::Crtc, "MODE_ID")?;
            let active = self.prop(ObjectKind::Crtc, "ACTIVE")?;
            let id = self
                .kms
                .create_mode_blob(&self.target.mode)
                .map_err(PresentError::op("drmModeCreatePropertyBlob"))?;
            blob = Some(id);
            request.set(self.target.connector, connector_crtc, u64::from(crtc));
            request.set(crtc, mode_id, id);
            request.set(crtc, active, 1);
        }

        let geometry = [
            ("FB_ID", u64::from(buffer.fb_id().0)),
            ("CRTC_ID", u64::from(crtc)),
            ("SRC_X", 0),
            ("SRC_Y", 0),
            ("SRC_W", u64::from(width) << 16),
            ("SRC_H", u64::from(height) << 16),
            ("CRTC_X", 0),
            ("CRTC_Y", 0),
            ("CRTC_W", u64::from(width)),
            ("CRTC_H", u64::from(height)),
        ];
        let submitted = self.fill_and_submit(request, &geometry, in_fence);

        if let Some(id) = blob {
            if let Err(err) = self.kms.destroy_blob(id) {
                warn!("AtomicEngine: failed to destroy mode blob {id}: {err}");
            }
        }
        let out_fence = submitted?;
        if self.modeset_pending {
            info!(
                "AtomicEngine: mode {} set on crtc {}",
                self.target.mode.name, self.target.crtc
            );
            self.modeset_pending = false;
        }
        trace!(
            "AtomicEngine: committed {} (out fence: {})",
            buffer.fb_id(),
            out_fence.is_some()
        );
        self.out_fence = out_fence;
        Ok(())
    }

    fn fill_and_submit(
        &self,
        mut request: CommitRequest,
        geometry: &[(&str, u64)],
        in_fence: Option<FenceFd>,
    ) -> Result<Option<FenceFd>> {
        for (name, value) in geometry {
            request.set(self.plane, self.prop(ObjectKind::Plane, name)?, *value);
        }
        if let Some(fence) = in_fence {
            let out_fence_ptr = self.prop(ObjectKind::Crtc, "OUT_FENCE_PTR")?;
            let in_fence_fd = self.prop(ObjectKind::Plane, "IN_FENCE_FD")?;
            request.request_out_fence(self.target.crtc, out_fence_ptr);
            request.attach_in_fence(self.plane, in_fence_fd, fence);
        }
        self.kms.atomic_commit(request).map_err(|err| {
            if err.raw_os_error() == Some(libc::EBUSY) {
                PresentError::Protocol {
                    op: "drmModeAtomicCommit",
                    source: err,
                }
            } else {
                PresentError::resource("drmModeAtomicCommit", err)
            }
        })
    }
}

/// Draws frame `frame` and takes the buffer it landed in.
fn render_frame(
    surfaces: &mut SurfaceManager,
    render: &mut dyn RenderContext,
    frame: u64,
) -> Result<(Option<FenceFd>, PresentableBuffer)> {
    render.draw(frame).map_err(PresentError::op("draw"))?;
    let gpu_fence = surfaces.end_frame(render)?;
    Ok((gpu_fence, surfaces.next_buffer()?))
}
