// src/engine/legacy.rs

//! Legacy commit engine: set the mode once, then page-flip every frame and
//! wait for the flip-completion event. No fences; ordering comes from the
//! kernel flip queue.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, trace};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::config::BackendKind;
use crate::engine::{EngineOptions, RunStatus};
use crate::error::{PresentError, Result};
use crate::kms::{DisplayTarget, KmsAdapter, KmsEvent};
use crate::render::RenderContext;
use crate::surface::{PresentableBuffer, SurfaceManager};

/// Upper bound on waiting for one flip-completion event.
const FLIP_TIMEOUT: Duration = Duration::from_secs(3);

/// Descriptor whose readiness aborts the loop cooperatively.
#[derive(Debug)]
pub enum InterruptSource {
    /// Console input.
    Stdin,
    Fd(OwnedFd),
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlipWait {
    Completed,
    Interrupted,
}

#[derive(Debug)]
pub struct LegacyEngine {
    kms: Rc<dyn KmsAdapter>,
    target: DisplayTarget,
    options: EngineOptions,
    interrupt: InterruptSource,
    flip_timeout: Duration,
}

impl LegacyEngine {
    pub fn new(kms: Rc<dyn KmsAdapter>, target: DisplayTarget, options: EngineOptions) -> Self {
        LegacyEngine {
            kms,
            target,
            options,
            interrupt: InterruptSource::Stdin,
            flip_timeout: FLIP_TIMEOUT,
        }
    }

    pub fn with_interrupt_source(mut self, interrupt: InterruptSource) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_flip_timeout(mut self, timeout: Duration) -> Self {
        self.flip_timeout = timeout;
        self
    }

    pub fn run(&mut self, surfaces: &mut SurfaceManager, render: &mut dyn RenderContext) -> Result<RunStatus> {
        if surfaces.backend_kind() != BackendKind::Gbm {
            return Err(PresentError::capability("legacy modesetting requires the GBM backend"));
        }
        if self.options.limit_reached(0) {
            return Ok(RunStatus::Completed { frames: 0 });
        }
        surfaces.prepare_render_targets(render)?;

        let mut frames = 0u64;
        render.draw(frames).map_err(PresentError::op("draw"))?;
        // Flip ordering covers GPU completion; any exported fence is closed here.
        drop(surfaces.end_frame(render)?);
        let mut current = surfaces.next_buffer()?;
        self.kms
            .set_crtc(self.target.crtc, current.fb_id(), self.target.connector, &self.target.mode)
            .map_err(PresentError::op("drmModeSetCrtc"))?;
        info!(
            "LegacyEngine: mode {} set on crtc {}",
            self.target.mode.name, self.target.crtc
        );
        surfaces.mark_posted(&current);
        frames += 1;

        loop {
            if self.options.limit_reached(frames) {
                info!("LegacyEngine: frame limit reached after {frames} frames");
                return Ok(RunStatus::Completed { frames });
            }

            render.draw(frames).map_err(PresentError::op("draw"))?;
            drop(surfaces.end_frame(render)?);
            let next = surfaces.next_buffer()?;

            self.kms
                .page_flip(self.target.crtc, next.fb_id())
                .map_err(PresentError::op("drmModePageFlip"))?;
            if self.wait_for_flip()? == FlipWait::Interrupted {
                info!("LegacyEngine: user interrupted");
                return Ok(RunStatus::Interrupted);
            }

            surfaces.mark_posted(&next);
            let previous: PresentableBuffer = std::mem::replace(&mut current, next);
            surfaces.release_buffer(previous)?;
            trace!("LegacyEngine: frame {frames} on screen");
            frames += 1;
        }
    }

    /// Blocks until the flip for our CRTC completes.
    fn wait_for_flip(&self) -> Result<FlipWait> {
        let stdin = io::stdin();
        let timeout = PollTimeout::from(u16::try_from(self.flip_timeout.as_millis()).unwrap_or(u16::MAX));
        loop {
            let mut fds = vec![PollFd::new(self.kms.event_fd(), PollFlags::POLLIN)];
            match &self.interrupt {
                InterruptSource::Stdin => fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLIN)),
                InterruptSource::Fd(fd) => fds.push(PollFd::new(fd.as_fd(), PollFlags::POLLIN)),
                InterruptSource::Disabled => {}
            }

            match poll(&mut fds, timeout) {
                Ok(0) => return Err(PresentError::Timeout("page flip completion")),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(PresentError::resource("poll", err)),
            }

            if fds.get(1).is_some_and(is_readable) {
                return Ok(FlipWait::Interrupted);
            }
            if !is_readable(&fds[0]) {
                continue;
            }
            let events = self
                .kms
                .receive_events()
                .map_err(PresentError::op("drmHandleEvent"))?;
            for event in events {
                match event {
                    KmsEvent::PageFlip { crtc, frame } if crtc == self.target.crtc => {
                        trace!("LegacyEngine: flip complete (sequence {frame})");
                        return Ok(FlipWait::Completed);
                    }
                    other => debug!("LegacyEngine: ignoring {other:?}"),
                }
            }
        }
    }
}

fn is_readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|events| events.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP))
}
