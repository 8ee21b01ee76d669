// src/render/mock.rs

use anyhow::{bail, Result};

use crate::kms::mock::{signaled_fence, Entry, Journal};
use crate::kms::{FenceFd, FenceKind};
use crate::render::{FenceSupport, RenderContext, SyncHandle};
use crate::surface::allocator::AllocationExport;

#[derive(Debug)]
pub struct MockRender {
    journal: Journal,
    support: FenceSupport,
    next_sync: usize,
    fail_draw_at: Option<u64>,
}

impl MockRender {
    pub fn new(journal: &Journal, support: FenceSupport) -> Self {
        MockRender {
            journal: journal.clone(),
            support,
            next_sync: 0,
            fail_draw_at: None,
        }
    }

    pub fn failing_draw_at(mut self, frame: u64) -> Self {
        self.fail_draw_at = Some(frame);
        self
    }

    fn sync(&mut self) -> SyncHandle {
        self.next_sync += 1;
        SyncHandle(self.next_sync)
    }
}

impl RenderContext for MockRender {
    fn draw(&mut self, frame: u64) -> Result<()> {
        if self.fail_draw_at == Some(frame) {
            bail!("draw {frame} failed");
        }
        self.journal.push(Entry::Draw(frame));
        Ok(())
    }

    fn fence_support(&self) -> FenceSupport {
        self.support
    }

    fn insert_gpu_fence(&mut self) -> Result<Option<SyncHandle>> {
        if self.support.contains(FenceSupport::NATIVE_FENCE_FD) {
            Ok(Some(self.sync()))
        } else {
            Ok(None)
        }
    }

    fn export_fence_fd(&mut self, _sync: SyncHandle) -> Result<FenceFd> {
        Ok(signaled_fence(FenceKind::GpuCompletion)?)
    }

    fn swap_buffers(&mut self) -> Result<()> {
        self.journal.push(Entry::SwapBuffers);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.journal.push(Entry::Flush);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.journal.push(Entry::Finish);
        Ok(())
    }

    fn import_fence(&mut self, fence: FenceFd) -> Result<SyncHandle> {
        drop(fence);
        let sync = self.sync();
        self.journal.push(Entry::ImportFence(sync));
        Ok(sync)
    }

    fn wait_on_gpu(&mut self, sync: SyncHandle) -> Result<()> {
        self.journal.push(Entry::GpuWait(sync));
        Ok(())
    }

    fn client_wait(&mut self, sync: SyncHandle) -> Result<()> {
        self.journal.push(Entry::ClientWait(sync));
        Ok(())
    }

    fn destroy_sync(&mut self, sync: SyncHandle) {
        self.journal.push(Entry::DestroySync(sync));
    }

    fn import_render_target(
        &mut self,
        slot: usize,
        _width: u32,
        _height: u32,
        _allocation: &AllocationExport,
    ) -> Result<()> {
        self.journal.push(Entry::ImportTarget(slot));
        Ok(())
    }

    fn bind_render_target(&mut self, slot: usize) -> Result<()> {
        self.journal.push(Entry::BindTarget(slot));
        Ok(())
    }
}
