// src/render/mod.rs

//! The rendering collaborator seam.
//!
//! Context bootstrap, shaders and the content itself live outside this
//! crate. The pipeline only needs the per-frame draw callback, buffer
//! swaps/flushes and the fence primitives of the GPU API, expressed by
//! `RenderContext`.

use anyhow::Result;
use bitflags::bitflags;

use crate::kms::FenceFd;
use crate::surface::allocator::AllocationExport;

#[cfg(test)]
pub(crate) mod mock;

bitflags! {
    /// Fence extensions the GPU API exposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FenceSupport: u32 {
        /// Fences exportable to / importable from sync-file descriptors.
        const NATIVE_FENCE_FD = 1 << 0;
        const CREATE_SYNC = 1 << 1;
        const DESTROY_SYNC = 1 << 2;
        /// Server-side (GPU) wait on a sync object.
        const WAIT_SYNC = 1 << 3;
        /// CPU wait on a sync object.
        const CLIENT_WAIT_SYNC = 1 << 4;
    }
}

impl FenceSupport {
    /// Everything the non-blocking atomic pipeline relies on.
    pub const PIPELINED: FenceSupport = FenceSupport::all();

    /// Enough to wait for display fences on the GPU side.
    pub const GPU_WAIT: FenceSupport = FenceSupport::CREATE_SYNC
        .union(FenceSupport::DESTROY_SYNC)
        .union(FenceSupport::WAIT_SYNC)
        .union(FenceSupport::CLIENT_WAIT_SYNC);
}

/// GPU-side sync object owned by the rendering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncHandle(pub usize);

pub trait RenderContext {
    /// Renders frame `frame` into the currently bound target.
    fn draw(&mut self, frame: u64) -> Result<()>;

    fn fence_support(&self) -> FenceSupport;

    /// Inserts a fence after the work queued so far. `None` when the API
    /// cannot create exportable fences.
    fn insert_gpu_fence(&mut self) -> Result<Option<SyncHandle>>;

    /// Exports `sync` as a sync-file descriptor and destroys the sync object.
    fn export_fence_fd(&mut self, sync: SyncHandle) -> Result<FenceFd>;

    /// Presents the window surface (GBM backend).
    fn swap_buffers(&mut self) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Blocks until all queued GPU work has completed.
    fn finish(&mut self) -> Result<()>;

    /// Wraps `fence` into a sync object. The context owns the descriptor from
    /// here on.
    fn import_fence(&mut self, fence: FenceFd) -> Result<SyncHandle>;

    /// Makes subsequent GPU work wait for `sync`, without blocking the CPU.
    fn wait_on_gpu(&mut self, sync: SyncHandle) -> Result<()>;

    /// Blocks the calling thread until `sync` signals.
    fn client_wait(&mut self, sync: SyncHandle) -> Result<()>;

    fn destroy_sync(&mut self, sync: SyncHandle);

    /// Imports pool slot `slot` as a GPU memory object bound to a texture and
    /// framebuffer (Allocator backend).
    fn import_render_target(
        &mut self,
        slot: usize,
        width: u32,
        height: u32,
        allocation: &AllocationExport,
    ) -> Result<()>;

    fn bind_render_target(&mut self, slot: usize) -> Result<()>;
}
