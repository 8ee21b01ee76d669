// src/kms/mod.rs

//! Kernel mode-setting: the adapter seam, commit requests, fences,
//! framebuffer wrapping and display target selection.

pub mod adapter;
pub mod commit;
pub mod drm_adapter;
pub mod fence;
pub mod framebuffer;
pub mod target;

#[cfg(test)]
pub(crate) mod mock;

pub use adapter::{FbId, KmsAdapter, KmsEvent, ObjectId, ObjectKind, PropertyId, PropertyTable};
pub use commit::{CommitFlags, CommitRequest, ObjectProperties, PropertyWrite};
pub use drm_adapter::DrmAdapter;
pub use fence::{FenceFd, FenceKind};
pub use framebuffer::{BufferLayout, Framebuffer};
pub use target::{DisplayTarget, ModeInfo, ResourceSnapshot};
