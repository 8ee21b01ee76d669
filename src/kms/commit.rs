// src/kms/commit.rs

//! Atomic commit requests.
//!
//! A request is a list of (object, property, value) writes plus flags. An
//! attached in-fence is owned by the request until submission.

use bitflags::bitflags;

use crate::error::{PresentError, Result};
use crate::kms::adapter::{ObjectId, ObjectKind, PropertyId, PropertyTable};
use crate::kms::fence::FenceFd;

bitflags! {
    /// Commit flags, using the kernel's bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 0x0001;
        const TEST_ONLY = 0x0100;
        const NONBLOCK = 0x0200;
        const ALLOW_MODESET = 0x0400;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    pub object: ObjectId,
    pub property: PropertyId,
    pub value: u64,
}

#[derive(Debug)]
pub struct CommitRequest {
    flags: CommitFlags,
    writes: Vec<PropertyWrite>,
    in_fence: Option<FenceFd>,
    out_fence: Option<(ObjectId, PropertyId)>,
}

impl CommitRequest {
    pub fn new(flags: CommitFlags) -> Self {
        CommitRequest {
            flags,
            writes: Vec::new(),
            in_fence: None,
            out_fence: None,
        }
    }

    pub fn set(&mut self, object: ObjectId, property: PropertyId, value: u64) {
        self.writes.push(PropertyWrite {
            object,
            property,
            value,
        });
    }

    /// Makes the display wait on `fence` before scanning out; the request
    /// takes ownership of the descriptor.
    pub fn attach_in_fence(&mut self, object: ObjectId, property: PropertyId, fence: FenceFd) {
        use std::os::fd::AsRawFd;
        self.set(object, property, fence.as_raw_fd() as u64);
        self.in_fence = Some(fence);
    }

    /// Asks the kernel to return a completion fence for this commit.
    pub fn request_out_fence(&mut self, object: ObjectId, property: PropertyId) {
        self.out_fence = Some((object, property));
    }

    pub fn flags(&self) -> CommitFlags {
        self.flags
    }

    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    pub fn in_fence(&self) -> Option<&FenceFd> {
        self.in_fence.as_ref()
    }

    pub fn out_fence_target(&self) -> Option<(ObjectId, PropertyId)> {
        self.out_fence
    }

    pub fn is_modeset(&self) -> bool {
        self.flags.contains(CommitFlags::ALLOW_MODESET)
    }
}

/// Property tables of the three objects a commit touches, loaded once.
#[derive(Debug, Clone)]
pub struct ObjectProperties {
    pub plane: PropertyTable,
    pub crtc: PropertyTable,
    pub connector: PropertyTable,
}

impl ObjectProperties {
    pub fn lookup(&self, kind: ObjectKind, name: &str) -> Result<PropertyId> {
        let table = match kind {
            ObjectKind::Plane => &self.plane,
            ObjectKind::Crtc => &self.crtc,
            ObjectKind::Connector => &self.connector,
        };
        table.get(name).ok_or_else(|| PresentError::UnknownProperty {
            object: kind,
            name: name.to_string(),
        })
    }
}
