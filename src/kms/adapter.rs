// src/kms/adapter.rs
//! KmsAdapter trait - the narrow set of kernel display primitives the
//! pipeline needs.
//!
//! The commit engines and the surface manager never talk to the DRM device
//! directly; everything goes through this trait so the presentation logic
//! can be driven against a recording mock in tests. `DrmAdapter` is the
//! production implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;

use crate::kms::commit::CommitRequest;
use crate::kms::fence::FenceFd;
use crate::kms::framebuffer::BufferLayout;
use crate::kms::target::ModeInfo;

/// Kernel mode object id (plane, CRTC, connector, encoder).
pub type ObjectId = u32;

/// Kernel property id.
pub type PropertyId = u32;

/// Kernel scanout object ("fb id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FbId(pub u32);

impl fmt::Display for FbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Plane,
    Crtc,
    Connector,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Plane => "plane",
            ObjectKind::Crtc => "crtc",
            ObjectKind::Connector => "connector",
        };
        f.write_str(name)
    }
}

/// Property name to id mapping for one mode object.
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    ids: HashMap<String, PropertyId>,
}

impl PropertyTable {
    pub fn get(&self, name: &str) -> Option<PropertyId> {
        self.ids.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, PropertyId)> for PropertyTable {
    fn from_iter<I: IntoIterator<Item = (S, PropertyId)>>(iter: I) -> Self {
        PropertyTable {
            ids: iter.into_iter().map(|(name, id)| (name.into(), id)).collect(),
        }
    }
}

/// Events read back from the device fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsEvent {
    PageFlip { crtc: ObjectId, frame: u32 },
    Vblank,
}

/// Kernel display primitives.
///
/// All methods take `&self`: the adapter is shared (via `Rc`) between the
/// commit engine, the surface manager and every framebuffer wrapper that
/// has to unregister itself on drop.
pub trait KmsAdapter: fmt::Debug {
    /// Enables the atomic client capability (and universal planes with it).
    fn enable_atomic(&self) -> io::Result<()>;

    /// Whether the kernel accepts framebuffers that carry layout modifiers.
    fn supports_modifiers(&self) -> bool;

    fn object_properties(&self, object: ObjectId, kind: ObjectKind) -> io::Result<PropertyTable>;

    /// Uploads `mode` as a property blob, returning the blob id.
    fn create_mode_blob(&self, mode: &ModeInfo) -> io::Result<u64>;

    fn destroy_blob(&self, blob: u64) -> io::Result<()>;

    /// Submits one atomic transaction.
    ///
    /// Consumes the request, including any in-fence attached to it. Returns
    /// the out-fence when the request asked for one.
    fn atomic_commit(&self, request: CommitRequest) -> io::Result<Option<FenceFd>>;

    /// Blocking legacy mode-set binding `connector` to `crtc` scanning out `fb`.
    fn set_crtc(&self, crtc: ObjectId, fb: FbId, connector: ObjectId, mode: &ModeInfo) -> io::Result<()>;

    /// Queues a page flip that raises a flip-completion event.
    fn page_flip(&self, crtc: ObjectId, fb: FbId) -> io::Result<()>;

    /// Descriptor that becomes readable when events are pending.
    fn event_fd(&self) -> BorrowedFd<'_>;

    /// Reads and decodes pending events. Only call once `event_fd` is readable.
    fn receive_events(&self) -> io::Result<Vec<KmsEvent>>;

    fn add_framebuffer(&self, layout: &BufferLayout, with_modifiers: bool) -> io::Result<FbId>;

    fn remove_framebuffer(&self, fb: FbId) -> io::Result<()>;

    /// Converts a sharable buffer descriptor into a GEM handle on this device.
    fn import_prime_fd(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;

    /// Drops this device's reference to a GEM handle.
    fn close_buffer(&self, handle: u32) -> io::Result<()>;
}
