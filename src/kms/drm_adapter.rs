// src/kms/drm_adapter.rs

//! `KmsAdapter` backed by a DRM card node, via the `drm` crate.

use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use drm::control::atomic::AtomicModeReq;
use drm::control::{
    self, connector, property, AtomicCommitFlags, Device as ControlDevice, Event, FbCmd2Flags,
    PageFlipFlags, ResourceHandle,
};
use drm::{ClientCapability, Device as DrmDevice, DriverCapability};
use log::{debug, info, warn};

use crate::error::{PresentError, Result};
use crate::kms::adapter::{FbId, KmsAdapter, KmsEvent, ObjectId, ObjectKind, PropertyTable};
use crate::kms::commit::CommitRequest;
use crate::kms::fence::{FenceFd, FenceKind};
use crate::kms::framebuffer::BufferLayout;
use crate::kms::target::{
    ConnectorInfo, DisplayTarget, EncoderInfo, ModeInfo, PlaneInfo, ResourceSnapshot,
};

const PLANE_TYPE_PRIMARY: u64 = 1;

#[derive(Debug)]
struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl DrmDevice for Card {}
impl ControlDevice for Card {}

#[derive(Debug)]
pub struct DrmAdapter {
    card: Card,
    path: PathBuf,
    modifiers: bool,
}

impl DrmAdapter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|err| PresentError::resource(format!("open {}", path.display()), err))?;
        let card = Card(file);
        let modifiers = matches!(
            card.get_driver_capability(DriverCapability::AddFB2Modifiers),
            Ok(value) if value != 0
        );
        info!(
            "DrmAdapter: opened {} (modifier support: {})",
            path.display(),
            modifiers
        );
        Ok(DrmAdapter {
            card,
            path: path.to_path_buf(),
            modifiers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duplicates the device descriptor, e.g. for a GBM device on the same card.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.card.as_fd().try_clone_to_owned()
    }

    pub fn snapshot(&self, with_planes: bool) -> Result<ResourceSnapshot> {
        let resources = self
            .card
            .resource_handles()
            .map_err(PresentError::op("drmModeGetResources"))?;
        let crtcs = resources.crtcs().to_vec();
        let crtc_mask = |filter: control::CrtcListFilter| -> u32 {
            resources
                .filter_crtcs(filter)
                .iter()
                .filter_map(|handle| crtcs.iter().position(|c| c == handle))
                .fold(0, |mask, index| mask | (1 << index))
        };

        let mut snapshot = ResourceSnapshot {
            crtcs: crtcs.iter().map(|&h| u32::from(h)).collect(),
            ..ResourceSnapshot::default()
        };

        for &handle in resources.connectors() {
            let info = match self.card.get_connector(handle, true) {
                Ok(info) => info,
                Err(err) => {
                    warn!("DrmAdapter: skipping connector {handle:?}: {err}");
                    continue;
                }
            };
            snapshot.connectors.push(ConnectorInfo {
                id: u32::from(info.handle()),
                connected: info.state() == connector::State::Connected,
                current_encoder: info.current_encoder().map(u32::from),
                encoders: info.encoders().iter().map(|&e| u32::from(e)).collect(),
                modes: info.modes().iter().map(|&m| ModeInfo::from_native(m)).collect(),
            });
        }

        for &handle in resources.encoders() {
            let encoder = self
                .card
                .get_encoder(handle)
                .map_err(PresentError::op("drmModeGetEncoder"))?;
            snapshot.encoders.push(EncoderInfo {
                id: u32::from(handle),
                crtc: encoder.crtc().map(u32::from),
                possible_crtcs: crtc_mask(encoder.possible_crtcs()),
            });
        }

        if with_planes {
            let planes = self
                .card
                .plane_handles()
                .map_err(PresentError::op("drmModeGetPlaneResources"))?;
            for handle in planes {
                let plane = self
                    .card
                    .get_plane(handle)
                    .map_err(PresentError::op("drmModeGetPlane"))?;
                snapshot.planes.push(PlaneInfo {
                    id: u32::from(handle),
                    possible_crtcs: crtc_mask(plane.possible_crtcs()),
                    primary: self.plane_type(handle)? == Some(PLANE_TYPE_PRIMARY),
                });
            }
        }

        debug!(
            "DrmAdapter: {} connectors, {} encoders, {} crtcs, {} planes",
            snapshot.connectors.len(),
            snapshot.encoders.len(),
            snapshot.crtcs.len(),
            snapshot.planes.len()
        );
        Ok(snapshot)
    }

    /// Picks the output to drive. Planes are only resolved for atomic mode.
    pub fn resolve_target(&self, with_plane: bool) -> Result<DisplayTarget> {
        DisplayTarget::resolve(&self.snapshot(with_plane)?, with_plane)
    }

    fn plane_type(&self, plane: control::plane::Handle) -> Result<Option<u64>> {
        let props = self
            .card
            .get_properties(plane)
            .map_err(PresentError::op("drmModeObjectGetProperties"))?;
        let (ids, values) = props.as_props_and_values();
        for (&id, &value) in ids.iter().zip(values) {
            let info = self
                .card
                .get_property(id)
                .map_err(PresentError::op("drmModeGetProperty"))?;
            if info.name().to_bytes() == b"type" {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn properties_of<H: ResourceHandle>(&self, handle: H) -> io::Result<PropertyTable> {
        let props = self.card.get_properties(handle)?;
        let (ids, _) = props.as_props_and_values();
        ids.iter()
            .map(|&id| -> io::Result<(String, u32)> {
                let info = self.card.get_property(id)?;
                Ok((info.name().to_string_lossy().into_owned(), u32::from(id)))
            })
            .collect()
    }
}

fn handle<H: From<control::RawResourceHandle>>(raw: u32) -> io::Result<H> {
    control::from_u32(raw).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid object id {raw}"))
    })
}

fn raw_handle(raw: u32) -> io::Result<control::RawResourceHandle> {
    NonZeroU32::new(raw).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid object id {raw}"))
    })
}

fn native_mode(mode: &ModeInfo) -> io::Result<control::Mode> {
    mode.native.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("mode {} has no kernel description", mode.name),
        )
    })
}

impl KmsAdapter for DrmAdapter {
    fn enable_atomic(&self) -> io::Result<()> {
        self.card
            .set_client_capability(ClientCapability::UniversalPlanes, true)?;
        self.card.set_client_capability(ClientCapability::Atomic, true)
    }

    fn supports_modifiers(&self) -> bool {
        self.modifiers
    }

    fn object_properties(&self, object: ObjectId, kind: ObjectKind) -> io::Result<PropertyTable> {
        match kind {
            ObjectKind::Plane => self.properties_of(handle::<control::plane::Handle>(object)?),
            ObjectKind::Crtc => self.properties_of(handle::<control::crtc::Handle>(object)?),
            ObjectKind::Connector => self.properties_of(handle::<connector::Handle>(object)?),
        }
    }

    fn create_mode_blob(&self, mode: &ModeInfo) -> io::Result<u64> {
        let native = native_mode(mode)?;
        match self.card.create_property_blob(&native)? {
            property::Value::Blob(id) => Ok(id),
            _ => Err(io::Error::other("kernel returned a non-blob property value")),
        }
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.card.destroy_property_blob(blob)
    }

    fn atomic_commit(&self, request: CommitRequest) -> io::Result<Option<FenceFd>> {
        let mut req = AtomicModeReq::new();
        for write in request.writes() {
            req.add_raw_property(
                raw_handle(write.object)?,
                handle::<property::Handle>(write.property)?,
                write.value,
            );
        }
        // The kernel writes the out-fence descriptor through this pointer.
        let mut out_fence: RawFd = -1;
        if let Some((object, prop)) = request.out_fence_target() {
            req.add_raw_property(
                raw_handle(object)?,
                handle::<property::Handle>(prop)?,
                &mut out_fence as *mut RawFd as u64,
            );
        }
        let flags = AtomicCommitFlags::from_bits_truncate(request.flags().bits());
        let result = self.card.atomic_commit(flags, req);
        // The kernel holds its own reference to the in-fence once the ioctl returns.
        drop(request);
        result?;
        // SAFETY: on success the kernel installed a fresh descriptor owned by us.
        Ok(unsafe { FenceFd::from_raw(out_fence, FenceKind::DisplayCompletion) })
    }

    fn set_crtc(&self, crtc: ObjectId, fb: FbId, connector: ObjectId, mode: &ModeInfo) -> io::Result<()> {
        self.card.set_crtc(
            handle(crtc)?,
            Some(handle(fb.0)?),
            (0, 0),
            &[handle(connector)?],
            Some(native_mode(mode)?),
        )
    }

    fn page_flip(&self, crtc: ObjectId, fb: FbId) -> io::Result<()> {
        self.card
            .page_flip(handle(crtc)?, handle(fb.0)?, PageFlipFlags::EVENT, None)
    }

    fn event_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    fn receive_events(&self) -> io::Result<Vec<KmsEvent>> {
        let events = self.card.receive_events()?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some(KmsEvent::PageFlip {
                    crtc: u32::from(flip.crtc),
                    frame: flip.frame,
                }),
                Event::Vblank(_) => Some(KmsEvent::Vblank),
                _ => None,
            })
            .collect())
    }

    fn add_framebuffer(&self, layout: &BufferLayout, with_modifiers: bool) -> io::Result<FbId> {
        let flags = if with_modifiers {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let fb = self.card.add_planar_framebuffer(layout, flags)?;
        Ok(FbId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, fb: FbId) -> io::Result<()> {
        self.card.destroy_framebuffer(handle(fb.0)?)
    }

    fn import_prime_fd(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        let buffer = self.card.prime_fd_to_buffer(fd)?;
        Ok(u32::from(buffer))
    }

    fn close_buffer(&self, gem: u32) -> io::Result<()> {
        self.card.close_buffer(handle::<drm::buffer::Handle>(gem)?)
    }
}
