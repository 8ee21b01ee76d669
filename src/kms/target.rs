// src/kms/target.rs

//! Display target selection.
//!
//! A `ResourceSnapshot` is a plain copy of the kernel's connector, encoder,
//! CRTC and plane lists, so the selection rules below run without a device.

use drm::control::{Mode, ModeTypeFlags};
use log::{debug, info};

use crate::error::{PresentError, Result};
use crate::kms::adapter::ObjectId;

#[derive(Debug, Clone)]
pub struct ModeInfo {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub vrefresh: u32,
    pub preferred: bool,
    /// Kernel mode description, uploaded as the mode blob or passed to set_crtc.
    pub native: Option<Mode>,
}

impl ModeInfo {
    pub fn from_native(mode: Mode) -> Self {
        let (width, height) = mode.size();
        ModeInfo {
            name: mode.name().to_string_lossy().into_owned(),
            width,
            height,
            vrefresh: mode.vrefresh(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
            native: Some(mode),
        }
    }

    pub fn area(&self) -> u32 {
        u32::from(self.width) * u32::from(self.height)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: ObjectId,
    pub connected: bool,
    pub current_encoder: Option<ObjectId>,
    pub encoders: Vec<ObjectId>,
    pub modes: Vec<ModeInfo>,
}

#[derive(Debug, Clone)]
pub struct EncoderInfo {
    pub id: ObjectId,
    pub crtc: Option<ObjectId>,
    /// Bit `i` set when the encoder can drive `crtcs[i]`.
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone)]
pub struct PlaneInfo {
    pub id: ObjectId,
    /// Bit `i` set when the plane can be attached to `crtcs[i]`.
    pub possible_crtcs: u32,
    pub primary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: Vec<ObjectId>,
    pub planes: Vec<PlaneInfo>,
}

/// The output driven for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct DisplayTarget {
    pub connector: ObjectId,
    pub crtc: ObjectId,
    pub crtc_index: usize,
    /// Only resolved for atomic mode.
    pub plane: Option<ObjectId>,
    pub mode: ModeInfo,
}

impl DisplayTarget {
    pub fn resolve(snapshot: &ResourceSnapshot, with_plane: bool) -> Result<Self> {
        let connector = snapshot
            .connectors
            .iter()
            .find(|c| c.connected)
            .ok_or_else(|| PresentError::capability("no connected connector"))?;

        let mode = select_mode(&connector.modes)
            .ok_or_else(|| PresentError::capability("could not find mode"))?
            .clone();

        let crtc = current_crtc(snapshot, connector)
            .or_else(|| find_crtc_for_connector(snapshot, connector))
            .ok_or_else(|| PresentError::capability("no crtc found"))?;

        let crtc_index = snapshot
            .crtcs
            .iter()
            .position(|&id| id == crtc)
            .ok_or_else(|| PresentError::capability("no crtc found"))?;

        let plane = if with_plane {
            let plane = select_plane(&snapshot.planes, crtc_index)
                .ok_or_else(|| PresentError::capability("could not find a suitable plane"))?;
            Some(plane)
        } else {
            None
        };

        info!(
            "DisplayTarget: connector {} crtc {} (index {crtc_index}) plane {:?} mode {} {}x{}@{}",
            connector.id, crtc, plane, mode.name, mode.width, mode.height, mode.vrefresh
        );
        Ok(DisplayTarget {
            connector: connector.id,
            crtc,
            crtc_index,
            plane,
            mode,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (u32::from(self.mode.width), u32::from(self.mode.height))
    }
}

/// The preferred mode, unless a later mode covers a strictly larger area.
pub fn select_mode(modes: &[ModeInfo]) -> Option<&ModeInfo> {
    let mut chosen = None;
    let mut best_area = 0;
    for mode in modes {
        if mode.preferred {
            chosen = Some(mode);
        }
        let area = mode.area();
        if area > best_area {
            chosen = Some(mode);
            best_area = area;
        }
    }
    chosen
}

fn current_crtc(snapshot: &ResourceSnapshot, connector: &ConnectorInfo) -> Option<ObjectId> {
    let encoder = connector.current_encoder?;
    snapshot
        .encoders
        .iter()
        .find(|e| e.id == encoder)
        .and_then(|e| e.crtc)
}

/// First CRTC any of the connector's encoders can drive.
pub fn find_crtc_for_connector(snapshot: &ResourceSnapshot, connector: &ConnectorInfo) -> Option<ObjectId> {
    connector.encoders.iter().find_map(|&id| {
        let encoder = snapshot.encoders.iter().find(|e| e.id == id)?;
        let crtc = snapshot
            .crtcs
            .iter()
            .enumerate()
            .find(|(index, _)| encoder.possible_crtcs & (1 << index) != 0)
            .map(|(_, &crtc)| crtc);
        if let Some(crtc) = crtc {
            debug!("DisplayTarget: encoder {id} can drive crtc {crtc}");
        }
        crtc
    })
}

/// Primary plane for the CRTC at `crtc_index`, else the first compatible plane.
pub fn select_plane(planes: &[PlaneInfo], crtc_index: usize) -> Option<ObjectId> {
    let mut compatible = planes
        .iter()
        .filter(|p| p.possible_crtcs & (1 << crtc_index) != 0)
        .peekable();
    let first = compatible.peek().map(|p| p.id);
    compatible.find(|p| p.primary).map(|p| p.id).or(first)
}
