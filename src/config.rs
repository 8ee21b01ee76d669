// src/config.rs

//! Start-up configuration for the presentation pipeline.
//!
//! Deserialized from a JSON file. Every field has a default, so an empty
//! object (or no file at all) yields a usable configuration that drives
//! `/dev/dri/card0` with the legacy engine.
//!
//! The configuration is a plain value handed to whoever builds the
//! pipeline; nothing in the crate reads it from a global.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Which commit engine drives the display. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// Set the mode once, then page-flip and wait for flip events.
    #[default]
    Legacy,
    /// One atomic transaction per frame, pipelined with fences.
    Atomic,
}

/// Buffer-producing backend behind the surface manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Driver-managed rendering surface, implicitly multi-buffered.
    Gbm,
    /// Fixed pool of explicitly allocated, GPU-importable buffers.
    #[default]
    Allocator,
}

impl BackendKind {
    pub fn other(self) -> Self {
        match self {
            BackendKind::Gbm => BackendKind::Allocator,
            BackendKind::Allocator => BackendKind::Gbm,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentConfig {
    /// Display device. Chosen by the caller; the crate never guesses
    /// between several cards.
    pub device: PathBuf,
    /// Device used for buffer allocation. `None` reuses `device`.
    pub surface_device: Option<PathBuf>,
    pub commit_mode: CommitMode,
    /// Backend tried first; the other one is the fallback.
    pub backend: BackendKind,
    /// Requested layout modifier. Init fails if the backend cannot honor it.
    pub modifier: Option<u64>,
    /// Stop after this many frames instead of running until an error.
    pub frame_limit: Option<u64>,
}

impl Default for PresentConfig {
    fn default() -> Self {
        PresentConfig {
            device: PathBuf::from("/dev/dri/card0"),
            surface_device: None,
            commit_mode: CommitMode::default(),
            backend: BackendKind::default(),
            modifier: None,
            frame_limit: None,
        }
    }
}

impl PresentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PresentConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                info!("No config file given, using defaults.");
                Ok(Self::default())
            }
        }
    }

    /// Device the surface manager allocates from.
    pub fn allocation_device(&self) -> &Path {
        self.surface_device.as_deref().unwrap_or(&self.device)
    }
}
