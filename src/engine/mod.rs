// src/engine/mod.rs

//! Commit engines.
//!
//! An engine owns the display target and drives the per-frame loop:
//! render, end the frame, post the buffer, and release the buffer it
//! superseded. Which engine runs is fixed at start-up.

use std::rc::Rc;

use crate::config::CommitMode;
use crate::error::Result;
use crate::kms::{DisplayTarget, KmsAdapter};
use crate::render::RenderContext;
use crate::surface::SurfaceManager;

pub mod atomic;
pub mod legacy;


pub use atomic::AtomicEngine;
pub use legacy::{InterruptSource, LegacyEngine};

/// How a run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The frame limit was reached.
    Completed { frames: u64 },
    /// The interrupt source became readable.
    Interrupted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub frame_limit: Option<u64>,
}

impl EngineOptions {
    pub(crate) fn limit_reached(&self, frames: u64) -> bool {
        self.frame_limit.is_some_and(|limit| frames >= limit)
    }
}

#[derive(Debug)]
pub enum Engine {
    Atomic(AtomicEngine),
    Legacy(LegacyEngine),
}

impl Engine {
    pub fn new(
        mode: CommitMode,
        kms: Rc<dyn KmsAdapter>,
        target: DisplayTarget,
        options: EngineOptions,
    ) -> Result<Self> {
        match mode {
            CommitMode::Atomic => Ok(Engine::Atomic(AtomicEngine::new(kms, target, options)?)),
            CommitMode::Legacy => Ok(Engine::Legacy(LegacyEngine::new(kms, target, options))),
        }
    }

    pub fn mode(&self) -> CommitMode {
        match self {
            Engine::Atomic(_) => CommitMode::Atomic,
            Engine::Legacy(_) => CommitMode::Legacy,
        }
    }

    /// Runs the present loop until the frame limit, an interrupt, or an error.
    pub fn run(&mut self, surfaces: &mut SurfaceManager, render: &mut dyn RenderContext) -> Result<RunStatus> {
        match self {
            Engine::Atomic(engine) => engine.run(surfaces, render),
            Engine::Legacy(engine) => engine.run(surfaces, render),
        }
    }
}
