// src/main.rs

//! `kms-probe`: builds the presentation pipeline from a config file and
//! reports what the hardware negotiated. No frames are drawn.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;

use anyhow::Context;
use log::{error, info};

use kms_present::config::{CommitMode, PresentConfig};
use kms_present::engine::{Engine, EngineOptions};
use kms_present::kms::{DrmAdapter, KmsAdapter};
use kms_present::surface::{BackendSources, GbmSurfaceSource, SurfaceManager, SurfaceRequest};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    if let Err(err) = run() {
        error!("kms-probe failed: {err:#}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = PresentConfig::load_or_default(config_path.as_deref())?;
    info!("Configuration: {config:?}");

    let drm = Rc::new(
        DrmAdapter::open(&config.device)
            .with_context(|| format!("Failed to open {}", config.device.display()))?,
    );
    let atomic = config.commit_mode == CommitMode::Atomic;
    if atomic {
        // Planes are only enumerated for atomic clients.
        drm.enable_atomic().context("Failed to enable atomic modesetting")?;
    }
    let target = drm.resolve_target(atomic).context("Failed to resolve display target")?;
    info!(
        "Display target: connector {} crtc {} (index {}) plane {:?} mode {} {}x{}@{}",
        target.connector,
        target.crtc,
        target.crtc_index,
        target.plane,
        target.mode.name,
        target.mode.width,
        target.mode.height,
        target.mode.vrefresh
    );

    let allocation_path = config.allocation_device();
    let allocation_fd: OwnedFd = if allocation_path == drm.path() {
        drm.try_clone_fd().context("Failed to duplicate the display device")?
    } else {
        File::options()
            .read(true)
            .write(true)
            .open(allocation_path)
            .with_context(|| format!("Failed to open {}", allocation_path.display()))?
            .into()
    };
    info!("Allocating buffers on {}", allocation_path.display());
    let sources = BackendSources {
        allocator: None,
        gbm: Some(Box::new(GbmSurfaceSource::new(allocation_fd)?)),
    };

    let kms: Rc<dyn KmsAdapter> = drm;
    let (width, height) = target.size();
    let request = SurfaceRequest {
        width,
        height,
        modifier: config.modifier,
    };
    let surfaces = SurfaceManager::init(Rc::clone(&kms), sources, &request, config.backend)
        .context("Failed to initialize the surface manager")?;
    info!(
        "Surface backend: {:?} ({}x{})",
        surfaces.backend_kind(),
        width,
        height
    );

    let engine = Engine::new(
        config.commit_mode,
        kms,
        target,
        EngineOptions {
            frame_limit: config.frame_limit,
        },
    )
    .context("Failed to set up the commit engine")?;
    info!("Commit engine ready: {:?}", engine.mode());
    Ok(())
}
