// src/surface/allocator.rs

//! Allocator backend: a fixed pool of explicitly allocated buffers.
//!
//! At init the allocator is asked which capability sets satisfy display
//! scanout and which satisfy GPU texturing; the pool is allocated against
//! the first set both usages accept. Every slot is exported, registered as
//! a framebuffer and imported by the renderer before the first frame, so
//! steady state only advances indices.
//!
//! This backend does not support explicit layout modifiers. Requesting one
//! fails init instead of being ignored.

use std::fmt;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use drm::buffer::DrmFourcc;
use log::{debug, info, trace};

use crate::config::BackendKind;
use crate::error::{PresentError, Result};
use crate::kms::framebuffer::BYTES_PER_PIXEL;
use crate::kms::{BufferLayout, Framebuffer, KmsAdapter};
use crate::render::RenderContext;
use crate::surface::{PresentableBuffer, SurfaceBackend, SurfaceRequest};

pub const POOL_SIZE: usize = 2;

/// What the buffer must be: size and pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assertion {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    DisplayScanout,
    GpuTexture,
}

/// One memory layout the allocator can produce, with its constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    pub layout: u64,
    pub pitch_alignment: u32,
    pub address_alignment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationHandle(pub u64);

/// Sharable form of an allocation.
#[derive(Debug)]
pub struct AllocationExport {
    pub fd: OwnedFd,
    pub size: u64,
    /// Row stride the allocation was laid out with, in bytes.
    pub pitch: u32,
    /// Start of the pixel data within the exported memory.
    pub offset: u32,
    /// Opaque layout description the renderer needs to import the memory.
    pub metadata: Vec<u8>,
}

/// The explicit allocation library on the allocation device.
pub trait AllocatorDevice: fmt::Debug {
    fn capability_sets(&self, assertion: &Assertion, usage: Usage) -> anyhow::Result<Vec<CapabilitySet>>;

    fn allocate(&mut self, assertion: &Assertion, capabilities: &CapabilitySet) -> anyhow::Result<AllocationHandle>;

    fn export(&self, allocation: AllocationHandle) -> anyhow::Result<AllocationExport>;

    fn free(&mut self, allocation: AllocationHandle);
}

/// Smallest row stride for `width` XRGB8888 pixels that honors `alignment`.
pub fn aligned_pitch(width: u32, alignment: u32) -> u32 {
    (width * BYTES_PER_PIXEL).next_multiple_of(alignment.max(1))
}

/// Capability sets acceptable to both usages, strictest constraints merged.
pub fn derive_common(scanout: &[CapabilitySet], texture: &[CapabilitySet]) -> Vec<CapabilitySet> {
    let mut common: Vec<CapabilitySet> = Vec::new();
    for s in scanout {
        for t in texture.iter().filter(|t| t.layout == s.layout) {
            let merged = CapabilitySet {
                layout: s.layout,
                pitch_alignment: s.pitch_alignment.max(t.pitch_alignment),
                address_alignment: s.address_alignment.max(t.address_alignment),
            };
            if !common.contains(&merged) {
                common.push(merged);
            }
        }
    }
    common
}

#[derive(Debug)]
struct PoolSlot {
    allocation: AllocationHandle,
    export: AllocationExport,
    buffer: PresentableBuffer,
}

pub struct AllocatorBackend {
    slots: Vec<PoolSlot>,
    device: Box<dyn AllocatorDevice>,
    kms: Rc<dyn KmsAdapter>,
    width: u32,
    height: u32,
    scanout_cursor: usize,
    render_slot: usize,
}

impl AllocatorBackend {
    pub fn new(
        device: Box<dyn AllocatorDevice>,
        kms: Rc<dyn KmsAdapter>,
        request: &SurfaceRequest,
    ) -> Result<Self> {
        if let Some(modifier) = request.modifier {
            return Err(PresentError::capability(format!(
                "the allocator backend does not support explicit modifiers ({modifier:#x} requested)"
            )));
        }
        let assertion = Assertion {
            width: request.width,
            height: request.height,
            format: DrmFourcc::Xrgb8888,
        };
        let scanout = device
            .capability_sets(&assertion, Usage::DisplayScanout)
            .map_err(PresentError::op("query scanout capabilities"))?;
        let texture = device
            .capability_sets(&assertion, Usage::GpuTexture)
            .map_err(PresentError::op("query texture capabilities"))?;
        let capabilities = derive_common(&scanout, &texture)
            .first()
            .copied()
            .ok_or_else(|| {
                PresentError::capability("display scanout and GPU texturing share no capability set")
            })?;
        debug!("AllocatorBackend: using capability set {capabilities:?}");

        let mut backend = AllocatorBackend {
            slots: Vec::with_capacity(POOL_SIZE),
            device,
            kms,
            width: request.width,
            height: request.height,
            scanout_cursor: 0,
            render_slot: 0,
        };
        // An early return drops `backend`, which frees the slots built so far.
        for slot in 0..POOL_SIZE {
            let pooled = backend.allocate_slot(slot, &assertion, &capabilities)?;
            backend.slots.push(pooled);
        }
        info!(
            "AllocatorBackend: pool of {POOL_SIZE} {}x{} buffers ready",
            request.width, request.height
        );
        Ok(backend)
    }

    fn allocate_slot(
        &mut self,
        slot: usize,
        assertion: &Assertion,
        capabilities: &CapabilitySet,
    ) -> Result<PoolSlot> {
        let allocation = self
            .device
            .allocate(assertion, capabilities)
            .map_err(PresentError::op("allocate"))?;
        match self.wire_slot(slot, allocation, capabilities) {
            Ok(pooled) => Ok(pooled),
            Err(err) => {
                self.device.free(allocation);
                Err(err)
            }
        }
    }

    fn wire_slot(
        &self,
        slot: usize,
        allocation: AllocationHandle,
        capabilities: &CapabilitySet,
    ) -> Result<PoolSlot> {
        let export = self
            .device
            .export(allocation)
            .map_err(PresentError::op("export allocation"))?;
        let min_pitch = aligned_pitch(self.width, capabilities.pitch_alignment);
        if export.pitch < min_pitch || export.pitch % capabilities.pitch_alignment.max(1) != 0 {
            return Err(PresentError::resource(
                "export allocation",
                anyhow::anyhow!(
                    "pitch {} violates the {}-byte alignment for width {} (need at least {min_pitch})",
                    export.pitch,
                    capabilities.pitch_alignment,
                    self.width
                ),
            ));
        }
        let handle = self
            .kms
            .import_prime_fd(export.fd.as_fd())
            .map_err(PresentError::op("drmPrimeFDToHandle"))?;
        let layout = BufferLayout {
            offsets: [export.offset, 0, 0, 0],
            ..BufferLayout::single_plane(self.width, self.height, handle, export.pitch)
        };
        let framebuffer = Framebuffer::from_gem(&self.kms, layout)?;
        debug!("AllocatorBackend: slot {slot} is {}", framebuffer.id());
        Ok(PoolSlot {
            allocation,
            export,
            buffer: PresentableBuffer::new(Rc::new(framebuffer), Some(slot)),
        })
    }

    pub fn pool_len(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for AllocatorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorBackend")
            .field("slots", &self.slots.len())
            .field("scanout_cursor", &self.scanout_cursor)
            .field("render_slot", &self.render_slot)
            .finish()
    }
}

impl SurfaceBackend for AllocatorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Allocator
    }

    fn prepare_render_targets(&mut self, render: &mut dyn RenderContext) -> Result<()> {
        for (index, slot) in self.slots.iter().enumerate() {
            render
                .import_render_target(index, self.width, self.height, &slot.export)
                .map_err(PresentError::op("import render target"))?;
        }
        render
            .bind_render_target(self.render_slot)
            .map_err(PresentError::op("bind render target"))
    }

    fn next_buffer(&mut self) -> Result<PresentableBuffer> {
        let slot = self
            .slots
            .get(self.scanout_cursor)
            .ok_or_else(|| PresentError::NoBuffer("allocator pool is empty".to_string()))?;
        let buffer = slot.buffer.clone();
        self.scanout_cursor = (self.scanout_cursor + 1) % self.slots.len();
        Ok(buffer)
    }

    fn release(&mut self, buffer: &PresentableBuffer) -> Result<()> {
        trace!("AllocatorBackend: slot {:?} cycles back", buffer.slot());
        Ok(())
    }

    fn flush_frame(&mut self, render: &mut dyn RenderContext) -> Result<()> {
        if self.slots.is_empty() {
            return Err(PresentError::NoBuffer("allocator pool is empty".to_string()));
        }
        self.render_slot = (self.render_slot + 1) % self.slots.len();
        render
            .bind_render_target(self.render_slot)
            .map_err(PresentError::op("bind render target"))?;
        render.flush().map_err(PresentError::op("glFlush"))
    }
}

impl Drop for AllocatorBackend {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            let PoolSlot {
                allocation,
                export,
                buffer,
            } = slot;
            drop(buffer);
            drop(export);
            self.device.free(allocation);
        }
    }
}
