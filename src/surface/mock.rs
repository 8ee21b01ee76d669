// src/surface/mock.rs

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use nix::unistd::pipe;

use crate::kms::mock::{Entry, Journal};
use crate::kms::{BufferLayout, Framebuffer};
use crate::surface::allocator::{
    aligned_pitch, AllocationExport, AllocationHandle, AllocatorDevice, Assertion, CapabilitySet,
    Usage,
};
use crate::surface::gbm_backend::{FrontBufferSurface, LockedBuffer, SurfaceLayout, SurfaceSource};

type Userdata = Rc<RefCell<Option<Rc<Framebuffer>>>>;

#[derive(Debug, Default)]
struct SurfaceState {
    buffer_count: u32,
    script: VecDeque<u32>,
    next: u32,
    locked: HashSet<u32>,
    userdata: HashMap<u32, Userdata>,
    created: Vec<SurfaceLayout>,
    fail_create: bool,
}

/// Driver surface double with `buffer_count` underlying buffers.
#[derive(Debug, Clone)]
pub struct MockSurfaceSource {
    state: Rc<RefCell<SurfaceState>>,
    journal: Journal,
}

impl MockSurfaceSource {
    pub fn new(journal: &Journal, buffer_count: u32) -> Self {
        MockSurfaceSource {
            state: Rc::new(RefCell::new(SurfaceState {
                buffer_count,
                ..SurfaceState::default()
            })),
            journal: journal.clone(),
        }
    }

    /// Underlying buffers to hand out next, in order, before round-robin resumes.
    pub fn scripted(self, buffers: &[u32]) -> Self {
        self.state.borrow_mut().script.extend(buffers);
        self
    }

    pub fn failing(self) -> Self {
        self.state.borrow_mut().fail_create = true;
        self
    }

    pub fn created(&self) -> Vec<SurfaceLayout> {
        self.state.borrow().created.clone()
    }

    pub fn locked(&self) -> usize {
        self.state.borrow().locked.len()
    }
}

impl SurfaceSource for MockSurfaceSource {
    fn create_surface(
        &self,
        width: u32,
        height: u32,
        layout: &SurfaceLayout,
    ) -> Result<Box<dyn FrontBufferSurface>> {
        let mut state = self.state.borrow_mut();
        if state.fail_create {
            bail!("surface creation refused");
        }
        state.created.push(layout.clone());
        let modifier = match layout {
            SurfaceLayout::Modifiers(modifiers) => modifiers.first().copied(),
            SurfaceLayout::Implicit => None,
        };
        Ok(Box::new(MockSurface {
            state: Rc::clone(&self.state),
            journal: self.journal.clone(),
            width,
            height,
            modifier,
        }))
    }
}

#[derive(Debug)]
struct MockSurface {
    state: Rc<RefCell<SurfaceState>>,
    journal: Journal,
    width: u32,
    height: u32,
    modifier: Option<u64>,
}

impl FrontBufferSurface for MockSurface {
    fn lock_front_buffer(&mut self) -> Result<Box<dyn LockedBuffer>> {
        let mut state = self.state.borrow_mut();
        let id = match state.script.pop_front() {
            Some(id) => id,
            None => {
                let count = state.buffer_count;
                let id = (0..count)
                    .map(|offset| (state.next + offset) % count)
                    .find(|id| !state.locked.contains(id))
                    .ok_or_else(|| anyhow!("all {count} buffers are locked"))?;
                state.next = (id + 1) % count;
                id
            }
        };
        state.locked.insert(id);
        let userdata = Rc::clone(state.userdata.entry(id).or_default());
        self.journal.push(Entry::LockFront(id));
        Ok(Box::new(MockLocked {
            id,
            layout: BufferLayout {
                modifier: self.modifier,
                ..BufferLayout::single_plane(self.width, self.height, 100 + id, self.width * 4)
            },
            userdata,
            state: Rc::clone(&self.state),
            journal: self.journal.clone(),
        }))
    }
}

#[derive(Debug)]
struct MockLocked {
    id: u32,
    layout: BufferLayout,
    userdata: Userdata,
    state: Rc<RefCell<SurfaceState>>,
    journal: Journal,
}

impl LockedBuffer for MockLocked {
    fn layout(&self) -> BufferLayout {
        self.layout
    }

    fn framebuffer(&self) -> Option<Rc<Framebuffer>> {
        self.userdata.borrow().clone()
    }

    fn attach_framebuffer(&mut self, framebuffer: Rc<Framebuffer>) {
        *self.userdata.borrow_mut() = Some(framebuffer);
    }
}

impl Drop for MockLocked {
    fn drop(&mut self) {
        self.state.borrow_mut().locked.remove(&self.id);
        self.journal.push(Entry::ReleaseFront(self.id));
    }
}

pub fn caps(layout: u64, pitch_alignment: u32) -> CapabilitySet {
    CapabilitySet {
        layout,
        pitch_alignment,
        address_alignment: 4096,
    }
}

#[derive(Debug)]
pub struct MockAllocator {
    journal: Journal,
    scanout: Vec<CapabilitySet>,
    texture: Vec<CapabilitySet>,
    fail_allocation: Option<usize>,
    fail_export: bool,
    pitch_override: Option<u32>,
    allocations: usize,
    /// (pitch, size) of each live allocation.
    layouts: HashMap<u64, (u32, u64)>,
}

impl MockAllocator {
    pub fn new(journal: &Journal, scanout: Vec<CapabilitySet>, texture: Vec<CapabilitySet>) -> Self {
        MockAllocator {
            journal: journal.clone(),
            scanout,
            texture,
            fail_allocation: None,
            fail_export: false,
            pitch_override: None,
            allocations: 0,
            layouts: HashMap::new(),
        }
    }

    /// Both usages agree on one linear layout.
    pub fn compatible(journal: &Journal) -> Self {
        MockAllocator::new(journal, vec![caps(0, 64), caps(7, 256)], vec![caps(0, 256)])
    }

    /// Fails the allocation with index `index` (0-based).
    pub fn failing_allocation(mut self, index: usize) -> Self {
        self.fail_allocation = Some(index);
        self
    }

    pub fn failing_export(mut self) -> Self {
        self.fail_export = true;
        self
    }

    /// Reports `pitch` for every export, whatever the capability set asked for.
    pub fn reporting_pitch(mut self, pitch: u32) -> Self {
        self.pitch_override = Some(pitch);
        self
    }
}

impl AllocatorDevice for MockAllocator {
    fn capability_sets(&self, _assertion: &Assertion, usage: Usage) -> Result<Vec<CapabilitySet>> {
        Ok(match usage {
            Usage::DisplayScanout => self.scanout.clone(),
            Usage::GpuTexture => self.texture.clone(),
        })
    }

    fn allocate(&mut self, assertion: &Assertion, capabilities: &CapabilitySet) -> Result<AllocationHandle> {
        let index = self.allocations;
        self.allocations += 1;
        if self.fail_allocation == Some(index) {
            bail!("out of memory");
        }
        let handle = AllocationHandle(index as u64 + 1);
        let pitch = aligned_pitch(assertion.width, capabilities.pitch_alignment);
        self.layouts
            .insert(handle.0, (pitch, u64::from(pitch) * u64::from(assertion.height)));
        self.journal.push(Entry::Allocate(handle.0));
        Ok(handle)
    }

    fn export(&self, allocation: AllocationHandle) -> Result<AllocationExport> {
        if self.fail_export {
            bail!("export of allocation {} refused", allocation.0);
        }
        let (pitch, size) = *self
            .layouts
            .get(&allocation.0)
            .ok_or_else(|| anyhow!("unknown allocation {}", allocation.0))?;
        let (fd, _) = pipe()?;
        Ok(AllocationExport {
            fd,
            size,
            pitch: self.pitch_override.unwrap_or(pitch),
            offset: 0,
            metadata: vec![0; 16],
        })
    }

    fn free(&mut self, allocation: AllocationHandle) {
        self.layouts.remove(&allocation.0);
        self.journal.push(Entry::Free(allocation.0));
    }
}
