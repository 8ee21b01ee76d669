// src/kms/mock.rs

//! Recording `KmsAdapter` and the shared `Journal` every mock writes to.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd::{pipe, write};

use crate::kms::adapter::{FbId, KmsAdapter, KmsEvent, ObjectId, ObjectKind, PropertyId, PropertyTable};
use crate::kms::commit::{CommitFlags, CommitRequest};
use crate::kms::fence::{FenceFd, FenceKind};
use crate::kms::framebuffer::BufferLayout;
use crate::kms::target::{DisplayTarget, ModeInfo};
use crate::render::SyncHandle;

pub const CONNECTOR: ObjectId = 31;
pub const CRTC: ObjectId = 41;
pub const PLANE: ObjectId = 51;

/// One observable step, in the order it happened across all mocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Draw(u64),
    SwapBuffers,
    Flush,
    Finish,
    ImportTarget(usize),
    BindTarget(usize),
    ImportFence(SyncHandle),
    GpuWait(SyncHandle),
    ClientWait(SyncHandle),
    DestroySync(SyncHandle),
    LockFront(u32),
    ReleaseFront(u32),
    AddFb(FbId),
    RemoveFb(FbId),
    CloseGem(u32),
    Commit {
        fb: Option<FbId>,
        flags: CommitFlags,
        in_fence: bool,
        out_fence: bool,
    },
    SetCrtc(FbId),
    PageFlip(FbId),
    Allocate(u64),
    Free(u64),
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<Entry>>>);

impl Journal {
    pub fn push(&self, entry: Entry) {
        self.0.borrow_mut().push(entry);
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.0.borrow().clone()
    }

    pub fn position(&self, pred: impl Fn(&Entry) -> bool) -> Option<usize> {
        self.0.borrow().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Entry) -> bool) -> usize {
        self.0.borrow().iter().filter(|e| pred(e)).count()
    }

    pub fn commits(&self) -> Vec<(Option<FbId>, CommitFlags, bool)> {
        self.0
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Entry::Commit {
                    fb,
                    flags,
                    in_fence,
                    ..
                } => Some((*fb, *flags, *in_fence)),
                _ => None,
            })
            .collect()
    }
}

/// A pipe whose read end is already readable, standing in for a signaled sync file.
pub fn signaled_fence(kind: FenceKind) -> io::Result<FenceFd> {
    let (rx, tx) = pipe()?;
    write(&tx, &[1])?;
    Ok(FenceFd::new(rx, kind))
}

/// A pipe that never becomes readable while `_tx` is alive.
pub fn pending_fence(kind: FenceKind) -> io::Result<(FenceFd, OwnedFd)> {
    let (rx, tx) = pipe()?;
    Ok((FenceFd::new(rx, kind), tx))
}

/// Property writes of one commit, resolved back to names.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub flags: CommitFlags,
    pub writes: Vec<(ObjectKind, String, u64)>,
    pub in_fence_fd: Option<i32>,
    pub out_fence: bool,
    pub at: Instant,
}

impl CommitRecord {
    pub fn value(&self, kind: ObjectKind, name: &str) -> Option<u64> {
        self.writes
            .iter()
            .find(|(k, n, _)| *k == kind && n == name)
            .map(|(_, _, v)| *v)
    }
}

#[derive(Debug)]
struct State {
    atomic: bool,
    modifiers: bool,
    reject_modifier_fbs: bool,
    fail_fbs: bool,
    missing: HashSet<(ObjectKind, &'static str)>,
    commit_errno: Option<i32>,
    deliver_flips: bool,
    out_fence_delay: Option<Duration>,
    next_fb: u32,
    next_blob: u64,
    next_gem: u32,
    live_fbs: HashSet<FbId>,
    live_gems: HashSet<u32>,
    registered: Vec<(BufferLayout, bool)>,
    commits: Vec<CommitRecord>,
    blobs_destroyed: Vec<u64>,
    set_crtc_calls: usize,
    page_flips: Vec<FbId>,
    pending: VecDeque<KmsEvent>,
}

#[derive(Debug, Clone)]
pub struct MockKms {
    state: Rc<RefCell<State>>,
    journal: Journal,
    events: Rc<(OwnedFd, OwnedFd)>,
    /// When each delayed out-fence signaled, written from the signaling thread.
    signals: Arc<Mutex<Vec<Instant>>>,
}

fn property_names(kind: ObjectKind) -> &'static [&'static str] {
    match kind {
        ObjectKind::Plane => &[
            "type", "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y",
            "CRTC_W", "CRTC_H", "IN_FENCE_FD",
        ],
        ObjectKind::Crtc => &["ACTIVE", "MODE_ID", "OUT_FENCE_PTR"],
        ObjectKind::Connector => &["CRTC_ID"],
    }
}

fn property_base(kind: ObjectKind) -> PropertyId {
    match kind {
        ObjectKind::Plane => 100,
        ObjectKind::Crtc => 200,
        ObjectKind::Connector => 300,
    }
}

fn object_kind(object: ObjectId) -> Option<ObjectKind> {
    match object {
        CONNECTOR => Some(ObjectKind::Connector),
        CRTC => Some(ObjectKind::Crtc),
        PLANE => Some(ObjectKind::Plane),
        _ => None,
    }
}

fn property_name(kind: ObjectKind, property: PropertyId) -> String {
    let index = property.wrapping_sub(property_base(kind)) as usize;
    property_names(kind)
        .get(index)
        .map_or_else(|| format!("#{property}"), |name| name.to_string())
}

impl MockKms {
    pub fn new(journal: &Journal) -> io::Result<Self> {
        Ok(MockKms {
            state: Rc::new(RefCell::new(State {
                atomic: true,
                modifiers: true,
                reject_modifier_fbs: false,
                fail_fbs: false,
                missing: HashSet::new(),
                commit_errno: None,
                deliver_flips: true,
                out_fence_delay: None,
                next_fb: 1,
                next_blob: 900,
                next_gem: 1,
                live_fbs: HashSet::new(),
                live_gems: HashSet::new(),
                registered: Vec::new(),
                commits: Vec::new(),
                blobs_destroyed: Vec::new(),
                set_crtc_calls: 0,
                page_flips: Vec::new(),
                pending: VecDeque::new(),
            })),
            journal: journal.clone(),
            events: Rc::new(pipe()?),
            signals: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn as_adapter(&self) -> Rc<dyn KmsAdapter> {
        Rc::new(self.clone())
    }

    pub fn without_atomic(self) -> Self {
        self.state.borrow_mut().atomic = false;
        self
    }

    pub fn without_modifiers(self) -> Self {
        self.state.borrow_mut().modifiers = false;
        self
    }

    pub fn rejecting_modifier_framebuffers(self) -> Self {
        self.state.borrow_mut().reject_modifier_fbs = true;
        self
    }

    /// Every framebuffer registration fails.
    pub fn failing_framebuffers(self) -> Self {
        self.state.borrow_mut().fail_fbs = true;
        self
    }

    /// Out-fences signal `delay` after their commit instead of immediately.
    pub fn delaying_out_fences(self, delay: Duration) -> Self {
        self.state.borrow_mut().out_fence_delay = Some(delay);
        self
    }

    pub fn without_property(self, kind: ObjectKind, name: &'static str) -> Self {
        self.state.borrow_mut().missing.insert((kind, name));
        self
    }

    pub fn failing_commits(self, errno: i32) -> Self {
        self.state.borrow_mut().commit_errno = Some(errno);
        self
    }

    pub fn without_flip_events(self) -> Self {
        self.state.borrow_mut().deliver_flips = false;
        self
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state.borrow().commits.clone()
    }

    pub fn registered(&self) -> Vec<(BufferLayout, bool)> {
        self.state.borrow().registered.clone()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().live_fbs.len()
    }

    pub fn live_gem_handles(&self) -> usize {
        self.state.borrow().live_gems.len()
    }

    pub fn out_fence_signals(&self) -> Vec<Instant> {
        self.signals.lock().unwrap().clone()
    }

    pub fn blobs_destroyed(&self) -> Vec<u64> {
        self.state.borrow().blobs_destroyed.clone()
    }

    pub fn set_crtc_calls(&self) -> usize {
        self.state.borrow().set_crtc_calls
    }

    pub fn page_flips(&self) -> Vec<FbId> {
        self.state.borrow().page_flips.clone()
    }
}

/// A 640x480 target on the mock's fixed object ids.
pub fn target(with_plane: bool) -> DisplayTarget {
    DisplayTarget {
        connector: CONNECTOR,
        crtc: CRTC,
        crtc_index: 0,
        plane: with_plane.then_some(PLANE),
        mode: ModeInfo {
            name: "640x480".to_string(),
            width: 640,
            height: 480,
            vrefresh: 60,
            preferred: true,
            native: None,
        },
    }
}

impl KmsAdapter for MockKms {
    fn enable_atomic(&self) -> io::Result<()> {
        if self.state.borrow().atomic {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
        }
    }

    fn supports_modifiers(&self) -> bool {
        self.state.borrow().modifiers
    }

    fn object_properties(&self, object: ObjectId, kind: ObjectKind) -> io::Result<PropertyTable> {
        if object_kind(object) != Some(kind) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let state = self.state.borrow();
        let base = property_base(kind);
        Ok(property_names(kind)
            .iter()
            .enumerate()
            .filter(|(_, name)| !state.missing.contains(&(kind, **name)))
            .map(|(index, name)| (*name, base + index as PropertyId))
            .collect())
    }

    fn create_mode_blob(&self, _mode: &ModeInfo) -> io::Result<u64> {
        let mut state = self.state.borrow_mut();
        state.next_blob += 1;
        Ok(state.next_blob)
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.state.borrow_mut().blobs_destroyed.push(blob);
        Ok(())
    }

    fn atomic_commit(&self, request: CommitRequest) -> io::Result<Option<FenceFd>> {
        let writes: Vec<(ObjectKind, String, u64)> = request
            .writes()
            .iter()
            .filter_map(|w| {
                let kind = object_kind(w.object)?;
                Some((kind, property_name(kind, w.property), w.value))
            })
            .collect();
        let record = CommitRecord {
            flags: request.flags(),
            in_fence_fd: request.in_fence().map(|f| f.as_raw_fd()),
            out_fence: request.out_fence_target().is_some(),
            writes,
            at: Instant::now(),
        };
        let fb = record.value(ObjectKind::Plane, "FB_ID").map(|v| FbId(v as u32));
        self.journal.push(Entry::Commit {
            fb,
            flags: record.flags,
            in_fence: record.in_fence_fd.is_some(),
            out_fence: record.out_fence,
        });
        let (errno, delay) = {
            let mut state = self.state.borrow_mut();
            state.commits.push(record.clone());
            (state.commit_errno, state.out_fence_delay)
        };
        if let Some(errno) = errno {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if !record.out_fence {
            return Ok(None);
        }
        match delay {
            None => Ok(Some(signaled_fence(FenceKind::DisplayCompletion)?)),
            Some(delay) => {
                let (fence, tx) = pending_fence(FenceKind::DisplayCompletion)?;
                let signals = Arc::clone(&self.signals);
                thread::spawn(move || {
                    thread::sleep(delay);
                    signals.lock().unwrap().push(Instant::now());
                    let _ = write(&tx, &[1]);
                });
                Ok(Some(fence))
            }
        }
    }

    fn set_crtc(&self, _crtc: ObjectId, fb: FbId, _connector: ObjectId, _mode: &ModeInfo) -> io::Result<()> {
        self.state.borrow_mut().set_crtc_calls += 1;
        self.journal.push(Entry::SetCrtc(fb));
        Ok(())
    }

    fn page_flip(&self, crtc: ObjectId, fb: FbId) -> io::Result<()> {
        let deliver = {
            let mut state = self.state.borrow_mut();
            state.page_flips.push(fb);
            if state.deliver_flips {
                let frame = state.page_flips.len() as u32;
                state.pending.push_back(KmsEvent::PageFlip { crtc, frame });
            }
            state.deliver_flips
        };
        self.journal.push(Entry::PageFlip(fb));
        if deliver {
            write(&self.events.1, &[1])?;
        }
        Ok(())
    }

    fn event_fd(&self) -> BorrowedFd<'_> {
        self.events.0.as_fd()
    }

    fn receive_events(&self) -> io::Result<Vec<KmsEvent>> {
        let mut buf = [0u8; 64];
        File::from(self.events.0.try_clone()?).read(&mut buf)?;
        Ok(self.state.borrow_mut().pending.drain(..).collect())
    }

    fn add_framebuffer(&self, layout: &BufferLayout, with_modifiers: bool) -> io::Result<FbId> {
        let fb = {
            let mut state = self.state.borrow_mut();
            state.registered.push((*layout, with_modifiers));
            if state.fail_fbs || (with_modifiers && state.reject_modifier_fbs) {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            let fb = FbId(state.next_fb);
            state.next_fb += 1;
            state.live_fbs.insert(fb);
            fb
        };
        self.journal.push(Entry::AddFb(fb));
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: FbId) -> io::Result<()> {
        self.state.borrow_mut().live_fbs.remove(&fb);
        self.journal.push(Entry::RemoveFb(fb));
        Ok(())
    }

    fn import_prime_fd(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        state.next_gem += 1;
        let gem = state.next_gem;
        state.live_gems.insert(gem);
        Ok(gem)
    }

    fn close_buffer(&self, handle: u32) -> io::Result<()> {
        self.state.borrow_mut().live_gems.remove(&handle);
        self.journal.push(Entry::CloseGem(handle));
        Ok(())
    }
}
