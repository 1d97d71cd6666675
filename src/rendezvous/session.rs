use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::status::AtomicStatus;
use crate::vcpu::VCpu;
use crate::vm::Vm;
use crate::{StrictStatus, VmmHal};

/// A rendezvous callback.
///
/// Invoked once per participating vcpu, on that vcpu's thread. Any argument
/// the caller wants to pass along is captured by the closure.
pub type RendezvousFn<H> = Arc<dyn Fn(&Vm<H>, &VCpu<H>) -> StrictStatus + Send + Sync>;

/// In which order the participants of a rendezvous run the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousPolicy {
    /// One at a time, in arrival order.
    OneByOne,
    /// Everyone concurrently.
    AllAtOnce,
    /// One at a time, by ascending vcpu id.
    Ascending,
    /// One at a time, by descending vcpu id.
    Descending,
    /// Exactly one participant (the last to arrive) runs the callback.
    Once,
}

impl RendezvousPolicy {
    /// Whether at most one participant runs the callback at any time.
    pub const fn is_serialized(self) -> bool {
        !matches!(self, Self::AllAtOnce)
    }

    /// Whether a callback running under this policy may start a nested rendezvous.
    pub const fn supports_recursion(self) -> bool {
        self.is_serialized()
    }

    /// Whether [`RendezvousFlags::STOP_ON_ERROR`] can be honoured.
    pub const fn supports_stop_on_error(self) -> bool {
        matches!(self, Self::OneByOne | Self::Ascending | Self::Descending)
    }
}

bitflags! {
    /// Options of a rendezvous.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct RendezvousFlags: u32 {
        /// Skip the callback on the remaining participants once one failed.
        const STOP_ON_ERROR = 1 << 0;
        /// When forwarded from a non-vcpu thread, jump the request queue.
        const PRIORITY = 1 << 1;
    }
}

/// Counters of the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    /// Participants that have entered.
    pub entered: u32,
    /// Participants that have finished (or skipped) the callback.
    pub done: u32,
    /// Participants that have left.
    pub returned: u32,
}

/// A snapshot of the rendezvous session currently in progress.
pub struct SessionInfo<H: VmmHal> {
    /// The order in which participants run the callback.
    pub policy: RendezvousPolicy,
    /// The flags the session was started with.
    pub flags: RendezvousFlags,
    /// Entered, done and returned participants so far.
    pub counts: SessionCounts,
    /// The aggregated callback status so far.
    pub status: StrictStatus,
    /// How many sessions this one is nested in.
    pub depth: usize,
    /// The callback each participant runs.
    pub callback: RendezvousFn<H>,
}

impl<H: VmmHal> PartialEq for SessionInfo<H> {
    fn eq(&self, other: &Self) -> bool {
        self.policy == other.policy
            && self.flags == other.flags
            && self.counts == other.counts
            && self.status == other.status
            && self.depth == other.depth
            && Arc::ptr_eq(&self.callback, &other.callback)
    }
}

impl<H: VmmHal> core::fmt::Debug for SessionInfo<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionInfo")
            .field("policy", &self.policy)
            .field("flags", &self.flags)
            .field("counts", &self.counts)
            .field("status", &self.status)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// The parameters a session was started with.
pub(crate) struct SessionParams<H: VmmHal> {
    pub policy: RendezvousPolicy,
    pub flags: RendezvousFlags,
    pub callback: RendezvousFn<H>,
}

impl<H: VmmHal> Clone for SessionParams<H> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            flags: self.flags,
            callback: self.callback.clone(),
        }
    }
}

/// What a nested session has to put back when it finishes.
pub(crate) struct SessionSnapshot<H: VmmHal> {
    pub params: SessionParams<H>,
    pub done: u32,
    pub status: StrictStatus,
}

/// The shared state of the session in progress, plus the saved state of the
/// sessions it is nested in.
pub(crate) struct Session<H: VmmHal> {
    params: Mutex<Option<SessionParams<H>>>,
    pub entered: AtomicU32,
    pub done: AtomicU32,
    pub returned: AtomicU32,
    pub status: AtomicStatus,
    parents: Mutex<Vec<SessionSnapshot<H>>>,
}

impl<H: VmmHal> Session<H> {
    pub fn new() -> Self {
        Self {
            params: Mutex::new(None),
            entered: AtomicU32::new(0),
            done: AtomicU32::new(0),
            returned: AtomicU32::new(0),
            status: AtomicStatus::new(),
            parents: Mutex::new(Vec::new()),
        }
    }

    /// Start a fresh session with zeroed counters.
    pub fn install(&self, params: SessionParams<H>) {
        self.entered.store(0, Ordering::Release);
        self.done.store(0, Ordering::Release);
        self.returned.store(0, Ordering::Release);
        self.status.store(StrictStatus::SUCCESS);
        *self.params.lock() = Some(params);
    }

    /// End the outermost session.
    pub fn clear(&self) {
        *self.params.lock() = None;
    }

    pub fn params(&self) -> Option<SessionParams<H>> {
        self.params.lock().clone()
    }

    pub fn policy(&self) -> Option<RendezvousPolicy> {
        self.params.lock().as_ref().map(|params| params.policy)
    }

    pub fn counts(&self) -> SessionCounts {
        SessionCounts {
            entered: self.entered.load(Ordering::Acquire),
            done: self.done.load(Ordering::Acquire),
            returned: self.returned.load(Ordering::Acquire),
        }
    }

    /// Number of sessions the current one is nested in.
    pub fn depth(&self) -> usize {
        self.parents.lock().len()
    }

    /// Capture what a nested session must restore.
    pub fn snapshot(&self) -> Option<SessionSnapshot<H>> {
        self.params().map(|params| SessionSnapshot {
            params,
            done: self.done.load(Ordering::Acquire),
            status: self.status.load(),
        })
    }

    /// Save `parent` and start a nested session.
    pub fn push(&self, parent: SessionSnapshot<H>, params: SessionParams<H>) {
        self.parents.lock().push(parent);
        self.install(params);
    }

    /// Finish a nested session and put its parent back. The parent is still in
    /// its callback phase, so all `count` participants have entered and none
    /// has returned.
    pub fn pop(&self, count: u32) {
        let Some(parent) = self.parents.lock().pop() else {
            return;
        };
        self.entered.store(count, Ordering::Release);
        self.done.store(parent.done, Ordering::Release);
        self.returned.store(0, Ordering::Release);
        self.status.store(parent.status);
        *self.params.lock() = Some(parent.params);
    }

    pub fn info(&self) -> Option<SessionInfo<H>> {
        let params = self.params()?;
        Some(SessionInfo {
            policy: params.policy,
            flags: params.flags,
            counts: self.counts(),
            status: self.status.load(),
            depth: self.depth(),
            callback: params.callback,
        })
    }
}
