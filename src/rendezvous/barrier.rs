//! Wait handles of the rendezvous and the order in which they are signaled.

use alloc::vec::Vec;

use axerrno::AxResult;
use log::warn;

use super::RendezvousPolicy;
use crate::hal::{VmmHal, WaitEvent, WaitOutcome};
use crate::vcpu::VCpu;
use crate::{VmmError, VmmResult};

/// How many consecutive timeouts or interruptions an unbounded wait tolerates.
const MAX_SPURIOUS_WAKEUPS: u32 = 1024;

/// Something a participant can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    /// The shared turn of a [`RendezvousPolicy::OneByOne`] session.
    OneByOne,
    /// The turn of one vcpu in an ordered session.
    Ordered(usize),
    /// The start of an [`RendezvousPolicy::AllAtOnce`] session.
    AllAtOnce,
    /// Every non-initiator leaves through this one.
    Done,
    /// The initiator leaves through this one once all others have returned.
    DoneCaller,
    /// Participants enter a nested session through this one.
    RecursionPush,
    /// Participants go back to the parent session through this one.
    RecursionPop,
    /// All participants are ready for the nested session.
    RecursionPushCaller,
    /// All participants are back in the parent session.
    RecursionPopCaller,
}

/// The wait handles of the rendezvous, except the per-vcpu ordered events
/// which live in [`VCpu`].
pub(crate) struct Barrier<H: VmmHal> {
    one_by_one: H::Event,
    all_at_once: H::MultiEvent,
    done: H::MultiEvent,
    done_caller: H::Event,
    recursion_push: H::MultiEvent,
    recursion_pop: H::MultiEvent,
    recursion_push_caller: H::Event,
    recursion_pop_caller: H::Event,
}

impl<H: VmmHal> Barrier<H> {
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            one_by_one: H::new_event()?,
            all_at_once: H::new_multi_event()?,
            done: H::new_multi_event()?,
            done_caller: H::new_event()?,
            recursion_push: H::new_multi_event()?,
            recursion_pop: H::new_multi_event()?,
            recursion_push_caller: H::new_event()?,
            recursion_pop_caller: H::new_event()?,
        })
    }

    pub fn event<'a>(&'a self, gate: Gate, vcpus: &'a [VCpu<H>]) -> &'a dyn WaitEvent {
        match gate {
            Gate::OneByOne => &self.one_by_one,
            Gate::Ordered(id) => vcpus[id].ordered_event(),
            Gate::AllAtOnce => &self.all_at_once,
            Gate::Done => &self.done,
            Gate::DoneCaller => &self.done_caller,
            Gate::RecursionPush => &self.recursion_push,
            Gate::RecursionPop => &self.recursion_pop,
            Gate::RecursionPushCaller => &self.recursion_push_caller,
            Gate::RecursionPopCaller => &self.recursion_pop_caller,
        }
    }

    /// Drop stale signals of every gate used inside a session.
    pub fn reset_session(&self, vcpus: &[VCpu<H>]) {
        self.one_by_one.reset();
        self.all_at_once.reset();
        self.done.reset();
        self.done_caller.reset();
        for vcpu in vcpus {
            vcpu.ordered_event().reset();
        }
    }

    /// Drop stale signals of the gates used to switch between sessions.
    pub fn reset_recursion(&self) {
        self.recursion_push.reset();
        self.recursion_pop.reset();
        self.recursion_push_caller.reset();
        self.recursion_pop_caller.reset();
    }
}

impl RendezvousPolicy {
    /// The gate a participant that is not the last to arrive waits on before
    /// its turn. `None` for [`RendezvousPolicy::Once`], where only the last
    /// arrival runs the callback.
    pub(crate) fn entry_gate(self, id: usize) -> Option<Gate> {
        match self {
            Self::OneByOne => Some(Gate::OneByOne),
            Self::AllAtOnce => Some(Gate::AllAtOnce),
            Self::Ascending | Self::Descending => Some(Gate::Ordered(id)),
            Self::Once => None,
        }
    }

    /// The vcpu that runs the callback first in an ordered session.
    pub(crate) fn first_turn(self, count: usize) -> Option<usize> {
        match self {
            Self::Ascending => Some(0),
            Self::Descending => Some(count - 1),
            _ => None,
        }
    }

    /// The gate to signal after `id` finished the callback as the `done`-th
    /// participant, when others still have to run it.
    pub(crate) fn next_turn(self, id: usize, done: usize, count: usize) -> Option<Gate> {
        match self {
            Self::OneByOne => Some(Gate::OneByOne),
            Self::Ascending => Some(Gate::Ordered(id + 1)),
            Self::Descending => Some(Gate::Ordered(count - done - 1)),
            Self::AllAtOnce | Self::Once => None,
        }
    }

    /// The gates to signal so that every participant still waiting for its
    /// turn notices a nested session started by vcpu `id`, given that `done`
    /// participants had finished before it.
    pub(crate) fn pending_turns(self, id: usize, done: usize, count: usize) -> Vec<Gate> {
        match self {
            Self::OneByOne => (done + 1..count).map(|_| Gate::OneByOne).collect(),
            Self::Ascending => (id + 1..count).map(Gate::Ordered).collect(),
            Self::Descending => (0..id).map(Gate::Ordered).collect(),
            Self::AllAtOnce | Self::Once => Vec::new(),
        }
    }
}

/// Wait for `event` without a timeout.
///
/// Timeouts and interruptions are retried; only a long streak of them is
/// reported. A destroyed handle is reported right away.
pub(crate) fn wait_signaled(event: &(impl WaitEvent + ?Sized)) -> VmmResult {
    let mut spurious = 0;
    loop {
        let err = match event.wait(None) {
            WaitOutcome::Signaled => return Ok(()),
            WaitOutcome::Destroyed => return Err(VmmError::Destroyed),
            WaitOutcome::TimedOut => VmmError::Timeout,
            WaitOutcome::Interrupted => VmmError::Interrupted,
        };
        spurious += 1;
        if spurious >= MAX_SPURIOUS_WAKEUPS {
            warn!("giving up on a rendezvous wait: {}", err);
            return Err(err);
        }
    }
}
