//! EMT rendezvous: make every vcpu thread of a VM run a callback, in a
//! controlled order, before any of them continues.
//!
//! The initiator takes the rendezvous lock, installs the session and raises
//! [`VmFlags::EMT_RENDEZVOUS`]. Every other vcpu thread notices the flag in
//! [`Vm::process_forced_actions`] and joins. A callback running under a
//! serialized policy may start a nested rendezvous; its state is saved and
//! restored around the nested session.

mod barrier;
mod session;

#[cfg(test)]
mod tests;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use axerrno::AxResult;
use log::{debug, error, trace, warn};

use crate::flags::VmFlags;
use crate::hal::{VmmHal, WaitEvent};
use crate::vcpu::VCpu;
use crate::vm::Vm;
use crate::{StrictStatus, VmmError, VmmResult};

use self::barrier::{Barrier, Gate};
use self::session::{Session, SessionParams, SessionSnapshot};

pub(crate) use self::barrier::wait_signaled;
pub use self::session::{
    RendezvousFlags, RendezvousFn, RendezvousPolicy, SessionCounts, SessionInfo,
};

/// The maximum number of sessions a rendezvous may be nested in.
pub const MAX_RECURSION_DEPTH: usize = 2;

/// Lock value when nobody owns the rendezvous.
const UNLOCKED: usize = 0;

/// The rendezvous state of a VM.
pub(crate) struct Rendezvous<H: VmmHal> {
    /// `UNLOCKED`, or the id of the initiating vcpu plus one.
    lock: AtomicUsize,
    session: Session<H>,
    barrier: Barrier<H>,
    /// Set while the participants are being moved into a nested session.
    recursing: AtomicBool,
    push_count: AtomicU32,
    pop_count: AtomicU32,
}

impl<H: VmmHal> Rendezvous<H> {
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            lock: AtomicUsize::new(UNLOCKED),
            session: Session::new(),
            barrier: Barrier::new()?,
            recursing: AtomicBool::new(false),
            push_count: AtomicU32::new(0),
            pop_count: AtomicU32::new(0),
        })
    }

    fn try_lock(&self, vcpu_id: usize) -> bool {
        self.lock
            .compare_exchange(UNLOCKED, vcpu_id + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.lock.store(UNLOCKED, Ordering::Release);
    }
}

impl<H: VmmHal> Vm<H> {
    /// Run `callback` on every vcpu thread of the VM according to `policy`.
    ///
    /// When called from a thread that is not a vcpu thread the rendezvous is
    /// forwarded to the first vcpu thread that picks it up, and this call waits
    /// for its result.
    ///
    /// Returns the aggregated status of the callbacks: success or the most
    /// urgent informational status. A failure is returned as
    /// [`VmmError::Callback`].
    pub fn rendezvous<F>(
        &self,
        policy: RendezvousPolicy,
        flags: RendezvousFlags,
        callback: F,
    ) -> VmmResult<StrictStatus>
    where
        F: Fn(&Vm<H>, &VCpu<H>) -> StrictStatus + Send + Sync + 'static,
    {
        self.rendezvous_with(policy, flags, Arc::new(callback))
    }

    /// Like [`Vm::rendezvous`], with a callback that is already shared.
    pub fn rendezvous_with(
        &self,
        policy: RendezvousPolicy,
        flags: RendezvousFlags,
        callback: RendezvousFn<H>,
    ) -> VmmResult<StrictStatus> {
        if flags.contains(RendezvousFlags::STOP_ON_ERROR) && !policy.supports_stop_on_error() {
            warn!("rendezvous: STOP_ON_ERROR requested with {:?}", policy);
            return Err(VmmError::ContractViolation(
                "stop-on-error needs a policy that runs callbacks one at a time",
            ));
        }

        let Some(vcpu) = self.current_vcpu() else {
            debug!("rendezvous: forwarding {:?} to a vcpu thread", policy);
            return self.call_on_any_vcpu(
                flags.contains(RendezvousFlags::PRIORITY),
                move |vm, _vcpu| vm.rendezvous_with(policy, flags, callback),
            );
        };

        let params = SessionParams {
            policy,
            flags,
            callback,
        };
        let count = self.vcpu_count();
        let status = if count == 1 || (self.is_destroying() && self.active_vcpu_count() < count) {
            self.rendezvous_single(vcpu, params)?
        } else {
            self.rendezvous_smp(vcpu, params)?
        };

        if status.is_failure() {
            Err(VmmError::Callback(status))
        } else {
            Ok(status)
        }
    }

    /// Join the pending rendezvous, if any, from the calling vcpu thread.
    pub fn process_rendezvous(&self, vcpu: &VCpu<H>) -> VmmResult<StrictStatus> {
        if vcpu.in_rendezvous() {
            warn!("vcpu {} is already in a rendezvous", vcpu.id());
            return Ok(StrictStatus::SUCCESS);
        }
        let Some(params) = self.rendezvous.session.params() else {
            return Ok(StrictStatus::SUCCESS);
        };
        vcpu.set_in_rendezvous(true);
        let result = self.rendezvous_common(vcpu, false, &params);
        vcpu.set_in_rendezvous(false);
        result
    }

    /// A snapshot of the session in progress.
    pub fn rendezvous_session(&self) -> Option<SessionInfo<H>> {
        self.rendezvous.session.info()
    }

    /// The counters of the current (or last) session.
    pub fn rendezvous_counts(&self) -> SessionCounts {
        self.rendezvous.session.counts()
    }

    fn gate(&self, gate: Gate) -> &dyn WaitEvent {
        self.rendezvous.barrier.event(gate, &self.vcpus)
    }

    fn count_u32(&self) -> u32 {
        self.vcpus.len() as u32
    }

    fn rendezvous_deadlock(&self, vcpu: &VCpu<H>, depth: usize) -> VmmResult<StrictStatus> {
        error!(
            "vcpu {}: rendezvous deadlock at depth {} (parent policy {:?})",
            vcpu.id(),
            depth,
            self.rendezvous.session.policy()
        );
        H::resume_from(vcpu.id(), VmmError::Deadlock { depth })
    }

    /// The rendezvous of a VM with a single participant, or of a VM being
    /// destroyed that lost some of its vcpus.
    fn rendezvous_single(
        &self,
        vcpu: &VCpu<H>,
        params: SessionParams<H>,
    ) -> VmmResult<StrictStatus> {
        let session = &self.rendezvous.session;
        if !vcpu.in_rendezvous() {
            vcpu.set_in_rendezvous(true);
            session.install(params.clone());
            let status = self.run_single(vcpu, &params);
            session.clear();
            vcpu.set_in_rendezvous(false);
            return Ok(status);
        }

        let depth = session.depth();
        let Some(parent) = session.snapshot() else {
            return self.rendezvous_deadlock(vcpu, depth);
        };
        if depth >= MAX_RECURSION_DEPTH || !parent.params.policy.supports_recursion() {
            return self.rendezvous_deadlock(vcpu, depth);
        }
        session.push(parent, params.clone());
        let status = self.run_single(vcpu, &params);
        session.pop(1);
        Ok(status)
    }

    fn run_single(&self, vcpu: &VCpu<H>, params: &SessionParams<H>) -> StrictStatus {
        let session = &self.rendezvous.session;
        session.entered.store(1, Ordering::Release);
        let status = (params.callback)(self, vcpu);
        session.status.merge(status);
        session.done.store(1, Ordering::Release);
        session.returned.store(1, Ordering::Release);
        session.status.load()
    }

    fn rendezvous_smp(&self, vcpu: &VCpu<H>, params: SessionParams<H>) -> VmmResult<StrictStatus> {
        let rdv = &self.rendezvous;
        let mut status = StrictStatus::SUCCESS;

        if !rdv.try_lock(vcpu.id()) {
            if vcpu.in_rendezvous() {
                let depth = rdv.session.depth();
                if rdv
                    .session
                    .policy()
                    .is_some_and(RendezvousPolicy::supports_recursion)
                {
                    return self.rendezvous_recursive(vcpu, params);
                }
                return self.rendezvous_deadlock(vcpu, depth);
            }

            trace!("vcpu {} waiting for the rendezvous lock", vcpu.id());
            while !rdv.try_lock(vcpu.id()) {
                if self.is_rendezvous_pending() {
                    status = status.merge(self.process_rendezvous(vcpu)?);
                }
                H::relax();
            }
        }
        debug!(
            "vcpu {} starts a {:?} rendezvous ({:?})",
            vcpu.id(),
            params.policy,
            params.flags
        );

        vcpu.set_in_rendezvous(true);
        rdv.barrier.reset_session(&self.vcpus);
        rdv.session.install(params.clone());
        self.set_global_flags(VmFlags::EMT_RENDEZVOUS);

        let result = self.rendezvous_initiate(vcpu, &params);

        let aggregated = rdv.session.status.load();
        rdv.session.clear();
        rdv.unlock();
        vcpu.set_in_rendezvous(false);

        Ok(status.merge(result?).merge(aggregated))
    }

    /// Take part in the current session as its initiator and wait until every
    /// other participant has left it.
    fn rendezvous_initiate(
        &self,
        vcpu: &VCpu<H>,
        params: &SessionParams<H>,
    ) -> VmmResult<StrictStatus> {
        let mut status = self.rendezvous_common(vcpu, true, params)?;
        self.wait_turn(vcpu, Gate::DoneCaller, &mut status)?;
        self.rendezvous.session.returned.fetch_add(1, Ordering::AcqRel);
        Ok(status)
    }

    /// Wait on `gate`, following any nested session started meanwhile.
    fn wait_turn(&self, vcpu: &VCpu<H>, gate: Gate, status: &mut StrictStatus) -> VmmResult {
        loop {
            wait_signaled(self.gate(gate))?;
            if !self.rendezvous.recursing.load(Ordering::Acquire) {
                return Ok(());
            }
            *status = self.rendezvous_follow(vcpu, *status)?;
        }
    }

    /// The part of a session every participant goes through.
    fn rendezvous_common(
        &self,
        vcpu: &VCpu<H>,
        is_caller: bool,
        params: &SessionParams<H>,
    ) -> VmmResult<StrictStatus> {
        let session = &self.rendezvous.session;
        let count = self.vcpu_count();
        let policy = params.policy;
        let mut status = StrictStatus::SUCCESS;

        let entered = session.entered.fetch_add(1, Ordering::AcqRel) + 1;
        if entered != count as u32 {
            match policy.entry_gate(vcpu.id()) {
                Some(gate) => self.wait_turn(vcpu, gate, &mut status)?,
                None => {
                    // Only the last to arrive runs a `Once` callback.
                    session.done.fetch_add(1, Ordering::AcqRel);
                    if !is_caller {
                        self.wait_turn(vcpu, Gate::Done, &mut status)?;
                        return Ok(self.rendezvous_leave(status));
                    }
                    return Ok(status);
                }
            }
        } else {
            self.clear_global_flags(VmFlags::EMT_RENDEZVOUS);
            trace!("vcpu {} is the last to enter", vcpu.id());
            match policy {
                RendezvousPolicy::AllAtOnce => self.gate(Gate::AllAtOnce).signal(),
                RendezvousPolicy::Ascending | RendezvousPolicy::Descending => {
                    if let Some(first) = policy.first_turn(count) {
                        if first != vcpu.id() {
                            self.gate(Gate::Ordered(first)).signal();
                            self.wait_turn(vcpu, Gate::Ordered(vcpu.id()), &mut status)?;
                        }
                    }
                }
                RendezvousPolicy::OneByOne | RendezvousPolicy::Once => {}
            }
        }

        if !params.flags.contains(RendezvousFlags::STOP_ON_ERROR)
            || !session.status.load().is_failure()
        {
            let result = (params.callback)(self, vcpu);
            session.status.merge(result);
        } else {
            trace!("vcpu {} skips the callback after an error", vcpu.id());
        }

        let done = session.done.fetch_add(1, Ordering::AcqRel) + 1;
        if done != count as u32 && policy != RendezvousPolicy::Once {
            if let Some(gate) = policy.next_turn(vcpu.id(), done as usize, count) {
                self.gate(gate).signal();
            }
            if !is_caller {
                self.wait_turn(vcpu, Gate::Done, &mut status)?;
            }
        } else {
            self.gate(Gate::Done).signal();
        }

        if !is_caller {
            return Ok(self.rendezvous_leave(status));
        }
        Ok(status)
    }

    /// A participant other than the initiator leaves the session.
    fn rendezvous_leave(&self, status: StrictStatus) -> StrictStatus {
        let session = &self.rendezvous.session;
        // Read before leaving, the initiator may end the session right after.
        let session_status = session.status.load();
        let returned = session.returned.fetch_add(1, Ordering::AcqRel) + 1;
        if returned == self.count_u32() - 1 {
            self.gate(Gate::DoneCaller).signal();
        }
        if session_status.is_informational() {
            status.merge(session_status)
        } else {
            status
        }
    }

    /// Start a session nested in the one in progress, from one of its callbacks.
    fn rendezvous_recursive(
        &self,
        vcpu: &VCpu<H>,
        params: SessionParams<H>,
    ) -> VmmResult<StrictStatus> {
        let rdv = &self.rendezvous;
        let count = self.vcpu_count();
        let depth = rdv.session.depth();
        if depth >= MAX_RECURSION_DEPTH {
            return self.rendezvous_deadlock(vcpu, depth);
        }
        let Some(parent) = rdv.session.snapshot() else {
            return self.rendezvous_deadlock(vcpu, depth);
        };
        debug!(
            "vcpu {} nests a {:?} rendezvous in a {:?} one (depth {})",
            vcpu.id(),
            params.policy,
            parent.params.policy,
            depth + 1
        );

        // Get everyone out of the parent's wait gates.
        rdv.barrier.reset_recursion();
        rdv.push_count.store(0, Ordering::Release);
        rdv.recursing.store(true, Ordering::Release);
        for gate in parent
            .params
            .policy
            .pending_turns(vcpu.id(), parent.done as usize, count)
        {
            self.gate(gate).signal();
        }
        self.gate(Gate::Done).signal();
        self.gate(Gate::DoneCaller).signal();

        if rdv.push_count.fetch_add(1, Ordering::AcqRel) + 1 != count as u32 {
            wait_signaled(self.gate(Gate::RecursionPushCaller))?;
        }
        rdv.recursing.store(false, Ordering::Release);

        // A `Once` bystander may have counted itself done after the first snapshot.
        let parent = SessionSnapshot {
            done: rdv.session.done.load(Ordering::Acquire),
            status: rdv.session.status.load(),
            ..parent
        };
        rdv.barrier.reset_session(&self.vcpus);
        rdv.session.push(parent, params.clone());
        self.gate(Gate::RecursionPush).signal();

        let result = self.rendezvous_initiate(vcpu, &params);
        let status = rdv.session.status.load();

        rdv.barrier.reset_session(&self.vcpus);
        rdv.session.pop(count as u32);
        rdv.pop_count.store(0, Ordering::Release);
        self.gate(Gate::RecursionPop).signal();
        if rdv.pop_count.fetch_add(1, Ordering::AcqRel) + 1 != count as u32 {
            wait_signaled(self.gate(Gate::RecursionPopCaller))?;
        }
        self.gate(Gate::RecursionPop).reset();
        trace!("vcpu {} back at depth {}", vcpu.id(), depth);

        Ok(result?.merge(status))
    }

    /// Follow a nested session started by another participant.
    fn rendezvous_follow(&self, vcpu: &VCpu<H>, status: StrictStatus) -> VmmResult<StrictStatus> {
        let rdv = &self.rendezvous;
        let count = self.count_u32();

        if rdv.push_count.fetch_add(1, Ordering::AcqRel) + 1 == count {
            self.gate(Gate::RecursionPushCaller).signal();
        }
        wait_signaled(self.gate(Gate::RecursionPush))?;

        let Some(params) = rdv.session.params() else {
            return Err(VmmError::ContractViolation("nested rendezvous without a session"));
        };
        let nested = self.rendezvous_common(vcpu, false, &params)?;

        wait_signaled(self.gate(Gate::RecursionPop))?;
        if rdv.pop_count.fetch_add(1, Ordering::AcqRel) + 1 == count {
            self.gate(Gate::RecursionPopCaller).signal();
        }
        Ok(status.merge(nested))
    }
}
