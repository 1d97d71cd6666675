//! The halt scheduler.
//!
//! When the guest executes HLT (or MWAIT) the vcpu thread asks the
//! [`HaltScheduler`] what to do: resume guest execution right away, spin for a
//! short while, block on the vcpu's halt event until the next timer deadline,
//! or give up and return to the host scheduler.

use core::sync::atomic::{fence, Ordering};

use log::{debug, trace, warn};

use crate::arch_vcpu::{ArchVCpuOps, Interruptibility, MonitorWait};
use crate::exit::{EscalateReason, HaltExit};
use crate::flags::{CpuFlags, VmFlags};
use crate::hal::{VmmHal, WaitEvent, WaitOutcome};
use crate::vcpu::{RunState, VCpu};
use crate::vm::Vm;

/// Every this many halts the rolling statistics are collapsed to a small bias.
pub const HALT_HISTORY_PERIOD: u32 = 256;

/// Tolerance used to classify how precisely a block ended.
const BLOCK_ACCURACY_NS: u64 = 50_000;

/// Tuning of the halt scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltConfig {
    /// Whether halts may be handled in the privileged context at all. When
    /// `false` every halt is escalated.
    pub may_halt_in_privileged: bool,
    /// Timer deadlines closer than this are not worth blocking for.
    pub spin_block_threshold_ns: u64,
    /// Number of polling iterations before blocking.
    pub spin_loops: u32,
    /// Spinning is only considered with at least this many host CPUs online.
    pub min_online_cpus_for_spin: usize,
    /// Upper bound of a single block, also used when no timer is armed.
    pub max_block_ns: u64,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            may_halt_in_privileged: true,
            spin_block_threshold_ns: 50_000,
            spin_loops: 42,
            min_online_cpus_for_spin: 4,
            max_block_ns: 1_000_000_000,
        }
    }
}

/// Rolling outcome history that biases the spin decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaltStatistics {
    /// Halts handled since the statistics were created.
    pub halts_total: u32,
    /// Recent halts that resumed guest execution.
    pub halts_succeeded: u32,
    /// Recent halts that were escalated to the host.
    pub halts_to_escalate: u32,
}

impl HaltStatistics {
    fn record(&mut self, resumed: bool) {
        if resumed {
            self.halts_succeeded = self.halts_succeeded.saturating_add(1);
        } else {
            self.halts_to_escalate = self.halts_to_escalate.saturating_add(1);
        }
        self.halts_total = self.halts_total.wrapping_add(1);
        if self.halts_total % HALT_HISTORY_PERIOD == 0 {
            self.decay();
        }
    }

    /// Keep the direction of the history but forget its magnitude.
    fn decay(&mut self) {
        if self.halts_succeeded > self.halts_to_escalate {
            self.halts_succeeded = 2;
            self.halts_to_escalate = 0;
        } else {
            self.halts_succeeded = 0;
            self.halts_to_escalate = 2;
        }
        trace!(
            "halt statistics decayed to {}/{}",
            self.halts_succeeded,
            self.halts_to_escalate
        );
    }

    /// Whether recent halts mostly resumed.
    fn favors_resume(&self) -> bool {
        self.halts_succeeded > self.halts_to_escalate
    }
}

/// Counters describing how halts were resolved. Monotonic, never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaltCounters {
    pub resumed: u64,
    pub resumed_from_spin: u64,
    pub resumed_from_block: u64,
    pub escalated_from_spin: u64,
    pub not_allowed: u64,
    pub pending_force_flags: u64,
    pub small_delta: u64,
    pub state_changed: u64,
    pub block_failed: u64,
    pub no_interrupt_after_block: u64,
    pub interrupt_not_deliverable: u64,
    pub blocks: u64,
    pub blocks_on_time: u64,
    pub blocks_overslept: u64,
    pub blocks_insomnia: u64,
}

impl HaltCounters {
    fn count_exit(&mut self, exit: HaltExit) {
        let counter = match exit {
            HaltExit::Resume { .. } => &mut self.resumed,
            HaltExit::EscalateToHost(reason) => match reason {
                EscalateReason::NotAllowed => &mut self.not_allowed,
                EscalateReason::PendingForceFlags => &mut self.pending_force_flags,
                EscalateReason::SmallDelta => &mut self.small_delta,
                EscalateReason::StateChanged => &mut self.state_changed,
                EscalateReason::BlockFailed => &mut self.block_failed,
                EscalateReason::NoInterruptAfterBlock => &mut self.no_interrupt_after_block,
                EscalateReason::InterruptNotDeliverable => &mut self.interrupt_not_deliverable,
            },
        };
        *counter += 1;
    }

    /// Classify a finished block against the time it was supposed to end.
    fn count_block(&mut self, expire_ns: u64, end_ns: u64) {
        self.blocks += 1;
        if end_ns > expire_ns.saturating_add(BLOCK_ACCURACY_NS) {
            self.blocks_overslept += 1;
        } else if end_ns.saturating_add(BLOCK_ACCURACY_NS) < expire_ns {
            self.blocks_insomnia += 1;
        } else {
            self.blocks_on_time += 1;
        }
    }
}

/// Per-vcpu halt scheduler. Owned by the vcpu thread, so no locking is needed.
#[derive(Debug, Clone, Default)]
pub struct HaltScheduler {
    config: HaltConfig,
    stats: HaltStatistics,
    counters: HaltCounters,
}

impl HaltScheduler {
    /// Create a scheduler with fresh statistics.
    pub fn new(config: HaltConfig) -> Self {
        Self {
            config,
            stats: HaltStatistics::default(),
            counters: HaltCounters::default(),
        }
    }

    pub fn config(&self) -> &HaltConfig {
        &self.config
    }

    /// Replace the tuning. The statistics are kept.
    pub fn set_config(&mut self, config: HaltConfig) {
        self.config = config;
    }

    /// Allow or forbid handling halts in the privileged context.
    pub fn set_may_halt_in_privileged(&mut self, allowed: bool) {
        debug!("may_halt_in_privileged: {}", allowed);
        self.config.may_halt_in_privileged = allowed;
    }

    pub fn statistics(&self) -> &HaltStatistics {
        &self.stats
    }

    pub fn counters(&self) -> &HaltCounters {
        &self.counters
    }

    /// Handle a guest halt on the calling vcpu thread.
    ///
    /// Must be called from `vcpu`'s own thread while the vcpu is
    /// [`RunState::Started`]. On return the vcpu is `Started` again unless the
    /// lifecycle controller stopped it meanwhile.
    pub fn halt<H: VmmHal, A: ArchVCpuOps>(
        &mut self,
        vm: &Vm<H>,
        vcpu: &VCpu<H>,
        arch: &mut A,
    ) -> HaltExit {
        let exit = self.decide(vm, vcpu, arch);
        self.stats.record(exit.is_resume());
        self.counters.count_exit(exit);
        trace!("vcpu {} halt: {:?}", vcpu.id(), exit);
        exit
    }

    fn decide<H: VmmHal, A: ArchVCpuOps>(
        &mut self,
        vm: &Vm<H>,
        vcpu: &VCpu<H>,
        arch: &mut A,
    ) -> HaltExit {
        let mwait = arch.monitor_wait();
        let interruptibility = arch.interruptibility();
        if !self.config.may_halt_in_privileged
            || arch.has_pending_trap()
            || !(interruptibility == Interruptibility::Unrestrained
                || mwait == MonitorWait::BreakOnInterrupt)
        {
            return HaltExit::EscalateToHost(EscalateReason::NotAllowed);
        }

        if needs_host(vm, vcpu) {
            return HaltExit::EscalateToHost(EscalateReason::PendingForceFlags);
        }
        if wake_pending(vcpu, arch) {
            return deliver(vcpu, arch, mwait, interruptibility);
        }
        H::relax();

        let now = H::now_ns();
        let deadline = arch.next_timer_deadline();
        let delta = deadline.map_or(u64::MAX, |deadline| deadline.saturating_sub(now));

        // The timer query may have raised flags.
        if needs_host(vm, vcpu) {
            return HaltExit::EscalateToHost(EscalateReason::PendingForceFlags);
        }
        if wake_pending(vcpu, arch) {
            return deliver(vcpu, arch, mwait, interruptibility);
        }
        if delta < self.config.spin_block_threshold_ns {
            return HaltExit::EscalateToHost(EscalateReason::SmallDelta);
        }

        if self.stats.favors_resume()
            && H::online_cpu_count() >= self.config.min_online_cpus_for_spin
        {
            for _ in 0..self.config.spin_loops {
                H::relax();
                if vcpu.test_and_clear_flags(CpuFlags::UPDATE_APIC) {
                    arch.update_pending_interrupts();
                }
                if needs_host(vm, vcpu) {
                    self.counters.escalated_from_spin += 1;
                    return HaltExit::EscalateToHost(EscalateReason::PendingForceFlags);
                }
                if vcpu.flags().is_any_set(CpuFlags::WAKE_MASK) {
                    self.counters.resumed_from_spin += 1;
                    return deliver(vcpu, arch, mwait, interruptibility);
                }
            }
        }

        vcpu.halt_event().reset();
        if !vcpu.compare_and_swap_run_state(RunState::Started, RunState::StartedHalted) {
            return HaltExit::EscalateToHost(EscalateReason::StateChanged);
        }
        // Pairs with the fence in `Vm::wake_up`: either the waker sees
        // `StartedHalted` or we see its flags.
        fence(Ordering::SeqCst);
        if needs_host(vm, vcpu) {
            vcpu.compare_and_swap_run_state(RunState::StartedHalted, RunState::Started);
            return HaltExit::EscalateToHost(EscalateReason::PendingForceFlags);
        }
        if wake_pending(vcpu, arch) {
            vcpu.compare_and_swap_run_state(RunState::StartedHalted, RunState::Started);
            return deliver(vcpu, arch, mwait, interruptibility);
        }

        let start = H::now_ns();
        let expire = deadline
            .unwrap_or(u64::MAX)
            .min(start.saturating_add(self.config.max_block_ns));
        let outcome = vcpu.halt_event().wait(Some(expire.saturating_sub(start)));
        let end = H::now_ns();
        vcpu.compare_and_swap_run_state(RunState::StartedHalted, RunState::Started);

        match outcome {
            WaitOutcome::Signaled | WaitOutcome::TimedOut | WaitOutcome::Interrupted => {
                self.counters.count_block(expire, end);
                if needs_host(vm, vcpu) {
                    return HaltExit::EscalateToHost(EscalateReason::PendingForceFlags);
                }
                if wake_pending(vcpu, arch) {
                    self.counters.resumed_from_block += 1;
                    return deliver(vcpu, arch, mwait, interruptibility);
                }
                HaltExit::EscalateToHost(EscalateReason::NoInterruptAfterBlock)
            }
            WaitOutcome::Destroyed => {
                warn!("vcpu {}: halt event destroyed while blocked", vcpu.id());
                HaltExit::EscalateToHost(EscalateReason::BlockFailed)
            }
        }
    }
}

/// Whether a VM-wide or per-vcpu flag requires the host scheduler.
fn needs_host<H: VmmHal>(vm: &Vm<H>, vcpu: &VCpu<H>) -> bool {
    vm.flags().is_any_set(VmFlags::TO_HOST_MASK) || vcpu.flags().is_any_set(CpuFlags::TO_HOST_MASK)
}

/// Whether a wake-up flag is raised, recomputing stale APIC state first.
fn wake_pending<H: VmmHal, A: ArchVCpuOps>(vcpu: &VCpu<H>, arch: &mut A) -> bool {
    if vcpu.test_and_clear_flags(CpuFlags::UPDATE_APIC) {
        arch.update_pending_interrupts();
    }
    vcpu.flags().is_any_set(CpuFlags::WAKE_MASK)
}

/// Decide how to leave the halt once a wake-up flag has been seen.
fn deliver<H: VmmHal, A: ArchVCpuOps>(
    vcpu: &VCpu<H>,
    arch: &mut A,
    mwait: MonitorWait,
    interruptibility: Interruptibility,
) -> HaltExit {
    let flags = vcpu.flags().get();
    if flags.intersects(CpuFlags::INTERRUPT_APIC | CpuFlags::INTERRUPT_PIC)
        && !flags.intersects(CpuFlags::INTERRUPT_SMI | CpuFlags::INTERRUPT_NMI)
    {
        if interruptibility == Interruptibility::Unrestrained {
            if let Some(vector) = arch.fetch_interrupt() {
                vcpu.test_and_clear_flags(CpuFlags::UNHALT);
                arch.assert_trap(vector);
                return HaltExit::Resume {
                    injected: Some(vector),
                };
            }
        }
    } else if flags.contains(CpuFlags::INTERRUPT_SMI) {
        return HaltExit::EscalateToHost(EscalateReason::InterruptNotDeliverable);
    } else if flags.contains(CpuFlags::INTERRUPT_NMI) {
        if interruptibility < Interruptibility::NmiInhibit {
            return HaltExit::EscalateToHost(EscalateReason::InterruptNotDeliverable);
        }
    } else if flags.contains(CpuFlags::INTERRUPT_NESTED_GUEST)
        && interruptibility < Interruptibility::VirtIntDisabled
    {
        return HaltExit::EscalateToHost(EscalateReason::InterruptNotDeliverable);
    }

    if vcpu.test_and_clear_flags(CpuFlags::UNHALT) || mwait == MonitorWait::BreakOnInterrupt {
        return HaltExit::Resume { injected: None };
    }
    HaltExit::EscalateToHost(EscalateReason::InterruptNotDeliverable)
}
