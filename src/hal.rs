use axerrno::AxResult;

use crate::{StrictStatus, VmmError, VmmResult};

/// The outcome of [`WaitEvent::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event was signaled.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// The wait was interrupted (e.g. a signal was queued for the thread).
    Interrupted,
    /// The handle was destroyed while waiting.
    Destroyed,
}

/// A wait handle provided by the privileged-call gateway.
///
/// There are two flavours, see [`VmmHal::Event`] and [`VmmHal::MultiEvent`].
pub trait WaitEvent: Send + Sync {
    /// Block until signaled, destroyed, interrupted or until `timeout_ns`
    /// nanoseconds have passed. `None` waits without a timeout.
    fn wait(&self, timeout_ns: Option<u64>) -> WaitOutcome;

    /// Signal the event.
    fn signal(&self);

    /// Drop any pending signal.
    fn reset(&self);
}

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
pub trait VmmHal: Sized + 'static {
    /// Auto-reset event. Signals are counted: each [`WaitEvent::signal`]
    /// releases exactly one [`WaitEvent::wait`], past or future.
    type Event: WaitEvent;

    /// Manual-reset event. Once signaled it releases every waiter until
    /// [`WaitEvent::reset`] is called.
    type MultiEvent: WaitEvent;

    /// Creates an auto-reset event.
    fn new_event() -> AxResult<Self::Event>;

    /// Creates a manual-reset event.
    fn new_multi_event() -> AxResult<Self::MultiEvent>;

    /// Monotonic time in nanoseconds. Timer deadlines reported by
    /// [`ArchVCpuOps`](crate::ArchVCpuOps) use the same timebase.
    fn now_ns() -> u64;

    /// Number of host CPUs currently online.
    fn online_cpu_count() -> usize;

    /// The id of the vCPU owned by the calling thread, `None` if the caller is
    /// not a vCPU thread.
    fn current_vcpu_id() -> Option<usize>;

    /// Kick the given vCPU out of guest execution so it notices new force flags.
    fn poke_vcpu(_vcpu_id: usize) {}

    /// Hint issued while busy-waiting.
    fn relax() {
        core::hint::spin_loop();
    }

    /// Hand a record to the asynchronous diagnostics pipeline.
    ///
    /// Returns `false` if the record was dropped.
    fn emit_diagnostic(_vcpu_id: Option<usize>, _level: log::Level, _bytes: &[u8]) -> bool {
        false
    }

    /// Unwind a fatal error of a privileged call back to its unprivileged
    /// caller, carrying the error.
    ///
    /// The core calls this on fatal internal errors and returns whatever it
    /// yields.
    fn resume_from(_vcpu_id: usize, error: VmmError) -> VmmResult<StrictStatus> {
        Err(error)
    }
}
