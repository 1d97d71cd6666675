use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use axerrno::{ax_err, AxResult};

use crate::flags::{CpuFlags, ForceFlags};
use crate::hal::{VmmHal, WaitEvent};

/// The run state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// The vcpu thread is not running guest code and does not take part in
    /// VM-wide operations.
    Stopped = 0,
    /// The vcpu is started and currently outside guest execution.
    Started = 1,
    /// The vcpu is started and blocked in the halt scheduler.
    StartedHalted = 2,
    /// The vcpu is started and executing guest code.
    StartedExecuting = 3,
}

impl RunState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Started,
            2 => Self::StartedHalted,
            3 => Self::StartedExecuting,
            _ => Self::Stopped,
        }
    }

    /// Whether the vcpu has been started (in any of the started sub-states).
    pub const fn is_started(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// A [`RunState`] that can be compared-and-swapped.
struct AtomicRunState(AtomicU8);

impl AtomicRunState {
    const fn new(state: RunState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> RunState {
        RunState::from_raw(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: RunState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn compare_exchange(&self, from: RunState, to: RunState) -> Result<(), RunState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RunState::from_raw)
    }
}

/// A virtual CPU as seen by the coordination core: one participant of the VM's
/// rendezvous and the owner of its own halt state.
///
/// Everything in here is either immutable or atomic, so `&VCpu` can be shared
/// with every other thread of the VM. Fields documented as owner-only are
/// written by the vcpu's own thread exclusively.
pub struct VCpu<H: VmmHal> {
    /// The id of the vcpu, `0..vcpu_count`, stable for the VM's lifetime.
    id: usize,
    /// The run state.
    state: AtomicRunState,
    /// Per-vcpu force-action flags.
    flags: ForceFlags<CpuFlags>,
    /// Whether the vcpu is currently inside a rendezvous. Owner-only.
    in_rendezvous: AtomicBool,
    /// Wait handle used for ordered (ascending/descending) rendezvous wake-ups.
    ordered_event: H::Event,
    /// Wait handle the vcpu blocks on while halted.
    halt_event: H::Event,
}

impl<H: VmmHal> VCpu<H> {
    /// Create a new, stopped [`VCpu`].
    pub fn new(id: usize) -> AxResult<Self> {
        Ok(Self {
            id,
            state: AtomicRunState::new(RunState::Stopped),
            flags: ForceFlags::new(),
            in_rendezvous: AtomicBool::new(false),
            ordered_event: H::new_event()?,
            halt_event: H::new_event()?,
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// Get the run state of the vcpu.
    pub fn run_state(&self) -> RunState {
        self.state.load()
    }

    /// Atomically move the run state from `from` to `to`.
    ///
    /// Returns `false` (and leaves the state alone) if the current state is not `from`.
    pub fn compare_and_swap_run_state(&self, from: RunState, to: RunState) -> bool {
        self.state.compare_exchange(from, to).is_ok()
    }

    /// Transition the run state. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: RunState, to: RunState) -> AxResult {
        match self.state.compare_exchange(from, to) {
            Ok(()) => Ok(()),
            Err(actual) => ax_err!(
                BadState,
                alloc::format!(
                    "vcpu {} run state is not {:?}, but {:?}",
                    self.id,
                    from,
                    actual
                )
            ),
        }
    }

    /// Execute a block of guest code with the run state transitioned from
    /// [`RunState::Started`] to [`RunState::StartedExecuting`], restoring
    /// [`RunState::Started`] afterwards.
    ///
    /// If the vcpu was stopped while `f` ran, it stays [`RunState::Stopped`].
    pub fn execute<F, T>(&self, f: F) -> AxResult<T>
    where
        F: FnOnce() -> T,
    {
        self.transition_state(RunState::Started, RunState::StartedExecuting)?;
        let result = f();
        let _ = self
            .state
            .compare_exchange(RunState::StartedExecuting, RunState::Started);
        Ok(result)
    }

    /// The per-vcpu force-action flags.
    pub fn flags(&self) -> &ForceFlags<CpuFlags> {
        &self.flags
    }

    /// Raise per-vcpu force-action flags.
    pub fn set_flags(&self, flags: CpuFlags) {
        self.flags.set(flags);
    }

    /// Clear `flags`, returning whether any of them was raised.
    pub fn test_and_clear_flags(&self, flags: CpuFlags) -> bool {
        self.flags.test_and_clear(flags)
    }

    /// Whether the vcpu is currently inside a rendezvous.
    pub fn in_rendezvous(&self) -> bool {
        self.in_rendezvous.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_rendezvous(&self, value: bool) {
        self.in_rendezvous.store(value, Ordering::Release);
    }

    pub(crate) fn ordered_event(&self) -> &H::Event {
        &self.ordered_event
    }

    pub(crate) fn halt_event(&self) -> &H::Event {
        &self.halt_event
    }

    /// Reset the per-vcpu state before the vcpu thread starts using it.
    pub(crate) fn init(&self) -> AxResult {
        if self.run_state() != RunState::Stopped {
            return ax_err!(BadState, "cannot re-initialize a started vcpu");
        }
        self.flags.clear(CpuFlags::all());
        self.in_rendezvous.store(false, Ordering::Release);
        self.ordered_event.reset();
        self.halt_event.reset();
        Ok(())
    }

    /// Force the vcpu to [`RunState::Stopped`], returning the previous state.
    pub(crate) fn force_stop(&self) -> RunState {
        RunState::from_raw(self.state.0.swap(RunState::Stopped as u8, Ordering::AcqRel))
    }
}

impl<H: VmmHal> core::fmt::Debug for VCpu<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VCpu")
            .field("id", &self.id)
            .field("state", &self.run_state())
            .field("flags", &self.flags)
            .field("in_rendezvous", &self.in_rendezvous())
            .finish()
    }
}
