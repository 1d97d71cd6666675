/// How far the guest currently allows interrupt delivery, from least to most
/// restrictive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interruptibility {
    /// Interrupts can be delivered right away.
    Unrestrained,
    /// Virtual interrupts of a nested guest are disabled.
    VirtIntDisabled,
    /// Maskable interrupts are disabled (IF=0).
    IntDisabled,
    /// Interrupts are inhibited for one instruction (STI/MOV SS shadow).
    IntInhibited,
    /// NMIs are blocked as well.
    NmiInhibit,
    /// Everything is blocked (GIF=0).
    GlobalInhibit,
}

/// The state of the guest's MONITOR/MWAIT at the time of the halt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorWait {
    /// The halt is a plain HLT.
    Inactive,
    /// MWAIT is active.
    Active,
    /// MWAIT is active and breaks on interrupts even when they are masked.
    BreakOnInterrupt,
}

/// Architecture-specific vCPU operations consumed by the halt scheduler.
///
/// This trait is the seam between the coordination core and the emulated
/// interrupt controller, trap manager and timers of one vCPU. All methods are
/// called on the vCPU's own thread.
pub trait ArchVCpuOps {
    /// Whether a hardware fault or interrupt is already queued for injection.
    fn has_pending_trap(&self) -> bool;

    /// The current guest interruptibility.
    fn interruptibility(&self) -> Interruptibility;

    /// The current MONITOR/MWAIT state.
    fn monitor_wait(&self) -> MonitorWait;

    /// Recompute the pending interrupt flags of the local interrupt controller.
    ///
    /// Called after [`CpuFlags::UPDATE_APIC`](crate::CpuFlags::UPDATE_APIC)
    /// has been test-and-cleared; implementations update the
    /// `INTERRUPT_APIC` flag of the vCPU accordingly.
    fn update_pending_interrupts(&mut self);

    /// The absolute time of the next timer deadline, in the
    /// [`VmmHal::now_ns`](crate::VmmHal::now_ns) timebase, or `None` when no
    /// timer is armed.
    fn next_timer_deadline(&mut self) -> Option<u64>;

    /// Fetch the highest-priority pending external interrupt vector, acknowledging it.
    fn fetch_interrupt(&mut self) -> Option<u8>;

    /// Queue `vector` as a hardware interrupt to be injected on the next guest entry.
    fn assert_trap(&mut self, vector: u8);
}
