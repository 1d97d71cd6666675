//! Force-action flags.
//!
//! Any thread may raise a flag; only the consumer that owns a flag clears it.
//! Every operation is a single atomic access so readers always observe a
//! consistent "is there pending work" snapshot without taking a lock.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::{bitflags, Flags};

bitflags! {
    /// VM-wide force-action flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct VmFlags: u64 {
        /// A rendezvous is pending, every vCPU must enter the coordinator.
        const EMT_RENDEZVOUS = 1 << 0;
        /// A VM reset is pending.
        const RESET = 1 << 1;
        /// Requests are queued for any vCPU.
        const REQUEST = 1 << 2;
        /// The VM state must be re-checked.
        const CHECK_VM_STATE = 1 << 3;
        /// The debugger wants attention.
        const DBGF = 1 << 4;
        /// The virtual sync clock needs servicing.
        const TM_VIRTUAL_SYNC = 1 << 5;
        /// Device queues need flushing.
        const PDM_QUEUES = 1 << 6;
        /// Pending DMA work.
        const PDM_DMA = 1 << 7;
        /// The host ran out of guest memory.
        const PGM_NO_MEMORY = 1 << 8;
        /// Suspend requested by the debugger.
        const DEBUG_SUSPEND = 1 << 9;
    }
}

impl VmFlags {
    /// Flags that force a halted vCPU back to the host scheduler.
    pub const TO_HOST_MASK: Self = Self::TM_VIRTUAL_SYNC
        .union(Self::PDM_QUEUES)
        .union(Self::PDM_DMA)
        .union(Self::DBGF)
        .union(Self::REQUEST)
        .union(Self::CHECK_VM_STATE)
        .union(Self::RESET)
        .union(Self::EMT_RENDEZVOUS)
        .union(Self::PGM_NO_MEMORY)
        .union(Self::DEBUG_SUSPEND);
}

bitflags! {
    /// Per-vCPU force-action flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct CpuFlags: u64 {
        /// The local APIC has a pending interrupt.
        const INTERRUPT_APIC = 1 << 0;
        /// The PIC has a pending interrupt.
        const INTERRUPT_PIC = 1 << 1;
        /// The pending APIC interrupt state is stale and must be recomputed.
        const UPDATE_APIC = 1 << 2;
        /// Non-maskable interrupt pending.
        const INTERRUPT_NMI = 1 << 3;
        /// System-management interrupt pending.
        const INTERRUPT_SMI = 1 << 4;
        /// Virtual interrupt pending for a nested guest.
        const INTERRUPT_NESTED_GUEST = 1 << 5;
        /// Leave the halted state unconditionally.
        const UNHALT = 1 << 6;
        /// A timer expired.
        const TIMER = 1 << 7;
        /// Requests are queued for this vCPU.
        const REQUEST = 1 << 8;
        /// Return to the host process.
        const TO_HOST = 1 << 9;
        /// The debugger wants attention.
        const DBGF = 1 << 10;
        /// The instruction emulator must run.
        const IEM = 1 << 11;
        /// A device critical section must be entered.
        const PDM_CRITSECT = 1 << 12;
        /// Guest page tables must be resynchronized.
        const PGM_SYNC_CR3 = 1 << 13;
        /// Pending port/MMIO write commit.
        const IOM = 1 << 14;
    }
}

impl CpuFlags {
    /// Flags that force a halted vCPU back to the host scheduler.
    pub const TO_HOST_MASK: Self = Self::TIMER
        .union(Self::PDM_CRITSECT)
        .union(Self::IEM)
        .union(Self::REQUEST)
        .union(Self::DBGF)
        .union(Self::PGM_SYNC_CR3)
        .union(Self::TO_HOST)
        .union(Self::IOM);

    /// Flags that end a halt.
    pub const WAKE_MASK: Self = Self::INTERRUPT_APIC
        .union(Self::INTERRUPT_PIC)
        .union(Self::INTERRUPT_NESTED_GUEST)
        .union(Self::INTERRUPT_NMI)
        .union(Self::INTERRUPT_SMI)
        .union(Self::UNHALT);
}

/// An atomic set of force-action flags of type `F`.
pub struct ForceFlags<F> {
    bits: AtomicU64,
    _marker: PhantomData<F>,
}

impl<F: Flags<Bits = u64> + Copy> ForceFlags<F> {
    /// An empty set.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Snapshot of the current flags.
    pub fn get(&self) -> F {
        F::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    /// Raise `flags`.
    pub fn set(&self, flags: F) {
        self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flags`.
    pub fn clear(&self, flags: F) {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether all of `flags` are raised.
    pub fn is_set(&self, flags: F) -> bool {
        let bits = flags.bits();
        self.bits.load(Ordering::Acquire) & bits == bits
    }

    /// Whether any of `flags` is raised.
    pub fn is_any_set(&self, flags: F) -> bool {
        self.bits.load(Ordering::Acquire) & flags.bits() != 0
    }

    /// Atomically clear `flags`, returning whether any of them was raised.
    pub fn test_and_clear(&self, flags: F) -> bool {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }
}

impl<F: Flags<Bits = u64> + Copy> Default for ForceFlags<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Flags<Bits = u64> + Copy + core::fmt::Debug> core::fmt::Debug for ForceFlags<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.get(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_test_and_clear() {
        let flags = ForceFlags::<CpuFlags>::new();
        flags.set(CpuFlags::TIMER | CpuFlags::UNHALT);
        assert!(flags.is_set(CpuFlags::TIMER));
        assert!(flags.is_any_set(CpuFlags::TO_HOST_MASK));

        assert!(flags.test_and_clear(CpuFlags::UNHALT));
        assert!(!flags.test_and_clear(CpuFlags::UNHALT));
        assert_eq!(flags.get(), CpuFlags::TIMER);
    }

    #[test]
    fn test_clear_leaves_other_bits() {
        let flags = ForceFlags::<VmFlags>::new();
        flags.set(VmFlags::EMT_RENDEZVOUS | VmFlags::RESET);
        flags.clear(VmFlags::EMT_RENDEZVOUS);
        assert!(!flags.is_any_set(VmFlags::EMT_RENDEZVOUS));
        assert!(flags.is_set(VmFlags::RESET));
        assert!(!flags.is_set(VmFlags::RESET | VmFlags::REQUEST));
    }

    #[test]
    fn test_wake_and_host_masks_are_disjoint() {
        assert!(CpuFlags::WAKE_MASK
            .intersection(CpuFlags::TO_HOST_MASK)
            .is_empty());
        assert!(!CpuFlags::WAKE_MASK.contains(CpuFlags::UPDATE_APIC));
    }
}
