/// The result of [`HaltScheduler::halt`](crate::HaltScheduler::halt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltExit {
    /// Continue executing guest code.
    Resume {
        /// The interrupt vector that was queued for injection, if any.
        injected: Option<u8>,
    },
    /// Return to the host process and let its scheduler deal with the vcpu.
    EscalateToHost(EscalateReason),
}

impl HaltExit {
    /// Whether guest execution resumes.
    pub const fn is_resume(&self) -> bool {
        matches!(self, Self::Resume { .. })
    }
}

/// Why a halt was handed to the host scheduler.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalateReason {
    /// Halting in the privileged context is disabled, a trap is pending, or
    /// the guest's interruptibility forbids immediate delivery.
    NotAllowed,
    /// A force-action flag that needs the host is raised.
    PendingForceFlags,
    /// The next timer deadline is too close to be worth blocking for.
    SmallDelta,
    /// The run state changed underneath us, so the vcpu could not be marked halted.
    StateChanged,
    /// The gateway's block primitive failed.
    BlockFailed,
    /// Woken up, but without anything to deliver.
    NoInterruptAfterBlock,
    /// A wake-up flag is set but the event cannot be delivered here (SMI,
    /// blocked NMI, nested-guest interrupt, no vector available).
    InterruptNotDeliverable,
}
