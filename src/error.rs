use axerrno::AxError;

use crate::StrictStatus;

/// Errors of the coordination core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    /// Rendezvous recursion too deep, or attempted under a policy that does not
    /// support it. Never retried.
    #[error("rendezvous deadlock (recursion depth {depth})")]
    Deadlock {
        /// The nesting depth at which the recursion was attempted.
        depth: usize,
    },
    /// The caller combined incompatible options.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),
    /// A blocking wait kept timing out.
    #[error("wait timed out")]
    Timeout,
    /// A blocking wait kept being interrupted.
    #[error("wait interrupted")]
    Interrupted,
    /// The aggregated result of the rendezvous callbacks is a failure.
    #[error("rendezvous callback failed with {0}")]
    Callback(StrictStatus),
    /// The wait primitive was destroyed underneath us; the VM is going away.
    #[error("wait handle destroyed")]
    Destroyed,
    /// The host failed to provide a resource.
    #[error("host error: {0:?}")]
    Host(AxError),
}

impl From<AxError> for VmmError {
    fn from(err: AxError) -> Self {
        Self::Host(err)
    }
}

impl VmmError {
    /// Whether the lifecycle controller is expected to dump diagnostics and tear
    /// the VM down after seeing this error.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Deadlock { .. } | Self::Destroyed)
    }
}

/// Result type of the coordination core.
pub type VmmResult<T = ()> = Result<T, VmmError>;
