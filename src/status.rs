use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

/// A strict status code as returned by rendezvous callbacks.
///
/// - `0` is success.
/// - Positive values are informational scheduling hints. A lower value is more
///   urgent than a higher one.
/// - Negative values are failures.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrictStatus(i32);

impl StrictStatus {
    /// Plain success.
    pub const SUCCESS: Self = Self(0);

    /// Create a status from its raw value.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Create an informational status. `0` is promoted to `1`.
    pub const fn info(code: u16) -> Self {
        if code == 0 {
            Self(1)
        } else {
            Self(code as i32)
        }
    }

    /// Create a failure status. `0` is promoted to `-1`.
    pub const fn failure(code: u16) -> Self {
        if code == 0 {
            Self(-1)
        } else {
            Self(-(code as i32))
        }
    }

    /// The raw value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether this is exactly [`StrictStatus::SUCCESS`].
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Whether this is an informational (positive) status.
    pub const fn is_informational(self) -> bool {
        self.0 > 0
    }

    /// Whether this is a failure.
    pub const fn is_failure(self) -> bool {
        self.0 < 0
    }

    /// Whether `other` should replace `self` when both are merged into one result.
    const fn is_superseded_by(self, other: Self) -> bool {
        if other.0 == 0 || other.0 == self.0 || self.is_failure() {
            return false;
        }
        // A failure beats anything that is not a failure; among informational
        // codes the lower one is more urgent.
        self.0 == 0 || other.0 < self.0
    }

    /// Merge `other` into `self` and return the result.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        if self.is_superseded_by(other) {
            other
        } else {
            self
        }
    }
}

impl Default for StrictStatus {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl fmt::Debug for StrictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            f.write_str("SUCCESS")
        } else if self.is_failure() {
            write!(f, "FAILURE({})", self.0)
        } else {
            write!(f, "INFO({})", self.0)
        }
    }
}

impl fmt::Display for StrictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A [`StrictStatus`] shared between participants, merged lock-free.
pub(crate) struct AtomicStatus(AtomicI32);

impl AtomicStatus {
    pub const fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    pub fn load(&self) -> StrictStatus {
        StrictStatus(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: StrictStatus) {
        self.0.store(status.0, Ordering::Release);
    }

    /// Merge `status` in, following the same rule as [`StrictStatus::merge`].
    pub fn merge(&self, status: StrictStatus) {
        let mut current = self.0.load(Ordering::Acquire);
        while StrictStatus(current).is_superseded_by(status) {
            match self.0.compare_exchange_weak(
                current,
                status.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_success_is_neutral() {
        let info = StrictStatus::info(7);
        assert_eq!(StrictStatus::SUCCESS.merge(info), info);
        assert_eq!(info.merge(StrictStatus::SUCCESS), info);
    }

    #[test]
    fn test_merge_first_failure_wins() {
        let first = StrictStatus::failure(3);
        let second = StrictStatus::failure(9);
        assert_eq!(first.merge(second), first);
        assert_eq!(second.merge(first), second);
    }

    #[test]
    fn test_merge_failure_beats_informational() {
        let info = StrictStatus::info(2);
        let fail = StrictStatus::failure(40);
        assert_eq!(info.merge(fail), fail);
        assert_eq!(fail.merge(info), fail);
    }

    #[test]
    fn test_merge_more_urgent_info_wins() {
        assert_eq!(
            StrictStatus::info(5).merge(StrictStatus::info(3)),
            StrictStatus::info(3)
        );
        assert_eq!(
            StrictStatus::info(3).merge(StrictStatus::info(5)),
            StrictStatus::info(3)
        );
    }

    #[test]
    fn test_atomic_merge_matches_plain_merge() {
        let codes = [
            StrictStatus::info(4),
            StrictStatus::SUCCESS,
            StrictStatus::info(2),
            StrictStatus::failure(6),
            StrictStatus::failure(1),
            StrictStatus::info(1),
        ];
        let shared = AtomicStatus::new();
        let mut plain = StrictStatus::SUCCESS;
        for code in codes {
            shared.merge(code);
            plain = plain.merge(code);
        }
        assert_eq!(shared.load(), plain);
        assert_eq!(plain, StrictStatus::failure(6));
    }

    #[test]
    fn test_constructors() {
        assert!(StrictStatus::info(0).is_informational());
        assert!(StrictStatus::failure(0).is_failure());
        assert_eq!(StrictStatus::from_raw(-12).raw(), -12);
        assert!(StrictStatus::default().is_success());
    }
}
