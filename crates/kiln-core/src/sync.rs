//! # Synchronization Primitives
//!
//! Host-side view of the device completion counter.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::types::Seqno;

// =============================================================================
// SEQNO FENCE
// =============================================================================

/// Completion counter the device advances as it retires requests
///
/// The counter lives in memory the device writes (a hardware status page on
/// real hardware). The host hands out sequence numbers with
/// [`advance`](Self::advance) and waits for them to pass.
#[derive(Debug)]
pub struct SeqnoFence {
    /// Last value written by the device
    completed: AtomicU32,
    /// Next value to hand out
    next: AtomicU32,
    /// Maximum spins per wait, `None` waits forever
    spin_limit: Option<u64>,
}

impl SeqnoFence {
    /// Create a fence that waits without a bound
    pub const fn new() -> Self {
        Self {
            completed: AtomicU32::new(0),
            next: AtomicU32::new(1),
            spin_limit: None,
        }
    }

    /// Create a fence whose waits give up after `spins` polls
    pub const fn with_spin_limit(spins: u64) -> Self {
        Self {
            completed: AtomicU32::new(0),
            next: AtomicU32::new(1),
            spin_limit: Some(spins),
        }
    }

    /// Allocate the next sequence number
    pub fn advance(&self) -> Seqno {
        Seqno::new(self.next.fetch_add(1, Ordering::AcqRel))
    }

    /// Last retired sequence number
    pub fn completed(&self) -> Seqno {
        Seqno::new(self.completed.load(Ordering::Acquire))
    }

    /// Record retirement of everything up to `seqno` (device side)
    pub fn signal(&self, seqno: Seqno) {
        self.completed.store(seqno.raw(), Ordering::Release);
    }

    /// Check whether `seqno` has retired
    pub fn is_signaled(&self, seqno: Seqno) -> bool {
        self.completed().passed(seqno)
    }

    /// Spin until `seqno` has retired
    pub fn wait(&self, seqno: Seqno) -> Result<()> {
        let mut spins: u64 = 0;
        while !self.is_signaled(seqno) {
            if let Some(limit) = self.spin_limit {
                if spins >= limit {
                    log::warn!(
                        "seqno {} not retired after {} spins (completed {})",
                        seqno,
                        spins,
                        self.completed()
                    );
                    return Err(Error::WaitTimeout);
                }
            }
            spins += 1;
            core::hint::spin_loop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_signal() {
        let fence = SeqnoFence::new();
        let a = fence.advance();
        let b = fence.advance();
        assert_eq!(a.raw(), 1);
        assert_eq!(b.raw(), 2);
        assert!(!fence.is_signaled(a));

        fence.signal(b);
        assert!(fence.is_signaled(a));
        assert!(fence.is_signaled(b));
        assert_eq!(fence.wait(a), Ok(()));
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let fence = SeqnoFence::with_spin_limit(16);
        let seqno = fence.advance();
        assert_eq!(fence.wait(seqno), Err(Error::WaitTimeout));
    }
}
