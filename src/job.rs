//! Job control
//!
//! Wall-clock budget and cooperative cancellation. Both are checked at the
//! same points: the top of every optimizer step and the start of every
//! non-rigid iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{FaceForgeError, Result};

/// Cooperative, terminal cancellation flag shared with the job owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out when cancelled; partial results are discarded by the caller.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FaceForgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Wall-clock budget for a job. Timeout is recovered locally (best-so-far
/// result), so expiry is a flag rather than an error.
#[derive(Debug, Clone, Copy)]
pub struct JobBudget {
    started: Instant,
    max_seconds: f64,
}

impl JobBudget {
    pub fn new(max_seconds: f64) -> Self {
        Self {
            started: Instant::now(),
            max_seconds,
        }
    }

    pub fn expired(&self) -> bool {
        self.elapsed_seconds() >= self.max_seconds
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(FaceForgeError::Cancelled)));
    }

    #[test]
    fn zero_budget_expires_immediately() {
        let budget = JobBudget::new(0.0);
        assert!(budget.expired());
    }
}
