// ============================================
// RTA Builder - cancel.rs
// ============================================
// The per-job stop flag.
//
// One flag is created for each build and cloned into every strategy. It is
// cooperative: strategies poll it between units of work (one file, one line
// of tool output) and wind down on their own. Once set it stays set.
// ============================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BuildError, Result};

/// Shared, set-once cancellation flag
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    inner: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the build to stop. Calling this more than once is harmless.
    pub fn request_stop(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Early-return helper for use with `?` between units of work
    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(BuildError::CancelledByUser)
        } else {
            Ok(())
        }
    }
}
