//! Request guards for deferred lookups.
//!
//! A deferred remote lookup may complete after the request that started it
//! has been finalized. The request owns a [`RequestGuard`]; the detached task
//! carries a [`GuardToken`]. Cancelling or dropping the guard makes every
//! outstanding token stale, and stale completions are discarded without
//! touching the request or the local tier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
pub struct RequestGuard {
    generation: Arc<AtomicU64>,
}

impl RequestGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token valid until the next [`cancel`](Self::cancel) or until the guard is dropped.
    pub fn token(&self) -> GuardToken {
        GuardToken {
            issued: self.generation.load(Ordering::Acquire),
            current: Arc::downgrade(&self.generation),
        }
    }

    /// Invalidate every token issued so far.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct GuardToken {
    issued: u64,
    current: Weak<AtomicU64>,
}

impl GuardToken {
    pub fn is_live(&self) -> bool {
        self.current
            .upgrade()
            .is_some_and(|generation| generation.load(Ordering::Acquire) == self.issued)
    }
}
