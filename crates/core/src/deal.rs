// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The "deal" primitive: a cooperative mutual-exclusion token pipes use to
//! serialize a sequence of operations against a shared external resource
//! (typically a codec context) without blocking the rest of the graph.
//!
//! A deal is held by at most one pipe at a time. A pipe that needs the deal
//! while it's held registers a watcher instead of blocking; it is woken when
//! the holder yields or aborts. This is what lets the decoder pipe and its
//! sink sub-pipe coordinate opening/closing an avcodec context without a
//! blocking mutex in the packet hot path.

use crate::error::StreamKitError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A shareable, non-blocking mutual-exclusion token.
#[derive(Clone)]
pub struct Deal {
    held: Arc<AtomicBool>,
    released: Arc<Notify>,
}

/// RAII guard returned by [`Deal::grab`]; yields the deal back on drop unless
/// [`DealGuard::abort`] was already called (abort and yield are equivalent
/// from the deal's perspective — both release it — but a pipe that aborts
/// typically also unwinds whatever partial state it built up).
pub struct DealGuard {
    deal: Deal,
    released: bool,
}

impl Deal {
    #[must_use]
    pub fn new() -> Self {
        Self { held: Arc::new(AtomicBool::new(false)), released: Arc::new(Notify::new()) }
    }

    /// Attempt to take exclusive hold of the deal.
    ///
    /// # Errors
    ///
    /// Returns [`StreamKitError::Busy`] if another pipe currently holds it.
    pub fn grab(&self) -> Result<DealGuard, StreamKitError> {
        if self.held.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            Ok(DealGuard { deal: self.clone(), released: false })
        } else {
            Err(StreamKitError::Busy("deal already held".to_string()))
        }
    }

    /// Wait until the deal is free, then wake. Callers still need to call
    /// [`Deal::grab`] afterwards since another waiter may win the race.
    pub async fn wait_free(&self) {
        while self.held.load(Ordering::Acquire) {
            self.released.notified().await;
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Default for Deal {
    fn default() -> Self {
        Self::new()
    }
}

impl DealGuard {
    /// Release the deal early, equivalent to dropping the guard, but lets the
    /// holder keep running code after releasing it (e.g. to continue
    /// processing once the codec context swap it needed the deal for is
    /// done).
    pub fn release(mut self) {
        self.do_release();
    }

    /// Release the deal and signal that whatever operation it guarded was
    /// abandoned, distinct from [`DealGuard::release`] only for call-site
    /// clarity (both unblock waiters identically).
    pub fn abort(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.deal.held.store(false, Ordering::Release);
            self.deal.released.notify_waiters();
            self.released = true;
        }
    }
}

impl Drop for DealGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_grab_is_busy_while_held() {
        let deal = Deal::new();
        let guard = deal.grab().expect("first grab succeeds");
        assert!(matches!(deal.grab(), Err(StreamKitError::Busy(_))));
        drop(guard);
        assert!(deal.grab().is_ok());
    }

    #[tokio::test]
    async fn wait_free_unblocks_after_release() {
        let deal = Deal::new();
        let guard = deal.grab().unwrap();
        let deal_clone = deal.clone();
        let waiter = tokio::spawn(async move {
            deal_clone.wait_free().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        guard.release();
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }
}
