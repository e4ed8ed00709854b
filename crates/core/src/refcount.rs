// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Reference-counted values with a dead-callback, for parity with buffer
//! managers that need to run cleanup exactly once when the last reference to
//! a resource drops (pool return, codec plane release, sub-pipe teardown).
//!
//! `Arc` already gives us atomic strong counting; this module adds the
//! "invoke a callback on last release" half that `Arc::drop` alone doesn't
//! expose.

use std::fmt;
use std::sync::Arc;

/// A value paired with a callback invoked exactly once, when the last
/// [`RefCounted`] clone referencing it is dropped.
struct Inner<T> {
    value: T,
    dead_cb: Option<Box<dyn FnOnce(&T) + Send + Sync>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(cb) = self.dead_cb.take() {
            cb(&self.value);
        }
    }
}

/// Strong-reference-counted wrapper around `T` with an optional dead callback.
///
/// Cloning increments the count (`Arc::clone`); dropping the last clone runs
/// the callback before `T` itself is dropped. [`RefCounted::single`] reports
/// whether the current handle is the sole owner, used to decide whether a
/// buffer may be mutated in place.
pub struct RefCounted<T>(Arc<Inner<T>>);

impl<T> RefCounted<T> {
    /// Wrap a value with no dead callback.
    pub fn new(value: T) -> Self {
        Self(Arc::new(Inner { value, dead_cb: None }))
    }

    /// Wrap a value with a callback run once, on the drop of the last clone.
    pub fn with_dead_callback(value: T, dead_cb: impl FnOnce(&T) + Send + Sync + 'static) -> Self {
        Self(Arc::new(Inner { value, dead_cb: Some(Box::new(dead_cb)) }))
    }

    /// Returns true iff this is the only live reference.
    #[must_use]
    pub fn single(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }

    /// Number of live references (strong count).
    #[must_use]
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<T> Clone for RefCounted<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> std::ops::Deref for RefCounted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0.value
    }
}

impl<T: fmt::Debug> fmt::Debug for RefCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounted")
            .field("value", &self.0.value)
            .field("use_count", &self.use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn single_true_until_cloned() {
        let rc = RefCounted::new(42);
        assert!(rc.single());
        let rc2 = rc.clone();
        assert!(!rc.single());
        assert!(!rc2.single());
        drop(rc2);
        assert!(rc.single());
    }

    #[test]
    fn dead_callback_runs_once_on_last_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = Arc::clone(&fired);
        let rc = RefCounted::with_dead_callback(7, move |_| {
            fired_cb.store(true, Ordering::SeqCst);
        });
        let rc2 = rc.clone();
        drop(rc);
        assert!(!fired.load(Ordering::SeqCst), "callback must not fire while a ref remains");
        drop(rc2);
        assert!(fired.load(Ordering::SeqCst), "callback must fire on last drop");
    }
}
