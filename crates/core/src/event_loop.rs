// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The event loop abstraction pipes use to register timers and wait for
//! external readiness (the upump-manager equivalent), implemented directly
//! on top of the tokio reactor rather than a bespoke fd/timer multiplexer.
//!
//! Every pipe that needs a one-shot or repeating timer (NAK/ACK scheduling in
//! the SRT nodes, retry backoff in the HTTP source, the audio crossblend's
//! periodic re-evaluation) goes through this trait instead of calling
//! `tokio::time` directly, so a single cancellation token can tear down every
//! outstanding timer for a pipe at once.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A handle to a scheduled, cancellable unit of work (a upump equivalent).
pub struct WatcherHandle {
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    /// Cancel the watcher. Idempotent; dropping the handle without calling
    /// this leaves the watcher running to completion (matches the source's
    /// "stop" being separate from "free").
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Per-pipe event loop: owns a cancellation token and spawns timers/watchers
/// that are automatically torn down when the pipe is released.
#[derive(Clone)]
pub struct EventLoop {
    shutdown: CancellationToken,
}

impl EventLoop {
    #[must_use]
    pub fn new() -> Self {
        Self { shutdown: CancellationToken::new() }
    }

    /// A child event loop whose watchers are also cancelled when the parent
    /// is, but which can be torn down independently (mirrors a sub-pipe
    /// inheriting its super-pipe's upump manager).
    #[must_use]
    pub fn child(&self) -> Self {
        Self { shutdown: self.shutdown.child_token() }
    }

    /// Registers a one-shot timer that calls `callback` after `after` elapses,
    /// unless cancelled or the event loop is shut down first.
    pub fn watch_timer_once<F>(&self, after: Duration, callback: F) -> WatcherHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {},
                () = tokio::time::sleep(after) => callback(),
            }
        });
        WatcherHandle { task }
    }

    /// Registers a repeating timer firing every `period`, calling `callback`
    /// on each tick until cancelled or the event loop shuts down.
    pub fn watch_timer_repeating<F>(&self, period: Duration, mut callback: F) -> WatcherHandle
    where
        F: FnMut() + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => callback(),
                }
            }
        });
        WatcherHandle { task }
    }

    /// Signals shutdown to every watcher spawned from this event loop or any
    /// of its children.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The raw cancellation token, for pipes that need to `select!` against
    /// shutdown alongside their own channels rather than spawning a watcher.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Watches an external async signal (e.g. a peer socket closing) and invokes
/// a callback exactly once, the SIGNAL-probe equivalent described in the
/// external-interfaces section for pipe-to-pipe notifications that aren't
/// plain data packets.
pub struct SignalWatcher {
    notify: Arc<tokio::sync::Notify>,
}

impl SignalWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self { notify: Arc::new(tokio::sync::Notify::new()) }
    }

    #[must_use]
    pub fn sender(&self) -> Arc<tokio::sync::Notify> {
        Arc::clone(&self.notify)
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for SignalWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn one_shot_timer_fires_callback() {
        let event_loop = EventLoop::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        event_loop.watch_timer_once(Duration::from_millis(5), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_prevents_pending_timer() {
        let event_loop = EventLoop::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        event_loop.watch_timer_once(Duration::from_millis(50), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        event_loop.shutdown();
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn child_event_loop_shuts_down_with_parent() {
        let parent = EventLoop::new();
        let child = parent.child();
        parent.shutdown();
        assert!(child.is_shutdown());
    }
}
