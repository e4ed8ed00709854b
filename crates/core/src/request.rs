// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Asynchronous provisioning requests and the proxy chain that forwards
//! them between pipes.
//!
//! A [`Request`] is an ask for a capability (clock, uref/ubuf manager,
//! flow-format, event-loop manager) that a pipe doesn't hold itself.
//! Rather than literally walking a parent-pipe pointer chain (this graph
//! is flatter than that), asks are resolved against a shared
//! [`RequestChain`]: a per-pipeline table of providers, consulted
//! nearest-registered-first. A transform pipe that wants to serve a
//! capability to its own dependents without becoming the canonical source
//! wraps its ask in a [`RequestProxy`], which caches the resolved value and
//! installs itself as a provider so later asks don't re-walk past it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The capability kinds a pipe can ask an ancestor to provide. Only
/// [`RequestKind::Clock`] currently has a real provider in this codebase;
/// the rest exist so the request surface matches what the pipe runtime's
/// control commands (`ATTACH_UPUMP_MGR`, `ATTACH_UCLOCK`, ...) can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    UrefManager,
    UbufManager,
    Clock,
    FlowFormat,
    EventLoopMgr,
}

/// A single pending ask, paired with the oneshot half the asker keeps to
/// await the answer. Constructed via [`Request::new`]; the chain calls
/// [`Request::provide`] (or drops it, leaving the asker's receiver to
/// observe a closed channel — the "unhandled" case).
pub struct Request<T> {
    pub kind: RequestKind,
    reply: Option<tokio::sync::oneshot::Sender<T>>,
}

impl<T> Request<T> {
    #[must_use]
    pub fn new(kind: RequestKind) -> (Self, tokio::sync::oneshot::Receiver<T>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (Self { kind, reply: Some(tx) }, rx)
    }

    /// Answers the request. Returns `Err(value)` if the asker already gave
    /// up waiting (receiver dropped).
    pub fn provide(mut self, value: T) -> Result<(), T> {
        match self.reply.take() {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }
}

/// A capability provider callback: given the kind being asked for, returns
/// a value if this provider can answer it.
pub type Provider<T> = Arc<dyn Fn(RequestKind) -> Option<T> + Send + Sync>;

/// The shared, per-pipeline table of capability providers that
/// [`Request`]s are resolved against, nearest-registered-first (a provider
/// registered later shadows one registered earlier, mirroring how a
/// request walking up a literal parent chain hits the closest ancestor
/// first).
pub struct RequestChain<T> {
    providers: Mutex<Vec<(String, Provider<T>)>>,
}

impl<T> Default for RequestChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestChain<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { providers: Mutex::new(Vec::new()) }
    }

    /// Registers `node_id` as a capability provider. If `node_id` is
    /// already registered, its provider is replaced in place rather than
    /// duplicated.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a prior panic while
    /// holding the lock).
    #[allow(clippy::expect_used)]
    pub fn register_provider(&self, node_id: impl Into<String>, provider: Provider<T>) {
        let node_id = node_id.into();
        let mut providers = self.providers.lock().expect("request chain mutex poisoned");
        if let Some(slot) = providers.iter_mut().find(|(id, _)| *id == node_id) {
            slot.1 = provider;
        } else {
            providers.insert(0, (node_id, provider));
        }
    }

    /// Removes `node_id`'s provider, e.g. when the pipe that registered it
    /// is freed.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn unregister_provider(&self, node_id: &str) {
        let mut providers = self.providers.lock().expect("request chain mutex poisoned");
        providers.retain(|(id, _)| id != node_id);
    }

    /// Walks the registered providers nearest-first, returning the first
    /// one that answers `kind`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn resolve(&self, kind: RequestKind) -> Option<T> {
        let providers = self.providers.lock().expect("request chain mutex poisoned");
        providers.iter().find_map(|(_, provider)| provider(kind))
    }
}

/// A transform pipe's proxy for a capability it doesn't hold itself: it
/// resolves the ask against the chain once, caches the answer per kind,
/// and installs itself as a provider so requests registered after it
/// resolve from the cache instead of re-walking the chain. Dropping the
/// proxy unregisters it, matching the runtime's per-pipe proxy cleanup on
/// free.
pub struct RequestProxy<T> {
    chain: Arc<RequestChain<T>>,
    node_id: String,
    cached: Mutex<HashMap<RequestKind, T>>,
}

impl<T: Clone + Send + Sync + 'static> RequestProxy<T> {
    #[must_use]
    pub fn new(chain: Arc<RequestChain<T>>, node_id: impl Into<String>) -> Self {
        Self { chain, node_id: node_id.into(), cached: Mutex::new(HashMap::new()) }
    }

    /// Resolves `kind`, installing this proxy as a provider for it on
    /// first success so later asks for the same kind don't re-walk past
    /// this node.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn request(&self, kind: RequestKind) -> Option<T> {
        if let Some(cached) = self.cached.lock().expect("proxy mutex poisoned").get(&kind) {
            return Some(cached.clone());
        }
        let value = self.chain.resolve(kind)?;
        self.cached.lock().expect("proxy mutex poisoned").insert(kind, value.clone());

        let cached_value = value.clone();
        let node_id = self.node_id.clone();
        self.chain.register_provider(
            node_id,
            Arc::new(move |k| if k == kind { Some(cached_value.clone()) } else { None }),
        );
        Some(value)
    }
}

impl<T> Drop for RequestProxy<T> {
    fn drop(&mut self) {
        self.chain.unregister_provider(&self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_provide_delivers_to_receiver() {
        let (request, rx) = Request::<u32>::new(RequestKind::Clock);
        assert!(request.provide(42).is_ok());
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn request_provide_after_receiver_dropped_is_unhandled() {
        let (request, rx) = Request::<u32>::new(RequestKind::Clock);
        drop(rx);
        assert_eq!(request.provide(42), Err(42));
    }

    #[test]
    fn chain_resolves_nearest_registered_provider_first() {
        let chain: RequestChain<u32> = RequestChain::new();
        chain.register_provider("root", Arc::new(|k| (k == RequestKind::Clock).then_some(1)));
        chain.register_provider("closer", Arc::new(|k| (k == RequestKind::Clock).then_some(2)));
        assert_eq!(chain.resolve(RequestKind::Clock), Some(2));
    }

    #[test]
    fn chain_returns_none_when_unanswered() {
        let chain: RequestChain<u32> = RequestChain::new();
        assert_eq!(chain.resolve(RequestKind::Clock), None);
    }

    #[test]
    fn unregister_removes_provider() {
        let chain: RequestChain<u32> = RequestChain::new();
        chain.register_provider("only", Arc::new(|_| Some(7)));
        chain.unregister_provider("only");
        assert_eq!(chain.resolve(RequestKind::Clock), None);
    }

    #[test]
    fn proxy_caches_and_self_provides() {
        let chain = Arc::new(RequestChain::<u32>::new());
        chain.register_provider("root", Arc::new(|k| (k == RequestKind::Clock).then_some(9)));

        let proxy = RequestProxy::new(chain.clone(), "transform-1");
        assert_eq!(proxy.request(RequestKind::Clock), Some(9));

        // Re-registering root to answer differently shouldn't matter: the
        // proxy's cached value (and its own provider entry) shadow it.
        chain.register_provider("root", Arc::new(|k| (k == RequestKind::Clock).then_some(99)));
        assert_eq!(chain.resolve(RequestKind::Clock), Some(9));
    }

    #[test]
    fn proxy_unregisters_on_drop() {
        let chain = Arc::new(RequestChain::<u32>::new());
        chain.register_provider("root", Arc::new(|k| (k == RequestKind::Clock).then_some(1)));
        let proxy = RequestProxy::new(chain.clone(), "transform-1");
        proxy.request(RequestKind::Clock);
        drop(proxy);
        // "transform-1" is gone; "root" still answers directly.
        assert_eq!(chain.resolve(RequestKind::Clock), Some(1));
    }
}
