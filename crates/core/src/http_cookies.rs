// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A minimal per-manager cookie store for the HTTP source.
//!
//! Keyed on `(domain, path)`; iteration returns matches in insertion order; a
//! cookie with the same name replaces the prior one for that domain/path.
//! Domain matching is suffix-based and path matching is prefix-based, as the
//! upstream implementation does it. This store does **not** implement the
//! `Secure` or `HttpOnly` attributes — preserved intentionally, not a gap to
//! silently close, since a pluggable transport hook is the place that should
//! enforce transport security, not the cookie jar.

/// A single stored cookie.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Per-manager cookie jar, shared across HTTP source instances allocated
/// from the same manager (mirrors the "per-manager, not per-pipe" sharing
/// rule for the cookie store and proxy URL).
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    cookies: Vec<Cookie>,
}

impl CookieStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cookie, replacing any existing cookie with the same
    /// name/domain/path triple so re-insertion doesn't grow the jar.
    pub fn insert(&mut self, cookie: Cookie) {
        if let Some(existing) = self
            .cookies
            .iter_mut()
            .find(|c| c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        {
            existing.value = cookie.value;
        } else {
            self.cookies.push(cookie);
        }
    }

    /// Parse and insert a `Set-Cookie` header value against the request's
    /// origin domain/path. Attribute parsing (`Domain=`, `Path=`, `Max-Age`,
    /// `Secure`, `HttpOnly`, ...) is intentionally not implemented; only the
    /// `name=value` pair is captured, matching the upstream's unchecked
    /// cookie handling.
    pub fn set_cookie(&mut self, header_value: &str, request_domain: &str, request_path: &str) {
        let Some((name, value)) = header_value.split(';').next().and_then(|kv| kv.split_once('='))
        else {
            return;
        };
        self.insert(Cookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            domain: request_domain.to_string(),
            path: request_path.to_string(),
        });
    }

    /// Cookies matching `domain` (suffix match) and `path` (prefix match), in
    /// insertion order, suitable for building a request's `Cookie:` header.
    pub fn matching(&self, domain: &str, path: &str) -> impl Iterator<Item = &Cookie> {
        self.cookies
            .iter()
            .filter(move |c| domain.ends_with(&c.domain) && path.starts_with(&c.path))
    }

    #[must_use]
    pub fn header_value(&self, domain: &str, path: &str) -> Option<String> {
        let pairs: Vec<String> =
            self.matching(domain, path).map(|c| format!("{}={}", c.name, c.value)).collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_suffix_and_path_prefix_match() {
        let mut store = CookieStore::new();
        store.set_cookie("session=abc123", "example.com", "/api");
        assert!(store.header_value("sub.example.com", "/api/v1").is_some());
        assert!(store.header_value("other.com", "/api").is_none());
        assert!(store.header_value("example.com", "/other").is_none());
    }

    #[test]
    fn same_name_replaces_prior_value() {
        let mut store = CookieStore::new();
        store.set_cookie("a=1", "example.com", "/");
        store.set_cookie("a=2", "example.com", "/");
        assert_eq!(store.header_value("example.com", "/"), Some("a=2".to_string()));
    }

    #[test]
    fn insertion_order_preserved() {
        let mut store = CookieStore::new();
        store.set_cookie("first=1", "example.com", "/");
        store.set_cookie("second=2", "example.com", "/");
        assert_eq!(store.header_value("example.com", "/"), Some("first=1; second=2".to_string()));
    }
}
