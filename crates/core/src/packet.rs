// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Carrier records (uref equivalents): an optional [`crate::buffer::Ubuf`]
//! payload plus a typed attribute dictionary.
//!
//! This sits alongside the simpler [`crate::types::Packet`]/[`crate::types::AudioFrame`]
//! fast path used by ordinary audio/text nodes. The richer [`Uref`] carrier is
//! what the container, codec, and SRT nodes pass between themselves and each
//! other's sub-pipes, where attributes like `dts.pts_delay`, `cr.sys`, and the
//! SRT key material need to travel with the buffer rather than be inferred
//! from a fixed struct shape.

use crate::buffer::Ubuf;
use std::collections::BTreeMap;

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    SmallUint(u8),
    Uint(u64),
    Int(i64),
    String(String),
    /// Rational number, e.g. a frame rate or sample aspect ratio.
    Rational(i64, i64),
    /// Opaque binary payload (e.g. SRT salt/SEK material).
    Opaque(Vec<u8>),
    Bool(bool),
}

impl AttrValue {
    #[must_use]
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            Self::SmallUint(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_opaque(&self) -> Option<&[u8]> {
        match self {
            Self::Opaque(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// A typed key/value attribute dictionary attached to a [`Uref`].
///
/// Backed by a `BTreeMap` (rather than a `HashMap`) so that two dictionaries
/// with the same key/value pairs compare structurally equal regardless of
/// insertion order, which is what flow-definition equality (§3) requires.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrDict {
    entries: BTreeMap<String, AttrValue>,
}

impl AttrDict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) -> &mut Self {
        self.entries.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.entries.get(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<AttrValue> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A carrier record: an optional buffer payload plus an attribute dictionary.
///
/// Control urefs (e.g. a flow-definition amendment) carry `ubuf: None`. Data
/// urefs own exactly one `ubuf`. `next` realizes the "intrusive sibling"
/// link §3 describes — used, for instance, to attach a pending flow-def
/// amendment to the data uref that triggered it.
#[derive(Debug, Clone, Default)]
pub struct Uref {
    pub ubuf: Option<Ubuf>,
    pub attrs: AttrDict,
    pub next: Option<Box<Uref>>,
}

impl Uref {
    #[must_use]
    pub fn control(attrs: AttrDict) -> Self {
        Self { ubuf: None, attrs, next: None }
    }

    #[must_use]
    pub fn data(ubuf: Ubuf, attrs: AttrDict) -> Self {
        Self { ubuf: Some(ubuf), attrs, next: None }
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        self.ubuf.is_none()
    }

    /// Attach a sibling record (e.g. a flow-def amendment) to this one.
    pub fn attach(&mut self, sibling: Uref) {
        self.next = Some(Box::new(sibling));
    }

    // --- well-known timestamp attribute accessors (§3: three timestamp domains) ---

    #[must_use]
    pub fn dts_pts_delay(&self) -> Option<i64> {
        self.attrs.get("dts.pts_delay").and_then(AttrValue::as_int)
    }

    pub fn set_dts_pts_delay(&mut self, delay: i64) {
        self.attrs.set("dts.pts_delay", AttrValue::Int(delay));
    }

    #[must_use]
    pub fn cr_sys(&self) -> Option<u64> {
        self.attrs.get("cr.sys").and_then(AttrValue::as_uint)
    }

    pub fn set_cr_sys(&mut self, ticks: u64) {
        self.attrs.set("cr.sys", AttrValue::Uint(ticks));
    }

    #[must_use]
    pub fn cr_prog(&self) -> Option<u64> {
        self.attrs.get("cr.prog").and_then(AttrValue::as_uint)
    }

    pub fn set_cr_prog(&mut self, ticks: u64) {
        self.attrs.set("cr.prog", AttrValue::Uint(ticks));
    }

    #[must_use]
    pub fn dts_orig(&self) -> Option<u64> {
        self.attrs.get("dts.orig").and_then(AttrValue::as_uint)
    }

    pub fn set_dts_orig(&mut self, ticks: u64) {
        self.attrs.set("dts.orig", AttrValue::Uint(ticks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_dict_equality_is_order_independent() {
        let mut a = AttrDict::new();
        a.set("rate", AttrValue::Uint(48000)).set("channels", AttrValue::SmallUint(2));

        let mut b = AttrDict::new();
        b.set("channels", AttrValue::SmallUint(2)).set("rate", AttrValue::Uint(48000));

        assert_eq!(a, b);
    }

    #[test]
    fn attr_dict_inequality_on_value_change() {
        let mut a = AttrDict::new();
        a.set("rate", AttrValue::Uint(48000));
        let mut b = a.clone();
        b.set("rate", AttrValue::Uint(44100));
        assert_ne!(a, b);
    }

    #[test]
    fn control_uref_has_no_ubuf() {
        let uref = Uref::control(AttrDict::new());
        assert!(uref.is_control());
    }

    #[test]
    fn timestamp_accessors_round_trip() {
        let mut uref = Uref::control(AttrDict::new());
        uref.set_cr_sys(123_456);
        uref.set_dts_pts_delay(-5);
        assert_eq!(uref.cr_sys(), Some(123_456));
        assert_eq!(uref.dts_pts_delay(), Some(-5));
    }
}
