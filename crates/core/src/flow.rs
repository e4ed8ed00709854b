// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Flow definitions: a typed descriptor of a stream's format, carried as a
//! control [`crate::packet::Uref`].
//!
//! The `def` string follows the grammar from the external-interfaces section:
//! `class ("." subclass)*`, classes being `void`, `block`, `pic`, `pic.sub`,
//! `sound.<sample_format>`; block subclasses are codec identifiers
//! (`mpeg2video`, `h264`, `aac`, `opus`, `id3`, `id3.metadata`, ...).
//! Comparators match by prefix, and two flow defs are equal iff their
//! dictionaries are (structural `AttrDict` equality already gives us this).

use crate::packet::{AttrDict, AttrValue};
use crate::types::{AudioFormat, PacketType, SampleFormat};

/// A stream format descriptor: a `def` class string plus format attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDef {
    pub def: String,
    attrs: AttrDict,
}

impl FlowDef {
    #[must_use]
    pub fn new(def: impl Into<String>) -> Self {
        Self { def: def.into(), attrs: AttrDict::new() }
    }

    #[must_use]
    pub fn block(codec: &str) -> Self {
        Self::new(format!("block.{codec}"))
    }

    #[must_use]
    pub fn sound(sample_format: &str, rate: u32, channels: u16) -> Self {
        let mut flow = Self::new(format!("sound.{sample_format}."));
        flow.attrs.set("rate", AttrValue::Uint(u64::from(rate)));
        flow.attrs.set("channels", AttrValue::SmallUint(channels.min(u16::from(u8::MAX)) as u8));
        flow
    }

    #[must_use]
    pub fn picture(hsize: u32, vsize: u32) -> Self {
        let mut flow = Self::new("pic.");
        flow.attrs.set("hsize", AttrValue::Uint(u64::from(hsize)));
        flow.attrs.set("vsize", AttrValue::Uint(u64::from(vsize)));
        flow
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: AttrValue) -> &mut Self {
        self.attrs.set(key, value);
        self
    }

    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    #[must_use]
    pub fn attrs(&self) -> &AttrDict {
        &self.attrs
    }

    /// Prefix-match comparator, e.g. `"block.h264.annexb".matches_class("block.h264")`.
    #[must_use]
    pub fn matches_class(&self, prefix: &str) -> bool {
        self.def == prefix || self.def.starts_with(&format!("{prefix}."))
    }

    /// Whether an existing `PacketType` is compatible with this flow def's
    /// format attributes. Used to validate a pin connection against a
    /// dynamically-synthesized flow def (e.g. from an avformat probe).
    #[must_use]
    pub fn matches_packet_type(&self, packet_type: &PacketType) -> bool {
        match (self.def.split('.').next(), packet_type) {
            (Some("sound"), PacketType::RawAudio(fmt)) => self.matches_audio_format(fmt),
            (Some("block"), PacketType::Binary | PacketType::OpusAudio) => true,
            _ => false,
        }
    }

    /// Renders this flow def as a JSON object (`def` plus its attributes),
    /// for carrying a `SET_FLOW_DEF` push over a channel that only
    /// transports JSON-shaped payloads (e.g. [`crate::types::CustomPacketData`]).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut attrs = serde_json::Map::new();
        for (key, value) in self.attrs.iter() {
            let json = match value {
                AttrValue::SmallUint(v) => serde_json::json!(v),
                AttrValue::Uint(v) => serde_json::json!(v),
                AttrValue::Int(v) => serde_json::json!(v),
                AttrValue::String(v) => serde_json::json!(v),
                AttrValue::Rational(num, den) => serde_json::json!([num, den]),
                AttrValue::Opaque(bytes) => serde_json::json!(bytes.len()),
                AttrValue::Bool(v) => serde_json::json!(v),
            };
            attrs.insert(key.clone(), json);
        }
        serde_json::json!({ "def": self.def, "attrs": attrs })
    }

    fn matches_audio_format(&self, fmt: &AudioFormat) -> bool {
        let rate_ok = self.attr("rate").and_then(AttrValue::as_uint).is_none_or(|r| {
            fmt.sample_rate == 0 || r == u64::from(fmt.sample_rate)
        });
        let sample_fmt_ok = match fmt.sample_format {
            SampleFormat::F32 => self.def.starts_with("sound.f32"),
            SampleFormat::S16Le => self.def.starts_with("sound.s16"),
        };
        rate_ok && sample_fmt_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_reflexive_symmetric_transitive() {
        let a = FlowDef::sound("f32", 48000, 2);
        let b = a.clone();
        let c = b.clone();
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(b, c);
        assert_eq!(a, c);
    }

    #[test]
    fn prefix_match_respects_class_boundary() {
        let h264 = FlowDef::block("h264.annexb");
        assert!(h264.matches_class("block.h264"));
        assert!(!h264.matches_class("block.h26")); // not a `.`-delimited prefix
    }

    #[test]
    fn to_json_carries_def_and_attrs() {
        let flow = FlowDef::sound("f32", 48000, 2);
        let json = flow.to_json();
        assert_eq!(json["def"], "sound.f32.");
        assert_eq!(json["attrs"]["rate"], 48000);
        assert_eq!(json["attrs"]["channels"], 2);
    }

    #[test]
    fn matches_packet_type_checks_rate_and_sample_format() {
        let flow = FlowDef::sound("f32", 48000, 2);
        let compatible =
            PacketType::RawAudio(AudioFormat { sample_rate: 48000, channels: 2, sample_format: SampleFormat::F32 });
        let wrong_rate =
            PacketType::RawAudio(AudioFormat { sample_rate: 44100, channels: 2, sample_format: SampleFormat::F32 });
        assert!(flow.matches_packet_type(&compatible));
        assert!(!flow.matches_packet_type(&wrong_rate));
    }
}
