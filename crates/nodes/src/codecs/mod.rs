// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Generic codec nodes that decode/encode raw access units given an
//! explicit codec identifier, as opposed to `audio::codecs`' container-aware
//! single-format nodes (`wav`/`flac`/`mp3`) which probe their own framing.

use streamkit_core::NodeRegistry;

pub mod decoder;

/// Registers all available generic codec nodes with the engine's registry.
pub fn register_codec_nodes(registry: &mut NodeRegistry) {
    decoder::register_decoder_nodes(registry);
}
