// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! This module contains all built-in transport node implementations.

use streamkit_core::NodeRegistry;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "srt")]
pub mod srt;

/// Registers all available transport nodes with the engine's registry.
pub fn register_transport_nodes(registry: &mut NodeRegistry) {
    #[cfg(feature = "http")]
    http::register_http_nodes(registry);

    #[cfg(feature = "srt")]
    srt::register_srt_nodes(registry);
}
