// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! SRT (Secure Reliable Transport) protocol stack: wire format, key
//! material, handshake, and the receiver/sender nodes built on top of them.

pub mod crypto;
pub mod handshake;
pub mod receiver;
pub mod sender;
pub mod wire;

use streamkit_core::registry::NodeRegistry;

/// Registers the SRT handshake, receiver, and sender nodes.
pub fn register_srt_nodes(registry: &mut NodeRegistry) {
    handshake::register(registry);
    receiver::register(registry);
    sender::register(registry);
}
