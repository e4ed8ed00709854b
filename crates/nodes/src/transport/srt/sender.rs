// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! SRT send side: the retransmission buffer, NAK-driven retransmit, DROPREQ
//! emission, and the encrypting `SenderNode`. Grounded on
//! `upipe_srt_sender.c`'s send-buffer pruning and loss-triggered resend
//! logic, restated as a pure [`SendBuffer`] plus a thin async adapter.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use streamkit_core::node::{NodeContext, ProcessorNode};
use streamkit_core::pins::{InputPin, OutputPin, PinCardinality};
use streamkit_core::registry::{NodeRegistry, StaticPins};
use streamkit_core::types::{AudioFormat, Packet, PacketType, SampleFormat};
use streamkit_core::StreamKitError;
use tokio::net::UdpSocket;

use streamkit_core::control::NodeControlMessage;

use super::crypto::{aes_key_wrap, apply_ctr_keystream, derive_kek, derive_packet_iv, KeyLength};
use super::handshake::{HandshakeSm, SrtRole, HANDSHAKE_RETRANSMIT, HANDSHAKE_TIMEOUT};
use super::wire::{
    unpack_nak_entries, ControlType, EncryptionField, KeyMaterialExt, NakEntry, PacketPosition,
    SrtHeader,
};

/// How often a pending rekey's `KmReq` is resent until the peer's `KmRsp`
/// arrives (§4.J "Rekey").
const REKEY_RETRANSMIT: Duration = Duration::from_millis(1000);

/// How far back in time a buffered packet is still worth keeping before it
/// is pruned and reported via DROPREQ (§4.L: "prune every 1s by `cr_sys <
/// now - latency`").
const DEFAULT_LATENCY: Duration = Duration::from_secs(1);

/// How often the send buffer is swept for stale entries.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

struct BufferedPacket {
    payload: Bytes,
    sent_at: std::time::Instant,
}

/// Tracks in-flight data packets so NAK-driven retransmission can resend
/// them, and prunes packets that have aged past the configured latency
/// budget, emitting the dropped range for a DROPREQ.
pub struct SendBuffer {
    latency: Duration,
    packets: BTreeMap<u32, BufferedPacket>,
}

impl SendBuffer {
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self { latency, packets: BTreeMap::new() }
    }

    pub fn push(&mut self, seq: u32, payload: Bytes) {
        self.packets.insert(seq, BufferedPacket { payload, sent_at: std::time::Instant::now() });
    }

    #[must_use]
    pub fn get(&self, seq: u32) -> Option<&Bytes> {
        self.packets.get(&seq).map(|p| &p.payload)
    }

    /// Drop every packet older than `latency`, returning the contiguous
    /// `[first, last]` ranges that were dropped so the caller can emit
    /// DROPREQ control packets for them.
    pub fn prune(&mut self) -> Vec<(u32, u32)> {
        let now = std::time::Instant::now();
        let stale: Vec<u32> = self
            .packets
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= self.latency)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &stale {
            self.packets.remove(seq);
        }
        ranges_of(&stale)
    }

    /// Resolve NAK entries into the sequences this buffer can still satisfy,
    /// paired with their payloads for retransmission.
    #[must_use]
    pub fn resolve_nak(&self, entries: &[NakEntry]) -> Vec<(u32, Bytes)> {
        let mut out = Vec::new();
        for entry in entries {
            match *entry {
                NakEntry::Single(seq) => {
                    if let Some(payload) = self.get(seq) {
                        out.push((seq, payload.clone()));
                    }
                },
                NakEntry::Range(first, last) => {
                    let mut seq = first;
                    loop {
                        if let Some(payload) = self.get(seq) {
                            out.push((seq, payload.clone()));
                        }
                        if seq == last {
                            break;
                        }
                        seq = seq.wrapping_add(1);
                    }
                },
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

fn ranges_of(sorted_seqs: &[u32]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < sorted_seqs.len() {
        let start = sorted_seqs[i];
        let mut end = start;
        let mut j = i + 1;
        while j < sorted_seqs.len() && sorted_seqs[j] == end.wrapping_add(1) {
            end = sorted_seqs[j];
            j += 1;
        }
        out.push((start, end));
        i = j;
    }
    out
}

/// Configuration for [`SenderNode`].
#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct SrtSenderConfig {
    pub remote_addr: String,
    #[serde(default)]
    pub local_addr: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Latency budget in milliseconds before an unacknowledged packet is
    /// dropped from the retransmission buffer. Defaults to 1000ms.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
}

fn default_latency_ms() -> u64 {
    1000
}

/// Sends payloads over an established SRT connection, buffering sent packets
/// for retransmission, honoring NAK reports, and pruning/DROPREQ-ing packets
/// that have aged out of the latency budget (§4.L).
pub struct SenderNode {
    config: SrtSenderConfig,
}

impl SenderNode {
    #[must_use]
    pub fn new(config: SrtSenderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProcessorNode for SenderNode {
    fn input_pins(&self) -> Vec<InputPin> {
        vec![InputPin {
            name: "in".to_string(),
            accepts_types: vec![PacketType::Binary, PacketType::RawAudio(AudioFormat {
                sample_rate: 0,
                channels: 0,
                sample_format: SampleFormat::F32,
            })],
            cardinality: PinCardinality::One,
        }]
    }

    fn output_pins(&self) -> Vec<OutputPin> {
        Vec::new()
    }

    async fn run(self: Box<Self>, mut context: NodeContext) -> Result<(), StreamKitError> {
        let remote: std::net::SocketAddr = self
            .config
            .remote_addr
            .parse()
            .map_err(|e| StreamKitError::Configuration(format!("invalid remote_addr: {e}")))?;
        let bind_addr = self.config.local_addr.as_deref().unwrap_or("0.0.0.0:0");
        let bind_addr: std::net::SocketAddr = bind_addr
            .parse()
            .map_err(|e| StreamKitError::Configuration(format!("invalid local_addr: {e}")))?;
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| StreamKitError::Network(format!("bind failed: {e}")))?;

        let local_socket_id: u32 = rand::random();
        let mut sm = HandshakeSm::new(SrtRole::Caller, local_socket_id, self.config.passphrase.clone());
        let initial_seq: u32 = rand::random::<u32>() & 0x7FFF_FFFF;
        let induction = sm.start_caller(initial_seq);
        socket
            .send_to(&induction, remote)
            .await
            .map_err(|e| StreamKitError::Network(format!("send failed: {e}")))?;

        let mut hs_buf = vec![0u8; 1500];
        let mut hs_retransmit = tokio::time::interval_at(
            tokio::time::Instant::now() + HANDSHAKE_RETRANSMIT,
            HANDSHAKE_RETRANSMIT,
        );
        let handshake_deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
        tokio::pin!(handshake_deadline);
        while !sm.is_established() {
            tokio::select! {
                biased;
                () = cancelled(&context) => {
                    return Ok(());
                }
                () = &mut handshake_deadline => {
                    return Err(StreamKitError::Network(
                        "SRT handshake did not establish within 3s of the first induction".into(),
                    ));
                }
                _ = hs_retransmit.tick() => {
                    let packet = sm.on_retransmit_tick(initial_seq)?;
                    socket
                        .send_to(&packet, remote)
                        .await
                        .map_err(|e| StreamKitError::Network(format!("send failed: {e}")))?;
                }
                recv = socket.recv_from(&mut hs_buf) => {
                    let (len, from) = recv.map_err(|e| StreamKitError::Network(format!("recv failed: {e}")))?;
                    if len < 16 || from != remote {
                        continue;
                    }
                    let header = match SrtHeader::parse(&hs_buf[..len]) {
                        Ok(h) => h,
                        Err(_) => continue,
                    };
                    if !matches!(header, SrtHeader::Control { control_type: ControlType::Handshake, .. }) {
                        continue;
                    }
                    if let Some(reply) = sm.on_handshake_cif(&hs_buf[16..len], initial_seq)? {
                        socket
                            .send_to(&reply, remote)
                            .await
                            .map_err(|e| StreamKitError::Network(format!("send failed: {e}")))?;
                    }
                }
            }
        }
        // Key material is tracked per parity so a rekey can introduce a fresh
        // SEK for the inactive parity while the active one keeps encrypting
        // (§4.J "Rekey"). The handshake always lands its initial SEK as even.
        let mut keys: [Option<([u8; 16], Vec<u8>)>; 2] =
            [sm.key_material().map(|(salt, sek)| (*salt, sek.to_vec())), None];
        let mut active_parity: usize = 0;
        let mut pending_rekey: Option<usize> = None;
        drop(sm);

        let mut send_buffer = SendBuffer::new(Duration::from_millis(self.config.latency_ms));
        let mut next_seq: u32 = initial_seq;
        let mut msg_number: u32 = 0;

        let mut input_rx = context.take_input("in")?;
        let mut recv_buf = vec![0u8; 1500];
        let mut prune_timer = tokio::time::interval(PRUNE_INTERVAL);
        let mut rekey_timer = tokio::time::interval(REKEY_RETRANSMIT);

        loop {
            tokio::select! {
                biased;
                () = cancelled(&context) => {
                    send_shutdown(&socket, remote).await;
                    return Ok(());
                }
                _ = prune_timer.tick() => {
                    for (first, last) in send_buffer.prune() {
                        send_dropreq(&socket, remote, first, last).await;
                    }
                }
                _ = rekey_timer.tick() => {
                    if let Some(parity) = pending_rekey {
                        if let Some((salt, sek)) = &keys[parity] {
                            if let Some(passphrase) = &self.config.passphrase {
                                let kek = derive_kek(passphrase.as_bytes(), salt, KeyLength::Aes128);
                                if let Ok(wrapped_sek) = aes_key_wrap(&kek, sek) {
                                    let ext = KeyMaterialExt { salt: *salt, wrapped_sek };
                                    send_km_req(&socket, remote, parity, &ext).await;
                                }
                            }
                        }
                    }
                }
                Some(control_msg) = context.control_rx.recv() => {
                    if let NodeControlMessage::SetOption { key, value } = &control_msg {
                        if key == "passphrase" {
                            if let Some(passphrase) = value.as_str() {
                                let inactive = 1 - active_parity;
                                let salt: [u8; 16] = rand::random();
                                let new_sek: Vec<u8> = (0..16).map(|_| rand::random::<u8>()).collect();
                                let kek = derive_kek(passphrase.as_bytes(), &salt, KeyLength::Aes128);
                                if let Ok(wrapped_sek) = aes_key_wrap(&kek, &new_sek) {
                                    keys[inactive] = Some((salt, new_sek));
                                    pending_rekey = Some(inactive);
                                    let ext = KeyMaterialExt { salt, wrapped_sek };
                                    send_km_req(&socket, remote, inactive, &ext).await;
                                }
                            }
                        }
                    }
                }
                recv = socket.recv_from(&mut recv_buf) => {
                    let (len, _from) = match recv {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if len < 16 {
                        continue;
                    }
                    match SrtHeader::parse(&recv_buf[..len]) {
                        Ok(SrtHeader::Control { control_type: ControlType::Nak, .. }) => {
                            let words: Vec<u32> = recv_buf[16..len]
                                .chunks_exact(4)
                                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                                .collect();
                            let entries = unpack_nak_entries(&words);
                            let encryption = if keys[active_parity].is_some() {
                                parity_field(active_parity)
                            } else {
                                EncryptionField::Clear
                            };
                            for (seq, payload) in send_buffer.resolve_nak(&entries) {
                                send_data_packet(&socket, remote, seq, msg_number, &payload, true, encryption).await;
                            }
                        }
                        Ok(SrtHeader::Control { control_type: ControlType::KmRsp, type_specific, .. }) => {
                            let parity = usize::try_from(type_specific).unwrap_or(0) & 1;
                            if pending_rekey == Some(parity) {
                                active_parity = parity;
                                pending_rekey = None;
                            }
                        }
                        _ => {}
                    }
                }
                maybe_packet = input_rx.recv() => {
                    let Some(packet) = maybe_packet else {
                        return Ok(());
                    };
                    let Some(mut payload) = extract_payload(packet) else {
                        continue;
                    };
                    let seq = next_seq;
                    next_seq = next_seq.wrapping_add(1) & 0x7FFF_FFFF;
                    msg_number = (msg_number + 1) & 0x03FF_FFFF;

                    if let Some((salt, sek)) = &keys[active_parity] {
                        let iv = derive_packet_iv(salt, seq);
                        if apply_ctr_keystream(sek, &iv, &mut payload).is_err() {
                            continue;
                        }
                    }

                    let encryption = if keys[active_parity].is_some() {
                        parity_field(active_parity)
                    } else {
                        EncryptionField::Clear
                    };
                    let bytes = Bytes::from(payload);
                    send_buffer.push(seq, bytes.clone());
                    send_data_packet(&socket, remote, seq, msg_number, &bytes, false, encryption).await;
                }
            }
        }
    }
}

fn parity_field(parity: usize) -> EncryptionField {
    if parity == 0 { EncryptionField::Even } else { EncryptionField::Odd }
}

fn extract_payload(packet: Packet) -> Option<Vec<u8>> {
    match packet {
        Packet::Binary { data, .. } => Some(data.to_vec()),
        Packet::Audio(frame) => {
            let samples = frame.samples();
            let mut out = Vec::with_capacity(samples.len() * 4);
            for s in samples.iter() {
                out.extend_from_slice(&s.to_le_bytes());
            }
            Some(out)
        },
        _ => None,
    }
}

async fn send_data_packet(
    socket: &UdpSocket,
    dst: std::net::SocketAddr,
    seq: u32,
    msg_number: u32,
    payload: &[u8],
    retransmit: bool,
    encryption: EncryptionField,
) {
    let header = SrtHeader::Data {
        seq,
        position: PacketPosition::Only,
        order: true,
        encryption,
        retransmit,
        msg_number,
        timestamp: 0,
        dest_sockid: 0,
    };
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    let _ = socket.send_to(&out, dst).await;
}

async fn send_dropreq(socket: &UdpSocket, dst: std::net::SocketAddr, first: u32, last: u32) {
    let header = SrtHeader::Control {
        control_type: ControlType::DropReq,
        type_specific: 0,
        timestamp: 0,
        dest_sockid: 0,
    };
    let cif = super::wire::DropReqCif { first, last };
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&cif.to_bytes());
    let _ = socket.send_to(&out, dst).await;
}

async fn send_shutdown(socket: &UdpSocket, dst: std::net::SocketAddr) {
    let header = SrtHeader::Control {
        control_type: ControlType::Shutdown,
        type_specific: 0,
        timestamp: 0,
        dest_sockid: 0,
    };
    let _ = socket.send_to(&header.to_bytes(), dst).await;
}

/// Sends a rekey `KmReq` for the given parity, carrying the wrapped SEK so
/// the peer can unwrap it and start decrypting with it once acknowledged.
async fn send_km_req(
    socket: &UdpSocket,
    dst: std::net::SocketAddr,
    parity: usize,
    ext: &KeyMaterialExt,
) {
    let header = SrtHeader::Control {
        control_type: ControlType::KmReq,
        type_specific: parity as u32,
        timestamp: 0,
        dest_sockid: 0,
    };
    let mut out = Vec::with_capacity(16 + 32);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&ext.to_bytes());
    let _ = socket.send_to(&out, dst).await;
}

async fn cancelled(context: &NodeContext) {
    match &context.cancellation_token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Register the sender node factory with the given registry.
///
/// # Panics
///
/// Panics if the config schema cannot be serialized to JSON (should never happen).
pub fn register(registry: &mut NodeRegistry) {
    let inputs = vec![InputPin {
        name: "in".to_string(),
        accepts_types: vec![PacketType::Binary],
        cardinality: PinCardinality::One,
    }];
    registry.register_static_with_description(
        "transport::srt_sender",
        |config| {
            let config: SrtSenderConfig =
                streamkit_core::config_helpers::parse_config_required(config)?;
            Ok(Box::new(SenderNode::new(config)) as Box<dyn ProcessorNode>)
        },
        serde_json::to_value(schemars::schema_for!(SrtSenderConfig))
            .expect("SrtSenderConfig schema should serialize to JSON"),
        StaticPins { inputs, outputs: Vec::new() },
        vec!["transport".to_string(), "srt".to_string()],
        false,
        "Sends payloads over an established SRT connection, buffering them for NAK-driven retransmission and encrypting with the configured passphrase.",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_buffer_resolves_single_and_range_naks() {
        let mut buf = SendBuffer::new(DEFAULT_LATENCY);
        buf.push(1, Bytes::from_static(b"a"));
        buf.push(2, Bytes::from_static(b"b"));
        buf.push(3, Bytes::from_static(b"c"));
        let entries = vec![NakEntry::Range(1, 2), NakEntry::Single(3)];
        let resolved = buf.resolve_nak(&entries);
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].0, 1);
        assert_eq!(resolved[2].0, 3);
    }

    #[test]
    fn send_buffer_ignores_naks_for_sequences_not_held() {
        let buf = SendBuffer::new(DEFAULT_LATENCY);
        let entries = vec![NakEntry::Single(99)];
        assert!(buf.resolve_nak(&entries).is_empty());
    }

    #[test]
    fn prune_drops_nothing_within_latency_window() {
        let mut buf = SendBuffer::new(Duration::from_secs(100));
        buf.push(1, Bytes::from_static(b"a"));
        assert!(buf.prune().is_empty());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn prune_drops_stale_packets_and_reports_contiguous_ranges() {
        let mut buf = SendBuffer::new(Duration::from_millis(0));
        buf.push(5, Bytes::from_static(b"a"));
        buf.push(6, Bytes::from_static(b"b"));
        buf.push(8, Bytes::from_static(b"c"));
        std::thread::sleep(Duration::from_millis(2));
        let ranges = buf.prune();
        assert_eq!(ranges, vec![(5, 6), (8, 8)]);
        assert!(buf.is_empty());
    }
}
