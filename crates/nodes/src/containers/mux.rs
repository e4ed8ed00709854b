// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A generic container sink: interleaves N coded input tracks into one
//! output byte stream in presentation order. Mirrors the source's
//! `avformat` sink pipe, generalized over the container format via the
//! `MuxFormat` trait (symphonia has no encode/mux support, so unlike the
//! demuxer this can't delegate to it — see `ogg.rs`'s own hand-rolled
//! packet writer for the same reason).
//!
//! Each input track is buffered in its own [`SubpipeHost`]-managed queue;
//! the multiplexer only ever writes out the globally-earliest-DTS packet
//! once every still-open track has at least one buffered, so a fast track
//! never gets interleaved ahead of a slow one that just hasn't produced its
//! next packet yet.

use async_trait::async_trait;
use bytes::Bytes;
use schemars::JsonSchema;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::VecDeque;
use streamkit_core::control::NodeControlMessage;
use streamkit_core::stats::NodeStatsTracker;
use streamkit_core::subpipe::SubpipeHost;
use streamkit_core::types::{Packet, PacketType};
use streamkit_core::{
    get_stream_channel_capacity, state_helpers, InputPin, NodeContext, NodeRegistry, OutputPin,
    PinCardinality, ProcessorNode, StreamKitError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Deserialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MuxFormatKind {
    /// Self-describing length-prefixed interleave, rebasing every track's
    /// timestamps onto the first packet seen.
    #[default]
    Framed,
    /// Same wire format as `Framed`, but timestamps pass through unrebased
    /// (the MPEG-TS convention, where PCR offsets are meaningful on their
    /// own and shouldn't be reset to zero at mux start).
    PassthroughTimestamps,
}

#[derive(Deserialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct MuxSinkConfig {
    /// Number of input tracks (`in_0`..`in_{n-1}`).
    pub num_tracks: usize,
    pub format: MuxFormatKind,
}

impl Default for MuxSinkConfig {
    fn default() -> Self {
        Self { num_tracks: 1, format: MuxFormatKind::default() }
    }
}

/// Interleaves the coded packets of `num_tracks` input pins into one output
/// byte stream via a configurable [`MuxFormat`].
pub struct MuxSinkNode {
    config: MuxSinkConfig,
}

impl MuxSinkNode {
    pub const fn new(config: MuxSinkConfig) -> Self {
        Self { config }
    }
}

/// What a container writer needs to implement to back a [`MuxSinkNode`].
/// Exists so a real MPEG-TS/fMP4 writer can be dropped in later without
/// touching the interleaving logic above it.
trait MuxFormat: Send {
    /// Whether packet timestamps should be rebased onto the first packet's
    /// DTS (most ad-hoc formats) or passed through as-is (MPEG-TS-style).
    fn rebases_timestamps(&self) -> bool;
    fn write_header(&mut self, num_tracks: usize) -> Vec<u8>;
    fn write_packet(&mut self, track: usize, dts: Option<u64>, data: &[u8]) -> Vec<u8>;
    fn write_trailer(&mut self) -> Vec<u8>;
}

/// A minimal, always-available interleave format: `SKMX` + track count,
/// then one `track(u32 LE) + dts(i64 LE, -1 for unknown) + len(u32 LE) +
/// payload` record per packet. Not a real broadcast container — it exists
/// so a mux pipeline always has a working writer even before a real
/// MPEG-TS/fMP4 implementation is wired in.
struct FramedMuxFormat {
    rebase: bool,
}

impl MuxFormat for FramedMuxFormat {
    fn rebases_timestamps(&self) -> bool {
        self.rebase
    }

    fn write_header(&mut self, num_tracks: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(b"SKMX");
        out.extend_from_slice(&(num_tracks as u32).to_le_bytes());
        out
    }

    fn write_packet(&mut self, track: usize, dts: Option<u64>, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + data.len());
        out.extend_from_slice(&(track as u32).to_le_bytes());
        out.extend_from_slice(&dts.map_or(-1i64, |d| d as i64).to_le_bytes());
        out.extend_from_slice(&(u32::try_from(data.len()).unwrap_or(u32::MAX)).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn write_trailer(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

fn build_format(kind: MuxFormatKind) -> Box<dyn MuxFormat> {
    match kind {
        MuxFormatKind::Framed => Box::new(FramedMuxFormat { rebase: true }),
        MuxFormatKind::PassthroughTimestamps => Box::new(FramedMuxFormat { rebase: false }),
    }
}

struct TrackBuffer {
    queue: VecDeque<(Option<u64>, Bytes)>,
    closed: bool,
}

enum TrackEvent {
    Data { track: usize, dts: Option<u64>, data: Bytes },
    Eof { track: usize },
}

#[async_trait]
impl ProcessorNode for MuxSinkNode {
    fn input_pins(&self) -> Vec<InputPin> {
        (0..self.config.num_tracks.max(1))
            .map(|idx| InputPin {
                name: format!("in_{idx}"),
                accepts_types: vec![PacketType::Binary],
                cardinality: PinCardinality::One,
            })
            .collect()
    }

    fn output_pins(&self) -> Vec<OutputPin> {
        vec![OutputPin {
            name: "out".to_string(),
            produces_type: PacketType::Binary,
            cardinality: PinCardinality::Broadcast,
        }]
    }

    fn content_type(&self) -> Option<String> {
        Some("application/octet-stream".to_string())
    }

    async fn run(self: Box<Self>, mut context: NodeContext) -> Result<(), StreamKitError> {
        let node_name = context.output_sender.node_name().to_string();
        state_helpers::emit_initializing(&context.state_tx, &node_name);

        let num_tracks = self.config.num_tracks.max(1);
        let mut format = build_format(self.config.format);

        let (combined_tx, mut combined_rx) =
            mpsc::channel::<TrackEvent>(get_stream_channel_capacity());
        let mut input_tasks: Vec<JoinHandle<()>> = Vec::with_capacity(num_tracks);
        for idx in 0..num_tracks {
            let pin_name = format!("in_{idx}");
            let mut rx = context.take_input(&pin_name)?;
            let tx = combined_tx.clone();
            input_tasks.push(tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    if let Packet::Binary { data, metadata, .. } = packet {
                        let dts = metadata.and_then(|m| m.timestamp_us);
                        if tx.send(TrackEvent::Data { track: idx, dts, data }).await.is_err() {
                            break;
                        }
                    }
                }
                let _ = tx.send(TrackEvent::Eof { track: idx }).await;
            }));
        }
        drop(combined_tx);

        let mut tracks: SubpipeHost<TrackBuffer> = SubpipeHost::new();
        for idx in 0..num_tracks {
            tracks.adopt(idx.to_string(), TrackBuffer { queue: VecDeque::new(), closed: false });
        }

        state_helpers::emit_running(&context.state_tx, &node_name);
        let mut stats_tracker = NodeStatsTracker::new(node_name.clone(), context.stats_tx.clone());

        let mut header_written = false;
        let mut first_dts: Option<u64> = None;
        let mut open_tracks = num_tracks;

        loop {
            tokio::select! {
                maybe = combined_rx.recv() => {
                    match maybe {
                        Some(TrackEvent::Data { track, dts, data }) => {
                            stats_tracker.received();
                            if let Some(buf) = tracks.get_mut(&track.to_string()) {
                                buf.queue.push_back((dts, data));
                            }
                            drain_ready(&mut tracks, &mut *format, &mut header_written, num_tracks, &mut first_dts, &mut context, &node_name, &mut stats_tracker).await?;
                        }
                        Some(TrackEvent::Eof { track }) => {
                            if let Some(buf) = tracks.get_mut(&track.to_string()) {
                                buf.closed = true;
                            }
                            open_tracks = open_tracks.saturating_sub(1);
                            drain_ready(&mut tracks, &mut *format, &mut header_written, num_tracks, &mut first_dts, &mut context, &node_name, &mut stats_tracker).await?;
                            if open_tracks == 0 {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(control_msg) = context.control_rx.recv() => {
                    if matches!(control_msg, NodeControlMessage::Shutdown) {
                        for task in &input_tasks {
                            task.abort();
                        }
                        break;
                    }
                }
            }
        }

        // All tracks closed (or shutdown requested): one more drain flushes
        // whatever is left in DTS order, since `drain_ready`'s readiness
        // check is trivially satisfied once every track is closed.
        drain_ready(&mut tracks, &mut *format, &mut header_written, num_tracks, &mut first_dts, &mut context, &node_name, &mut stats_tracker).await?;

        let trailer = format.write_trailer();
        send_chunk(&mut context, &node_name, &mut stats_tracker, trailer).await.ok();

        state_helpers::emit_stopped(&context.state_tx, &node_name, "input_closed");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_ready(
    tracks: &mut SubpipeHost<TrackBuffer>,
    format: &mut dyn MuxFormat,
    header_written: &mut bool,
    num_tracks: usize,
    first_dts: &mut Option<u64>,
    context: &mut NodeContext,
    node_name: &str,
    stats: &mut NodeStatsTracker,
) -> Result<(), StreamKitError> {
    loop {
        let all_ready = tracks.iter().all(|(_, t)| t.closed || !t.queue.is_empty());
        if !all_ready {
            break;
        }

        let mut best: Option<(String, u64)> = None;
        for (name, buf) in tracks.iter() {
            if let Some((dts, _)) = buf.queue.front() {
                let key = dts.unwrap_or(u64::MAX);
                if best.as_ref().is_none_or(|(_, b)| key < *b) {
                    best = Some((name.clone(), key));
                }
            }
        }
        let Some((name, _)) = best else { break };
        let Some(buf) = tracks.get_mut(&name) else { break };
        let Some((dts, data)) = buf.queue.pop_front() else { break };

        if !*header_written {
            let header = format.write_header(num_tracks);
            send_chunk(context, node_name, stats, header).await?;
            *header_written = true;
        }

        let track_idx: usize = name.parse().unwrap_or(0);
        let out_dts = if format.rebases_timestamps() {
            let base = *first_dts.get_or_insert(dts.unwrap_or(0));
            dts.map(|d| d.saturating_sub(base))
        } else {
            dts
        };
        let chunk = format.write_packet(track_idx, out_dts, &data);
        send_chunk(context, node_name, stats, chunk).await?;
    }
    Ok(())
}

async fn send_chunk(
    context: &mut NodeContext,
    node_name: &str,
    stats: &mut NodeStatsTracker,
    bytes: Vec<u8>,
) -> Result<(), StreamKitError> {
    if bytes.is_empty() {
        return Ok(());
    }
    let packet = Packet::Binary {
        data: Bytes::from(bytes),
        content_type: Some(Cow::Borrowed("application/octet-stream")),
        metadata: None,
    };
    if context.output_sender.send("out", packet).await.is_err() {
        return Err(StreamKitError::Runtime(format!("{node_name}: output closed")));
    }
    stats.sent();
    stats.maybe_send();
    Ok(())
}

use schemars::schema_for;
use streamkit_core::{config_helpers, registry::StaticPins};

/// Registers the generic mux sink node.
///
/// # Panics
///
/// Panics if the config schema cannot be serialized to JSON (should never happen).
#[allow(clippy::expect_used)]
pub fn register_mux_nodes(registry: &mut NodeRegistry) {
    #[cfg(feature = "mux")]
    {
        let default_node = MuxSinkNode::new(MuxSinkConfig::default());
        registry.register_static_with_description(
            "containers::mux",
            |params| {
                let config = config_helpers::parse_config_optional(params)?;
                Ok(Box::new(MuxSinkNode::new(config)) as Box<dyn ProcessorNode>)
            },
            serde_json::to_value(schema_for!(MuxSinkConfig))
                .expect("MuxSinkConfig schema should serialize to JSON"),
            StaticPins { inputs: default_node.input_pins(), outputs: default_node.output_pins() },
            vec!["containers".to_string(), "mux".to_string()],
            false,
            "Interleaves N coded input tracks into one output byte stream in DTS order.",
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_utils::{
        assert_state_initializing, assert_state_running, assert_state_stopped, create_test_context,
    };
    use std::collections::HashMap;
    use streamkit_core::types::PacketMetadata;
    use tokio::sync::mpsc;

    fn coded_packet(ts: u64, tag: &str) -> Packet {
        Packet::Binary {
            data: Bytes::from(tag.to_string()),
            content_type: None,
            metadata: Some(PacketMetadata {
                timestamp_us: Some(ts),
                duration_us: None,
                sequence: None,
            }),
        }
    }

    #[tokio::test]
    async fn interleaves_two_tracks_in_dts_order() {
        let (tx0, rx0) = mpsc::channel(10);
        let (tx1, rx1) = mpsc::channel(10);
        let mut inputs = HashMap::new();
        inputs.insert("in_0".to_string(), rx0);
        inputs.insert("in_1".to_string(), rx1);
        let (context, mock_sender, mut state_rx) = create_test_context(inputs, 10);

        let node = MuxSinkNode::new(MuxSinkConfig { num_tracks: 2, format: MuxFormatKind::Framed });
        let handle = tokio::spawn(async move { Box::new(node).run(context).await });

        assert_state_initializing(&mut state_rx).await;
        assert_state_running(&mut state_rx).await;

        tx0.send(coded_packet(1000, "a0")).await.unwrap();
        tx1.send(coded_packet(500, "b0")).await.unwrap();
        tx0.send(coded_packet(2000, "a1")).await.unwrap();
        tx1.send(coded_packet(1500, "b1")).await.unwrap();

        drop(tx0);
        drop(tx1);
        assert_state_stopped(&mut state_rx).await;
        handle.await.unwrap().unwrap();

        let out = mock_sender.get_packets_for_pin("out").await;
        // header + 4 interleaved packet records
        assert!(out.len() >= 5, "expected a header chunk plus 4 packet chunks, got {}", out.len());
    }
}
