// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A generic container source: probes whatever format symphonia recognizes
//! from the stream's own bytes (rather than a fixed `wav`/`flac` hint) and
//! forwards one selected track's *coded* access units downstream, leaving
//! decoding to a separate `codecs::decoder` pipe. Mirrors the source's
//! `avformat` source pipe: opening the demuxer is deal-guarded since
//! probing mid-teardown would race a concurrent close, the first packet's
//! timestamp is anchored onto the pipeline clock, and every track the
//! container carries (not just the one selected for forwarding) is kept in
//! a `SubpipeHost` so a `SplitIterate` control query can still enumerate it.

use async_trait::async_trait;
use bytes::Bytes;
use schemars::JsonSchema;
use serde::Deserialize;
use std::borrow::Cow;
use streamkit_core::clock::{UClock, AV_CLOCK_MIN, PCR_OFFSET};
use streamkit_core::control::NodeControlMessage;
use streamkit_core::stats::NodeStatsTracker;
use streamkit_core::subpipe::SubpipeHost;
use streamkit_core::telemetry::TelemetryEmitter;
use streamkit_core::types::{Packet, PacketMetadata, PacketType};
use streamkit_core::{
    get_stream_channel_capacity, state_helpers, InputPin, NodeContext, NodeRegistry, OutputPin,
    PinCardinality, ProcessorNode, RequestKind, RequestProxy, StreamKitError,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;

use crate::streaming_utils::StreamingReader;

const DEMUX_RESULT_CHANNEL_CAPACITY: usize = 32;

#[derive(Deserialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct DemuxSourceConfig {
    /// Container extension hint passed to the prober (e.g. "mp4", "ts");
    /// empty lets symphonia probe blind from the stream's magic bytes.
    pub format_hint: String,
    /// Track id to forward if the container carries more than one; `None`
    /// selects symphonia's reported default track.
    pub track_id: Option<u32>,
}

impl Default for DemuxSourceConfig {
    fn default() -> Self {
        Self { format_hint: String::new(), track_id: None }
    }
}

/// Bookkeeping kept per discovered track, including ones not selected for
/// forwarding — enough for a `SplitIterate` query to describe them.
struct TrackInfo {
    codec: String,
    sample_rate: Option<u32>,
}

/// Demultiplexes a coded container stream into one selected track's coded
/// access units.
pub struct DemuxSourceNode {
    config: DemuxSourceConfig,
}

impl DemuxSourceNode {
    pub const fn new(config: DemuxSourceConfig) -> Self {
        Self { config }
    }
}

type DiscoveredTrack = (u32, String, Option<u32>);
type DemuxEvent = Result<(Bytes, String, PacketMetadata, Vec<DiscoveredTrack>), String>;

#[async_trait]
impl ProcessorNode for DemuxSourceNode {
    fn input_pins(&self) -> Vec<InputPin> {
        vec![InputPin {
            name: "in".to_string(),
            accepts_types: vec![PacketType::Binary],
            cardinality: PinCardinality::One,
        }]
    }

    fn output_pins(&self) -> Vec<OutputPin> {
        vec![OutputPin {
            name: "out".to_string(),
            produces_type: PacketType::Binary,
            cardinality: PinCardinality::Broadcast,
        }]
    }

    async fn run(self: Box<Self>, mut context: NodeContext) -> Result<(), StreamKitError> {
        let node_name = context.output_sender.node_name().to_string();
        state_helpers::emit_initializing(&context.state_tx, &node_name);

        let mut input_rx = context.take_input("in")?;
        let telemetry =
            TelemetryEmitter::new(node_name.clone(), context.session_id.clone(), context.telemetry_tx.clone());
        // Ask the pipeline's shared clock chain for the pipeline's `UClock`
        // rather than fabricating a private one, so every pipe in this run
        // stamps `cr.sys` against the same epoch. This node installs itself
        // as a proxy provider so it's unregistered automatically on exit.
        let clock_proxy = RequestProxy::new(context.clock_chain.clone(), node_name.clone());
        let clock = clock_proxy.request(RequestKind::Clock).unwrap_or_else(UClock::new);
        let mut tracks: SubpipeHost<TrackInfo> = SubpipeHost::new();

        let (stream_tx, stream_rx) = mpsc::channel::<Bytes>(get_stream_channel_capacity());
        let (result_tx, mut result_rx) =
            mpsc::channel::<DemuxEvent>(DEMUX_RESULT_CHANNEL_CAPACITY);

        let format_hint = self.config.format_hint.clone();
        let track_id_cfg = self.config.track_id;
        let guard = context.deal.grab().map_err(|e| StreamKitError::Busy(e.to_string()))?;
        let demux_task = tokio::task::spawn_blocking(move || {
            let reader = StreamingReader::new(stream_rx);
            let result = demux_streaming(reader, &format_hint, track_id_cfg, &result_tx);
            guard.release();
            if let Err(e) = result {
                tracing::error!("demux failed: {e}");
            }
        });

        state_helpers::emit_running(&context.state_tx, &node_name);
        let mut stats_tracker = NodeStatsTracker::new(node_name.clone(), context.stats_tx.clone());

        let mut input_task = tokio::spawn(async move {
            while let Some(packet) = input_rx.recv().await {
                if let Packet::Binary { data, .. } = packet {
                    if stream_tx.send(data).await.is_err() {
                        break;
                    }
                }
            }
        });
        let mut input_done = false;
        let mut anchored = false;
        let mut first_pts: Option<u64> = None;

        loop {
            tokio::select! {
                maybe_result = result_rx.recv() => {
                    match maybe_result {
                        Some(Ok((data, codec, mut metadata, discovered))) => {
                            stats_tracker.received();
                            for (id, codec_name, rate) in discovered {
                                if tracks.get(&id.to_string()).is_none() {
                                    tracks.adopt(id.to_string(), TrackInfo { codec: codec_name, sample_rate: rate });
                                }
                            }
                            if !anchored {
                                anchored = true;
                                first_pts = metadata.timestamp_us;
                                let anchor = AV_CLOCK_MIN + PCR_OFFSET;
                                clock.rebase(anchor);
                                telemetry.emit("demux.clock_ref", serde_json::json!({ "anchor_ticks": anchor }));
                            }
                            if let (Some(first), Some(ts)) = (first_pts, metadata.timestamp_us) {
                                metadata.timestamp_us = Some(ts.saturating_sub(first));
                            }
                            let packet = Packet::Binary {
                                data,
                                content_type: Some(Cow::Owned(format!("application/x-streamkit-{codec}"))),
                                metadata: Some(metadata),
                            };
                            if context.output_sender.send("out", packet).await.is_err() {
                                break;
                            }
                            stats_tracker.sent();
                            stats_tracker.maybe_send();
                        }
                        Some(Err(e)) => {
                            stats_tracker.errored();
                            let err_msg = format!("demux error: {e}");
                            state_helpers::emit_failed(&context.state_tx, &node_name, &err_msg);
                            return Err(StreamKitError::Runtime(err_msg));
                        }
                        None => break,
                    }
                }
                Some(control_msg) = context.control_rx.recv() => {
                    match control_msg {
                        NodeControlMessage::Shutdown => {
                            input_task.abort();
                            break;
                        }
                        NodeControlMessage::SplitIterate { .. } => {
                            let track_list: Vec<serde_json::Value> = tracks
                                .iter()
                                .map(|(id, info)| serde_json::json!({
                                    "id": id, "codec": info.codec, "sample_rate": info.sample_rate,
                                }))
                                .collect();
                            telemetry.emit("demux.tracks", serde_json::json!({ "tracks": track_list }));
                        }
                        _ => {}
                    }
                }
                _ = &mut input_task, if !input_done => { input_done = true; }
            }
        }

        let _ = demux_task.await;
        state_helpers::emit_stopped(&context.state_tx, &node_name, "input_closed");
        Ok(())
    }
}

#[allow(clippy::cognitive_complexity)]
fn demux_streaming(
    reader: StreamingReader,
    format_hint: &str,
    track_id_cfg: Option<u32>,
    result_tx: &mpsc::Sender<DemuxEvent>,
) -> Result<(), String> {
    let source = ReadOnlySource::new(reader);
    let mss = MediaSourceStream::new(Box::new(source), MediaSourceStreamOptions::default());
    let mut hint = Hint::new();
    if !format_hint.is_empty() {
        hint.with_extension(format_hint);
    }
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| format!("probe failed: {e}"))?;
    let mut format_reader = probed.format;

    let discovered: Vec<DiscoveredTrack> = format_reader
        .tracks()
        .iter()
        .map(|t| (t.id, format!("{:?}", t.codec_params.codec), t.codec_params.sample_rate))
        .collect();

    let track = if let Some(id) = track_id_cfg {
        format_reader.tracks().iter().find(|t| t.id == id)
    } else {
        format_reader.default_track()
    }
    .ok_or_else(|| "no matching track found in container".to_string())?;

    let track_id = track.id;
    let codec_name = format!("{:?}", track.codec_params.codec);
    let time_base = track.codec_params.time_base;

    let mut sequence: u64 = 0;
    let mut first_batch = true;

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!("demux read error, stopping: {e}");
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let timestamp_us = time_base.map(|tb| {
            let secs = packet.ts as f64 * f64::from(tb.numer) / f64::from(tb.denom);
            (secs * 1_000_000.0) as u64
        });
        let metadata = PacketMetadata { timestamp_us, duration_us: None, sequence: Some(sequence) };
        sequence += 1;

        let batch = if first_batch { discovered.clone() } else { Vec::new() };
        first_batch = false;

        let data = Bytes::copy_from_slice(&packet.data);
        if result_tx.blocking_send(Ok((data, codec_name.clone(), metadata, batch))).is_err() {
            return Ok(());
        }
    }

    Ok(())
}

use schemars::schema_for;
use streamkit_core::{config_helpers, registry::StaticPins};

/// Registers the generic demux source node.
///
/// # Panics
///
/// Panics if the config schema cannot be serialized to JSON (should never happen).
#[allow(clippy::expect_used)]
pub fn register_demux_nodes(registry: &mut NodeRegistry) {
    #[cfg(feature = "demux")]
    {
        let default_node = DemuxSourceNode::new(DemuxSourceConfig::default());
        registry.register_static_with_description(
            "containers::demux",
            |params| {
                let config = config_helpers::parse_config_optional(params)?;
                Ok(Box::new(DemuxSourceNode::new(config)) as Box<dyn ProcessorNode>)
            },
            serde_json::to_value(schema_for!(DemuxSourceConfig))
                .expect("DemuxSourceConfig schema should serialize to JSON"),
            StaticPins { inputs: default_node.input_pins(), outputs: default_node.output_pins() },
            vec!["containers".to_string(), "demux".to_string()],
            false,
            "Demultiplexes a coded container stream (any format symphonia can probe) into \
             one selected track's coded access units, leaving decode to a separate decoder node. \
             Other tracks in the container stay discoverable via a SplitIterate control query.",
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_utils::{
        assert_state_initializing, assert_state_running, assert_state_stopped, create_test_binary_packet,
        create_test_context,
    };
    use std::collections::HashMap;
    use std::path::Path;
    use tokio::sync::mpsc;

    fn read_sample_file(filename: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/audio").join(filename);
        std::fs::read(&path).unwrap_or_else(|_| panic!("failed to read test file: {}", path.display()))
    }

    #[tokio::test]
    async fn demuxes_wav_into_coded_binary_packets() {
        let (input_tx, input_rx) = mpsc::channel(10);
        let mut inputs = HashMap::new();
        inputs.insert("in".to_string(), input_rx);
        let (context, mock_sender, mut state_rx) = create_test_context(inputs, 10);

        let node = DemuxSourceNode::new(DemuxSourceConfig::default());
        let handle = tokio::spawn(async move { Box::new(node).run(context).await });

        assert_state_initializing(&mut state_rx).await;
        assert_state_running(&mut state_rx).await;

        let wav_data = read_sample_file("sample.wav");
        input_tx.send(create_test_binary_packet(wav_data)).await.unwrap();
        drop(input_tx);

        assert_state_stopped(&mut state_rx).await;
        handle.await.unwrap().unwrap();

        let out = mock_sender.get_packets_for_pin("out").await;
        assert!(!out.is_empty(), "expected at least one coded packet");
        assert!(matches!(out[0], Packet::Binary { .. }));
    }
}
