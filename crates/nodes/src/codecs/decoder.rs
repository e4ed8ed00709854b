// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A generic avcodec-style decoder: given an explicit codec identifier (not
//! a container probe — that's `containers::demux`'s job), decodes raw coded
//! access units into PCM. Packets arriving before the codec context finishes
//! opening are held in an [`InputBuffer`] rather than dropped; opening the
//! context itself is guarded by the pipeline's shared `Deal` (`NodeContext::deal`)
//! so a concurrent teardown elsewhere in the graph can't race a fresh open.
//! When the pipeline provides a shared `AudioFramePool`,
//! decoded samples are copied into pooled storage to amortize the
//! allocation, mirroring the mixer's direct-rendering convention.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use streamkit_core::control::NodeControlMessage;
use streamkit_core::flow::FlowDef;
use streamkit_core::frame_pool::AudioFramePool;
use streamkit_core::node::InputBuffer;
use streamkit_core::stats::NodeStatsTracker;
use streamkit_core::types::{AudioFrame, Packet, PacketMetadata, PacketType};
use streamkit_core::{
    state_helpers, InputPin, NodeContext, NodeRegistry, OutputPin, PinCardinality, ProcessorNode,
    StreamKitError,
};
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet as SymphoniaPacket;

#[derive(Deserialize, Debug, Clone, Copy, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecoderCodec {
    #[default]
    Flac,
    Mp3,
    PcmF32Le,
    PcmS16Le,
}

impl DecoderCodec {
    fn codec_type(self) -> symphonia::core::codecs::CodecType {
        use symphonia::core::codecs::{CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_S16LE};
        match self {
            Self::Flac => CODEC_TYPE_FLAC,
            Self::Mp3 => CODEC_TYPE_MP3,
            Self::PcmF32Le => CODEC_TYPE_PCM_F32LE,
            Self::PcmS16Le => CODEC_TYPE_PCM_S16LE,
        }
    }
}

#[derive(Deserialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct DecoderConfig {
    pub codec: DecoderCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// How many coded packets to hold in [`InputBuffer`] while the codec
    /// context is (re-)opening, evicting the oldest on overflow.
    pub pre_open_buffer: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { codec: DecoderCodec::default(), sample_rate: 48000, channels: 2, pre_open_buffer: 64 }
    }
}

/// Timestamp rebase state carried across packets, mirroring the source's
/// `next_pts`/`last_pts`/`iframe_rap`/`index_rap` bookkeeping: a missing
/// packet timestamp is filled in from `next_pts`, a timestamp that regresses
/// against the last one delivered is clamped forward instead of emitted
/// as-is, and every access unit's arrival rap is tracked relative to the most
/// recent keyframe-equivalent rap seen (for this decoder's codec set every
/// packet is independently decodable, so `iframe_rap` advances on every
/// packet rather than only on video keyframes).
#[derive(Debug, Default, Clone, Copy)]
struct TimestampRebase {
    next_pts: u64,
    last_pts: u64,
    iframe_rap: u64,
    index_rap: u64,
}

impl TimestampRebase {
    /// Resolve this packet's output timestamp and advance the rebase state.
    fn resolve(&mut self, declared_pts: Option<u64>) -> u64 {
        let mut pts = declared_pts.unwrap_or(self.next_pts);
        if pts < self.last_pts {
            tracing::warn!(pts, last_pts = self.last_pts, "decoder: regressive PTS clamped");
            pts = self.last_pts + 1;
        }
        self.last_pts = pts;
        self.iframe_rap = pts;
        self.index_rap += 1;
        pts
    }
}

/// Decodes coded access units of a known codec into PCM `AudioFrame`s.
pub struct DecoderNode {
    config: DecoderConfig,
}

impl DecoderNode {
    pub const fn new(config: DecoderConfig) -> Self {
        Self { config }
    }
}

fn channel_mask(channels: u16) -> Channels {
    match channels {
        1 => Channels::FRONT_LEFT,
        2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
        n => Channels::from_bits_truncate((1u32 << n.min(31)) - 1),
    }
}

fn build_codec_params(codec: DecoderCodec, sample_rate: u32, channels: u16) -> CodecParameters {
    let mut params = CodecParameters::new();
    params
        .for_codec(codec.codec_type())
        .with_sample_rate(sample_rate)
        .with_channels(channel_mask(channels));
    params
}

#[async_trait]
impl ProcessorNode for DecoderNode {
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
            produces_type: PacketType::Passthrough,
            cardinality: PinCardinality::Broadcast,
        }]
    }

    async fn run(self: Box<Self>, mut context: NodeContext) -> Result<(), StreamKitError> {
        let node_name = context.output_sender.node_name().to_string();
        state_helpers::emit_initializing(&context.state_tx, &node_name);

        let mut input_rx = context.take_input("in")?;
        let mut pre_open = InputBuffer::new(self.config.pre_open_buffer.max(1));
        let audio_pool = context.audio_pool.clone();

        let codec_params =
            build_codec_params(self.config.codec, self.config.sample_rate, self.config.channels);

        // The deal may already be held by a sibling pipe closing its own
        // codec context. Rather than block the packet path, race the wait
        // against incoming packets so anything that arrives before the deal
        // frees up lands in `pre_open` instead of being stalled upstream.
        let guard = loop {
            match context.deal.grab() {
                Ok(guard) => break guard,
                Err(_) => {
                    tokio::select! {
                        () = context.deal.wait_free() => {}
                        maybe = input_rx.recv() => {
                            match maybe {
                                Some(packet) => pre_open.push(packet),
                                None => {
                                    state_helpers::emit_stopped(&context.state_tx, &node_name, "input_closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
            }
        };
        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| StreamKitError::Codec(format!("failed to open decoder: {e}")))?;
        guard.release();

        state_helpers::emit_running(&context.state_tx, &node_name);
        let mut stats_tracker = NodeStatsTracker::new(node_name.clone(), context.stats_tx.clone());
        let mut rebase = TimestampRebase::default();
        let mut sequence: u64 = 0;

        // Anything that arrived while we were waiting for the deal replays
        // through the exact same decode path as live packets.
        while let Some(packet) = pre_open.pop() {
            decode_one(
                &mut decoder,
                packet,
                &mut context,
                &node_name,
                &mut stats_tracker,
                &mut rebase,
                &mut sequence,
                audio_pool.as_deref(),
            )
            .await?;
        }

        loop {
            tokio::select! {
                maybe = input_rx.recv() => {
                    match maybe {
                        Some(packet) => {
                            stats_tracker.received();
                            decode_one(&mut decoder, packet, &mut context, &node_name, &mut stats_tracker, &mut rebase, &mut sequence, audio_pool.as_deref()).await?;
                        }
                        None => break,
                    }
                }
                Some(control_msg) = context.control_rx.recv() => {
                    match control_msg {
                        NodeControlMessage::Shutdown => break,
                        NodeControlMessage::GetOutput => {
                            tracing::debug!(
                                node = %node_name,
                                output = ?context.output_helper.output_id(),
                                "GET_OUTPUT",
                            );
                        }
                        NodeControlMessage::SetOutput { node_id } => {
                            context.output_helper.set_output(node_id);
                        }
                        NodeControlMessage::SetFlowDef { def, attrs } => {
                            let mut flow_def = streamkit_core::flow::FlowDef::new(def);
                            if let serde_json::Value::Object(map) = attrs {
                                for (key, value) in map {
                                    flow_def.set_attr(key, streamkit_core::packet::AttrValue::String(value.to_string()));
                                }
                            }
                            context.output_helper.set_flow_def(flow_def);
                        }
                        _ => {}
                    }
                }
            }
        }

        // Drain any frames the codec still holds internally (e.g. MP3's
        // bit-reservoir lookahead) by feeding it empty packets until it stops
        // producing output, before closing under the shared deal.
        loop {
            let flush_packet = SymphoniaPacket::new_from_slice(0, rebase.next_pts, 0, &[]);
            match decoder.decode(&flush_packet) {
                Ok(audio_buf) if audio_buf.frames() > 0 => {
                    emit_decoded(audio_buf, &mut context, &node_name, &mut stats_tracker, &mut rebase, &mut sequence, audio_pool.as_deref(), None, None).await?;
                }
                _ => break,
            }
        }
        let guard = context.deal.grab().map_err(|e| StreamKitError::Busy(e.to_string()))?;
        decoder.finalize();
        guard.release();
        state_helpers::emit_stopped(&context.state_tx, &node_name, "input_closed");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn decode_one(
    decoder: &mut Box<dyn symphonia::core::codecs::Decoder>,
    packet: Packet,
    context: &mut NodeContext,
    node_name: &str,
    stats: &mut NodeStatsTracker,
    rebase: &mut TimestampRebase,
    sequence: &mut u64,
    audio_pool: Option<&AudioFramePool>,
) -> Result<(), StreamKitError> {
    let Packet::Binary { data, metadata, .. } = packet else {
        return Ok(());
    };
    let declared_pts = metadata.as_ref().and_then(|m| m.timestamp_us);
    let ts = rebase.resolve(declared_pts);
    let duration_us = metadata.and_then(|m| m.duration_us);
    let symphonia_packet = SymphoniaPacket::new_from_slice(0, ts, 0, &data);

    match decoder.decode(&symphonia_packet) {
        Ok(audio_buf) => {
            emit_decoded(
                audio_buf, context, node_name, stats, rebase, sequence, audio_pool, Some(ts),
                duration_us,
            )
            .await?;
        }
        Err(SymphoniaError::DecodeError(e)) => {
            tracing::warn!("{node_name}: decode error (continuing): {e}");
            stats.errored();
        }
        Err(e) => {
            return Err(StreamKitError::Codec(format!("decode failed: {e}")));
        }
    }
    Ok(())
}

/// Converts one decoded `AudioBufferRef` into an `AudioFrame` and sends it
/// downstream, advancing the timestamp rebase state. `ts` is the resolved
/// output timestamp for a live packet; flush calls (draining delayed frames
/// at close) pass `None` and let `rebase.next_pts` carry the timeline
/// forward instead.
///
/// Sends through [`NodeContext::send_with_flow_def`] with the codec's
/// actually-reported rate/channels rather than the configured ones: a
/// variable-bitrate or multi-SPS source can report a different format
/// mid-stream (e.g. a sample-rate change), and the output helper pushes
/// one `SET_FLOW_DEF` exactly on that transition rather than on every frame.
#[allow(clippy::too_many_arguments)]
async fn emit_decoded(
    audio_buf: symphonia::core::audio::AudioBufferRef<'_>,
    context: &mut NodeContext,
    node_name: &str,
    stats: &mut NodeStatsTracker,
    rebase: &mut TimestampRebase,
    sequence: &mut u64,
    audio_pool: Option<&AudioFramePool>,
    ts: Option<u64>,
    duration_us: Option<u64>,
) -> Result<(), StreamKitError> {
    let ts = ts.unwrap_or(rebase.next_pts);
    let spec = *audio_buf.spec();
    let channels = u16::try_from(spec.channels.count()).unwrap_or(u16::MAX).max(1);
    let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
    sample_buf.copy_interleaved_ref(audio_buf);
    let decoded = sample_buf.samples();

    let metadata =
        Some(PacketMetadata { timestamp_us: Some(ts), duration_us, sequence: Some(*sequence) });
    let frame = if let Some(pool) = audio_pool {
        let mut pooled = pool.get(decoded.len());
        pooled.as_mut_slice()[..decoded.len()].copy_from_slice(decoded);
        AudioFrame::from_pooled(spec.rate, channels, pooled, metadata)
    } else {
        AudioFrame::with_metadata(spec.rate, channels, decoded.to_vec(), metadata)
    };
    *sequence += 1;

    let frame_len = decoded.len() / usize::from(channels);
    let frame_us = if spec.rate > 0 { (frame_len as u64 * 1_000_000) / u64::from(spec.rate) } else { 0 };
    rebase.next_pts = ts.saturating_add(frame_us);

    let flow_def = FlowDef::sound("f32", spec.rate, channels);
    if context.send_with_flow_def("out", flow_def, Packet::Audio(frame)).await.is_err() {
        return Err(StreamKitError::Runtime(format!("{node_name}: output closed")));
    }
    stats.sent();
    stats.maybe_send();
    Ok(())
}

use schemars::schema_for;
use streamkit_core::{config_helpers, registry::StaticPins};

/// Registers the generic decoder node.
///
/// # Panics
///
/// Panics if the config schema cannot be serialized to JSON (should never happen).
#[allow(clippy::expect_used)]
pub fn register_decoder_nodes(registry: &mut NodeRegistry) {
    #[cfg(feature = "decoder")]
    {
        let default_node = DecoderNode::new(DecoderConfig::default());
        registry.register_static_with_description(
            "codecs::decoder",
            |params| {
                let config = config_helpers::parse_config_optional(params)?;
                Ok(Box::new(DecoderNode::new(config)) as Box<dyn ProcessorNode>)
            },
            serde_json::to_value(schema_for!(DecoderConfig))
                .expect("DecoderConfig schema should serialize to JSON"),
            StaticPins { inputs: default_node.input_pins(), outputs: default_node.output_pins() },
            vec!["codecs".to_string(), "decode".to_string()],
            false,
            "Decodes coded access units of an explicitly configured codec into PCM audio frames.",
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
    use bytes::Bytes;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn unknown_pcm_packet_passes_through_as_audio() {
        let (input_tx, input_rx) = mpsc::channel(10);
        let mut inputs = HashMap::new();
        inputs.insert("in".to_string(), input_rx);
        let (context, mock_sender, mut state_rx) = create_test_context(inputs, 10);

        let node = DecoderNode::new(DecoderConfig {
            codec: DecoderCodec::PcmF32Le,
            sample_rate: 48000,
            channels: 1,
            pre_open_buffer: 8,
        });
        let handle = tokio::spawn(async move { Box::new(node).run(context).await });

        assert_state_initializing(&mut state_rx).await;
        assert_state_running(&mut state_rx).await;

        let samples: Vec<f32> = vec![0.25, -0.25, 0.5, -0.5];
        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        input_tx
            .send(Packet::Binary { data: Bytes::from(bytes), content_type: None, metadata: None })
            .await
            .unwrap();
        drop(input_tx);

        assert_state_stopped(&mut state_rx).await;
        handle.await.unwrap().unwrap();

        let out = mock_sender.get_packets_for_pin("out").await;
        assert!(out.len() >= 2, "expected a flow-def push followed by at least one audio packet");
        assert!(
            matches!(&out[0], Packet::Custom(data) if data.type_id == "core::flow/set-flow-def@1"),
            "first packet on a fresh output should be the pushed flow def, got {:?}",
            out[0]
        );
        assert!(out[1..].iter().all(|p| matches!(p, Packet::Audio(_))));
    }

    #[tokio::test]
    async fn unchanged_flow_def_is_pushed_only_once() {
        let (input_tx, input_rx) = mpsc::channel(10);
        let mut inputs = HashMap::new();
        inputs.insert("in".to_string(), input_rx);
        let (context, mock_sender, mut state_rx) = create_test_context(inputs, 10);

        let node = DecoderNode::new(DecoderConfig {
            codec: DecoderCodec::PcmF32Le,
            sample_rate: 48000,
            channels: 1,
            pre_open_buffer: 8,
        });
        let handle = tokio::spawn(async move { Box::new(node).run(context).await });

        assert_state_initializing(&mut state_rx).await;
        assert_state_running(&mut state_rx).await;

        for _ in 0..3 {
            let samples: Vec<f32> = vec![0.1, -0.1];
            let mut bytes = Vec::with_capacity(samples.len() * 4);
            for s in &samples {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
            input_tx
                .send(Packet::Binary { data: Bytes::from(bytes), content_type: None, metadata: None })
                .await
                .unwrap();
        }
        drop(input_tx);

        assert_state_stopped(&mut state_rx).await;
        handle.await.unwrap().unwrap();

        let out = mock_sender.get_packets_for_pin("out").await;
        let flow_def_pushes =
            out.iter().filter(|p| matches!(p, Packet::Custom(d) if d.type_id == "core::flow/set-flow-def@1")).count();
        assert_eq!(flow_def_pushes, 1, "a stable flow def should push SET_FLOW_DEF exactly once");
    }
}
