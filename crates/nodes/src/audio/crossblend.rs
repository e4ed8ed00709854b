// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Glitch-free source switching: two audio inputs, exactly one "live" at a
//! time, with a linear crossfade over the switch so a failover between two
//! sources never pops. Mirrors the source's crossblend sub-pipe, which
//! exists for exactly this reason (e.g. switching between a primary and
//! backup encoder feed).

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::VecDeque;
use streamkit_core::clock::UCLOCK_FREQ;
use streamkit_core::control::NodeControlMessage;
use streamkit_core::stats::NodeStatsTracker;
use streamkit_core::types::{AudioFormat, AudioFrame, Packet, PacketType, SampleFormat};
use streamkit_core::{
    state_helpers, InputPin, NodeContext, NodeRegistry, OutputPin, PinCardinality, ProcessorNode,
    StreamKitError,
};

#[derive(Deserialize, Debug, Clone, JsonSchema)]
#[serde(default)]
pub struct CrossblendConfig {
    /// How long a switch takes to fully blend into the new source.
    pub crossblend_period_ms: u64,
}

impl Default for CrossblendConfig {
    fn default() -> Self {
        Self { crossblend_period_ms: 200 }
    }
}

/// Switches between `in_0` and `in_1`, blending linearly into the newly
/// active input over `crossblend_period_ms` whenever the active input
/// changes. Only one input is ever forwarded at a time; frames buffered on
/// the inactive input during a pending switch feed the blend.
pub struct CrossblendNode {
    config: CrossblendConfig,
}

impl CrossblendNode {
    pub const fn new(config: CrossblendConfig) -> Self {
        Self { config }
    }
}

/// Frames received on the input that isn't currently active, kept around so
/// a switch back to it can blend from something instead of silence.
type StandbyQueue = VecDeque<AudioFrame>;

#[async_trait]
impl ProcessorNode for CrossblendNode {
    fn input_pins(&self) -> Vec<InputPin> {
        vec![
            InputPin {
                name: "in_0".to_string(),
                accepts_types: vec![PacketType::RawAudio(AudioFormat {
                    sample_rate: 48000,
                    channels: 2,
                    sample_format: SampleFormat::F32,
                })],
                cardinality: PinCardinality::One,
            },
            InputPin {
                name: "in_1".to_string(),
                accepts_types: vec![PacketType::RawAudio(AudioFormat {
                    sample_rate: 48000,
                    channels: 2,
                    sample_format: SampleFormat::F32,
                })],
                cardinality: PinCardinality::One,
            },
        ]
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

        let mut in_0 = context.take_input("in_0")?;
        let mut in_1 = context.take_input("in_1")?;

        let period_ticks = self.config.crossblend_period_ms.max(1).saturating_mul(UCLOCK_FREQ) / 1000;

        // Source 0 is live at startup; nothing to blend from, so crossblend
        // starts already at 1.0 (fully the active source).
        let mut active: usize = 0;
        let mut standby: StandbyQueue = VecDeque::new();
        let mut crossblend: f64 = 1.0;

        state_helpers::emit_running(&context.state_tx, &node_name);
        let mut stats_tracker = NodeStatsTracker::new(node_name.clone(), context.stats_tx.clone());

        let mut in_0_open = true;
        let mut in_1_open = true;

        loop {
            tokio::select! {
                maybe = in_0.recv(), if in_0_open => {
                    match maybe {
                        Some(Packet::Audio(frame)) => {
                            stats_tracker.received();
                            if active == 0 {
                                emit_blended(&mut context, &node_name, &mut stats_tracker, frame, &mut standby, &mut crossblend, period_ticks).await?;
                            } else if standby.len() < 32 {
                                standby.push_back(frame);
                            }
                        }
                        Some(_) => {}
                        None => { in_0_open = false; }
                    }
                }
                maybe = in_1.recv(), if in_1_open => {
                    match maybe {
                        Some(Packet::Audio(frame)) => {
                            stats_tracker.received();
                            if active == 1 {
                                emit_blended(&mut context, &node_name, &mut stats_tracker, frame, &mut standby, &mut crossblend, period_ticks).await?;
                            } else if standby.len() < 32 {
                                standby.push_back(frame);
                            }
                        }
                        Some(_) => {}
                        None => { in_1_open = false; }
                    }
                }
                Some(control_msg) = context.control_rx.recv() => {
                    match control_msg {
                        NodeControlMessage::Shutdown => break,
                        NodeControlMessage::SetOption { key, value } if key == "active_input" => {
                            if let Some(requested) = value.as_u64() {
                                let requested = (requested.min(1)) as usize;
                                if requested != active {
                                    active = requested;
                                    standby.clear();
                                    crossblend = 0.0;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                else => break,
            }

            if !in_0_open && !in_1_open {
                break;
            }
        }

        state_helpers::emit_stopped(&context.state_tx, &node_name, "input_closed");
        Ok(())
    }
}

/// Blends `cur` (from the now-active input) against the oldest buffered
/// standby frame, advancing `crossblend` by one blend-period's worth of
/// samples at `cur`'s rate. Once `crossblend` reaches 1.0 the standby queue
/// is no longer needed and is dropped.
async fn emit_blended(
    context: &mut NodeContext,
    node_name: &str,
    stats: &mut NodeStatsTracker,
    cur: AudioFrame,
    standby: &mut StandbyQueue,
    crossblend: &mut f64,
    period_ticks: u64,
) -> Result<(), StreamKitError> {
    if period_ticks == 0 || *crossblend >= 1.0 {
        standby.clear();
        return send_frame(context, node_name, stats, cur).await;
    }

    let channels = cur.channels as usize;
    let step = UCLOCK_FREQ as f64 / (cur.sample_rate.max(1) as f64 * period_ticks as f64);
    let prev = standby.pop_front();

    let output = if let Some(prev_frame) = prev {
        let cur_samples = cur.samples();
        let prev_samples = prev_frame.samples();
        let num_frames = (cur_samples.len() / channels.max(1)).min(prev_samples.len() / channels.max(1));
        let mut out = cur_samples.to_vec();
        let mut blend = *crossblend;
        for frame_idx in 0..num_frames {
            let base = frame_idx * channels;
            for ch in 0..channels {
                let idx = base + ch;
                out[idx] = (cur_samples[idx] as f64 * blend + prev_samples[idx] as f64 * (1.0 - blend)) as f32;
            }
            blend = (blend + step).min(1.0);
        }
        *crossblend = blend;
        AudioFrame::with_metadata(cur.sample_rate, cur.channels, out, cur.metadata.clone())
    } else {
        let num_frames = cur.num_frames();
        *crossblend = (*crossblend + step * num_frames as f64).min(1.0);
        cur
    };

    if *crossblend >= 1.0 {
        standby.clear();
    }

    send_frame(context, node_name, stats, output).await
}

async fn send_frame(
    context: &mut NodeContext,
    node_name: &str,
    stats: &mut NodeStatsTracker,
    frame: AudioFrame,
) -> Result<(), StreamKitError> {
    if context.output_sender.send("out", Packet::Audio(frame)).await.is_err() {
        return Err(StreamKitError::Runtime(format!("{node_name}: output closed")));
    }
    stats.sent();
    stats.maybe_send();
    Ok(())
}

use schemars::schema_for;
use streamkit_core::{config_helpers, registry::StaticPins};

/// Registers the crossblend switcher node.
///
/// # Panics
///
/// Panics if the config schema cannot be serialized to JSON (should never happen).
#[allow(clippy::expect_used)]
pub fn register_crossblend_nodes(registry: &mut NodeRegistry) {
    let default_node = CrossblendNode::new(CrossblendConfig::default());
    registry.register_static_with_description(
        "audio::crossblend",
        |params| {
            let config = config_helpers::parse_config_optional(params)?;
            Ok(Box::new(CrossblendNode::new(config)) as Box<dyn ProcessorNode>)
        },
        serde_json::to_value(schema_for!(CrossblendConfig))
            .expect("CrossblendConfig schema should serialize to JSON"),
        StaticPins { inputs: default_node.input_pins(), outputs: default_node.output_pins() },
        vec!["audio".to_string(), "switching".to_string()],
        false,
        "Switches between two audio sources with a linear crossfade over the switch, \
         so failing over from a primary feed to a backup doesn't pop.",
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_utils::{
        assert_state_initializing, assert_state_running, assert_state_stopped, create_test_context,
    };
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn silence_frame(value: f32) -> Packet {
        Packet::Audio(AudioFrame::new(48000, 2, vec![value; 960 * 2]))
    }

    #[tokio::test]
    async fn forwards_active_input_unblended_at_steady_state() {
        let (tx0, rx0) = mpsc::channel(10);
        let (tx1, rx1) = mpsc::channel(10);
        let mut inputs = HashMap::new();
        inputs.insert("in_0".to_string(), rx0);
        inputs.insert("in_1".to_string(), rx1);
        let (context, mock_sender, mut state_rx) = create_test_context(inputs, 10);

        let node = CrossblendNode::new(CrossblendConfig::default());
        let handle = tokio::spawn(async move { Box::new(node).run(context).await });

        assert_state_initializing(&mut state_rx).await;
        assert_state_running(&mut state_rx).await;

        tx0.send(silence_frame(0.5)).await.unwrap();
        drop(tx0);
        drop(tx1);
        assert_state_stopped(&mut state_rx).await;
        handle.await.unwrap().unwrap();

        let out = mock_sender.get_packets_for_pin("out").await;
        assert_eq!(out.len(), 1);
        if let Packet::Audio(frame) = &out[0] {
            assert!((frame.samples()[0] - 0.5).abs() < 1e-6);
        } else {
            panic!("expected audio packet");
        }
    }

    #[tokio::test]
    async fn switch_blends_toward_new_source() {
        let (tx0, rx0) = mpsc::channel(10);
        let (tx1, rx1) = mpsc::channel(10);
        let mut inputs = HashMap::new();
        inputs.insert("in_0".to_string(), rx0);
        inputs.insert("in_1".to_string(), rx1);
        let (mut context, mock_sender, mut state_rx) = create_test_context(inputs, 10);

        let control_tx = {
            let (tx, rx) = mpsc::channel(4);
            context.control_rx = rx;
            tx
        };

        let node = CrossblendNode::new(CrossblendConfig { crossblend_period_ms: 200 });
        let handle = tokio::spawn(async move { Box::new(node).run(context).await });

        assert_state_initializing(&mut state_rx).await;
        assert_state_running(&mut state_rx).await;

        tx0.send(silence_frame(1.0)).await.unwrap();
        control_tx
            .send(NodeControlMessage::SetOption {
                key: "active_input".to_string(),
                value: serde_json::json!(1),
            })
            .await
            .unwrap();
        tx1.send(silence_frame(-1.0)).await.unwrap();

        drop(tx0);
        drop(tx1);
        drop(control_tx);
        assert_state_stopped(&mut state_rx).await;
        handle.await.unwrap().unwrap();

        let out = mock_sender.get_packets_for_pin("out").await;
        assert_eq!(out.len(), 2);
        if let Packet::Audio(frame) = &out[1] {
            // Blend just starting: output should sit strictly between the two
            // extremes rather than snapping straight to -1.0.
            assert!(frame.samples()[0] > -1.0);
        } else {
            panic!("expected audio packet");
        }
    }
}
