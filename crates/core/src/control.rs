// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Control messages for node and engine management.
//!
//! This module defines messages used to control node lifecycle and modify
//! pipeline graphs at runtime:
//!
//! - [`NodeControlMessage`]: Messages sent to individual nodes to update parameters or control execution
//! - [`EngineControlMessage`]: Messages sent to the engine to modify the pipeline graph
//! - [`ConnectionMode`]: How a connection handles backpressure

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A message sent to a specific, running node to tune its parameters or control its lifecycle.
///
/// Variants below `SplitIterate` restate the pipe runtime's numeric control
/// commands (`SET_FLOW_DEF`, `GET_OUTPUT`, `SET_OUTPUT`, `REGISTER_REQUEST`,
/// `ATTACH_UPUMP_MGR`, ...) as a typed enum instead of a printf-style
/// variadic call. Per the runtime's own fallback rule, a node that doesn't
/// match a given variant in its control loop leaves it `UNHANDLED` rather
/// than erroring — most nodes only handle the handful relevant to them
/// (e.g. `codecs::decoder` handles `SetOutput`/`GetOutput`/`SetFlowDef`
/// against its [`crate::output_helper::OutputHelper`]).
#[derive(Debug, Deserialize, Serialize, TS)]
#[ts(export)]
pub enum NodeControlMessage {
    UpdateParams(#[ts(type = "JsonValue")] serde_json::Value),
    /// Start signal for source nodes waiting in Ready state.
    /// Tells the node to begin producing packets.
    Start,
    /// Shutdown signal for graceful termination.
    /// Nodes should clean up resources and exit their run loop when receiving this.
    Shutdown,
    /// Generic named-option get/set, for node-specific tunables that don't
    /// warrant their own variant (mirrors `UpdateParams` but scoped to one
    /// key instead of replacing the whole config). Used e.g. by
    /// `audio::crossblend` to switch its active input and by
    /// `transport::srt_sender` to trigger a passphrase rekey.
    SetOption { key: String, #[ts(type = "JsonValue")] value: serde_json::Value },
    /// Iterate the output pins a split/demux node currently exposes,
    /// driving dynamic-pin discovery after a stream format change.
    SplitIterate { after: Option<String> },
    /// `SET_FLOW_DEF(uref*)`: force-pushes a flow definition onto a node's
    /// output helper, bypassing the node's own format detection.
    SetFlowDef {
        def: String,
        #[ts(type = "JsonValue")]
        attrs: serde_json::Value,
    },
    /// `GET_OUTPUT(upipe**)`: asks the node to report the id currently
    /// attached to its primary output.
    GetOutput,
    /// `SET_OUTPUT(p)`: attaches (`Some`) or detaches (`None`) a node's
    /// primary output linkage.
    SetOutput { node_id: Option<String> },
    /// `REGISTER_REQUEST(urequest*)` / `UNREGISTER_REQUEST`: asks a node to
    /// (un)register an asynchronous capability request on its behalf.
    RegisterRequest { request_id: String },
    UnregisterRequest { request_id: String },
    /// `ATTACH_UPUMP_MGR` / `ATTACH_UCLOCK`: rebinds a node's event-loop or
    /// clock provider.
    AttachEventLoop,
    AttachClock,
    GetUri,
    SetUri { uri: String },
    GetOption { key: String },
    GetOutputSize,
    SetOutputSize { size: usize },
    /// `GET_SUB_MGR` / `ITERATE_SUB` / `SUB_GET_SUPER`: sub-pipe
    /// enumeration, for nodes exposing a [`crate::subpipe::SubpipeHost`].
    GetSubMgr,
    IterateSub { after: Option<String> },
    SubGetSuper,
}

/// Specifies how a connection handles backpressure from slow consumers.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Normal connection with synchronized backpressure.
    /// If the downstream consumer is slow, the upstream producer will wait.
    /// This ensures no packet loss but can stall the pipeline.
    #[default]
    Reliable,

    /// Best-effort connection that drops packets when the downstream buffer is full.
    /// Useful for observer outputs (metrics, UI, debug taps) that shouldn't stall
    /// the main data flow. Dropped packets are logged and counted in metrics.
    BestEffort,
}

/// A message sent to the central Engine actor to modify the pipeline graph itself.
#[derive(Debug)]
pub enum EngineControlMessage {
    AddNode {
        node_id: String,
        kind: String,
        params: Option<serde_json::Value>,
    },
    RemoveNode {
        node_id: String,
    },
    Connect {
        from_node: String,
        from_pin: String,
        to_node: String,
        to_pin: String,
        mode: ConnectionMode,
    },
    Disconnect {
        from_node: String,
        from_pin: String,
        to_node: String,
        to_pin: String,
    },
    TuneNode {
        node_id: String,
        message: NodeControlMessage,
    },
    Shutdown,
}
