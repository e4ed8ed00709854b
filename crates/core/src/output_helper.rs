// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The output helper: tracks a pipe's downstream linkage and current flow
//! definition so that `output(uref)` can decide, on every outgoing buffer,
//! whether to drop it, raise a `need-output` event, push a flow-definition
//! change before forwarding, or forward straight through.
//!
//! One [`OutputHelper`] is owned per output pin. It does not hold the
//! downstream sender itself (that's [`crate::node::OutputSender`]'s job) —
//! it only holds the negotiation state that governs whether a send should
//! happen at all.

use crate::flow::FlowDef;

/// Negotiation state between a pipe's output and whatever is currently
/// attached downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// No flow def has been pushed to the current output yet.
    None,
    /// The current flow def has been pushed and accepted.
    Valid,
    /// The current flow def was pushed and rejected; further urefs drop
    /// until a new flow def or a new output arrives.
    Invalid,
}

/// What [`OutputHelper::output`] decided to do with an outgoing uref.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputDecision {
    /// No flow def has ever been set; the uref is dropped and logged.
    DroppedNoFlowDef,
    /// Nothing is attached downstream; the caller should raise a
    /// `need-output(flow_def)` probe and drop the uref.
    NeedOutput(FlowDef),
    /// The uref should be forwarded. `push_flow_def` is `Some` exactly on
    /// the transition out of `None`, meaning the caller must push
    /// `SET_FLOW_DEF` to the output before (or together with) the uref.
    Forward { push_flow_def: Option<FlowDef> },
    /// The output rejected the current flow def; the uref is dropped.
    DroppedInvalid,
}

/// `{output pipe, current flow def, state, pending requests}` from the
/// pipe runtime's output helper. This type owns the first three; pending
/// request bookkeeping lives in [`crate::request::RequestChain`] since it's
/// keyed by capability kind rather than by output pin.
#[derive(Debug, Default)]
pub struct OutputHelper {
    /// Identifies whatever is currently attached downstream (a node id, a
    /// pin address, ...). `None` means nothing is attached.
    output_id: Option<String>,
    flow_def: Option<FlowDef>,
    state: OutputState,
}

impl Default for OutputState {
    fn default() -> Self {
        Self::None
    }
}

impl OutputHelper {
    #[must_use]
    pub fn new() -> Self {
        Self { output_id: None, flow_def: None, state: OutputState::None }
    }

    /// `GET_OUTPUT`.
    #[must_use]
    pub fn output_id(&self) -> Option<&str> {
        self.output_id.as_deref()
    }

    #[must_use]
    pub fn flow_def(&self) -> Option<&FlowDef> {
        self.flow_def.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> OutputState {
        self.state
    }

    /// `SET_OUTPUT(p)`. Changing (or clearing) the output unregisters all
    /// pending requests from the old output and resets negotiation state,
    /// so the next `output()` call re-pushes `SET_FLOW_DEF` to whatever is
    /// now attached.
    pub fn set_output(&mut self, output_id: Option<String>) {
        self.output_id = output_id;
        self.state = OutputState::None;
    }

    /// Stores a new flow def. Storing one that structurally equals the
    /// current one is a no-op on state; storing a genuinely different one
    /// (or the first one) resets state to `none`.
    pub fn set_flow_def(&mut self, flow_def: FlowDef) {
        if self.flow_def.as_ref() == Some(&flow_def) {
            return;
        }
        self.flow_def = Some(flow_def);
        self.state = OutputState::None;
    }

    /// The output rejected the pushed flow def.
    pub fn reject(&mut self) {
        self.state = OutputState::Invalid;
    }

    /// `output(uref)`: decide what to do with an outgoing buffer given the
    /// current flow def / output / state.
    pub fn output(&mut self) -> OutputDecision {
        let Some(flow_def) = self.flow_def.clone() else {
            return OutputDecision::DroppedNoFlowDef;
        };
        if self.output_id.is_none() {
            return OutputDecision::NeedOutput(flow_def);
        }
        match self.state {
            OutputState::None => {
                self.state = OutputState::Valid;
                OutputDecision::Forward { push_flow_def: Some(flow_def) }
            }
            OutputState::Valid => OutputDecision::Forward { push_flow_def: None },
            OutputState::Invalid => OutputDecision::DroppedInvalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flow_def_drops() {
        let mut helper = OutputHelper::new();
        assert_eq!(helper.output(), OutputDecision::DroppedNoFlowDef);
    }

    #[test]
    fn no_output_raises_need_output() {
        let mut helper = OutputHelper::new();
        let flow_def = FlowDef::sound("f32", 48000, 2);
        helper.set_flow_def(flow_def.clone());
        assert_eq!(helper.output(), OutputDecision::NeedOutput(flow_def));
    }

    #[test]
    fn first_output_after_flow_def_pushes_then_forwards() {
        let mut helper = OutputHelper::new();
        let flow_def = FlowDef::sound("f32", 48000, 2);
        helper.set_flow_def(flow_def.clone());
        helper.set_output(Some("sink".to_string()));

        assert_eq!(helper.output(), OutputDecision::Forward { push_flow_def: Some(flow_def) });
        assert_eq!(helper.state(), OutputState::Valid);
        assert_eq!(helper.output(), OutputDecision::Forward { push_flow_def: None });
    }

    #[test]
    fn structurally_equal_flow_def_is_a_no_op_on_state() {
        let mut helper = OutputHelper::new();
        helper.set_flow_def(FlowDef::sound("f32", 48000, 2));
        helper.set_output(Some("sink".to_string()));
        helper.output(); // transitions to Valid

        helper.set_flow_def(FlowDef::sound("f32", 48000, 2));
        assert_eq!(helper.state(), OutputState::Valid);
        assert_eq!(helper.output(), OutputDecision::Forward { push_flow_def: None });
    }

    #[test]
    fn genuinely_new_flow_def_resets_to_none() {
        let mut helper = OutputHelper::new();
        helper.set_flow_def(FlowDef::sound("f32", 48000, 2));
        helper.set_output(Some("sink".to_string()));
        helper.output(); // transitions to Valid

        let new_def = FlowDef::sound("f32", 44100, 2);
        helper.set_flow_def(new_def.clone());
        assert_eq!(helper.state(), OutputState::None);
        assert_eq!(helper.output(), OutputDecision::Forward { push_flow_def: Some(new_def) });
    }

    #[test]
    fn rejected_flow_def_drops_until_replaced() {
        let mut helper = OutputHelper::new();
        helper.set_flow_def(FlowDef::sound("f32", 48000, 2));
        helper.set_output(Some("sink".to_string()));
        helper.output();
        helper.reject();
        assert_eq!(helper.output(), OutputDecision::DroppedInvalid);

        helper.set_flow_def(FlowDef::sound("f32", 44100, 2));
        assert!(matches!(helper.output(), OutputDecision::Forward { .. }));
    }

    #[test]
    fn set_output_then_get_output_round_trips() {
        let mut helper = OutputHelper::new();
        helper.set_output(Some("sink-1".to_string()));
        assert_eq!(helper.output_id(), Some("sink-1"));
    }
}
