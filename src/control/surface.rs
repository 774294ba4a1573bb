//! Control surface.
//!
//! Holds the control actions of a session and turns incoming controls into
//! queued [`ParameterChange`]s. Controls arrive on the MIDI thread; the
//! control thread drains the queue in its update pass and forwards the
//! changes to the graph.

use parking_lot::Mutex;

use crate::dsp::midi::{MidiMessage, TimestampedMidiMessage};
use crate::engine::commands::NodeId;
use crate::engine::dispatcher::{MidiListener, MidiSource};

use super::action::{ControlAction, ControlSource, ControlTarget, ParameterChange};

/// Maps external controls onto node parameters.
#[derive(Default)]
pub struct ControlSurface {
    actions: Mutex<Vec<ControlAction>>,
    pending: Mutex<Vec<ParameterChange>>,
    learn_target: Mutex<Option<ControlTarget>>,
}

impl ControlSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_action(&self, action: ControlAction) {
        self.actions.lock().push(action);
    }

    /// A copy of the current actions.
    pub fn actions(&self) -> Vec<ControlAction> {
        self.actions.lock().clone()
    }

    /// Replaces every action.
    pub fn set_actions(&self, actions: Vec<ControlAction>) {
        *self.actions.lock() = actions;
    }

    /// Removes every action driving `target`. Returns how many were removed.
    pub fn remove_actions_for_target(&self, target: ControlTarget) -> usize {
        let mut actions = self.actions.lock();
        let before = actions.len();
        actions.retain(|action| action.target != target);
        before - actions.len()
    }

    /// Arms MIDI learn: the next control change received is bound to `target`.
    pub fn learn(&self, target: ControlTarget) {
        *self.learn_target.lock() = Some(target);
    }

    pub fn cancel_learn(&self) {
        *self.learn_target.lock() = None;
    }

    pub fn is_learning(&self) -> bool {
        self.learn_target.lock().is_some()
    }

    /// Handles a control change. `value` is the raw 7-bit CC value.
    pub fn handle_cc(&self, channel: u8, controller: u8, value: u8) {
        if let Some(target) = self.learn_target.lock().take() {
            tracing::info!(channel, controller, node = target.node, "learned control");
            self.add_action(ControlAction::new(
                ControlSource::MidiCc {
                    channel: Some(channel),
                    controller,
                },
                target,
            ));
            return;
        }

        let normalized = f32::from(value.min(127)) / 127.0;
        let actions = self.actions.lock();
        let mut pending = self.pending.lock();
        pending.extend(
            actions
                .iter()
                .filter(|action| action.matches_cc(channel, controller))
                .map(|action| change_for(action, normalized)),
        );
    }

    /// Handles a parameter of `node` changing to `value` (normalized).
    pub fn handle_parameter_change(&self, node: NodeId, index: usize, value: f32) {
        let actions = self.actions.lock();
        let mut pending = self.pending.lock();
        pending.extend(
            actions
                .iter()
                .filter(|action| action.matches_parameter(node, index))
                .map(|action| change_for(action, value)),
        );
    }

    /// Takes every queued change, oldest first.
    pub fn drain_changes(&self) -> Vec<ParameterChange> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Drops actions and queued changes referencing `node`. Returns the
    /// number of actions removed.
    pub fn prune_node(&self, node: NodeId) -> usize {
        let mut actions = self.actions.lock();
        let before = actions.len();
        actions.retain(|action| !action.references(node));
        self.pending.lock().retain(|change| change.node != node);
        let mut learn_target = self.learn_target.lock();
        if matches!(*learn_target, Some(target) if target.node == node) {
            *learn_target = None;
        }
        before - actions.len()
    }
}

fn change_for(action: &ControlAction, normalized: f32) -> ParameterChange {
    ParameterChange {
        node: action.target.node,
        parameter: action.target.parameter,
        value: action.map_value(normalized),
    }
}

impl MidiListener for ControlSurface {
    fn handle_incoming_midi_message(&self, _source: &MidiSource, message: &TimestampedMidiMessage) {
        if let MidiMessage::ControlChange {
            channel,
            controller,
            value,
        } = message.message
        {
            self.handle_cc(channel, controller, value);
        }
    }
}
