//! Recorded states and the simulation result.
//!
//! A [`State`] is an immutable snapshot taken once per completed step. The
//! [`StateRecorder`] owns the sequence while the engine runs and hands it to
//! the [`SimulationResult`] at the end.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::chip::Chip;
use crate::droplet::{Droplet, DropletPosition, DropletState, Injection};
use crate::fluid::Fluid;
use crate::id::{ChannelId, DropletId, FluidId, NodeId};
use crate::resistance::ResistanceModelKind;
use crate::sim::StateHash;
use crate::solver::FlowField;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Pressures, flow rates and droplet positions at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub id: u64,
    pub time: f64,
    pub pressures: BTreeMap<NodeId, f64>,
    /// Keyed by channel or pump id. Both share one id space.
    pub flow_rates: BTreeMap<u32, f64>,
    pub droplet_positions: BTreeMap<DropletId, DropletPosition>,
}

impl State {
    pub fn pressure(&self, node: NodeId) -> Option<f64> {
        self.pressures.get(&node).copied()
    }

    /// Pressure at `node0` minus pressure at `node1`.
    pub fn pressure_drop(&self, node0: NodeId, node1: NodeId) -> Option<f64> {
        Some(self.pressure(node0)? - self.pressure(node1)?)
    }

    pub fn flow_rate(&self, id: impl Into<u32>) -> Option<f64> {
        self.flow_rates.get(&id.into()).copied()
    }

    pub fn droplet_position(&self, droplet: DropletId) -> Option<&DropletPosition> {
        self.droplet_positions.get(&droplet)
    }

    /// Droplets listed in this state with the given lifecycle state.
    pub fn droplets_in(&self, state: DropletState) -> impl Iterator<Item = DropletId> + '_ {
        self.droplet_positions
            .iter()
            .filter(move |(_, p)| p.state == state)
            .map(|(id, _)| *id)
    }

    /// Deterministic hash of every recorded quantity.
    pub fn hash(&self) -> StateHash {
        let mut h = StateHash::new();
        h.write_u64(self.id);
        h.write_f64(self.time);
        for (node, p) in &self.pressures {
            h.write_i32(node.0);
            h.write_f64(*p);
        }
        for (id, q) in &self.flow_rates {
            h.write_u32(*id);
            h.write_f64(*q);
        }
        for (id, position) in &self.droplet_positions {
            h.write_u32(id.0);
            h.write_u32(position.state as u32);
            for b in &position.boundaries {
                h.write_u32(b.channel_id().0);
                h.write_f64(b.position.position);
                h.write_u32(b.volume_towards0 as u32);
                h.write_f64(b.flow_rate);
                h.write_u32(b.state as u32);
            }
            for c in &position.channel_ids {
                h.write_u32(c.0);
            }
        }
        h
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// How many recorded states a run keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StateRetention {
    #[default]
    All,
    /// Only the most recent `n` states.
    Last(usize),
}

/// Owns the state sequence of a run. State ids stay sequential even when
/// older states are dropped.
#[derive(Debug, Clone, Default)]
pub struct StateRecorder {
    retention: StateRetention,
    states: VecDeque<State>,
    next_id: u64,
}

impl StateRecorder {
    pub fn new(retention: StateRetention) -> Self {
        Self {
            retention,
            states: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Append a snapshot and return its id.
    pub fn record(
        &mut self,
        time: f64,
        flow: &FlowField,
        droplet_positions: BTreeMap<DropletId, DropletPosition>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let mut flow_rates: BTreeMap<u32, f64> = flow
            .channel_flows
            .iter()
            .map(|(id, q)| (id.0, *q))
            .collect();
        flow_rates.extend(flow.pump_flows.iter().map(|(id, q)| (id.0, *q)));

        self.states.push_back(State {
            id,
            time,
            pressures: flow.pressures.clone(),
            flow_rates,
            droplet_positions,
        });
        if let StateRetention::Last(n) = self.retention {
            while self.states.len() > n {
                self.states.pop_front();
            }
        }
        id
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Number of states recorded, including dropped ones.
    pub fn recorded(&self) -> u64 {
        self.next_id
    }

    pub fn last(&self) -> Option<&State> {
        self.states.back()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }

    pub fn into_states(self) -> Vec<State> {
        self.states.into()
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Everything a simulation run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub continuous_phase_id: FluidId,
    pub maximal_adaptive_time_step: f64,
    pub resistance_model: ResistanceModelKind,
    pub chip: Chip,
    pub fluids: Vec<Fluid>,
    pub droplets: Vec<Droplet>,
    pub injections: Vec<Injection>,
    pub states: Vec<State>,
}

/// The channels a droplet occupied from `time` on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropletPathStep {
    pub time: f64,
    pub channel_ids: Vec<ChannelId>,
}

/// Sequence of channel sets a droplet travelled through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletPath {
    pub droplet: DropletId,
    pub steps: Vec<DropletPathStep>,
}

impl SimulationResult {
    pub fn droplet(&self, id: DropletId) -> Option<&Droplet> {
        self.droplets.iter().find(|d| d.id == id)
    }

    pub fn fluid(&self, id: FluidId) -> Option<&Fluid> {
        self.fluids.iter().find(|f| f.id == id)
    }

    pub fn last_state(&self) -> Option<&State> {
        self.states.last()
    }

    /// Channels occupied by `droplet` in every state where it is in the
    /// network, without consecutive repeats.
    pub fn droplet_path(&self, droplet: DropletId) -> DropletPath {
        let mut steps: Vec<DropletPathStep> = Vec::new();
        for state in &self.states {
            let Some(position) = state.droplet_position(droplet) else {
                continue;
            };
            if !matches!(position.state, DropletState::Network | DropletState::Trapped) {
                continue;
            }
            if steps.last().is_some_and(|s| s.channel_ids == position.channel_ids) {
                continue;
            }
            steps.push(DropletPathStep {
                time: state.time,
                channel_ids: position.channel_ids.clone(),
            });
        }
        DropletPath { droplet, steps }
    }

    /// Lifecycle states of `droplet` across the recorded states, without
    /// consecutive repeats.
    pub fn droplet_lifecycle(&self, droplet: DropletId) -> Vec<DropletState> {
        let mut lifecycle: Vec<DropletState> = Vec::new();
        for state in &self.states {
            if let Some(position) = state.droplet_position(droplet) {
                if lifecycle.last() != Some(&position.state) {
                    lifecycle.push(position.state);
                }
            }
        }
        lifecycle
    }
}

// ===========================================================================
// Tests
// ===========================================================================
