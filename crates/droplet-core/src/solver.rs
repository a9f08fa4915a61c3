//! Flow solver: modified nodal analysis of the channel network.
//!
//! The network is the hydraulic analogue of a resistor circuit. Pressure
//! plays the role of voltage and volumetric flow that of current.
//!
//! # Design
//!
//! - Unknowns are the pressure of every non-ground node followed by the flow
//!   of every pressure pump. Grounds are fixed at zero and get no row.
//! - A channel stamps its conductance `1/R` into the four node entries.
//! - A flow-rate pump is a current source: `-q` at node0, `+q` at node1.
//! - A pressure pump adds a constraint row `p1 - p0 = P` and a column that
//!   carries its flow out of node0 and into node1.
//! - The node index is built once per chip by [`NodalSystem::new`], which
//!   also rejects nodes that have no path to ground. [`NodalSystem::solve`]
//!   is then called every step with fresh resistances.
//! - The dense system is factorised with `nalgebra`'s LU decomposition.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use nalgebra::{DMatrix, DVector};

use crate::chip::Chip;
use crate::id::{ChannelId, NodeId, PumpId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while building or solving the nodal system.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("network has no ground node")]
    NoGround,
    #[error("nodes without a path to ground: {0:?}")]
    Floating(Vec<NodeId>),
    #[error("channel {channel:?} has invalid resistance {resistance}")]
    InvalidResistance { channel: ChannelId, resistance: f64 },
    #[error("singular nodal system with {unknowns} unknowns")]
    Singular { unknowns: usize },
    #[error("nodal system produced non-finite values")]
    NonFinite,
}

// ---------------------------------------------------------------------------
// Flow field
// ---------------------------------------------------------------------------

/// Flows smaller than this fraction of the largest pump flow are solver
/// round-off and count as no flow at all.
pub const NEGLIGIBLE_FLOW: f64 = 1e-12;

/// Pressures and flow rates of one solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowField {
    /// Pressure of every node, grounds included (0).
    pub pressures: BTreeMap<NodeId, f64>,
    /// Flow of every channel, positive from node0 to node1.
    pub channel_flows: BTreeMap<ChannelId, f64>,
    /// Flow of every pump, positive when fluid enters the pump at node0 and
    /// leaves it at node1. Both pump kinds share this direction, so a
    /// pressure pump raising the pressure of node1 reports a positive flow
    /// while it feeds the network through node1.
    pub pump_flows: BTreeMap<PumpId, f64>,
}

impl FlowField {
    /// Flow rate of a channel, zero for unknown ids.
    pub fn channel_flow(&self, channel: ChannelId) -> f64 {
        self.channel_flows.get(&channel).copied().unwrap_or(0.0)
    }

    /// Pressure at a node, zero for unknown ids.
    pub fn pressure(&self, node: NodeId) -> f64 {
        self.pressures.get(&node).copied().unwrap_or(0.0)
    }

    /// Magnitude at or below which a flow is treated as zero.
    ///
    /// Scaled by the largest pump flow, or by the largest channel flow on a
    /// chip whose pumps carry nothing. Zero when nothing flows at all.
    pub fn zero_flow_threshold(&self) -> f64 {
        let pumps = largest_magnitude(&self.pump_flows);
        let reference = if pumps > 0.0 {
            pumps
        } else {
            largest_magnitude(&self.channel_flows)
        };
        NEGLIGIBLE_FLOW * reference
    }

    /// Whether `q` is indistinguishable from no flow.
    pub fn is_negligible(&self, q: f64) -> bool {
        q.abs() <= self.zero_flow_threshold()
    }

    /// Flow leaving `node` through `channel` (negative when entering).
    pub fn outflow_at(&self, chip: &Chip, channel: ChannelId, node: NodeId) -> f64 {
        match chip.channel(channel) {
            Some(c) if c.node0_id == node => self.channel_flow(channel),
            Some(c) if c.node1_id == node => -self.channel_flow(channel),
            _ => 0.0,
        }
    }
}

fn largest_magnitude<K>(flows: &BTreeMap<K, f64>) -> f64 {
    flows.values().fold(0.0, |m: f64, q| m.max(q.abs()))
}

// ---------------------------------------------------------------------------
// Nodal system
// ---------------------------------------------------------------------------

/// Row/column layout of the nodal system for one chip.
#[derive(Debug, Clone)]
pub struct NodalSystem {
    /// Matrix index of each non-ground node.
    node_index: BTreeMap<NodeId, usize>,
    /// Pressure pumps in row order, after the node rows.
    pressure_pumps: Vec<PumpId>,
}

impl NodalSystem {
    /// Index the chip's nodes and check that every node can reach a ground
    /// through channels or pressure pumps.
    pub fn new(chip: &Chip) -> Result<Self, SolverError> {
        let grounds: BTreeSet<NodeId> = chip.grounds().filter(|g| chip.contains_node(*g)).collect();
        if grounds.is_empty() {
            return Err(SolverError::NoGround);
        }

        let floating = floating_nodes(chip, &grounds);
        if !floating.is_empty() {
            return Err(SolverError::Floating(floating));
        }

        let node_index = chip
            .nodes()
            .filter(|n| !grounds.contains(n))
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let pressure_pumps = chip.pressure_pumps().map(|p| p.id).collect();

        Ok(Self {
            node_index,
            pressure_pumps,
        })
    }

    /// Number of unknowns (non-ground nodes plus pressure pumps).
    pub fn unknowns(&self) -> usize {
        self.node_index.len() + self.pressure_pumps.len()
    }

    /// Solve for pressures and flows given per-channel total resistances.
    pub fn solve(
        &self,
        chip: &Chip,
        resistances: &BTreeMap<ChannelId, f64>,
    ) -> Result<FlowField, SolverError> {
        let size = self.unknowns();
        let node_rows = self.node_index.len();
        let mut a = DMatrix::<f64>::zeros(size, size);
        let mut z = DVector::<f64>::zeros(size);
        let idx = |n: NodeId| self.node_index.get(&n).copied();

        for channel in chip.channels() {
            let r = resistances.get(&channel.id).copied().unwrap_or(f64::NAN);
            if !(r.is_finite() && r > 0.0) {
                return Err(SolverError::InvalidResistance {
                    channel: channel.id,
                    resistance: r,
                });
            }
            let g = 1.0 / r;
            let i0 = idx(channel.node0_id);
            let i1 = idx(channel.node1_id);
            if let Some(i) = i0 {
                a[(i, i)] += g;
            }
            if let Some(j) = i1 {
                a[(j, j)] += g;
            }
            if let (Some(i), Some(j)) = (i0, i1) {
                a[(i, j)] -= g;
                a[(j, i)] -= g;
            }
        }

        for pump in chip.flow_rate_pumps() {
            if let Some(i) = idx(pump.node0_id) {
                z[i] -= pump.flow_rate;
            }
            if let Some(j) = idx(pump.node1_id) {
                z[j] += pump.flow_rate;
            }
        }

        for (k, pump) in chip.pressure_pumps().enumerate() {
            let row = node_rows + k;
            if let Some(i) = idx(pump.node0_id) {
                a[(i, row)] += 1.0;
                a[(row, i)] -= 1.0;
            }
            if let Some(j) = idx(pump.node1_id) {
                a[(j, row)] -= 1.0;
                a[(row, j)] += 1.0;
            }
            z[row] = pump.pressure;
        }

        let x = if size == 0 {
            DVector::zeros(0)
        } else {
            a.lu()
                .solve(&z)
                .ok_or(SolverError::Singular { unknowns: size })?
        };
        if x.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFinite);
        }

        let pressures: BTreeMap<NodeId, f64> = chip
            .nodes()
            .map(|n| (n, idx(n).map_or(0.0, |i| x[i])))
            .collect();

        let channel_flows = chip
            .channels()
            .map(|c| {
                let dp = pressures[&c.node0_id] - pressures[&c.node1_id];
                (c.id, dp / resistances[&c.id])
            })
            .collect();

        let mut pump_flows: BTreeMap<PumpId, f64> = chip
            .flow_rate_pumps()
            .map(|p| (p.id, p.flow_rate))
            .collect();
        for (k, id) in self.pressure_pumps.iter().enumerate() {
            pump_flows.insert(*id, x[node_rows + k]);
        }

        tracing::trace!(unknowns = size, "solved nodal system");

        Ok(FlowField {
            pressures,
            channel_flows,
            pump_flows,
        })
    }
}

/// Nodes that cannot reach any ground through channels or pressure pumps.
fn floating_nodes(chip: &Chip, grounds: &BTreeSet<NodeId>) -> Vec<NodeId> {
    let mut links: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    let mut link = |a: NodeId, b: NodeId| {
        links.entry(a).or_default().push(b);
        links.entry(b).or_default().push(a);
    };
    for c in chip.channels() {
        link(c.node0_id, c.node1_id);
    }
    for p in chip.pressure_pumps() {
        link(p.node0_id, p.node1_id);
    }

    let mut reached: BTreeSet<NodeId> = grounds.clone();
    let mut queue: VecDeque<NodeId> = grounds.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        for next in links.get(&node).into_iter().flatten() {
            if reached.insert(*next) {
                queue.push_back(*next);
            }
        }
    }

    chip.nodes().filter(|n| !reached.contains(n)).collect()
}

// ===========================================================================
// Tests
// ===========================================================================
