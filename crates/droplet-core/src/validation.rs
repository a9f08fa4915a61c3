//! Chip validity checks and determinism validation.
//!
//! [`check_chip_validity`] inspects a fully built chip and lists every
//! violation it finds instead of stopping at the first one. It never mutates
//! its input, so calling it twice yields the same report.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::builder::ChipBuilder;
use crate::chip::{ChannelType, Chip, ChipError, ChipErrorKind};
use crate::config::SimulationConfig;
use crate::droplet::{injection_span, spans_overlap, Droplet, Injection};
use crate::engine::{Simulation, SimulationError};
use crate::event::time_tolerance;
use crate::fluid::FluidTable;
use crate::id::{NodeId, PumpId};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of a validity check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidityReport {
    pub violations: Vec<ChipError>,
}

impl ValidityReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Violations of one kind.
    pub fn of_kind(&self, kind: ChipErrorKind) -> impl Iterator<Item = &ChipError> {
        self.violations.iter().filter(move |v| v.kind() == kind)
    }

    pub fn has_topology_errors(&self) -> bool {
        self.of_kind(ChipErrorKind::Topology).next().is_some()
    }

    pub fn has_geometry_errors(&self) -> bool {
        self.of_kind(ChipErrorKind::Geometry).next().is_some()
    }
}

impl fmt::Display for ValidityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.violations.is_empty() {
            return write!(f, "chip is valid");
        }
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Chip validity
// ---------------------------------------------------------------------------

/// Check the chip, fluids and injections held by `builder`.
pub fn check_chip_validity(builder: &ChipBuilder) -> ValidityReport {
    let chip = builder.chip();
    let mut violations = Vec::new();

    if chip.node_count() == 0 {
        violations.push(ChipError::EmptyChip);
    }
    if chip.grounds().next().is_none() {
        violations.push(ChipError::MissingGround);
    }
    for node in chip.grounds().chain(chip.sinks()) {
        if !chip.contains_node(node) {
            violations.push(ChipError::UnknownNode(node));
        }
    }

    check_geometry(chip, &mut violations);

    let unreached = unreached_from_ground(chip);
    if chip.grounds().next().is_some() && !unreached.is_empty() {
        violations.push(ChipError::Disconnected(unreached));
    }

    check_pumps(chip, &mut violations);

    match builder.continuous_phase() {
        None => violations.push(ChipError::MissingContinuousPhase),
        Some(id) if !builder.fluids().contains(id) => violations.push(ChipError::UnknownFluid(id)),
        Some(_) => {}
    }

    for injection in builder.injections() {
        match builder.droplet(injection.droplet_id) {
            Some(droplet) => {
                if let Err(e) = check_injection(chip, builder.fluids(), droplet, injection) {
                    violations.push(e);
                }
            }
            None => violations.push(ChipError::UnknownDroplet(injection.droplet_id)),
        }
    }

    ValidityReport { violations }
}

fn check_geometry(chip: &Chip, violations: &mut Vec<ChipError>) {
    for channel in chip.channels() {
        if channel.node0_id == channel.node1_id {
            violations.push(ChipError::SelfLoop(channel.node0_id));
        }
        for (dimension, value) in [
            ("width", channel.width),
            ("height", channel.height),
            ("length", channel.length),
        ] {
            if !(value.is_finite() && value > 0.0) {
                violations.push(ChipError::NonPositiveDimension {
                    channel: Some(channel.id),
                    dimension,
                    value,
                });
            }
        }
    }
    for pump in chip.flow_rate_pumps() {
        if !pump.flow_rate.is_finite() {
            violations.push(ChipError::InvalidValue {
                quantity: "pump flow rate",
                value: pump.flow_rate,
            });
        }
    }
    for pump in chip.pressure_pumps() {
        if !pump.pressure.is_finite() {
            violations.push(ChipError::InvalidValue {
                quantity: "pump pressure",
                value: pump.pressure,
            });
        }
    }
}

/// Nodes without a path to a ground through channels or pressure pumps.
/// Cloggable channels do not count as connections.
fn unreached_from_ground(chip: &Chip) -> Vec<NodeId> {
    let mut links: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    let mut link = |a: NodeId, b: NodeId| {
        links.entry(a).or_default().push(b);
        links.entry(b).or_default().push(a);
    };
    for c in chip.channels().filter(|c| c.channel_type != ChannelType::Cloggable) {
        link(c.node0_id, c.node1_id);
    }
    for p in chip.pressure_pumps() {
        link(p.node0_id, p.node1_id);
    }

    let mut reached: BTreeSet<NodeId> = chip.grounds().collect();
    let mut queue: VecDeque<NodeId> = reached.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        for next in links.get(&node).into_iter().flatten() {
            if reached.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    chip.nodes().filter(|n| !reached.contains(n)).collect()
}

#[derive(Debug, Clone, Copy)]
enum Condition {
    Flow,
    /// Pressure rise from the lower to the higher node id.
    Pressure(f64),
}

/// Pumps on the same node pair that cannot hold at the same time.
fn check_pumps(chip: &Chip, violations: &mut Vec<ChipError>) {
    let mut by_pair: BTreeMap<(NodeId, NodeId), Vec<(PumpId, Condition)>> = BTreeMap::new();
    let pair = |a: NodeId, b: NodeId| if a <= b { (a, b) } else { (b, a) };

    for p in chip.flow_rate_pumps() {
        by_pair
            .entry(pair(p.node0_id, p.node1_id))
            .or_default()
            .push((p.id, Condition::Flow));
    }
    for p in chip.pressure_pumps() {
        let rise = if p.node0_id <= p.node1_id { p.pressure } else { -p.pressure };
        by_pair
            .entry(pair(p.node0_id, p.node1_id))
            .or_default()
            .push((p.id, Condition::Pressure(rise)));
    }

    for pumps in by_pair.values_mut() {
        pumps.sort_by_key(|(id, _)| *id);
        for (i, (first, a)) in pumps.iter().enumerate() {
            for (second, b) in &pumps[i + 1..] {
                let conflict = match (a, b) {
                    (Condition::Flow, Condition::Flow) => false,
                    (Condition::Pressure(x), Condition::Pressure(y)) => x != y,
                    _ => true,
                };
                if conflict {
                    violations.push(ChipError::ConflictingPumps {
                        first: *first,
                        second: *second,
                    });
                }
            }
        }
    }
}

/// Check that `droplet` can be injected as described by `injection`.
pub fn check_injection(
    chip: &Chip,
    fluids: &FluidTable,
    droplet: &Droplet,
    injection: &Injection,
) -> Result<(), ChipError> {
    if !fluids.contains(droplet.fluid_id) {
        return Err(ChipError::UnknownFluid(droplet.fluid_id));
    }
    if !(droplet.volume.is_finite() && droplet.volume > 0.0) {
        return Err(ChipError::InvalidValue {
            quantity: "droplet volume",
            value: droplet.volume,
        });
    }
    if !(injection.time.is_finite() && injection.time >= 0.0) {
        return Err(ChipError::InvalidValue {
            quantity: "injection time",
            value: injection.time,
        });
    }
    let channel_id = injection.position.channel_id;
    let channel = chip
        .channel(channel_id)
        .ok_or(ChipError::UnknownChannel(channel_id))?;
    let length = droplet.volume / channel.volume();
    if length >= 1.0 {
        return Err(ChipError::DropletTooLarge {
            channel: channel_id,
            length,
        });
    }
    let (tail, head) = injection_span(channel, droplet.volume, injection.position.position);
    if tail < 0.0 || head > 1.0 {
        return Err(ChipError::DropletOutOfChannel {
            channel: channel_id,
            position: injection.position.position,
        });
    }
    Ok(())
}

/// Whether two injections put droplets into the same stretch of the same
/// channel at the same time. [`ChipBuilder::add_droplet`] refuses a droplet
/// colliding with one already added, so a built scenario never holds such
/// a pair.
pub fn injections_collide(
    chip: &Chip,
    (droplet_a, a): (&Droplet, &Injection),
    (droplet_b, b): (&Droplet, &Injection),
) -> bool {
    let channel_id = a.position.channel_id;
    if b.position.channel_id != channel_id
        || (a.time - b.time).abs() > time_tolerance(a.time.max(b.time))
    {
        return false;
    }
    let Some(channel) = chip.channel(channel_id) else {
        return false;
    };
    spans_overlap(
        injection_span(channel, droplet_a.volume, a.position.position),
        injection_span(channel, droplet_b.volume, b.position.position),
    )
}

// ---------------------------------------------------------------------------
// Determinism validation
// ---------------------------------------------------------------------------

/// Result of a determinism validation run.
#[derive(Debug)]
pub struct DeterminismResult {
    /// Whether the two runs produced identical states.
    pub is_deterministic: bool,
    /// Id of the first state whose hashes differ (if any).
    pub divergence_state: Option<u64>,
    /// Hash log: (state id, hash_run1, hash_run2) for each recorded state.
    pub hash_log: Vec<(u64, u64, u64)>,
}

/// Run the scenario held by `builder` twice for at most `steps` steps and
/// compare the recorded states.
pub fn validate_determinism(
    builder: &ChipBuilder,
    config: &SimulationConfig,
    steps: u64,
) -> Result<DeterminismResult, SimulationError> {
    let mut sim_a = Simulation::new(builder.clone(), config.clone())?;
    let mut sim_b = Simulation::new(builder.clone(), config.clone())?;

    let mut hash_log = Vec::new();
    let mut divergence_state = None;

    for _ in 0..steps {
        let a = sim_a.step()?;
        let b = sim_b.step()?;

        if let (Some(id), Some(sa), Some(sb)) = (a.state_id, sim_a.last_state(), sim_b.last_state()) {
            let (ha, hb) = (sa.hash().finish(), sb.hash().finish());
            hash_log.push((id, ha, hb));
            if (ha != hb || a.state_id != b.state_id) && divergence_state.is_none() {
                divergence_state = Some(id);
            }
        }
        if a.is_stopped() || b.is_stopped() {
            if a.stopped != b.stopped && divergence_state.is_none() {
                divergence_state = a.state_id.or(b.state_id);
            }
            break;
        }
    }

    Ok(DeterminismResult {
        is_deterministic: divergence_state.is_none(),
        divergence_state,
        hash_log,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
