//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::builder::ChipBuilder;
use crate::chip::{ChannelType, Chip};
use crate::fluid::FluidTable;
use crate::id::*;
use crate::result::State;
use crate::solver::FlowField;

// ===========================================================================
// Geometry
// ===========================================================================

pub fn channel_width() -> f64 {
    100e-6
}

pub fn channel_height() -> f64 {
    30e-6
}

pub fn channel_length() -> f64 {
    1000e-6
}

/// Volume of a droplet that spans 0.15 of a reference channel.
pub fn reference_droplet_volume() -> f64 {
    1.5 * channel_width() * channel_width() * channel_height()
}

fn channel(chip: &mut Chip, node0: i32, node1: i32, channel_type: ChannelType) -> ChannelId {
    chip.add_channel(
        NodeId(node0),
        NodeId(node1),
        channel_height(),
        channel_width(),
        channel_length(),
        channel_type,
    )
    .unwrap()
}

// ===========================================================================
// Chips
// ===========================================================================

/// Pump 0 feeds node 0 with 3e-11 m³/s. Channels 1..=6 form the chain
/// 0 → 1 → 2, the branch 2 → 3 → 4 next to 2 → 4, and the exit 4 → -1.
/// Node -1 is ground and sink.
pub fn reference_chip() -> Chip {
    let mut chip = Chip::new("reference");
    chip.add_flow_rate_pump(NodeId(-1), NodeId(0), 3e-11).unwrap();
    for (n0, n1) in [(0, 1), (1, 2), (2, 3), (2, 4), (3, 4), (4, -1)] {
        channel(&mut chip, n0, n1, ChannelType::Normal);
    }
    chip.add_ground(NodeId(-1));
    chip.add_sink(NodeId(-1));
    chip
}

/// Pump 0 feeds channel 1 (0 → -1) with `flow_rate`.
pub fn single_channel_chip(flow_rate: f64) -> Chip {
    let mut chip = Chip::new("single channel");
    chip.add_flow_rate_pump(NodeId(-1), NodeId(0), flow_rate).unwrap();
    channel(&mut chip, 0, -1, ChannelType::Normal);
    chip.add_ground(NodeId(-1));
    chip.add_sink(NodeId(-1));
    chip
}

/// A chain 0 → 1 → 2 whose only way out of node 2 is a bypass channel, so
/// droplets stop at node 2.
pub fn dead_end_chip() -> Chip {
    let mut chip = Chip::new("dead end");
    chip.add_flow_rate_pump(NodeId(-1), NodeId(0), 3e-11).unwrap();
    channel(&mut chip, 0, 1, ChannelType::Normal);
    channel(&mut chip, 1, 2, ChannelType::Normal);
    channel(&mut chip, 2, -1, ChannelType::Bypass);
    chip.add_ground(NodeId(-1));
    chip.add_sink(NodeId(-1));
    chip
}

/// Channel 1 (0 → 1) feeds channel 2 (1 → -1). Channel 3 (1 → 2) leads to
/// the dead-end node 2 and carries no flow.
pub fn side_pocket_chip() -> Chip {
    let mut chip = Chip::new("side pocket");
    chip.add_flow_rate_pump(NodeId(-1), NodeId(0), 3e-11).unwrap();
    for (n0, n1) in [(0, 1), (1, -1), (1, 2)] {
        channel(&mut chip, n0, n1, ChannelType::Normal);
    }
    chip.add_ground(NodeId(-1));
    chip.add_sink(NodeId(-1));
    chip
}

/// Node 1 splits into channel 2 (1 → 2) and the twice as long channel 3
/// (1 → 2). Node 2 drains only through the bypass channel 4, so droplets
/// arriving there stop and meet.
pub fn junction_chip() -> Chip {
    let mut chip = Chip::new("junction");
    chip.add_flow_rate_pump(NodeId(-1), NodeId(0), 3e-11).unwrap();
    channel(&mut chip, 0, 1, ChannelType::Normal);
    channel(&mut chip, 1, 2, ChannelType::Normal);
    chip.add_channel(
        NodeId(1),
        NodeId(2),
        channel_height(),
        channel_width(),
        2.0 * channel_length(),
        ChannelType::Normal,
    )
    .unwrap();
    channel(&mut chip, 2, -1, ChannelType::Bypass);
    chip.add_ground(NodeId(-1));
    chip.add_sink(NodeId(-1));
    chip
}

// ===========================================================================
// Fluids
// ===========================================================================

/// Fluid 0: water-like carrier. Fluid 1: a more viscous droplet fluid.
pub fn reference_fluids() -> FluidTable {
    let mut fluids = FluidTable::new();
    fluids.add(1e-3, 1e3, 0.0).unwrap();
    fluids.add(3e-3, 1.1e3, 1.0).unwrap();
    fluids
}

// ===========================================================================
// Builders
// ===========================================================================

fn builder_for(chip: &Chip) -> ChipBuilder {
    let mut builder = ChipBuilder::new(chip.name.clone());
    for pump in chip.flow_rate_pumps() {
        builder
            .add_flow_rate_pump(pump.node0_id, pump.node1_id, pump.flow_rate)
            .unwrap();
    }
    for c in chip.channels() {
        builder
            .add_channel(c.node0_id, c.node1_id, c.height, c.width, c.length, c.channel_type)
            .unwrap();
    }
    for node in chip.grounds() {
        builder.add_ground(node);
    }
    for node in chip.sinks() {
        builder.add_sink(node);
    }
    let carrier = builder.add_fluid(1e-3, 1e3, 0.0).unwrap();
    builder.add_fluid(3e-3, 1.1e3, 1.0).unwrap();
    builder.set_continuous_phase(carrier).unwrap();
    builder
}

/// [`reference_chip`] with [`reference_fluids`], fluid 0 as continuous phase
/// and no droplets.
pub fn reference_builder() -> ChipBuilder {
    builder_for(&reference_chip())
}

/// [`single_channel_chip`] at 3e-11 m³/s with [`reference_fluids`].
pub fn single_channel_builder() -> ChipBuilder {
    builder_for(&single_channel_chip(3e-11))
}

/// [`dead_end_chip`] with [`reference_fluids`].
pub fn dead_end_builder() -> ChipBuilder {
    builder_for(&dead_end_chip())
}

/// [`side_pocket_chip`] with [`reference_fluids`].
pub fn side_pocket_builder() -> ChipBuilder {
    builder_for(&side_pocket_chip())
}

/// [`junction_chip`] with [`reference_fluids`].
pub fn junction_builder() -> ChipBuilder {
    builder_for(&junction_chip())
}

// ===========================================================================
// Conservation helpers
// ===========================================================================

/// Net flow into `node` from its channels and pumps.
pub fn net_inflow(chip: &Chip, field: &FlowField, node: NodeId) -> f64 {
    let mut net = 0.0;
    for c in chip.channels() {
        let q = field.channel_flow(c.id);
        if c.node1_id == node {
            net += q;
        }
        if c.node0_id == node {
            net -= q;
        }
    }
    let pumps = chip
        .flow_rate_pumps()
        .map(|p| (p.id, p.node0_id, p.node1_id))
        .chain(chip.pressure_pumps().map(|p| (p.id, p.node0_id, p.node1_id)));
    for (id, n0, n1) in pumps {
        let q = field.pump_flows.get(&id).copied().unwrap_or(0.0);
        if n1 == node {
            net += q;
        }
        if n0 == node {
            net -= q;
        }
    }
    net
}

/// [`net_inflow`] computed from the flow rates of a recorded state.
pub fn state_net_inflow(chip: &Chip, state: &State, node: NodeId) -> f64 {
    let field = FlowField {
        pressures: state.pressures.clone(),
        channel_flows: chip
            .channels()
            .filter_map(|c| state.flow_rate(c.id).map(|q| (c.id, q)))
            .collect(),
        pump_flows: chip
            .flow_rate_pumps()
            .map(|p| p.id)
            .chain(chip.pressure_pumps().map(|p| p.id))
            .filter_map(|id| state.flow_rate(id).map(|q| (id, q)))
            .collect(),
    };
    net_inflow(chip, &field, node)
}
