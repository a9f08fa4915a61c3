//! Integration tests for the droplet simulator.
//!
//! These tests exercise end-to-end behavior through the public API: chip
//! construction, validity checks, flow solving, droplet routing, stop
//! conditions and result serialization.

use droplet_core::builder::ChipBuilder;
use droplet_core::chip::{ChannelType, ChipError};
use droplet_core::tracker::body_volume_in;
use droplet_core::config::SimulationConfig;
use droplet_core::droplet::{ChannelPosition, DropletState};
use droplet_core::engine::SimulationError;
use droplet_core::id::*;
use droplet_core::resistance::{RectangularDuct, ResistanceModel, ResistanceModelKind};
use droplet_core::result::{SimulationResult, StateRetention};
use droplet_core::sim::StopReason;
use droplet_core::test_utils::*;

fn reference_with_droplet() -> ChipBuilder {
    let mut builder = reference_builder();
    builder
        .add_droplet(
            FluidId(1),
            reference_droplet_volume(),
            0.0,
            ChannelPosition::new(ChannelId(1), 0.5),
        )
        .unwrap();
    builder
}

/// Droplet volume inside the network in every state, droplets draining
/// into a sink excluded.
fn volumes_in_network(builder: &ChipBuilder, result: &SimulationResult) -> Vec<f64> {
    let chip = builder.chip();
    result
        .states
        .iter()
        .map(|state| {
            let mut total = 0.0;
            for position in state.droplet_positions.values() {
                if !matches!(position.state, DropletState::Network | DropletState::Trapped) {
                    continue;
                }
                for channel_id in &position.channel_ids {
                    let channel = chip.channel(*channel_id).unwrap();
                    let inside: Vec<_> = position
                        .boundaries
                        .iter()
                        .filter(|b| b.channel_id() == *channel_id)
                        .copied()
                        .collect();
                    total += if inside.is_empty() {
                        channel.volume()
                    } else {
                        body_volume_in(channel, &inside)
                    };
                }
            }
            total
        })
        .collect()
}

fn run(builder: &ChipBuilder) -> SimulationResult {
    builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap()
        .result
}

// ===========================================================================
// Test 1: Single channel fed by a flow-rate pump
// ===========================================================================
//
// pump(-1 → 0, 3e-11) → channel 1 (0 → -1), no droplets.
// The channel carries the pump rate and the pressure drop is q × R.

#[test]
fn single_channel_pressure_drop() {
    let builder = single_channel_builder();
    let result = run(&builder);
    assert_eq!(result.states.len(), 1);

    let state = &result.states[0];
    let q = state.flow_rate(ChannelId(1)).unwrap();
    let r = RectangularDuct::new(1e-3).channel_resistance(builder.chip().channel(ChannelId(1)).unwrap());
    assert!((q - 3e-11).abs() < 1e-20);
    let dp = state.pressure_drop(NodeId(0), NodeId(-1)).unwrap();
    assert!(((dp - q * r) / dp).abs() < 1e-9);
}

// ===========================================================================
// Test 2: Droplet runs the reference chain into the sink
// ===========================================================================

#[test]
fn reference_droplet_lifecycle() {
    let mut builder = reference_builder();
    builder
        .add_droplet(
            FluidId(1),
            reference_droplet_volume(),
            0.02,
            ChannelPosition::new(ChannelId(1), 0.5),
        )
        .unwrap();
    let result = run(&builder);

    assert_eq!(
        result.droplet_lifecycle(DropletId(0)),
        vec![DropletState::Injection, DropletState::Network, DropletState::Sink]
    );
    let last = result.last_state().unwrap();
    assert!(last.droplets_in(DropletState::Network).next().is_none());
}

// ===========================================================================
// Test 3: Branch node produces one front per outgoing channel
// ===========================================================================

#[test]
fn branch_produces_two_fronts() {
    let result = run(&reference_with_droplet());
    let state = result
        .states
        .iter()
        .find(|s| {
            s.droplet_position(DropletId(0))
                .is_some_and(|p| p.channel_ids.contains(&ChannelId(3)))
        })
        .expect("droplet reaches the branch");

    assert!((state.time - 0.111328125).abs() < 1e-9);
    let position = state.droplet_position(DropletId(0)).unwrap();
    assert_eq!(position.channel_ids, vec![ChannelId(2), ChannelId(3), ChannelId(4)]);
    for channel in [ChannelId(3), ChannelId(4)] {
        let fronts: Vec<_> = position
            .boundaries
            .iter()
            .filter(|b| b.channel_id() == channel)
            .collect();
        assert_eq!(fronts.len(), 1, "channel {channel:?}");
        assert_eq!(fronts[0].position.position, 0.0);
    }
}

// ===========================================================================
// Test 4: Disconnected subgraph is refused
// ===========================================================================

#[test]
fn disconnected_subgraph_refused() {
    let mut builder = reference_builder();
    builder
        .add_channel(NodeId(30), NodeId(31), 30e-6, 100e-6, 1e-3, ChannelType::Normal)
        .unwrap();

    let report = builder.check_chip_validity();
    assert!(report.has_topology_errors());
    assert!(report
        .violations
        .contains(&ChipError::Disconnected(vec![NodeId(30), NodeId(31)])));

    let failure = builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap_err();
    assert!(matches!(failure.error, SimulationError::InvalidChip(_)));
    assert!(failure.partial.is_none());
}

// ===========================================================================
// Test 5: Droplet blocked by a bypass-only node gets trapped
// ===========================================================================

#[test]
fn blocked_droplet_is_trapped() {
    let mut builder = dead_end_builder();
    builder
        .add_droplet(
            FluidId(1),
            reference_droplet_volume(),
            0.0,
            ChannelPosition::new(ChannelId(1), 0.5),
        )
        .unwrap();
    let out = builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap();

    assert_eq!(out.stop_reason, StopReason::Completed);
    let last = out.result.last_state().unwrap();
    let position = last.droplet_position(DropletId(0)).unwrap();
    assert_eq!(position.state, DropletState::Trapped);
    assert!(!position.channel_ids.contains(&ChannelId(3)));

    // The carrier keeps flowing through the bypass.
    assert!((last.flow_rate(ChannelId(3)).unwrap() - 3e-11).abs() < 1e-20);
}

// ===========================================================================
// Test 6: Pressure-driven chip
// ===========================================================================

#[test]
fn pressure_pump_drives_droplet() {
    let mut builder = ChipBuilder::new("pressure");
    builder.add_pressure_pump(NodeId(-1), NodeId(0), 200.0).unwrap();
    let c = builder
        .add_channel(NodeId(0), NodeId(-1), 30e-6, 100e-6, 1e-3, ChannelType::Normal)
        .unwrap();
    builder.add_ground(NodeId(-1));
    builder.add_sink(NodeId(-1));
    let water = builder.add_fluid(1e-3, 1e3, 0.0).unwrap();
    builder.set_continuous_phase(water).unwrap();
    builder
        .add_droplet(water, reference_droplet_volume(), 0.0, ChannelPosition::new(c, 0.5))
        .unwrap();

    let out = builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap();
    assert_eq!(out.stop_reason, StopReason::Completed);
    assert_eq!(out.result.resistance_model, ResistanceModelKind::RectangularDuct);

    let first = &out.result.states[0];
    assert!((first.pressure(NodeId(0)).unwrap() - 200.0).abs() < 1e-9);
    let q = first.flow_rate(c).unwrap();
    let pump = first.flow_rate(PumpId(0)).unwrap();
    assert!(q > 0.0);
    assert!(((pump - q) / q).abs() < 1e-9);
    assert_eq!(
        out.result.droplet_lifecycle(DropletId(0)).last(),
        Some(&DropletState::Sink)
    );
}

// ===========================================================================
// Test 7: Results serialize with the external field names
// ===========================================================================

#[test]
fn result_serializes_to_json() {
    let result = run(&reference_with_droplet());
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["continuousPhaseId"], 0);
    assert_eq!(json["resistanceModel"], 0);
    let state = &json["states"][0];
    assert!(state["pressures"]["-1"].is_number());
    assert!(state["flowRates"]["1"].is_number());
    assert_eq!(state["dropletPositions"]["0"]["state"], "NETWORK");
    assert_eq!(json["chip"]["channels"][0]["type"], "NORMAL");
    assert_eq!(json["injections"][0]["position"]["channelId"], 1);

    let text = serde_json::to_string(&result).unwrap();
    let back: SimulationResult = serde_json::from_str(&text).unwrap();
    assert_eq!(back.states.len(), result.states.len());
    assert_eq!(back.chip.channel_count(), result.chip.channel_count());
    assert_eq!(back.droplets.len(), result.droplets.len());
}

// ===========================================================================
// Test 8: Splits and merges conserve the injected volume
// ===========================================================================

#[test]
fn split_fragments_account_for_volume() {
    let result = run(&reference_with_droplet());
    let original = reference_droplet_volume();

    // Every fragment descends from droplet 0, and the volume leaving the
    // chip adds up to what was injected.
    let fragments: Vec<_> = result
        .droplets
        .iter()
        .filter(|d| d.split_from.is_some())
        .collect();
    assert!(!fragments.is_empty());

    let survivors: f64 = result
        .droplets
        .iter()
        .filter(|d| d.merged_into.is_none())
        .map(|d| d.volume)
        .sum();
    let absorbed: Vec<_> = result
        .droplets
        .iter()
        .filter(|d| d.merged_into.is_some())
        .collect();
    for d in &absorbed {
        let survivor = result.droplet(d.merged_into.unwrap()).unwrap();
        assert!(survivor.merged_droplet_ids.contains(&d.id));
    }
    assert!(((survivors - original) / original).abs() < 1e-9);
}

// ===========================================================================
// Test 9: A follower catches up with a blocked droplet and merges in-channel
// ===========================================================================
//
// dead end: 0 → 1 → 2, node 2 drains only through a bypass.
// Droplet 0 (fluid 1) starts in channel 2 and stops at node 2. Droplet 1
// (fluid 2) starts in channel 1, follows and runs into droplet 0's rear.

#[test]
fn follower_merges_in_channel() {
    let mut builder = dead_end_builder();
    let ink = builder.add_fluid(2e-3, 1.2e3, 0.5).unwrap();
    let volume = reference_droplet_volume();
    builder
        .add_droplet(FluidId(1), volume, 0.0, ChannelPosition::new(ChannelId(2), 0.5))
        .unwrap();
    builder
        .add_droplet(ink, volume, 0.0, ChannelPosition::new(ChannelId(1), 0.5))
        .unwrap();
    let out = builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap();
    assert_eq!(out.stop_reason, StopReason::Completed);
    let result = &out.result;

    let survivor = result.droplet(DropletId(0)).unwrap();
    let absorbed = result.droplet(DropletId(1)).unwrap();
    assert!(((survivor.volume - 2.0 * volume) / volume).abs() < 1e-9);
    assert!(survivor.merged_droplet_ids.contains(&DropletId(1)));
    assert_eq!(absorbed.merged_into, Some(DropletId(0)));

    // Equal volumes mix to the plain average.
    let fluid = result.fluid(survivor.fluid_id).unwrap();
    assert!((fluid.viscosity - 2.5e-3).abs() < 1e-15);
    assert!((fluid.density - 1.15e3).abs() < 1e-9);
    assert!(fluid.mixed_fluid_ids.contains(&FluidId(1)));
    assert!(fluid.mixed_fluid_ids.contains(&ink));

    // The merged body fills channel 2 from droplet 1's rear up to node 2.
    let last = result.last_state().unwrap();
    let position = last.droplet_position(DropletId(0)).unwrap();
    assert_eq!(position.state, DropletState::Trapped);
    assert_eq!(position.channel_ids, vec![ChannelId(2)]);
    assert_eq!(position.boundaries.len(), 2);
    assert_eq!(
        result.droplet_lifecycle(DropletId(1)).last(),
        Some(&DropletState::Sink)
    );

    for (state, total) in result.states.iter().zip(volumes_in_network(&builder, result)) {
        assert!(
            ((total - 2.0 * volume) / volume).abs() < 1e-6,
            "t = {}: {total}",
            state.time
        );
    }
}

// ===========================================================================
// Test 10: Droplets arriving at the same node from two channels merge
// ===========================================================================
//
// junction: node 1 feeds channels 2 and 3 (twice as long), both ending at
// node 2, which drains only through a bypass. Droplet 0 reaches node 2
// first and waits there. Droplet 1 arrives later through channel 3.

#[test]
fn droplets_merge_at_node() {
    let mut builder = junction_builder();
    let ink = builder.add_fluid(2e-3, 1.2e3, 0.5).unwrap();
    let volume = reference_droplet_volume();
    builder
        .add_droplet(FluidId(1), volume, 0.0, ChannelPosition::new(ChannelId(2), 0.5))
        .unwrap();
    builder
        .add_droplet(ink, volume, 0.0, ChannelPosition::new(ChannelId(3), 0.5))
        .unwrap();
    let out = builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap();
    assert_eq!(out.stop_reason, StopReason::Completed);
    let result = &out.result;

    let survivor = result.droplet(DropletId(0)).unwrap();
    assert!(((survivor.volume - 2.0 * volume) / volume).abs() < 1e-9);
    assert!(survivor.merged_droplet_ids.contains(&DropletId(1)));
    assert_eq!(result.droplet(DropletId(1)).unwrap().merged_into, Some(DropletId(0)));
    let fluid = result.fluid(survivor.fluid_id).unwrap();
    assert!((fluid.viscosity - 2.5e-3).abs() < 1e-15);

    // One body reaching into node 2 from both channels.
    let last = result.last_state().unwrap();
    let position = last.droplet_position(DropletId(0)).unwrap();
    assert_eq!(position.state, DropletState::Trapped);
    assert_eq!(position.channel_ids, vec![ChannelId(2), ChannelId(3)]);

    for (state, total) in result.states.iter().zip(volumes_in_network(&builder, result)) {
        assert!(
            ((total - 2.0 * volume) / volume).abs() < 1e-6,
            "t = {}: {total}",
            state.time
        );
    }
}

// ===========================================================================
// Test 11: A droplet in a channel without flow is trapped, not scheduled
// ===========================================================================
//
// side pocket: channel 3 (1 → 2) ends in a node nothing drains from, so
// its flow is solver round-off. The droplet must neither move nor get an
// event in the far future.

#[test]
fn pocket_droplet_is_trapped() {
    let mut builder = side_pocket_builder();
    builder
        .add_droplet(
            FluidId(1),
            reference_droplet_volume(),
            0.0,
            ChannelPosition::new(ChannelId(3), 0.5),
        )
        .unwrap();

    let out = builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap();
    assert_eq!(out.stop_reason, StopReason::Completed);
    assert_eq!(out.result.states.len(), 1);
    let position = out.result.states[0].droplet_position(DropletId(0)).unwrap();
    assert_eq!(position.state, DropletState::Trapped);
    assert!((position.boundaries[0].position.position - 0.425).abs() < 1e-12);

    // With a trap delay the droplet waits in the network first.
    let mut config = SimulationConfig::default();
    config.trap_after = 0.05;
    let out = builder.simulate(&config, StateRetention::All).unwrap();
    assert_eq!(out.stop_reason, StopReason::Completed);
    let times: Vec<f64> = out.result.states.iter().map(|s| s.time).collect();
    assert_eq!(times, vec![0.0, 0.05]);
    assert_eq!(
        out.result.droplet_lifecycle(DropletId(0)),
        vec![DropletState::Network, DropletState::Trapped]
    );
}

// ===========================================================================
// Test 12: An injection into an occupied stretch waits for it to clear
// ===========================================================================
//
// Droplet 0 enters channel 1 at t = 0 and moves 12.8 channel lengths per
// second. Droplet 1 is due at the same spot at t = 0.01, when droplet 0
// still covers [0.553, 0.703]. It enters once droplet 0's rear has passed
// 0.575, at t = 0.15 / 12.8.

#[test]
fn injection_waits_for_occupied_stretch() {
    let mut builder = reference_builder();
    let volume = reference_droplet_volume();
    for time in [0.0, 0.01] {
        builder
            .add_droplet(FluidId(1), volume, time, ChannelPosition::new(ChannelId(1), 0.5))
            .unwrap();
    }
    let out = builder
        .simulate(&SimulationConfig::default(), StateRetention::All)
        .unwrap();
    assert_eq!(out.stop_reason, StopReason::Completed);
    let result = &out.result;

    let entered = result
        .states
        .iter()
        .find(|s| {
            s.droplet_position(DropletId(1))
                .is_some_and(|p| p.state == DropletState::Network)
        })
        .unwrap();
    assert!((entered.time - 0.15 / 12.8).abs() < 1e-9, "t = {}", entered.time);

    let remaining: f64 = result
        .droplets
        .iter()
        .filter(|d| d.merged_into.is_none())
        .map(|d| d.volume)
        .sum();
    assert!(((remaining - 2.0 * volume) / volume).abs() < 1e-9);
}

