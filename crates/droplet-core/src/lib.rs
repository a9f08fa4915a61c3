//! Droplet Core -- an event-driven simulator for droplet microfluidic chips.
//!
//! A chip is a network of rectangular channels between implicit nodes, fed
//! by flow-rate and pressure pumps. Droplets of one fluid travel through a
//! continuous phase of another, split at branches, merge when they meet and
//! leave through sinks. The simulator solves the hydraulic network, moves
//! droplet boundaries to the next topological event and records one state
//! per step.
//!
//! # Step Pipeline
//!
//! Each call to [`engine::Simulation::step`] runs:
//!
//! 1. **Settle** -- Solve the flow and resolve every event due right now.
//! 2. **Check** -- Verify that each droplet's boundaries hold its volume.
//! 3. **Record** -- Append one [`result::State`].
//! 4. **Advance** -- Jump to the earliest upcoming event and resolve it.
//!
//! # Construction
//!
//! Chips are described through a [`builder::ChipBuilder`]. Every `add_*`
//! call returns the id it assigned:
//!
//! ```rust,ignore
//! let mut chip = ChipBuilder::new("chain");
//! chip.add_flow_rate_pump(NodeId(-1), NodeId(0), 3e-11)?;
//! let c1 = chip.add_channel(NodeId(0), NodeId(-1), 30e-6, 100e-6, 1e-3, ChannelType::Normal)?;
//! chip.add_ground(NodeId(-1));
//! chip.add_sink(NodeId(-1));
//! let water = chip.add_fluid(1e-3, 1e3, 0.0)?;
//! chip.set_continuous_phase(water)?;
//! chip.add_droplet(water, 4.5e-13, 0.0, ChannelPosition::new(c1, 0.5))?;
//! let output = chip.simulate(&SimulationConfig::default(), StateRetention::All)?;
//! ```
//!
//! # Key Types
//!
//! - [`chip::Chip`] -- Channels, pumps, sinks and grounds over implicit nodes.
//! - [`solver::NodalSystem`] -- Modified nodal analysis of the network.
//! - [`resistance::ResistanceModel`] -- Geometry to hydraulic resistance.
//! - [`tracker::DropletTracker`] -- Droplet bodies and their boundaries.
//! - [`event::EventScheduler`] -- Upcoming events for the current topology.
//! - [`engine::Simulation`] -- The step loop.
//! - [`result::SimulationResult`] -- Everything a run produces.

pub mod builder;
pub mod chip;
pub mod config;
pub mod droplet;
pub mod engine;
pub mod event;
pub mod fluid;
pub mod id;
pub mod resistance;
pub mod result;
pub mod sim;
pub mod solver;
pub mod tracker;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
