//! Serde data file structs for chip descriptions.
//!
//! A chip file names its channels and fluids so droplets can refer to them
//! without knowing the ids the builder will assign. The loader resolves
//! these names into [`ChipBuilder`](droplet_core::builder::ChipBuilder)
//! calls.

use droplet_core::chip::ChannelType;
use serde::Deserialize;

// ===========================================================================
// Chip
// ===========================================================================

/// The complete contents of a `chip.*` file.
#[derive(Debug, Clone, Deserialize)]
pub struct ChipDescription {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<ChannelData>,
    #[serde(default)]
    pub flow_rate_pumps: Vec<FlowRatePumpData>,
    #[serde(default)]
    pub pressure_pumps: Vec<PressurePumpData>,
    #[serde(default)]
    pub sinks: Vec<i32>,
    #[serde(default)]
    pub grounds: Vec<i32>,
    #[serde(default)]
    pub fluids: Vec<FluidData>,
    /// Name of the carrier fluid.
    pub continuous_phase: Option<String>,
    #[serde(default)]
    pub droplets: Vec<DropletData>,
}

/// A channel between two nodes. Dimensions are in metres.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelData {
    pub name: String,
    pub node0: i32,
    pub node1: i32,
    pub height: f64,
    pub width: f64,
    pub length: f64,
    #[serde(default, rename = "type")]
    pub channel_type: ChannelType,
}

/// Pump imposing a volumetric flow rate in m³/s from `node0` to `node1`.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowRatePumpData {
    pub node0: i32,
    pub node1: i32,
    pub flow_rate: f64,
}

/// Pump imposing a pressure rise in Pa from `node0` to `node1`.
#[derive(Debug, Clone, Deserialize)]
pub struct PressurePumpData {
    pub node0: i32,
    pub node1: i32,
    pub pressure: f64,
}

// ===========================================================================
// Fluids and droplets
// ===========================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct FluidData {
    pub name: String,
    pub viscosity: f64,
    pub density: f64,
    #[serde(default)]
    pub concentration: f64,
}

/// A droplet injected at `time`, centred at `position` along `channel`.
#[derive(Debug, Clone, Deserialize)]
pub struct DropletData {
    pub fluid: String,
    pub volume: f64,
    #[serde(default)]
    pub time: f64,
    pub channel: String,
    #[serde(default = "default_position")]
    pub position: f64,
}

fn default_position() -> f64 {
    0.5
}

// ===========================================================================
// Tests
// ===========================================================================
