//! The chip graph: implicit nodes, channels, pumps, sinks and grounds.
//!
//! Nodes are never declared on their own. A node exists once a channel or a
//! pump references it, and sinks/grounds only tag existing nodes. Channels
//! and pumps share one id counter so a raw id identifies either kind.
//!
//! # Design
//!
//! - Entity tables are `BTreeMap`s so iteration order is deterministic.
//! - The node → channel adjacency index is derived data. It is skipped by
//!   serde and rebuilt whenever a chip is deserialized.
//! - Structural mutations validate their own arguments and leave the chip
//!   untouched on error. Whole-graph checks live in [`crate::validation`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::id::{ChannelId, DropletId, FluidId, NodeId, PumpId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Coarse classification of construction-time errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipErrorKind {
    /// Dangling references, disconnected networks, missing ground.
    Topology,
    /// Non-positive or non-finite dimensions and physical values.
    Geometry,
}

/// Errors reported by construction calls and by the validity check.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChipError {
    #[error("chip has no nodes")]
    EmptyChip,
    #[error("no ground node declared")]
    MissingGround,
    #[error("nodes not connected to any ground: {0:?}")]
    Disconnected(Vec<NodeId>),
    #[error("element connects node {0:?} to itself")]
    SelfLoop(NodeId),
    #[error("node {0:?} is not referenced by any channel or pump")]
    UnknownNode(NodeId),
    #[error("channel not found: {0:?}")]
    UnknownChannel(ChannelId),
    #[error("fluid not found: {0:?}")]
    UnknownFluid(FluidId),
    #[error("droplet not found: {0:?}")]
    UnknownDroplet(DropletId),
    #[error("no continuous phase fluid designated")]
    MissingContinuousPhase,
    #[error("pumps {first:?} and {second:?} impose conflicting conditions on the same node pair")]
    ConflictingPumps { first: PumpId, second: PumpId },
    #[error("channel {channel:?}: {dimension} must be positive, got {value}")]
    NonPositiveDimension {
        channel: Option<ChannelId>,
        dimension: &'static str,
        value: f64,
    },
    #[error("invalid {quantity}: {value}")]
    InvalidValue { quantity: &'static str, value: f64 },
    #[error("droplet of relative length {length} does not fit into channel {channel:?}")]
    DropletTooLarge { channel: ChannelId, length: f64 },
    #[error("droplet at position {position} in channel {channel:?} would extend past the channel ends")]
    DropletOutOfChannel { channel: ChannelId, position: f64 },
    #[error("droplets {first:?} and {second:?} would be injected on top of each other")]
    OverlappingInjections { first: DropletId, second: DropletId },
}

impl ChipError {
    /// Classify this error as a topology or a geometry problem.
    pub fn kind(&self) -> ChipErrorKind {
        match self {
            ChipError::EmptyChip
            | ChipError::MissingGround
            | ChipError::Disconnected(_)
            | ChipError::SelfLoop(_)
            | ChipError::UnknownNode(_)
            | ChipError::UnknownChannel(_)
            | ChipError::UnknownFluid(_)
            | ChipError::UnknownDroplet(_)
            | ChipError::MissingContinuousPhase
            | ChipError::ConflictingPumps { .. } => ChipErrorKind::Topology,
            ChipError::NonPositiveDimension { .. }
            | ChipError::InvalidValue { .. }
            | ChipError::DropletTooLarge { .. }
            | ChipError::DropletOutOfChannel { .. }
            | ChipError::OverlappingInjections { .. } => ChipErrorKind::Geometry,
        }
    }
}

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

/// How droplets and the validity check treat a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    /// Droplets may enter and travel through the channel.
    #[default]
    Normal,
    /// Carries only continuous phase. Droplets never enter it.
    Bypass,
    /// Clogs while a droplet passes one of its ends. Ignored by the
    /// connectivity check.
    Cloggable,
}

/// A rectangular channel between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub node0_id: NodeId,
    pub node1_id: NodeId,
    pub width: f64,
    pub height: f64,
    pub length: f64,
    #[serde(rename = "type", default)]
    pub channel_type: ChannelType,
}

impl Channel {
    /// Cross-section area (width × height).
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Inner volume of the channel.
    pub fn volume(&self) -> f64 {
        self.area() * self.length
    }

    /// Whether `node` is one of the channel's endpoints.
    pub fn touches(&self, node: NodeId) -> bool {
        self.node0_id == node || self.node1_id == node
    }

    /// The endpoint opposite to `node`, if `node` is an endpoint.
    pub fn other_node(&self, node: NodeId) -> Option<NodeId> {
        if self.node0_id == node {
            Some(self.node1_id)
        } else if self.node1_id == node {
            Some(self.node0_id)
        } else {
            None
        }
    }

    /// Relative position of the end at `node` (0 for node0, 1 for node1).
    pub fn end_position(&self, node: NodeId) -> f64 {
        if self.node0_id == node { 0.0 } else { 1.0 }
    }
}

/// A pump that imposes a fixed volumetric flow rate from node0 to node1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRatePump {
    pub id: PumpId,
    pub name: String,
    pub node0_id: NodeId,
    pub node1_id: NodeId,
    pub flow_rate: f64,
}

/// A pump that imposes a fixed pressure rise `p1 - p0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressurePump {
    pub id: PumpId,
    pub name: String,
    pub node0_id: NodeId,
    pub node1_id: NodeId,
    pub pressure: f64,
}

// ---------------------------------------------------------------------------
// Chip
// ---------------------------------------------------------------------------

/// Serialized form of a [`Chip`]. The adjacency index is rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChipData {
    name: String,
    channels: Vec<Channel>,
    flow_rate_pumps: Vec<FlowRatePump>,
    pressure_pumps: Vec<PressurePump>,
    #[serde(default)]
    sinks: Vec<NodeId>,
    #[serde(default)]
    grounds: Vec<NodeId>,
}

/// The chip: channels, pumps, sinks and grounds over implicit nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ChipData", into = "ChipData")]
pub struct Chip {
    pub name: String,
    channels: BTreeMap<ChannelId, Channel>,
    flow_rate_pumps: BTreeMap<PumpId, FlowRatePump>,
    pressure_pumps: BTreeMap<PumpId, PressurePump>,
    sinks: BTreeSet<NodeId>,
    grounds: BTreeSet<NodeId>,
    /// Channels incident to each node, in id order.
    adjacency: BTreeMap<NodeId, Vec<ChannelId>>,
    /// Every node referenced by a channel or pump.
    nodes: BTreeSet<NodeId>,
    next_element_id: u32,
}

impl From<ChipData> for Chip {
    fn from(data: ChipData) -> Self {
        let mut chip = Chip::new(data.name);
        for channel in data.channels {
            chip.insert_channel(channel);
        }
        for pump in data.flow_rate_pumps {
            chip.touch_nodes(pump.node0_id, pump.node1_id);
            chip.bump_element_id(pump.id.0);
            chip.flow_rate_pumps.insert(pump.id, pump);
        }
        for pump in data.pressure_pumps {
            chip.touch_nodes(pump.node0_id, pump.node1_id);
            chip.bump_element_id(pump.id.0);
            chip.pressure_pumps.insert(pump.id, pump);
        }
        chip.sinks = data.sinks.into_iter().collect();
        chip.grounds = data.grounds.into_iter().collect();
        chip
    }
}

impl From<Chip> for ChipData {
    fn from(chip: Chip) -> Self {
        ChipData {
            name: chip.name,
            channels: chip.channels.into_values().collect(),
            flow_rate_pumps: chip.flow_rate_pumps.into_values().collect(),
            pressure_pumps: chip.pressure_pumps.into_values().collect(),
            sinks: chip.sinks.into_iter().collect(),
            grounds: chip.grounds.into_iter().collect(),
        }
    }
}

fn check_dimension(
    channel: Option<ChannelId>,
    dimension: &'static str,
    value: f64,
) -> Result<(), ChipError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ChipError::NonPositiveDimension {
            channel,
            dimension,
            value,
        })
    }
}

impl Chip {
    /// Create an empty chip.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn touch_nodes(&mut self, node0: NodeId, node1: NodeId) {
        self.nodes.insert(node0);
        self.nodes.insert(node1);
    }

    fn bump_element_id(&mut self, used: u32) {
        self.next_element_id = self.next_element_id.max(used + 1);
    }

    fn allocate_element_id(&mut self) -> u32 {
        let id = self.next_element_id;
        self.next_element_id += 1;
        id
    }

    fn insert_channel(&mut self, channel: Channel) {
        self.touch_nodes(channel.node0_id, channel.node1_id);
        self.bump_element_id(channel.id.0);
        for node in [channel.node0_id, channel.node1_id] {
            let list = self.adjacency.entry(node).or_default();
            if let Err(pos) = list.binary_search(&channel.id) {
                list.insert(pos, channel.id);
            }
        }
        self.channels.insert(channel.id, channel);
    }

    // -- Construction --

    /// Add a channel between two nodes. Dimensions must be positive.
    pub fn add_channel(
        &mut self,
        node0: NodeId,
        node1: NodeId,
        height: f64,
        width: f64,
        length: f64,
        channel_type: ChannelType,
    ) -> Result<ChannelId, ChipError> {
        if node0 == node1 {
            return Err(ChipError::SelfLoop(node0));
        }
        check_dimension(None, "height", height)?;
        check_dimension(None, "width", width)?;
        check_dimension(None, "length", length)?;

        let id = ChannelId(self.allocate_element_id());
        self.insert_channel(Channel {
            id,
            name: format!("channel {}", id.0),
            node0_id: node0,
            node1_id: node1,
            width,
            height,
            length,
            channel_type,
        });
        Ok(id)
    }

    /// Add a pump imposing `flow_rate` from `node0` to `node1`.
    pub fn add_flow_rate_pump(
        &mut self,
        node0: NodeId,
        node1: NodeId,
        flow_rate: f64,
    ) -> Result<PumpId, ChipError> {
        if node0 == node1 {
            return Err(ChipError::SelfLoop(node0));
        }
        if !flow_rate.is_finite() {
            return Err(ChipError::InvalidValue {
                quantity: "pump flow rate",
                value: flow_rate,
            });
        }
        let id = PumpId(self.allocate_element_id());
        self.touch_nodes(node0, node1);
        self.flow_rate_pumps.insert(
            id,
            FlowRatePump {
                id,
                name: format!("pump {}", id.0),
                node0_id: node0,
                node1_id: node1,
                flow_rate,
            },
        );
        Ok(id)
    }

    /// Add a pump imposing a pressure rise of `pressure` from `node0` to `node1`.
    pub fn add_pressure_pump(
        &mut self,
        node0: NodeId,
        node1: NodeId,
        pressure: f64,
    ) -> Result<PumpId, ChipError> {
        if node0 == node1 {
            return Err(ChipError::SelfLoop(node0));
        }
        if !pressure.is_finite() {
            return Err(ChipError::InvalidValue {
                quantity: "pump pressure",
                value: pressure,
            });
        }
        let id = PumpId(self.allocate_element_id());
        self.touch_nodes(node0, node1);
        self.pressure_pumps.insert(
            id,
            PressurePump {
                id,
                name: format!("pump {}", id.0),
                node0_id: node0,
                node1_id: node1,
                pressure,
            },
        );
        Ok(id)
    }

    /// Tag `node` as a sink. Droplets reaching it leave the network.
    pub fn add_sink(&mut self, node: NodeId) {
        self.sinks.insert(node);
    }

    /// Tag `node` as a ground (pressure reference, fixed at zero).
    pub fn add_ground(&mut self, node: NodeId) {
        self.grounds.insert(node);
    }

    // -- Queries --

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn flow_rate_pumps(&self) -> impl Iterator<Item = &FlowRatePump> {
        self.flow_rate_pumps.values()
    }

    pub fn pressure_pumps(&self) -> impl Iterator<Item = &PressurePump> {
        self.pressure_pumps.values()
    }

    pub fn pressure_pump_count(&self) -> usize {
        self.pressure_pumps.len()
    }

    /// Channels incident to `node`, sorted by id. Empty for unknown nodes.
    pub fn channels_at(&self, node: NodeId) -> &[ChannelId] {
        self.adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All nodes referenced by channels or pumps, in id order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn is_sink(&self, node: NodeId) -> bool {
        self.sinks.contains(&node)
    }

    pub fn is_ground(&self, node: NodeId) -> bool {
        self.grounds.contains(&node)
    }

    pub fn sinks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sinks.iter().copied()
    }

    pub fn grounds(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.grounds.iter().copied()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
