//! Droplet records, boundaries and positions.
//!
//! A droplet's topology at one instant is a [`DropletPosition`]: the
//! boundaries that delimit its body inside partially filled channels plus
//! the ids of every channel it occupies. Channels listed without a boundary
//! are completely filled by the droplet.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::chip::Channel;
use crate::id::{ChannelId, DropletId, FluidId, InjectionId, NodeId};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle of a droplet.
///
/// Serialized as the variant name in SCREAMING_SNAKE_CASE (`"NETWORK"`,
/// `"TRAPPED"`, ...), never as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropletState {
    /// Waiting for its injection time.
    Injection,
    /// Moving through the network.
    Network,
    /// Stalled at a node with no way forward.
    Trapped,
    /// No longer in the network. Either it left through a sink or it was
    /// absorbed by a merge; absorbed droplets have
    /// [`Droplet::merged_into`] set and an empty position.
    Sink,
}

/// Whether a boundary moves or waits for flow at its node.
///
/// Serialized in SCREAMING_SNAKE_CASE (`"NORMAL"`, `"WAIT_INFLOW"`,
/// `"WAIT_OUTFLOW"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoundaryState {
    #[default]
    Normal,
    /// Waits until carrier fluid can enter the droplet again.
    WaitInflow,
    /// Sits at a node until an outflow channel becomes available.
    WaitOutflow,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A point along a channel, relative to its length (0 = node0, 1 = node1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPosition {
    pub channel_id: ChannelId,
    pub position: f64,
}

impl ChannelPosition {
    pub fn new(channel_id: ChannelId, position: f64) -> Self {
        Self {
            channel_id,
            position,
        }
    }

    /// Volume between this point and node0 of `channel`.
    pub fn volume_towards0(&self, channel: &Channel) -> f64 {
        self.position * channel.volume()
    }

    /// Volume between this point and node1 of `channel`.
    pub fn volume_towards1(&self, channel: &Channel) -> f64 {
        (1.0 - self.position) * channel.volume()
    }

    /// Shift the position by `volume` towards node1 (negative values move
    /// towards node0), clamped to the channel.
    pub fn shift_by_volume(&mut self, channel: &Channel, volume: f64) {
        self.position = (self.position + volume / channel.volume()).clamp(0.0, 1.0);
    }
}

/// One interface between a droplet and the continuous phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropletBoundary {
    pub position: ChannelPosition,
    /// Whether the droplet body lies towards the channel's node0.
    pub volume_towards0: bool,
    /// Volumetric rate of the interface. Positive moves away from the
    /// droplet body, negative moves into it.
    pub flow_rate: f64,
    pub state: BoundaryState,
}

impl DropletBoundary {
    pub fn new(channel_id: ChannelId, position: f64, volume_towards0: bool) -> Self {
        Self {
            position: ChannelPosition::new(channel_id, position),
            volume_towards0,
            flow_rate: 0.0,
            state: BoundaryState::Normal,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.position.channel_id
    }

    /// The channel end on the droplet side.
    pub fn reference_node(&self, channel: &Channel) -> NodeId {
        if self.volume_towards0 {
            channel.node0_id
        } else {
            channel.node1_id
        }
    }

    /// The channel end away from the droplet.
    pub fn opposite_node(&self, channel: &Channel) -> NodeId {
        if self.volume_towards0 {
            channel.node1_id
        } else {
            channel.node0_id
        }
    }

    /// Droplet volume between the boundary and its reference node.
    pub fn body_volume(&self, channel: &Channel) -> f64 {
        if self.volume_towards0 {
            self.position.volume_towards0(channel)
        } else {
            self.position.volume_towards1(channel)
        }
    }

    /// Carrier volume between the boundary and its opposite node.
    pub fn free_volume(&self, channel: &Channel) -> f64 {
        channel.volume() - self.body_volume(channel)
    }

    /// Channel flow rate oriented so that positive means flow away from the
    /// droplet body through this boundary.
    pub fn oriented(&self, channel_flow: f64) -> f64 {
        if self.volume_towards0 {
            channel_flow
        } else {
            -channel_flow
        }
    }

    /// Time until the boundary reaches a node at its current rate.
    /// Infinite when the boundary does not move. Rates derived from
    /// negligible channel flows are already exactly zero, see
    /// [`FlowField::is_negligible`](crate::solver::FlowField::is_negligible).
    pub fn time_to_node(&self, channel: &Channel) -> f64 {
        if self.state != BoundaryState::Normal || self.flow_rate == 0.0 {
            f64::INFINITY
        } else if self.flow_rate > 0.0 {
            self.free_volume(channel) / self.flow_rate
        } else {
            self.body_volume(channel) / -self.flow_rate
        }
    }

    /// Move the boundary by its rate over `dt`, clamped to the channel.
    pub fn advance(&mut self, channel: &Channel, dt: f64) {
        let shift = self.oriented(self.flow_rate) * dt;
        self.position.shift_by_volume(channel, shift);
    }

    /// Place the boundary at the end of `channel` touching `node`.
    pub fn place_at(&mut self, channel: &Channel, node: NodeId, volume_towards0: bool) {
        self.position = ChannelPosition::new(channel.id, channel.end_position(node));
        self.volume_towards0 = volume_towards0;
        self.flow_rate = 0.0;
        self.state = BoundaryState::Normal;
    }
}

/// Full topology of one droplet at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropletPosition {
    pub boundaries: Vec<DropletBoundary>,
    /// Every channel the droplet occupies, in id order. Channels without a
    /// boundary in `boundaries` are completely filled.
    pub channel_ids: Vec<ChannelId>,
    pub state: DropletState,
}

impl DropletPosition {
    pub fn pending() -> Self {
        Self {
            boundaries: Vec::new(),
            channel_ids: Vec::new(),
            state: DropletState::Injection,
        }
    }

    /// Position of a droplet that no longer occupies any channel.
    pub fn gone() -> Self {
        Self {
            state: DropletState::Sink,
            ..Self::pending()
        }
    }

    /// Channels occupied without a boundary inside them.
    pub fn filled_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channel_ids
            .iter()
            .copied()
            .filter(|id| self.boundaries.iter().all(|b| b.channel_id() != *id))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A droplet and its lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Droplet {
    pub id: DropletId,
    pub name: String,
    pub volume: f64,
    pub fluid_id: FluidId,
    /// Droplets absorbed by this one. Only grows.
    pub merged_droplet_ids: BTreeSet<DropletId>,
    /// The droplet this one broke off from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_from: Option<DropletId>,
    /// The droplet that absorbed this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<DropletId>,
}

impl Droplet {
    pub fn new(id: DropletId, fluid_id: FluidId, volume: f64) -> Self {
        Self {
            id,
            name: format!("droplet {}", id.0),
            volume,
            fluid_id,
            merged_droplet_ids: BTreeSet::new(),
            split_from: None,
            merged_into: None,
        }
    }
}

/// When and where a droplet enters the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Injection {
    pub id: InjectionId,
    pub droplet_id: DropletId,
    pub time: f64,
    /// Center of the droplet at injection.
    pub position: ChannelPosition,
}

/// Relative extent `(tail, head)` of a droplet of `volume` centred at
/// `position` in `channel`.
pub fn injection_span(channel: &Channel, volume: f64, position: f64) -> (f64, f64) {
    let half = volume / channel.volume() / 2.0;
    (position - half, position + half)
}

/// Relative distance below which two spans along a channel count as
/// touching rather than overlapping.
pub const SPAN_TOLERANCE: f64 = 1e-9;

/// Whether two `(low, high)` spans along the same channel share more than a
/// touching end.
pub fn spans_overlap(a: (f64, f64), b: (f64, f64)) -> bool {
    a.0 < b.1 - SPAN_TOLERANCE && b.0 < a.1 - SPAN_TOLERANCE
}
