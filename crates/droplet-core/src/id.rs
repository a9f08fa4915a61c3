use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a droplet boundary in the tracker's boundary arena.
    pub struct BoundaryKey;
}

/// Identifies a node of the chip. Nodes are implicit: they exist as soon as
/// a channel or pump references them. Negative ids are allowed and `-1` is
/// conventionally the outside-world ground/sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i32);

/// Identifies a channel. Shares its counter with [`PumpId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

/// Identifies a flow-rate or pressure pump. Shares its counter with
/// [`ChannelId`], so a raw id is unique across channels and pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PumpId(pub u32);

/// Identifies a fluid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FluidId(pub u32);

/// Identifies a droplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DropletId(pub u32);

/// Identifies an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InjectionId(pub u32);

impl NodeId {
    /// The outside-world node used by terminal channels and pumps.
    pub const OUTSIDE: NodeId = NodeId(-1);
}

// Raw element ids key the flow-rate map of a recorded state.
impl From<ChannelId> for u32 {
    fn from(id: ChannelId) -> u32 {
        id.0
    }
}

impl From<PumpId> for u32 {
    fn from(id: PumpId) -> u32 {
        id.0
    }
}
