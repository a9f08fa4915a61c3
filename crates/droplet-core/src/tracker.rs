//! Droplet tracker: owns every droplet and the boundaries of its body.
//!
//! # Design
//!
//! - Boundaries live in a `SlotMap` arena keyed by [`BoundaryKey`]. Each
//!   droplet body lists its boundary keys plus the channels it fills
//!   completely. No boundary owns a reference to a channel or a droplet.
//! - A boundary *touches* its reference node when no other boundary of the
//!   same droplet lies between it and that node. Body segments touching a
//!   node are what routing, merging and splitting reason about.
//! - Boundary rates come from averaging the droplet's total inflow and
//!   outflow, so a moving droplet keeps its volume.
//! - Droplets leave active tracking when they exit through a sink or are
//!   absorbed by a merge. An exited droplet's last position is kept until
//!   the next snapshot so the recorded state shows the exit.

use std::collections::{BTreeMap, BTreeSet};

use slotmap::SlotMap;
use tracing::{debug, info, warn};

use crate::chip::{Channel, ChannelType, Chip, ChipError};
use crate::event::ZERO_TIME;
use crate::droplet::{
    injection_span, spans_overlap, BoundaryState, Droplet, DropletBoundary, DropletPosition,
    DropletState, Injection,
};
use crate::fluid::FluidTable;
use crate::id::{BoundaryKey, ChannelId, DropletId, NodeId};
use crate::solver::FlowField;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A structural change applied by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyChange {
    Injected { droplet: DropletId, channel: ChannelId },
    /// A front reached a node and continued into these channels.
    Entered { droplet: DropletId, channels: Vec<ChannelId> },
    /// A front reached a node without any outflow channel.
    Blocked { droplet: DropletId, node: NodeId },
    /// A front left the network through a sink.
    Draining { droplet: DropletId, sink: NodeId },
    /// A rear interface followed the body into the next channel.
    Followed { droplet: DropletId, channel: ChannelId },
    /// A rear interface vanished at a node joining several body segments.
    Retracted { droplet: DropletId, node: NodeId },
    Exited { droplet: DropletId },
    Merged { survivor: DropletId, absorbed: DropletId },
    Split { droplet: DropletId, fragments: Vec<DropletId> },
    Trapped { droplet: DropletId },
    Released { droplet: DropletId },
}

/// A droplet whose boundaries disagree with its declared volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeMismatch {
    pub droplet: DropletId,
    pub declared: f64,
    pub implied: f64,
}

#[derive(Debug, Clone)]
struct Tracked {
    droplet: DropletId,
    boundary: DropletBoundary,
}

#[derive(Debug, Clone)]
struct Body {
    state: DropletState,
    boundaries: Vec<BoundaryKey>,
    filled: BTreeSet<ChannelId>,
    /// Channels through which the body leaves into a sink.
    exits: BTreeSet<ChannelId>,
    stalled_since: Option<f64>,
}

impl Body {
    fn new(state: DropletState) -> Self {
        Self {
            state,
            boundaries: Vec::new(),
            filled: BTreeSet::new(),
            exits: BTreeSet::new(),
            stalled_since: None,
        }
    }

    fn is_active(&self) -> bool {
        matches!(self.state, DropletState::Network | DropletState::Trapped)
    }

    fn is_draining(&self) -> bool {
        !self.exits.is_empty()
    }
}

/// A piece of a droplet body touching a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Boundary(BoundaryKey),
    Filled(ChannelId),
}

/// A stretch of droplet body along one channel. Speeds are in relative
/// length per second, zero for an end resting at a node.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Extent {
    low: f64,
    low_speed: f64,
    high: f64,
    high_speed: f64,
}

impl Extent {
    /// Time until the stretch no longer overlaps `(tail, head)`.
    fn time_to_clear(&self, (tail, head): (f64, f64)) -> f64 {
        let ahead = if self.low_speed > 0.0 {
            (head - self.low) / self.low_speed
        } else {
            f64::INFINITY
        };
        let behind = if self.high_speed < 0.0 {
            (self.high - tail) / -self.high_speed
        } else {
            f64::INFINITY
        };
        ahead.min(behind)
    }
}

fn channel_of(chip: &Chip, id: ChannelId) -> Result<&Channel, ChipError> {
    chip.channel(id).ok_or(ChipError::UnknownChannel(id))
}

/// Sort key placing a body-opening boundary before a body-closing one at
/// equal positions.
fn along_channel(a: &DropletBoundary, b: &DropletBoundary) -> std::cmp::Ordering {
    a.position
        .position
        .total_cmp(&b.position.position)
        .then(a.volume_towards0.cmp(&b.volume_towards0))
}

/// Droplet volume inside one channel given that droplet's boundaries there.
pub fn body_volume_in(channel: &Channel, boundaries: &[DropletBoundary]) -> f64 {
    let mut sorted: Vec<&DropletBoundary> = boundaries.iter().collect();
    sorted.sort_by(|a, b| along_channel(a, b));

    let mut covered = 0.0;
    let mut previous = 0.0;
    for b in &sorted {
        if b.volume_towards0 {
            covered += b.position.position - previous;
        }
        previous = b.position.position;
    }
    if let Some(last) = sorted.last() {
        if !last.volume_towards0 {
            covered += 1.0 - last.position.position;
        }
    }
    covered * channel.volume()
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Owns droplet records and the topology of every droplet in the network.
#[derive(Debug, Clone, Default)]
pub struct DropletTracker {
    droplets: BTreeMap<DropletId, Droplet>,
    bodies: BTreeMap<DropletId, Body>,
    boundaries: SlotMap<BoundaryKey, Tracked>,
    next_droplet_id: u32,
    exited: BTreeMap<DropletId, DropletPosition>,
}

impl DropletTracker {
    /// Track the given droplets, all waiting for injection.
    pub fn new(droplets: impl IntoIterator<Item = Droplet>) -> Self {
        let droplets: BTreeMap<DropletId, Droplet> =
            droplets.into_iter().map(|d| (d.id, d)).collect();
        let next_droplet_id = droplets.keys().next_back().map_or(0, |id| id.0 + 1);
        let bodies = droplets
            .keys()
            .map(|id| (*id, Body::new(DropletState::Injection)))
            .collect();
        Self {
            droplets,
            bodies,
            boundaries: SlotMap::with_key(),
            next_droplet_id,
            exited: BTreeMap::new(),
        }
    }

    // -- Queries --

    pub fn droplet(&self, id: DropletId) -> Option<&Droplet> {
        self.droplets.get(&id)
    }

    pub fn droplets(&self) -> impl Iterator<Item = &Droplet> {
        self.droplets.values()
    }

    /// Lifecycle state. Droplets no longer tracked report
    /// [`DropletState::Sink`], whether they drained into a sink or were
    /// absorbed by a merge. [`Droplet::merged_into`] tells the two apart.
    pub fn state(&self, id: DropletId) -> Option<DropletState> {
        if !self.droplets.contains_key(&id) {
            return None;
        }
        Some(self.bodies.get(&id).map_or(DropletState::Sink, |b| b.state))
    }

    /// Number of droplets currently in `state`.
    pub fn count_in(&self, state: DropletState) -> usize {
        self.bodies.values().filter(|b| b.state == state).count()
    }

    pub fn boundary(&self, key: BoundaryKey) -> Option<(DropletId, &DropletBoundary)> {
        self.boundaries.get(key).map(|t| (t.droplet, &t.boundary))
    }

    /// Boundaries of droplets moving in the network, in droplet order.
    pub fn network_boundaries(
        &self,
    ) -> impl Iterator<Item = (BoundaryKey, DropletId, &DropletBoundary)> + '_ {
        self.bodies
            .iter()
            .filter(|(_, body)| body.state == DropletState::Network)
            .flat_map(move |(id, body)| {
                body.boundaries
                    .iter()
                    .filter_map(move |k| self.boundaries.get(*k).map(|t| (*k, *id, &t.boundary)))
            })
    }

    /// Boundaries of droplets moving or trapped in the network, in droplet
    /// order.
    pub fn active_boundaries(
        &self,
    ) -> impl Iterator<Item = (BoundaryKey, DropletId, &DropletBoundary)> + '_ {
        self.bodies
            .iter()
            .filter(|(_, body)| body.is_active())
            .flat_map(move |(id, body)| {
                body.boundaries
                    .iter()
                    .filter_map(move |k| self.boundaries.get(*k).map(|t| (*k, *id, &t.boundary)))
            })
    }

    /// Current position of a tracked droplet.
    pub fn position(&self, id: DropletId) -> Option<DropletPosition> {
        self.bodies.get(&id).map(|body| self.position_of(body))
    }

    fn position_of(&self, body: &Body) -> DropletPosition {
        let boundaries: Vec<DropletBoundary> = body
            .boundaries
            .iter()
            .filter_map(|k| self.boundaries.get(*k).map(|t| t.boundary))
            .collect();
        let mut channel_ids: BTreeSet<ChannelId> = body.filled.clone();
        channel_ids.extend(boundaries.iter().map(|b| b.channel_id()));
        DropletPosition {
            boundaries,
            channel_ids: channel_ids.into_iter().collect(),
            state: body.state,
        }
    }

    /// Positions of all tracked droplets plus those that exited since the
    /// previous snapshot.
    pub fn snapshot(&mut self) -> BTreeMap<DropletId, DropletPosition> {
        let mut positions = std::mem::take(&mut self.exited);
        for (id, body) in &self.bodies {
            positions.insert(*id, self.position_of(body));
        }
        positions
    }

    /// Volume implied by the boundaries and filled channels of a droplet.
    pub fn implied_volume(&self, chip: &Chip, id: DropletId) -> Option<f64> {
        let body = self.bodies.get(&id)?;
        Some(self.body_volume(chip, body))
    }

    fn body_volume(&self, chip: &Chip, body: &Body) -> f64 {
        self.volumes_by_channel(chip, body).values().sum()
    }

    fn volumes_by_channel(&self, chip: &Chip, body: &Body) -> BTreeMap<ChannelId, f64> {
        let mut per_channel: BTreeMap<ChannelId, Vec<DropletBoundary>> = BTreeMap::new();
        for k in &body.boundaries {
            if let Some(t) = self.boundaries.get(*k) {
                per_channel
                    .entry(t.boundary.channel_id())
                    .or_default()
                    .push(t.boundary);
            }
        }
        let mut volumes = BTreeMap::new();
        for (id, list) in per_channel {
            if let Some(channel) = chip.channel(id) {
                volumes.insert(id, body_volume_in(channel, &list));
            }
        }
        for id in &body.filled {
            if let Some(channel) = chip.channel(*id) {
                volumes.insert(*id, channel.volume());
            }
        }
        volumes
    }

    /// `(channel, droplet volume inside)` for every droplet in the network.
    pub fn occupied_volumes(&self, chip: &Chip) -> Vec<(ChannelId, f64)> {
        self.bodies
            .values()
            .filter(|b| b.is_active())
            .flat_map(|b| self.volumes_by_channel(chip, b))
            .collect()
    }

    /// Check that every non-draining droplet's boundaries reproduce its
    /// declared volume within `tolerance` (relative).
    pub fn check_volumes(&self, chip: &Chip, tolerance: f64) -> Result<(), VolumeMismatch> {
        for (id, body) in &self.bodies {
            if !body.is_active() || body.is_draining() {
                continue;
            }
            let Some(droplet) = self.droplets.get(id) else {
                continue;
            };
            let implied = self.body_volume(chip, body);
            if (implied - droplet.volume).abs() > tolerance * droplet.volume {
                return Err(VolumeMismatch {
                    droplet: *id,
                    declared: droplet.volume,
                    implied,
                });
            }
        }
        Ok(())
    }

    // -- Geometry helpers --

    /// Boundaries of `droplet` in `channel`, sorted along the channel.
    fn sorted_in_channel(&self, droplet: DropletId, channel: ChannelId) -> Vec<BoundaryKey> {
        let Some(body) = self.bodies.get(&droplet) else {
            return Vec::new();
        };
        let mut keys: Vec<BoundaryKey> = body
            .boundaries
            .iter()
            .copied()
            .filter(|k| {
                self.boundaries
                    .get(*k)
                    .is_some_and(|t| t.boundary.channel_id() == channel)
            })
            .collect();
        keys.sort_by(|a, b| along_channel(&self.boundaries[*a].boundary, &self.boundaries[*b].boundary));
        keys
    }

    /// Whether the body next to boundary `key` reaches its reference node.
    fn touches_reference(&self, key: BoundaryKey) -> bool {
        let Some(t) = self.boundaries.get(key) else {
            return false;
        };
        let sorted = self.sorted_in_channel(t.droplet, t.boundary.channel_id());
        if t.boundary.volume_towards0 {
            sorted.first() == Some(&key)
        } else {
            sorted.last() == Some(&key)
        }
    }

    fn has_boundary_in(&self, droplet: DropletId, channel: ChannelId) -> bool {
        self.bodies.get(&droplet).is_some_and(|body| {
            body.boundaries.iter().any(|k| {
                self.boundaries
                    .get(*k)
                    .is_some_and(|t| t.boundary.channel_id() == channel)
            })
        })
    }

    fn occupies(&self, droplet: DropletId, channel: ChannelId) -> bool {
        self.bodies
            .get(&droplet)
            .is_some_and(|b| b.filled.contains(&channel))
            || self.has_boundary_in(droplet, channel)
    }

    /// Body segments of `droplet` touching `node`, excluding `except`.
    fn segments_at(
        &self,
        chip: &Chip,
        droplet: DropletId,
        node: NodeId,
        except: Option<BoundaryKey>,
    ) -> Vec<Segment> {
        let Some(body) = self.bodies.get(&droplet) else {
            return Vec::new();
        };
        let mut segments = Vec::new();
        for k in &body.boundaries {
            if Some(*k) == except {
                continue;
            }
            let b = &self.boundaries[*k].boundary;
            let Some(channel) = chip.channel(b.channel_id()) else {
                continue;
            };
            if b.reference_node(channel) == node && self.touches_reference(*k) {
                segments.push(Segment::Boundary(*k));
            }
        }
        for id in &body.filled {
            if chip.channel(*id).is_some_and(|c| c.touches(node)) {
                segments.push(Segment::Filled(*id));
            }
        }
        segments
    }

    fn segment_channel(&self, segment: Segment) -> Option<ChannelId> {
        match segment {
            Segment::Boundary(k) => self.boundaries.get(k).map(|t| t.boundary.channel_id()),
            Segment::Filled(id) => Some(id),
        }
    }

    /// Whether a front of `droplet` is blocked at `node`.
    fn waits_at(&self, chip: &Chip, droplet: DropletId, node: NodeId) -> bool {
        self.bodies.get(&droplet).is_some_and(|body| {
            body.boundaries.iter().any(|k| {
                self.boundaries.get(*k).is_some_and(|t| {
                    t.boundary.state == BoundaryState::WaitOutflow
                        && chip
                            .channel(t.boundary.channel_id())
                            .is_some_and(|c| t.boundary.opposite_node(c) == node)
                })
            })
        })
    }

    /// Lowest-id droplet in the network, other than `except`, whose body
    /// touches `node` or whose front waits there.
    fn droplet_touching(&self, chip: &Chip, node: NodeId, except: DropletId) -> Option<DropletId> {
        self.bodies
            .iter()
            .filter(|(id, body)| **id != except && body.is_active())
            .map(|(id, _)| *id)
            .find(|id| {
                !self.segments_at(chip, *id, node, None).is_empty() || self.waits_at(chip, *id, node)
            })
    }

    /// Channels a front of `droplet` arriving at `node` through `from` can
    /// continue into.
    fn outflow_channels(
        &self,
        chip: &Chip,
        flow: &FlowField,
        node: NodeId,
        from: ChannelId,
        droplet: DropletId,
    ) -> Vec<ChannelId> {
        chip.channels_at(node)
            .iter()
            .copied()
            .filter(|id| *id != from)
            .filter(|id| {
                chip.channel(*id)
                    .is_some_and(|c| c.channel_type == ChannelType::Normal)
            })
            .filter(|id| {
                let q = flow.outflow_at(chip, *id, node);
                q > 0.0 && !flow.is_negligible(q)
            })
            .filter(|id| !self.occupies(droplet, *id))
            .collect()
    }

    fn detach(&mut self, key: BoundaryKey) -> Option<(DropletId, DropletBoundary)> {
        let tracked = self.boundaries.remove(key)?;
        if let Some(body) = self.bodies.get_mut(&tracked.droplet) {
            body.boundaries.retain(|k| *k != key);
        }
        Some((tracked.droplet, tracked.boundary))
    }

    fn attach(&mut self, droplet: DropletId, boundary: DropletBoundary) -> BoundaryKey {
        let key = self.boundaries.insert(Tracked { droplet, boundary });
        if let Some(body) = self.bodies.get_mut(&droplet) {
            body.boundaries.push(key);
        }
        key
    }

    /// Remove a droplet from active tracking, keeping its last position
    /// for the next snapshot.
    fn retire_exited(&mut self, droplet: DropletId, mut last: DropletPosition) {
        if let Some(body) = self.bodies.remove(&droplet) {
            for k in body.boundaries {
                self.boundaries.remove(k);
            }
        }
        last.state = DropletState::Sink;
        self.exited.insert(droplet, last);
        info!(droplet = droplet.0, "droplet left the network");
    }

    // -- Injection --

    /// How long until the stretch `injection` would occupy is free of
    /// other droplets, at current boundary rates.
    ///
    /// `None` when the stretch is free now. Infinite when a droplet in the
    /// way is not moving out of it.
    pub fn injection_clearance(&self, chip: &Chip, injection: &Injection) -> Option<f64> {
        let droplet = self.droplets.get(&injection.droplet_id)?;
        let channel = chip.channel(injection.position.channel_id)?;
        let span = injection_span(channel, droplet.volume, injection.position.position);

        let mut clearance: Option<f64> = None;
        for (id, body) in &self.bodies {
            if *id == injection.droplet_id || !body.is_active() {
                continue;
            }
            let wait = if body.filled.contains(&channel.id) {
                Some(f64::INFINITY)
            } else {
                self.extents_in(channel, *id, body.state == DropletState::Network)
                    .into_iter()
                    .filter(|e| spans_overlap((e.low, e.high), span))
                    .map(|e| e.time_to_clear(span))
                    .reduce(f64::max)
            };
            if let Some(wait) = wait {
                clearance = Some(clearance.map_or(wait, |c| c.max(wait)));
            }
        }
        clearance
    }

    /// Stretches of `droplet`'s body inside `channel`.
    fn extents_in(&self, channel: &Channel, droplet: DropletId, moving: bool) -> Vec<Extent> {
        let speed = |b: &DropletBoundary| {
            if moving && b.state == BoundaryState::Normal {
                b.oriented(b.flow_rate) / channel.volume()
            } else {
                0.0
            }
        };
        let mut extents = Vec::new();
        let mut open = (0.0, 0.0);
        let mut last_opens = false;
        for k in self.sorted_in_channel(droplet, channel.id) {
            let b = &self.boundaries[k].boundary;
            let here = (b.position.position, speed(b));
            if b.volume_towards0 {
                extents.push(Extent {
                    low: open.0,
                    low_speed: open.1,
                    high: here.0,
                    high_speed: here.1,
                });
            }
            open = here;
            last_opens = !b.volume_towards0;
        }
        if last_opens {
            extents.push(Extent {
                low: open.0,
                low_speed: open.1,
                high: 1.0,
                high_speed: 0.0,
            });
        }
        extents
    }

    /// Materialise a pending droplet at its injection position.
    pub fn inject(&mut self, chip: &Chip, injection: &Injection) -> Result<TopologyChange, ChipError> {
        let id = injection.droplet_id;
        let droplet = self.droplets.get(&id).ok_or(ChipError::UnknownDroplet(id))?;
        let channel = channel_of(chip, injection.position.channel_id)?;
        let (tail, head) = injection_span(channel, droplet.volume, injection.position.position);

        let body = self.bodies.entry(id).or_insert_with(|| Body::new(DropletState::Injection));
        body.state = DropletState::Network;
        self.attach(id, DropletBoundary::new(channel.id, tail, false));
        self.attach(id, DropletBoundary::new(channel.id, head, true));
        info!(droplet = id.0, channel = channel.id.0, "droplet injected");
        Ok(TopologyChange::Injected {
            droplet: id,
            channel: channel.id,
        })
    }

    // -- Kinematics --

    /// Recompute wait states and rates of every boundary from channel flows.
    pub fn update_boundaries(&mut self, chip: &Chip, flow: &FlowField, slip: f64) {
        let ids: Vec<DropletId> = self
            .bodies
            .iter()
            .filter(|(_, b)| b.is_active())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.update_droplet(chip, flow, slip, id);
        }
    }

    fn update_droplet(&mut self, chip: &Chip, flow: &FlowField, slip: f64, id: DropletId) {
        let Some(body) = self.bodies.get(&id) else {
            return;
        };
        let keys = body.boundaries.clone();
        let draining = body.is_draining();
        let threshold = flow.zero_flow_threshold();

        // Round-off flows are snapped to zero so they never drive a
        // boundary.
        let oriented = |tracker: &Self, k: BoundaryKey| -> f64 {
            let b = &tracker.boundaries[k].boundary;
            let q = b.oriented(flow.channel_flow(b.channel_id()));
            if q.abs() <= threshold {
                0.0
            } else {
                q
            }
        };

        // Fronts waiting at a node resume once flow reverses, an outflow
        // channel opens, or another droplet reaches the node.
        for k in &keys {
            let b = self.boundaries[*k].boundary;
            if b.state != BoundaryState::WaitOutflow {
                continue;
            }
            let Some(channel) = chip.channel(b.channel_id()) else {
                continue;
            };
            let node = b.opposite_node(channel);
            let resume = oriented(self, *k) < 0.0
                || !self
                    .outflow_channels(chip, flow, node, channel.id, id)
                    .is_empty()
                || self.droplet_touching(chip, node, id).is_some();
            if resume {
                self.boundaries[*k].boundary.state = BoundaryState::Normal;
            }
        }

        let totals = |tracker: &Self| -> (f64, f64) {
            let mut q_in = 0.0;
            let mut q_out = 0.0;
            for k in &keys {
                if tracker.boundaries[*k].boundary.state != BoundaryState::Normal {
                    continue;
                }
                let q = oriented(tracker, *k);
                if q > 0.0 {
                    q_out += q;
                } else {
                    q_in -= q;
                }
            }
            (q_in, q_out)
        };

        let (_, q_out) = totals(self);
        for k in &keys {
            let b = self.boundaries[*k].boundary;
            if b.state == BoundaryState::WaitInflow && (oriented(self, *k) > 0.0 || q_out > 0.0) {
                self.boundaries[*k].boundary.state = BoundaryState::Normal;
            }
        }
        let (q_in, q_out) = totals(self);

        if !draining && q_out == 0.0 && q_in > 0.0 {
            warn!(droplet = id.0, "droplet has inflow but no outflow, waiting");
        } else if !draining && q_in == 0.0 && q_out > 0.0 {
            warn!(droplet = id.0, "droplet has outflow but no inflow, stalled");
        }

        for k in &keys {
            let q = oriented(self, *k);
            let b = &mut self.boundaries[*k].boundary;
            if b.state != BoundaryState::Normal {
                b.flow_rate = 0.0;
                continue;
            }
            b.flow_rate = if draining {
                slip * q
            } else if q_in > 0.0 && q_out > 0.0 {
                let average = (q_in + q_out) / 2.0;
                if q > 0.0 {
                    slip * average * q / q_out
                } else {
                    slip * average * q / q_in
                }
            } else {
                if q < 0.0 && q_out == 0.0 {
                    b.state = BoundaryState::WaitInflow;
                }
                0.0
            };
        }
    }

    /// Move every boundary of every droplet in the network over `dt`.
    pub fn advance(&mut self, chip: &Chip, dt: f64) {
        for body in self.bodies.values() {
            if body.state != DropletState::Network {
                continue;
            }
            for k in &body.boundaries {
                let Some(t) = self.boundaries.get_mut(*k) else {
                    continue;
                };
                if t.boundary.state != BoundaryState::Normal {
                    continue;
                }
                if let Some(channel) = chip.channel(t.boundary.channel_id()) {
                    t.boundary.advance(channel, dt);
                }
            }
        }
    }

    // -- Trapping --

    fn is_stalled(&self, body: &Body) -> bool {
        !body.boundaries.is_empty()
            && body
                .boundaries
                .iter()
                .all(|k| self.boundaries.get(*k).is_none_or(|t| t.boundary.flow_rate == 0.0))
    }

    /// Trap droplets that have not moved for `trap_after` and release
    /// trapped droplets that move again.
    ///
    /// A droplet counts as stalled when none of its boundaries moves,
    /// whether a front waits at a node or the carrier around it stands
    /// still.
    pub fn update_trapping(&mut self, now: f64, trap_after: f64) -> Vec<TopologyChange> {
        let mut changes = Vec::new();
        let ids: Vec<DropletId> = self.bodies.keys().copied().collect();
        for id in ids {
            let stalled = match self.bodies.get(&id) {
                Some(body) => self.is_stalled(body),
                None => continue,
            };
            let Some(body) = self.bodies.get_mut(&id) else {
                continue;
            };
            match body.state {
                DropletState::Network if stalled => {
                    let since = *body.stalled_since.get_or_insert(now);
                    if now - since + ZERO_TIME >= trap_after {
                        body.state = DropletState::Trapped;
                        info!(droplet = id.0, "droplet trapped");
                        changes.push(TopologyChange::Trapped { droplet: id });
                    }
                }
                DropletState::Network => body.stalled_since = None,
                DropletState::Trapped if !stalled => {
                    body.state = DropletState::Network;
                    body.stalled_since = None;
                    info!(droplet = id.0, "droplet released");
                    changes.push(TopologyChange::Released { droplet: id });
                }
                _ => {}
            }
        }
        changes
    }

    /// Absolute times at which stalled droplets become trapped.
    pub fn trap_deadlines(&self, trap_after: f64) -> Vec<(DropletId, f64)> {
        self.bodies
            .iter()
            .filter(|(_, b)| b.state == DropletState::Network)
            .filter_map(|(id, b)| b.stalled_since.map(|since| (*id, since + trap_after)))
            .collect()
    }

    /// Droplets in the network that cannot move and are not trapped yet.
    pub fn stalled_in_network(&self) -> Vec<DropletId> {
        self.bodies
            .iter()
            .filter(|(_, b)| b.state == DropletState::Network && self.is_stalled(b))
            .map(|(id, _)| *id)
            .collect()
    }

    // -- Events --

    /// A front reached the node opposite its droplet body.
    pub fn apply_head(
        &mut self,
        chip: &Chip,
        flow: &FlowField,
        fluids: &mut FluidTable,
        key: BoundaryKey,
    ) -> Result<Vec<TopologyChange>, ChipError> {
        let Some((droplet, boundary)) = self.boundary(key).map(|(d, b)| (d, *b)) else {
            return Ok(Vec::new());
        };
        let channel = channel_of(chip, boundary.channel_id())?;
        let node = boundary.opposite_node(channel);
        self.boundaries[key].boundary.position.position = channel.end_position(node);

        if let Some(other) = self.droplet_touching(chip, node, droplet) {
            // A rear of the other droplet still in this channel sits at the
            // node, right in front of the arriving front.
            let mut removed = vec![key];
            removed.extend(
                self.segments_at(chip, other, node, None)
                    .into_iter()
                    .filter_map(|segment| match segment {
                        Segment::Boundary(k) => Some(k),
                        Segment::Filled(_) => None,
                    })
                    .filter(|k| {
                        self.boundaries
                            .get(*k)
                            .is_some_and(|t| t.boundary.channel_id() == channel.id)
                    }),
            );
            let change = self.merge(fluids, droplet, other, &removed, &[channel.id])?;
            return Ok(vec![change]);
        }

        if chip.is_sink(node) {
            let last = self.position(droplet);
            self.detach(key);
            let still_inside = self.has_boundary_in(droplet, channel.id);
            let mut emptied = false;
            if let Some(body) = self.bodies.get_mut(&droplet) {
                if !still_inside {
                    body.filled.insert(channel.id);
                }
                body.exits.insert(channel.id);
                emptied = body.boundaries.is_empty();
            }
            debug!(droplet = droplet.0, node = node.0, "front reached sink");
            let mut changes = vec![TopologyChange::Draining {
                droplet,
                sink: node,
            }];
            if let (true, Some(last)) = (emptied, last) {
                self.retire_exited(droplet, last);
                changes.push(TopologyChange::Exited { droplet });
            }
            return Ok(changes);
        }

        let targets = self.outflow_channels(chip, flow, node, channel.id, droplet);
        if targets.is_empty() {
            let b = &mut self.boundaries[key].boundary;
            b.state = BoundaryState::WaitOutflow;
            b.flow_rate = 0.0;
            debug!(droplet = droplet.0, node = node.0, "front blocked");
            return Ok(vec![TopologyChange::Blocked { droplet, node }]);
        }

        let others_in_channel = self
            .sorted_in_channel(droplet, channel.id)
            .into_iter()
            .any(|k| k != key);
        if !others_in_channel {
            if let Some(body) = self.bodies.get_mut(&droplet) {
                body.filled.insert(channel.id);
            }
        }

        for (i, target) in targets.iter().enumerate() {
            let next = channel_of(chip, *target)?;
            let volume_towards0 = next.node0_id == node;
            if i == 0 {
                self.boundaries[key].boundary.place_at(next, node, volume_towards0);
            } else {
                let mut b = DropletBoundary::new(next.id, 0.0, volume_towards0);
                b.place_at(next, node, volume_towards0);
                self.attach(droplet, b);
            }
        }
        debug!(droplet = droplet.0, node = node.0, branches = targets.len(), "front entered");
        Ok(vec![TopologyChange::Entered {
            droplet,
            channels: targets,
        }])
    }

    /// A rear interface reached the reference node of its channel.
    pub fn apply_tail(
        &mut self,
        chip: &Chip,
        flow: &FlowField,
        key: BoundaryKey,
    ) -> Result<Vec<TopologyChange>, ChipError> {
        let Some((droplet, boundary)) = self.boundary(key).map(|(d, b)| (d, *b)) else {
            return Ok(Vec::new());
        };
        let channel = channel_of(chip, boundary.channel_id())?;
        let node = boundary.reference_node(channel);
        let segments = self.segments_at(chip, droplet, node, Some(key));

        match segments.as_slice() {
            [] => {
                let mut last = self.position(droplet);
                self.detach(key);
                if let Some(body) = self.bodies.get_mut(&droplet) {
                    body.exits.remove(&channel.id);
                    if body.boundaries.is_empty() {
                        if body.filled.is_empty() && body.exits.is_empty() && !chip.is_sink(node) {
                            warn!(droplet = droplet.0, "droplet body collapsed");
                        }
                        if let Some(last) = last.take() {
                            self.retire_exited(droplet, last);
                        }
                        return Ok(vec![TopologyChange::Exited { droplet }]);
                    }
                }
                Ok(vec![TopologyChange::Retracted { droplet, node }])
            }
            [segment] => {
                let Some(next_id) = self.segment_channel(*segment) else {
                    return Ok(Vec::new());
                };
                let next = channel_of(chip, next_id)?;
                if let (Segment::Filled(id), Some(body)) = (segment, self.bodies.get_mut(&droplet)) {
                    body.filled.remove(id);
                }
                if let Some(body) = self.bodies.get_mut(&droplet) {
                    body.exits.remove(&channel.id);
                }
                let volume_towards0 = next.node0_id != node;
                self.boundaries[key]
                    .boundary
                    .place_at(next, node, volume_towards0);
                debug!(droplet = droplet.0, channel = next.id.0, "rear followed");
                Ok(vec![TopologyChange::Followed {
                    droplet,
                    channel: next.id,
                }])
            }
            many => {
                let all_leaving = many.iter().all(|s| {
                    self.segment_channel(*s)
                        .is_some_and(|c| {
                            let q = flow.outflow_at(chip, c, node);
                            q >= 0.0 || flow.is_negligible(q)
                        })
                });
                self.detach(key);
                if let Some(body) = self.bodies.get_mut(&droplet) {
                    body.exits.remove(&channel.id);
                }
                let mut changes = vec![TopologyChange::Retracted { droplet, node }];
                if all_leaving {
                    if let Some(split) = self.split(chip, droplet, node)? {
                        changes.push(split);
                    }
                }
                Ok(changes)
            }
        }
    }

    /// Two facing boundaries of different droplets met inside a channel.
    pub fn merge_in_channel(
        &mut self,
        fluids: &mut FluidTable,
        first: BoundaryKey,
        second: BoundaryKey,
    ) -> Result<Vec<TopologyChange>, ChipError> {
        let (Some((d0, b0)), Some((d1, _))) = (
            self.boundary(first).map(|(d, b)| (d, *b)),
            self.boundary(second).map(|(d, b)| (d, *b)),
        ) else {
            return Ok(Vec::new());
        };
        if d0 == d1 {
            return Ok(Vec::new());
        }
        let change = self.merge(fluids, d0, d1, &[first, second], &[b0.channel_id()])?;
        Ok(vec![change])
    }

    /// Join two droplets. The lower id survives and absorbs the other.
    fn merge(
        &mut self,
        fluids: &mut FluidTable,
        d0: DropletId,
        d1: DropletId,
        removed: &[BoundaryKey],
        joined: &[ChannelId],
    ) -> Result<TopologyChange, ChipError> {
        let survivor = d0.min(d1);
        let absorbed = d0.max(d1);
        let s = self.droplets.get(&survivor).ok_or(ChipError::UnknownDroplet(survivor))?;
        let a = self.droplets.get(&absorbed).ok_or(ChipError::UnknownDroplet(absorbed))?;
        let (volume, merged_ids) = (s.volume + a.volume, a.merged_droplet_ids.clone());
        let fluid = fluids
            .mix(s.fluid_id, s.volume, a.fluid_id, a.volume)
            .ok_or(ChipError::UnknownFluid(a.fluid_id))?;

        for k in removed {
            self.detach(*k);
        }
        let absorbed_body = self.bodies.remove(&absorbed);
        self.exited.insert(absorbed, DropletPosition::gone());
        if let Some(other) = absorbed_body {
            for k in &other.boundaries {
                if let Some(t) = self.boundaries.get_mut(*k) {
                    t.droplet = survivor;
                }
            }
            if let Some(body) = self.bodies.get_mut(&survivor) {
                body.boundaries.extend(other.boundaries);
                body.filled.extend(other.filled);
                body.exits.extend(other.exits);
            }
        }
        for channel in joined {
            if !self.has_boundary_in(survivor, *channel) {
                if let Some(body) = self.bodies.get_mut(&survivor) {
                    body.filled.insert(*channel);
                }
            }
        }
        if let Some(body) = self.bodies.get_mut(&survivor) {
            body.state = DropletState::Network;
            body.stalled_since = None;
        }

        if let Some(record) = self.droplets.get_mut(&survivor) {
            record.volume = volume;
            record.fluid_id = fluid;
            record.merged_droplet_ids.insert(absorbed);
            record.merged_droplet_ids.extend(merged_ids);
        }
        if let Some(record) = self.droplets.get_mut(&absorbed) {
            record.merged_into = Some(survivor);
        }
        info!(survivor = survivor.0, absorbed = absorbed.0, "droplets merged");
        Ok(TopologyChange::Merged { survivor, absorbed })
    }

    /// Break `droplet` into one droplet per body component once `node` no
    /// longer connects them. The component with the lowest channel id keeps
    /// the original id.
    fn split(
        &mut self,
        chip: &Chip,
        droplet: DropletId,
        node: NodeId,
    ) -> Result<Option<TopologyChange>, ChipError> {
        let Some(body) = self.bodies.get(&droplet) else {
            return Ok(None);
        };

        let mut entities: Vec<Segment> = body.boundaries.iter().map(|k| Segment::Boundary(*k)).collect();
        entities.extend(body.filled.iter().map(|c| Segment::Filled(*c)));

        // Union-find over body entities, linked by shared nodes other than
        // `node` and by body stretches between two boundaries of a channel.
        let mut parent: Vec<usize> = (0..entities.len()).collect();
        fn find(parent: &mut [usize], i: usize) -> usize {
            let mut root = i;
            while parent[root] != root {
                root = parent[root];
            }
            parent[i] = root;
            root
        }
        let mut touched: Vec<Vec<NodeId>> = Vec::with_capacity(entities.len());
        for entity in &entities {
            let nodes = match entity {
                Segment::Boundary(k) => {
                    let b = &self.boundaries[*k].boundary;
                    let channel = channel_of(chip, b.channel_id())?;
                    if self.touches_reference(*k) {
                        vec![b.reference_node(channel)]
                    } else {
                        Vec::new()
                    }
                }
                Segment::Filled(id) => {
                    let channel = channel_of(chip, *id)?;
                    vec![channel.node0_id, channel.node1_id]
                }
            };
            touched.push(nodes.into_iter().filter(|n| *n != node).collect());
        }
        for i in 0..entities.len() {
            for j in (i + 1)..entities.len() {
                let shares_node = touched[i].iter().any(|n| touched[j].contains(n));
                let same_stretch = match (entities[i], entities[j]) {
                    (Segment::Boundary(a), Segment::Boundary(b)) => {
                        let (ba, bb) = (&self.boundaries[a].boundary, &self.boundaries[b].boundary);
                        ba.channel_id() == bb.channel_id()
                            && !self.touches_reference(a)
                            && !self.touches_reference(b)
                    }
                    _ => false,
                };
                if shares_node || same_stretch {
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    parent[ri] = rj;
                }
            }
        }

        let mut components: BTreeMap<usize, Vec<Segment>> = BTreeMap::new();
        for (i, entity) in entities.iter().enumerate() {
            let root = find(&mut parent, i);
            components.entry(root).or_default().push(*entity);
        }
        if components.len() < 2 {
            return Ok(None);
        }
        let mut components: Vec<Vec<Segment>> = components.into_values().collect();
        components.sort_by_key(|c| c.iter().filter_map(|s| self.segment_channel(*s)).min());

        // Close every component with a new rear interface at `node`.
        let mut closing: Vec<Vec<DropletBoundary>> = Vec::with_capacity(components.len());
        for component in &components {
            let mut rears = Vec::new();
            for segment in component {
                let touches_node = match segment {
                    Segment::Boundary(k) => {
                        let b = &self.boundaries[*k].boundary;
                        let channel = channel_of(chip, b.channel_id())?;
                        b.reference_node(channel) == node && self.touches_reference(*k)
                    }
                    Segment::Filled(id) => channel_of(chip, *id)?.touches(node),
                };
                if touches_node {
                    if let Some(id) = self.segment_channel(*segment) {
                        let channel = channel_of(chip, id)?;
                        let mut rear = DropletBoundary::new(id, 0.0, false);
                        rear.place_at(channel, node, channel.node0_id != node);
                        rears.push(rear);
                    }
                }
            }
            closing.push(rears);
        }

        let Some(parent_body) = self.bodies.remove(&droplet) else {
            return Ok(None);
        };
        let Some(record) = self.droplets.get(&droplet).cloned() else {
            return Ok(None);
        };

        let mut fragments = Vec::new();
        let mut pieces: Vec<(DropletId, Body)> = Vec::new();
        for (index, component) in components.iter().enumerate() {
            let id = if index == 0 {
                droplet
            } else {
                let id = DropletId(self.next_droplet_id);
                self.next_droplet_id += 1;
                fragments.push(id);
                id
            };
            let mut body = Body::new(DropletState::Network);
            for segment in component {
                match segment {
                    Segment::Boundary(k) => {
                        if let Some(t) = self.boundaries.get_mut(*k) {
                            t.droplet = id;
                        }
                        body.boundaries.push(*k);
                    }
                    Segment::Filled(c) => {
                        body.filled.insert(*c);
                    }
                }
            }
            for rear in &closing[index] {
                body.filled.remove(&rear.channel_id());
            }
            let channels: BTreeSet<ChannelId> = component
                .iter()
                .filter_map(|s| self.segment_channel(*s))
                .collect();
            body.exits = parent_body.exits.intersection(&channels).copied().collect();
            pieces.push((id, body));
        }
        for (index, (id, body)) in pieces.into_iter().enumerate() {
            self.bodies.insert(id, body);
            for rear in &closing[index] {
                self.attach(id, *rear);
            }
        }

        // Share the declared volume between the fragments.
        let all: Vec<DropletId> = std::iter::once(droplet).chain(fragments.iter().copied()).collect();
        let implied: Vec<f64> = all
            .iter()
            .map(|id| self.implied_volume(chip, *id).unwrap_or(0.0))
            .collect();
        let draining: Vec<bool> = all
            .iter()
            .map(|id| self.bodies.get(id).is_some_and(Body::is_draining))
            .collect();
        let volumes = share_volume(record.volume, &implied, &draining);

        for (index, id) in all.iter().enumerate() {
            if index == 0 {
                if let Some(r) = self.droplets.get_mut(id) {
                    r.volume = volumes[0];
                }
            } else {
                let mut fragment = Droplet::new(*id, record.fluid_id, volumes[index]);
                fragment.name = format!("{} / {}", record.name, index);
                fragment.split_from = Some(droplet);
                self.droplets.insert(*id, fragment);
            }
        }

        info!(droplet = droplet.0, fragments = fragments.len(), "droplet split");
        Ok(Some(TopologyChange::Split {
            droplet,
            fragments,
        }))
    }
}

/// Distribute `declared` over fragments in proportion to their implied
/// volumes. Draining fragments share what the others do not claim. The
/// shares always sum to `declared`.
fn share_volume(declared: f64, implied: &[f64], draining: &[bool]) -> Vec<f64> {
    let n = implied.len();
    let mut shares = vec![0.0; n];
    if n == 0 {
        return shares;
    }
    let any_draining = draining.iter().any(|d| *d);
    let total: f64 = implied.iter().sum();

    if !any_draining {
        for i in 0..n {
            shares[i] = if total > 0.0 {
                declared * implied[i] / total
            } else {
                declared / n as f64
            };
        }
    } else {
        let solid: f64 = (0..n).filter(|i| !draining[*i]).map(|i| implied[i]).sum();
        let rest = (declared - solid).max(0.0);
        let draining_total: f64 = (0..n).filter(|i| draining[*i]).map(|i| implied[i]).sum();
        let draining_count = draining.iter().filter(|d| **d).count() as f64;
        for i in 0..n {
            shares[i] = if !draining[i] {
                implied[i]
            } else if draining_total > 0.0 {
                rest * implied[i] / draining_total
            } else {
                rest / draining_count
            };
        }
    }

    let assigned: f64 = shares[..n - 1].iter().sum();
    shares[n - 1] = declared - assigned;
    shares
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::droplet::ChannelPosition;
    use crate::id::{FluidId, InjectionId};
    use crate::resistance::{channel_resistances, RectangularDuct};
    use crate::solver::NodalSystem;
    use crate::test_utils::*;

    fn solve(chip: &Chip, tracker: &DropletTracker) -> FlowField {
        let model = RectangularDuct::new(1e-3);
        let r = channel_resistances(chip, &model, tracker.occupied_volumes(chip));
        NodalSystem::new(chip).unwrap().solve(chip, &r).unwrap()
    }

    fn injected(chip: &Chip, channel: u32, position: f64, volume: f64) -> DropletTracker {
        let mut tracker = DropletTracker::new([Droplet::new(DropletId(0), FluidId(1), volume)]);
        tracker
            .inject(
                chip,
                &Injection {
                    id: InjectionId(0),
                    droplet_id: DropletId(0),
                    time: 0.0,
                    position: ChannelPosition::new(ChannelId(channel), position),
                },
            )
            .unwrap();
        tracker
    }

    /// Tracker with one droplet of fluid 1 per `(channel, centre, volume)`,
    /// all injected.
    fn injected_all(chip: &Chip, droplets: &[(u32, f64, f64)]) -> DropletTracker {
        let mut tracker = DropletTracker::new(
            droplets
                .iter()
                .enumerate()
                .map(|(i, (_, _, volume))| Droplet::new(DropletId(i as u32), FluidId(1), *volume)),
        );
        for (i, (channel, position, _)) in droplets.iter().enumerate() {
            tracker
                .inject(
                    chip,
                    &Injection {
                        id: InjectionId(i as u32),
                        droplet_id: DropletId(i as u32),
                        time: 0.0,
                        position: ChannelPosition::new(ChannelId(*channel), *position),
                    },
                )
                .unwrap();
        }
        tracker
    }

    fn front_of(tracker: &DropletTracker, droplet: u32) -> BoundaryKey {
        tracker
            .active_boundaries()
            .find(|(_, d, b)| *d == DropletId(droplet) && b.volume_towards0)
            .map(|(k, _, _)| k)
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Test 1: Injection straddles the insertion point
    // -----------------------------------------------------------------------
    #[test]
    fn injection_creates_boundary_pair() {
        let chip = reference_chip();
        let tracker = injected(&chip, 1, 0.5, reference_droplet_volume());
        let pos = tracker.position(DropletId(0)).unwrap();
        assert_eq!(pos.state, DropletState::Network);
        assert_eq!(pos.boundaries.len(), 2);
        assert!((pos.boundaries[0].position.position - 0.425).abs() < 1e-12);
        assert!(!pos.boundaries[0].volume_towards0);
        assert!((pos.boundaries[1].position.position - 0.575).abs() < 1e-12);
        assert!(pos.boundaries[1].volume_towards0);
        assert_eq!(pos.channel_ids, vec![ChannelId(1)]);

        let implied = tracker.implied_volume(&chip, DropletId(0)).unwrap();
        assert!((implied - reference_droplet_volume()).abs() < 1e-24);
    }

    // -----------------------------------------------------------------------
    // Test 2: Rates of a single-channel droplet follow the slip factor
    // -----------------------------------------------------------------------
    #[test]
    fn rates_use_slip_factor() {
        let chip = reference_chip();
        let mut tracker = injected(&chip, 1, 0.5, reference_droplet_volume());
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);

        let pos = tracker.position(DropletId(0)).unwrap();
        let tail = pos.boundaries[0].flow_rate;
        let head = pos.boundaries[1].flow_rate;
        assert!((head - 1.28 * 3e-11).abs() < 1e-20, "head {head}");
        assert!((tail + 1.28 * 3e-11).abs() < 1e-20, "tail {tail}");
    }

    // -----------------------------------------------------------------------
    // Test 3: Advancing preserves volume
    // -----------------------------------------------------------------------
    #[test]
    fn advance_preserves_volume() {
        let chip = reference_chip();
        let mut tracker = injected(&chip, 1, 0.5, reference_droplet_volume());
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);
        tracker.advance(&chip, 0.01);
        assert!(tracker.check_volumes(&chip, 1e-9).is_ok());

        let pos = tracker.position(DropletId(0)).unwrap();
        let shift = 1.28 * 3e-11 * 0.01 / 3e-12;
        assert!((pos.boundaries[1].position.position - (0.575 + shift)).abs() < 1e-12);
    }

    // -----------------------------------------------------------------------
    // Test 4: Front entering a single outflow channel
    // -----------------------------------------------------------------------
    #[test]
    fn head_enters_next_channel() {
        let chip = reference_chip();
        let mut fluids = reference_fluids();
        let mut tracker = injected(&chip, 1, 0.5, reference_droplet_volume());
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);
        let (key, _, b) = tracker.network_boundaries().nth(1).unwrap();
        let dt = b.time_to_node(chip.channel(ChannelId(1)).unwrap());
        assert!((dt - 0.033203125).abs() < 1e-9, "dt {dt}");
        tracker.advance(&chip, dt);

        let changes = tracker.apply_head(&chip, &flow, &mut fluids, key).unwrap();
        assert_eq!(
            changes,
            vec![TopologyChange::Entered {
                droplet: DropletId(0),
                channels: vec![ChannelId(2)]
            }]
        );
        let pos = tracker.position(DropletId(0)).unwrap();
        assert_eq!(pos.channel_ids, vec![ChannelId(1), ChannelId(2)]);
        assert_eq!(pos.boundaries[1].position, ChannelPosition::new(ChannelId(2), 0.0));
        assert!(tracker.check_volumes(&chip, 1e-9).is_ok());
    }

    // -----------------------------------------------------------------------
    // Test 5: Front splits over every outflow channel at a branch
    // -----------------------------------------------------------------------
    #[test]
    fn head_splits_at_branch() {
        let chip = reference_chip();
        let mut fluids = reference_fluids();
        // Droplet near the end of channel 2, which feeds the branch at node 2.
        let mut tracker = injected(&chip, 2, 0.9, reference_droplet_volume());
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);
        let (key, _, b) = tracker.network_boundaries().nth(1).unwrap();
        tracker.advance(&chip, b.time_to_node(chip.channel(ChannelId(2)).unwrap()));

        tracker.apply_head(&chip, &flow, &mut fluids, key).unwrap();
        let pos = tracker.position(DropletId(0)).unwrap();
        assert_eq!(pos.boundaries.len(), 3);
        let heads: Vec<ChannelId> = pos.boundaries[1..].iter().map(|b| b.channel_id()).collect();
        assert_eq!(heads, vec![ChannelId(3), ChannelId(4)]);
        assert_eq!(pos.channel_ids, vec![ChannelId(2), ChannelId(3), ChannelId(4)]);
    }

    // -----------------------------------------------------------------------
    // Test 6: Front without outflow waits
    // -----------------------------------------------------------------------
    #[test]
    fn head_without_outflow_waits() {
        let chip = dead_end_chip();
        let mut fluids = reference_fluids();
        let mut tracker = injected(&chip, 2, 0.5, 1e-13);
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);
        let head = tracker
            .network_boundaries()
            .find(|(_, _, b)| b.flow_rate > 0.0)
            .map(|(k, _, _)| k)
            .unwrap();
        let changes = tracker.apply_head(&chip, &flow, &mut fluids, head).unwrap();
        assert!(matches!(changes[0], TopologyChange::Blocked { .. }));
        assert_eq!(tracker.boundary(head).unwrap().1.state, BoundaryState::WaitOutflow);

        // The rear now only has inflow, so the droplet stops and gets trapped.
        tracker.update_boundaries(&chip, &flow, 1.28);
        let changes = tracker.update_trapping(1.0, 0.0);
        assert_eq!(changes, vec![TopologyChange::Trapped { droplet: DropletId(0) }]);
        assert_eq!(tracker.state(DropletId(0)), Some(DropletState::Trapped));
    }

    // -----------------------------------------------------------------------
    // Test 7: Volume-in-channel accounting
    // -----------------------------------------------------------------------
    #[test]
    fn body_volume_in_channel_cases() {
        let chip = reference_chip();
        let c = chip.channel(ChannelId(1)).unwrap();
        let v = c.volume();
        let open = DropletBoundary::new(c.id, 0.2, false);
        let close = DropletBoundary::new(c.id, 0.7, true);
        assert!((body_volume_in(c, &[open, close]) - 0.5 * v).abs() < 1e-24);
        assert!((body_volume_in(c, &[close]) - 0.7 * v).abs() < 1e-24);
        assert!((body_volume_in(c, &[open]) - 0.8 * v).abs() < 1e-24);
        // Zero-length stretch at the channel end.
        let a = DropletBoundary::new(c.id, 0.0, false);
        let b = DropletBoundary::new(c.id, 0.0, true);
        assert_eq!(body_volume_in(c, &[b, a]), 0.0);
    }

    // -----------------------------------------------------------------------
    // Test 8: Volume sharing sums to the declared volume
    // -----------------------------------------------------------------------
    #[test]
    fn share_volume_is_exact() {
        let shares = share_volume(3.0, &[1.0, 2.0], &[false, false]);
        assert_eq!(shares.iter().sum::<f64>(), 3.0);
        assert!((shares[0] - 1.0).abs() < 1e-15);

        let shares = share_volume(3.0, &[0.5, 1.0], &[true, false]);
        assert_eq!(shares[1], 1.0);
        assert_eq!(shares.iter().sum::<f64>(), 3.0);
    }

    // -----------------------------------------------------------------------
    // Test 9: Snapshot keeps exited droplets for one snapshot only
    // -----------------------------------------------------------------------
    #[test]
    fn exited_droplet_reported_once() {
        let chip = single_channel_chip(3e-11);
        let mut fluids = reference_fluids();
        let mut tracker = injected(&chip, 1, 0.5, reference_droplet_volume());
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);

        let head = tracker.network_boundaries().nth(1).map(|(k, _, _)| k).unwrap();
        let changes = tracker.apply_head(&chip, &flow, &mut fluids, head).unwrap();
        assert!(matches!(changes[0], TopologyChange::Draining { .. }));

        tracker.update_boundaries(&chip, &flow, 1.28);
        let tail = tracker.network_boundaries().next().map(|(k, _, _)| k).unwrap();
        let changes = tracker.apply_tail(&chip, &flow, tail).unwrap();
        assert_eq!(changes, vec![TopologyChange::Exited { droplet: DropletId(0) }]);

        let first = tracker.snapshot();
        assert_eq!(first[&DropletId(0)].state, DropletState::Sink);
        assert!(tracker.snapshot().is_empty());
        assert_eq!(tracker.state(DropletId(0)), Some(DropletState::Sink));
    }

    // -----------------------------------------------------------------------
    // Test 10: Round-off flow in a dead-end pocket neither moves nor schedules
    // -----------------------------------------------------------------------
    #[test]
    fn pocket_droplet_stands_still_and_is_trapped() {
        let chip = side_pocket_chip();
        let mut tracker = injected(&chip, 3, 0.5, reference_droplet_volume());
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);

        let pocket = chip.channel(ChannelId(3)).unwrap();
        for (_, _, b) in tracker.network_boundaries() {
            assert_eq!(b.flow_rate, 0.0);
            assert_eq!(b.time_to_node(pocket), f64::INFINITY);
        }
        assert_eq!(tracker.stalled_in_network(), vec![DropletId(0)]);

        // Nothing blocks the droplet, it just has no flow to ride on.
        let changes = tracker.update_trapping(0.0, 0.0);
        assert_eq!(changes, vec![TopologyChange::Trapped { droplet: DropletId(0) }]);
        assert!(tracker.stalled_in_network().is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 11: Stalled droplets wait out the trap delay
    // -----------------------------------------------------------------------
    #[test]
    fn trap_delay_applies_to_stalled_droplets() {
        let chip = side_pocket_chip();
        let mut tracker = injected(&chip, 3, 0.5, reference_droplet_volume());
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);

        assert!(tracker.update_trapping(0.0, 0.05).is_empty());
        assert_eq!(tracker.trap_deadlines(0.05), vec![(DropletId(0), 0.05)]);
        assert!(tracker.update_trapping(0.02, 0.05).is_empty());
        assert_eq!(tracker.update_trapping(0.05, 0.05).len(), 1);
        assert_eq!(tracker.state(DropletId(0)), Some(DropletState::Trapped));
    }

    // -----------------------------------------------------------------------
    // Test 12: Injection clearance
    // -----------------------------------------------------------------------
    #[test]
    fn injection_clearance_cases() {
        let chip = dead_end_chip();
        let volume = reference_droplet_volume();
        let mut tracker = DropletTracker::new(
            (0..2).map(|i| Droplet::new(DropletId(i), FluidId(1), volume)),
        );
        let at = |i: u32, position: f64| Injection {
            id: InjectionId(i),
            droplet_id: DropletId(i),
            time: 0.0,
            position: ChannelPosition::new(ChannelId(2), position),
        };
        tracker.inject(&chip, &at(0, 0.5)).unwrap();

        // Rates are still zero, so the resident droplet never clears.
        assert_eq!(tracker.injection_clearance(&chip, &at(1, 0.55)), Some(f64::INFINITY));
        assert_eq!(tracker.injection_clearance(&chip, &at(1, 0.2)), None);
        assert_eq!(tracker.injection_clearance(&chip, &at(1, 0.65)), None);

        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);
        let wait = tracker.injection_clearance(&chip, &at(1, 0.55)).unwrap();
        assert!((wait - 0.2 / 12.8).abs() < 1e-12, "wait {wait}");
    }

    // -----------------------------------------------------------------------
    // Test 13: A front reaching a node where another front waits merges
    // -----------------------------------------------------------------------
    #[test]
    fn front_merges_with_droplet_waiting_at_node() {
        let chip = junction_chip();
        let mut fluids = reference_fluids();
        let volume = reference_droplet_volume();
        // Both fronts sit at node 2: channel 2 is 1 mm long, channel 3 2 mm.
        let mut tracker = injected_all(&chip, &[(2, 0.925, volume), (3, 0.9625, volume)]);
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);

        let changes = tracker
            .apply_head(&chip, &flow, &mut fluids, front_of(&tracker, 0))
            .unwrap();
        assert!(matches!(changes[0], TopologyChange::Blocked { .. }));

        let changes = tracker
            .apply_head(&chip, &flow, &mut fluids, front_of(&tracker, 1))
            .unwrap();
        assert_eq!(
            changes,
            vec![TopologyChange::Merged {
                survivor: DropletId(0),
                absorbed: DropletId(1),
            }]
        );
        let merged = tracker.droplet(DropletId(0)).unwrap();
        assert!((merged.volume - 2.0 * volume).abs() < 1e-24);
        assert!(merged.merged_droplet_ids.contains(&DropletId(1)));
        assert_eq!(tracker.droplet(DropletId(1)).unwrap().merged_into, Some(DropletId(0)));
        assert!(tracker.check_volumes(&chip, 1e-9).is_ok());

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[&DropletId(1)], DropletPosition::gone());
        assert_eq!(snapshot[&DropletId(0)].channel_ids, vec![ChannelId(2), ChannelId(3)]);
        assert_eq!(tracker.state(DropletId(1)), Some(DropletState::Sink));
    }

    // -----------------------------------------------------------------------
    // Test 14: A front catching a rear just leaving through the node merges
    // without losing the stretch behind it
    // -----------------------------------------------------------------------
    #[test]
    fn front_merges_with_rear_at_node() {
        let chip = reference_chip();
        let mut fluids = reference_fluids();
        let volume = reference_droplet_volume();
        // Droplet 0 ends at node 1, droplet 1 directly behind it.
        let mut tracker = injected_all(&chip, &[(1, 0.925, volume), (1, 0.775, volume)]);
        let flow = solve(&chip, &tracker);
        tracker.update_boundaries(&chip, &flow, 1.28);
        tracker
            .apply_head(&chip, &flow, &mut fluids, front_of(&tracker, 0))
            .unwrap();
        tracker.update_boundaries(&chip, &flow, 1.28);

        // Both move at 12.8 lengths per second until droplet 1's front and
        // droplet 0's rear reach node 1 together.
        tracker.advance(&chip, 0.15 / 12.8);
        let changes = tracker
            .apply_head(&chip, &flow, &mut fluids, front_of(&tracker, 1))
            .unwrap();
        assert!(matches!(changes[0], TopologyChange::Merged { .. }));
        assert!(tracker.check_volumes(&chip, 1e-9).is_ok());

        let position = tracker.position(DropletId(0)).unwrap();
        assert_eq!(position.boundaries.len(), 2);
        assert_eq!(position.channel_ids, vec![ChannelId(1), ChannelId(2)]);
    }
}
