//! Event scheduling for the event-driven integrator.
//!
//! Every step the scheduler lists each future event with its time relative
//! to now. The earliest event fixes the step size, so no boundary can move
//! past a node within one step.
//!
//! # Ordering
//!
//! Events are ordered by time. Events whose times agree within
//! [`time_tolerance`] coincide and are ordered by kind priority, then lower
//! channel id, then lower droplet id, then boundary arena order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::chip::Chip;
use crate::droplet::{BoundaryState, DropletBoundary, Injection};
use crate::id::{BoundaryKey, ChannelId, DropletId, InjectionId};
use crate::tracker::DropletTracker;

/// Events closer to now than this are resolved without advancing time.
pub const ZERO_TIME: f64 = 1e-12;

/// Tolerance within which two event times at around `t` coincide.
pub fn time_tolerance(t: f64) -> f64 {
    ZERO_TIME.max(1e-9 * t.abs())
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A structural event of the simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// Two facing boundaries of different droplets meet inside a channel.
    ChannelMerge {
        first: BoundaryKey,
        second: BoundaryKey,
        channel: ChannelId,
        droplet: DropletId,
    },
    /// A boundary moving away from its droplet body reaches a node.
    BoundaryHead {
        boundary: BoundaryKey,
        channel: ChannelId,
        droplet: DropletId,
    },
    /// A boundary moving into its droplet body reaches a node.
    BoundaryTail {
        boundary: BoundaryKey,
        channel: ChannelId,
        droplet: DropletId,
    },
    Injection {
        injection: InjectionId,
        droplet: DropletId,
    },
    /// A blocked droplet has been standing still long enough to be trapped.
    TrapDeadline { droplet: DropletId },
    /// The maximal adaptive time step elapsed.
    TimeStep,
}

/// Discriminant tag for event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ChannelMerge,
    BoundaryHead,
    BoundaryTail,
    Injection,
    TrapDeadline,
    TimeStep,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ChannelMerge { .. } => EventKind::ChannelMerge,
            Event::BoundaryHead { .. } => EventKind::BoundaryHead,
            Event::BoundaryTail { .. } => EventKind::BoundaryTail,
            Event::Injection { .. } => EventKind::Injection,
            Event::TrapDeadline { .. } => EventKind::TrapDeadline,
            Event::TimeStep => EventKind::TimeStep,
        }
    }

    /// Rank among coincident events. Lower goes first.
    pub fn priority(&self) -> u8 {
        match self.kind() {
            EventKind::ChannelMerge => 0,
            EventKind::BoundaryHead | EventKind::BoundaryTail => 1,
            EventKind::Injection => 2,
            EventKind::TrapDeadline => 3,
            EventKind::TimeStep => 4,
        }
    }

    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Event::ChannelMerge { channel, .. }
            | Event::BoundaryHead { channel, .. }
            | Event::BoundaryTail { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    pub fn droplet(&self) -> Option<DropletId> {
        match self {
            Event::ChannelMerge { droplet, .. }
            | Event::BoundaryHead { droplet, .. }
            | Event::BoundaryTail { droplet, .. }
            | Event::Injection { droplet, .. }
            | Event::TrapDeadline { droplet } => Some(*droplet),
            Event::TimeStep => None,
        }
    }

    pub fn boundary(&self) -> Option<BoundaryKey> {
        match self {
            Event::ChannelMerge { first, .. } => Some(*first),
            Event::BoundaryHead { boundary, .. } | Event::BoundaryTail { boundary, .. } => {
                Some(*boundary)
            }
            _ => None,
        }
    }

    /// Tie-break among coincident events.
    pub fn tie_break(&self, other: &Event) -> Ordering {
        // `None` sorts before `Some`, so events without a channel or droplet
        // rank by kind alone.
        self.priority()
            .cmp(&other.priority())
            .then(self.channel().cmp(&other.channel()))
            .then(self.droplet().cmp(&other.droplet()))
            .then(self.boundary().cmp(&other.boundary()))
    }
}

/// An event with its time relative to now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEvent {
    pub time: f64,
    pub event: Event,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Lists upcoming events for the current droplet topology.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventScheduler {
    pub maximal_time_step: f64,
    pub trap_after: f64,
}

impl EventScheduler {
    pub fn new(maximal_time_step: f64, trap_after: f64) -> Self {
        Self {
            maximal_time_step,
            trap_after,
        }
    }

    /// Every finite upcoming event, sorted.
    pub fn collect<'a>(
        &self,
        chip: &Chip,
        tracker: &DropletTracker,
        pending: impl IntoIterator<Item = &'a Injection>,
        now: f64,
    ) -> EventQueue {
        let mut events = Vec::new();

        for (key, droplet, b) in tracker.network_boundaries() {
            let Some(channel) = chip.channel(b.channel_id()) else {
                continue;
            };
            let time = b.time_to_node(channel);
            if !time.is_finite() {
                continue;
            }
            let event = if b.flow_rate > 0.0 {
                Event::BoundaryHead {
                    boundary: key,
                    channel: channel.id,
                    droplet,
                }
            } else {
                Event::BoundaryTail {
                    boundary: key,
                    channel: channel.id,
                    droplet,
                }
            };
            events.push(ScheduledEvent { time, event });
        }

        events.extend(channel_merges(chip, tracker));

        // An injection into a stretch another droplet still occupies waits
        // until that droplet has moved on.
        for injection in pending {
            let due = (injection.time - now).max(0.0);
            let time = match tracker.injection_clearance(chip, injection) {
                None => due,
                Some(wait) if wait.is_finite() => due.max(wait),
                Some(_) => continue,
            };
            events.push(ScheduledEvent {
                time,
                event: Event::Injection {
                    injection: injection.id,
                    droplet: injection.droplet_id,
                },
            });
        }

        for (droplet, deadline) in tracker.trap_deadlines(self.trap_after) {
            events.push(ScheduledEvent {
                time: (deadline - now).max(0.0),
                event: Event::TrapDeadline { droplet },
            });
        }

        if self.maximal_time_step > 0.0
            && tracker.count_in(crate::droplet::DropletState::Network) > 0
        {
            events.push(ScheduledEvent {
                time: self.maximal_time_step,
                event: Event::TimeStep,
            });
        }

        EventQueue::new(events)
    }
}

/// Merges of facing boundaries of different droplets inside one channel.
fn channel_merges(chip: &Chip, tracker: &DropletTracker) -> Vec<ScheduledEvent> {
    let mut per_channel: BTreeMap<ChannelId, Vec<(BoundaryKey, DropletId, DropletBoundary)>> =
        BTreeMap::new();
    for (key, droplet, b) in tracker.active_boundaries() {
        per_channel
            .entry(b.channel_id())
            .or_default()
            .push((key, droplet, *b));
    }

    let mut events = Vec::new();
    for (channel_id, mut list) in per_channel {
        let Some(channel) = chip.channel(channel_id) else {
            continue;
        };
        list.sort_by(|a, b| {
            a.2.position
                .position
                .total_cmp(&b.2.position.position)
                .then(a.2.volume_towards0.cmp(&b.2.volume_towards0))
        });
        for pair in list.windows(2) {
            let (lk, ld, lower) = pair[0];
            let (uk, ud, upper) = pair[1];
            // Carrier fluid lies between the two: the lower body points to
            // node0 and the upper body to node1.
            if ld == ud || !lower.volume_towards0 || upper.volume_towards0 {
                continue;
            }
            if lower.state != BoundaryState::Normal && upper.state != BoundaryState::Normal {
                continue;
            }
            let v = channel.volume();
            let u_lower = lower.oriented(lower.flow_rate) / v;
            let u_upper = upper.oriented(upper.flow_rate) / v;
            let closing = u_lower - u_upper;
            if closing <= 0.0 {
                continue;
            }
            let gap = upper.position.position - lower.position.position;
            let time = gap.max(0.0) / closing;
            let meeting = lower.position.position + u_lower * time;
            if !(-ZERO_TIME..=1.0 + ZERO_TIME).contains(&meeting) {
                continue;
            }
            events.push(ScheduledEvent {
                time,
                event: Event::ChannelMerge {
                    first: lk,
                    second: uk,
                    channel: channel_id,
                    droplet: ld.min(ud),
                },
            });
        }
    }
    events
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Upcoming events sorted by time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQueue {
    events: Vec<ScheduledEvent>,
}

impl EventQueue {
    pub fn new(mut events: Vec<ScheduledEvent>) -> Self {
        events.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.event.tie_break(&b.event)));
        Self { events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledEvent> {
        self.events.iter()
    }

    /// Time of the earliest event.
    pub fn earliest(&self) -> Option<f64> {
        self.events.first().map(|e| e.time)
    }

    /// The event to resolve next: among the events coinciding with the
    /// earliest one, the first by tie-break. Its time is the earliest time.
    pub fn next(&self) -> Option<ScheduledEvent> {
        let earliest = self.earliest()?;
        let horizon = earliest + time_tolerance(earliest);
        self.events
            .iter()
            .take_while(|e| e.time <= horizon)
            .min_by(|a, b| a.event.tie_break(&b.event))
            .map(|e| ScheduledEvent {
                time: earliest,
                event: e.event,
            })
    }

    /// The next event if it is due without advancing time.
    pub fn due_now(&self) -> Option<ScheduledEvent> {
        self.next().filter(|e| e.time <= ZERO_TIME)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
