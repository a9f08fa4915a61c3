//! Run control and step outcome types.
//!
//! A simulation advances in steps. Each step records exactly one state and
//! then jumps to the next event. The types here describe why a run stopped,
//! what one step did, and how runs are compared for determinism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::EventKind;
use crate::tracker::TopologyChange;

// ---------------------------------------------------------------------------
// Stop reasons
// ---------------------------------------------------------------------------

/// Why a simulation run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    /// No droplet is moving and no injection is pending.
    Completed,
    /// The next event lies beyond the configured simulated-time bound.
    MaxTime,
    /// The configured number of states was recorded.
    MaxIterations,
    /// A [`CancelFlag`] was raised.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Step outcome
// ---------------------------------------------------------------------------

/// What one call to `Simulation::step` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Id of the state recorded by this step, if any.
    pub state_id: Option<u64>,
    /// Simulated time at the end of the step.
    pub time: f64,
    /// Time advanced after recording. `None` when the run stopped.
    pub dt: Option<f64>,
    /// Kind of the event that fixed `dt`.
    pub event: Option<EventKind>,
    /// Topology changes applied during the step, in order.
    pub changes: Vec<TopologyChange>,
    /// Set once the run has ended.
    pub stopped: Option<StopReason>,
}

impl StepOutcome {
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation shared between a running simulation and its
/// caller. Checked once per step, never mid-solve.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of recorded state for divergence detection.
///
/// Uses FNV-1a (64-bit). Floats are hashed by bit pattern. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}
