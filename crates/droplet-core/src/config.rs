//! Simulation configuration.
//!
//! Every field has a default, so configuration files only need to name the
//! values they change.

use serde::{Deserialize, Serialize};

use crate::chip::ChipError;
use crate::resistance::ResistanceModelKind;

/// Tunables of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Numeric selector of the resistance model.
    pub resistance_model: ResistanceModelKind,
    /// Upper bound of a single time step in seconds. 0 disables the bound.
    pub maximal_adaptive_time_step: f64,
    /// Droplet speed relative to the mean carrier speed.
    pub slip_factor: f64,
    /// Number of recorded states after which the run stops.
    pub max_iterations: u64,
    /// Simulated time after which the run stops.
    pub max_time: Option<f64>,
    /// How long a droplet must stand still, blocked at a node or without
    /// flow around it, before it is trapped.
    pub trap_after: f64,
    /// Whether droplets add their own resistance to the channels they occupy.
    pub droplet_resistance: bool,
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self {
            resistance_model: ResistanceModelKind::default(),
            maximal_adaptive_time_step: 0.0,
            slip_factor: 1.28,
            max_iterations: 1_000_000,
            max_time: None,
            trap_after: 0.0,
            droplet_resistance: true,
        }
    }

    pub fn with_resistance_model(mut self, kind: ResistanceModelKind) -> Self {
        self.resistance_model = kind;
        self
    }

    pub fn with_maximal_adaptive_time_step(mut self, dt: f64) -> Self {
        self.maximal_adaptive_time_step = dt;
        self
    }

    pub fn with_max_time(mut self, max_time: f64) -> Self {
        self.max_time = Some(max_time);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ChipError> {
        let non_negative = [
            ("maximal adaptive time step", self.maximal_adaptive_time_step),
            ("trap duration", self.trap_after),
        ];
        for (quantity, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ChipError::InvalidValue { quantity, value });
            }
        }
        if !self.slip_factor.is_finite() || self.slip_factor <= 0.0 {
            return Err(ChipError::InvalidValue {
                quantity: "slip factor",
                value: self.slip_factor,
            });
        }
        if let Some(max_time) = self.max_time {
            if !max_time.is_finite() || max_time < 0.0 {
                return Err(ChipError::InvalidValue {
                    quantity: "maximum simulated time",
                    value: max_time,
                });
            }
        }
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::new()
    }
}
