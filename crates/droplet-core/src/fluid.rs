//! Fluids and volume-weighted mixing.
//!
//! Fluids are immutable once created. Merging two droplets of different
//! fluids creates a new mixed fluid instead of editing either parent, and the
//! new fluid remembers every fluid it descends from.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::chip::ChipError;
use crate::id::FluidId;

/// A fluid with its physical properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fluid {
    pub id: FluidId,
    pub name: String,
    /// Dynamic viscosity in Pa·s.
    pub viscosity: f64,
    /// Density in kg/m³.
    pub density: f64,
    pub concentration: f64,
    /// Every fluid this one was mixed from. Only grows.
    pub mixed_fluid_ids: BTreeSet<FluidId>,
}

/// Owns every fluid of a simulation and hands out sequential ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FluidTable {
    fluids: BTreeMap<FluidId, Fluid>,
    next_id: u32,
}

impl FluidTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new fluid. Viscosity and density must be positive.
    pub fn add(
        &mut self,
        viscosity: f64,
        density: f64,
        concentration: f64,
    ) -> Result<FluidId, ChipError> {
        for (quantity, value) in [("viscosity", viscosity), ("density", density)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ChipError::InvalidValue { quantity, value });
            }
        }
        if !concentration.is_finite() {
            return Err(ChipError::InvalidValue {
                quantity: "concentration",
                value: concentration,
            });
        }
        let id = FluidId(self.next_id);
        self.next_id += 1;
        self.fluids.insert(
            id,
            Fluid {
                id,
                name: format!("fluid {}", id.0),
                viscosity,
                density,
                concentration,
                mixed_fluid_ids: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: FluidId) -> Option<&Fluid> {
        self.fluids.get(&id)
    }

    pub fn contains(&self, id: FluidId) -> bool {
        self.fluids.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fluid> {
        self.fluids.values()
    }

    pub fn len(&self) -> usize {
        self.fluids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fluids.is_empty()
    }

    /// Mix `volume0` of `fluid0` with `volume1` of `fluid1`.
    ///
    /// Identical fluids mix to themselves. Otherwise a new fluid is created
    /// whose viscosity, density and concentration are volume-weighted
    /// averages of the parents. Returns `None` if either id is unknown.
    pub fn mix(
        &mut self,
        fluid0: FluidId,
        volume0: f64,
        fluid1: FluidId,
        volume1: f64,
    ) -> Option<FluidId> {
        if fluid0 == fluid1 {
            return self.contains(fluid0).then_some(fluid0);
        }
        let f0 = self.get(fluid0)?;
        let f1 = self.get(fluid1)?;

        let total = volume0 + volume1;
        let w0 = volume0 / total;
        let w1 = volume1 / total;
        let blend = |a: f64, b: f64| a * w0 + b * w1;

        let mut mixed_fluid_ids: BTreeSet<FluidId> = f0
            .mixed_fluid_ids
            .union(&f1.mixed_fluid_ids)
            .copied()
            .collect();
        mixed_fluid_ids.insert(fluid0);
        mixed_fluid_ids.insert(fluid1);

        let id = FluidId(self.next_id);
        let mixed = Fluid {
            id,
            name: format!("mix of {} and {}", f0.name, f1.name),
            viscosity: blend(f0.viscosity, f1.viscosity),
            density: blend(f0.density, f1.density),
            concentration: blend(f0.concentration, f1.concentration),
            mixed_fluid_ids,
        };
        self.next_id += 1;
        self.fluids.insert(id, mixed);
        Some(id)
    }
}
