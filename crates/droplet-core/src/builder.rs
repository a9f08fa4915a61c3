//! Construction API.
//!
//! A [`ChipBuilder`] collects the chip, fluids and droplet injections of one
//! simulation. Every `add_*` call returns the id it assigned and leaves the
//! builder untouched when it fails. The builder is handed to the engine by
//! value, so a running simulation owns its own copy of everything.

use std::collections::BTreeMap;

use crate::chip::{ChannelType, Chip, ChipError};
use crate::config::SimulationConfig;
use crate::droplet::{ChannelPosition, Droplet, Injection};
use crate::engine::{simulate, simulate_with_cancel, SimulationFailure, SimulationOutput};
use crate::fluid::{Fluid, FluidTable};
use crate::id::{ChannelId, DropletId, FluidId, InjectionId, NodeId, PumpId};
use crate::result::StateRetention;
use crate::sim::CancelFlag;
use crate::validation::{
    check_chip_validity, check_injection, injections_collide, ValidityReport,
};

/// Mutable description of a simulation before it runs.
#[derive(Debug, Clone, Default)]
pub struct ChipBuilder {
    chip: Chip,
    fluids: FluidTable,
    continuous_phase: Option<FluidId>,
    droplets: BTreeMap<DropletId, Droplet>,
    injections: BTreeMap<InjectionId, Injection>,
    next_droplet_id: u32,
    next_injection_id: u32,
}

impl ChipBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            chip: Chip::new(name),
            ..Self::default()
        }
    }

    // -- Chip --

    pub fn add_channel(
        &mut self,
        node0: NodeId,
        node1: NodeId,
        height: f64,
        width: f64,
        length: f64,
        channel_type: ChannelType,
    ) -> Result<ChannelId, ChipError> {
        self.chip
            .add_channel(node0, node1, height, width, length, channel_type)
    }

    pub fn add_bypass_channel(
        &mut self,
        node0: NodeId,
        node1: NodeId,
        height: f64,
        width: f64,
        length: f64,
    ) -> Result<ChannelId, ChipError> {
        self.add_channel(node0, node1, height, width, length, ChannelType::Bypass)
    }

    pub fn add_flow_rate_pump(
        &mut self,
        node0: NodeId,
        node1: NodeId,
        flow_rate: f64,
    ) -> Result<PumpId, ChipError> {
        self.chip.add_flow_rate_pump(node0, node1, flow_rate)
    }

    pub fn add_pressure_pump(
        &mut self,
        node0: NodeId,
        node1: NodeId,
        pressure: f64,
    ) -> Result<PumpId, ChipError> {
        self.chip.add_pressure_pump(node0, node1, pressure)
    }

    pub fn add_sink(&mut self, node: NodeId) {
        self.chip.add_sink(node);
    }

    pub fn add_ground(&mut self, node: NodeId) {
        self.chip.add_ground(node);
    }

    // -- Fluids --

    pub fn add_fluid(
        &mut self,
        viscosity: f64,
        density: f64,
        concentration: f64,
    ) -> Result<FluidId, ChipError> {
        self.fluids.add(viscosity, density, concentration)
    }

    /// Designate the carrier fluid filling the network outside droplets.
    pub fn set_continuous_phase(&mut self, fluid: FluidId) -> Result<(), ChipError> {
        if !self.fluids.contains(fluid) {
            return Err(ChipError::UnknownFluid(fluid));
        }
        self.continuous_phase = Some(fluid);
        Ok(())
    }

    // -- Droplets --

    /// Schedule a droplet of `volume` to appear centred at `position` at
    /// `time`. Creates the droplet and its injection.
    pub fn add_droplet(
        &mut self,
        fluid: FluidId,
        volume: f64,
        time: f64,
        position: ChannelPosition,
    ) -> Result<DropletId, ChipError> {
        let droplet = Droplet::new(DropletId(self.next_droplet_id), fluid, volume);
        let injection = Injection {
            id: InjectionId(self.next_injection_id),
            droplet_id: droplet.id,
            time,
            position,
        };
        check_injection(&self.chip, &self.fluids, &droplet, &injection)?;
        for existing in self.injections.values() {
            let Some(other) = self.droplets.get(&existing.droplet_id) else {
                continue;
            };
            if injections_collide(&self.chip, (other, existing), (&droplet, &injection)) {
                return Err(ChipError::OverlappingInjections {
                    first: other.id,
                    second: droplet.id,
                });
            }
        }

        self.next_droplet_id += 1;
        self.next_injection_id += 1;
        let id = droplet.id;
        self.droplets.insert(id, droplet);
        self.injections.insert(injection.id, injection);
        Ok(id)
    }

    // -- Queries --

    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    pub fn fluids(&self) -> &FluidTable {
        &self.fluids
    }

    pub fn fluid(&self, id: FluidId) -> Option<&Fluid> {
        self.fluids.get(id)
    }

    pub fn continuous_phase(&self) -> Option<FluidId> {
        self.continuous_phase
    }

    pub fn droplet(&self, id: DropletId) -> Option<&Droplet> {
        self.droplets.get(&id)
    }

    pub fn droplets(&self) -> impl Iterator<Item = &Droplet> {
        self.droplets.values()
    }

    pub fn injections(&self) -> impl Iterator<Item = &Injection> {
        self.injections.values()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Chip,
        FluidTable,
        Option<FluidId>,
        Vec<Droplet>,
        Vec<Injection>,
    ) {
        (
            self.chip,
            self.fluids,
            self.continuous_phase,
            self.droplets.into_values().collect(),
            self.injections.into_values().collect(),
        )
    }

    // -- Running --

    pub fn check_chip_validity(&self) -> ValidityReport {
        check_chip_validity(self)
    }

    /// Run a simulation on a copy of this builder.
    pub fn simulate(
        &self,
        config: &SimulationConfig,
        retention: StateRetention,
    ) -> Result<SimulationOutput, SimulationFailure> {
        simulate(self.clone(), config.clone(), retention)
    }

    /// Like [`simulate`](Self::simulate), stopping early once `cancel` is
    /// raised.
    pub fn simulate_with_cancel(
        &self,
        config: &SimulationConfig,
        retention: StateRetention,
        cancel: &CancelFlag,
    ) -> Result<SimulationOutput, SimulationFailure> {
        simulate_with_cancel(self.clone(), config.clone(), retention, cancel)
    }
}
