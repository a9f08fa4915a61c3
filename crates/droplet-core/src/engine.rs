//! The simulation engine: owns the chip, the droplets and the recorded
//! states of one run and drives the event loop.
//!
//! # Step
//!
//! Each call to [`Simulation::step`] runs:
//! 1. **Settle** -- solve the flow, refresh boundary rates and trapping, and
//!    resolve every event that is due without advancing time. Each resolved
//!    event is followed by a fresh solve.
//! 2. **Check** -- verify that every droplet's boundaries still hold its
//!    declared volume.
//! 3. **Record** -- append one [`State`] with the settled flow field.
//! 4. **Advance** -- move every boundary to the earliest upcoming event,
//!    resolve that event and stop if a bound or the end of the run is hit.
//!
//! Because zero-time events are resolved before recording, recorded times
//! are strictly increasing.

use std::collections::BTreeMap;

use tracing::{debug, info, trace};

use crate::builder::ChipBuilder;
use crate::chip::{Chip, ChipError};
use crate::config::SimulationConfig;
use crate::droplet::Injection;
use crate::event::{Event, EventKind, EventQueue, EventScheduler};
use crate::fluid::FluidTable;
use crate::id::{DropletId, FluidId, InjectionId};
use crate::resistance::{channel_resistances, ResistanceModel};
use crate::result::{SimulationResult, State, StateRecorder, StateRetention};
use crate::sim::{CancelFlag, StepOutcome, StopReason};
use crate::solver::{FlowField, NodalSystem, SolverError};
use crate::tracker::{DropletTracker, TopologyChange};
use crate::validation::{check_chip_validity, ValidityReport};

/// Relative tolerance of the per-step droplet volume check.
const VOLUME_TOLERANCE: f64 = 1e-6;

/// Zero-time events resolved before a step gives up.
const MAX_SETTLE_ROUNDS: usize = 10_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that abort a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("chip is not valid: {0}")]
    InvalidChip(ValidityReport),
    #[error("invalid simulation config: {0}")]
    InvalidConfig(ChipError),
    #[error("flow solve failed: {0}")]
    Solver(#[from] SolverError),
    #[error(
        "droplet {droplet:?} at t = {time}: declared volume {declared}, boundaries hold {implied}"
    )]
    ConservationViolation {
        droplet: DropletId,
        declared: f64,
        implied: f64,
        time: f64,
    },
    #[error("no next event at t = {time}; droplets unable to proceed: {droplets:?}")]
    SchedulingDeadlock { time: f64, droplets: Vec<DropletId> },
    #[error(transparent)]
    Topology(#[from] ChipError),
}

/// A finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutput {
    pub result: SimulationResult,
    pub stop_reason: StopReason,
}

/// A failed run with everything recorded before the failure.
#[derive(Debug, thiserror::Error)]
#[error("simulation failed: {error}")]
pub struct SimulationFailure {
    #[source]
    pub error: SimulationError,
    /// `None` when the run failed before its first step.
    pub partial: Option<SimulationResult>,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// One simulation run. Owns every piece of mutable state exclusively.
pub struct Simulation {
    chip: Chip,
    fluids: FluidTable,
    continuous_phase: FluidId,
    injections: Vec<Injection>,
    pending: BTreeMap<InjectionId, Injection>,
    tracker: DropletTracker,
    system: NodalSystem,
    model: Box<dyn ResistanceModel>,
    scheduler: EventScheduler,
    recorder: StateRecorder,
    config: SimulationConfig,
    time: f64,
    stopped: Option<StopReason>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("chip", &self.chip.name)
            .field("time", &self.time)
            .field("states", &self.recorder.recorded())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Prepare a run that keeps every recorded state.
    pub fn new(builder: ChipBuilder, config: SimulationConfig) -> Result<Self, SimulationError> {
        Self::with_retention(builder, config, StateRetention::All)
    }

    /// Prepare a run. Fails if the config or the chip is invalid.
    pub fn with_retention(
        builder: ChipBuilder,
        config: SimulationConfig,
        retention: StateRetention,
    ) -> Result<Self, SimulationError> {
        config.validate().map_err(SimulationError::InvalidConfig)?;
        let report = check_chip_validity(&builder);
        if !report.is_valid() {
            return Err(SimulationError::InvalidChip(report));
        }

        let (chip, fluids, continuous_phase, droplets, injections) = builder.into_parts();
        let continuous_phase = continuous_phase.ok_or(ChipError::MissingContinuousPhase)?;
        let viscosity = fluids
            .get(continuous_phase)
            .map(|f| f.viscosity)
            .ok_or(ChipError::UnknownFluid(continuous_phase))?;
        let system = NodalSystem::new(&chip)?;

        info!(
            chip = %chip.name,
            channels = chip.channel_count(),
            unknowns = system.unknowns(),
            droplets = droplets.len(),
            "simulation prepared"
        );

        Ok(Self {
            pending: injections.iter().map(|i| (i.id, i.clone())).collect(),
            tracker: DropletTracker::new(droplets),
            model: config.resistance_model.build(viscosity),
            scheduler: EventScheduler::new(config.maximal_adaptive_time_step, config.trap_after),
            recorder: StateRecorder::new(retention),
            chip,
            fluids,
            continuous_phase,
            injections,
            system,
            config,
            time: 0.0,
            stopped: None,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current simulated time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    pub fn fluids(&self) -> &FluidTable {
        &self.fluids
    }

    pub fn tracker(&self) -> &DropletTracker {
        &self.tracker
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.recorder.states()
    }

    pub fn last_state(&self) -> Option<&State> {
        self.recorder.last()
    }

    /// Number of states recorded so far, including dropped ones.
    pub fn recorded(&self) -> u64 {
        self.recorder.recorded()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    /// Package everything recorded so far.
    pub fn into_result(self) -> SimulationResult {
        SimulationResult {
            continuous_phase_id: self.continuous_phase,
            maximal_adaptive_time_step: self.config.maximal_adaptive_time_step,
            resistance_model: self.config.resistance_model,
            fluids: self.fluids.iter().cloned().collect(),
            droplets: self.tracker.droplets().cloned().collect(),
            injections: self.injections,
            states: self.recorder.into_states(),
            chip: self.chip,
        }
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Record one state and jump to the next event.
    pub fn step(&mut self) -> Result<StepOutcome, SimulationError> {
        if let Some(reason) = self.stopped {
            return Ok(StepOutcome {
                time: self.time,
                stopped: Some(reason),
                ..StepOutcome::default()
            });
        }

        let mut changes = Vec::new();
        let (flow, queue) = self.settle(&mut changes)?;
        self.tracker
            .check_volumes(&self.chip, VOLUME_TOLERANCE)
            .map_err(|m| SimulationError::ConservationViolation {
                droplet: m.droplet,
                declared: m.declared,
                implied: m.implied,
                time: self.time,
            })?;

        let positions = self.tracker.snapshot();
        let state_id = self.recorder.record(self.time, &flow, positions);
        trace!(state = state_id, time = self.time, upcoming = queue.len(), "recorded state");

        let mut outcome = StepOutcome {
            state_id: Some(state_id),
            time: self.time,
            changes,
            ..StepOutcome::default()
        };

        let Some(next) = queue.next() else {
            let reason = self.idle_stop_reason()?;
            return Ok(self.stop(outcome, reason));
        };
        if self.recorder.recorded() >= self.config.max_iterations {
            return Ok(self.stop(outcome, StopReason::MaxIterations));
        }
        if let Some(max_time) = self.config.max_time {
            if self.time + next.time > max_time {
                return Ok(self.stop(outcome, StopReason::MaxTime));
            }
        }

        self.tracker.advance(&self.chip, next.time);
        self.time += next.time;
        debug!(time = self.time, event = ?next.event.kind(), "advancing to event");
        let applied = self.apply(&flow, next.event)?;

        outcome.changes.extend(applied);
        outcome.time = self.time;
        outcome.dt = Some(next.time);
        outcome.event = Some(next.event.kind());
        Ok(outcome)
    }

    /// Step until the run stops or `cancel` is raised.
    pub fn run(&mut self, cancel: Option<&CancelFlag>) -> Result<StopReason, SimulationError> {
        loop {
            if let Some(reason) = self.stopped {
                return Ok(reason);
            }
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                self.stopped = Some(StopReason::Cancelled);
                info!(time = self.time, "simulation cancelled");
                return Ok(StopReason::Cancelled);
            }
            self.step()?;
        }
    }

    fn stop(&mut self, mut outcome: StepOutcome, reason: StopReason) -> StepOutcome {
        info!(
            time = self.time,
            states = self.recorder.recorded(),
            reason = ?reason,
            "simulation stopped"
        );
        self.stopped = Some(reason);
        outcome.stopped = Some(reason);
        outcome
    }

    /// Why a run with no upcoming event ends. Trapped droplets never move
    /// again on their own, so a run whose remaining droplets are all
    /// trapped is complete. Injections that can no longer happen are a
    /// deadlock.
    fn idle_stop_reason(&self) -> Result<StopReason, SimulationError> {
        let stuck = self.stuck_droplets();
        if stuck.is_empty() {
            Ok(StopReason::Completed)
        } else {
            Err(SimulationError::SchedulingDeadlock {
                time: self.time,
                droplets: stuck,
            })
        }
    }

    /// Stalled droplets not yet trapped plus droplets still waiting to be
    /// injected.
    fn stuck_droplets(&self) -> Vec<DropletId> {
        let mut stuck = self.tracker.stalled_in_network();
        stuck.extend(self.pending.values().map(|i| i.droplet_id));
        stuck.sort();
        stuck.dedup();
        stuck
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn solve(&self) -> Result<FlowField, SolverError> {
        let occupied = if self.config.droplet_resistance {
            self.tracker.occupied_volumes(&self.chip)
        } else {
            Vec::new()
        };
        let resistances = channel_resistances(&self.chip, self.model.as_ref(), occupied);
        self.system.solve(&self.chip, &resistances)
    }

    /// Resolve zero-time events until the next event lies in the future.
    fn settle(
        &mut self,
        changes: &mut Vec<TopologyChange>,
    ) -> Result<(FlowField, EventQueue), SimulationError> {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let flow = self.solve()?;
            self.tracker
                .update_boundaries(&self.chip, &flow, self.config.slip_factor);
            changes.extend(self.tracker.update_trapping(self.time, self.config.trap_after));
            let queue = self
                .scheduler
                .collect(&self.chip, &self.tracker, self.pending.values(), self.time);

            match queue.due_now() {
                Some(due)
                    if !matches!(due.event.kind(), EventKind::TrapDeadline | EventKind::TimeStep) =>
                {
                    debug!(time = self.time, event = ?due.event.kind(), "resolving zero-time event");
                    let applied = self.apply(&flow, due.event)?;
                    changes.extend(applied);
                }
                _ => return Ok((flow, queue)),
            }
        }
        Err(SimulationError::SchedulingDeadlock {
            time: self.time,
            droplets: self.stuck_droplets(),
        })
    }

    fn apply(
        &mut self,
        flow: &FlowField,
        event: Event,
    ) -> Result<Vec<TopologyChange>, SimulationError> {
        let changes = match event {
            Event::Injection { injection, .. } => self.inject(injection)?,
            Event::BoundaryHead { boundary, .. } => {
                self.tracker
                    .apply_head(&self.chip, flow, &mut self.fluids, boundary)?
            }
            Event::BoundaryTail { boundary, .. } => {
                self.tracker.apply_tail(&self.chip, flow, boundary)?
            }
            Event::ChannelMerge { first, second, .. } => {
                self.tracker
                    .merge_in_channel(&mut self.fluids, first, second)?
            }
            Event::TrapDeadline { .. } | Event::TimeStep => Vec::new(),
        };
        Ok(changes)
    }

    /// Inject a pending droplet unless another droplet still occupies its
    /// stretch, in which case it stays pending.
    fn inject(&mut self, id: InjectionId) -> Result<Vec<TopologyChange>, SimulationError> {
        let clearance = match self.pending.get(&id) {
            Some(injection) => self.tracker.injection_clearance(&self.chip, injection),
            None => return Ok(Vec::new()),
        };
        if let Some(wait) = clearance {
            debug!(injection = id.0, wait, "injection deferred, channel stretch occupied");
            return Ok(Vec::new());
        }
        match self.pending.remove(&id) {
            Some(injection) => Ok(vec![self.tracker.inject(&self.chip, &injection)?]),
            None => Ok(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the scenario held by `builder` to completion.
pub fn simulate(
    builder: ChipBuilder,
    config: SimulationConfig,
    retention: StateRetention,
) -> Result<SimulationOutput, SimulationFailure> {
    simulate_with_cancel(builder, config, retention, &CancelFlag::new())
}

/// Run the scenario held by `builder` until it stops or `cancel` is raised.
pub fn simulate_with_cancel(
    builder: ChipBuilder,
    config: SimulationConfig,
    retention: StateRetention,
    cancel: &CancelFlag,
) -> Result<SimulationOutput, SimulationFailure> {
    let mut sim = Simulation::with_retention(builder, config, retention).map_err(|error| {
        SimulationFailure {
            error,
            partial: None,
        }
    })?;
    match sim.run(Some(cancel)) {
        Ok(stop_reason) => Ok(SimulationOutput {
            result: sim.into_result(),
            stop_reason,
        }),
        Err(error) => Err(SimulationFailure {
            error,
            partial: Some(sim.into_result()),
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
