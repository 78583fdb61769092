//! Simulation orchestrator.
//!
//! A [`Simulation`] is the run context that owns one model engine, one
//! integrator and one pacing source for the lifetime of a run. It moves
//! through `uninitialised -> initialised -> stepping -> (finished | failed)`:
//! [`Simulation::init`] may only be called from the uninitialised phase,
//! [`Simulation::step`] advances a bounded batch of internal integrator
//! steps (so a host can interleave cancellation checks), and
//! [`Simulation::clean`] tears everything down and is idempotent.
//!
//! Each internal step snapshots the state, advances the integrator by one of
//! its own steps towards the next halting point (final time, next pacing
//! level change, next scheduled log time), rolls an overshoot back by
//! interpolation, dispatches one of the three logging regimes, advances
//! pacing only after logging, and performs any deferred reinitialisation
//! last. Failures abort the run and leave the last good state visible to the
//! host.

use crate::engine::{Engine, SensitivitySource};
use crate::errors::{MyocyteError, MyocyteResult};
use crate::ivp::{DormandPrince54, Integrator, OdeRhs, RootEvent, SolverError};
use crate::logging::LogSink;
use crate::model::CellModel;
use crate::pacing::{EventPacing, PacingConfig, WaveformPacing};
use crate::variable::{FloatValue, Time, VariableKind};
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Internal integrator steps taken per `step` call before control returns to
/// the host.
const STEPS_PER_CALL: usize = 100;

/// Consecutive internal steps without time progress tolerated before the run
/// is aborted as stalled.
const MAX_ZERO_STEPS: usize = 500;

/// Upper bound on the number of scheduled log points in one run.
const MAX_LOG_POINTS: f64 = 1e15;

/// Logging selection for a run.
///
/// `interval > 0` selects periodic logging; otherwise a non-empty `times`
/// list selects point-list logging; otherwise every internal step is logged
/// (dynamic).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Fully-qualified variable names to log; derivatives are spelled
    /// `dot(<state>)`.
    pub variables: Vec<String>,
    pub interval: f64,
    pub times: Vec<Time>,
}

/// Forward-sensitivity selection for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityConfig {
    pub independents: Vec<SensitivitySource>,
    /// States or intermediaries whose sensitivities are requested.
    pub dependents: Vec<String>,
    /// Initial state-sensitivity matrix, one row per state in the order of
    /// `independents`. Defaults to zeros, with a one in the row of each
    /// initial-state independent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Vec<Vec<FloatValue>>>,
}

/// Threshold watch on one state variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootConfig {
    pub variable: String,
    pub threshold: FloatValue,
}

/// Everything a host supplies for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub t_start: Time,
    pub t_final: Time,
    pub rel_tolerance: f64,
    pub abs_tolerance: f64,
    /// Minimum internal step size; zero leaves the solver's own floor.
    pub min_step: f64,
    pub max_step: f64,
    /// Initial state override, in state-slot order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<FloatValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literals: Option<Vec<FloatValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<FloatValue>>,
    pub log: LogConfig,
    pub pacing: PacingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivities: Option<SensitivityConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<RootConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            t_start: 0.0,
            t_final: 1000.0,
            rel_tolerance: 1e-6,
            abs_tolerance: 1e-8,
            min_step: 0.0,
            max_step: f64::INFINITY,
            states: None,
            literals: None,
            parameters: None,
            log: LogConfig::default(),
            pacing: PacingConfig::default(),
            sensitivities: None,
            root: None,
        }
    }
}

impl RunConfig {
    pub fn new(t_start: Time, t_final: Time) -> Self {
        Self {
            t_start,
            t_final,
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> MyocyteResult<Self> {
        toml::from_str(text).map_err(|e| MyocyteError::InvalidConfiguration(e.to_string()))
    }

    pub fn to_toml(&self) -> MyocyteResult<String> {
        toml::to_string(self).map_err(|e| MyocyteError::InvalidConfiguration(e.to_string()))
    }
}

/// Lifecycle phase of a [`Simulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialised,
    Initialised,
    Stepping,
    Finished,
    Failed,
}

/// Host-visible result of a completed run.
#[derive(Debug)]
pub struct RunOutput<L: LogSink> {
    /// Final state vector.
    pub state: Vec<FloatValue>,
    /// Final state-sensitivity matrix, when sensitivities were enabled.
    pub sensitivities: Option<Array2<FloatValue>>,
    /// Final bound-variable values.
    pub time: Time,
    pub pace: FloatValue,
    pub realtime: f64,
    pub evaluations: u64,
    /// Internal integrator steps taken.
    pub steps: u64,
    /// Root crossings recorded during the run.
    pub roots: Vec<RootEvent>,
    /// The log target, returned to the host.
    pub sink: L,
}

/// Result of one `step` call.
pub enum StepReport<L: LogSink> {
    /// The batch of internal steps was exhausted; the run continues from
    /// the given provisional time on the next call.
    Running { time: Time },
    Finished(Box<RunOutput<L>>),
}

#[derive(Debug)]
enum LogMode {
    Dynamic,
    Periodic {
        t_start: Time,
        interval: f64,
        next_index: u64,
    },
    Points {
        times: Vec<Time>,
        cursor: usize,
    },
}

impl LogMode {
    fn next_time(&self) -> Time {
        match self {
            LogMode::Dynamic => f64::INFINITY,
            LogMode::Periodic {
                t_start,
                interval,
                next_index,
            } => t_start + (*next_index as f64) * interval,
            LogMode::Points { times, cursor } => {
                times.get(*cursor).copied().unwrap_or(f64::INFINITY)
            }
        }
    }

    fn advance(&mut self) {
        match self {
            LogMode::Dynamic => {}
            LogMode::Periodic { next_index, .. } => *next_index += 1,
            LogMode::Points { cursor, .. } => *cursor += 1,
        }
    }
}

#[derive(Debug)]
enum PacingDriver {
    None,
    Events(EventPacing),
    Waveform(WaveformPacing),
}

impl PacingDriver {
    fn next_time(&self) -> Time {
        match self {
            PacingDriver::Events(events) => events.next_time(),
            _ => f64::INFINITY,
        }
    }
}

enum PaceLookup<'a> {
    /// Event levels are piecewise constant within a step; the orchestrator
    /// halts at every transition.
    Fixed(FloatValue),
    Waveform(&'a WaveformPacing),
}

impl<'a> PaceLookup<'a> {
    fn for_driver(driver: &'a PacingDriver, current: FloatValue) -> Self {
        match driver {
            PacingDriver::Waveform(waveform) => PaceLookup::Waveform(waveform),
            _ => PaceLookup::Fixed(current),
        }
    }

    fn level_at(&self, t: Time) -> FloatValue {
        match self {
            PaceLookup::Fixed(level) => *level,
            PaceLookup::Waveform(waveform) => waveform.level_at(t),
        }
    }
}

/// Adapter presenting the engine as the integrator's right-hand side.
struct EngineRhs<'a> {
    engine: &'a mut Engine,
    pace: PaceLookup<'a>,
    realtime: f64,
    evals: &'a mut u64,
}

impl OdeRhs for EngineRhs<'_> {
    fn dim(&self) -> usize {
        self.engine.model().n_states()
    }

    fn eval(
        &mut self,
        t: Time,
        y: &[FloatValue],
        dydt: &mut [FloatValue],
    ) -> Result<(), SolverError> {
        let pace = self.pace.level_at(t);
        self.engine.set_bound(t, pace, self.realtime, *self.evals);
        self.engine
            .set_states(y)
            .map_err(|_| SolverError::RhsFailure { t })?;
        self.engine
            .evaluate_derivatives()
            .map_err(|_| SolverError::RhsFailure { t })?;
        dydt.copy_from_slice(self.engine.derivatives());
        *self.evals += 1;
        Ok(())
    }

    fn n_independents(&self) -> usize {
        self.engine.n_independents()
    }

    fn nudge_independent(&mut self, index: usize, delta: FloatValue) {
        self.engine.nudge_independent(index, delta);
    }

    fn independent_value(&self, index: usize) -> FloatValue {
        self.engine.independent_value(index)
    }
}

struct Run<L: LogSink> {
    engine: Engine,
    solver: Box<dyn Integrator>,
    pacing: PacingDriver,
    sink: L,
    mode: LogMode,
    t: Time,
    t_final: Time,
    pace: FloatValue,
    sens_enabled: bool,
    n_independents: usize,
    zero_steps: usize,
    steps: u64,
    rhs_evals: u64,
    roots: Vec<RootEvent>,
    started: Instant,
}

fn install_sensitivities(engine: &mut Engine, s: &Array2<FloatValue>) -> MyocyteResult<()> {
    for j in 0..s.ncols() {
        let column: Vec<FloatValue> = s.column(j).to_vec();
        engine.set_state_sensitivities(j, &column)?;
    }
    Ok(())
}

/// The run context driving one model engine through time.
pub struct Simulation<L: LogSink> {
    model: Arc<CellModel>,
    run: Option<Run<L>>,
    phase: Phase,
    last_state: Vec<FloatValue>,
    parked_sink: Option<L>,
}

impl<L: LogSink> Simulation<L> {
    pub fn new(model: Arc<CellModel>) -> Self {
        let last_state = model.initial_states();
        Self {
            model,
            run: None,
            phase: Phase::Uninitialised,
            last_state,
            parked_sink: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn model(&self) -> &Arc<CellModel> {
        &self.model
    }

    /// The current state vector; after a failure, the last state before the
    /// failing step.
    pub fn state(&self) -> &[FloatValue] {
        &self.last_state
    }

    /// Retrieve the log target after a failed run (on success it is returned
    /// in the [`RunOutput`]).
    pub fn take_sink(&mut self) -> Option<L> {
        self.parked_sink.take()
    }

    /// Prepare a run with the bundled integrator.
    pub fn init(&mut self, config: RunConfig, sink: L) -> MyocyteResult<()> {
        self.init_with_integrator(config, sink, Box::new(DormandPrince54::new()))
    }

    /// Prepare a run with a caller-supplied integrator.
    ///
    /// Only valid in the uninitialised phase; a finished or failed run must
    /// be cleaned first. On error everything allocated so far is torn down
    /// and the simulation stays uninitialised.
    pub fn init_with_integrator(
        &mut self,
        config: RunConfig,
        sink: L,
        solver: Box<dyn Integrator>,
    ) -> MyocyteResult<()> {
        if self.phase != Phase::Uninitialised {
            return Err(MyocyteError::AlreadyInitialised);
        }
        match self.try_init(config, sink, solver) {
            Ok(run) => {
                self.last_state = run.engine.states();
                self.run = Some(run);
                self.phase = Phase::Initialised;
                Ok(())
            }
            Err(error) => {
                self.run = None;
                self.phase = Phase::Uninitialised;
                Err(error)
            }
        }
    }

    fn try_init(
        &mut self,
        config: RunConfig,
        mut sink: L,
        mut solver: Box<dyn Integrator>,
    ) -> MyocyteResult<Run<L>> {
        // Configuration checks come first: nothing is allocated yet.
        if !config.t_start.is_finite() || !config.t_final.is_finite() {
            return Err(MyocyteError::InvalidConfiguration(
                "start and final time must be finite".to_string(),
            ));
        }
        if config.t_final < config.t_start {
            return Err(MyocyteError::InvalidConfiguration(format!(
                "final time {} precedes start time {}",
                config.t_final, config.t_start
            )));
        }
        if config.log.interval < 0.0 {
            return Err(MyocyteError::InvalidConfiguration(
                "log interval cannot be negative".to_string(),
            ));
        }
        if config.log.interval > 0.0 {
            if config.t_start + config.log.interval == config.t_start {
                return Err(MyocyteError::LogIntervalTooSmall {
                    interval: config.log.interval,
                    time: config.t_start,
                });
            }
            let points = (config.t_final - config.t_start) / config.log.interval;
            if !points.is_finite() || points > MAX_LOG_POINTS {
                return Err(MyocyteError::LogPointOverflow { points });
            }
        } else if !config.log.times.is_empty()
            && config.log.times.windows(2).any(|w| !(w[0] < w[1]))
        {
            return Err(MyocyteError::InvalidConfiguration(
                "log times must be strictly ascending".to_string(),
            ));
        }

        let mut engine = Engine::new(Arc::clone(&self.model));
        if let Some(literals) = &config.literals {
            engine.set_literals(literals)?;
        }
        if let Some(parameters) = &config.parameters {
            engine.set_parameters(parameters)?;
        }
        if let Some(states) = &config.states {
            engine.set_states(states)?;
        }

        let n_states = self.model.n_states();
        let mut sens_enabled = false;
        let mut n_independents = 0;
        let mut s0 = Array2::zeros((n_states, 0));
        if let Some(sens_config) = &config.sensitivities {
            engine.enable_sensitivities(&sens_config.independents, &sens_config.dependents)?;
            sens_enabled = true;
            n_independents = sens_config.independents.len();
            s0 = Array2::zeros((n_states, n_independents));
            match &sens_config.initial {
                Some(rows) => {
                    if rows.len() != n_states
                        || rows.iter().any(|row| row.len() != n_independents)
                    {
                        return Err(MyocyteError::WrongLength {
                            what: "initial state sensitivities",
                            expected: n_states * n_independents,
                            actual: rows.iter().map(Vec::len).sum(),
                        });
                    }
                    for (i, row) in rows.iter().enumerate() {
                        for (j, value) in row.iter().enumerate() {
                            s0[(i, j)] = *value;
                        }
                    }
                }
                None => {
                    for (j, source) in sens_config.independents.iter().enumerate() {
                        if let SensitivitySource::InitialState(name) = source {
                            let id = self.model.lookup(name).ok_or_else(|| {
                                MyocyteError::UnknownVariable(name.clone())
                            })?;
                            s0[(self.model.table().get(id).slot, j)] = 1.0;
                        }
                    }
                }
            }
            install_sensitivities(&mut engine, &s0)?;
        }

        let pacing = match &config.pacing {
            PacingConfig::None => PacingDriver::None,
            PacingConfig::Protocol(protocol) => {
                PacingDriver::Events(EventPacing::new(protocol, config.t_start)?)
            }
            PacingConfig::Waveform { times, levels } => PacingDriver::Waveform(
                WaveformPacing::new(times.clone(), levels.clone())?,
            ),
        };
        let pace0 = match &pacing {
            PacingDriver::None => 0.0,
            PacingDriver::Events(events) => events.level(),
            PacingDriver::Waveform(waveform) => waveform.level_at(config.t_start),
        };

        engine.set_bound(config.t_start, pace0, 0.0, 0);
        engine.begin_logging(&config.log.variables, &mut sink)?;

        solver.set_tolerances(config.rel_tolerance, config.abs_tolerance)?;
        solver.set_step_bounds(config.min_step, config.max_step)?;
        if let Some(root) = &config.root {
            let id = self
                .model
                .lookup(&root.variable)
                .ok_or_else(|| MyocyteError::UnknownVariable(root.variable.clone()))?;
            let def = self.model.table().get(id);
            if def.kind != VariableKind::State {
                return Err(MyocyteError::InvalidConfiguration(format!(
                    "root variable '{}' must be a state",
                    root.variable
                )));
            }
            solver.set_root(def.slot, root.threshold)?;
        }

        let y0 = engine.states();
        let mut rhs_evals: u64 = 0;
        {
            let mut rhs = EngineRhs {
                engine: &mut engine,
                pace: PaceLookup::for_driver(&pacing, pace0),
                realtime: 0.0,
                evals: &mut rhs_evals,
            };
            solver.initialise(&mut rhs, config.t_start, &y0)?;
            if sens_enabled {
                solver.sens_init(&mut rhs, &s0)?;
            }
        }

        let mode = if config.log.interval > 0.0 {
            LogMode::Periodic {
                t_start: config.t_start,
                interval: config.log.interval,
                next_index: 0,
            }
        } else if !config.log.times.is_empty() {
            let cursor = config
                .log
                .times
                .partition_point(|&t| t < config.t_start);
            LogMode::Points {
                times: config.log.times.clone(),
                cursor,
            }
        } else {
            LogMode::Dynamic
        };

        // Dynamic logging writes the initial condition once, and only into an
        // empty sink, so resuming a paused run does not duplicate the
        // resumption point.
        if matches!(mode, LogMode::Dynamic) && sink.is_empty() {
            engine.evaluate_derivatives()?;
            engine.log_once(&mut sink)?;
            if sens_enabled {
                engine.evaluate_sensitivity_outputs()?;
                engine.log_sensitivity_snapshot(&mut sink)?;
            }
        }

        debug!(
            "initialised run of '{}' over [{}, {}]",
            self.model.name(),
            config.t_start,
            config.t_final
        );

        Ok(Run {
            engine,
            solver,
            pacing,
            sink,
            mode,
            t: config.t_start,
            t_final: config.t_final,
            pace: pace0,
            sens_enabled,
            n_independents,
            zero_steps: 0,
            steps: 0,
            rhs_evals,
            roots: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Advance the run by a bounded batch of internal steps.
    ///
    /// Returns a provisional time while the run continues, the run output on
    /// reaching the final time, or an error after transitioning to the
    /// failed phase (releasing all resources but keeping the last good state
    /// readable through [`Simulation::state`]).
    pub fn step(&mut self) -> MyocyteResult<StepReport<L>> {
        match self.phase {
            Phase::Initialised | Phase::Stepping => {}
            Phase::Uninitialised => return Err(MyocyteError::NotInitialised),
            Phase::Finished | Phase::Failed => return Err(MyocyteError::AlreadyFinished),
        }
        self.phase = Phase::Stepping;
        match self.advance_batch() {
            Ok(report) => {
                if matches!(report, StepReport::Finished(_)) {
                    self.phase = Phase::Finished;
                }
                Ok(report)
            }
            Err(error) => {
                if let Some(run) = self.run.take() {
                    let Run {
                        mut engine, sink, ..
                    } = run;
                    engine.end_logging();
                    self.parked_sink = Some(sink);
                }
                self.phase = Phase::Failed;
                Err(error)
            }
        }
    }

    /// Drive `step` until the run finishes.
    pub fn run_to_completion(&mut self) -> MyocyteResult<RunOutput<L>> {
        loop {
            match self.step()? {
                StepReport::Running { .. } => {}
                StepReport::Finished(output) => return Ok(*output),
            }
        }
    }

    /// Tear down the run context. Idempotent, and safe to call at any phase,
    /// including after a partial initialisation failure.
    pub fn clean(&mut self) {
        self.run = None;
        self.parked_sink = None;
        self.phase = Phase::Uninitialised;
    }

    fn advance_batch(&mut self) -> MyocyteResult<StepReport<L>> {
        let mut finished = false;
        {
            let Some(run) = self.run.as_mut() else {
                return Err(MyocyteError::NotInitialised);
            };
            if run.t >= run.t_final {
                finished = true;
            }
            if !finished {
                for _ in 0..STEPS_PER_CALL {
                    if Self::advance_one(run, &mut self.last_state)? {
                        finished = true;
                        break;
                    }
                }
            }
        }
        if finished {
            Ok(StepReport::Finished(Box::new(self.finish()?)))
        } else {
            let time = self.run.as_ref().map(|run| run.t).unwrap_or_default();
            Ok(StepReport::Running { time })
        }
    }

    /// One internal integrator step: snapshot, advance, guard, roll back,
    /// log, pace, reinitialise. Returns true when the final time is reached.
    fn advance_one(run: &mut Run<L>, last_state: &mut Vec<FloatValue>) -> MyocyteResult<bool> {
        let n = run.engine.model().n_states();
        let m = run.n_independents;
        let sens_enabled = run.sens_enabled;
        let t_old = run.t;
        *last_state = run.engine.states();

        // The next halting point, restricted to strictly ahead of the
        // current time (a point we are already resting on was handled by the
        // previous iteration).
        let mut t_halt = run.t_final;
        let t_pace = run.pacing.next_time();
        if t_pace > t_old {
            t_halt = t_halt.min(t_pace);
        }
        let t_log = run.mode.next_time();
        if t_log > t_old {
            t_halt = t_halt.min(t_log);
        }

        let outcome = {
            let pace_level = run.pace;
            let realtime = run.started.elapsed().as_secs_f64();
            let Run {
                engine,
                solver,
                pacing,
                rhs_evals,
                ..
            } = &mut *run;
            let mut rhs = EngineRhs {
                engine,
                pace: PaceLookup::for_driver(&*pacing, pace_level),
                realtime,
                evals: rhs_evals,
            };
            solver.step_once(&mut rhs, t_halt)?
        };
        run.steps += 1;
        let mut t_new = outcome.t;

        if t_new == t_old {
            run.zero_steps += 1;
            if run.zero_steps > MAX_ZERO_STEPS {
                return Err(MyocyteError::ZeroProgress {
                    time: t_new,
                    limit: MAX_ZERO_STEPS,
                });
            }
        } else {
            run.zero_steps = 0;
        }

        // An overshoot past the halting point is rolled back by
        // interpolation; the solver restart is deferred until after logging
        // so every logged value reads an already settled state.
        let mut y_new = vec![0.0; n];
        let mut s_new = Array2::zeros((n, m));
        let mut need_reinit = false;
        if t_new > t_halt {
            run.solver.interpolate(t_halt, &mut y_new)?;
            if sens_enabled {
                run.solver.sens_interpolate(t_halt, &mut s_new)?;
            }
            t_new = t_halt;
            need_reinit = true;
        } else {
            y_new.copy_from_slice(run.solver.state());
            if sens_enabled {
                s_new.assign(
                    run.solver
                        .sens()
                        .ok_or(SolverError::SensitivitiesNotInitialised)?,
                );
            }
        }

        // Crossings past a rolled-back halting point are discarded; that
        // span is integrated again after the restart.
        if let Some(event) = outcome.root {
            if event.time <= t_new {
                run.roots.push(event);
            }
        }

        let realtime = run.started.elapsed().as_secs_f64();
        if matches!(run.mode, LogMode::Dynamic) {
            let pace_at_log = match &run.pacing {
                PacingDriver::Waveform(waveform) => waveform.level_at(t_new),
                _ => run.pace,
            };
            run.engine.set_states(&y_new)?;
            run.engine
                .set_bound(t_new, pace_at_log, realtime, run.rhs_evals);
            run.engine.evaluate_derivatives()?;
            run.engine.log_once(&mut run.sink)?;
            if sens_enabled {
                install_sensitivities(&mut run.engine, &s_new)?;
                run.engine.evaluate_sensitivity_outputs()?;
                run.engine.log_sensitivity_snapshot(&mut run.sink)?;
            }
        } else {
            let mut y_log = vec![0.0; n];
            let mut s_log = Array2::zeros((n, m));
            // Half-open grid: a point is logged once the committed time has
            // passed it, never when merely resting on it, so the final
            // instant of a run is excluded and back-to-back runs do not
            // duplicate their boundary.
            while run.mode.next_time() < t_new {
                let t_point = run.mode.next_time();
                run.solver.interpolate(t_point, &mut y_log)?;
                let pace_at_log = match &run.pacing {
                    PacingDriver::Waveform(waveform) => waveform.level_at(t_point),
                    _ => run.pace,
                };
                run.engine.set_states(&y_log)?;
                run.engine
                    .set_bound(t_point, pace_at_log, realtime, run.rhs_evals);
                run.engine.evaluate_derivatives()?;
                run.engine.log_once(&mut run.sink)?;
                if sens_enabled {
                    run.solver.sens_interpolate(t_point, &mut s_log)?;
                    install_sensitivities(&mut run.engine, &s_log)?;
                    run.engine.evaluate_sensitivity_outputs()?;
                    run.engine.log_sensitivity_snapshot(&mut run.sink)?;
                }
                run.mode.advance();
            }
        }

        // Pacing advances only after all logging at or before the committed
        // time has completed.
        let pace_new = match &mut run.pacing {
            PacingDriver::None => 0.0,
            PacingDriver::Events(events) => events.advance_time(t_new)?,
            PacingDriver::Waveform(waveform) => waveform.level_at(t_new),
        };
        if matches!(run.pacing, PacingDriver::Events(_)) && pace_new != run.pace {
            // An event level change is a discontinuity in the right-hand
            // side; the solver must restart from the committed point.
            need_reinit = true;
        }
        run.pace = pace_new;

        run.engine.set_states(&y_new)?;
        run.engine
            .set_bound(t_new, pace_new, realtime, run.rhs_evals);
        if sens_enabled {
            install_sensitivities(&mut run.engine, &s_new)?;
        }

        if need_reinit {
            let pace_level = run.pace;
            let realtime = run.started.elapsed().as_secs_f64();
            let Run {
                engine,
                solver,
                pacing,
                rhs_evals,
                ..
            } = &mut *run;
            let mut rhs = EngineRhs {
                engine,
                pace: PaceLookup::for_driver(&*pacing, pace_level),
                realtime,
                evals: rhs_evals,
            };
            solver.reinitialise(&mut rhs, t_new, &y_new)?;
            if sens_enabled {
                solver.sens_reinitialise(&s_new)?;
            }
        }

        run.t = t_new;
        *last_state = y_new;
        Ok(t_new >= run.t_final)
    }

    fn finish(&mut self) -> MyocyteResult<RunOutput<L>> {
        let Some(mut run) = self.run.take() else {
            return Err(MyocyteError::NotInitialised);
        };
        run.engine.end_logging();
        let output = RunOutput {
            state: run.engine.states(),
            sensitivities: run.engine.state_sensitivities(),
            time: run.t,
            pace: run.pace,
            realtime: run.started.elapsed().as_secs_f64(),
            evaluations: run.rhs_evals,
            steps: run.steps,
            roots: run.roots,
            sink: run.sink,
        };
        self.last_state = output.state.clone();
        debug!(
            "run of '{}' finished at t = {} after {} steps",
            self.model.name(),
            output.time,
            output.steps
        );
        Ok(output)
    }
}
