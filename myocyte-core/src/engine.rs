//! Stateful model evaluation engine.
//!
//! The engine owns all per-variable numeric state of one simulation run:
//! literal and parameter values, the current state vector, bound inputs,
//! intermediary values, state derivatives and (optionally) the sensitivity
//! matrix. It recomputes the minimum necessary on each request:
//!
//! - Derived constants are re-evaluated immediately and explicitly whenever a
//!   literal or parameter write actually changes something.
//! - Derivative and sensitivity-output evaluation is gated by two validity
//!   flags. Changes to literals, parameters, time, pace or states invalidate
//!   both; installing new state sensitivities invalidates only the
//!   sensitivity-outputs flag, so derivatives can be reused independently of
//!   sensitivity recomputation.
//!
//! An engine is created once per run with the model's defaults baked in and
//! dropped at the end of the run.

use crate::errors::{MyocyteError, MyocyteResult};
use crate::logging::{ColumnId, LogSink};
use crate::model::{CellModel, Equation};
use crate::variable::{BoundRole, FloatValue, Time, VarId, VariableKind};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Relative half-width of the centred difference used when an equation has
/// no analytic partial derivative.
const FD_EPS: f64 = 1e-7;

/// A sensitivity input, named at configuration time: either a parameter or a
/// state's initial value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensitivitySource {
    Parameter(String),
    InitialState(String),
}

/// A resolved sensitivity input.
///
/// `var` points at the live slot carrying the independent's current value:
/// the parameter slot for a parameter, the live state slot for an
/// initial-value independent (not a separately frozen copy of the initial
/// value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Independent {
    pub var: VarId,
    pub is_parameter: bool,
}

#[derive(Debug)]
struct Sensitivities {
    independents: Vec<Independent>,
    dependents: Vec<VarId>,
    /// d(variable)/d(independent) for every variable; rows for variables that
    /// never carry a sensitivity stay zero.
    matrix: Array2<FloatValue>,
    /// Propagation order: the parameter-derived constants and intermediaries
    /// needed to reach the requested dependents, topologically sorted.
    order: Vec<VarId>,
}

#[derive(Debug, Default)]
struct LogTable {
    states: Vec<(VarId, ColumnId)>,
    derivatives: Vec<(usize, ColumnId)>,
    bound: Vec<(VarId, ColumnId)>,
    intermediaries: Vec<(VarId, ColumnId)>,
}

/// The model evaluation engine. See the module docs for the caching rules.
#[derive(Debug)]
pub struct Engine {
    model: Arc<CellModel>,
    values: Vec<FloatValue>,
    derivatives: Vec<FloatValue>,
    derivatives_valid: bool,
    sensitivity_outputs_valid: bool,
    evaluations: u64,
    sens: Option<Sensitivities>,
    log: Option<LogTable>,
    scratch: Vec<FloatValue>,
}

fn gather<'a>(
    scratch: &'a mut Vec<FloatValue>,
    values: &[FloatValue],
    eq: &Equation,
) -> &'a [FloatValue] {
    scratch.clear();
    scratch.extend(eq.deps.iter().map(|&d| values[d]));
    scratch
}

/// Partial derivative of an equation with respect to its `k`-th dependency,
/// evaluated at `args`. Falls back to a centred difference when the equation
/// carries no analytic partials.
fn partial_value(eq: &Equation, k: usize, args: &mut [FloatValue]) -> FloatValue {
    if !eq.partials.is_empty() {
        return (eq.partials[k])(args);
    }
    let orig = args[k];
    let h = FD_EPS * (1.0 + orig.abs());
    args[k] = orig + h;
    let above = (eq.eval)(args);
    args[k] = orig - h;
    let below = (eq.eval)(args);
    args[k] = orig;
    (above - below) / (2.0 * h)
}

impl Engine {
    /// Create an engine with the model's default literal, parameter and state
    /// values baked in. Derived constants are evaluated immediately.
    pub fn new(model: Arc<CellModel>) -> Self {
        let values: Vec<FloatValue> =
            model.table().iter().map(|def| def.default).collect();
        let derivatives = vec![0.0; model.n_states()];
        let mut engine = Self {
            model,
            values,
            derivatives,
            derivatives_valid: false,
            sensitivity_outputs_valid: false,
            evaluations: 0,
            sens: None,
            log: None,
            scratch: Vec::new(),
        };
        engine.reevaluate_literal_derived();
        engine.reevaluate_parameter_derived();
        engine
    }

    pub fn model(&self) -> &Arc<CellModel> {
        &self.model
    }

    /// Number of full derivative evaluations performed so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn derivatives_valid(&self) -> bool {
        self.derivatives_valid
    }

    pub fn sensitivity_outputs_valid(&self) -> bool {
        self.sensitivity_outputs_valid
    }

    /// Current value of a variable.
    pub fn value(&self, id: VarId) -> FloatValue {
        self.values[id]
    }

    pub fn value_by_name(&self, name: &str) -> MyocyteResult<FloatValue> {
        let id = self
            .model
            .lookup(name)
            .ok_or_else(|| MyocyteError::UnknownVariable(name.to_string()))?;
        Ok(self.values[id])
    }

    /// Current state vector, in state-slot order.
    pub fn states(&self) -> Vec<FloatValue> {
        self.model
            .table()
            .states()
            .iter()
            .map(|&id| self.values[id])
            .collect()
    }

    /// State derivatives from the last evaluation, in state-slot order.
    pub fn derivatives(&self) -> &[FloatValue] {
        &self.derivatives
    }

    fn invalidate(&mut self) {
        self.derivatives_valid = false;
        self.sensitivity_outputs_valid = false;
    }

    fn reevaluate_literal_derived(&mut self) {
        let model = Arc::clone(&self.model);
        for &id in model.literal_derived_order() {
            let eq = model.equation(id).expect("derived constant has an equation");
            let args = gather(&mut self.scratch, &self.values, eq);
            self.values[id] = (eq.eval)(args);
        }
    }

    fn reevaluate_parameter_derived(&mut self) {
        let model = Arc::clone(&self.model);
        for &id in model.parameter_derived_order() {
            let eq = model.equation(id).expect("derived constant has an equation");
            let args = gather(&mut self.scratch, &self.values, eq);
            self.values[id] = (eq.eval)(args);
        }
    }

    /// Replace all literal values.
    ///
    /// A no-op (besides the comparison) when nothing changed. On any change
    /// both caches are invalidated and the literal-derived and
    /// parameter-derived constants are re-evaluated; parameter-derived
    /// expressions may reference literal-derived ones.
    pub fn set_literals(&mut self, values: &[FloatValue]) -> MyocyteResult<()> {
        let model = Arc::clone(&self.model);
        let ids = model.table().literals();
        if values.len() != ids.len() {
            return Err(MyocyteError::WrongLength {
                what: "literals",
                expected: ids.len(),
                actual: values.len(),
            });
        }
        let changed = ids
            .iter()
            .zip(values)
            .any(|(&id, &v)| self.values[id] != v);
        if !changed {
            return Ok(());
        }
        for (&id, &v) in ids.iter().zip(values) {
            self.values[id] = v;
        }
        self.invalidate();
        self.reevaluate_literal_derived();
        self.reevaluate_parameter_derived();
        Ok(())
    }

    /// Replace all parameter values; same comparison and short-circuit rules
    /// as [`Engine::set_literals`], re-evaluating parameter-derived constants
    /// only.
    pub fn set_parameters(&mut self, values: &[FloatValue]) -> MyocyteResult<()> {
        let model = Arc::clone(&self.model);
        let ids = model.table().parameters();
        if values.len() != ids.len() {
            return Err(MyocyteError::WrongLength {
                what: "parameters",
                expected: ids.len(),
                actual: values.len(),
            });
        }
        let changed = ids
            .iter()
            .zip(values)
            .any(|(&id, &v)| self.values[id] != v);
        if !changed {
            return Ok(());
        }
        for (&id, &v) in ids.iter().zip(values) {
            self.values[id] = v;
        }
        self.invalidate();
        self.reevaluate_parameter_derived();
        Ok(())
    }

    /// Update parameters from a vector ordered like the independents list.
    ///
    /// The independents interleave parameters and initial-value entries;
    /// entries that are not parameter-tagged are skipped while preserving
    /// alignment. Change detection and invalidation follow
    /// [`Engine::set_parameters`].
    pub fn set_parameters_from_independents(
        &mut self,
        values: &[FloatValue],
    ) -> MyocyteResult<()> {
        let sens = self
            .sens
            .as_ref()
            .ok_or(MyocyteError::SensitivitiesNotEnabled)?;
        if values.len() != sens.independents.len() {
            return Err(MyocyteError::WrongLength {
                what: "independents",
                expected: sens.independents.len(),
                actual: values.len(),
            });
        }
        let mut parameters = self
            .model
            .table()
            .parameters()
            .iter()
            .map(|&id| self.values[id])
            .collect::<Vec<_>>();
        for (indep, &v) in sens.independents.iter().zip(values) {
            if indep.is_parameter {
                let slot = self.model.table().get(indep.var).slot;
                parameters[slot] = v;
            }
        }
        self.set_parameters(&parameters)
    }

    /// Update the bound inputs.
    ///
    /// `time` and `pace` participate in change detection and invalidate the
    /// caches; `realtime` and `evaluations` are informational and always
    /// overwritten unconditionally. Roles the model does not bind are
    /// ignored.
    pub fn set_bound(&mut self, time: Time, pace: FloatValue, realtime: f64, evaluations: u64) {
        let model = Arc::clone(&self.model);
        let table = model.table();
        let mut changed = false;
        if let Some(id) = table.bound_role(BoundRole::Time) {
            if self.values[id] != time {
                self.values[id] = time;
                changed = true;
            }
        }
        if let Some(id) = table.bound_role(BoundRole::Pace) {
            if self.values[id] != pace {
                self.values[id] = pace;
                changed = true;
            }
        }
        if let Some(id) = table.bound_role(BoundRole::Realtime) {
            self.values[id] = realtime;
        }
        if let Some(id) = table.bound_role(BoundRole::Evaluations) {
            self.values[id] = evaluations as f64;
        }
        if changed {
            self.invalidate();
        }
    }

    /// Replace the state vector, invalidating the caches on any change.
    pub fn set_states(&mut self, values: &[FloatValue]) -> MyocyteResult<()> {
        let model = Arc::clone(&self.model);
        let ids = model.table().states();
        if values.len() != ids.len() {
            return Err(MyocyteError::WrongLength {
                what: "states",
                expected: ids.len(),
                actual: values.len(),
            });
        }
        let changed = ids
            .iter()
            .zip(values)
            .any(|(&id, &v)| self.values[id] != v);
        if !changed {
            return Ok(());
        }
        for (&id, &v) in ids.iter().zip(values) {
            self.values[id] = v;
        }
        self.invalidate();
        Ok(())
    }

    /// Evaluate every intermediary and state derivative in dependency order.
    ///
    /// Returns immediately when the derivatives cache is valid. Numeric
    /// evaluation itself has no recoverable error path; domain errors are a
    /// caller-level concern.
    pub fn evaluate_derivatives(&mut self) -> MyocyteResult<()> {
        if self.derivatives_valid {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        for &id in model.intermediary_order() {
            let eq = model.equation(id).expect("intermediary has an equation");
            let args = gather(&mut self.scratch, &self.values, eq);
            self.values[id] = (eq.eval)(args);
        }
        for slot in 0..model.n_states() {
            let eq = model.derivative(slot);
            let args = gather(&mut self.scratch, &self.values, eq);
            self.derivatives[slot] = (eq.eval)(args);
        }
        self.evaluations += 1;
        self.derivatives_valid = true;
        Ok(())
    }

    /// Enable forward sensitivities for the given independents and dependent
    /// outputs. Dependents may be states or intermediaries.
    pub fn enable_sensitivities(
        &mut self,
        independents: &[SensitivitySource],
        dependents: &[String],
    ) -> MyocyteResult<()> {
        let model = Arc::clone(&self.model);
        let table = model.table();

        let mut resolved = Vec::with_capacity(independents.len());
        for source in independents {
            let indep = match source {
                SensitivitySource::Parameter(name) => {
                    let id = table
                        .lookup(name)
                        .ok_or_else(|| MyocyteError::UnknownVariable(name.clone()))?;
                    if table.get(id).kind != VariableKind::Parameter {
                        return Err(MyocyteError::InvalidConfiguration(format!(
                            "'{}' is not a parameter",
                            name
                        )));
                    }
                    Independent {
                        var: id,
                        is_parameter: true,
                    }
                }
                SensitivitySource::InitialState(name) => {
                    let id = table
                        .lookup(name)
                        .ok_or_else(|| MyocyteError::UnknownVariable(name.clone()))?;
                    if table.get(id).kind != VariableKind::State {
                        return Err(MyocyteError::InvalidConfiguration(format!(
                            "'{}' is not a state",
                            name
                        )));
                    }
                    Independent {
                        var: id,
                        is_parameter: false,
                    }
                }
            };
            resolved.push(indep);
        }

        let mut dependent_ids = Vec::with_capacity(dependents.len());
        for name in dependents {
            let id = table
                .lookup(name)
                .ok_or_else(|| MyocyteError::UnknownVariable(name.clone()))?;
            match table.get(id).kind {
                VariableKind::State | VariableKind::Intermediary => dependent_ids.push(id),
                _ => {
                    return Err(MyocyteError::InvalidConfiguration(format!(
                        "sensitivity output '{}' must be a state or an intermediary",
                        name
                    )))
                }
            }
        }

        // The variables whose sensitivities are needed to reach the
        // requested outputs: reverse reachability from the dependents.
        let mut needed = vec![false; table.len()];
        let mut stack = dependent_ids.clone();
        while let Some(id) = stack.pop() {
            if needed[id] {
                continue;
            }
            needed[id] = true;
            if let Some(eq) = model.equation(id) {
                stack.extend(eq.deps.iter().copied());
            }
        }
        let order: Vec<VarId> = model
            .topo_order()
            .iter()
            .copied()
            .filter(|&id| {
                needed[id]
                    && matches!(
                        table.get(id).kind,
                        VariableKind::ParameterDerived | VariableKind::Intermediary
                    )
            })
            .collect();

        let mut matrix = Array2::zeros((table.len(), resolved.len()));
        for (j, indep) in resolved.iter().enumerate() {
            if indep.is_parameter {
                matrix[(indep.var, j)] = 1.0;
            }
        }

        self.sens = Some(Sensitivities {
            independents: resolved,
            dependents: dependent_ids,
            matrix,
            order,
        });
        self.sensitivity_outputs_valid = false;
        Ok(())
    }

    pub fn n_independents(&self) -> usize {
        self.sens.as_ref().map_or(0, |s| s.independents.len())
    }

    /// Current value of the slot an independent points at: the live
    /// parameter value, or the live state value for an initial-value
    /// independent.
    pub fn independent_value(&self, index: usize) -> FloatValue {
        match &self.sens {
            Some(s) => self.values[s.independents[index].var],
            None => 0.0,
        }
    }

    /// Shift the live slot of a parameter independent by `delta`, triggering
    /// the usual parameter invalidation. A no-op for initial-value
    /// independents: their influence enters only through the state
    /// sensitivities.
    pub fn nudge_independent(&mut self, index: usize, delta: FloatValue) {
        let Some(sens) = self.sens.as_ref() else {
            return;
        };
        let indep = sens.independents[index];
        if !indep.is_parameter {
            return;
        }
        self.values[indep.var] += delta;
        self.invalidate();
        self.reevaluate_parameter_derived();
    }

    /// Install the state-sensitivity block for one independent, one value per
    /// state in state-slot order. On change, only the sensitivity-outputs
    /// cache is invalidated.
    pub fn set_state_sensitivities(
        &mut self,
        independent: usize,
        values: &[FloatValue],
    ) -> MyocyteResult<()> {
        let model = Arc::clone(&self.model);
        let ids = model.table().states();
        let sens = self
            .sens
            .as_mut()
            .ok_or(MyocyteError::SensitivitiesNotEnabled)?;
        if independent >= sens.independents.len() {
            return Err(MyocyteError::WrongLength {
                what: "independent index",
                expected: sens.independents.len(),
                actual: independent,
            });
        }
        if values.len() != ids.len() {
            return Err(MyocyteError::WrongLength {
                what: "state sensitivities",
                expected: ids.len(),
                actual: values.len(),
            });
        }
        let changed = ids
            .iter()
            .zip(values)
            .any(|(&id, &v)| sens.matrix[(id, independent)] != v);
        if !changed {
            return Ok(());
        }
        for (&id, &v) in ids.iter().zip(values) {
            sens.matrix[(id, independent)] = v;
        }
        self.sensitivity_outputs_valid = false;
        Ok(())
    }

    /// Current state-sensitivity matrix (states x independents), if enabled.
    pub fn state_sensitivities(&self) -> Option<Array2<FloatValue>> {
        let sens = self.sens.as_ref()?;
        let states = self.model.table().states();
        let mut out = Array2::zeros((states.len(), sens.independents.len()));
        for (row, &id) in states.iter().enumerate() {
            for j in 0..sens.independents.len() {
                out[(row, j)] = sens.matrix[(id, j)];
            }
        }
        Some(out)
    }

    /// Propagate sensitivities through the intermediary chain.
    ///
    /// Assumes the state sensitivities have already been installed and that
    /// the variable values are current (a derivative evaluation has run for
    /// this time and state). For every independent, the chain-rule
    /// expressions of the needed parameter-derived constants and
    /// intermediaries are evaluated in dependency order. Short-circuits when
    /// the cache is valid.
    pub fn evaluate_sensitivity_outputs(&mut self) -> MyocyteResult<()> {
        if self.sens.is_none() {
            return Err(MyocyteError::SensitivitiesNotEnabled);
        }
        if self.sensitivity_outputs_valid {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let sens = self.sens.as_mut().expect("checked above");
        for j in 0..sens.independents.len() {
            for &id in &sens.order {
                let eq = model.equation(id).expect("propagated variable has an equation");
                let mut args: Vec<FloatValue> =
                    eq.deps.iter().map(|&d| self.values[d]).collect();
                let mut total = 0.0;
                for (k, &dep) in eq.deps.iter().enumerate() {
                    let s_dep = sens.matrix[(dep, j)];
                    if s_dep != 0.0 {
                        total += partial_value(eq, k, &mut args) * s_dep;
                    }
                }
                sens.matrix[(id, j)] = total;
            }
        }
        self.sensitivity_outputs_valid = true;
        Ok(())
    }

    /// Build the dependents x independents matrix of current sensitivities.
    pub fn sensitivity_snapshot(&self) -> MyocyteResult<Array2<FloatValue>> {
        let sens = self
            .sens
            .as_ref()
            .ok_or(MyocyteError::SensitivitiesNotEnabled)?;
        let mut out = Array2::zeros((sens.dependents.len(), sens.independents.len()));
        for (row, &dep) in sens.dependents.iter().enumerate() {
            for j in 0..sens.independents.len() {
                out[(row, j)] = sens.matrix[(dep, j)];
            }
        }
        Ok(out)
    }

    /// Append one sensitivity snapshot to the sink as a single unit.
    pub fn log_sensitivity_snapshot(&self, sink: &mut dyn LogSink) -> MyocyteResult<()> {
        let snapshot = self.sensitivity_snapshot()?;
        sink.append_sensitivities(&snapshot)?;
        Ok(())
    }

    /// Register the given fully-qualified names for logging, partitioned into
    /// states, derivatives (`dot(<state>)`), bound variables and
    /// intermediaries.
    ///
    /// Fails if logging is already active, if a name is unknown, or if a
    /// name refers to a constant (constants carry no time series).
    pub fn begin_logging(
        &mut self,
        names: &[String],
        sink: &mut dyn LogSink,
    ) -> MyocyteResult<()> {
        if self.log.is_some() {
            return Err(MyocyteError::LoggingAlreadyActive);
        }
        let model = Arc::clone(&self.model);
        let table = model.table();
        let mut log = LogTable::default();
        for name in names {
            if let Some(inner) = name
                .strip_prefix("dot(")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                let id = table
                    .lookup(inner)
                    .ok_or_else(|| MyocyteError::UnknownVariable(name.clone()))?;
                let def = table.get(id);
                if def.kind != VariableKind::State {
                    return Err(MyocyteError::UnknownVariable(name.clone()));
                }
                let column = sink.declare(name)?;
                log.derivatives.push((def.slot, column));
                continue;
            }
            let id = table
                .lookup(name)
                .ok_or_else(|| MyocyteError::UnknownVariable(name.clone()))?;
            let column = sink.declare(name)?;
            match table.get(id).kind {
                VariableKind::State => log.states.push((id, column)),
                VariableKind::Bound => log.bound.push((id, column)),
                VariableKind::Intermediary => log.intermediaries.push((id, column)),
                _ => return Err(MyocyteError::NotLoggable(name.clone())),
            }
        }
        self.log = Some(log);
        Ok(())
    }

    /// Append the current value of every registered variable to its column.
    ///
    /// Fails if logging was never started; sink failures are propagated, not
    /// swallowed.
    pub fn log_once(&self, sink: &mut dyn LogSink) -> MyocyteResult<()> {
        let log = self.log.as_ref().ok_or(MyocyteError::LoggingNotActive)?;
        for &(id, column) in &log.states {
            sink.append(column, self.values[id])?;
        }
        for &(slot, column) in &log.derivatives {
            sink.append(column, self.derivatives[slot])?;
        }
        for &(id, column) in &log.bound {
            sink.append(column, self.values[id])?;
        }
        for &(id, column) in &log.intermediaries {
            sink.append(column, self.values[id])?;
        }
        Ok(())
    }

    /// Release the logging registration. Idempotent; `begin_logging` may be
    /// called again afterwards.
    pub fn end_logging(&mut self) {
        self.log = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example_models::exponential_decay;
    use crate::logging::MemorySink;
    use is_close::is_close;

    fn engine() -> Engine {
        Engine::new(Arc::new(exponential_decay()))
    }

    #[test]
    fn defaults_are_baked_in() {
        let engine = engine();
        assert_eq!(engine.value_by_name("cell.y").unwrap(), 1.0);
        assert_eq!(engine.value_by_name("cell.k").unwrap(), 0.5);
        // Derived constants are evaluated at construction.
        assert_eq!(engine.value_by_name("cell.k_eff").unwrap(), 0.5);
        assert_eq!(engine.value_by_name("cell.scale2").unwrap(), 2.0);
    }

    #[test]
    fn unchanged_writes_keep_the_cache() {
        let mut engine = engine();
        engine.evaluate_derivatives().unwrap();
        assert_eq!(engine.evaluations(), 1);

        engine.set_literals(&[1.0]).unwrap();
        engine.set_parameters(&[0.5]).unwrap();
        engine.set_states(&[1.0]).unwrap();
        assert!(engine.derivatives_valid());
        engine.evaluate_derivatives().unwrap();
        assert_eq!(engine.evaluations(), 1);
    }

    #[test]
    fn literal_change_recomputes_both_derived_classes() {
        let mut engine = engine();
        engine.set_literals(&[2.0]).unwrap();
        // k_eff = k * scale is parameter-derived but references the literal.
        assert_eq!(engine.value_by_name("cell.k_eff").unwrap(), 1.0);
        assert_eq!(engine.value_by_name("cell.scale2").unwrap(), 4.0);
        // The parameter itself is untouched.
        assert_eq!(engine.value_by_name("cell.k").unwrap(), 0.5);
        assert!(!engine.derivatives_valid());
    }

    #[test]
    fn parameter_change_recomputes_parameter_derived_only() {
        let mut engine = engine();
        engine.set_parameters(&[0.7]).unwrap();
        assert_eq!(engine.value_by_name("cell.k_eff").unwrap(), 0.7);
        assert_eq!(engine.value_by_name("cell.scale2").unwrap(), 2.0);
    }

    #[test]
    fn repeated_evaluation_is_identical_and_cached() {
        let mut engine = engine();
        engine.evaluate_derivatives().unwrap();
        let first = engine.derivatives().to_vec();
        engine.evaluate_derivatives().unwrap();
        assert_eq!(engine.derivatives(), first.as_slice());
        assert_eq!(engine.evaluations(), 1);

        engine.set_states(&[0.5]).unwrap();
        engine.evaluate_derivatives().unwrap();
        assert_eq!(engine.evaluations(), 2);
        // dy/dt = -k_eff * y
        assert!(is_close!(engine.derivatives()[0], -0.25));
    }

    #[test]
    fn time_and_pace_gate_the_cache_but_informational_bounds_do_not() {
        let mut engine = engine();
        engine.set_bound(0.0, 0.0, 0.0, 0);
        engine.evaluate_derivatives().unwrap();
        assert_eq!(engine.evaluations(), 1);

        engine.set_bound(0.0, 0.0, 12.5, 99);
        assert!(engine.derivatives_valid());

        engine.set_bound(1.0, 0.0, 12.5, 99);
        assert!(!engine.derivatives_valid());
    }

    #[test]
    fn wrong_lengths_are_rejected() {
        let mut engine = engine();
        assert!(matches!(
            engine.set_states(&[1.0, 2.0]),
            Err(MyocyteError::WrongLength { .. })
        ));
        assert!(matches!(
            engine.set_parameters(&[]),
            Err(MyocyteError::WrongLength { .. })
        ));
    }

    fn sensitised() -> Engine {
        let mut engine = engine();
        engine
            .enable_sensitivities(
                &[
                    SensitivitySource::Parameter("cell.k".into()),
                    SensitivitySource::InitialState("cell.y".into()),
                ],
                &["cell.y".into(), "cell.rate".into()],
            )
            .unwrap();
        engine
    }

    #[test]
    fn independents_skip_non_parameter_entries() {
        let mut engine = sensitised();
        // Second entry aligns with the initial-value independent and must be
        // skipped without disturbing the state.
        engine
            .set_parameters_from_independents(&[0.9, 123.0])
            .unwrap();
        assert_eq!(engine.value_by_name("cell.k").unwrap(), 0.9);
        assert_eq!(engine.value_by_name("cell.y").unwrap(), 1.0);
    }

    #[test]
    fn sensitivity_outputs_follow_the_chain_rule() {
        let mut engine = sensitised();
        engine.evaluate_derivatives().unwrap();
        engine.set_state_sensitivities(0, &[2.0]).unwrap();
        engine.set_state_sensitivities(1, &[1.0]).unwrap();
        engine.evaluate_sensitivity_outputs().unwrap();
        let snapshot = engine.sensitivity_snapshot().unwrap();

        // d y / d k installed as 2.0.
        assert!(is_close!(snapshot[(0, 0)], 2.0));
        // rate = k_eff * y, so d rate / d k = y * scale + k_eff * 2.0.
        assert!(is_close!(snapshot[(1, 0)], 1.0 + 0.5 * 2.0));
        // d rate / d y0 = k_eff * 1.0.
        assert!(is_close!(snapshot[(1, 1)], 0.5));
    }

    #[test]
    fn sensitivity_invalidation_is_asymmetric() {
        let mut engine = sensitised();
        engine.evaluate_derivatives().unwrap();
        engine.set_state_sensitivities(0, &[1.0]).unwrap();
        engine.evaluate_sensitivity_outputs().unwrap();
        assert!(engine.sensitivity_outputs_valid());

        // Installing new state sensitivities clears only the sensitivity
        // flag; derivatives stay valid.
        engine.set_state_sensitivities(0, &[3.0]).unwrap();
        assert!(engine.derivatives_valid());
        assert!(!engine.sensitivity_outputs_valid());

        // A state change clears both.
        engine.evaluate_sensitivity_outputs().unwrap();
        engine.set_states(&[0.25]).unwrap();
        assert!(!engine.derivatives_valid());
        assert!(!engine.sensitivity_outputs_valid());
    }

    #[test]
    fn nudging_a_parameter_updates_derived_constants() {
        let mut engine = sensitised();
        engine.nudge_independent(0, 0.1);
        assert!(is_close!(engine.value_by_name("cell.k").unwrap(), 0.6));
        assert!(is_close!(engine.value_by_name("cell.k_eff").unwrap(), 0.6));
        // Nudging the initial-value independent is a no-op.
        engine.nudge_independent(1, 0.1);
        assert_eq!(engine.value_by_name("cell.y").unwrap(), 1.0);
    }

    #[test]
    fn numeric_partials_back_up_missing_analytic_ones() {
        let mut b = crate::model::CellModelBuilder::new("square");
        let _time = b.bound("engine.time", "ms", BoundRole::Time);
        let y = b.state("c.y", "1", 1.0);
        let z = b.intermediary("c.z", "1");
        b.equation(z, &[y], |d| d[0] * d[0]);
        b.derivative(y, &[y], |d| -d[0]);
        let model = b.build().unwrap();

        let mut engine = Engine::new(Arc::new(model));
        engine
            .enable_sensitivities(
                &[SensitivitySource::InitialState("c.y".into())],
                &["c.z".into()],
            )
            .unwrap();
        engine.evaluate_derivatives().unwrap();
        engine.set_state_sensitivities(0, &[1.0]).unwrap();
        engine.evaluate_sensitivity_outputs().unwrap();
        let snapshot = engine.sensitivity_snapshot().unwrap();
        // d(y^2)/dy = 2y, here by the centred-difference fallback.
        assert!(is_close!(snapshot[(0, 0)], 2.0, abs_tol = 1e-6));
    }

    #[test]
    fn logging_lifecycle() {
        let mut engine = engine();
        let mut sink = MemorySink::new();
        let names = vec![
            "cell.y".to_string(),
            "dot(cell.y)".to_string(),
            "engine.time".to_string(),
            "cell.rate".to_string(),
        ];
        engine.begin_logging(&names, &mut sink).unwrap();
        assert!(matches!(
            engine.begin_logging(&names, &mut sink),
            Err(MyocyteError::LoggingAlreadyActive)
        ));

        engine.evaluate_derivatives().unwrap();
        engine.log_once(&mut sink).unwrap();
        assert_eq!(sink.get("cell.y").unwrap(), &[1.0]);
        assert_eq!(sink.get("dot(cell.y)").unwrap(), &[-0.5]);
        assert_eq!(sink.get("cell.rate").unwrap(), &[0.5]);

        engine.end_logging();
        engine.end_logging();
        assert!(matches!(
            engine.log_once(&mut sink),
            Err(MyocyteError::LoggingNotActive)
        ));
        // Logging can be restarted after end_logging.
        engine.begin_logging(&names, &mut sink).unwrap();
    }

    #[test]
    fn logging_rejects_unknown_and_constant_names() {
        let mut engine = engine();
        let mut sink = MemorySink::new();
        let err = engine
            .begin_logging(&["membrane.missing".to_string()], &mut sink)
            .unwrap_err();
        assert!(matches!(err, MyocyteError::UnknownVariable(_)));

        let err = engine
            .begin_logging(&["cell.k".to_string()], &mut sink)
            .unwrap_err();
        assert!(matches!(err, MyocyteError::NotLoggable(_)));
    }

    #[test]
    fn sensitivity_logging_requires_sensitivities() {
        let engine = engine();
        let mut sink = MemorySink::new();
        assert!(matches!(
            engine.log_sensitivity_snapshot(&mut sink),
            Err(MyocyteError::SensitivitiesNotEnabled)
        ));
    }
}
