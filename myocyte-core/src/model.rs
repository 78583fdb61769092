//! Cell model definition and builder.
//!
//! A [`CellModel`] is built once from a set of variable declarations and one
//! equation per computed variable. The builder wires the declared
//! dependencies into a directed graph and derives from it everything the
//! engine needs at runtime: a topological evaluation order, the split of
//! constants into literal-derived and parameter-derived, and the check that
//! parameters remain independent leaves.
//!
//! Equations are plain closures over the values of their declared
//! dependencies. An equation may also carry analytic partial derivatives
//! (one per dependency, in the same order) for use by the sensitivity chain
//! rule; where these are absent the engine falls back to a centred finite
//! difference on the closure itself.

use crate::errors::{MyocyteError, MyocyteResult};
use crate::variable::{BoundRole, FloatValue, VarId, VariableKind, VariableTable};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::fmt;

/// Evaluation closure over the values of an equation's dependencies.
pub type EvalFn = Box<dyn Fn(&[FloatValue]) -> FloatValue + Send + Sync>;

/// A single model equation: the value of one variable as a function of its
/// dependencies.
pub struct Equation {
    pub(crate) deps: Vec<VarId>,
    pub(crate) eval: EvalFn,
    /// Analytic partial derivatives with respect to each dependency, aligned
    /// with `deps`. Empty when only the finite-difference fallback is
    /// available.
    pub(crate) partials: Vec<EvalFn>,
}

impl fmt::Debug for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Equation")
            .field("deps", &self.deps)
            .field("analytic_partials", &!self.partials.is_empty())
            .finish()
    }
}

/// A complete, validated cell model.
///
/// Owns the variable table, the equations and the evaluation orders. Models
/// are immutable once built; all mutable numeric state lives in the engine.
pub struct CellModel {
    name: String,
    table: VariableTable,
    /// Value equation per variable id; `None` for leaves (states, bound
    /// variables, literals, parameters).
    equations: Vec<Option<Equation>>,
    /// Derivative equation per state slot.
    derivatives: Vec<Equation>,
    literal_derived_order: Vec<VarId>,
    parameter_derived_order: Vec<VarId>,
    intermediary_order: Vec<VarId>,
    topo_order: Vec<VarId>,
}

impl fmt::Debug for CellModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellModel")
            .field("name", &self.name)
            .field("variables", &self.table.len())
            .field("states", &self.table.n_states())
            .finish()
    }
}

impl CellModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &VariableTable {
        &self.table
    }

    pub fn n_states(&self) -> usize {
        self.table.n_states()
    }

    pub fn lookup(&self, name: &str) -> Option<VarId> {
        self.table.lookup(name)
    }

    /// Default state vector, in state-slot order.
    pub fn initial_states(&self) -> Vec<FloatValue> {
        self.table
            .states()
            .iter()
            .map(|&id| self.table.get(id).default)
            .collect()
    }

    /// Default literal values, in literal-slot order.
    pub fn default_literals(&self) -> Vec<FloatValue> {
        self.table
            .literals()
            .iter()
            .map(|&id| self.table.get(id).default)
            .collect()
    }

    /// Default parameter values, in parameter-slot order.
    pub fn default_parameters(&self) -> Vec<FloatValue> {
        self.table
            .parameters()
            .iter()
            .map(|&id| self.table.get(id).default)
            .collect()
    }

    pub(crate) fn equation(&self, id: VarId) -> Option<&Equation> {
        self.equations[id].as_ref()
    }

    pub(crate) fn derivative(&self, state_slot: usize) -> &Equation {
        &self.derivatives[state_slot]
    }

    pub(crate) fn literal_derived_order(&self) -> &[VarId] {
        &self.literal_derived_order
    }

    pub(crate) fn parameter_derived_order(&self) -> &[VarId] {
        &self.parameter_derived_order
    }

    pub(crate) fn intermediary_order(&self) -> &[VarId] {
        &self.intermediary_order
    }

    pub(crate) fn topo_order(&self) -> &[VarId] {
        &self.topo_order
    }
}

/// Staged declaration kinds; constants are subclassified at build time.
#[derive(Debug, Clone, Copy)]
enum Declared {
    Bound(BoundRole),
    Literal(FloatValue),
    Parameter(FloatValue),
    Derived,
    State(FloatValue),
    Intermediary,
}

#[derive(Debug)]
struct StagedVariable {
    name: String,
    unit: String,
    decl: Declared,
}

/// Build a new cell model from variable declarations and equations.
///
/// Declaration methods return the new variable's id, which is then used to
/// express dependencies. Equations can be attached in any order; the build
/// step resolves the evaluation order from the declared dependencies.
pub struct CellModelBuilder {
    name: String,
    variables: Vec<StagedVariable>,
    by_name: HashMap<String, VarId>,
    equations: HashMap<VarId, Equation>,
    derivative_equations: HashMap<VarId, Equation>,
    problems: Vec<String>,
}

impl CellModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            variables: Vec::new(),
            by_name: HashMap::new(),
            equations: HashMap::new(),
            derivative_equations: HashMap::new(),
            problems: Vec::new(),
        }
    }

    fn declare(&mut self, name: &str, unit: &str, decl: Declared) -> VarId {
        let id = self.variables.len();
        if self.by_name.insert(name.to_string(), id).is_some() {
            self.problems
                .push(format!("variable '{}' is declared twice", name));
        }
        self.variables.push(StagedVariable {
            name: name.to_string(),
            unit: unit.to_string(),
            decl,
        });
        id
    }

    /// Declare an externally driven input carrying the given role.
    pub fn bound(&mut self, name: &str, unit: &str, role: BoundRole) -> VarId {
        self.declare(name, unit, Declared::Bound(role))
    }

    /// Declare an independent constant with no parameter role.
    pub fn literal(&mut self, name: &str, unit: &str, value: FloatValue) -> VarId {
        self.declare(name, unit, Declared::Literal(value))
    }

    /// Declare an independent constant selectable as a sensitivity input.
    pub fn parameter(&mut self, name: &str, unit: &str, value: FloatValue) -> VarId {
        self.declare(name, unit, Declared::Parameter(value))
    }

    /// Declare a derived constant. Whether it is literal-derived or
    /// parameter-derived is determined from its dependency closure at build
    /// time.
    pub fn derived(&mut self, name: &str, unit: &str) -> VarId {
        self.declare(name, unit, Declared::Derived)
    }

    /// Declare an integrated state variable with its initial value.
    pub fn state(&mut self, name: &str, unit: &str, initial: FloatValue) -> VarId {
        self.declare(name, unit, Declared::State(initial))
    }

    /// Declare an intermediary variable, recomputed on every evaluation.
    pub fn intermediary(&mut self, name: &str, unit: &str) -> VarId {
        self.declare(name, unit, Declared::Intermediary)
    }

    /// Attach the value equation for an intermediary or derived constant.
    pub fn equation<F>(&mut self, target: VarId, deps: &[VarId], eval: F) -> &mut Self
    where
        F: Fn(&[FloatValue]) -> FloatValue + Send + Sync + 'static,
    {
        self.equation_with_partials(target, deps, eval, Vec::new())
    }

    /// Attach a value equation together with analytic partial derivatives,
    /// one per dependency in the same order.
    pub fn equation_with_partials<F>(
        &mut self,
        target: VarId,
        deps: &[VarId],
        eval: F,
        partials: Vec<EvalFn>,
    ) -> &mut Self
    where
        F: Fn(&[FloatValue]) -> FloatValue + Send + Sync + 'static,
    {
        if !partials.is_empty() && partials.len() != deps.len() {
            self.problems.push(format!(
                "equation for variable #{} declares {} dependencies but {} partials",
                target,
                deps.len(),
                partials.len()
            ));
        }
        let previous = self.equations.insert(
            target,
            Equation {
                deps: deps.to_vec(),
                eval: Box::new(eval),
                partials,
            },
        );
        if previous.is_some() {
            self.problems
                .push(format!("variable #{} has two equations", target));
        }
        self
    }

    /// Attach the derivative equation for a state variable.
    pub fn derivative<F>(&mut self, state: VarId, deps: &[VarId], eval: F) -> &mut Self
    where
        F: Fn(&[FloatValue]) -> FloatValue + Send + Sync + 'static,
    {
        self.derivative_with_partials(state, deps, eval, Vec::new())
    }

    /// Attach a derivative equation together with analytic partials.
    pub fn derivative_with_partials<F>(
        &mut self,
        state: VarId,
        deps: &[VarId],
        eval: F,
        partials: Vec<EvalFn>,
    ) -> &mut Self
    where
        F: Fn(&[FloatValue]) -> FloatValue + Send + Sync + 'static,
    {
        if !partials.is_empty() && partials.len() != deps.len() {
            self.problems.push(format!(
                "derivative for variable #{} declares {} dependencies but {} partials",
                state,
                deps.len(),
                partials.len()
            ));
        }
        let previous = self.derivative_equations.insert(
            state,
            Equation {
                deps: deps.to_vec(),
                eval: Box::new(eval),
                partials,
            },
        );
        if previous.is_some() {
            self.problems
                .push(format!("state #{} has two derivative equations", state));
        }
        self
    }

    /// Validate the declarations and produce a concrete model.
    pub fn build(mut self) -> MyocyteResult<CellModel> {
        let n = self.variables.len();

        // Targets and dependencies must refer to declared variables.
        for eq in self.equations.values().chain(self.derivative_equations.values()) {
            for &dep in &eq.deps {
                if dep >= n {
                    return Err(MyocyteError::Error(format!(
                        "equation references undeclared variable #{}",
                        dep
                    )));
                }
            }
        }
        for (&target, _) in self.equations.iter().chain(self.derivative_equations.iter()) {
            if target >= n {
                return Err(MyocyteError::Error(format!(
                    "equation targets undeclared variable #{}",
                    target
                )));
            }
        }

        for (id, var) in self.variables.iter().enumerate() {
            let has_equation = self.equations.contains_key(&id);
            let has_derivative = self.derivative_equations.contains_key(&id);
            match var.decl {
                Declared::Parameter(_) => {
                    if has_equation {
                        self.problems.push(format!(
                            "parameter '{}' must be an independent leaf and cannot have an equation",
                            var.name
                        ));
                    }
                }
                Declared::Bound(_) | Declared::Literal(_) => {
                    if has_equation {
                        self.problems
                            .push(format!("variable '{}' cannot have an equation", var.name));
                    }
                }
                Declared::Derived | Declared::Intermediary => {
                    if !has_equation {
                        self.problems
                            .push(format!("variable '{}' has no equation", var.name));
                    }
                }
                Declared::State(_) => {
                    if has_equation {
                        self.problems.push(format!(
                            "state '{}' cannot have a value equation; its value is integrated",
                            var.name
                        ));
                    }
                    if !has_derivative {
                        self.problems
                            .push(format!("state '{}' has no derivative equation", var.name));
                    }
                }
            }
            if has_derivative && !matches!(var.decl, Declared::State(_)) {
                self.problems.push(format!(
                    "variable '{}' is not a state and cannot have a derivative equation",
                    var.name
                ));
            }
        }

        if let Some(problem) = self.problems.first() {
            return Err(MyocyteError::Error(problem.clone()));
        }

        // Dependency graph over value equations only. Derivative equations do
        // not order anything: they are evaluated after all intermediaries and
        // never feed back into values within one evaluation.
        let mut graph: DiGraph<VarId, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..n).map(|id| graph.add_node(id)).collect();
        for (&target, eq) in &self.equations {
            for &dep in &eq.deps {
                graph.add_edge(nodes[dep], nodes[target], ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let id = graph[cycle.node_id()];
            MyocyteError::CyclicDependency(self.variables[id].name.clone())
        })?;
        let topo_order: Vec<VarId> = sorted.into_iter().map(|ix| graph[ix]).collect();

        // Propagate dependency closures in topological order.
        let mut on_parameter = vec![false; n];
        let mut on_dynamic = vec![false; n];
        for (id, var) in self.variables.iter().enumerate() {
            match var.decl {
                Declared::Parameter(_) => on_parameter[id] = true,
                Declared::State(_) | Declared::Bound(_) => on_dynamic[id] = true,
                _ => {}
            }
        }
        for &id in &topo_order {
            if let Some(eq) = self.equations.get(&id) {
                for &dep in &eq.deps {
                    let (parameter, dynamic) = (on_parameter[dep], on_dynamic[dep]);
                    on_parameter[id] |= parameter;
                    on_dynamic[id] |= dynamic;
                }
            }
        }

        let mut table = VariableTable::new();
        for (id, var) in self.variables.iter().enumerate() {
            let (kind, role, default) = match var.decl {
                Declared::Bound(role) => (VariableKind::Bound, Some(role), 0.0),
                Declared::Literal(v) => (VariableKind::Literal, None, v),
                Declared::Parameter(v) => (VariableKind::Parameter, None, v),
                Declared::State(v) => (VariableKind::State, None, v),
                Declared::Derived => {
                    if on_dynamic[id] {
                        return Err(MyocyteError::Error(format!(
                            "derived constant '{}' depends on a state or bound variable; \
                             declare it as an intermediary",
                            var.name
                        )));
                    }
                    let kind = if on_parameter[id] {
                        VariableKind::ParameterDerived
                    } else {
                        VariableKind::LiteralDerived
                    };
                    (kind, None, 0.0)
                }
                Declared::Intermediary => {
                    if !on_dynamic[id] {
                        return Err(MyocyteError::Error(format!(
                            "intermediary '{}' does not depend on any state or bound variable; \
                             declare it as a derived constant",
                            var.name
                        )));
                    }
                    (VariableKind::Intermediary, None, 0.0)
                }
            };
            table.push(var.name.clone(), var.unit.clone(), kind, role, default);
        }

        // A model may bind each role at most once.
        for (id, var) in self.variables.iter().enumerate() {
            if let Declared::Bound(role) = var.decl {
                if table.bound_role(role) != Some(id) {
                    return Err(MyocyteError::Error(format!(
                        "bound role {:?} is declared more than once",
                        role
                    )));
                }
            }
        }

        let literal_derived_order: Vec<VarId> = topo_order
            .iter()
            .copied()
            .filter(|&id| table.get(id).kind == VariableKind::LiteralDerived)
            .collect();
        let parameter_derived_order: Vec<VarId> = topo_order
            .iter()
            .copied()
            .filter(|&id| table.get(id).kind == VariableKind::ParameterDerived)
            .collect();
        let intermediary_order: Vec<VarId> = topo_order
            .iter()
            .copied()
            .filter(|&id| table.get(id).kind == VariableKind::Intermediary)
            .collect();

        let mut equations: Vec<Option<Equation>> = (0..n).map(|_| None).collect();
        for (target, eq) in self.equations {
            equations[target] = Some(eq);
        }
        let mut derivatives: Vec<Option<Equation>> =
            (0..table.n_states()).map(|_| None).collect();
        for (state, eq) in self.derivative_equations {
            derivatives[table.get(state).slot] = Some(eq);
        }
        let derivatives: Vec<Equation> = derivatives
            .into_iter()
            .map(|eq| eq.expect("every state has a derivative after validation"))
            .collect();

        Ok(CellModel {
            name: self.name,
            table,
            equations,
            derivatives,
            literal_derived_order,
            parameter_derived_order,
            intermediary_order,
            topo_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_model() -> CellModelBuilder {
        let mut b = CellModelBuilder::new("simple");
        let _time = b.bound("engine.time", "ms", BoundRole::Time);
        let scale = b.literal("cell.scale", "1", 1.0);
        let k = b.parameter("cell.k", "1/ms", 0.5);
        let k_eff = b.derived("cell.k_eff", "1/ms");
        let y = b.state("cell.y", "mM", 1.0);
        let rate = b.intermediary("cell.rate", "mM/ms");
        b.equation(k_eff, &[k, scale], |d| d[0] * d[1]);
        b.equation(rate, &[k_eff, y], |d| d[0] * d[1]);
        b.derivative(y, &[rate], |d| -d[0]);
        b
    }

    #[test]
    fn classification() {
        let model = simple_model().build().unwrap();
        let table = model.table();
        assert_eq!(
            table.get(table.lookup("cell.k_eff").unwrap()).kind,
            VariableKind::ParameterDerived
        );
        assert_eq!(
            table.get(table.lookup("cell.rate").unwrap()).kind,
            VariableKind::Intermediary
        );
        assert_eq!(
            table.get(table.lookup("cell.scale").unwrap()).kind,
            VariableKind::Literal
        );
        assert_eq!(model.initial_states(), vec![1.0]);
        assert_eq!(model.default_parameters(), vec![0.5]);
    }

    #[test]
    fn literal_derived_classification() {
        let mut b = CellModelBuilder::new("literals");
        let _time = b.bound("engine.time", "ms", BoundRole::Time);
        let a = b.literal("c.a", "1", 2.0);
        let twice = b.derived("c.twice", "1");
        let y = b.state("c.y", "1", 0.0);
        b.equation(twice, &[a], |d| 2.0 * d[0]);
        b.derivative(y, &[twice], |d| d[0]);
        let model = b.build().unwrap();
        assert_eq!(
            model.table().get(model.lookup("c.twice").unwrap()).kind,
            VariableKind::LiteralDerived
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = CellModelBuilder::new("cyclic");
        let y = b.state("c.y", "1", 0.0);
        let a = b.intermediary("c.a", "1");
        let c = b.intermediary("c.b", "1");
        b.equation(a, &[c, y], |d| d[0] + d[1]);
        b.equation(c, &[a], |d| d[0]);
        b.derivative(y, &[a], |d| d[0]);
        let err = b.build().unwrap_err();
        assert!(matches!(err, MyocyteError::CyclicDependency(_)));
    }

    #[test]
    fn parameter_cannot_have_an_equation() {
        let mut b = CellModelBuilder::new("bad");
        let y = b.state("c.y", "1", 0.0);
        let k = b.parameter("c.k", "1", 1.0);
        b.equation(k, &[y], |d| d[0]);
        b.derivative(y, &[y], |d| -d[0]);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("independent leaf"));
    }

    #[test]
    fn derived_constant_cannot_touch_state() {
        let mut b = CellModelBuilder::new("bad");
        let y = b.state("c.y", "1", 0.0);
        let d = b.derived("c.d", "1");
        b.equation(d, &[y], |v| v[0]);
        b.derivative(y, &[y], |v| -v[0]);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("declare it as an intermediary"));
    }

    #[test]
    fn intermediary_must_touch_state_or_bound() {
        let mut b = CellModelBuilder::new("bad");
        let y = b.state("c.y", "1", 0.0);
        let a = b.literal("c.a", "1", 1.0);
        let i = b.intermediary("c.i", "1");
        b.equation(i, &[a], |v| v[0]);
        b.derivative(y, &[y], |v| -v[0]);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("derived constant"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = CellModelBuilder::new("bad");
        let y = b.state("c.y", "1", 0.0);
        b.literal("c.y", "1", 1.0);
        b.derivative(y, &[y], |v| -v[0]);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn missing_equation_is_rejected() {
        let mut b = CellModelBuilder::new("bad");
        let y = b.state("c.y", "1", 0.0);
        b.intermediary("c.i", "1");
        b.derivative(y, &[y], |v| -v[0]);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("no equation"));
    }
}
