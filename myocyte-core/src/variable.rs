//! Variable classification and the model's variable table.
//!
//! Every quantity in a cell model is a named variable with a fixed class:
//!
//! - [`VariableKind::State`]: integrated quantity with a value and a derivative.
//! - [`VariableKind::Bound`]: externally driven input (time, pacing level,
//!   wall-clock time, evaluation count), identified by a [`BoundRole`].
//! - [`VariableKind::Intermediary`]: recomputed on every evaluation because it
//!   depends (transitively) on state or bound variables.
//! - Constants, split into four disjoint subclasses: [`VariableKind::Parameter`]
//!   (an independent leaf, selectable as a sensitivity input),
//!   [`VariableKind::ParameterDerived`], [`VariableKind::Literal`] and
//!   [`VariableKind::LiteralDerived`].
//!
//! The table maps fully-qualified names (e.g. `membrane.V`) to integer ids
//! once at model-build time; all runtime access is by id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Numeric type used for all model values.
pub type FloatValue = f64;

/// Simulation time.
pub type Time = f64;

/// Index of a variable in the model's [`VariableTable`].
pub type VarId = usize;

/// Classification of a model variable, fixed at model-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    /// An integrated quantity; has a value and a derivative.
    State,
    /// An externally driven input.
    Bound,
    /// Depends transitively on state and/or bound variables.
    Intermediary,
    /// An independent constant usable as a sensitivity input. Never computed
    /// from an expression.
    Parameter,
    /// A constant whose expression depends (transitively) on a parameter.
    ParameterDerived,
    /// An independent constant with no parameter dependency.
    Literal,
    /// A constant depending only on literals.
    LiteralDerived,
}

impl VariableKind {
    /// Returns true for the four constant subclasses.
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            VariableKind::Parameter
                | VariableKind::ParameterDerived
                | VariableKind::Literal
                | VariableKind::LiteralDerived
        )
    }
}

/// The external quantity a bound variable tracks.
///
/// `Time` and `Pace` affect derivative values and participate in the engine's
/// cache invalidation; `Realtime` and `Evaluations` are informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundRole {
    Time,
    Pace,
    Realtime,
    Evaluations,
}

/// Definition of a single model variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Fully-qualified name, unique within a model (e.g. `sodium.g_max`).
    pub name: String,
    /// Unit label. Informational; the engine does no unit conversion.
    pub unit: String,
    pub kind: VariableKind,
    /// Set for bound variables only.
    pub bound_role: Option<BoundRole>,
    /// Default value baked in from the model definition: literal and
    /// parameter values, state initial values. Zero for computed variables.
    pub default: FloatValue,
    /// Index of this variable within its own class (state slot, literal
    /// slot, ...).
    pub slot: usize,
}

/// All variables of a model, with name lookup resolved once at build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableTable {
    definitions: Vec<VariableDefinition>,
    by_name: HashMap<String, VarId>,
    states: Vec<VarId>,
    literals: Vec<VarId>,
    parameters: Vec<VarId>,
    bound: Vec<VarId>,
}

impl VariableTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a definition, assigning its id and class slot.
    ///
    /// The caller (the model builder) is responsible for name uniqueness.
    pub(crate) fn push(
        &mut self,
        name: String,
        unit: String,
        kind: VariableKind,
        bound_role: Option<BoundRole>,
        default: FloatValue,
    ) -> VarId {
        let id = self.definitions.len();
        let slot = match kind {
            VariableKind::State => {
                self.states.push(id);
                self.states.len() - 1
            }
            VariableKind::Literal => {
                self.literals.push(id);
                self.literals.len() - 1
            }
            VariableKind::Parameter => {
                self.parameters.push(id);
                self.parameters.len() - 1
            }
            VariableKind::Bound => {
                self.bound.push(id);
                self.bound.len() - 1
            }
            _ => self
                .definitions
                .iter()
                .filter(|d| d.kind == kind)
                .count(),
        };
        self.by_name.insert(name.clone(), id);
        self.definitions.push(VariableDefinition {
            name,
            unit,
            kind,
            bound_role,
            default,
            slot,
        });
        id
    }

    pub fn get(&self, id: VarId) -> &VariableDefinition {
        &self.definitions[id]
    }

    pub fn lookup(&self, name: &str) -> Option<VarId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableDefinition> {
        self.definitions.iter()
    }

    /// Ids of all state variables, in state-slot order. This order defines
    /// the layout of every state vector exchanged with the integrator.
    pub fn states(&self) -> &[VarId] {
        &self.states
    }

    pub fn literals(&self) -> &[VarId] {
        &self.literals
    }

    pub fn parameters(&self) -> &[VarId] {
        &self.parameters
    }

    pub fn bound(&self) -> &[VarId] {
        &self.bound
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// The bound variable carrying the given role, if the model declares one.
    pub fn bound_role(&self, role: BoundRole) -> Option<VarId> {
        self.bound
            .iter()
            .copied()
            .find(|&id| self.definitions[id].bound_role == Some(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_declaration_order() {
        let mut table = VariableTable::new();
        let a = table.push("a".into(), "mV".into(), VariableKind::State, None, -80.0);
        let b = table.push("b".into(), "1".into(), VariableKind::State, None, 0.1);
        let k = table.push(
            "k".into(),
            "1/ms".into(),
            VariableKind::Parameter,
            None,
            2.0,
        );

        assert_eq!(table.get(a).slot, 0);
        assert_eq!(table.get(b).slot, 1);
        assert_eq!(table.get(k).slot, 0);
        assert_eq!(table.states(), &[a, b]);
        assert_eq!(table.parameters(), &[k]);
        assert_eq!(table.lookup("b"), Some(b));
        assert_eq!(table.lookup("missing"), None);
    }

    #[test]
    fn bound_roles_resolve() {
        let mut table = VariableTable::new();
        let t = table.push(
            "engine.time".into(),
            "ms".into(),
            VariableKind::Bound,
            Some(BoundRole::Time),
            0.0,
        );
        table.push(
            "engine.pace".into(),
            "1".into(),
            VariableKind::Bound,
            Some(BoundRole::Pace),
            0.0,
        );

        assert_eq!(table.bound_role(BoundRole::Time), Some(t));
        assert_eq!(table.bound_role(BoundRole::Realtime), None);
    }

    #[test]
    fn constant_classification() {
        assert!(VariableKind::Parameter.is_constant());
        assert!(VariableKind::LiteralDerived.is_constant());
        assert!(!VariableKind::State.is_constant());
        assert!(!VariableKind::Bound.is_constant());
        assert!(!VariableKind::Intermediary.is_constant());
    }
}
