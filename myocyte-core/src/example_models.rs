#![allow(dead_code)]

//! Small models used by the crate's own tests.

use crate::model::{CellModel, CellModelBuilder, EvalFn};
use crate::variable::BoundRole;

/// Exponential decay with a parameter/derived-constant chain:
///
/// `k_eff = k * scale`, `rate = k_eff * y`, `dy/dt = -rate`.
///
/// The solution is `y(t) = y0 exp(-k_eff t)`, which makes the sensitivity
/// trajectories with respect to `k` and `y0` known in closed form. Every
/// equation carries analytic partials. `scale2` exists only to give the
/// model a literal-derived constant.
pub(crate) fn exponential_decay() -> CellModel {
    let mut b = CellModelBuilder::new("exponential_decay");
    let _time = b.bound("engine.time", "ms", BoundRole::Time);
    let _pace = b.bound("engine.pace", "1", BoundRole::Pace);
    let scale = b.literal("cell.scale", "1", 1.0);
    let scale2 = b.derived("cell.scale2", "1");
    let k = b.parameter("cell.k", "1/ms", 0.5);
    let k_eff = b.derived("cell.k_eff", "1/ms");
    let y = b.state("cell.y", "mM", 1.0);
    let rate = b.intermediary("cell.rate", "mM/ms");

    b.equation(scale2, &[scale], |d| 2.0 * d[0]);
    let partials: Vec<EvalFn> = vec![Box::new(|d: &[f64]| d[1]), Box::new(|d: &[f64]| d[0])];
    b.equation_with_partials(k_eff, &[k, scale], |d| d[0] * d[1], partials);
    let partials: Vec<EvalFn> = vec![Box::new(|d: &[f64]| d[1]), Box::new(|d: &[f64]| d[0])];
    b.equation_with_partials(rate, &[k_eff, y], |d| d[0] * d[1], partials);
    let partials: Vec<EvalFn> = vec![Box::new(|_: &[f64]| -1.0)];
    b.derivative_with_partials(y, &[rate], |d| -d[0], partials);

    b.build().expect("the decay model is valid")
}

/// Integrates the pacing signal: `dq/dt = pace`.
///
/// After a run, the accumulated charge equals the pacing level integrated
/// over time, which makes pacing schedules easy to assert on.
pub(crate) fn pace_accumulator() -> CellModel {
    let mut b = CellModelBuilder::new("pace_accumulator");
    let _time = b.bound("engine.time", "ms", BoundRole::Time);
    let pace = b.bound("engine.pace", "1", BoundRole::Pace);
    let q = b.state("cell.q", "1", 0.0);
    b.derivative(q, &[pace], |d| d[0]);
    b.build().expect("the accumulator model is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::VariableKind;

    #[test]
    fn decay_model_covers_every_variable_class() {
        let model = exponential_decay();
        let count = |kind: VariableKind| {
            model
                .table()
                .iter()
                .filter(|def| def.kind == kind)
                .count()
        };
        assert_eq!(count(VariableKind::Bound), 2);
        assert_eq!(count(VariableKind::Literal), 1);
        assert_eq!(count(VariableKind::LiteralDerived), 1);
        assert_eq!(count(VariableKind::Parameter), 1);
        assert_eq!(count(VariableKind::ParameterDerived), 1);
        assert_eq!(count(VariableKind::State), 1);
        assert_eq!(count(VariableKind::Intermediary), 1);
    }

    #[test]
    fn accumulator_starts_empty() {
        let model = pace_accumulator();
        assert_eq!(model.initial_states(), vec![0.0]);
    }
}
