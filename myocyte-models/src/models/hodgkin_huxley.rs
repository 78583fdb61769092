//! Hodgkin-Huxley squid giant axon model.
//!
//! The classic four-state formulation with the membrane potential around a
//! resting value of -65 mV:
//!
//! $$ C_m \frac{dV}{dt} = I_{stim} - I_{Na} - I_K - I_{leak} $$
//!
//! with $I_{Na} = \bar{g}_{Na} m^3 h (V - E_{Na})$,
//! $I_K = \bar{g}_K n^4 (V - E_K)$ and
//! $I_{leak} = \bar{g}_L (V - E_L)$. The gates follow
//! $dx/dt = \alpha_x(V)(1 - x) - \beta_x(V) x$.
//!
//! The maximum conductances are parameters (and therefore selectable as
//! sensitivity inputs); the reversal potentials, membrane capacitance and
//! stimulus amplitude are literals. The stimulus current is the pacing level
//! scaled by the amplitude, so any pacing schedule can drive the cell.

use myocyte_core::model::{CellModel, CellModelBuilder};
use myocyte_core::pacing::PacingProtocol;
use myocyte_core::variable::BoundRole;
use serde::{Deserialize, Serialize};

pub const VAR_TIME: &str = "engine.time";
pub const VAR_PACE: &str = "engine.pace";
pub const VAR_MEMBRANE_V: &str = "membrane.V";
pub const VAR_SODIUM_CONDUCTANCE: &str = "sodium.g_max";
pub const VAR_POTASSIUM_CONDUCTANCE: &str = "potassium.g_max";
pub const VAR_LEAK_CONDUCTANCE: &str = "leak.g_max";
pub const VAR_STIMULUS_CURRENT: &str = "stimulus.i_stim";

/// Maximum conductances, overridable per run.
///
/// The vector form matches the model's parameter-slot order, so it can be
/// passed straight into a run configuration's parameter override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HodgkinHuxleyParameters {
    /// Maximum sodium conductance, mS/cm^2.
    pub g_na: f64,
    /// Maximum potassium conductance, mS/cm^2.
    pub g_k: f64,
    /// Leak conductance, mS/cm^2.
    pub g_leak: f64,
}

impl Default for HodgkinHuxleyParameters {
    fn default() -> Self {
        Self {
            g_na: 120.0,
            g_k: 36.0,
            g_leak: 0.3,
        }
    }
}

impl HodgkinHuxleyParameters {
    /// Parameter vector in the model's parameter-slot order.
    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.g_na, self.g_k, self.g_leak]
    }
}

/// Rate constants with a removable singularity are evaluated by their limit
/// near the singular voltage.
const SINGULARITY_WIDTH: f64 = 1e-6;

fn alpha_m(v: f64) -> f64 {
    if (v + 40.0).abs() < SINGULARITY_WIDTH {
        1.0
    } else {
        0.1 * (v + 40.0) / (1.0 - (-(v + 40.0) / 10.0).exp())
    }
}

fn beta_m(v: f64) -> f64 {
    4.0 * (-(v + 65.0) / 18.0).exp()
}

fn alpha_h(v: f64) -> f64 {
    0.07 * (-(v + 65.0) / 20.0).exp()
}

fn beta_h(v: f64) -> f64 {
    1.0 / (1.0 + (-(v + 35.0) / 10.0).exp())
}

fn alpha_n(v: f64) -> f64 {
    if (v + 55.0).abs() < SINGULARITY_WIDTH {
        0.1
    } else {
        0.01 * (v + 55.0) / (1.0 - (-(v + 55.0) / 10.0).exp())
    }
}

fn beta_n(v: f64) -> f64 {
    0.125 * (-(v + 65.0) / 80.0).exp()
}

/// Build the model with the standard squid-axon constants.
pub fn model() -> CellModel {
    let mut b = CellModelBuilder::new("hodgkin_huxley");

    let _time = b.bound(VAR_TIME, "ms", BoundRole::Time);
    let pace = b.bound(VAR_PACE, "1", BoundRole::Pace);

    let c_m = b.literal("membrane.C", "uF/cm^2", 1.0);
    let e_na = b.literal("sodium.E", "mV", 50.0);
    let e_k = b.literal("potassium.E", "mV", -77.0);
    let e_leak = b.literal("leak.E", "mV", -54.387);
    let amplitude = b.literal("stimulus.amplitude", "uA/cm^2", 20.0);

    let g_na = b.parameter(VAR_SODIUM_CONDUCTANCE, "mS/cm^2", 120.0);
    let g_k = b.parameter(VAR_POTASSIUM_CONDUCTANCE, "mS/cm^2", 36.0);
    let g_leak = b.parameter(VAR_LEAK_CONDUCTANCE, "mS/cm^2", 0.3);

    // Gate initial values are the steady state at the resting potential.
    let v = b.state(VAR_MEMBRANE_V, "mV", -65.0);
    let m = b.state("sodium.m", "1", 0.0529);
    let h = b.state("sodium.h", "1", 0.5961);
    let n = b.state("potassium.n", "1", 0.3177);

    let am = b.intermediary("sodium.alpha_m", "1/ms");
    let bm = b.intermediary("sodium.beta_m", "1/ms");
    let ah = b.intermediary("sodium.alpha_h", "1/ms");
    let bh = b.intermediary("sodium.beta_h", "1/ms");
    let an = b.intermediary("potassium.alpha_n", "1/ms");
    let bn = b.intermediary("potassium.beta_n", "1/ms");
    let i_stim = b.intermediary(VAR_STIMULUS_CURRENT, "uA/cm^2");
    let i_na = b.intermediary("sodium.i_na", "uA/cm^2");
    let i_k = b.intermediary("potassium.i_k", "uA/cm^2");
    let i_leak = b.intermediary("leak.i_leak", "uA/cm^2");

    b.equation(am, &[v], |d| alpha_m(d[0]));
    b.equation(bm, &[v], |d| beta_m(d[0]));
    b.equation(ah, &[v], |d| alpha_h(d[0]));
    b.equation(bh, &[v], |d| beta_h(d[0]));
    b.equation(an, &[v], |d| alpha_n(d[0]));
    b.equation(bn, &[v], |d| beta_n(d[0]));

    b.equation(i_stim, &[pace, amplitude], |d| d[0] * d[1]);
    b.equation(i_na, &[g_na, m, h, v, e_na], |d| {
        d[0] * d[1] * d[1] * d[1] * d[2] * (d[3] - d[4])
    });
    b.equation(i_k, &[g_k, n, v, e_k], |d| {
        d[0] * d[1] * d[1] * d[1] * d[1] * (d[2] - d[3])
    });
    b.equation(i_leak, &[g_leak, v, e_leak], |d| d[0] * (d[1] - d[2]));

    b.derivative(v, &[i_stim, i_na, i_k, i_leak, c_m], |d| {
        (d[0] - d[1] - d[2] - d[3]) / d[4]
    });
    b.derivative(m, &[am, bm, m], |d| d[0] * (1.0 - d[2]) - d[1] * d[2]);
    b.derivative(h, &[ah, bh, h], |d| d[0] * (1.0 - d[2]) - d[1] * d[2]);
    b.derivative(n, &[an, bn, n], |d| d[0] * (1.0 - d[2]) - d[1] * d[2]);

    b.build().expect("the Hodgkin-Huxley model is valid")
}

/// A periodic stimulus train: 2 ms pulses at unit level, starting at
/// `start` and repeating every `period` milliseconds (zero for a single
/// pulse).
pub fn stimulus_protocol(start: f64, period: f64) -> PacingProtocol {
    let mut protocol = PacingProtocol::new();
    if period > 0.0 {
        protocol.schedule_periodic(1.0, start, 2.0, period, 0);
    } else {
        protocol.schedule(1.0, start, 2.0);
    }
    protocol
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;
    use myocyte_core::engine::SensitivitySource;
    use myocyte_core::ivp::CrossingDirection;
    use myocyte_core::logging::MemorySink;
    use myocyte_core::pacing::PacingConfig;
    use myocyte_core::simulation::{RootConfig, RunConfig, SensitivityConfig, Simulation};
    use myocyte_core::variable::VariableKind;
    use std::sync::Arc;

    #[test]
    fn model_builds_with_the_expected_classification() {
        let model = model();
        let count = |kind: VariableKind| {
            model
                .table()
                .iter()
                .filter(|def| def.kind == kind)
                .count()
        };
        assert_eq!(model.n_states(), 4);
        assert_eq!(count(VariableKind::Bound), 2);
        assert_eq!(count(VariableKind::Literal), 5);
        assert_eq!(count(VariableKind::Parameter), 3);
        assert_eq!(count(VariableKind::Intermediary), 10);
        assert_eq!(model.default_parameters(), vec![120.0, 36.0, 0.3]);
    }

    #[test]
    fn rate_constants_handle_their_singular_voltages() {
        assert!(is_close!(alpha_m(-40.0), 1.0));
        assert!(is_close!(alpha_m(-40.0 + 1e-9), 1.0, abs_tol = 1e-6));
        assert!(is_close!(alpha_n(-55.0), 0.1));
    }

    #[test]
    fn parameter_overrides_line_up_with_the_slots() {
        let model = model();
        let defaults = HodgkinHuxleyParameters::default();
        assert_eq!(model.default_parameters(), defaults.to_vec());

        let mut sim: Simulation<MemorySink> = Simulation::new(Arc::new(model));
        let mut config = RunConfig::new(0.0, 5.0);
        config.parameters = Some(
            HodgkinHuxleyParameters {
                g_na: 100.0,
                ..Default::default()
            }
            .to_vec(),
        );
        sim.init(config, MemorySink::new()).unwrap();
        sim.run_to_completion().unwrap();
    }

    #[test]
    fn resting_cell_stays_at_rest() {
        let mut sim: Simulation<MemorySink> = Simulation::new(Arc::new(model()));
        sim.init(RunConfig::new(0.0, 20.0), MemorySink::new())
            .unwrap();
        let output = sim.run_to_completion().unwrap();
        assert!(
            (output.state[0] + 65.0).abs() < 2.0,
            "resting potential drifted to {}",
            output.state[0]
        );
    }

    #[test]
    fn stimulus_evokes_an_action_potential() {
        let mut sim: Simulation<MemorySink> = Simulation::new(Arc::new(model()));
        let mut config = RunConfig::new(0.0, 20.0);
        config.pacing = PacingConfig::Protocol(stimulus_protocol(2.0, 0.0));
        config.log.variables = vec![VAR_TIME.into(), VAR_MEMBRANE_V.into()];
        config.root = Some(RootConfig {
            variable: VAR_MEMBRANE_V.into(),
            threshold: 0.0,
        });
        sim.init(config, MemorySink::new()).unwrap();
        let output = sim.run_to_completion().unwrap();

        // The upstroke crosses 0 mV once on the way up and once on the way
        // back down.
        assert_eq!(output.roots.len(), 2);
        assert_eq!(output.roots[0].direction, CrossingDirection::Rising);
        assert_eq!(output.roots[1].direction, CrossingDirection::Falling);
        assert!(output.roots[0].time > 2.0);
        assert!(output.roots[0].time < output.roots[1].time);

        let peak = output
            .sink
            .get(VAR_MEMBRANE_V)
            .unwrap()
            .iter()
            .fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        assert!(peak > 20.0, "action potential peaked at only {} mV", peak);
    }

    #[test]
    fn periodic_logging_excludes_the_final_instant() {
        let mut sim: Simulation<MemorySink> = Simulation::new(Arc::new(model()));
        let mut config = RunConfig::new(0.0, 20.0);
        config.log.interval = 5.0;
        config.log.variables = vec![VAR_TIME.into()];
        sim.init(config, MemorySink::new()).unwrap();
        let output = sim.run_to_completion().unwrap();
        assert_eq!(
            output.sink.get(VAR_TIME).unwrap(),
            &[0.0, 5.0, 10.0, 15.0]
        );
    }

    #[test]
    fn membrane_potential_is_sensitive_to_the_sodium_conductance() {
        let mut sim: Simulation<MemorySink> = Simulation::new(Arc::new(model()));
        let mut config = RunConfig::new(0.0, 15.0);
        config.pacing = PacingConfig::Protocol(stimulus_protocol(2.0, 0.0));
        config.log.interval = 5.0;
        config.log.variables = vec![VAR_TIME.into(), VAR_MEMBRANE_V.into()];
        config.sensitivities = Some(SensitivityConfig {
            independents: vec![SensitivitySource::Parameter(
                VAR_SODIUM_CONDUCTANCE.into(),
            )],
            dependents: vec![VAR_MEMBRANE_V.into(), VAR_STIMULUS_CURRENT.into()],
            initial: None,
        });
        sim.init(config, MemorySink::new()).unwrap();
        let output = sim.run_to_completion().unwrap();

        let snapshots = output.sink.sensitivities();
        assert_eq!(snapshots.len(), 3);
        // Before the stimulus the sensitivity is essentially zero; after the
        // action potential it is not.
        assert!(snapshots[0][(0, 0)].abs() < 1e-6);
        assert!(snapshots[2][(0, 0)].abs() > 1e-6);
        // The stimulus current does not depend on the conductance at all.
        for snapshot in snapshots {
            assert_eq!(snapshot[(1, 0)], 0.0);
        }
    }
}
