//! Integrator boundary and the bundled adaptive stepper.
//!
//! The orchestrator consumes an external ODE integrator through the
//! [`Integrator`] trait: advance by one internal step, interpolate anywhere
//! within the last step, reinitialise after a manual state change, and the
//! forward-sensitivity variants of each. Any solver satisfying the contract
//! can be plugged in; [`DormandPrince54`] is the reference implementation
//! shipped with the crate.
//!
//! `step_once` takes a target time but treats it as advisory: like a
//! one-step-mode stiff solver, an internal step may land past the target.
//! The orchestrator detects the overshoot and rolls back by interpolation.

use crate::variable::{FloatValue, Time};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Solver failure classes. Each maps to its own diagnostic.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("solver has not been initialised")]
    NotInitialised,
    #[error("illegal solver input: {0}")]
    IllegalInput(String),
    #[error("internal work limit exceeded at t = {t}")]
    WorkLimitExceeded { t: Time },
    #[error("requested accuracy cannot be achieved at t = {t}; tolerances are too demanding")]
    AccuracyTooDemanding { t: Time },
    #[error("repeated error test failures at t = {t}")]
    ErrorTestFailures { t: Time },
    #[error("repeated convergence failures at t = {t}")]
    ConvergenceFailures { t: Time },
    #[error("right-hand side evaluation failed at t = {t}")]
    RhsFailure { t: Time },
    #[error("right-hand side failed repeatedly at t = {t}")]
    RepeatedRhsFailure { t: Time },
    #[error("root finding failed at t = {t}")]
    RootFindFailure { t: Time },
    #[error("interpolation time {t} is outside the last step [{lo}, {hi}]")]
    InterpolationOutOfRange { t: Time, lo: Time, hi: Time },
    #[error("solver memory could not be allocated")]
    MemoryFailure,
    #[error("sensitivity analysis has not been initialised")]
    SensitivitiesNotInitialised,
}

/// Right-hand side of the ODE system, plus handles to the sensitivity
/// independents for solvers that evaluate sensitivity right-hand sides by
/// directional finite differences.
pub trait OdeRhs {
    /// Number of state variables.
    fn dim(&self) -> usize;

    /// Evaluate `dy/dt = f(t, y)` into `dydt`.
    fn eval(
        &mut self,
        t: Time,
        y: &[FloatValue],
        dydt: &mut [FloatValue],
    ) -> Result<(), SolverError>;

    /// Number of sensitivity independents (zero when disabled).
    fn n_independents(&self) -> usize {
        0
    }

    /// Shift the live value of one independent by `delta`. A no-op for
    /// initial-value independents, whose influence enters only through the
    /// state sensitivities.
    fn nudge_independent(&mut self, _index: usize, _delta: FloatValue) {}

    /// Current value of one independent, used to scale perturbations.
    fn independent_value(&self, _index: usize) -> FloatValue {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossingDirection {
    Rising,
    Falling,
}

/// A detected crossing of the root threshold by the designated state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootEvent {
    pub time: Time,
    pub direction: CrossingDirection,
}

/// Result of one internal integration step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Time reached by the step; may lie past the requested target.
    pub t: Time,
    /// Root crossing detected within this step, if any.
    pub root: Option<RootEvent>,
}

/// Contract consumed by the simulation orchestrator.
pub trait Integrator {
    fn set_tolerances(&mut self, rel: f64, abs: f64) -> Result<(), SolverError>;

    /// Bounds on the internal step size. A minimum of zero means the
    /// solver's own floating point floor.
    fn set_step_bounds(&mut self, min: f64, max: f64) -> Result<(), SolverError>;

    /// Watch one state (by state slot) for crossings of `threshold`.
    fn set_root(&mut self, _state_index: usize, _threshold: FloatValue) -> Result<(), SolverError> {
        Err(SolverError::IllegalInput(
            "this solver does not support root finding".to_string(),
        ))
    }

    fn initialise(
        &mut self,
        rhs: &mut dyn OdeRhs,
        t0: Time,
        y0: &[FloatValue],
    ) -> Result<(), SolverError>;

    /// Take exactly one internal step. `t_target` is advisory (direction and
    /// step-size steering); the step may pass it.
    fn step_once(
        &mut self,
        rhs: &mut dyn OdeRhs,
        t_target: Time,
    ) -> Result<StepOutcome, SolverError>;

    fn time(&self) -> Time;

    fn state(&self) -> &[FloatValue];

    /// Evaluate the dense-output interpolant at a past time within the last
    /// internal step.
    fn interpolate(&self, t: Time, out: &mut [FloatValue]) -> Result<(), SolverError>;

    /// Restart the solver from a manually supplied state, discarding internal
    /// history.
    fn reinitialise(
        &mut self,
        rhs: &mut dyn OdeRhs,
        t: Time,
        y: &[FloatValue],
    ) -> Result<(), SolverError>;

    fn sens_init(
        &mut self,
        _rhs: &mut dyn OdeRhs,
        _s0: &Array2<FloatValue>,
    ) -> Result<(), SolverError> {
        Err(SolverError::IllegalInput(
            "this solver does not support sensitivities".to_string(),
        ))
    }

    /// Current state-sensitivity matrix (states x independents).
    fn sens(&self) -> Option<&Array2<FloatValue>> {
        None
    }

    fn sens_interpolate(
        &self,
        _t: Time,
        _out: &mut Array2<FloatValue>,
    ) -> Result<(), SolverError> {
        Err(SolverError::SensitivitiesNotInitialised)
    }

    fn sens_reinitialise(&mut self, _s: &Array2<FloatValue>) -> Result<(), SolverError> {
        Err(SolverError::SensitivitiesNotInitialised)
    }
}

// Dormand-Prince 5(4) tableau. The last row of A doubles as the 5th-order
// weights (FSAL).
const C: [f64; 7] = [0.0, 0.2, 0.3, 0.8, 8.0 / 9.0, 1.0, 1.0];
const A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.2, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_SHRINK: f64 = 0.1;
const MAX_GROWTH: f64 = 5.0;
const MAX_ATTEMPTS: usize = 12;

#[derive(Debug)]
struct SensState {
    s: Array2<FloatValue>,
    s_prev: Array2<FloatValue>,
    fs: Array2<FloatValue>,
    fs_prev: Array2<FloatValue>,
    /// False after a reinitialisation until the FSAL sensitivity derivative
    /// has been recomputed.
    fresh: bool,
}

/// Adaptive embedded Dormand-Prince 5(4) stepper with PI step-size control,
/// cubic Hermite dense output over the last step, sign-change root location
/// and finite-difference forward sensitivities.
#[derive(Debug)]
pub struct DormandPrince54 {
    rtol: f64,
    atol: f64,
    h_min: f64,
    h_max: f64,
    h: f64,
    root: Option<(usize, FloatValue)>,
    t: Time,
    t_prev: Time,
    y: Vec<FloatValue>,
    y_prev: Vec<FloatValue>,
    f: Vec<FloatValue>,
    f_prev: Vec<FloatValue>,
    sens: Option<SensState>,
    initialised: bool,
    steps: u64,
}

impl Default for DormandPrince54 {
    fn default() -> Self {
        Self::new()
    }
}

fn inf_norm(values: &[FloatValue]) -> f64 {
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

fn hermite(theta: f64, span: f64, y0: f64, f0: f64, y1: f64, f1: f64) -> f64 {
    let t2 = theta * theta;
    let t3 = t2 * theta;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + theta;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * y0 + h10 * span * f0 + h01 * y1 + h11 * span * f1
}

/// Centred-difference sensitivity right-hand side, one directional
/// derivative per independent: `ds_j/dt = [f(y + e s_j, p + e e_j) -
/// f(y - e s_j, p - e e_j)] / 2e`.
fn sensitivity_rhs(
    rhs: &mut dyn OdeRhs,
    t: Time,
    y: &[FloatValue],
    s: &Array2<FloatValue>,
    out: &mut Array2<FloatValue>,
) -> Result<(), SolverError> {
    let n = y.len();
    let m = s.ncols();
    let mut above = vec![0.0; n];
    let mut below = vec![0.0; n];
    let mut shifted = vec![0.0; n];
    for j in 0..m {
        let origin = rhs.independent_value(j);
        let eps = f64::EPSILON.sqrt() * (1.0 + origin.abs());
        for i in 0..n {
            shifted[i] = y[i] + eps * s[(i, j)];
        }
        rhs.nudge_independent(j, eps);
        let up = rhs.eval(t, &shifted, &mut above);
        for i in 0..n {
            shifted[i] = y[i] - eps * s[(i, j)];
        }
        rhs.nudge_independent(j, -2.0 * eps);
        let down = rhs.eval(t, &shifted, &mut below);
        // Restore the live slot exactly; incremental undo would drift.
        let residue = origin - rhs.independent_value(j);
        rhs.nudge_independent(j, residue);
        up?;
        down?;
        for i in 0..n {
            out[(i, j)] = (above[i] - below[i]) / (2.0 * eps);
        }
    }
    Ok(())
}

impl DormandPrince54 {
    pub fn new() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-8,
            h_min: 0.0,
            h_max: f64::INFINITY,
            h: 0.0,
            root: None,
            t: 0.0,
            t_prev: 0.0,
            y: Vec::new(),
            y_prev: Vec::new(),
            f: Vec::new(),
            f_prev: Vec::new(),
            sens: None,
            initialised: false,
            steps: 0,
        }
    }

    /// Internal steps accepted since initialisation.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn h_floor(&self) -> f64 {
        self.h_min.max(16.0 * f64::EPSILON * (1.0 + self.t.abs()))
    }

    fn hermite_component(&self, t: Time, index: usize) -> FloatValue {
        let span = self.t - self.t_prev;
        if span == 0.0 {
            return self.y[index];
        }
        let theta = (t - self.t_prev) / span;
        hermite(
            theta,
            span,
            self.y_prev[index],
            self.f_prev[index],
            self.y[index],
            self.f[index],
        )
    }

    fn detect_root(&self) -> Option<RootEvent> {
        let (index, threshold) = self.root?;
        let g0 = self.y_prev[index] - threshold;
        let g1 = self.y[index] - threshold;
        let crossed = (g0 < 0.0 && g1 >= 0.0) || (g0 > 0.0 && g1 <= 0.0);
        if g0 == 0.0 || !crossed {
            return None;
        }
        let mut lo = self.t_prev;
        let mut hi = self.t;
        let mut g_lo = g0;
        for _ in 0..64 {
            let mid = 0.5 * (lo + hi);
            let g_mid = self.hermite_component(mid, index) - threshold;
            if g_mid == 0.0 {
                lo = mid;
                hi = mid;
                break;
            }
            if (g_mid < 0.0) == (g_lo < 0.0) {
                lo = mid;
                g_lo = g_mid;
            } else {
                hi = mid;
            }
            if (hi - lo) <= f64::EPSILON * (1.0 + hi.abs()) {
                break;
            }
        }
        let direction = if g1 > g0 {
            CrossingDirection::Rising
        } else {
            CrossingDirection::Falling
        };
        Some(RootEvent {
            time: 0.5 * (lo + hi),
            direction,
        })
    }
}

impl Integrator for DormandPrince54 {
    fn set_tolerances(&mut self, rel: f64, abs: f64) -> Result<(), SolverError> {
        if !rel.is_finite() || rel <= 0.0 {
            return Err(SolverError::IllegalInput(
                "relative tolerance must be finite and positive".to_string(),
            ));
        }
        if !abs.is_finite() || abs <= 0.0 {
            return Err(SolverError::IllegalInput(
                "absolute tolerance must be finite and positive".to_string(),
            ));
        }
        self.rtol = rel;
        self.atol = abs;
        Ok(())
    }

    fn set_step_bounds(&mut self, min: f64, max: f64) -> Result<(), SolverError> {
        if min < 0.0 || !min.is_finite() {
            return Err(SolverError::IllegalInput(
                "minimum step size must be finite and non-negative".to_string(),
            ));
        }
        if max <= 0.0 || max < min {
            return Err(SolverError::IllegalInput(
                "maximum step size must be positive and at least the minimum".to_string(),
            ));
        }
        self.h_min = min;
        self.h_max = max;
        Ok(())
    }

    fn set_root(&mut self, state_index: usize, threshold: FloatValue) -> Result<(), SolverError> {
        self.root = Some((state_index, threshold));
        Ok(())
    }

    fn initialise(
        &mut self,
        rhs: &mut dyn OdeRhs,
        t0: Time,
        y0: &[FloatValue],
    ) -> Result<(), SolverError> {
        if y0.len() != rhs.dim() {
            return Err(SolverError::IllegalInput(format!(
                "state vector has {} entries, system dimension is {}",
                y0.len(),
                rhs.dim()
            )));
        }
        if let Some((index, _)) = self.root {
            if index >= y0.len() {
                return Err(SolverError::IllegalInput(format!(
                    "root state index {} is out of range",
                    index
                )));
            }
        }
        self.y = y0.to_vec();
        self.y_prev = y0.to_vec();
        self.f = vec![0.0; y0.len()];
        rhs.eval(t0, y0, &mut self.f)?;
        self.f_prev = self.f.clone();
        self.t = t0;
        self.t_prev = t0;
        let d0 = inf_norm(&self.y);
        let d1 = inf_norm(&self.f);
        let h0 = if d1 > 1e-12 {
            0.01 * (1.0 + d0) / d1
        } else {
            1e-3
        };
        self.h = h0.max(1e-10).min(self.h_max);
        self.steps = 0;
        self.sens = None;
        self.initialised = true;
        Ok(())
    }

    fn step_once(
        &mut self,
        rhs: &mut dyn OdeRhs,
        _t_target: Time,
    ) -> Result<StepOutcome, SolverError> {
        if !self.initialised {
            return Err(SolverError::NotInitialised);
        }
        let n = self.y.len();
        let m = self.sens.as_ref().map_or(0, |s| s.s.ncols());

        if m > 0 {
            let needs_refresh = !self.sens.as_ref().map_or(true, |s| s.fresh);
            if needs_refresh {
                let sens = self.sens.as_mut().expect("m > 0");
                sensitivity_rhs(rhs, self.t, &self.y, &sens.s, &mut sens.fs)?;
                sens.fresh = true;
            }
        }

        let mut k: Vec<Vec<FloatValue>> = vec![vec![0.0; n]; 7];
        k[0].copy_from_slice(&self.f);
        let mut ks: Vec<Array2<FloatValue>> = if m > 0 {
            vec![Array2::zeros((n, m)); 7]
        } else {
            Vec::new()
        };
        if m > 0 {
            ks[0].assign(&self.sens.as_ref().expect("m > 0").fs);
        }

        let mut h = self.h.max(self.h_floor()).min(self.h_max);
        let mut y_new = vec![0.0; n];
        let mut y_stage = vec![0.0; n];
        let mut attempts = 0;
        let err_norm = loop {
            attempts += 1;
            if attempts > MAX_ATTEMPTS {
                return Err(SolverError::ErrorTestFailures { t: self.t });
            }
            if h < self.h_floor() {
                return Err(SolverError::AccuracyTooDemanding { t: self.t });
            }

            for i in 1..7 {
                for q in 0..n {
                    let mut acc = 0.0;
                    for (j, k_j) in k.iter().take(i).enumerate() {
                        acc += A[i][j] * k_j[q];
                    }
                    y_stage[q] = self.y[q] + h * acc;
                }
                let ti = self.t + C[i] * h;
                {
                    let (_, rest) = k.split_at_mut(i);
                    rhs.eval(ti, &y_stage, &mut rest[0])?;
                }
                if m > 0 {
                    let sens = self.sens.as_ref().expect("m > 0");
                    let mut s_stage = sens.s.clone();
                    for (j, ks_j) in ks.iter().take(i).enumerate() {
                        s_stage.scaled_add(h * A[i][j], ks_j);
                    }
                    let (_, rest) = ks.split_at_mut(i);
                    sensitivity_rhs(rhs, ti, &y_stage, &s_stage, &mut rest[0])?;
                }
                if i == 6 {
                    y_new.copy_from_slice(&y_stage);
                }
            }

            let mut sum = 0.0;
            for q in 0..n {
                let mut e = 0.0;
                for (j, k_j) in k.iter().enumerate() {
                    e += E[j] * k_j[q];
                }
                e *= h;
                let tol = self.atol + self.rtol * self.y[q].abs().max(y_new[q].abs());
                let ratio = e / tol;
                sum += ratio * ratio;
            }
            let err = (sum / n as f64).sqrt();
            if !err.is_finite() {
                h *= 0.1;
                continue;
            }
            if err <= 1.0 {
                break err;
            }
            h *= (SAFETY * err.powf(-0.2)).clamp(MIN_SHRINK, 0.9);
        };

        self.t_prev = self.t;
        self.y_prev.copy_from_slice(&self.y);
        self.f_prev.copy_from_slice(&self.f);
        self.t += h;
        self.y.copy_from_slice(&y_new);
        self.f.copy_from_slice(&k[6]);
        if m > 0 {
            let sens = self.sens.as_mut().expect("m > 0");
            sens.s_prev.assign(&sens.s);
            sens.fs_prev.assign(&sens.fs);
            let mut s_new = sens.s.clone();
            for (j, ks_j) in ks.iter().take(6).enumerate() {
                s_new.scaled_add(h * A[6][j], ks_j);
            }
            sens.s.assign(&s_new);
            sens.fs.assign(&ks[6]);
        }
        self.steps += 1;

        let factor = if err_norm == 0.0 {
            MAX_GROWTH
        } else {
            (SAFETY * err_norm.powf(-0.2)).clamp(MIN_SHRINK, MAX_GROWTH)
        };
        self.h = (h * factor).max(self.h_floor()).min(self.h_max);

        Ok(StepOutcome {
            t: self.t,
            root: self.detect_root(),
        })
    }

    fn time(&self) -> Time {
        self.t
    }

    fn state(&self) -> &[FloatValue] {
        &self.y
    }

    fn interpolate(&self, t: Time, out: &mut [FloatValue]) -> Result<(), SolverError> {
        if !self.initialised {
            return Err(SolverError::NotInitialised);
        }
        if out.len() != self.y.len() {
            return Err(SolverError::IllegalInput(format!(
                "output buffer has {} entries, system dimension is {}",
                out.len(),
                self.y.len()
            )));
        }
        let (lo, hi) = (self.t_prev, self.t);
        let slack = 4.0 * f64::EPSILON * (1.0 + hi.abs());
        if t < lo - slack || t > hi + slack {
            return Err(SolverError::InterpolationOutOfRange { t, lo, hi });
        }
        let span = hi - lo;
        if span == 0.0 {
            out.copy_from_slice(&self.y);
            return Ok(());
        }
        let theta = ((t - lo) / span).clamp(0.0, 1.0);
        for (q, slot) in out.iter_mut().enumerate() {
            *slot = hermite(
                theta,
                span,
                self.y_prev[q],
                self.f_prev[q],
                self.y[q],
                self.f[q],
            );
        }
        Ok(())
    }

    fn reinitialise(
        &mut self,
        rhs: &mut dyn OdeRhs,
        t: Time,
        y: &[FloatValue],
    ) -> Result<(), SolverError> {
        if !self.initialised {
            return Err(SolverError::NotInitialised);
        }
        if y.len() != self.y.len() {
            return Err(SolverError::IllegalInput(format!(
                "state vector has {} entries, system dimension is {}",
                y.len(),
                self.y.len()
            )));
        }
        self.y.copy_from_slice(y);
        self.y_prev.copy_from_slice(y);
        rhs.eval(t, y, &mut self.f)?;
        self.f_prev.copy_from_slice(&self.f);
        self.t = t;
        self.t_prev = t;
        if let Some(sens) = self.sens.as_mut() {
            sens.fresh = false;
        }
        Ok(())
    }

    fn sens_init(
        &mut self,
        rhs: &mut dyn OdeRhs,
        s0: &Array2<FloatValue>,
    ) -> Result<(), SolverError> {
        if !self.initialised {
            return Err(SolverError::NotInitialised);
        }
        if s0.nrows() != self.y.len() {
            return Err(SolverError::IllegalInput(format!(
                "sensitivity matrix has {} rows, system dimension is {}",
                s0.nrows(),
                self.y.len()
            )));
        }
        let mut fs = Array2::zeros(s0.raw_dim());
        sensitivity_rhs(rhs, self.t, &self.y, s0, &mut fs)?;
        self.sens = Some(SensState {
            s: s0.clone(),
            s_prev: s0.clone(),
            fs_prev: fs.clone(),
            fs,
            fresh: true,
        });
        Ok(())
    }

    fn sens(&self) -> Option<&Array2<FloatValue>> {
        self.sens.as_ref().map(|s| &s.s)
    }

    fn sens_interpolate(
        &self,
        t: Time,
        out: &mut Array2<FloatValue>,
    ) -> Result<(), SolverError> {
        let sens = self
            .sens
            .as_ref()
            .ok_or(SolverError::SensitivitiesNotInitialised)?;
        if out.raw_dim() != sens.s.raw_dim() {
            return Err(SolverError::IllegalInput(
                "sensitivity output buffer has the wrong shape".to_string(),
            ));
        }
        let (lo, hi) = (self.t_prev, self.t);
        let slack = 4.0 * f64::EPSILON * (1.0 + hi.abs());
        if t < lo - slack || t > hi + slack {
            return Err(SolverError::InterpolationOutOfRange { t, lo, hi });
        }
        let span = hi - lo;
        if span == 0.0 || !sens.fresh {
            out.assign(&sens.s);
            return Ok(());
        }
        let theta = ((t - lo) / span).clamp(0.0, 1.0);
        for ((i, j), slot) in out.indexed_iter_mut() {
            *slot = hermite(
                theta,
                span,
                sens.s_prev[(i, j)],
                sens.fs_prev[(i, j)],
                sens.s[(i, j)],
                sens.fs[(i, j)],
            );
        }
        Ok(())
    }

    fn sens_reinitialise(&mut self, s: &Array2<FloatValue>) -> Result<(), SolverError> {
        let sens = self
            .sens
            .as_mut()
            .ok_or(SolverError::SensitivitiesNotInitialised)?;
        if s.raw_dim() != sens.s.raw_dim() {
            return Err(SolverError::IllegalInput(
                "sensitivity matrix has the wrong shape".to_string(),
            ));
        }
        sens.s.assign(s);
        sens.s_prev.assign(s);
        sens.fresh = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;

    struct Decay {
        k: f64,
    }

    impl OdeRhs for Decay {
        fn dim(&self) -> usize {
            1
        }

        fn eval(
            &mut self,
            _t: Time,
            y: &[FloatValue],
            dydt: &mut [FloatValue],
        ) -> Result<(), SolverError> {
            dydt[0] = -self.k * y[0];
            Ok(())
        }

        fn n_independents(&self) -> usize {
            1
        }

        fn nudge_independent(&mut self, _index: usize, delta: FloatValue) {
            self.k += delta;
        }

        fn independent_value(&self, _index: usize) -> FloatValue {
            self.k
        }
    }

    #[test]
    fn integrates_exponential_decay() {
        let mut rhs = Decay { k: 1.0 };
        let mut solver = DormandPrince54::new();
        solver.set_tolerances(1e-8, 1e-10).unwrap();
        solver.initialise(&mut rhs, 0.0, &[1.0]).unwrap();
        while solver.time() < 2.0 {
            solver.step_once(&mut rhs, 2.0).unwrap();
        }
        let mut out = [0.0];
        solver.interpolate(2.0, &mut out).unwrap();
        assert!(is_close!(out[0], (-2.0f64).exp(), abs_tol = 1e-7));
        assert!(solver.steps() > 1);
    }

    #[test]
    fn dense_output_matches_the_solution_inside_a_step() {
        let mut rhs = Decay { k: 1.0 };
        let mut solver = DormandPrince54::new();
        solver.initialise(&mut rhs, 0.0, &[1.0]).unwrap();
        let outcome = solver.step_once(&mut rhs, 10.0).unwrap();
        let mid = 0.5 * outcome.t;
        let mut out = [0.0];
        solver.interpolate(mid, &mut out).unwrap();
        assert!(is_close!(out[0], (-mid).exp(), abs_tol = 1e-6));
    }

    #[test]
    fn interpolation_outside_the_last_step_is_rejected() {
        let mut rhs = Decay { k: 1.0 };
        let mut solver = DormandPrince54::new();
        solver.initialise(&mut rhs, 0.0, &[1.0]).unwrap();
        let outcome = solver.step_once(&mut rhs, 10.0).unwrap();
        let mut out = [0.0];
        let err = solver.interpolate(outcome.t + 1.0, &mut out).unwrap_err();
        assert!(matches!(err, SolverError::InterpolationOutOfRange { .. }));
    }

    #[test]
    fn locates_a_falling_root() {
        let mut rhs = Decay { k: 1.0 };
        let mut solver = DormandPrince54::new();
        solver.set_root(0, 0.5).unwrap();
        solver.initialise(&mut rhs, 0.0, &[1.0]).unwrap();
        let mut events = Vec::new();
        while solver.time() < 2.0 {
            let outcome = solver.step_once(&mut rhs, 2.0).unwrap();
            if let Some(event) = outcome.root {
                events.push(event);
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, CrossingDirection::Falling);
        assert!(is_close!(events[0].time, 2.0f64.ln(), abs_tol = 1e-4));
    }

    #[test]
    fn forward_sensitivities_track_the_analytic_solution() {
        let mut rhs = Decay { k: 1.0 };
        let mut solver = DormandPrince54::new();
        solver.set_tolerances(1e-8, 1e-10).unwrap();
        solver.initialise(&mut rhs, 0.0, &[1.0]).unwrap();
        solver.sens_init(&mut rhs, &Array2::zeros((1, 1))).unwrap();
        while solver.time() < 1.0 {
            solver.step_once(&mut rhs, 1.0).unwrap();
        }
        let mut out = Array2::zeros((1, 1));
        solver.sens_interpolate(1.0, &mut out).unwrap();
        // dy/dk at t = 1 for y = exp(-k t) is -t exp(-k t).
        assert!(is_close!(out[(0, 0)], -(-1.0f64).exp(), abs_tol = 1e-4));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut solver = DormandPrince54::new();
        assert!(matches!(
            solver.set_tolerances(-1.0, 1e-8),
            Err(SolverError::IllegalInput(_))
        ));
        assert!(matches!(
            solver.set_step_bounds(1.0, 0.5),
            Err(SolverError::IllegalInput(_))
        ));
        let mut rhs = Decay { k: 1.0 };
        assert!(matches!(
            solver.step_once(&mut rhs, 1.0),
            Err(SolverError::NotInitialised)
        ));
        assert!(matches!(
            solver.initialise(&mut rhs, 0.0, &[1.0, 2.0]),
            Err(SolverError::IllegalInput(_))
        ));
    }

    #[test]
    fn reinitialisation_restarts_from_the_supplied_state() {
        let mut rhs = Decay { k: 1.0 };
        let mut solver = DormandPrince54::new();
        solver.initialise(&mut rhs, 0.0, &[1.0]).unwrap();
        solver.step_once(&mut rhs, 10.0).unwrap();
        solver.reinitialise(&mut rhs, 5.0, &[2.0]).unwrap();
        assert_eq!(solver.time(), 5.0);
        assert_eq!(solver.state(), &[2.0]);
        let mut out = [0.0];
        solver.interpolate(5.0, &mut out).unwrap();
        assert_eq!(out[0], 2.0);
    }
}
