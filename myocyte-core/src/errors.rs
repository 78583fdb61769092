use crate::ivp::SolverError;
use crate::logging::SinkError;
use thiserror::Error;

/// Error type for invalid operations across the model engine and the
/// simulation orchestrator.
#[derive(Error, Debug)]
pub enum MyocyteError {
    #[error("{0}")]
    Error(String),
    /// Malformed run or model configuration, detected before any resources
    /// are allocated.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("expected {expected} values for {what}, got {actual}")]
    WrongLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("variable '{0}' is a constant and cannot be logged")]
    NotLoggable(String),
    #[error("logging is already active; call end_logging first")]
    LoggingAlreadyActive,
    #[error("logging has not been started")]
    LoggingNotActive,
    #[error("sensitivities are not enabled for this engine")]
    SensitivitiesNotEnabled,
    #[error("cyclic dependency involving variable '{0}'")]
    CyclicDependency(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error("simulation is already initialised; call clean before init")]
    AlreadyInitialised,
    #[error("simulation is not initialised")]
    NotInitialised,
    #[error("simulation run is over; call clean before starting a new run")]
    AlreadyFinished,
    #[error("integrator made no progress over {limit} consecutive steps at t = {time}")]
    ZeroProgress { time: f64, limit: usize },
    #[error("log interval {interval} is below floating point resolution at t = {time}")]
    LogIntervalTooSmall { interval: f64, time: f64 },
    #[error("logging {points:.0} points exceeds the supported maximum")]
    LogPointOverflow { points: f64 },
    #[error("pacing events overlap at t = {time}")]
    PacingConflict { time: f64 },
}

/// Convenience type for `Result<T, MyocyteError>`.
pub type MyocyteResult<T> = Result<T, MyocyteError>;
