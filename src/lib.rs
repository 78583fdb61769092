//! Simulation of cellular electrophysiology by numerical integration of
//! ion-channel kinetics, with optional forward sensitivities.
//!
//! This crate re-exports the core machinery from [`myocyte_core`] and the
//! bundled cell models from [`myocyte_models`]. A minimal run looks like:
//!
//! ```rust
//! use std::sync::Arc;
//! use myocyte::logging::MemorySink;
//! use myocyte::pacing::PacingConfig;
//! use myocyte::simulation::{RunConfig, Simulation};
//! use myocyte::models::hodgkin_huxley;
//!
//! let model = Arc::new(hodgkin_huxley::model());
//! let mut sim: Simulation<MemorySink> = Simulation::new(model);
//!
//! let mut config = RunConfig::new(0.0, 50.0);
//! config.pacing = PacingConfig::Protocol(hodgkin_huxley::stimulus_protocol(2.0, 0.0));
//! config.log.interval = 0.1;
//! config.log.variables = vec!["engine.time".into(), "membrane.V".into()];
//!
//! sim.init(config, MemorySink::new()).unwrap();
//! let output = sim.run_to_completion().unwrap();
//! assert!(!output.sink.get("membrane.V").unwrap().is_empty());
//! ```

pub use myocyte_core::{engine, errors, ivp, logging, model, pacing, simulation, variable};
pub use myocyte_models::models;
