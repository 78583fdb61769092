//! Concrete excitable-cell models built on `myocyte-core`.

pub mod models;
