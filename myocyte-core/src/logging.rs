//! Log sinks.
//!
//! A log sink is an ordered, append-only set of columns keyed by
//! fully-qualified variable name, plus a separate sequence of sensitivity
//! matrix snapshots. The engine registers columns once per run and then only
//! appends; append failures abort the run rather than skip the point.

use crate::variable::FloatValue;
use ndarray::Array2;
use std::collections::HashMap;
use thiserror::Error;

/// Failure in a log sink operation, propagated to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("log sink rejected column '{0}'")]
    Declare(String),
    #[error("unknown log column {0:?}")]
    UnknownColumn(ColumnId),
    #[error("log sink append failed: {0}")]
    Append(String),
}

/// Opaque handle to one sink column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnId(pub usize);

/// Consumer of logged values.
pub trait LogSink {
    /// Register a column, or return the existing handle when the name is
    /// already present. Reusing names is what lets a paused run resume into
    /// the same target.
    fn declare(&mut self, name: &str) -> Result<ColumnId, SinkError>;

    /// Append one value to a column.
    fn append(&mut self, column: ColumnId, value: FloatValue) -> Result<(), SinkError>;

    /// Append one dependents x independents sensitivity matrix as a single
    /// unit.
    fn append_sensitivities(&mut self, matrix: &Array2<FloatValue>) -> Result<(), SinkError>;

    /// Number of complete points appended so far.
    fn rows(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.rows() == 0
    }
}

/// In-memory sink used by tests and simple hosts.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    names: Vec<String>,
    columns: Vec<Vec<FloatValue>>,
    index: HashMap<String, usize>,
    sensitivities: Vec<Array2<FloatValue>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values logged for a column, by name.
    pub fn get(&self, name: &str) -> Option<&[FloatValue]> {
        self.index.get(name).map(|&i| self.columns[i].as_slice())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn sensitivities(&self) -> &[Array2<FloatValue>] {
        &self.sensitivities
    }
}

impl LogSink for MemorySink {
    fn declare(&mut self, name: &str) -> Result<ColumnId, SinkError> {
        if let Some(&existing) = self.index.get(name) {
            return Ok(ColumnId(existing));
        }
        let id = self.columns.len();
        self.names.push(name.to_string());
        self.columns.push(Vec::new());
        self.index.insert(name.to_string(), id);
        Ok(ColumnId(id))
    }

    fn append(&mut self, column: ColumnId, value: FloatValue) -> Result<(), SinkError> {
        let slot = self
            .columns
            .get_mut(column.0)
            .ok_or(SinkError::UnknownColumn(column))?;
        slot.push(value);
        Ok(())
    }

    fn append_sensitivities(&mut self, matrix: &Array2<FloatValue>) -> Result<(), SinkError> {
        self.sensitivities.push(matrix.clone());
        Ok(())
    }

    fn rows(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn declare_append_and_read_back() {
        let mut sink = MemorySink::new();
        let v = sink.declare("membrane.V").unwrap();
        let t = sink.declare("engine.time").unwrap();
        sink.append(v, -84.0).unwrap();
        sink.append(t, 0.0).unwrap();
        sink.append(v, -83.5).unwrap();
        sink.append(t, 0.1).unwrap();

        assert_eq!(sink.rows(), 2);
        assert_eq!(sink.get("membrane.V").unwrap(), &[-84.0, -83.5]);
        assert_eq!(sink.get("engine.time").unwrap(), &[0.0, 0.1]);
        assert_eq!(sink.names(), &["membrane.V", "engine.time"]);
    }

    #[test]
    fn redeclaring_returns_the_same_column() {
        let mut sink = MemorySink::new();
        let first = sink.declare("membrane.V").unwrap();
        let second = sink.declare("membrane.V").unwrap();
        assert_eq!(first, second);
        assert_eq!(sink.names().len(), 1);
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let mut sink = MemorySink::new();
        let err = sink.append(ColumnId(7), 1.0).unwrap_err();
        assert!(matches!(err, SinkError::UnknownColumn(_)));
    }

    #[test]
    fn sensitivity_snapshots_accumulate() {
        let mut sink = MemorySink::new();
        sink.append_sensitivities(&array![[1.0, 2.0]]).unwrap();
        sink.append_sensitivities(&array![[3.0, 4.0]]).unwrap();
        assert_eq!(sink.sensitivities().len(), 2);
        assert_eq!(sink.sensitivities()[1][(0, 1)], 4.0);
        assert!(sink.is_empty());
    }
}
