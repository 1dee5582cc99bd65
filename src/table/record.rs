//! Record builder: an ordered list of named column values, assembled by
//! chaining and consumed by the table operations in declared-column
//! order.

use super::value::Value;

/// A row as seen by callers: column names paired positionally with
/// values, in whatever order the caller supplied them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    cols: Vec<String>,
    vals: Vec<Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(self, col: &str, val: impl AsRef<[u8]>) -> Self {
        self.add(col, Value::Bytes(val.as_ref().to_vec()))
    }

    pub fn add_int64(self, col: &str, val: i64) -> Self {
        self.add(col, Value::Int64(val))
    }

    pub fn add(mut self, col: &str, val: Value) -> Self {
        self.push(col.to_string(), val);
        self
    }

    /// Appends a column in place; the chained `add_*` builders are
    /// preferred at call sites.
    pub fn push(&mut self, col: String, val: Value) {
        self.cols.push(col);
        self.vals.push(val);
    }

    /// Looks up a value by column name.
    pub fn get(&self, col: &str) -> Option<&Value> {
        self.cols
            .iter()
            .position(|c| c == col)
            .map(|idx| &self.vals[idx])
    }

    pub fn cols(&self) -> &[String] {
        &self.cols
    }

    pub fn vals(&self) -> &[Value] {
        &self.vals
    }
}
