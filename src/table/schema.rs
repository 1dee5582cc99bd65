//! Table definitions and record validation.

use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};

use super::record::Record;
use super::value::{Value, ValueType, TABLE_PREFIX_META, TABLE_PREFIX_TABLE};

/// A table schema: column names and types, how many leading columns form
/// the primary key, and the key-space prefix assigned at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub types: Vec<ValueType>,
    pub cols: Vec<String>,
    pub pkeys: usize,
    /// Assigned by `DB::table_new`; 0 until then.
    pub prefix: u32,
}

impl TableDef {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "table name must not be empty");
        ensure!(!self.cols.is_empty(), "table '{}' has no columns", self.name);
        ensure!(
            self.cols.len() == self.types.len(),
            "table '{}' declares {} columns but {} types",
            self.name,
            self.cols.len(),
            self.types.len()
        );
        ensure!(
            self.pkeys >= 1 && self.pkeys <= self.cols.len(),
            "table '{}' primary key must cover 1..={} leading columns",
            self.name,
            self.cols.len()
        );
        Ok(())
    }
}

/// Internal table `@meta`: key/value strings, holding the next-available
/// table prefix.
pub(crate) fn tdef_meta() -> TableDef {
    TableDef {
        name: "@meta".to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["key".to_string(), "val".to_string()],
        pkeys: 1,
        prefix: TABLE_PREFIX_META,
    }
}

/// Internal table `@table`: table name to serialized definition.
pub(crate) fn tdef_table() -> TableDef {
    TableDef {
        name: "@table".to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["name".to_string(), "def".to_string()],
        pkeys: 1,
        prefix: TABLE_PREFIX_TABLE,
    }
}

/// Reorders a caller-supplied record into the first `n` declared columns
/// and verifies their types. `n` is the primary-key count for lookups and
/// deletes, or the full column count for writes. Fails before anything
/// touches the tree.
pub fn check_record(tdef: &TableDef, rec: &Record, n: usize) -> Result<Vec<Value>> {
    ensure!(
        n == tdef.pkeys || n == tdef.cols.len(),
        "record must supply either the primary key or all columns of '{}'",
        tdef.name
    );

    let mut values = Vec::with_capacity(n);
    for (col, &expected) in tdef.cols.iter().zip(&tdef.types).take(n) {
        let val = rec
            .get(col)
            .ok_or_else(|| eyre::eyre!("missing column '{}' of table '{}'", col, tdef.name))?;
        ensure!(
            val.value_type() == expected,
            "column '{}' of table '{}' expects {:?}, got {:?}",
            col,
            tdef.name,
            expected,
            val.value_type()
        );
        values.push(val.clone());
    }
    Ok(values)
}
