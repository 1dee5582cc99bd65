//! # Relational Layer
//!
//! `DB` exposes typed, named records over the key-value store. Every row
//! of a table lives under a 4-byte big-endian table prefix in the
//! B+tree's key space, so a table's rows form one contiguous range.
//!
//! The schema catalog is bootstrapped from two reserved tables with fixed
//! prefixes: `@meta` (prefix 1) holds the next-available table prefix and
//! `@table` (prefix 2) maps table names to serialized definitions. User
//! tables are assigned prefixes starting at 3.

use std::collections::HashMap;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use super::record::Record;
use super::schema::{check_record, tdef_meta, tdef_table, TableDef};
use super::value::{decode_values, encode_key, encode_values, Value, TABLE_PREFIX_MIN};
use crate::storage::KV;

/// Write disposition for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Fail if the primary key already exists.
    Insert,
    /// Fail if the primary key does not exist.
    Update,
    /// Accept either.
    Upsert,
}

/// A database of typed tables over a single-file key-value store.
#[derive(Debug)]
pub struct DB {
    kv: KV,
    /// Deserialized definitions memoized by table name.
    tables: HashMap<String, TableDef>,
}

impl DB {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            kv: KV::open(path)?,
            tables: HashMap::new(),
        })
    }

    pub fn close(self) -> Result<()> {
        self.kv.close()
    }

    /// Creates a table: allocates the next prefix from `@meta` and stores
    /// the definition in `@table`. Returns the assigned prefix.
    pub fn table_new(&mut self, tdef: &TableDef) -> Result<u32> {
        tdef.validate()?;
        ensure!(
            !tdef.name.starts_with('@'),
            "table name '{}' is reserved",
            tdef.name
        );

        let mut probe = Record::new().add_bytes("name", tdef.name.as_str());
        let exists = self.db_get(&tdef_table(), &mut probe)?;
        ensure!(!exists, "table already exists: {}", tdef.name);

        // Read and advance the prefix counter.
        let mut meta = Record::new().add_bytes("key", "next_prefix");
        let prefix = if self.db_get(&tdef_meta(), &mut meta)? {
            let stored = meta
                .get("val")
                .and_then(Value::as_bytes)
                .ok_or_else(|| eyre::eyre!("malformed next_prefix entry"))?;
            ensure!(stored.len() == 4, "malformed next_prefix entry");
            let prefix = u32::from_le_bytes(stored.try_into().unwrap());
            ensure!(prefix >= TABLE_PREFIX_MIN, "corrupt prefix counter {}", prefix);
            prefix
        } else {
            TABLE_PREFIX_MIN
        };
        let counter = Record::new()
            .add_bytes("key", "next_prefix")
            .add_bytes("val", (prefix + 1).to_le_bytes());
        self.db_set(&tdef_meta(), counter, WriteMode::Upsert)?;

        // Store the definition under the table's name.
        let mut stored = tdef.clone();
        stored.prefix = prefix;
        let def = serde_json::to_vec(&stored).wrap_err("failed to serialize table definition")?;
        let row = Record::new()
            .add_bytes("name", stored.name.as_str())
            .add_bytes("def", def);
        self.db_set(&tdef_table(), row, WriteMode::Insert)?;

        debug!(table = %stored.name, prefix, "created table");
        self.tables.insert(stored.name.clone(), stored);
        Ok(prefix)
    }

    /// Fetches a row by primary key, filling the record's remaining
    /// columns on a hit.
    pub fn get(&mut self, table: &str, rec: &mut Record) -> Result<bool> {
        let tdef = self.table_def(table)?;
        self.db_get(&tdef, rec)
    }

    /// Inserts a new row; a duplicate primary key is an error.
    pub fn insert(&mut self, table: &str, rec: Record) -> Result<()> {
        let tdef = self.table_def(table)?;
        self.db_set(&tdef, rec, WriteMode::Insert)
    }

    /// Updates an existing row; a missing row is an error.
    pub fn update(&mut self, table: &str, rec: Record) -> Result<()> {
        let tdef = self.table_def(table)?;
        self.db_set(&tdef, rec, WriteMode::Update)
    }

    /// Inserts or updates a row.
    pub fn upsert(&mut self, table: &str, rec: Record) -> Result<()> {
        let tdef = self.table_def(table)?;
        self.db_set(&tdef, rec, WriteMode::Upsert)
    }

    /// Removes a row by primary key, reporting whether it existed.
    pub fn delete(&mut self, table: &str, rec: &Record) -> Result<bool> {
        let tdef = self.table_def(table)?;
        let pk = check_record(&tdef, rec, tdef.pkeys)?;
        self.kv.del(&encode_key(tdef.prefix, &pk))
    }

    /// Resolves a table definition, reading through the per-name cache.
    fn table_def(&mut self, name: &str) -> Result<TableDef> {
        match name {
            "@meta" => return Ok(tdef_meta()),
            "@table" => return Ok(tdef_table()),
            _ => {}
        }
        if let Some(tdef) = self.tables.get(name) {
            return Ok(tdef.clone());
        }

        let mut rec = Record::new().add_bytes("name", name);
        let found = self.db_get(&tdef_table(), &mut rec)?;
        ensure!(found, "table not found: {}", name);

        let def = rec
            .get("def")
            .and_then(Value::as_bytes)
            .ok_or_else(|| eyre::eyre!("malformed definition row for table '{}'", name))?;
        let tdef: TableDef = serde_json::from_slice(def)
            .wrap_err_with(|| format!("failed to parse definition of table '{}'", name))?;

        self.tables.insert(name.to_string(), tdef.clone());
        Ok(tdef)
    }

    fn db_get(&mut self, tdef: &TableDef, rec: &mut Record) -> Result<bool> {
        let pk = check_record(tdef, rec, tdef.pkeys)?;
        let key = encode_key(tdef.prefix, &pk);

        let Some(stored) = self.kv.get(&key)? else {
            return Ok(false);
        };

        let rest = decode_values(&stored, tdef.cols.len() - tdef.pkeys)?;
        for (col, val) in tdef.cols[tdef.pkeys..].iter().zip(rest) {
            rec.push(col.clone(), val);
        }
        Ok(true)
    }

    fn db_set(&mut self, tdef: &TableDef, rec: Record, mode: WriteMode) -> Result<()> {
        let vals = check_record(tdef, &rec, tdef.cols.len())?;
        let key = encode_key(tdef.prefix, &vals[..tdef.pkeys]);

        match mode {
            WriteMode::Insert => ensure!(
                self.kv.get(&key)?.is_none(),
                "duplicate primary key in table '{}'",
                tdef.name
            ),
            WriteMode::Update => ensure!(
                self.kv.get(&key)?.is_some(),
                "row not found in table '{}'",
                tdef.name
            ),
            WriteMode::Upsert => {}
        }

        let mut val = Vec::new();
        encode_values(&mut val, &vals[tdef.pkeys..]);
        self.kv.set(&key, &val)
    }
}
