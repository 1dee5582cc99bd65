//! # Table Module
//!
//! The thin relational layer on top of the key-value store: typed, named
//! records addressed by composite primary keys. Rows are encoded with the
//! length-framed value codec in [`value`], prefixed per table so that
//! each table occupies one contiguous key range, and the schema catalog
//! itself lives in two reserved tables.

mod db;
mod record;
mod schema;
mod value;

pub use db::DB;
pub use record::Record;
pub use schema::{check_record, TableDef};
pub use value::{
    decode_values, encode_key, encode_values, Value, ValueType, TABLE_PREFIX_META,
    TABLE_PREFIX_MIN, TABLE_PREFIX_TABLE,
};
