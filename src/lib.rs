//! # burrowdb - Embeddable Durable Key-Value Store
//!
//! burrowdb is a single-file storage engine: a copy-on-write B+tree over
//! a memory-mapped paged file, a persistent free list for space
//! reclamation, and a thin relational layer exposing typed records
//! addressed by composite primary keys.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::KV;
//!
//! let mut db = KV::open("./my.db")?;
//! db.set(b"key", b"value")?;
//! assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
//! db.del(b"key")?;
//! db.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------+
//! |        Table Layer (DB)             |  typed records, schema catalog
//! +-------------------------------------+
//! |      Key-Value Store (KV)           |  two-phase durable commit
//! +------------------+------------------+
//! |  COW B+Tree      |  Free List       |  page-level structures
//! +------------------+------------------+
//! |   Pager (mmap read, pwrite commit)  |  single paged file
//! +-------------------------------------+
//! ```
//!
//! Every mutation is one transaction: the tree builds replacement pages
//! copy-on-write, the pager stages them in memory, and commit makes them
//! durable with write + fsync before flipping the master page with a
//! second fsync. A crash at any point leaves the file consistent at the
//! last committed master.
//!
//! ## Module Overview
//!
//! - [`storage`]: chunked mmap, master page, free list, pager and `KV`
//! - [`btree`]: node format, copy-on-write tree, ordered cursor
//! - [`table`]: value codec, records, schema catalog and `DB`
//!
//! ## Concurrency Model
//!
//! Single-threaded cooperative: all operations run on the caller's
//! thread and mutations take `&mut self`. Durability is only guaranteed
//! after a successful commit; handles must not be shared across threads.

pub mod btree;
pub mod storage;
pub mod table;

pub use storage::KV;
pub use table::{Record, TableDef, Value, ValueType, DB};
