//! # B+Tree Module
//!
//! The copy-on-write B+tree backing every burrowdb key space. The tree
//! speaks to storage exclusively through the
//! [`PageStore`](crate::storage::PageStore) capability: resolve a page
//! number, register a new page, schedule a page for deallocation. This
//! keeps the tree free of any
//! backpointer to the pager that owns it and lets unit tests run the same
//! algorithms over an in-memory page map.
//!
//! ## Node Layout
//!
//! Leaf and internal nodes share one fixed encoding, documented in
//! [`node`]:
//!
//! ```text
//! | kind 2B | nkeys 2B | ptrs nkeys*8B | offsets nkeys*2B | cells |
//! ```
//!
//! Cells are `klen | vlen | key | val`; internal nodes carry empty values
//! and use the ptr array for child page numbers. The key at position i of
//! an internal node is the smallest key reachable under child i.
//!
//! ## Mutation Discipline
//!
//! Every insert or delete builds replacement nodes top-down and never
//! writes into an existing page. Oversized build results are split into
//! up to three page-sized pieces; shrunken nodes merge with a sibling.
//! The root grows a level when it splits and loses a level when it
//! degenerates to a single child.
//!
//! ## Module Organization
//!
//! - [`node`]: binary node format, cell packing, in-node binary search
//! - [`tree`]: search, copy-on-write insert/delete, split and merge
//! - [`cursor`]: ordered traversal with seek comparators

pub mod cursor;
pub mod node;
pub mod tree;

pub use cursor::{Cursor, SeekCmp};
pub use node::{Node, NodeBuf, NodeKind, BTREE_MAX_KEY_SIZE, BTREE_MAX_VAL_SIZE, HEADER};
pub use tree::BTree;
