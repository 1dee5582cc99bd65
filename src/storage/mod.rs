//! # Storage Module
//!
//! This module provides the paged storage layer for burrowdb: a single file
//! addressed as an array of fixed-size pages, read through a memory mapping
//! and written through an explicit two-phase commit.
//!
//! ## Architecture Overview
//!
//! The storage layer is built around three cooperating pieces:
//!
//! - `ChunkedMmap`: a read-only view of the database file as a sequence of
//!   memory-mapped chunks. Chunks are only ever appended, never moved or
//!   remapped, so page slices handed out earlier stay valid while the file
//!   grows.
//! - `FreeList`: a persistent pool of reusable page numbers, itself stored
//!   as a linked list of pages and updated copy-on-write.
//! - `KV`: the pager and public key-value API. Writes are staged in an
//!   in-memory page table and only reach the file during commit.
//!
//! ## Write Path
//!
//! The mmap is strictly a read path. A transaction accumulates new page
//! images in the pager's update table; `page_get` resolves a page number
//! against that table first so that a page written moments ago is visible
//! to later steps of the same tree operation. At commit the staged pages
//! are written with `pwrite`, fsynced, and only then does the master page
//! flip to the new tree root.
//!
//! ## File Layout
//!
//! ```text
//! Offset 0:       Page 0 (master: magic, root, page count, free list)
//! Offset 4096:    Page 1 (B+tree node or free-list node)
//! Offset 8192:    Page 2
//! ...
//! ```
//!
//! The file length is always a multiple of the page size.
//!
//! ## Thread Safety
//!
//! The storage layer is single-threaded by construction: every mutating
//! operation takes `&mut self` and handles are not shared across threads.
//! Blocking happens only on file-system calls (mmap, truncate, fsync).

mod freelist;
mod kv;
mod master;
mod mmap;

pub use freelist::{FreeList, FreeListStore, FREE_LIST_CAP, FREE_LIST_HEADER};
pub use kv::KV;
pub use master::{MasterPage, DB_SIG, MASTER_SIZE};
pub use mmap::ChunkedMmap;

use eyre::Result;

/// Fixed on-disk page size in bytes. The only unit of allocation.
pub const PAGE_SIZE: usize = 4096;

/// Page access capability handed to the B+tree.
///
/// The tree never talks to the pager directly; it receives this trait so
/// that the copy-on-write algorithms can be unit-tested against an
/// in-memory map of pages.
pub trait PageStore {
    /// Resolve a page number to its current bytes. Pages staged by the
    /// in-flight transaction shadow the committed state.
    fn page_get(&self, ptr: u64) -> Result<&[u8]>;

    /// Register a new page image and allocate a page number for it,
    /// preferring the free list over growing the file.
    fn page_new(&mut self, page: &[u8]) -> Result<u64>;

    /// Schedule a page for deallocation at the next commit.
    fn page_del(&mut self, ptr: u64);
}
