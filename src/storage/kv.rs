//! # Pager and Key-Value Store
//!
//! `KV` is the durable key-value store: a B+tree over a single paged
//! file, opened with [`KV::open`] and mutated through [`KV::set`] and
//! [`KV::del`]. Each mutation is one transaction ending in a two-phase
//! durable commit.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! 1. The tree runs copy-on-write, registering new pages with the pager
//!    (staged in an in-memory update table) and scheduling replaced
//!    pages for deallocation.
//! 2. Commit folds the deallocations into the free list (which itself
//!    stages page writes), grows the file and mapping if needed, writes
//!    every staged page with pwrite, and fsyncs.
//! 3. The master page is rewritten to point at the new root and free
//!    list, then fsynced again.
//! ```
//!
//! A crash before the second fsync leaves the previous master intact and
//! the file consistent at the previous commit; the newly written pages
//! are unreachable garbage that the next commit may overwrite. A
//! mid-transaction error clears the staged state and rolls the in-memory
//! root and free list back to the last commit.
//!
//! ## Page Allocation
//!
//! `page_new` prefers the free list, reading entries with a running pop
//! count; only when the list is exhausted does it append past the end of
//! the file. Deallocated page numbers accumulate and are pushed onto the
//! free list at commit, becoming reusable after the master flips.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, trace};

use super::freelist::{FreeList, FreeListStore};
use super::master::{MasterPage, MASTER_SIZE};
use super::mmap::ChunkedMmap;
use super::{PageStore, PAGE_SIZE};
use crate::btree::BTree;
use zerocopy::IntoBytes;

/// The pager: file, mapping, and per-transaction page state. Implements
/// the page capabilities consumed by the tree and the free list.
#[derive(Debug)]
pub(crate) struct Pager {
    file: File,
    mmap: ChunkedMmap,
    /// Pages persisted on disk as of the last commit.
    flushed: u64,
    /// Free-list entries consumed by the current transaction.
    nfree: u64,
    /// Pages appended past the end by the current transaction.
    nappend: u64,
    /// Staged page images keyed by page number; `None` marks a page
    /// scheduled for deallocation.
    updates: HashMap<u64, Option<Vec<u8>>>,
    free: FreeList,
}

impl Pager {
    fn stage(&mut self, ptr: u64, page: &[u8]) {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..page.len()].copy_from_slice(page);
        self.updates.insert(ptr, Some(buf));
    }
}

impl PageStore for Pager {
    fn page_get(&self, ptr: u64) -> Result<&[u8]> {
        if let Some(staged) = self.updates.get(&ptr) {
            return match staged {
                Some(page) => Ok(page.as_slice()),
                None => bail!("page {} was deallocated in this transaction", ptr),
            };
        }
        self.mmap.page(ptr)
    }

    fn page_new(&mut self, page: &[u8]) -> Result<u64> {
        ensure!(
            page.len() <= PAGE_SIZE,
            "page image of {} bytes exceeds page size",
            page.len()
        );

        let ptr;
        if self.nfree < self.free.total() {
            ptr = self.free.nth(self, self.nfree)?;
            self.nfree += 1;
        } else {
            ptr = self.flushed + self.nappend;
            self.nappend += 1;
        }

        self.stage(ptr, page);
        Ok(ptr)
    }

    fn page_del(&mut self, ptr: u64) {
        self.updates.insert(ptr, None);
    }
}

impl FreeListStore for Pager {
    fn page(&self, ptr: u64) -> Result<&[u8]> {
        self.page_get(ptr)
    }

    fn page_append(&mut self, page: &[u8]) -> Result<u64> {
        let ptr = self.flushed + self.nappend;
        self.nappend += 1;
        self.stage(ptr, page);
        Ok(ptr)
    }

    fn page_reuse(&mut self, ptr: u64, page: &[u8]) -> Result<()> {
        self.stage(ptr, page);
        Ok(())
    }
}

/// Rollback point captured before a mutation.
#[derive(Debug, Clone, Copy)]
struct TxnMeta {
    root: u64,
    free_head: u64,
    free_total: u64,
}

/// A durable key-value store over a single file.
#[derive(Debug)]
pub struct KV {
    path: PathBuf,
    pager: Pager,
    tree: BTree,
}

impl KV {
    /// Creates or opens the database file, maps it, and loads the master
    /// page. A signature mismatch or a truncated file is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let mmap = ChunkedMmap::init(&file)?;
        let file_len = mmap.file_len();
        ensure!(
            file_len % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_len,
            PAGE_SIZE
        );

        let mut pager = Pager {
            file,
            mmap,
            flushed: 0,
            nfree: 0,
            nappend: 0,
            updates: HashMap::new(),
            free: FreeList::default(),
        };

        let root = if file_len == 0 {
            // Brand-new file: reserve page 0 for the master.
            pager.flushed = 1;
            0
        } else {
            let master = MasterPage::from_bytes(pager.mmap.page(0)?)
                .wrap_err_with(|| format!("failed to load master page of '{}'", path.display()))?;
            master.validate(file_len / PAGE_SIZE as u64)?;
            pager.flushed = master.flushed();
            pager.free = FreeList::new(master.free_head(), master.free_total());
            master.root()
        };

        debug!(
            path = %path.display(),
            pages = pager.flushed,
            root,
            free = pager.free.total(),
            "opened database"
        );

        Ok(Self {
            path,
            pager,
            tree: BTree::new(root),
        })
    }

    /// Syncs and closes the database. The mapping is released on drop.
    pub fn close(self) -> Result<()> {
        self.pager
            .file
            .sync_all()
            .wrap_err("final sync on close failed")?;
        debug!(path = %self.path.display(), "closed database");
        Ok(())
    }

    /// Looks up a key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(&self.pager, key)
    }

    /// Inserts or updates a key and durably commits.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let meta = self.snapshot();
        let result = self
            .tree
            .insert(&mut self.pager, key, val)
            .and_then(|_| self.commit());
        if result.is_err() {
            self.rollback(meta);
        }
        result
    }

    /// Removes a key, reporting whether it existed. Removals commit
    /// durably; absent keys leave the file untouched.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        let meta = self.snapshot();
        let removed = match self.tree.delete(&mut self.pager, key) {
            Ok(removed) => removed,
            Err(e) => {
                self.rollback(meta);
                return Err(e);
            }
        };
        if !removed {
            return Ok(false);
        }
        if let Err(e) = self.commit() {
            self.rollback(meta);
            return Err(e);
        }
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self) -> TxnMeta {
        TxnMeta {
            root: self.tree.root(),
            free_head: self.pager.free.head(),
            free_total: self.pager.free.total(),
        }
    }

    fn rollback(&mut self, meta: TxnMeta) {
        self.tree.set_root(meta.root);
        self.pager.free = FreeList::new(meta.free_head, meta.free_total);
        self.pager.updates.clear();
        self.pager.nfree = 0;
        self.pager.nappend = 0;
    }

    /// Two-phase durable commit: data pages then fsync, master page then
    /// fsync. Readers only route through the master, so no intermediate
    /// state is ever observable.
    fn commit(&mut self) -> Result<()> {
        // Fold this transaction's deallocations into the free list. The
        // update itself stages more pages through the pager.
        let mut freed: Vec<u64> = self
            .pager
            .updates
            .iter()
            .filter(|(_, staged)| staged.is_none())
            .map(|(&ptr, _)| ptr)
            .collect();
        // Map iteration order is arbitrary; keep the on-disk list stable.
        freed.sort_unstable();

        let nfree = self.pager.nfree;
        let mut free = std::mem::take(&mut self.pager.free);
        let result = free.update(&mut self.pager, nfree, freed);
        self.pager.free = free;
        result?;

        // Everything staged must be addressable before it is written.
        let npages = self.pager.flushed + self.pager.nappend;
        self.extend_file(npages)?;
        self.pager.mmap.extend(&self.pager.file, npages)?;

        for (&ptr, staged) in &self.pager.updates {
            if let Some(page) = staged {
                self.pager
                    .file
                    .write_all_at(page, ptr * PAGE_SIZE as u64)
                    .wrap_err_with(|| format!("failed to write page {}", ptr))?;
            }
        }
        self.pager
            .file
            .sync_all()
            .wrap_err("fsync of data pages failed")?;

        self.pager.flushed = npages;
        self.pager.nfree = 0;
        self.pager.nappend = 0;
        self.pager.updates.clear();

        self.master_store()?;
        self.pager
            .file
            .sync_all()
            .wrap_err("fsync of master page failed")?;

        trace!(
            root = self.tree.root(),
            pages = self.pager.flushed,
            free = self.pager.free.total(),
            "committed"
        );
        Ok(())
    }

    /// Grows the file so that `npages` pages fit. `set_len` zero-fills
    /// the gap, keeping the length a page multiple.
    fn extend_file(&mut self, npages: u64) -> Result<()> {
        let len = npages * PAGE_SIZE as u64;
        if len <= self.pager.mmap.file_len() {
            return Ok(());
        }
        self.pager
            .file
            .set_len(len)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", len))?;
        self.pager.mmap.set_file_len(len);
        Ok(())
    }

    /// Overwrites page 0 with the current root, page count, and free
    /// list. The caller fsyncs.
    fn master_store(&mut self) -> Result<()> {
        let master = MasterPage::new(
            self.tree.root(),
            self.pager.flushed,
            self.pager.free.head(),
            self.pager.free.total(),
        );
        let mut page = [0u8; PAGE_SIZE];
        page[..MASTER_SIZE].copy_from_slice(master.as_bytes());
        self.pager
            .file
            .write_all_at(&page, 0)
            .wrap_err("failed to write master page")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{Cursor, Node, NodeKind};
    use tempfile::tempdir;

    fn open_kv(dir: &tempfile::TempDir) -> KV {
        KV::open(dir.path().join("test.db")).unwrap()
    }

    #[test]
    fn set_get_del_round_trip() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);

        db.set(b"key1", b"value1").unwrap();
        db.set(b"key2", b"value2").unwrap();
        db.set(b"key3", b"value3").unwrap();

        assert_eq!(db.get(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert!(db.del(b"key2").unwrap());
        assert_eq!(db.get(b"key2").unwrap(), None);
        assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
    }

    #[test]
    fn set_overwrites_existing_value() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);

        db.set(b"key1", b"value1").unwrap();
        db.set(b"key1", b"updated").unwrap();

        assert_eq!(db.get(b"key1").unwrap(), Some(b"updated".to_vec()));
    }

    #[test]
    fn del_of_absent_key_returns_false() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);

        assert!(!db.del(b"nonexistent").unwrap());

        db.set(b"key1", b"value1").unwrap();
        assert!(!db.del(b"nonexistent").unwrap());
        assert_eq!(db.get(b"key1").unwrap(), Some(b"value1".to_vec()));
    }

    #[test]
    fn get_on_empty_database_finds_nothing() {
        let dir = tempdir().unwrap();
        let db = open_kv(&dir);

        assert_eq!(db.get(b"anything").unwrap(), None);
    }

    #[test]
    fn bulk_inserts_iterate_in_key_order() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);

        for i in 0..=101u32 {
            let val = vec![(i % 251) as u8; 2000];
            db.set(&i.to_be_bytes(), &val).unwrap();
        }

        let mut cursor = Cursor::seek_to_min(&db.tree, &db.pager).unwrap();
        assert!(cursor.valid());
        for i in 0..=55u32 {
            cursor.next().unwrap();
            let (key, _) = cursor.deref().unwrap();
            assert_eq!(key, i.to_be_bytes());
        }
    }

    #[test]
    fn reopen_recovers_committed_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut db = KV::open(&path).unwrap();
            for i in 0..100u32 {
                db.set(format!("key{:03}", i).as_bytes(), format!("val{}", i).as_bytes())
                    .unwrap();
            }
            db.del(b"key050").unwrap();
            db.close().unwrap();
        }

        let db = KV::open(&path).unwrap();
        assert_eq!(db.get(b"key050").unwrap(), None);
        for i in (0..100u32).filter(|&i| i != 50) {
            let key = format!("key{:03}", i);
            assert_eq!(
                db.get(key.as_bytes()).unwrap(),
                Some(format!("val{}", i).into_bytes()),
                "missing {}",
                key
            );
        }
    }

    #[test]
    fn oversized_inserts_fail_without_side_effects() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);
        db.set(b"key", b"val").unwrap();

        let long_key = vec![b'k'; crate::btree::BTREE_MAX_KEY_SIZE + 1];
        assert!(db.set(&long_key, b"v").is_err());

        assert!(db.pager.updates.is_empty());
        assert_eq!(db.get(b"key").unwrap(), Some(b"val".to_vec()));
    }

    #[test]
    fn churn_reuses_freed_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut db = KV::open(&path).unwrap();

        for i in 0..20u32 {
            db.set(&i.to_be_bytes(), &vec![0u8; 500]).unwrap();
        }
        let settled = std::fs::metadata(&path).unwrap().len();

        // Steady-state churn must feed on the free list instead of
        // growing the file.
        for round in 0..30u32 {
            db.set(&(round % 20).to_be_bytes(), &vec![round as u8; 500]).unwrap();
        }
        let after = std::fs::metadata(&path).unwrap().len();

        assert!(
            after <= settled + 4 * PAGE_SIZE as u64,
            "file grew from {} to {} under steady-state churn",
            settled,
            after
        );
    }

    #[test]
    fn free_list_total_matches_walk_after_commits() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);

        for i in 0..50u32 {
            db.set(&i.to_be_bytes(), &vec![1u8; 800]).unwrap();
        }
        for i in 0..25u32 {
            db.del(&i.to_be_bytes()).unwrap();
        }

        let fl = &db.pager.free;
        let mut reachable = 0u64;
        let mut ptr = fl.head();
        while ptr != 0 {
            let page = db.pager.mmap.page(ptr).unwrap();
            reachable += u16::from_le_bytes(page[0..2].try_into().unwrap()) as u64;
            ptr = u64::from_le_bytes(page[2..10].try_into().unwrap());
        }
        assert_eq!(reachable, fl.total());
    }

    #[test]
    fn tree_and_free_list_pages_are_disjoint() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);

        for i in 0..60u32 {
            db.set(&i.to_be_bytes(), &vec![2u8; 900]).unwrap();
        }
        for i in 0..30u32 {
            db.del(&(i * 2).to_be_bytes()).unwrap();
        }

        // Every page is accounted for exactly once: reachable from the
        // tree, on the free list (as an entry or a list node), or never
        // allocated.
        let mut seen = std::collections::HashSet::new();
        let mut claim = |ptr: u64, what: &str| {
            assert!(ptr < db.pager.flushed, "{} page {} beyond flushed", what, ptr);
            assert!(seen.insert(ptr), "{} page {} claimed twice", what, ptr);
        };

        fn walk_tree(
            pager: &Pager,
            ptr: u64,
            claim: &mut impl FnMut(u64, &str),
        ) -> Result<()> {
            claim(ptr, "tree");
            let data = pager.page_get(ptr)?.to_vec();
            let node = Node::new(&data);
            if node.kind()? == NodeKind::Internal {
                for i in 0..node.nkeys() {
                    walk_tree(pager, node.ptr(i), claim)?;
                }
            }
            Ok(())
        }
        walk_tree(&db.pager, db.tree.root(), &mut claim).unwrap();

        let mut ptr = db.pager.free.head();
        while ptr != 0 {
            claim(ptr, "free-list node");
            let page = db.pager.mmap.page(ptr).unwrap();
            let count = u16::from_le_bytes(page[0..2].try_into().unwrap()) as usize;
            for i in 0..count {
                let pos = 10 + 8 * i;
                claim(
                    u64::from_le_bytes(page[pos..pos + 8].try_into().unwrap()),
                    "free entry",
                );
            }
            ptr = u64::from_le_bytes(page[2..10].try_into().unwrap());
        }
    }

    #[test]
    fn crash_before_master_write_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut db = KV::open(&path).unwrap();
            db.set(b"stable", b"one").unwrap();
            db.close().unwrap();
        }
        let committed_master = {
            let bytes = std::fs::read(&path).unwrap();
            bytes[..PAGE_SIZE].to_vec()
        };
        {
            let mut db = KV::open(&path).unwrap();
            db.set(b"volatile", b"two").unwrap();
            db.close().unwrap();
        }

        // Simulate a crash between the data fsync and the master fsync:
        // the new data pages are on disk but page 0 still points at the
        // previous commit.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&committed_master, 0).unwrap();
        file.sync_all().unwrap();

        let db = KV::open(&path).unwrap();
        assert_eq!(db.get(b"stable").unwrap(), Some(b"one".to_vec()));
        assert_eq!(db.get(b"volatile").unwrap(), None);
    }

    #[test]
    fn corrupted_signature_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mut db = KV::open(&path).unwrap();
            db.set(b"k", b"v").unwrap();
            db.close().unwrap();
        }

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(b"not a database!!", 0).unwrap();
        file.sync_all().unwrap();

        let result = KV::open(&path);
        assert!(result.is_err());
    }

    #[test]
    fn truncated_file_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mut db = KV::open(&path).unwrap();
            for i in 0..50u32 {
                db.set(&i.to_be_bytes(), &vec![0u8; 2000]).unwrap();
            }
            db.close().unwrap();
        }

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - PAGE_SIZE as u64).unwrap();
        file.sync_all().unwrap();

        let result = KV::open(&path);
        assert!(result.is_err());
    }

    #[test]
    fn root_stays_a_leaf_until_it_splits() {
        let dir = tempdir().unwrap();
        let mut db = open_kv(&dir);

        db.set(b"a", b"1").unwrap();

        let root = Node::new(db.pager.page_get(db.tree.root()).unwrap());
        assert_eq!(root.kind().unwrap(), NodeKind::Leaf);
        assert_eq!(root.nkeys(), 2);
        assert_eq!(root.key(0), b"");
    }
}
