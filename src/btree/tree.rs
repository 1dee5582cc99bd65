//! # Copy-on-Write B+Tree
//!
//! This module implements the ordered map at the heart of burrowdb. The
//! tree stores page numbers rather than memory pointers and reaches pages
//! only through the [`PageStore`] capability, so the same code runs over
//! the mmap-backed pager and over an in-memory map in tests.
//!
//! ## Copy-on-Write Invariant
//!
//! No existing page is ever mutated. Every mutating traversal builds new
//! pages top-down: the pages visited on the mutation path are registered
//! for deallocation and their replacements for allocation. Readers only
//! ever see pages reachable from a committed root.
//!
//! ## Insert
//!
//! ```text
//! 1. Route down with lookup_le to the containing leaf.
//! 2. Build a replacement leaf with the key inserted or updated. The
//!    replacement may exceed one page (built in 2x scratch space).
//! 3. On the way back up, split oversized results into 1-3 pieces and
//!    build a replacement parent linking the pieces.
//! 4. If the root itself splits, a new internal root links the pieces
//!    (the tree grows by one level).
//! ```
//!
//! ## Delete
//!
//! A shrunken node (under a quarter page) is merged with a sibling when
//! their combined size fits a page, the left sibling winning ties. If the
//! root ends up internal with a single child, that child becomes the new
//! root (the tree shrinks by one level).
//!
//! ## Sentinel
//!
//! The first insert creates a root leaf whose first key is the empty
//! sentinel, which sorts before every real key. Lookups therefore always
//! find a containing position and the routing code has no empty-range
//! special cases.

use eyre::{ensure, Result};

use super::node::{Node, NodeBuf, NodeKind, BTREE_MAX_KEY_SIZE, BTREE_MAX_VAL_SIZE, HEADER};
use crate::storage::{PageStore, PAGE_SIZE};

/// An ordered map over pages: a root page number plus the page access
/// capability supplied per call. Root 0 means the tree has never been
/// populated.
#[derive(Debug, Default)]
pub struct BTree {
    root: u64,
}

impl BTree {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub(crate) fn set_root(&mut self, root: u64) {
        self.root = root;
    }

    /// Looks up a key, returning its value on an exact match.
    pub fn get<S: PageStore>(&self, store: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == 0 {
            return Ok(None);
        }

        let mut node = Node::new(store.page_get(self.root)?);
        loop {
            let idx = node.lookup_le(key);
            match node.kind()? {
                NodeKind::Leaf => {
                    if idx < node.nkeys() && node.key(idx) == key {
                        return Ok(Some(node.val(idx).to_vec()));
                    }
                    return Ok(None);
                }
                NodeKind::Internal => {
                    let child = node.ptr(idx);
                    node = Node::new(store.page_get(child)?);
                }
            }
        }
    }

    /// Inserts or updates a key. Fails only if the key or value exceeds
    /// the per-node limits, in which case nothing is registered with the
    /// store.
    pub fn insert<S: PageStore>(&mut self, store: &mut S, key: &[u8], val: &[u8]) -> Result<()> {
        check_limits(key, val)?;

        if self.root == 0 {
            // First insert: the empty sentinel makes the leftmost leaf
            // cover the whole key space.
            let mut root = NodeBuf::page();
            root.set_header(NodeKind::Leaf, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, key, val);
            self.root = store.page_new(root.as_page())?;
            return Ok(());
        }

        let updated = tree_insert(store, self.root, key, val)?;
        let pieces = split3(updated)?;
        store.page_del(self.root);

        if pieces.len() > 1 {
            // The root split: grow the tree by one level.
            let mut root = NodeBuf::page();
            root.set_header(NodeKind::Internal, pieces.len() as u16);
            for (i, piece) in pieces.iter().enumerate() {
                let ptr = store.page_new(piece.as_page())?;
                root.append_kv(i as u16, ptr, piece.view().key(0), b"");
            }
            self.root = store.page_new(root.as_page())?;
        } else {
            self.root = store.page_new(pieces[0].as_page())?;
        }

        Ok(())
    }

    /// Removes a key, reporting whether it existed. Absent keys are a
    /// strict no-op: nothing is registered with the store.
    pub fn delete<S: PageStore>(&mut self, store: &mut S, key: &[u8]) -> Result<bool> {
        // The empty sentinel is not addressable, and oversized keys
        // cannot be present.
        if key.is_empty() || key.len() > BTREE_MAX_KEY_SIZE || self.root == 0 {
            return Ok(false);
        }

        let Some(updated) = tree_delete(store, self.root, key)? else {
            return Ok(false);
        };

        store.page_del(self.root);
        // A delete can grow a node past one page when a routing key is
        // replaced by a longer successor, so the result splits like an
        // insert result.
        let pieces = split3(updated)?;
        if pieces.len() > 1 {
            let mut root = NodeBuf::page();
            root.set_header(NodeKind::Internal, pieces.len() as u16);
            for (i, piece) in pieces.iter().enumerate() {
                let ptr = store.page_new(piece.as_page())?;
                root.append_kv(i as u16, ptr, piece.view().key(0), b"");
            }
            self.root = store.page_new(root.as_page())?;
        } else {
            let v = pieces[0].view();
            if v.kind()? == NodeKind::Internal && v.nkeys() == 1 {
                // The root degenerated to a single child: shrink by a level.
                self.root = v.ptr(0);
            } else {
                self.root = store.page_new(pieces[0].as_page())?;
            }
        }

        Ok(true)
    }
}

fn check_limits(key: &[u8], val: &[u8]) -> Result<()> {
    ensure!(!key.is_empty(), "empty keys are reserved");
    ensure!(
        key.len() <= BTREE_MAX_KEY_SIZE,
        "key length {} exceeds limit {}",
        key.len(),
        BTREE_MAX_KEY_SIZE
    );
    ensure!(
        val.len() <= BTREE_MAX_VAL_SIZE,
        "value length {} exceeds limit {}",
        val.len(),
        BTREE_MAX_VAL_SIZE
    );
    Ok(())
}

/// Recursive copy-on-write insert. Returns the replacement for `ptr`,
/// which may temporarily exceed one page; the caller splits it.
fn tree_insert<S: PageStore>(store: &mut S, ptr: u64, key: &[u8], val: &[u8]) -> Result<NodeBuf> {
    // Copy the node out: recursing below takes the store mutably.
    let data = store.page_get(ptr)?.to_vec();
    let node = Node::new(&data);

    let idx = node.lookup_le(key);
    let mut new = NodeBuf::scratch();
    match node.kind()? {
        NodeKind::Leaf => {
            if idx < node.nkeys() && node.key(idx) == key {
                leaf_update(&mut new, &node, idx, key, val);
            } else {
                leaf_insert(&mut new, &node, idx + 1, key, val);
            }
        }
        NodeKind::Internal => {
            let kptr = node.ptr(idx);
            let updated = tree_insert(store, kptr, key, val)?;
            let pieces = split3(updated)?;
            store.page_del(kptr);
            replace_kid_n(store, &mut new, &node, idx, &pieces)?;
        }
    }

    Ok(new)
}

fn leaf_insert(new: &mut NodeBuf, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeKind::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
}

fn leaf_update(new: &mut NodeBuf, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeKind::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - idx - 1);
}

/// Builds a replacement internal node with child `idx` replaced by the
/// given pieces, registering each piece with the store.
fn replace_kid_n<S: PageStore>(
    store: &mut S,
    new: &mut NodeBuf,
    old: &Node,
    idx: u16,
    kids: &[NodeBuf],
) -> Result<()> {
    let inc = kids.len() as u16;
    new.set_header(NodeKind::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, kid) in kids.iter().enumerate() {
        let ptr = store.page_new(kid.as_page())?;
        new.append_kv(idx + i as u16, ptr, kid.view().key(0), b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
    Ok(())
}

/// Splits an oversized node into 1-3 pieces, each fitting one page. Keys
/// are partitioned in order; the concatenation of the pieces' keys equals
/// the original.
pub(crate) fn split3(old: NodeBuf) -> Result<Vec<NodeBuf>> {
    if old.view().nbytes() <= PAGE_SIZE {
        return Ok(vec![old]);
    }

    let (left, right) = split2(&old.view())?;
    if left.view().nbytes() <= PAGE_SIZE {
        return Ok(vec![left, right]);
    }

    // The left half can still be oversized by at most one more page.
    let (leftmost, middle) = split2(&left.view())?;
    debug_assert!(leftmost.view().nbytes() <= PAGE_SIZE);
    Ok(vec![leftmost, middle, right])
}

/// Splits a node in two so that the right piece is as small as possible
/// while fitting one page; the left piece may remain oversized.
fn split2(old: &Node) -> Result<(NodeBuf, NodeBuf)> {
    debug_assert!(old.nkeys() >= 2);

    let left_bytes = |n: u16| HEADER + 10 * n as usize + old.offset(n) as usize;
    let right_bytes = |n: u16| old.nbytes() - left_bytes(n) + HEADER;

    let mut nleft = old.nkeys() / 2;
    while left_bytes(nleft) > PAGE_SIZE {
        nleft -= 1;
    }
    debug_assert!(nleft >= 1);
    while right_bytes(nleft) > PAGE_SIZE {
        nleft += 1;
    }
    debug_assert!(nleft < old.nkeys());
    let nright = old.nkeys() - nleft;

    let kind = old.kind()?;
    let mut left = NodeBuf::scratch();
    left.set_header(kind, nleft);
    left.append_range(old, 0, 0, nleft);

    let mut right = NodeBuf::page();
    right.set_header(kind, nright);
    right.append_range(old, 0, nleft, nright);
    debug_assert!(right.view().nbytes() <= PAGE_SIZE);

    Ok((left, right))
}

/// Recursive copy-on-write delete. `None` means the key is absent and
/// nothing was registered with the store.
fn tree_delete<S: PageStore>(store: &mut S, ptr: u64, key: &[u8]) -> Result<Option<NodeBuf>> {
    let data = store.page_get(ptr)?.to_vec();
    let node = Node::new(&data);

    let idx = node.lookup_le(key);
    match node.kind()? {
        NodeKind::Leaf => {
            if node.key(idx) != key {
                return Ok(None);
            }
            let mut new = NodeBuf::page();
            leaf_delete(&mut new, &node, idx);
            Ok(Some(new))
        }
        NodeKind::Internal => node_delete(store, &node, idx, key),
    }
}

fn leaf_delete(new: &mut NodeBuf, old: &Node, idx: u16) {
    new.set_header(NodeKind::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - idx - 1);
}

/// Delete within an internal node: recurse into child `idx`, then either
/// merge the shrunken child with a sibling or relink it in place.
fn node_delete<S: PageStore>(
    store: &mut S,
    node: &Node,
    idx: u16,
    key: &[u8],
) -> Result<Option<NodeBuf>> {
    let kptr = node.ptr(idx);
    let Some(updated) = tree_delete(store, kptr, key)? else {
        return Ok(None);
    };
    store.page_del(kptr);

    // Scratch space: replacing a routing key with a longer one can push
    // this node past a page; the caller splits the result.
    let mut new = NodeBuf::scratch();
    match should_merge(store, node, idx, &updated)? {
        MergeDir::Left(sibling_ptr) => {
            let sibling_data = store.page_get(sibling_ptr)?.to_vec();
            let mut merged = NodeBuf::page();
            node_merge(&mut merged, &Node::new(&sibling_data), &updated.view())?;
            store.page_del(sibling_ptr);
            let merged_ptr = store.page_new(merged.as_page())?;
            replace_2kid(&mut new, node, idx - 1, merged_ptr, merged.view().key(0));
        }
        MergeDir::Right(sibling_ptr) => {
            let sibling_data = store.page_get(sibling_ptr)?.to_vec();
            let mut merged = NodeBuf::page();
            node_merge(&mut merged, &updated.view(), &Node::new(&sibling_data))?;
            store.page_del(sibling_ptr);
            let merged_ptr = store.page_new(merged.as_page())?;
            replace_2kid(&mut new, node, idx, merged_ptr, merged.view().key(0));
        }
        MergeDir::None if updated.view().nkeys() == 0 => {
            // The child emptied with no sibling to absorb it, so this
            // node had exactly one child; propagate the emptiness.
            debug_assert!(node.nkeys() == 1 && idx == 0);
            new.set_header(NodeKind::Internal, 0);
        }
        MergeDir::None => {
            let pieces = split3(updated)?;
            replace_kid_n(store, &mut new, node, idx, &pieces)?;
        }
    }

    Ok(Some(new))
}

enum MergeDir {
    None,
    Left(u64),
    Right(u64),
}

/// A node under a quarter page merges with an adjacent sibling if the
/// combined content fits one page (one header is shared). The left
/// sibling wins ties.
fn should_merge<S: PageStore>(
    store: &S,
    node: &Node,
    idx: u16,
    updated: &NodeBuf,
) -> Result<MergeDir> {
    if updated.view().nbytes() > PAGE_SIZE / 4 {
        return Ok(MergeDir::None);
    }

    if idx > 0 {
        let sibling_ptr = node.ptr(idx - 1);
        let sibling = Node::new(store.page_get(sibling_ptr)?);
        if sibling.nbytes() + updated.view().nbytes() - HEADER <= PAGE_SIZE {
            return Ok(MergeDir::Left(sibling_ptr));
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling_ptr = node.ptr(idx + 1);
        let sibling = Node::new(store.page_get(sibling_ptr)?);
        if sibling.nbytes() + updated.view().nbytes() - HEADER <= PAGE_SIZE {
            return Ok(MergeDir::Right(sibling_ptr));
        }
    }

    Ok(MergeDir::None)
}

fn node_merge(new: &mut NodeBuf, left: &Node, right: &Node) -> Result<()> {
    debug_assert_eq!(left.kind()?, right.kind()?);
    new.set_header(left.kind()?, left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
    Ok(())
}

/// Replaces two adjacent child links with a single link to their merge.
fn replace_2kid(new: &mut NodeBuf, old: &Node, idx: u16, ptr: u64, key: &[u8]) {
    new.set_header(NodeKind::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, ptr, key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
}
