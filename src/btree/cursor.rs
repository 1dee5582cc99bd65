//! # Ordered Cursor
//!
//! An in-order cursor over the B+tree, used internally for range walks
//! (there is no public range-query API). The cursor keeps the path from
//! the root to the current leaf together with the chosen position at each
//! level, so stepping to a neighbor touches only the levels that change.
//!
//! The cursor borrows pages from the store for its whole lifetime; it is
//! a read-only view and must be dropped before the next mutation.

use eyre::Result;

use super::node::{Node, NodeKind};
use super::tree::BTree;
use crate::storage::PageStore;

/// Comparison mode for [`Cursor::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekCmp {
    /// Smallest position with key >= the probe.
    Ge,
    /// Smallest position with key > the probe.
    Gt,
    /// Largest position with key <= the probe.
    Le,
    /// Largest position with key < the probe.
    Lt,
}

impl SeekCmp {
    fn matches(self, current: &[u8], probe: &[u8]) -> bool {
        match self {
            SeekCmp::Ge => current >= probe,
            SeekCmp::Gt => current > probe,
            SeekCmp::Le => current <= probe,
            SeekCmp::Lt => current < probe,
        }
    }
}

#[derive(Debug)]
pub struct Cursor<'a, S: PageStore> {
    store: &'a S,
    path: Vec<Node<'a>>,
    pos: Vec<u16>,
}

impl<'a, S: PageStore> Cursor<'a, S> {
    /// Positions at the largest key <= the probe. With the sentinel in
    /// place this always lands on a valid position.
    pub fn seek_le(tree: &BTree, store: &'a S, key: &[u8]) -> Result<Self> {
        let mut cursor = Self {
            store,
            path: Vec::new(),
            pos: Vec::new(),
        };

        let mut ptr = tree.root();
        while ptr != 0 {
            let node = Node::new(store.page_get(ptr)?);
            let idx = node.lookup_le(key);
            cursor.path.push(node);
            cursor.pos.push(idx);
            ptr = match node.kind()? {
                NodeKind::Internal => node.ptr(idx),
                NodeKind::Leaf => 0,
            };
        }

        Ok(cursor)
    }

    /// Positions relative to the probe key per the comparison mode.
    pub fn seek(tree: &BTree, store: &'a S, key: &[u8], cmp: SeekCmp) -> Result<Self> {
        let mut cursor = Self::seek_le(tree, store, key)?;
        if cmp == SeekCmp::Le {
            return Ok(cursor);
        }
        if let Some((current, _)) = cursor.deref() {
            if !cmp.matches(current, key) {
                match cmp {
                    SeekCmp::Ge | SeekCmp::Gt => cursor.next()?,
                    SeekCmp::Le | SeekCmp::Lt => cursor.prev()?,
                }
            }
        }
        Ok(cursor)
    }

    /// Positions at the tree minimum (the sentinel).
    pub fn seek_to_min(tree: &BTree, store: &'a S) -> Result<Self> {
        Self::seek_le(tree, store, b"")
    }

    pub fn valid(&self) -> bool {
        match self.path.last() {
            Some(leaf) => *self.pos.last().unwrap() < leaf.nkeys(),
            None => false,
        }
    }

    /// The key-value pair under the cursor.
    pub fn deref(&self) -> Option<(&'a [u8], &'a [u8])> {
        if !self.valid() {
            return None;
        }
        let leaf = self.path.last().unwrap();
        let idx = *self.pos.last().unwrap();
        Some((leaf.key(idx), leaf.val(idx)))
    }

    /// Advances to the next key. Past the last key the cursor becomes
    /// invalid.
    pub fn next(&mut self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        if !self.step_next(self.path.len() - 1)? {
            // Past the last key of the whole tree.
            *self.pos.last_mut().unwrap() += 1;
        }
        Ok(())
    }

    /// Steps back to the previous key. At the tree minimum this is a
    /// no-op.
    pub fn prev(&mut self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        self.step_prev(self.path.len() - 1)?;
        Ok(())
    }

    /// Returns false when nothing at this level or above could advance;
    /// the no-op must propagate so no frame reloads its child.
    fn step_next(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] + 1 < self.path[level].nkeys() {
            self.pos[level] += 1;
        } else if level > 0 {
            if !self.step_next(level - 1)? {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }

        if level + 1 < self.path.len() {
            let kid = Node::new(self.store.page_get(self.path[level].ptr(self.pos[level]))?);
            self.path[level + 1] = kid;
            self.pos[level + 1] = 0;
        }
        Ok(true)
    }

    fn step_prev(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] > 0 {
            self.pos[level] -= 1;
        } else if level > 0 {
            if !self.step_prev(level - 1)? {
                return Ok(false);
            }
        } else {
            // Already at the tree minimum.
            return Ok(false);
        }

        if level + 1 < self.path.len() {
            let kid = Node::new(self.store.page_get(self.path[level].ptr(self.pos[level]))?);
            self.path[level + 1] = kid;
            self.pos[level + 1] = kid.nkeys() - 1;
        }
        Ok(true)
    }
}
