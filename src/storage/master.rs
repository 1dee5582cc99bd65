//! # Master Page
//!
//! Page 0 of the database file. It is the only page readers consult to
//! find everything else: the B+tree root, the number of pages in use, and
//! the free-list head. A commit becomes visible exactly when the rewritten
//! master page reaches disk, which is what makes the two-phase commit
//! atomic.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -----------------------------------------
//! 0       16    ASCII magic signature
//! 16      8     B+tree root page number (0 = empty tree)
//! 24      8     number of pages in use (flushed)
//! 32      8     free-list head page number (0 = empty)
//! 40      8     free-list total entry count
//! ```
//!
//! All integers are little-endian. The remainder of page 0 is zero.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Magic signature occupying the first 16 bytes of every database file,
/// verified byte-for-byte on open.
pub const DB_SIG: &[u8; 16] = b"BurrowDB format1";

/// Size of the meaningful prefix of page 0.
pub const MASTER_SIZE: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    magic: [u8; 16],
    root: U64,
    flushed: U64,
    free_head: U64,
    free_total: U64,
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_SIZE);

impl MasterPage {
    pub fn new(root: u64, flushed: u64, free_head: u64, free_total: u64) -> Self {
        Self {
            magic: *DB_SIG,
            root: U64::new(root),
            flushed: U64::new(flushed),
            free_head: U64::new(free_head),
            free_total: U64::new(free_total),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= MASTER_SIZE,
            "buffer too small for MasterPage: {} < {}",
            bytes.len(),
            MASTER_SIZE
        );

        let master = Self::ref_from_bytes(&bytes[..MASTER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MasterPage: {:?}", e))?;

        ensure!(
            &master.magic == DB_SIG,
            "bad database signature (not a burrowdb file?)"
        );

        Ok(master)
    }

    /// Sanity-checks the loaded fields against the actual file size. A
    /// violation means the file was truncated or corrupted and the
    /// database must not be opened.
    pub fn validate(&self, file_pages: u64) -> Result<()> {
        let flushed = self.flushed.get();
        let root = self.root.get();
        let free_head = self.free_head.get();

        ensure!(
            flushed >= 1 && flushed <= file_pages,
            "bad master page: {} pages in use but file holds {}",
            flushed,
            file_pages
        );
        ensure!(
            root < flushed,
            "bad master page: root page {} not below page count {}",
            root,
            flushed
        );
        ensure!(
            free_head < flushed,
            "bad master page: free-list head {} not below page count {}",
            free_head,
            flushed
        );
        ensure!(
            (free_head == 0) == (self.free_total.get() == 0),
            "bad master page: free-list head and total disagree"
        );

        Ok(())
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.get()
    }

    pub fn free_head(&self) -> u64 {
        self.free_head.get()
    }

    pub fn free_total(&self) -> u64 {
        self.free_total.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn master_page_is_48_bytes() {
        assert_eq!(std::mem::size_of::<MasterPage>(), MASTER_SIZE);
    }

    #[test]
    fn store_then_load_round_trips() {
        let master = MasterPage::new(12, 13, 5, 100);

        let bytes = master.as_bytes().to_vec();
        let loaded = MasterPage::from_bytes(&bytes).unwrap();

        assert_eq!(loaded.root(), 12);
        assert_eq!(loaded.flushed(), 13);
        assert_eq!(loaded.free_head(), 5);
        assert_eq!(loaded.free_total(), 100);
    }

    #[test]
    fn layout_matches_field_offsets() {
        let master = MasterPage::new(0x0102, 0x0304, 0x0506, 0x0708);
        let bytes = master.as_bytes();

        assert_eq!(&bytes[0..16], DB_SIG);
        assert_eq!(&bytes[16..24], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &0x0304u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &0x0506u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &0x0708u64.to_le_bytes());
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut bytes = MasterPage::new(1, 2, 0, 0).as_bytes().to_vec();
        bytes[0] ^= 0xFF;

        let result = MasterPage::from_bytes(&bytes);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("signature"));
    }

    #[test]
    fn validate_rejects_shrunken_file() {
        let master = MasterPage::new(3, 10, 0, 0);

        assert!(master.validate(10).is_ok());
        assert!(master.validate(9).is_err());
    }

    #[test]
    fn validate_rejects_root_beyond_page_count() {
        let master = MasterPage::new(13, 13, 0, 0);

        assert!(master.validate(13).is_err());
    }

    #[test]
    fn validate_rejects_disagreeing_free_list_fields() {
        let master = MasterPage::new(1, 5, 0, 7);

        assert!(master.validate(5).is_err());
    }
}
