//! # Chunked Memory-Mapped File Access
//!
//! This module implements `ChunkedMmap`, the read path of the storage
//! layer. The database file is mapped as a sequence of read-only chunks
//! whose logical concatenation covers the file; resolving a page number
//! means locating the chunk containing its byte offset and slicing out one
//! page.
//!
//! ## Why Chunks Instead of One Growing Mapping
//!
//! Remapping a single region on growth would invalidate every page slice
//! handed out so far. The copy-on-write tree reads several pages while a
//! transaction is in flight, so earlier mappings must stay where they are.
//! `ChunkedMmap` therefore only ever appends chunks:
//!
//! ```text
//! chunk 0: pages [0, 16)        (65536 bytes)
//! chunk 1: pages [16, 32)       (65536 bytes, doubles the total)
//! chunk 2: pages [32, 64)       (131072 bytes)
//! ...
//! ```
//!
//! The first chunk covers the file size rounded up to a power of two
//! pages; each later chunk equals the total mapped so far, giving
//! geometric growth with ratio 2 and O(log n) chunks overall.
//!
//! ## Read-Only Discipline
//!
//! Chunks are mapped read-only. All writes go through `pwrite` at commit
//! time; the kernel keeps a `MAP_SHARED` mapping coherent with file
//! writes, so committed pages become visible here without remapping.
//! Mapping may extend past the end of the file — callers are bounds-checked
//! against the file length so no access ever faults past EOF.

use std::fs::File;

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use super::PAGE_SIZE;

#[derive(Debug)]
pub struct ChunkedMmap {
    chunks: Vec<Mmap>,
    file_len: u64,
    total: u64,
}

impl ChunkedMmap {
    /// Maps the first chunk of `file`: at least one page, rounded up to a
    /// power of two pages covering the current file size.
    pub fn init(file: &File) -> Result<Self> {
        let file_len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();

        let mut chunk_len = PAGE_SIZE as u64;
        while chunk_len < file_len {
            chunk_len *= 2;
        }

        let chunk = map_chunk(file, 0, chunk_len)?;

        Ok(Self {
            chunks: vec![chunk],
            file_len,
            total: chunk_len,
        })
    }

    /// Appends chunks until at least `target_pages` pages are addressable.
    /// Existing chunks are never touched.
    pub fn extend(&mut self, file: &File, target_pages: u64) -> Result<()> {
        let target = target_pages * PAGE_SIZE as u64;

        while self.total < target {
            let chunk = map_chunk(file, self.total, self.total)?;
            self.chunks.push(chunk);
            self.total *= 2;
        }

        Ok(())
    }

    /// Resolves a page number to its mapped bytes.
    pub fn page(&self, ptr: u64) -> Result<&[u8]> {
        let offset = ptr * PAGE_SIZE as u64;

        ensure!(
            offset + PAGE_SIZE as u64 <= self.file_len,
            "page {} out of bounds (file holds {} pages)",
            ptr,
            self.file_len / PAGE_SIZE as u64
        );

        let mut start = 0u64;
        for chunk in &self.chunks {
            let end = start + chunk.len() as u64;
            if offset < end {
                let at = (offset - start) as usize;
                return Ok(&chunk[at..at + PAGE_SIZE]);
            }
            start = end;
        }

        unreachable!("offset {} below file length {} but past all chunks", offset, self.file_len)
    }

    /// Records a new on-disk file length after the file has been grown.
    pub fn set_file_len(&mut self, len: u64) {
        self.file_len = len;
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Total mapped length in bytes (always >= the file length rounded up
    /// to the current chunk boundary).
    pub fn total(&self) -> u64 {
        self.total
    }
}

fn map_chunk(file: &File, offset: u64, len: u64) -> Result<Mmap> {
    // SAFETY: Mmap::map is unsafe because the underlying file could be
    // modified externally. This is safe because:
    // 1. The database file is owned exclusively by this process for the
    //    lifetime of the handle (single-writer design).
    // 2. The mapping is read-only; all writes go through the file
    //    descriptor, which MAP_SHARED keeps coherent.
    // 3. Access is bounds-checked against the file length in page(), so
    //    the portion of a chunk past EOF is never dereferenced.
    unsafe {
        MmapOptions::new()
            .offset(offset)
            .len(len as usize)
            .map(file)
            .wrap_err_with(|| format!("failed to map {} bytes at offset {}", len, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with_pages(pages: usize) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.write_all(&vec![0u8; pages * PAGE_SIZE]).unwrap();
        file.sync_all().unwrap();
        (dir, file)
    }

    #[test]
    fn init_covers_file_with_power_of_two_pages() {
        let (_dir, file) = file_with_pages(3);

        let mmap = ChunkedMmap::init(&file).unwrap();

        assert_eq!(mmap.file_len(), 3 * PAGE_SIZE as u64);
        assert_eq!(mmap.total(), 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn init_on_empty_file_maps_one_page() {
        let (_dir, file) = file_with_pages(0);

        let mmap = ChunkedMmap::init(&file).unwrap();

        assert_eq!(mmap.file_len(), 0);
        assert_eq!(mmap.total(), PAGE_SIZE as u64);
    }

    #[test]
    fn extend_doubles_until_target_reached() {
        let (_dir, file) = file_with_pages(1);
        let mut mmap = ChunkedMmap::init(&file).unwrap();

        mmap.extend(&file, 5).unwrap();

        assert!(mmap.total() >= 5 * PAGE_SIZE as u64);
        assert_eq!(mmap.total(), 8 * PAGE_SIZE as u64);
    }

    #[test]
    fn page_reads_across_chunk_boundary() {
        let (_dir, file) = file_with_pages(1);
        let mut mmap = ChunkedMmap::init(&file).unwrap();
        mmap.extend(&file, 3).unwrap();

        use std::os::unix::fs::FileExt;
        let mut marked = vec![0u8; PAGE_SIZE];
        marked[0] = 0xAB;
        marked[PAGE_SIZE - 1] = 0xCD;
        file.write_all_at(&marked, 2 * PAGE_SIZE as u64).unwrap();
        file.set_len(4 * PAGE_SIZE as u64).unwrap();
        mmap.set_file_len(4 * PAGE_SIZE as u64);

        let page = mmap.page(2).unwrap();
        assert_eq!(page.len(), PAGE_SIZE);
        assert_eq!(page[0], 0xAB);
        assert_eq!(page[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn page_out_of_bounds_is_an_error() {
        let (_dir, file) = file_with_pages(2);
        let mmap = ChunkedMmap::init(&file).unwrap();

        let result = mmap.page(2);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("out of bounds"));
    }
}
