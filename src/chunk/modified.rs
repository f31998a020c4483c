//! Modified store: a sparse overlay holding every chunk that has received a
//! write.
//!
//! The backing file is created unlinked, so it is private to the process
//! and disappears with it. Data is addressed at `chunk * chunk_size +
//! offset`; holes (never-written ranges) read as zeros, which also covers
//! bytes past the origin's end after the image is grown.

use crate::chunk::layout::ChunkLayout;
use crate::util::bitmap::Bitmap;
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub struct ModifiedStore {
    file: Mutex<File>,
    layout: ChunkLayout,
    modified: Bitmap,
}

impl ModifiedStore {
    /// Create the overlay in `dir`. The file is unlinked immediately, so
    /// only this process can reach it.
    pub fn create(dir: impl AsRef<Path>, layout: ChunkLayout) -> std::io::Result<Self> {
        let file = tempfile::tempfile_in(dir)?;
        Ok(Self {
            file: Mutex::new(File::from_std(file)),
            layout,
            modified: Bitmap::new(),
        })
    }

    pub fn modified(&self) -> &Bitmap {
        &self.modified
    }

    fn position(&self, chunk: u64, offset: u32) -> u64 {
        self.layout.chunk_start(chunk) + offset as u64
    }

    /// Read a slice of a dirty chunk; holes and bytes past the file end
    /// come back as zeros.
    pub async fn read_chunk(
        &self,
        chunk: u64,
        offset: u32,
        buf: &mut [u8],
    ) -> std::io::Result<()> {
        debug_assert!(offset as usize + buf.len() <= self.layout.chunk_size as usize);

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.position(chunk, offset)))
            .await?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    /// Positional write into a chunk; marks the chunk dirty.
    pub async fn write_chunk(&self, chunk: u64, offset: u32, data: &[u8]) -> std::io::Result<()> {
        debug_assert!(offset as usize + data.len() <= self.layout.chunk_size as usize);

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.position(chunk, offset)))
            .await?;
        file.write_all(data).await?;
        drop(file);
        self.modified.set(chunk);
        Ok(())
    }

    /// Adjust the overlay to the image's logical size. Shrinking discards
    /// overlay bytes past `size`; growing leaves a hole, so a re-extended
    /// range reads zeros.
    pub async fn truncate(&self, size: u64) -> std::io::Result<()> {
        let file = self.file.lock().await;
        file.set_len(size).await
    }

    pub fn close(&self) {
        self.modified.group().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: ChunkLayout = ChunkLayout { chunk_size: 4096 };

    async fn store() -> ModifiedStore {
        let dir = std::env::temp_dir();
        ModifiedStore::create(dir, LAYOUT).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = store().await;
        store.write_chunk(3, 100, b"abcd").await.unwrap();
        assert!(store.modified().test(3));

        let mut out = [0u8; 4];
        store.read_chunk(3, 100, &mut out).await.unwrap();
        assert_eq!(&out, b"abcd");
    }

    #[tokio::test]
    async fn test_holes_read_zero() {
        let store = store().await;
        store.write_chunk(2, 0, b"x").await.unwrap();

        let mut out = [0xffu8; 16];
        store.read_chunk(9, 500, &mut out).await.unwrap();
        assert_eq!(out, [0u8; 16]);
    }

    #[tokio::test]
    async fn test_partial_tail_zero_filled() {
        let store = store().await;
        store.write_chunk(0, 0, b"abc").await.unwrap();

        let mut out = [0xffu8; 8];
        store.read_chunk(0, 0, &mut out).await.unwrap();
        assert_eq!(&out, b"abc\0\0\0\0\0");
    }

    #[tokio::test]
    async fn test_truncate_then_grow_reads_zero() {
        let store = store().await;
        store.write_chunk(0, 0, &[7u8; 4096]).await.unwrap();
        store.truncate(100).await.unwrap();
        store.truncate(4096).await.unwrap();

        let mut head = [0u8; 100];
        store.read_chunk(0, 0, &mut head).await.unwrap();
        assert_eq!(head, [7u8; 100]);

        let mut tail = [0xffu8; 100];
        store.read_chunk(0, 100, &mut tail).await.unwrap();
        assert_eq!(tail, [0u8; 100]);
    }
}
