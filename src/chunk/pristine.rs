//! Pristine store: on-disk cache of chunks as served by the origin.
//!
//! Layout is `<cache_dir>/<bucket>/<chunk>` with `bucket = chunk / 4096 *
//! 4096`. A chunk file holds the literal origin bytes and is written to a
//! temporary name, synced, then renamed, so a concurrent engine sharing the
//! directory can at worst refetch, never read a torn chunk. Opening the
//! store scans the directory to rebuild the present set.

use crate::chunk::layout::ChunkLayout;
use crate::error::ConfigError;
use crate::util::bitmap::Bitmap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

pub const CHUNKS_PER_DIR: u64 = 4096;

pub struct PristineStore {
    base: PathBuf,
    layout: ChunkLayout,
    chunk_count: u64,
    present: Bitmap,
}

impl std::fmt::Debug for PristineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PristineStore")
            .field("base", &self.base)
            .field("chunk_count", &self.chunk_count)
            .finish_non_exhaustive()
    }
}

fn bucket_of(chunk: u64) -> u64 {
    chunk / CHUNKS_PER_DIR * CHUNKS_PER_DIR
}

/// Strict decimal parse: the whole name, no sign, no leading junk.
fn parse_decimal(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

impl PristineStore {
    /// Open the cache directory, creating it if needed, and rebuild the
    /// present set from its contents. Any malformed entry refuses init.
    pub async fn open(
        base: impl AsRef<Path>,
        layout: ChunkLayout,
        initial_size: u64,
    ) -> Result<Self, ConfigError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        let store = Self {
            base,
            layout,
            chunk_count: layout.chunk_count(initial_size),
            present: Bitmap::new(),
        };

        let mut top = fs::read_dir(&store.base).await?;
        while let Some(entry) = top.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Non-decimal names at the top level are not ours; skip them.
            let Some(bucket) = parse_decimal(name) else {
                continue;
            };
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            store.scan_bucket(&entry.path(), bucket).await?;
        }
        debug!(cache = %store.base.display(), "pristine store opened");
        Ok(store)
    }

    async fn scan_bucket(&self, path: &Path, bucket: u64) -> Result<(), ConfigError> {
        let mut dir = fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let chunk = name.to_str().and_then(parse_decimal);
            let valid = match chunk {
                Some(chunk) => chunk <= self.chunk_count && bucket_of(chunk) == bucket,
                None => false,
            };
            if !valid {
                return Err(ConfigError::InvalidCache(format!(
                    "{}/{}",
                    path.display(),
                    name.to_string_lossy()
                )));
            }
            self.present.set(chunk.unwrap());
        }
        Ok(())
    }

    fn chunk_path(&self, chunk: u64) -> PathBuf {
        self.base
            .join(bucket_of(chunk).to_string())
            .join(chunk.to_string())
    }

    pub fn present(&self) -> &Bitmap {
        &self.present
    }

    /// Read a slice of a cached chunk. The chunk must be present and the
    /// slice must lie within the bytes the origin served for it.
    pub async fn read_chunk(
        &self,
        chunk: u64,
        offset: u32,
        buf: &mut [u8],
    ) -> std::io::Result<()> {
        debug_assert!(self.present.test(chunk));
        debug_assert!(offset as usize + buf.len() <= self.layout.chunk_size as usize);

        let path = self.chunk_path(chunk);
        let mut file = fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
        file.read_exact(buf).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("premature end of file reading {}", path.display()),
                )
            } else {
                e
            }
        })?;
        Ok(())
    }

    /// Persist a fetched chunk and mark it present. Write-then-rename so
    /// the final name only ever holds complete data.
    pub async fn write_chunk(&self, chunk: u64, data: &[u8]) -> std::io::Result<()> {
        debug_assert!(data.len() <= self.layout.chunk_size as usize);

        let dir = self.base.join(bucket_of(chunk).to_string());
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{chunk}.tmp"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.chunk_path(chunk)).await?;
        self.present.set(chunk);
        Ok(())
    }

    pub fn close(&self) {
        self.present.group().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: ChunkLayout = ChunkLayout { chunk_size: 4096 };

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PristineStore::open(tmp.path(), LAYOUT, 1 << 20)
            .await
            .unwrap();
        let data = vec![0xabu8; 4096];
        store.write_chunk(5000, &data).await.unwrap();
        assert!(store.present().test(5000));

        let mut out = vec![0u8; 1000];
        store.read_chunk(5000, 100, &mut out).await.unwrap();
        assert_eq!(out, vec![0xabu8; 1000]);

        // Bucketed layout on disk.
        assert!(tmp.path().join("4096").join("5000").exists());
    }

    #[tokio::test]
    async fn test_scan_recovers_present_set() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = PristineStore::open(tmp.path(), LAYOUT, 1 << 24)
                .await
                .unwrap();
            store.write_chunk(0, &[1u8; 4096]).await.unwrap();
            store.write_chunk(4097, &[2u8; 4096]).await.unwrap();
        }
        let store = PristineStore::open(tmp.path(), LAYOUT, 1 << 24)
            .await
            .unwrap();
        assert!(store.present().test(0));
        assert!(store.present().test(4097));
        assert!(!store.present().test(1));
    }

    #[tokio::test]
    async fn test_scan_skips_foreign_top_level_names() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("info"), b"{}").unwrap();
        std::fs::create_dir(tmp.path().join("not-a-bucket")).unwrap();
        let store = PristineStore::open(tmp.path(), LAYOUT, 1 << 20)
            .await
            .unwrap();
        assert!(!store.present().test(0));
    }

    #[tokio::test]
    async fn test_scan_rejects_malformed_bucket_entry() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("0")).unwrap();
        std::fs::write(tmp.path().join("0").join("junk"), b"x").unwrap();
        let err = PristineStore::open(tmp.path(), LAYOUT, 1 << 20)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCache(_)));
    }

    #[tokio::test]
    async fn test_scan_rejects_chunk_in_wrong_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("0")).unwrap();
        std::fs::write(tmp.path().join("0").join("5000"), b"x").unwrap();
        let err = PristineStore::open(tmp.path(), LAYOUT, 1 << 24)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCache(_)));
    }

    #[tokio::test]
    async fn test_scan_rejects_chunk_beyond_image() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("0")).unwrap();
        std::fs::write(tmp.path().join("0").join("100"), b"x").unwrap();
        // Image of one chunk; chunk 100 can't belong to it.
        let err = PristineStore::open(tmp.path(), LAYOUT, 4096)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCache(_)));
    }
}
