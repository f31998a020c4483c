//! Per-image orchestration: the demand-paged read/write/truncate pipelines.
//!
//! Every user-visible operation is split into chunk-sized sub-operations by
//! the cursor. Each sub-operation takes the chunk lock, captures the image
//! size, and then reads the overlay, reads the pristine cache, or fetches
//! from the origin, in that order of authority. Counters and the I/O trace
//! stream are updated along the way.

use crate::chunk::layout::{ChunkLayout, IoCursor};
use crate::chunk::lock::ChunkLockTable;
use crate::chunk::modified::ModifiedStore;
use crate::chunk::pristine::PristineStore;
use crate::config::ImageConfig;
use crate::error::{ConfigError, IoError};
use crate::transport::{FetchRequest, TransportPool};
use crate::util::bitmap::Bitmap;
use crate::util::cancel::Interrupt;
use crate::util::stats::Counter;
use crate::util::stream::StreamGroup;
use std::sync::Mutex;
use tracing::{info, warn};

struct Credentials {
    username: String,
    password: String,
}

pub struct Image {
    name: String,
    url: String,
    fetch_offset: u64,
    segment_size: u64,
    credentials: Option<Credentials>,
    etag: Option<String>,
    last_modified: Option<i64>,

    layout: ChunkLayout,
    initial_size: u64,
    /// The chunk-state lock: guards `current_size` against the chunk locks.
    state: Mutex<ImageState>,

    locks: ChunkLockTable,
    pool: TransportPool,
    pristine: PristineStore,
    modified: ModifiedStore,
    accessed: Bitmap,

    bytes_read: Counter,
    bytes_written: Counter,
    chunk_fetches: Counter,
    chunk_dirties: Counter,
    io_errors: Counter,
    io_stream: StreamGroup,
}

struct ImageState {
    current_size: u64,
}

impl Image {
    /// Build an image from its config record: open the pristine cache
    /// (scanning it to recover the present set), create the private
    /// overlay, and set up the transport pool.
    pub async fn open(cfg: &ImageConfig) -> Result<Self, ConfigError> {
        let layout = ChunkLayout {
            chunk_size: cfg.cache.chunk_size,
        };
        let pristine = PristineStore::open(&cfg.cache.path, layout, cfg.size).await?;
        let modified = ModifiedStore::create(&cfg.cache.path, layout)?;
        let cookies = cfg
            .origin
            .cookies
            .as_ref()
            .map(|c| c.cookies.clone())
            .unwrap_or_default();
        let pool = TransportPool::new(&cfg.origin.url, &cookies)?;

        info!(
            image = %cfg.name,
            size = cfg.size,
            chunk_size = cfg.cache.chunk_size,
            "image opened"
        );
        Ok(Self {
            name: cfg.name.clone(),
            url: cfg.origin.url.clone(),
            fetch_offset: cfg.origin.offset,
            segment_size: cfg.origin.segment_size,
            credentials: cfg.origin.credentials.as_ref().map(|c| Credentials {
                username: c.username.clone(),
                password: c.password.clone(),
            }),
            etag: cfg
                .origin
                .validators
                .as_ref()
                .and_then(|v| v.etag.clone()),
            last_modified: cfg
                .origin
                .validators
                .as_ref()
                .and_then(|v| v.last_modified),
            layout,
            initial_size: cfg.size,
            state: Mutex::new(ImageState {
                current_size: cfg.size,
            }),
            locks: ChunkLockTable::new(),
            pool,
            pristine,
            modified,
            accessed: Bitmap::new(),
            bytes_read: Counter::new(),
            bytes_written: Counter::new(),
            chunk_fetches: Counter::new(),
            chunk_dirties: Counter::new(),
            io_errors: Counter::new(),
            io_stream: StreamGroup::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> u32 {
        self.layout.chunk_size
    }

    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().current_size
    }

    /// Chunks covering the current logical size.
    pub fn chunk_count(&self) -> u64 {
        self.layout.chunk_count(self.size())
    }

    pub fn accessed_map(&self) -> &Bitmap {
        &self.accessed
    }

    pub fn present_map(&self) -> &Bitmap {
        self.pristine.present()
    }

    pub fn modified_map(&self) -> &Bitmap {
        self.modified.modified()
    }

    pub fn io_stream(&self) -> &StreamGroup {
        &self.io_stream
    }

    pub fn bytes_read(&self) -> Counter {
        self.bytes_read.clone()
    }

    pub fn bytes_written(&self) -> Counter {
        self.bytes_written.clone()
    }

    pub fn chunk_fetches(&self) -> Counter {
        self.chunk_fetches.clone()
    }

    pub fn chunk_dirties(&self) -> Counter {
        self.chunk_dirties.clone()
    }

    pub fn io_errors(&self) -> Counter {
        self.io_errors.clone()
    }

    /// Read into `buf` starting at `start`. Returns the bytes transferred;
    /// EOF and failures after partial progress report the partial count.
    pub async fn read(
        &self,
        start: u64,
        buf: &mut [u8],
        intr: &Interrupt,
    ) -> Result<usize, IoError> {
        self.io_stream
            .write(&format!("read {start}+{}\n", buf.len()));
        let mut cur = IoCursor::new(self.layout, start, buf.len() as u64);
        let mut completed = 0u64;
        while cur.advance(completed) {
            let span = cur.progress() as usize..cur.progress() as usize + cur.length;
            match self
                .read_chunk(cur.chunk, cur.offset, &mut buf[span], intr)
                .await
            {
                Ok(n) => {
                    self.bytes_read.add(n as u64);
                    completed = n as u64;
                }
                Err(IoError::Eof) => return Ok(cur.progress() as usize),
                Err(IoError::Interrupted) => {
                    return match cur.progress() {
                        0 => Err(IoError::Interrupted),
                        n => Ok(n as usize),
                    };
                }
                Err(err) => {
                    warn!(image = %self.name, "read failed: {err}");
                    self.io_errors.add(1);
                    return match cur.progress() {
                        0 => Err(err),
                        n => Ok(n as usize),
                    };
                }
            }
        }
        Ok(cur.progress() as usize)
    }

    /// Write `data` starting at `start`. Writes never extend the image;
    /// the host grows it with truncate first.
    pub async fn write(
        &self,
        start: u64,
        data: &[u8],
        intr: &Interrupt,
    ) -> Result<usize, IoError> {
        self.io_stream
            .write(&format!("write {start}+{}\n", data.len()));
        let mut cur = IoCursor::new(self.layout, start, data.len() as u64);
        let mut completed = 0u64;
        while cur.advance(completed) {
            let span = cur.progress() as usize..cur.progress() as usize + cur.length;
            match self
                .write_chunk(cur.chunk, cur.offset, &data[span], intr)
                .await
            {
                Ok(n) => {
                    self.bytes_written.add(n as u64);
                    completed = n as u64;
                }
                Err(IoError::Interrupted) => {
                    return match cur.progress() {
                        0 => Err(IoError::Interrupted),
                        n => Ok(n as usize),
                    };
                }
                Err(err) => {
                    // Unlike read, running into the end of the image is an
                    // error here: writes never extend the image.
                    let err = match err {
                        IoError::Eof => IoError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "write past end of image",
                        )),
                        other => other,
                    };
                    warn!(image = %self.name, "write failed: {err}");
                    self.io_errors.add(1);
                    return match cur.progress() {
                        0 => Err(err),
                        n => Ok(n as usize),
                    };
                }
            }
        }
        Ok(cur.progress() as usize)
    }

    /// Change the logical size. Shrinking walks the released chunks from
    /// the end, taking each chunk's lock before the size excludes it.
    pub async fn truncate(&self, new_size: u64, intr: &Interrupt) -> Result<(), IoError> {
        let old_size = self.size();
        if new_size < old_size {
            let first_excluded = self.layout.chunk_count(new_size);
            let old_chunks = self.layout.chunk_count(old_size);
            for chunk in (first_excluded..old_chunks).rev() {
                match self.locks.acquire(chunk, intr).await {
                    Some(_guard) => {
                        self.set_size(self.layout.chunk_start(chunk).max(new_size));
                    }
                    None => return Err(IoError::Interrupted),
                }
            }
            if new_size < self.size() {
                // Trailing chunk is only partially retained: shrink under
                // its lock and zero the overlay tail.
                let boundary = self.layout.chunk_index_of(new_size);
                match self.locks.acquire(boundary, intr).await {
                    Some(_guard) => self.set_size(new_size),
                    None => return Err(IoError::Interrupted),
                }
            }
            self.modified.truncate(new_size).await?;
        } else if new_size > old_size {
            self.set_size(new_size);
            // Extend the overlay with a hole so the new range reads zeros.
            self.modified.truncate(new_size).await?;
        }
        Ok(())
    }

    fn set_size(&self, size: u64) {
        self.state.lock().unwrap().current_size = size;
    }

    /// Tear down for unmount: wake every subscriber with EOF.
    pub fn close(&self) {
        self.io_stream.close();
        self.accessed.group().close();
        self.pristine.close();
        self.modified.close();
    }

    async fn read_chunk(
        &self,
        chunk: u64,
        offset: u32,
        buf: &mut [u8],
        intr: &Interrupt,
    ) -> Result<usize, IoError> {
        let Some(_guard) = self.locks.acquire(chunk, intr).await else {
            return Err(IoError::Interrupted);
        };
        self.read_chunk_locked(chunk, offset, buf, intr).await
    }

    /// Body of the read pipeline; the caller holds the chunk lock.
    async fn read_chunk_locked(
        &self,
        chunk: u64,
        offset: u32,
        buf: &mut [u8],
        intr: &Interrupt,
    ) -> Result<usize, IoError> {
        let size = self.size();
        let position = self.layout.chunk_start(chunk) + offset as u64;
        if position >= size {
            return Err(IoError::Eof);
        }
        let length = (buf.len() as u64).min(size - position) as usize;
        let buf = &mut buf[..length];

        self.accessed.set(chunk);

        if self.modified.modified().test(chunk) {
            self.modified.read_chunk(chunk, offset, buf).await?;
            return Ok(length);
        }

        // Pristine backing ends at the origin boundary; bytes past it exist
        // only if the image was grown and always read as zeros.
        let pristine_end = self.layout.bytes_in_chunk(self.initial_size, chunk);
        if (offset as u64) < pristine_end {
            // Two engines sharing this cache directory may both see the
            // chunk absent and fetch it redundantly; the rename makes that
            // safe, just wasteful.
            if !self.pristine.present().test(chunk) {
                self.fetch_chunk(chunk, pristine_end as usize, intr).await?;
            }
            let backed = (pristine_end.min(offset as u64 + length as u64) - offset as u64) as usize;
            self.pristine
                .read_chunk(chunk, offset, &mut buf[..backed])
                .await?;
            buf[backed..].fill(0);
        } else {
            buf.fill(0);
        }
        Ok(length)
    }

    async fn write_chunk(
        &self,
        chunk: u64,
        offset: u32,
        data: &[u8],
        intr: &Interrupt,
    ) -> Result<usize, IoError> {
        let Some(_guard) = self.locks.acquire(chunk, intr).await else {
            return Err(IoError::Interrupted);
        };
        let size = self.size();
        let position = self.layout.chunk_start(chunk) + offset as u64;
        if position >= size {
            return Err(IoError::Eof);
        }
        let length = (data.len() as u64).min(size - position) as usize;

        self.accessed.set(chunk);

        if !self.modified.modified().test(chunk) {
            // First write to this chunk: materialize the whole in-range
            // chunk into the overlay (which may fetch), then dirty it.
            let count = self.layout.bytes_in_chunk(size, chunk) as usize;
            let mut whole = vec![0u8; count];
            self.read_chunk_locked(chunk, 0, &mut whole, intr).await?;
            self.modified.write_chunk(chunk, 0, &whole).await?;
            self.chunk_dirties.add(1);
        }
        self.modified
            .write_chunk(chunk, offset, &data[..length])
            .await?;
        Ok(length)
    }

    /// Fetch the first `count` bytes of a chunk from the origin and persist
    /// them. The fetch counter moves only once the chunk is durable.
    async fn fetch_chunk(&self, chunk: u64, count: usize, intr: &Interrupt) -> Result<(), IoError> {
        let mut data = vec![0u8; count];
        self.fetch_range(self.layout.chunk_start(chunk), &mut data, intr)
            .await?;
        self.pristine.write_chunk(chunk, &data).await?;
        self.chunk_fetches.add(1);
        Ok(())
    }

    /// Fetch a logical byte range, applying the configured fetch offset and
    /// splitting across segment URLs when the origin file is segmented.
    async fn fetch_range(
        &self,
        start: u64,
        buf: &mut [u8],
        intr: &Interrupt,
    ) -> Result<(), IoError> {
        let mut start = start + self.fetch_offset;
        let mut done = 0usize;
        while done < buf.len() {
            let remaining = (buf.len() - done) as u64;
            let (url, cur_start, cur_count) = if self.segment_size > 0 {
                let segment = start / self.segment_size;
                let in_segment = start % self.segment_size;
                (
                    format!("{}.{}", self.url, segment),
                    in_segment,
                    (self.segment_size - in_segment).min(remaining),
                )
            } else {
                (self.url.clone(), start, remaining)
            };
            let request = FetchRequest {
                url: &url,
                username: self.credentials.as_ref().map(|c| c.username.as_str()),
                password: self.credentials.as_ref().map(|c| c.password.as_str()),
                etag: self.etag.as_deref(),
                last_modified: self.last_modified,
                offset: cur_start,
                length: cur_count,
            };
            self.pool
                .fetch(&request, &mut buf[done..done + cur_count as usize], intr)
                .await?;
            start += cur_count;
            done += cur_count as usize;
        }
        Ok(())
    }
}
