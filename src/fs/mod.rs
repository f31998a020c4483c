//! The mount namespace: a fixed tree built at startup mapping paths to
//! per-kind file operations.
//!
//! ```text
//! /config                       censored session configuration
//! /log                          subscriber stream of the process log
//! /<image>/image                the demand-paged image itself
//! /<image>/stats/<counter>      decimal snapshot, pollable
//! /<image>/stats/chunk_size     fixed integer
//! /<image>/stats/chunks         derived from the current size
//! /<image>/streams/<bitmap|io>  subscriber streams
//! ```

use crate::error::{IoError, StreamError};
use crate::image::Image;
use crate::util::cancel::Interrupt;
use crate::util::log::Log;
use crate::util::stats::{Counter, CounterWatch};
use crate::util::stream::{Stream, StreamGroup};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const ROOT_INO: u64 = 1;

pub struct Namespace {
    nodes: Vec<Node>,
}

pub struct Node {
    pub ino: u64,
    pub parent: u64,
    pub name: String,
    pub kind: NodeKind,
}

pub enum NodeKind {
    Dir(Vec<u64>),
    File(FileNode),
}

#[derive(Clone)]
pub enum FileNode {
    /// Fixed text rendered once at startup.
    Text(Arc<String>),
    /// Monotonic counter; snapshot at open, pollable afterwards.
    Stat(Counter),
    /// The configured chunk size.
    ChunkSize(Arc<Image>),
    /// Chunk count derived from the current image size.
    ChunkCount(Arc<Image>),
    /// The raw image: readable, writable, truncatable.
    Image(Arc<Image>),
    /// Subscriber stream; non-seekable.
    Stream(StreamGroup),
}

impl Namespace {
    pub fn build(config_text: String, images: &[Arc<Image>], log: &Log) -> Self {
        let mut ns = Namespace {
            nodes: vec![Node {
                ino: ROOT_INO,
                parent: ROOT_INO,
                name: String::new(),
                kind: NodeKind::Dir(Vec::new()),
            }],
        };
        ns.add_file(ROOT_INO, "config", FileNode::Text(Arc::new(config_text)));
        ns.add_file(ROOT_INO, "log", FileNode::Stream(log.group().clone()));

        for image in images {
            let dir = ns.add_dir(ROOT_INO, image.name());
            ns.add_file(dir, "image", FileNode::Image(image.clone()));

            let stats = ns.add_dir(dir, "stats");
            ns.add_file(stats, "bytes_read", FileNode::Stat(image.bytes_read()));
            ns.add_file(
                stats,
                "bytes_written",
                FileNode::Stat(image.bytes_written()),
            );
            ns.add_file(
                stats,
                "chunk_fetches",
                FileNode::Stat(image.chunk_fetches()),
            );
            ns.add_file(
                stats,
                "chunk_dirties",
                FileNode::Stat(image.chunk_dirties()),
            );
            ns.add_file(stats, "io_errors", FileNode::Stat(image.io_errors()));
            ns.add_file(stats, "chunk_size", FileNode::ChunkSize(image.clone()));
            ns.add_file(stats, "chunks", FileNode::ChunkCount(image.clone()));

            let streams = ns.add_dir(dir, "streams");
            ns.add_file(
                streams,
                "chunks_accessed",
                FileNode::Stream(image.accessed_map().group().clone()),
            );
            ns.add_file(
                streams,
                "chunks_cached",
                FileNode::Stream(image.present_map().group().clone()),
            );
            ns.add_file(
                streams,
                "chunks_modified",
                FileNode::Stream(image.modified_map().group().clone()),
            );
            ns.add_file(streams, "io", FileNode::Stream(image.io_stream().clone()));
        }
        ns
    }

    fn add_node(&mut self, parent: u64, name: &str, kind: NodeKind) -> u64 {
        let ino = self.nodes.len() as u64 + 1;
        self.nodes.push(Node {
            ino,
            parent,
            name: name.to_string(),
            kind,
        });
        match &mut self.nodes[(parent - 1) as usize].kind {
            NodeKind::Dir(children) => children.push(ino),
            NodeKind::File(_) => unreachable!("files have no children"),
        }
        ino
    }

    fn add_dir(&mut self, parent: u64, name: &str) -> u64 {
        self.add_node(parent, name, NodeKind::Dir(Vec::new()))
    }

    fn add_file(&mut self, parent: u64, name: &str, file: FileNode) -> u64 {
        self.add_node(parent, name, NodeKind::File(file))
    }

    pub fn node(&self, ino: u64) -> Option<&Node> {
        self.nodes.get(ino.checked_sub(1)? as usize)
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Option<&Node> {
        match &self.node(parent)?.kind {
            NodeKind::Dir(children) => children
                .iter()
                .filter_map(|&ino| self.node(ino))
                .find(|node| node.name == name),
            NodeKind::File(_) => None,
        }
    }

    pub fn children(&self, ino: u64) -> &[u64] {
        match self.node(ino).map(|n| &n.kind) {
            Some(NodeKind::Dir(children)) => children,
            _ => &[],
        }
    }

    /// Resolve a slash-separated path; mainly for tests and tooling.
    pub fn resolve(&self, path: &str) -> Option<&Node> {
        let mut ino = ROOT_INO;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            ino = self.lookup(ino, part)?.ino;
        }
        self.node(ino)
    }
}

impl Node {
    pub fn mode(&self) -> u16 {
        match &self.kind {
            NodeKind::Dir(_) => 0o500,
            NodeKind::File(FileNode::Image(_)) => 0o600,
            NodeKind::File(_) => 0o400,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(FileNode::Image(image)) => image.size(),
            NodeKind::File(FileNode::Text(text)) => text.len() as u64,
            _ => 0,
        }
    }
}

impl FileNode {
    /// Open semantics per kind: counters and fixed integers snapshot their
    /// value, streams subscribe, the image is stateless.
    pub fn open(&self, blocking: bool) -> OpenFile {
        match self {
            FileNode::Text(text) => OpenFile::buffered(text.as_bytes().to_vec(), None),
            FileNode::Stat(counter) => OpenFile::buffered(
                format!("{}\n", counter.get()).into_bytes(),
                Some(counter.watch()),
            ),
            FileNode::ChunkSize(image) => {
                OpenFile::buffered(format!("{}\n", image.chunk_size()).into_bytes(), None)
            }
            FileNode::ChunkCount(image) => {
                OpenFile::buffered(format!("{}\n", image.chunk_count()).into_bytes(), None)
            }
            FileNode::Image(image) => OpenFile::Image {
                image: image.clone(),
            },
            FileNode::Stream(group) => OpenFile::Stream {
                stream: group.subscribe(),
                blocking,
            },
        }
    }
}

/// An open handle. Reads and writes report errnos, which the FUSE adapter
/// passes straight to the host.
pub enum OpenFile {
    Buffered {
        data: Vec<u8>,
        watch: Option<Mutex<CounterWatch>>,
    },
    Image {
        image: Arc<Image>,
    },
    Stream {
        stream: Stream,
        blocking: bool,
    },
}

impl OpenFile {
    fn buffered(data: Vec<u8>, watch: Option<CounterWatch>) -> Self {
        OpenFile::Buffered {
            data,
            watch: watch.map(Mutex::new),
        }
    }

    /// Streams ignore the offset and never support seeking.
    pub fn nonseekable(&self) -> bool {
        matches!(self, OpenFile::Stream { .. })
    }

    /// Snapshot and stream sizes are unknowable from getattr, so their
    /// reads must bypass the page cache.
    pub fn direct_io(&self) -> bool {
        !matches!(self, OpenFile::Image { .. })
    }

    pub async fn read(&self, offset: u64, count: usize, intr: &Interrupt) -> Result<Vec<u8>, i32> {
        match self {
            OpenFile::Buffered { data, .. } => {
                let start = (offset as usize).min(data.len());
                let end = (start + count).min(data.len());
                Ok(data[start..end].to_vec())
            }
            OpenFile::Image { image } => {
                let mut buf = vec![0u8; count];
                match image.read(offset, &mut buf, intr).await {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(err) => Err(errno_of(&err)),
                }
            }
            OpenFile::Stream { stream, blocking } => {
                match stream.read(count, *blocking, intr).await {
                    Ok(data) => Ok(data),
                    Err(StreamError::WouldBlock) => Err(libc::EAGAIN),
                    Err(StreamError::Interrupted) => Err(libc::EINTR),
                }
            }
        }
    }

    pub async fn write(&self, offset: u64, data: &[u8], intr: &Interrupt) -> Result<u32, i32> {
        match self {
            OpenFile::Image { image } => match image.write(offset, data, intr).await {
                Ok(n) => Ok(n as u32),
                Err(err) => Err(errno_of(&err)),
            },
            _ => Err(libc::EBADF),
        }
    }

    /// Resolve when the underlying counter changes; immediately if it
    /// already has. Pends forever for non-counter files.
    pub async fn poll_changed(&self) {
        match self {
            OpenFile::Buffered {
                watch: Some(watch), ..
            } => watch.lock().await.changed().await,
            _ => std::future::pending().await,
        }
    }

    /// Synchronous check used to answer a poll without blocking.
    pub fn is_changed(&self) -> bool {
        match self {
            OpenFile::Buffered {
                watch: Some(watch), ..
            } => watch
                .try_lock()
                .map(|watch| watch.is_changed())
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn errno_of(err: &IoError) -> i32 {
    match err.errno() {
        // A zero-progress EOF read never reaches here (it is a zero-length
        // result); writes map EOF to an I/O error upstream.
        0 => libc::EIO,
        errno => errno,
    }
}
