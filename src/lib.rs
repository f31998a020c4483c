// Library crate for vmnetfs: the engine is exposed for integration tests
// and embedders; the binary in main.rs is the launcher-facing driver.

pub mod chunk;
pub mod config;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod image;
pub mod transport;
pub mod util;

pub use crate::config::{Config, ImageConfig};
pub use crate::error::{ConfigError, FetchError, IoError, StreamError};
pub use crate::fs::{FileNode, Namespace, OpenFile};
pub use crate::image::Image;
pub use crate::transport::{FetchRequest, TransportPool};
pub use crate::util::cancel::Interrupt;
pub use crate::util::log::Log;
