//! Chunk-granular storage: layout math, per-chunk locking, and the pristine
//! and modified on-disk stores.

pub mod layout;
pub mod lock;
pub mod modified;
pub mod pristine;
