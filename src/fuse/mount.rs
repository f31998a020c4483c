//! Mount helpers for starting/stopping FUSE.
//!
//! Linux-only in practice; unprivileged mounts go through fusermount3. The
//! handle's `unmount` is the lazy teardown used when the launcher closes
//! our stdin.

use crate::fs::Namespace;
use crate::fuse::VmnetFuse;
use fuse3::MountOptions;
use std::path::Path;
use std::sync::Arc;

fn default_mount_options() -> MountOptions {
    let mut options = MountOptions::default();
    options.fs_name("vmnetfs");
    // Counter/stream modes (0400) and the image (0600) are enforced by the
    // kernel rather than per-operation checks.
    options.default_permissions(true);
    options
}

/// Mount the namespace at an empty directory, preferring unprivileged mode.
#[cfg(target_os = "linux")]
pub async fn mount_namespace(
    ns: Arc<Namespace>,
    mountpoint: impl AsRef<Path>,
) -> std::io::Result<fuse3::raw::MountHandle> {
    let session = fuse3::raw::Session::new(default_mount_options());
    session
        .mount_with_unprivileged(VmnetFuse::new(ns), mountpoint)
        .await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_namespace(
    _ns: Arc<Namespace>,
    _mountpoint: impl AsRef<Path>,
) -> std::io::Result<fuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
