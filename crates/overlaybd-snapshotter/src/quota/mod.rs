//! Quota providers bound the writable space of an active layer.
//!
//! A provider turns a directory into a size-limited mountpoint before the
//! overlay upper/work directories are created inside it. The only provider
//! is [`sparsefile`]: an ext4 image of the requested size, loop-mounted
//! over the target.

use std::path::{Path, PathBuf};

use crate::error::Result;

pub mod sparsefile;

/// Options for [`QuotaDriver::setup`].
#[derive(Debug, Clone, Default)]
pub struct QuotaOpts {
    /// Directory holding the backing image; defaults to the target's
    /// parent directory.
    pub base: Option<PathBuf>,
    /// Mount the region read-write.
    pub read_write: bool,
}

/// A bounded-size writable region provider.
pub trait QuotaDriver: Send + Sync {
    /// Ensure `target` is a mountpoint of at most `size` bytes.
    /// A no-op when the target is already mounted.
    fn setup(&self, target: &Path, size: u64, opts: &QuotaOpts) -> Result<()>;

    /// Unmount the region and wait for its backing device to release the
    /// image file.
    fn remove(&self, target: &Path) -> Result<()>;
}

/// Look up a quota driver by name.
pub fn new(driver: &str) -> Option<Box<dyn QuotaDriver>> {
    match driver {
        sparsefile::QUOTA_NAME => Some(Box::<sparsefile::SparseFileQuota>::default()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_registry() {
        assert!(new("sparsefile").is_some());
        assert!(new("projquota").is_none());
        assert!(new("").is_none());
    }
}
