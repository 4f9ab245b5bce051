//! Sparse-file ext4 quota provider.
//!
//! Reserves a fixed-size writable region by truncating a sparse image file
//! to the requested size, formatting it as ext4 and loop-mounting it over
//! the target directory. The filesystem is created without a journal and
//! with eager inode-table initialization; journaling buys nothing for a
//! scratch layer and lazy itable init races with immediate heavy use.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use rustix::mount::UnmountFlags;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::loopdev;
use crate::mount::{self, Mount};
use crate::quota::{QuotaDriver, QuotaOpts};

/// Registry name of this provider.
pub const QUOTA_NAME: &str = "sparsefile";

const SPARSE_FILE_NAME: &str = "rw.img";
const DEFAULT_QUOTA: u64 = 10 << 30;

/// How long to wait for the loop device to release the backing image.
const UNMOUNT_WAIT_ATTEMPTS: u32 = 30;
const UNMOUNT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Quota provider backed by a loop-mounted sparse ext4 image.
#[derive(Debug)]
pub struct SparseFileQuota {
    fs_type: String,
    default_quota: u64,
}

impl Default for SparseFileQuota {
    fn default() -> Self {
        SparseFileQuota {
            fs_type: "ext4".into(),
            default_quota: DEFAULT_QUOTA,
        }
    }
}

impl SparseFileQuota {
    fn create_image_file(&self, img: &Path, size: u64) -> Result<()> {
        let dir = img.parent().ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no parent directory", img.display()))
        })?;
        let tmp = tempfile::Builder::new().prefix("new-").tempfile_in(dir)?;
        tmp.as_file().set_len(size)?;
        tmp.persist(img).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn format_image_file(&self, img: &Path) -> Result<()> {
        if self.fs_type != "ext4" {
            return Err(Error::InvalidArgument(format!(
                "unsupported filesystem {:?}, only ext4 is supported",
                self.fs_type
            )));
        }
        let output = Command::new("mkfs.ext4")
            .arg(img)
            .arg("-F")
            .args(["-E", "nodiscard,lazy_itable_init=0"])
            .args(["-O", "^has_journal"])
            .output()?;
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "mkfs.ext4 on {} failed: {}",
                img.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn mount_image(&self, img: &Path, target: &Path, read_write: bool) -> Result<()> {
        let mut open = OpenOptions::new();
        open.read(true).write(read_write);
        let file = open.open(img)?;

        let mut lo_flags = loopdev::flags::LO_FLAGS_AUTOCLEAR;
        if !read_write {
            lo_flags |= loopdev::flags::LO_FLAGS_READ_ONLY;
        }
        let device = loopdev::attach(&file, lo_flags)?;

        let m = Mount {
            source: device.path().display().to_string(),
            fstype: self.fs_type.clone(),
            options: vec![if read_write { "rw" } else { "ro" }.to_string()],
        };
        m.mount(target)
        // the mount now pins the loop device; our fd drops here and
        // autoclear detaches it once the target is unmounted
    }
}

impl QuotaDriver for SparseFileQuota {
    fn setup(&self, target: &Path, size: u64, opts: &QuotaOpts) -> Result<()> {
        if let Some(m) = mount::find_mount(target)? {
            debug!(path = %target.display(), source = %m.source.display(), "already a mountpoint");
            return Ok(());
        }

        let location = match &opts.base {
            Some(base) => base.clone(),
            None => target
                .parent()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "{} has no parent directory",
                        target.display()
                    ))
                })?
                .to_path_buf(),
        };
        let size = if size == 0 { self.default_quota } else { size };

        let sparse_file = location.join(SPARSE_FILE_NAME);
        if fs::symlink_metadata(&sparse_file).is_err() {
            debug!(file = %sparse_file.display(), size, "preparing sparse image");
            self.create_image_file(&sparse_file, size)?;
            self.format_image_file(&sparse_file)?;
        }

        debug!(file = %sparse_file.display(), path = %target.display(), "mounting sparse image");
        self.mount_image(&sparse_file, target, opts.read_write)
    }

    fn remove(&self, target: &Path) -> Result<()> {
        debug!(path = %target.display(), "removing quota mount");
        let source = match mount::mount_source(target) {
            Ok(source) => source,
            Err(err) => {
                warn!(path = %target.display(), error = %err, "failed to find mount source");
                None
            }
        };

        mount::unmount(target, UnmountFlags::empty())?;

        // Autoclear detaches the loop device asynchronously; give it a
        // bounded window before declaring the image released.
        let Some(source) = source else { return Ok(()) };
        let Some(name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(());
        };
        if !name.starts_with("loop") {
            return Ok(());
        }

        let backing = format!("/sys/block/{name}/loop/backing_file");
        for _ in 0..UNMOUNT_WAIT_ATTEMPTS {
            let contents = match fs::read_to_string(&backing) {
                Ok(contents) => contents,
                // device gone
                Err(_) => return Ok(()),
            };
            let backing_path = Path::new(contents.trim());
            if backing_path.parent() != Some(target) {
                return Ok(());
            }
            sleep(UNMOUNT_WAIT_INTERVAL);
        }
        warn!(path = %target.display(), "timed out waiting for loop device release");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_create_image_file_is_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join(SPARSE_FILE_NAME);
        let q = SparseFileQuota::default();
        q.create_image_file(&img, 1 << 30).unwrap();

        let meta = fs::metadata(&img).unwrap();
        assert_eq!(meta.len(), 1 << 30);
        use std::os::unix::fs::MetadataExt;
        assert!(meta.blocks() * 512 < 1 << 20, "image should be sparse");
    }

    #[test]
    fn test_rejects_non_ext4() {
        let dir = tempfile::tempdir().unwrap();
        let q = SparseFileQuota {
            fs_type: "xfs".into(),
            default_quota: DEFAULT_QUOTA,
        };
        let err = q.format_image_file(&dir.path().join("rw.img")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
