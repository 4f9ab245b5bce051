//! Small filesystem helpers shared across the crate.

use std::collections::HashSet;
use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::Path;

use rustix::fs::{open, Dir, FileType, Mode, OFlags};
use snapstore::Usage;

use crate::error::{Error, Result};

/// Create `path` and any missing ancestors with the given mode.
///
/// Already-existing directories are left as they are, permissions included.
pub fn mkdir_all(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::DirBuilder::new().recursive(true).mode(mode).create(path)
}

/// Atomically replace the contents of `path`.
///
/// The data is written to an exclusively-created sibling temp file, synced,
/// renamed over the target, and the parent directory is synced so the
/// rename itself is durable. Readers see either the old or the new content,
/// never a torn write.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no parent directory", path.display()))
        })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(Error::Io)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;

    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Scan a directory tree and account its size and inode count.
///
/// Sizes are in allocated-block terms, so sparse files count what they
/// actually occupy. Hardlinked inodes are counted once.
pub fn disk_usage(path: &Path) -> Result<Usage> {
    let mut usage = Usage::default();
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut pending = vec![path.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let meta = fs::symlink_metadata(&dir)?;
        usage.inodes += 1;
        usage.size += meta.blocks() * 512;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(entry.path());
                continue;
            }
            if meta.nlink() > 1 && !seen.insert((meta.dev(), meta.ino())) {
                continue;
            }
            usage.inodes += 1;
            usage.size += meta.blocks() * 512;
        }
    }
    Ok(usage)
}

/// Format a byte count with decimal (base 1000) units, one fraction digit.
pub fn byte_count_decimal(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let units = ['k', 'M', 'G', 'T', 'P', 'E'];
    format!("{:.1} {}B", bytes as f64 / div as f64, units[exp])
}

/// Whether the filesystem under `path` reports d_type in directory entries.
///
/// Overlayfs needs d_type from its backing filesystem; xfs formatted with
/// ftype=0 is the usual offender.
pub fn supports_d_type(path: &Path) -> Result<bool> {
    // Make sure there is at least one entry to inspect.
    let probe_file = tempfile::Builder::new()
        .prefix(".dtype-probe-")
        .tempfile_in(path)?;
    let probe_dir = tempfile::Builder::new()
        .prefix(".dtype-probe-")
        .tempdir_in(path)?;

    let fd = open(
        path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    for entry in Dir::read_from(&fd)? {
        let entry = entry?;
        let name = entry.file_name().to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        if entry.file_type() == FileType::Unknown {
            return Ok(false);
        }
    }
    drop(probe_file);
    drop(probe_dir);
    Ok(true)
}

/// Whether overlay mounts made by this process need the `userxattr` option.
///
/// Inside a user namespace the kernel refuses `trusted.*` xattrs, so
/// overlayfs must be told to use `user.*` instead. In the initial
/// namespace the option must be absent.
pub fn needs_userxattr() -> Result<bool> {
    let uid_map = fs::read_to_string("/proc/self/uid_map")?;
    let fields: Vec<&str> = uid_map.split_whitespace().collect();
    let initial = fields == ["0", "0", "4294967295"];
    Ok(!initial)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        atomic_write(&path, b"first", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // no temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_byte_count_decimal() {
        assert_eq!(byte_count_decimal(0), "0 B");
        assert_eq!(byte_count_decimal(999), "999 B");
        assert_eq!(byte_count_decimal(1000), "1.0 kB");
        assert_eq!(byte_count_decimal(1_500_000), "1.5 MB");
        assert_eq!(byte_count_decimal(2_000_000_000), "2.0 GB");
        assert_eq!(byte_count_decimal(3_500_000_000_000), "3.5 TB");
    }

    #[test]
    fn test_disk_usage() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 4096]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), b"hello").unwrap();

        let usage = disk_usage(dir.path()).unwrap();
        // root dir, "a", "sub", "sub/b"
        assert_eq!(usage.inodes, 4);
        assert!(usage.size >= 4096);
    }

    #[test]
    fn test_disk_usage_counts_hardlinks_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 4096]).unwrap();
        fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();

        let usage = disk_usage(dir.path()).unwrap();
        assert_eq!(usage.inodes, 2); // root dir + one inode
    }

    #[test]
    fn test_supports_d_type() {
        let dir = tempfile::tempdir().unwrap();
        // every filesystem a test suite runs on supports d_type
        assert!(supports_d_type(dir.path()).unwrap());
    }
}
