//! Mount descriptors and the small amount of mount(2) plumbing we need.
//!
//! The snapshotter's public operations return [`Mount`] descriptors rather
//! than performing mounts: the caller decides where the filesystem lands.
//! The one exception is the lower directory of an active layer, which the
//! orchestrator mounts itself before composing the overlay on top.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use proc_mounts::{MountInfo, MountIter};
use rustix::mount::{mount, MountFlags, UnmountFlags};

use crate::error::{Error, Result};

/// `MS_REMOUNT`, not exposed as a public `MountFlags` constant by rustix.
const MS_REMOUNT: u32 = 32;

/// A mount description: what to mount, its filesystem type and options.
///
/// Options use the classic fstab vocabulary; anything that is not a flag
/// (`bind`, `rbind`, `ro`, `rw`) is passed to the kernel as filesystem data,
/// e.g. `lowerdir=…` for overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Device, directory or filesystem source.
    pub source: String,
    /// Filesystem type: `overlay`, `ext4`, `bind`, …
    pub fstype: String,
    /// Mount options.
    pub options: Vec<String>,
}

impl Mount {
    /// Apply this mount onto `target`.
    pub fn mount(&self, target: &Path) -> Result<()> {
        let mut flags = MountFlags::empty();
        let mut data: Vec<&str> = Vec::new();

        for opt in &self.options {
            match opt.as_str() {
                "bind" => flags |= MountFlags::BIND,
                "rbind" => flags |= MountFlags::BIND | MountFlags::REC,
                "ro" => flags |= MountFlags::RDONLY,
                "rw" => {}
                "remount" => flags |= MountFlags::from_bits_retain(MS_REMOUNT),
                "noatime" => flags |= MountFlags::NOATIME,
                "nodev" => flags |= MountFlags::NODEV,
                "nosuid" => flags |= MountFlags::NOSUID,
                "noexec" => flags |= MountFlags::NOEXEC,
                other => data.push(other),
            }
        }

        let fstype = if self.fstype == "bind" {
            // bind mounts carry no filesystem type of their own
            "none"
        } else {
            self.fstype.as_str()
        };
        if self.fstype == "bind" {
            flags |= MountFlags::BIND | MountFlags::REC;
        }

        let data = if data.is_empty() {
            None
        } else {
            Some(CString::new(data.join(",")).map_err(|_| {
                Error::InvalidArgument(format!("mount options contain NUL: {:?}", self.options))
            })?)
        };
        mount(self.source.as_str(), target, fstype, flags, data.as_deref())?;

        // A read-only bind needs a second, remounting pass: the RDONLY flag
        // is ignored while the bind itself is established. MS_REC must not
        // be carried into the remount.
        if flags.contains(MountFlags::BIND) && flags.contains(MountFlags::RDONLY) {
            mount(
                "none",
                target,
                "none",
                MountFlags::from_bits_retain(MS_REMOUNT) | MountFlags::BIND | MountFlags::RDONLY,
                None::<&std::ffi::CStr>,
            )?;
        }
        Ok(())
    }
}

/// Apply each mount in order onto the same target.
pub fn mount_all(mounts: &[Mount], target: &Path) -> Result<()> {
    for m in mounts {
        m.mount(target)?;
    }
    Ok(())
}

/// Unmount `target`.
pub fn unmount(target: &Path, flags: UnmountFlags) -> Result<()> {
    rustix::mount::unmount(target, flags)?;
    Ok(())
}

/// Find the mount entry whose mountpoint is exactly `target`.
pub fn find_mount(target: &Path) -> std::io::Result<Option<MountInfo>> {
    let mut found = None;
    for entry in MountIter::new()? {
        let entry = entry?;
        if entry.dest == target {
            // keep scanning: the last matching entry is the visible one
            found = Some(entry);
        }
    }
    Ok(found)
}

/// Whether `target` is currently a mountpoint.
pub fn is_mountpoint(target: &Path) -> std::io::Result<bool> {
    Ok(find_mount(target)?.is_some())
}

/// The source device backing the mount at `target`, if any.
pub fn mount_source(target: &Path) -> std::io::Result<Option<PathBuf>> {
    Ok(find_mount(target)?.map(|m| m.source))
}
