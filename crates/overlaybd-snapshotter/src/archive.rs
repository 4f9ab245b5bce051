//! Whiteout translation and raw layer deposit.
//!
//! Tar streams produced by image builders encode deletions as `.wh.`
//! entries and directory opacity as a `.wh..wh..opq` marker. When a layer
//! is extracted onto an overlay host these must become the kernel's native
//! representation: a 0/0 character device, and the
//! `trusted.overlay.opaque` xattr on the enclosing directory.
//!
//! Layers destined for the block driver are not extracted at all; the tar
//! stream is deposited verbatim as `layer.tar` and converted at commit.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use rustix::fs::{makedev, mknodat, setxattr, FileType, Mode, XattrFlags, CWD};

use crate::error::{Error, Result};

/// Name of the raw tar deposited into a prepared layer directory.
pub const TAR_FILE_NAME: &str = "layer.tar";

/// Prefix marking a deleted entry in a tar stream.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker entry declaring the containing directory opaque.
const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// Translate one archive entry at `path` into overlay whiteout form.
///
/// Returns `false` when the entry itself must be dropped from the output
/// (both whiteout forms), `true` when it is to be written as usual.
pub fn overlay_convert_whiteout(hdr: &tar::Header, path: &Path) -> Result<bool> {
    let base = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Ok(true),
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    // an opaque directory marker becomes an xattr on the parent
    if base == WHITEOUT_OPAQUE_DIR {
        setxattr(dir, "trusted.overlay.opaque", b"y", XattrFlags::empty())?;
        return Ok(false);
    }

    // a deleted file becomes a 0/0 character device at the original name
    if let Some(original) = base.strip_prefix(WHITEOUT_PREFIX) {
        let original_path = dir.join(original);
        mknodat(
            CWD,
            &original_path,
            FileType::CharacterDevice,
            Mode::empty(),
            makedev(0, 0),
        )?;
        std::os::unix::fs::chown(
            &original_path,
            Some(hdr.uid()? as u32),
            Some(hdr.gid()? as u32),
        )?;
        return Ok(false);
    }

    Ok(true)
}

/// Deposit a layer tar stream verbatim as `layer.tar` under `root`.
///
/// Returns the number of bytes written.
pub fn write_layer(root: &Path, reader: &mut impl Read) -> Result<u64> {
    let target = root.join(TAR_FILE_NAME);
    if !target.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "target tar file path is not absolute: {}",
            target.display()
        )));
    }

    let mut file = File::create(&target)
        .map_err(|e| Error::Internal(format!("failed to open {}: {e}", target.display())))?;
    let size = io::copy(reader, &mut file)?;
    Ok(size)
}
