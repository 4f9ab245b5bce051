//! The external overlaybd tool set, behind a trait so tests can run
//! in-process fakes.
//!
//! The binary invocations are a fixed contract; nothing here may reorder
//! or rename arguments without coordinating with the converter side.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};
use crate::overlaybd::config::{DATA_FILE, INDEX_FILE};
use crate::overlaybd::paths;

/// Reserved index size handed to the create binary, in MiB.
const RESERVED_INDEX_MIB: u32 = 256;

/// Capability handle for the overlaybd converter binaries.
pub trait ObdTools: Send + Sync {
    /// Create the sparse upper `.data_file`/`.data_index` pair in `dir`.
    fn create(&self, dir: &Path) -> Result<()>;

    /// Convert a deposited tar into the device meta at `meta_out`.
    fn convert(&self, tar: &Path, meta_out: &Path) -> Result<()>;

    /// Merge the parents' metas into a device meta, scratching in `workdir`.
    fn merge_convert(&self, parent_metas: &[PathBuf], workdir: &Path) -> Result<()>;
}

/// The production tool set: shells out to the preinstalled binaries.
#[derive(Debug, Default)]
pub struct ObdBinaries;

fn run(mut cmd: Command) -> Result<()> {
    debug!(command = ?cmd, "running converter");
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "{:?} failed ({}): {}",
            cmd.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

impl ObdTools for ObdBinaries {
    fn create(&self, dir: &Path) -> Result<()> {
        let mut cmd = Command::new(paths::CREATE_BINARY);
        cmd.arg("-s")
            .arg(dir.join(DATA_FILE))
            .arg(dir.join(INDEX_FILE))
            .arg(RESERVED_INDEX_MIB.to_string());
        run(cmd)
    }

    fn convert(&self, tar: &Path, meta_out: &Path) -> Result<()> {
        let mut cmd = Command::new(paths::CONVERTER_BINARY);
        cmd.arg(tar).arg(meta_out).arg("--export");
        run(cmd)
    }

    fn merge_convert(&self, parent_metas: &[PathBuf], workdir: &Path) -> Result<()> {
        let mut cmd = Command::new(paths::MERGE_CONVERTER_BINARY);
        for meta in parent_metas {
            cmd.arg("--meta").arg(meta);
        }
        cmd.arg("--workdir").arg(workdir);
        run(cmd)
    }
}
