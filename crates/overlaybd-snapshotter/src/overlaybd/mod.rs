//! The overlaybd read-only layer driver.
//!
//! Turns a materialized layer directory (descriptor, ext4 fs-meta, gzip
//! index) into a local block device: a TCMU target is configured with the
//! layer's descriptor, enabled, wired to a SCSI loopback node, and the
//! resulting `/dev/sdX` is handed back to the orchestrator to mount.
//!
//! Attach walks a strict state machine; every step past target creation
//! registers a compensating action, and any failure unwinds them in LIFO
//! order so a failed attach leaves no sysfs residue and no orphaned
//! service process.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use rustix::process::Signal;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::mount::Mount;
use crate::util;

pub mod config;
pub mod paths;
pub mod process;
pub mod tools;

pub use tools::{ObdBinaries, ObdTools};

/// Marks a layer's blob as a remote block image.
pub const LABEL_BLOB_DIGEST: &str = "containerd.io/snapshot/overlaybd/blob-digest";
/// Size companion of [`LABEL_BLOB_DIGEST`].
pub const LABEL_BLOB_SIZE: &str = "containerd.io/snapshot/overlaybd/blob-size";
/// Marks a layer as the turbo variant referencing an OCI layer digest.
pub const LABEL_TURBO_DIGEST: &str =
    "containerd.io/snapshot/overlaybd/turbo-oci/target-digest";
/// Media type companion of [`LABEL_TURBO_DIGEST`].
pub const LABEL_TURBO_MEDIA_TYPE: &str =
    "containerd.io/snapshot/overlaybd/turbo-oci/target-media-type";
/// Source image of the layer chain, required on root layers.
pub const LABEL_IMAGE_REF: &str = "containerd.io/snapshot/cri.image-ref";

/// Device path recorded in the layer directory after a successful attach.
const DEVICE_FILE: &str = "device";

/// Converter output used for the turbo local merge.
const TAR_META_FILE: &str = "layer.tar.meta";

const ENABLE_RETRY_ATTEMPTS: u32 = 100;
const ENABLE_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const READY_ATTEMPTS: u32 = 1000;
const READY_INTERVAL: Duration = Duration::from_millis(20);
const PROBE_ATTEMPTS: u32 = 400;
const PROBE_INTERVAL: Duration = Duration::from_millis(5);

/// A driver that materializes read-only layers and produces their mounts.
///
/// `active_mount` attaches a block device for a container rootfs lower;
/// `prepare_mount` hands out the scratch bind mount a puller untars into;
/// `pre_process` writes the layer descriptor and decides skip-fetch.
pub trait RoDriver: Send + Sync {
    /// Write the layer descriptor if the labels call for one, and report
    /// whether the fetch can be skipped entirely.
    fn pre_process(
        &self,
        key_dir: &Path,
        parent_dir: Option<&Path>,
        parent: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool>;

    /// Prepare the block device for a new active layer and return the
    /// mount for its read-only lower.
    fn active_mount(
        &self,
        sn_dir: &Path,
        id: i64,
        parent_dir: Option<&Path>,
        parent_dirs: &[PathBuf],
    ) -> Result<Vec<Mount>>;

    /// Return the scratch mount a caller fills with layer content.
    fn prepare_mount(&self, key_dir: &Path, parents: &[PathBuf]) -> Result<Vec<Mount>>;

    /// Recover the mount for an existing layer directory.
    fn get_mount(&self, key_dir: &Path) -> Result<Vec<Mount>>;

    /// Convert deposited layer content into its committed artifacts.
    fn commit(&self, key_dir: &Path) -> Result<()>;

    /// Detach and release everything held for the layer id.
    fn cleanup(&self, id: i64) -> Result<()>;

    /// Remove attachments whose id is not in the live set. Cold-start
    /// recovery; drivers without global state need not implement it.
    fn sweep(&self, live: &HashSet<i64>) -> Result<()> {
        let _ = live;
        Ok(())
    }
}

/// LIFO compensation stack for the attach flow.
struct Teardown {
    actions: Vec<Box<dyn FnOnce()>>,
    armed: bool,
}

impl Teardown {
    fn new() -> Self {
        Teardown {
            actions: Vec::new(),
            armed: true,
        }
    }

    fn push(&mut self, action: impl FnOnce() + 'static) {
        self.actions.push(Box::new(action));
    }

    fn disarm(mut self) {
        self.armed = false;
        self.actions.clear();
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.armed {
            while let Some(action) = self.actions.pop() {
                action();
            }
        }
    }
}

fn remove_dir_quiet(path: &Path) {
    if let Err(err) = fs::remove_dir(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove sysfs dir");
        }
    }
}

fn remove_file_quiet(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove file");
        }
    }
}

fn remove_dir_checked(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Internal(format!(
            "failed to remove {}: {err}",
            path.display()
        ))),
    }
}

fn is_eagain(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(rustix::io::Errno::AGAIN.raw_os_error())
}

/// The production driver.
pub struct Overlaybd {
    tools: Box<dyn ObdTools>,
}

impl Overlaybd {
    /// Construct the driver, verifying the host carries the full tool set.
    pub fn new() -> Result<Self> {
        supports_overlaybd()?;
        Ok(Overlaybd {
            tools: Box::new(ObdBinaries),
        })
    }

    /// Construct the driver with a substitute tool set. Skips the host
    /// checks; meant for tests.
    pub fn with_tools(tools: Box<dyn ObdTools>) -> Self {
        Overlaybd { tools }
    }

    /// Run the attach protocol for the layer at `sn_dir`, returning the
    /// block device path.
    fn attach(&self, sn_dir: &Path, id: i64) -> Result<String> {
        let start = Instant::now();
        let mut teardown = Teardown::new();

        let target = paths::target_path(id);
        util::mkdir_all(&target, 0o700).map_err(|e| {
            Error::Internal(format!("failed to create target dir {}: {e}", target.display()))
        })?;
        {
            let target = target.clone();
            teardown.push(move || remove_dir_quiet(&target));
        }

        let config_path = config::config_path(sn_dir);
        fs::write(
            target.join("control"),
            format!("dev_config=overlaybd/{};{}", config_path.display(), id),
        )
        .map_err(|e| Error::Internal(format!("failed to write target dev_config: {e}")))?;
        fs::write(
            target.join("control"),
            format!("max_data_area_mb={}", paths::MAX_DATA_AREA_MB),
        )
        .map_err(|e| Error::Internal(format!("failed to write target max_data_area_mb: {e}")))?;

        let debug_log = config::init_debug_log_path(sn_dir);
        remove_file_quiet(&debug_log);

        let enable = target.join("enable");
        let mut enabled = false;
        for _ in 0..ENABLE_RETRY_ATTEMPTS {
            match fs::write(&enable, "1") {
                Ok(()) => {
                    enabled = true;
                    break;
                }
                Err(err) if is_eagain(&err) => {
                    info!(path = %target.display(), "enable returned EAGAIN, retrying");
                    sleep(ENABLE_RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(Error::Internal(format!(
                        "failed to write enable for {}: {err}",
                        target.display()
                    )));
                }
            }
        }
        if !enabled {
            return Err(Error::DeadlineExceeded(format!(
                "enable kept returning EAGAIN for {}",
                target.display()
            )));
        }
        teardown.push(move || {
            if let Err(err) = process::kill_service(id, Signal::INT) {
                warn!(id, error = %err, "failed to stop service process");
            }
        });

        fs::write(
            target.join("attrib").join("cmd_time_out"),
            (i32::MAX / 1000).to_string(),
        )
        .map_err(|e| Error::Internal(format!("failed to update cmd_time_out: {e}")))?;

        self.wait_ready(&debug_log, &target)?;
        debug!(id, elapsed_ms = start.elapsed().as_millis() as u64, "backstore started");

        let wwn = paths::loopback_device_id(id);
        let loop_dev = paths::loopback_device_path(&wwn);
        let tpgt = loop_dev.join("tpgt_1");
        let lun = paths::loopback_lun_path(&wwn);
        util::mkdir_all(&loop_dev, 0o700).map_err(|e| {
            Error::Internal(format!("failed to create loopback dir {}: {e}", loop_dev.display()))
        })?;
        util::mkdir_all(&lun, 0o700).map_err(|e| {
            Error::Internal(format!("failed to create loopback lun {}: {e}", lun.display()))
        })?;
        {
            let (lun, tpgt, loop_dev) = (lun.clone(), tpgt.clone(), loop_dev.clone());
            teardown.push(move || {
                remove_dir_quiet(&lun);
                remove_dir_quiet(&tpgt);
                remove_dir_quiet(&loop_dev);
            });
        }

        fs::write(tpgt.join("nexus"), &wwn)
            .map_err(|e| Error::Internal(format!("failed to write loopback nexus: {e}")))?;

        let link = lun.join(format!("dev_{id}"));
        std::os::unix::fs::symlink(&target, &link).map_err(|e| {
            Error::Internal(format!("failed to create loopback link {}: {e}", link.display()))
        })?;
        {
            let link = link.clone();
            teardown.push(move || remove_file_quiet(&link));
        }

        let address = fs::read_to_string(tpgt.join("address"))
            .map_err(|e| Error::Internal(format!("failed to read loopback address: {e}")))?;
        let device_number = address.trim_end_matches('\n');
        info!(id, device_number, "loopback wired up");

        let device = self.probe_device(device_number, id)?;
        debug!(id, %device, elapsed_ms = start.elapsed().as_millis() as u64, "device attached");

        teardown.disarm();
        Ok(device)
    }

    /// Poll the readiness file until the backstore reports `success`.
    fn wait_ready(&self, debug_log: &Path, target: &Path) -> Result<()> {
        for _ in 0..READY_ATTEMPTS {
            let contents = match fs::read_to_string(debug_log) {
                Ok(contents) => contents,
                Err(_) => {
                    sleep(READY_INTERVAL);
                    continue;
                }
            };
            if contents == "success" {
                return Ok(());
            }
            if contents.is_empty() {
                // racing the service's own write
                sleep(READY_INTERVAL);
                continue;
            }
            return Err(Error::Internal(format!(
                "failed to enable target for {}: {contents}",
                target.display()
            )));
        }
        Err(Error::DeadlineExceeded(format!(
            "timed out waiting for backstore readiness of {}",
            target.display()
        )))
    }

    /// Poll the SCSI scan path until the kernel surfaces the block device.
    fn probe_device(&self, device_number: &str, id: i64) -> Result<String> {
        let scan = paths::scsi_block_device_path(device_number);
        for _ in 0..PROBE_ATTEMPTS {
            match fs::read_dir(&scan) {
                Ok(mut entries) => {
                    if let Some(entry) = entries.next() {
                        let entry = entry?;
                        return Ok(format!("/dev/{}", entry.file_name().to_string_lossy()));
                    }
                }
                Err(_) => {}
            }
            sleep(PROBE_INTERVAL);
        }
        warn!(id, scan = %scan.display(), "timed out probing for block device");
        Err(Error::DeadlineExceeded(format!(
            "no block device appeared for layer {id}"
        )))
    }
}

/// Verify the external service, converters and base layer are installed.
pub fn supports_overlaybd() -> Result<()> {
    for binary in [
        paths::SERVICE_BINARY,
        paths::CONVERTER_BINARY,
        paths::MERGE_CONVERTER_BINARY,
        paths::BASE_LAYER,
    ] {
        if let Err(err) = fs::metadata(binary) {
            return Err(Error::FailedPrecondition(format!(
                "error stating {binary}: {err}"
            )));
        }
    }
    Ok(())
}

impl RoDriver for Overlaybd {
    fn pre_process(
        &self,
        key_dir: &Path,
        parent_dir: Option<&Path>,
        parent: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let (Some(blob_digest), Some(blob_size)) =
            (labels.get(LABEL_BLOB_DIGEST), labels.get(LABEL_BLOB_SIZE))
        else {
            return Ok(false);
        };

        if labels.contains_key(LABEL_TURBO_DIGEST) {
            // the gzip tar still has to be fetched and converted locally
            config::write_turbo_config(parent, labels, key_dir, parent_dir)?;
            Ok(false)
        } else {
            // a remote block image is usable the moment it is attached
            config::write_plain_config(parent, labels, key_dir, parent_dir, blob_digest, blob_size)?;
            Ok(true)
        }
    }

    fn active_mount(
        &self,
        sn_dir: &Path,
        id: i64,
        parent_dir: Option<&Path>,
        parent_dirs: &[PathBuf],
    ) -> Result<Vec<Mount>> {
        let parent_metas: Vec<PathBuf> =
            parent_dirs.iter().map(|dir| dir.join(TAR_META_FILE)).collect();
        let locally_converted =
            !parent_metas.is_empty() && parent_metas.iter().all(|meta| meta.exists());
        if locally_converted {
            let start = Instant::now();
            let workdir = sn_dir.join("tmp");
            debug!(dir = %sn_dir.display(), metas = parent_metas.len(), "merging parent metas");
            if let Err(err) = self.tools.merge_convert(&parent_metas, &workdir) {
                error!(
                    dir = %sn_dir.display(),
                    error = %err,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "merge converter failed"
                );
                return Err(err);
            }
            info!(
                dir = %sn_dir.display(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "merge converter done"
            );
        }

        self.tools.create(sn_dir)?;

        let parent_dir = parent_dir.ok_or_else(|| {
            Error::InvalidArgument("active layer requires a committed parent".into())
        })?;
        config::write_writable_config(sn_dir, parent_dir)?;

        let device = self.attach(sn_dir, id)?;

        if let Err(err) = fs::write(sn_dir.join(DEVICE_FILE), &device) {
            error!(dir = %sn_dir.display(), %device, error = %err, "failed to record device path");
            if let Err(cerr) = self.cleanup(id) {
                warn!(id, error = %cerr, "cleanup after failed device record");
            }
            return Err(Error::Io(err));
        }

        Ok(vec![Mount {
            source: device,
            fstype: "ext4".into(),
            options: vec!["ro".into()],
        }])
    }

    fn prepare_mount(&self, key_dir: &Path, _parents: &[PathBuf]) -> Result<Vec<Mount>> {
        fs::metadata(key_dir).map_err(|e| {
            Error::Internal(format!("error stating {}: {e}", key_dir.display()))
        })?;
        Ok(vec![Mount {
            source: key_dir.display().to_string(),
            fstype: "bind".into(),
            options: vec!["rbind".into(), "rw".into()],
        }])
    }

    fn get_mount(&self, key_dir: &Path) -> Result<Vec<Mount>> {
        let device_path = key_dir.join(DEVICE_FILE);
        match fs::read_to_string(&device_path) {
            Ok(device) => Ok(vec![Mount {
                source: device,
                fstype: "ext4".into(),
                options: vec!["ro".into()],
            }]),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(vec![Mount {
                source: key_dir.display().to_string(),
                fstype: "bind".into(),
                options: vec!["rw".into(), "rbind".into()],
            }]),
            Err(err) => Err(Error::Internal(format!(
                "failed to read device file {}: {err}",
                device_path.display()
            ))),
        }
    }

    fn commit(&self, key_dir: &Path) -> Result<()> {
        let tar = key_dir.join(crate::archive::TAR_FILE_NAME);
        match fs::metadata(&tar) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(Error::Internal(format!(
                    "error stating {}: {err}",
                    tar.display()
                )))
            }
            Ok(_) => {}
        }
        let meta = key_dir.join(TAR_META_FILE);
        debug!(tar = %tar.display(), meta = %meta.display(), "converting deposited layer");
        self.tools.convert(&tar, &meta)
    }

    fn cleanup(&self, id: i64) -> Result<()> {
        let wwn = paths::loopback_device_id(id);
        let lun = paths::loopback_lun_path(&wwn);
        let link = lun.join(format!("dev_{id}"));
        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::Internal(format!(
                    "failed to remove loopback link {}: {err}",
                    link.display()
                )))
            }
        }
        remove_dir_checked(&lun)?;

        let loop_dev = paths::loopback_device_path(&wwn);
        remove_dir_checked(&loop_dev.join("tpgt_1"))?;
        remove_dir_checked(&loop_dev)?;

        process::kill_service(id, Signal::INT)?;

        remove_dir_checked(&paths::target_path(id))
    }

    fn sweep(&self, live: &HashSet<i64>) -> Result<()> {
        let core = paths::target_path(0);
        let Some(hba_dir) = core.parent() else { return Ok(()) };
        let entries = match fs::read_dir(hba_dir) {
            Ok(entries) => entries,
            // no TCMU configfs on this host, nothing to recover
            Err(_) => return Ok(()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("dev_"))
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            if live.contains(&id) {
                continue;
            }
            info!(id, "removing stale attachment");
            if let Err(err) = self.cleanup(id) {
                warn!(id, error = %err, "failed to remove stale attachment");
            }
        }
        Ok(())
    }
}
