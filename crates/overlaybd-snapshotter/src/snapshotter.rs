//! The snapshotter orchestrator.
//!
//! Owns the public layer lifecycle: `prepare`, `view`, `active`, `commit`,
//! `mounts`, `remove`, `stat`, `update`, `usage`, `walk` and `cleanup`.
//! Each operation opens a metadata transaction, resolves directories,
//! delegates the bulk data work to the read-only driver or the quota
//! provider, and hands mount descriptors back to the caller. Failures roll
//! the transaction back and run compensating cleanup of anything already
//! materialized.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use rustix::mount::UnmountFlags;
use snapstore::{Info, Kind, MetaStore, Snapshot, Transaction, Usage};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mount::{self, Mount};
use crate::overlaybd::{Overlaybd, RoDriver};
use crate::quantity::parse_quantity;
use crate::quota::{self, QuotaDriver, QuotaOpts};
use crate::util;

/// Optional label carrying the location of a layer's upper directory.
const UPPERDIR_KEY: &str = "containerd.io/snapshot/overlay.upperdir";

/// Commit name used when prepare short-circuits a remotely materializable
/// layer.
const LABEL_SNAPSHOT_REF: &str = "containerd.io/snapshot.ref";

/// Absolute host path under which an active layer's writable content is
/// kept, instead of the snapshotter root.
const LABEL_ACTIVE_PATH: &str = "containerd.io/snapshot.overlay.active-path";

/// Size bound for the active layer's writable space, e.g. `20Gi`.
const LABEL_ACTIVE_QUOTA: &str = "containerd.io/snapshot.overlay.active-quota";

/// Internal marker stamped on active and view layers.
const LABEL_RW_LAYER: &str = "rwlayer";

/// Opaque sandbox metadata copied into the layer directory when present.
const LABEL_SANDBOX_META: &str = "PodSandboxMetadata";

const SANDBOX_META_FILE: &str = "pod_sandbox_meta";

/// Largest accepted active-quota value.
pub const MAX_ACTIVE_QUOTA: u64 = 64 << 40;

/// Smallest accepted active-quota value.
pub const MIN_ACTIVE_QUOTA: u64 = 1 << 30;

/// Construction options for [`Snapshotter`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotterConfig {
    async_remove: bool,
    upperdir_label: bool,
    quota_driver: Option<String>,
    default_upper_dir: Option<PathBuf>,
}

impl SnapshotterConfig {
    /// Defer removal of on-disk content to the next [`Snapshotter::cleanup`]
    /// sweep; the key itself becomes reusable immediately.
    pub fn asynchronous_remove(mut self) -> Self {
        self.async_remove = true;
        self
    }

    /// Stamp the upperdir label onto returned snapshot infos.
    pub fn with_upperdir_label(mut self) -> Self {
        self.upperdir_label = true;
        self
    }

    /// Select the quota driver bounding active layers, e.g. `sparsefile`.
    pub fn with_quota_driver(mut self, driver: impl Into<String>) -> Self {
        self.quota_driver = Some(driver.into());
        self
    }

    /// Keep active layers under a separate upper root instead of the
    /// snapshotter root.
    pub fn with_default_upper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_upper_dir = Some(dir.into());
        self
    }
}

/// The block-device backed overlay snapshotter.
pub struct Snapshotter {
    root: PathBuf,
    store: MetaStore,
    async_remove: bool,
    upperdir_label: bool,
    default_upper_dir: PathBuf,
    index_off: bool,
    userxattr: bool,
    quota: Option<Box<dyn QuotaDriver>>,
    driver: Box<dyn RoDriver>,
}

/// Whether the kernel understands the overlay `index=off` option.
fn supports_index() -> bool {
    Path::new("/sys/module/overlay/parameters/index").exists()
}

/// How `prepare_lower` materializes the new layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LowerMode {
    /// A scratch directory the caller fills with content (`prepare`).
    Scratch,
    /// A block device attached for a container rootfs lower (`active`).
    Device,
    /// A read-only composition of the parent chain (`view`).
    View,
}

impl Snapshotter {
    /// Construct the snapshotter over the production overlaybd driver.
    pub fn new(root: impl AsRef<Path>, config: SnapshotterConfig) -> Result<Snapshotter> {
        let driver = Box::new(Overlaybd::new()?);
        Snapshotter::with_driver(root, config, driver)
    }

    /// Construct the snapshotter over a caller-supplied driver.
    pub fn with_driver(
        root: impl AsRef<Path>,
        config: SnapshotterConfig,
        driver: Box<dyn RoDriver>,
    ) -> Result<Snapshotter> {
        let root = root.as_ref().to_path_buf();
        util::mkdir_all(&root, 0o700)?;
        let default_upper_dir = config.default_upper_dir.unwrap_or_else(|| root.clone());
        util::mkdir_all(&default_upper_dir, 0o700)?;

        if !util::supports_d_type(&root)? {
            return Err(Error::FailedPrecondition(format!(
                "{} does not support d_type. If the backing filesystem is xfs, \
                 please reformat with ftype=1 to enable d_type support",
                root.display()
            )));
        }

        let store = MetaStore::new(root.join("metadata.db"))?;
        util::mkdir_all(&root.join("snapshots"), 0o700)?;
        util::mkdir_all(&default_upper_dir.join("snapshots"), 0o700)?;

        let userxattr = util::needs_userxattr().unwrap_or_else(|err| {
            warn!(error = %err, "cannot detect whether userxattr is needed, assuming not");
            false
        });

        let quota = match &config.quota_driver {
            Some(name) => {
                let driver = quota::new(name);
                if driver.is_none() {
                    warn!(%name, "unknown quota driver");
                }
                driver
            }
            None => None,
        };

        Ok(Snapshotter {
            root,
            store,
            async_remove: config.async_remove,
            upperdir_label: config.upperdir_label,
            default_upper_dir,
            index_off: supports_index(),
            userxattr,
            quota,
            driver,
        })
    }

    // ---- path resolution -------------------------------------------------

    /// The caller-directed home for a layer, from the active-path label.
    ///
    /// Returns `Ok(None)` when the label is absent. The path must be
    /// absolute; writable content never escapes into relative locations.
    fn active_path(labels: &BTreeMap<String, String>, key: &str) -> Result<Option<PathBuf>> {
        let Some(home) = labels.get(LABEL_ACTIVE_PATH) else {
            return Ok(None);
        };
        let home = Path::new(home);
        if !home.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "path for active layer must be an absolute path: {}",
                home.display()
            )));
        }
        Ok(Some(home.join(".rwlayer").join(key)))
    }

    fn fs_path(&self, labels: &BTreeMap<String, String>, id: i64, key: &str) -> PathBuf {
        if let Ok(Some(home)) = Snapshotter::active_path(labels, key) {
            return home.join(id.to_string());
        }
        if labels.contains_key(LABEL_RW_LAYER) {
            return self
                .default_upper_dir
                .join("snapshots")
                .join(id.to_string());
        }
        self.root.join("snapshots").join(id.to_string())
    }

    fn upper_path(&self, labels: &BTreeMap<String, String>, id: i64, key: &str) -> PathBuf {
        self.fs_path(labels, id, key).join("upper")
    }

    fn lower_path(&self, labels: &BTreeMap<String, String>, id: i64, key: &str) -> PathBuf {
        self.fs_path(labels, id, key).join("lower")
    }

    fn ids_to_dirs(&self, ids: &[i64]) -> Vec<PathBuf> {
        ids.iter()
            .map(|id| self.root.join("snapshots").join(id.to_string()))
            .collect()
    }

    fn overlay_mount(&self, lower_dir: &Path, fs_dir: &Path, work_dir: &Path) -> Vec<Mount> {
        let mut options = vec![
            format!("lowerdir={}", lower_dir.display()),
            format!("upperdir={}", fs_dir.display()),
            format!("workdir={}", work_dir.display()),
        ];
        if self.index_off {
            options.push("index=off".into());
        }
        if self.userxattr {
            options.push("userxattr".into());
        }
        vec![Mount {
            source: "overlay".into(),
            fstype: "overlay".into(),
            options,
        }]
    }

    // ---- public contract -------------------------------------------------

    /// Stat a layer by key or name, enriched with the backend id, usage and
    /// root path as synthetic labels.
    pub fn stat(&self, key: &str) -> Result<Info> {
        let tx = self.store.transaction(false)?;
        let (id, mut info, usage) = tx.get_info(key)?;

        info.labels
            .insert("Backend-id".into(), id.to_string());
        info.labels
            .insert("Backend-inode".into(), usage.inodes.to_string());
        info.labels.insert(
            "Backend-size".into(),
            util::byte_count_decimal(usage.size),
        );
        let upper = self.upper_path(&info.labels, id, key);
        info.labels
            .insert("RootPath".into(), upper.display().to_string());
        if self.upperdir_label {
            info.labels
                .insert(UPPERDIR_KEY.into(), upper.display().to_string());
        }
        Ok(info)
    }

    /// Update a layer's mutable fields; only labels are mutable.
    pub fn update(&self, info: &Info, fieldpaths: &[&str]) -> Result<Info> {
        let tx = self.store.transaction(true)?;
        let mut updated = tx.update_info(info, fieldpaths)?;
        if self.upperdir_label {
            let (id, _, _) = tx.get_info(&updated.name)?;
            let upper = self.upper_path(&updated.labels, id, &updated.name);
            updated
                .labels
                .insert(UPPERDIR_KEY.into(), upper.display().to_string());
        }
        tx.commit()?;
        Ok(updated)
    }

    /// The resources taken by a layer. Active layers are scanned live;
    /// committed layers return the usage recorded at commit.
    pub fn usage(&self, key: &str) -> Result<Usage> {
        let tx = self.store.transaction(false)?;
        let (id, info, usage) = tx.get_info(key)?;
        drop(tx);

        if info.kind == Kind::Active {
            let upper = self.upper_path(&info.labels, id, key);
            return util::disk_usage(&upper);
        }
        Ok(usage)
    }

    /// Create a new active layer for content ingestion.
    ///
    /// Returns the scratch bind mount the caller untars into. When the
    /// layer's labels describe a remote block image, no data transfer is
    /// needed: the layer is committed under its snapshot-ref name on the
    /// spot and [`Error::AlreadyExists`] is surfaced for the caller to
    /// treat as success.
    pub fn prepare(
        &self,
        key: &str,
        parent: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Mount>> {
        info!(key, parent, "preparing layer");
        let tx = self.store.transaction(true)?;

        let (snap, parent_dir, mounts) =
            self.prepare_lower(&tx, Kind::Active, key, parent, LowerMode::Scratch, labels)?;

        let sn_dir = self.fs_path(labels, snap.id, key);
        let parent_opt = (!parent.is_empty()).then_some(parent);
        let skip_fetch =
            self.driver
                .pre_process(&sn_dir, parent_dir.as_deref(), parent_opt, labels)?;

        if skip_fetch {
            let name = labels.get(LABEL_SNAPSHOT_REF).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "layer {key} is remotely materializable but has no snapshot-ref label"
                ))
            })?;
            self.commit_in_tx(&tx, name, key, labels)?;
            tx.commit()?;
            info!(key, %name, "layer committed without fetch");
            return Err(Error::AlreadyExists);
        }

        tx.commit()?;
        debug!(key, ?mounts, "prepared layer");
        Ok(mounts)
    }

    /// Create a writable container rootfs over a committed parent chain:
    /// attach the chain as a block device, mount it read-only under the
    /// layer's lower directory, and compose an overlay with a fresh
    /// (optionally quota-bounded) upper.
    pub fn active(
        &self,
        key: &str,
        parent: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Mount>> {
        if parent.is_empty() {
            return Err(Error::InvalidArgument(
                "active layer parent cannot be empty".into(),
            ));
        }
        let mut labels = labels.clone();
        labels.insert(LABEL_RW_LAYER.into(), "true".into());

        let tx = self.store.transaction(true)?;
        let (snap, _, lower_mounts) =
            self.prepare_lower(&tx, Kind::Active, key, parent, LowerMode::Device, &labels)?;

        let upper_dir = self.upper_path(&labels, snap.id, key);
        let lower_dir = self.lower_path(&labels, snap.id, key);
        let fs_dir = upper_dir.join("fs");
        let work_dir = upper_dir.join("work");

        let undo = |err: Error| -> Error {
            if let Err(cerr) = self.driver.cleanup(snap.id) {
                warn!(id = snap.id, error = %cerr, "driver cleanup failed");
            }
            for dir in [&upper_dir, &lower_dir] {
                if let Err(rerr) = fs::remove_dir_all(dir) {
                    if rerr.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %dir.display(), error = %rerr, "failed to remove dir");
                    }
                }
            }
            err
        };

        if let Err(err) = self.prepare_upper_dir(&upper_dir, &fs_dir, &work_dir, &labels) {
            warn!(key, error = %err, "failed to prepare upper dir");
            return Err(undo(err));
        }
        if let Err(err) = util::mkdir_all(&lower_dir, 0o755) {
            return Err(undo(Error::Internal(format!(
                "failed to prepare lower dir: {err}"
            ))));
        }
        if let Err(err) = mount::mount_all(&lower_mounts, &lower_dir) {
            warn!(key, ?lower_mounts, error = %err, "failed to mount lower dir");
            return Err(undo(err));
        }

        tx.commit()?;
        Ok(self.overlay_mount(&lower_dir, &fs_dir, &work_dir))
    }

    /// Create a read-only view of a committed parent chain.
    pub fn view(
        &self,
        key: &str,
        parent: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Mount>> {
        if parent.is_empty() {
            return Err(Error::InvalidArgument(
                "view parent cannot be empty".into(),
            ));
        }
        let mut labels = labels.clone();
        labels.insert(LABEL_RW_LAYER.into(), "true".into());

        let tx = self.store.transaction(true)?;
        let (snap, parent_dir, _) =
            self.prepare_lower(&tx, Kind::View, key, parent, LowerMode::View, &labels)?;
        tx.commit()?;

        if snap.parent_ids.len() == 1 {
            let source = parent_dir.unwrap_or_else(|| self.ids_to_dirs(&snap.parent_ids)[0].clone());
            return Ok(vec![Mount {
                source: source.display().to_string(),
                fstype: "bind".into(),
                options: vec!["ro".into(), "rbind".into()],
            }]);
        }

        let lowers: Vec<String> = self
            .ids_to_dirs(&snap.parent_ids)
            .iter()
            .map(|dir| dir.display().to_string())
            .collect();
        let mut options = vec![format!("lowerdir={}", lowers.join(":"))];
        if self.index_off {
            options.push("index=off".into());
        }
        if self.userxattr {
            options.push("userxattr".into());
        }
        Ok(vec![Mount {
            source: "overlay".into(),
            fstype: "overlay".into(),
            options,
        }])
    }

    fn prepare_upper_dir(
        &self,
        target: &Path,
        fs_dir: &Path,
        work_dir: &Path,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        util::mkdir_all(target, 0o755)?;

        let active_quota = match self.get_active_quota(labels) {
            Ok(quota) => quota,
            Err(err) => {
                warn!(error = %err, "invalid active quota label");
                None
            }
        };
        if let (Some(quota), Some(size)) = (&self.quota, active_quota) {
            let opts = QuotaOpts {
                base: Some(target.to_path_buf()),
                read_write: true,
            };
            match quota.setup(target, size, &opts) {
                Ok(()) => {}
                // a broken format is unrecoverable, anything else degrades
                // to an unbounded upper
                Err(err @ Error::Internal(_)) => return Err(err),
                Err(err) => warn!(error = %err, "failed to set up quota"),
            }
        }

        util::mkdir_all(fs_dir, 0o755)?;
        util::mkdir_all(work_dir, 0o755)?;
        Ok(())
    }

    /// Shared row/directory setup for prepare, active and view.
    fn prepare_lower(
        &self,
        tx: &Transaction<'_>,
        kind: Kind,
        key: &str,
        parent: &str,
        mode: LowerMode,
        labels: &BTreeMap<String, String>,
    ) -> Result<(Snapshot, Option<PathBuf>, Vec<Mount>)> {
        let mut snapshot_dir = if mode == LowerMode::Scratch {
            self.root.join("snapshots")
        } else {
            self.default_upper_dir.join("snapshots")
        };

        if let Some(home) = Snapshotter::active_path(labels, key)? {
            if home.exists() {
                if let Err(err) = fs::remove_dir_all(&home) {
                    warn!(path = %home.display(), error = %err, "failed to clean up stale layer home");
                }
            }
            util::mkdir_all(&home, 0o711)?;
            snapshot_dir = home;
        }

        let td = tempfile::Builder::new()
            .prefix("new-")
            .tempdir_in(&snapshot_dir)
            .map_err(|e| Error::Internal(format!("failed to create temp dir: {e}")))?;

        let snap = tx.create_snapshot(kind, key, (!parent.is_empty()).then_some(parent), labels)?;
        let path = self.fs_path(labels, snap.id, key);

        let parent_dir = if parent.is_empty() {
            None
        } else {
            let (pid, pinfo, _) = tx.get_info(parent)?;
            Some(self.fs_path(&pinfo.labels, pid, parent))
        };

        // the temp dir becomes the layer dir; from here failures must
        // reclaim `path` instead
        let td_path = td.into_path();
        if let Err(err) = fs::rename(&td_path, &path) {
            let _ = fs::remove_dir_all(&td_path);
            return Err(Error::Internal(format!("failed to rename: {err}")));
        }

        let reclaim = |err: Error| -> Error {
            if let Err(rerr) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %rerr, "failed to reclaim layer directory");
            }
            err
        };

        let mounts = if mode == LowerMode::Device {
            if let Some(data) = labels.get(LABEL_SANDBOX_META) {
                let meta_path = path.join(SANDBOX_META_FILE);
                if let Err(err) = fs::write(&meta_path, data) {
                    warn!(path = %meta_path.display(), error = %err, "failed to write sandbox meta");
                }
            }
            self.driver
                .active_mount(
                    &path,
                    snap.id,
                    parent_dir.as_deref(),
                    &self.ids_to_dirs(&snap.parent_ids),
                )
                .map_err(|err| {
                    warn!(key, error = %err, "failed to prepare active lower dir mount");
                    reclaim(err)
                })?
        } else {
            self.driver.prepare_mount(&path, &[]).map_err(|err| {
                warn!(key, error = %err, "failed to prepare readable lower dir mount");
                reclaim(err)
            })?
        };

        Ok((snap, parent_dir, mounts))
    }

    /// Recover the mounts previously produced by prepare, active or view.
    pub fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let tx = self.store.transaction(false)?;
        let (id, info, _) = tx.get_info(key)?;
        drop(tx);

        let sn_dir = self.fs_path(&info.labels, id, key);
        let upper_dir = self.upper_path(&info.labels, id, key);
        let lower_dir = self.lower_path(&info.labels, id, key);

        if upper_dir.exists() {
            return Ok(self.overlay_mount(
                &lower_dir,
                &upper_dir.join("fs"),
                &upper_dir.join("work"),
            ));
        }
        self.driver.get_mount(&sn_dir)
    }

    /// Convert an active layer into a committed one under `name`.
    pub fn commit(
        &self,
        name: &str,
        key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let tx = self.store.transaction(true)?;
        self.commit_in_tx(&tx, name, key, labels)?;
        tx.commit()?;
        Ok(())
    }

    fn commit_in_tx(
        &self,
        tx: &Transaction<'_>,
        name: &str,
        key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (id, info, _) = tx.get_info(key)?;
        info!(key, name, "committing layer");

        let fs_dir = self.fs_path(&info.labels, id, key);
        let usage = util::disk_usage(&fs_dir)?;
        self.driver.commit(&fs_dir).map_err(|err| {
            info!(key, error = %err, "commit failed");
            Error::Internal(format!("failed to commit active mount: {err}"))
        })?;
        tx.commit_active(key, name, usage, labels)?;
        Ok(())
    }

    /// Abandon the layer under `key`.
    ///
    /// Unknown keys are a no-op. In synchronous mode the on-disk
    /// directories are removed right after the transaction commits; in
    /// asynchronous mode they linger for the next [`Snapshotter::cleanup`].
    pub fn remove(&self, key: &str) -> Result<()> {
        let tx = self.store.transaction(true)?;
        let (id, info, _) = match tx.get_info(key) {
            Ok(found) => found,
            Err(err) if matches!(err, snapstore::StoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let upper_dir = self.upper_path(&info.labels, id, key);
        let lower_dir = self.lower_path(&info.labels, id, key);

        if lower_dir.exists() && mount::is_mountpoint(&lower_dir)? {
            mount::unmount(&lower_dir, UnmountFlags::empty()).map_err(|err| {
                Error::Internal(format!("failed to umount lower dir: {err}"))
            })?;
        }

        // always ask the driver to release whatever it holds for the id
        self.driver.cleanup(id)?;

        let active_quota = match self.get_active_quota(&info.labels) {
            Ok(quota) => quota,
            Err(err) => {
                warn!(error = %err, "invalid active quota label");
                None
            }
        };
        if let (Some(quota), Some(_)) = (&self.quota, active_quota) {
            quota.remove(&upper_dir).map_err(|err| {
                Error::Internal(format!("failed to remove active quota: {err}"))
            })?;
        }

        if Snapshotter::active_path(&info.labels, key)?.is_some() {
            self.remove_active_path(&info.labels, key);
        }

        tx.remove(key)?;

        let removals = if self.async_remove {
            Vec::new()
        } else {
            self.cleanup_directories_in_tx(&tx)?
        };

        tx.commit()?;

        // failures past this point must not surface: the key is gone
        for dir in removals {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %err, "failed to remove directory");
            }
        }
        Ok(())
    }

    /// Prune the caller-directed layer home and any now-empty parents.
    fn remove_active_path(&self, labels: &BTreeMap<String, String>, key: &str) {
        let Some(home) = labels.get(LABEL_ACTIVE_PATH) else { return };
        let base = Path::new(home);

        let mut components = vec![".rwlayer".to_string()];
        components.extend(key.split('/').map(str::to_string));

        let full: PathBuf = base.join(components.join("/"));
        if let Err(err) = fs::remove_dir_all(&full) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %full.display(), error = %err, "failed to remove layer home");
                return;
            }
        }
        for i in (1..components.len()).rev() {
            let dir = base.join(components[..i].join("/"));
            let empty = fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty {
                let _ = fs::remove_dir(&dir);
            }
        }
    }

    /// Visit every layer's info.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Info) -> Result<()>,
    {
        let tx = self.store.transaction(false)?;
        let mut infos: Vec<(i64, Info)> = Vec::new();
        tx.walk(|id, info| {
            infos.push((id, info.clone()));
            Ok(())
        })?;
        drop(tx);

        for (id, mut info) in infos {
            if self.upperdir_label {
                let upper = self.upper_path(&info.labels, id, &info.name);
                info.labels
                    .insert(UPPERDIR_KEY.into(), upper.display().to_string());
            }
            f(&info)?;
        }
        Ok(())
    }

    /// Remove on-disk and sysfs resources from removed or abandoned layers.
    pub fn cleanup(&self) -> Result<()> {
        let (cleanup, live) = self.cleanup_directories()?;
        for dir in cleanup {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %err, "failed to remove directory");
            }
        }
        // cold-start recovery: drop attachments whose layer no longer exists
        self.driver.sweep(&live)?;
        Ok(())
    }

    fn cleanup_directories(&self) -> Result<(Vec<PathBuf>, HashSet<i64>)> {
        // a write transaction keeps other writers out while scanning
        let tx = self.store.transaction(true)?;
        let dirs = self.cleanup_directories_in_tx(&tx)?;
        let live = tx.id_map()?;
        Ok((dirs, live))
    }

    fn cleanup_directories_in_tx(&self, tx: &Transaction<'_>) -> Result<Vec<PathBuf>> {
        let ids = tx.id_map()?;
        let live: HashSet<String> = ids.iter().map(|id| id.to_string()).collect();

        let mut roots = vec![self.root.join("snapshots")];
        let upper_root = self.default_upper_dir.join("snapshots");
        if upper_root != roots[0] {
            roots.push(upper_root);
        }

        let mut cleanup = Vec::new();
        for root in roots {
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                let name = entry.file_name();
                if live.contains(&name.to_string_lossy().into_owned()) {
                    continue;
                }
                cleanup.push(entry.path());
            }
        }
        if !cleanup.is_empty() {
            info!(?cleanup, "cleaning up directories");
        }
        Ok(cleanup)
    }

    fn get_active_quota(&self, labels: &BTreeMap<String, String>) -> Result<Option<u64>> {
        let Some(quota) = labels.get(LABEL_ACTIVE_QUOTA) else {
            return Ok(None);
        };
        let size = parse_quantity(quota)?;
        if !(MIN_ACTIVE_QUOTA..=MAX_ACTIVE_QUOTA).contains(&size) {
            return Err(Error::InvalidArgument(format!(
                "active quota {size} outside [{MIN_ACTIVE_QUOTA}, {MAX_ACTIVE_QUOTA}]"
            )));
        }
        Ok(Some(size))
    }
}
