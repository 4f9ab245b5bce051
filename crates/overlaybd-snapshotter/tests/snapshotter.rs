//! Lifecycle tests for the snapshotter over an in-process tool set.
//!
//! The production driver is used as-is; only the external converter
//! binaries are replaced with fakes. Nothing here attaches a real TCMU
//! target, so the suite runs unprivileged. Scenarios that must mount
//! (active layers, overlay reads) gate on root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use similar_asserts::assert_eq;

use overlaybd_snapshotter::archive::TAR_FILE_NAME;
use overlaybd_snapshotter::error::{Error, Result};
use overlaybd_snapshotter::mount::{self, Mount};
use overlaybd_snapshotter::overlaybd::config::{config_path, read_config};
use overlaybd_snapshotter::overlaybd::{
    ObdTools, Overlaybd, RoDriver, LABEL_BLOB_DIGEST, LABEL_BLOB_SIZE, LABEL_IMAGE_REF,
    LABEL_TURBO_DIGEST, LABEL_TURBO_MEDIA_TYPE,
};
use overlaybd_snapshotter::{Kind, Snapshotter, SnapshotterConfig};

/// Converter fakes: cheap marker files instead of real device images.
struct FakeTools;

impl ObdTools for FakeTools {
    fn create(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(".data_file"), b"")?;
        fs::write(dir.join(".data_index"), b"")?;
        Ok(())
    }

    fn convert(&self, tar: &Path, meta_out: &Path) -> Result<()> {
        let dir = meta_out.parent().unwrap();
        let tar_data = fs::read(tar)?;
        fs::write(meta_out, &tar_data)?;
        fs::write(dir.join("ext4.fs.meta"), b"ext4-meta")?;
        fs::write(dir.join("gzip.meta"), b"gzip-index")?;
        Ok(())
    }

    fn merge_convert(&self, _parent_metas: &[PathBuf], workdir: &Path) -> Result<()> {
        fs::create_dir_all(workdir)?;
        Ok(())
    }
}

fn snapshotter(root: &Path, config: SnapshotterConfig) -> Snapshotter {
    let driver = Overlaybd::with_tools(Box::new(FakeTools));
    Snapshotter::with_driver(root, config, Box::new(driver)).unwrap()
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn no_labels() -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Prepare should hand back one writable scratch bind of the layer dir.
#[test]
fn test_prepare_returns_scratch_bind() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    let mounts = s.prepare("k1", "", &no_labels()).unwrap();
    assert_eq!(mounts.len(), 1);
    let m = &mounts[0];
    assert_eq!(m.fstype, "bind");
    assert_eq!(m.options, vec!["rbind".to_string(), "rw".to_string()]);
    assert!(Path::new(&m.source).is_dir());
}

#[test]
fn test_prepare_commit_chain() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    let mounts = s.prepare("k1", "", &no_labels()).unwrap();
    let scratch = PathBuf::from(&mounts[0].source);
    fs::write(scratch.join("a"), b"layer one").unwrap();
    s.commit("base", "k1", &no_labels()).unwrap();

    // committed under the new name, the key is gone
    let info = s.stat("base").unwrap();
    assert_eq!(info.kind, Kind::Committed);
    assert!(s.stat("k1").unwrap_err().is_not_found());

    // usage was recorded from the deposited content
    let usage = s.usage("base").unwrap();
    assert!(usage.inodes >= 2, "dir and file at least: {usage:?}");
    assert!(usage.size > 0);

    // a child stacks on the committed name
    let mounts = s.prepare("k2", "base", &no_labels()).unwrap();
    let scratch = PathBuf::from(&mounts[0].source);
    fs::write(scratch.join("b"), b"layer two").unwrap();
    s.commit("l2", "k2", &no_labels()).unwrap();

    let info = s.stat("l2").unwrap();
    assert_eq!(info.parent.as_deref(), Some("base"));
}

#[test]
fn test_commit_missing_key_fails() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());
    assert!(s
        .commit("name", "no-such-key", &no_labels())
        .unwrap_err()
        .is_not_found());
}

/// A remote block image needs no tar transfer: prepare commits the layer
/// under its snapshot-ref name and signals AlreadyExists.
#[test]
fn test_remote_block_image_skips_fetch() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    let l = labels(&[
        (LABEL_BLOB_DIGEST, "sha256:beefbeef"),
        (LABEL_BLOB_SIZE, "1048576"),
        (LABEL_IMAGE_REF, "host/repo:tag"),
        ("containerd.io/snapshot.ref", "img"),
    ]);
    let err = s.prepare("k1", "", &l).unwrap_err();
    assert!(err.is_already_exists());

    let info = s.stat("img").unwrap();
    assert_eq!(info.kind, Kind::Committed);

    // the descriptor lists the blob; no tar was ever deposited
    let id: i64 = info.labels["Backend-id"].parse().unwrap();
    let layer_dir = root.path().join("snapshots").join(id.to_string());
    let config = read_config(&config_path(&layer_dir)).unwrap();
    let matching: Vec<_> = config
        .lowers
        .iter()
        .filter(|l| l.digest == "sha256:beefbeef")
        .collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].size, 1048576);
    assert_eq!(config.repo_blob_url, "https://host/v2/repo/blobs");
    assert!(!layer_dir.join(TAR_FILE_NAME).exists());
}

#[test]
fn test_skip_fetch_requires_snapshot_ref() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    let l = labels(&[
        (LABEL_BLOB_DIGEST, "sha256:beefbeef"),
        (LABEL_BLOB_SIZE, "1048576"),
        (LABEL_IMAGE_REF, "host/repo:tag"),
    ]);
    let err = s.prepare("k1", "", &l).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    // rolled back: the key is free again
    assert!(s.stat("k1").unwrap_err().is_not_found());
}

/// The turbo variant still fetches; commit converts the deposited tar and
/// the descriptor references the OCI layer digest plus a gzip index.
#[test]
fn test_turbo_layer_converts_on_commit() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    let l = labels(&[
        (LABEL_BLOB_DIGEST, "sha256:beefbeef"),
        (LABEL_BLOB_SIZE, "1048576"),
        (LABEL_IMAGE_REF, "host/repo:tag"),
        (LABEL_TURBO_DIGEST, "sha256:X"),
        (
            LABEL_TURBO_MEDIA_TYPE,
            "application/vnd.oci.image.layer.v1.tar+gzip",
        ),
    ]);

    // no short-circuit for turbo layers
    let mounts = s.prepare("k1", "", &l).unwrap();
    let scratch = PathBuf::from(&mounts[0].source);
    fs::write(scratch.join(TAR_FILE_NAME), b"tar bytes").unwrap();
    s.commit("t1", "k1", &l).unwrap();

    let info = s.stat("t1").unwrap();
    let id: i64 = info.labels["Backend-id"].parse().unwrap();
    let layer_dir = root.path().join("snapshots").join(id.to_string());

    assert!(layer_dir.join("ext4.fs.meta").exists());
    assert!(layer_dir.join("gzip.meta").exists());

    let config = read_config(&config_path(&layer_dir)).unwrap();
    let lower = config.lowers.last().unwrap();
    assert_eq!(lower.target_digest, "sha256:X");
    assert!(!lower.gzip_index.is_empty());
}

#[test]
fn test_remove_committed_with_children_rejected() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    s.prepare("k1", "", &no_labels()).unwrap();
    s.commit("base", "k1", &no_labels()).unwrap();
    s.prepare("k2", "base", &no_labels()).unwrap();

    let err = s.remove("base").unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));
    // the store is unchanged
    assert!(s.stat("base").is_ok());
    assert!(s.stat("k2").is_ok());

    s.remove("k2").unwrap();
    s.remove("base").unwrap();
    assert!(s.stat("base").unwrap_err().is_not_found());
}

#[test]
fn test_remove_unknown_key_is_noop() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());
    s.remove("never-existed").unwrap();
}

#[test]
fn test_sync_remove_deletes_directory() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    s.prepare("k1", "", &no_labels()).unwrap();
    let id: i64 = s.stat("k1").unwrap().labels["Backend-id"].parse().unwrap();
    let dir = root.path().join("snapshots").join(id.to_string());
    assert!(dir.exists());

    s.remove("k1").unwrap();
    assert!(!dir.exists());
}

/// Async removal leaves directories for the next cleanup sweep, which must
/// delete exactly the orphans.
#[test]
fn test_async_remove_and_cleanup() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(
        root.path(),
        SnapshotterConfig::default().asynchronous_remove(),
    );

    s.prepare("k1", "", &no_labels()).unwrap();
    s.commit("base", "k1", &no_labels()).unwrap();
    s.prepare("k2", "base", &no_labels()).unwrap();
    s.prepare("other", "", &no_labels()).unwrap();

    let dir_of = |key: &str| -> PathBuf {
        let id: i64 = s.stat(key).unwrap().labels["Backend-id"].parse().unwrap();
        root.path().join("snapshots").join(id.to_string())
    };
    let removed_dir = dir_of("k2");
    let live_base = dir_of("base");
    let live_other = dir_of("other");

    s.remove("k2").unwrap();
    // the key is gone but the directory lingers until cleanup
    assert!(s.stat("k2").unwrap_err().is_not_found());
    assert!(removed_dir.exists());

    s.cleanup().unwrap();
    assert!(!removed_dir.exists());
    assert!(live_base.exists());
    assert!(live_other.exists());
}

#[test]
fn test_mounts_recovers_prepare_mount() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    s.prepare("k1", "", &no_labels()).unwrap();
    let mounts = s.mounts("k1").unwrap();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].fstype, "bind");
}

#[test]
fn test_walk_and_update() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    s.prepare("k1", "", &no_labels()).unwrap();
    s.commit("base", "k1", &no_labels()).unwrap();
    s.prepare("k2", "base", &no_labels()).unwrap();

    let mut names = Vec::new();
    s.walk(|info| {
        names.push(info.name.clone());
        Ok(())
    })
    .unwrap();
    assert_eq!(names, vec!["base".to_string(), "k2".to_string()]);

    let mut info = s.stat("k2").unwrap();
    info.labels.insert("note".into(), "hello".into());
    let updated = s.update(&info, &["labels.note"]).unwrap();
    assert_eq!(updated.labels.get("note").map(String::as_str), Some("hello"));
    // persisted
    assert_eq!(
        s.stat("k2").unwrap().labels.get("note").map(String::as_str),
        Some("hello")
    );
}

#[test]
fn test_view_mounts() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    s.prepare("k1", "", &no_labels()).unwrap();
    s.commit("base", "k1", &no_labels()).unwrap();
    s.prepare("k2", "base", &no_labels()).unwrap();
    s.commit("l2", "k2", &no_labels()).unwrap();

    // single parent: a read-only bind of the parent's directory
    let mounts = s.view("v1", "base", &no_labels()).unwrap();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].fstype, "bind");
    assert!(mounts[0].options.contains(&"ro".to_string()));
    let base_id: i64 = s.stat("base").unwrap().labels["Backend-id"].parse().unwrap();
    assert_eq!(
        mounts[0].source,
        root.path()
            .join("snapshots")
            .join(base_id.to_string())
            .display()
            .to_string()
    );

    // longer chain: an overlay of only lower dirs, uppermost first
    let mounts = s.view("v2", "l2", &no_labels()).unwrap();
    assert_eq!(mounts[0].fstype, "overlay");
    let lower = mounts[0]
        .options
        .iter()
        .find(|o| o.starts_with("lowerdir="))
        .unwrap();
    let l2_id: i64 = s.stat("l2").unwrap().labels["Backend-id"].parse().unwrap();
    let expected = format!(
        "lowerdir={}:{}",
        root.path().join("snapshots").join(l2_id.to_string()).display(),
        root.path().join("snapshots").join(base_id.to_string()).display()
    );
    assert_eq!(lower, &expected);
    assert!(!mounts[0].options.iter().any(|o| o.starts_with("upperdir=")));

    // views are first-class rows and can be removed
    assert_eq!(s.stat("v1").unwrap().kind, Kind::View);
    s.remove("v1").unwrap();
    s.remove("v2").unwrap();
}

#[test]
fn test_view_rejects_empty_parent() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());
    assert!(matches!(
        s.view("v", "", &no_labels()).unwrap_err(),
        Error::InvalidArgument(_)
    ));
}

#[test]
fn test_stat_synthetic_labels() {
    let root = tempfile::tempdir().unwrap();
    let s = snapshotter(root.path(), SnapshotterConfig::default());

    let mounts = s.prepare("k1", "", &no_labels()).unwrap();
    fs::write(Path::new(&mounts[0].source).join("f"), vec![0u8; 4096]).unwrap();
    s.commit("base", "k1", &no_labels()).unwrap();

    let info = s.stat("base").unwrap();
    assert!(info.labels.contains_key("Backend-id"));
    assert!(info.labels.contains_key("Backend-inode"));
    assert!(info.labels["Backend-size"].ends_with("B"));
    assert!(info.labels["RootPath"].ends_with("/upper"));
}

/// A driver whose active mount is a plain bind of the parent directory:
/// enough to exercise the orchestrator's overlay composition under root
/// without a TCMU-capable kernel.
struct BindDriver;

impl RoDriver for BindDriver {
    fn pre_process(
        &self,
        _key_dir: &Path,
        _parent_dir: Option<&Path>,
        _parent: Option<&str>,
        _labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn active_mount(
        &self,
        _sn_dir: &Path,
        _id: i64,
        parent_dir: Option<&Path>,
        _parent_dirs: &[PathBuf],
    ) -> Result<Vec<Mount>> {
        let parent = parent_dir.expect("active mount needs a parent");
        Ok(vec![Mount {
            source: parent.display().to_string(),
            fstype: "bind".into(),
            options: vec!["rbind".into(), "ro".into()],
        }])
    }

    fn prepare_mount(&self, key_dir: &Path, _parents: &[PathBuf]) -> Result<Vec<Mount>> {
        Ok(vec![Mount {
            source: key_dir.display().to_string(),
            fstype: "bind".into(),
            options: vec!["rbind".into(), "rw".into()],
        }])
    }

    fn get_mount(&self, _key_dir: &Path) -> Result<Vec<Mount>> {
        Ok(Vec::new())
    }

    fn commit(&self, _key_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn cleanup(&self, _id: i64) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_active_composes_overlay() {
    if !rustix::process::getuid().is_root() {
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let s = Snapshotter::with_driver(
        root.path(),
        SnapshotterConfig::default(),
        Box::new(BindDriver),
    )
    .unwrap();

    let mounts = s.prepare("k1", "", &no_labels()).unwrap();
    fs::write(Path::new(&mounts[0].source).join("a"), b"from base").unwrap();
    s.commit("base", "k1", &no_labels()).unwrap();

    let mounts = s.active("run", "base", &no_labels()).unwrap();
    assert_eq!(mounts.len(), 1);
    let m = &mounts[0];
    assert_eq!(m.fstype, "overlay");
    assert_eq!(m.source, "overlay");
    let lower = m
        .options
        .iter()
        .find(|o| o.starts_with("lowerdir="))
        .unwrap();
    let upper = m
        .options
        .iter()
        .find(|o| o.starts_with("upperdir="))
        .unwrap();
    assert!(upper.ends_with("/fs"), "{upper}");
    assert!(m.options.iter().any(|o| o.starts_with("workdir=")));

    // the lower dir was mounted by the snapshotter itself
    let lower_dir = PathBuf::from(lower.trim_start_matches("lowerdir="));
    assert_eq!(fs::read(lower_dir.join("a")).unwrap(), b"from base");

    // the composed view serves the base file
    let dest = root.path().join("dest");
    fs::create_dir(&dest).unwrap();
    mount::mount_all(&mounts, &dest).unwrap();
    let got = fs::read(dest.join("a"));
    let _ = mount::unmount(&dest, rustix::mount::UnmountFlags::DETACH);
    assert_eq!(got.unwrap(), b"from base");

    // mounts() returns the same overlay descriptors for the active layer
    let recovered = s.mounts("run").unwrap();
    assert_eq!(recovered, mounts);

    s.remove("run").unwrap();
}
