//! The on-disk layer-stack descriptor, `config.v1.json`.
//!
//! Every layer backed by the block driver carries one of these: the
//! ordered list of lower layers it stacks on, an optional writable upper,
//! and where the backstore service reports attach results. The document is
//! consumed by the service and the converter binaries, so the field names
//! and omission rules are a fixed wire format.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::overlaybd::paths::BASE_LAYER_DIR;
use crate::overlaybd::{
    LABEL_IMAGE_REF, LABEL_TURBO_DIGEST, LABEL_TURBO_MEDIA_TYPE,
};
use crate::reference::Reference;
use crate::util;

/// Descriptor file name inside a layer directory.
pub const CONFIG_FILE: &str = "config.v1.json";

/// Gzip index produced by the turbo converter.
pub const GZIP_INDEX_FILE: &str = "gzip.meta";

/// Read-only ext4 image metadata of a committed layer.
pub const EXT4_FS_META_FILE: &str = "ext4.fs.meta";

/// Sparse upper data file of an active layer.
pub const DATA_FILE: &str = ".data_file";

/// Sparse upper index file of an active layer.
pub const INDEX_FILE: &str = ".data_index";

/// Attach readiness file: a single `success` line, or an error string.
pub const INIT_DEBUG_LOG: &str = "init-debug.log";

const MEDIA_TYPE_OCI_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const MEDIA_TYPE_DOCKER_TAR_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// One lower layer in the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowerConfig {
    /// Local file holding the layer's block image or fs meta.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    /// Content digest of the remote blob.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    /// Byte size of the remote blob.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    /// The layer directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_blob_url: String,
    /// Digest of the referenced OCI layer (turbo variant only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_file: String,
    /// Gzip seek index (turbo variant only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gzip_index: String,
}

/// The writable upper of an active layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpperConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

/// The layer-stack descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObdConfig {
    #[serde(default)]
    pub image_ref: String,
    #[serde(default)]
    pub repo_blob_url: String,
    #[serde(default)]
    pub lowers: Vec<LowerConfig>,
    #[serde(default)]
    pub upper: UpperConfig,
    #[serde(default)]
    pub result_file: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub acceleration_layer: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record_trace_path: String,
    #[serde(default)]
    pub proxy: String,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Path of the descriptor inside a layer directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Path of the attach readiness file inside a layer directory.
pub fn init_debug_log_path(dir: &Path) -> PathBuf {
    dir.join(INIT_DEBUG_LOG)
}

/// Commit the descriptor to `target` with a crash-safe write.
pub fn write_config(config: &ObdConfig, target: &Path) -> Result<()> {
    let data = serde_json::to_vec(config)?;
    util::atomic_write(target, &data, 0o600)
}

/// Read a descriptor back.
pub fn read_config(target: &Path) -> Result<ObdConfig> {
    let data = std::fs::read(target).map_err(|e| {
        Error::Internal(format!("failed to read config {}: {e}", target.display()))
    })?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::Internal(format!("failed to unmarshal config: {e}")))
}

fn image_blob_url(labels: &BTreeMap<String, String>) -> Result<(String, String)> {
    let image_ref = labels
        .get(LABEL_IMAGE_REF)
        .ok_or_else(|| Error::InvalidArgument("no image-ref label".into()))?;
    let parsed = Reference::parse(image_ref)?;
    Ok((image_ref.clone(), parsed.blob_url_prefix()))
}

fn is_gzip_layer(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_TAR_GZIP || media_type == MEDIA_TYPE_DOCKER_TAR_GZIP
}

/// Write the plain descriptor for a remote block-image layer.
///
/// Inherits the parent's lower chain, or seeds it with the shared base
/// layer when there is no parent, and appends this layer's blob reference.
pub fn write_plain_config(
    parent: Option<&str>,
    labels: &BTreeMap<String, String>,
    sn_dir: &Path,
    parent_dir: Option<&Path>,
    blob_digest: &str,
    blob_size: &str,
) -> Result<()> {
    let mut config = ObdConfig {
        result_file: path_str(&init_debug_log_path(sn_dir)),
        ..Default::default()
    };

    let (image_ref, blob_url) = image_blob_url(labels)?;
    config.repo_blob_url = blob_url;
    match parent {
        None => config.lowers.push(LowerConfig {
            dir: BASE_LAYER_DIR.to_string(),
            ..Default::default()
        }),
        Some(_) => {
            let parent_dir = parent_dir.ok_or_else(|| {
                Error::Internal("parent directory not resolved".into())
            })?;
            let parent_config = read_config(&config_path(parent_dir))?;
            config.lowers = parent_config.lowers;
        }
    }
    config.image_ref = image_ref;

    config.lowers.push(LowerConfig {
        digest: blob_digest.to_string(),
        size: blob_size.parse().unwrap_or(0),
        dir: path_str(sn_dir),
        ..Default::default()
    });

    write_config(&config, &config_path(sn_dir))
}

/// Write the turbo descriptor for a layer that will be fetched and
/// converted locally.
pub fn write_turbo_config(
    parent: Option<&str>,
    labels: &BTreeMap<String, String>,
    sn_dir: &Path,
    parent_dir: Option<&Path>,
) -> Result<()> {
    let mut config = ObdConfig {
        result_file: path_str(&init_debug_log_path(sn_dir)),
        ..Default::default()
    };

    match parent {
        Some(_) => {
            let parent_dir = parent_dir.ok_or_else(|| {
                Error::Internal("parent directory not resolved".into())
            })?;
            let parent_config = read_config(&config_path(parent_dir))?;
            config.repo_blob_url = parent_config.repo_blob_url;
            config.lowers = parent_config.lowers;
        }
        None => {
            let (image_ref, blob_url) = image_blob_url(labels)?;
            config.image_ref = image_ref;
            config.repo_blob_url = blob_url;
        }
    }

    let mut lower = LowerConfig {
        dir: path_str(sn_dir),
        file: path_str(&sn_dir.join(EXT4_FS_META_FILE)),
        target_digest: labels
            .get(LABEL_TURBO_DIGEST)
            .cloned()
            .unwrap_or_default(),
        ..Default::default()
    };
    if labels
        .get(LABEL_TURBO_MEDIA_TYPE)
        .is_some_and(|m| is_gzip_layer(m))
    {
        lower.gzip_index = path_str(&sn_dir.join(GZIP_INDEX_FILE));
    }
    debug!(parent = ?parent, lower = ?lower, "generating turbo config");
    config.lowers.push(lower);

    write_config(&config, &config_path(sn_dir))
}

/// Write the writable descriptor for an active layer: the parent's chain
/// plus this layer's sparse upper.
pub fn write_writable_config(dir: &Path, parent_dir: &Path) -> Result<()> {
    let parent_config = read_config(&config_path(parent_dir))?;
    let config = ObdConfig {
        result_file: path_str(&init_debug_log_path(dir)),
        repo_blob_url: parent_config.repo_blob_url,
        lowers: parent_config.lowers,
        upper: UpperConfig {
            index: path_str(&dir.join(INDEX_FILE)),
            data: path_str(&dir.join(DATA_FILE)),
        },
        ..Default::default()
    };
    write_config(&config, &config_path(dir))
}
