//! Fixed locations and sysfs naming for the overlaybd driver.
//!
//! The derived names must match the converter binaries bit for bit: both
//! sides compute the TCMU target directory, the loopback WWN and the LUN
//! link from the same layer id.

use std::path::PathBuf;

/// Installation root of the overlaybd distribution.
pub const ROOT: &str = "/opt/overlaybd";

/// The user-space block backstore service.
pub const SERVICE_BINARY: &str = "/opt/overlaybd/bin/overlaybd";

/// Creates the sparse upper data/index pair for a writable layer.
pub const CREATE_BINARY: &str = "/opt/overlaybd/bin/overlaybd-create";

/// Converts a deposited `layer.tar` into ext4 fs-meta and gzip index.
pub const CONVERTER_BINARY: &str = "/opt/overlaybd/convert/bin/turboOCI-apply";

/// Stacks parent `layer.tar.meta` files into one merged device meta.
pub const MERGE_CONVERTER_BINARY: &str = "/opt/overlaybd/convert/bin/overlaybd-convert-acs";

/// Shared base layer seeding every lower chain without a parent.
pub const BASE_LAYER_DIR: &str = "/opt/overlaybd/baselayers";

/// The committed artifact inside [`BASE_LAYER_DIR`].
pub const BASE_LAYER: &str = "/opt/overlaybd/baselayers/.commit";

/// System-wide TCMU HBA number, fixed by convention.
const HBA_NUM: u64 = 999_999_999;

/// NAA prefix of loopback WWNs, fixed by convention.
const NAA_PREFIX: u64 = 199;

/// TCMU data area size written to the target's control file, in MiB.
pub const MAX_DATA_AREA_MB: u32 = 4;

/// The configfs directory of the TCMU target backing a layer.
pub fn target_path(id: i64) -> PathBuf {
    PathBuf::from(format!(
        "/sys/kernel/config/target/core/user_{HBA_NUM}/dev_{id}"
    ))
}

/// The loopback WWN for a layer: `naa.199` followed by the id zero-padded
/// to 13 digits.
pub fn loopback_device_id(id: i64) -> String {
    format!("naa.{NAA_PREFIX}{id:013}")
}

/// The configfs directory of the SCSI loopback node.
pub fn loopback_device_path(wwn: &str) -> PathBuf {
    PathBuf::from(format!("/sys/kernel/config/target/loopback/{wwn}"))
}

/// The LUN directory below the loopback node's first TPGT.
pub fn loopback_lun_path(wwn: &str) -> PathBuf {
    PathBuf::from(format!(
        "/sys/kernel/config/target/loopback/{wwn}/tpgt_1/lun/lun_0"
    ))
}

/// Where the kernel exposes the block device for a scanned SCSI address.
pub fn scsi_block_device_path(device_number: &str) -> PathBuf {
    PathBuf::from(format!(
        "/sys/class/scsi_device/{device_number}:0/device/block"
    ))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_target_path() {
        assert_eq!(
            target_path(42),
            PathBuf::from("/sys/kernel/config/target/core/user_999999999/dev_42")
        );
    }

    #[test]
    fn test_loopback_wwn_padding() {
        assert_eq!(loopback_device_id(128), "naa.1990000000000128");
        assert_eq!(loopback_device_id(1), "naa.1990000000000001");
        assert_eq!(loopback_device_id(9_999_999_999_999), "naa.1999999999999999");
    }

    #[test]
    fn test_loopback_paths() {
        let wwn = loopback_device_id(7);
        assert_eq!(
            loopback_device_path(&wwn),
            PathBuf::from("/sys/kernel/config/target/loopback/naa.1990000000000007")
        );
        assert_eq!(
            loopback_lun_path(&wwn),
            PathBuf::from(
                "/sys/kernel/config/target/loopback/naa.1990000000000007/tpgt_1/lun/lun_0"
            )
        );
    }

    #[test]
    fn test_scsi_block_device_path() {
        assert_eq!(
            scsi_block_device_path("2:0:1"),
            PathBuf::from("/sys/class/scsi_device/2:0:1:0/device/block")
        );
    }
}
