//! Loop device setup for the quota provider's backing image.
//!
//! Attaches a regular file to a free `/dev/loopN` node through the
//! `LOOP_CTL_GET_FREE` and `LOOP_CONFIGURE` ioctls, without shelling out to
//! losetup. The devices are configured with autoclear so the kernel
//! detaches them once the last user (the mount) goes away.

#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::io::{Error, Result};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;

use rustix::ioctl::{ioctl, opcode, Opcode, Setter};

/// Flags for loop device configuration.
pub mod flags {
    /// Read-only loop device.
    pub const LO_FLAGS_READ_ONLY: u32 = 1;
    /// Automatically detach on last close.
    pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
    /// Use direct I/O.
    pub const LO_FLAGS_DIRECT_IO: u32 = 16;
}

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
#[derive(Default)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    // Default is only derivable up to [u8; 32], so split the name fields
    lo_file_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_crypt_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_crypt_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

// LOOP_CTL_GET_FREE returns its result in the syscall return value instead
// of through the argument, which rustix has no ready-made pattern for.
struct LoopCtlGetFree;

unsafe impl rustix::ioctl::Ioctl for LoopCtlGetFree {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: rustix::ioctl::IoctlOutput,
        _ptr: *mut std::ffi::c_void,
    ) -> rustix::io::Result<std::ffi::c_int> {
        Ok(out)
    }
}

const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
const LOOP_CONFIGURE: Opcode = opcode::write::<LoopConfig>(0x4C, 0x0A);

/// A loop device attached to a backing file.
#[derive(Debug)]
pub struct LoopDevice {
    number: i32,
    _fd: OwnedFd,
}

impl LoopDevice {
    /// The device node path, e.g. `/dev/loop3`.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/loop{}", self.number))
    }

    /// The bare device name, e.g. `loop3`.
    pub fn name(&self) -> String {
        format!("loop{}", self.number)
    }
}

/// Attach `file` to a free loop device.
///
/// The device autoclears: once the mount that uses it is gone and the last
/// fd is closed, the kernel detaches it on its own.
pub fn attach(file: impl AsFd, lo_flags: u32) -> Result<LoopDevice> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")?;

    let free: i32 = unsafe { ioctl(&control, LoopCtlGetFree) }.map_err(Error::other)?;
    if free < 0 {
        return Err(Error::other("no free loop device"));
    }

    let loop_path = format!("/dev/loop{free}");
    let loop_dev = OpenOptions::new().read(true).write(true).open(&loop_path)?;

    let config = LoopConfig {
        fd: file.as_fd().as_raw_fd() as u32,
        block_size: 4096,
        info: LoopInfo64 {
            lo_flags,
            ..Default::default()
        },
        reserved: [0; 8],
    };

    unsafe {
        ioctl(
            &loop_dev,
            Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config),
        )
        .map_err(Error::other)?;
    }

    Ok(LoopDevice {
        number: free,
        _fd: loop_dev.into(),
    })
}
