//! Major/minor lookup for device nodes.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;

use crate::error::MutationError;

/// Resolves a device node path to its `(major, minor)` pair.
pub trait DeviceNumbers: Send + Sync {
    fn major_minor(&self, path: &Path) -> Result<(i64, i64), Report<MutationError>>;
}

/// Reads `st_rdev` of the node with `stat(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatDeviceNumbers;

impl DeviceNumbers for StatDeviceNumbers {
    fn major_minor(&self, path: &Path) -> Result<(i64, i64), Report<MutationError>> {
        let metadata = fs::metadata(path).change_context_lazy(|| MutationError::DeviceNumber {
            path: path.to_path_buf(),
        })?;
        Ok(split_device_number(metadata.rdev()))
    }
}

/// Split a raw `dev_t` the way glibc's `major()`/`minor()` do.
pub fn split_device_number(rdev: u64) -> (i64, i64) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as i64, minor as i64)
}
