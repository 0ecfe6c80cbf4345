//! File-backed device exclusion ledger.
//!
//! The ledger maps a device bus address to a usage counter: `-1` means the
//! device is held exclusively, `0` means free and a positive value is the
//! number of containers sharing it. Every lifecycle command is its own
//! process, so the counters live in a JSON document and each update is a
//! read-modify-write under an advisory `flock(2)` on a sibling lock file.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::error::ExclusionError;

pub const DEFAULT_EXCLUSION_FILE: &str = "/etc/xilinx-container-runtime/device-exclusion.json";

const EXCLUSIVE: i64 = -1;
const FREE: i64 = 0;

/// How a container holds its devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Exclusive,
    Shared,
}

impl AccessMode {
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            Self::Exclusive
        } else {
            Self::Shared
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    notice: String,
    #[serde(default)]
    devices: BTreeMap<String, i64>,
}

/// Persistent per-device usage counters.
#[derive(Debug)]
pub struct ExclusionLedger {
    path: PathBuf,
    guard: Mutex<()>,
}

impl ExclusionLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that a new container uses `devices`.
    ///
    /// Exclusive access needs every device free and marks it `-1`; shared
    /// access needs no exclusive holder and bumps the counter. All devices are
    /// checked before any counter changes, so a rejected call leaves the
    /// ledger as it was.
    pub fn reserve(&self, devices: &[Device], mode: AccessMode) -> Result<(), Report<ExclusionError>> {
        info!("Updating device exclusions status for {} device(s)", devices.len());
        self.update(|counters| {
            for device in devices {
                let address = &device.bus_address;
                let current = counters.get(address).copied().unwrap_or(FREE);
                match mode {
                    AccessMode::Exclusive if current != FREE => {
                        warn!("Device {address} is being used by another container");
                        return Err(Report::new(ExclusionError::InUse {
                            device: address.clone(),
                        }));
                    }
                    AccessMode::Shared if current == EXCLUSIVE => {
                        warn!("Device {address} is being used exclusively by another container");
                        return Err(Report::new(ExclusionError::InUseExclusively {
                            device: address.clone(),
                        }));
                    }
                    _ => {}
                }
            }

            for device in devices {
                let counter = counters.entry(device.bus_address.clone()).or_insert(FREE);
                match mode {
                    AccessMode::Exclusive => {
                        info!("Device {} will be used exclusively by this container", device.bus_address);
                        *counter = EXCLUSIVE;
                    }
                    AccessMode::Shared => {
                        info!("Device {} will be used by this container", device.bus_address);
                        *counter += 1;
                    }
                }
            }
            Ok(())
        })
    }

    /// Record that a container using `devices` went away.
    ///
    /// A record that does not match `mode` (for example a shared release of a
    /// free device) is left unchanged and logged.
    pub fn release(&self, devices: &[Device], mode: AccessMode) -> Result<(), Report<ExclusionError>> {
        info!("There is {} device(s) used in this container", devices.len());
        self.update(|counters| {
            for device in devices {
                let address = &device.bus_address;
                let current = counters.get(address).copied().unwrap_or(FREE);
                let released = match mode {
                    AccessMode::Exclusive if current == EXCLUSIVE => FREE,
                    AccessMode::Shared if current > FREE => current - 1,
                    _ => {
                        warn!(
                            "Device {address} has exclusion value {current}, not held in {mode:?} mode, leaving it unchanged"
                        );
                        continue;
                    }
                };
                debug!(address = %address, from = current, to = released, "released device");
                counters.insert(address.clone(), released);
            }
            Ok(())
        })
    }

    /// Current counters.
    pub fn snapshot(&self) -> Result<BTreeMap<String, i64>, Report<ExclusionError>> {
        let _local = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = LedgerLock::acquire(&self.lock_path())?;
        self.read()
    }

    fn update(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, i64>) -> Result<(), Report<ExclusionError>>,
    ) -> Result<(), Report<ExclusionError>> {
        let _local = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = LedgerLock::acquire(&self.lock_path())?;

        let mut counters = self.read()?;
        f(&mut counters)?;

        info!("Trying to update device exclusion status to file {}", self.path.display());
        self.write(counters)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    fn read(&self) -> Result<BTreeMap<String, i64>, Report<ExclusionError>> {
        let read_error = || ExclusionError::Read {
            path: self.path.clone(),
        };
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(Report::new(e).change_context(read_error())),
        };
        let document: LedgerDocument =
            serde_json::from_slice(&content).change_context_lazy(read_error)?;

        if let Some((device, &value)) = document.devices.iter().find(|(_, &v)| v < EXCLUSIVE) {
            return Err(Report::new(ExclusionError::Corrupt {
                path: self.path.clone(),
                device: device.clone(),
                value,
            }));
        }
        Ok(document.devices)
    }

    fn write(&self, devices: BTreeMap<String, i64>) -> Result<(), Report<ExclusionError>> {
        let write_error = || ExclusionError::Write {
            path: self.path.clone(),
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let document = LedgerDocument {
            notice: notice(),
            devices,
        };

        let mut file = NamedTempFile::new_in(dir).change_context_lazy(write_error)?;
        serde_json::to_writer_pretty(&mut file, &document).change_context_lazy(write_error)?;
        file.write_all(b"\n").change_context_lazy(write_error)?;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .change_context_lazy(write_error)?;
        file.persist(&self.path).change_context_lazy(write_error)?;
        Ok(())
    }
}

fn notice() -> String {
    let saved = chrono::Local::now().format("%Y-%m-%d %-I:%-M:%-S %P");
    format!(
        "This file stores the status of xilinx devices usage, which was saved on {saved}. \
         '-1' means the device is being used exclusively. 0 or positive integer is the number \
         of containers currently using respective device."
    )
}

/// Exclusive `flock(2)` held until drop.
struct LedgerLock {
    file: File,
}

impl LedgerLock {
    fn acquire(path: &Path) -> Result<Self, Report<ExclusionError>> {
        let lock_error = || ExclusionError::Lock {
            path: path.to_path_buf(),
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .change_context_lazy(lock_error)?;

        loop {
            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Report::new(err).change_context(lock_error()));
            }
        }
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        // SAFETY: see `acquire`; closing the file would release the lock as well.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;

    use super::*;
    use crate::device::tests::device;

    fn ledger(dir: &TempDir) -> ExclusionLedger {
        ExclusionLedger::new(dir.path().join("device-exclusion.json"))
    }

    fn value(ledger: &ExclusionLedger, address: &str) -> Option<i64> {
        ledger.snapshot().unwrap().get(address).copied()
    }

    #[test]
    fn absent_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(ledger(&dir).snapshot().unwrap().is_empty());
    }

    #[test]
    fn exclusive_reserve_and_release() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let devices = vec![device(0, "0000:3b:00.1", "")];

        ledger.reserve(&devices, AccessMode::Exclusive).unwrap();
        assert_eq!(value(&ledger, "0000:3b:00.1"), Some(-1));

        let err = ledger.reserve(&devices, AccessMode::Exclusive).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ExclusionError::InUse { device } if device == "0000:3b:00.1"
        ));
        assert!(err.to_string().contains("0000:3b:00.1"));

        let err = ledger.reserve(&devices, AccessMode::Shared).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ExclusionError::InUseExclusively { .. }
        ));

        ledger.release(&devices, AccessMode::Exclusive).unwrap();
        assert_eq!(value(&ledger, "0000:3b:00.1"), Some(0));
        ledger.reserve(&devices, AccessMode::Exclusive).unwrap();
    }

    #[test]
    fn shared_counts_up_and_down() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let devices = vec![device(0, "0000:3b:00.1", "")];

        for _ in 0..3 {
            ledger.reserve(&devices, AccessMode::Shared).unwrap();
        }
        assert_eq!(value(&ledger, "0000:3b:00.1"), Some(3));

        let err = ledger.reserve(&devices, AccessMode::Exclusive).unwrap_err();
        assert!(matches!(err.current_context(), ExclusionError::InUse { .. }));

        for _ in 0..3 {
            ledger.release(&devices, AccessMode::Shared).unwrap();
        }
        assert_eq!(value(&ledger, "0000:3b:00.1"), Some(0));
    }

    #[test]
    fn rejected_reservation_changes_nothing() {
        // Stricter than a check-as-you-go pass: earlier devices of a rejected
        // request are not left incremented.
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let first = device(0, "0000:3b:00.1", "");
        let second = device(1, "0000:3c:00.1", "");

        ledger
            .reserve(std::slice::from_ref(&second), AccessMode::Exclusive)
            .unwrap();
        let before = ledger.snapshot().unwrap();

        ledger
            .reserve(&[first, second], AccessMode::Shared)
            .unwrap_err();

        assert_eq!(ledger.snapshot().unwrap(), before);
        assert_eq!(value(&ledger, "0000:3b:00.1"), None);
    }

    #[test]
    fn release_does_not_go_below_floor() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let devices = vec![device(0, "0000:3b:00.1", "")];

        ledger.release(&devices, AccessMode::Shared).unwrap();
        assert_eq!(value(&ledger, "0000:3b:00.1"), None);

        ledger.reserve(&devices, AccessMode::Shared).unwrap();
        ledger.release(&devices, AccessMode::Exclusive).unwrap();
        assert_eq!(value(&ledger, "0000:3b:00.1"), Some(1));
    }

    #[test]
    fn document_layout() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        ledger
            .reserve(&[device(0, "0000:3b:00.1", "")], AccessMode::Shared)
            .unwrap();

        let content = fs::read_to_string(ledger.path()).unwrap();
        let document: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(document["notice"]
            .as_str()
            .unwrap()
            .starts_with("This file stores the status of xilinx devices usage"));
        assert_eq!(document["devices"]["0000:3b:00.1"], 1);
        assert!(content.contains("\n  \"devices\": {"));
    }

    #[test]
    fn values_below_exclusive_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        fs::write(
            ledger.path(),
            r#"{"notice": "", "devices": {"0000:3b:00.1": -4}}"#,
        )
        .unwrap();

        let err = ledger
            .reserve(&[device(0, "0000:3b:00.1", "")], AccessMode::Shared)
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ExclusionError::Corrupt { value: -4, .. }
        ));
    }

    #[test]
    fn missing_directory_is_a_lock_error() {
        let dir = TempDir::new().unwrap();
        let ledger = ExclusionLedger::new(dir.path().join("missing").join("ledger.json"));
        let err = ledger
            .reserve(&[device(0, "0000:3b:00.1", "")], AccessMode::Shared)
            .unwrap_err();
        assert!(matches!(err.current_context(), ExclusionError::Lock { .. }));
    }

    #[test]
    fn concurrent_exclusive_reservations_admit_one_container() {
        // Separate ledgers on one file behave like separate shim processes.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device-exclusion.json");
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let ledger = ExclusionLedger::new(path);
                    barrier.wait();
                    ledger
                        .reserve(&[device(0, "0000:3b:00.1", "")], AccessMode::Exclusive)
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(
            ExclusionLedger::new(&path).snapshot().unwrap().get("0000:3b:00.1"),
            Some(&-1)
        );
    }
}
