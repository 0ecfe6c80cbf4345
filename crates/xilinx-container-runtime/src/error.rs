//! Error types shared across the runtime shim.
//!
//! Every fallible operation returns an [`error_stack::Report`] over one of these
//! contexts; callers add their own context with `change_context`.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while walking sysfs for accelerator devices.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Can't read folder {}", path.display())]
    ReadDir { path: PathBuf },
    #[error("Can't read file {}", path.display())]
    ReadFile { path: PathBuf },
    #[error("Malformed PCI bus address `{address}`")]
    InvalidBusAddress { address: String },
    #[error("No render node found for user function {address}")]
    MissingUserNode { address: String },
}

/// Errors raised while resolving a visibility request.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("only int numbers allowed for env {env}, got `{token}`")]
    InvalidCardToken { env: &'static str, token: String },
    #[error("card number {index} not existed, {count} card(s) found")]
    CardNotFound { index: usize, count: usize },
    #[error("error getting xilinx devices")]
    Discovery,
}

/// Errors raised while editing an OCI spec.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("error getting device major and minor numbers for {}", path.display())]
    DeviceNumber { path: PathBuf },
}

/// Errors raised by the device exclusion ledger.
#[derive(Debug, Error)]
pub enum ExclusionError {
    #[error("Device {device} is being used by another container")]
    InUse { device: String },
    #[error("Device {device} is being used exclusively by another container")]
    InUseExclusively { device: String },
    #[error("Device exclusion file {} holds invalid value {value} for {device}", path.display())]
    Corrupt {
        path: PathBuf,
        device: String,
        value: i64,
    },
    #[error("error reading device exclusions from file {}", path.display())]
    Read { path: PathBuf },
    #[error("error writing device exclusions to file {}", path.display())]
    Write { path: PathBuf },
    #[error("error locking device exclusion file {}", path.display())]
    Lock { path: PathBuf },
}

/// Errors raised while loading or writing `config.json`.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("error loading OCI specification {}", path.display())]
    Load { path: PathBuf },
    #[error("error writing modified OCI specification {}", path.display())]
    Flush { path: PathBuf },
    #[error("OCI specification was not loaded")]
    NotLoaded,
    #[error("error adding Xilinx devices in OCI Spec")]
    Modify,
}

/// Errors raised while handing the command over to the wrapped runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("error finding runtime binary, tried {candidates:?}")]
    NotFound { candidates: Vec<&'static str> },
    #[error("error executing {}", path.display())]
    Exec { path: PathBuf },
    #[error("bundle option requires an argument")]
    MissingBundle,
    #[error("error determining working directory")]
    WorkingDir,
}

/// Errors surfaced by the lifecycle dispatcher.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("Fail to update device exclusion status. Please refer to file {} for details", path.display())]
    Reserve { path: PathBuf },
    #[error("Fail to modify OCI spec")]
    Modify,
    #[error("Fail to delete device exclusion status. Please refer to file {} for details", path.display())]
    Release { path: PathBuf },
    #[error("Fail to forward command to underlying runtime")]
    Forward,
    #[error("error creating runtime")]
    Setup,
    #[error("error listing devices")]
    List,
}

/// Errors raised while reading the TOML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file {}", path.display())]
    Read { path: PathBuf },
    #[error("error parsing config file {}", path.display())]
    Parse { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn conflict_messages_name_the_device() {
        let err = ExclusionError::InUse {
            device: "0000:3b:00.1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Device 0000:3b:00.1 is being used by another container"
        );

        let err = ShimError::Reserve {
            path: PathBuf::from("/etc/xilinx-container-runtime/device-exclusion.json"),
        };
        assert!(err
            .to_string()
            .ends_with("/etc/xilinx-container-runtime/device-exclusion.json for details"));
    }
}
