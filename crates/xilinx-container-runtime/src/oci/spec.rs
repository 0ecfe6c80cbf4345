//! The subset of the OCI runtime spec the shim edits.
//!
//! Only `process.env`, `mounts` and `linux.resources.devices` are typed; every
//! other field is carried through `extra`, so a load/flush round trip keeps
//! every value. Key order is not kept, and empty `env`, `mounts` and
//! `devices` arrays are omitted on write.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// OCI runtime spec (`config.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceCgroup>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entry of `linux.resources.devices`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCgroup {
    pub allow: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

impl Spec {
    /// `KEY=VALUE` pairs from `process.env`; entries without `=` are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.process
            .iter()
            .flat_map(|process| process.env.iter())
            .filter_map(|entry| entry.split_once('='))
    }

    /// Device cgroup entries, creating `linux.resources` when absent.
    pub fn cgroup_devices_mut(&mut self) -> &mut Vec<DeviceCgroup> {
        &mut self
            .linux
            .get_or_insert_with(Linux::default)
            .resources
            .get_or_insert_with(Resources::default)
            .devices
    }

    pub fn cgroup_devices(&self) -> &[DeviceCgroup] {
        self.linux
            .as_ref()
            .and_then(|linux| linux.resources.as_ref())
            .map_or(&[], |resources| resources.devices.as_slice())
    }
}
