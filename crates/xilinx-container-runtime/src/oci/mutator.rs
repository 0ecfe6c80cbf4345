//! Grants selected devices to a container by editing its OCI spec.

use std::path::Path;

use error_stack::Report;
use tracing::debug;
use tracing::info;

use super::spec::DeviceCgroup;
use super::spec::Mount;
use super::spec::Spec;
use crate::device::Device;
use crate::device::DeviceNumbers;
use crate::device::StatDeviceNumbers;
use crate::error::MutationError;

const BIND_OPTIONS: [&str; 4] = ["rw", "nosuid", "noexec", "bind"];

/// Adds bind mounts and device cgroup rules for accelerator devices.
pub struct SpecMutator {
    numbers: Box<dyn DeviceNumbers>,
}

impl Default for SpecMutator {
    fn default() -> Self {
        Self::new(StatDeviceNumbers)
    }
}

impl SpecMutator {
    pub fn new(numbers: impl DeviceNumbers + 'static) -> Self {
        Self {
            numbers: Box::new(numbers),
        }
    }

    /// Grant `devices` in `spec`.
    ///
    /// Re-applying to an already edited spec adds nothing: mounts are keyed by
    /// source and cgroup rules by major/minor.
    pub fn apply(&self, spec: &mut Spec, devices: &[Device]) -> Result<(), Report<MutationError>> {
        if devices.is_empty() {
            info!("There is no device to be mounted");
            return Ok(());
        }
        info!("There is {} device(s) to be mounted", devices.len());

        for device in devices {
            let (major, minor) = self.numbers.major_minor(Path::new(&device.nodes.user))?;

            for node in device.nodes.mounted() {
                if spec.mounts.iter().any(|m| m.source.as_deref() == Some(node)) {
                    debug!(node, "already mounted");
                    continue;
                }
                spec.mounts.push(bind_mount(node));
            }

            let mapped = spec
                .cgroup_devices()
                .iter()
                .any(|rule| rule.major == Some(major) && rule.minor == Some(minor));
            if mapped {
                debug!(major, minor, "device already allowed");
                continue;
            }
            spec.cgroup_devices_mut().push(DeviceCgroup {
                allow: true,
                kind: Some("c".to_string()),
                major: Some(major),
                minor: Some(minor),
                access: Some("rw".to_string()),
            });
            debug!(address = %device.bus_address, major, minor, "allowed device");
        }

        Ok(())
    }
}

fn bind_mount(node: &str) -> Mount {
    Mount {
        destination: node.to_string(),
        kind: Some("none".to_string()),
        source: Some(node.to_string()),
        options: BIND_OPTIONS.iter().map(|o| o.to_string()).collect(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::device::tests::device;

    struct FakeNumbers(HashMap<String, (i64, i64)>);

    impl DeviceNumbers for FakeNumbers {
        fn major_minor(&self, path: &Path) -> Result<(i64, i64), Report<MutationError>> {
            self.0
                .get(path.to_str().unwrap_or_default())
                .copied()
                .ok_or_else(|| {
                    Report::new(MutationError::DeviceNumber {
                        path: path.to_path_buf(),
                    })
                })
        }
    }

    fn mutator() -> SpecMutator {
        SpecMutator::new(FakeNumbers(HashMap::from([
            ("/dev/dri/renderD128".to_string(), (226, 128)),
            ("/dev/dri/renderD129".to_string(), (226, 129)),
        ])))
    }

    #[test]
    fn adds_mounts_and_cgroup_rules() {
        let mut spec = Spec::default();
        let devices = vec![device(0, "0000:3b:00.1", ""), device(1, "0000:3c:00.1", "")];

        mutator().apply(&mut spec, &devices).unwrap();

        assert_eq!(
            spec.mounts
                .iter()
                .map(|m| m.destination.as_str())
                .collect::<Vec<_>>(),
            vec![
                "/dev/dri/renderD128",
                "/dev/xclmgmt1000",
                "/dev/dri/renderD129",
                "/dev/xclmgmt1001"
            ]
        );
        assert_eq!(spec.mounts[0].source.as_deref(), Some("/dev/dri/renderD128"));
        assert_eq!(spec.mounts[0].kind.as_deref(), Some("none"));
        assert_eq!(spec.mounts[0].options, vec!["rw", "nosuid", "noexec", "bind"]);
        assert_eq!(
            spec.cgroup_devices(),
            &[
                DeviceCgroup {
                    allow: true,
                    kind: Some("c".to_string()),
                    major: Some(226),
                    minor: Some(128),
                    access: Some("rw".to_string()),
                },
                DeviceCgroup {
                    allow: true,
                    kind: Some("c".to_string()),
                    major: Some(226),
                    minor: Some(129),
                    access: Some("rw".to_string()),
                },
            ]
        );
    }

    #[test]
    fn applying_twice_is_a_no_op() {
        let mut spec = Spec::default();
        let devices = vec![device(0, "0000:3b:00.1", "")];

        mutator().apply(&mut spec, &devices).unwrap();
        let once = spec.clone();
        mutator().apply(&mut spec, &devices).unwrap();

        assert_eq!(spec, once);
    }

    #[test]
    fn empty_selection_leaves_spec_untouched() {
        let mut spec = Spec::default();
        mutator().apply(&mut spec, &[]).unwrap();
        assert_eq!(spec, Spec::default());
    }

    #[test]
    fn dma_node_is_not_mounted() {
        let mut spec = Spec::default();
        let mut dev = device(0, "0000:3b:00.1", "");
        dev.nodes.mgmt = String::new();
        dev.nodes.dma = "/dev/xfpga/dma.qdma.u15105.0".to_string();

        mutator().apply(&mut spec, &[dev]).unwrap();

        assert_eq!(
            spec.mounts
                .iter()
                .map(|m| m.destination.as_str())
                .collect::<Vec<_>>(),
            vec!["/dev/dri/renderD128"]
        );
        assert_eq!(spec.cgroup_devices().len(), 1);
    }

    #[test]
    fn keeps_existing_rules_for_same_device() {
        let mut spec = Spec::default();
        spec.cgroup_devices_mut().push(DeviceCgroup {
            allow: true,
            kind: Some("c".to_string()),
            major: Some(226),
            minor: Some(128),
            access: Some("rwm".to_string()),
        });

        mutator()
            .apply(&mut spec, &[device(0, "0000:3b:00.1", "")])
            .unwrap();

        assert_eq!(spec.cgroup_devices().len(), 1);
        assert_eq!(spec.cgroup_devices()[0].access.as_deref(), Some("rwm"));
    }

    #[test]
    fn unknown_node_is_an_error() {
        let mut spec = Spec::default();
        let err = mutator()
            .apply(&mut spec, &[device(5, "0000:3b:00.1", "")])
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            MutationError::DeviceNumber { .. }
        ));
        assert!(spec.mounts.is_empty());
    }
}
