//! Container environment lookups.

use std::collections::HashMap;

use crate::oci::Spec;

pub const VISIBLE_DEVICES: &str = "XILINX_VISIBLE_DEVICES";
pub const VISIBLE_CARDS: &str = "XILINX_VISIBLE_CARDS";
pub const DEVICE_EXCLUSIVE: &str = "XILINX_DEVICE_EXCLUSIVE";

/// Variables visible to one container: the spec's `process.env` layered over
/// the shim's own environment.
#[derive(Debug)]
pub struct ContainerEnv<'a> {
    spec_env: HashMap<&'a str, &'a str>,
    process_env: &'a HashMap<String, String>,
}

impl<'a> ContainerEnv<'a> {
    pub fn new(spec: &'a Spec, process_env: &'a HashMap<String, String>) -> Self {
        Self {
            spec_env: spec.env_pairs().collect(),
            process_env,
        }
    }

    /// Non-empty value of `key`, preferring the spec.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.spec_env
            .get(key)
            .copied()
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.process_env
                    .get(key)
                    .map(String::as_str)
                    .filter(|value| !value.is_empty())
            })
    }

    /// Exclusivity requested by the container, `default` when unset or invalid.
    pub fn exclusive_or(&self, default: bool) -> bool {
        let Some(value) = self.get(DEVICE_EXCLUSIVE) else {
            return default;
        };
        match parse_bool(value) {
            Some(exclusive) => exclusive,
            None => {
                tracing::warn!(
                    "error getting device exclusive enable status from {DEVICE_EXCLUSIVE}={value}, using {default}"
                );
                default
            }
        }
    }
}

/// Boolean spellings accepted for flag variables.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::oci::Process;

    fn spec_with_env(env: &[&str]) -> Spec {
        Spec {
            process: Some(Process {
                env: env.iter().map(|e| e.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn spec_env_wins_over_process_env() {
        let spec = spec_with_env(&["XILINX_VISIBLE_DEVICES=1", "XILINX_VISIBLE_CARDS="]);
        let process_env = HashMap::from([
            (VISIBLE_DEVICES.to_string(), "0".to_string()),
            (VISIBLE_CARDS.to_string(), "all".to_string()),
        ]);
        let env = ContainerEnv::new(&spec, &process_env);

        assert_eq!(env.get(VISIBLE_DEVICES), Some("1"));
        assert_eq!(env.get(VISIBLE_CARDS), Some("all"));
        assert_eq!(env.get(DEVICE_EXCLUSIVE), None);
    }

    #[test]
    fn exclusive_flag_falls_back_to_default() {
        let process_env = HashMap::new();

        let spec = spec_with_env(&["XILINX_DEVICE_EXCLUSIVE=TRUE"]);
        assert!(ContainerEnv::new(&spec, &process_env).exclusive_or(false));

        let spec = spec_with_env(&["XILINX_DEVICE_EXCLUSIVE=0"]);
        assert!(!ContainerEnv::new(&spec, &process_env).exclusive_or(true));

        let spec = spec_with_env(&["XILINX_DEVICE_EXCLUSIVE=maybe"]);
        assert!(ContainerEnv::new(&spec, &process_env).exclusive_or(true));

        let spec = Spec::default();
        assert!(!ContainerEnv::new(&spec, &process_env).exclusive_or(false));
    }

    #[test]
    fn parse_bool_vocabulary() {
        for value in ["1", "t", "T", "true", "TRUE", "True"] {
            assert_eq!(parse_bool(value), Some(true), "{value}");
        }
        for value in ["0", "f", "F", "false", "FALSE"] {
            assert_eq!(parse_bool(value), Some(false), "{value}");
        }
        assert_eq!(parse_bool("yes"), None);
    }
}
