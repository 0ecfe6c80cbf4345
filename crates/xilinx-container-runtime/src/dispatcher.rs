//! Lifecycle command dispatch.
//!
//! Classifies the runtime command line and sequences the device work around
//! it: reserve on `create`, spec edit on `create`/`run`/`modify`, release on
//! `delete`, then hand over to the wrapped runtime unless the command was
//! `modify`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

use crate::device::Device;
use crate::device::SysfsScanner;
use crate::device::VisibilityRequest;
use crate::environment::ContainerEnv;
use crate::environment::VISIBLE_CARDS;
use crate::environment::VISIBLE_DEVICES;
use crate::error::RuntimeError;
use crate::error::SelectorError;
use crate::error::ShimError;
use crate::exclusion::AccessMode;
use crate::exclusion::ExclusionLedger;
use crate::oci::Runtime;
use crate::oci::Spec;
use crate::oci::SpecFile;
use crate::oci::SpecMutator;

/// Work a command line asks for. The flags are independent of each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandPlan {
    pub reserve: bool,
    pub modify: bool,
    pub release: bool,
    pub forward: bool,
}

impl CommandPlan {
    pub fn from_args(args: &[String]) -> Self {
        let mut plan = Self {
            forward: true,
            ..Self::default()
        };

        for token in command_tokens(args) {
            match token {
                "create" => {
                    plan.reserve = true;
                    plan.modify = true;
                }
                "run" => plan.modify = true,
                "modify" => {
                    plan.modify = true;
                    plan.forward = false;
                }
                "delete" => plan.release = true,
                _ => {}
            }
        }

        info!(?plan, "classified command line");
        plan
    }
}

/// Whether `arg` is `-b`/`--bundle` without an inline value.
pub fn is_bundle_flag(arg: &str) -> bool {
    if !arg.starts_with('-') {
        return false;
    }
    matches!(arg.trim_start_matches('-'), "b" | "bundle")
}

/// Arguments eligible for command matching: everything except bundle flag values.
pub fn command_tokens(args: &[String]) -> impl Iterator<Item = &str> {
    let mut previous_was_bundle = false;
    args.iter().filter_map(move |arg| {
        if previous_was_bundle {
            previous_was_bundle = false;
            return None;
        }
        if is_bundle_flag(arg) {
            previous_was_bundle = true;
            return None;
        }
        Some(arg.as_str())
    })
}

/// Bundle directory given with `--bundle`/`-b`, in either `flag value` or
/// `flag=value` form. The last occurrence wins.
pub fn bundle_dir(args: &[String]) -> Result<Option<PathBuf>, Report<RuntimeError>> {
    let mut bundle = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (arg.as_str(), None),
        };
        if !is_bundle_flag(flag) {
            continue;
        }
        let value = match inline {
            Some(value) => value,
            None => iter
                .next()
                .ok_or_else(|| Report::new(RuntimeError::MissingBundle))?,
        };
        bundle = Some(PathBuf::from(value));
    }
    Ok(bundle)
}

#[derive(Debug)]
struct Selection {
    devices: Vec<Device>,
    mode: AccessMode,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            mode: AccessMode::Shared,
        }
    }
}

/// Runtime shim that grants accelerator devices before handing over to the
/// wrapped runtime.
pub struct ContainerRuntime {
    runtime: Box<dyn Runtime>,
    spec: Mutex<SpecFile>,
    scanner: SysfsScanner,
    mutator: SpecMutator,
    ledger: ExclusionLedger,
    default_exclusive: bool,
    process_env: HashMap<String, String>,
}

impl ContainerRuntime {
    pub fn new(runtime: impl Runtime + 'static, spec: SpecFile, ledger: ExclusionLedger) -> Self {
        Self {
            runtime: Box::new(runtime),
            spec: Mutex::new(spec),
            scanner: SysfsScanner::default(),
            mutator: SpecMutator::default(),
            ledger,
            default_exclusive: false,
            process_env: HashMap::new(),
        }
    }

    pub fn with_scanner(mut self, scanner: SysfsScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_mutator(mut self, mutator: SpecMutator) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn with_default_exclusive(mut self, exclusive: bool) -> Self {
        self.default_exclusive = exclusive;
        self
    }

    /// Environment consulted when the spec does not set a selector variable.
    pub fn with_process_env(mut self, env: HashMap<String, String>) -> Self {
        self.process_env = env;
        self
    }

    pub fn ledger(&self) -> &ExclusionLedger {
        &self.ledger
    }

    /// Handle one runtime command line.
    ///
    /// The spec is loaded and devices are discovered at most once, before the
    /// first phase that needs them.
    pub fn exec(&self, args: &[String]) -> Result<(), Report<ShimError>> {
        let mut spec_file = self.spec.lock().unwrap_or_else(PoisonError::into_inner);
        let plan = CommandPlan::from_args(args);

        let selection = if plan.reserve || plan.modify || plan.release {
            let spec = spec_file
                .load()
                .change_context_lazy(|| self.phase_error(plan))?;
            self.select(spec)
                .change_context_lazy(|| self.phase_error(plan))?
        } else {
            Selection::default()
        };

        if plan.reserve && !selection.devices.is_empty() {
            self.ledger
                .reserve(&selection.devices, selection.mode)
                .change_context_lazy(|| self.phase_error(plan))?;
        }

        if plan.modify {
            if selection.devices.is_empty() {
                info!("There is no device to be mounted");
            } else {
                spec_file
                    .modify(|spec| self.mutator.apply(spec, &selection.devices))
                    .change_context(ShimError::Modify)?;
                spec_file.flush().change_context(ShimError::Modify)?;
            }
        }

        if plan.release {
            if selection.devices.is_empty() {
                info!("There is no device used in this container");
            } else {
                self.ledger
                    .release(&selection.devices, selection.mode)
                    .change_context(ShimError::Release {
                        path: self.ledger.path().to_path_buf(),
                    })?;
            }
        }

        if !plan.forward {
            info!("No forwarding required");
            return Ok(());
        }
        info!("Forwarding command to underlying runtime");
        self.runtime.exec(args).change_context(ShimError::Forward)
    }

    /// Error reported for a failure in the earliest planned phase.
    fn phase_error(&self, plan: CommandPlan) -> ShimError {
        let path = self.ledger.path().to_path_buf();
        if plan.reserve {
            ShimError::Reserve { path }
        } else if plan.modify {
            ShimError::Modify
        } else {
            ShimError::Release { path }
        }
    }

    fn select(&self, spec: &Spec) -> Result<Selection, Report<SelectorError>> {
        let env = ContainerEnv::new(spec, &self.process_env);
        let mode = AccessMode::from_exclusive(env.exclusive_or(self.default_exclusive));

        let request =
            VisibilityRequest::from_env(env.get(VISIBLE_DEVICES), env.get(VISIBLE_CARDS))?;
        let Some(request) = request else {
            info!("Environment variable {VISIBLE_DEVICES} and {VISIBLE_CARDS} is not specified");
            return Ok(Selection {
                mode,
                ..Selection::default()
            });
        };

        let all = self
            .scanner
            .scan()
            .change_context(SelectorError::Discovery)?;
        let devices = request.resolve(&all)?;
        info!(?request, ?mode, "selected {} device(s)", devices.len());
        Ok(Selection { devices, mode })
    }
}
