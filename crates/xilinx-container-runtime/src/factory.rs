//! Wires a [`ContainerRuntime`] from the command line and the shim config.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

use crate::config::Config;
use crate::dispatcher::bundle_dir;
use crate::dispatcher::ContainerRuntime;
use crate::error::RuntimeError;
use crate::error::ShimError;
use crate::exclusion::ExclusionLedger;
use crate::oci::file::SPEC_FILE_NAME;
use crate::oci::runtime::SyscallExecRuntime;
use crate::oci::SpecFile;

/// Runtime builder
pub struct RuntimeBuilder<'a> {
    args: &'a [String],
    config: &'a Config,
}

impl<'a> RuntimeBuilder<'a> {
    pub fn new(args: &'a [String], config: &'a Config) -> Self {
        Self { args, config }
    }

    /// Build a runtime forwarding to the `runc` found on `PATH`.
    pub fn build(self) -> Result<ContainerRuntime, Report<ShimError>> {
        info!("Building runtime for {:?}", self.args);

        let cwd = env::current_dir()
            .change_context(RuntimeError::WorkingDir)
            .change_context(ShimError::Setup)?;
        let spec_path = spec_path(self.args, &cwd).change_context(ShimError::Setup)?;
        info!(spec = %spec_path.display(), "using OCI specification");

        let runtime = SyscallExecRuntime::from_path_env().change_context(ShimError::Setup)?;
        info!(runtime = %runtime.path().display(), "found underlying runtime");

        let ledger = ExclusionLedger::new(&self.config.device_exclusion.exclusion_file_path);

        Ok(ContainerRuntime::new(runtime, SpecFile::new(spec_path), ledger)
            .with_default_exclusive(self.config.device_exclusion.enabled)
            .with_process_env(process_env()))
    }
}

/// The shim's environment, without variables whose name or value is not UTF-8.
pub fn process_env() -> HashMap<String, String> {
    env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// `config.json` inside the bundle named on the command line, or inside `cwd`.
pub fn spec_path(args: &[String], cwd: &Path) -> Result<PathBuf, Report<RuntimeError>> {
    let bundle = bundle_dir(args)?.unwrap_or_else(|| cwd.to_path_buf());
    Ok(bundle.join(SPEC_FILE_NAME))
}
