//! `config.json` load / modify / flush.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Context;
use error_stack::Report;
use error_stack::ResultExt;

use super::spec::Spec;
use crate::error::SpecError;

pub const SPEC_FILE_NAME: &str = "config.json";

/// OCI spec backed by a file in the bundle directory.
#[derive(Debug)]
pub struct SpecFile {
    path: PathBuf,
    spec: Option<Spec>,
}

impl SpecFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            spec: None,
        }
    }

    /// Spec file of a bundle directory.
    pub fn in_bundle(bundle_dir: &Path) -> Self {
        Self::new(bundle_dir.join(SPEC_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file, replacing any previously loaded content.
    pub fn load(&mut self) -> Result<&mut Spec, Report<SpecError>> {
        let load_error = || SpecError::Load {
            path: self.path.clone(),
        };
        let content = fs::read(&self.path).change_context_lazy(load_error)?;
        let spec: Spec = serde_json::from_slice(&content).change_context_lazy(load_error)?;
        Ok(self.spec.insert(spec))
    }

    /// Run `f` on the loaded spec.
    pub fn modify<T, C: Context>(
        &mut self,
        f: impl FnOnce(&mut Spec) -> Result<T, Report<C>>,
    ) -> Result<T, Report<SpecError>> {
        let spec = self
            .spec
            .as_mut()
            .ok_or_else(|| Report::new(SpecError::NotLoaded))?;
        f(spec).change_context(SpecError::Modify)
    }

    /// Write the loaded spec back to its file.
    pub fn flush(&self) -> Result<(), Report<SpecError>> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| Report::new(SpecError::NotLoaded))?;
        let flush_error = || SpecError::Flush {
            path: self.path.clone(),
        };
        let content = serde_json::to_vec(spec).change_context_lazy(flush_error)?;
        fs::write(&self.path, content).change_context_lazy(flush_error)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::error::MutationError;
    use crate::oci::Mount;

    #[test]
    fn load_modify_flush() {
        let bundle = TempDir::new().unwrap();
        fs::write(
            bundle.path().join(SPEC_FILE_NAME),
            r#"{"ociVersion":"1.0.2","hostname":"box"}"#,
        )
        .unwrap();

        let mut file = SpecFile::in_bundle(bundle.path());
        file.load().unwrap();
        file.modify(|spec| {
            spec.mounts.push(Mount {
                destination: "/dev/dri/renderD128".to_string(),
                ..Default::default()
            });
            Ok::<_, Report<MutationError>>(())
        })
        .unwrap();
        file.flush().unwrap();

        let mut reloaded = SpecFile::in_bundle(bundle.path());
        let spec = reloaded.load().unwrap();
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.extra["hostname"], "box");
    }

    #[test]
    fn modify_before_load_fails() {
        let mut file = SpecFile::new("/nonexistent/config.json");
        let err = file
            .modify(|_| Ok::<_, Report<MutationError>>(()))
            .unwrap_err();
        assert!(matches!(err.current_context(), SpecError::NotLoaded));
        assert!(file.flush().is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let mut file = SpecFile::new("/nonexistent/config.json");
        let err = file.load().unwrap_err();
        assert!(matches!(
            err.current_context(),
            SpecError::Load { path } if path == Path::new("/nonexistent/config.json")
        ));
    }
}
