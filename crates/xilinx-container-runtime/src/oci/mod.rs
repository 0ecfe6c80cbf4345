//! OCI bundle handling: spec model, spec file I/O, mutation and runtime forwarding.

pub mod file;
pub mod mutator;
pub mod runtime;
pub mod spec;

pub use file::SpecFile;
pub use mutator::SpecMutator;
pub use runtime::Runtime;
pub use spec::*;
