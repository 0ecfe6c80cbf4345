//! Device-aware OCI runtime shim.
//!
//! Sits between a container engine and `runc`: on lifecycle commands it
//! grants the requested Xilinx accelerators to the container by editing the
//! bundle's `config.json`, keeps a host-wide exclusion ledger, and then
//! replaces itself with the real runtime.

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod exclusion;
pub mod factory;
pub mod listing;
pub mod oci;
