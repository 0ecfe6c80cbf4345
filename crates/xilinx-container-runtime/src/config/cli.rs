use clap::Parser;
use clap::Subcommand;
use utils::version;

/// Runtime shim that exposes Xilinx accelerator devices to OCI containers.
///
/// Any command line that is not one of the commands below is handed to the
/// wrapped runtime (`docker-runc` or `runc`).
#[derive(Debug, Parser)]
#[command(
    name = "xilinx-container-runtime",
    about,
    long_about,
    version = &**version::VERSION,
    disable_version_flag = true,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[arg(short = 'v', long, help = "Print the version")]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List Xilinx devices in the host
    #[command(name = "lsdevice")]
    ListDevices,
    /// List Xilinx cards in the host
    #[command(name = "lscard")]
    ListCards,
    /// Show this message
    #[command(alias = "h")]
    Help,
}
