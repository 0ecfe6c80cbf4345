use std::env;
use std::io;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;
use utils::logging;
use utils::version;
use xilinx_container_runtime::config::Cli;
use xilinx_container_runtime::config::Commands;
use xilinx_container_runtime::config::Config;
use xilinx_container_runtime::device::group_cards;
use xilinx_container_runtime::device::SysfsScanner;
use xilinx_container_runtime::error::ShimError;
use xilinx_container_runtime::factory::RuntimeBuilder;
use xilinx_container_runtime::listing;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn main() -> ExitCode {
    setup_global_hooks();

    let argv: Vec<String> = env::args().collect();

    let config = match Config::load_default() {
        Ok(config) => config,
        Err(report) => {
            eprintln!("error loading config: {report:#}");
            return ExitCode::FAILURE;
        }
    };

    let dispatch = logging::file_dispatch(&config.runtime.debug);
    tracing::dispatcher::with_default(&dispatch, || {
        tracing::info!("Running {:?}", argv);

        match dispatch_command(&argv, &config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(report) => {
                tracing::error!("Error running {argv:?}: {report:?}");
                eprintln!("Error running {argv:?}: {report:#}");
                ExitCode::FAILURE
            }
        }
    })
}

/// Shim commands are answered here; every other command line belongs to runc.
fn dispatch_command(argv: &[String], config: &Config) -> Result<(), Report<ShimError>> {
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp) => {
            return err.print().change_context(ShimError::List);
        }
        Err(_) => return run(argv, config),
    };

    if cli.version {
        eprintln!("xilinx-container-runtime version {}", &**version::VERSION);
        return Ok(());
    }

    match cli.command {
        None | Some(Commands::Help) => Cli::command()
            .write_long_help(&mut io::stderr())
            .change_context(ShimError::List),
        Some(Commands::ListDevices) => {
            let devices = SysfsScanner::default()
                .scan()
                .change_context(ShimError::List)?;
            listing::write_devices(&mut io::stderr(), &devices)
        }
        Some(Commands::ListCards) => {
            let devices = SysfsScanner::default()
                .scan()
                .change_context(ShimError::List)?;
            listing::write_cards(&mut io::stderr(), &group_cards(&devices))
        }
    }
}

fn run(argv: &[String], config: &Config) -> Result<(), Report<ShimError>> {
    RuntimeBuilder::new(argv, config).build()?.exec(argv)
}
