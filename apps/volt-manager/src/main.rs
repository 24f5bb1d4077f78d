//! Voltgrid module manager.
//!
//! Loads and validates the configuration graph, connects to the broker,
//! spawns every configured module as a supervised subprocess, coordinates the
//! startup barrier and tears the fleet down when a module dies or a shutdown
//! is requested.

mod barrier;
mod boot;
mod controller;
mod logging;
mod status_fifo;
mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "volt-manager", version, about = "Voltgrid module manager")]
pub struct Cli {
    /// Check and validate all config files, then exit (0 = success)
    #[arg(long)]
    pub check: bool,

    /// Dump the validated main config and all used manifests into this
    /// directory
    #[arg(long, value_name = "DIR")]
    pub dump: Option<PathBuf>,

    /// Dump the manifests of all installed modules into this directory and
    /// exit
    #[arg(long, value_name = "DIR")]
    pub dumpmanifests: Option<PathBuf>,

    /// Installation prefix
    #[arg(long, value_name = "PATH")]
    pub prefix: Option<PathBuf>,

    /// Config file path, or a bare name resolved in the configs directory
    #[arg(long, value_name = "PATH|NAME")]
    pub config: Option<String>,

    /// Module id(s) the operator starts externally; they still take part in
    /// the ready barrier
    #[arg(long, short = 's', value_name = "ID", num_args = 1..)]
    pub standalone: Vec<String>,

    /// Module id(s) to leave out entirely: neither started nor awaited
    #[arg(long, value_name = "ID", num_args = 1..)]
    pub ignore: Vec<String>,

    /// Skip JSON-schema validation of runtime messages
    #[arg(long)]
    pub dontvalidateschema: bool,

    /// Named pipe receiving manager status updates
    #[arg(long = "status-fifo", value_name = "PATH", default_value = "")]
    pub status_fifo: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    match boot::boot(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
