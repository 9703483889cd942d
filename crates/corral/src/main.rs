//! Corral CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use corral::cli::{Cli, LogFormat};
use corral::exec::init::{INIT_ARG, run_init_stage};

fn main() -> Result<()> {
    // The init stage owns the container's stdio; it must not touch the
    // launcher's error reporting or logging.
    if std::env::args_os().nth(1).is_some_and(|arg| arg == INIT_ARG) {
        run_init_stage();
    }

    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let directive = if cli.debug { "corral=debug" } else { "corral=info" };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    // Execute command
    let code = cli.execute()?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
