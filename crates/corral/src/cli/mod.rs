//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use corral_common::{CorralError, CorralResult};
use corral_oci::Spec;

use crate::orchestrator::{StartOptions, ensure_privileged, start_container};
use crate::runtime::{Factory, RuntimeConfig};

/// Corral - single-container process lifecycle runtime
#[derive(Parser)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for container state
    #[arg(
        long,
        global = true,
        env = "CORRAL_ROOT",
        default_value = "/run/corral"
    )]
    pub root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Diagnostic log formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Runtime commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create and run a container, waiting for its process unless detached
    Start {
        /// Container ID
        container_id: String,

        /// Path to the bundle
        #[arg(short, long, default_value = ".")]
        bundle: PathBuf,

        /// Terminal device to use as the process's console
        #[arg(long)]
        console: Option<PathBuf>,

        /// Detach from the container process
        #[arg(short, long)]
        detach: bool,

        /// Path to write the process's pid to
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// Query container state
    State {
        /// Container ID
        container_id: String,
    },

    /// Send a signal to a running container
    Kill {
        /// Container ID
        container_id: String,

        /// Signal name or number
        #[arg(default_value = "SIGTERM")]
        signal: String,
    },

    /// Delete a container and everything it holds
    Delete {
        /// Container ID
        container_id: String,
    },
}

impl Cli {
    /// Execute the CLI command and return the process exit code.
    pub fn execute(self) -> Result<i32> {
        let config = RuntimeConfig::default().with_root(self.root.clone());
        let factory = Factory::new(config);

        match self.command {
            Commands::Start {
                container_id,
                bundle,
                console,
                detach,
                pid_file,
            } => {
                ensure_privileged()?;

                // Relative paths in the bundle resolve against its directory
                std::env::set_current_dir(&bundle)
                    .map_err(|e| eyre!("Failed to enter bundle {}: {}", bundle.display(), e))?;
                let bundle = std::env::current_dir()?;
                let spec = Spec::load(&bundle)
                    .map_err(|e| eyre!("Failed to load bundle: {}", e))?;

                let options = StartOptions {
                    id: container_id,
                    console,
                    detach,
                    pid_file,
                };
                let code = start_container(&factory, &spec, &bundle, &options)?;
                Ok(code)
            }

            Commands::State { container_id } => {
                let container = factory
                    .load(&container_id)
                    .map_err(|e| eyre!("Failed to load container: {}", e))?;

                let json = serde_json::to_string_pretty(container.state())?;
                println!("{json}");
                Ok(0)
            }

            Commands::Kill {
                container_id,
                signal,
            } => {
                let sig = parse_signal(&signal)?;
                let container = factory
                    .load(&container_id)
                    .map_err(|e| eyre!("Failed to load container: {}", e))?;

                container
                    .signal(sig)
                    .map_err(|e| eyre!("Failed to kill container: {}", e))?;
                Ok(0)
            }

            Commands::Delete { container_id } => {
                let mut container = factory
                    .load(&container_id)
                    .map_err(|e| eyre!("Failed to load container: {}", e))?;

                container
                    .destroy()
                    .map_err(|e| eyre!("Failed to delete container: {}", e))?;
                Ok(0)
            }
        }
    }
}

const SIGNALS: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("ABRT", libc::SIGABRT),
    ("KILL", libc::SIGKILL),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("PIPE", libc::SIGPIPE),
    ("ALRM", libc::SIGALRM),
    ("TERM", libc::SIGTERM),
    ("CHLD", libc::SIGCHLD),
    ("CONT", libc::SIGCONT),
    ("STOP", libc::SIGSTOP),
    ("TSTP", libc::SIGTSTP),
    ("TTIN", libc::SIGTTIN),
    ("TTOU", libc::SIGTTOU),
    ("WINCH", libc::SIGWINCH),
];

/// Parse `SIGTERM`, `TERM` or `15`.
pub fn parse_signal(signal: &str) -> CorralResult<i32> {
    if let Ok(n) = signal.parse::<i32>() {
        if (1..=64).contains(&n) {
            return Ok(n);
        }
    } else {
        let upper = signal.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        if let Some((_, n)) = SIGNALS.iter().find(|(known, _)| *known == name) {
            return Ok(*n);
        }
    }
    Err(CorralError::InvalidArgument {
        message: format!("unknown signal {signal:?}"),
    })
}
