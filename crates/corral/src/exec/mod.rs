//! Process execution.
//!
//! Everything between "a container exists" and "its process has exited":
//! stdio wiring, the init handshake, and signal forwarding.

pub mod activation;
pub mod bootstrap;
pub mod init;
pub mod notify;
pub mod process;
pub mod pty;
pub mod signals;
pub mod stdio;

pub use bootstrap::bootstrap;
pub use init::{InitConfig, InitMessage, InitRoutine, StandardInit, run_init_stage};
pub use notify::NotifySocket;
pub use process::{Process, exit_code_from_raw};
pub use pty::PtyPair;
pub use signals::SignalForwarder;
pub use stdio::{Tty, setup_io};
