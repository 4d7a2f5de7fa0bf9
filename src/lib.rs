#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! sctl-shell library: the building blocks of the interactive `shell` command.
//!
//! - `config`: CLI arguments and device configuration
//! - `terminal`: raw-mode control of the local terminal
//! - `signals`: local window-change and terminate signals
//! - `session`: one remote shell process as an ordered event stream
//! - `transport`: what the relay needs from a daemon connection
//! - `websocket`: that transport over the sctl WebSocket API
//! - `relay`: the local ⇄ remote byte pump
//! - `command`: `shell [command]`: spawn, open, relay

pub mod command;
pub mod config;
pub mod error;
pub mod relay;
pub mod session;
pub mod signals;
pub mod terminal;
pub mod transport;
pub mod websocket;

#[cfg(test)]
mod test_utils;

pub use command::ShellCommand;
pub use error::ShellError;
pub use relay::{Relay, RelayOutcome};
pub use session::{CloseReason, ShellSession};
pub use transport::Transport;
pub use websocket::DaemonConnection;
