//! # sctl-shell
//!
//! Interactive shell on an sctl device. Puts the local terminal in raw mode,
//! spawns a shell (or the given command) on the device's PTY over the sctl
//! WebSocket API, and relays bytes both ways until the remote session ends.
//!
//! ```text
//! sctl-shell [--device NAME] [shell [COMMAND]]
//! ```

use std::fs::OpenOptions;

use clap::Parser;
use tracing::debug;

use sctl_shell::config::{self, Cli};
use sctl_shell::signals::SignalListener;
use sctl_shell::terminal::{self, StdinReader, Tty};
use sctl_shell::{DaemonConnection, Relay, ShellCommand, ShellError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("sctl-shell: cannot open log file: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(&cli).await {
        eprintln!("sctl-shell: shell: {e}");
        std::process::exit(1);
    }
}

/// Logs go to `--log-file` when given: stderr shares the relayed terminal.
fn init_logging(cli: &Cli) -> std::io::Result<()> {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(log_filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(log_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<(), ShellError> {
    let resolved = config::load_config(cli)?;
    let (name, device) = resolved.device(cli.device.as_deref())?;

    // Refuse before anything is spawned on the device.
    let mut tty = Tty::stdin()?;

    let conn = DaemonConnection::connect(name, &device.url, &device.api_key).await?;
    let (_signals, signal_rx) = SignalListener::spawn()?;
    let mut relay = Relay::new(&mut tty, StdinReader::new()?, tokio::io::stdout(), signal_rx);
    let mut shell = ShellCommand::new(&conn, device.default_shell.clone());

    let outcome = shell
        .run(cli.shell_command(), terminal::window_size(), &mut relay)
        .await?;
    debug!(
        "{}: {} bytes sent, {} bytes received",
        outcome.reason, outcome.bytes_sent, outcome.bytes_received
    );
    Ok(())
}
