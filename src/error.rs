//! Error type shared by every layer of the shell relay.

/// Errors surfaced by the `shell` command.
///
/// A remote session ending (process exit, kill, lost connection) is **not**
/// an error: it is reported through [`crate::session::CloseReason`]. Only
/// failures that prevent the relay from starting, or local faults while it
/// runs, end up here.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// The transport could not reach the daemon or attach to a session.
    #[error("connection error: {0}")]
    Connection(String),
    /// The daemon rejected a request.
    #[error("daemon error ({code}): {message}")]
    Daemon { code: String, message: String },
    /// The daemon sent something we could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Standard input is not an interactive terminal.
    #[error("standard input is not a terminal")]
    NotATerminal,
    /// A termios call failed.
    #[error("terminal error: {0}")]
    Terminal(#[from] nix::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// Build a [`ShellError::Daemon`] from an sctl `error` message.
    pub fn from_daemon_message(msg: &serde_json::Value) -> Self {
        ShellError::Daemon {
            code: msg["code"].as_str().unwrap_or("UNKNOWN").to_string(),
            message: msg["message"]
                .as_str()
                .unwrap_or("request rejected")
                .to_string(),
        }
    }
}
