//! What the relay needs from the RPC layer.
//!
//! The daemon connection is established elsewhere; the `shell` command only
//! needs to spawn a process and attach to its byte stream.

use std::future::Future;

use crate::error::ShellError;
use crate::session::{SessionToken, ShellSession, WindowSize};

/// An established connection to a management daemon.
pub trait Transport {
    /// Name of the daemon endpoint, used in logs and error messages.
    fn hostname(&self) -> &str;

    /// Spawn `command` (`None` = the daemon's default login shell) attached
    /// to a PTY of the given size. Resolves once the daemon answers.
    fn spawn(
        &self,
        command: Option<&str>,
        size: Option<WindowSize>,
    ) -> impl Future<Output = Result<SessionToken, ShellError>> + Send;

    /// Attach the byte stream of a previously spawned process.
    ///
    /// Fails with [`ShellError::Connection`] when the daemon no longer knows
    /// the token or the session is already attached by another relay.
    fn open(
        &self,
        token: &SessionToken,
    ) -> impl Future<Output = Result<ShellSession, ShellError>> + Send;
}
