//! The `shell [command]` command.
//!
//! Resolves which program to run, asks the daemon to spawn it on a PTY,
//! attaches to its byte stream and hands the session to the [`Relay`].
//! Nothing touches the local terminal until the session is open, so a
//! failed spawn leaves the terminal exactly as it was.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::ShellError;
use crate::relay::{Relay, RelayOutcome, RelayState};
use crate::session::WindowSize;
use crate::terminal::TerminalControl;
use crate::transport::Transport;

/// Runs `shell` invocations against one transport.
pub struct ShellCommand<'a, T> {
    transport: &'a T,
    default_shell: Option<String>,
    state: RelayState,
}

impl<'a, T: Transport> ShellCommand<'a, T> {
    /// `default_shell` is used when the command line names no program;
    /// `None` leaves the choice to the daemon (its default login shell).
    pub fn new(transport: &'a T, default_shell: Option<String>) -> Self {
        Self {
            transport,
            default_shell,
            state: RelayState::Idle,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn set_state(&mut self, next: RelayState) {
        debug!("shell: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail<V>(&mut self, err: ShellError) -> Result<V, ShellError> {
        warn!("shell on {} failed: {err}", self.transport.hostname());
        self.set_state(RelayState::Failed);
        Err(err)
    }

    /// Spawn `command` on the daemon and relay it through `relay` until it
    /// ends. `size` is the local window size to start the PTY with.
    pub async fn run<C, I, O>(
        &mut self,
        command: Option<&str>,
        size: Option<WindowSize>,
        relay: &mut Relay<'_, C, I, O>,
    ) -> Result<RelayOutcome, ShellError>
    where
        C: TerminalControl,
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let command = resolve_command(command, self.default_shell.as_deref());

        self.set_state(RelayState::Spawning);
        let token = match self.transport.spawn(command.as_deref(), size).await {
            Ok(token) => token,
            Err(e) => return self.fail(e),
        };
        debug!(
            "spawned {} on {} as {token}",
            command.as_deref().unwrap_or("default shell"),
            self.transport.hostname()
        );

        self.set_state(RelayState::Open);
        let mut session = match self.transport.open(&token).await {
            Ok(session) => session,
            Err(e) => return self.fail(e),
        };

        self.set_state(RelayState::Relaying);
        let outcome = relay.run(&mut session).await;
        self.set_state(RelayState::Closed);
        outcome
    }
}

/// Pick the program to spawn: the explicit argument if it is not blank,
/// then the configured default, then the daemon's own default (`None`).
pub fn resolve_command(explicit: Option<&str>, default_shell: Option<&str>) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .or_else(|| default_shell.map(str::trim).filter(|c| !c.is_empty()))
        .map(String::from)
}
