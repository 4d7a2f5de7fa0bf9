//! Fakes shared by the unit tests.

use std::sync::{Arc, Mutex};

use crate::error::ShellError;
use crate::session::{SessionHandle, SessionToken, ShellSession, WindowSize};
use crate::terminal::TerminalControl;
use crate::transport::Transport;

/// Terminal controller that records what happened to it.
///
/// Snapshots are numbered, so tests can tell which capture was restored.
#[derive(Debug, Default)]
pub struct FakeTerminal {
    pub raw: bool,
    pub entered: u32,
    pub restored: Vec<u32>,
    pub fail_enter: bool,
}

impl TerminalControl for FakeTerminal {
    type Snapshot = u32;

    fn enter_raw_mode(&mut self) -> Result<u32, ShellError> {
        if self.fail_enter {
            return Err(ShellError::Terminal(nix::Error::ENOTTY));
        }
        assert!(!self.raw, "raw mode entered twice without restore");
        self.raw = true;
        self.entered += 1;
        Ok(self.entered)
    }

    fn restore(&mut self, snapshot: &u32) -> Result<(), ShellError> {
        self.raw = false;
        self.restored.push(*snapshot);
        Ok(())
    }
}

/// Transport whose spawned sessions are driven by the test.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<FakeTransportState>>,
}

#[derive(Default)]
struct FakeTransportState {
    spawn_error: Option<String>,
    open_error: Option<String>,
    spawned: Vec<(Option<String>, Option<WindowSize>)>,
    handles: Vec<SessionHandle>,
    next_id: u32,
}

impl FakeTransport {
    /// Make the next spawn fail like a lost connection.
    pub fn fail_spawn(&self, message: &str) {
        self.inner.lock().unwrap().spawn_error = Some(message.to_string());
    }

    /// Make the next open fail, as for a token the daemon no longer knows.
    pub fn fail_open(&self, message: &str) {
        self.inner.lock().unwrap().open_error = Some(message.to_string());
    }

    /// Commands passed to `spawn`, in order.
    pub fn spawned(&self) -> Vec<(Option<String>, Option<WindowSize>)> {
        self.inner.lock().unwrap().spawned.clone()
    }

    /// Wait until a session has been opened and take its handle.
    pub async fn take_handle(&self) -> SessionHandle {
        loop {
            if let Some(handle) = {
                let mut state = self.inner.lock().unwrap();
                (!state.handles.is_empty()).then(|| state.handles.remove(0))
            } {
                return handle;
            }
            tokio::task::yield_now().await;
        }
    }
}

impl Transport for FakeTransport {
    fn hostname(&self) -> &str {
        "fake-device"
    }

    async fn spawn(
        &self,
        command: Option<&str>,
        size: Option<WindowSize>,
    ) -> Result<SessionToken, ShellError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(message) = state.spawn_error.take() {
            return Err(ShellError::Connection(message));
        }
        state.spawned.push((command.map(String::from), size));
        state.next_id += 1;
        Ok(SessionToken::new(format!("T{}", state.next_id)))
    }

    async fn open(&self, token: &SessionToken) -> Result<ShellSession, ShellError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(message) = state.open_error.take() {
            return Err(ShellError::Connection(message));
        }
        let (session, handle) = ShellSession::pair(token.clone());
        state.handles.push(handle);
        Ok(session)
    }
}
