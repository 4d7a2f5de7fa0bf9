//! Remote shell session handle.
//!
//! A [`ShellSession`] is the relay's view of one process spawned on the
//! daemon. Instead of data/close callbacks it exposes a single ordered event
//! channel: zero or more [`SessionEvent::Data`] chunks followed by exactly one
//! [`SessionEvent::Closed`]. Outbound traffic (keystrokes, resizes, close
//! requests) travels the other way as [`SessionCommand`]s.
//!
//! The transport side of the pair is a [`SessionHandle`]. Dropping the
//! handle without sending `Closed` is reported to the relay as
//! [`CloseReason::TransportLost`].

use std::fmt;

use tokio::sync::mpsc;

/// Opaque session identifier returned by the spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote process exited.
    Exited { code: Option<i32> },
    /// The daemon closed or destroyed the session (`killed`, `idle_timeout`, ...).
    Closed { reason: String },
    /// The daemon reported an error for this session.
    Error { message: String },
    /// The connection to the daemon went away.
    TransportLost,
    /// The relay was asked to stop by a local signal.
    LocalTerminate,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exited { code: Some(code) } => write!(f, "process exited with code {code}"),
            CloseReason::Exited { code: None } => f.write_str("process exited"),
            CloseReason::Closed { reason } => write!(f, "session closed ({reason})"),
            CloseReason::Error { message } => write!(f, "session error: {message}"),
            CloseReason::TransportLost => f.write_str("connection to daemon lost"),
            CloseReason::LocalTerminate => f.write_str("terminated locally"),
        }
    }
}

/// Event delivered from the remote side, in the order the daemon produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Data(Vec<u8>),
    Closed(CloseReason),
}

/// Request from the relay to the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Input(Vec<u8>),
    Resize(WindowSize),
    Close,
}

/// Transport-side end of a session.
#[derive(Debug)]
pub struct SessionHandle {
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
}

/// One remote shell process, as seen by the relay.
#[derive(Debug)]
pub struct ShellSession {
    token: SessionToken,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    closed: bool,
}

impl ShellSession {
    /// Create a session and the handle the transport drives it with.
    pub fn pair(token: SessionToken) -> (ShellSession, SessionHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (
            ShellSession {
                token,
                events: event_rx,
                commands: command_tx,
                closed: false,
            },
            SessionHandle {
                events: event_tx,
                commands: command_rx,
            },
        )
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for the next event.
    ///
    /// Returns `Closed` exactly once; after that the future never resolves,
    /// which keeps it usable as a `select!` arm.
    pub async fn next_event(&mut self) -> SessionEvent {
        if self.closed {
            return std::future::pending().await;
        }
        let event = self
            .events
            .recv()
            .await
            .unwrap_or(SessionEvent::Closed(CloseReason::TransportLost));
        if matches!(event, SessionEvent::Closed(_)) {
            self.closed = true;
        }
        event
    }

    /// Send raw bytes to the remote process's input. Best-effort: a broken
    /// transport shows up as a later `Closed` event, never as an error here.
    pub fn write(&self, bytes: &[u8]) {
        if self.closed || bytes.is_empty() {
            return;
        }
        let _ = self.commands.send(SessionCommand::Input(bytes.to_vec()));
    }

    /// Propagate a local window size change.
    pub fn resize(&self, size: WindowSize) {
        if !self.closed {
            let _ = self.commands.send(SessionCommand::Resize(size));
        }
    }

    /// Ask the daemon to terminate the remote process.
    pub fn close(&self) {
        if !self.closed {
            let _ = self.commands.send(SessionCommand::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order_and_close_once() {
        let (mut session, handle) = ShellSession::pair(SessionToken::new("T1"));
        handle.events.send(SessionEvent::Data(b"a".to_vec())).unwrap();
        handle.events.send(SessionEvent::Data(b"b".to_vec())).unwrap();
        handle
            .events
            .send(SessionEvent::Closed(CloseReason::Exited { code: Some(0) }))
            .unwrap();

        assert_eq!(session.next_event().await, SessionEvent::Data(b"a".to_vec()));
        assert_eq!(session.next_event().await, SessionEvent::Data(b"b".to_vec()));
        assert_eq!(
            session.next_event().await,
            SessionEvent::Closed(CloseReason::Exited { code: Some(0) })
        );
        assert!(session.is_closed());

        let again = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            session.next_event(),
        )
        .await;
        assert!(again.is_err(), "no event may follow Closed");
    }

    #[tokio::test]
    async fn dropped_handle_reports_transport_lost() {
        let (mut session, handle) = ShellSession::pair(SessionToken::new("T1"));
        drop(handle);
        assert_eq!(
            session.next_event().await,
            SessionEvent::Closed(CloseReason::TransportLost)
        );
    }

    #[tokio::test]
    async fn writes_after_close_are_dropped() {
        let (mut session, mut handle) = ShellSession::pair(SessionToken::new("T1"));
        session.write(b"x");
        handle
            .events
            .send(SessionEvent::Closed(CloseReason::TransportLost))
            .unwrap();
        session.next_event().await;
        session.write(b"y");
        session.close();

        assert_eq!(
            handle.commands.recv().await,
            Some(SessionCommand::Input(b"x".to_vec()))
        );
        assert!(handle.commands.try_recv().is_err());
    }

    #[test]
    fn empty_write_sends_nothing() {
        let (session, mut handle) = ShellSession::pair(SessionToken::new("T1"));
        session.write(b"");
        assert!(handle.commands.try_recv().is_err());
    }

    #[test]
    fn close_reason_messages() {
        assert_eq!(
            CloseReason::Exited { code: Some(3) }.to_string(),
            "process exited with code 3"
        );
        assert_eq!(
            CloseReason::Closed { reason: "killed".into() }.to_string(),
            "session closed (killed)"
        );
    }
}
