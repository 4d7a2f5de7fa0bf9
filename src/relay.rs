//! The relay loop: local terminal ⇄ remote shell session.
//!
//! While the relay runs the terminal is in raw mode and three sources are
//! multiplexed with `select!`:
//!
//! - session events: output chunks are written to the local terminal and
//!   flushed right away; `Closed` ends the loop,
//! - local input: whatever bytes are available are forwarded as one write,
//!   in the order they were read,
//! - local signals: window changes are propagated, SIGTERM/SIGHUP kill the
//!   remote process and end the loop.
//!
//! Nothing here polls. A remote close wakes the loop as soon as the
//! transport reports it, even while the user is idle.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ShellError;
use crate::session::{CloseReason, SessionEvent, ShellSession};
use crate::signals::LocalSignal;
use crate::terminal::{RawModeGuard, TerminalControl};

const INPUT_BUFFER: usize = 4096;

/// Phases of one `shell` invocation.
///
/// Raw mode is held only in [`RelayState::Relaying`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Spawning,
    Open,
    Relaying,
    Closed,
    /// Spawn or open failed; the terminal was never touched.
    Failed,
}

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub reason: CloseReason,
    /// Bytes forwarded from the local terminal to the session.
    pub bytes_sent: u64,
    /// Bytes written to the local terminal.
    pub bytes_received: u64,
}

/// Couples a terminal, its input and output streams, and a signal feed.
pub struct Relay<'a, C, I, O> {
    terminal: &'a mut C,
    input: I,
    output: O,
    signals: mpsc::Receiver<LocalSignal>,
}

impl<'a, C, I, O> Relay<'a, C, I, O>
where
    C: TerminalControl,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    pub fn new(
        terminal: &'a mut C,
        input: I,
        output: O,
        signals: mpsc::Receiver<LocalSignal>,
    ) -> Self {
        Self {
            terminal,
            input,
            output,
            signals,
        }
    }

    /// Relay until the session closes or a terminate signal arrives.
    ///
    /// The terminal is switched to raw mode on entry and restored before
    /// this returns, on every path. A terminate signal already queued when
    /// this is called ends the session without touching the terminal. Local I/O errors are returned after the
    /// restore; a remote failure is a [`CloseReason`], not an error.
    pub async fn run(&mut self, session: &mut ShellSession) -> Result<RelayOutcome, ShellError> {
        let Relay {
            terminal,
            input,
            output,
            signals,
        } = self;

        // Signals that arrived while the session was being spawned.
        while let Ok(signal) = signals.try_recv() {
            match signal {
                LocalSignal::Resize(size) => session.resize(size),
                LocalSignal::Terminate => {
                    session.close();
                    info!("session {} terminated before relaying", session.token());
                    return Ok(RelayOutcome {
                        reason: CloseReason::LocalTerminate,
                        bytes_sent: 0,
                        bytes_received: 0,
                    });
                }
            }
        }

        let guard = RawModeGuard::acquire(&mut **terminal)?;
        debug!("relaying session {}", session.token());

        let mut buf = [0u8; INPUT_BUFFER];
        let mut input_open = true;
        let mut bytes_sent = 0u64;
        let mut bytes_received = 0u64;

        let reason = loop {
            tokio::select! {
                event = session.next_event() => match event {
                    SessionEvent::Data(bytes) => {
                        output.write_all(&bytes).await?;
                        output.flush().await?;
                        bytes_received += bytes.len() as u64;
                    }
                    SessionEvent::Closed(reason) => break reason,
                },
                read = input.read(&mut buf), if input_open => match read? {
                    0 => {
                        // Keep relaying output: the remote side decides when we are done.
                        debug!("local input closed");
                        input_open = false;
                    }
                    n => {
                        session.write(&buf[..n]);
                        bytes_sent += n as u64;
                    }
                },
                Some(signal) = signals.recv() => match signal {
                    LocalSignal::Resize(size) => session.resize(size),
                    LocalSignal::Terminate => {
                        session.close();
                        break CloseReason::LocalTerminate;
                    }
                },
            }
        };

        guard.restore()?;
        info!("session {} ended: {reason}", session.token());
        Ok(RelayOutcome {
            reason,
            bytes_sent,
            bytes_received,
        })
    }
}
