//! Local signals the relay reacts to.
//!
//! In raw mode the terminal no longer turns Ctrl-C into SIGINT (the byte is
//! forwarded to the remote shell instead), so the signals left are window
//! changes and requests from outside to stop.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::WindowSize;
use crate::terminal;

/// Something the relay has to act on that did not come from the keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSignal {
    /// The local terminal was resized.
    Resize(WindowSize),
    /// SIGTERM or SIGHUP: stop relaying and end the remote process.
    Terminate,
}

/// Listener task feeding a [`LocalSignal`] channel. Stops when dropped.
pub struct SignalListener {
    task: JoinHandle<()>,
}

impl SignalListener {
    /// Register SIGWINCH, SIGTERM and SIGHUP handlers.
    pub fn spawn() -> std::io::Result<(Self, mpsc::Receiver<LocalSignal>)> {
        let mut winch = signal(SignalKind::window_change())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(()) = winch.recv() => match terminal::window_size() {
                        Some(size) => {
                            debug!("window resized to {}x{}", size.cols, size.rows);
                            LocalSignal::Resize(size)
                        }
                        None => continue,
                    },
                    Some(()) = term.recv() => {
                        info!("received SIGTERM");
                        LocalSignal::Terminate
                    }
                    Some(()) = hangup.recv() => {
                        info!("received SIGHUP");
                        LocalSignal::Terminate
                    }
                    else => break,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok((Self { task }, rx))
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
