//! Local terminal control: raw mode, non-blocking keystroke reads, window size.
//!
//! Raw mode is a scoped resource. [`RawModeGuard::acquire`] captures the
//! current line-discipline settings and switches the terminal to raw mode;
//! the settings are put back exactly once, either by
//! [`RawModeGuard::restore`] or by the guard's `Drop` on any other exit path
//! (early return, `?`, panic unwinding).
//!
//! The raw settings use `VMIN = 0` / `VTIME = 0`, so a `read` on stdin never
//! blocks. Readiness comes from the tokio reactor through [`StdinReader`].
//! `O_NONBLOCK` is deliberately left alone: stdin and stdout normally share
//! one open file description, and flipping it would make stdout writes fail
//! with `EAGAIN`.

use std::io;
use std::os::fd::{AsFd, RawFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use nix::errno::Errno;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, SpecialCharacterIndices, Termios};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

use crate::error::ShellError;
use crate::session::WindowSize;

/// Something whose line discipline can be switched to raw mode and back.
pub trait TerminalControl {
    /// Captured settings, handed back to [`TerminalControl::restore`].
    type Snapshot;

    /// Capture the current settings, then enter raw mode.
    fn enter_raw_mode(&mut self) -> Result<Self::Snapshot, ShellError>;

    /// Reapply previously captured settings. Applying the same snapshot
    /// twice must leave the terminal in the same state as applying it once.
    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), ShellError>;
}

/// Terminal settings captured before entering raw mode.
#[derive(Clone)]
pub struct TerminalModeSnapshot {
    termios: Termios,
}

/// The process's controlling terminal, accessed through stdin.
#[derive(Debug)]
pub struct Tty {
    _private: (),
}

impl Tty {
    /// Claim stdin as the relay terminal. Fails if stdin is not a TTY.
    pub fn stdin() -> Result<Self, ShellError> {
        if !is_terminal() {
            return Err(ShellError::NotATerminal);
        }
        Ok(Self { _private: () })
    }
}

impl TerminalControl for Tty {
    type Snapshot = TerminalModeSnapshot;

    fn enter_raw_mode(&mut self) -> Result<TerminalModeSnapshot, ShellError> {
        let stdin = io::stdin();
        let original = tcgetattr(stdin.as_fd())?;

        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(stdin.as_fd(), SetArg::TCSADRAIN, &raw)?;

        Ok(TerminalModeSnapshot { termios: original })
    }

    fn restore(&mut self, snapshot: &TerminalModeSnapshot) -> Result<(), ShellError> {
        tcsetattr(io::stdin().as_fd(), SetArg::TCSADRAIN, &snapshot.termios)?;
        Ok(())
    }
}

/// Raw mode held for the lifetime of the guard.
pub struct RawModeGuard<'a, C: TerminalControl> {
    control: &'a mut C,
    snapshot: Option<C::Snapshot>,
}

impl<'a, C: TerminalControl> RawModeGuard<'a, C> {
    /// Capture the terminal settings and switch to raw mode.
    pub fn acquire(control: &'a mut C) -> Result<Self, ShellError> {
        let snapshot = control.enter_raw_mode()?;
        debug!("terminal switched to raw mode");
        Ok(Self {
            control,
            snapshot: Some(snapshot),
        })
    }

    /// Restore the captured settings now, reporting failure to the caller.
    pub fn restore(mut self) -> Result<(), ShellError> {
        self.restore_once()
    }

    fn restore_once(&mut self) -> Result<(), ShellError> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };
        self.control.restore(&snapshot)?;
        debug!("terminal mode restored");
        Ok(())
    }
}

impl<C: TerminalControl> Drop for RawModeGuard<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.restore_once() {
            warn!("failed to restore terminal mode: {e}");
        }
    }
}

/// Async reader over fd 0, driven by the tokio reactor.
///
/// Only meaningful while the terminal is in the raw mode set up by [`Tty`]
/// (`VMIN = 0`): an empty read is treated as "nothing queued yet", so this
/// reader never reports end-of-file.
pub struct StdinReader {
    fd: AsyncFd<RawFd>,
}

impl StdinReader {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(libc::STDIN_FILENO)?,
        })
    }
}

impl AsyncRead for StdinReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| read_queued(*fd.get_ref(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Read whatever the line discipline has queued. Empty means "would block".
fn read_queued(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match nix::unistd::read(fd, buf) {
            Ok(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Whether stdin is an interactive terminal.
pub fn is_terminal() -> bool {
    nix::unistd::isatty(libc::STDIN_FILENO).unwrap_or(false)
}

/// Current size of the terminal attached to stdout, if any.
pub fn window_size() -> Option<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a single `winsize` struct through the pointer.
    let ret = unsafe {
        libc::ioctl(
            libc::STDOUT_FILENO,
            libc::TIOCGWINSZ,
            std::ptr::addr_of_mut!(ws),
        )
    };
    if ret == -1 || ws.ws_row == 0 || ws.ws_col == 0 {
        return None;
    }
    Some(WindowSize {
        rows: ws.ws_row,
        cols: ws.ws_col,
    })
}
