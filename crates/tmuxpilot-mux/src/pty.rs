use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::MuxError;

/// Chunk size used when forwarding PTY output into the async world.
const READ_CHUNK: usize = 4096;

/// Whether this host can open a native pty at all. Checked once by callers
/// surfacing `PtyUnavailable` rather than failing every attach attempt with
/// a less specific error.
pub fn native_pty_available() -> bool {
    native_pty_system()
        .openpty(PtySize {
            rows: 1,
            cols: 1,
            pixel_width: 0,
            pixel_height: 0,
        })
        .is_ok()
}

/// A genuinely interactive PTY, distinct from the read-only pane tap: input
/// typed here reaches the child's stdin as if from a real terminal, and a
/// resize actually reflows the child's rendering.
///
/// tmux's own `pipe-pane` only tees output to a FIFO; it cannot carry
/// keystrokes back in or report a size change, so sessions that need a true
/// bidirectional attach (e.g. a web terminal) go through this instead.
pub struct PtyBridge {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

impl PtyBridge {
    /// Spawn `program args..` inside a new pty of `rows x cols`. Returns the
    /// bridge plus a channel that yields raw output chunks as they arrive;
    /// reading happens on a blocking thread since the underlying OS pty is
    /// a synchronous file descriptor.
    pub fn spawn(
        program: &str,
        args: &[&str],
        rows: u16,
        cols: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>, JoinHandle<()>), MuxError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::MuxUnavailable(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MuxError::MuxCommandFailed(e.to_string()))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MuxError::Io(std::io::Error::other(e.to_string())))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MuxError::Io(std::io::Error::other(e.to_string())))?;

        let (tx, rx) = mpsc::channel(64);
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok((
            Self {
                master: pair.master,
                child,
                writer,
            },
            rx,
            reader_task,
        ))
    }

    /// Write bytes to the child's stdin as if typed at the terminal.
    pub fn write(&mut self, data: &[u8]) -> Result<(), MuxError> {
        self.writer.write_all(data).map_err(MuxError::Io)?;
        self.writer.flush().map_err(MuxError::Io)
    }

    /// Reflow the pty to a new terminal size.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), MuxError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::Io(std::io::Error::other(e.to_string())))
    }

    /// Non-blocking check for child exit; `None` means still running.
    pub fn try_wait(&mut self) -> Result<Option<i32>, MuxError> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.exit_code() as i32)),
            Ok(None) => Ok(None),
            Err(e) => Err(MuxError::Io(e)),
        }
    }

    /// Forcibly terminate the child process.
    pub fn kill(&mut self) -> Result<(), MuxError> {
        self.child.kill().map_err(MuxError::Io)
    }
}
