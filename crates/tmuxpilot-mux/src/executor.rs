use tokio::process::Command;

use crate::error::MuxError;

/// Async tmux command executor.
///
/// Each call spawns a new `tmux` process via `tokio::process`, so the
/// executor itself holds no persistent child handle and is cheaply cloned.
#[derive(Debug, Clone)]
pub struct TmuxExecutor {
    tmux_bin: String,
}

impl TmuxExecutor {
    /// Create an executor using the default `tmux` binary on `$PATH`.
    pub fn new() -> Self {
        Self {
            tmux_bin: "tmux".into(),
        }
    }

    /// Create an executor using a custom tmux binary path, per the
    /// `TMUX_PATH` configuration knob.
    pub fn with_bin(bin: impl Into<String>) -> Self {
        Self { tmux_bin: bin.into() }
    }

    /// Run a tmux command and return stdout as a `String`.
    ///
    /// Maps a non-zero exit into [`MuxError::MuxCommandFailed`] and a
    /// missing binary into [`MuxError::MuxUnavailable`].
    pub async fn run(&self, args: &[&str]) -> Result<String, MuxError> {
        let output = self.run_raw(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MuxError::MuxCommandFailed(format!(
                "exit {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                stderr.trim(),
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a tmux command without checking the exit status, useful for
    /// commands like `kill-pane` whose failure (pane already gone) is
    /// routine rather than exceptional.
    pub async fn run_unchecked(&self, args: &[&str]) -> Result<std::process::Output, MuxError> {
        self.run_raw(args).await
    }

    async fn run_raw(&self, args: &[&str]) -> Result<std::process::Output, MuxError> {
        Command::new(&self.tmux_bin)
            .args(args)
            .env("TERM", "xterm-256color")
            .env_remove("TMUX")
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MuxError::MuxUnavailable(format!("{} not found on PATH", self.tmux_bin))
                } else {
                    MuxError::Io(e)
                }
            })
    }

    /// The configured binary path, exposed so callers spawning a pty-attached
    /// tmux child (the PTY bridge) invoke the exact same binary.
    pub fn binary(&self) -> &str {
        &self.tmux_bin
    }
}

impl Default for TmuxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_reports_unavailable() {
        let exec = TmuxExecutor::with_bin("/nonexistent/tmux-binary");
        let err = exec.run(&["list-sessions"]).await.unwrap_err();
        assert!(matches!(err, MuxError::MuxUnavailable(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn run_unchecked_returns_output_or_unavailable() {
        let exec = TmuxExecutor::new();
        match exec.run_unchecked(&["list-sessions"]).await {
            Ok(output) => {
                let _ = output.status;
            }
            Err(MuxError::MuxUnavailable(_)) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
}
