pub mod control_mode;
pub mod error;
pub mod executor;
pub mod pty;

pub use error::MuxError;
pub use executor::TmuxExecutor;
pub use pty::{native_pty_available, PtyBridge};

/// tmux list-panes format string.
///
/// Fields are separated by `\t` (tab) in the following order:
///   session_name, window_id, window_name, pane_id,
///   current_command, pane_title, pane_width, pane_height, pane_active
///
/// Tab is chosen over `:` because pane titles may contain colons.
const LIST_PANES_FMT: &str = concat!(
    "#{session_name}\t",
    "#{window_id}\t",
    "#{window_name}\t",
    "#{pane_id}\t",
    "#{pane_current_command}\t",
    "#{pane_title}\t",
    "#{pane_width}\t",
    "#{pane_height}\t",
    "#{pane_active}",
);

const EXPECTED_FIELDS: usize = 9;

/// Every real tmux pane id begins with this sentinel. A pane id that doesn't
/// (e.g. one supplied by an external hook payload before a real pane exists)
/// is a placeholder the supervisor must reject rather than pass to tmux.
pub const PANE_ID_SENTINEL: char = '%';

/// Whether `pane_id` has the shape of a real tmux pane id rather than an
/// externally-supplied placeholder.
pub fn is_real_pane_id(pane_id: &str) -> bool {
    pane_id.starts_with(PANE_ID_SENTINEL)
}

/// One row of `tmux list-panes -a`, mapped onto a [`tmuxpilot_core::Session`]
/// by pane id when a session claims that pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub session_name: String,
    pub window_id: String,
    pub window_name: String,
    pub pane_id: String,
    pub current_cmd: String,
    pub pane_title: String,
    pub width: u16,
    pub height: u16,
    pub is_active: bool,
}

/// Adapter over a live `tmux` server, covering every multiplexer operation
/// the supervisor needs: topology discovery, output capture, pane lifecycle,
/// and keystroke injection.
#[derive(Debug, Clone)]
pub struct TmuxAdapter {
    executor: TmuxExecutor,
}

impl TmuxAdapter {
    /// Create an adapter using the default `tmux` binary on `$PATH`.
    pub fn new() -> Self {
        Self {
            executor: TmuxExecutor::new(),
        }
    }

    /// Create an adapter with a custom executor, e.g. one pointed at the
    /// `TMUX_PATH` configuration knob.
    pub fn with_executor(executor: TmuxExecutor) -> Self {
        Self { executor }
    }

    /// List every pane across every session on the server.
    pub async fn list_panes(&self) -> Result<Vec<PaneInfo>, MuxError> {
        let stdout = self
            .executor
            .run(&["list-panes", "-a", "-F", LIST_PANES_FMT])
            .await?;
        parse_list_panes_output(&stdout)
    }

    /// Capture the full visible scrollback of a pane.
    pub async fn capture_pane(&self, pane_id: &str) -> Result<String, MuxError> {
        self.executor
            .run(&["capture-pane", "-t", pane_id, "-p"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))
    }

    /// Capture only the last `lines` rows of a pane's history.
    pub async fn capture_pane_tail(&self, pane_id: &str, lines: usize) -> Result<String, MuxError> {
        let start = format!("-{lines}");
        self.executor
            .run(&["capture-pane", "-t", pane_id, "-p", "-S", &start])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))
    }

    /// Bring a pane into focus.
    pub async fn select_pane(&self, pane_id: &str) -> Result<(), MuxError> {
        self.executor
            .run(&["select-pane", "-t", pane_id])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    /// Inject literal keystrokes into a pane, optionally followed by Enter.
    pub async fn send_keys(&self, pane_id: &str, keys: &str, press_enter: bool) -> Result<(), MuxError> {
        self.executor
            .run(&["send-keys", "-t", pane_id, "-l", keys])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        if press_enter {
            self.executor
                .run(&["send-keys", "-t", pane_id, "Enter"])
                .await
                .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        }
        Ok(())
    }

    /// Create a new window in `session` and return its new pane id.
    pub async fn new_window(
        &self,
        session: &str,
        name: &str,
        command: Option<&str>,
    ) -> Result<String, MuxError> {
        let mut args = vec!["new-window", "-t", session, "-n", name, "-P", "-F", "#{pane_id}"];
        if let Some(cmd) = command {
            args.push(cmd);
        }
        let stdout = self.executor.run(&args).await?;
        Ok(stdout.trim().to_string())
    }

    /// Split `pane_id` and return the id of the newly created pane.
    pub async fn split_pane(&self, pane_id: &str, command: Option<&str>) -> Result<String, MuxError> {
        let mut args = vec!["split-window", "-t", pane_id, "-P", "-F", "#{pane_id}"];
        if let Some(cmd) = command {
            args.push(cmd);
        }
        let stdout = self
            .executor
            .run(&args)
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(stdout.trim().to_string())
    }

    /// Terminate a pane. Not an error if the pane is already gone.
    pub async fn kill_pane(&self, pane_id: &str) -> Result<(), MuxError> {
        let _ = self.executor.run_unchecked(&["kill-pane", "-t", pane_id]).await?;
        Ok(())
    }

    pub async fn rename_window(&self, window_id: &str, name: &str) -> Result<(), MuxError> {
        self.executor.run(&["rename-window", "-t", window_id, name]).await?;
        Ok(())
    }

    pub async fn session_exists(&self, session: &str) -> Result<bool, MuxError> {
        let output = self
            .executor
            .run_unchecked(&["has-session", "-t", session])
            .await?;
        Ok(output.status.success())
    }

    /// Create a pane running `command` in `cwd`, optionally inside an
    /// existing `window`. Returns the new pane's id.
    ///
    /// A window is created when none is given so the pane lands in a fresh
    /// tab rather than splitting whatever is currently on screen.
    pub async fn create_pane(
        &self,
        session: &str,
        cwd: &str,
        command: &str,
        window: Option<&str>,
    ) -> Result<String, MuxError> {
        let target = match window {
            Some(w) => format!("{session}:{w}"),
            None => session.to_string(),
        };
        let stdout = self
            .executor
            .run(&[
                "new-window", "-t", &target, "-c", cwd, "-P", "-F", "#{pane_id}", command,
            ])
            .await?;
        Ok(stdout.trim().to_string())
    }

    /// Terminate a pane's process with Ctrl-C without killing the pane.
    pub async fn send_interrupt(&self, pane_id: &str) -> Result<(), MuxError> {
        self.executor
            .run(&["send-keys", "-t", pane_id, "C-c"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    /// Type `text` into a pane followed by Enter.
    pub async fn send_text(&self, pane_id: &str, text: &str) -> Result<(), MuxError> {
        self.send_keys(pane_id, text, true).await
    }

    /// Send raw key bytes (already hex-encoded by the caller's protocol
    /// layer) with no trailing Enter, for keystrokes that are not literal
    /// text (arrow keys, control sequences).
    pub async fn send_raw_keys(&self, pane_id: &str, hex_encoded: &str) -> Result<(), MuxError> {
        self.executor
            .run(&["send-keys", "-t", pane_id, "-H", hex_encoded])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    /// Capture a pane's scrollback, optionally stripping ANSI/SGR sequences.
    pub async fn capture_pane_opts(
        &self,
        pane_id: &str,
        lines: usize,
        strip_ansi: bool,
    ) -> Result<String, MuxError> {
        let start = format!("-{lines}");
        let mut args = vec!["capture-pane", "-t", pane_id, "-p", "-S", &start];
        if strip_ansi {
            // tmux's capture-pane has no strip flag; -e keeps escapes, so
            // the default (no -e) already yields plain text.
        } else {
            args.push("-e");
        }
        self.executor
            .run(&args)
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))
    }

    /// Whether a pane id still exists on the server.
    pub async fn is_pane_alive(&self, pane_id: &str) -> Result<bool, MuxError> {
        match self.get_pane(pane_id).await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(MuxError::PaneNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Look up a single pane's pid/session/title, `None` if it no longer
    /// exists.
    pub async fn get_pane(&self, pane_id: &str) -> Result<Option<PaneMeta>, MuxError> {
        let stdout = match self
            .executor
            .run(&[
                "display-message", "-p", "-t", pane_id, "-F",
                "#{pane_pid}\t#{session_name}\t#{pane_title}",
            ])
            .await
        {
            Ok(s) => s,
            Err(e) => {
                return match pane_not_found_if_matched(e, pane_id) {
                    MuxError::PaneNotFound(_) => Ok(None),
                    other => Err(other),
                };
            }
        };
        let parts: Vec<&str> = stdout.trim().splitn(3, '\t').collect();
        if parts.len() < 3 {
            return Err(MuxError::Parse(format!("malformed display-message output: {stdout}")));
        }
        Ok(Some(PaneMeta {
            pid: parts[0].parse().unwrap_or(0),
            session: parts[1].to_string(),
            title: parts[2].to_string(),
        }))
    }

    pub async fn set_pane_title(&self, pane_id: &str, title: &str) -> Result<(), MuxError> {
        self.executor
            .run(&["select-pane", "-t", pane_id, "-T", title])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    pub async fn get_pane_title(&self, pane_id: &str) -> Result<String, MuxError> {
        self.executor
            .run(&["display-message", "-p", "-t", pane_id, "-F", "#{pane_title}"])
            .await
            .map(|s| s.trim().to_string())
            .map_err(|e| pane_not_found_if_matched(e, pane_id))
    }

    /// Toggle full-screen zoom for a pane's window.
    pub async fn resize_pane_zoom(&self, pane_id: &str) -> Result<(), MuxError> {
        self.executor
            .run(&["resize-pane", "-t", pane_id, "-Z"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    pub async fn is_zoomed(&self, pane_id: &str) -> Result<bool, MuxError> {
        let out = self
            .executor
            .run(&["display-message", "-p", "-t", pane_id, "-F", "#{window_zoomed_flag}"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(out.trim() == "1")
    }

    pub async fn enter_copy_mode(&self, pane_id: &str) -> Result<(), MuxError> {
        self.executor
            .run(&["copy-mode", "-t", pane_id])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    pub async fn exit_copy_mode(&self, pane_id: &str) -> Result<(), MuxError> {
        self.executor
            .run(&["send-keys", "-t", pane_id, "-X", "cancel"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    pub async fn scroll_up(&self, pane_id: &str, lines: u32) -> Result<(), MuxError> {
        self.executor
            .run(&["send-keys", "-t", pane_id, "-X", "-N", &lines.to_string(), "scroll-up"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    pub async fn scroll_down(&self, pane_id: &str, lines: u32) -> Result<(), MuxError> {
        self.executor
            .run(&["send-keys", "-t", pane_id, "-X", "-N", &lines.to_string(), "scroll-down"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(())
    }

    pub async fn is_in_copy_mode(&self, pane_id: &str) -> Result<bool, MuxError> {
        let out = self
            .executor
            .run(&["display-message", "-p", "-t", pane_id, "-F", "#{pane_in_mode}"])
            .await
            .map_err(|e| pane_not_found_if_matched(e, pane_id))?;
        Ok(out.trim() == "1")
    }

    /// The tmux binary this adapter invokes, so a PTY attach (which bypasses
    /// the executor to get a real interactive child) spawns the exact same
    /// binary rather than risking a different `tmux` on `$PATH`.
    pub fn tmux_bin(&self) -> &str {
        self.executor.binary()
    }
}

/// Pid/session/title snapshot returned by `getPane`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneMeta {
    pub pid: u32,
    pub session: String,
    pub title: String,
}

impl Default for TmuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// tmux reports a dead pane target as a `MuxCommandFailed` whose stderr
/// contains "can't find pane"; surface that as the more specific
/// [`MuxError::PaneNotFound`] so callers can distinguish it from a generic
/// command failure.
fn pane_not_found_if_matched(err: MuxError, pane_id: &str) -> MuxError {
    match &err {
        MuxError::MuxCommandFailed(msg) if msg.contains("can't find pane") => {
            MuxError::PaneNotFound(pane_id.to_string())
        }
        _ => err,
    }
}

fn parse_list_panes_output(output: &str) -> Result<Vec<PaneInfo>, MuxError> {
    let mut panes = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_pane_line(line) {
            Ok(pane) => panes.push(pane),
            Err(e) => {
                tracing::warn!(%e, line, "skipping malformed list-panes line");
            }
        }
    }

    Ok(panes)
}

fn parse_pane_line(line: &str) -> Result<PaneInfo, MuxError> {
    let parts: Vec<&str> = line.splitn(EXPECTED_FIELDS, '\t').collect();

    if parts.len() < EXPECTED_FIELDS {
        return Err(MuxError::Parse(format!(
            "expected {EXPECTED_FIELDS} fields, got {}: {line}",
            parts.len()
        )));
    }

    let width: u16 = parts[6]
        .parse()
        .map_err(|_| MuxError::Parse(format!("invalid width '{}' in line: {line}", parts[6])))?;
    let height: u16 = parts[7]
        .parse()
        .map_err(|_| MuxError::Parse(format!("invalid height '{}' in line: {line}", parts[7])))?;
    let is_active = parts[8] == "1";

    Ok(PaneInfo {
        session_name: parts[0].to_string(),
        window_id: parts[1].to_string(),
        window_name: parts[2].to_string(),
        pane_id: parts[3].to_string(),
        current_cmd: parts[4].to_string(),
        pane_title: parts[5].to_string(),
        width,
        height,
        is_active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_line() {
        let line = "main\t@0\teditor\t%1\tvim\t~/code\t120\t40\t1";
        let pane = parse_pane_line(line).unwrap();
        assert_eq!(pane.session_name, "main");
        assert_eq!(pane.pane_id, "%1");
        assert_eq!(pane.width, 120);
        assert!(pane.is_active);
    }

    #[test]
    fn parse_multiple_lines_and_skips_malformed() {
        let output = "\
main\t@0\teditor\t%1\tvim\t~/code\t120\t40\t1
bad\tline\tonly\tfive\tfields
work\t@1\tlogs\t%3\ttail\t/var/log\t200\t50\t0
";
        let panes = parse_list_panes_output(output).unwrap();
        assert_eq!(panes.len(), 2);
        assert_eq!(panes[1].pane_id, "%3");
    }

    #[test]
    fn pane_not_found_mapped_from_command_failure() {
        let err = MuxError::MuxCommandFailed("exit 1: can't find pane %99".into());
        let mapped = pane_not_found_if_matched(err, "%99");
        assert!(matches!(mapped, MuxError::PaneNotFound(id) if id == "%99"));
    }

    #[test]
    fn unrelated_command_failure_is_not_remapped() {
        let err = MuxError::MuxCommandFailed("exit 1: server not running".into());
        let mapped = pane_not_found_if_matched(err, "%99");
        assert!(matches!(mapped, MuxError::MuxCommandFailed(_)));
    }

    #[test]
    fn real_pane_ids_start_with_sentinel() {
        assert!(is_real_pane_id("%12"));
        assert!(!is_real_pane_id("placeholder-pane-1"));
        assert!(!is_real_pane_id(""));
    }

    #[tokio::test]
    async fn is_pane_alive_false_for_missing_tmux_binary() {
        let adapter = TmuxAdapter::with_executor(TmuxExecutor::with_bin("/nonexistent/tmux-binary"));
        let err = adapter.is_pane_alive("%1").await.unwrap_err();
        assert!(matches!(err, MuxError::MuxUnavailable(_)));
    }
}
