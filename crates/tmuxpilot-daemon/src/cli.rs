use clap::{Parser, Subcommand};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7777";
const DEFAULT_DB_PATH: &str = "tmuxpilot.db";
const DEFAULT_HANDOFF_THRESHOLD_PERCENT: u8 = 20;

#[derive(Parser)]
#[command(name = "tmuxpilot", about = "Session supervisor and orchestration server for tmux-hosted coding agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Shared secret required of non-loopback WebSocket clients.
    #[arg(long, env = "API_KEY", global = true)]
    pub api_key: Option<String>,

    /// tmux binary to invoke for every multiplexer operation.
    #[arg(long, env = "TMUX_PATH", default_value = "tmux", global = true)]
    pub tmux_path: String,

    /// claude CLI binary used by the reviewer orchestrator and handoff controller.
    #[arg(long, env = "CLAUDE_CLI_PATH", default_value = "claude", global = true)]
    pub claude_cli_path: String,

    /// ttyd binary used for HTTP-exposed terminals. Omit to disable ttyd entirely.
    #[arg(long, env = "TTYD_PATH", global = true)]
    pub ttyd_path: Option<String>,

    /// Remaining context-window percentage at which an auto-handoff is
    /// triggered (e.g. 20 fires once only 20% of the window is left, i.e.
    /// at 80% usage).
    #[arg(long, env = "HANDOFF_THRESHOLD_PERCENT", default_value_t = DEFAULT_HANDOFF_THRESHOLD_PERCENT, global = true)]
    pub handoff_threshold_percent: u8,

    /// Path to the sqlite database backing all persisted state.
    #[arg(long, env = "TMUXPILOT_DB_PATH", default_value = DEFAULT_DB_PATH, global = true)]
    pub db_path: String,

    /// Address the WebSocket hub listens on.
    #[arg(long, env = "TMUXPILOT_BIND_ADDR", default_value = DEFAULT_BIND_ADDR, global = true)]
    pub bind_addr: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the supervisor daemon (default when no subcommand is given).
    Serve {
        /// Append every published event to this JSONL file for later replay.
        #[arg(long)]
        record: Option<String>,
    },
    /// Print a one-shot snapshot of sessions and tickets, then exit.
    Status,
}
