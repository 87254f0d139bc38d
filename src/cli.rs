use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lodestar")]
#[command(about = "Approval-gated personal research assistant", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Chat with the assistant (interactive unless --message is given).
    Chat {
        /// Session key; history, corrections, and approvals are scoped to it
        #[arg(short, long, default_value = "cli")]
        session: String,
        /// One-shot message; omit for an interactive loop
        #[arg(short, long)]
        message: Option<String>,
        /// Refuse final answers until a tool has actually run this turn
        #[arg(long)]
        require_tool: bool,
        /// Restrict the offered tools (repeatable)
        #[arg(long = "tool")]
        tools: Vec<String>,
    },

    /// Serve the HTTP chat and approvals API.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
        /// Worker threads; each suspended approval holds one
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Inspect the audit trail (newest first).
    Audit {
        #[arg(short, long)]
        session: Option<String>,
        #[arg(short, long)]
        tool: Option<String>,
        /// executed | confirmed_executed | rejected | expired | error
        #[arg(short, long)]
        decision: Option<String>,
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// List the registered tools and their risk tiers.
    Tools {
        #[arg(long)]
        json: bool,
    },

    /// List stored user corrections.
    Corrections {
        #[arg(short, long)]
        session: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}
