use std::path::PathBuf;

use crate::{env_optional, env_u64, env_usize};

pub(crate) const DEFAULT_DATA_DIR: &str = ".lodestar";
pub(crate) const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub(crate) const DEFAULT_BACKEND_URL: &str = "https://api.anthropic.com";
pub(crate) const DEFAULT_MAX_STEPS: usize = 10;
pub(crate) const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 300;
pub(crate) const DEFAULT_HISTORY_TURNS: usize = 20;
pub(crate) const DEFAULT_RETRY_CAP: u32 = 3;
pub(crate) const DEFAULT_MAX_TOOL_OUTPUT: usize = 4000;

/// Process-wide configuration, resolved once at startup from LODESTAR_* env
/// vars. Everything has a workable default except the backend API key, which
/// is only required when a turn actually reaches the reasoning backend.
#[derive(Debug, Clone)]
pub(crate) struct AgentConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) backend_url: String,
    pub(crate) model: String,
    pub(crate) max_steps: usize,
    pub(crate) approval_timeout_secs: u64,
    pub(crate) history_turns: usize,
    pub(crate) retry_cap: u32,
    pub(crate) max_tool_output: usize,
    /// Local mail spool directory scanned by the mail tools.
    pub(crate) mail_dir: Option<PathBuf>,
    /// JSON calendar file read by calendar_briefing.
    pub(crate) calendar_path: Option<PathBuf>,
    /// `user@host` target for the HPC queue tools.
    pub(crate) hpc_host: Option<String>,
    /// Extra ssh arguments, split shell-style.
    pub(crate) hpc_ssh_args: Option<String>,
    /// Where paper_download drops PDFs.
    pub(crate) workspace: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        Self {
            workspace: data_dir.clone(),
            data_dir,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            approval_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            history_turns: DEFAULT_HISTORY_TURNS,
            retry_cap: DEFAULT_RETRY_CAP,
            max_tool_output: DEFAULT_MAX_TOOL_OUTPUT,
            mail_dir: None,
            calendar_path: None,
            hpc_host: None,
            hpc_ssh_args: None,
        }
    }
}

impl AgentConfig {
    pub(crate) fn from_env() -> Self {
        let data_dir = env_optional("LODESTAR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                env_optional("HOME")
                    .map(|h| PathBuf::from(h).join(DEFAULT_DATA_DIR))
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
            });
        let workspace = env_optional("LODESTAR_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.clone());
        Self {
            backend_url: env_optional("LODESTAR_BACKEND_URL")
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            model: env_optional("LODESTAR_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_steps: env_usize("LODESTAR_MAX_STEPS", DEFAULT_MAX_STEPS),
            approval_timeout_secs: env_u64(
                "LODESTAR_APPROVAL_TIMEOUT_SECS",
                DEFAULT_APPROVAL_TIMEOUT_SECS,
            ),
            history_turns: env_usize("LODESTAR_HISTORY_TURNS", DEFAULT_HISTORY_TURNS),
            retry_cap: env_u64("LODESTAR_RETRY_CAP", DEFAULT_RETRY_CAP as u64) as u32,
            max_tool_output: env_usize("LODESTAR_MAX_TOOL_OUTPUT", DEFAULT_MAX_TOOL_OUTPUT),
            mail_dir: env_optional("LODESTAR_MAIL_DIR").map(PathBuf::from),
            calendar_path: env_optional("LODESTAR_CALENDAR_PATH").map(PathBuf::from),
            hpc_host: env_optional("LODESTAR_HPC_HOST"),
            hpc_ssh_args: env_optional("LODESTAR_HPC_SSH_ARGS"),
            data_dir,
            workspace,
        }
    }

    pub(crate) fn db_path(&self) -> PathBuf {
        self.data_dir.join("trace.db")
    }
}
