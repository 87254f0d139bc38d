//! The built-in tool catalog: descriptors, risk tiers, and wiring of the
//! implementations into the registry.
//!
//! Tier assignments follow one rule of thumb: read-only lookups are `auto`,
//! anything that changes local state or pokes a remote system is `confirm`,
//! and anything that speaks for the user or spends cluster allocation is
//! `critical` (refused outright in this catalog).

use std::sync::Arc;

use crate::{
    arxiv_search, calendar_briefing, hpc_job_status, hpc_queue, hpc_submit, mail_archive,
    mail_digest, mail_send_reply, paper_download, AgentConfig, ArgKind, ArgSpec, RegistryError,
    RiskTier, ToolDescriptor, ToolFn, ToolRegistry,
};

fn spec(name: &str, kind: ArgKind, required: bool, description: &str) -> ArgSpec {
    ArgSpec::new(name, kind, required, description)
}

fn with_cfg(
    cfg: &Arc<AgentConfig>,
    f: fn(&serde_json::Value, &AgentConfig) -> Result<crate::ToolExecution, String>,
) -> ToolFn {
    let cfg = Arc::clone(cfg);
    Box::new(move |args| f(args, &cfg))
}

pub(crate) fn register_builtin_tools(
    registry: &mut ToolRegistry,
    cfg: &Arc<AgentConfig>,
) -> Result<(), RegistryError> {
    registry.register(
        ToolDescriptor {
            name: "arxiv_search".to_string(),
            description: "Search arXiv for recent papers matching a query.".to_string(),
            tier: RiskTier::Auto,
            args: vec![
                spec("query", ArgKind::String, true, "Search terms"),
                spec("limit", ArgKind::Integer, false, "Max results (default 5)"),
            ],
        },
        Box::new(arxiv_search),
    )?;
    registry.register(
        ToolDescriptor {
            name: "calendar_briefing".to_string(),
            description: "Summarize calendar events for a day.".to_string(),
            tier: RiskTier::Auto,
            args: vec![spec(
                "date",
                ArgKind::String,
                false,
                "Day to brief, YYYY-MM-DD (default today)",
            )],
        },
        with_cfg(cfg, calendar_briefing),
    )?;
    registry.register(
        ToolDescriptor {
            name: "mail_digest".to_string(),
            description: "Classify and summarize the local mail spool.".to_string(),
            tier: RiskTier::Auto,
            args: vec![spec(
                "limit",
                ArgKind::Integer,
                false,
                "Max messages to scan (default 20)",
            )],
        },
        with_cfg(cfg, mail_digest),
    )?;
    registry.register(
        ToolDescriptor {
            name: "hpc_queue".to_string(),
            description: "List the user's jobs on the HPC queue.".to_string(),
            tier: RiskTier::Auto,
            args: vec![],
        },
        with_cfg(cfg, hpc_queue),
    )?;
    registry.register(
        ToolDescriptor {
            name: "hpc_job_status".to_string(),
            description: "Probe the status of one HPC job over ssh.".to_string(),
            tier: RiskTier::Confirm,
            args: vec![spec("job_id", ArgKind::String, true, "Scheduler job id")],
        },
        with_cfg(cfg, hpc_job_status),
    )?;
    registry.register(
        ToolDescriptor {
            name: "paper_download".to_string(),
            description: "Download an arXiv paper PDF into the workspace.".to_string(),
            tier: RiskTier::Confirm,
            args: vec![spec("arxiv_id", ArgKind::String, true, "arXiv identifier")],
        },
        with_cfg(cfg, paper_download),
    )?;
    registry.register(
        ToolDescriptor {
            name: "mail_archive".to_string(),
            description: "Move a spool message into the archive.".to_string(),
            tier: RiskTier::Confirm,
            args: vec![spec("id", ArgKind::String, true, "Message id")],
        },
        with_cfg(cfg, mail_archive),
    )?;
    registry.register(
        ToolDescriptor {
            name: "mail_send_reply".to_string(),
            description: "Queue an outgoing reply in the user's name.".to_string(),
            tier: RiskTier::Critical,
            args: vec![
                spec("id", ArgKind::String, true, "Message id being replied to"),
                spec("body", ArgKind::String, true, "Reply text"),
            ],
        },
        with_cfg(cfg, mail_send_reply),
    )?;
    registry.register(
        ToolDescriptor {
            name: "hpc_submit".to_string(),
            description: "Submit a batch script to the HPC scheduler.".to_string(),
            tier: RiskTier::Critical,
            args: vec![spec(
                "script",
                ArgKind::String,
                true,
                "Path to the batch script on the remote host",
            )],
        },
        with_cfg(cfg, hpc_submit),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_registers_cleanly() {
        let mut registry = ToolRegistry::new();
        let cfg = Arc::new(AgentConfig::default());
        register_builtin_tools(&mut registry, &cfg).unwrap();
        assert_eq!(registry.len(), 9);

        // Spot-check tiers: lookups are auto, outbound actions are critical.
        assert_eq!(
            registry.lookup("arxiv_search").unwrap().descriptor.tier,
            RiskTier::Auto
        );
        assert_eq!(
            registry.lookup("mail_archive").unwrap().descriptor.tier,
            RiskTier::Confirm
        );
        assert_eq!(
            registry.lookup("mail_send_reply").unwrap().descriptor.tier,
            RiskTier::Critical
        );
        assert_eq!(
            registry.lookup("hpc_submit").unwrap().descriptor.tier,
            RiskTier::Critical
        );

        // Registering twice is a duplicate error, not a silent overwrite.
        assert!(register_builtin_tools(&mut registry, &cfg).is_err());
    }
}
