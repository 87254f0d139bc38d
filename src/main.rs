// Module declarations
mod cli;
mod types;
mod util;
mod config;
mod registry;
mod trace_db;
mod gate;
mod feedback;
mod backend;
mod tool_exec;
mod tool_defs;
mod agent;
mod bridges;

// Re-export all module items at crate root so cross-module references work
// through a single shared namespace.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use util::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use registry::*;
#[allow(unused_imports)]
pub(crate) use trace_db::*;
#[allow(unused_imports)]
pub(crate) use gate::*;
#[allow(unused_imports)]
pub(crate) use feedback::*;
#[allow(unused_imports)]
pub(crate) use backend::*;
#[allow(unused_imports)]
pub(crate) use tool_exec::*;
#[allow(unused_imports)]
pub(crate) use tool_defs::*;
#[allow(unused_imports)]
pub(crate) use agent::*;
#[allow(unused_imports)]
pub(crate) use bridges::*;

use std::sync::Arc;

use clap::Parser;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Chat {
            session,
            message,
            require_tool,
            tools,
        } => {
            let policy = TurnPolicy {
                require_tool,
                allowed_tools: if tools.is_empty() { None } else { Some(tools) },
            };
            run_chat(&session, message, &policy)
        }

        Command::Serve {
            bind,
            port,
            workers,
        } => run_http_bridge(&bind, port, workers),

        Command::Audit {
            session,
            tool,
            decision,
            limit,
            json,
        } => {
            let cfg = AgentConfig::from_env();
            let store = TraceStore::open_or_create(&cfg.db_path())?;
            let decision = match decision.as_deref() {
                Some(s) => Some(
                    AuditDecision::from_db_str(s)
                        .ok_or_else(|| format!("unknown decision: {s}"))?,
                ),
                None => None,
            };
            let records = store.query_audit(&AuditFilter {
                session,
                tool,
                decision,
                limit,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in records {
                    println!(
                        "{}\t{}\t{}\t{}\t{}\t{}",
                        r.ts_utc, r.session, r.tool, r.tier, r.decision, r.summary
                    );
                }
            }
            Ok(())
        }

        Command::Tools { json } => {
            let cfg = Arc::new(AgentConfig::from_env());
            let mut registry = ToolRegistry::new();
            register_builtin_tools(&mut registry, &cfg)?;
            let mut descriptors: Vec<_> = registry.descriptors().collect();
            descriptors.sort_by(|a, b| a.name.cmp(&b.name));
            if json {
                let rows: Vec<_> = descriptors
                    .iter()
                    .map(|d| {
                        serde_json::json!({
                            "name": d.name,
                            "tier": d.tier,
                            "description": d.description,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for d in descriptors {
                    println!("{:<18} {:<9} {}", d.name, d.tier.as_str(), d.description);
                }
            }
            Ok(())
        }

        Command::Corrections {
            session,
            limit,
            json,
        } => {
            let cfg = AgentConfig::from_env();
            let store = TraceStore::open_or_create(&cfg.db_path())?;
            let records = match session {
                Some(session) => store.recent_corrections(&session, limit)?,
                None => store.list_corrections(limit)?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in records {
                    println!(
                        "{}\t{}\tapplied={}\t{} -> {}",
                        r.ts_utc, r.session, r.applied, r.original, r.correction
                    );
                }
            }
            Ok(())
        }
    }
}
