//! Interaction surfaces. Both the terminal chat and the HTTP bridge drive
//! the same orchestration loop; they differ only in where messages and
//! approval commands come from.

mod http;

#[allow(unused_imports)]
pub(crate) use http::*;

use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    register_builtin_tools, run_turn, try_handle_approval_chat, AgentConfig, ApprovalGate,
    ConfirmationChannel, HttpBackend, ToolRegistry, TraceStore, TurnPolicy,
};

/// Everything a surface needs to run turns. Built once per process.
pub(crate) struct AgentRuntime {
    pub(crate) cfg: Arc<AgentConfig>,
    pub(crate) store: Arc<TraceStore>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) gate: Arc<ApprovalGate>,
}

pub(crate) fn build_runtime(
    channel: Box<dyn ConfirmationChannel>,
) -> Result<AgentRuntime, Box<dyn std::error::Error>> {
    let cfg = Arc::new(AgentConfig::from_env());
    let store = Arc::new(TraceStore::open_or_create(&cfg.db_path())?);
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, &cfg)?;
    let registry = Arc::new(registry);
    let gate = Arc::new(ApprovalGate::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        channel,
        Duration::from_secs(cfg.approval_timeout_secs),
    ));
    Ok(AgentRuntime {
        cfg,
        store,
        registry,
        gate,
    })
}

/// Shows approval prompts on the terminal running the surface.
pub(crate) struct ConsoleChannel;

impl ConfirmationChannel for ConsoleChannel {
    fn request_confirmation(&self, _session: &str, prompt: &str, _token: &str) -> Result<(), String> {
        println!("\n{prompt}");
        Ok(())
    }
}

// ── Terminal chat ────────────────────────────────────────────────────────

pub(crate) fn run_chat(
    session: &str,
    message: Option<String>,
    policy: &TurnPolicy,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Arc::new(build_runtime(Box::new(ConsoleChannel))?);
    let backend = Arc::new(HttpBackend::from_env(
        &runtime.cfg.backend_url,
        &runtime.cfg.model,
    )?);

    // Dedicated stdin thread: while a turn is suspended on an approval, the
    // main thread keeps servicing approve/reject commands from here.
    let (line_tx, line_rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    if let Some(message) = message {
        let answer = drive_turn(&runtime, &backend, session, &message, policy, &line_rx)?;
        println!("{answer}");
        return Ok(());
    }

    println!("lodestar chat — type a message, `approve <token>`, `reject <token>`, or `quit`.");
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Ok(line) = line_rx.recv() else { break };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        if let Some(reply) = try_handle_approval_chat(&runtime.gate, &line) {
            println!("{reply}");
            continue;
        }
        match drive_turn(&runtime, &backend, session, &line, policy, &line_rx) {
            Ok(answer) => println!("{answer}"),
            Err(err) => eprintln!("[chat] turn failed: {err}"),
        }
    }
    Ok(())
}

/// Run one turn on a worker thread while the caller keeps reading stdin for
/// approval commands. Anything else typed mid-turn is deferred.
fn drive_turn(
    runtime: &Arc<AgentRuntime>,
    backend: &Arc<HttpBackend>,
    session: &str,
    text: &str,
    policy: &TurnPolicy,
    lines: &mpsc::Receiver<String>,
) -> Result<String, Box<dyn std::error::Error>> {
    let (done_tx, done_rx) = mpsc::channel();
    {
        let runtime = Arc::clone(runtime);
        let backend = Arc::clone(backend);
        let session = session.to_string();
        let text = text.to_string();
        let policy = policy.clone();
        std::thread::spawn(move || {
            let result = run_turn(
                &runtime.store,
                &runtime.registry,
                &runtime.gate,
                backend.as_ref(),
                &session,
                &text,
                &policy,
                &runtime.cfg,
            );
            let _ = done_tx.send(result);
        });
    }

    loop {
        if let Ok(result) = done_rx.try_recv() {
            let output = result?;
            return Ok(output
                .final_text
                .unwrap_or_else(|| "(no reply)".to_string()));
        }
        match lines.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => {
                let line = line.trim();
                if let Some(reply) = try_handle_approval_chat(&runtime.gate, line) {
                    println!("{reply}");
                } else if !line.is_empty() {
                    println!("(a turn is still running; use `approve <token>` or `reject <token>`)");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // stdin closed; just wait for the turn to finish.
                let output = done_rx.recv().map_err(|e| e.to_string())??;
                return Ok(output
                    .final_text
                    .unwrap_or_else(|| "(no reply)".to_string()));
            }
        }
    }
}
