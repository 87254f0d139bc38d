//! ReAct-style orchestration: drive one user turn to a final answer.
//!
//! Each step asks the reasoning backend for either final text or tool calls;
//! tool calls go through the approval gate and their outcomes — including
//! refusals — are appended verbatim to the transcript. The backend never gets
//! to claim a tool ran when it did not.

use std::collections::HashMap;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use rayon::ThreadPoolBuilder;

use crate::{
    blake3_hash, caution_block, detect_correction, now_ts, save_correction, truncate_chars,
    AgentConfig, AgentMessage, AgentToolCall, AgentToolResult, ApprovalGate, BackendError,
    GateOutcome, ReasoningBackend, SessionTurn, ToolInvocationRequest, ToolRegistry, TraceStore,
    TurnOutput, TurnPolicy,
};

pub(crate) fn default_system_prompt() -> String {
    [
        "You are Lodestar, a personal research assistant for a physics graduate student.",
        "You can search papers, manage mail, check the HPC queue, and read the calendar.",
        "Be concrete and concise. Prefer checking over guessing.",
        "",
        "## Tools",
        "Your tools are listed in the tool definitions. Call them when the request needs",
        "real data; answer directly when it does not.",
        "Proper nouns from tool results must be passed through verbatim, never invented.",
        "Sensitive actions require approval. If a tool result says it was NOT executed,",
        "tell the user plainly; never pretend the action happened.",
    ]
    .join("\n")
}

const REQUIRE_TOOL_REMINDER: &str = "A tool call is required for this request. Do not answer \
from memory: call one of the available tools first, then answer from its result.";

const DEGRADED_ANSWER: &str = "I could not complete this request within the step limit. \
Nothing beyond the tool results above was done.";

/// Drive one inbound message to a final answer (or a degraded result).
/// Backend failures abort the turn; tool failures are transcript content.
pub(crate) fn run_turn(
    store: &TraceStore,
    registry: &ToolRegistry,
    gate: &ApprovalGate,
    backend: &dyn ReasoningBackend,
    session: &str,
    user_text: &str,
    policy: &TurnPolicy,
    cfg: &AgentConfig,
) -> Result<TurnOutput, BackendError> {
    // A correction of the previous reply is stored before the turn runs, so
    // this very turn already sees it as a caution.
    if detect_correction(user_text) {
        match store.last_assistant_text(session) {
            Ok(Some(previous)) => {
                if let Err(err) = save_correction(store, session, &previous, user_text) {
                    eprintln!("[feedback] failed to save correction: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => eprintln!("[feedback] failed to load prior reply: {err}"),
        }
    }

    let mut system = default_system_prompt();
    if let Some(cautions) = caution_block(store, session) {
        system.push_str("\n\n");
        system.push_str(&cautions);
    }
    if policy.require_tool {
        system.push_str("\n\n");
        system.push_str(REQUIRE_TOOL_REMINDER);
    }

    let mut messages: Vec<AgentMessage> = Vec::new();
    match store.recent_turns(session, cfg.history_turns) {
        Ok(turns) => {
            for turn in turns {
                messages.push(AgentMessage::text(&turn.role, turn.content));
            }
        }
        Err(err) => eprintln!("[agent] failed to load session history: {err}"),
    }
    messages.push(AgentMessage::text("user", user_text));

    let tools = registry.definitions_json(policy.allowed_tools.as_deref());

    let mut tool_results: Vec<AgentToolResult> = Vec::new();
    let mut attempts: HashMap<String, u32> = HashMap::new();
    let mut executed_ok = false;
    let mut final_text: Option<String> = None;
    let mut steps = 0;

    for step in 0..cfg.max_steps {
        steps = step + 1;
        let reply = backend.complete(&system, &messages, &tools)?;
        let tool_calls = reply.tool_calls.clone();
        let reply_text = reply.content.clone();
        messages.push(reply);

        if tool_calls.is_empty() {
            if policy.require_tool && !executed_ok {
                // Early answer in tool-required mode: treat as an
                // intermediate step and re-prompt instead of terminating.
                messages.push(AgentMessage::text("system", REQUIRE_TOOL_REMINDER));
                continue;
            }
            final_text = Some(reply_text.unwrap_or_default());
            break;
        }

        let outcomes = execute_calls(gate, session, step, &tool_calls, &mut attempts, cfg);
        for (call, output, is_error) in outcomes {
            if !is_error {
                executed_ok = true;
            }
            messages.push(AgentMessage::tool_result(&call.id, &output, is_error));
            tool_results.push(AgentToolResult {
                id: call.id,
                tool: call.name,
                output,
                is_error,
            });
        }
    }

    if final_text.is_none() {
        final_text = Some(DEGRADED_ANSWER.to_string());
    }

    let now = now_ts();
    let user_turn = SessionTurn {
        role: "user".to_string(),
        content: user_text.to_string(),
        timestamp: now,
    };
    if let Err(err) = store.append_turn(session, &user_turn) {
        eprintln!("[agent] failed to persist user turn: {err}");
    }
    if let Some(text) = &final_text {
        let assistant_turn = SessionTurn {
            role: "assistant".to_string(),
            content: text.clone(),
            timestamp: now,
        };
        if let Err(err) = store.append_turn(session, &assistant_turn) {
            eprintln!("[agent] failed to persist assistant turn: {err}");
        }
    }

    Ok(TurnOutput {
        session: session.to_string(),
        final_text,
        steps,
        tool_results,
    })
}

/// Run the step's requested calls through the gate. A single call runs
/// inline; several run on a bounded pool (the per-session pending rule still
/// serializes CONFIRM approvals).
fn execute_calls(
    gate: &ApprovalGate,
    session: &str,
    step: usize,
    tool_calls: &[AgentToolCall],
    attempts: &mut HashMap<String, u32>,
    cfg: &AgentConfig,
) -> Vec<(AgentToolCall, String, bool)> {
    let mut planned: Vec<(AgentToolCall, Option<String>)> = Vec::new();
    for call in tool_calls {
        let key = retry_key(call);
        let seen = attempts.entry(key).or_insert(0);
        *seen += 1;
        if *seen > cfg.retry_cap {
            // Loop-level retry cap: past it, identical calls are refused
            // without consulting the gate again.
            planned.push((
                call.clone(),
                Some(format!(
                    "Tool '{}' was NOT executed: the identical call was already made {} times this turn.",
                    call.name,
                    cfg.retry_cap
                )),
            ));
        } else {
            planned.push((call.clone(), None));
        }
    }

    let evaluate = |(call, capped): &(AgentToolCall, Option<String>)| {
        if let Some(notice) = capped {
            return (call.clone(), notice.clone(), true);
        }
        let request = ToolInvocationRequest {
            session: session.to_string(),
            step,
            tool: call.name.clone(),
            args: call.args.clone(),
        };
        let outcome = gate.evaluate(&request);
        let (text, is_error) = outcome.transcript_text(&call.name);
        (call.clone(), truncate_chars(&text, cfg.max_tool_output), is_error)
    };

    if planned.len() <= 1 {
        planned.iter().map(evaluate).collect()
    } else {
        ThreadPoolBuilder::new()
            .num_threads(planned.len().min(4))
            .build()
            .map(|pool| pool.install(|| planned.par_iter().map(evaluate).collect()))
            .unwrap_or_else(|_| planned.iter().map(evaluate).collect())
    }
}

fn retry_key(call: &AgentToolCall) -> String {
    let args_preview: String = call.args.to_string().chars().take(200).collect();
    let hash = blake3_hash(args_preview.as_bytes()).to_hex()[..16].to_string();
    format!("{}:{hash}", call.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ArgKind, ArgSpec, AuditFilter, RiskTier, SilentChannel, ToolDescriptor, ToolExecution,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct ScriptedBackend {
        replies: Mutex<VecDeque<AgentMessage>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<AgentMessage>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ReasoningBackend for ScriptedBackend {
        fn complete(
            &self,
            _system: &str,
            _messages: &[AgentMessage],
            _tools: &[serde_json::Value],
        ) -> Result<AgentMessage, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| BackendError::Unavailable("script exhausted".to_string()))
        }
    }

    fn final_reply(text: &str) -> AgentMessage {
        AgentMessage::text("assistant", text)
    }

    fn tool_reply(id: &str, name: &str) -> AgentMessage {
        AgentMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: vec![AgentToolCall {
                id: id.to_string(),
                name: name.to_string(),
                args: serde_json::json!({}),
            }],
            tool_call_id: None,
            is_error: None,
        }
    }

    struct Harness {
        store: Arc<TraceStore>,
        registry: Arc<ToolRegistry>,
        gate: ApprovalGate,
        cfg: AgentConfig,
        counter: Arc<AtomicUsize>,
    }

    fn harness(name: &str, tool_ok: bool) -> Harness {
        let dir = std::env::temp_dir().join("lodestar_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("agent_{}_{name}.sqlite", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let store = Arc::new(TraceStore::open_or_create(&path).unwrap());

        let counter = Arc::new(AtomicUsize::new(0));
        let tool_counter = Arc::clone(&counter);
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor {
                    name: "probe".to_string(),
                    description: "test probe".to_string(),
                    tier: RiskTier::Auto,
                    args: vec![ArgSpec::new("q", ArgKind::String, false, "query")],
                },
                Box::new(move |_| {
                    tool_counter.fetch_add(1, Ordering::SeqCst);
                    if tool_ok {
                        Ok(ToolExecution {
                            output: "probe data: 42".to_string(),
                            details: serde_json::json!({}),
                            is_error: false,
                        })
                    } else {
                        Err("probe offline".to_string())
                    }
                }),
            )
            .unwrap();
        let registry = Arc::new(registry);
        let gate = ApprovalGate::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Box::new(SilentChannel),
            Duration::from_millis(100),
        );
        Harness {
            store,
            registry,
            gate,
            cfg: AgentConfig {
                max_steps: 5,
                ..AgentConfig::default()
            },
            counter,
        }
    }

    #[test]
    fn plain_answer_passes_through() {
        let h = harness("plain", true);
        let backend = ScriptedBackend::new(vec![final_reply("hello there")]);
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "hi",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap();
        assert_eq!(out.final_text.as_deref(), Some("hello there"));
        assert_eq!(out.steps, 1);
        assert_eq!(h.counter.load(Ordering::SeqCst), 0);

        // Both turns persisted for session continuity
        let turns = h.store.recent_turns("s1", 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, "assistant");
    }

    #[test]
    fn tool_then_answer() {
        let h = harness("tool_then_answer", true);
        let backend = ScriptedBackend::new(vec![
            tool_reply("tu_1", "probe"),
            final_reply("the probe says 42"),
        ]);
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "check the probe",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap();
        assert_eq!(out.final_text.as_deref(), Some("the probe says 42"));
        assert_eq!(out.tool_results.len(), 1);
        assert!(!out.tool_results[0].is_error);
        assert_eq!(h.counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn require_tool_blocks_early_answer() {
        let h = harness("require_tool", true);
        // Backend tries to answer from memory first; only the post-execution
        // answer may terminate the turn.
        let backend = ScriptedBackend::new(vec![
            final_reply("from memory: it's fine"),
            tool_reply("tu_1", "probe"),
            final_reply("verified: 42"),
        ]);
        let policy = TurnPolicy {
            require_tool: true,
            allowed_tools: Some(vec!["probe".to_string()]),
        };
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "is the probe ok?",
            &policy,
            &h.cfg,
        )
        .unwrap();
        assert_eq!(out.final_text.as_deref(), Some("verified: 42"));
        assert_eq!(h.counter.load(Ordering::SeqCst), 1);
        assert_eq!(out.steps, 3);
    }

    #[test]
    fn require_tool_never_satisfied_degrades() {
        let h = harness("require_tool_degraded", true);
        let backend = ScriptedBackend::new(vec![
            final_reply("guess 1"),
            final_reply("guess 2"),
            final_reply("guess 3"),
            final_reply("guess 4"),
            final_reply("guess 5"),
        ]);
        let policy = TurnPolicy {
            require_tool: true,
            allowed_tools: None,
        };
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "status?",
            &policy,
            &h.cfg,
        )
        .unwrap();
        // No guess ever became the final answer.
        assert_eq!(out.final_text.as_deref(), Some(DEGRADED_ANSWER));
        assert_eq!(h.counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tool_error_is_fed_back_not_fatal() {
        let h = harness("tool_error", false);
        let backend = ScriptedBackend::new(vec![
            tool_reply("tu_1", "probe"),
            final_reply("the probe is offline"),
        ]);
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "check the probe",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap();
        assert_eq!(out.final_text.as_deref(), Some("the probe is offline"));
        assert!(out.tool_results[0].is_error);
        assert!(out.tool_results[0].output.contains("probe offline"));
    }

    #[test]
    fn unknown_tool_request_yields_refusal_notice() {
        let h = harness("unknown_tool", true);
        let backend = ScriptedBackend::new(vec![
            tool_reply("tu_1", "made_up_tool"),
            final_reply("that tool does not exist"),
        ]);
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "do the thing",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap();
        assert!(out.tool_results[0].is_error);
        assert!(out.tool_results[0].output.contains("NOT executed"));
        // The refusal is in the audit trail too.
        let audit = h
            .store
            .query_audit(&AuditFilter {
                tool: Some("made_up_tool".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn step_ceiling_terminates_tool_storm() {
        let h = harness("ceiling", true);
        let replies: Vec<AgentMessage> = (0..10)
            .map(|i| tool_reply(&format!("tu_{i}"), "probe"))
            .collect();
        let backend = ScriptedBackend::new(replies);
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "keep checking",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap();
        assert_eq!(out.steps, h.cfg.max_steps);
        assert_eq!(out.final_text.as_deref(), Some(DEGRADED_ANSWER));
        assert_eq!(backend.calls.load(Ordering::SeqCst), h.cfg.max_steps);
    }

    #[test]
    fn retry_cap_stops_identical_calls() {
        let h = harness("retry_cap", false);
        let replies: Vec<AgentMessage> = (0..5)
            .map(|i| tool_reply(&format!("tu_{i}"), "probe"))
            .collect();
        let backend = ScriptedBackend::new(replies);
        let out = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "keep poking",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap();
        // retry_cap (3) gate evaluations, the rest refused at the loop level.
        assert_eq!(h.counter.load(Ordering::SeqCst), h.cfg.retry_cap as usize);
        let capped: Vec<_> = out
            .tool_results
            .iter()
            .filter(|r| r.output.contains("already made"))
            .collect();
        assert_eq!(capped.len(), 5 - h.cfg.retry_cap as usize);
    }

    #[test]
    fn backend_failure_is_fatal_to_turn() {
        let h = harness("backend_fatal", true);
        let backend = ScriptedBackend::new(vec![]);
        let err = run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "hi",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[test]
    fn correction_message_is_stored_and_injected() {
        let h = harness("correction", true);
        // Seed a prior assistant turn to correct.
        h.store
            .append_turn(
                "s1",
                &SessionTurn {
                    role: "assistant".to_string(),
                    content: "the seminar is on Monday".to_string(),
                    timestamp: now_ts(),
                },
            )
            .unwrap();
        let backend = ScriptedBackend::new(vec![final_reply("noted, Tuesday it is")]);
        run_turn(
            &h.store,
            &h.registry,
            &h.gate,
            &backend,
            "s1",
            "that's wrong, the seminar is on Tuesday",
            &TurnPolicy::default(),
            &h.cfg,
        )
        .unwrap();
        let corrections = h.store.recent_corrections("s1", 5).unwrap();
        assert_eq!(corrections.len(), 1);
        assert!(corrections[0].correction.contains("Tuesday"));
        // Folded into this turn's prompt already.
        assert!(corrections[0].applied);
    }
}
