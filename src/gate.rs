//! Risk-gated tool execution.
//!
//! Every proposed tool call flows through [`ApprovalGate::evaluate`]: AUTO
//! tools run immediately, CONFIRM tools suspend the calling thread until a
//! human resolves the minted token (or the deadline passes), CRITICAL tools
//! are refused unconditionally. Whatever happens, exactly one audit record
//! with a terminal decision is appended per request.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{
    format_args_preview, now_ts, redact_args, summarize_for_audit, AuditDecision, AuditRecord,
    PendingSummary, RiskTier, ToolExecution, ToolInvocationRequest, ToolRegistry, TraceStore,
};

#[derive(Debug, Error)]
pub(crate) enum GateError {
    #[error("unknown or already resolved approval token: {0}")]
    UnknownToken(String),
}

/// Terminal outcome of one gated invocation, mirrored one-to-one into the
/// audit trail.
#[derive(Debug)]
pub(crate) enum GateOutcome {
    /// AUTO tool ran (check `is_error` on the execution).
    Executed(ToolExecution),
    /// CONFIRM tool ran after explicit approval.
    ConfirmedExecuted(ToolExecution),
    /// Never ran: unknown tool or CRITICAL tier.
    Refused(String),
    /// Never ran: human said no.
    Rejected(String),
    /// Never ran: another approval was already pending for the session.
    /// Distinguishable so callers can retry the turn later.
    Busy(String),
    /// Never ran: the approval deadline passed.
    Expired,
}

impl GateOutcome {
    /// Human/transcript-facing rendering. Refusals are explicit so the
    /// reasoning backend can never pass one off as a result.
    pub(crate) fn transcript_text(&self, tool: &str) -> (String, bool) {
        match self {
            Self::Executed(exec) | Self::ConfirmedExecuted(exec) => {
                (exec.output.clone(), exec.is_error)
            }
            Self::Refused(reason) | Self::Rejected(reason) | Self::Busy(reason) => (
                format!("Tool '{tool}' was NOT executed: {reason}"),
                true,
            ),
            Self::Expired => (
                format!("Tool '{tool}' was NOT executed: approval timed out."),
                true,
            ),
        }
    }
}

/// How the gate reaches the human. The surface shows the prompt and is
/// expected to eventually call `resolve(token, ...)` at most once; zero
/// calls are handled by expiry.
pub(crate) trait ConfirmationChannel: Send + Sync {
    fn request_confirmation(&self, session: &str, prompt: &str, token: &str) -> Result<(), String>;
}

/// Channel for surfaces with no human attached; CONFIRM requests then simply
/// expire.
pub(crate) struct SilentChannel;

impl ConfirmationChannel for SilentChannel {
    fn request_confirmation(&self, _session: &str, _prompt: &str, _token: &str) -> Result<(), String> {
        Ok(())
    }
}

// ── Pending state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Waiting,
    Approved,
    Rejected,
    Expired,
}

struct PendingSlot {
    token: String,
    session: String,
    tool: String,
    created_at: i64,
    deadline: Instant,
    state: Mutex<SlotState>,
    cv: Condvar,
}

// ── Gate ─────────────────────────────────────────────────────────────────

pub(crate) struct ApprovalGate {
    registry: Arc<ToolRegistry>,
    audit: Arc<TraceStore>,
    channel: Box<dyn ConfirmationChannel>,
    timeout: Duration,
    /// session → its single pending approval. The per-session rule lives
    /// here; the map mutex is held for bookkeeping only, never across the
    /// wait or an execution.
    pending: Mutex<HashMap<String, Arc<PendingSlot>>>,
}

impl ApprovalGate {
    pub(crate) fn new(
        registry: Arc<ToolRegistry>,
        audit: Arc<TraceStore>,
        channel: Box<dyn ConfirmationChannel>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            audit,
            channel,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Classify and (maybe) execute one proposed tool call. Always appends
    /// exactly one audit record; a failed append is logged and never rolls
    /// back the decision already made.
    pub(crate) fn evaluate(&self, request: &ToolInvocationRequest) -> GateOutcome {
        let tool = match self.registry.lookup(&request.tool) {
            Ok(tool) => tool,
            Err(err) => {
                // Unknown tool: refused before tier lookup, CRITICAL-equivalent.
                let reason = err.to_string();
                self.append(request, RiskTier::Critical, AuditDecision::Rejected, &reason, None);
                return GateOutcome::Refused(reason);
            }
        };
        let tier = tool.descriptor.tier;

        if let Err(reason) = ToolRegistry::validate_args(&tool.descriptor, &request.args) {
            let exec = ToolExecution::error(format!("invalid arguments: {reason}"));
            self.append(request, tier, AuditDecision::Error, &exec.output, Some(&exec.output));
            return GateOutcome::Executed(exec);
        }

        match tier {
            RiskTier::Critical => {
                let reason = format!("'{}' is classified critical and is never executed", request.tool);
                self.append(request, tier, AuditDecision::Rejected, &reason, None);
                GateOutcome::Refused(reason)
            }
            RiskTier::Auto => {
                let exec = run_tool(&tool.run, &request.args);
                let decision = if exec.is_error {
                    AuditDecision::Error
                } else {
                    AuditDecision::Executed
                };
                let error = exec.is_error.then(|| exec.output.clone());
                self.append(request, tier, decision, &exec.output, error.as_deref());
                GateOutcome::Executed(exec)
            }
            RiskTier::Confirm => self.evaluate_confirm(request, tier),
        }
    }

    fn evaluate_confirm(&self, request: &ToolInvocationRequest, tier: RiskTier) -> GateOutcome {
        let slot = {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&request.session) {
                drop(pending);
                let reason = format!(
                    "another approval is already pending for session '{}'",
                    request.session
                );
                self.append(request, tier, AuditDecision::Rejected, &reason, None);
                return GateOutcome::Busy(reason);
            }
            let token = mint_token(request);
            let slot = Arc::new(PendingSlot {
                token,
                session: request.session.clone(),
                tool: request.tool.clone(),
                created_at: now_ts(),
                deadline: Instant::now() + self.timeout,
                state: Mutex::new(SlotState::Waiting),
                cv: Condvar::new(),
            });
            pending.insert(request.session.clone(), Arc::clone(&slot));
            slot
        };

        let prompt = confirmation_prompt(request, &slot.token, self.timeout);
        if let Err(err) = self
            .channel
            .request_confirmation(&request.session, &prompt, &slot.token)
        {
            eprintln!("[gate] confirmation channel failed: {err}");
        }

        // Suspend until resolved or expired. The slot mutex guards only the
        // slot state; nothing else is held here. Expiry is written as a
        // terminal state under that same lock, so a resolve that still holds
        // the slot can never succeed once the deadline has been finalized.
        let resolution = {
            let mut state = slot.state.lock().unwrap();
            loop {
                match *state {
                    SlotState::Waiting => {}
                    terminal => break terminal,
                }
                let Some(remaining) = slot.deadline.checked_duration_since(Instant::now()) else {
                    *state = SlotState::Expired;
                    break SlotState::Expired;
                };
                let (next, _timed_out) = slot.cv.wait_timeout(state, remaining).unwrap();
                state = next;
            }
        };
        self.pending.lock().unwrap().remove(&request.session);

        match resolution {
            SlotState::Approved => {
                let tool = match self.registry.lookup(&request.tool) {
                    Ok(tool) => tool,
                    Err(err) => {
                        // Registry is immutable after startup; this cannot
                        // happen past the first lookup, but stay honest.
                        let reason = err.to_string();
                        self.append(request, tier, AuditDecision::Rejected, &reason, None);
                        return GateOutcome::Refused(reason);
                    }
                };
                let exec = run_tool(&tool.run, &request.args);
                let decision = if exec.is_error {
                    AuditDecision::Error
                } else {
                    AuditDecision::ConfirmedExecuted
                };
                let error = exec.is_error.then(|| exec.output.clone());
                self.append(request, tier, decision, &exec.output, error.as_deref());
                GateOutcome::ConfirmedExecuted(exec)
            }
            SlotState::Rejected => {
                let reason = "the user rejected this action".to_string();
                self.append(request, tier, AuditDecision::Rejected, &reason, None);
                GateOutcome::Rejected(reason)
            }
            // Waiting cannot escape the loop above.
            SlotState::Expired | SlotState::Waiting => {
                self.append(
                    request,
                    tier,
                    AuditDecision::Expired,
                    "approval not granted before the deadline",
                    None,
                );
                GateOutcome::Expired
            }
        }
    }

    /// Resolve a pending approval from the interaction surface. A token that
    /// is already resolved or expired yields `UnknownToken`; surfaces report
    /// that as "already resolved", never as a crash.
    pub(crate) fn resolve(&self, token: &str, approve: bool) -> Result<(), GateError> {
        let slot = {
            let pending = self.pending.lock().unwrap();
            pending.values().find(|s| s.token == token).cloned()
        };
        let Some(slot) = slot else {
            return Err(GateError::UnknownToken(token.to_string()));
        };
        let mut state = slot.state.lock().unwrap();
        if *state != SlotState::Waiting {
            return Err(GateError::UnknownToken(token.to_string()));
        }
        *state = if approve {
            SlotState::Approved
        } else {
            SlotState::Rejected
        };
        slot.cv.notify_all();
        Ok(())
    }

    /// Introspection view of everything currently awaiting a human.
    pub(crate) fn pending_summaries(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let pending = self.pending.lock().unwrap();
        pending
            .values()
            .map(|slot| PendingSummary {
                session: slot.session.clone(),
                token: slot.token.clone(),
                tool: slot.tool.clone(),
                created_at: slot.created_at,
                expires_in_secs: slot
                    .deadline
                    .checked_duration_since(now)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            })
            .collect()
    }

    fn append(
        &self,
        request: &ToolInvocationRequest,
        tier: RiskTier,
        decision: AuditDecision,
        summary: &str,
        error: Option<&str>,
    ) {
        let record = AuditRecord {
            id: None,
            ts_utc: now_ts(),
            session: request.session.clone(),
            tool: request.tool.clone(),
            args: redact_args(&request.args).to_string(),
            tier,
            decision,
            summary: summarize_for_audit(summary),
            error: error.map(summarize_for_audit),
        };
        if let Err(err) = self.audit.append_audit(&record) {
            eprintln!("[audit] failed to append record for '{}': {err}", request.tool);
        }
    }
}

fn run_tool(
    run: &crate::ToolFn,
    args: &serde_json::Value,
) -> ToolExecution {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(args)));
    match result {
        Ok(Ok(exec)) => exec,
        Ok(Err(err)) => ToolExecution::error(format!("Tool error: {err}")),
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            eprintln!("[gate] tool implementation panicked: {msg}");
            ToolExecution::error(format!("Internal error: tool execution panicked: {msg}"))
        }
    }
}

fn mint_token(request: &ToolInvocationRequest) -> String {
    let seed = format!(
        "{}:{}:{}:{}",
        request.session,
        request.tool,
        request.args,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    );
    format!("apr_{}", &crate::blake3_hash(seed.as_bytes()).to_hex()[..12])
}

fn confirmation_prompt(
    request: &ToolInvocationRequest,
    token: &str,
    timeout: Duration,
) -> String {
    let args = format_args_preview(&redact_args(&request.args), 200);
    let minutes = (timeout.as_secs().max(1) + 59) / 60;
    format!(
        "[CONFIRM] Tool: {}\nArgs: {args}\n\nApprove with `approve {token}` or reject with `reject {token}` within {minutes} min.",
        request.tool
    )
}

/// Chat-level `approve <token>` / `reject <token>` commands, shared by the
/// CLI and the HTTP bridge.
pub(crate) enum ApprovalChatCommand {
    Approve(String),
    Reject(String),
}

pub(crate) fn parse_approval_chat_command(text: &str) -> Option<ApprovalChatCommand> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    let cmd = parts.next()?.to_ascii_lowercase();
    let token = parts.next()?.trim();
    if token.is_empty() || parts.next().is_some() {
        return None;
    }
    match cmd.as_str() {
        "approve" => Some(ApprovalChatCommand::Approve(token.to_string())),
        "reject" => Some(ApprovalChatCommand::Reject(token.to_string())),
        _ => None,
    }
}

pub(crate) fn try_handle_approval_chat(gate: &ApprovalGate, text: &str) -> Option<String> {
    let cmd = parse_approval_chat_command(text)?;
    let (token, approve) = match cmd {
        ApprovalChatCommand::Approve(token) => (token, true),
        ApprovalChatCommand::Reject(token) => (token, false),
    };
    Some(match gate.resolve(&token, approve) {
        Ok(()) => {
            if approve {
                "Approved.".to_string()
            } else {
                "Rejected.".to_string()
            }
        }
        Err(GateError::UnknownToken(_)) => {
            "That approval was already resolved or has expired.".to_string()
        }
    })
}
