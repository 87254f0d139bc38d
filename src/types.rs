use serde::{Deserialize, Serialize};

// ── Risk model ───────────────────────────────────────────────────────────

/// Static risk classification of a tool. Assigned once per descriptor at
/// registration; never overridable per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RiskTier {
    /// Safe — execute immediately, no human in the loop.
    Auto,
    /// Needs explicit human approval before executing (bounded wait).
    Confirm,
    /// Never executed; refused unconditionally.
    Critical,
}

impl RiskTier {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Confirm => "confirm",
            Self::Critical => "critical",
        }
    }
    pub(crate) fn from_db_str(s: &str) -> Self {
        match s {
            "auto" => Self::Auto,
            "critical" => Self::Critical,
            _ => Self::Confirm,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Audit records ────────────────────────────────────────────────────────

/// Terminal decision recorded for every tool invocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AuditDecision {
    Executed,
    ConfirmedExecuted,
    Rejected,
    Expired,
    Error,
}

impl AuditDecision {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::ConfirmedExecuted => "confirmed_executed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Error => "error",
        }
    }
    pub(crate) fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "executed" => Some(Self::Executed),
            "confirmed_executed" => Some(Self::ConfirmedExecuted),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit row. Appended exactly once per invocation request's
/// terminal outcome; never updated or deleted by the running process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AuditRecord {
    #[serde(default)]
    pub(crate) id: Option<i64>,
    pub(crate) ts_utc: i64,
    pub(crate) session: String,
    pub(crate) tool: String,
    /// Serialized (and secret-redacted) argument mapping.
    pub(crate) args: String,
    pub(crate) tier: RiskTier,
    pub(crate) decision: AuditDecision,
    /// Truncated result summary — never raw secrets or full payloads.
    pub(crate) summary: String,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

/// Filter for audit introspection queries. All fields optional; results are
/// newest-first.
#[derive(Debug, Clone, Default)]
pub(crate) struct AuditFilter {
    pub(crate) session: Option<String>,
    pub(crate) tool: Option<String>,
    pub(crate) decision: Option<AuditDecision>,
    pub(crate) limit: usize,
}

// ── Corrections ──────────────────────────────────────────────────────────

/// A user-issued correction of a prior assistant reply. `applied` flips true
/// the first time the correction is folded into a later prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CorrectionRecord {
    #[serde(default)]
    pub(crate) id: Option<i64>,
    pub(crate) ts_utc: i64,
    pub(crate) session: String,
    pub(crate) original: String,
    pub(crate) correction: String,
    pub(crate) applied: bool,
}

// ── Invocation requests ──────────────────────────────────────────────────

/// One proposed tool call, created per reasoning step and consumed
/// immediately by the approval gate. Not persisted on its own — it is
/// embedded in the audit record.
#[derive(Debug, Clone)]
pub(crate) struct ToolInvocationRequest {
    pub(crate) session: String,
    pub(crate) step: usize,
    pub(crate) tool: String,
    pub(crate) args: serde_json::Value,
}

/// Outcome of running (or declining to run) a tool implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ToolExecution {
    pub(crate) output: String,
    pub(crate) details: serde_json::Value,
    pub(crate) is_error: bool,
}

impl ToolExecution {
    pub(crate) fn error(msg: impl Into<String>) -> Self {
        let output = msg.into();
        Self {
            details: serde_json::json!({ "error": output }),
            output,
            is_error: true,
        }
    }
}

// ── Transcript shapes ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentToolCall {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentMessage {
    pub(crate) role: String,
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) tool_calls: Vec<AgentToolCall>,
    #[serde(default)]
    pub(crate) tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) is_error: Option<bool>,
}

impl AgentMessage {
    pub(crate) fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: None,
        }
    }

    pub(crate) fn tool_result(call_id: &str, output: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(output.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
            is_error: Some(is_error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AgentToolResult {
    pub(crate) id: String,
    pub(crate) tool: String,
    pub(crate) output: String,
    pub(crate) is_error: bool,
}

/// One persisted conversational turn, replayed for session continuity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionTurn {
    pub(crate) role: String,
    pub(crate) content: String,
    pub(crate) timestamp: i64,
}

/// Result of driving one user turn to completion.
#[derive(Debug, Serialize)]
pub(crate) struct TurnOutput {
    pub(crate) session: String,
    pub(crate) final_text: Option<String>,
    pub(crate) steps: usize,
    pub(crate) tool_results: Vec<AgentToolResult>,
}

/// Declared per-turn policy, supplied by the surface driving the loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct TurnPolicy {
    /// When set, no final answer is accepted until at least one successful
    /// tool execution appears in the turn's transcript.
    pub(crate) require_tool: bool,
    /// When set, only these tools are offered to the reasoning backend.
    pub(crate) allowed_tools: Option<Vec<String>>,
}

// ── Approval surface shapes ──────────────────────────────────────────────

/// Introspection view of one pending approval, exposed by the surfaces.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct PendingSummary {
    pub(crate) session: String,
    pub(crate) token: String,
    pub(crate) tool: String,
    pub(crate) created_at: i64,
    pub(crate) expires_in_secs: u64,
}
