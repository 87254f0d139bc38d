use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::{RiskTier, ToolExecution};

// ── Descriptors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ArgKind {
    String,
    Integer,
    Boolean,
}

impl ArgKind {
    fn json_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ArgSpec {
    pub(crate) name: String,
    pub(crate) kind: ArgKind,
    pub(crate) required: bool,
    pub(crate) description: String,
}

impl ArgSpec {
    pub(crate) fn new(name: &str, kind: ArgKind, required: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required,
            description: description.to_string(),
        }
    }
}

/// Static metadata for one invocable operation. Registered once at startup,
/// immutable thereafter.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ToolDescriptor {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) tier: RiskTier,
    pub(crate) args: Vec<ArgSpec>,
}

// ── Registry ─────────────────────────────────────────────────────────────

pub(crate) type ToolFn =
    Box<dyn Fn(&serde_json::Value) -> Result<ToolExecution, String> + Send + Sync>;

pub(crate) struct RegisteredTool {
    pub(crate) descriptor: ToolDescriptor,
    pub(crate) run: ToolFn,
}

#[derive(Debug, Error)]
pub(crate) enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Authoritative name → descriptor + implementation mapping. Populated during
/// startup; read-only in the steady state, so lookups take no lock.
#[derive(Default)]
pub(crate) struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        descriptor: ToolDescriptor,
        run: ToolFn,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        self.tools
            .insert(descriptor.name.clone(), RegisteredTool { descriptor, run });
        Ok(())
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<&RegisteredTool, RegistryError> {
        self.tools
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub(crate) fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values().map(|t| &t.descriptor)
    }

    pub(crate) fn len(&self) -> usize {
        self.tools.len()
    }

    /// Anthropic-style tool definitions for the reasoning backend. When
    /// `allowed` is set, only those names are offered.
    pub(crate) fn definitions_json(&self, allowed: Option<&[String]>) -> Vec<serde_json::Value> {
        let mut defs: Vec<serde_json::Value> = self
            .descriptors()
            .filter(|d| match allowed {
                Some(names) => names.iter().any(|n| n == &d.name),
                None => true,
            })
            .map(descriptor_to_schema)
            .collect();
        // Stable order keeps prompts cache-friendly
        defs.sort_by(|a, b| {
            a.get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .cmp(b.get("name").and_then(|v| v.as_str()).unwrap_or(""))
        });
        defs
    }

    /// Required/type check on a concrete argument mapping.
    pub(crate) fn validate_args(
        descriptor: &ToolDescriptor,
        args: &serde_json::Value,
    ) -> Result<(), String> {
        let map = match args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => {
                if descriptor.args.iter().any(|a| a.required) {
                    return Err("arguments required but none supplied".to_string());
                }
                return Ok(());
            }
            _ => return Err("arguments must be a JSON object".to_string()),
        };
        for spec in &descriptor.args {
            match map.get(&spec.name) {
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(format!(
                            "argument '{}' must be a {}",
                            spec.name,
                            spec.kind.json_type()
                        ));
                    }
                }
                None if spec.required => {
                    return Err(format!("missing required argument '{}'", spec.name));
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn descriptor_to_schema(descriptor: &ToolDescriptor) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for arg in &descriptor.args {
        properties.insert(
            arg.name.clone(),
            serde_json::json!({
                "type": arg.kind.json_type(),
                "description": arg.description,
            }),
        );
        if arg.required {
            required.push(serde_json::Value::String(arg.name.clone()));
        }
    }
    serde_json::json!({
        "name": descriptor.name,
        "description": descriptor.description,
        "input_schema": {
            "type": "object",
            "properties": properties,
            "required": required,
        },
    })
}
