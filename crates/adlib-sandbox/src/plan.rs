//! Plan envelope validation.
//!
//! The oracle returns a text blob that should be a JSON object:
//!
//! ```json
//! {
//!   "action": "create",
//!   "resource": "members",
//!   "identifier": null,
//!   "criteria": {},
//!   "payload": {"name": "Alice"},
//!   "code": {"language": "python", "block": "```python\n...\n```"}
//! }
//! ```
//!
//! Oracles wrap things in Markdown fences more often than not, so fences are
//! stripped from the whole blob and from the embedded code block before
//! parsing. Anything beyond that wrapping convention is a [`PlanError`].
//!
//! Only the envelope is validated here; the code itself goes through the
//! allowlist validator next.

use serde_json::{Map, Value};
use thiserror::Error;

/// The seven request intents an oracle may declare.
///
/// The tag is descriptive metadata for logging and audit; behavior always
/// comes from the validated, executed snippet, never from a per-action
/// handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Create a record.
    Create,
    /// Fetch one record.
    Get,
    /// List records with paging.
    List,
    /// Replace a record wholesale.
    Replace,
    /// Shallow-merge into a record.
    Patch,
    /// Delete a record.
    Delete,
    /// Filtered search.
    Search,
}

impl Action {
    /// Parse the wire form of the action tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "get" => Some(Self::Get),
            "list" => Some(Self::List),
            "replace" => Some(Self::Replace),
            "patch" => Some(Self::Patch),
            "delete" => Some(Self::Delete),
            "search" => Some(Self::Search),
            _ => None,
        }
    }

    /// The wire form of the action tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Get => "get",
            Self::List => "list",
            Self::Replace => "replace",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Search => "search",
        }
    }
}

/// A validated plan, ready for the code validator and execution harness.
/// Built per request, discarded after producing a reply.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Declared intent.
    pub action: Action,
    /// Target collection name.
    pub resource: String,
    /// Record identifier, when the intent names one.
    pub identifier: Option<Value>,
    /// Search/filter criteria.
    pub criteria: Map<String, Value>,
    /// Write payload.
    pub payload: Map<String, Value>,
    /// The snippet source, fences already stripped.
    pub code: String,
}

impl Plan {
    /// The plan as the snippet sees it under the `plan` binding.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "action": self.action.as_str(),
            "resource": self.resource,
            "identifier": self.identifier.clone().unwrap_or(Value::Null),
            "criteria": Value::Object(self.criteria.clone()),
            "payload": Value::Object(self.payload.clone()),
        })
    }
}

/// Errors produced while validating the oracle's output envelope.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The blob was not parseable as JSON at all.
    #[error("oracle output is not valid JSON: {message}")]
    NotJson {
        /// Parser diagnostic.
        message: String,
    },

    /// The blob parsed but is not a JSON object.
    #[error("oracle output is not a JSON object")]
    NotAnObject,

    /// A required field is missing.
    #[error("plan is missing required field `{field}`")]
    MissingField {
        /// The absent field.
        field: &'static str,
    },

    /// `action` is not one of the seven allowed values.
    #[error("unknown plan action `{action}`")]
    UnknownAction {
        /// The rejected action string.
        action: String,
    },

    /// `resource` is empty or not a string.
    #[error("plan resource must be a non-empty string")]
    InvalidResource,

    /// `identifier` is present but not null, a string, or a number.
    #[error("plan identifier must be null, a string, or a number")]
    InvalidIdentifier,

    /// `criteria` or `payload` is present but not an object.
    #[error("plan field `{field}` must be an object")]
    NotAnObjectField {
        /// The offending field.
        field: &'static str,
    },

    /// The code block is missing, empty, or not a single string.
    #[error("plan code block is {problem}")]
    InvalidCode {
        /// What is wrong with the block.
        problem: &'static str,
    },
}

/// Strip one layer of Markdown code fences, if present. Handles both
/// ```` ```python ```` and bare ```` ``` ```` openers.
fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    // Drop the opening fence line (which may carry a language tag).
    lines.remove(0);
    if lines.last().map(|l| l.trim()) == Some("```") {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Parse and structurally validate raw oracle output into a [`Plan`].
///
/// Optional fields are normalized: `identifier` defaults to `None`,
/// `criteria` and `payload` default to `{}`. Unknown envelope fields are
/// ignored. No semantic validation of the code happens here.
pub fn parse_plan(raw: &str) -> Result<Plan, PlanError> {
    let unfenced = strip_fences(raw);
    let value: Value = serde_json::from_str(&unfenced).map_err(|e| PlanError::NotJson {
        message: e.to_string(),
    })?;
    let obj = value.as_object().ok_or(PlanError::NotAnObject)?;

    let action_str = obj
        .get("action")
        .and_then(Value::as_str)
        .ok_or(PlanError::MissingField { field: "action" })?;
    let action = Action::parse(action_str).ok_or_else(|| PlanError::UnknownAction {
        action: action_str.to_string(),
    })?;

    let resource = match obj.get("resource") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(_) => return Err(PlanError::InvalidResource),
        None => return Err(PlanError::MissingField { field: "resource" }),
    };

    let identifier = match obj.get("identifier") {
        None | Some(Value::Null) => None,
        Some(v @ Value::String(_)) | Some(v @ Value::Number(_)) => Some(v.clone()),
        Some(_) => return Err(PlanError::InvalidIdentifier),
    };

    let criteria = optional_object(obj, "criteria")?;
    let payload = optional_object(obj, "payload")?;

    let code_field = obj
        .get("code")
        .ok_or(PlanError::MissingField { field: "code" })?;
    let block = match code_field {
        Value::String(s) => s.as_str(),
        Value::Object(code_obj) => code_obj
            .get("block")
            .and_then(Value::as_str)
            .ok_or(PlanError::InvalidCode {
                problem: "missing its `block` string",
            })?,
        _ => {
            return Err(PlanError::InvalidCode {
                problem: "not a string or object",
            })
        }
    };
    let code = strip_fences(block);
    if code.is_empty() {
        return Err(PlanError::InvalidCode { problem: "empty" });
    }

    Ok(Plan {
        action,
        resource,
        identifier,
        criteria,
        payload,
        code,
    })
}

fn optional_object(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Map<String, Value>, PlanError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(m)) => Ok(m.clone()),
        Some(_) => Err(PlanError::NotAnObjectField { field }),
    }
}
