//! Structured report items attached to a task's outcome.

use serde::{Deserialize, Serialize};

/// Report codes emitted by the task executor itself.
pub mod codes {
    pub const COMMAND_UNKNOWN: &str = "COMMAND_UNKNOWN";
    pub const NOT_AUTHORIZED: &str = "NOT_AUTHORIZED";
    pub const COMMAND_INVALID_PAYLOAD: &str = "COMMAND_INVALID_PAYLOAD";
}

/// Severity of a report item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportSeverity {
    Error,
    Warning,
    Info,
    Debug,
    Deprecation,
}

impl std::fmt::Display for ReportSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Deprecation => "deprecation",
        };
        write!(f, "{s}")
    }
}

/// A single severity-tagged diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportItem {
    pub severity: ReportSeverity,
    /// Machine-readable code, e.g. `COMMAND_UNKNOWN`.
    pub code: String,
    /// Human-readable text.
    pub message: String,
    /// Code-specific details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ReportItem {
    pub fn new(
        severity: ReportSeverity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ReportSeverity::Error, code, message)
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ReportSeverity::Warning, code, message)
    }

    pub fn info(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ReportSeverity::Info, code, message)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn command_unknown(command_name: &str) -> Self {
        Self::error(
            codes::COMMAND_UNKNOWN,
            format!("Command '{command_name}' does not exist"),
        )
        .with_payload(serde_json::json!({ "command": command_name }))
    }

    pub fn not_authorized() -> Self {
        Self::error(
            codes::NOT_AUTHORIZED,
            "Current user is not authorized for this operation",
        )
    }

    pub fn command_invalid_payload(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::error(
            codes::COMMAND_INVALID_PAYLOAD,
            format!("Invalid command parameters: {reason}"),
        )
        .with_payload(serde_json::json!({ "reason": reason }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_wire_format() {
        let json = serde_json::to_string(&ReportSeverity::Deprecation).unwrap();
        assert_eq!(json, "\"DEPRECATION\"");
        assert_eq!(ReportSeverity::Warning.to_string(), "warning");
    }

    #[test]
    fn null_payload_is_omitted() {
        let item = ReportItem::info("PROGRESS", "half way there");
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("payload").is_none());

        let parsed: ReportItem = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn executor_reports_carry_their_codes() {
        let unknown = ReportItem::command_unknown("resource.enable");
        assert_eq!(unknown.code, codes::COMMAND_UNKNOWN);
        assert_eq!(unknown.severity, ReportSeverity::Error);
        assert_eq!(unknown.payload["command"], "resource.enable");

        assert_eq!(ReportItem::not_authorized().code, codes::NOT_AUTHORIZED);
        let invalid = ReportItem::command_invalid_payload("missing field `seconds`");
        assert_eq!(invalid.code, codes::COMMAND_INVALID_PAYLOAD);
        assert!(invalid.message.contains("missing field"));
    }
}
