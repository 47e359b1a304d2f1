//! Wire messages of the driver protocol.
//!
//! Field names are the JSON names used on the wire; every dialect backend,
//! whatever language it is written in, must produce and accept these shapes.

use serde::{Deserialize, Serialize};

/// Connection parameters for `Init`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    /// Database (schema) opened by default; empty means none.
    #[serde(default)]
    pub database: String,
}

/// Reply to `Init`. The session id is a transport detail used by the
/// HTTP binding to route later calls to the same backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub session_id: String,
}

/// Statement-type tag reported by `Parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Dml,
    Ddl,
    Procedure,
    Function,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Dml => "dml",
            StatementKind::Ddl => "ddl",
            StatementKind::Procedure => "procedure",
            StatementKind::Function => "function",
        }
    }

    /// Procedures and functions share the same commit/rollback treatment.
    pub fn is_routine(&self) -> bool {
        matches!(self, StatementKind::Procedure | StatementKind::Function)
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One parsed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Normalized statement text.
    pub text: String,
    #[serde(rename = "type")]
    pub kind: StatementKind,
    /// Text with literal values replaced, used to group identical shapes.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseRequest {
    pub sql_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResponse {
    pub nodes: Vec<Node>,
}

/// Audit severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleLevel {
    #[default]
    Normal,
    Notice,
    Warn,
    Error,
}

impl RuleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleLevel::Normal => "normal",
            RuleLevel::Notice => "notice",
            RuleLevel::Warn => "warn",
            RuleLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for RuleLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(RuleLevel::Normal),
            "notice" => Ok(RuleLevel::Notice),
            "warn" => Ok(RuleLevel::Warn),
            "error" => Ok(RuleLevel::Error),
            _ => Err(format!("Unknown rule level: {}", s)),
        }
    }
}

/// An audit rule as configured for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Rule parameter value (threshold, pattern, ...).
    #[serde(default)]
    pub value: String,
    pub level: RuleLevel,
    #[serde(rename = "typ", default)]
    pub rule_type: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditRequest {
    pub rules: Vec<Rule>,
    /// Statements to audit, in sequence order.
    pub sqls: Vec<String>,
    /// Schema the statements run against.
    #[serde(default)]
    pub schema: String,
    /// Extra statements applied virtually before auditing (related DDL).
    #[serde(default)]
    pub context: Vec<String>,
}

/// Audit outcome of one statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResult {
    pub message: String,
    pub level: RuleLevel,
}

impl AuditResult {
    pub fn normal() -> Self {
        Self {
            message: String::new(),
            level: RuleLevel::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResponse {
    /// Positionally aligned with `AuditRequest::sqls`.
    pub results: Vec<AuditResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenRollbackSqlRequest {
    pub sql: String,
}

/// Compensating statement, or an empty one with the reason it is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSqlResponse {
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub reason: String,
}

impl RollbackSqlResponse {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            sql: String::new(),
            reason: reason.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub query: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub last_insert_id: i64,
    pub rows_affected: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRequest {
    pub queries: Vec<String>,
}

/// Per-statement result inside a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementOutcome {
    #[serde(default)]
    pub last_insert_id: i64,
    #[serde(default)]
    pub rows_affected: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatementOutcome {
    pub fn ok(exec: ExecResponse) -> Self {
        Self {
            last_insert_id: exec.last_insert_id,
            rows_affected: exec.rows_affected,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResponse {
    /// Positionally aligned with `TxRequest::queries`.
    pub results: Vec<StatementOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasesResponse {
    pub databases: Vec<String>,
}

/// Backend name and the catalog of rules it can evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetasResponse {
    pub name: String,
    pub rules: Vec<Rule>,
}

/// Empty reply for calls without output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_uses_type_on_the_wire() {
        let json = serde_json::json!({
            "text": "CREATE TABLE t(id int)",
            "type": "ddl",
            "fingerprint": "create table t(id int)"
        });
        let node: Node = serde_json::from_value(json).unwrap();
        assert_eq!(node.kind, StatementKind::Ddl);

        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["type"], "ddl");
    }

    #[test]
    fn test_rule_level_ordering() {
        assert!(RuleLevel::Normal < RuleLevel::Notice);
        assert!(RuleLevel::Warn < RuleLevel::Error);
        assert_eq!("warn".parse::<RuleLevel>().unwrap(), RuleLevel::Warn);
        assert!("fatal".parse::<RuleLevel>().is_err());
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let json = serde_json::json!({"name": "ddl_check_pk", "level": "error"});
        let rule: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(rule.name, "ddl_check_pk");
        assert!(!rule.is_default);
        assert!(rule.rule_type.is_empty());
    }

    #[test]
    fn test_statement_outcome_omits_empty_error() {
        let json = serde_json::to_string(&StatementOutcome::ok(ExecResponse {
            last_insert_id: 0,
            rows_affected: 3,
        }))
        .unwrap();
        assert!(!json.contains("error"));
        assert!(StatementOutcome::failed("boom").error.is_some());
    }

    #[test]
    fn test_routine_kinds() {
        assert!(StatementKind::Procedure.is_routine());
        assert!(StatementKind::Function.is_routine());
        assert!(!StatementKind::Ddl.is_routine());
    }
}
