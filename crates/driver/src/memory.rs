//! In-process driver backend.
//!
//! `MemoryDriver` understands just enough SQL to split a batch, tag each
//! statement and fingerprint it. Audit levels, rollback statements and
//! execution failures can be scripted per statement through the shared
//! [`MemoryState`], which also journals every call made against it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::driver::{Driver, DriverFactory};
use crate::error::{DriverError, DriverResult};
use crate::protocol::{
    AuditRequest, AuditResult, ExecResponse, InitRequest, MetasResponse, Node,
    RollbackSqlResponse, Rule, RuleLevel, StatementKind, StatementOutcome,
};

pub const BACKEND_NAME: &str = "memory";

const RULE_WHERE_EXIST: &str = "dml_check_where_exist";
const RULE_PRIMARY_KEY: &str = "ddl_check_primary_key";

static ROUTINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*create\s+(or\s+replace\s+)?(definer\s*=\s*\S+\s+)?(procedure|function)\b")
        .expect("valid routine regex")
});
static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*create\s+table\s+(if\s+not\s+exists\s+)?([`\w.]+)")
        .expect("valid create table regex")
});
static STRING_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#).expect("valid string regex"));
static NUMBER_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid number regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static WHERE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwhere\b").expect("valid where regex"));

/// Scripted audit outcome for one statement.
#[derive(Debug, Clone)]
struct AuditScript {
    result: AuditResult,
    /// The result only applies while no context statement contains this text.
    unless_context: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    audits: HashMap<String, AuditScript>,
    rollbacks: HashMap<String, RollbackSqlResponse>,
    failures: HashMap<String, String>,
    tx_failure: Option<String>,
    audit_failure: Option<String>,
    unreachable: bool,
    latency: Duration,
    databases: Vec<String>,
    calls: Vec<String>,
    executed: Vec<String>,
    audit_requests: Vec<AuditRequest>,
}

/// State shared by every driver created from one [`MemoryDriverFactory`].
#[derive(Clone, Default)]
pub struct MemoryState {
    inner: Arc<Mutex<Inner>>,
}

fn key(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim().to_string()
}

impl MemoryState {
    pub fn new() -> Self {
        let state = Self::default();
        state.lock().databases = vec!["information_schema".to_string(), "app".to_string()];
        state
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `sql` audit with the given level.
    pub fn set_audit_level(&self, sql: &str, level: RuleLevel, message: &str) {
        self.lock().audits.insert(
            key(sql),
            AuditScript {
                result: AuditResult {
                    message: message.to_string(),
                    level,
                },
                unless_context: None,
            },
        );
    }

    /// Make `sql` audit with the given level unless a context statement
    /// containing `context` is supplied.
    pub fn set_audit_level_without_context(
        &self,
        sql: &str,
        level: RuleLevel,
        message: &str,
        context: &str,
    ) {
        self.lock().audits.insert(
            key(sql),
            AuditScript {
                result: AuditResult {
                    message: message.to_string(),
                    level,
                },
                unless_context: Some(context.to_string()),
            },
        );
    }

    /// Script the `GenRollbackSQL` reply for `sql`.
    pub fn set_rollback(&self, sql: &str, rollback: &str) {
        self.lock().rollbacks.insert(
            key(sql),
            RollbackSqlResponse {
                sql: rollback.to_string(),
                reason: String::new(),
            },
        );
    }

    /// Make executing `sql` fail with `error`.
    pub fn fail_on(&self, sql: &str, error: &str) {
        self.lock().failures.insert(key(sql), error.to_string());
    }

    /// Make the whole `Tx` call fail.
    pub fn fail_tx(&self, error: &str) {
        self.lock().tx_failure = Some(error.to_string());
    }

    /// Make every `Audit` call fail.
    pub fn fail_audit(&self, error: &str) {
        self.lock().audit_failure = Some(error.to_string());
    }

    /// Make `Init` and `Ping` fail as if the instance were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Delay every `Exec` and `Tx` call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_databases(&self, databases: &[&str]) {
        self.lock().databases = databases.iter().map(|d| d.to_string()).collect();
    }

    /// Every protocol call received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls named `call`.
    pub fn call_count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == call).count()
    }

    /// Statements applied to the (imaginary) database, in order.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Audit requests received, in order.
    pub fn audit_requests(&self) -> Vec<AuditRequest> {
        self.lock().audit_requests.clone()
    }

    fn record(&self, call: &str) {
        self.lock().calls.push(call.to_string());
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Split a batch on top-level semicolons, keeping routine bodies whole.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut word = String::new();
    let mut last_word = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for ch in sql.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }

        if ch.is_alphanumeric() || ch == '_' {
            word.push(ch);
            current.push(ch);
            continue;
        }

        if !word.is_empty() {
            track_block(&current, &word, &mut last_word, &mut depth);
            word.clear();
        }

        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                current.push(ch);
            }
            ';' if depth == 0 => flush_statement(&mut statements, &mut current),
            _ => current.push(ch),
        }
    }

    flush_statement(&mut statements, &mut current);
    statements
}

fn track_block(current: &str, word: &str, last_word: &mut String, depth: &mut usize) {
    if !ROUTINE_RE.is_match(current) {
        return;
    }
    let upper = word.to_ascii_uppercase();
    match upper.as_str() {
        "BEGIN" => *depth += 1,
        "END" => *depth = depth.saturating_sub(1),
        // END IF / END LOOP close a control block, not the routine body.
        "IF" | "LOOP" | "WHILE" | "REPEAT" | "CASE" if last_word == "END" => *depth += 1,
        _ => {}
    }
    *last_word = upper;
}

fn flush_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

/// Tag a single statement.
pub fn classify(statement: &str) -> DriverResult<StatementKind> {
    if let Some(caps) = ROUTINE_RE.captures(statement) {
        let kind = caps
            .get(3)
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        return Ok(if kind == "function" {
            StatementKind::Function
        } else {
            StatementKind::Procedure
        });
    }

    let first = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    match first.as_str() {
        "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" | "WITH" => {
            Ok(StatementKind::Dml)
        }
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT" => Ok(StatementKind::Ddl),
        _ => Err(DriverError::Parse(format!(
            "unsupported statement: {}",
            statement
        ))),
    }
}

/// Normalize a statement so that literal values do not matter.
pub fn fingerprint(statement: &str) -> String {
    let without_strings = STRING_LITERAL_RE.replace_all(statement, "?");
    let without_numbers = NUMBER_LITERAL_RE.replace_all(&without_strings, "?");
    WHITESPACE_RE
        .replace_all(without_numbers.trim(), " ")
        .to_lowercase()
}

fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: RULE_WHERE_EXIST.to_string(),
            desc: "UPDATE/DELETE must have a WHERE clause".to_string(),
            value: String::new(),
            level: RuleLevel::Error,
            rule_type: "dml".to_string(),
            is_default: true,
        },
        Rule {
            name: RULE_PRIMARY_KEY.to_string(),
            desc: "CREATE TABLE must declare a primary key".to_string(),
            value: String::new(),
            level: RuleLevel::Warn,
            rule_type: "ddl".to_string(),
            is_default: true,
        },
    ]
}

fn evaluate_rules(statement: &str, rules: &[Rule]) -> AuditResult {
    let upper = statement.trim_start().to_ascii_uppercase();
    let mut result = AuditResult::normal();

    for rule in rules {
        let violated = match rule.name.as_str() {
            RULE_WHERE_EXIST => {
                (upper.starts_with("UPDATE") || upper.starts_with("DELETE"))
                    && !WHERE_RE.is_match(statement)
            }
            RULE_PRIMARY_KEY => {
                CREATE_TABLE_RE.is_match(statement) && !upper.contains("PRIMARY KEY")
            }
            _ => false,
        };

        if violated && rule.level >= result.level {
            result = AuditResult {
                message: format!("[{}]{}", rule.level.as_str(), rule.desc),
                level: rule.level,
            };
        }
    }
    result
}

fn rows_affected(statement: &str) -> i64 {
    match classify(statement) {
        Ok(StatementKind::Dml) if !statement.trim_start().to_ascii_uppercase().starts_with("SELECT") => 1,
        _ => 0,
    }
}

/// A driver session over [`MemoryState`].
pub struct MemoryDriver {
    state: MemoryState,
    connected: AtomicBool,
}

impl MemoryDriver {
    pub fn new(state: MemoryState) -> Self {
        Self {
            state,
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self, call: &str) -> DriverResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::NotInitialized(format!(
                "{} called before init",
                call
            )))
        }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn metas(&self) -> DriverResult<MetasResponse> {
        self.state.record("metas");
        Ok(MetasResponse {
            name: BACKEND_NAME.to_string(),
            rules: default_rules(),
        })
    }

    async fn init(&self, request: InitRequest) -> DriverResult<()> {
        self.state.record("init");
        if self.state.lock().unreachable {
            return Err(DriverError::Connection(format!(
                "cannot connect to {}:{}",
                request.host, request.port
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> DriverResult<()> {
        self.state.record("ping");
        self.ensure_connected("ping")?;
        if self.state.lock().unreachable {
            return Err(DriverError::Connection("instance is unreachable".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> DriverResult<()> {
        self.state.record("close");
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn parse(&self, sql_text: &str) -> DriverResult<Vec<Node>> {
        self.state.record("parse");
        self.ensure_connected("parse")?;

        split_statements(sql_text)
            .into_iter()
            .map(|text| {
                let kind = classify(&text)?;
                Ok(Node {
                    fingerprint: fingerprint(&text),
                    text,
                    kind,
                })
            })
            .collect()
    }

    async fn audit(&self, request: AuditRequest) -> DriverResult<Vec<AuditResult>> {
        self.state.record("audit");
        self.ensure_connected("audit")?;

        let mut inner = self.state.lock();
        inner.audit_requests.push(request.clone());
        if let Some(error) = &inner.audit_failure {
            return Err(DriverError::Execution(error.clone()));
        }

        let results = request
            .sqls
            .iter()
            .map(|sql| match inner.audits.get(&key(sql)) {
                Some(script) => {
                    let satisfied = script.unless_context.as_ref().is_some_and(|needle| {
                        request.context.iter().any(|c| c.contains(needle.as_str()))
                    });
                    if satisfied {
                        AuditResult::normal()
                    } else {
                        script.result.clone()
                    }
                }
                None => evaluate_rules(sql, &request.rules),
            })
            .collect();
        Ok(results)
    }

    async fn gen_rollback_sql(&self, sql: &str) -> DriverResult<RollbackSqlResponse> {
        self.state.record("gen_rollback_sql");
        self.ensure_connected("gen_rollback_sql")?;

        if let Some(scripted) = self.state.lock().rollbacks.get(&key(sql)) {
            return Ok(scripted.clone());
        }

        Ok(match classify(sql)? {
            StatementKind::Ddl => match CREATE_TABLE_RE.captures(sql).and_then(|c| c.get(2)) {
                Some(table) => RollbackSqlResponse {
                    sql: format!("DROP TABLE {}", table.as_str()),
                    reason: String::new(),
                },
                None => RollbackSqlResponse::unavailable("DDL without safe inverse"),
            },
            StatementKind::Procedure | StatementKind::Function => {
                RollbackSqlResponse::unavailable("procedure and function bodies are not rolled back")
            }
            StatementKind::Dml => {
                RollbackSqlResponse::unavailable("row images are not captured by this backend")
            }
        })
    }

    async fn exec(&self, query: &str) -> DriverResult<ExecResponse> {
        self.state.record("exec");
        self.ensure_connected("exec")?;
        self.state.delay().await;

        let mut inner = self.state.lock();
        if let Some(error) = inner.failures.get(&key(query)) {
            return Err(DriverError::Execution(error.clone()));
        }
        inner.executed.push(key(query));
        Ok(ExecResponse {
            last_insert_id: 0,
            rows_affected: rows_affected(query),
        })
    }

    async fn tx(&self, queries: &[String]) -> DriverResult<Vec<StatementOutcome>> {
        self.state.record("tx");
        self.ensure_connected("tx")?;
        self.state.delay().await;

        let mut inner = self.state.lock();
        if let Some(error) = &inner.tx_failure {
            return Err(DriverError::Execution(error.clone()));
        }

        let outcomes: Vec<StatementOutcome> = queries
            .iter()
            .map(|query| match inner.failures.get(&key(query)) {
                Some(error) => StatementOutcome::failed(error.clone()),
                None => StatementOutcome::ok(ExecResponse {
                    last_insert_id: 0,
                    rows_affected: rows_affected(query),
                }),
            })
            .collect();

        // Nothing is applied unless every statement succeeded.
        if outcomes.iter().all(StatementOutcome::is_ok) {
            inner.executed.extend(queries.iter().map(|q| key(q)));
        }
        Ok(outcomes)
    }

    async fn databases(&self) -> DriverResult<Vec<String>> {
        self.state.record("databases");
        self.ensure_connected("databases")?;
        Ok(self.state.lock().databases.clone())
    }
}

/// Factory creating [`MemoryDriver`]s over one shared state.
#[derive(Clone, Default)]
pub struct MemoryDriverFactory {
    state: MemoryState,
}

impl MemoryDriverFactory {
    pub fn new(state: MemoryState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &MemoryState {
        &self.state
    }
}

impl DriverFactory for MemoryDriverFactory {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn create(&self) -> Arc<dyn Driver> {
        Arc::new(MemoryDriver::new(self.state.clone()))
    }
}
