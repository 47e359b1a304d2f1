//! The `Driver` contract every dialect backend implements.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DriverResult;
use crate::protocol::{
    AuditRequest, AuditResult, ExecResponse, InitRequest, MetasResponse, Node,
    RollbackSqlResponse, StatementOutcome,
};

/// A dialect backend.
///
/// All calls except `init`/`close` are stateless with respect to the
/// caller. `init` must succeed before any stateful call (`ping`, `parse`,
/// `audit`, `gen_rollback_sql`, `exec`, `tx`, `databases`); `close` releases
/// the connection and is idempotent.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend name and supported rule catalog.
    async fn metas(&self) -> DriverResult<MetasResponse>;

    async fn init(&self, request: InitRequest) -> DriverResult<()>;

    async fn ping(&self) -> DriverResult<()>;

    async fn close(&self) -> DriverResult<()>;

    /// Split raw SQL into ordered statements.
    async fn parse(&self, sql_text: &str) -> DriverResult<Vec<Node>>;

    /// Audit statements; the result is aligned 1:1 with `request.sqls`.
    async fn audit(&self, request: AuditRequest) -> DriverResult<Vec<AuditResult>>;

    async fn gen_rollback_sql(&self, sql: &str) -> DriverResult<RollbackSqlResponse>;

    async fn exec(&self, query: &str) -> DriverResult<ExecResponse>;

    /// Run all queries in one transaction; one outcome per query, in order.
    async fn tx(&self, queries: &[String]) -> DriverResult<Vec<StatementOutcome>>;

    async fn databases(&self) -> DriverResult<Vec<String>>;
}

/// Creates fresh, not yet initialized driver handles.
///
/// Each handle is owned by exactly one workflow run, which brackets it with
/// `init` and `close`.
pub trait DriverFactory: Send + Sync {
    /// Backend name this factory produces drivers for.
    fn name(&self) -> &str;

    fn create(&self) -> Arc<dyn Driver>;
}
