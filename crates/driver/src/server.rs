//! HTTP host for driver backends.
//!
//! Wraps any [`DriverFactory`] in an axum router speaking the protocol
//! consumed by [`RemoteDriver`](crate::client::RemoteDriver). Each `init`
//! creates a fresh driver and registers it under a new session id; `close`
//! releases and forgets it. Sessions left idle longer than the host's idle
//! timeout are closed by a background reaper.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::client::{PROTOCOL_PREFIX, SESSION_HEADER};
use crate::driver::{Driver, DriverFactory};
use crate::error::DriverError;
use crate::protocol::{
    AuditRequest, AuditResponse, DatabasesResponse, Empty, ExecRequest, ExecResponse,
    GenRollbackSqlRequest, InitRequest, InitResponse, MetasResponse, ParseRequest, ParseResponse,
    RollbackSqlResponse, TxRequest, TxResponse,
};

/// Sessions idle for this long are closed unless the host says otherwise.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

struct Session {
    driver: Arc<dyn Driver>,
    last_used: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl Session {
    fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            last_used: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Time since the last call finished, `None` while a call is running.
    fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let last_used = *self
            .last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(now.saturating_duration_since(last_used))
    }
}

/// A session borrowed for one call. Keeps the session from expiring until
/// dropped.
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    fn new(session: Arc<Session>) -> Self {
        session.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { session }
    }
}

impl Deref for SessionLease {
    type Target = dyn Driver;

    fn deref(&self) -> &Self::Target {
        self.session.driver.as_ref()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        *self
            .session
            .last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared state of the driver host.
#[derive(Clone)]
pub struct DriverHost {
    factory: Arc<dyn DriverFactory>,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    idle_timeout: Duration,
}

impl DriverHost {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of open sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session idle for at least the idle timeout. Returns how
    /// many were closed.
    pub async fn expire_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<Session>)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| {
                    session
                        .idle_for(now)
                        .is_some_and(|idle| idle >= self.idle_timeout)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|session| (id, session)))
                .collect()
        };

        for (id, session) in &expired {
            if let Err(e) = session.driver.close().await {
                tracing::warn!(session = %id, error = %e, "Failed to close idle session");
            }
            tracing::info!(session = %id, "Idle session expired");
        }
        expired.len()
    }

    /// Run [`expire_idle`](Self::expire_idle) periodically until aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let host = self.clone();
        let period = (self.idle_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                host.expire_idle().await;
            }
        })
    }

    async fn driver_for(&self, headers: &HeaderMap) -> Result<SessionLease, HostError> {
        let session = session_header(headers).ok_or_else(|| {
            HostError(DriverError::NotInitialized(
                "missing session header, call init first".to_string(),
            ))
        })?;

        // The lease is taken under the read lock so the reaper cannot remove
        // the session in between.
        let sessions = self.sessions.read().await;
        let lease = sessions.get(&session).cloned().map(SessionLease::new);
        drop(sessions);

        lease.ok_or_else(|| {
            HostError(DriverError::NotInitialized(format!(
                "unknown session: {}",
                session
            )))
        })
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Driver error rendered as a protocol reply.
#[derive(Debug)]
pub struct HostError(pub DriverError);

impl From<DriverError> for HostError {
    fn from(e: DriverError) -> Self {
        HostError(e)
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DriverError::NotInitialized(_) => StatusCode::CONFLICT,
            DriverError::Parse(_) | DriverError::Protocol(_) => StatusCode::BAD_REQUEST,
            DriverError::Execution(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DriverError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            DriverError::Connection(_) | DriverError::Transport(_) => StatusCode::BAD_GATEWAY,
        };

        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Driver call failed");
        } else {
            tracing::debug!(error = %self.0, "Driver call rejected");
        }

        (status, Json(self.0.to_wire())).into_response()
    }
}

type HostResult<T> = Result<Json<T>, HostError>;

/// POST /driver/v1/metas
async fn metas(State(host): State<DriverHost>) -> HostResult<MetasResponse> {
    let driver = host.factory.create();
    Ok(Json(driver.metas().await?))
}

/// POST /driver/v1/init
async fn init(
    State(host): State<DriverHost>,
    Json(request): Json<InitRequest>,
) -> HostResult<InitResponse> {
    let driver = host.factory.create();
    driver.init(request).await?;

    let session_id = uuid::Uuid::new_v4().to_string();
    host.sessions
        .write()
        .await
        .insert(session_id.clone(), Arc::new(Session::new(driver)));

    tracing::info!(session = %session_id, backend = %host.factory.name(), "Session opened");
    Ok(Json(InitResponse { session_id }))
}

/// POST /driver/v1/close
async fn close(State(host): State<DriverHost>, headers: HeaderMap) -> HostResult<Empty> {
    let Some(session) = session_header(&headers) else {
        return Ok(Json(Empty {}));
    };

    let removed = host.sessions.write().await.remove(&session);
    if let Some(removed) = removed {
        removed.driver.close().await?;
        tracing::info!(session = %session, "Session closed");
    }
    Ok(Json(Empty {}))
}

/// POST /driver/v1/ping
async fn ping(State(host): State<DriverHost>, headers: HeaderMap) -> HostResult<Empty> {
    host.driver_for(&headers).await?.ping().await?;
    Ok(Json(Empty {}))
}

/// POST /driver/v1/parse
async fn parse(
    State(host): State<DriverHost>,
    headers: HeaderMap,
    Json(request): Json<ParseRequest>,
) -> HostResult<ParseResponse> {
    let nodes = host
        .driver_for(&headers)
        .await?
        .parse(&request.sql_text)
        .await?;
    Ok(Json(ParseResponse { nodes }))
}

/// POST /driver/v1/audit
async fn audit(
    State(host): State<DriverHost>,
    headers: HeaderMap,
    Json(request): Json<AuditRequest>,
) -> HostResult<AuditResponse> {
    let results = host.driver_for(&headers).await?.audit(request).await?;
    Ok(Json(AuditResponse { results }))
}

/// POST /driver/v1/gen_rollback_sql
async fn gen_rollback_sql(
    State(host): State<DriverHost>,
    headers: HeaderMap,
    Json(request): Json<GenRollbackSqlRequest>,
) -> HostResult<RollbackSqlResponse> {
    let response = host
        .driver_for(&headers)
        .await?
        .gen_rollback_sql(&request.sql)
        .await?;
    Ok(Json(response))
}

/// POST /driver/v1/exec
async fn exec(
    State(host): State<DriverHost>,
    headers: HeaderMap,
    Json(request): Json<ExecRequest>,
) -> HostResult<ExecResponse> {
    let response = host.driver_for(&headers).await?.exec(&request.query).await?;
    Ok(Json(response))
}

/// POST /driver/v1/tx
async fn tx(
    State(host): State<DriverHost>,
    headers: HeaderMap,
    Json(request): Json<TxRequest>,
) -> HostResult<TxResponse> {
    let results = host.driver_for(&headers).await?.tx(&request.queries).await?;
    Ok(Json(TxResponse { results }))
}

/// POST /driver/v1/databases
async fn databases(
    State(host): State<DriverHost>,
    headers: HeaderMap,
) -> HostResult<DatabasesResponse> {
    let databases = host.driver_for(&headers).await?.databases().await?;
    Ok(Json(DatabasesResponse { databases }))
}

/// Build the protocol router for a backend.
pub fn router(host: DriverHost) -> Router {
    let route = |call: &str| format!("{}/{}", PROTOCOL_PREFIX, call);

    Router::new()
        .route(&route("metas"), post(metas))
        .route(&route("init"), post(init))
        .route(&route("close"), post(close))
        .route(&route("ping"), post(ping))
        .route(&route("parse"), post(parse))
        .route(&route("audit"), post(audit))
        .route(&route("gen_rollback_sql"), post(gen_rollback_sql))
        .route(&route("exec"), post(exec))
        .route(&route("tx"), post(tx))
        .route(&route("databases"), post(databases))
        .layer(TraceLayer::new_for_http())
        .with_state(host)
}

/// Serve a backend on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, host: DriverHost, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reaper = host.spawn_reaper();
    let result = axum::serve(listener, router(host))
        .with_graceful_shutdown(shutdown)
        .await;
    reaper.abort();
    result
}
