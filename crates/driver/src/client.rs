//! HTTP client for remote driver backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::driver::{Driver, DriverFactory};
use crate::error::{DriverError, DriverResult, WireError};
use crate::protocol::{
    AuditRequest, AuditResponse, AuditResult, DatabasesResponse, Empty, ExecRequest, ExecResponse,
    GenRollbackSqlRequest, InitRequest, InitResponse, MetasResponse, Node, ParseRequest,
    ParseResponse, RollbackSqlResponse, StatementOutcome, TxRequest, TxResponse,
};

/// Header carrying the session opened by `init`.
pub const SESSION_HEADER: &str = "x-sqlgate-session";

/// Path prefix of every protocol call.
pub const PROTOCOL_PREFIX: &str = "/driver/v1";

/// Driver reached over HTTP.
///
/// One `RemoteDriver` maps to one backend session: `init` stores the session
/// id returned by the backend, `close` forgets it.
///
/// `Exec`, `Tx` and `GenRollbackSQL` must run to completion on the backend,
/// so they go through `exec_client`, which has no request timeout.
pub struct RemoteDriver {
    client: reqwest::Client,
    exec_client: reqwest::Client,
    server_url: String,
    session: Mutex<Option<String>>,
}

impl RemoteDriver {
    /// Create a new remote driver handle using `client` for every call.
    pub fn new(client: reqwest::Client, server_url: &str) -> Self {
        Self {
            exec_client: client.clone(),
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        }
    }

    /// Use `client` for the calls that change the target database.
    pub fn with_exec_client(mut self, client: reqwest::Client) -> Self {
        self.exec_client = client;
        self
    }

    fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_session(&self, session: Option<String>) {
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }

    fn require_session(&self, call: &str) -> DriverResult<String> {
        self.session_id().ok_or_else(|| {
            DriverError::NotInitialized(format!("{} called before init", call))
        })
    }

    async fn call<Req, Resp>(
        &self,
        call: &str,
        session: Option<&str>,
        body: &Req,
    ) -> DriverResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send(&self.client, call, session, body).await
    }

    async fn call_to_completion<Req, Resp>(
        &self,
        call: &str,
        session: &str,
        body: &Req,
    ) -> DriverResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send(&self.exec_client, call, Some(session), body).await
    }

    /// Issue one protocol call and decode the reply.
    async fn send<Req, Resp>(
        &self,
        client: &reqwest::Client,
        call: &str,
        session: Option<&str>,
        body: &Req,
    ) -> DriverResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut request = client
            .post(format!("{}{}/{}", self.server_url, PROTOCOL_PREFIX, call))
            .json(body);

        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<WireError>(&body) {
                Ok(wire) => wire.into(),
                Err(_) => DriverError::Protocol(format!(
                    "{} failed with status {}: {}",
                    call, status, body
                )),
            });
        }

        Ok(response.json::<Resp>().await?)
    }
}

#[async_trait]
impl Driver for RemoteDriver {
    async fn metas(&self) -> DriverResult<MetasResponse> {
        self.call("metas", None, &Empty {}).await
    }

    async fn init(&self, request: InitRequest) -> DriverResult<()> {
        if self.session_id().is_some() {
            return Err(DriverError::Protocol("init called twice".to_string()));
        }
        let response: InitResponse = self.call("init", None, &request).await?;
        tracing::debug!(server_url = %self.server_url, session = %response.session_id, "Driver session opened");
        self.set_session(Some(response.session_id));
        Ok(())
    }

    async fn ping(&self) -> DriverResult<()> {
        let session = self.require_session("ping")?;
        let _: Empty = self.call("ping", Some(&session), &Empty {}).await?;
        Ok(())
    }

    async fn close(&self) -> DriverResult<()> {
        let Some(session) = self.session_id() else {
            return Ok(());
        };
        let result: DriverResult<Empty> = self.call("close", Some(&session), &Empty {}).await;
        self.set_session(None);
        result.map(|_| ())
    }

    async fn parse(&self, sql_text: &str) -> DriverResult<Vec<Node>> {
        let session = self.require_session("parse")?;
        let request = ParseRequest {
            sql_text: sql_text.to_string(),
        };
        let response: ParseResponse = self.call("parse", Some(&session), &request).await?;
        Ok(response.nodes)
    }

    async fn audit(&self, request: AuditRequest) -> DriverResult<Vec<AuditResult>> {
        let session = self.require_session("audit")?;
        let response: AuditResponse = self.call("audit", Some(&session), &request).await?;
        Ok(response.results)
    }

    async fn gen_rollback_sql(&self, sql: &str) -> DriverResult<RollbackSqlResponse> {
        let session = self.require_session("gen_rollback_sql")?;
        let request = GenRollbackSqlRequest {
            sql: sql.to_string(),
        };
        self.call_to_completion("gen_rollback_sql", &session, &request)
            .await
    }

    async fn exec(&self, query: &str) -> DriverResult<ExecResponse> {
        let session = self.require_session("exec")?;
        let request = ExecRequest {
            query: query.to_string(),
        };
        self.call_to_completion("exec", &session, &request).await
    }

    async fn tx(&self, queries: &[String]) -> DriverResult<Vec<StatementOutcome>> {
        let session = self.require_session("tx")?;
        let request = TxRequest {
            queries: queries.to_vec(),
        };
        let response: TxResponse = self.call_to_completion("tx", &session, &request).await?;
        Ok(response.results)
    }

    async fn databases(&self) -> DriverResult<Vec<String>> {
        let session = self.require_session("databases")?;
        let response: DatabasesResponse =
            self.call("databases", Some(&session), &Empty {}).await?;
        Ok(response.databases)
    }
}

/// Factory producing `RemoteDriver`s for one backend endpoint.
#[derive(Clone)]
pub struct RemoteDriverFactory {
    name: String,
    client: reqwest::Client,
    exec_client: reqwest::Client,
    server_url: String,
}

impl RemoteDriverFactory {
    /// Create a factory for the backend listening at `server_url`.
    ///
    /// `timeout` bounds connecting and the metadata calls. Execution calls
    /// only get the connect timeout.
    pub fn new(name: &str, server_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let exec_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            name: name.to_string(),
            client,
            exec_client,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl DriverFactory for RemoteDriverFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Arc<dyn Driver> {
        Arc::new(
            RemoteDriver::new(self.client.clone(), &self.server_url)
                .with_exec_client(self.exec_client.clone()),
        )
    }
}
