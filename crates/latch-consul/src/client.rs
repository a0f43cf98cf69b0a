//! HTTP client for the Consul session and KV APIs
//!
//! `ConsulApi` is the boundary the lock subsystem depends on; tests and
//! embedded setups substitute their own implementation. `ConsulClient`
//! is the production implementation over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};

use latch_core::StoreError;

use crate::model::{
    KvPair, ReadOptions, ReadResult, Session, SessionCreateRequest, SessionCreateResponse,
    go_duration,
};

const INDEX_HEADER: &str = "X-Consul-Index";

/// Configuration for the Consul HTTP client
#[derive(Clone, Debug)]
pub struct ConsulConfig {
    /// Agent address, e.g. `http://127.0.0.1:8500`
    pub address: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds for non-blocking requests
    pub read_timeout_ms: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
        }
    }
}

impl ConsulConfig {
    /// Create a new config with the given agent address
    pub fn new(address: &str) -> Self {
        Self {
            address: address.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Set the ACL token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Set timeouts
    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }
}

/// Store-client boundary used by the session provider and lock loops.
#[async_trait]
pub trait ConsulApi: Send + Sync {
    /// Create a session, returning its id.
    async fn create_session(&self, req: &SessionCreateRequest) -> Result<String, StoreError>;

    /// Extend a session's TTL. `None` means the session no longer
    /// exists (expired or destroyed).
    async fn renew_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Destroy a session.
    async fn destroy_session(&self, id: &str) -> Result<bool, StoreError>;

    /// Atomically write `key` attributed to `session` with the given
    /// type-tag flags. `false` means another session holds the entry or
    /// the key is inside its lock-delay grace period.
    async fn acquire_key(
        &self,
        key: &str,
        session: &str,
        flags: u64,
        value: &[u8],
    ) -> Result<bool, StoreError>;

    /// Clear `key`'s session attribution if currently attributed to
    /// `session`.
    async fn release_key(&self, key: &str, session: &str, flags: u64) -> Result<bool, StoreError>;

    /// Read `key`, optionally long-polling on its change index.
    async fn get_key(&self, key: &str, opts: &ReadOptions) -> Result<ReadResult, StoreError>;
}

/// Consul HTTP client
pub struct ConsulClient {
    http: reqwest::Client,
    config: ConsulConfig,
}

impl ConsulClient {
    pub fn new(config: ConsulConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()
            .map_err(|e| StoreError::Other(e.into()))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.address, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    async fn ok_status(resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(StoreError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else if e.is_connect() || e.is_request() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Other(e.into())
    }
}

fn decode_error(e: reqwest::Error) -> StoreError {
    StoreError::Decode(e.to_string())
}

fn index_of(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl ConsulApi for ConsulClient {
    async fn create_session(&self, req: &SessionCreateRequest) -> Result<String, StoreError> {
        let resp = self
            .authorized(self.http.put(self.url("/v1/session/create")))
            .json(req)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = Self::ok_status(resp).await?;
        let body: SessionCreateResponse = resp.json().await.map_err(decode_error)?;
        Ok(body.id)
    }

    async fn renew_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let resp = self
            .authorized(self.http.put(self.url(&format!("/v1/session/renew/{id}"))))
            .send()
            .await
            .map_err(transport_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::ok_status(resp).await?;
        let sessions: Vec<Session> = resp.json().await.map_err(decode_error)?;
        Ok(sessions.into_iter().next())
    }

    async fn destroy_session(&self, id: &str) -> Result<bool, StoreError> {
        let resp = self
            .authorized(
                self.http
                    .put(self.url(&format!("/v1/session/destroy/{id}"))),
            )
            .send()
            .await
            .map_err(transport_error)?;
        let resp = Self::ok_status(resp).await?;
        resp.json().await.map_err(decode_error)
    }

    async fn acquire_key(
        &self,
        key: &str,
        session: &str,
        flags: u64,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let resp = self
            .authorized(self.http.put(self.url(&format!("/v1/kv/{key}"))))
            .query(&[("acquire", session), ("flags", &flags.to_string())])
            .body(value.to_vec())
            .send()
            .await
            .map_err(transport_error)?;
        let resp = Self::ok_status(resp).await?;
        resp.json().await.map_err(decode_error)
    }

    async fn release_key(&self, key: &str, session: &str, flags: u64) -> Result<bool, StoreError> {
        let resp = self
            .authorized(self.http.put(self.url(&format!("/v1/kv/{key}"))))
            .query(&[("release", session), ("flags", &flags.to_string())])
            .send()
            .await
            .map_err(transport_error)?;
        let resp = Self::ok_status(resp).await?;
        resp.json().await.map_err(decode_error)
    }

    async fn get_key(&self, key: &str, opts: &ReadOptions) -> Result<ReadResult, StoreError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if opts.index > 0 {
            query.push(("index", opts.index.to_string()));
        }
        if let Some(wait) = opts.wait {
            query.push(("wait", go_duration(wait)));
        }
        if opts.consistent {
            query.push(("consistent", String::new()));
        }

        let mut builder = self
            .authorized(self.http.get(self.url(&format!("/v1/kv/{key}"))))
            .query(&query);
        if let Some(wait) = opts.wait {
            // blocking query: allow the server its full wait plus jitter
            builder = builder.timeout(wait + wait / 16 + Duration::from_secs(1));
        }

        let resp = builder.send().await.map_err(transport_error)?;
        let index = index_of(&resp);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(ReadResult {
                pair: None,
                index: index.unwrap_or(0),
            });
        }
        let resp = Self::ok_status(resp).await?;
        let pairs: Vec<KvPair> = resp.json().await.map_err(decode_error)?;
        let pair = pairs.into_iter().next();
        let index = index.or_else(|| pair.as_ref().map(|p| p.modify_index)).unwrap_or(0);
        Ok(ReadResult { pair, index })
    }
}
