//! Couchbase backend speaking to the cluster's query service over HTTP.
//!
//! Every operation is a single parameterized N1QL statement POSTed to
//! `/query/service`. Documents are stored as JSON strings holding the
//! encoded session, with the expiry set through the statement options.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};
use url::Url;

use super::{BackendError, BackendErrorKind, BackendResult, KvBackend, KvEntry};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// Port of the query service when a host is given without one.
pub const DEFAULT_QUERY_PORT: u16 = 8093;

/// Relative expiries above this are read by the server as absolute
/// Unix timestamps.
const MAX_RELATIVE_EXPIRY_SECS: u64 = 30 * 24 * 3600;

/// Largest expiry the server stores (a 32-bit Unix timestamp).
const MAX_EXPIRY: u64 = u32::MAX as u64;

/// Query error codes that mean the credentials were rejected.
const AUTH_ERROR_CODES: [i64; 2] = [10000, 13014];

/// Query error code for a statement timeout.
const TIMEOUT_ERROR_CODE: i64 = 1080;

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    statement: &'a str,
    args: &'a [Value],
    timeout: String,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    errors: Vec<QueryErrorEntry>,
    #[serde(default)]
    metrics: QueryMetrics,
}

#[derive(Debug, Deserialize)]
struct QueryErrorEntry {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Default, Deserialize)]
struct QueryMetrics {
    #[serde(default, rename = "mutationCount")]
    mutation_count: u64,
}

/// Couchbase session backend over the query REST API.
///
/// Requests rotate across the configured hosts. Connection pooling and
/// keep-alive are left to `reqwest`.
pub struct QueryBackend {
    http: reqwest::Client,
    endpoints: Vec<Url>,
    next: AtomicUsize,
    bucket: String,
    credentials: Option<(String, String)>,
    operation_timeout: Duration,
}

impl QueryBackend {
    /// Build a backend from the store configuration.
    ///
    /// Does not perform any I/O; see [`KvBackend::connect`].
    pub fn new(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let endpoints = config
            .host
            .iter()
            .map(String::as_str)
            .map(query_endpoint)
            .collect::<Result<Vec<_>>>()?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout())
            .timeout(config.operation_timeout())
            .user_agent(format!("couch-session/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Ok(Self {
            http,
            endpoints,
            next: AtomicUsize::new(0),
            bucket: config.bucket.clone(),
            credentials,
            operation_timeout: config.operation_timeout(),
        })
    }

    /// The query endpoints in rotation order.
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    fn endpoint(&self) -> &Url {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[i]
    }

    /// Run a statement and return the parsed response.
    async fn execute(&self, statement: &str, args: &[Value]) -> BackendResult<QueryResponse> {
        let url = self.endpoint().clone();
        trace!(url = %url, statement = %statement, "Executing query");

        let body = QueryRequest {
            statement,
            args,
            timeout: format!("{}ms", self.operation_timeout.as_millis()),
        };

        let mut request = self.http.post(url).json(&body);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        let parsed: Option<QueryResponse> = serde_json::from_str(&text).ok();

        if let Some(first) = parsed.as_ref().and_then(|r| r.errors.first()) {
            return Err(BackendError::new(
                classify_query_code(first.code, status),
                format!("query error {}: {}", first.code, first.msg),
            ));
        }

        if !status.is_success() {
            return Err(BackendError::new(
                classify_status(status),
                format!("query service returned HTTP {}", status.as_u16()),
            ));
        }

        match parsed {
            Some(resp) if resp.status.is_empty() || resp.status == "success" => Ok(resp),
            Some(resp) => Err(BackendError::new(
                BackendErrorKind::Other,
                format!("query finished with status '{}'", resp.status),
            )),
            None => Err(BackendError::new(
                BackendErrorKind::Other,
                "query service returned an unreadable response",
            )),
        }
    }

    fn keyspace(&self) -> String {
        format!("`{}`", self.bucket)
    }
}

#[async_trait]
impl KvBackend for QueryBackend {
    async fn connect(&self) -> BackendResult<()> {
        let resp = self
            .execute(
                "SELECT RAW COUNT(*) FROM system:keyspaces WHERE name = $1",
                &[json!(self.bucket)],
            )
            .await?;

        let count = resp.results.first().and_then(Value::as_u64).unwrap_or(0);
        if count == 0 {
            return Err(BackendError::new(
                BackendErrorKind::Other,
                format!("bucket '{}' not found", self.bucket),
            ));
        }
        debug!(bucket = %self.bucket, "Query service reachable");
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let statement = format!("SELECT RAW s FROM {} AS s USE KEYS $1", self.keyspace());
        let resp = self.execute(&statement, &[json!(key)]).await?;
        Ok(resp.results.into_iter().next().and_then(document_text))
    }

    async fn upsert(&self, key: &str, value: &str, expiry_secs: u64) -> BackendResult<()> {
        let statement = format!(
            "UPSERT INTO {} (KEY, VALUE, OPTIONS) VALUES ($1, $2, {{\"expiration\": $3}})",
            self.keyspace()
        );
        self.execute(
            &statement,
            &[json!(key), json!(value), json!(server_expiry(expiry_secs))],
        )
        .await?;
        Ok(())
    }

    async fn touch(&self, key: &str, expiry_secs: u64) -> BackendResult<()> {
        let statement = format!(
            "UPDATE {} AS s USE KEYS $1 SET META(s).expiration = $2",
            self.keyspace()
        );
        let resp = self
            .execute(&statement, &[json!(key), json!(server_expiry(expiry_secs))])
            .await?;
        if resp.metrics.mutation_count == 0 {
            return Err(BackendError::not_found(key));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> BackendResult<()> {
        let statement = format!("DELETE FROM {} AS s USE KEYS $1", self.keyspace());
        self.execute(&statement, &[json!(key)]).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<KvEntry>> {
        let statement = format!(
            "SELECT META(s).id AS id, s AS val FROM {} AS s WHERE SUBSTR(META(s).id, 0, $1) = $2",
            self.keyspace()
        );
        let resp = self
            .execute(&statement, &[json!(prefix.chars().count()), json!(prefix)])
            .await?;

        let mut entries = Vec::with_capacity(resp.results.len());
        for row in resp.results {
            let Value::Object(mut fields) = row else {
                continue;
            };
            let key = match fields.remove("id") {
                Some(Value::String(id)) => id,
                _ => continue,
            };
            if let Some(value) = fields.remove("val").and_then(document_text) {
                entries.push(KvEntry { key, value });
            }
        }
        Ok(entries)
    }

    fn name(&self) -> &str {
        "couchbase-query"
    }
}

/// Turn a `host`, `host:port` or full URL into the query service URL.
fn query_endpoint(host: &str) -> Result<Url> {
    let host = host.trim();
    let mut url = if host.contains("://") {
        Url::parse(host)
    } else {
        Url::parse(&format!("http://{}", host))
    }
    .map_err(|e| Error::Config(format!("invalid host '{}': {}", host, e)))?;

    if !host.contains("://") && url.port().is_none() {
        url.set_port(Some(DEFAULT_QUERY_PORT))
            .map_err(|_| Error::Config(format!("invalid host '{}'", host)))?;
    }
    url.set_path("/query/service");
    Ok(url)
}

/// Convert a relative TTL into the expiration value the server expects.
///
/// Absolute expiries saturate at the server's 32-bit limit.
fn server_expiry(expiry_secs: u64) -> u64 {
    if expiry_secs > MAX_RELATIVE_EXPIRY_SECS {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        now.saturating_add(expiry_secs).min(MAX_EXPIRY)
    } else {
        expiry_secs
    }
}

/// Stored documents are JSON strings; anything else is re-encoded.
fn document_text(doc: Value) -> Option<String> {
    match doc {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    let kind = if err.is_timeout() {
        BackendErrorKind::Timeout
    } else if err.is_connect() {
        BackendErrorKind::Transient
    } else {
        BackendErrorKind::Other
    };
    BackendError::new(kind, err.to_string())
}

fn classify_status(status: StatusCode) -> BackendErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendErrorKind::Auth,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
            BackendErrorKind::Transient
        }
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => BackendErrorKind::Timeout,
        _ => BackendErrorKind::Other,
    }
}

fn classify_query_code(code: i64, status: StatusCode) -> BackendErrorKind {
    if AUTH_ERROR_CODES.contains(&code) {
        BackendErrorKind::Auth
    } else if code == TIMEOUT_ERROR_CODE {
        BackendErrorKind::Timeout
    } else {
        classify_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_default_port() {
        let url = query_endpoint("10.0.0.5").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:8093/query/service");
    }

    #[test]
    fn test_endpoint_explicit_port() {
        let url = query_endpoint("db.local:18093").unwrap();
        assert_eq!(url.as_str(), "http://db.local:18093/query/service");
    }

    #[test]
    fn test_endpoint_full_url() {
        let url = query_endpoint("https://cb.example.com").unwrap();
        assert_eq!(url.as_str(), "https://cb.example.com/query/service");
    }

    #[test]
    fn test_server_expiry_relative_and_absolute() {
        assert_eq!(server_expiry(0), 0);
        assert_eq!(server_expiry(86_400), 86_400);

        let sixty_days = 60 * 24 * 3600;
        let expiry = server_expiry(sixty_days);
        assert!(expiry > Utc::now().timestamp() as u64);
    }

    #[test]
    fn test_server_expiry_clamps_to_32_bits() {
        let two_hundred_years = 200 * 365 * 86_400;
        assert_eq!(server_expiry(two_hundred_years), u64::from(u32::MAX));
        assert_eq!(server_expiry(u64::MAX - 10), u64::from(u32::MAX));
    }

    #[test]
    fn test_document_text() {
        assert_eq!(document_text(json!("{\"a\":1}")), Some("{\"a\":1}".to_string()));
        assert_eq!(document_text(json!({"a": 1})), Some("{\"a\":1}".to_string()));
        assert_eq!(document_text(Value::Null), None);
    }

    #[test]
    fn test_classify_query_code() {
        assert_eq!(
            classify_query_code(10000, StatusCode::UNAUTHORIZED),
            BackendErrorKind::Auth
        );
        assert_eq!(
            classify_query_code(1080, StatusCode::OK),
            BackendErrorKind::Timeout
        );
        assert_eq!(
            classify_query_code(5000, StatusCode::SERVICE_UNAVAILABLE),
            BackendErrorKind::Transient
        );
        assert_eq!(
            classify_query_code(12003, StatusCode::INTERNAL_SERVER_ERROR),
            BackendErrorKind::Other
        );
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = StoreConfig::new().with_bucket("");
        assert!(QueryBackend::new(&config).is_err());
    }

    #[test]
    fn test_hosts_rotate() {
        let config = StoreConfig::new().with_hosts(["a:8093", "b:8093"]);
        let backend = QueryBackend::new(&config).unwrap();
        let first = backend.endpoint().host_str().map(str::to_string);
        let second = backend.endpoint().host_str().map(str::to_string);
        let third = backend.endpoint().host_str().map(str::to_string);
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
        assert_eq!(third.as_deref(), Some("a"));
    }
}
