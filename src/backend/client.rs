//! HTTP transport to the backend policy API
//!
//! Every failure is classified here, at the point it is produced: transient
//! failures carry an unbounded [`RetryPolicy`], conflicts a bounded one,
//! license failures their dedicated [`Error`] variants, and everything else no
//! policy at all.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Backend, BackendObject, BackendVersion, ObjectKind, TAG_SCOPE_CLUSTER};
use crate::config::OperatorConfig;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Backend error code for a feature the installed license does not cover
pub const LICENSE_RESTRICTED_CODE: i64 = 505;

/// Backend error code for a missing, expired or invalid license
pub const INVALID_LICENSE_CODE: i64 = 506;

/// Connection failures, 5xx and 429: retry forever, flat at first
pub const TRANSIENT_RETRY: RetryPolicy =
    RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(300))
        .with_linear_attempts(3);

/// Optimistic-concurrency conflicts: retry a few times, then give up
pub const CONFLICT_RETRY: RetryPolicy =
    RetryPolicy::bounded(Duration::from_secs(1), Duration::from_secs(30), 5);

const POLICY_API: &str = "/policy/api/v1";
const VERSION_API: &str = "/api/v1/node/version";
const SEARCH_PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeVersion {
    product_version: String,
}

/// Classify an HTTP failure into an [`Error`] carrying its retry policy
pub fn classify_response(operation: &str, status: u16, body: &str) -> Error {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|b| b.error_code);
    let message = parsed
        .and_then(|b| b.error_message)
        .unwrap_or_else(|| body.chars().take(512).collect());

    match code {
        Some(LICENSE_RESTRICTED_CODE) => return Error::LicenseRestricted { reason: message },
        Some(INVALID_LICENSE_CODE) => return Error::InvalidLicense { message },
        _ => {}
    }

    let retry = match status {
        409 | 412 => Some(CONFLICT_RETRY),
        429 | 500..=599 => Some(TRANSIENT_RETRY),
        _ => None,
    };
    Error::backend_status(operation, status, message, retry)
}

/// Backend API client over reqwest
pub struct NsxClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl NsxClient {
    /// Build a client from operator configuration
    pub fn new(config: &OperatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| Error::backend("build http client", e.to_string(), None))?;

        Ok(Self {
            http,
            base_url: config.nsx_url.trim_end_matches('/').to_string(),
            user: config.nsx_user.clone(),
            password: config.nsx_password.clone(),
        })
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        operation: &str,
        body: Option<&BackendObject>,
    ) -> Result<String> {
        let mut request = self
            .http
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, operation, "backend request failed");
            Error::backend(operation, e.to_string(), Some(TRANSIENT_RETRY))
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::backend(operation, e.to_string(), Some(TRANSIENT_RETRY)))?;

        if status.is_success() {
            Ok(text)
        } else {
            debug!(status = status.as_u16(), operation, "backend returned an error");
            Err(classify_response(operation, status.as_u16(), &text))
        }
    }
}

#[async_trait]
impl Backend for NsxClient {
    async fn version(&self) -> Result<BackendVersion> {
        let url = format!("{}{}", self.base_url, VERSION_API);
        let body = self.send(Method::GET, &url, "get version", None).await?;
        let version: NodeVersion = serde_json::from_str(&body)?;
        version
            .product_version
            .parse()
            .map_err(|e: String| Error::backend("get version", e, None))
    }

    async fn apply(&self, object: &BackendObject) -> Result<()> {
        let url = format!("{}{}{}", self.base_url, POLICY_API, object.path);
        let operation = format!("patch {}", object.path);
        self.send(Method::PATCH, &url, &operation, Some(object))
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = format!("{}{}{}", self.base_url, POLICY_API, path);
        let operation = format!("delete {path}");
        match self.send(Method::DELETE, &url, &operation, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn search(&self, kind: ObjectKind, cluster: &str) -> Result<Vec<BackendObject>> {
        let query = format!(
            "resource_type:{} AND tags.scope:{} AND tags.tag:{}",
            kind.resource_type(),
            escape_query(TAG_SCOPE_CLUSTER),
            escape_query(cluster)
        );
        let operation = format!("search {kind}");
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}{}/search/query", self.base_url, POLICY_API))
                .basic_auth(&self.user, Some(&self.password))
                .query(&[("query", query.as_str())])
                .query(&[("page_size", SEARCH_PAGE_SIZE.to_string())]);
            if let Some(c) = &cursor {
                request = request.query(&[("cursor", c.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::backend(&operation, e.to_string(), Some(TRANSIENT_RETRY)))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| Error::backend(&operation, e.to_string(), Some(TRANSIENT_RETRY)))?;
            if status != StatusCode::OK {
                return Err(classify_response(&operation, status.as_u16(), &text));
            }

            let page: SearchPage = serde_json::from_str(&text)?;
            for raw in page.results {
                match serde_json::from_value::<BackendObject>(raw) {
                    Ok(obj) => objects.push(obj),
                    Err(e) => warn!(error = %e, %kind, "skipping undecodable backend object"),
                }
            }

            match page.cursor {
                Some(next) if !next.is_empty() && Some(&next) != cursor.as_ref() => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }

        debug!(%kind, count = objects.len(), "loaded backend objects");
        Ok(objects)
    }
}

/// Escape characters the search query language treats specially
fn escape_query(value: &str) -> String {
    value
        .chars()
        .fold(String::with_capacity(value.len()), |mut s, c| {
            if matches!(c, '/' | ':' | '-' | '+' | '!' | '(' | ')' | '"' | '\\' | ' ') {
                s.push('\\');
            }
            s.push(c);
            s
        })
}
