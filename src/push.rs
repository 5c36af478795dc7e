// Push client - delivers an encoded snapshot to the metrics gateway
//
// One POST per cycle to {base}/metrics/job/{job}/instance/{instance}, with the
// bearer token in a configurable header. No retries: the next cycle is the
// next attempt.

use reqwest::{header, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, GatewaySettings};

/// Longest response body kept in a `PushError::Status`
const MAX_ERROR_BODY: usize = 512;

/// Errors that can occur while pushing to the gateway
#[derive(Error, Debug)]
pub enum PushError {
    #[error("gateway rejected credentials (401), url = {url}")]
    Unauthorized { url: String },

    #[error("unexpected status code {status}, url = {url}, body = {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },

    #[error("push request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid auth header name {0:?}")]
    InvalidAuthHeader(String),
}

impl PushError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, PushError::Unauthorized { .. })
    }
}

/// Builds the push URL with exactly one slash between base and path.
///
/// # Example
/// ```
/// use metrics_pusher::push::build_url;
/// assert_eq!(build_url("http://gw", "node", "h1"), "http://gw/metrics/job/node/instance/h1");
/// assert_eq!(build_url("http://gw/", "node", "h1"), "http://gw/metrics/job/node/instance/h1");
/// ```
pub fn build_url(base: &str, job: &str, instance: &str) -> String {
    if base.ends_with('/') {
        format!("{base}metrics/job/{job}/instance/{instance}")
    } else {
        format!("{base}/metrics/job/{job}/instance/{instance}")
    }
}

/// Where and as whom a module pushes. Fixed for the module's lifetime.
#[derive(Clone, PartialEq)]
pub struct PushTarget {
    pub base_url: String,
    pub token: String,
    pub job: String,
    pub instance: String,
}

impl PushTarget {
    /// Resolves a target from gateway settings.
    ///
    /// # Errors
    /// `ConfigError` if url or token is empty, or if the instance is unset
    /// and the hostname cannot be determined.
    pub fn resolve(settings: &GatewaySettings, job: &str) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(PushTarget {
            base_url: settings.url.clone(),
            token: settings.token.clone(),
            job: job.to_string(),
            instance: settings.resolve_instance()?,
        })
    }

    pub fn url(&self) -> String {
        build_url(&self.base_url, &self.job, &self.instance)
    }
}

// Keep the token out of logs
impl fmt::Debug for PushTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushTarget")
            .field("base_url", &self.base_url)
            .field("token", &"****")
            .field("job", &self.job)
            .field("instance", &self.instance)
            .finish()
    }
}

/// HTTP client bound to one push target
pub struct PushClient {
    client: reqwest::Client,
    target: PushTarget,
    url: String,
    auth_header: header::HeaderName,
}

impl PushClient {
    /// Creates a client for `target`.
    ///
    /// # Arguments
    /// * `target` - gateway address and credentials
    /// * `auth_header` - header carrying `Bearer <token>`
    /// * `timeout` - bound on the whole request
    pub fn new(
        target: PushTarget,
        auth_header: &str,
        timeout: Duration,
    ) -> Result<Self, PushError> {
        let auth_header = header::HeaderName::from_bytes(auth_header.as_bytes())
            .map_err(|_| PushError::InvalidAuthHeader(auth_header.to_string()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(PushClient {
            client,
            url: target.url(),
            target,
            auth_header,
        })
    }

    pub fn target(&self) -> &PushTarget {
        &self.target
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POSTs one encoded body.
    ///
    /// # Returns
    /// * `Ok(())` - the gateway answered 200
    /// * `Err(PushError::Unauthorized)` - the gateway answered 401
    /// * `Err(PushError::Status)` - any other status, with the response body
    /// * `Err(PushError::Transport)` - connection, TLS or timeout failure
    pub async fn push(&self, body: String) -> Result<(), PushError> {
        let bytes = body.len();
        let response = self
            .client
            .post(&self.url)
            .header(self.auth_header.clone(), format!("Bearer {}", self.target.token))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                debug!(url = %self.url, bytes, "Metrics pushed");
                Ok(())
            }
            StatusCode::UNAUTHORIZED => Err(PushError::Unauthorized {
                url: self.url.clone(),
            }),
            _ => {
                let body = match response.text().await {
                    Ok(text) => truncate(text, MAX_ERROR_BODY),
                    Err(e) => format!("[failed to read response body: {e}]"),
                };
                Err(PushError::Status {
                    status,
                    url: self.url.clone(),
                    body,
                })
            }
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("...");
    }
    s
}
