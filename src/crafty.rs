use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Request timeout for all controller calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Bytes of response body kept in error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// Controller API error.
///
/// The orchestrator's failure policy keys off these: transport errors
/// are transient and retried, a 403 locks out all further calls, other
/// API errors are logged per server.
#[derive(Debug, thiserror::Error)]
pub enum CraftyError {
    /// The exchange failed before a response arrived (DNS/TCP/TLS/OS).
    #[error("connection to Crafty failed for {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// The controller answered with an HTTP error status.
    #[error("Crafty API {status} for {path}: {body}")]
    Api {
        status: u16,
        path: String,
        body: String,
    },

    /// The controller answered 2xx with a body we cannot interpret.
    #[error("unexpected Crafty response for {path}")]
    Malformed { path: String },
}

impl CraftyError {
    /// Whether this is the token-rejected condition that requires
    /// operator intervention.
    pub fn is_auth_denied(&self) -> bool {
        matches!(self, Self::Api { status: 403, .. })
    }

    /// Whether this is a transient transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// One server entry from the controller's server list.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub server_id: String,
}

/// Stats snapshot for one server.
///
/// Only the fields the orchestrator consumes, the endpoint returns
/// plenty more.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerStats {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub crashed: bool,
    #[serde(default)]
    pub online: u32,
    #[serde(default = "default_max")]
    pub max: u32,
    #[serde(default)]
    pub waiting_start: bool,
    /// The controller reports its own reachability probe as the literal
    /// string "True".
    #[serde(default)]
    pub int_ping_results: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub icon: Option<String>,
}

fn default_max() -> u32 {
    20
}

impl ServerStats {
    pub fn icon(&self) -> &str {
        self.icon.as_deref().unwrap_or_default()
    }
}

/// Response envelope the controller wraps every document in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,
    data: Option<T>,
}

/// Client for the Crafty Controller API v2.
#[derive(Debug, Clone)]
pub struct CraftyClient {
    http: reqwest::Client,
    base_url: String,
}

impl CraftyClient {
    /// Build a client for the given controller.
    ///
    /// The bearer token is baked into the default headers, `verify_tls`
    /// false accepts self-signed controller certificates.
    pub fn new(base_url: &str, token: &str, verify_tls: bool) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Probe the controller health endpoint.
    ///
    /// Never fails, any transport or API error reads as "not alive".
    pub async fn check_alive(&self) -> bool {
        match self
            .request::<Envelope<serde_json::Value>>(Method::GET, "/api/v2/crafty/check", None)
            .await
        {
            Ok(envelope) => envelope.status == "ok",
            Err(err) => {
                debug!(target: "craftnap::crafty", "Health probe failed: {}", err);
                false
            }
        }
    }

    /// List the servers the token has access to.
    pub async fn list_servers(&self) -> Result<Vec<ServerEntry>, CraftyError> {
        let envelope = self
            .request::<Envelope<Vec<ServerEntry>>>(Method::GET, "/api/v2/servers", None)
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// Fetch the stats document for one server.
    pub async fn get_stats(&self, server_id: &str) -> Result<ServerStats, CraftyError> {
        let path = format!("/api/v2/servers/{}/stats", server_id);
        let envelope = self
            .request::<Envelope<ServerStats>>(Method::GET, &path, None)
            .await?;
        envelope.data.ok_or(CraftyError::Malformed { path })
    }

    /// Ask the controller to start a server.
    pub async fn start(&self, server_id: &str) -> Result<bool, CraftyError> {
        info!(target: "craftnap::crafty", "API -> start_server {}", server_id);
        let path = format!("/api/v2/servers/{}/action/start_server", server_id);
        let envelope = self
            .request::<Envelope<serde_json::Value>>(Method::POST, &path, None)
            .await?;
        Ok(envelope.status == "ok")
    }

    /// Ask the controller to stop a server.
    pub async fn stop(&self, server_id: &str) -> Result<bool, CraftyError> {
        info!(target: "craftnap::crafty", "API -> stop_server {}", server_id);
        let path = format!("/api/v2/servers/{}/action/stop_server", server_id);
        let envelope = self
            .request::<Envelope<serde_json::Value>>(Method::POST, &path, None)
            .await?;
        Ok(envelope.status == "ok")
    }

    /// Send a console command to a server's stdin.
    ///
    /// Broadcast hook for operator tooling, the stdin endpoint takes a
    /// plain-text body unlike the rest of the API.
    #[allow(dead_code)]
    pub async fn send_stdin(&self, server_id: &str, command: &str) -> Result<bool, CraftyError> {
        info!(target: "craftnap::crafty", "API -> stdin {}: {}", server_id, command);
        let path = format!("/api/v2/servers/{}/stdin", server_id);
        let envelope = self
            .request::<Envelope<serde_json::Value>>(
                Method::POST,
                &path,
                Some(command.to_string()),
            )
            .await?;
        Ok(envelope.status == "ok")
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        text_body: Option<String>,
    ) -> Result<T, CraftyError> {
        debug!(target: "craftnap::crafty", "{} {}", method, path);

        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(body) = text_body {
            builder = builder.header("Content-Type", "text/plain").body(body);
        }

        let response = builder.send().await.map_err(|source| CraftyError::Transport {
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| CraftyError::Transport {
                path: path.to_string(),
                source,
            })?;

        if status >= StatusCode::BAD_REQUEST {
            return Err(CraftyError::Api {
                status: status.as_u16(),
                path: path.to_string(),
                body: truncate(&body, ERROR_BODY_LIMIT),
            });
        }

        serde_json::from_str(&body).map_err(|_| CraftyError::Malformed {
            path: path.to_string(),
        })
    }
}

fn truncate(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
