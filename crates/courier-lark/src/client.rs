use std::time::{Duration, Instant};

use courier_core::config::LarkConfig;
use reqwest::Method;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{LarkError, TOKEN_INVALID_CODES};

/// Refresh the tenant token this long before it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Authenticated HTTP client for the Lark open platform.
///
/// Holds a cached tenant access token and refreshes it on demand.
pub struct LarkClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl std::fmt::Debug for LarkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LarkClient")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .finish()
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: u64,
}

impl LarkClient {
    pub fn new(cfg: &LarkConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeout, using defaults");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            app_id: cfg.app_id.clone(),
            app_secret: cfg.app_secret.clone(),
            token: RwLock::new(None),
        }
    }

    /// Current tenant access token, fetched or refreshed as needed.
    pub async fn tenant_access_token(&self) -> Result<String, LarkError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut slot = self.token.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = slot.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        #[derive(Serialize)]
        struct Request<'a> {
            app_id: &'a str,
            app_secret: &'a str,
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        debug!(app_id = %self.app_id, "requesting tenant access token");
        let resp: TokenResponse = self
            .http
            .post(&url)
            .json(&Request {
                app_id: &self.app_id,
                app_secret: &self.app_secret,
            })
            .send()
            .await?
            .json()
            .await
            .map_err(|e| LarkError::Parse(e.to_string()))?;

        if resp.code != 0 {
            return Err(LarkError::Auth(format!("code {}: {}", resp.code, resp.msg)));
        }
        let value = resp
            .tenant_access_token
            .ok_or_else(|| LarkError::Auth("response carried no tenant_access_token".into()))?;

        info!(expires_in = resp.expire, "tenant access token refreshed");
        *slot = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(resp.expire),
        });
        Ok(value)
    }

    /// Call an API endpoint and decode the `data` field of the envelope.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T, LarkError> {
        self.send::<T>(method, path, query, body)
            .await?
            .ok_or_else(|| LarkError::Parse(format!("{path}: response carried no data")))
    }

    /// Like [`call`](Self::call) for endpoints whose `data` is irrelevant.
    pub async fn call_empty(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<(), LarkError> {
        self.send::<IgnoredAny>(method, path, query, body)
            .await
            .map(|_| ())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<Option<T>, LarkError> {
        let token = self.tenant_access_token().await?;
        let url = format!("{}{}", self.base_url, path);

        let mut req = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                return Err(LarkError::Api {
                    code: i64::from(status.as_u16()),
                    msg: text,
                });
            }
            Err(e) => return Err(LarkError::Parse(format!("{path}: {e}"))),
        };

        if envelope.code != 0 {
            if TOKEN_INVALID_CODES.contains(&envelope.code) {
                *self.token.write().await = None;
            }
            warn!(%method, path, code = envelope.code, msg = %envelope.msg, "Lark API call failed");
            return Err(LarkError::Api {
                code: envelope.code,
                msg: envelope.msg,
            });
        }

        Ok(envelope.data)
    }
}
