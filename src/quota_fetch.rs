use crate::auths::Auth;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

pub const QUOTA_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const OPENAI_AUTH_CLAIM: &str = "https://api.openai.com/auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaProvider {
    Antigravity,
    Codex,
    GeminiCli,
}

impl QuotaProvider {
    pub fn from_str(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "antigravity" => Some(Self::Antigravity),
            "codex" => Some(Self::Codex),
            "gemini-cli" => Some(Self::GeminiCli),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Antigravity => "antigravity",
            Self::Codex => "codex",
            Self::GeminiCli => "gemini-cli",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum QuotaFetchError {
    #[error("credential has no access token")]
    MissingAccessToken,
    #[error("codex credential has no chatgpt account id")]
    MissingAccountId,
    #[error("gemini-cli credential has no project id")]
    MissingProjectId,
    #[error("quota request failed: {0}")]
    Network(String),
    #[error("upstream status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid quota response: {0}")]
    InvalidBody(String),
}

impl QuotaFetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 401 and 403 mean the credential itself is dead, anything else may be transient.
    pub fn invalidates_credential(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

#[async_trait]
pub trait QuotaFetcher: Send + Sync {
    /// Returns the raw quota document for one credential.
    async fn fetch(&self, provider: QuotaProvider, auth: &Auth) -> Result<String, QuotaFetchError>;
}

#[derive(Debug, Clone)]
pub struct QuotaEndpoints {
    /// Tried in order until one answers 2xx.
    pub antigravity: Vec<String>,
    pub codex: String,
    pub gemini_cli: String,
}

impl Default for QuotaEndpoints {
    fn default() -> Self {
        Self {
            antigravity: vec![
                "https://daily-cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels"
                    .to_string(),
                "https://cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels".to_string(),
            ],
            codex: "https://chatgpt.com/backend-api/wham/usage".to_string(),
            gemini_cli: "https://cloudcode-pa.googleapis.com/v1internal:retrieveUserQuota"
                .to_string(),
        }
    }
}

/// Reads `chatgpt_account_id` from the payload of an OpenAI id token without
/// verifying its signature.
pub fn extract_chatgpt_account_id(id_token: &str) -> Option<String> {
    let payload = id_token.trim().split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims
        .get(OPENAI_AUTH_CLAIM)
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .or_else(|| claims.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct HttpQuotaFetcher {
    client: reqwest::Client,
    endpoints: QuotaEndpoints,
    timeout: Duration,
}

impl HttpQuotaFetcher {
    pub fn new(client: reqwest::Client, endpoints: QuotaEndpoints) -> Self {
        Self {
            client,
            endpoints,
            timeout: QUOTA_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        access_token: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<String, QuotaFetchError> {
        let mut req = req.timeout(self.timeout).bearer_auth(access_token);
        for (k, v) in extra_headers {
            req = req.header(*k, *v);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| QuotaFetchError::Network(err.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| QuotaFetchError::Network(err.to_string()))?;
        if !status.is_success() {
            return Err(QuotaFetchError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn fetch_antigravity(&self, auth: &Auth, token: &str) -> Result<String, QuotaFetchError> {
        let body = match auth.project_id() {
            Some(project) => json!({ "project": project }),
            None => json!({}),
        };
        let mut last_err = QuotaFetchError::Network("no antigravity endpoints configured".to_string());
        for url in &self.endpoints.antigravity {
            match self.send(self.client.post(url).json(&body), token, &[]).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    tracing::debug!(auth_id = auth.id, url = %url, "antigravity endpoint failed: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_codex(&self, auth: &Auth, token: &str) -> Result<String, QuotaFetchError> {
        let account_id = auth
            .id_token()
            .and_then(extract_chatgpt_account_id)
            .ok_or(QuotaFetchError::MissingAccountId)?;
        self.send(
            self.client.get(&self.endpoints.codex),
            token,
            &[("Chatgpt-Account-Id", account_id.as_str())],
        )
        .await
    }

    async fn fetch_gemini_cli(&self, auth: &Auth, token: &str) -> Result<String, QuotaFetchError> {
        let project = auth.project_id().ok_or(QuotaFetchError::MissingProjectId)?;
        self.send(
            self.client
                .post(&self.endpoints.gemini_cli)
                .json(&json!({ "project": project })),
            token,
            &[],
        )
        .await
    }
}

#[async_trait]
impl QuotaFetcher for HttpQuotaFetcher {
    async fn fetch(&self, provider: QuotaProvider, auth: &Auth) -> Result<String, QuotaFetchError> {
        // checked before the token so a broken credential fails without any network call
        match provider {
            QuotaProvider::Codex if auth.id_token().and_then(extract_chatgpt_account_id).is_none() => {
                return Err(QuotaFetchError::MissingAccountId);
            }
            QuotaProvider::GeminiCli if auth.project_id().is_none() => {
                return Err(QuotaFetchError::MissingProjectId);
            }
            _ => {}
        }
        let token = auth
            .access_token()
            .ok_or(QuotaFetchError::MissingAccessToken)?;
        let text = match provider {
            QuotaProvider::Antigravity => self.fetch_antigravity(auth, token).await?,
            QuotaProvider::Codex => self.fetch_codex(auth, token).await?,
            QuotaProvider::GeminiCli => self.fetch_gemini_cli(auth, token).await?,
        };
        if text.trim().is_empty() {
            return Err(QuotaFetchError::InvalidBody("empty body".to_string()));
        }
        serde_json::from_str::<Value>(&text)
            .map_err(|err| QuotaFetchError::InvalidBody(err.to_string()))?;
        Ok(text)
    }
}
