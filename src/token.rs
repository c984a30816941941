//! Exchange with the trusted backend for a short-lived realtime credential.
//!
//! The long-lived provider key never leaves the backend; the session only
//! ever holds the ephemeral value returned here, and uses it once.

use crate::error::{Result, SessionError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Optional character the assistant should play. All fields are free text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaking_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_type: Option<String>,
}

#[derive(Clone, PartialEq)]
pub struct Credential {
    value: String,
    pub expires_at: Option<i64>,
}

impl Credential {
    pub fn new(value: impl Into<String>, expires_at: Option<i64>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, persona: &Persona) -> Result<Credential>;
}

#[derive(Deserialize)]
struct SecretBody {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

// The backend has answered both with the secret at top level and wrapped in
// `client_secret`, depending on which upstream API it proxies.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokenResponse {
    Wrapped { client_secret: SecretBody },
    Flat(SecretBody),
}

impl TokenResponse {
    fn into_credential(self) -> Result<Credential> {
        let body = match self {
            TokenResponse::Wrapped { client_secret } => client_secret,
            TokenResponse::Flat(body) => body,
        };
        if body.value.trim().is_empty() {
            return Err(SessionError::NetworkError(
                "token endpoint returned an empty credential".into(),
            ));
        }
        Ok(Credential::new(body.value, body.expires_at))
    }
}

pub struct HttpTokenClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenClient {
    pub fn new(backend_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/realtime/token", backend_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl CredentialSource for HttpTokenClient {
    async fn fetch(&self, persona: &Persona) -> Result<Credential> {
        log::info!("[token] requesting credential from {}", self.endpoint);
        let resp = self.client.post(&self.endpoint).json(persona).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SessionError::NetworkError(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SessionError::NetworkError(format!("bad token response: {}", e)))?;
        let credential = parsed.into_credential()?;
        log::debug!(
            "[token] credential received (expires_at={:?})",
            credential.expires_at
        );
        Ok(credential)
    }
}
