//! Broker login
//!
//! Exchanges account credentials for the session tokens the feed requires.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default login endpoint
pub const LOGIN_URL: &str =
    "https://apiconnect.angelbroking.com/rest/auth/angelbroking/user/v1/loginByPassword";

/// Tokens issued by a successful login
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub jwt_token: String,
    pub feed_token: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("jwt_token", &"<redacted>")
            .field("feed_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("login request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("login rejected: {0}")]
    Rejected(String),

    #[error("unexpected login response: {0}")]
    InvalidResponse(String),
}

/// Produces feed session tokens
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<Session, AuthError>;
}

/// Account secrets, read from the environment
#[derive(Clone, Default)]
pub struct Credentials {
    pub client_code: String,
    pub pin: String,
    pub totp: String,
    pub api_key: String,
    pub local_ip: String,
    pub public_ip: String,
    pub mac_address: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_code", &self.client_code)
            .field("local_ip", &self.local_ip)
            .field("public_ip", &self.public_ip)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Read `ANGEL_*` variables; the network identity fields may be empty
    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AuthError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(AuthError::MissingCredential(key))
        };
        let optional = |key: &str| lookup(key).unwrap_or_default();

        Ok(Self {
            client_code: required("ANGEL_CLIENT_ID")?,
            pin: required("ANGEL_CLIENT_PIN")?,
            totp: required("ANGEL_TOTP_CODE")?,
            api_key: required("ANGEL_API_KEY")?,
            local_ip: optional("ANGEL_CLIENT_LOCAL_IP"),
            public_ip: optional("ANGEL_CLIENT_PUBLIC_IP"),
            mac_address: optional("ANGEL_MAC_ADDRESS"),
        })
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    clientcode: &'a str,
    password: &'a str,
    totp: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<LoginData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    jwt_token: String,
    feed_token: String,
}

/// Password + TOTP login against the broker's REST API
pub struct AngelAuthenticator {
    login_url: String,
    credentials: Credentials,
    client: Client,
}

impl AngelAuthenticator {
    pub fn new(
        login_url: impl Into<String>,
        timeout: Duration,
        credentials: Credentials,
    ) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            login_url: login_url.into(),
            credentials,
            client,
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

#[async_trait]
impl Authenticator for AngelAuthenticator {
    async fn authenticate(&self) -> Result<Session, AuthError> {
        let creds = &self.credentials;
        tracing::debug!(url = %self.login_url, client = %creds.client_code, "Logging in");

        let response = self
            .client
            .post(&self.login_url)
            .header("Accept", "application/json")
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", &creds.local_ip)
            .header("X-ClientPublicIP", &creds.public_ip)
            .header("X-MACAddress", &creds.mac_address)
            .header("X-PrivateKey", &creds.api_key)
            .json(&LoginRequest {
                clientcode: &creds.client_code,
                password: &creds.pin,
                totp: &creds.totp,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        let parsed: LoginResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(AuthError::Rejected(format!("HTTP {}: {}", status, body)));
            }
            Err(e) => return Err(AuthError::InvalidResponse(e.to_string())),
        };

        if !parsed.status {
            return Err(AuthError::Rejected(parsed.message));
        }

        let data = parsed
            .data
            .ok_or_else(|| AuthError::InvalidResponse("missing data".to_string()))?;
        if data.jwt_token.is_empty() || data.feed_token.is_empty() {
            return Err(AuthError::InvalidResponse("empty session token".to_string()));
        }

        tracing::info!(client = %creds.client_code, "Login successful");
        Ok(Session {
            jwt_token: data.jwt_token,
            feed_token: data.feed_token,
        })
    }
}

/// Always returns the same session; for dry runs and tests
#[derive(Debug, Clone)]
pub struct StaticAuthenticator(pub Session);

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self) -> Result<Session, AuthError> {
        Ok(self.0.clone())
    }
}
