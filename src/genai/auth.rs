//! Bearer-token sources for Vertex AI.
//!
//! Mirrors Application Default Credentials: a static access token, a
//! credentials file (service-account key exchanged with a signed JWT
//! assertion per RFC 7523, or a gcloud `authorized_user` refresh token), or
//! the GCE / Cloud Run metadata server. Fetched tokens are cached until
//! shortly before they expire.

use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::GenAiError;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
const METADATA_TOKEN_PATH: &str =
    "/computeMetadata/v1/instance/service-accounts/default/token";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// A cached token is refreshed once it is this close to expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Fields of a Google service-account key file that the exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// A gcloud `authorized_user` credentials file
/// (`gcloud auth application-default login`).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedUserKey {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub quota_project_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUserKey),
}

#[derive(Debug, Clone)]
pub enum Credentials {
    AccessToken(String),
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUserKey),
    /// Token served by the instance metadata server at `host`.
    Metadata { host: String },
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    scope: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl Credentials {
    /// Load a credentials file, dispatching on its `"type"` field.
    pub fn from_file(path: &Path) -> Result<Self, GenAiError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            GenAiError::Auth(format!("cannot read credentials file {}: {e}", path.display()))
        })?;
        let file: CredentialsFile = serde_json::from_str(&data).map_err(|e| {
            GenAiError::Auth(format!("invalid credentials file {}: {e}", path.display()))
        })?;
        Ok(match file {
            CredentialsFile::ServiceAccount(key) => Credentials::ServiceAccount(key),
            CredentialsFile::AuthorizedUser(key) => Credentials::AuthorizedUser(key),
        })
    }

    /// Project id carried by the credentials, if any.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Credentials::ServiceAccount(key) => key.project_id.as_deref(),
            Credentials::AuthorizedUser(key) => key.quota_project_id.as_deref(),
            Credentials::AccessToken(_) | Credentials::Metadata { .. } => None,
        }
    }

    /// Fetch a fresh token. Static tokens never expire from our side.
    async fn fetch(
        &self,
        http: &reqwest::Client,
    ) -> Result<(String, Option<Duration>), GenAiError> {
        let request = match self {
            Credentials::AccessToken(token) => return Ok((token.clone(), None)),
            Credentials::ServiceAccount(key) => {
                let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
                let assertion = sign_assertion(key, token_uri)?;
                debug!(client_email = %key.client_email, "Exchanging service-account assertion");
                http.post(token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            }
            Credentials::AuthorizedUser(key) => {
                let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
                debug!(client_id = %key.client_id, "Refreshing authorized-user token");
                http.post(token_uri).form(&[
                    ("grant_type", "refresh_token"),
                    ("client_id", key.client_id.as_str()),
                    ("client_secret", key.client_secret.as_str()),
                    ("refresh_token", key.refresh_token.as_str()),
                ])
            }
            Credentials::Metadata { host } => {
                debug!(host = %host, "Requesting token from metadata server");
                http.get(metadata_token_url(host))
                    .header("Metadata-Flavor", "Google")
            }
        };

        let token = request_token(request).await?;
        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        Ok((token.access_token, Some(lifetime)))
    }
}

fn metadata_token_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}{METADATA_TOKEN_PATH}")
    } else {
        format!("http://{host}{METADATA_TOKEN_PATH}")
    }
}

async fn request_token(request: reqwest::RequestBuilder) -> Result<TokenResponse, GenAiError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(GenAiError::Auth(format!(
            "token exchange failed ({status}): {}",
            String::from_utf8_lossy(&body)
        )));
    }
    serde_json::from_slice(&body)
        .map_err(|e| GenAiError::Auth(format!("invalid token response: {e}")))
}

fn sign_assertion(key: &ServiceAccountKey, token_uri: &str) -> Result<String, GenAiError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| GenAiError::Auth(e.to_string()))?
        .as_secs();
    let claims = AssertionClaims {
        iss: &key.client_email,
        sub: &key.client_email,
        aud: token_uri,
        scope: CLOUD_PLATFORM_SCOPE,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| GenAiError::Auth(format!("invalid service-account private key: {e}")))?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
        .map_err(|e| GenAiError::Auth(e.to_string()))
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Credentials plus the last token they produced.
#[derive(Debug)]
pub struct TokenProvider {
    credentials: Credentials,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cached: RwLock::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Bearer token for one upstream call, reusing the cached one while fresh.
    pub async fn bearer_token(&self, http: &reqwest::Client) -> Result<String, GenAiError> {
        if let Some(cached) = self.cached.read().await.as_ref().filter(|c| c.is_fresh()) {
            return Ok(cached.token.clone());
        }

        let mut cached = self.cached.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(fresh) = cached.as_ref().filter(|c| c.is_fresh()) {
            return Ok(fresh.token.clone());
        }

        let (token, lifetime) = self.credentials.fetch(http).await?;
        if let Some(lifetime) = lifetime {
            *cached = Some(CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + lifetime,
            });
        }
        Ok(token)
    }
}
