//! OAuth access tokens for the BigQuery REST API
//!
//! Either a pre-minted bearer token, or a token obtained from a
//! service-account key through the JWT-bearer grant (RS256 assertion signed
//! with `jsonwebtoken`). Minted tokens are cached until shortly before expiry.

use calls_core::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

/// OAuth scope for BigQuery
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Assertion lifetime; Google rejects anything above one hour
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh this long before the cached token expires
const REFRESH_MARGIN_SECS: i64 = 60;

/// The parts of a service-account JSON key the grant needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    /// Read a key file from disk
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            error!("Failed to read service-account key {}: {}", path.display(), e);
            AppError::Config(format!(
                "Cannot read service-account key {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("Invalid service-account key: {}", e)))
    }
}

/// Claims of the JWT-bearer assertion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionClaims {
    /// Issuer (service-account email)
    pub iss: String,

    /// Space-separated OAuth scopes
    pub scope: String,

    /// Audience (token endpoint)
    pub aud: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl AssertionClaims {
    pub fn new(key: &ServiceAccountKey, now: DateTime<Utc>) -> Self {
        Self {
            iss: key.client_email.clone(),
            scope: BIGQUERY_SCOPE.to_string(),
            aud: key.token_uri.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
        }
    }
}

/// Sign the assertion for `key` at `now`
pub fn build_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> AppResult<String> {
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
        error!(error = %e, "Invalid service-account private key");
        AppError::Auth(format!("Invalid service-account private key: {}", e))
    })?;

    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let claims = AssertionClaims::new(key, now);

    debug!(iss = %claims.iss, exp = %claims.exp, "Signing service-account assertion");

    encode(&header, &claims, &encoding_key).map_err(|e| {
        error!(error = %e, "Failed to sign service-account assertion");
        AppError::Auth(format!("Assertion signing failed: {}", e))
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

enum TokenSource {
    Static(String),
    ServiceAccount(ServiceAccountKey),
}

/// Hands out bearer tokens for BigQuery calls
pub struct TokenProvider {
    source: TokenSource,
    http_client: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Provider for a pre-minted token
    pub fn from_token(token: &str, http_client: Client) -> Self {
        Self {
            source: TokenSource::Static(token.to_string()),
            http_client,
            cached: Mutex::new(None),
        }
    }

    /// Provider minting tokens from a service-account key
    pub fn from_service_account(key: ServiceAccountKey, http_client: Client) -> Self {
        Self {
            source: TokenSource::ServiceAccount(key),
            http_client,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, minting a new one when needed
    #[instrument(skip(self))]
    pub async fn token(&self) -> AppResult<String> {
        let key = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount(key) => key,
        };

        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref() {
            if token.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > now {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.exchange(key, now).await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn exchange(&self, key: &ServiceAccountKey, now: DateTime<Utc>) -> AppResult<CachedToken> {
        let assertion = build_assertion(key, now)?;

        let response = self
            .http_client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| {
                error!("Token request to {} failed: {}", key.token_uri, e);
                AppError::Auth(format!("Token request failed: {}", e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read token response: {}", e);
            AppError::Auth(format!("Failed to read token response: {}", e))
        })?;

        if !status.is_success() {
            error!("Token endpoint returned {}: {}", status, body);
            return Err(AppError::Auth(format!(
                "Token endpoint returned {}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Unexpected token response: {}", e);
            AppError::Auth(format!("Unexpected token response: {}", e))
        })?;

        info!("Obtained BigQuery access token for {}", key.client_email);

        Ok(CachedToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/service_account_key.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/service_account_pub.pem");

    fn key() -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "loader@proj.iam.gserviceaccount.com".to_string(),
            private_key: PRIVATE_KEY.to_string(),
            private_key_id: Some("kid-1".to_string()),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
        }
    }

    #[test]
    fn test_key_from_json_defaults_token_uri() {
        let key = ServiceAccountKey::from_json(
            r#"{"type": "service_account", "client_email": "a@b", "private_key": "pem"}"#,
        )
        .unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
        assert!(key.private_key_id.is_none());
    }

    #[test]
    fn test_key_from_json_rejects_garbage() {
        assert!(matches!(
            ServiceAccountKey::from_json("{}"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_assertion_is_verifiable() {
        let now = Utc::now();
        let token = build_assertion(&key(), now).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[DEFAULT_TOKEN_URI]);

        let decoded = decode::<AssertionClaims>(
            &token,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.header.kid.as_deref(), Some("kid-1"));
        assert_eq!(decoded.claims.iss, "loader@proj.iam.gserviceaccount.com");
        assert_eq!(decoded.claims.scope, BIGQUERY_SCOPE);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn test_invalid_private_key() {
        let mut bad = key();
        bad.private_key = "not a pem".to_string();
        assert!(matches!(
            build_assertion(&bad, Utc::now()),
            Err(AppError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_static_token_passthrough() {
        let provider = TokenProvider::from_token("ya29.static", Client::new());
        assert_eq!(provider.token().await.unwrap(), "ya29.static");
    }
}
