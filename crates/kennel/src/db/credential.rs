use super::{StoreError, StoreResult};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use url::{Host, Url};

/// Token scope for the Cosmos DB data plane
pub const COSMOS_SCOPE: &str = "https://cosmos.azure.com/.default";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// How the connection authenticates against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// Pre-shared account key (local emulator)
    StaticKey,
    /// Short-lived bearer token from the ambient identity provider
    ManagedIdentity,
}

impl std::fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialMode::StaticKey => "static-key",
            CredentialMode::ManagedIdentity => "managed-identity",
        };
        write!(f, "{}", s)
    }
}

/// Pick the credential mode for an endpoint.
///
/// Loopback hosts (`localhost`, `127.0.0.1`, `::1`) use the static key; every
/// other endpoint, including ones that fail to parse, uses managed identity.
pub fn resolve(endpoint: &str) -> CredentialMode {
    let Ok(url) = Url::parse(endpoint.trim()) else {
        return CredentialMode::ManagedIdentity;
    };

    match url.host() {
        Some(Host::Domain(domain)) if domain.eq_ignore_ascii_case("localhost") => {
            CredentialMode::StaticKey
        },
        Some(Host::Ipv4(ip)) if ip == Ipv4Addr::LOCALHOST => CredentialMode::StaticKey,
        Some(Host::Ipv6(ip)) if ip == Ipv6Addr::LOCALHOST => CredentialMode::StaticKey,
        _ => CredentialMode::ManagedIdentity,
    }
}

/// A bearer token and its expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// True when the token expires within `window` from now
    pub fn expires_within(&self, window: ChronoDuration) -> bool {
        self.expires_on - Utc::now() <= window
    }
}

/// Source of short-lived bearer tokens
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, scope: &str) -> StoreResult<AccessToken>;
}

/// Materialized credential handed to a connector
#[derive(Clone)]
pub enum Credential {
    StaticKey(String),
    ManagedIdentity(Arc<dyn TokenSource>),
}

impl Credential {
    pub fn mode(&self) -> CredentialMode {
        match self {
            Credential::StaticKey(_) => CredentialMode::StaticKey,
            Credential::ManagedIdentity(_) => CredentialMode::ManagedIdentity,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::StaticKey(_) => f.write_str("StaticKey(<redacted>)"),
            Credential::ManagedIdentity(_) => f.write_str("ManagedIdentity"),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_on: ExpiresOn,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresOn {
    Seconds(i64),
    Text(String),
}

impl ExpiresOn {
    fn to_datetime(&self) -> StoreResult<DateTime<Utc>> {
        let seconds = match self {
            ExpiresOn::Seconds(seconds) => *seconds,
            ExpiresOn::Text(text) => match text.trim().parse::<i64>() {
                Ok(seconds) => seconds,
                Err(_) => {
                    return DateTime::parse_from_rfc3339(text.trim())
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            StoreError::Credential(format!("invalid token expiry '{}': {}", text, e))
                        })
                },
            },
        };
        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| StoreError::Credential(format!("invalid token expiry {}", seconds)))
    }
}

/// Managed identity token source.
///
/// Uses the App Service / Container Apps identity endpoint when
/// `IDENTITY_ENDPOINT` and `IDENTITY_HEADER` are set, and the VM instance
/// metadata service otherwise. `AZURE_CLIENT_ID` selects a user-assigned identity.
pub struct ImdsTokenSource {
    endpoint: String,
    identity_header: Option<String>,
    client_id: Option<String>,
    client: reqwest::Client,
}

impl ImdsTokenSource {
    /// Build from the ambient identity environment variables
    pub fn from_env(timeout: Duration) -> StoreResult<Self> {
        let identity_endpoint = std::env::var("IDENTITY_ENDPOINT").ok();
        let identity_header = std::env::var("IDENTITY_HEADER").ok();
        let client_id = std::env::var("AZURE_CLIENT_ID")
            .ok()
            .filter(|id| !id.trim().is_empty());

        let source = match (identity_endpoint, identity_header) {
            (Some(endpoint), Some(header)) => Self::new(&endpoint, Some(header), timeout)?,
            _ => Self::new(IMDS_ENDPOINT, None, timeout)?,
        };
        Ok(source.with_client_id(client_id))
    }

    /// Build against an explicit token endpoint.
    ///
    /// With an identity header the App Service protocol is spoken, without one
    /// the instance metadata protocol.
    pub fn new(
        endpoint: &str,
        identity_header: Option<String>,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                StoreError::Credential(format!("failed to build identity HTTP client: {}", e))
            })?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            identity_header,
            client_id: None,
            client,
        })
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    fn resource_for(scope: &str) -> &str {
        scope.strip_suffix("/.default").unwrap_or(scope)
    }
}

#[async_trait::async_trait]
impl TokenSource for ImdsTokenSource {
    async fn token(&self, scope: &str) -> StoreResult<AccessToken> {
        let resource = Self::resource_for(scope);

        let mut request = match &self.identity_header {
            Some(header) => self
                .client
                .get(&self.endpoint)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", APP_SERVICE_API_VERSION), ("resource", resource)]),
            None => self
                .client
                .get(&self.endpoint)
                .header("Metadata", "true")
                .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)]),
        };
        if let Some(client_id) = &self.client_id {
            request = request.query(&[("client_id", client_id.as_str())]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout(format!("identity endpoint: {}", e))
            } else {
                StoreError::Credential(format!("identity endpoint unreachable: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Credential(format!(
                "identity endpoint returned {}: {}",
                status, text
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Credential(format!("invalid token response: {}", e)))?;

        tracing::debug!("Obtained managed identity token for {}", resource);
        Ok(AccessToken::new(body.access_token, body.expires_on.to_datetime()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod resolution {
        use super::*;

        #[test]
        fn loopback_hosts_use_static_key() {
            for endpoint in [
                "https://localhost:8081/",
                "https://LOCALHOST:8081",
                "http://localhost",
                "https://127.0.0.1:8081/",
                "https://[::1]:8081/",
            ] {
                assert_eq!(
                    resolve(endpoint),
                    CredentialMode::StaticKey,
                    "expected static key for {}",
                    endpoint
                );
            }
        }

        #[test]
        fn hosted_accounts_use_managed_identity() {
            for endpoint in [
                "https://kennel-prod.documents.azure.com:443/",
                "https://10.0.0.4:8081/",
                "https://127.0.0.2:8081/",
                "https://localhost.example.com/",
            ] {
                assert_eq!(
                    resolve(endpoint),
                    CredentialMode::ManagedIdentity,
                    "expected managed identity for {}",
                    endpoint
                );
            }
        }

        #[test]
        fn unparseable_endpoint_defaults_to_managed_identity() {
            assert_eq!(resolve(""), CredentialMode::ManagedIdentity);
            assert_eq!(resolve("not a url"), CredentialMode::ManagedIdentity);
            assert_eq!(resolve("localhost"), CredentialMode::ManagedIdentity);
        }
    }

    #[test]
    fn credential_debug_redacts_key() {
        let credential = Credential::StaticKey("super-secret".to_string());
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("super-secret"));
        assert_eq!(credential.mode(), CredentialMode::StaticKey);
    }

    #[test]
    fn token_expiry_window() {
        let fresh = AccessToken::new("t", Utc::now() + ChronoDuration::hours(1));
        assert!(!fresh.expires_within(ChronoDuration::minutes(5)));

        let stale = AccessToken::new("t", Utc::now() + ChronoDuration::minutes(2));
        assert!(stale.expires_within(ChronoDuration::minutes(5)));
    }

    #[test]
    fn expires_on_accepts_numbers_and_strings() {
        let numeric = ExpiresOn::Seconds(1_760_000_000).to_datetime().unwrap();
        let textual = ExpiresOn::Text("1760000000".to_string())
            .to_datetime()
            .unwrap();
        assert_eq!(numeric, textual);

        let rfc = ExpiresOn::Text("2026-10-19T10:00:00Z".to_string())
            .to_datetime()
            .unwrap();
        assert_eq!(rfc.to_rfc3339(), "2026-10-19T10:00:00+00:00");

        assert!(ExpiresOn::Text("soon".to_string()).to_datetime().is_err());
    }

    #[test]
    fn resource_strips_default_suffix() {
        assert_eq!(
            ImdsTokenSource::resource_for(COSMOS_SCOPE),
            "https://cosmos.azure.com"
        );
        assert_eq!(ImdsTokenSource::resource_for("api://x"), "api://x");
    }
}
