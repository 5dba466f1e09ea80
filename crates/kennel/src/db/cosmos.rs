use super::credential::{AccessToken, Credential, TokenSource, COSMOS_SCOPE};
use super::{
    ContainerRef, ContainerSpec, DocumentStore, Provisioned, QueryOptions, QuerySpec,
    StoreConnector, StoreError, StoreResult,
};
use futures::future::try_join_all;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

const API_VERSION: &str = "2018-12-31";
const TOKEN_REFRESH_WINDOW_MINUTES: i64 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Resource types that take part in request signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceType {
    Account,
    Database,
    Container,
    Document,
    PartitionKeyRange,
}

impl ResourceType {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Account => "",
            ResourceType::Database => "dbs",
            ResourceType::Container => "colls",
            ResourceType::Document => "docs",
            ResourceType::PartitionKeyRange => "pkranges",
        }
    }
}

/// Format a timestamp the way the `x-ms-date` header expects (RFC 1123)
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// URL-encode an authorization token of the given type (`master` or `aad`)
fn encode_authorization(kind: &str, signature: &str) -> String {
    let raw = format!("type={}&ver=1.0&sig={}", kind, signature);
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// Build the master-key authorization header for one request
pub fn sign_master_key(
    key: &[u8],
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> StoreResult<String> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );

    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| StoreError::Credential(format!("invalid account key: {}", e)))?;
    mac.update(payload.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(encode_authorization("master", &signature))
}

enum Authorizer {
    MasterKey(Vec<u8>),
    Token {
        source: Arc<dyn TokenSource>,
        cached: RwLock<AccessToken>,
    },
}

impl Authorizer {
    async fn header(
        &self,
        verb: &Method,
        resource_type: ResourceType,
        resource_link: &str,
        date: &str,
    ) -> StoreResult<String> {
        match self {
            Authorizer::MasterKey(key) => sign_master_key(
                key,
                verb.as_str(),
                resource_type.as_str(),
                resource_link,
                date,
            ),
            Authorizer::Token { source, cached } => {
                let token = Self::current_token(source.as_ref(), cached).await?;
                Ok(encode_authorization("aad", &token))
            },
        }
    }

    async fn current_token(
        source: &dyn TokenSource,
        cached: &RwLock<AccessToken>,
    ) -> StoreResult<String> {
        let window = ChronoDuration::minutes(TOKEN_REFRESH_WINDOW_MINUTES);
        {
            let token = cached.read().await;
            if !token.expires_within(window) {
                return Ok(token.token.clone());
            }
        }

        let mut token = cached.write().await;
        if token.expires_within(window) {
            *token = source.token(COSMOS_SCOPE).await?;
            tracing::debug!("Refreshed managed identity token");
        }
        Ok(token.token.clone())
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct QueryPage {
    #[serde(rename = "Documents", default)]
    documents: Vec<Value>,
}

#[derive(Deserialize)]
struct PartitionKeyRangePage {
    #[serde(rename = "PartitionKeyRanges", default)]
    ranges: Vec<PartitionKeyRange>,
}

#[derive(Deserialize)]
struct PartitionKeyRange {
    id: String,
}

fn continuation_token(response: &Response) -> Option<String> {
    response
        .headers()
        .get("x-ms-continuation")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else {
        StoreError::Transport(e.to_string())
    }
}

fn decode_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else {
        StoreError::Decode(e.to_string())
    }
}

/// Map a non-success status to a store error
fn status_error(status: StatusCode, message: String) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT => StoreError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized {
            status: status.as_u16(),
            message,
        },
        StatusCode::TOO_MANY_REQUESTS => StoreError::Throttled(message),
        StatusCode::REQUEST_TIMEOUT => StoreError::Timeout(message),
        _ => StoreError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

async fn error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        Ok(ErrorBody {
            code: Some(code), ..
        }) => code,
        _ => text,
    }
}

fn partition_key_header(partition_key: &str) -> String {
    json!([partition_key]).to_string()
}

/// Cosmos DB SQL API client speaking the REST protocol
pub struct CosmosStore {
    endpoint: Url,
    client: reqwest::Client,
    auth: Authorizer,
}

impl CosmosStore {
    fn url(&self, segments: &[&str]) -> StoreResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Transport(format!("invalid endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        resource_type: ResourceType,
        resource_link: &str,
        segments: &[&str],
    ) -> StoreResult<RequestBuilder> {
        let date = http_date(Utc::now());
        let authorization = self
            .auth
            .header(&method, resource_type, resource_link, &date)
            .await?;
        let url = self.url(segments)?;

        Ok(self
            .client
            .request(method, url)
            .header("authorization", authorization)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION))
    }

    async fn execute(request: RequestBuilder) -> StoreResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = error_message(response).await;
        Err(status_error(status, message))
    }

    async fn json_body(response: Response) -> StoreResult<Value> {
        response.json().await.map_err(decode_error)
    }

    /// Read the database account; used to verify reachability and credentials
    async fn read_account(&self) -> StoreResult<()> {
        let request = self
            .request(Method::GET, ResourceType::Account, "", &[])
            .await?;
        Self::execute(request).await?;
        Ok(())
    }

    /// Ids of the container's current partition key ranges
    async fn partition_key_ranges(&self, container: &ContainerRef) -> StoreResult<Vec<String>> {
        let mut ranges = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .request(
                    Method::GET,
                    ResourceType::PartitionKeyRange,
                    &container.link(),
                    &["dbs", &container.database, "colls", &container.container, "pkranges"],
                )
                .await?;
            if let Some(token) = &continuation {
                request = request.header("x-ms-continuation", token.as_str());
            }

            let response = Self::execute(request).await?;
            continuation = continuation_token(&response);
            let page: PartitionKeyRangePage = response.json().await.map_err(decode_error)?;
            ranges.extend(page.ranges.into_iter().map(|range| range.id));

            if continuation.is_none() {
                break;
            }
        }

        tracing::debug!("Container {} has {} partition key ranges", container, ranges.len());
        Ok(ranges)
    }

    /// Collect the pages of one query, optionally pinned to a partition key range
    async fn query_pages(
        &self,
        container: &ContainerRef,
        query: &QuerySpec,
        options: QueryOptions,
        range: Option<&str>,
    ) -> StoreResult<Vec<Value>> {
        let body = serde_json::to_vec(query).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut documents = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .request(
                    Method::POST,
                    ResourceType::Document,
                    &container.link(),
                    &["dbs", &container.database, "colls", &container.container, "docs"],
                )
                .await?
                .header("x-ms-documentdb-isquery", "True")
                .header("content-type", "application/query+json")
                .body(body.clone());

            match range {
                Some(range) => {
                    request = request.header("x-ms-documentdb-partitionkeyrangeid", range);
                },
                None if options.cross_partition => {
                    request = request
                        .header("x-ms-documentdb-query-enablecrosspartition", "True")
                        .header("x-ms-documentdb-query-parallelizecrosspartitionquery", "True");
                },
                None => {},
            }
            if let Some(count) = options.max_item_count {
                request = request.header("x-ms-max-item-count", count.to_string());
            }
            if let Some(token) = &continuation {
                request = request.header("x-ms-continuation", token.as_str());
            }

            let response = Self::execute(request).await?;
            continuation = continuation_token(&response);

            let page: QueryPage = response.json().await.map_err(decode_error)?;
            documents.extend(page.documents);

            if options.single_page || continuation.is_none() {
                break;
            }
        }

        Ok(documents)
    }
}

#[async_trait::async_trait]
impl DocumentStore for CosmosStore {
    async fn create_database_if_not_exists(&self, database: &str) -> StoreResult<Provisioned> {
        let request = self
            .request(Method::POST, ResourceType::Database, "", &["dbs"])
            .await?
            .json(&json!({ "id": database }));

        match Self::execute(request).await {
            Ok(_) => {
                tracing::info!("Created database {}", database);
                Ok(Provisioned::Created)
            },
            Err(StoreError::Conflict(_)) => Ok(Provisioned::Existing),
            Err(e) => Err(e),
        }
    }

    async fn create_container_if_not_exists(
        &self,
        database: &str,
        spec: &ContainerSpec,
    ) -> StoreResult<Provisioned> {
        let database_link = format!("dbs/{}", database);
        let mut request = self
            .request(
                Method::POST,
                ResourceType::Container,
                &database_link,
                &["dbs", database, "colls"],
            )
            .await?
            .json(&json!({
                "id": spec.id,
                "partitionKey": { "paths": [spec.partition_key_path], "kind": "Hash" },
            }));
        if let Some(throughput) = spec.throughput {
            request = request.header("x-ms-offer-throughput", throughput.to_string());
        }

        match Self::execute(request).await {
            Ok(_) => {
                tracing::info!("Created container {}/{}", database, spec.id);
                Ok(Provisioned::Created)
            },
            Err(StoreError::Conflict(_)) => Ok(Provisioned::Existing),
            Err(e) => Err(e),
        }
    }

    async fn create_item(&self, container: &ContainerRef, item: &Value) -> StoreResult<Value> {
        let id = item
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Status {
                status: 400,
                message: "document has no string id".to_string(),
            })?;

        let request = self
            .request(
                Method::POST,
                ResourceType::Document,
                &container.link(),
                &["dbs", &container.database, "colls", &container.container, "docs"],
            )
            .await?
            .header("x-ms-documentdb-partitionkey", partition_key_header(id))
            .json(item);

        Self::json_body(Self::execute(request).await?).await
    }

    async fn read_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
    ) -> StoreResult<Value> {
        let request = self
            .request(
                Method::GET,
                ResourceType::Document,
                &container.document_link(id),
                &["dbs", &container.database, "colls", &container.container, "docs", id],
            )
            .await?
            .header("x-ms-documentdb-partitionkey", partition_key_header(partition_key));

        Self::json_body(Self::execute(request).await?).await
    }

    async fn replace_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        item: &Value,
    ) -> StoreResult<Value> {
        let request = self
            .request(
                Method::PUT,
                ResourceType::Document,
                &container.document_link(id),
                &["dbs", &container.database, "colls", &container.container, "docs", id],
            )
            .await?
            .header("x-ms-documentdb-partitionkey", partition_key_header(partition_key))
            .json(item);

        Self::json_body(Self::execute(request).await?).await
    }

    async fn delete_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
    ) -> StoreResult<()> {
        let request = self
            .request(
                Method::DELETE,
                ResourceType::Document,
                &container.document_link(id),
                &["dbs", &container.database, "colls", &container.container, "docs", id],
            )
            .await?
            .header("x-ms-documentdb-partitionkey", partition_key_header(partition_key));

        Self::execute(request).await?;
        Ok(())
    }

    /// Run a query.
    ///
    /// The gateway refuses cross-partition ORDER BY, TOP and OFFSET/LIMIT, so a
    /// windowed query runs once per partition key range and the pages are
    /// merged here.
    async fn query_items(
        &self,
        container: &ContainerRef,
        query: &QuerySpec,
        options: QueryOptions,
    ) -> StoreResult<Vec<Value>> {
        let documents = match options.window {
            Some(window) if options.cross_partition => {
                let ranges = self.partition_key_ranges(container).await?;
                let range_query = window.range_query(query);
                let pages = try_join_all(ranges.iter().map(|range| {
                    self.query_pages(container, &range_query, options, Some(range.as_str()))
                }))
                .await?;
                window.merge(pages)
            },
            _ => self.query_pages(container, query, options, None).await?,
        };

        tracing::debug!(
            "Query on {} returned {} documents",
            container,
            documents.len()
        );
        Ok(documents)
    }
}

/// Connector producing [`CosmosStore`] clients
#[derive(Debug, Clone)]
pub struct CosmosConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
    accept_invalid_certs: bool,
}

impl Default for CosmosConnector {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }
}

impl CosmosConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            accept_invalid_certs: false,
        }
    }

    /// Skip TLS certificate checks for the local emulator. Ignored for managed identity.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

#[async_trait::async_trait]
impl StoreConnector for CosmosConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credential: Credential,
    ) -> StoreResult<Arc<dyn DocumentStore>> {
        let url = Url::parse(endpoint.trim())
            .map_err(|e| StoreError::Transport(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        if url.scheme() == "http" {
            tracing::warn!("Store endpoint uses http://, prefer https:// for production parity");
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout);

        let auth = match credential {
            Credential::StaticKey(key) => {
                if self.accept_invalid_certs {
                    tracing::warn!(
                        "TLS certificate verification disabled for {} (emulator only)",
                        url
                    );
                    builder = builder.danger_accept_invalid_certs(true);
                }
                let key = STANDARD.decode(key.trim()).map_err(|e| {
                    StoreError::Credential(format!("account key is not valid base64: {}", e))
                })?;
                Authorizer::MasterKey(key)
            },
            Credential::ManagedIdentity(source) => {
                let token = source.token(COSMOS_SCOPE).await?;
                Authorizer::Token {
                    source,
                    cached: RwLock::new(token),
                }
            },
        };

        let client = builder
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let store = CosmosStore {
            endpoint: url,
            client,
            auth,
        };
        store.read_account().await?;

        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EMULATOR_KEY: &str =
        "C2y6yDjf5/R+ob0N8A7Cgv30VRDJIWEHLM+4QDU5DE2nQ9nDuVTqobD4b8mGGyPMbIZnqyMsEcaGQy67XIw/Jw==";

    #[test]
    fn master_key_signature_matches_reference() {
        let key = STANDARD.decode(EMULATOR_KEY).unwrap();
        let header = sign_master_key(
            &key,
            "GET",
            "docs",
            "dbs/petservice/colls/pets/docs/p1",
            "Mon, 19 Oct 2026 10:00:00 GMT",
        )
        .unwrap();

        assert_eq!(
            header,
            "type%3Dmaster%26ver%3D1.0%26sig%3DL1tKPr6vJ5J5lO7zGVGazZmcqLdbgDCm8kKluz7M6Z4%3D"
        );
    }

    #[test]
    fn signature_depends_on_resource_link() {
        let key = STANDARD.decode(EMULATOR_KEY).unwrap();
        let date = "Mon, 19 Oct 2026 10:00:00 GMT";
        let a = sign_master_key(&key, "GET", "docs", "dbs/a/colls/b/docs/1", date).unwrap();
        let b = sign_master_key(&key, "GET", "docs", "dbs/a/colls/b/docs/2", date).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn aad_authorization_is_url_encoded() {
        assert_eq!(
            encode_authorization("aad", "abc.def-ghi_jkl"),
            "type%3Daad%26ver%3D1.0%26sig%3Dabc.def-ghi_jkl"
        );
    }

    #[test]
    fn http_date_is_rfc1123() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
        assert_eq!(http_date(at), "Mon, 19 Oct 2026 10:00:00 GMT");
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "gone".into()),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "dup".into()),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "no".into()),
            StoreError::Unauthorized { status: 403, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            StoreError::Throttled(_)
        ));
        assert!(matches!(
            status_error(StatusCode::REQUEST_TIMEOUT, "late".into()),
            StoreError::Timeout(_)
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "down".into()),
            StoreError::Status { status: 503, .. }
        ));
    }

    #[test]
    fn partition_key_header_is_json_array() {
        assert_eq!(partition_key_header("p1"), r#"["p1"]"#);
        assert_eq!(partition_key_header(r#"a"b"#), r#"["a\"b"]"#);
    }

    #[test]
    fn url_segments_are_encoded() {
        let store = CosmosStore {
            endpoint: Url::parse("https://localhost:8081/").unwrap(),
            client: reqwest::Client::new(),
            auth: Authorizer::MasterKey(vec![1, 2, 3]),
        };
        let url = store
            .url(&["dbs", "petservice", "colls", "pets", "docs", "a b/c"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://localhost:8081/dbs/petservice/colls/pets/docs/a%20b%2Fc"
        );
    }

    #[tokio::test]
    async fn malformed_key_is_a_credential_error() {
        let connector = CosmosConnector::default();
        let result = connector
            .connect(
                "https://localhost:8081/",
                Credential::StaticKey("not base64!".to_string()),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Credential(_))));
    }
}
