//! Typed HTTP client for the upstream resource services
//!
//! Three deployment modes resolve a resource family to a base URL:
//! external (one public domain, TMF path prefixes), internal (per-resource
//! pod hostnames, hot-updatable), and a legacy proxy with its own prefix
//! table. Every call forwards the caller's bearer token verbatim plus the
//! `X-Organization` header and negotiates JSON.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::{UpstreamConfig, UpstreamMode};
use crate::error::{GatewayError, Result};
use crate::kinds;

/// Legacy proxy path prefixes per API family
const PROXY_PREFIXES: &[(&str, &str)] = &[
    ("productCatalogManagement", "catalog"),
    ("productOrderingManagement", "ordering"),
    ("productInventory", "inventory"),
    ("serviceCatalogManagement", "service"),
    ("resourceCatalogManagement", "resource"),
    ("party", "party"),
    ("agreementManagement", "agreement"),
    ("usageManagement", "usage"),
    ("accountManagement", "account"),
    ("quoteManagement", "quote"),
];

/// Client over the configured upstream endpoints
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    mode: UpstreamMode,
    domain: String,
    proxy_base: String,
    hosts: Arc<RwLock<HashMap<String, String>>>,
}

impl UpstreamClient {
    /// Build a client from configuration
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            mode: config.mode,
            domain: config.domain.trim_end_matches('/').to_string(),
            proxy_base: config.proxy_base.trim_end_matches('/').to_string(),
            hosts: Arc::new(RwLock::new(config.hosts.clone())),
        })
    }

    /// Replace the internal-mode host table
    ///
    /// Readers in flight keep the table they resolved; the swap is atomic.
    pub async fn set_hosts(&self, hosts: HashMap<String, String>) {
        *self.hosts.write().await = hosts;
    }

    /// Current internal-mode host table
    pub async fn hosts(&self) -> HashMap<String, String> {
        self.hosts.read().await.clone()
    }

    /// Resolve the collection URL for a resource family
    async fn collection_url(&self, api: &str, resource: &str) -> Result<String> {
        match self.mode {
            UpstreamMode::External => {
                Ok(format!("{}/tmf-api/{api}/v4/{resource}", self.domain))
            }
            UpstreamMode::Internal => {
                let hosts = self.hosts.read().await;
                let host = hosts.get(resource).ok_or_else(|| {
                    GatewayError::Internal(format!("no upstream host for resource {resource:?}"))
                })?;
                Ok(format!(
                    "{}/tmf-api/{api}/v4/{resource}",
                    host.trim_end_matches('/')
                ))
            }
            UpstreamMode::Proxy => {
                let prefix = PROXY_PREFIXES
                    .iter()
                    .find(|(a, _)| *a == api)
                    .map(|(_, p)| *p)
                    .ok_or_else(|| {
                        GatewayError::Internal(format!("no proxy prefix for api {api:?}"))
                    })?;
                Ok(format!("{}/{prefix}/{resource}", self.proxy_base))
            }
        }
    }

    /// Resolve an `href` to a full URL
    ///
    /// Accepts absolute URLs and bare NGSI-LD identifiers; the latter are
    /// routed through the kind and prefix tables.
    pub async fn href_url(&self, href: &str) -> Result<String> {
        if href.starts_with("http://") || href.starts_with("https://") {
            return Ok(href.to_string());
        }
        let resource = kinds::kind_of_id(href).ok_or_else(|| {
            GatewayError::BadRequest(format!("href {href:?} is neither a URL nor a known id"))
        })?;
        let api = kinds::api_family(resource)
            .ok_or_else(|| GatewayError::Internal(format!("no API family for {resource:?}")))?;
        Ok(format!("{}/{href}", self.collection_url(api, resource).await?))
    }

    /// Fetch one object by href or id
    pub async fn get_by_href(&self, href: &str, auth: &CallContext) -> Result<Value> {
        let url = self.href_url(href).await?;
        let resp = self
            .http
            .get(&url)
            .headers(auth.headers())
            .send()
            .await?;
        expect_json(resp).await
    }

    /// Fetch one object of a resource family by id
    pub async fn get_object(
        &self,
        api: &str,
        resource: &str,
        id: &str,
        auth: &CallContext,
    ) -> Result<Value> {
        let url = format!("{}/{id}", self.collection_url(api, resource).await?);
        let resp = self.http.get(&url).headers(auth.headers()).send().await?;
        expect_json(resp).await
    }

    /// Fetch one page of a collection
    pub async fn list_page(
        &self,
        api: &str,
        resource: &str,
        query: &[(&str, String)],
        auth: &CallContext,
    ) -> Result<Vec<Value>> {
        let url = self.collection_url(api, resource).await?;
        let resp = self
            .http
            .get(&url)
            .query(query)
            .headers(auth.headers())
            .send()
            .await?;
        let body = expect_json(resp).await?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(GatewayError::upstream(
                200,
                &format!("expected a JSON array, got {other}"),
            )),
        }
    }

    /// POST a new object; 201 is the expected success
    pub async fn create(
        &self,
        api: &str,
        resource: &str,
        body: &Value,
        auth: &CallContext,
    ) -> Result<Value> {
        let url = self.collection_url(api, resource).await?;
        let resp = self
            .http
            .post(&url)
            .headers(auth.headers())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() != 201 && status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "upstream CREATE did not return 201");
        }
        if status.is_success() && resp.headers().get(LOCATION).is_none() {
            tracing::warn!(%url, "upstream CREATE response carries no Location header");
        }
        expect_json(resp).await
    }

    /// PATCH an existing object
    pub async fn patch(
        &self,
        api: &str,
        resource: &str,
        id: &str,
        body: &Value,
        auth: &CallContext,
    ) -> Result<Value> {
        let url = format!("{}/{id}", self.collection_url(api, resource).await?);
        let resp = self
            .http
            .patch(&url)
            .headers(auth.headers())
            .json(body)
            .send()
            .await?;
        expect_json(resp).await
    }
}

/// Per-call authentication context forwarded to the upstream
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Raw `Authorization` header value, forwarded verbatim
    pub authorization: String,
    /// Caller's organization identifier
    pub organization: String,
}

impl CallContext {
    pub fn new(authorization: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            authorization: authorization.into(),
            organization: organization.into(),
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !self.authorization.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&self.authorization) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        if !self.organization.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&self.organization) {
                headers.insert("X-Organization", v);
            }
        }
        headers
    }
}

/// Check for 2xx and decode the JSON body
async fn expect_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    if !status.is_success() {
        let snippet = String::from_utf8_lossy(&bytes);
        return Err(GatewayError::upstream(status.as_u16(), &snippet));
    }
    serde_json::from_slice(&bytes).map_err(|e| {
        GatewayError::upstream(status.as_u16(), &format!("invalid JSON from upstream: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> UpstreamClient {
        let config = UpstreamConfig {
            domain: server.uri(),
            ..UpstreamConfig::default()
        };
        UpstreamClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_get_object_forwards_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/tmf-api/productCatalogManagement/v4/productOffering/urn:ngsi-ld:product-offering:A",
            ))
            .and(header("Authorization", "Bearer tok"))
            .and(header("X-Organization", "did:elsi:ME"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "urn:ngsi-ld:product-offering:A"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let auth = CallContext::new("Bearer tok", "did:elsi:ME");
        let got = client
            .get_object(
                "productCatalogManagement",
                "productOffering",
                "urn:ngsi-ld:product-offering:A",
                &auth,
            )
            .await
            .unwrap();
        assert_eq!(got["id"], json!("urn:ngsi-ld:product-offering:A"));
    }

    #[tokio::test]
    async fn test_non_2xx_surfaces_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get_object(
                "productCatalogManagement",
                "productOffering",
                "urn:ngsi-ld:product-offering:A",
                &CallContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream");
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_list_page_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tmf-api/productCatalogManagement/v4/productOffering"))
            .and(query_param("lifecycleStatus", "Launched"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "x"}])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let page = client
            .list_page(
                "productCatalogManagement",
                "productOffering",
                &[
                    ("lifecycleStatus", "Launched".to_string()),
                    ("limit", "10".to_string()),
                ],
                &CallContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_href_url_resolves_ids() {
        let config = UpstreamConfig {
            domain: "https://market.example".to_string(),
            ..UpstreamConfig::default()
        };
        let client = UpstreamClient::new(&config).unwrap();
        assert_eq!(
            client
                .href_url("urn:ngsi-ld:product-specification:9")
                .await
                .unwrap(),
            "https://market.example/tmf-api/productCatalogManagement/v4/productSpecification/urn:ngsi-ld:product-specification:9"
        );
        assert_eq!(
            client.href_url("https://other.example/x").await.unwrap(),
            "https://other.example/x"
        );
        assert!(client.href_url("urn:ngsi-ld:bogus-kind:1").await.is_err());
    }

    #[tokio::test]
    async fn test_internal_mode_hosts_are_hot_updatable() {
        let config = UpstreamConfig {
            mode: UpstreamMode::Internal,
            ..UpstreamConfig::default()
        };
        let client = UpstreamClient::new(&config).unwrap();
        assert!(client
            .collection_url("productCatalogManagement", "productOffering")
            .await
            .is_err());

        let mut hosts = HashMap::new();
        hosts.insert(
            "productOffering".to_string(),
            "http://catalog-pod:8080".to_string(),
        );
        client.set_hosts(hosts).await;
        assert_eq!(
            client
                .collection_url("productCatalogManagement", "productOffering")
                .await
                .unwrap(),
            "http://catalog-pod:8080/tmf-api/productCatalogManagement/v4/productOffering"
        );
    }

    #[tokio::test]
    async fn test_proxy_mode_prefixes() {
        let config = UpstreamConfig {
            mode: UpstreamMode::Proxy,
            proxy_base: "http://legacy:9000".to_string(),
            ..UpstreamConfig::default()
        };
        let client = UpstreamClient::new(&config).unwrap();
        assert_eq!(
            client
                .collection_url("productCatalogManagement", "productOffering")
                .await
                .unwrap(),
            "http://legacy:9000/catalog/productOffering"
        );
    }
}
