//! Outbound HTTP for federation
//!
//! Every remote GET and POST goes through [`FederationClient`]. The
//! production implementation wraps `reqwest` with a per-call timeout and
//! refuses to talk to loopback or private addresses.

use crate::config::FederationConfig;
use crate::error::AppError;
use async_trait::async_trait;
use http::HeaderMap;
use std::net::IpAddr;
use std::time::Duration;

/// Status and body of a remote response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON, failing on non-2xx statuses
    pub fn json(&self, url: &str) -> Result<serde_json::Value, AppError> {
        if !self.is_success() {
            return Err(AppError::RemoteFetch(format!("{url} returned HTTP {}", self.status)));
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| AppError::RemoteFetch(format!("{url} returned invalid JSON: {e}")))
    }
}

/// HTTP collaborator used by the directory and delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FederationClient: Send + Sync {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, AppError>;

    async fn post(&self, url: &str, headers: HeaderMap, body: Vec<u8>) -> Result<HttpResponse, AppError>;
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::RemoteFetch(format!("Failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Validation(format!(
                "{} resolves to a disallowed address",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::RemoteFetch(format!("No DNS records for {}", host)));
    }

    Ok(())
}

/// Validate a remote URL before any request is made.
///
/// This rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn validate_remote_url(url: &str) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::Validation(format!("Invalid remote URL {}: {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("Missing host in {}", url)))?;

    if is_disallowed_host(host) {
        return Err(AppError::Validation(format!(
            "Refusing to contact local address {}",
            host
        )));
    }

    Ok(parsed)
}

/// `reqwest` backed client
pub struct ReqwestFederationClient {
    client: reqwest::Client,
    allow_private_networks: bool,
}

impl ReqwestFederationClient {
    pub fn new(config: &FederationConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            allow_private_networks: config.allow_private_networks,
        })
    }

    async fn guard(&self, url: &str) -> Result<(), AppError> {
        if self.allow_private_networks {
            return Ok(());
        }

        let parsed = validate_remote_url(url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation(format!("Missing host in {}", url)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation(format!("Missing port in {}", url)))?;

        // Resolve DNS before fetching and reject hosts that resolve internally.
        validate_resolved_host_ips(host, port).await
    }

    async fn read(response: reqwest::Response) -> Result<HttpResponse, AppError> {
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl FederationClient for ReqwestFederationClient {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, AppError> {
        self.guard(url).await?;

        let response = self.client.get(url).headers(headers).send().await?;
        Self::read(response).await
    }

    async fn post(&self, url: &str, headers: HeaderMap, body: Vec<u8>) -> Result<HttpResponse, AppError> {
        self.guard(url).await?;

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Self::read(response).await
    }
}
