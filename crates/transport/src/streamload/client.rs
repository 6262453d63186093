//! HTTP clients for stream-load
//!
//! One client per resolved address, pinned to that address so the
//! request keeps the configured host name for TLS and the Host header.
//! Clients unused for five minutes are dropped. Redirects from frontend
//! to backend are followed by hand so the body and credentials are sent
//! again.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, EXPECT, HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Client, ClientBuilder, StatusCode, Url, redirect};
use rustls::ClientConfig;
use tokio::time::Instant;

use super::body::LoadResponse;
use super::error::StreamLoadError;
use crate::pool::Address;

/// Idle time after which a cached client is dropped
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Frontend to backend is one hop; more means a misconfigured cluster
const MAX_REDIRECTS: usize = 3;

struct CachedClient {
    client: Client,
    last_used: Instant,
}

/// Per-address HTTP clients
pub struct ClientCache {
    timeout: Duration,
    tls: Option<Arc<ClientConfig>>,
    clients: Mutex<HashMap<Address, CachedClient>>,
    fallback: Client,
}

impl ClientCache {
    /// `tls` replaces the built-in roots when CA files are configured
    pub fn new(timeout: Duration, tls: Option<Arc<ClientConfig>>) -> Result<Self, StreamLoadError> {
        let fallback = configure(Client::builder(), timeout, tls.as_ref()).build()?;
        Ok(Self {
            timeout,
            tls,
            clients: Mutex::new(HashMap::new()),
            fallback,
        })
    }

    /// Client bound to `address`, evicting idle ones
    pub fn get(&self, address: &Address) -> Result<Client, StreamLoadError> {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        clients.retain(|addr, cached| {
            let keep = now.duration_since(cached.last_used) < CLIENT_IDLE_TIMEOUT;
            if !keep {
                tracing::debug!(address = %addr, "dropping idle stream-load client");
            }
            keep
        });

        if let Some(cached) = clients.get_mut(address) {
            cached.last_used = now;
            return Ok(cached.client.clone());
        }

        let client = self.build(address)?;
        clients.insert(
            address.clone(),
            CachedClient {
                client: client.clone(),
                last_used: now,
            },
        );
        Ok(client)
    }

    /// Client for a redirect target
    ///
    /// Literal addresses get a pinned client; names are resolved by the
    /// HTTP client itself.
    pub fn for_url(&self, url: &Url) -> Result<Client, StreamLoadError> {
        let invalid = || StreamLoadError::InvalidRedirect(url.to_string());
        let port = url.port_or_known_default().ok_or_else(invalid)?;
        let host = url.host_str().ok_or_else(invalid)?;
        match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            Ok(ip) => self.get(&Address {
                addr: SocketAddr::new(ip, port),
                host: ip.to_string(),
            }),
            Err(_) => Ok(self.fallback.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(&self, address: &Address) -> Result<Client, StreamLoadError> {
        let builder = Client::builder().resolve(&address.host, address.addr);
        Ok(configure(builder, self.timeout, self.tls.as_ref()).build()?)
    }
}

/// Settings shared by pinned and fallback clients; redirects stay manual
fn configure(builder: ClientBuilder, timeout: Duration, tls: Option<&Arc<ClientConfig>>) -> ClientBuilder {
    let builder = builder.timeout(timeout).redirect(redirect::Policy::none());
    match tls {
        Some(config) => builder.use_preconfigured_tls(ClientConfig::clone(config)),
        None => builder.min_tls_version(reqwest::tls::Version::TLS_1_2),
    }
}

/// One stream-load request
pub struct LoadRequest<'a> {
    pub url: Url,
    pub table: &'a str,
    pub label: String,
    pub body: Bytes,
    pub properties: &'a HeaderMap,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

impl LoadRequest<'_> {
    /// Configured properties first, so the load format cannot be overridden
    fn headers(&self) -> HeaderMap {
        let mut headers = self.properties.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        headers.insert(HeaderName::from_static("format"), HeaderValue::from_static("json"));
        headers.insert(
            HeaderName::from_static("read_json_by_line"),
            HeaderValue::from_static("true"),
        );
        if let Ok(label) = HeaderValue::from_str(&self.label) {
            headers.insert(HeaderName::from_static("label"), label);
        }
        headers
    }
}

/// Send a load through `client`, following redirects with clients from `cache`
pub async fn send_load(
    cache: &ClientCache,
    client: Client,
    request: &LoadRequest<'_>,
) -> Result<LoadResponse, StreamLoadError> {
    let headers = request.headers();
    let mut url = request.url.clone();
    let mut client = client;

    for _ in 0..=MAX_REDIRECTS {
        let mut builder = client
            .put(url.clone())
            .headers(headers.clone())
            .body(request.body.clone());
        if let Some(username) = request.username {
            builder = builder.basic_auth(username, request.password);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|l| l.to_str().ok())
                .ok_or_else(|| StreamLoadError::InvalidRedirect("missing Location".into()))?;
            let next = url
                .join(location)
                .map_err(|e| StreamLoadError::InvalidRedirect(format!("{location}: {e}")))?;
            tracing::debug!(table = %request.table, from = %url, to = %next, "following redirect");
            client = cache.for_url(&next)?;
            url = next;
            continue;
        }

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamLoadError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let load: LoadResponse = serde_json::from_slice(&bytes)?;
        if !load.is_success() {
            let message = if load.first_error_message.is_empty() {
                load.message.clone()
            } else {
                format!("{} ({})", load.message, load.first_error_message)
            };
            return Err(StreamLoadError::Rejected {
                table: request.table.to_string(),
                status: load.status,
                message,
            });
        }
        return Ok(load);
    }

    Err(StreamLoadError::TooManyRedirects(request.table.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(host: &str, addr: &str) -> Address {
        Address {
            addr: addr.parse().unwrap(),
            host: host.to_string(),
        }
    }

    #[test]
    fn test_client_reused_per_address() {
        let cache = ClientCache::new(Duration::from_secs(5), None).unwrap();
        cache.get(&address("fe-1", "10.0.0.1:8030")).unwrap();
        cache.get(&address("fe-1", "10.0.0.1:8030")).unwrap();
        cache.get(&address("fe-1", "10.0.0.2:8030")).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clients_evicted() {
        let cache = ClientCache::new(Duration::from_secs(5), None).unwrap();
        cache.get(&address("fe-1", "10.0.0.1:8030")).unwrap();
        tokio::time::advance(CLIENT_IDLE_TIMEOUT + Duration::from_secs(1)).await;
        cache.get(&address("fe-2", "10.0.0.2:8030")).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_request_headers() {
        let mut properties = HeaderMap::new();
        properties.insert(
            HeaderName::from_static("max_filter_ratio"),
            HeaderValue::from_static("0.1"),
        );
        let request = LoadRequest {
            url: Url::parse("http://fe-1:8030/api/logs/events/_stream_load").unwrap(),
            table: "events",
            label: "courier-events-00ff".to_string(),
            body: Bytes::new(),
            properties: &properties,
            username: None,
            password: None,
        };
        let headers = request.headers();
        assert_eq!(headers["label"], "courier-events-00ff");
        assert_eq!(headers["format"], "json");
        assert_eq!(headers["read_json_by_line"], "true");
        assert_eq!(headers[CONTENT_ENCODING], "gzip");
        assert_eq!(headers[EXPECT], "100-continue");
        assert_eq!(headers["max_filter_ratio"], "0.1");
    }
}
