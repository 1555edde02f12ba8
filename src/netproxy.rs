//! Virtual network proxy: the only network surface exposed to guests.
//!
//! Guests never open sockets. When an invocation enables networking, the
//! engine registers a host binding that forwards to [`VirtualNetwork::http`],
//! which sanitizes headers, runs the URL through the egress filter, and only
//! then performs the request with bounded timeouts.

use crate::blocklist::EgressFilter;
use crate::constants::{NET_CONNECT_TIMEOUT, NET_REQUEST_TIMEOUT, RESTRICTED_HEADERS};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use url::Url;

/// Flattened HTTP exchange handed back to guests.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    /// Response status code.
    pub status: u16,
    /// Response headers; multi-valued headers collapse to their first value.
    pub headers: Map<String, Value>,
    /// Response body decoded as UTF-8 text.
    pub body: String,
}

impl HttpExchange {
    /// JSON shape crossing the guest boundary: `{status, headers, body}`.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("status".into(), Value::from(self.status));
        object.insert("headers".into(), Value::Object(self.headers.clone()));
        object.insert("body".into(), Value::String(self.body.clone()));
        Value::Object(object)
    }
}

/// Host-side HTTP client serving guest requests under egress policy.
pub struct VirtualNetwork {
    /// Built lazily on the first exchange: the blocking client must come up
    /// on an invocation worker, never inside the async runtime.
    client: OnceLock<Client>,
    filter: Arc<EgressFilter>,
}

impl VirtualNetwork {
    /// Creates a proxy enforcing `filter`.
    pub fn new(filter: Arc<EgressFilter>) -> Self {
        Self {
            client: OnceLock::new(),
            filter,
        }
    }

    /// Creates a proxy bound to the process-wide default filter.
    pub fn from_global() -> Result<Self> {
        let filter = EgressFilter::global()
            .ok_or_else(|| Error::Internal("no global egress filter installed".to_string()))?;
        Ok(Self::new(filter))
    }

    fn client(&self) -> Result<&Client> {
        if self.client.get().is_none() {
            let built = Client::builder()
                .connect_timeout(NET_CONNECT_TIMEOUT)
                .timeout(NET_REQUEST_TIMEOUT)
                .build()
                .map_err(|e| Error::Internal(format!("http client construction failed: {e}")))?;
            let _ = self.client.set(built);
        }
        self.client
            .get()
            .ok_or_else(|| Error::Internal("http client initialization raced".to_string()))
    }

    /// The single guest-facing operation.
    ///
    /// The method is uppercased; restricted headers are dropped; the URL must
    /// parse and pass [`EgressFilter::enforce_url`] before any connection is
    /// attempted. GET and HEAD send no body; other methods send `body` as
    /// UTF-8 text.
    pub fn http(
        &self,
        method: &str,
        url: &str,
        body: Option<&str>,
        headers: &[(String, String)],
    ) -> Result<HttpExchange> {
        let method = method.to_uppercase();
        let parsed =
            Url::parse(url).map_err(|e| Error::egress(format!("invalid URL {url}: {e}")))?;

        self.filter.enforce_url(&parsed)?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::NetworkRequest(format!("invalid method: {method}")))?;
        let send_body = method != reqwest::Method::GET && method != reqwest::Method::HEAD;

        let mut request = self.client()?.request(method.clone(), parsed);
        for (name, value) in headers {
            if RESTRICTED_HEADERS
                .iter()
                .any(|r| r.eq_ignore_ascii_case(name))
            {
                debug!(header = %name, "dropping restricted header");
                continue;
            }
            request = request.header(name, value);
        }
        if send_body {
            request = request.body(body.unwrap_or_default().to_string());
        }

        let response = request
            .send()
            .map_err(|e| Error::NetworkRequest(e.to_string()))?;

        let status = response.status().as_u16();
        let mut flattened = Map::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str()
                && !flattened.contains_key(name.as_str())
            {
                flattened.insert(name.as_str().to_string(), Value::String(text.to_string()));
            }
        }
        let body = response
            .text()
            .map_err(|e| Error::NetworkRequest(e.to_string()))?;

        debug!(%status, method = %method, "virtual network exchange complete");
        Ok(HttpExchange {
            status,
            headers: flattened,
            body,
        })
    }
}
