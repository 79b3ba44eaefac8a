//! Shared HTTP scaffolding for panel adapters.
//!
//! Every adapter owns one [`PanelClient`]: a reqwest client with the
//! configured timeout, the panel's base URL and pre-bound auth query
//! parameters/headers, retrying sends, and named ETag slots for
//! conditional GETs.

use crate::error::{PanelError, PanelResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
// First attempt plus three retries.
const ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn json<T: DeserializeOwned>(&self) -> PanelResult<T> {
        serde_json::from_str(&self.body).map_err(|err| PanelError::decode(&self.url, err))
    }
}

pub struct PanelClient {
    http: reqwest::Client,
    base_url: String,
    bound_query: Vec<(String, String)>,
    bound_headers: Vec<(String, String)>,
    etags: Mutex<HashMap<&'static str, String>>,
    debug: AtomicBool,
}

impl PanelClient {
    /// `timeout_secs == 0` selects the 5 s default.
    pub fn new(api_host: &str, timeout_secs: u64) -> PanelResult<Self> {
        let timeout = if timeout_secs > 0 {
            Duration::from_secs(timeout_secs)
        } else {
            DEFAULT_TIMEOUT
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PanelError::invalid(format!("build http client: {err}")))?;
        Ok(Self {
            http,
            base_url: api_host.trim_end_matches('/').to_string(),
            bound_query: Vec::new(),
            bound_headers: Vec::new(),
            etags: Mutex::new(HashMap::new()),
            debug: AtomicBool::new(false),
        })
    }

    /// Bind a query parameter to every request, the way panels carry their
    /// auth key and node id.
    pub fn bind_query(mut self, key: &str, value: impl ToString) -> Self {
        self.bound_query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn bind_header(mut self, key: &str, value: impl ToString) -> Self {
        self.bound_headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn set_debug(&self, enable: bool) {
        self.debug.store(enable, Ordering::Relaxed);
    }

    pub fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Current validator for a named ETag slot, for tests and debugging.
    pub fn etag(&self, slot: &'static str) -> Option<String> {
        self.etags.lock().get(slot).cloned()
    }

    pub async fn get(
        &self,
        path: &str,
        slot: Option<&'static str>,
        query: &[(&str, String)],
    ) -> PanelResult<RawResponse> {
        self.send(reqwest::Method::GET, path, slot, query, &[], None::<&()>)
            .await
    }

    pub async fn get_with_headers(
        &self,
        path: &str,
        slot: Option<&'static str>,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> PanelResult<RawResponse> {
        self.send(reqwest::Method::GET, path, slot, query, headers, None::<&()>)
            .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &T,
    ) -> PanelResult<RawResponse> {
        self.send(reqwest::Method::POST, path, None, query, &[], Some(body))
            .await
    }

    pub async fn post_json_with_headers<T: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
        body: &T,
    ) -> PanelResult<RawResponse> {
        self.send(reqwest::Method::POST, path, None, query, headers, Some(body))
            .await
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        slot: Option<&'static str>,
        query: &[(&str, String)],
        headers: &[(&str, String)],
        body: Option<&T>,
    ) -> PanelResult<RawResponse> {
        let url = self.url(path);
        let mut last_err = None;
        for attempt in 0..ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            let mut req = self.http.request(method.clone(), &url);
            for (k, v) in &self.bound_query {
                req = req.query(&[(k.as_str(), v.as_str())]);
            }
            for (k, v) in query {
                req = req.query(&[(*k, v.as_str())]);
            }
            for (k, v) in &self.bound_headers {
                req = req.header(k.as_str(), v.as_str());
            }
            for (k, v) in headers {
                req = req.header(*k, v.as_str());
            }
            if let Some(slot) = slot {
                if let Some(etag) = self.etag(slot) {
                    req = req.header(reqwest::header::IF_NONE_MATCH, etag);
                }
            }
            if let Some(body) = body {
                req = req.json(body);
            }
            match req.send().await {
                Ok(resp) => return self.finish(&url, slot, resp).await,
                Err(err) => {
                    tracing::debug!(%url, attempt, %err, "panel request attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(PanelError::Request {
            url,
            // Retries exhausted; the loop stored at least one error.
            source: last_err.expect("at least one attempt"),
        })
    }

    async fn finish(
        &self,
        url: &str,
        slot: Option<&'static str>,
        resp: reqwest::Response,
    ) -> PanelResult<RawResponse> {
        let status = resp.status().as_u16();
        if let Some(slot) = slot {
            if status == 304 {
                return Err(PanelError::not_modified(slot));
            }
            // Only a success response may move the validator forward.
            if status < 400 {
                if let Some(etag) = resp
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                {
                    if !etag.is_empty() {
                        let mut etags = self.etags.lock();
                        if etags.get(slot).map(String::as_str) != Some(etag) {
                            etags.insert(slot, etag.to_string());
                        }
                    }
                }
            }
        }
        let body = resp
            .text()
            .await
            .map_err(|source| PanelError::Request {
                url: url.to_string(),
                source,
            })?;
        if self.debug.load(Ordering::Relaxed) {
            tracing::debug!(%url, status, body = %body, "panel response");
        }
        if status >= 400 {
            return Err(PanelError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        if body.trim().is_empty() {
            return Err(PanelError::decode(url, "empty response body"));
        }
        Ok(RawResponse {
            url: url.to_string(),
            status,
            body,
        })
    }

    /// Store a validator directly. Only used by tests that exercise the
    /// conditional-GET flow without a live panel.
    #[cfg(test)]
    pub(crate) fn put_etag(&self, slot: &'static str, value: &str) {
        self.etags.lock().insert(slot, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_slots_are_independent() {
        let client = PanelClient::new("http://panel.example", 0).unwrap();
        assert_eq!(client.etag("node"), None);
        client.put_etag("node", "\"abc\"");
        client.put_etag("users", "\"def\"");
        assert_eq!(client.etag("node").as_deref(), Some("\"abc\""));
        assert_eq!(client.etag("users").as_deref(), Some("\"def\""));
        assert_eq!(client.etag("rules"), None);
    }

    #[test]
    fn url_join() {
        let client = PanelClient::new("http://panel.example/", 0).unwrap();
        assert_eq!(client.url("/mod_mu/users"), "http://panel.example/mod_mu/users");
        // Single-endpoint panels request the host itself.
        assert_eq!(client.url(""), "http://panel.example");
    }

    #[test]
    fn raw_response_json_error_carries_url() {
        let raw = RawResponse {
            url: "http://panel.example/x".into(),
            status: 200,
            body: "not json".into(),
        };
        let err = raw.json::<serde_json::Value>().unwrap_err();
        assert!(err.to_string().contains("http://panel.example/x"));
    }
}
