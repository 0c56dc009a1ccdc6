//! Fetch primitive consumed by the engine.
//!
//! Everything that touches the network goes through the [`Fetcher`] trait:
//! the interpreter's page fetches, the automatic template probe, and the
//! `http.*` host API inside rule sandboxes. [`HttpFetcher`] is the default
//! implementation on `reqwest`; tests substitute an in-memory double.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// A single HTTP request description.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    /// Header pairs in insertion order.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
    /// Label of the charset used to decode the response (e.g. `"gbk"`).
    pub encoding: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            encoding: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns `true` if a header with this name (case-insensitive) is set.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

/// The response of a [`FetchRequest`], body already decoded to text.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl FetchResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// All values of a header, case-insensitive.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The host-provided fetch primitive.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// Default [`Fetcher`] backed by a shared `reqwest` client.
pub struct HttpFetcher {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            default_timeout,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .with_context(|| format!("unsupported HTTP method: {}", request.method))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout.unwrap_or(self.default_timeout));
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("HTTP {} {} failed", request.method, request.url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let bytes = response
            .bytes()
            .await
            .context("Failed to read response body")?;

        Ok(FetchResponse {
            status,
            headers,
            body: decode_body(&bytes, request.encoding.as_deref()),
        })
    }
}

/// Decode raw bytes using a charset label, falling back to UTF-8.
pub fn decode_body(bytes: &[u8], encoding: Option<&str>) -> String {
    let encoding = encoding
        .and_then(|label| encoding_rs::Encoding::for_label(label.trim().as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Percent-encode `text` after converting it to the given charset.
///
/// Search keywords must be encoded in the site's own charset.
pub fn encode_query(text: &str, encoding: &str) -> String {
    let encoding =
        encoding_rs::Encoding::for_label(encoding.trim().as_bytes()).unwrap_or(encoding_rs::UTF_8);
    if encoding == encoding_rs::UTF_8 {
        return urlencoding::encode(text).into_owned();
    }
    let (bytes, _, _) = encoding.encode(text);
    urlencoding::encode_binary(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_body_gbk() {
        let (bytes, _, _) = encoding_rs::GBK.encode("中文");
        assert_eq!(decode_body(&bytes, Some("gbk")), "中文");
        assert_eq!(decode_body("plain".as_bytes(), None), "plain");
        assert_eq!(decode_body("x".as_bytes(), Some("no-such-charset")), "x");
    }

    #[test]
    fn test_encode_query() {
        assert_eq!(encode_query("a b", "utf-8"), "a%20b");
        assert_eq!(encode_query("中", "gbk"), "%D6%D0");
    }

    #[test]
    fn test_has_header_case_insensitive() {
        let req = FetchRequest::get("https://a.com").header("User-Agent", "x");
        assert!(req.has_header("user-agent"));
        assert!(!req.has_header("cookie"));
    }
}
