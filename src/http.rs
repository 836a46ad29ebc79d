use crate::{config::InfluxConfig, error::TransportError};
use flate2::{Compression, write::GzEncoder};
use reqwest::{Method, Url, blocking::Client};
use std::io::Write;

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Builds a request for `base` with `segments` appended to its path.
    ///
    /// # Errors
    /// Returns an error if `base` is not an absolute URL that can carry a path.
    pub fn new(method: Method, base: &str, segments: &[&str]) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidUrl(base.to_string());
        let mut url = Url::parse(base.trim()).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(segments);

        Ok(Self {
            method,
            url,
            headers: Vec::new(),
            body: Vec::new(),
        })
    }

    /// # Errors
    /// See [`HttpRequest::new`].
    pub fn head(base: &str, segments: &[&str]) -> Result<Self, TransportError> {
        Self::new(Method::HEAD, base, segments)
    }

    /// # Errors
    /// See [`HttpRequest::new`].
    pub fn post(base: &str, segments: &[&str]) -> Result<Self, TransportError> {
        Self::new(Method::POST, base, segments)
    }

    /// Appends a form-encoded query parameter.
    #[must_use]
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sets a plain-text body, gzipped when `compressed` is set.
    ///
    /// # Errors
    /// Returns an error if compression fails.
    pub fn text_body(mut self, body: &str, compressed: bool) -> Result<Self, TransportError> {
        self = self.header("Content-Type", "text/plain; charset=utf-8");
        if compressed {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body.as_bytes())?;
            self.body = encoder.finish()?;
            Ok(self.header("Content-Encoding", "gzip"))
        } else {
            self.body = body.as_bytes().to_vec();
            Ok(self)
        }
    }

    /// Looks up a header, ignoring case.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The URL with the `p` (password) query parameter masked, for errors and logs.
    #[must_use]
    pub fn redacted_url(&self) -> Url {
        let mut url = self.url.clone();
        if self.url.query_pairs().any(|(key, _)| key == "p") {
            let pairs: Vec<(String, String)> = self
                .url
                .query_pairs()
                .map(|(key, value)| {
                    let value = if key == "p" { REDACTED.into() } else { value.into_owned() };
                    (key.into_owned(), value)
                })
                .collect();
            url.query_pairs_mut().clear().extend_pairs(&pairs);
        }
        url
    }
}

const REDACTED: &str = "redacted";

/// A response as seen by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    #[must_use]
    pub const fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// Looks up a header, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Delivers requests to the server.
///
/// Retries, pooling and TLS are the sender's business; the publisher makes exactly one
/// call per request.
pub trait HttpSender: Send + Sync {
    /// # Errors
    /// Returns an error if no response was received.
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// The default [`HttpSender`], backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: Client,
}

impl ReqwestSender {
    /// Creates a client honouring the configured connect and read timeouts.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &InfluxConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpSender for ReqwestSender {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        // reqwest errors carry the URL, which may hold credentials.
        let response = builder.send().map_err(reqwest::Error::without_url)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().map_err(reqwest::Error::without_url)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
