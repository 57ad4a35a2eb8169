use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IngestError;
use crate::feed::FeedDocument;

/// Basic-auth credentials for every URL under `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials(Vec<Credential>);

impl Credentials {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self(credentials)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Most specific credential whose URL covers `url`: same scheme, host and
    /// effective port, and a path whose segments start with the credential's.
    pub fn for_url(&self, url: &str) -> Option<&Credential> {
        let target = Url::parse(url).ok()?;
        self.0
            .iter()
            .filter_map(|credential| {
                let base = Url::parse(&credential.url).ok()?;
                covers(&base, &target).then(|| (path_segments(&base).len(), credential))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, credential)| credential)
    }

    pub(crate) fn apply(&self, url: &str, request: RequestBuilder) -> RequestBuilder {
        match self.for_url(url) {
            Some(credential) => {
                request.basic_auth(&credential.username, Some(&credential.password))
            }
            None => request,
        }
    }
}

fn covers(base: &Url, url: &Url) -> bool {
    base.scheme() == url.scheme()
        && base.host_str() == url.host_str()
        && base.port_or_known_default() == url.port_or_known_default()
        && path_segments(url).starts_with(&path_segments(base))
}

/// Non-empty path segments, so `/private` and `/private/` cover the same tree.
fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default()
}

/// Feed transport: returns the parsed document at `url`.
pub trait FeedSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FeedDocument, IngestError>;
}

/// Fetches `http(s)://` feeds with reqwest and reads anything else from the
/// local filesystem.
#[derive(Clone)]
pub struct HttpFeedSource {
    client: Client,
    credentials: Credentials,
}

impl HttpFeedSource {
    pub fn new(credentials: Credentials) -> Result<Self, IngestError> {
        let client = http_client(Duration::from_secs(60)).map_err(IngestError::FeedHttp)?;
        Ok(Self {
            client,
            credentials,
        })
    }

    fn fetch_http(&self, url: &str) -> Result<Vec<u8>, IngestError> {
        let request = self.credentials.apply(url, self.client.get(url));
        let response = request
            .send()
            .map_err(|err| IngestError::FeedHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let bytes = response
            .bytes()
            .map_err(|err| IngestError::FeedHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "feed request failed".to_string());
        Err(IngestError::FeedStatus { status, message })
    }

    fn read_local(url: &str) -> Result<Vec<u8>, IngestError> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        fs::read(&path).map_err(|_| IngestError::FeedRead(path))
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch(&self, url: &str) -> Result<FeedDocument, IngestError> {
        let start = std::time::Instant::now();
        let body = if is_http(url) {
            self.fetch_http(url)?
        } else {
            Self::read_local(url)?
        };
        debug!(
            url,
            bytes = body.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "feed.response"
        );
        FeedDocument::parse(url, &body)
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client, String> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("atom-ingest/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| err.to_string())?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| err.to_string())
}

pub(crate) fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Resolves a link found in the document at `base` into a fetchable location.
pub fn resolve_href(base: &str, href: &str) -> String {
    if is_http(href) || href.starts_with("file://") {
        return href.to_string();
    }
    if is_http(base) {
        return Url::parse(base)
            .and_then(|base| base.join(href))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| href.to_string());
    }
    let local = base.strip_prefix("file://").unwrap_or(base);
    if href.starts_with('/') {
        return href.to_string();
    }
    match local.rfind('/') {
        Some(index) => format!("{}/{}", &local[..index], href),
        None => href.to_string(),
    }
}
