//! HTTP range source using reqwest.

use crate::error::{Error, ErrorKind, Result};
use crate::models::{Descriptor, FileVersion, SourceInfo};
use crate::source::RangeSource;
use async_trait::async_trait;
use bytes::Bytes;
use exn::{Exn, OptionExt, ResultExt};
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED, RANGE,
};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Validators remembered from the last probe, used to reject bytes belonging
/// to a different version of the file.
#[derive(Debug, Clone)]
struct Probed {
    version: FileVersion,
    size: u64,
    etag: Option<String>,
}

/// Range source backed by an HTTP(S) server honouring `Range` headers.
///
/// Request timeouts are *not* configured on the client; every attempt is
/// bounded by the [`RangeFetcher`](crate::RangeFetcher) using the active
/// timeout tier. Only connection establishment has a fixed limit.
#[derive(Debug)]
pub struct HttpSource {
    name: String,
    url: String,
    descriptor_url: Option<String>,
    client: Client,
    headers: HeaderMap,
    probed: Mutex<Option<Probed>>,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("rangedb/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .or_raise(|| ErrorKind::InvalidRequest("could not build HTTP client".into()))?;
        Ok(Self {
            name: "http".to_string(),
            url: url.into(),
            descriptor_url: None,
            client,
            headers: HeaderMap::new(),
            probed: Mutex::new(None),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fetch a sidecar [`Descriptor`] from `url` during every probe.
    pub fn with_descriptor_url(mut self, url: impl Into<String>) -> Self {
        self.descriptor_url = Some(url.into());
        self
    }

    /// Send an extra header (authentication, API keys, ...) with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let header = HeaderName::try_from(name)
            .or_raise(|| ErrorKind::InvalidRequest(format!("invalid header name: {name}")))?;
        let value = HeaderValue::try_from(value)
            .or_raise(|| ErrorKind::InvalidRequest(format!("invalid value for header {name}")))?;
        self.headers.insert(header, value);
        Ok(self)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).headers(self.headers.clone())
    }

    fn probed(&self) -> Option<Probed> {
        self.probed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn status_error(&self, status: StatusCode) -> ErrorKind {
        status_error(&self.url, status)
    }

    /// The session must be reading the version this source last probed.
    fn check_version(&self, version: &FileVersion) -> Result<()> {
        if let Some(probed) = self.probed()
            && probed.version != *version
        {
            exn::bail!(ErrorKind::Integrity(format!(
                "source serves version {}, session reads {version}",
                probed.version
            )));
        }
        Ok(())
    }

    fn check_etag(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = self.probed().and_then(|probed| probed.etag) else {
            return Ok(());
        };
        match header_str(headers, &ETAG) {
            Some(actual) if actual != expected => {
                exn::bail!(ErrorKind::Integrity(format!("ETag changed from {expected} to {actual}")))
            },
            _ => Ok(()),
        }
    }

    async fn fetch_descriptor(&self, url: &str) -> Result<Descriptor> {
        let response = self.request(Method::GET, url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            exn::bail!(status_error(url, status));
        }
        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).or_raise(|| ErrorKind::Integrity(format!("malformed descriptor at {url}")))
    }
}

#[async_trait]
impl RangeSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    async fn probe(&self) -> Result<SourceInfo> {
        let response = self.request(Method::HEAD, &self.url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            exn::bail!(self.status_error(status));
        }
        let headers = response.headers();
        let size = header_str(headers, &CONTENT_LENGTH)
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_raise(|| ErrorKind::InvalidRequest("response carries no Content-Length".into()))?;
        // Servers omitting Accept-Ranges may still honour ranges; a 200 answer
        // to a range request is what finally proves otherwise.
        let accepts_ranges = header_str(headers, &ACCEPT_RANGES).is_none_or(|value| !value.eq_ignore_ascii_case("none"));
        let etag = header_str(headers, &ETAG);
        let last_modified = header_str(headers, &LAST_MODIFIED);

        let descriptor = match &self.descriptor_url {
            Some(url) => Some(self.fetch_descriptor(url).await?),
            None => None,
        };
        if let Some(descriptor) = &descriptor
            && descriptor.size != size
        {
            exn::bail!(ErrorKind::Integrity(format!(
                "descriptor size {} does not match served size {size}",
                descriptor.size
            )));
        }
        let version = descriptor
            .as_ref()
            .and_then(|descriptor| descriptor.hash.clone())
            .or_else(|| etag.clone())
            .or(last_modified)
            .unwrap_or_else(|| format!("size-{size}"));
        let version = FileVersion::new(version);
        debug!(size, %version, accepts_ranges, "probed HTTP source");

        *self.probed.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Probed { version: version.clone(), size, etag });
        Ok(SourceInfo { size, version, accepts_ranges, descriptor })
    }

    async fn read_range(&self, offset: u64, length: u64, version: &FileVersion) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let Some(end) = offset.checked_add(length - 1) else {
            exn::bail!(ErrorKind::InvalidRequest(format!("range {offset}+{length} is out of bounds")));
        };
        self.check_version(version)?;
        let response = self
            .request(Method::GET, &self.url)
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {},
            // The whole resource is on its way; drop it rather than download
            // something we did not ask for.
            StatusCode::OK => exn::bail!(ErrorKind::RangeUnsupported),
            status => exn::bail!(self.status_error(status)),
        }
        self.check_etag(response.headers())?;
        if let Some(content_range) = header_str(response.headers(), &CONTENT_RANGE) {
            let (start, _, total) = parse_content_range(&content_range)
                .ok_or_raise(|| ErrorKind::Integrity(format!("malformed Content-Range: {content_range}")))?;
            if start != offset {
                exn::bail!(ErrorKind::Integrity(format!("asked for offset {offset}, got {start}")));
            }
            if let (Some(total), Some(probed)) = (total, self.probed())
                && total != probed.size
            {
                exn::bail!(ErrorKind::Integrity(format!("file size changed from {} to {total}", probed.size)));
            }
        }
        let body = response.bytes().await.map_err(transport)?;
        if body.len() as u64 != length {
            exn::bail!(ErrorKind::Integrity(format!("expected {length} bytes, received {}", body.len())));
        }
        Ok(body)
    }

    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    async fn read_all(&self, version: &FileVersion) -> Result<Bytes> {
        self.check_version(version)?;
        let response = self.request(Method::GET, &self.url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            exn::bail!(self.status_error(status));
        }
        self.check_etag(response.headers())?;
        response.bytes().await.map_err(transport)
    }
}

fn transport(err: reqwest::Error) -> Error {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout(CONNECT_TIMEOUT)
    } else {
        ErrorKind::Network(err.to_string())
    };
    Exn::from(err).raise(kind)
}

fn status_error(url: &str, status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        404 | 410 => ErrorKind::NotFound(url.to_string()),
        416 => ErrorKind::Integrity("requested range not satisfiable".into()),
        429 | 500..=599 => ErrorKind::Network(format!("HTTP {status}")),
        other => ErrorKind::Status(other),
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
}

/// Parse `bytes <start>-<end>/<total|*>`.
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let (range, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::complete("bytes 0-65535/12582912", Some((0, 65535, Some(12582912))))]
    #[case::unknown_total("bytes 100-199/*", Some((100, 199, None)))]
    #[case::missing_unit("0-1/2", None)]
    #[case::garbage("bytes a-b/c", None)]
    fn test_parse_content_range(#[case] header: &str, #[case] expected: Option<(u64, u64, Option<u64>)>) {
        assert_eq!(parse_content_range(header), expected);
    }

    #[rstest]
    #[case::not_found(404, ErrorKind::NotFound("https://example.test/db".into()))]
    #[case::gone(410, ErrorKind::NotFound("https://example.test/db".into()))]
    #[case::unsatisfiable(416, ErrorKind::Integrity("requested range not satisfiable".into()))]
    #[case::rate_limited(429, ErrorKind::Network("HTTP 429 Too Many Requests".into()))]
    #[case::server(503, ErrorKind::Network("HTTP 503 Service Unavailable".into()))]
    #[case::forbidden(403, ErrorKind::Status(403))]
    fn test_status_mapping(#[case] status: u16, #[case] expected: ErrorKind) {
        let status = StatusCode::from_u16(status).unwrap();
        assert_eq!(status_error("https://example.test/db", status), expected);
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let source = HttpSource::new("https://example.test/db").unwrap();
        let err = source.with_header("bad header", "x").unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_an_integrity_error() {
        let source = HttpSource::new("https://example.test/db").unwrap();
        *source.probed.lock().unwrap() = Some(Probed { version: "v2".into(), size: 10, etag: None });
        let err = source.read_range(0, 4, &FileVersion::new("v1")).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::Integrity(_)));
    }

    #[tokio::test]
    async fn test_range_past_the_end_of_u64_is_rejected() {
        let source = HttpSource::new("https://example.test/db").unwrap();
        let err = source.read_range(u64::MAX - 1, 4, &FileVersion::new("v1")).await.unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidRequest(_)));
    }
}
