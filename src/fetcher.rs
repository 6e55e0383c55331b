//! The HTTP origin source.

use async_trait::async_trait;
use futures::StreamExt;
use http::{
    header::{HeaderMap, ACCEPT_ENCODING, CONTENT_RANGE, CONTENT_TYPE, RANGE},
    StatusCode,
};
use reqwest::Client;
use url::Url;

use crate::{
    error::{CacheError, Result},
    info::{is_whitelisted_header, ResourceInfo},
    policy::CachePolicy,
    progress::Progress,
    receiver::Receiver,
    stores::{ByteRange, Source},
};

/// Marker header attached to every request the cache issues itself, so a
/// URL-protocol interceptor sitting in front of the client can recognize
/// cache-owned traffic and let it through untouched.
pub const INTERNAL_REQUEST_HEADER: &str = "x-webcache-request";

/// An HTTP `GET` source honoring byte-range semantics.
///
/// Responses are classified by status: 200 and 204 stream the full resource,
/// 206 streams the segment described by `Content-Range`, 404 is a soft miss,
/// and anything else aborts with a transport error carrying the status and
/// URL. Whitelisted response headers are propagated into the resource
/// metadata.
#[derive(Debug, Clone, Default)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// A fetcher over a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetcher over a caller-configured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// A fetcher that trusts self-signed certificates. Test servers only.
    pub fn insecure() -> Result<Self> {
        let client = Client::builder().danger_accept_invalid_certs(true).build()?;
        Ok(Self { client })
    }
}

fn range_header(range: ByteRange) -> Option<String> {
    match (range.offset, range.length) {
        (0, None) => None,
        (offset, Some(length)) => {
            Some(format!("bytes={}-{}", offset, (offset + length).saturating_sub(1)))
        }
        (offset, None) => Some(format!("bytes={offset}-")),
    }
}

/// Parses `bytes <start>-<end>/<total>`, with `*` for an unknown total.
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = total.trim();
    let total = if total == "*" { None } else { Some(total.parse().ok()?) };
    Some((start, end, total))
}

fn info_from_headers(headers: &HeaderMap) -> ResourceInfo {
    let mut info = ResourceInfo::new();
    if let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        let mut parts = content_type.split(';');
        if let Some(mime) = parts.next() {
            let mime = mime.trim();
            if !mime.is_empty() {
                info.mime_type = mime.to_ascii_lowercase();
            }
        }
        for parameter in parts {
            if let Some(charset) = parameter.trim().strip_prefix("charset=") {
                info.text_encoding = Some(charset.trim_matches('"').to_ascii_lowercase());
            }
        }
    }
    for (name, value) in headers {
        if is_whitelisted_header(name.as_str()) {
            if let Ok(value) = value.to_str() {
                info.headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
    }
    info
}

fn response_parts(status: StatusCode, headers: &HeaderMap) -> http::response::Parts {
    let (mut parts, ()) = http::Response::new(()).into_parts();
    parts.status = status;
    parts.headers = headers.clone();
    parts
}

fn transport_error(status: StatusCode, url: &str) -> CacheError {
    CacheError::Transport {
        status: status.as_u16(),
        message: status.canonical_reason().unwrap_or("unexpected status").to_string(),
        url: url.to_string(),
    }
}

#[async_trait]
impl Source for Fetcher {
    async fn fetch(
        &self,
        url: &str,
        range: ByteRange,
        _policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    ) {
        // Like every store, a fetch is an enqueue: the request runs on its
        // own task and never occupies the caller's queue.
        let client = self.client.clone();
        let url = url.to_string();
        tokio::spawn(run_fetch(client, url, range, progress, receiver));
    }
}

async fn run_fetch(
    client: Client,
    url: String,
    range: ByteRange,
    progress: Progress,
    mut receiver: Box<dyn Receiver>,
) {
    let parsed = match Url::parse(&url) {
        Ok(parsed) => parsed,
        Err(e) => {
            receiver.on_inited(None, &progress).await;
            receiver.on_aborted(Some(e.into())).await;
            return;
        }
    };
    let mut request = client
        .get(parsed)
        .header(ACCEPT_ENCODING, "gzip, identity")
        .header(INTERNAL_REQUEST_HEADER, "1");
    if let Some(value) = range_header(range) {
        request = request.header(RANGE, value);
    }

    // Cancellation drops the in-flight request.
    let response = tokio::select! {
        _ = progress.cancelled() => {
            receiver.on_inited(None, &progress).await;
            receiver.on_aborted(None).await;
            return;
        }
        response = request.send() => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            receiver.on_inited(None, &progress).await;
            receiver.on_aborted(Some(e.into())).await;
            return;
        }
    };

    let status = response.status();
    let headers = response.headers().clone();
    let response_url = response.url().to_string();
    match status.as_u16() {
        200 | 204 | 206 => {}
        404 => {
            receiver.on_inited(None, &progress).await;
            receiver.on_aborted(None).await;
            return;
        }
        _ => {
            receiver.on_inited(None, &progress).await;
            receiver.on_aborted(Some(transport_error(status, &response_url))).await;
            return;
        }
    }

    let parts = response_parts(status, &headers);
    receiver.on_inited(Some(&parts), &progress).await;
    if progress.is_cancelled() {
        receiver.on_aborted(None).await;
        return;
    }

    let mut info = info_from_headers(&headers);
    let (offset, length) = if status.as_u16() == 206 {
        let content_range = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        match content_range {
            Some((start, end, total)) => {
                info.total_length = total;
                (start, Some(end - start + 1))
            }
            None => {
                receiver
                    .on_aborted(Some(CacheError::RangeInvalid {
                        offset: range.offset,
                        length: range.length,
                    }))
                    .await;
                return;
            }
        }
    } else {
        let length = match status.as_u16() {
            204 => Some(response.content_length().unwrap_or(0)),
            _ => response.content_length(),
        };
        info.total_length = length;
        (0, length)
    };

    if progress.total() < 0 {
        match (info.total_length, length) {
            (Some(total), Some(length)) if offset + length == total => {
                progress.set_total(total as i64);
                progress.set_completed(offset as i64);
            }
            (_, Some(length)) => progress.set_total(length as i64),
            _ => {}
        }
    }

    receiver.on_started(&info, offset, length).await;
    if status.as_u16() == 204 {
        receiver.on_finished().await;
        return;
    }

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = progress.cancelled() => {
                receiver.on_aborted(None).await;
                return;
            }
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                progress.add_completed(chunk.len() as u64);
                receiver.on_data(chunk).await;
            }
            Some(Err(e)) => {
                receiver.on_aborted(Some(e.into())).await;
                return;
            }
            None => break,
        }
    }
    receiver.on_finished().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_formation() {
        assert_eq!(range_header(ByteRange::full()), None);
        assert_eq!(range_header(ByteRange::new(100, None)).as_deref(), Some("bytes=100-"));
        assert_eq!(range_header(ByteRange::new(100, Some(100))).as_deref(), Some("bytes=100-199"));
        assert_eq!(range_header(ByteRange::new(0, Some(64))).as_deref(), Some("bytes=0-63"));
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("bytes 100-199/1000"), Some((100, 199, Some(1000))));
        assert_eq!(parse_content_range("bytes 0-0/1"), Some((0, 0, Some(1))));
        assert_eq!(parse_content_range("bytes 5-9/*"), Some((5, 9, None)));
        assert_eq!(parse_content_range("bytes 9-5/10"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn header_metadata_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "Text/HTML; charset=UTF-8".parse().unwrap());
        headers.insert("etag", "\"v1\"".parse().unwrap());
        headers.insert("x-secret", "nope".parse().unwrap());

        let info = info_from_headers(&headers);
        assert_eq!(info.mime_type, "text/html");
        assert_eq!(info.text_encoding.as_deref(), Some("utf-8"));
        assert_eq!(info.headers.get("etag").map(String::as_str), Some("\"v1\""));
        assert!(!info.headers.contains_key("x-secret"));
    }
}
