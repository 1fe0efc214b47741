//! HTTP transport implementation.
//!
//! The engine talks to the service through the [`HttpClient`] trait so
//! tests can script responses. [`ReqwestClient`] is the network-backed
//! implementation.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use tokio_util::bytes::Buf;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Lines of a streaming response body, without line terminators.
pub type LineStream = BoxStream<'static, SyncResult<String>>;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Longest accepted line of a streaming response, in bytes.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// A request to the sync service.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Bearer token.
    pub token: String,
    /// Value of the `X-User-Agent` header.
    pub user_agent: String,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
}

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and streams the response body line by line.
    ///
    /// Resolves once the response headers were accepted.
    async fn post_stream(&self, request: HttpRequest) -> SyncResult<LineStream>;

    /// Sends a GET request and returns the whole response body.
    async fn get(&self, request: HttpRequest) -> SyncResult<Vec<u8>>;
}

/// Splits a response body into non-empty lines of at most `max_length`
/// bytes. A longer line fails the stream.
pub(crate) fn frame_lines<S, B>(body: S, max_length: usize) -> LineStream
where
    S: Stream<Item = std::io::Result<B>> + Send + 'static,
    B: Buf + Send + 'static,
{
    FramedRead::new(StreamReader::new(body), LinesCodec::new_with_max_length(max_length))
        .map_err(|e| SyncError::transport(e.to_string()))
        .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
        .boxed()
}

/// Maps a non-success response to an error.
pub(crate) fn status_error(status: u16, body: &str) -> SyncError {
    let mut body = body.to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    if status == 401 {
        SyncError::Unauthorized(body)
    } else {
        SyncError::Http { status, body }
    }
}

fn request_error(err: reqwest::Error) -> SyncError {
    SyncError::transport(err.to_string())
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, method: reqwest::Method, request: &HttpRequest) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, &request.url)
            .bearer_auth(&request.token)
            .header("X-User-Agent", &request.user_agent);
        match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> SyncResult<reqwest::Response> {
        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post_stream(&self, request: HttpRequest) -> SyncResult<LineStream> {
        let builder = self
            .build(reqwest::Method::POST, &request)
            .header("Accept", "application/x-ndjson");
        let response = self.send(builder).await?;

        let bytes = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(frame_lines(bytes, MAX_LINE_LENGTH))
    }

    async fn get(&self, request: HttpRequest) -> SyncResult<Vec<u8>> {
        let response = self.send(self.build(reqwest::Method::GET, &request)).await?;
        let body = response.bytes().await.map_err(request_error)?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio_util::bytes::Bytes;

    fn body(chunks: &[&'static str]) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn lines_are_reassembled_across_chunks() {
        let lines: Vec<String> = frame_lines(body(&["{\"a\"", ":1}\n\n{\"b\":2}\n"]), 64)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[tokio::test]
    async fn overlong_line_fails_the_stream() {
        let mut lines = frame_lines(body(&["0123456789", "0123456789\n"]), 16);
        let err = lines.next().await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[test]
    fn unauthorized_status_maps_to_unauthorized() {
        let err = status_error(401, "token expired");
        assert!(matches!(err, SyncError::Unauthorized(ref body) if body == "token expired"));
        assert!(err.invalidates_credentials());
    }

    #[test]
    fn other_statuses_keep_code() {
        let err = status_error(503, "maintenance");
        assert!(matches!(err, SyncError::Http { status: 503, .. }));
        assert!(!err.invalidates_credentials());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "é".repeat(MAX_ERROR_BODY);
        match status_error(500, &body) {
            SyncError::Http { body, .. } => assert!(body.len() <= MAX_ERROR_BODY),
            other => panic!("unexpected error: {other}"),
        }
    }
}
