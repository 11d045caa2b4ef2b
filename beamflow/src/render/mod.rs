//! Render service client.
//!
//! Turns an image into a 3D asset with one HTTP POST. Failures are
//! classified here; there is no retry loop, redelivery of the whole task is
//! the only retry.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::errors::RenderError;

/// Leading bytes of a binary glTF file.
pub const GLB_MAGIC: &[u8; 4] = b"glTF";

const ERROR_BODY_LIMIT: usize = 512;

/// Sends an image to the render service and returns the asset bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenderInvoker: Send + Sync {
    /// Performs one render call.
    async fn invoke(&self, image: Vec<u8>) -> Result<Vec<u8>, RenderError>;
}

/// Checks that a 2xx body is a usable asset.
pub fn validate_payload(bytes: &[u8], expect_glb: bool) -> Result<(), RenderError> {
    if bytes.is_empty() {
        return Err(RenderError::InvalidPayload("empty response body".to_string()));
    }
    if expect_glb && !bytes.starts_with(GLB_MAGIC) {
        return Err(RenderError::InvalidPayload(format!(
            "expected glTF binary, got {} bytes starting with {:?}",
            bytes.len(),
            &bytes[..bytes.len().min(4)]
        )));
    }
    Ok(())
}

/// [`RenderInvoker`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpRenderInvoker {
    client: Client,
    endpoint: String,
    timeout: Duration,
    expect_glb: bool,
}

impl HttpRenderInvoker {
    /// Creates an invoker posting to `endpoint` with a per-call timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RenderError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(RenderError::NotConfigured);
        }
        let client = Client::builder()
            .user_agent(concat!("beamflow/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| RenderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
            expect_glb: true,
        })
    }

    /// Whether a 2xx body must start with the glTF magic.
    #[must_use]
    pub fn with_expect_glb(mut self, expect_glb: bool) -> Self {
        self.expect_glb = expect_glb;
        self
    }

    /// The configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_transport(&self, err: &reqwest::Error) -> RenderError {
        if err.is_timeout() {
            RenderError::Timeout(self.timeout.as_secs())
        } else {
            RenderError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl RenderInvoker for HttpRenderInvoker {
    async fn invoke(&self, image: Vec<u8>) -> Result<Vec<u8>, RenderError> {
        let start = Instant::now();
        let request_size = image.len();

        let resp = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
            .body(image)
            .send()
            .await
            .map_err(|e| self.map_transport(&e))?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| self.map_transport(&e))?;

        if !status.is_success() {
            let mut body = String::from_utf8_lossy(&bytes).into_owned();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            warn!(status = status.as_u16(), endpoint = %self.endpoint, "Render service returned an error");
            return Err(RenderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        validate_payload(&bytes, self.expect_glb)?;
        debug!(
            request_size,
            response_size = bytes.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Render call completed"
        );
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers one request with `status` and `body`, returning the request body.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/render", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request_body = read_request_body(&mut socket).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
            request_body
        });
        (url, handle)
    }

    async fn read_request_body(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map_or(0, |v| v.trim().parse().unwrap());
                let body_start = end + 4;
                while buf.len() < body_start + length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                }
                return buf[body_start..body_start + length].to_vec();
            }
            if n == 0 {
                return Vec::new();
            }
        }
    }

    fn invoker(url: &str) -> HttpRenderInvoker {
        HttpRenderInvoker::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_success_returns_asset() {
        let (url, server) = serve_once("200 OK", b"glTF\x02\x00\x00\x00rest").await;

        let asset = invoker(&url).invoke(b"png-bytes".to_vec()).await.unwrap();
        assert!(asset.starts_with(GLB_MAGIC));
        assert_eq!(server.await.unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_unparseable_success_is_fatal() {
        let (url, _server) = serve_once("200 OK", b"<html>oops</html>").await;

        let err = invoker(&url).invoke(b"png".to_vec()).await.unwrap_err();
        assert!(matches!(err, RenderError::InvalidPayload(_)));
        assert!(!err.classify().is_retryable());
    }

    #[tokio::test]
    async fn test_expect_glb_disabled_accepts_any_nonempty_body() {
        let (url, _server) = serve_once("200 OK", b"ply\nformat ascii").await;

        let asset = invoker(&url)
            .with_expect_glb(false)
            .invoke(b"png".to_vec())
            .await
            .unwrap();
        assert_eq!(asset, b"ply\nformat ascii");
    }

    #[tokio::test]
    async fn test_service_unavailable_is_retryable() {
        let (url, _server) = serve_once("503 Service Unavailable", b"busy").await;

        let err = invoker(&url).invoke(b"png".to_vec()).await.unwrap_err();
        assert!(matches!(err, RenderError::Status { status: 503, .. }));
        assert!(err.classify().is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let (url, _server) = serve_once("400 Bad Request", b"not an image").await;

        let err = invoker(&url).invoke(b"png".to_vec()).await.unwrap_err();
        assert!(!err.classify().is_retryable());
    }

    #[tokio::test]
    async fn test_too_many_requests_is_retryable() {
        let (url, _server) = serve_once("429 Too Many Requests", b"").await;

        let err = invoker(&url).invoke(b"png".to_vec()).await.unwrap_err();
        assert!(err.classify().is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/render", listener.local_addr().unwrap());
        drop(listener);

        let err = invoker(&url).invoke(b"png".to_vec()).await.unwrap_err();
        assert!(matches!(err, RenderError::Transport(_)));
        assert!(err.classify().is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/render", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let invoker = HttpRenderInvoker::new(&url, Duration::from_millis(200)).unwrap();
        let err = invoker.invoke(b"png".to_vec()).await.unwrap_err();
        assert!(matches!(err, RenderError::Timeout(_)));
        assert!(err.classify().is_retryable());
    }

    #[test]
    fn test_validate_payload() {
        assert!(validate_payload(b"", false).is_err());
        assert!(validate_payload(b"glTF....", true).is_ok());
        assert!(validate_payload(b"gl", true).is_err());
    }

    #[test]
    fn test_empty_endpoint_not_configured() {
        assert!(matches!(
            HttpRenderInvoker::new("  ", Duration::from_secs(1)),
            Err(RenderError::NotConfigured)
        ));
    }
}
