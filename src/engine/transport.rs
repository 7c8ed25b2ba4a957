//! HTTP/1.1 over dialed byte streams.
//!
//! The container engines this crate talks to are never reachable through a
//! resolvable address: the in-VM engine sits behind a vsock port and the
//! host engine behind a Unix socket. Every request therefore opens a fresh
//! connection from a [`Dialer`] and performs an HTTP/1.1 exchange over it.
//! Requests carry `Host: localhost` purely by convention: the authority is
//! irrelevant because the dialer already pins the destination.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::error::{Error, Result};
use crate::vsock::VsockDialer;

/// Any byte stream a connection can run over.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

/// Opens a fresh connection per call.
pub type Dialer =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<BoxConn>> + Send>> + Send + Sync>;

/// Dialer over a VM's vsock port.
pub fn vsock_dialer(dialer: VsockDialer) -> Dialer {
    Arc::new(move || {
        let dialer = dialer.clone();
        Box::pin(async move { Ok(Box::new(dialer.dial().await?) as BoxConn) })
    })
}

/// Dialer over a local Unix socket (the host engine).
pub fn unix_dialer(path: std::path::PathBuf) -> Dialer {
    Arc::new(move || {
        let path = path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(&path).await.map_err(|e| {
                Error::Transport(format!("connecting to {}: {}", path.display(), e))
            })?;
            Ok(Box::new(stream) as BoxConn)
        })
    })
}

/// Outgoing request body.
pub type Outgoing = UnsyncBoxBody<Bytes, io::Error>;

pub fn empty_body() -> Outgoing {
    Empty::new().map_err(io::Error::other).boxed_unsync()
}

pub fn full_body(bytes: impl Into<Bytes>) -> Outgoing {
    Full::new(bytes.into())
        .map_err(io::Error::other)
        .boxed_unsync()
}

/// Stream an `AsyncRead` as a chunked request body.
pub fn reader_body(reader: impl AsyncRead + Send + Unpin + 'static) -> Outgoing {
    StreamBody::new(ReaderStream::new(reader).map_ok(Frame::data)).boxed_unsync()
}

/// Adapt a response body into an `AsyncRead` of its data frames.
pub fn body_reader(body: Incoming) -> impl AsyncRead + Send + Unpin {
    let stream = BodyStream::new(body)
        .filter_map(|frame| async {
            match frame.map(Frame::into_data) {
                Ok(Ok(bytes)) => Some(Ok(bytes)),
                Ok(Err(_frame)) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            }
        })
        .boxed();
    StreamReader::new(stream)
}

/// A JSON error body in the engine's `{"message": "…"}` convention.
#[derive(serde::Deserialize)]
struct EngineMessage {
    message: String,
}

/// Thin HTTP client bound to one dialer.
#[derive(Clone)]
pub struct EngineTransport {
    dialer: Dialer,
}

impl EngineTransport {
    pub fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }

    /// Dial, handshake, and send one request. The connection task runs with
    /// upgrade support so hijacked streams (exec/attach) stay usable.
    pub async fn send(&self, req: Request<Outgoing>) -> Result<Response<Incoming>> {
        let conn = (self.dialer)().await?;
        let io = TokioIo::new(conn);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| Error::Transport(format!("HTTP handshake: {}", e)))?;
        tokio::spawn(async move {
            let _ = connection.with_upgrades().await;
        });
        sender
            .ready()
            .await
            .map_err(|e| Error::Transport(format!("connection not ready: {}", e)))?;
        sender
            .send_request(req)
            .await
            .map_err(|e| Error::Transport(format!("sending request: {}", e)))
    }

    /// Send and map non-success statuses into the error taxonomy.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Outgoing,
        content_type: Option<&str>,
    ) -> Result<Response<Incoming>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost");
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        let req = builder
            .body(body)
            .map_err(|e| Error::Invariant(format!("building request: {}", e)))?;
        let resp = self.send(req).await?;
        Self::check_status(path, resp).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.request(Method::GET, path, empty_body(), None).await?;
        Self::read_json(resp).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let payload = serde_json::to_vec(body)?;
        let resp = self
            .request(
                Method::POST,
                path,
                full_body(payload),
                Some("application/json"),
            )
            .await?;
        Self::read_json(resp).await
    }

    /// POST with an empty body, discarding the response body.
    pub async fn post_unit(&self, path: &str) -> Result<()> {
        let resp = self.request(Method::POST, path, empty_body(), None).await?;
        Self::drain(resp).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, path, empty_body(), None)
            .await?;
        Self::drain(resp).await
    }

    /// Hijack the connection after the response, for exec/attach streams.
    pub async fn upgrade(
        &self,
        method: Method,
        path: &str,
        body: Outgoing,
    ) -> Result<TokioIo<hyper::upgrade::Upgraded>> {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|e| Error::Invariant(format!("building request: {}", e)))?;

        let resp = self.send(req).await?;
        if resp.status() != StatusCode::SWITCHING_PROTOCOLS && !resp.status().is_success() {
            return Err(Self::status_error(path, resp).await);
        }
        let upgraded = hyper::upgrade::on(resp)
            .await
            .map_err(|e| Error::Transport(format!("upgrading connection: {}", e)))?;
        Ok(TokioIo::new(upgraded))
    }

    pub async fn collect_bytes(resp: Response<Incoming>) -> Result<Bytes> {
        Ok(resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("reading response body: {}", e)))?
            .to_bytes())
    }

    async fn read_json<T: DeserializeOwned>(resp: Response<Incoming>) -> Result<T> {
        let bytes = Self::collect_bytes(resp).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn drain(resp: Response<Incoming>) -> Result<()> {
        let _ = Self::collect_bytes(resp).await?;
        Ok(())
    }

    async fn check_status(path: &str, resp: Response<Incoming>) -> Result<Response<Incoming>> {
        if resp.status().is_success() || resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(resp);
        }
        Err(Self::status_error(path, resp).await)
    }

    async fn status_error(path: &str, resp: Response<Incoming>) -> Error {
        let status = resp.status();
        let body = Self::collect_bytes(resp).await.unwrap_or_default();
        let message = serde_json::from_slice::<EngineMessage>(&body)
            .map(|m| m.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        let message = format!("{} ({}): {}", path, status, message.trim());
        match status {
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::CONFLICT => Error::AlreadyExists(message),
            _ => Error::Engine(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Dialer whose every connection is answered by a canned HTTP response.
    fn canned_dialer(response: &'static str) -> Dialer {
        Arc::new(move || {
            Box::pin(async move {
                let (client, mut server) = UnixStream::pair().map_err(Error::Io)?;
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    // Read the request head, then answer.
                    let _ = server.read(&mut buf).await;
                    let _ = server.write_all(response.as_bytes()).await;
                });
                Ok(Box::new(client) as BoxConn)
            })
        })
    }

    #[tokio::test]
    async fn get_json_round_trip() {
        let transport = EngineTransport::new(canned_dialer(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 13\r\n\r\n{\"Id\":\"abc1\"}",
        ));
        #[derive(serde::Deserialize)]
        struct IdResponse {
            #[serde(rename = "Id")]
            id: String,
        }
        let resp: IdResponse = transport.get_json("/images/x/json").await.unwrap();
        assert_eq!(resp.id, "abc1");
    }

    #[tokio::test]
    async fn not_found_maps_to_not_found() {
        let transport = EngineTransport::new(canned_dialer(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 28\r\n\r\n{\"message\":\"no such object\"}",
        ));
        let err = transport
            .request(Method::GET, "/containers/x/json", empty_body(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("no such object"));
    }

    #[tokio::test]
    async fn conflict_maps_to_already_exists() {
        let transport = EngineTransport::new(canned_dialer(
            "HTTP/1.1 409 Conflict\r\ncontent-length: 25\r\n\r\n{\"message\":\"name in use\"}",
        ));
        let err = transport.post_unit("/containers/create").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn server_error_maps_to_engine() {
        let transport = EngineTransport::new(canned_dialer(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 5\r\n\r\noops!",
        ));
        let err = transport.post_unit("/containers/x/start").await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }
}
