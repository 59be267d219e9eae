//! HTTP control endpoint.
//!
//! `POST /api/v1` takes a [`Call`] encoded as protobuf or JSON and answers in
//! the encoding picked from `Accept`. `GET /health` reports agent and
//! provider health as JSON.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::call::{Call, ConfigCall};
use super::codec::ContentType;
use super::service::ConfigApi;

pub const API_PATH: &str = "/api/v1";
pub const HEALTH_PATH: &str = "/health";

#[derive(Clone)]
pub struct ApiServer {
    api: ConfigApi,
}

fn text(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn encoded(content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type),
    );
    response
}

impl ApiServer {
    pub fn new(api: ConfigApi) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ConfigApi {
        &self.api
    }

    /// Route one request.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        match (&method, path.as_str()) {
            (&Method::POST, API_PATH) => self.handle_call(request).await,
            (&Method::GET, HEALTH_PATH) => self.handle_health().await,
            (method, API_PATH | HEALTH_PATH) => text(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("method {} is not allowed on {}", method, path),
            ),
            _ => text(StatusCode::NOT_FOUND, format!("no route for {}", path)),
        }
    }

    async fn handle_call<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = request.into_parts();
        let header_value = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header_value(header::CONTENT_TYPE);
        let accept = header_value(header::ACCEPT);

        let Some(request_type) = content_type.as_deref().and_then(ContentType::from_header) else {
            return text(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!(
                    "expecting 'Content-Type' of {} or {}",
                    ContentType::PROTOBUF_MEDIA_TYPE,
                    ContentType::JSON_MEDIA_TYPE
                ),
            );
        };
        let Some(response_type) = ContentType::negotiate(accept.as_deref(), request_type) else {
            return text(
                StatusCode::NOT_ACCEPTABLE,
                format!(
                    "expecting 'Accept' to allow {} or {}",
                    ContentType::PROTOBUF_MEDIA_TYPE,
                    ContentType::JSON_MEDIA_TYPE
                ),
            );
        };

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to read body: {}", e)),
        };
        let call: Call = match request_type.decode(&body) {
            Ok(call) => call,
            Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to parse body: {}", e)),
        };
        let call = match ConfigCall::try_from(call) {
            Ok(call) => call,
            Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
        };

        debug!(call = call.name(), content_type = %request_type, "Processing control call");
        match self.api.call(call).await {
            Ok(None) => Response::new(Full::new(Bytes::new())),
            Ok(Some(response)) => match response_type.encode(&response) {
                Ok(body) => encoded(response_type.media_type(), body),
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            Err(e) => text(e.status_code(), e.to_string()),
        }
    }

    async fn handle_health(&self) -> Response<Full<Bytes>> {
        let report = self.api.health().await;
        match serde_json::to_vec(&report) {
            Ok(body) => encoded(ContentType::JSON_MEDIA_TYPE, body),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr: SocketAddr = listener.local_addr()?;
        info!(%addr, "Control API listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Control API shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let server = self.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |request| {
                            let server = server.clone();
                            async move { Ok::<_, Infallible>(server.handle(request).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(%peer, error = %e, "Connection closed with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}
