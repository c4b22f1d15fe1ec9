use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, Uri, header};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use url::Url;

use crate::config::{Config, StartupError};
use crate::errors;
use crate::http::{AppState, RequestInfo};
use crate::senddata;
use crate::sendfile;

pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Hop-by-hop headers never cross the proxy in either direction.
const HOP_HEADERS: &[&str] = &[
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Te",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

#[derive(Debug)]
pub enum BackendError {
    Connect(String),
    HeadersTimeout,
    Request(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Connect(err) => write!(f, "backend unreachable: {}", err),
            BackendError::HeadersTimeout => write!(f, "timed out waiting for backend headers"),
            BackendError::Request(err) => write!(f, "backend request failed: {}", err),
        }
    }
}

impl std::error::Error for BackendError {}

/// HTTP client for the backend application server. Dials TCP through a
/// pooled reqwest client, or a Unix socket through a per-request hyper
/// connection when `auth_socket` is configured.
#[derive(Clone)]
pub struct Backend {
    base: Url,
    socket: Option<PathBuf>,
    http: reqwest::Client,
}

impl Backend {
    pub fn new(config: &Config) -> Result<Self, StartupError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|_| StartupError {
                code: "ERR_BACKEND_CLIENT",
                message: "failed to initialize backend HTTP client".to_string(),
            })?;
        Ok(Self {
            base: config.backend.clone(),
            socket: config.auth_socket.clone(),
            http,
        })
    }

    /// One backend round trip. `headers_timeout` bounds the wait for
    /// response headers only; body bytes stream without any deadline so
    /// long-lived transfers are never cut off.
    pub async fn roundtrip(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Option<Body>,
        headers_timeout: Option<Duration>,
    ) -> Result<Response<Body>, BackendError> {
        match &self.socket {
            Some(socket) => {
                let fut = self.roundtrip_unix(socket.clone(), method, uri, headers, body);
                match headers_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, fut)
                        .await
                        .map_err(|_| BackendError::HeadersTimeout)?,
                    None => fut.await,
                }
            }
            None => self.roundtrip_tcp(method, uri, headers, body, headers_timeout).await,
        }
    }

    fn backend_uri(&self, uri: &Uri) -> String {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path_and_query
        )
    }

    async fn roundtrip_tcp(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Option<Body>,
        headers_timeout: Option<Duration>,
    ) -> Result<Response<Body>, BackendError> {
        let url = Url::parse(&self.backend_uri(uri))
            .map_err(|err| BackendError::Request(err.to_string()))?;

        let mut request = self.http.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let send = request.send();
        let response = match headers_timeout {
            Some(timeout) => tokio::time::timeout(timeout, send)
                .await
                .map_err(|_| BackendError::HeadersTimeout)?,
            None => send.await,
        }
        .map_err(|err| {
            if err.is_connect() {
                BackendError::Connect(err.to_string())
            } else {
                BackendError::Request(err.to_string())
            }
        })?;

        Ok(response_from_reqwest(response))
    }

    async fn roundtrip_unix(
        &self,
        socket: PathBuf,
        method: Method,
        uri: &Uri,
        mut headers: HeaderMap,
        body: Option<Body>,
    ) -> Result<Response<Body>, BackendError> {
        let stream = UnixStream::connect(&socket)
            .await
            .map_err(|err| BackendError::Connect(format!("{:?}: {}", socket, err)))?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| BackendError::Connect(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "workhorse.backend_connection_closed");
            }
        });

        if !headers.contains_key(header::HOST) {
            let host = self.base.host_str().unwrap_or("localhost").to_string();
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(header::HOST, value);
            }
        }

        let base_path = self.base.path().trim_end_matches('/');
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", base_path, path_and_query));
        if let Some(out) = builder.headers_mut() {
            *out = headers;
        }
        let request = builder
            .body(body.unwrap_or_else(Body::empty))
            .map_err(|err| BackendError::Request(err.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;
        let mut response = response.map(Body::new);
        strip_hop_headers(response.headers_mut());
        Ok(response)
    }
}

pub fn response_from_reqwest(response: reqwest::Response) -> Response<Body> {
    let status = response.status();
    let headers = response.headers().clone();
    let mut out = Response::new(Body::from_stream(response.bytes_stream()));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    strip_hop_headers(out.headers_mut());
    out
}

pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Appends the immediate peer's IP to any client-supplied X-Forwarded-For,
/// folding multiple prior headers into one comma-space separated value.
pub fn set_forwarded_for(headers: &mut HeaderMap, remote_ip: Option<IpAddr>) {
    let Some(ip) = remote_ip else {
        return;
    };
    let prior: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    let combined = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    headers.remove(X_FORWARDED_FOR);
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// The transparent path: forward to the backend, then let the send-data
/// decoder and the accelerated-send rewriter inspect the response before any
/// byte reaches the client.
pub async fn proxy(state: &AppState, info: &RequestInfo, request: Request<Body>) -> Response<Body> {
    let (parts, body) = request.into_parts();
    // Framing headers decide whether the client sent a body; checked before
    // the hop-by-hop strip removes Transfer-Encoding.
    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    let mut headers = parts.headers;
    strip_hop_headers(&mut headers);
    set_forwarded_for(&mut headers, info.remote_ip);

    let result = state
        .backend
        .roundtrip(
            parts.method,
            &parts.uri,
            headers,
            has_body.then_some(body),
            Some(state.config.proxy_headers_timeout),
        )
        .await;

    match result {
        Ok(response) => rewrite_response(state, info, response).await,
        Err(err @ BackendError::HeadersTimeout) => {
            errors::service_unavailable(info, "proxy_roundtrip", &err)
        }
        Err(err) => errors::fail_500(info, "proxy_roundtrip", &err),
    }
}

pub async fn rewrite_response(
    state: &AppState,
    info: &RequestInfo,
    response: Response<Body>,
) -> Response<Body> {
    if response.headers().contains_key(senddata::HEADER) {
        return senddata::inject(state, info, response).await;
    }
    if response.headers().contains_key(sendfile::HEADER) {
        return sendfile::inject(info, response).await;
    }
    // An authorization envelope leaking through the plain proxy path means
    // the backend mistook this for a pre-authorization subrequest. Its body
    // must never reach the client.
    let api_content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| crate::headers::is_content_type(crate::api::RESPONSE_CONTENT_TYPE, value))
        .unwrap_or(false);
    if api_content_type {
        return errors::fail_500(
            info,
            "proxy_api_response",
            &"backend replied with the API media type on a proxied request",
        );
    }
    response
}
