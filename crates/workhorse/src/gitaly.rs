use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, Response, header};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::api::Authorization;
use crate::errors;
use crate::http::RequestInfo;

/// Relay for repository transport when the pre-authorization envelope names
/// an alternative transport server reachable over a Unix socket.
#[derive(Debug)]
pub enum GitalyError {
    Connect(std::io::Error),
    Http(String),
}

impl std::fmt::Display for GitalyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitalyError::Connect(err) => write!(f, "gitaly unreachable: {}", err),
            GitalyError::Http(err) => write!(f, "gitaly request failed: {}", err),
        }
    }
}

impl std::error::Error for GitalyError {}

fn resource_uri(auth: &Authorization, rpc: &str) -> String {
    let subcommand = rpc.strip_prefix("git-").unwrap_or(rpc);
    format!(
        "{}/{}",
        auth.gitaly_resource_path.trim_end_matches('/'),
        subcommand
    )
}

async fn roundtrip(
    socket: &str,
    request: Request<Body>,
) -> Result<Response<Body>, GitalyError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(GitalyError::Connect)?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| GitalyError::Http(err.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "workhorse.gitaly_connection_closed");
        }
    });
    let response = sender
        .send_request(request)
        .await
        .map_err(|err| GitalyError::Http(err.to_string()))?;
    Ok(response.map(Body::new))
}

pub async fn info_refs(info: &RequestInfo, auth: &Authorization, rpc: &str) -> Response<Body> {
    tracing::info!(
        correlation_id = %info.id,
        socket = %auth.gitaly_socket_path,
        rpc,
        "workhorse.gitaly_info_refs"
    );

    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("{}?service={}", resource_uri(auth, rpc), rpc))
        .header(header::HOST, HeaderValue::from_static("localhost"))
        .body(Body::empty());
    let request = match request {
        Ok(request) => request,
        Err(err) => return errors::fail_500(info, "gitaly_info_refs", &err),
    };

    match roundtrip(&auth.gitaly_socket_path, request).await {
        Ok(response) => response,
        Err(err) => errors::fail_500(info, "gitaly_info_refs", &err),
    }
}

pub async fn post_rpc(
    info: &RequestInfo,
    auth: &Authorization,
    rpc: &str,
    client_request: Request<Body>,
) -> Response<Body> {
    tracing::info!(
        correlation_id = %info.id,
        socket = %auth.gitaly_socket_path,
        rpc,
        "workhorse.gitaly_post_rpc"
    );

    let content_type = client_request
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let content_encoding = client_request.headers().get(header::CONTENT_ENCODING).cloned();

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(resource_uri(auth, rpc))
        .header(header::HOST, HeaderValue::from_static("localhost"))
        .header(header::CONTENT_TYPE, content_type);
    if let Some(encoding) = content_encoding {
        builder = builder.header(header::CONTENT_ENCODING, encoding);
    }
    let request = builder.body(client_request.into_body());
    let request = match request {
        Ok(request) => request,
        Err(err) => return errors::fail_500(info, "gitaly_post_rpc", &err),
    };

    match roundtrip(&auth.gitaly_socket_path, request).await {
        Ok(response) => response,
        Err(err) => errors::fail_500(info, "gitaly_post_rpc", &err),
    }
}
