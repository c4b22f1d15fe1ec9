use std::path::{Component, Path};

use axum::body::Body;
use axum::http::{HeaderValue, Method, Response, header};
use percent_encoding::percent_decode_str;
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::headers;
use crate::http::RequestInfo;

/// Serves `GET`/`HEAD` requests straight from the document root. Any miss
/// falls through to the transparent proxy, so the backend stays the
/// authority for everything that is not plainly a file on disk.
pub async fn try_serve(config: &Config, info: &RequestInfo) -> Option<Response<Body>> {
    let root = config.document_root.as_ref()?;
    if info.method != Method::GET && info.method != Method::HEAD {
        return None;
    }

    // When the backend URL carries a path prefix, static files are
    // addressed below that same prefix.
    let prefix = config.backend.path();
    let path = info.uri.path();
    let path = if prefix != "/" && !prefix.is_empty() {
        path.strip_prefix(prefix)?
    } else {
        path
    };

    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    let relative = decoded.trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }
    let relative = Path::new(relative);
    if !is_safe_relative_path(relative) {
        return None;
    }

    let full = root.join(relative);
    let file = tokio::fs::File::open(&full).await.ok()?;
    let metadata = file.metadata().await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    tracing::info!(
        correlation_id = %info.id,
        file = %full.display(),
        "workhorse.static_file"
    );

    let body = if info.method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };
    let mut response = Response::new(body);
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    if let Ok(value) = HeaderValue::from_str(headers::detect_content_type(&decoded)) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    headers::disable_response_buffering(response_headers);
    Some(response)
}

fn is_safe_relative_path(path: &Path) -> bool {
    path.components().all(|component| match component {
        Component::Normal(_) => true,
        Component::CurDir => false,
        Component::ParentDir => false,
        Component::RootDir => false,
        Component::Prefix(_) => false,
    })
}
