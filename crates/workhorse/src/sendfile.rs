use axum::body::Body;
use axum::http::{HeaderValue, Response, header};
use tokio_util::io::ReaderStream;

use crate::errors;
use crate::headers;
use crate::http::RequestInfo;

/// Backend response header naming a local file to serve in place of the
/// backend body. Stripped before the response reaches the client.
pub const HEADER: &str = "X-Sendfile";

pub async fn inject(info: &RequestInfo, response: Response<Body>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    // The backend body is replaced by file contents and must never be sent.
    drop(body);

    let Some(path) = parts
        .headers
        .remove(HEADER)
        .and_then(|value| value.to_str().map(str::to_string).ok())
    else {
        return errors::fail_500(info, "sendfile", &"header value is not valid UTF-8");
    };

    tracing::info!(
        correlation_id = %info.id,
        file = %path,
        uri = %info.uri,
        "workhorse.send_file"
    );

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return errors::not_found(),
        Err(err) => return errors::fail_500(info, "sendfile_open", &err),
    };
    let metadata = match file.metadata().await {
        Ok(metadata) => metadata,
        Err(err) => return errors::fail_500(info, "sendfile_stat", &err),
    };
    if metadata.is_dir() {
        return errors::fail_500(info, "sendfile", &format!("{:?} is a directory", path));
    }

    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    if !parts.headers.contains_key(header::CONTENT_TYPE) {
        if let Ok(value) = HeaderValue::from_str(headers::detect_content_type(&path)) {
            parts.headers.insert(header::CONTENT_TYPE, value);
        }
    }
    headers::disable_response_buffering(&mut parts.headers);

    Response::from_parts(parts, Body::from_stream(ReaderStream::new(file)))
}
