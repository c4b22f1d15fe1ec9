use std::process::Stdio;

use axum::body::Body;
use axum::http::{HeaderValue, Response, header};
use base64::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::errors;
use crate::exec::{self, ScopedProcess};
use crate::headers;
use crate::http::RequestInfo;

/// Exit status of the zip helper when the requested entry does not exist in
/// the archive. Shared with the `gitlab-zip-cat` binary.
pub const STATUS_ENTRY_NOT_FOUND: i32 = 2;

/// Streams a single file out of a zip archive. The helper prints the entry
/// size as a decimal line, then the raw bytes; the size line becomes the
/// `Content-Length`. Range requests are not supported on single entries.
pub async fn inject(config: &Config, info: &RequestInfo, params: crate::senddata::EntryParams) -> Response<Body> {
    if params.archive.is_empty() || params.entry.is_empty() {
        return errors::fail_500(info, "artifacts_entry", &"Archive or Entry is empty");
    }

    let file_name = match base64::engine::general_purpose::STANDARD.decode(&params.entry) {
        Ok(decoded) => String::from_utf8_lossy(&decoded).to_string(),
        Err(err) => return errors::fail_500(info, "artifacts_entry_decode", &err),
    };

    tracing::info!(
        correlation_id = %info.id,
        entry = %file_name,
        archive = %params.archive,
        uri = %info.uri,
        "workhorse.artifacts_entry"
    );

    let mut command = exec::scrubbed_command(&config.zip_cat_bin, "");
    command.args([&params.archive, &params.entry]);
    command.stdin(Stdio::null());
    let (process, stdout) = match ScopedProcess::spawn(command, &config.zip_cat_bin) {
        Ok(spawned) => spawned,
        Err(err) => return errors::fail_500(info, "artifacts_entry_spawn", &err),
    };

    let mut reader = BufReader::new(stdout);
    let mut size_line = String::new();
    let read = reader.read_line(&mut size_line).await;

    let size: Option<u64> = match read {
        Ok(0) | Err(_) => None,
        Ok(_) => size_line.trim_end_matches('\n').parse().ok(),
    };
    let Some(size) = size else {
        // No usable size line: the helper failed before producing output.
        // Its exit status distinguishes a missing entry from a real error.
        return match process.wait().await {
            Err(err) if err.exit_code() == Some(STATUS_ENTRY_NOT_FOUND) => errors::not_found(),
            Err(err) => errors::fail_500(info, "artifacts_entry_helper", &err),
            Ok(()) => errors::fail_500(
                info,
                "artifacts_entry_helper",
                &"helper exited without printing a size line",
            ),
        };
    };

    let basename = file_name
        .rsplit('/')
        .next()
        .unwrap_or(file_name.as_str())
        .to_string();

    let mut response = Response::new(exec::stream_stdout(
        process,
        reader,
        info.clone(),
        "artifacts_entry",
        false,
        None,
    ));
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(headers::detect_content_type(&file_name)) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        headers::attachment_disposition(&basename),
    );
    headers::disable_response_buffering(response_headers);
    response
}
