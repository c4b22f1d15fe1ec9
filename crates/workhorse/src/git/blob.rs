use std::process::Stdio;

use axum::body::Body;
use axum::http::{HeaderValue, Response, header};
use tokio::process::Command;

use crate::errors;
use crate::exec::{self, ScopedProcess};
use crate::headers;
use crate::http::RequestInfo;
use crate::metrics;
use crate::senddata::BlobParams;

/// Streams a single blob. A cheap size query runs first so the response can
/// carry an exact `Content-Length`.
pub async fn inject(info: &RequestInfo, params: BlobParams) -> Response<Body> {
    tracing::info!(
        correlation_id = %info.id,
        blob_id = %params.blob_id,
        uri = %info.uri,
        "workhorse.send_blob"
    );
    metrics::observe_git_command("cat-file");

    let git_dir = format!("--git-dir={}", params.repo_path);

    let mut size_command: Command = super::git_command("");
    size_command.args([git_dir.as_str(), "cat-file", "-s", params.blob_id.as_str()]);
    size_command.stdin(Stdio::null());
    let size_output = match size_command.output().await {
        Ok(output) if output.status.success() => output.stdout,
        Ok(output) => {
            return errors::fail_500(
                info,
                "send_blob_size",
                &format!("git cat-file -s {}", output.status),
            );
        }
        Err(err) => return errors::fail_500(info, "send_blob_size", &err),
    };
    let size = String::from_utf8_lossy(&size_output).trim().to_string();

    let mut command = super::git_command("");
    command.args([git_dir.as_str(), "cat-file", "blob", params.blob_id.as_str()]);
    command.stdin(Stdio::null());
    let (process, stdout) = match ScopedProcess::spawn(command, "git") {
        Ok(spawned) => spawned,
        Err(err) => return errors::fail_500(info, "send_blob_spawn", &err),
    };

    let mut response = Response::new(exec::stream_stdout(
        process,
        stdout,
        info.clone(),
        "send_blob",
        false,
        None,
    ));
    if let Ok(value) = HeaderValue::from_str(&size) {
        response.headers_mut().insert(header::CONTENT_LENGTH, value);
    }
    headers::disable_response_buffering(response.headers_mut());
    response
}
