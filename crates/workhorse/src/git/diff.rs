use std::process::Stdio;

use axum::body::Body;
use axum::http::{Response, header};

use crate::errors;
use crate::exec::{self, ScopedProcess};
use crate::headers;
use crate::http::RequestInfo;
use crate::metrics;
use crate::senddata::DiffParams;

pub async fn inject(info: &RequestInfo, params: DiffParams) -> Response<Body> {
    tracing::info!(
        correlation_id = %info.id,
        sha_from = %params.sha_from,
        sha_to = %params.sha_to,
        uri = %info.uri,
        "workhorse.send_diff"
    );
    metrics::observe_git_command("diff");

    let git_dir = format!("--git-dir={}", params.repo_path);
    let mut command = super::git_command("");
    command.args([
        git_dir.as_str(),
        "diff",
        params.sha_from.as_str(),
        params.sha_to.as_str(),
    ]);
    command.stdin(Stdio::null());
    let (process, stdout) = match ScopedProcess::spawn(command, "git") {
        Ok(spawned) => spawned,
        Err(err) => return errors::fail_500(info, "send_diff_spawn", &err),
    };

    let mut response = Response::new(exec::stream_stdout(
        process,
        stdout,
        info.clone(),
        "send_diff",
        false,
        None,
    ));
    // The diff size is unknown in advance; this body streams open-ended.
    response.headers_mut().remove(header::CONTENT_LENGTH);
    headers::disable_response_buffering(response.headers_mut());
    response
}
