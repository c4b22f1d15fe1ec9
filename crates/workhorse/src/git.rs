use std::process::Stdio;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, header};
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::api::Authorization;
use crate::errors;
use crate::exec::{self, ScopedProcess};
use crate::gitaly;
use crate::headers;
use crate::http::RequestInfo;
use crate::metrics;

pub mod archive;
pub mod blob;
pub mod diff;
pub mod patch;

/// Builds a `git` invocation with the scrubbed hook environment.
pub(crate) fn git_command(gl_id: &str) -> Command {
    exec::scrubbed_command("git", gl_id)
}

fn pkt_line(data: &str) -> String {
    format!("{:04x}{}", data.len() + 4, data)
}

const PKT_FLUSH: &str = "0000";

/// The git smart HTTP protocol only knows these two services; anything else
/// on the wire is a protocol violation answered with 403.
fn service_from_query(query: Option<&str>) -> Option<&'static str> {
    let query = query?;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "service" {
            return match value.as_ref() {
                "git-upload-pack" => Some("git-upload-pack"),
                "git-receive-pack" => Some("git-receive-pack"),
                _ => None,
            };
        }
    }
    None
}

fn subcommand(rpc: &str) -> &str {
    rpc.strip_prefix("git-").unwrap_or(rpc)
}

/// `GET …/info/refs?service=git-upload-pack|git-receive-pack`
pub async fn info_refs(info: &RequestInfo, auth: &Authorization) -> Response<Body> {
    let Some(rpc) = service_from_query(info.uri.query()) else {
        return errors::forbidden();
    };

    if !auth.gitaly_socket_path.is_empty() {
        return gitaly::info_refs(info, auth, rpc).await;
    }

    tracing::info!(
        correlation_id = %info.id,
        rpc,
        repo_path = %auth.repo_path,
        "workhorse.info_refs"
    );
    metrics::observe_git_command(subcommand(rpc));

    let mut command = git_command(&auth.gl_id);
    command.args([
        subcommand(rpc),
        "--stateless-rpc",
        "--advertise-refs",
        auth.repo_path.as_str(),
    ]);
    command.stdin(Stdio::null());
    let (process, stdout) = match ScopedProcess::spawn(command, "git") {
        Ok(spawned) => spawned,
        Err(err) => return errors::fail_500(info, "info_refs_spawn", &err),
    };

    let preamble = format!("{}{}", pkt_line(&format!("# service={}\n", rpc)), PKT_FLUSH);
    let mut response = Response::new(exec::stream_stdout(
        process,
        stdout,
        info.clone(),
        "info_refs",
        false,
        Some(Bytes::from(preamble)),
    ));
    let content_type = format!("application/x-{}-advertisement", rpc);
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    headers::set_no_cache_headers(response.headers_mut());
    response
}

/// `POST …/git-upload-pack` and `POST …/git-receive-pack`: the client body
/// is piped to the subprocess stdin (through `gzip -cd` when the client
/// compressed it) and the subprocess stdout streams back.
pub async fn post_rpc(
    info: &RequestInfo,
    auth: &Authorization,
    rpc: &'static str,
    request: Request<Body>,
) -> Response<Body> {
    if !auth.gitaly_socket_path.is_empty() {
        return gitaly::post_rpc(info, auth, rpc, request).await;
    }

    tracing::info!(
        correlation_id = %info.id,
        rpc,
        repo_path = %auth.repo_path,
        "workhorse.post_rpc"
    );
    metrics::observe_git_command(subcommand(rpc));

    let gzipped = request
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    let mut command = git_command(&auth.gl_id);
    command.args([subcommand(rpc), "--stateless-rpc", auth.repo_path.as_str()]);

    // With a gzipped request the decompressor sits between the client body
    // and git's stdin, connected by inherited pipe ends.
    let mut decompressor = None;
    let mut decompressor_stdin = None;
    if gzipped {
        let mut gunzip = exec::scrubbed_command("gzip", "");
        gunzip.arg("-cd");
        gunzip.stdin(Stdio::piped());
        let (mut gunzip_process, gunzip_stdout) = match ScopedProcess::spawn(gunzip, "gzip") {
            Ok(spawned) => spawned,
            Err(err) => return errors::fail_500(info, "post_rpc_gunzip_spawn", &err),
        };
        decompressor_stdin = gunzip_process.take_stdin();
        let fd = match gunzip_stdout.into_owned_fd() {
            Ok(fd) => fd,
            Err(err) => return errors::fail_500(info, "post_rpc_gunzip_pipe", &err),
        };
        command.stdin(Stdio::from(fd));
        decompressor = Some(gunzip_process);
    } else {
        command.stdin(Stdio::piped());
    }

    let (mut process, stdout) = match ScopedProcess::spawn(command, "git") {
        Ok(spawned) => spawned,
        Err(err) => return errors::fail_500(info, "post_rpc_spawn", &err),
    };

    let writer = if gzipped {
        decompressor_stdin
    } else {
        process.take_stdin()
    };
    let Some(writer) = writer else {
        return errors::fail_500(info, "post_rpc_stdin", &"stdin pipe missing");
    };

    tokio::spawn(copy_request_body(
        request.into_body(),
        writer,
        decompressor,
        info.clone(),
    ));

    // Shallow clones end with `git upload-pack` exiting non-zero after a
    // complete exchange; reporting that would poison the alert channel.
    let quiet_exit = rpc == "git-upload-pack";
    let mut response = Response::new(exec::stream_stdout(
        process,
        stdout,
        info.clone(),
        "post_rpc",
        quiet_exit,
        None,
    ));
    let content_type = format!("application/x-{}-result", rpc);
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    headers::set_no_cache_headers(response.headers_mut());
    response
}

async fn copy_request_body(
    body: Body,
    mut writer: tokio::process::ChildStdin,
    decompressor: Option<ScopedProcess>,
    info: RequestInfo,
) {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                errors::log_benign(&info, "post_rpc_read_body", &err);
                break;
            }
        };
        if let Err(err) = writer.write_all(&chunk).await {
            // The subprocess closing its stdin early is normal for
            // upload-pack; treat it like a client disconnect.
            errors::log_benign(&info, "post_rpc_write_body", &err);
            break;
        }
    }
    drop(writer);
    if let Some(decompressor) = decompressor {
        if let Err(err) = decompressor.wait().await {
            errors::log_benign(&info, "post_rpc_gunzip", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_line_prefixes_the_length_in_hex() {
        assert_eq!(pkt_line("# service=git-upload-pack\n"), "001e# service=git-upload-pack\n");
        assert_eq!(pkt_line("a"), "0005a");
    }

    #[test]
    fn service_query_accepts_the_two_git_services() {
        assert_eq!(
            service_from_query(Some("service=git-upload-pack")),
            Some("git-upload-pack")
        );
        assert_eq!(
            service_from_query(Some("foo=bar&service=git-receive-pack")),
            Some("git-receive-pack")
        );
        assert_eq!(service_from_query(Some("service=git-wrong-pack")), None);
        assert_eq!(service_from_query(Some("no-service=1")), None);
        assert_eq!(service_from_query(None), None);
    }

    #[test]
    fn rpc_subcommand_drops_the_git_prefix() {
        assert_eq!(subcommand("git-upload-pack"), "upload-pack");
        assert_eq!(subcommand("git-receive-pack"), "receive-pack");
    }
}
