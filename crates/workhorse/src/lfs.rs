use std::os::unix::fs::DirBuilderExt;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::api::Authorization;
use crate::errors;
use crate::http::{AppState, RequestInfo};
use crate::proxy;

/// Tells the backend where the uploaded object was staged.
pub const TMP_PATH_HEADER: &str = "X-Gitlab-Lfs-Tmp-Path";

/// `PUT …/gitlab-lfs/objects/<oid>/<size>`: the body is staged in a temp
/// file under the backend-provided directory, verified against the declared
/// oid and size, and the request is then replayed to the backend pointing at
/// the staged file. The temp file is removed once the backend answered.
pub async fn store(
    state: &AppState,
    info: &RequestInfo,
    auth: &Authorization,
    request: Request<Body>,
) -> Response<Body> {
    let Some((oid, declared_size)) = object_id_and_size(info.uri.path()) else {
        return errors::fail_500(info, "lfs_store", &"invalid object path");
    };
    if auth.store_lfs_path.is_empty() {
        return errors::fail_500(info, "lfs_store", &"StoreLFSPath is empty");
    }

    tracing::info!(
        correlation_id = %info.id,
        oid = %oid,
        size = declared_size,
        "workhorse.lfs_store"
    );

    if let Err(err) = std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&auth.store_lfs_path)
    {
        return errors::fail_500(info, "lfs_store_mkdir", &err);
    }
    let temp = match NamedTempFile::new_in(&auth.store_lfs_path) {
        Ok(temp) => temp,
        Err(err) => return errors::fail_500(info, "lfs_store_tempfile", &err),
    };
    let std_file = match temp.reopen() {
        Ok(file) => file,
        Err(err) => return errors::fail_500(info, "lfs_store_tempfile", &err),
    };
    let mut file = tokio::fs::File::from_std(std_file);

    let (parts, body) = request.into_parts();
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return errors::fail_500(info, "lfs_store_read", &err),
        };
        hasher.update(&chunk);
        written += chunk.len() as u64;
        if let Err(err) = file.write_all(&chunk).await {
            return errors::fail_500(info, "lfs_store_write", &err);
        }
    }
    if let Err(err) = file.flush().await {
        return errors::fail_500(info, "lfs_store_write", &err);
    }
    drop(file);

    if written != declared_size {
        return errors::fail_500(
            info,
            "lfs_store",
            &format!("expected {} bytes, received {}", declared_size, written),
        );
    }
    let digest = hex::encode(hasher.finalize());
    if digest != oid {
        return errors::fail_500(
            info,
            "lfs_store",
            &format!("expected oid {}, got {}", oid, digest),
        );
    }

    // Replay the request with the body swapped for the staged file path.
    let mut headers = parts.headers;
    proxy::strip_hop_headers(&mut headers);
    proxy::set_forwarded_for(&mut headers, info.remote_ip);
    headers.remove(axum::http::header::CONTENT_LENGTH);
    headers.remove(axum::http::header::CONTENT_ENCODING);
    let tmp_path = temp.path().to_string_lossy().to_string();
    match HeaderValue::from_str(&tmp_path) {
        Ok(value) => {
            headers.insert(TMP_PATH_HEADER, value);
        }
        Err(err) => return errors::fail_500(info, "lfs_store", &err),
    }

    let result = state
        .backend
        .roundtrip(
            parts.method,
            &parts.uri,
            headers,
            None,
            Some(state.config.proxy_headers_timeout),
        )
        .await;

    // The backend has consumed (or rejected) the staged object by the time
    // its response headers arrive; dropping the temp file unlinks whatever
    // is left behind.
    drop(temp);

    match result {
        Ok(response) => response,
        Err(err) => errors::fail_500(info, "lfs_store_forward", &err),
    }
}

fn object_id_and_size(path: &str) -> Option<(String, u64)> {
    let mut segments = path.trim_end_matches('/').rsplit('/');
    let size = segments.next()?.parse::<u64>().ok()?;
    let oid = segments.next()?;
    if oid.len() != 64
        || !oid
            .bytes()
            .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
    {
        return None;
    }
    if segments.next()? != "objects" {
        return None;
    }
    Some((oid.to_string(), size))
}
