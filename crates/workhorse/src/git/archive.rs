use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::process::Stdio;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, header};
use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::errors;
use crate::exec::{self, ScopedProcess};
use crate::headers;
use crate::http::RequestInfo;
use crate::metrics;
use crate::senddata::ArchiveParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    Zip,
}

impl ArchiveFormat {
    pub fn name(self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::Zip => "zip",
        }
    }

    fn git_format(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            _ => "tar",
        }
    }

    /// git emits plain tar; gz and bz2 variants pipe through a compressor.
    fn compressor(self) -> Option<&'static [&'static str]> {
        match self {
            ArchiveFormat::TarGz => Some(&["gzip", "-c", "-n"]),
            ArchiveFormat::TarBz2 => Some(&["bzip2", "-c"]),
            _ => None,
        }
    }
}

pub fn parse_basename(basename: &str) -> Option<ArchiveFormat> {
    if basename == "archive" {
        return Some(ArchiveFormat::TarGz);
    }
    const SUFFIXES: &[(&str, ArchiveFormat)] = &[
        (".tar.gz", ArchiveFormat::TarGz),
        (".tgz", ArchiveFormat::TarGz),
        (".gz", ArchiveFormat::TarGz),
        (".tar.bz2", ArchiveFormat::TarBz2),
        (".tbz", ArchiveFormat::TarBz2),
        (".tbz2", ArchiveFormat::TarBz2),
        (".tb2", ArchiveFormat::TarBz2),
        (".bz2", ArchiveFormat::TarBz2),
        (".tar", ArchiveFormat::Tar),
        (".zip", ArchiveFormat::Zip),
    ];
    SUFFIXES
        .iter()
        .find(|(suffix, _)| basename.ends_with(suffix))
        .map(|(_, format)| *format)
}

pub(crate) fn set_archive_headers(
    headers: &mut HeaderMap,
    format: ArchiveFormat,
    filename: &str,
) {
    let content_type = match format {
        ArchiveFormat::Zip => "application/zip",
        _ => "application/octet-stream",
    };
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    // The length is unknown while the archive streams out of git.
    headers.remove(header::CONTENT_LENGTH);
    headers.insert(
        header::CONTENT_DISPOSITION,
        headers::attachment_disposition(filename),
    );
    // Archive bytes are per-user content; shared caches must not keep them.
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
    headers::disable_response_buffering(headers);
}

/// Publishing an archive that a concurrent winner already produced is a
/// success, not an error.
pub(crate) fn finalize_cached_archive(
    temp: NamedTempFile,
    target: &str,
) -> std::io::Result<()> {
    match temp.persist_noclobber(target) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.error),
    }
}

pub async fn inject(
    info: &RequestInfo,
    params: ArchiveParams,
    format: ArchiveFormat,
) -> Response<Body> {
    if params.repo_path.is_empty() || params.archive_path.is_empty() || params.commit_id.is_empty()
    {
        return errors::fail_500(info, "send_archive", &"incomplete archive parameters");
    }

    tracing::info!(
        correlation_id = %info.id,
        commit_id = %params.commit_id,
        format = format.name(),
        uri = %info.uri,
        "workhorse.send_archive"
    );

    let archive_path = Path::new(&params.archive_path);
    let filename = archive_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());

    if let Ok(metadata) = tokio::fs::metadata(archive_path).await {
        if metadata.is_file() {
            metrics::observe_archive_cache("hit");
            return match tokio::fs::File::open(archive_path).await {
                Ok(file) => {
                    let mut response =
                        Response::new(Body::from_stream(ReaderStream::new(file)));
                    set_archive_headers(response.headers_mut(), format, &filename);
                    response
                        .headers_mut()
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
                    response
                }
                Err(err) => errors::fail_500(info, "send_archive_cache_open", &err),
            };
        }
    }
    metrics::observe_archive_cache("miss");

    let Some(cache_dir) = archive_path.parent() else {
        return errors::fail_500(info, "send_archive", &"archive path has no parent directory");
    };
    if let Err(err) = std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(cache_dir)
    {
        return errors::fail_500(info, "send_archive_mkdir", &err);
    }
    // The temp file lives next to the canonical path so publish is an
    // atomic same-filesystem rename; losers of the race just lose it.
    let temp = match NamedTempFile::new_in(cache_dir) {
        Ok(temp) => temp,
        Err(err) => return errors::fail_500(info, "send_archive_tempfile", &err),
    };

    metrics::observe_git_command("archive");
    let git_dir = format!("--git-dir={}", params.repo_path);
    let format_flag = format!("--format={}", format.git_format());
    let prefix_flag = format!("--prefix={}/", params.archive_prefix);
    let mut command = super::git_command("");
    command.args([
        git_dir.as_str(),
        "archive",
        format_flag.as_str(),
        prefix_flag.as_str(),
        params.commit_id.as_str(),
    ]);
    command.stdin(Stdio::null());
    let (git_process, git_stdout) = match ScopedProcess::spawn(command, "git") {
        Ok(spawned) => spawned,
        Err(err) => return errors::fail_500(info, "send_archive_spawn", &err),
    };

    let (process, stdout, producer) = match format.compressor() {
        None => (git_process, git_stdout, None),
        Some(compressor) => {
            let mut compress = exec::scrubbed_command(compressor[0], "");
            compress.args(&compressor[1..]);
            let fd = match git_stdout.into_owned_fd() {
                Ok(fd) => fd,
                Err(err) => return errors::fail_500(info, "send_archive_pipe", &err),
            };
            compress.stdin(Stdio::from(fd));
            match ScopedProcess::spawn(compress, compressor[0]) {
                Ok((compress_process, compress_stdout)) => {
                    (compress_process, compress_stdout, Some(git_process))
                }
                Err(err) => return errors::fail_500(info, "send_archive_compress", &err),
            }
        }
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let target = params.archive_path.clone();
    let task_info = info.clone();
    tokio::spawn(async move {
        match write_archive(stdout, temp, &target, &tx, process, producer).await {
            Ok(()) => {}
            Err(err) => {
                errors::report_error(&task_info, "send_archive_stream", &err);
                let _ = tx
                    .send(Err(std::io::Error::other("archive generation failed")))
                    .await;
            }
        }
    });

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));
    let mut response = Response::new(body);
    set_archive_headers(response.headers_mut(), format, &filename);
    response
}

/// Copies archive bytes to the client while teeing them into the cache temp
/// file; the cache entry is only published after every involved subprocess
/// exited cleanly, so a partial archive is never observable.
async fn write_archive(
    mut stdout: ChildStdout,
    temp: NamedTempFile,
    target: &str,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    process: ScopedProcess,
    producer: Option<ScopedProcess>,
) -> Result<(), String> {
    let std_file = temp
        .reopen()
        .map_err(|err| format!("reopen cache temp file: {}", err))?;
    let mut file = tokio::fs::File::from_std(std_file);

    let mut buf = BytesMut::with_capacity(32 * 1024);
    loop {
        buf.clear();
        let n = stdout
            .read_buf(&mut buf)
            .await
            .map_err(|err| format!("read archive stream: {}", err))?;
        if n == 0 {
            break;
        }
        let chunk = buf.split().freeze();
        file.write_all(&chunk)
            .await
            .map_err(|err| format!("write cache temp file: {}", err))?;
        if tx.send(Ok(chunk)).await.is_err() {
            // Client went away; dropping the guards tears the processes
            // down and discards the temp file.
            return Ok(());
        }
    }
    file.flush()
        .await
        .map_err(|err| format!("flush cache temp file: {}", err))?;
    drop(file);

    process
        .wait()
        .await
        .map_err(|err| format!("archive pipeline: {}", err))?;
    if let Some(producer) = producer {
        producer
            .wait()
            .await
            .map_err(|err| format!("git archive: {}", err))?;
    }

    finalize_cached_archive(temp, target).map_err(|err| format!("publish archive: {}", err))
}
