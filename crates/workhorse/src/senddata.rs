use axum::body::Body;
use axum::http::Response;
use base64::Engine;
use serde::Deserialize;

use crate::artifacts;
use crate::errors;
use crate::git;
use crate::http::{AppState, RequestInfo};
use crate::metrics;

/// Sentinel response header. Its presence means: discard the backend body
/// and stream the named injector's output instead.
pub const HEADER: &str = "Gitlab-Workhorse-Send-Data";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlobParams {
    #[serde(default, rename = "RepoPath")]
    pub repo_path: String,
    #[serde(default, rename = "BlobId")]
    pub blob_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiffParams {
    #[serde(default, rename = "RepoPath")]
    pub repo_path: String,
    #[serde(default, rename = "ShaFrom")]
    pub sha_from: String,
    #[serde(default, rename = "ShaTo")]
    pub sha_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArchiveParams {
    #[serde(default, rename = "RepoPath")]
    pub repo_path: String,
    #[serde(default, rename = "ArchivePath")]
    pub archive_path: String,
    #[serde(default, rename = "ArchivePrefix")]
    pub archive_prefix: String,
    #[serde(default, rename = "CommitId")]
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntryParams {
    #[serde(default, rename = "Archive")]
    pub archive: String,
    #[serde(default, rename = "Entry")]
    pub entry: String,
}

/// The injector registry. Scheme tags are fixed at compile time; there is no
/// dynamic registration.
#[derive(Debug, Clone, PartialEq)]
pub enum SendData {
    Blob(BlobParams),
    Diff(DiffParams),
    FormatPatch(DiffParams),
    Archive(ArchiveParams),
    ArtifactsEntry(EntryParams),
}

impl SendData {
    pub fn scheme(&self) -> &'static str {
        match self {
            SendData::Blob(_) => "git-blob",
            SendData::Diff(_) => "git-diff",
            SendData::FormatPatch(_) => "git-format-patch",
            SendData::Archive(_) => "git-archive",
            SendData::ArtifactsEntry(_) => "artifacts-entry",
        }
    }
}

#[derive(Debug)]
pub enum SendDataError {
    Malformed(String),
    UnknownScheme(String),
}

impl std::fmt::Display for SendDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendDataError::Malformed(what) => write!(f, "malformed send-data header: {}", what),
            SendDataError::UnknownScheme(scheme) => {
                write!(f, "unknown send-data scheme {:?}", scheme)
            }
        }
    }
}

impl std::error::Error for SendDataError {}

pub fn decode(value: &str) -> Result<SendData, SendDataError> {
    let (scheme, payload) = value
        .split_once(':')
        .ok_or_else(|| SendDataError::Malformed("missing scheme separator".to_string()))?;
    let json = base64::engine::general_purpose::URL_SAFE
        .decode(payload)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload))
        .map_err(|err| SendDataError::Malformed(format!("base64: {}", err)))?;

    let parse = |err: serde_json::Error| SendDataError::Malformed(format!("json: {}", err));
    match scheme {
        "git-blob" => Ok(SendData::Blob(serde_json::from_slice(&json).map_err(parse)?)),
        "git-diff" => Ok(SendData::Diff(serde_json::from_slice(&json).map_err(parse)?)),
        "git-format-patch" => Ok(SendData::FormatPatch(
            serde_json::from_slice(&json).map_err(parse)?,
        )),
        "git-archive" => Ok(SendData::Archive(
            serde_json::from_slice(&json).map_err(parse)?,
        )),
        "artifacts-entry" => Ok(SendData::ArtifactsEntry(
            serde_json::from_slice(&json).map_err(parse)?,
        )),
        other => Err(SendDataError::UnknownScheme(other.to_string())),
    }
}

/// Replaces a backend response that carries the sentinel header. The backend
/// body is discarded in its entirety; the header never reaches the client.
pub async fn inject(
    state: &AppState,
    info: &RequestInfo,
    response: Response<Body>,
) -> Response<Body> {
    let (parts, body) = response.into_parts();
    // Dropping the body closes the backend connection without forwarding a
    // single byte of it.
    drop(body);

    let value = match parts
        .headers
        .get(HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value.to_string(),
        None => {
            return errors::fail_500(info, "senddata", &"sentinel header is not valid UTF-8");
        }
    };

    let directive = match decode(&value) {
        Ok(directive) => directive,
        Err(err) => return errors::fail_500(info, "senddata_decode", &err),
    };
    metrics::observe_senddata(directive.scheme());

    match directive {
        SendData::Blob(params) => git::blob::inject(info, params).await,
        SendData::Diff(params) => git::diff::inject(info, params).await,
        SendData::FormatPatch(params) => git::patch::inject(info, params).await,
        SendData::Archive(params) => {
            let basename = info.uri.path().rsplit('/').next().unwrap_or("");
            match git::archive::parse_basename(basename) {
                Some(format) => git::archive::inject(info, params, format).await,
                None => errors::fail_500(
                    info,
                    "senddata_archive_format",
                    &format!("unrecognized archive basename {:?}", basename),
                ),
            }
        }
        SendData::ArtifactsEntry(params) => {
            artifacts::inject(&state.config, info, params).await
        }
    }
}
