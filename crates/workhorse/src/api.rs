use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, header};
use http_body_util::BodyExt;
use serde::Deserialize;

use crate::config::{Config, StartupError};
use crate::headers;
use crate::http::RequestInfo;
use crate::proxy::{self, Backend, BackendError};

/// Media type the backend must use for authorization envelopes. A 2xx reply
/// with any other content type is a response meant for the client.
pub const RESPONSE_CONTENT_TYPE: &str = "application/vnd.gitlab-workhorse+json";

/// Identifies subrequests to the backend so it can route them specially.
pub const REQUEST_HEADER: &str = "Gitlab-Workhorse";

/// Carries the HS256 proof that the subrequest came from workhorse.
pub const API_REQUEST_HEADER: &str = "Gitlab-Workhorse-Api-Request";

const JWT_ISSUER: &str = "gitlab-workhorse";

/// Metadata envelope returned by the backend when it authorizes workhorse to
/// take over a request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Authorization {
    /// Opaque user token, exported to repository hooks as `GL_ID`.
    #[serde(default, rename = "GL_ID")]
    pub gl_id: String,
    /// Absolute on-disk path of the target repository.
    #[serde(default, rename = "RepoPath")]
    pub repo_path: String,
    /// Canonical cache location for a requested archive.
    #[serde(default, rename = "ArchivePath")]
    pub archive_path: String,
    /// Directory prefix for extracted archive contents.
    #[serde(default, rename = "ArchivePrefix")]
    pub archive_prefix: String,
    /// Pins the archive to the commit the backend resolved, closing the
    /// check-to-use race against ref updates.
    #[serde(default, rename = "CommitId")]
    pub commit_id: String,
    /// Scratch directory for large-object uploads.
    #[serde(default, rename = "StoreLFSPath")]
    pub store_lfs_path: String,
    /// When set, repository transport is relayed to this Unix socket instead
    /// of spawning git locally.
    #[serde(default, rename = "GitalySocketPath")]
    pub gitaly_socket_path: String,
    #[serde(default, rename = "GitalyResourcePath")]
    pub gitaly_resource_path: String,
}

pub enum PreAuth {
    Authorized(Box<Authorization>, Vec<HeaderValue>),
    Denied(Response<Body>),
    FalsePositive(Response<Body>),
}

#[derive(Debug)]
pub enum ApiError {
    Unreachable(BackendError),
    BadContent(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unreachable(err) => write!(f, "pre-authorization failed: {}", err),
            ApiError::BadContent(err) => {
                write!(f, "pre-authorization envelope unreadable: {}", err)
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl From<BackendError> for ApiError {
    fn from(value: BackendError) -> Self {
        ApiError::Unreachable(value)
    }
}

#[derive(serde::Serialize)]
struct ApiClaims {
    iss: &'static str,
}

/// Client for pre-authorization subrequests. One dedicated instance is used
/// for every subrequest; its connections are pooled.
#[derive(Clone)]
pub struct ApiClient {
    backend: Backend,
    version_header: HeaderValue,
    token: Option<HeaderValue>,
    headers_timeout: std::time::Duration,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, StartupError> {
        let backend = Backend::new(config)?;
        let version_header =
            HeaderValue::from_str(&config.version).map_err(|_| StartupError {
                code: "ERR_INVALID_VERSION",
                message: "version string is not a valid header value".to_string(),
            })?;

        // The claims are static, so the proof is signed once at startup.
        let token = match &config.secret {
            None => None,
            Some(secret) => {
                let token = jsonwebtoken::encode(
                    &jsonwebtoken::Header::default(),
                    &ApiClaims { iss: JWT_ISSUER },
                    &jsonwebtoken::EncodingKey::from_secret(secret),
                )
                .map_err(|_| StartupError {
                    code: "ERR_SECRET_INVALID",
                    message: "failed to sign the API request token".to_string(),
                })?;
                Some(HeaderValue::from_str(&token).map_err(|_| StartupError {
                    code: "ERR_SECRET_INVALID",
                    message: "signed API token is not a valid header value".to_string(),
                })?)
            }
        };

        Ok(Self {
            backend,
            version_header,
            token,
            headers_timeout: config.proxy_headers_timeout,
        })
    }

    /// Asks the backend whether workhorse may handle this request. All
    /// client headers are forwarded, including `Authorization` and `Host`;
    /// the subrequest itself carries no body.
    pub async fn pre_authorize(
        &self,
        info: &RequestInfo,
        client_headers: &HeaderMap,
    ) -> Result<PreAuth, ApiError> {
        let mut headers = client_headers.clone();
        proxy::strip_hop_headers(&mut headers);
        headers.insert(REQUEST_HEADER, self.version_header.clone());
        if let Some(token) = &self.token {
            headers.insert(API_REQUEST_HEADER, token.clone());
        }

        let response = self
            .backend
            .roundtrip(
                info.method.clone(),
                &info.uri,
                headers,
                None,
                Some(self.headers_timeout),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Ok(PreAuth::Denied(response));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if !headers::is_content_type(RESPONSE_CONTENT_TYPE, content_type) {
            return Ok(PreAuth::FalsePositive(response));
        }

        // Negotiate-style authentication may need to hand credentials back
        // to the client even on success (RFC 4559).
        let www_authenticate: Vec<HeaderValue> = response
            .headers()
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .cloned()
            .collect();

        let body = response.into_body();
        let bytes = body
            .collect()
            .await
            .map_err(|err| ApiError::BadContent(err.to_string()))?
            .to_bytes();
        let authorization: Authorization = serde_json::from_slice(&bytes)
            .map_err(|err| ApiError::BadContent(err.to_string()))?;

        Ok(PreAuth::Authorized(Box::new(authorization), www_authenticate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_known_fields_and_ignores_extras() {
        let body = r#"{
            "GL_ID": "user-123",
            "RepoPath": "/repos/group/test.git",
            "ArchivePath": "/cache/archive.tar.gz",
            "ArchivePrefix": "test-master",
            "CommitId": "c7fbe50c7c7419d9701eebe64b1fdacc3df5b9dd",
            "StoreLFSPath": "/lfs/tmp",
            "FutureField": true
        }"#;
        let auth: Authorization = serde_json::from_str(body).expect("parse envelope");
        assert_eq!(auth.gl_id, "user-123");
        assert_eq!(auth.repo_path, "/repos/group/test.git");
        assert_eq!(auth.archive_prefix, "test-master");
        assert_eq!(auth.commit_id, "c7fbe50c7c7419d9701eebe64b1fdacc3df5b9dd");
        assert_eq!(auth.store_lfs_path, "/lfs/tmp");
        assert!(auth.gitaly_socket_path.is_empty());
    }

    #[test]
    fn envelope_fields_default_to_empty() {
        let auth: Authorization = serde_json::from_str("{}").expect("parse empty envelope");
        assert!(auth.gl_id.is_empty());
        assert!(auth.repo_path.is_empty());
    }
}
