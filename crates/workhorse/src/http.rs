use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, Response, Uri, header};
use ulid::Ulid;

use crate::api::{ApiClient, Authorization, PreAuth};
use crate::config::{Config, StartupError};
use crate::errors;
use crate::git;
use crate::lfs;
use crate::limiter::{LimitError, QueueLimiter};
use crate::metrics;
use crate::proxy::{self, Backend};
use crate::staticfiles;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub api: ApiClient,
    pub backend: Backend,
    pub limiter: QueueLimiter,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, StartupError> {
        let api = ApiClient::new(&config)?;
        let backend = Backend::new(&config)?;
        let limiter = QueueLimiter::new(
            config.api_limit,
            config.api_queue_limit,
            config.api_queue_duration,
        );
        Ok(Self {
            config: Arc::new(config),
            api,
            backend,
            limiter,
        })
    }
}

/// Everything a handler needs to log about the request it is serving.
#[derive(Clone)]
pub struct RequestInfo {
    pub id: String,
    pub method: Method,
    pub uri: Uri,
    pub remote_ip: Option<IpAddr>,
}

impl RequestInfo {
    fn from_request(request: &Request<Body>) -> Self {
        let remote_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        Self {
            id: Ulid::new().to_string(),
            method: request.method().clone(),
            uri: request.uri().clone(),
            remote_ip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GitHandler {
    InfoRefs,
    PostRpc,
    Archive,
    LfsStore,
    LfsRetrieve,
}

struct GitRoute {
    method: &'static str,
    suffix: &'static str,
    handler: GitHandler,
    rpc: &'static str,
}

/// The routing table. Declaration order matters: matching is first-match on
/// exact method plus substring path, so overlapping suffixes resolve to the
/// earlier entry.
const GIT_ROUTES: &[GitRoute] = &[
    GitRoute {
        method: "GET",
        suffix: "/info/refs",
        handler: GitHandler::InfoRefs,
        rpc: "",
    },
    GitRoute {
        method: "POST",
        suffix: "/git-upload-pack",
        handler: GitHandler::PostRpc,
        rpc: "git-upload-pack",
    },
    GitRoute {
        method: "POST",
        suffix: "/git-receive-pack",
        handler: GitHandler::PostRpc,
        rpc: "git-receive-pack",
    },
    GitRoute {
        method: "GET",
        suffix: "/repository/archive",
        handler: GitHandler::Archive,
        rpc: "",
    },
    GitRoute {
        method: "PUT",
        suffix: "/gitlab-lfs/objects",
        handler: GitHandler::LfsStore,
        rpc: "",
    },
    GitRoute {
        method: "GET",
        suffix: "/gitlab-lfs/objects",
        handler: GitHandler::LfsRetrieve,
        rpc: "",
    },
];

fn match_git_route(method: &Method, path: &str) -> Option<&'static GitRoute> {
    GIT_ROUTES
        .iter()
        .find(|route| method.as_str() == route.method && path.contains(route.suffix))
}

pub fn router(config: Config) -> Result<Router, StartupError> {
    let state = AppState::new(config)?;
    Ok(Router::new().fallback(dispatch).with_state(state))
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    let started = Instant::now();
    let info = RequestInfo::from_request(&request);
    tracing::info!(
        correlation_id = %info.id,
        method = %info.method,
        uri = %info.uri,
        "workhorse.request"
    );

    let (route_label, response) = route(&state, &info, request).await;
    metrics::observe_http_request(
        route_label,
        info.method.as_str(),
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn route(
    state: &AppState,
    info: &RequestInfo,
    request: Request<Body>,
) -> (&'static str, Response<Body>) {
    if let Some(git_route) = match_git_route(&info.method, info.uri.path()) {
        return ("git", git_dispatch(state, info, git_route, request).await);
    }

    if info.method == Method::GET || info.method == Method::HEAD {
        if let Some(response) = staticfiles::try_serve(&state.config, info).await {
            return ("static", response);
        }
    }

    if info.uri.path().contains("/api/") {
        let permit = match state.limiter.acquire().await {
            Ok(permit) => permit,
            Err(err @ LimitError::QueueFull) => {
                return ("api", errors::too_many_requests(info, "api_queue", &err));
            }
            Err(err @ LimitError::QueueTimeout) => {
                return ("api", errors::service_unavailable(info, "api_queue", &err));
            }
        };
        let response = proxy::proxy(state, info, request).await;
        drop(permit);
        return ("api", response);
    }

    ("proxy", proxy::proxy(state, info, request).await)
}

async fn git_dispatch(
    state: &AppState,
    info: &RequestInfo,
    git_route: &'static GitRoute,
    request: Request<Body>,
) -> Response<Body> {
    let outcome = match state.api.pre_authorize(info, request.headers()).await {
        Ok(outcome) => outcome,
        Err(err) => return errors::fail_500(info, "preauthorize", &err),
    };

    let (auth, www_authenticate) = match outcome {
        PreAuth::Denied(response) => {
            // The backend said no. Its reply goes to the client verbatim,
            // including any WWW-Authenticate challenge.
            metrics::observe_preauth("denied");
            tracing::info!(
                correlation_id = %info.id,
                status = response.status().as_u16(),
                "workhorse.preauth_denied"
            );
            return response;
        }
        PreAuth::FalsePositive(response) => {
            // A 2xx without the workhorse media type was meant for the
            // client all along.
            metrics::observe_preauth("false_positive");
            return response;
        }
        PreAuth::Authorized(auth, www_authenticate) => {
            metrics::observe_preauth("authorized");
            (auth, www_authenticate)
        }
    };

    if !looks_like_repo(&auth.repo_path).await {
        return errors::not_found();
    }

    let mut response = match git_route.handler {
        GitHandler::InfoRefs => git::info_refs(info, &auth).await,
        GitHandler::PostRpc => git::post_rpc(info, &auth, git_route.rpc, request).await,
        GitHandler::Archive => archive_route(info, &auth).await,
        GitHandler::LfsStore => lfs::store(state, info, &auth, request).await,
        GitHandler::LfsRetrieve => proxy::proxy(state, info, request).await,
    };

    // Negotiate authentication may hand credentials back even on success.
    for value in www_authenticate {
        response
            .headers_mut()
            .append(header::WWW_AUTHENTICATE, value);
    }
    response
}

async fn archive_route(info: &RequestInfo, auth: &Authorization) -> Response<Body> {
    let basename = info.uri.path().rsplit('/').next().unwrap_or("");
    let Some(format) = git::archive::parse_basename(basename) else {
        return errors::fail_500(
            info,
            "archive_format",
            &format!("unrecognized archive basename {:?}", basename),
        );
    };
    let params = crate::senddata::ArchiveParams {
        repo_path: auth.repo_path.clone(),
        archive_path: auth.archive_path.clone(),
        archive_prefix: auth.archive_prefix.clone(),
        commit_id: auth.commit_id.clone(),
    };
    git::archive::inject(info, params, format).await
}

/// If `<repo>/objects` exists the path is assumed to be a repository. This
/// is a check-to-use race against the transport subprocess; `CommitId` in
/// the envelope is the mitigation where the backend provides one.
async fn looks_like_repo(repo_path: &str) -> bool {
    if repo_path.is_empty() {
        return false;
    }
    match tokio::fs::metadata(std::path::Path::new(repo_path).join("objects")).await {
        Ok(metadata) => metadata.is_dir(),
        Err(err) => {
            tracing::info!(repo_path, error = %err, "workhorse.repo_check_failed");
            false
        }
    }
}
