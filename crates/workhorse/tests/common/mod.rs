#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::response::IntoResponse;
use base64::Engine;
use url::Url;
use workhorse::config::{Config, ListenNetwork};

pub fn test_config(backend: &str) -> Config {
    Config {
        listen_addr: String::new(),
        listen_network: ListenNetwork::Tcp,
        listen_umask: 0o22,
        backend: Url::parse(backend).expect("backend url"),
        auth_socket: None,
        document_root: None,
        proxy_headers_timeout: Duration::from_secs(300),
        secret: None,
        api_limit: 0,
        api_queue_limit: 0,
        api_queue_duration: Duration::from_secs(30),
        prometheus_listen_addr: None,
        development: true,
        version: "test".to_string(),
        zip_cat_bin: env!("CARGO_BIN_EXE_gitlab-zip-cat").to_string(),
    }
}

pub async fn start_workhorse(config: Config) -> String {
    let app = workhorse::http::router(config).expect("build router");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind workhorse listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve workhorse");
    });
    format!("http://{}", addr)
}

pub async fn start_backend(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve backend");
    });
    format!("http://{}", addr)
}

/// A pre-authorization reply carrying the workhorse JSON media type.
pub fn envelope_response(body: serde_json::Value) -> axum::response::Response {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            workhorse::api::RESPONSE_CONTENT_TYPE,
        )],
        body.to_string(),
    )
        .into_response()
}

/// Backend that answers every request with a send-data directive plus a
/// body that must never reach the client.
pub fn senddata_backend(scheme: &str, params: serde_json::Value) -> Router {
    let value = format!(
        "{}:{}",
        scheme,
        base64::engine::general_purpose::URL_SAFE.encode(params.to_string())
    );
    Router::new().fallback(move || {
        let value = value.clone();
        async move { ([(workhorse::senddata::HEADER, value)], "gibberish").into_response() }
    })
}

/// A directory that passes the "looks like a repository" check without
/// needing git: only `<repo>/objects` is ever inspected.
pub fn fake_repo(dir: &std::path::Path) -> String {
    let repo = dir.join("fake.git");
    std::fs::create_dir_all(repo.join("objects")).expect("create objects dir");
    repo.to_string_lossy().to_string()
}

pub async fn wait_for<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
