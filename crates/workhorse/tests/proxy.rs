mod common;

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use base64::Engine;
use common::{
    envelope_response, fake_repo, senddata_backend, start_backend, start_workhorse, test_config,
};

#[tokio::test]
async fn regular_requests_are_proxied_transparently() {
    let backend_app = Router::new().fallback(|| async { "API RESPONSE" });
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let client = reqwest::Client::new();
    for resource in [
        "/api/v3/projects/123/repository/not/special",
        "/api/v3/projects/foo%2Fbar/repository/not/special",
        "/api/v3/projects/123/not/special",
        "/something/else/entirely",
    ] {
        let response = client
            .get(format!("{}{}", workhorse, resource))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK, "GET {}", resource);
        assert!(
            response.headers().get("X-Accel-Buffering").is_none(),
            "GET {}: buffering hint must not be set on plain proxying",
            resource
        );
        assert_eq!(response.text().await.expect("body"), "API RESPONSE");
    }
}

#[tokio::test]
async fn forwarded_for_reaches_the_backend_with_the_peer_appended() {
    let backend_app = Router::new().fallback(|request: Request| async move {
        request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("missing")
            .to_string()
    });
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/anything", workhorse))
        .header("X-Forwarded-For", "203.0.113.7")
        .send()
        .await
        .expect("request");
    assert_eq!(
        response.text().await.expect("body"),
        "203.0.113.7, 127.0.0.1"
    );
}

#[tokio::test]
async fn denied_git_requests_forward_the_backend_reply_verbatim() {
    let backend_app = Router::new().fallback(|| async {
        (
            StatusCode::FORBIDDEN,
            [
                ("WWW-Authenticate", "Basic realm=\"GitLab\""),
                ("X-Custom-Denial", "yes"),
            ],
            "Access denied",
        )
    });
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!(
            "{}/group/test.git/info/refs?service=git-upload-pack",
            workhorse
        ))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response
            .headers()
            .get("www-authenticate")
            .map(|v| v.as_bytes()),
        Some(b"Basic realm=\"GitLab\"".as_slice())
    );
    assert_eq!(
        response.headers().get("x-custom-denial").map(|v| v.as_bytes()),
        Some(b"yes".as_slice())
    );
    assert_eq!(response.text().await.expect("body"), "Access denied");
}

#[tokio::test]
async fn api_false_positives_are_proxied() {
    // Paths that look like special routes reach pre-authorization, but the
    // backend answers with a page for the client; it must pass through.
    let backend_app = Router::new().fallback(|| async {
        ([(axum::http::header::CONTENT_TYPE, "text/html")], "<html></html>")
    });
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let client = reqwest::Client::new();
    let zero_oid = "0".repeat(64);
    let cases = [
        (
            reqwest::Method::GET,
            "/nested/group/project/blob/master/foo.git/info/refs".to_string(),
        ),
        (
            reqwest::Method::POST,
            "/nested/group/project/blob/master/foo.git/git-upload-pack".to_string(),
        ),
        (
            reqwest::Method::POST,
            "/nested/group/project/blob/master/foo.git/git-receive-pack".to_string(),
        ),
        (
            reqwest::Method::PUT,
            format!(
                "/nested/group/project/blob/master/foo.git/gitlab-lfs/objects/{}/0",
                zero_oid
            ),
        ),
    ];
    for (method, path) in cases {
        let response = client
            .request(method.clone(), format!("{}{}", workhorse, path))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK, "{} {}", method, path);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .map(|v| v.as_bytes()),
            Some(b"text/html".as_slice()),
            "{} {}",
            method,
            path
        );
        assert_eq!(response.text().await.expect("body"), "<html></html>");
    }
}

#[tokio::test]
async fn api_media_type_responses_never_reach_the_client() {
    let backend_app = Router::new().fallback(|| async {
        (
            [(
                axum::http::header::CONTENT_TYPE,
                workhorse::api::RESPONSE_CONTENT_TYPE,
            )],
            r#"{"hello":"world"}"#,
        )
    });
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!("{}/something", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.text().await.expect("body");
    assert!(
        !body.contains("world"),
        "backend body leaked to the client: {:?}",
        body
    );
}

fn write_artifacts_zip(dir: &std::path::Path) -> String {
    let zip_path = dir.join("artifacts-archive.zip");
    let file = std::fs::File::create(&zip_path).expect("create zip");
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file("myfile", zip::write::SimpleFileOptions::default())
        .expect("start entry");
    writer.write_all(b"MY FILE").expect("write entry");
    writer.finish().expect("finish zip");
    zip_path.to_string_lossy().to_string()
}

#[tokio::test]
async fn artifacts_entry_streams_a_single_zip_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = write_artifacts_zip(dir.path());
    let entry = base64::engine::general_purpose::STANDARD.encode("myfile");

    let backend_app = senddata_backend(
        "artifacts-entry",
        serde_json::json!({ "Archive": archive, "Entry": entry }),
    );
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!(
            "{}/namespace/project/builds/123/artifacts/file/myfile",
            workhorse
        ))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers().get(workhorse::senddata::HEADER).is_none(),
        "the send-data header must be stripped from the client response"
    );
    assert_eq!(
        response.headers().get("X-Accel-Buffering").map(|v| v.as_bytes()),
        Some(b"no".as_slice())
    );
    assert_eq!(
        response.headers().get("content-length").map(|v| v.as_bytes()),
        Some(b"7".as_slice())
    );
    assert_eq!(response.text().await.expect("body"), "MY FILE");
}

#[tokio::test]
async fn artifacts_entry_missing_from_the_archive_is_404() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = write_artifacts_zip(dir.path());
    let entry = base64::engine::general_purpose::STANDARD.encode("no-such-file");

    let backend_app = senddata_backend(
        "artifacts-entry",
        serde_json::json!({ "Archive": archive, "Entry": entry }),
    );
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!("{}/artifacts/file/no-such-file", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response.text().await.expect("body");
    assert!(!body.contains("gibberish"));
}

#[tokio::test]
async fn unknown_senddata_scheme_is_an_internal_error() {
    let backend_app = senddata_backend("git-stash", serde_json::json!({}));
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!("{}/something", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.text().await.expect("body");
    assert!(
        !body.contains("gibberish"),
        "backend body must be discarded on decode failure"
    );
}

#[tokio::test]
async fn x_sendfile_replaces_the_backend_body_with_file_contents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let content_path = dir.path().join("my-content");
    std::fs::write(&content_path, "EXPECTED").expect("write content");
    let header_value = content_path.to_string_lossy().to_string();

    let backend_app = Router::new().fallback(move || {
        let header_value = header_value.clone();
        async move { ([(workhorse::sendfile::HEADER, header_value)], "gibberish").into_response() }
    });
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!("{}/foo/uploads/bar", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers().get(workhorse::sendfile::HEADER).is_none(),
        "X-Sendfile must be stripped before the response reaches the client"
    );
    assert_eq!(
        response.headers().get("content-length").map(|v| v.as_bytes()),
        Some(b"8".as_slice())
    );
    assert_eq!(
        response.headers().get("X-Accel-Buffering").map(|v| v.as_bytes()),
        Some(b"no".as_slice())
    );
    assert_eq!(response.text().await.expect("body"), "EXPECTED");
}

#[tokio::test]
async fn x_sendfile_for_a_missing_file_is_404() {
    let backend_app = Router::new().fallback(|| async {
        (
            [(workhorse::sendfile::HEADER, "/does/not/exist")],
            "gibberish",
        )
    });
    let backend = start_backend(backend_app).await;
    let workhorse = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!("{}/foo/uploads/bar", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response.text().await.expect("body");
    assert!(!body.contains("gibberish"));
}

#[tokio::test]
async fn static_files_are_served_without_touching_the_backend() {
    let docroot = tempfile::tempdir().expect("tempdir");
    std::fs::write(docroot.path().join("static file.txt"), "PUBLIC").expect("write static");

    let proxied = Arc::new(AtomicBool::new(false));
    let marker = proxied.clone();
    let backend_app = Router::new().fallback(move || {
        let marker = marker.clone();
        async move {
            marker.store(true, Ordering::SeqCst);
            (StatusCode::NOT_FOUND, "proxied")
        }
    });
    let backend = start_backend(backend_app).await;

    let mut config = test_config(&backend);
    config.document_root = Some(docroot.path().to_path_buf());
    let workhorse = start_workhorse(config).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/static%20file.txt", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Accel-Buffering").map(|v| v.as_bytes()),
        Some(b"no".as_slice())
    );
    assert_eq!(response.text().await.expect("body"), "PUBLIC");
    assert!(
        !proxied.load(Ordering::SeqCst),
        "static hit must not reach the backend"
    );

    // A miss falls through to the proxy.
    let response = client
        .get(format!("{}/no-such-file.txt", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.expect("body"), "proxied");
    assert!(proxied.load(Ordering::SeqCst));
}

#[tokio::test]
async fn static_files_honor_a_relative_backend_url() {
    let docroot = tempfile::tempdir().expect("tempdir");
    std::fs::write(docroot.path().join("static.txt"), "PUBLIC").expect("write static");

    let backend_app = Router::new().fallback(|| async { (StatusCode::NOT_FOUND, "proxied") });
    let backend = start_backend(backend_app).await;

    let mut config = test_config(&format!("{}/my-relative-url", backend));
    config.document_root = Some(docroot.path().to_path_buf());
    let workhorse = start_workhorse(config).await;

    let response = reqwest::Client::new()
        .get(format!("{}/my-relative-url/static.txt", workhorse))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "PUBLIC");
}

#[tokio::test]
async fn lfs_uploads_are_staged_verified_and_replayed_to_the_backend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo_path = fake_repo(dir.path());
    let store_path = dir.path().join("lfs-tmp");
    std::fs::create_dir_all(&store_path).expect("create store dir");
    let store = store_path.to_string_lossy().to_string();

    let content = b"BODY DATA";
    let oid = {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    };

    let backend_store = store.clone();
    let backend_app = Router::new().fallback(move |request: Request| {
        let repo_path = repo_path.clone();
        let store = backend_store.clone();
        async move {
            match request
                .headers()
                .get(workhorse::lfs::TMP_PATH_HEADER)
                .and_then(|value| value.to_str().ok())
            {
                // The replayed request points at the staged file.
                Some(tmp_path) => {
                    let staged = std::fs::read(tmp_path).expect("read staged object");
                    assert_eq!(staged, b"BODY DATA");
                    "stored".into_response()
                }
                // The pre-authorization subrequest.
                None => envelope_response(serde_json::json!({
                    "GL_ID": "user-123",
                    "RepoPath": repo_path,
                    "StoreLFSPath": store,
                })),
            }
        }
    });
    let backend = start_backend(backend_app).await;
    let workhorse_url = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .put(format!(
            "{}/group/project.git/gitlab-lfs/objects/{}/{}",
            workhorse_url,
            oid,
            content.len()
        ))
        .body(content.to_vec())
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "stored");

    // The staged temp file is removed once the backend has answered.
    let leftovers: Vec<_> = std::fs::read_dir(&store_path)
        .expect("read store dir")
        .collect();
    assert!(leftovers.is_empty(), "staged upload was not cleaned up");
}

#[tokio::test]
async fn corrupt_lfs_uploads_are_rejected_before_the_backend_sees_them() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo_path = fake_repo(dir.path());
    let store_path = dir.path().join("lfs-tmp");
    std::fs::create_dir_all(&store_path).expect("create store dir");
    let store = store_path.to_string_lossy().to_string();

    let replayed = Arc::new(AtomicBool::new(false));
    let marker = replayed.clone();
    let backend_app = Router::new().fallback(move |request: Request| {
        let repo_path = repo_path.clone();
        let store = store.clone();
        let marker = marker.clone();
        async move {
            if request.headers().contains_key(workhorse::lfs::TMP_PATH_HEADER) {
                marker.store(true, Ordering::SeqCst);
                return "stored".into_response();
            }
            envelope_response(serde_json::json!({
                "RepoPath": repo_path,
                "StoreLFSPath": store,
            }))
        }
    });
    let backend = start_backend(backend_app).await;
    let workhorse_url = start_workhorse(test_config(&backend)).await;

    // The declared oid does not match the body.
    let wrong_oid = "a".repeat(64);
    let response = reqwest::Client::new()
        .put(format!(
            "{}/group/project.git/gitlab-lfs/objects/{}/9",
            workhorse_url, wrong_oid
        ))
        .body("BODY DATA")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        !replayed.load(Ordering::SeqCst),
        "a corrupt upload must not be replayed to the backend"
    );
}

#[tokio::test]
async fn info_refs_relays_to_the_alternative_transport_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo_path = fake_repo(dir.path());
    let socket_path = dir.path().join("gitaly.sock");

    let gitaly_app = Router::new().fallback(|request: Request| async move {
        if request.uri().path() == "/projects/1/git-http/info-refs/upload-pack" {
            "0000".into_response()
        } else {
            (StatusCode::NOT_FOUND, "unexpected gitaly path").into_response()
        }
    });
    let unix_listener =
        tokio::net::UnixListener::bind(&socket_path).expect("bind gitaly socket");
    tokio::spawn(async move {
        axum::serve(unix_listener, gitaly_app).await.expect("serve gitaly");
    });

    let socket = socket_path.to_string_lossy().to_string();
    let backend_app = Router::new().fallback(move || {
        let repo_path = repo_path.clone();
        let socket = socket.clone();
        async move {
            envelope_response(serde_json::json!({
                "GL_ID": "user-123",
                "RepoPath": repo_path,
                "GitalySocketPath": socket,
                "GitalyResourcePath": "/projects/1/git-http/info-refs",
            }))
        }
    });
    let backend = start_backend(backend_app).await;
    let workhorse_url = start_workhorse(test_config(&backend)).await;

    let response = reqwest::Client::new()
        .get(format!(
            "{}/gitlab-org/gitlab-test.git/info/refs?service=git-upload-pack",
            workhorse_url
        ))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "0000");
}
