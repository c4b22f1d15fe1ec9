use std::net::SocketAddr;

use axum::Router;
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use workhorse::config::{Args, Config, ListenNetwork, VERSION};
use workhorse::{errors, http, metrics};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.version {
        println!("workhorse {}", VERSION);
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(2);
        }
    };

    errors::init_reporting(std::env::var("GITLAB_WORKHORSE_SENTRY_DSN").ok().as_deref());
    if config.development {
        tracing::info!("workhorse.development_mode");
    }

    let app = match http::router(config.clone()) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    if let Some(addr) = config.prometheus_listen_addr {
        tokio::spawn(serve_metrics(addr));
    }

    match config.listen_network {
        ListenNetwork::Unix => serve_unix(&config, app).await,
        _ => serve_tcp(&config, app).await,
    }
}

async fn serve_tcp(config: &Config, app: Router) {
    let listener = match bind_tcp(config).await {
        Ok(listener) => listener,
        Err(message) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED {}", message);
            std::process::exit(1);
        }
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        backend = %config.backend,
        "workhorse listening"
    );

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        std::process::exit(1);
    }
}

async fn bind_tcp(config: &Config) -> Result<TcpListener, String> {
    let mut candidates = tokio::net::lookup_host(&config.listen_addr)
        .await
        .map_err(|err| format!("resolve {}: {}", config.listen_addr, err))?;
    let address = candidates
        .find(|addr| match config.listen_network {
            ListenNetwork::Tcp4 => addr.is_ipv4(),
            ListenNetwork::Tcp6 => addr.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| {
            format!(
                "{} does not resolve to a usable {:?} address",
                config.listen_addr, config.listen_network
            )
        })?;
    TcpListener::bind(address)
        .await
        .map_err(|err| format!("bind {}: {}", address, err))
}

async fn serve_unix(config: &Config, app: Router) {
    // A stale socket from a previous run would make bind fail.
    let _ = std::fs::remove_file(&config.listen_addr);

    let previous = unsafe { libc::umask(config.listen_umask as libc::mode_t) };
    let listener = UnixListener::bind(&config.listen_addr);
    unsafe {
        libc::umask(previous);
    }
    let listener = match listener {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED {}: {}", config.listen_addr, err);
            std::process::exit(1);
        }
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        backend = %config.backend,
        "workhorse listening on unix socket"
    );

    if let Err(err) = axum::serve(listener, app.into_make_service()).await {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        std::process::exit(1);
    }
}

async fn serve_metrics(addr: SocketAddr) {
    use axum::response::IntoResponse;
    use axum::routing::get;

    async fn render() -> axum::response::Response {
        match metrics::render() {
            Ok((buffer, content_type)) => {
                ([(axum::http::header::CONTENT_TYPE, content_type)], buffer).into_response()
            }
            Err(err) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
                .into_response(),
        }
    }

    let app = Router::new().route("/metrics", get(render));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            tracing::info!(prometheus_addr = %addr, "workhorse metrics listening");
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "workhorse.metrics_listener_failed");
            }
        }
        Err(err) => {
            tracing::error!(error = %err, prometheus_addr = %addr, "workhorse.metrics_bind_failed");
        }
    }
}
