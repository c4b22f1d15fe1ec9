use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use clap::{Parser, ValueEnum};
use url::Url;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const SECRET_LENGTH: usize = 32;

#[derive(Debug, Parser)]
#[command(name = "workhorse", disable_version_flag = true)]
#[command(about = "Smart reverse proxy between an HTTP edge proxy and a git-hosting backend")]
pub struct Args {
    /// Address or socket path to listen on
    #[arg(long, default_value = "localhost:8181")]
    pub listen_addr: String,

    /// Listener network family
    #[arg(long, value_enum, default_value_t = ListenNetwork::Tcp)]
    pub listen_network: ListenNetwork,

    /// Umask applied while binding a Unix socket, in octal
    #[arg(long, default_value = "022")]
    pub listen_umask: String,

    /// URL of the authoritative backend application server
    #[arg(long, default_value = "http://localhost:8080")]
    pub auth_backend: String,

    /// Optional Unix socket to dial the backend at instead of TCP
    #[arg(long)]
    pub auth_socket: Option<PathBuf>,

    /// Directory served for static file requests
    #[arg(long)]
    pub document_root: Option<PathBuf>,

    /// Seconds to wait for response headers from the backend
    #[arg(long, default_value_t = 5 * 60)]
    pub proxy_headers_timeout: u64,

    /// File holding the base64-encoded secret used to sign subrequests
    #[arg(long)]
    pub secret_path: Option<PathBuf>,

    /// Maximum concurrent API requests, 0 disables the limiter
    #[arg(long, default_value_t = 0)]
    pub api_limit: usize,

    /// Maximum queued API requests once the limit is reached
    #[arg(long, default_value_t = 0)]
    pub api_queue_limit: usize,

    /// Seconds an API request may wait in the queue
    #[arg(long, default_value_t = 30)]
    pub api_queue_duration: u64,

    /// Address for the Prometheus text exposition listener
    #[arg(long)]
    pub prometheus_listen_addr: Option<SocketAddr>,

    /// Relax restrictions meant for production deployments
    #[arg(long)]
    pub development: bool,

    /// Print the version and exit
    #[arg(long)]
    pub version: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListenNetwork {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub listen_network: ListenNetwork,
    pub listen_umask: u32,
    pub backend: Url,
    pub auth_socket: Option<PathBuf>,
    pub document_root: Option<PathBuf>,
    pub proxy_headers_timeout: Duration,
    pub secret: Option<Vec<u8>>,
    pub api_limit: usize,
    pub api_queue_limit: usize,
    pub api_queue_duration: Duration,
    pub prometheus_listen_addr: Option<SocketAddr>,
    pub development: bool,
    pub version: String,
    /// Helper binary spawned by the artifacts-entry injector. Resolved on
    /// PATH in production; tests point it at the freshly built executable.
    pub zip_cat_bin: String,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, StartupError> {
        let backend = Url::parse(args.auth_backend.trim()).map_err(|_| StartupError {
            code: "ERR_INVALID_BACKEND_URL",
            message: format!("auth-backend {:?} is not a valid URL", args.auth_backend),
        })?;
        if backend.scheme() != "http" && backend.scheme() != "https" {
            return Err(StartupError {
                code: "ERR_INVALID_BACKEND_URL",
                message: format!("auth-backend scheme {:?} is not supported", backend.scheme()),
            });
        }

        let listen_umask = u32::from_str_radix(args.listen_umask.trim(), 8).map_err(|_| {
            StartupError {
                code: "ERR_INVALID_UMASK",
                message: format!("listen-umask {:?} is not an octal mode", args.listen_umask),
            }
        })?;

        let secret = match &args.secret_path {
            None => None,
            Some(path) => Some(load_secret(path)?),
        };

        if let Some(document_root) = &args.document_root {
            if !document_root.is_dir() {
                return Err(StartupError {
                    code: "ERR_INVALID_DOCUMENT_ROOT",
                    message: format!("document-root {:?} is not a directory", document_root),
                });
            }
        }

        Ok(Self {
            listen_addr: args.listen_addr.clone(),
            listen_network: args.listen_network,
            listen_umask,
            backend,
            auth_socket: args.auth_socket.clone(),
            document_root: args.document_root.clone(),
            proxy_headers_timeout: Duration::from_secs(args.proxy_headers_timeout),
            secret,
            api_limit: args.api_limit,
            api_queue_limit: args.api_queue_limit,
            api_queue_duration: Duration::from_secs(args.api_queue_duration),
            prometheus_listen_addr: args.prometheus_listen_addr,
            development: args.development,
            version: VERSION.to_string(),
            zip_cat_bin: "gitlab-zip-cat".to_string(),
        })
    }
}

fn load_secret(path: &PathBuf) -> Result<Vec<u8>, StartupError> {
    let encoded = std::fs::read_to_string(path).map_err(|err| StartupError {
        code: "ERR_SECRET_UNREADABLE",
        message: format!("failed to read secret file {:?}: {}", path, err),
    })?;
    let secret = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| StartupError {
            code: "ERR_SECRET_INVALID",
            message: format!("secret file {:?} is not valid base64", path),
        })?;
    if secret.len() != SECRET_LENGTH {
        return Err(StartupError {
            code: "ERR_SECRET_INVALID",
            message: format!(
                "secret must decode to {} bytes, got {}",
                SECRET_LENGTH,
                secret.len()
            ),
        });
    }
    Ok(secret)
}
