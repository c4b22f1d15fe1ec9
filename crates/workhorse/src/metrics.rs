use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static PREAUTH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SENDDATA_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static GIT_COMMANDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ARCHIVE_CACHE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("workhorse_http_requests_total", "Workhorse HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create workhorse_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "workhorse_http_request_duration_seconds",
                    "Time until the response headers were produced, in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method"],
            )
            .expect("create workhorse_http_request_duration_seconds"),
        )
    })
}

fn preauth_total() -> &'static IntCounterVec {
    PREAUTH_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "workhorse_preauth_total",
                    "Pre-authorization subrequest outcomes.",
                ),
                &["outcome"],
            )
            .expect("create workhorse_preauth_total"),
        )
    })
}

fn senddata_total() -> &'static IntCounterVec {
    SENDDATA_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "workhorse_senddata_injections_total",
                    "Send-data directives decoded, by scheme.",
                ),
                &["scheme"],
            )
            .expect("create workhorse_senddata_injections_total"),
        )
    })
}

fn git_commands_total() -> &'static IntCounterVec {
    GIT_COMMANDS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "workhorse_git_commands_total",
                    "Repository tooling subprocesses spawned.",
                ),
                &["command"],
            )
            .expect("create workhorse_git_commands_total"),
        )
    })
}

fn archive_cache_total() -> &'static IntCounterVec {
    ARCHIVE_CACHE_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "workhorse_archive_cache_total",
                    "Archive cache lookups by result.",
                ),
                &["result"],
            )
            .expect("create workhorse_archive_cache_total"),
        )
    })
}

fn errors_total() -> &'static IntCounterVec {
    ERRORS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("workhorse_errors_total", "Errors observed, by handler."),
                &["what", "reported"],
            )
            .expect("create workhorse_errors_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status.as_str()])
        .inc();
    http_request_duration_seconds()
        .with_label_values(&[route, method])
        .observe(duration.as_secs_f64());
}

pub fn observe_preauth(outcome: &str) {
    preauth_total().with_label_values(&[outcome]).inc();
}

pub fn observe_senddata(scheme: &str) {
    senddata_total().with_label_values(&[scheme]).inc();
}

pub fn observe_git_command(command: &str) {
    git_commands_total().with_label_values(&[command]).inc();
}

pub fn observe_archive_cache(result: &str) {
    archive_cache_total().with_label_values(&[result]).inc();
}

pub fn observe_error(what: &str, reported: bool) {
    let reported = if reported { "true" } else { "false" };
    errors_total().with_label_values(&[what, reported]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
