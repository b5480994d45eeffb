pub mod shutdown;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::TextEncoder;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tracing::info;
use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

use brook_rpc::config::{config, LogConfig, LogFormat};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_log::LogTracer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn init_logging(name: &str) -> Option<WorkerGuard> {
    init_logging_with_filter(
        name,
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    )
}

type BoxedLayer = Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>;

fn format_layer(logging: &LogConfig, writer: BoxMakeWriter) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_line_number(logging.enable_file_line)
        .with_file(logging.enable_file_name);

    match logging.format {
        LogFormat::Plaintext => layer.boxed(),
        LogFormat::Logfmt => layer
            .event_format(tracing_logfmt::EventsFormatter::default())
            .fmt_fields(tracing_logfmt::FieldsFormatter::default())
            .boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Installs the global tracing subscriber according to the `logging` config section. The
/// returned guard must be held for as long as the process logs when nonblocking output is on.
pub fn init_logging_with_filter(name: &str, filter: EnvFilter) -> Option<WorkerGuard> {
    if let Err(e) = LogTracer::init() {
        eprintln!("Failed to initialize log tracer {:?}", e);
    }

    let config = config();
    let logging = &config.logging;

    let (writer, guard) = if logging.nonblocking {
        let (nonblocking, guard) = NonBlockingBuilder::default()
            .buffered_lines_limit(logging.buffered_lines_limit)
            .finish(std::io::stderr());
        (BoxMakeWriter::new(nonblocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let subscriber = Registry::default().with(format_layer(logging, writer).with_filter(filter));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set global log subscriber {:?}", e);
        return guard;
    }

    std::panic::set_hook(Box::new(|panic| match panic.location() {
        Some(location) => tracing::error!(
            message = %panic,
            panic.file = location.file(),
            panic.line = location.line(),
            panic.column = location.column(),
        ),
        None => tracing::error!(message = %panic),
    }));

    info!(message = "logging initialized", service = name, version = VERSION);

    guard
}

struct AdminState {
    name: String,
}

async fn root(State(state): State<Arc<AdminState>>) -> String {
    format!("{}\n", state.name)
}

async fn status() -> String {
    "ok".to_string()
}

async fn metrics() -> Result<Bytes, StatusCode> {
    let encoder = TextEncoder::new();
    let registry = prometheus::default_registry();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(s) => Ok(Bytes::from(s)),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn config_route() -> Result<String, StatusCode> {
    serde_json::to_string_pretty(&*config()).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn details(State(state): State<Arc<AdminState>>) -> String {
    json!({
        "service": state.name,
        "version": VERSION,
    })
    .to_string()
}

fn admin_router(service: &str) -> Router {
    let state = Arc::new(AdminState {
        name: format!("brook-{}", service),
    });

    Router::new()
        .route("/status", get(status))
        .route("/name", get(root))
        .route("/metrics", get(metrics))
        .route("/details", get(details))
        .route("/config", get(config_route))
        .with_state(state)
}

/// Serves the admin endpoints until `token` is cancelled.
pub async fn start_admin_server(service: &str, token: CancellationToken) -> anyhow::Result<()> {
    let addr = config().admin.bind_address;
    let port = config().admin.http_port;

    info!("Starting {} admin server on {}:{}", service, addr, port);

    let listener = TcpListener::bind(SocketAddr::new(addr, port))
        .await
        .with_context(|| format!("failed to bind admin server to {}:{}", addr, port))?;

    axum::serve(listener, admin_router(service))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("Failed to start admin HTTP server")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let counter = prometheus::register_int_counter!(
            "brook_admin_test_counter",
            "counter used by the admin tests"
        )
        .unwrap();
        counter.inc();

        let body = metrics().await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("brook_admin_test_counter 1"));
    }

    #[tokio::test]
    async fn test_status_and_name() {
        assert_eq!(status().await, "ok");
        let state = Arc::new(AdminState {
            name: "brook-test".to_string(),
        });
        assert_eq!(root(State(state)).await, "brook-test\n");
    }
}
