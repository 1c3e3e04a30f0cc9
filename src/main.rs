//! Crash report intake server.
//!
//! Accepts multipart crash report uploads (a minidump plus optional log
//! files and free-form fields), assigns each report a sequential id and
//! stores it under `<uploads_dir>/<id>/`. The id is returned to the client
//! as `ccr-<id>`.

mod atomic;
mod background;
mod config;
mod counter;
mod error;
mod http;
mod intake;
mod logging;
mod report;
mod storage;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::intake::IntakeConfig;
use crate::storage::ReportStore;

shadow!(build);

/// Starts the intake server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let store = Arc::new(ReportStore::new(
        PathBuf::from(&args.uploads_dir),
        args.min_uploader_build,
    ));
    store.ensure_root().await?;
    let intake = Arc::new(IntakeConfig {
        trust_forwarded_for: args.trust_forwarded_for,
    });
    match store.counter().current().await {
        Ok(last) => info!(last_report_id = last, "report counter loaded"),
        Err(err) => warn!(error = %err, "report counter unreadable, submissions will fail"),
    }
    if let Some(minimum) = args.min_uploader_build {
        info!(minimum, "uploader version gate enabled");
    }

    let app = build_app(store.clone(), intake, args.max_upload_size);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        uploads_dir = %store.root_path().display(),
        "Starting crash report intake at {}", addr
    );

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(store, Duration::from_secs(args.incoming_ttl_secs));
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// Routes, body limit and middleware shared by the server and the tests.
pub(crate) fn build_app(
    store: Arc<ReportStore>,
    intake: Arc<IntakeConfig>,
    max_upload_size: usize,
) -> Router {
    Router::new()
        .route("/addreport.php", post(intake::submit_report))
        .route("/api/reports", post(intake::submit_report))
        .route("/api/version", get(version::get_version_info))
        .layer(DefaultBodyLimit::max(max_upload_size))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(store))
        .layer(Extension(intake))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
