//! SNBit Uploader server binary.
//!
//! A small file drop server: clients upload files through a multipart form,
//! list them, download them as attachments and delete them. Every stored file
//! lives directly under one storage root, which is the security boundary for
//! all client supplied names.

mod app;
mod atomic;
mod background;
mod config;
mod error;
mod files;
mod frontend;
mod health;
mod http;
mod logging;
mod multipart;
mod policy;
mod storage;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::app::AccessInfo;
use crate::background::{cleanup_partial_files, spawn_background_tasks};
use crate::config::{Args, SHUTDOWN_GRACE_SECS, detect_network_url};
use crate::policy::format_size;
use crate::storage::Storage;

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::open(PathBuf::from(&args.upload_dir)).await?);
    let upload_config = Arc::new(args.upload_config());
    let access = Arc::new(AccessInfo {
        network_url: detect_network_url(args.port),
    });

    if !upload_config.partial_ttl.is_zero() {
        let removed = cleanup_partial_files(&storage, upload_config.partial_ttl).await?;
        if removed > 0 {
            info!(removed, "removed leftover partial uploads");
        }
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting SNBit Uploader at http://{}", addr);
    info!("📍 Local access: http://localhost:{}", args.port);
    if let Some(url) = access.network_url.as_deref() {
        info!("🌐 Network access: {}", url);
    }
    info!("📁 Upload directory: {}", storage.root_path().display());
    info!(
        "📏 Max file size: {}",
        format_size(upload_config.policy.max_file_size())
    );
    info!(
        "📋 Allowed extensions: {}",
        upload_config.policy.allowed_extensions().join(", ")
    );

    let router = app::build_router(storage.clone(), upload_config.clone(), access);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(storage, upload_config);
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
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

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
