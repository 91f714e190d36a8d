//! 路由表与中间件装配。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::get;
use axum::{Router, middleware};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::storage::Storage;
use crate::upload::UploadConfig;
use crate::{files, frontend, health, http, upload};

/// 页面展示用的访问地址。
#[derive(Debug, Default)]
pub struct AccessInfo {
    pub network_url: Option<String>,
}

/// 构建完整的路由；配置在此之后不再改变。
pub fn build_router(
    storage: Arc<Storage>,
    upload_config: Arc<UploadConfig>,
    access: Arc<AccessInfo>,
) -> Router {
    Router::new()
        .route(
            "/",
            get(frontend::serve_index)
                .post(upload::upload_files)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/health", get(health::health_check))
        .route("/api/files", get(files::list_files))
        .route("/download/{*name}", get(files::download_file))
        .route("/delete/{*name}", get(files::delete_file))
        .fallback(frontend::serve_asset)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(CatchPanicLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(http::request_span)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(upload_config))
        .layer(Extension(access))
}
