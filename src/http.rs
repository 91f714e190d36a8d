//! HTTP 辅助工具：请求追踪 span、客户端 IP 与安全头。

use axum::body::Body as AxumBody;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::SocketAddr;
use tracing::{Span, info_span};

/// 为每个请求创建携带客户端 IP、方法与路径的 span。
pub fn request_span(request: &Request<AxumBody>) -> Span {
    let client_ip = forwarded_ip(request.headers())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    info_span!(
        env!("CARGO_CRATE_NAME"),
        client_ip,
        method = ?request.method(),
        path = ?request.uri().path(),
    )
}

/// 从 `x-forwarded-for` 取第一个地址。
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}
