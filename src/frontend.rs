//! 嵌入式上传页面与静态资源。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "assets"]
/// 页面只消费 `/api/files` 返回的数据，服务端不拼接 HTML。
pub struct FrontendAssets;

/// 首页。
pub async fn serve_index() -> Result<Response, ApiError> {
    load_embedded_asset("index.html")?.ok_or_else(|| ApiError::NotFound("Not Found".into()))
}

/// 其余 GET 路径：命中嵌入资源则返回，否则 404。
pub async fn serve_asset(req: Request<AxumBody>) -> Result<Response, ApiError> {
    let path = req.uri().path().trim_start_matches('/');
    if path.is_empty() {
        return serve_index().await;
    }
    load_embedded_asset(path)?.ok_or_else(|| ApiError::NotFound("Not Found".into()))
}

fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = FrontendAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok(Some(
        (headers, AxumBody::from(asset.data.into_owned())).into_response(),
    ))
}
