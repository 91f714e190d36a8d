//! 文件列表、下载与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::app::AccessInfo;
use crate::config::DOWNLOAD_CHUNK_SIZE;
use crate::error::ApiError;
use crate::policy::format_size;
use crate::storage::{Storage, StoredFile};
use crate::upload::UploadConfig;

/// 页面渲染所需的列表数据。
#[derive(Serialize)]
pub struct FileListing {
    files: Vec<StoredFile>,
    count: usize,
    total_size: u64,
    max_file_size: u64,
    max_file_size_display: String,
    allowed_extensions: Vec<String>,
    network_url: Option<String>,
}

/// 列出存储目录中的文件。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    Extension(access): Extension<Arc<AccessInfo>>,
) -> Result<JsonResponse<FileListing>, ApiError> {
    let files = storage.list_files().await?;
    let total_size = files.iter().map(|file| file.size).sum();
    info!(count = files.len(), "list files");
    Ok(JsonResponse(FileListing {
        count: files.len(),
        files,
        total_size,
        max_file_size: upload.policy.max_file_size(),
        max_file_size_display: format_size(upload.policy.max_file_size()),
        allowed_extensions: upload.policy.allowed_extensions(),
        network_url: access.network_url.clone(),
    }))
}

/// 以固定大小分块流式下载文件。
pub async fn download_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_file(&name).await?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let file_size = metadata.len();
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    response_headers.insert(header::CONTENT_DISPOSITION, attachment_header(&name)?);
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build header".into()))?,
        );
    }

    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(name, size = file_size, "download file");
    let stream = ReaderStream::with_capacity(file, DOWNLOAD_CHUNK_SIZE);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 删除文件后重定向回首页。
pub async fn delete_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    storage.delete_file(&name).await?;
    info!(name, "file deleted");
    Ok((StatusCode::FOUND, [(header::LOCATION, "/")]).into_response())
}

/// `attachment` 头：ASCII 回退名加 RFC 5987 的 UTF-8 编码名。
fn attachment_header(name: &str) -> Result<HeaderValue, ApiError> {
    let fallback: String = name
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii_graphic() || ch == ' ' => ch,
            _ => '_',
        })
        .collect();
    let value = if fallback == name {
        format!("attachment; filename=\"{name}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(name)
        )
    };
    HeaderValue::from_str(&value).map_err(|_| ApiError::Internal("failed to build header".into()))
}
