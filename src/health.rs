use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::storage::Storage;
use crate::upload::UploadConfig;

#[derive(Serialize)]
pub struct HealthReport {
    status: &'static str,
    upload_dir: String,
    max_file_size: u64,
    allowed_extensions: Vec<String>,
    file_count: usize,
    total_size: u64,
}

/// 健康检查：返回配置限制与当前存储概况。
pub async fn health_check(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
) -> Result<JsonResponse<HealthReport>, ApiError> {
    let files = storage.list_files().await?;
    Ok(JsonResponse(HealthReport {
        status: "healthy",
        upload_dir: storage.root_path().display().to_string(),
        max_file_size: upload.policy.max_file_size(),
        allowed_extensions: upload.policy.allowed_extensions(),
        file_count: files.len(),
        total_size: files.iter().map(|file| file.size).sum(),
    }))
}
