//! multipart 上传处理器：逐个文件校验、去重命名并落盘。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::atomic::PartialFile;
use crate::config::{BODY_PREALLOC_LIMIT, MAX_NAME_ATTEMPTS};
use crate::error::ApiError;
use crate::multipart::{self, FilePart};
use crate::policy::{FilenamePolicy, format_size, sanitize_upload_name};
use crate::storage::{Storage, StorageError};

#[derive(Debug)]
pub struct UploadConfig {
    pub policy: FilenamePolicy,
    pub max_request_size: u64,
    pub partial_ttl: Duration,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub uploaded: Vec<String>,
    pub errors: Vec<String>,
    pub message: String,
}

/// 单个文件的处理结果。
#[derive(Debug)]
pub struct UploadOutcome {
    pub original_name: String,
    pub final_name: Option<String>,
    pub status: OutcomeStatus,
}

#[derive(Debug)]
pub enum OutcomeStatus {
    Saved,
    Rejected(String),
}

impl UploadResponse {
    fn from_outcomes(outcomes: Vec<UploadOutcome>) -> Self {
        let mut uploaded = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Saved => {
                    if let Some(final_name) = outcome.final_name {
                        if final_name != outcome.original_name {
                            debug!(
                                original = outcome.original_name,
                                stored = final_name,
                                "upload stored under a different name"
                            );
                        }
                        uploaded.push(final_name);
                    }
                }
                OutcomeStatus::Rejected(reason) => errors.push(reason),
            }
        }
        let mut message = format!("Uploaded {} files", uploaded.len());
        if !errors.is_empty() {
            message.push_str(&format!(", {} errors", errors.len()));
        }
        Self {
            success: !uploaded.is_empty(),
            uploaded,
            errors,
            message,
        }
    }

    fn status_code(&self) -> StatusCode {
        if self.errors.is_empty() {
            StatusCode::OK
        } else {
            StatusCode::MULTI_STATUS
        }
    }
}

/// 接收 multipart 请求体并保存其中的所有文件；部分失败返回 207。
pub async fn upload_files(
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !multipart::is_form_data(content_type) {
        return Err(ApiError::BadRequest("Invalid content type".into()));
    }
    let boundary = multipart::parse_boundary(content_type)
        .ok_or_else(|| ApiError::BadRequest("No boundary found".into()))?;

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);
    if content_length == 0 {
        return Err(ApiError::BadRequest("No content".into()));
    }
    if upload.max_request_size > 0 && content_length > upload.max_request_size {
        return Err(ApiError::PayloadTooLarge(format!(
            "request body exceeds {}",
            format_size(upload.max_request_size)
        )));
    }

    let body = read_body(body, content_length).await?;
    let parts = multipart::parse(&body, &boundary);
    debug!(
        bytes = body.len(),
        parts = parts.len(),
        "multipart body parsed"
    );

    let mut outcomes = Vec::with_capacity(parts.len());
    for part in parts {
        outcomes.push(process_part(&storage, &upload.policy, part).await);
    }

    let response = UploadResponse::from_outcomes(outcomes);
    info!(
        uploaded = response.uploaded.len(),
        errors = response.errors.len(),
        "upload request finished"
    );
    Ok((response.status_code(), JsonResponse(response)).into_response())
}

/// 按声明长度读取完整请求体；连接中断或长度不符时整个请求失败。
async fn read_body(body: AxumBody, content_length: u64) -> Result<Bytes, ApiError> {
    let capacity = usize::try_from(content_length.min(BODY_PREALLOC_LIMIT))
        .map_err(|_| ApiError::PayloadTooLarge("request body too large".into()))?;
    let mut buffer = BytesMut::with_capacity(capacity);
    let mut data_stream = BodyExt::into_data_stream(body);
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| {
            warn!(error = %err, "upload body read aborted");
            ApiError::BadRequest("failed to read request body".into())
        })?;
        if (buffer.len() + chunk.len()) as u64 > content_length {
            return Err(ApiError::BadRequest(
                "request body longer than Content-Length".into(),
            ));
        }
        buffer.extend_from_slice(&chunk);
    }
    if buffer.len() as u64 != content_length {
        return Err(ApiError::BadRequest(
            "request body shorter than Content-Length".into(),
        ));
    }
    Ok(buffer.freeze())
}

async fn process_part(storage: &Storage, policy: &FilenamePolicy, part: FilePart) -> UploadOutcome {
    let name = sanitize_upload_name(&part.filename);
    let size = part.content.len() as u64;
    let rejected = |reason: String| UploadOutcome {
        original_name: part.filename.clone(),
        final_name: None,
        status: OutcomeStatus::Rejected(reason),
    };

    if let Err(rejection) = policy.validate(&name, size) {
        let reason = rejection.describe(&name, size);
        warn!(field = ?part.field_name, name, size, reason, "upload rejected");
        return rejected(reason);
    }

    match persist(storage, policy, &name, &part.content).await {
        Ok(final_name) => {
            info!(
                name = final_name,
                size = format_size(size),
                "file uploaded"
            );
            UploadOutcome {
                original_name: part.filename.clone(),
                final_name: Some(final_name),
                status: OutcomeStatus::Saved,
            }
        }
        Err(err) => {
            warn!(name, error = %err, "failed to save upload");
            rejected(format!("Error saving {name}: {err}"))
        }
    }
}

/// 写入临时文件后选取空闲文件名发布；名称被并发占用时重新去重。
async fn persist(
    storage: &Storage,
    policy: &FilenamePolicy,
    name: &str,
    content: &[u8],
) -> Result<String, StorageError> {
    let mut partial = PartialFile::create(&storage.partial_dir()).await?;
    partial.write_all(content).await?;

    for _ in 0..MAX_NAME_ATTEMPTS {
        let final_name = policy.dedupe(storage, name).await?;
        let target = storage.resolve(&final_name).await?;
        match partial.publish(&target).await {
            Ok(()) => return Ok(final_name),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(name = final_name, "name taken concurrently, retrying");
            }
            Err(err) => {
                partial.discard().await;
                return Err(StorageError::Io(err));
            }
        }
    }

    partial.discard().await;
    Err(StorageError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free file name available",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use tokio::fs;

    use crate::config::{DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_MAX_FILE_SIZE};

    async fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(PathBuf::from(temp.path()).join("uploads"))
            .await
            .expect("open storage");
        (temp, Arc::new(storage))
    }

    fn make_upload_config(max_file_size: u64) -> Arc<UploadConfig> {
        Arc::new(UploadConfig {
            policy: FilenamePolicy::new(DEFAULT_ALLOWED_EXTENSIONS, max_file_size),
            max_request_size: 1024 * 1024,
            partial_ttl: Duration::from_secs(60),
        })
    }

    fn multipart_body(boundary: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, content) in files {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    fn multipart_headers(boundary: &str, length: usize) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
                .expect("content type"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        headers
    }

    async fn send(
        storage: &Arc<Storage>,
        upload: &Arc<UploadConfig>,
        files: &[(&str, &str)],
    ) -> (StatusCode, serde_json::Value) {
        let body = multipart_body("X", files);
        let response = upload_files(
            multipart_headers("X", body.len()),
            Extension(storage.clone()),
            Extension(upload.clone()),
            AxumBody::from(body),
        )
        .await
        .unwrap_or_else(|_| panic!("upload request failed"));
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn upload_single_file_succeeds() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        let (status, json) = send(&storage, &upload, &[("note.txt", "hello")]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["uploaded"], serde_json::json!(["note.txt"]));
        assert_eq!(json["errors"], serde_json::json!([]));
        assert_eq!(json["message"], "Uploaded 1 files");
        let stored = fs::read(storage.root_path().join("note.txt"))
            .await
            .expect("read stored");
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn disallowed_extension_is_rejected_without_writing() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        let (status, json) = send(&storage, &upload, &[("virus.exe", "MZ")]).await;

        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(json["success"], false);
        assert_eq!(
            json["errors"],
            serde_json::json!(["File type not allowed: virus.exe"])
        );
        assert!(storage.list_files().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn partial_success_reports_each_file() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(4);

        let (status, json) = send(
            &storage,
            &upload,
            &[("ok.txt", "fine"), ("big.txt", "too big"), ("x.bat", "1")],
        )
        .await;

        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(json["success"], true);
        assert_eq!(json["uploaded"], serde_json::json!(["ok.txt"]));
        assert_eq!(
            json["errors"],
            serde_json::json!([
                "File too large: big.txt (7.0 B)",
                "File type not allowed: x.bat"
            ])
        );
        assert_eq!(json["message"], "Uploaded 1 files, 2 errors");
    }

    #[tokio::test]
    async fn repeated_uploads_get_numbered_names() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        let mut names = Vec::new();
        for round in 0..3 {
            let content = format!("round {round}");
            let (_, json) = send(&storage, &upload, &[("report.pdf", content.as_str())]).await;
            names.push(json["uploaded"][0].as_str().expect("name").to_string());
        }

        assert_eq!(names, ["report.pdf", "report_1.pdf", "report_2.pdf"]);
        let stored = fs::read(storage.root_path().join("report_2.pdf"))
            .await
            .expect("read");
        assert_eq!(stored, b"round 2");
    }

    #[tokio::test]
    async fn client_directories_are_stripped_from_names() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        let (_, json) = send(&storage, &upload, &[("../../evil.txt", "x")]).await;

        assert_eq!(json["uploaded"], serde_json::json!(["evil.txt"]));
        assert!(storage.root_path().join("evil.txt").exists());
        assert!(!storage.root_path().join("../evil.txt").exists());
    }

    #[tokio::test]
    async fn temp_directory_is_left_empty() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        send(&storage, &upload, &[("a.txt", "a"), ("b.png", "b")]).await;

        let leftovers = std::fs::read_dir(storage.partial_dir())
            .expect("partial dir")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn save_failure_is_reported_per_file() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);
        // 临时目录位置被普通文件占用，所有落盘都会失败
        std::fs::write(storage.partial_dir(), b"not a directory").expect("block partial dir");

        let (status, json) = send(
            &storage,
            &upload,
            &[("ok.txt", "fine"), ("x.exe", "1"), ("b.txt", "b")],
        )
        .await;

        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(json["success"], false);
        assert_eq!(json["uploaded"], serde_json::json!([]));
        let errors: Vec<&str> = json["errors"]
            .as_array()
            .expect("errors")
            .iter()
            .map(|value| value.as_str().expect("error string"))
            .collect();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].starts_with("Error saving ok.txt: "), "{errors:?}");
        assert_eq!(errors[1], "File type not allowed: x.exe");
        assert!(errors[2].starts_with("Error saving b.txt: "), "{errors:?}");
        assert_eq!(json["message"], "Uploaded 0 files, 3 errors");
        assert!(storage.list_files().await.expect("list").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_name_uploads_never_overwrite() {
        const UPLOADS: usize = 16;
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        let mut tasks = Vec::with_capacity(UPLOADS);
        for index in 0..UPLOADS {
            let storage = storage.clone();
            let upload = upload.clone();
            tasks.push(tokio::spawn(async move {
                let content = format!("upload {index}");
                send(&storage, &upload, &[("same.pdf", content.as_str())]).await
            }));
        }

        let mut names = std::collections::BTreeSet::new();
        for task in tasks {
            let (status, json) = task.await.expect("upload task");
            assert_eq!(status, StatusCode::OK);
            names.insert(json["uploaded"][0].as_str().expect("name").to_string());
        }

        assert_eq!(names.len(), UPLOADS);
        assert!(names.contains("same.pdf"));
        let stored = storage.list_files().await.expect("list");
        assert_eq!(stored.len(), UPLOADS);
        let mut contents = std::collections::BTreeSet::new();
        for file in &stored {
            let content = fs::read(storage.root_path().join(&file.name))
                .await
                .expect("read");
            contents.insert(content);
        }
        assert_eq!(contents.len(), UPLOADS);
    }

    #[tokio::test]
    async fn non_multipart_request_is_rejected() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2"));

        let result = upload_files(
            headers,
            Extension(storage),
            Extension(upload),
            AxumBody::from("{}"),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn missing_boundary_or_empty_body_is_rejected() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("4"));
        let result = upload_files(
            headers,
            Extension(storage.clone()),
            Extension(upload.clone()),
            AxumBody::from("abcd"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = upload_files(
            multipart_headers("X", 0),
            Extension(storage),
            Extension(upload),
            AxumBody::empty(),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn oversized_request_is_refused_before_reading() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);

        let result = upload_files(
            multipart_headers("X", 2 * 1024 * 1024),
            Extension(storage),
            Extension(upload),
            AxumBody::from("ignored"),
        )
        .await;

        assert!(matches!(result, Err(ApiError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn short_body_aborts_request() {
        let (_temp, storage) = make_storage().await;
        let upload = make_upload_config(DEFAULT_MAX_FILE_SIZE);
        let body = multipart_body("X", &[("note.txt", "hello")]);

        let result = upload_files(
            multipart_headers("X", body.len() + 10),
            Extension(storage.clone()),
            Extension(upload),
            AxumBody::from(body),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(storage.list_files().await.expect("list").is_empty());
    }
}
