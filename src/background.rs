//! 清理中断上传遗留的临时文件。

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::config::PARTIAL_CLEAN_INTERVAL_SECS;
use crate::storage::Storage;
use crate::upload::UploadConfig;

/// 启动临时文件定期清理任务；TTL 为 0 时不启动。
pub fn spawn_background_tasks(storage: Arc<Storage>, upload: Arc<UploadConfig>) {
    if upload.partial_ttl.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(PARTIAL_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_partial_files(&storage, upload.partial_ttl).await {
                warn!(error = %err, "partial upload cleanup failed");
            }
        }
    });
}

/// 删除修改时间早于 `ttl` 的临时文件，返回删除数量。
pub async fn cleanup_partial_files(storage: &Storage, ttl: Duration) -> io::Result<usize> {
    let partial_dir = storage.partial_dir();
    let mut dir = match fs::read_dir(&partial_dir).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = dir.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Some(age) = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
        else {
            continue;
        };
        if age < ttl {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = ?path, "removed stale partial upload");
                removed += 1;
            }
            Err(err) => warn!(path = ?path, error = %err, "failed to remove stale partial upload"),
        }
    }
    Ok(removed)
}
