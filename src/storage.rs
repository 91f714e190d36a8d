use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::config::PARTIAL_DIR;
use crate::policy::format_size;

/// 扁平存储根目录；所有客户端给出的文件名都必须经由这里解析。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// 创建（如需）并规范化存储根目录。
    pub async fn open(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 上传临时文件所在目录。
    pub fn partial_dir(&self) -> PathBuf {
        self.root.join(PARTIAL_DIR)
    }

    /// 将客户端文件名解析为根目录下的绝对路径。
    ///
    /// 先做纯词法检查，通过后才访问文件系统；已存在的目标规范化后必须是
    /// 根目录的直接子项（指向根目录外的符号链接因此被拒绝）。返回的始终是
    /// 条目自身的路径，不是链接指向的目标。
    pub async fn resolve(&self, raw_name: &str) -> Result<PathBuf, StorageError> {
        let name = bare_name(raw_name)?;
        let candidate = self.root.join(name);
        match fs::canonicalize(&candidate).await {
            Ok(canonical) => {
                if canonical.parent() != Some(self.root.as_path()) {
                    return Err(StorageError::PathTraversal);
                }
                Ok(candidate)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(candidate),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 判断根目录下是否已存在同名条目（悬空链接也算存在）。
    pub async fn exists(&self, raw_name: &str) -> Result<bool, StorageError> {
        let name = bare_name(raw_name)?;
        match fs::symlink_metadata(self.root.join(name)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 解析并确认目标为普通文件；符号链接与列表一致，视为不存在。
    pub async fn resolve_file(&self, raw_name: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve(raw_name).await?;
        let metadata = fs::symlink_metadata(&target).await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound);
        }
        Ok(target)
    }

    /// 列出根目录下的普通文件，按名称忽略大小写排序。
    pub async fn list_files(&self) -> Result<Vec<StoredFile>, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // 与并发删除竞争时条目可能已消失
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let size = metadata.len();
            let modified = metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(format_timestamp);

            files.push(StoredFile {
                name,
                size,
                size_display: format_size(size),
                modified,
            });
        }

        files.sort_by_key(|file| file.name.to_lowercase());
        Ok(files)
    }

    pub async fn delete_file(&self, raw_name: &str) -> Result<(), StorageError> {
        let target = self.resolve_file(raw_name).await?;
        fs::remove_file(target).await?;
        Ok(())
    }
}

/// 只接受单个普通路径分量。
fn bare_name(raw_name: &str) -> Result<&str, StorageError> {
    if raw_name.is_empty() || raw_name.contains(['/', '\\', '\0']) {
        return Err(StorageError::PathTraversal);
    }
    let mut components = Path::new(raw_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(raw_name),
        _ => Err(StorageError::PathTraversal),
    }
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    PathTraversal,
    NotFound,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound,
            _ => StorageError::Io(err),
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::PathTraversal => f.write_str("path escapes storage root"),
            StorageError::NotFound => f.write_str("file not found"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

/// 存储文件的瞬时投影，每次请求重新计算。
#[derive(Debug, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub size_display: String,
    pub modified: Option<String>,
}
