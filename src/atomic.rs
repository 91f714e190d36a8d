//! 上传落盘：先写临时文件，再以不覆盖的方式发布到最终文件名。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 尚未发布的上传临时文件；未提交即被丢弃时自动删除。
pub struct PartialFile {
    temp_path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl PartialFile {
    /// 在临时目录中创建新的临时文件。
    pub async fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let temp_path = dir.join(format!("{}.part", Uuid::new_v4()));
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        Ok(Self {
            temp_path,
            file: Some(file),
            committed: false,
        })
    }

    /// 写入全部内容并落盘同步。
    pub async fn write_all(&mut self, content: &[u8]) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("partial file already closed"));
        };
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await
    }

    /// 以硬链接发布到 `target`；目标已存在时返回 `AlreadyExists`，临时文件保留以便换名重试。
    pub async fn publish(&mut self, target: &Path) -> io::Result<()> {
        self.file.take();
        fs::hard_link(&self.temp_path, target).await?;
        self.committed = true;
        if let Err(err) = fs::remove_file(&self.temp_path).await {
            tracing::warn!(path = ?self.temp_path, error = %err, "failed to remove temp file");
        }
        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 放弃并清理临时文件。
    pub async fn discard(mut self) {
        self.file.take();
        if fs::remove_file(&self.temp_path).await.is_ok() {
            self.committed = true;
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
