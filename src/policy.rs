//! 上传文件名策略：扩展名/大小校验、重名规避与大小格式化。

use std::collections::BTreeSet;
use std::path::Path;

use crate::storage::{Storage, StorageError};

/// 扩展名白名单与单文件大小上限。
#[derive(Clone, Debug)]
pub struct FilenamePolicy {
    allowed_extensions: BTreeSet<String>,
    max_file_size: u64,
}

/// 校验失败的原因。
#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    ExtensionNotAllowed,
    TooLarge,
}

impl Rejection {
    /// 生成返回给客户端的错误描述。
    pub fn describe(&self, name: &str, size: u64) -> String {
        match self {
            Rejection::ExtensionNotAllowed => format!("File type not allowed: {name}"),
            Rejection::TooLarge => format!("File too large: {name} ({})", format_size(size)),
        }
    }
}

impl FilenamePolicy {
    /// 扩展名统一为小写并补全前导点，空项忽略。
    pub fn new<I, S>(extensions: I, max_file_size: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().to_lowercase())
            .filter(|ext| !ext.is_empty() && ext != ".")
            .map(|ext| {
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{ext}")
                }
            })
            .collect();
        Self {
            allowed_extensions,
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// 按字典序返回白名单。
    pub fn allowed_extensions(&self) -> Vec<String> {
        self.allowed_extensions.iter().cloned().collect()
    }

    /// 大小写不敏感的后缀匹配。
    pub fn is_allowed(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.allowed_extensions
            .iter()
            .any(|ext| lower.ends_with(ext.as_str()))
    }

    pub fn validate(&self, name: &str, size: u64) -> Result<(), Rejection> {
        if !self.is_allowed(name) {
            return Err(Rejection::ExtensionNotAllowed);
        }
        if size > self.max_file_size {
            return Err(Rejection::TooLarge);
        }
        Ok(())
    }

    /// 返回存储根目录下尚未被占用的文件名：`report.pdf` → `report_1.pdf` → `report_2.pdf`。
    ///
    /// 检查与创建不是原子的，调用方需以不覆盖的方式落盘并在冲突时重试。
    pub async fn dedupe(&self, storage: &Storage, name: &str) -> Result<String, StorageError> {
        if !storage.exists(name).await? {
            return Ok(name.to_string());
        }
        let (stem, extension) = split_name(name);
        let mut counter: u64 = 1;
        loop {
            let candidate = format!("{stem}_{counter}{extension}");
            if !storage.exists(&candidate).await? {
                return Ok(candidate);
            }
            counter += 1;
        }
    }
}

/// 客户端上送的文件名只保留最后一个路径分量（兼容 `/` 与 `\`）。
pub fn sanitize_upload_name(raw: &str) -> String {
    raw.rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// 拆分主名与扩展名（扩展名含点）；以点开头的隐藏文件名整体视为主名。
fn split_name(name: &str) -> (&str, &str) {
    let has_extension = Path::new(name).extension().is_some();
    match name.rfind('.') {
        Some(index) if has_extension && index > 0 => name.split_at(index),
        _ => (name, ""),
    }
}

/// 人类可读的文件大小，例如 `1.0 KB`。
pub fn format_size(size: u64) -> String {
    if size == 0 {
        return "0B".to_string();
    }
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
