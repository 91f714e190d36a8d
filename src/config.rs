//! 命令行参数、环境变量与服务器默认配置。

use clap::Parser;
use shadow_rs::formatcp;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use crate::build;
use crate::policy::FilenamePolicy;
use crate::upload::UploadConfig;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_PARTIAL_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 10] = [
    ".txt", ".pdf", ".png", ".jpg", ".jpeg", ".gif", ".zip", ".docx", ".mp4", ".mp3",
];
/// 上传临时文件目录（位于存储根目录内，保证与目标文件同一文件系统）。
pub const PARTIAL_DIR: &str = ".partial";
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_NAME_ATTEMPTS: u32 = 32;
pub const BODY_PREALLOC_LIMIT: u64 = 8 * 1024 * 1024;
pub const PARTIAL_CLEAN_INTERVAL_SECS: u64 = 600;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "snbit-uploader", version = VERSION_INFO, about = "SNBit file upload server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "SNBIT_UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Directory where uploaded files are stored"
    )]
    pub upload_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "SNBIT_HOST",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "SNBIT_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "SNBIT_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single uploaded file in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "SNBIT_MAX_REQUEST_SIZE",
        default_value_t = DEFAULT_MAX_REQUEST_SIZE,
        help = "Max declared Content-Length of an upload request in bytes"
    )]
    pub max_request_size: u64,
    #[arg(
        long,
        env = "SNBIT_ALLOWED_EXTENSIONS",
        value_delimiter = ',',
        default_values_t = DEFAULT_ALLOWED_EXTENSIONS.map(String::from),
        help = "Comma separated list of allowed file extensions"
    )]
    pub allowed_extensions: Vec<String>,
    #[arg(
        long,
        env = "SNBIT_PARTIAL_TTL_SECS",
        default_value_t = DEFAULT_PARTIAL_TTL_SECS,
        help = "Age after which leftover upload temp files are removed (0 to disable)"
    )]
    pub partial_ttl_secs: u64,
}

impl Args {
    /// 由参数构建不可变的上传配置。
    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            policy: FilenamePolicy::new(&self.allowed_extensions, self.max_file_size),
            max_request_size: self.max_request_size,
            partial_ttl: Duration::from_secs(self.partial_ttl_secs),
        }
    }
}

/// 通过 UDP "连接" 探测本机局域网地址（不会发送数据包）。
pub fn detect_network_url(port: u16) -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip: IpAddr = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        return None;
    }
    Some(format!("http://{ip}:{port}"))
}
