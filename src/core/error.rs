use thiserror::Error;
use std::io;

/// 错误大类，决定重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 非2xx状态、连接失败、超时
    Transport,
    /// 哈希或大小校验失败
    Integrity,
    /// 无法创建目录或写入文件
    Filesystem,
    /// 协作式取消
    Cancellation,
    /// 线程池已停止，提交被拒绝
    PoolRejection,
    /// 参数、配置等不可重试的错误
    Fatal,
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("网络错误: {0}")]
    NetworkError(String),

    #[error("服务器错误: HTTP {0}")]
    ServerError(u16),

    #[error("下载超时")]
    Timeout,

    #[error("IO错误: {0}")]
    IoError(#[from] io::Error),

    #[error("校验和不匹配: 预期 {expected}, 实际 {actual}")]
    ChecksumMismatch {
        expected: String,
        actual: String,
    },

    #[error("文件大小不匹配: 预期 {expected} 字节, 实际 {actual} 字节")]
    SizeMismatch {
        expected: u64,
        actual: u64,
    },

    #[error("下载被取消")]
    Cancelled,

    #[error("线程池已停止，无法提交新任务")]
    PoolStopped,

    #[error("任务执行异常终止")]
    JobAborted,

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("无效的哈希值: {0}")]
    InvalidHash(String),

    #[error("缓存错误: {0}")]
    CacheError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("重试次数超过限制: 共尝试 {attempts} 次, 最后错误: {last_error}")]
    MaxRetriesExceeded {
        attempts: u32,
        last_error: String,
    },
}

impl DownloadError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DownloadError::NetworkError(_)
            | DownloadError::ServerError(_)
            | DownloadError::Timeout => ErrorCategory::Transport,
            DownloadError::ChecksumMismatch { .. } | DownloadError::SizeMismatch { .. } => {
                ErrorCategory::Integrity
            }
            DownloadError::IoError(_) => ErrorCategory::Filesystem,
            DownloadError::Cancelled => ErrorCategory::Cancellation,
            DownloadError::PoolStopped => ErrorCategory::PoolRejection,
            DownloadError::JobAborted
            | DownloadError::InvalidUrl(_)
            | DownloadError::InvalidHash(_)
            | DownloadError::CacheError(_)
            | DownloadError::ConfigError(_)
            | DownloadError::MaxRetriesExceeded { .. } => ErrorCategory::Fatal,
        }
    }

    /// 传输、校验和文件系统错误都视为暂时性错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Integrity | ErrorCategory::Filesystem
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            DownloadError::Timeout
        } else if let Some(status) = error.status() {
            DownloadError::ServerError(status.as_u16())
        } else {
            DownloadError::NetworkError(error.to_string())
        }
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::CacheError(format!("索引序列化失败: {}", error))
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
