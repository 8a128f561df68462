use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use uuid::Uuid;

/// 下载任务状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskStatus {
    /// 完成、失败、取消都是终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed(_) | TaskStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

/// 协作式取消标记，克隆后共享同一个标志位
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 单个下载请求
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// 由下载管理器分配
    pub id: Uuid,
    pub url: String,
    pub destination: PathBuf,
    /// 期望的内容哈希（十六进制 SHA-1 或 SHA-256）
    pub expected_hash: Option<String>,
    pub expected_size: Option<u64>,
    pub retry_attempts: u32,
    pub error: Option<String>,
    pub cancel: CancellationToken,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::nil(),
            url: url.into(),
            destination: destination.into(),
            expected_hash: None,
            expected_size: None,
            retry_attempts: 0,
            error: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        let hash = hash.into();
        if !hash.trim().is_empty() {
            self.expected_hash = Some(hash.trim().to_lowercase());
        }
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        if size > 0 {
            self.expected_size = Some(size);
        }
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 清单文件中的任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub url: String,
    pub destination: PathBuf,
    #[serde(default, alias = "sha1")]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl From<TaskSpec> for DownloadTask {
    fn from(spec: TaskSpec) -> Self {
        let mut task = DownloadTask::new(spec.url, spec.destination);
        if let Some(hash) = spec.hash {
            task = task.with_hash(hash);
        }
        if let Some(size) = spec.size {
            task = task.with_size(size);
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed("x".to_string()).is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let task = DownloadTask::new("https://example.com/a", "a");
        let copy = task.clone();
        copy.cancel.cancel();
        assert!(task.is_cancelled());
    }

    #[test]
    fn test_task_builder_normalizes_hash() {
        let task = DownloadTask::new("https://example.com/a", "a")
            .with_hash(" ABCDEF ")
            .with_size(0);
        assert_eq!(task.expected_hash.as_deref(), Some("abcdef"));
        assert_eq!(task.expected_size, None);
    }

    #[test]
    fn test_task_spec_accepts_sha1_alias() {
        let json = r#"{"url":"https://example.com/a.jar","destination":"libs/a.jar","sha1":"AA","size":12}"#;
        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        let task = DownloadTask::from(spec);
        assert_eq!(task.expected_hash.as_deref(), Some("aa"));
        assert_eq!(task.expected_size, Some(12));
    }
}
