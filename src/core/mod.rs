//! Core: 线程池、内容寻址缓存、传输执行器与下载管理器

pub mod cache;
pub mod error;
pub mod manager;
pub mod pool;
pub mod task;

pub use cache::{CacheStats, CacheStore, CompressionPolicy};
pub use error::{DownloadError, DownloadResult, ErrorCategory};
pub use manager::{
    DownloadEvent, DownloadManager, OverallProgress, TaskOutcome, TaskProgress,
};
pub use pool::{JobHandle, WorkerPool};
pub use task::{DownloadTask, TaskSpec, TaskStatus};
