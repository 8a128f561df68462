//! `task` 模块包含了与单个下载任务相关的所有逻辑
//!
//! 主要包括：
//! - `state`: 任务描述 `DownloadTask` 与状态 `TaskStatus`
//! - `transport`: 网络传输抽象及 HTTP 实现
//! - `download`: 带重试、限速和校验的传输执行器
//! - `retry`: 重试逻辑
//! - `util`: 工具类，如 `BufferManager`、哈希计算

pub mod download;
pub mod retry;
pub mod state;
pub mod transport;
pub mod util;

// 导出核心组件，方便外部使用
pub use download::{ProgressSample, TransferExecutor};
pub use retry::{RetryContext, RetryStats, RetryStrategy};
pub use state::{CancellationToken, DownloadTask, TaskSpec, TaskStatus};
pub use transport::{ChunkControl, ChunkSink, HttpTransport, Transport};
pub use util::{BufferManager, HashAlgorithm, SpeedLimiter};
