//! 传输执行器
//!
//! 对单个任务执行一次带重试的下载：逐块写入目标文件、上报进度、
//! 粗粒度限速，完成后校验大小和哈希，并把结果登记进缓存。

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::core::cache::CacheStore;
use crate::core::error::DownloadError;
use super::retry::{RetryContext, RetryStrategy};
use super::state::{CancellationToken, DownloadTask};
use super::transport::{ChunkControl, ChunkSink, Transport};
use super::util::{verify_file_hash, BufferManager, SpeedLimiter};

/// 暂停期间轮询暂停标志的间隔
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// 单次进度采样
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub downloaded: u64,
    pub total: Option<u64>,
    /// 本次尝试开始以来的平均速度（字节/秒）
    pub speed: f64,
}

pub struct TransferExecutor {
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore>,
    retry: RetryStrategy,
    verify_checksums: bool,
    limiter: SpeedLimiter,
}

impl TransferExecutor {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<CacheStore>, retry: RetryStrategy) -> Self {
        Self {
            transport,
            cache,
            retry,
            verify_checksums: true,
            limiter: SpeedLimiter::default(),
        }
    }

    pub fn from_config(config: &Config, transport: Arc<dyn Transport>, cache: Arc<CacheStore>) -> Self {
        let retry = RetryStrategy::new(
            config.retry_count,
            Duration::from_millis(config.retry_delay_ms),
        )
        .with_jitter(config.retry_jitter);

        Self::new(transport, cache, retry)
            .with_verify_checksums(config.verify_checksums)
            .with_limiter(SpeedLimiter::new(config.speed_limit_kb * 1024))
    }

    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn with_limiter(mut self, limiter: SpeedLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn limiter(&self) -> &SpeedLimiter {
        &self.limiter
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry
    }

    /// 执行下载，成功时返回写入的字节数
    ///
    /// 每次尝试前检查取消标志，并在 `paused` 为真时阻塞等待。
    /// 失败的尝试会删除残留文件；耗尽重试后返回 `MaxRetriesExceeded`，
    /// 被取消时立即返回 `Cancelled`。`task.error` 始终保存最后一次错误。
    pub fn execute(
        &self,
        task: &mut DownloadTask,
        paused: &AtomicBool,
        on_progress: &mut dyn FnMut(ProgressSample),
    ) -> Result<u64, DownloadError> {
        let mut ctx = RetryContext::new(self.retry.clone());
        let max_attempts = self.retry.max_attempts();

        while ctx.has_attempts_left() {
            let delay = ctx.begin_attempt();
            if let Err(e) = wait_before_attempt(&task.cancel, paused, delay) {
                task.error = Some(e.to_string());
                log::info!("下载已取消: {}", task.url);
                return Err(e);
            }

            log::debug!("开始下载 {} (第 {}/{} 次尝试)", task.url, ctx.attempts, max_attempts);
            let result = self.attempt(task, &mut *on_progress);
            task.retry_attempts = ctx.attempts;

            match result {
                Ok(written) => {
                    task.error = None;
                    log::info!("下载完成: {} ({} 字节)", task.url, written);
                    return Ok(written);
                }
                Err(e) => {
                    remove_partial(&task.destination);
                    task.error = Some(e.to_string());

                    if e.is_cancelled() {
                        log::info!("下载已取消: {}", task.url);
                        return Err(e);
                    }

                    log::warn!(
                        "下载失败 {} (第 {}/{} 次尝试): {}",
                        task.url,
                        ctx.attempts,
                        max_attempts,
                        e
                    );
                    ctx.record_failure(&e);
                    if !e.is_retryable() {
                        return Err(e);
                    }
                }
            }
        }

        let error = ctx.into_error();
        log::error!("{}: {}", task.url, error);
        task.error = Some(error.to_string());
        Err(error)
    }

    fn attempt(
        &self,
        task: &DownloadTask,
        on_progress: &mut dyn FnMut(ProgressSample),
    ) -> Result<u64, DownloadError> {
        if let Some(parent) = task.destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut sink = FileSink {
            buffer: BufferManager::new(&task.destination, WRITE_BUFFER_SIZE)?,
            total: task.expected_size,
            started: Instant::now(),
            cancel: &task.cancel,
            limiter: &self.limiter,
            on_progress,
        };
        self.transport.fetch(&task.url, &mut sink)?;
        let written = sink.buffer.finish()?;

        if let Some(expected) = task.expected_size {
            if written != expected {
                return Err(DownloadError::SizeMismatch {
                    expected,
                    actual: written,
                });
            }
        }

        if self.verify_checksums {
            if let Some(hash) = &task.expected_hash {
                verify_file_hash(&task.destination, hash)?;
                // 缓存登记失败不影响本次下载结果
                if let Err(e) = self.cache.add(&task.destination, hash) {
                    log::warn!("写入缓存失败 {}: {}", hash, e);
                }
            }
        }

        Ok(written)
    }
}

/// 把响应体写入目标文件的 sink
struct FileSink<'a> {
    buffer: BufferManager,
    total: Option<u64>,
    started: Instant,
    cancel: &'a CancellationToken,
    limiter: &'a SpeedLimiter,
    on_progress: &'a mut dyn FnMut(ProgressSample),
}

impl ChunkSink for FileSink<'_> {
    fn begin(&mut self, total: Option<u64>) {
        if self.total.is_none() {
            self.total = total;
        }
    }

    fn chunk(&mut self, data: &[u8]) -> Result<ChunkControl, DownloadError> {
        if self.cancel.is_cancelled() {
            return Ok(ChunkControl::Stop);
        }

        self.buffer.write(data)?;
        let downloaded = self.buffer.get_total_written();
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 { downloaded as f64 / elapsed } else { 0.0 };

        (self.on_progress)(ProgressSample {
            downloaded,
            total: self.total,
            speed,
        });

        if self.cancel.is_cancelled() {
            return Ok(ChunkControl::Stop);
        }

        let pause = self.limiter.wait_if_needed(speed);
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        Ok(ChunkControl::Continue)
    }
}

/// 退避等待与暂停等待，期间随时响应取消
fn wait_before_attempt(
    cancel: &CancellationToken,
    paused: &AtomicBool,
    delay: Duration,
) -> Result<(), DownloadError> {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let now = Instant::now();
        if now < deadline {
            thread::sleep((deadline - now).min(PAUSE_POLL_INTERVAL));
            continue;
        }
        if paused.load(Ordering::SeqCst) {
            thread::sleep(PAUSE_POLL_INTERVAL);
            continue;
        }
        return Ok(());
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("删除残留文件失败 {}: {}", path.display(), e);
        }
    }
}
