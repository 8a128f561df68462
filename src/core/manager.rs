//! 下载管理器
//!
//! 接收下载请求，先查内容缓存，未命中再交给线程池执行传输；
//! 汇总每个任务和全局的进度，并提供取消、暂停、等待等控制。

use std::collections::HashMap;
use std::path::PathBuf;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::config::Config;
use crate::core::cache::{CacheStore, CompressionPolicy};
use crate::core::error::DownloadError;
use crate::core::pool::WorkerPool;
use crate::core::task::download::{ProgressSample, TransferExecutor, PAUSE_POLL_INTERVAL};
use crate::core::task::state::{CancellationToken, DownloadTask, TaskStatus};
use crate::core::task::transport::{HttpTransport, Transport};
use crate::utils::validator;

pub type ProgressCallback = Arc<dyn Fn(&TaskProgress) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&TaskOutcome) + Send + Sync>;
pub type OverallProgressCallback = Arc<dyn Fn(&OverallProgress) + Send + Sync>;

/// 单个任务的进度快照
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub id: Uuid,
    pub url: String,
    pub status: TaskStatus,
    /// 0.0 - 1.0，总大小未知时为 0
    pub fraction: f64,
    pub downloaded: u64,
    pub total: Option<u64>,
    /// 字节/秒
    pub speed: f64,
    pub attempts: u32,
    pub error: Option<String>,
}

impl TaskProgress {
    fn pending(task: &DownloadTask) -> Self {
        Self {
            id: task.id,
            url: task.url.clone(),
            status: TaskStatus::Pending,
            fraction: 0.0,
            downloaded: 0,
            total: task.expected_size,
            speed: 0.0,
            attempts: 0,
            error: None,
        }
    }
}

/// 任务终态报告
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub id: Uuid,
    pub url: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub bytes: u64,
    pub from_cache: bool,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// 全局进度快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OverallProgress {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 经由线程池下载的任务总数（不含缓存命中）
    pub total: usize,
    /// 直接从缓存复制完成的任务数
    pub cached: usize,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed: u64,
}

impl OverallProgress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// 总字节数已知时按字节计算，否则按任务数计算
    pub fn fraction(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.bytes_downloaded as f64 / self.total_bytes as f64).min(1.0)
        } else if self.total > 0 {
            self.finished() as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

/// 推送给订阅者的事件
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress(TaskProgress),
    Finished(TaskOutcome),
    Overall(OverallProgress),
}

/// 排队中的下载
struct QueuedDownload {
    task: DownloadTask,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompleteCallback>,
}

#[derive(Default)]
struct ManagerState {
    pending: HashMap<Uuid, QueuedDownload>,
    active: HashMap<Uuid, CancellationToken>,
    records: HashMap<Uuid, TaskProgress>,
}

struct ManagerShared {
    state: Mutex<ManagerState>,
    completion: Condvar,
    cache: Arc<CacheStore>,
    executor: TransferExecutor,
    paused: AtomicBool,
    running: AtomicBool,

    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    cached: AtomicUsize,
    bytes_downloaded: AtomicU64,
    total_bytes: AtomicU64,
    current_speed: AtomicU64,

    overall_cb: Mutex<Option<OverallProgressCallback>>,
    subscribers: Mutex<Vec<UnboundedSender<DownloadEvent>>>,
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn overall(&self) -> OverallProgress {
        OverallProgress {
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            cached: self.cached.load(Ordering::SeqCst),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            speed: self.current_speed.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, event: DownloadEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subscribers.is_empty() {
            return;
        }
        // 接收端已关闭的订阅者直接移除
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn report_overall(&self) {
        let overall = self.overall();
        let callback = self
            .overall_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            if !call_guarded(|| callback(&overall)) {
                log::error!("全局进度回调发生 panic");
            }
        }
        self.emit(DownloadEvent::Overall(overall));
    }

    fn finish(&self, outcome: TaskOutcome, on_complete: Option<&CompleteCallback>) {
        if let Some(callback) = on_complete {
            if !call_guarded(|| callback(&outcome)) {
                log::error!("任务 {} 的完成回调发生 panic", outcome.id);
            }
        }
        self.emit(DownloadEvent::Finished(outcome));
        self.report_overall();
    }

    /// 把已出队但尚未执行的任务报告为取消
    fn report_cancelled(&self, queued: Vec<QueuedDownload>) {
        if queued.is_empty() {
            return;
        }
        self.cancelled.fetch_add(queued.len(), Ordering::SeqCst);
        let declared: u64 = queued.iter().filter_map(|q| q.task.expected_size).sum();
        self.total_bytes.fetch_sub(declared, Ordering::Relaxed);
        self.completion.notify_all();

        for item in queued {
            log::info!("已取消排队中的任务: {}", item.task.url);
            let outcome = TaskOutcome {
                id: item.task.id,
                url: item.task.url.clone(),
                status: TaskStatus::Cancelled,
                error: Some(DownloadError::Cancelled.to_string()),
                bytes: 0,
                from_cache: false,
            };
            self.finish(outcome, item.on_complete.as_ref());
        }
    }
}

/// 下载管理器，拥有一个缓存和一个线程池
pub struct DownloadManager {
    shared: Arc<ManagerShared>,
    pool: WorkerPool,
}

impl DownloadManager {
    /// 使用 HTTP 传输创建管理器
    pub fn new(config: &Config) -> Result<Self, DownloadError> {
        let transport = Arc::new(HttpTransport::new(config)?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, DownloadError> {
        config.validate()?;
        let cache = Arc::new(CacheStore::open(
            &config.cache_dir,
            config.cache_max_size,
            CompressionPolicy::from_threshold(config.cache_compress_threshold),
        )?);
        let executor = TransferExecutor::from_config(config, transport, cache.clone());
        let pool = WorkerPool::new(config.max_concurrent_downloads);

        log::info!("下载管理器已启动，并发数: {}", pool.size());

        Ok(Self {
            shared: Arc::new(ManagerShared {
                state: Mutex::new(ManagerState::default()),
                completion: Condvar::new(),
                cache,
                executor,
                paused: AtomicBool::new(false),
                running: AtomicBool::new(true),
                total: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                cached: AtomicUsize::new(0),
                bytes_downloaded: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                current_speed: AtomicU64::new(0),
                overall_cb: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
            }),
            pool,
        })
    }

    /// 添加下载任务，返回分配的任务 ID
    ///
    /// 声明了哈希且缓存命中时，直接从缓存复制到目标路径，
    /// 并在返回前同步调用 `on_complete`，不访问网络也不占用线程池。
    pub fn add_download(
        &self,
        mut task: DownloadTask,
        priority: i32,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompleteCallback>,
    ) -> Result<Uuid, DownloadError> {
        validator::validate_url(&task.url)?;
        if let Some(hash) = &task.expected_hash {
            validator::validate_hash(hash)?;
        }

        let id = Uuid::new_v4();
        task.id = id;

        if let Some(hash) = task.expected_hash.clone() {
            match self.shared.cache.copy_to(&hash, &task.destination) {
                Ok(true) => {
                    self.complete_from_cache(task, on_complete.as_ref());
                    return Ok(id);
                }
                Ok(false) => {}
                Err(e) => log::warn!("从缓存复制失败 {}，改为下载: {}", hash, e),
            }
        }

        let declared_size = task.expected_size.unwrap_or(0);
        {
            let mut state = self.shared.lock();
            state.records.insert(id, TaskProgress::pending(&task));
            state.pending.insert(
                id,
                QueuedDownload {
                    task,
                    on_progress,
                    on_complete,
                },
            );
        }
        self.shared.total.fetch_add(1, Ordering::SeqCst);
        self.shared.total_bytes.fetch_add(declared_size, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        if let Err(e) = self.pool.submit_priority(priority, move || run_download(&shared, id)) {
            // 回滚登记
            {
                let mut state = self.shared.lock();
                state.pending.remove(&id);
                state.records.remove(&id);
            }
            self.shared.total.fetch_sub(1, Ordering::SeqCst);
            self.shared.total_bytes.fetch_sub(declared_size, Ordering::Relaxed);
            self.shared.completion.notify_all();
            return Err(e);
        }

        log::debug!("任务已加入队列: {} (优先级 {})", id, priority);
        Ok(id)
    }

    /// 批量添加，回调由所有任务共享；遇到错误立即返回
    pub fn add_downloads(
        &self,
        tasks: impl IntoIterator<Item = DownloadTask>,
        priority: i32,
        on_progress: Option<ProgressCallback>,
        on_complete: Option<CompleteCallback>,
    ) -> Result<Vec<Uuid>, DownloadError> {
        tasks
            .into_iter()
            .map(|task| self.add_download(task, priority, on_progress.clone(), on_complete.clone()))
            .collect()
    }

    fn complete_from_cache(&self, task: DownloadTask, on_complete: Option<&CompleteCallback>) {
        let bytes = std::fs::metadata(&task.destination).map(|m| m.len()).unwrap_or(0);
        log::info!("缓存命中: {} -> {}", task.url, task.destination.display());

        {
            let mut state = self.shared.lock();
            state.records.insert(
                task.id,
                TaskProgress {
                    status: TaskStatus::Completed,
                    fraction: 1.0,
                    downloaded: bytes,
                    total: Some(bytes),
                    ..TaskProgress::pending(&task)
                },
            );
        }
        self.shared.cached.fetch_add(1, Ordering::SeqCst);

        let outcome = TaskOutcome {
            id: task.id,
            url: task.url,
            status: TaskStatus::Completed,
            error: None,
            bytes,
            from_cache: true,
        };
        self.shared.finish(outcome, on_complete);
    }

    /// 取消任务：排队中的任务直接出队并报告取消，执行中的任务在下一个检查点停止
    pub fn cancel_download(&self, id: Uuid) -> bool {
        let queued = {
            let mut state = self.shared.lock();
            if let Some(queued) = state.pending.remove(&id) {
                queued.task.cancel.cancel();
                if let Some(record) = state.records.get_mut(&id) {
                    record.status = TaskStatus::Cancelled;
                }
                Some(queued)
            } else if let Some(token) = state.active.remove(&id) {
                token.cancel();
                None
            } else {
                return false;
            }
        };

        match queued {
            Some(queued) => self.shared.report_cancelled(vec![queued]),
            None => {
                log::info!("已请求取消任务: {}", id);
                self.shared.completion.notify_all();
            }
        }
        true
    }

    /// 取消所有执行中的任务并清空等待队列
    pub fn cancel_all(&self) {
        let drained: Vec<QueuedDownload> = {
            let mut state = self.shared.lock();
            for token in state.active.values() {
                token.cancel();
            }
            let ids: Vec<Uuid> = state.pending.keys().copied().collect();
            let mut drained = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(queued) = state.pending.remove(&id) {
                    queued.task.cancel.cancel();
                    if let Some(record) = state.records.get_mut(&id) {
                        record.status = TaskStatus::Cancelled;
                    }
                    drained.push(queued);
                }
            }
            drained
        };
        self.shared.report_cancelled(drained);
    }

    pub fn pause_all(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        log::info!("已暂停所有下载");
    }

    pub fn resume_all(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        log::info!("已恢复所有下载");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// 阻塞直到没有排队和执行中的任务
    pub fn wait_for_all(&self) {
        let mut state = self.shared.lock();
        while !(state.pending.is_empty() && state.active.is_empty()) {
            state = self
                .shared
                .completion
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn progress(&self, id: Uuid) -> Option<TaskProgress> {
        self.shared.lock().records.get(&id).cloned()
    }

    pub fn task_status(&self, id: Uuid) -> Option<TaskStatus> {
        self.shared.lock().records.get(&id).map(|r| r.status.clone())
    }

    pub fn all_progress(&self) -> Vec<TaskProgress> {
        self.shared.lock().records.values().cloned().collect()
    }

    pub fn overall_progress(&self) -> OverallProgress {
        self.shared.overall()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    /// 所有执行中任务的速度之和（字节/秒）
    pub fn current_speed(&self) -> u64 {
        self.shared.current_speed.load(Ordering::Relaxed)
    }

    /// 0 表示不限速
    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.shared.executor.limiter().set_limit(bytes_per_sec);
    }

    pub fn set_overall_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&OverallProgress) + Send + Sync + 'static,
    {
        *self
            .shared
            .overall_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// 订阅进度和完成事件
    pub fn subscribe(&self) -> UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.shared.cache
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// 取消所有任务并停止线程池，可重复调用
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_all();
        self.shared.paused.store(false, Ordering::SeqCst);
        self.pool.shutdown();
        log::info!("下载管理器已关闭");
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 用户回调 panic 不能破坏管理器的记账，返回回调是否正常结束
fn call_guarded<F: FnOnce()>(f: F) -> bool {
    panic::catch_unwind(AssertUnwindSafe(f)).is_ok()
}

/// 执行中任务的占位：无论任务如何结束，都会移出执行集合并唤醒等待者
struct ActiveSlot<'a> {
    shared: &'a ManagerShared,
    id: Uuid,
    url: String,
    destination: PathBuf,
    on_complete: Option<CompleteCallback>,
    settled: bool,
}

impl ActiveSlot<'_> {
    fn settle(mut self, outcome: TaskOutcome) {
        self.settled = true;
        self.shared.finish(outcome, self.on_complete.as_ref());
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // 执行过程中发生 panic：按失败处理
            let message = "任务执行时发生 panic".to_string();
            log::error!("{}: {}", message, self.url);
            let _ = std::fs::remove_file(&self.destination);
            self.shared.failed.fetch_add(1, Ordering::SeqCst);
            if let Some(record) = self.shared.lock().records.get_mut(&self.id) {
                record.status = TaskStatus::Failed(message.clone());
                record.error = Some(message.clone());
                record.speed = 0.0;
            }
            let outcome = TaskOutcome {
                id: self.id,
                url: self.url.clone(),
                status: TaskStatus::Failed(message.clone()),
                error: Some(message),
                bytes: 0,
                from_cache: false,
            };
            self.shared.finish(outcome, self.on_complete.as_ref());
        }
        self.shared.lock().active.remove(&self.id);
        self.shared.completion.notify_all();
    }
}

/// 工作线程中执行单个排队任务
fn run_download(shared: &ManagerShared, id: Uuid) {
    // 暂停期间任务留在等待队列里，仍可被直接取消
    while shared.paused.load(Ordering::SeqCst) {
        if !shared.lock().pending.contains_key(&id) {
            return;
        }
        thread::sleep(PAUSE_POLL_INTERVAL);
    }

    let queued = {
        let mut state = shared.lock();
        let Some(queued) = state.pending.remove(&id) else {
            // 已被取消
            return;
        };
        state.active.insert(id, queued.task.cancel.clone());
        if let Some(record) = state.records.get_mut(&id) {
            record.status = TaskStatus::Running;
        }
        queued
    };

    let QueuedDownload {
        mut task,
        mut on_progress,
        on_complete,
    } = queued;

    let slot = ActiveSlot {
        shared,
        id,
        url: task.url.clone(),
        destination: task.destination.clone(),
        on_complete,
        settled: false,
    };

    let mut last_downloaded = 0u64;
    let mut last_speed = 0u64;
    // 本任务计入 total_bytes 的字节数
    let mut counted_total = task.expected_size.unwrap_or(0);
    let mut total_known = task.expected_size.is_some();

    let result = {
        let mut on_sample = |sample: ProgressSample| {
            // 新一次尝试从 0 开始计数
            if sample.downloaded >= last_downloaded {
                shared
                    .bytes_downloaded
                    .fetch_add(sample.downloaded - last_downloaded, Ordering::Relaxed);
            } else {
                shared
                    .bytes_downloaded
                    .fetch_sub(last_downloaded - sample.downloaded, Ordering::Relaxed);
            }
            last_downloaded = sample.downloaded;

            let speed = sample.speed as u64;
            if speed >= last_speed {
                shared.current_speed.fetch_add(speed - last_speed, Ordering::Relaxed);
            } else {
                shared.current_speed.fetch_sub(last_speed - speed, Ordering::Relaxed);
            }
            last_speed = speed;

            if !total_known {
                if let Some(total) = sample.total {
                    shared.total_bytes.fetch_add(total, Ordering::Relaxed);
                    counted_total = total;
                    total_known = true;
                }
            }

            let snapshot = {
                let mut state = shared.lock();
                let Some(record) = state.records.get_mut(&id) else {
                    return;
                };
                record.downloaded = sample.downloaded;
                record.total = sample.total;
                record.speed = sample.speed;
                record.fraction = match sample.total {
                    Some(total) if total > 0 => (sample.downloaded as f64 / total as f64).min(1.0),
                    _ => 0.0,
                };
                record.clone()
            };
            if let Some(callback) = &on_progress {
                if !call_guarded(|| callback(&snapshot)) {
                    // panic 过的进度回调不再调用
                    log::error!("任务 {} 的进度回调发生 panic", id);
                    on_progress = None;
                }
            }
            shared.emit(DownloadEvent::Progress(snapshot));
        };
        shared.executor.execute(&mut task, &shared.paused, &mut on_sample)
    };
    shared.current_speed.fetch_sub(last_speed, Ordering::Relaxed);

    let (status, bytes) = match &result {
        Ok(written) => {
            shared.completed.fetch_add(1, Ordering::SeqCst);
            (TaskStatus::Completed, *written)
        }
        Err(e) if e.is_cancelled() => {
            shared.cancelled.fetch_add(1, Ordering::SeqCst);
            (TaskStatus::Cancelled, last_downloaded)
        }
        Err(e) => {
            shared.failed.fetch_add(1, Ordering::SeqCst);
            (TaskStatus::Failed(e.to_string()), last_downloaded)
        }
    };

    if !status.is_success() {
        // 未完成的任务不再计入全局字节进度
        shared.bytes_downloaded.fetch_sub(last_downloaded, Ordering::Relaxed);
        shared.total_bytes.fetch_sub(counted_total, Ordering::Relaxed);
    }

    {
        let mut state = shared.lock();
        if let Some(record) = state.records.get_mut(&id) {
            record.status = status.clone();
            record.attempts = task.retry_attempts;
            record.error = task.error.clone();
            record.speed = 0.0;
            if status.is_success() {
                record.fraction = 1.0;
                record.downloaded = bytes;
            }
        }
    }

    let outcome = TaskOutcome {
        id,
        url: task.url.clone(),
        status,
        error: result.err().map(|e| e.to_string()),
        bytes,
        from_cache: false,
    };
    slot.settle(outcome);
}
