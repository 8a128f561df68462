//! 固定大小的工作线程池
//!
//! 两条队列：普通 FIFO 队列和按优先级排序的最大堆。
//! 工作线程总是先清空优先级队列，再处理 FIFO 队列。
//! 线程池本身不知道下载的存在，只负责执行闭包。

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::core::error::DownloadError;

/// 未指定线程数时的最小线程数
pub const MIN_WORKERS: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PriorityJob {
    priority: i32,
    seq: u64,
    job: Job,
}

impl PartialEq for PriorityJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityJob {}

impl PartialOrd for PriorityJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityJob {
    // 优先级高者在堆顶；同优先级时先提交者在堆顶
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queues {
    fifo: VecDeque<Job>,
    priority: BinaryHeap<PriorityJob>,
    next_seq: u64,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.fifo.is_empty() && self.priority.is_empty()
    }

    fn len(&self) -> usize {
        self.fifo.len() + self.priority.len()
    }

    fn pop(&mut self) -> Option<Job> {
        if let Some(item) = self.priority.pop() {
            return Some(item.job);
        }
        self.fifo.pop_front()
    }
}

struct Shared {
    queues: Mutex<Queues>,
    available: Condvar,
    idle: Condvar,
    stop: AtomicBool,
    active: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queues> {
        // 任务在锁外执行，锁不会因任务 panic 而中毒；即便中毒也沿用内部数据
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 提交任务后返回的结果句柄
pub struct JobHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// 阻塞等待任务结果；任务 panic 时返回 `JobAborted`
    ///
    /// 不能在异步上下文中调用，异步代码请使用 [`JobHandle::recv`]。
    pub fn wait(self) -> Result<T, DownloadError> {
        self.receiver.blocking_recv().map_err(|_| DownloadError::JobAborted)
    }

    pub async fn recv(self) -> Result<T, DownloadError> {
        self.receiver.await.map_err(|_| DownloadError::JobAborted)
    }
}

/// 工作线程池
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// 创建线程池，`threads == 0` 时使用 CPU 核数（至少 4 个）
    pub fn new(threads: usize) -> Self {
        let size = if threads == 0 {
            num_cpus::get().max(MIN_WORKERS)
        } else {
            threads
        };

        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            available: Condvar::new(),
            idle: Condvar::new(),
            stop: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("cachedown-worker-{}", index))
                .spawn(move || worker_loop(shared, index));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("创建工作线程 {} 失败: {}", index, e),
            }
        }
        log::debug!("线程池已启动，工作线程数: {}", workers.len());

        Self {
            shared,
            workers: Mutex::new(workers),
            size,
        }
    }

    /// 提交到 FIFO 队列
    pub fn submit<F, T>(&self, f: F) -> Result<JobHandle<T>, DownloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = wrap_job(f);
        {
            let mut queues = self.shared.lock();
            if self.shared.stop.load(Ordering::SeqCst) {
                return Err(DownloadError::PoolStopped);
            }
            queues.fifo.push_back(job);
        }
        self.shared.available.notify_one();
        Ok(handle)
    }

    /// 提交到优先级队列，数值越大越先执行
    pub fn submit_priority<F, T>(&self, priority: i32, f: F) -> Result<JobHandle<T>, DownloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = wrap_job(f);
        {
            let mut queues = self.shared.lock();
            if self.shared.stop.load(Ordering::SeqCst) {
                return Err(DownloadError::PoolStopped);
            }
            let seq = queues.next_seq;
            queues.next_seq += 1;
            queues.priority.push(PriorityJob { priority, seq, job });
        }
        self.shared.available.notify_one();
        Ok(handle)
    }

    /// 阻塞直到两条队列为空且没有正在执行的任务
    pub fn wait_all(&self) {
        let mut queues = self.shared.lock();
        while !(queues.is_empty() && self.shared.active.load(Ordering::SeqCst) == 0) {
            queues = self
                .shared
                .idle
                .wait(queues)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pending_jobs(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn active_jobs(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        let queues = self.shared.lock();
        queues.is_empty() && self.shared.active.load(Ordering::SeqCst) == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// 停止接收新任务，等已排队和正在执行的任务结束后回收所有线程
    pub fn shutdown(&self) {
        {
            let _queues = self.shared.lock();
            self.shared.stop.store(true, Ordering::SeqCst);
        }
        self.shared.available.notify_all();

        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let current = thread::current().id();
        for worker in workers {
            // 在工作线程内部调用 shutdown 时不能 join 自己
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::error!("工作线程异常退出");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wrap_job<F, T>(f: F) -> (Job, JobHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move || {
        let _ = tx.send(f());
    });
    (job, JobHandle { receiver: rx })
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    loop {
        let job = {
            let mut queues = shared.lock();
            loop {
                if let Some(job) = queues.pop() {
                    // 在持锁期间计数，保证 wait_all 看到的状态一致
                    shared.active.fetch_add(1, Ordering::SeqCst);
                    break job;
                }
                if shared.stop.load(Ordering::SeqCst) {
                    log::trace!("工作线程 {} 退出", index);
                    return;
                }
                queues = shared
                    .available
                    .wait(queues)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "未知原因".to_string());
            log::error!("工作线程 {} 执行任务时发生 panic: {}", index, message);
        }

        let queues = shared.lock();
        shared.active.fetch_sub(1, Ordering::SeqCst);
        if queues.is_empty() && shared.active.load(Ordering::SeqCst) == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_submit_returns_result() {
        let pool = WorkerPool::new(2);
        let handle = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_default_size_has_minimum() {
        let pool = WorkerPool::new(0);
        assert!(pool.size() >= MIN_WORKERS);
    }

    #[test]
    fn test_wait_all_blocks_until_job_done() {
        let pool = WorkerPool::new(2);
        let start = Instant::now();
        pool.submit(|| thread::sleep(Duration::from_millis(100))).unwrap();
        pool.wait_all();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(pool.is_idle());
        assert_eq!(pool.active_jobs(), 0);
        assert_eq!(pool.pending_jobs(), 0);
    }

    #[test]
    fn test_fifo_submit_keeps_submission_order() {
        // 单线程池，先用一个阻塞任务占住线程，保证后续任务都在队列中
        let pool = WorkerPool::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for nominal_priority in [1, 10, 5] {
            let order = Arc::clone(&order);
            pool.submit(move || order.lock().unwrap().push(nominal_priority)).unwrap();
        }
        gate_tx.send(()).unwrap();
        pool.wait_all();

        assert_eq!(*order.lock().unwrap(), vec![1, 10, 5]);
    }

    #[test]
    fn test_priority_queue_drained_before_fifo() {
        let pool = WorkerPool::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            pool.submit(move || order.lock().unwrap().push("fifo")).unwrap();
        }
        for (priority, name) in [(1, "p1"), (10, "p10"), (5, "p5"), (10, "p10-second")] {
            let order = Arc::clone(&order);
            pool.submit_priority(priority, move || order.lock().unwrap().push(name))
                .unwrap();
        }
        gate_tx.send(()).unwrap();
        pool.wait_all();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["p10", "p10-second", "p5", "p1", "fifo"]
        );
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let failed = pool.submit(|| -> u32 { panic!("任务内部错误") }).unwrap();
        assert!(matches!(failed.wait(), Err(DownloadError::JobAborted)));

        let ok = pool.submit(|| 7).unwrap();
        assert_eq!(ok.wait().unwrap(), 7);
        pool.wait_all();
        assert_eq!(pool.active_jobs(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(2);
        pool.shutdown();
        assert!(pool.is_stopped());
        assert!(matches!(pool.submit(|| ()), Err(DownloadError::PoolStopped)));
        assert!(matches!(
            pool.submit_priority(3, || ()),
            Err(DownloadError::PoolStopped)
        ));
    }

    #[test]
    fn test_shutdown_finishes_queued_jobs() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
