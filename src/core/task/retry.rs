use std::time::Duration;
use crate::core::error::DownloadError;

/// 重试策略：线性退避，第 n 次重试前等待 `base_delay * n`
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub jitter_factor: f64, // 抖动因子，0 表示严格线性
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            jitter_factor: 0.0,
        }
    }
}

impl RetryStrategy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// 总尝试次数 = 重试次数 + 1
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn should_retry(&self, error: &DownloadError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// 第 `attempt` 次尝试（从 0 开始）之前的等待时间
    pub fn get_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = self.base_delay * attempt;
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let delay_secs = delay.as_secs_f64();
        let jitter = delay_secs * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_secs_f64((delay_secs + jitter).max(0.0))
    }
}

/// 重试上下文，记录单个任务的尝试历史
#[derive(Debug)]
pub struct RetryContext {
    pub strategy: RetryStrategy,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub retry_history: Vec<(String, Duration)>,
    pub total_retry_time: Duration,
}

impl RetryContext {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            attempts: 0,
            last_error: None,
            retry_history: Vec::new(),
            total_retry_time: Duration::ZERO,
        }
    }

    /// 是否还有剩余的尝试机会
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.strategy.max_attempts()
    }

    /// 开始一次新的尝试，返回开始前需要等待的时间
    pub fn begin_attempt(&mut self) -> Duration {
        let delay = self.strategy.get_delay(self.attempts);
        self.attempts += 1;
        self.total_retry_time += delay;
        delay
    }

    pub fn record_failure(&mut self, error: &DownloadError) {
        let message = error.to_string();
        let next_delay = self.strategy.get_delay(self.attempts);
        self.retry_history.push((message.clone(), next_delay));
        self.last_error = Some(message);
    }

    pub fn into_error(self) -> DownloadError {
        DownloadError::MaxRetriesExceeded {
            attempts: self.attempts,
            last_error: self.last_error.unwrap_or_else(|| "未知错误".to_string()),
        }
    }

    pub fn get_retry_stats(&self) -> RetryStats {
        RetryStats {
            total_attempts: self.attempts,
            total_retry_time: self.total_retry_time,
            retry_history: self.retry_history.clone(),
        }
    }
}

/// 重试统计信息
#[derive(Debug, Clone)]
pub struct RetryStats {
    pub total_attempts: u32,
    pub total_retry_time: Duration,
    pub retry_history: Vec<(String, Duration)>,
}
