use indicatif::{ProgressBar, ProgressStyle};

use crate::core::manager::OverallProgress;
use super::{format_eta, format_size, format_speed};

/// 全局进度条
///
/// 总字节数已知时按字节显示，否则按已完成的任务数显示。
pub struct ProgressManager {
    bar: ProgressBar,
    by_bytes: bool,
}

impl ProgressManager {
    pub fn new(total_bytes: u64, total_tasks: usize) -> Self {
        let by_bytes = total_bytes > 0;
        let bar = ProgressBar::new(if by_bytes { total_bytes } else { total_tasks as u64 });
        let template = if by_bytes {
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}"
        } else {
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}"
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar, by_bytes }
    }

    /// 方法：更新下载进度
    pub fn update_progress(&mut self, overall: &OverallProgress) {
        // 任务数模式下一旦得知总字节数就切换到字节模式
        if !self.by_bytes && overall.total_bytes > 0 {
            self.bar.finish_and_clear();
            *self = ProgressManager::new(overall.total_bytes, overall.total);
        }

        if self.by_bytes {
            if overall.total_bytes > self.bar.length().unwrap_or(0) {
                self.bar.set_length(overall.total_bytes);
            }
            self.bar.set_position(overall.bytes_downloaded.min(overall.total_bytes));
        } else {
            self.bar.set_length(overall.total.max(1) as u64);
            self.bar.set_position(overall.finished() as u64);
        }

        let remaining = overall.total_bytes.saturating_sub(overall.bytes_downloaded);
        self.bar.set_message(format!(
            "{} | ETA:{} | 完成 {}/{} 失败 {}",
            format_speed(overall.speed),
            format_eta(remaining, overall.speed),
            overall.completed,
            overall.total,
            overall.failed
        ));
    }

    pub fn println(&self, message: &str) {
        self.bar.println(message);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    pub fn total_label(&self) -> String {
        match self.bar.length() {
            Some(len) if self.by_bytes => format_size(len),
            Some(len) => format!("{} 个任务", len),
            None => "未知".to_string(),
        }
    }
}
