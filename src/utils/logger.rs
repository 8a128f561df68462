use chrono::Local; // 用于获取本地时间
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// 按大小轮转的文件日志
pub struct FileLogger {
    pub writer: BufWriter<File>,
    pub level: LevelFilter,
    pub file_path: String,
    pub max_size: u64, // 最大文件大小 (bytes)
    pub current_size: u64,
}

impl FileLogger {
    pub fn new(file_path: &str, level: LevelFilter, max_size: u64) -> Result<Self, std::io::Error> {
        // 确保日志目录存在
        if let Some(parent) = Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::new(file),
            level,
            file_path: file_path.to_string(),
            max_size,
            current_size,
        })
    }

    /// 超过上限时把当前文件改名为 `.backup` 并重新打开
    fn check_rotation(&mut self) -> Result<(), std::io::Error> {
        if self.current_size > self.max_size {
            self.writer.flush()?;

            let backup_path = format!("{}.backup", self.file_path);
            if Path::new(&backup_path).exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
            self.writer = BufWriter::new(file);
            self.current_size = 0;
        }
        Ok(())
    }

    pub fn write_log(&mut self, level: log::Level, target: &str, message: &str) -> Result<(), std::io::Error> {
        if level > self.level {
            return Ok(());
        }
        let log_entry = format!(
            "{} [{}] {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            target,
            message
        );

        self.check_rotation()?;
        self.writer.write_all(log_entry.as_bytes())?;
        self.current_size += log_entry.len() as u64;

        // 警告及以上立即落盘
        if level <= log::Level::Warn {
            self.writer.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()
    }
}

/// 终端输出交给 env_logger（遵循 `RUST_LOG`），同时写入轮转日志文件
pub struct CombinedLogger {
    console: env_logger::Logger,
    file: Option<Mutex<FileLogger>>,
}

impl Log for CombinedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let file_enabled = self
            .file
            .as_ref()
            .map(|f| f.lock().map(|f| metadata.level() <= f.level).unwrap_or(false))
            .unwrap_or(false);
        file_enabled || self.console.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let message = record.args().to_string();
                if let Err(e) = file.write_log(record.level(), record.target(), &message) {
                    eprintln!("日志写入失败: {}", e);
                }
            }
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// 安装全局日志器
///
/// 终端默认只输出警告及以上，避免打乱进度条；文件按 `file_level` 记录。
pub fn init_logging(file_path: Option<&str>, file_level: LevelFilter, max_size: u64) -> anyhow::Result<()> {
    let console = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).build();
    let file = match file_path {
        Some(path) => Some(Mutex::new(FileLogger::new(path, file_level, max_size)?)),
        None => None,
    };

    let max_level = if file.is_some() {
        console.filter().max(file_level)
    } else {
        console.filter()
    };

    log::set_boxed_logger(Box::new(CombinedLogger { console, file }))
        .map_err(|e| anyhow::anyhow!("无法安装日志器: {}", e))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logger_filters_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("app.log");
        let path = path.to_str().unwrap();

        let mut logger = FileLogger::new(path, LevelFilter::Info, 1024 * 1024).unwrap();
        logger.write_log(log::Level::Info, "test", "程序启动").unwrap();
        logger.write_log(log::Level::Debug, "test", "调试信息").unwrap();
        logger.flush().unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("[INFO] test - 程序启动"));
        assert!(!content.contains("调试信息"));
    }

    #[test]
    fn test_file_logger_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let path = path.to_str().unwrap();

        let mut logger = FileLogger::new(path, LevelFilter::Info, 64).unwrap();
        for i in 0..10 {
            logger
                .write_log(log::Level::Warn, "test", &format!("第 {} 条日志消息", i))
                .unwrap();
        }
        logger.flush().unwrap();

        let backup = format!("{}.backup", path);
        assert!(Path::new(&backup).exists());
        assert!(std::fs::metadata(path).unwrap().len() < 200);
    }
}
