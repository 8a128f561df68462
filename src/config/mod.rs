use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use crate::core::cache::DEFAULT_MAX_SIZE;
use crate::core::error::DownloadError;

/// 获取平台默认缓存目录
pub fn default_cache_dir() -> String {
    #[cfg(target_os = "windows")]
    {
        let local = env::var("LOCALAPPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/cachedown/cache", local)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Caches/cachedown", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        match env::var("XDG_CACHE_HOME") {
            Ok(dir) if !dir.is_empty() => format!("{}/cachedown", dir),
            _ => {
                let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
                format!("{}/.cache/cachedown", home)
            }
        }
    }
}

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 最大并发下载数（工作线程数），0 表示按 CPU 核数
    pub max_concurrent_downloads: usize,
    /// 每个任务失败后的重试次数，总尝试次数为该值加一
    pub retry_count: u32,
    /// 线性退避的基础延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 退避抖动因子（0.0 - 1.0）
    pub retry_jitter: f64,
    /// 网络超时时间（毫秒）
    pub timeout_ms: u64,
    /// 下载完成后是否校验哈希
    pub verify_checksums: bool,
    /// 下载速度限制（KB/s），0 表示不限速
    pub speed_limit_kb: u64,
    pub user_agent: String,
    /// 最多跟随的重定向次数
    pub max_redirects: usize,
    /// 默认下载目录
    pub download_dir: String,
    /// 缓存目录
    pub cache_dir: String,
    /// 缓存上限（字节）
    pub cache_max_size: u64,
    /// 文件不小于该值时压缩存入缓存，0 表示从不压缩
    pub cache_compress_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 10,
            retry_count: 3,
            retry_delay_ms: 1000,
            retry_jitter: 0.0,
            timeout_ms: 30_000,
            verify_checksums: true,
            speed_limit_kb: 0, // 默认不限速
            user_agent: format!("cachedown/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            download_dir: "./downloads".to_string(),
            cache_dir: default_cache_dir(),
            cache_max_size: DEFAULT_MAX_SIZE,
            cache_compress_threshold: 0,
        }
    }
}

impl Config {
    /// 加载配置文件，不存在时写入带教程的默认配置
    pub fn load(path: &str) -> Result<Self, DownloadError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            // 尝试解析TOML
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    log::warn!("配置文件格式错误: {}，将使用默认配置", e);
                    Ok(Config::default())
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tutorial_content = Config::generate_tutorial_content();
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::ConfigError(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n\n{}", tutorial_content, config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    /// 生成配置文件教程内容
    fn generate_tutorial_content() -> String {
        r#"# cachedown 配置文件
# ====================
#
# 这是一个 TOML 格式的配置文件，用于配置 cachedown 下载器的行为。
# 你可以根据需要修改这些设置，然后保存文件。
#
# 配置文件位置：
# - Windows: %APPDATA%/cachedown/cachedown.conf
# - macOS: ~/Library/Application Support/cachedown/cachedown.conf
# - Linux: ~/.config/cachedown/cachedown.conf
#
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   cachedown https://example.com/file.zip                       # 使用默认配置
#   cachedown -l 1000 https://example.com/file.zip              # 限制速度1MB/s
#   cachedown -j 4 -f urls.txt                                  # 最多同时下载4个文件
#   cachedown -m manifest.json                                  # 按清单下载并校验哈希

# ==================== 下载设置 ====================
#
# max_concurrent_downloads  最大并发下载数，0 表示按 CPU 核数（至少 4）
# speed_limit_kb            下载速度限制（KB/s），0 表示不限速
# download_dir              默认下载目录，支持相对路径和绝对路径
#
# ==================== 网络设置 ====================
#
# timeout_ms                网络超时时间（毫秒）
# user_agent                User-Agent 字符串
# max_redirects             最多跟随的重定向次数
#
# ==================== 重试设置 ====================
#
# retry_count               失败后的重试次数，总尝试次数 = retry_count + 1
# retry_delay_ms            第 n 次重试前等待 retry_delay_ms * n 毫秒
# retry_jitter              在退避时间上加入随机抖动，0 表示不抖动
#
# ==================== 缓存设置 ====================
#
# verify_checksums          下载完成后校验哈希，只有通过校验的文件才会进入缓存
# cache_dir                 缓存目录，按内容哈希存放文件
# cache_max_size            缓存上限（字节），超出时淘汰最久未使用的文件
# cache_compress_threshold  不小于该大小的文件压缩后存入缓存，0 表示不压缩
#
# ==================== 故障排除 ====================
#
# 问题：经常下载失败
# 解决：增加 retry_count 或 timeout_ms
#
# 问题：缓存占用磁盘过多
# 解决：减小 cache_max_size，或使用 cachedown --clear-cache 清空缓存
#
# 问题：哈希校验反复失败
# 解决：确认清单中的哈希值是否正确（40 位为 SHA-1，64 位为 SHA-256）

# ==================== 配置项 ===================="#
            .to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.timeout_ms == 0 {
            return Err(DownloadError::ConfigError("超时时间必须大于0".to_string()));
        }

        if self.download_dir.is_empty() {
            return Err(DownloadError::ConfigError("下载目录不能为空".to_string()));
        }

        if self.cache_dir.is_empty() {
            return Err(DownloadError::ConfigError("缓存目录不能为空".to_string()));
        }

        if self.cache_max_size == 0 {
            return Err(DownloadError::ConfigError("缓存上限必须大于0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(DownloadError::ConfigError("退避抖动因子必须在 0 到 1 之间".to_string()));
        }

        if self.user_agent.trim().is_empty() {
            return Err(DownloadError::ConfigError("User-Agent 不能为空".to_string()));
        }

        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        // 命令行参数覆盖配置文件
        if let Some(speed_limit) = args.speed_limit_kb {
            self.speed_limit_kb = speed_limit;
        }

        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }

        if let Some(jobs) = args.jobs {
            self.max_concurrent_downloads = jobs;
        }

        if let Some(cache_dir) = &args.cache_dir {
            self.cache_dir = cache_dir.clone();
        }

        if args.no_verify {
            self.verify_checksums = false;
        }
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 缓存目录: {}\n\
            - 缓存上限: {} MB\n\
            - 并发数: {}\n\
            - 速度限制: {}\n\
            - 超时时间: {} 毫秒\n\
            - 重试: {} 次, 间隔 {} 毫秒\n\
            - 哈希校验: {}",
            self.download_dir,
            self.cache_dir,
            self.cache_max_size / (1024 * 1024),
            if self.max_concurrent_downloads == 0 {
                "自动".to_string()
            } else {
                self.max_concurrent_downloads.to_string()
            },
            if self.speed_limit_kb == 0 {
                "不限速".to_string()
            } else {
                format!("{} KB/s", self.speed_limit_kb)
            },
            self.timeout_ms,
            self.retry_count,
            self.retry_delay_ms,
            if self.verify_checksums { "启用" } else { "禁用" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_downloads, 10);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.timeout_ms, 30_000);
        assert!(config.verify_checksums);
        assert_eq!(config.cache_max_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.cache_compress_threshold, 0);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        // 0 表示按 CPU 核数
        config.max_concurrent_downloads = 0;
        assert!(config.validate().is_ok());

        config.timeout_ms = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.cache_max_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.retry_jitter = 1.5;
        assert!(config.validate().is_err());

        config = Config::default();
        config.cache_dir.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cachedown.conf");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.retry_count = 7;
        config.cache_compress_threshold = 4096;
        config.save_with_tutorial(path).expect("保存带教程的配置失败");

        let loaded = Config::load(path).expect("加载配置失败");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_created_with_tutorial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cachedown.conf");
        let path = path.to_str().unwrap();

        let config = Config::load(path).unwrap();
        assert_eq!(config, Config::default());

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("cachedown 配置文件"));
        assert!(content.contains("故障排除"));
        assert!(content.contains("cache_max_size"));
    }

    #[test]
    fn test_partial_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("partial.conf");
        fs::write(&partial, "retry_count = 1\nspeed_limit_kb = 512\n").unwrap();
        let config = Config::load(partial.to_str().unwrap()).unwrap();
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.speed_limit_kb, 512);
        assert_eq!(config.timeout_ms, 30_000);

        let broken = dir.path().join("broken.conf");
        fs::write(&broken, "retry_count = \"many\"").unwrap();
        let config = Config::load(broken.to_str().unwrap()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_summary() {
        let summary = Config::default().get_summary();
        assert!(summary.contains("配置摘要"));
        assert!(summary.contains("缓存目录"));
        assert!(summary.contains("不限速"));
    }
}
