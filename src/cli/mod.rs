//! CLI: 命令行接口和参数解析模块
//!
//! ## 主要功能
//!
//! - 命令行参数解析和验证
//! - 配置文件路径管理
//! - 下载任务收集（命令行 URL、URL 列表文件、JSON 清单）
//! - 配置文件编辑器集成
//!
//! ## 支持的命令
//!
//! - 基本下载：`cachedown <url>`
//! - 批量下载：`cachedown -f urls.txt`
//! - 按清单下载并校验：`cachedown -m manifest.json`
//! - 编辑配置：`cachedown -e`
//! - 缓存管理：`cachedown --cache-stats` / `cachedown --clear-cache`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/cachedown/cachedown.conf`
//! - macOS: `~/Library/Application Support/cachedown/cachedown.conf`
//! - Linux: `~/.config/cachedown/cachedown.conf`

use clap::Parser;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::task::{DownloadTask, TaskSpec};
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/cachedown/cachedown.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/cachedown/cachedown.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/cachedown/cachedown.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 $EDITOR，其次 xdg-open，最后 nano
        if let Ok(editor) = env::var("EDITOR") {
            if std::process::Command::new(editor).arg(config_path).status().is_ok() {
                return;
            }
        }
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// cachedown 命令行参数
///
/// 示例用法：
///   cachedown https://example.com/file.zip
///   cachedown -e  # 编辑配置文件
///   cachedown -m manifest.json -j 8
///   cachedown --cache-stats
///
/// 更多用法请加 --help 查看
#[derive(Parser, Debug, Clone)]
#[command(
    name = "cachedown",
    author = "panzhifu",
    version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("VERGEN_BUILD_TIMESTAMP"), ")"),
    about = "带内容缓存的并发下载器",
    long_about = "按内容哈希缓存已下载的文件，支持并发下载、失败重试、哈希校验、限速和实时进度显示。\n\n示例：\n  cachedown https://example.com/file.zip\n  cachedown -f urls.txt -j 4\n  cachedown -m manifest.json\n  cachedown --cache-stats\n"
)]
pub struct Args {
    /// 要下载的URL列表（可同时指定多个）
    #[arg(required = false, help = "要下载的URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径
    #[arg(short, long, help = "包含URL列表的文件路径，每行一个URL，# 开头为注释。")]
    pub file: Option<String>,

    /// JSON 任务清单
    #[arg(short, long, help = "JSON 任务清单：[{\"url\", \"destination\", \"hash\", \"size\"}]。")]
    pub manifest: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 下载速度限制（KB/s），0 表示不限速
    #[arg(long, short = 'l', help = "下载速度限制（KB/s），0 表示不限速。")]
    pub speed_limit_kb: Option<u64>,

    #[arg(long, short = 'd', help = "指定下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    #[arg(long, short = 'j', help = "最大并发下载数，覆盖配置文件中的设置。")]
    pub jobs: Option<usize>,

    #[arg(long, short = 'p', default_value_t = 0, allow_negative_numbers = true, help = "任务优先级，数值越大越先执行。")]
    pub priority: i32,

    #[arg(long, help = "指定缓存目录，覆盖配置文件中的设置。")]
    pub cache_dir: Option<String>,

    #[arg(long, help = "跳过哈希校验（文件不会进入缓存）。")]
    pub no_verify: bool,

    #[arg(long, help = "显示缓存统计并退出。")]
    pub cache_stats: bool,

    #[arg(long, help = "清空缓存并退出。")]
    pub clear_cache: bool,

    #[arg(long, default_value = "logs/cachedown.log", help = "日志文件路径。")]
    pub log_file: String,
}

impl Args {
    /// 加载或创建配置文件，并合并命令行参数
    pub fn load_config(&self) -> Result<Config, DownloadError> {
        let mut config = Config::load(&self.config)?;
        config.merge_from_args(self);
        config.validate()?;
        Ok(config)
    }

    /// 是否只做缓存管理
    pub fn is_cache_command(&self) -> bool {
        self.cache_stats || self.clear_cache
    }

    /// 收集所有下载任务：命令行 URL、URL 文件、JSON 清单
    pub fn get_tasks(&self, config: &Config) -> Result<Vec<DownloadTask>, DownloadError> {
        let download_dir = Path::new(&config.download_dir);
        let mut tasks = Vec::new();

        for url in self.get_urls()? {
            let destination = download_dir.join(file_name_for(&url));
            tasks.push(DownloadTask::new(url, destination));
        }

        if let Some(manifest) = &self.manifest {
            for spec in read_manifest(Path::new(manifest))? {
                validator::validate_url(&spec.url)?;
                let mut task = DownloadTask::from(spec);
                if task.destination.is_relative() {
                    task.destination = download_dir.join(&task.destination);
                }
                tasks.push(task);
            }
        }

        // 验证任务列表不为空
        if tasks.is_empty() {
            return Err(DownloadError::InvalidUrl(
                "未提供任何URL。请通过命令行参数、URL文件或任务清单提供至少一个下载。".to_string(),
            ));
        }

        Ok(tasks)
    }

    /// 命令行和 URL 文件中的地址
    pub fn get_urls(&self) -> Result<Vec<String>, DownloadError> {
        let mut urls = Vec::new();
        for url in &self.urls {
            validator::validate_url(url)?;
            urls.push(url.clone());
        }

        if let Some(file_path) = &self.file {
            let content = fs::read_to_string(file_path)?;

            // 按行读取URL，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    validator::validate_url(line)?;
                    urls.push(line.to_string());
                }
            }
        }

        Ok(urls)
    }
}

/// 读取 JSON 任务清单
pub fn read_manifest(path: &Path) -> Result<Vec<TaskSpec>, DownloadError> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| DownloadError::ConfigError(format!("任务清单格式错误 {}: {}", path.display(), e)))
}

fn file_name_for(url: &str) -> PathBuf {
    match validator::file_name_from_url(url) {
        Some(name) => PathBuf::from(name),
        // 如果无法从URL提取，使用默认名称
        None => PathBuf::from(format!("download_{}", Uuid::new_v4().simple())),
    }
}

// 测试模块
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_args_parsing() {
        let args = parse(&["cachedown", "-j", "4", "-p", "-2", "https://example.com/file.zip"]);
        assert_eq!(args.urls, vec!["https://example.com/file.zip"]);
        assert_eq!(args.jobs, Some(4));
        assert_eq!(args.priority, -2);
        assert!(!args.is_cache_command());
        assert!(parse(&["cachedown", "--cache-stats"]).is_cache_command());
    }

    #[test]
    fn test_config_loading_merges_args() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("cachedown.conf");
        let config_path = config_path.to_str().unwrap();

        let args = parse(&[
            "cachedown", "-c", config_path, "-l", "256", "-d", "/tmp/dl", "--no-verify",
        ]);
        let config = args.load_config().unwrap();
        assert!(Path::new(config_path).exists());
        assert_eq!(config.speed_limit_kb, 256);
        assert_eq!(config.download_dir, "/tmp/dl");
        assert!(!config.verify_checksums);
    }

    #[test]
    fn test_url_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let url_file = dir.path().join("urls.txt");
        let content = "# 这是一个注释\nhttps://example.com/file1.zip\n\nhttps://example.com/file2.zip\n";
        fs::write(&url_file, content).unwrap();

        let args = parse(&["cachedown", "-f", url_file.to_str().unwrap()]);
        let urls = args.get_urls().unwrap();
        assert_eq!(urls, vec!["https://example.com/file1.zip", "https://example.com/file2.zip"]);

        fs::write(&url_file, "not a url\n").unwrap();
        assert!(matches!(args.get_urls(), Err(DownloadError::InvalidUrl(_))));
    }

    #[test]
    fn test_manifest_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.json");
        fs::write(
            &manifest,
            r#"[
                {"url": "https://example.com/lib.jar", "destination": "libs/lib.jar",
                 "sha1": "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED", "size": 11},
                {"url": "https://example.com/abs.bin", "destination": "/opt/abs.bin"}
            ]"#,
        )
        .unwrap();

        let args = parse(&["cachedown", "-m", manifest.to_str().unwrap(), "https://example.com/a/x.zip"]);
        let config = Config {
            download_dir: "/data".to_string(),
            ..Config::default()
        };
        let tasks = args.get_tasks(&config).unwrap();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].destination, Path::new("/data").join("x.zip"));
        assert_eq!(tasks[1].destination, Path::new("/data").join("libs/lib.jar"));
        assert_eq!(
            tasks[1].expected_hash.as_deref(),
            Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed")
        );
        assert_eq!(tasks[1].expected_size, Some(11));
        assert_eq!(tasks[2].destination, Path::new("/opt/abs.bin"));
    }

    #[test]
    fn test_no_tasks_is_an_error() {
        let args = parse(&["cachedown"]);
        assert!(args.get_tasks(&Config::default()).is_err());
    }
}
