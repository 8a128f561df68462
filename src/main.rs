use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use crossterm::{
    cursor, execute, terminal,
    event::{self, Event, KeyCode},
};
use log::LevelFilter;

use cachedown::cli::{self, Args};
use cachedown::config::Config;
use cachedown::core::cache::{CacheStore, CompressionPolicy};
use cachedown::core::manager::{CompleteCallback, DownloadManager, TaskOutcome};
use cachedown::ui::{self, DownloadSummary, ProgressManager};
use cachedown::utils::logger;

const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.edit_config {
        // 确保配置文件存在再打开
        Config::load(&args.config).context("无法创建配置文件")?;
        cli::open_config_in_editor(&args.config);
        return Ok(());
    }

    logger::init_logging(Some(&args.log_file), LevelFilter::Info, LOG_MAX_SIZE)?;
    log::info!("程序启动");

    let config = args.load_config().context("配置无效")?;
    log::info!("配置文件路径: {}", args.config);
    log::info!("{}", config.get_summary());

    if args.is_cache_command() {
        return run_cache_command(&args, &config);
    }

    let tasks = args.get_tasks(&config).context("获取下载任务失败")?;
    println!("{}", config.get_summary());

    let manager = DownloadManager::new(&config).context("无法创建下载管理器")?;
    let removed = manager.cache().run_maintenance();
    if removed > 0 {
        log::info!("启动时清理了 {} 个失效缓存条目", removed);
    }

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let on_complete: CompleteCallback = Arc::new(move |outcome: &TaskOutcome| {
        if let Ok(mut outcomes) = sink.lock() {
            outcomes.push(outcome.clone());
        }
    });

    let task_count = tasks.len();
    let started = Instant::now();
    let mut submitted = 0;
    for task in tasks {
        let url = task.url.clone();
        match manager.add_download(task, args.priority, None, Some(on_complete.clone())) {
            Ok(_) => submitted += 1,
            Err(e) => {
                log::error!("创建下载任务失败: {} - {}", url, e);
                ui::print_error(&format!("创建下载任务失败: {} - {}", url, e));
            }
        }
    }

    if submitted == 0 {
        eprintln!("没有可下载的任务");
        return Ok(());
    }

    println!("\n开始下载 {} 个任务... (按 'p' 暂停, 'r' 继续, 'c' 取消, 'q' 退出)", submitted);
    log::info!("开始下载 {} 个任务", submitted);

    run_download_loop(&manager)?;
    manager.wait_for_all();

    let overall = manager.overall_progress();
    let outcomes = outcomes.lock().map(|o| o.clone()).unwrap_or_default();
    for outcome in outcomes.iter().filter(|o| !o.is_success()) {
        ui::print_error(&format!(
            "{}: {}",
            outcome.url,
            outcome.error.as_deref().unwrap_or("未知错误")
        ));
    }

    let summary = DownloadSummary {
        total_files: task_count,
        total_size: outcomes.iter().filter(|o| o.is_success()).map(|o| o.bytes).sum(),
        elapsed_time: started.elapsed(),
        success_count: overall.completed + overall.cached,
        cached_count: overall.cached,
        failed_count: overall.failed,
        cancelled_count: overall.cancelled,
    };
    println!("{}", summary);
    log::info!(
        "下载完成 - 成功: {}, 缓存命中: {}, 失败: {}, 取消: {}",
        summary.success_count,
        summary.cached_count,
        summary.failed_count,
        summary.cancelled_count
    );

    manager.shutdown();
    Ok(())
}

fn run_cache_command(args: &Args, config: &Config) -> anyhow::Result<()> {
    let cache = CacheStore::open(
        &config.cache_dir,
        config.cache_max_size,
        CompressionPolicy::from_threshold(config.cache_compress_threshold),
    )
    .context("无法打开缓存目录")?;

    if args.clear_cache {
        cache.clear().context("清空缓存失败")?;
        ui::print_success(&format!("已清空缓存: {}", config.cache_dir));
    }

    if args.cache_stats {
        let removed = cache.run_maintenance();
        let stats = cache.stats();
        println!("缓存目录: {}", config.cache_dir);
        println!("  条目数: {}", stats.entries);
        println!(
            "  占用: {} / {}",
            ui::format_size(stats.current_size),
            ui::format_size(stats.max_size)
        );
        if removed > 0 {
            println!("  清理失效条目: {}", removed);
        }
    }
    Ok(())
}

/// 退出时恢复终端
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        terminal::enable_raw_mode().ok()?;
        let _ = execute!(std::io::stdout(), cursor::Hide);
        Some(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = execute!(std::io::stdout(), cursor::Show);
        let _ = terminal::disable_raw_mode();
    }
}

/// 运行下载主循环：处理键盘输入并刷新进度
fn run_download_loop(manager: &DownloadManager) -> anyhow::Result<()> {
    let overall = manager.overall_progress();
    let mut progress = ProgressManager::new(overall.total_bytes, overall.total);
    let mut last_update = Instant::now();

    // 非交互终端下没有键盘控制
    let guard = RawModeGuard::enable();
    if guard.is_none() {
        log::warn!("无法进入终端原始模式，键盘控制不可用");
    }

    loop {
        if guard.is_some() {
            if let Ok(true) = event::poll(KEYBOARD_POLL_INTERVAL) {
                if let Ok(Event::Key(key_event)) = event::read() {
                    match key_event.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => {
                            manager.cancel_all();
                            progress.println("用户退出");
                            log::info!("用户主动退出下载");
                            break;
                        }
                        KeyCode::Char('p') | KeyCode::Char('P') => {
                            manager.pause_all();
                            progress.println("已暂停所有下载任务");
                        }
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            manager.resume_all();
                            progress.println("已恢复所有下载任务");
                        }
                        KeyCode::Char('c') | KeyCode::Char('C') => {
                            manager.cancel_all();
                            progress.println("已取消所有下载任务");
                            log::info!("用户取消所有下载任务");
                        }
                        _ => {}
                    }
                }
            }
        } else {
            std::thread::sleep(KEYBOARD_POLL_INTERVAL);
        }

        if last_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
            progress.update_progress(&manager.overall_progress());
            if manager.pending_count() == 0 && manager.active_count() == 0 {
                break;
            }
            last_update = Instant::now();
        }
    }

    drop(guard);
    progress.finish();
    Ok(())
}
