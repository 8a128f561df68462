//! cachedown: 带内容寻址缓存的并发下载库
//!
//! 下载请求先查缓存，命中时直接复制；未命中时由固定大小的线程池执行
//! 带重试、限速和哈希校验的传输，成功后把文件登记进缓存。

pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
pub mod utils;
