//! 内容寻址缓存
//!
//! 以内容哈希为键保存已下载文件的副本，文件按哈希前两位分桶存放，
//! 总大小受 `max_size` 约束，超出时按最近最少使用（LRU）淘汰。
//! 索引保存在 `<cache_dir>/index.json`，每次修改后立即落盘。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::core::error::DownloadError;

const INDEX_FILE: &str = "index.json";
const TMP_SUFFIX: &str = "tmp";

/// 默认缓存上限：2 GiB
pub const DEFAULT_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// 压缩策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionPolicy {
    #[default]
    Never,
    Always,
    /// 文件大小不小于阈值时压缩
    AboveSize(u64),
}

impl CompressionPolicy {
    /// 配置中的阈值：0 表示不压缩
    pub fn from_threshold(threshold: u64) -> Self {
        match threshold {
            0 => CompressionPolicy::Never,
            1 => CompressionPolicy::Always,
            n => CompressionPolicy::AboveSize(n),
        }
    }

    fn should_compress(&self, size: u64) -> bool {
        match *self {
            CompressionPolicy::Never => false,
            CompressionPolicy::Always => true,
            CompressionPolicy::AboveSize(threshold) => size >= threshold,
        }
    }
}

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub original_path: PathBuf,
    /// 磁盘上实际占用的字节数
    pub size: u64,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default = "Utc::now")]
    pub last_access: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    /// 同一时刻多次访问时用于区分先后
    #[serde(skip)]
    touch_seq: u64,
}

/// 缓存统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub current_size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    current_size: u64,
    max_size: u64,
    next_seq: u64,
}

impl CacheState {
    fn touch(&mut self, hash: &str) {
        let seq = self.next_seq;
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.last_access = Utc::now();
            entry.access_count += 1;
            entry.touch_seq = seq;
            self.next_seq += 1;
        }
    }

    fn lru_entry(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_access
                    .cmp(&b.last_access)
                    .then(a.touch_seq.cmp(&b.touch_seq))
            })
            .map(|(hash, _)| hash.clone())
    }

    fn detach(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        self.current_size = self.current_size.saturating_sub(entry.size);
        Some(entry)
    }
}

/// 内容寻址缓存
pub struct CacheStore {
    root: PathBuf,
    compression: CompressionPolicy,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    /// 正在写临时文件的加入操作数
    staging: AtomicUsize,
}

impl CacheStore {
    /// 打开（或创建）缓存目录并加载索引
    pub fn open(
        root: impl Into<PathBuf>,
        max_size: u64,
        compression: CompressionPolicy,
    ) -> Result<Self, DownloadError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let store = Self {
            root,
            compression,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                current_size: 0,
                max_size,
                next_seq: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            staging: AtomicUsize::new(0),
        };
        store.load_index();

        {
            let mut state = store.lock();
            if state.current_size > state.max_size {
                log::info!(
                    "缓存大小 {} 超过上限 {}，开始淘汰",
                    state.current_size,
                    state.max_size
                );
                store.evict(&mut state, 0);
                store.save_index(&state);
            }
        }

        log::info!("缓存已初始化: {}", store.root.display());
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 哈希对应的缓存文件路径：`<root>/<前两位>/<hash>`
    pub fn cache_path(&self, hash: &str) -> PathBuf {
        match hash.get(..2) {
            Some(bucket) if hash.len() > 2 => self.root.join(bucket).join(hash),
            _ => self.root.join(hash),
        }
    }

    /// 把源文件加入缓存
    pub fn add(&self, source: &Path, hash: &str) -> Result<(), DownloadError> {
        self.staging.fetch_add(1, Ordering::SeqCst);
        let result = self.add_staged(source, hash);
        self.staging.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn add_staged(&self, source: &Path, hash: &str) -> Result<(), DownloadError> {
        let hash = normalize_hash(hash)?;
        let source_size = fs::metadata(source)?.len();
        let dest = self.cache_path(&hash);
        let bucket = dest.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(bucket)?;

        // 每次加入都写独立的临时文件，同一哈希的并发加入互不干扰
        let compressed = self.compression.should_compress(source_size);
        let staging = tempfile::Builder::new()
            .suffix(&format!(".{}", TMP_SUFFIX))
            .tempfile_in(bucket)?;
        if compressed {
            compress_file(source, staging.path())?;
        } else {
            fs::copy(source, staging.path())?;
        }
        let size = fs::metadata(staging.path())?.len();

        let mut state = self.lock();
        if size > state.max_size {
            return Err(DownloadError::CacheError(format!(
                "文件大小 {} 超过缓存上限 {}",
                size, state.max_size
            )));
        }

        // 替换已有条目时先释放旧的占用
        let previous = state.detach(&hash);
        if state.current_size + size > state.max_size {
            self.evict(&mut state, size);
        }

        if let Err(e) = staging.persist(&dest) {
            // 旧文件仍在原位，恢复它的条目
            if let Some(previous) = previous {
                if dest.exists() {
                    state.current_size += previous.size;
                    state.entries.insert(hash.clone(), previous);
                    self.evict(&mut state, 0);
                }
            }
            self.save_index(&state);
            return Err(e.error.into());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            hash.clone(),
            CacheEntry {
                original_path: source.to_path_buf(),
                size,
                compressed,
                last_access: Utc::now(),
                access_count: 1,
                touch_seq: seq,
            },
        );
        state.current_size += size;
        self.save_index(&state);

        log::debug!("已缓存 {} ({} 字节{})", hash, size, if compressed { ", 已压缩" } else { "" });
        Ok(())
    }

    pub fn has(&self, hash: &str) -> bool {
        self.lock().entries.contains_key(&hash.to_lowercase())
    }

    /// 查询缓存，命中时更新访问时间和次数
    pub fn get(&self, hash: &str) -> Option<PathBuf> {
        let hash = hash.to_lowercase();
        let mut state = self.lock();

        if !state.entries.contains_key(&hash) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let path = self.cache_path(&hash);
        if !path.exists() {
            log::warn!("缓存文件已丢失，移除条目: {}", hash);
            state.detach(&hash);
            self.save_index(&state);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        state.touch(&hash);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(path)
    }

    pub fn entry(&self, hash: &str) -> Option<CacheEntry> {
        self.lock().entries.get(&hash.to_lowercase()).cloned()
    }

    /// 把缓存内容复制到目标路径，未命中时返回 `Ok(false)`
    pub fn copy_to(&self, hash: &str, destination: &Path) -> Result<bool, DownloadError> {
        let Some(cached) = self.get(hash) else {
            return Ok(false);
        };
        let compressed = self.entry(hash).map(|e| e.compressed).unwrap_or(false);

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if compressed {
            decompress_file(&cached, destination)?;
        } else {
            fs::copy(&cached, destination)?;
        }
        Ok(true)
    }

    pub fn remove(&self, hash: &str) -> bool {
        let hash = hash.to_lowercase();
        let mut state = self.lock();
        let Some(_) = state.detach(&hash) else {
            return false;
        };
        if let Err(e) = fs::remove_file(self.cache_path(&hash)) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("删除缓存文件失败 {}: {}", hash, e);
            }
        }
        self.save_index(&state);
        true
    }

    /// 清空整个缓存
    pub fn clear(&self) -> Result<(), DownloadError> {
        let mut state = self.lock();
        let result = fs::remove_dir_all(&self.root);
        fs::create_dir_all(&self.root)?;

        state.entries.clear();
        state.current_size = 0;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.save_index(&state);

        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// 调整缓存上限，必要时立即淘汰
    pub fn set_max_size(&self, max_size: u64) {
        let mut state = self.lock();
        state.max_size = max_size;
        if state.current_size > state.max_size {
            self.evict(&mut state, 0);
        }
        self.save_index(&state);
    }

    /// 移除底层文件已被外部删除的条目，并清理索引之外的文件
    ///
    /// 返回移除的失效条目数。
    pub fn run_maintenance(&self) -> usize {
        let mut state = self.lock();
        let missing: Vec<String> = state
            .entries
            .keys()
            .filter(|hash| !self.cache_path(hash).exists())
            .cloned()
            .collect();
        for hash in &missing {
            state.detach(hash);
        }
        self.remove_unindexed_files(&state);
        self.save_index(&state);

        if !missing.is_empty() {
            log::info!("缓存维护: 移除 {} 个失效条目", missing.len());
        }
        missing.len()
    }

    pub fn current_size(&self) -> u64 {
        self.lock().current_size
    }

    pub fn max_size(&self) -> u64 {
        self.lock().max_size
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            current_size: state.current_size,
            max_size: state.max_size,
            hits: self.hit_count(),
            misses: self.miss_count(),
        }
    }

    /// 逐个淘汰最久未访问的条目，直到能放下 `required` 字节或缓存为空
    fn evict(&self, state: &mut CacheState, required: u64) {
        while state.current_size + required > state.max_size && !state.entries.is_empty() {
            let Some(lru) = state.lru_entry() else {
                break;
            };
            if let Some(entry) = state.detach(&lru) {
                if let Err(e) = fs::remove_file(self.cache_path(&lru)) {
                    if e.kind() != io::ErrorKind::NotFound {
                        log::warn!("淘汰缓存文件失败 {}: {}", lru, e);
                    }
                }
                log::debug!("淘汰缓存条目 {} ({} 字节)", lru, entry.size);
            }
        }
    }

    /// 删除桶目录中不在索引里的文件；有加入正在进行时保留临时文件
    fn remove_unindexed_files(&self, state: &CacheState) {
        let keep_staging = self.staging.load(Ordering::SeqCst) > 0;
        let Ok(buckets) = fs::read_dir(&self.root) else {
            return;
        };
        let mut removed = 0usize;
        for bucket in buckets.flatten() {
            let path = bucket.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(files) = fs::read_dir(&path) else {
                continue;
            };
            for file in files.flatten() {
                let file_path = file.path();
                if !file_path.is_file() {
                    continue;
                }
                let is_staging =
                    file_path.extension().and_then(|e| e.to_str()) == Some(TMP_SUFFIX);
                let indexed = file_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| state.entries.contains_key(name));
                if (is_staging && keep_staging) || (!is_staging && indexed) {
                    continue;
                }
                if fs::remove_file(&file_path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::info!("缓存维护: 删除 {} 个索引之外的文件", removed);
        }
    }

    fn load_index(&self) {
        let index_path = self.root.join(INDEX_FILE);
        if !index_path.exists() {
            return;
        }

        let loaded: Result<HashMap<String, CacheEntry>, DownloadError> = File::open(&index_path)
            .map_err(DownloadError::from)
            .and_then(|file| Ok(serde_json::from_reader(BufReader::new(file))?));

        match loaded {
            Ok(entries) => {
                let mut state = self.lock();
                let mut ordered: Vec<(String, CacheEntry)> = entries.into_iter().collect();
                ordered.sort_by(|(_, a), (_, b)| a.last_access.cmp(&b.last_access));
                for (hash, mut entry) in ordered {
                    entry.touch_seq = state.next_seq;
                    state.next_seq += 1;
                    state.current_size += entry.size;
                    state.entries.insert(hash, entry);
                }
                log::debug!("已加载缓存索引: {} 个条目", state.entries.len());
            }
            Err(e) => log::warn!("加载缓存索引失败: {}", e),
        }
    }

    fn save_index(&self, state: &CacheState) {
        if let Err(e) = self.write_index(state) {
            log::warn!("保存缓存索引失败: {}", e);
        }
    }

    fn write_index(&self, state: &CacheState) -> Result<(), DownloadError> {
        let index_path = self.root.join(INDEX_FILE);
        let staging = index_path.with_extension(format!("json.{}", TMP_SUFFIX));
        {
            let writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(writer, &state.entries)?;
        }
        fs::rename(&staging, &index_path)?;
        Ok(())
    }
}

fn normalize_hash(hash: &str) -> Result<String, DownloadError> {
    let hash = hash.trim().to_lowercase();
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DownloadError::InvalidHash(hash));
    }
    Ok(hash)
}

/// gzip 压缩文件
pub fn compress_file(input: &Path, output: &Path) -> Result<u64, DownloadError> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(output)?), Compression::default());
    let copied = io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    Ok(copied)
}

/// 解压 gzip 文件
pub fn decompress_file(input: &Path, output: &Path) -> Result<u64, DownloadError> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(input)?));
    let mut writer = BufWriter::new(File::create(output)?);
    let copied = io::copy(&mut decoder, &mut writer)?;
    Ok(copied)
}
