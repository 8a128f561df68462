use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::core::error::DownloadError;

/// 超速时每个数据块插入的等待时间
pub const THROTTLE_PAUSE: Duration = Duration::from_millis(10);

/// 支持的内容哈希算法，按十六进制摘要长度区分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn from_hex_digest(digest: &str) -> Option<Self> {
        match digest.len() {
            40 => Some(HashAlgorithm::Sha1),
            64 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// 计算文件的十六进制摘要（小写）
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String, DownloadError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = [0u8; 8192];
    match algorithm {
        HashAlgorithm::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// 校验文件摘要，不匹配时错误中带上实际摘要
pub fn verify_file_hash(path: &Path, expected: &str) -> Result<(), DownloadError> {
    let algorithm = HashAlgorithm::from_hex_digest(expected)
        .ok_or_else(|| DownloadError::InvalidHash(expected.to_string()))?;
    let actual = hash_file(path, algorithm)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            expected: expected.to_lowercase(),
            actual,
        })
    }
}

/// 缓冲区管理器
pub struct BufferManager {
    buffer: Vec<u8>,
    buffer_size: usize,
    current_pos: usize,
    file_handle: File,
    total_written: u64,
}

impl BufferManager {
    /// 创建目标文件（截断旧内容）
    pub fn new(file_path: &Path, buffer_size: usize) -> Result<Self, DownloadError> {
        let file_handle = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(file_path)?;

        Ok(Self {
            buffer: vec![0; buffer_size],
            buffer_size,
            current_pos: 0,
            file_handle,
            total_written: 0,
        })
    }

    /// 向缓冲区写入数据
    pub fn write(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        let mut bytes_written = 0;
        while bytes_written < data.len() {
            let space_left = self.buffer_size - self.current_pos;
            let to_copy = std::cmp::min(space_left, data.len() - bytes_written);

            if to_copy > 0 {
                self.buffer[self.current_pos..self.current_pos + to_copy]
                    .copy_from_slice(&data[bytes_written..bytes_written + to_copy]);
                self.current_pos += to_copy;
                bytes_written += to_copy;
            }

            if self.current_pos == self.buffer_size {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// 将缓冲区内容刷入文件
    pub fn flush(&mut self) -> Result<(), DownloadError> {
        if self.current_pos > 0 {
            self.file_handle.write_all(&self.buffer[..self.current_pos])?;
            self.total_written += self.current_pos as u64;
            self.current_pos = 0;
        }
        Ok(())
    }

    /// 刷新并同步到磁盘
    pub fn finish(mut self) -> Result<u64, DownloadError> {
        self.flush()?;
        self.file_handle.sync_all()?;
        Ok(self.total_written)
    }

    /// 获取总写入字节数（含缓冲区中未刷新的部分）
    pub fn get_total_written(&self) -> u64 {
        self.total_written + self.current_pos as u64
    }
}

/// 粗粒度限速器：测得的速度超过上限时短暂休眠，不做精确的令牌桶
#[derive(Debug, Clone, Default)]
pub struct SpeedLimiter {
    limit: Arc<AtomicU64>,
}

impl SpeedLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            limit: Arc::new(AtomicU64::new(bytes_per_sec)),
        }
    }

    /// 0 表示不限速
    pub fn set_limit(&self, bytes_per_sec: u64) {
        self.limit.store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn wait_if_needed(&self, speed: f64) -> Duration {
        let limit = self.limit();
        if limit > 0 && speed > limit as f64 {
            THROTTLE_PAUSE
        } else {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_algorithm_detection() {
        assert_eq!(HashAlgorithm::from_hex_digest(&"a".repeat(40)), Some(HashAlgorithm::Sha1));
        assert_eq!(HashAlgorithm::from_hex_digest(&"a".repeat(64)), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_hex_digest("abc"), None);
    }

    #[test]
    fn test_hash_file_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha1).unwrap(),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha256).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_file_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(verify_file_hash(&path, "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED").is_ok());
        let err = verify_file_hash(&path, &"0".repeat(40)).unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(matches!(
            verify_file_hash(&path, "xyz").unwrap_err(),
            DownloadError::InvalidHash(_)
        ));
    }

    #[test]
    fn test_buffer_manager_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut buffer = BufferManager::new(&path, 4).unwrap();
        buffer.write(b"0123456789").unwrap();
        assert_eq!(buffer.get_total_written(), 10);
        assert_eq!(buffer.finish().unwrap(), 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }

    #[test]
    fn test_speed_limiter() {
        let limiter = SpeedLimiter::new(0);
        assert_eq!(limiter.wait_if_needed(1e9), Duration::ZERO);
        limiter.set_limit(1024);
        assert_eq!(limiter.wait_if_needed(512.0), Duration::ZERO);
        assert_eq!(limiter.wait_if_needed(4096.0), THROTTLE_PAUSE);
    }
}
