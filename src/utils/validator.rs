use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::config::Config;
use crate::core::error::DownloadError;

fn hash_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[0-9a-fA-F]{40}|[0-9a-fA-F]{64})$").expect("哈希正则表达式无效")
    })
}

/// 只接受带主机名的 http/https 地址
pub fn is_valid_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

/// 十六进制 SHA-1（40 位）或 SHA-256（64 位）
pub fn is_valid_hash(hash: &str) -> bool {
    hash_pattern().is_match(hash.trim())
}

pub fn validate_url(url: &str) -> Result<(), DownloadError> {
    if is_valid_url(url) {
        Ok(())
    } else {
        Err(DownloadError::InvalidUrl(url.to_string()))
    }
}

pub fn validate_hash(hash: &str) -> Result<(), DownloadError> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(DownloadError::InvalidHash(hash.to_string()))
    }
}

pub fn validate_config(config: &Config) -> Result<(), DownloadError> {
    config.validate()
}

/// 从 URL 路径推断文件名
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://example.com/a/b.jar"));
        assert!(!is_valid_url("ftp://example.com/file"));
        assert!(!is_valid_url("invalid-url"));
        assert!(!is_valid_url("https://"));
        assert!(matches!(validate_url("file:///etc/passwd"), Err(DownloadError::InvalidUrl(_))));
    }

    #[test]
    fn test_hash_validation() {
        assert!(is_valid_hash("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"));
        assert!(is_valid_hash(&"AB".repeat(32)));
        assert!(!is_valid_hash("abc"));
        assert!(!is_valid_hash(&"g".repeat(40)));
        assert!(validate_hash(&"0".repeat(41)).is_err());
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://example.com/libs/a.jar?x=1").as_deref(),
            Some("a.jar")
        );
        assert_eq!(file_name_from_url("https://example.com/"), None);
    }

    #[test]
    fn test_validate_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }
}
