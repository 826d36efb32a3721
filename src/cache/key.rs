//! Key validation and the two derived key forms.
//!
//! A source key is a URL. The *cache key* identifies one rendition of it
//! (the URL, suffixed with the corner radius when one is requested). The
//! *disk key* is the SHA-1 hex digest of the cache key and is the only form
//! that ever reaches the filesystem.

use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;

/// Schemes the transport can fetch.
pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https"];

/// Length of a disk key in hex characters.
pub const DISK_KEY_LEN: usize = 40;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("key {key:?} is not a valid URL: {reason}")]
    Malformed { key: String, reason: String },

    #[error("scheme {scheme:?} is not supported")]
    UnsupportedScheme { scheme: String },
}

/// Validate a source key and parse it into a URL.
pub fn parse_key(key: &str) -> Result<Url, KeyError> {
    if key.trim().is_empty() {
        return Err(KeyError::Empty);
    }
    let url = Url::parse(key).map_err(|e| KeyError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(KeyError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }
    Ok(url)
}

/// Cache key of the rendition of `key` with the given corner radius.
pub fn cache_key(key: &str, corner_radius: u32) -> String {
    if corner_radius > 0 {
        format!("{key}_{corner_radius}")
    } else {
        key.to_string()
    }
}

/// Fixed-length filename form of a cache key.
pub fn disk_key(cache_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(cache_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `name` has the shape of a disk key.
pub fn is_disk_key(name: &str) -> bool {
    name.len() == DISK_KEY_LEN && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_and_unsupported() {
        assert_eq!(parse_key(""), Err(KeyError::Empty));
        assert_eq!(parse_key("   "), Err(KeyError::Empty));
        assert!(matches!(
            parse_key("ftp://x/a.png"),
            Err(KeyError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            parse_key("not a url"),
            Err(KeyError::Malformed { .. })
        ));
    }

    #[test]
    fn test_accepts_http_and_https() {
        assert!(parse_key("http://x/a.png").is_ok());
        assert!(parse_key("https://x/a.png?size=2").is_ok());
    }

    #[test]
    fn test_cache_key_variant_suffix() {
        assert_eq!(cache_key("http://x/a.png", 0), "http://x/a.png");
        assert_eq!(cache_key("http://x/a.png", 8), "http://x/a.png_8");
    }

    #[test]
    fn test_disk_key_is_sha1_hex() {
        // sha1("abc")
        assert_eq!(disk_key("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        let key = disk_key("http://x/../../etc/passwd");
        assert!(is_disk_key(&key));
        assert_ne!(disk_key("http://x/a.png"), disk_key("http://x/a.png_8"));
    }
}
