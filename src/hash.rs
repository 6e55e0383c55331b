//! Stable filename derivation for cache keys.

use md5::{Digest, Md5};

/// Hashes a URL into a stable 32-character uppercase hex filename.
///
/// MD5 is a cache-key choice, not a security one; the requirement is a stable
/// collision-resistant digest over the URL's UTF-8 bytes.
pub fn url_hash(url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    hex::encode_upper(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(url_hash(""), "D41D8CD98F00B204E9800998ECF8427E");
        assert_eq!(url_hash("abc"), "900150983CD24FB0D6963F7D28E17F72");
    }

    #[test]
    fn shape_is_stable() {
        let a = url_hash("https://example.com/a.png");
        let b = url_hash("https://example.com/b.png");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(a, b);
        assert_eq!(a, url_hash("https://example.com/a.png"));
    }
}
