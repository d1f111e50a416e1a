use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
pub const HASH_LEN: usize = 12;

/// Build arguments as `(key, value)` pairs sorted by key.
pub fn sorted_args(args: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = args
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    pairs
}

/// Content hash of a Dockerfile and its build arguments.
///
/// The digest covers the Dockerfile bytes followed by one `key=value\n` line
/// per argument in key order, so argument order never changes the result.
pub fn content_hash(dockerfile: &[u8], args: &[(String, String)]) -> String {
    let mut ordered: Vec<&(String, String)> = args.iter().collect();
    ordered.sort();

    let mut hasher = Sha256::new();
    hasher.update(dockerfile);
    for (key, value) in ordered {
        hasher.update(format!("{key}={value}\n").as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(HASH_LEN);
    digest
}

/// `<namespace>/<toolchain>:<hash>`, with the repository part made docker-safe.
pub fn image_tag(namespace: &str, toolchain: &str, hash: &str) -> String {
    format!(
        "{}/{}:{hash}",
        repository_component(namespace),
        repository_component(toolchain)
    )
}

fn repository_component(name: &str) -> String {
    name.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn hash_is_twelve_hex_chars() {
        let hash = content_hash(b"FROM ubuntu:22.04\n", &[]);
        assert_eq!(hash.len(), HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_ignores_argument_order() {
        let dockerfile = b"FROM debian:bookworm\nARG GCC_VERSION\n";
        let a = content_hash(dockerfile, &pairs(&[("GCC_VERSION", "13"), ("CMAKE", "3.28")]));
        let b = content_hash(dockerfile, &pairs(&[("CMAKE", "3.28"), ("GCC_VERSION", "13")]));
        assert_eq!(a, b);
        assert_eq!(a, content_hash(dockerfile, &pairs(&[("CMAKE", "3.28"), ("GCC_VERSION", "13")])));
    }

    #[test]
    fn hash_changes_with_content_or_args() {
        let base = content_hash(b"FROM a\n", &pairs(&[("X", "1")]));
        assert_ne!(base, content_hash(b"FROM b\n", &pairs(&[("X", "1")])));
        assert_ne!(base, content_hash(b"FROM a\n", &pairs(&[("X", "2")])));
        assert_ne!(base, content_hash(b"FROM a\n", &[]));
    }

    #[test]
    fn hash_matches_manual_digest() {
        let expected = hex::encode(Sha256::digest(b"FROM a\nA=1\nB=2\n"));
        let hash = content_hash(b"FROM a\n", &pairs(&[("B", "2"), ("A", "1")]));
        assert_eq!(hash, expected[..HASH_LEN]);
    }

    #[test]
    fn sorted_args_orders_by_key() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), "2".to_string());
        map.insert("a".to_string(), "1".to_string());
        assert_eq!(sorted_args(&map), pairs(&[("a", "1"), ("b", "2")]));
    }

    #[test]
    fn tag_sanitizes_repository_names() {
        assert_eq!(
            image_tag("cxci", "Linux AMD64", "abc123def456"),
            "cxci/linux-amd64:abc123def456"
        );
    }
}
