//! Case-insensitive header maps for captured browser headers.
//!
//! Jobs arrive with an opaque string-keyed header map captured from the
//! submitting browser. Header names must compare case-insensitively while
//! the original spelling is kept for the wire; insertion order is preserved
//! for debug output only.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: String,
    seq: u64,
}

/// A case-insensitive string header map with O(1) get/set/remove.
#[derive(Debug, Clone, Default)]
pub struct HeaderBag {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|e| e.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Insert or replace. Replacing keeps the entry's original position and
    /// spelling-of-record is updated to the new name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.name = name;
                entry.value = value;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(key, Entry { name, value, seq });
            }
        }
    }

    /// Insert only when the header is not already present.
    pub fn set_if_absent(&mut self, name: &str, value: &str) {
        if !self.contains(name) {
            self.set(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter_ordered(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_str()))
            .collect()
    }

    /// Convert to a reqwest header map, skipping entries reqwest rejects.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in self.iter_ordered() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    map.insert(n, v);
                }
                _ => warn!(header = name, "Skipping header not representable on the wire"),
            }
        }
        map
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderBag {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut bag = HeaderBag::new();
        for (k, v) in iter {
            bag.set(k, v);
        }
        bag
    }
}

/// Strip `br` from a captured `Accept-Encoding` header when the client was
/// built without brotli decompression. Idempotent; other encodings pass
/// through untouched, and an Accept-Encoding left empty is removed.
pub fn sanitize_accept_encoding(headers: &mut HeaderBag) {
    if cfg!(feature = "brotli") {
        return;
    }

    let Some(accept_encoding) = headers.get("Accept-Encoding").map(str::to_owned) else {
        return;
    };
    if !accept_encoding.to_ascii_lowercase().contains("br") {
        return;
    }

    let kept: Vec<&str> = accept_encoding
        .split(',')
        .map(str::trim)
        .filter(|part| !part.eq_ignore_ascii_case("br"))
        .collect();

    if kept.is_empty() {
        headers.remove("Accept-Encoding");
        warn!(original = %accept_encoding, "Removed Accept-Encoding (brotli-only, unsupported)");
    } else {
        let sanitized = kept.join(", ");
        warn!(original = %accept_encoding, sanitized = %sanitized, "Sanitized Accept-Encoding");
        headers.set("Accept-Encoding", sanitized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut bag = HeaderBag::new();
        bag.set("Referer", "https://example.com/page");
        assert_eq!(bag.get("referer"), Some("https://example.com/page"));
        assert_eq!(bag.get("REFERER"), Some("https://example.com/page"));
        assert!(bag.contains("ReFeReR"));
    }

    #[test]
    fn set_replaces_without_duplicating() {
        let mut bag = HeaderBag::new();
        bag.set("origin", "https://a.example");
        bag.set("Origin", "https://b.example");
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get("origin"), Some("https://b.example"));
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut bag = HeaderBag::new();
        bag.set("User-Agent", "x");
        bag.set("Referer", "y");
        bag.set("Cookie", "z");
        let names: Vec<&str> = bag.iter_ordered().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["User-Agent", "Referer", "Cookie"]);
    }

    #[test]
    fn remove_returns_value() {
        let mut bag = HeaderBag::new();
        bag.set("Range", "bytes=0-100");
        assert_eq!(bag.remove("range").as_deref(), Some("bytes=0-100"));
        assert!(bag.get("Range").is_none());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut bag: HeaderBag = [("Accept-Encoding", "gzip, deflate, br")]
            .into_iter()
            .collect();
        sanitize_accept_encoding(&mut bag);
        let once = bag.get("Accept-Encoding").map(str::to_owned);
        sanitize_accept_encoding(&mut bag);
        let twice = bag.get("Accept-Encoding").map(str::to_owned);
        assert_eq!(once, twice);
    }

    #[cfg(not(feature = "brotli"))]
    #[test]
    fn sanitize_strips_br_and_keeps_the_rest() {
        let mut bag: HeaderBag = [("Accept-Encoding", "gzip, deflate, br")]
            .into_iter()
            .collect();
        sanitize_accept_encoding(&mut bag);
        assert_eq!(bag.get("Accept-Encoding"), Some("gzip, deflate"));

        let mut only_br: HeaderBag = [("Accept-Encoding", "br")].into_iter().collect();
        sanitize_accept_encoding(&mut only_br);
        assert!(only_br.get("Accept-Encoding").is_none());
    }

    #[cfg(feature = "brotli")]
    #[test]
    fn sanitize_is_a_no_op_with_brotli_enabled() {
        let mut bag: HeaderBag = [("Accept-Encoding", "gzip, deflate, br")]
            .into_iter()
            .collect();
        sanitize_accept_encoding(&mut bag);
        assert_eq!(bag.get("Accept-Encoding"), Some("gzip, deflate, br"));
    }

    #[test]
    fn header_map_conversion_skips_invalid_entries() {
        let mut bag = HeaderBag::new();
        bag.set("Accept", "*/*");
        bag.set("Bad Name", "value");
        let map = bag.to_header_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("accept").unwrap(), "*/*");
    }
}
