//! Catalog identifiers and origin tags.
//!
//! An origin tag is a catalog-episode identifier (`tt1234567` or
//! `tt1234567:1:5`) describing which request context observed a set of files.

use once_cell::sync::Lazy;
use regex::Regex;

/// Wildcard origin tag: the observation applies regardless of provenance.
pub const WILDCARD_ORIGIN_TAG: &str = "*";

static ORIGIN_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^tt[0-9]+(:[0-9]{1,2}:[0-9]{1,3})?$").expect("origin tag pattern is valid")
});

/// Return the tag unchanged when it has the shape of a catalog-episode id,
/// otherwise the empty tag.
pub fn normalize_origin_tag(tag: &str) -> String {
    if ORIGIN_TAG_RE.is_match(tag) {
        tag.to_string()
    } else {
        String::new()
    }
}

/// Like [`normalize_origin_tag`] but also accepts the wildcard tag.
pub fn normalize_write_tag(tag: &str) -> String {
    if tag == WILDCARD_ORIGIN_TAG {
        tag.to_string()
    } else {
        normalize_origin_tag(tag)
    }
}

/// Season/episode-insensitive root of a catalog id.
pub fn root_id(catalog_id: &str) -> &str {
    catalog_id.split(':').next().unwrap_or(catalog_id)
}

/// Whether `value` is a supported catalog id: `tt<digits>[:season[:episode]]`.
/// Only IMDb-style roots are supported.
pub fn is_catalog_id(value: &str) -> bool {
    let mut parts = value.split(':');
    let root = parts.next().unwrap_or_default();
    if root.len() < 3 || !root.starts_with("tt") || !root[2..].bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    parts.by_ref().take(2).all(|p| p.parse::<u32>().is_ok()) && parts.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_tag_normalization() {
        assert_eq!(normalize_origin_tag("tt0111161"), "tt0111161");
        assert_eq!(normalize_origin_tag("tt0944947:1:5"), "tt0944947:1:5");
        assert_eq!(normalize_origin_tag("tt0944947:1"), "");
        assert_eq!(normalize_origin_tag("tt0944947:123:5"), "");
        assert_eq!(normalize_origin_tag("kitsu:123"), "");
        assert_eq!(normalize_origin_tag("*"), "");
        assert_eq!(normalize_write_tag("*"), "*");
    }

    #[test]
    fn test_root_id() {
        assert_eq!(root_id("tt0944947:1:5"), "tt0944947");
        assert_eq!(root_id("tt0111161"), "tt0111161");
    }

    #[test]
    fn test_catalog_id_validation() {
        assert!(is_catalog_id("tt0944947:2:10"));
        assert!(is_catalog_id("tt0944947:2"));
        assert!(is_catalog_id("tt0111161"));
        assert!(!is_catalog_id("kitsu:1"));
        assert!(!is_catalog_id("tt"));
        assert!(!is_catalog_id("tt1:x"));
        assert!(!is_catalog_id("tt1:1:"));
        assert!(!is_catalog_id("tt1:1:1:1"));
    }
}
