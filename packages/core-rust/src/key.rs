//! Key normalization for the colon-delimited storage namespace.
//!
//! Every key that reaches a driver has passed through [`normalize_key`]:
//! query suffixes are stripped, `/` and `\` become [`KEY_SEPARATOR`], runs of
//! separators collapse, and leading/trailing separators are trimmed. Mount
//! bases additionally carry a trailing separator (see [`normalize_base_key`])
//! so that a mount at `cache` serves `cache:x` but never `cachex`.

/// Canonical hierarchy separator.
pub const KEY_SEPARATOR: char = ':';

/// Suffix marking the companion key that holds a key's user metadata.
pub const META_SUFFIX: char = '$';

/// Converts an arbitrary path-like string into a canonical key.
///
/// Idempotent: `normalize_key(&normalize_key(k)) == normalize_key(k)`.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    let key = key.split('?').next().unwrap_or_default();
    let mut normalized = String::with_capacity(key.len());

    for ch in key.chars() {
        let ch = if ch == '/' || ch == '\\' { KEY_SEPARATOR } else { ch };
        if ch == KEY_SEPARATOR
            && (normalized.is_empty() || normalized.ends_with(KEY_SEPARATOR))
        {
            continue;
        }
        normalized.push(ch);
    }

    if normalized.ends_with(KEY_SEPARATOR) {
        normalized.pop();
    }
    normalized
}

/// Normalizes a mount or listing base: a non-empty base always ends with
/// [`KEY_SEPARATOR`], the root base is the empty string.
#[must_use]
pub fn normalize_base_key(base: &str) -> String {
    let mut base = normalize_key(base);
    if !base.is_empty() {
        base.push(KEY_SEPARATOR);
    }
    base
}

/// Joins key fragments and normalizes the result.
#[must_use]
pub fn join_keys(parts: &[&str]) -> String {
    normalize_key(&parts.join(":"))
}

/// Companion key under which user metadata for `key` is stored.
#[must_use]
pub fn meta_key(key: &str) -> String {
    let mut meta = normalize_key(key);
    meta.push(META_SUFFIX);
    meta
}

/// Whether `key` is a metadata companion key.
#[must_use]
pub fn is_meta_key(key: &str) -> bool {
    key.ends_with(META_SUFFIX)
}

/// Number of segments in `key` below `base`.
///
/// `key_depth("a:b:c", "a:")` is 2. A key outside `base` is measured in full.
#[must_use]
pub fn key_depth(key: &str, base: &str) -> usize {
    let relative = key.strip_prefix(base).unwrap_or(key);
    relative
        .split(KEY_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .count()
}

/// Depth filter used when a driver cannot limit listing depth natively.
#[must_use]
pub fn filter_key_by_depth(key: &str, base: &str, max_depth: Option<usize>) -> bool {
    match max_depth {
        Some(depth) => key_depth(key, base) <= depth,
        None => true,
    }
}

/// Base filter applied to every listed key: the key lies under `base` and
/// is not a metadata companion.
#[must_use]
pub fn filter_key_by_base(key: &str, base: &str) -> bool {
    !is_meta_key(key) && (base.is_empty() || key.starts_with(base))
}
