//! Deterministic backend identifiers and display names
//!
//! Every identifier is `<name>_<suffix>`, where the suffix is derived from the
//! owning resource's UID. The name portion is truncated when the result would
//! exceed the backend limit. The suffix never is, so two resources whose names
//! share a long prefix still get distinct identifiers.

use sha1::{Digest, Sha1};

/// Backend limit for object identifiers
pub const MAX_ID_LENGTH: usize = 255;

/// Backend limit for display names
pub const MAX_DISPLAY_NAME_LENGTH: usize = 255;

/// Backend limit for tag scopes
pub const MAX_TAG_SCOPE_LENGTH: usize = 128;

/// Backend limit for tag values
pub const MAX_TAG_VALUE_LENGTH: usize = 256;

/// Kubernetes limit for the name segment of a label key
pub const MAX_LABEL_KEY_NAME_LENGTH: usize = 63;

/// Kubernetes limit for label values
pub const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Length of the hex hash suffix
pub const HASH_LENGTH: usize = 8;

/// Length of the base-62 suffix used by rule identifiers
pub const SHORT_HASH_LENGTH: usize = 6;

/// Separator between the name portion and the suffix
pub const SEPARATOR: char = '_';

const BASE62_CHARSET: &[u8; 62] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn sha1_digest(input: &str) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(input.as_bytes()));
    out
}

/// Lowercase hex SHA-1 of `input`, truncated to [`HASH_LENGTH`] characters
pub fn hash_hex(input: &str) -> String {
    let digest = sha1_digest(input);
    hex::encode(&digest[..HASH_LENGTH / 2])
}

/// Base-62 rendering of the SHA-1 of `input`, truncated to `len` characters.
///
/// The digest is read as one big-endian integer and re-expressed in radix 62,
/// most significant digit first.
pub fn hash_base62(input: &str, len: usize) -> String {
    let mut number = sha1_digest(input).to_vec();
    let mut digits = Vec::with_capacity(28);

    while number.iter().any(|b| *b != 0) {
        let mut remainder: u32 = 0;
        for byte in number.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            *byte = (acc / 62) as u8;
            remainder = acc % 62;
        }
        digits.push(BASE62_CHARSET[remainder as usize]);
    }
    if digits.is_empty() {
        digits.push(BASE62_CHARSET[0]);
    }

    digits.iter().rev().take(len).map(|b| *b as char).collect()
}

/// Characters that must not end the name portion of an identifier
pub fn is_boundary_char(c: char) -> bool {
    matches!(c, '-' | '.' | '_' | ':' | '/')
}

/// Join `name` and `suffix` with [`SEPARATOR`], truncating `name` so the
/// result fits in `limit` characters.
///
/// When truncation happens the cut point backs off past any trailing
/// separator or punctuation so the name portion never ends in one.
pub fn join_truncated(name: &str, suffix: &str, limit: usize) -> String {
    let suffix_len = suffix.chars().count();
    let full_len = name.chars().count() + 1 + suffix_len;
    if full_len <= limit {
        return format!("{name}{SEPARATOR}{suffix}");
    }

    let budget = limit.saturating_sub(suffix_len + 1);
    let mut kept: Vec<char> = name.chars().take(budget).collect();
    while kept.last().is_some_and(|c| is_boundary_char(*c)) {
        kept.pop();
    }
    if kept.is_empty() {
        return suffix.chars().take(limit).collect();
    }

    let mut out: String = kept.into_iter().collect();
    out.push(SEPARATOR);
    out.push_str(suffix);
    out
}

/// Identifier for an object owned by the resource with `uid`
pub fn generate_id(name: &str, uid: &str, limit: usize) -> String {
    join_truncated(name, &hash_hex(uid), limit)
}

/// Identifier with a short base-62 suffix, for tight budgets such as rules
pub fn generate_short_id(name: &str, uid: &str, limit: usize) -> String {
    join_truncated(name, &hash_base62(uid, SHORT_HASH_LENGTH), limit)
}

/// Display name for an object; kept verbatim unless it exceeds `limit`
pub fn generate_display_name(name: &str, uid: &str, limit: usize) -> String {
    if name.chars().count() <= limit {
        name.to_string()
    } else {
        generate_id(name, uid, limit)
    }
}

/// Fit an arbitrary string into `limit` characters, hashing the full original
/// when truncation is needed so distinct long inputs stay distinct.
pub fn truncate_with_hash(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        value.to_string()
    } else {
        join_truncated(value, &hash_hex(value), limit)
    }
}

/// Normalize a Kubernetes label key into a tag scope.
///
/// The prefix path (`example.com/`) is dropped before truncation.
pub fn normalize_label_key(key: &str, limit: usize) -> String {
    let name = key.rsplit_once('/').map_or(key, |(_, name)| name);
    truncate_with_hash(name, limit.min(MAX_LABEL_KEY_NAME_LENGTH))
}

/// Normalize a Kubernetes label value into a tag value
pub fn normalize_label_value(value: &str, limit: usize) -> String {
    truncate_with_hash(value, limit.min(MAX_LABEL_VALUE_LENGTH))
}

/// Backend-legal characters only: anything outside `[A-Za-z0-9._-]` becomes `-`
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: &str = "c3a8b1f2-5d6e-4f70-8a9b-0c1d2e3f4a5b";

    #[test]
    fn test_hash_hex_is_short_lowercase_hex() {
        let h = hash_hex(UID);
        assert_eq!(h.len(), HASH_LENGTH);
        assert!(h
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Known SHA-1 prefix of the empty string
        assert_eq!(hash_hex(""), "da39a3ee");
    }

    #[test]
    fn test_hash_base62_uses_custom_charset() {
        let h = hash_base62(UID, SHORT_HASH_LENGTH);
        assert_eq!(h.len(), SHORT_HASH_LENGTH);
        assert!(h.bytes().all(|b| BASE62_CHARSET.contains(&b)));
        assert_eq!(h, hash_base62(UID, SHORT_HASH_LENGTH));
        assert_ne!(h, hash_base62("another-uid", SHORT_HASH_LENGTH));
    }

    #[test]
    fn test_short_names_are_not_truncated() {
        let id = generate_id("web", UID, MAX_ID_LENGTH);
        assert_eq!(id, format!("web_{}", hash_hex(UID)));
    }

    /// Story: identifiers never exceed the limit, whatever the input length
    #[test]
    fn story_ids_respect_limit() {
        for len in [0, 1, 10, 54, 55, 56, 100, 300] {
            let name = "a".repeat(len);
            for limit in [20, 64, MAX_ID_LENGTH] {
                let id = generate_id(&name, UID, limit);
                assert!(id.chars().count() <= limit, "{id} exceeds {limit}");
            }
        }
    }

    /// Story: same inputs always produce the same identifier
    #[test]
    fn story_ids_are_deterministic() {
        let name = "ns-with-a-fairly-long-name_policy-with-a-long-name".repeat(4);
        assert_eq!(generate_id(&name, UID, 64), generate_id(&name, UID, 64));
        assert_eq!(
            generate_short_id(&name, UID, 64),
            generate_short_id(&name, UID, 64)
        );
    }

    /// Story: a long colon-separated name keeps its hash and never leaves a
    /// dangling separator before it
    #[test]
    fn story_long_cluster_name_truncates_cleanly() {
        let name = format!("k8scl-one:test{}", "-".repeat(60));
        let limit = 30;

        let id = generate_id(&name, UID, limit);
        assert_eq!(id, generate_id(&name, UID, limit));
        assert!(id.chars().count() <= limit);

        let (head, hash) = id.rsplit_once(SEPARATOR).unwrap();
        assert_eq!(hash.len(), HASH_LENGTH);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_hex(UID));
        let last = head.chars().last().unwrap();
        assert!(!matches!(last, '-' | '.' | '_'), "dangling {last:?} in {id}");
        assert_eq!(head, "k8scl-one:test");
    }

    #[test]
    fn test_truncation_backs_off_over_punctuation() {
        // Cut point lands right after "abc-._"
        let id = join_truncated("abc-._defghij", "h", 8);
        assert_eq!(id, "abc_h");
    }

    #[test]
    fn test_suffix_survives_when_name_is_all_punctuation() {
        let id = join_truncated("------------", "abcd1234", 10);
        assert_eq!(id, "abcd1234");
    }

    #[test]
    fn test_distinct_names_with_shared_prefix_get_distinct_ids() {
        let prefix = "x".repeat(300);
        let a = generate_id(&format!("{prefix}a"), "uid-a", MAX_ID_LENGTH);
        let b = generate_id(&format!("{prefix}b"), "uid-b", MAX_ID_LENGTH);
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_name_kept_when_short() {
        assert_eq!(generate_display_name("web", UID, 255), "web");
        let long = "w".repeat(300);
        let display = generate_display_name(&long, UID, 255);
        assert_eq!(display.len(), 255);
        assert!(display.ends_with(&hash_hex(UID)));
    }

    /// Story: label keys lose their prefix path, long keys and values get hashed
    #[test]
    fn story_label_normalization() {
        assert_eq!(
            normalize_label_key("app.kubernetes.io/name", MAX_TAG_SCOPE_LENGTH),
            "name"
        );
        assert_eq!(normalize_label_key("tier", MAX_TAG_SCOPE_LENGTH), "tier");

        let long_key = format!("example.com/{}", "k".repeat(80));
        let key = normalize_label_key(&long_key, MAX_TAG_SCOPE_LENGTH);
        assert_eq!(key.len(), MAX_LABEL_KEY_NAME_LENGTH);
        assert!(key.ends_with(&hash_hex(&"k".repeat(80))));

        let long_value = "v".repeat(100);
        let value = normalize_label_value(&long_value, MAX_TAG_VALUE_LENGTH);
        assert_eq!(value.len(), MAX_LABEL_VALUE_LENGTH);
        assert_eq!(normalize_label_value("frontend", MAX_TAG_VALUE_LENGTH), "frontend");
    }

    #[test]
    fn test_sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize("k8scl-one:test/ns"), "k8scl-one-test-ns");
        assert_eq!(sanitize("ok_name-1.2"), "ok_name-1.2");
    }
}
