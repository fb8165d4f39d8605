//! Cache key encoding and glob patterns over entity ids.
//!
//! Keys encode as `entity_type:entity_id`. Entity type names never contain
//! the separator, so decoding splits on the first `:` and ids may contain
//! further separators.

use concord_core::{ConcordResult, ConfigError, EntityId, EntityKey, EntityType, KEY_SEPARATOR};
use regex::Regex;
use std::fmt;

/// Key of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    entity_type: EntityType,
    entity_id: EntityId,
}

impl CacheKey {
    pub fn new(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.entity_type, KEY_SEPARATOR, self.entity_id)
    }

    /// Decode `type:id`. Returns `None` without a separator or with an empty
    /// half.
    pub fn decode(encoded: &str) -> Option<Self> {
        let (ty, id) = encoded.split_once(KEY_SEPARATOR)?;
        if ty.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(EntityType::new(ty), EntityId::new(id)))
    }

    /// Prefix shared by every key of `entity_type`.
    pub fn type_prefix(entity_type: &EntityType) -> String {
        format!("{}{}", entity_type, KEY_SEPARATOR)
    }

    pub fn into_entity_key(self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
        }
    }
}

impl From<&EntityKey> for CacheKey {
    fn from(key: &EntityKey) -> Self {
        Self::new(key.entity_type.clone(), key.entity_id.clone())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Glob over entity ids where `*` spans any run of characters and `?`
/// exactly one. Everything else matches literally.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> ConcordResult<Self> {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push_str("^(?s:");
        let mut literal = String::new();
        for c in glob.chars() {
            match c {
                '*' | '?' => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push_str(")$");

        let regex = Regex::new(&source).map_err(|e| ConfigError::InvalidValue {
            field: "pattern".to_string(),
            value: glob.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.glob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_decode() {
        let key = CacheKey::new("user".into(), "42".into());
        assert_eq!(key.encode(), "user:42");
        assert_eq!(CacheKey::decode("user:42"), Some(key));
    }

    #[test]
    fn test_decode_keeps_separators_in_id() {
        let key = CacheKey::decode("doc:a:b:c").unwrap();
        assert_eq!(key.entity_type().as_str(), "doc");
        assert_eq!(key.entity_id().as_str(), "a:b:c");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(CacheKey::decode("user"), None);
        assert_eq!(CacheKey::decode(":42"), None);
        assert_eq!(CacheKey::decode("user:"), None);
    }

    #[test]
    fn test_keys_sort_by_type_then_id() {
        let mut keys = vec![
            CacheKey::new("b".into(), "1".into()),
            CacheKey::new("a".into(), "2".into()),
            CacheKey::new("a".into(), "10".into()),
        ];
        keys.sort();
        let encoded: Vec<String> = keys.iter().map(CacheKey::encode).collect();
        assert_eq!(encoded, vec!["a:10", "a:2", "b:1"]);
    }

    fn glob(pattern: &str, text: &str) -> bool {
        KeyPattern::new(pattern).unwrap().matches(text)
    }

    #[test]
    fn test_glob() {
        assert!(glob("*", ""));
        assert!(glob("*", "anything"));
        assert!(glob("user-*", "user-17"));
        assert!(!glob("user-*", "admin-17"));
        assert!(glob("a?c", "abc"));
        assert!(!glob("a?c", "ac"));
        assert!(glob("*-draft-*", "x-draft-y"));
        assert!(glob("a*b*c", "aXXbYYc"));
        assert!(!glob("a*b*c", "aXXbYY"));
        assert!(glob("exact", "exact"));
        assert!(!glob("exact", "exactly"));
    }

    #[test]
    fn test_glob_treats_regex_syntax_literally() {
        assert!(glob("a.b", "a.b"));
        assert!(!glob("a.b", "aXb"));
        assert!(glob("(x)+[y]*", "(x)+[y]-tail"));
        assert!(!glob("(x)+", "xx"));
        assert!(glob("$^|\\", "$^|\\"));
        assert!(glob("*", "line\nbreak"));
    }

    proptest! {
        #[test]
        fn prop_key_roundtrip(ty in "[a-z_]{1,12}", id in "[a-zA-Z0-9:_-]{1,24}") {
            let key = CacheKey::new(EntityType::new(ty), EntityId::new(id));
            prop_assert_eq!(CacheKey::decode(&key.encode()), Some(key));
        }

        #[test]
        fn prop_star_matches_everything(text in ".{0,32}") {
            prop_assert!(glob("*", &text));
        }

        #[test]
        fn prop_literal_matches_itself(text in "[a-z0-9.+()\\[\\]{}|^$]{0,32}") {
            prop_assert!(glob(&text, &text));
        }
    }
}
