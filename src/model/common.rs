use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Logical, user-facing identifier (table id, row id). Renameable.
pub type Id = String;

/// Generated opaque identifier (branch, revision, version, lineage marker).
pub type Uid = String;

/// Reserved system table holding one JSON Schema row per table.
pub const SCHEMA_TABLE_ID: &str = "Schema";
/// Reserved system table holding the ordered migration records.
pub const MIGRATION_TABLE_ID: &str = "Migration";
/// Reserved system table holding saved view configurations per table.
pub const VIEW_TABLE_ID: &str = "View";

/// Name given to the root branch of every project.
pub const ROOT_BRANCH_NAME: &str = "master";

pub fn generate_uid() -> Uid {
    Uuid::new_v4().to_string()
}

const MAX_IDENT_LEN: usize = 64;

/// Whether `id` is a legal logical identifier: non-empty, URL-safe,
/// at most 64 characters.
pub fn is_valid_ident(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENT_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub fn is_system_table_id(id: &str) -> bool {
    id == SCHEMA_TABLE_ID || id == MIGRATION_TABLE_ID || id == VIEW_TABLE_ID
}

/// Hex-encoded SHA-256 over the canonical (recursively key-sorted) JSON
/// encoding of `value`. Object key order in the input never affects the hash.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_canonical(value, &mut hasher);
    hex::encode(hasher.finalize())
}

fn hash_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.len().to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update(items.len().to_le_bytes());
            for item in items {
                hash_canonical(item, hasher);
            }
        }
        Value::Object(map) => {
            hasher.update(b"{");
            hasher.update(map.len().to_le_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update(key.len().to_le_bytes());
                hasher.update(key.as_bytes());
                hash_canonical(&map[key], hasher);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ident_validation() {
        assert!(is_valid_ident("t1"));
        assert!(is_valid_ident("user_profiles-v2"));
        assert!(!is_valid_ident(""));
        assert!(!is_valid_ident("has space"));
        assert!(!is_valid_ident("semi;colon"));
        assert!(!is_valid_ident(&"x".repeat(65)));
    }

    #[test]
    fn content_hash_ignores_key_order() {
        let a = json!({"name": "x", "age": 3});
        let b = json!({"age": 3, "name": "x"});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_distinguishes_values() {
        assert_ne!(content_hash(&json!({"a": 1})), content_hash(&json!({"a": 2})));
        assert_ne!(content_hash(&json!("1")), content_hash(&json!(1)));
        assert_ne!(content_hash(&json!([])), content_hash(&json!({})));
    }

    #[test]
    fn generated_uids_are_unique() {
        let a = generate_uid();
        let b = generate_uid();
        assert_ne!(a, b);
    }
}
