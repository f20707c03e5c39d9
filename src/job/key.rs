//! Idempotency key derivation.
//!
//! The key is a deterministic fingerprint of (job type, entity id,
//! normalized parameters). Identical logical requests always map to the
//! same key, which is what lets the store collapse concurrent duplicate
//! submissions into a single job row.

use sha2::{Digest, Sha256};

use super::record::JobType;

/// Derives the idempotency key for a submission.
///
/// Parameters are normalized by serializing through `serde_json::Value`:
/// object keys serialize in sorted order, so two parameter maps that differ
/// only in insertion order produce the same fingerprint. Absent parameters
/// normalize to JSON `null`.
pub fn idempotency_key(job_type: JobType, entity_id: &str, params: &serde_json::Value) -> String {
    let canonical_params = params.to_string();

    let mut hasher = Sha256::new();
    hasher.update(job_type.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(entity_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_params.as_bytes());

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_deterministic() {
        let params = json!({"target_bpm": 120.0, "style": "rock"});
        let a = idempotency_key(JobType::Generation, "file-1", &params);
        let b = idempotency_key(JobType::Generation, "file-1", &params);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_ignores_param_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("style".to_string(), json!("rock"));
        first.insert("target_bpm".to_string(), json!(120.0));

        let mut second = serde_json::Map::new();
        second.insert("target_bpm".to_string(), json!(120.0));
        second.insert("style".to_string(), json!("rock"));

        let a = idempotency_key(
            JobType::Generation,
            "file-1",
            &serde_json::Value::Object(first),
        );
        let b = idempotency_key(
            JobType::Generation,
            "file-1",
            &serde_json::Value::Object(second),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_varies_by_each_component() {
        let params = json!({"style": "rock"});
        let base = idempotency_key(JobType::Analysis, "file-1", &params);

        assert_ne!(
            base,
            idempotency_key(JobType::Generation, "file-1", &params)
        );
        assert_ne!(base, idempotency_key(JobType::Analysis, "file-2", &params));
        assert_ne!(
            base,
            idempotency_key(JobType::Analysis, "file-1", &json!({"style": "jazz"}))
        );
    }

    #[test]
    fn test_null_params_are_distinct_from_empty_object() {
        let null_key = idempotency_key(JobType::Analysis, "file-1", &serde_json::Value::Null);
        let empty_key = idempotency_key(JobType::Analysis, "file-1", &json!({}));
        assert_ne!(null_key, empty_key);
    }

    #[test]
    fn test_separator_prevents_field_bleed() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = idempotency_key(JobType::Analysis, "ab", &json!("c"));
        let b = idempotency_key(JobType::Analysis, "a", &json!("bc"));
        assert_ne!(a, b);
    }
}
