//! SQL schema for the job table.
//!
//! All statements use `IF NOT EXISTS` so the migration runner can re-apply
//! them safely.

/// DDL for the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    job_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    params JSONB NOT NULL DEFAULT 'null'::jsonb,
    status TEXT NOT NULL,
    worker_instance_id TEXT,
    current_step TEXT,
    checkpoints JSONB NOT NULL DEFAULT '{}'::jsonb,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    last_heartbeat TIMESTAMPTZ,
    completed_at TIMESTAMPTZ
)
"#;

/// Idempotency enforcement: at most one job per key among rows whose status
/// has not released the key. Failed and cancelled rows fall outside the
/// index, so a retry or resubmission can reuse the key.
pub const CREATE_ACTIVE_KEY_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_idempotency_key
ON jobs (idempotency_key)
WHERE status NOT IN ('failed', 'cancelled')
"#;

/// Sweep and query path: jobs by state within a worker class.
pub const CREATE_STATUS_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_status_type ON jobs (status, job_type)
"#;

/// Per-resource job history lookups.
pub const CREATE_ENTITY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_entity ON jobs (entity_id)
"#;

/// All schema statements in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_ACTIVE_KEY_INDEX,
        CREATE_STATUS_TYPE_INDEX,
        CREATE_ENTITY_INDEX,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for statement in all_schema_statements() {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement must be re-runnable: {statement}"
            );
        }
    }

    #[test]
    fn test_key_index_excludes_released_states() {
        assert!(CREATE_ACTIVE_KEY_INDEX.contains("'failed'"));
        assert!(CREATE_ACTIVE_KEY_INDEX.contains("'cancelled'"));
        assert!(!CREATE_ACTIVE_KEY_INDEX.contains("'completed'"));
    }
}
