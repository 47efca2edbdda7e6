use metrics::{describe_counter, describe_histogram, Unit};

pub const SYNC_TOTAL: &str = "context_sync_total";
pub const PAYLOAD_BYTES: &str = "context_pack_payload_bytes";
pub const USERS_ENQUEUED: &str = "context_sync_users_enqueued_total";
pub const RUNS_TOTAL: &str = "context_sync_runs_total";

/// Registers descriptions with whatever recorder is installed. Call once at
/// startup.
pub fn describe() {
    describe_counter!(
        SYNC_TOTAL,
        "Per-source context pack fetches by status (success, failure, not_modified)"
    );
    describe_histogram!(
        PAYLOAD_BYTES,
        Unit::Bytes,
        "Serialized size of context packs accepted from a source"
    );
    describe_counter!(
        USERS_ENQUEUED,
        "Users enqueued for a context sync by the due-pair sweep"
    );
    describe_counter!(
        RUNS_TOTAL,
        "Per-user context sync runs by result (synced, noop, all_failed)"
    );
}
