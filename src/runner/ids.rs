//! Step-scoped composite tool-call IDs.
//!
//! Some providers reissue tool-call IDs (e.g. `call_1`) on every step, so a
//! client merging events by ID across steps would collide. The runner
//! rewrites every wire-visible ID to `"{step_id}:{original_id}"` before
//! forwarding it, and stashes the provider-native ID in
//! `ext.metadata.original_id` for debugging.

/// Builds the composite ID for a tool call/result originating in `step_id`.
pub fn composite_id(step_id: u32, original_id: &str) -> String {
    format!("{step_id}:{original_id}")
}

/// Builds a composite ID for a call that never carried a provider ID, falling
/// back to the event sequence number.
pub fn composite_id_or_seq(step_id: u32, original_id: Option<&str>, seq: u64) -> String {
    match original_id {
        Some(id) if !id.is_empty() => composite_id(step_id, id),
        _ => composite_id(step_id, &seq.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_id_scopes_by_step() {
        assert_eq!(composite_id(1, "call_1"), "1:call_1");
        assert_eq!(composite_id(2, "call_1"), "2:call_1");
    }

    #[test]
    fn composite_id_or_seq_falls_back_when_missing() {
        assert_eq!(composite_id_or_seq(3, None, 7), "3:7");
        assert_eq!(composite_id_or_seq(3, Some(""), 7), "3:7");
        assert_eq!(composite_id_or_seq(3, Some("call_x"), 7), "3:call_x");
    }
}
