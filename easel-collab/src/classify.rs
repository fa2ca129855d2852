//! Change classification: does a batch touch shared entities at all?
//!
//! Runs before any translation work so that batches made only of local
//! state (camera, pointer, instance) are skipped cheaply.

use easel_core::{Record, RecordsDiff};

/// Key fragments that mark a record as shared between peers.
pub const COLLABORATIVE_TOKENS: [&str; 3] = ["shape", "binding", "asset"];

/// Cheap pre-filter on the key text.
pub fn key_is_relevant(key: &str) -> bool {
    COLLABORATIVE_TOKENS.iter().any(|token| key.contains(token))
}

/// Exact filter on the declared kind.
pub fn record_is_collaborative(record: &Record) -> bool {
    record.kind().is_collaborative()
}

/// True if any key or any record in the batch is collaborative.
pub fn is_relevant(diff: &RecordsDiff) -> bool {
    diff.ids().any(|id| key_is_relevant(id.as_str()))
        || diff.records().any(record_is_collaborative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::{RecordKind, RecordsDiff};

    #[test]
    fn test_key_tokens() {
        assert!(key_is_relevant("shape:abc"));
        assert!(key_is_relevant("binding:1"));
        assert!(key_is_relevant("asset:img"));
        assert!(!key_is_relevant("camera:page1"));
        assert!(!key_is_relevant("pointer:pointer"));
    }

    #[test]
    fn test_pointer_only_batch_is_irrelevant() {
        let mut diff = RecordsDiff::new();
        let pointer = Record::new("pointer:pointer", RecordKind::Pointer).with_prop("x", 1.0);
        diff.updated
            .insert(pointer.id.clone(), (pointer.clone(), pointer.with_prop("x", 2.0)));
        assert!(!is_relevant(&diff));
    }

    #[test]
    fn test_kind_matches_even_without_key_token() {
        let mut diff = RecordsDiff::new();
        let record = Record::new("s1", RecordKind::Shape);
        diff.added.insert(record.id.clone(), record);
        assert!(is_relevant(&diff));
    }

    #[test]
    fn test_mixed_batch_is_relevant() {
        let mut diff = RecordsDiff::new();
        let camera = Record::new("camera:1", RecordKind::Camera);
        let shape = Record::shape("shape:1", 0.0, 0.0);
        diff.added.insert(camera.id.clone(), camera);
        diff.added.insert(shape.id.clone(), shape);
        assert!(is_relevant(&diff));
    }

    #[test]
    fn test_empty_batch_is_irrelevant() {
        assert!(!is_relevant(&RecordsDiff::new()));
    }
}
