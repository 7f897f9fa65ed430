/// Pending operation ordering for replay

use crate::pending::PendingOperation;

/// Sort operations by timestamp ascending. The sort is stable, so operations
/// enqueued within the same millisecond keep their insertion order.
pub fn order_for_replay(mut ops: Vec<PendingOperation>) -> Vec<PendingOperation> {
    ops.sort_by_key(|op| op.timestamp);
    ops
}

/// Split operations into (known kinds, unknown kinds), preserving order
pub fn split_by_known_kind(
    ops: Vec<PendingOperation>,
) -> (Vec<PendingOperation>, Vec<PendingOperation>) {
    ops.into_iter().partition(|op| op.kind.is_known())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::OperationKind;
    use serde_json::json;

    fn create_test_op(kind: &str, id: &str, timestamp: u64) -> PendingOperation {
        PendingOperation::new(OperationKind::from(kind), json!({ "id": id }), timestamp)
    }

    #[test]
    fn test_order_for_replay() {
        let ops = vec![
            create_test_op("saveWord", "w3", 30),
            create_test_op("saveNote", "n1", 10),
            create_test_op("deleteWord", "w2", 20),
        ];

        let ordered = order_for_replay(ops);

        let stamps: Vec<u64> = ordered.iter().map(|op| op.timestamp).collect();
        assert_eq!(stamps, vec![10, 20, 30]);
    }

    #[test]
    fn test_order_for_replay_is_stable() {
        let ops = vec![
            create_test_op("saveWord", "first", 10),
            create_test_op("saveWord", "second", 10),
            create_test_op("saveWord", "early", 5),
        ];

        let ordered = order_for_replay(ops);

        assert_eq!(ordered[0].entity_id(), Some("early"));
        assert_eq!(ordered[1].entity_id(), Some("first"));
        assert_eq!(ordered[2].entity_id(), Some("second"));
    }

    #[test]
    fn test_split_by_known_kind() {
        let ops = vec![
            create_test_op("saveWord", "w1", 1),
            create_test_op("pinWord", "w2", 2),
            create_test_op("updateChat", "c1", 3),
        ];

        let (known, unknown) = split_by_known_kind(ops);

        assert_eq!(known.len(), 2);
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].kind.as_str(), "pinWord");
    }
}
