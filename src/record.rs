//! Wire-level data units exchanged with remote collections.
//!
//! A [`Record`] is a remote row/item: an id in the remote system's own
//! namespace plus an opaque field map. The engine never interprets the
//! fields; only mappers (and the conflict resolver's timestamp probe) do.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single remote record.
///
/// # Example
///
/// ```
/// use syncframe::Record;
/// use serde_json::json;
///
/// let rec = Record::new("rec-1", json!({"name": "Ada", "updatedAt": 1700000000000i64}));
/// assert_eq!(rec.id, "rec-1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier in the remote system's own namespace.
    pub id: String,
    /// Opaque payload. Mappers may copy through an `updatedAt`-class field
    /// which the conflict resolver reads.
    pub fields: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Changes observed on (or destined for) one side.
///
/// `upserts` and `deletes` are disjoint within a single changeset. Order
/// within each list is preserved through mapping and batching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub upserts: Vec<Record>,
    pub deletes: Vec<String>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Total number of changes carried.
    #[must_use]
    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }

    /// Slice into push batches of at most `batch_size` changes each.
    ///
    /// Upsert batches come first, then delete batches; insertion order is
    /// preserved within each.
    #[must_use]
    pub fn into_batches(self, batch_size: usize) -> Vec<ChangeSet> {
        let size = batch_size.max(1);
        let mut batches = Vec::new();

        for chunk in self.upserts.chunks(size) {
            batches.push(ChangeSet {
                upserts: chunk.to_vec(),
                deletes: Vec::new(),
            });
        }
        for chunk in self.deletes.chunks(size) {
            batches.push(ChangeSet {
                upserts: Vec::new(),
                deletes: chunk.to_vec(),
            });
        }

        batches
    }
}

/// Opaque sync position produced by an adapter.
///
/// The engine round-trips the token through the link index and never
/// inspects it. A `None` value means "initial sync".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub value: Option<String>,
}

impl Cursor {
    /// The cursor of a side that has never completed a cycle.
    #[must_use]
    pub fn initial() -> Self {
        Self { value: None }
    }

    #[must_use]
    pub fn at(token: impl Into<String>) -> Self {
        Self {
            value: Some(token.into()),
        }
    }

    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.value.is_none()
    }
}

/// Epoch milliseconds, the crate-wide timestamp convention.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changeset_len_and_empty() {
        let mut cs = ChangeSet::new();
        assert!(cs.is_empty());

        cs.upserts.push(Record::new("a", json!({})));
        cs.deletes.push("b".into());
        assert!(!cs.is_empty());
        assert_eq!(cs.len(), 2);
    }

    #[test]
    fn test_into_batches_preserves_order() {
        let cs = ChangeSet {
            upserts: (0..5).map(|i| Record::new(format!("u{i}"), json!({}))).collect(),
            deletes: vec!["d0".into(), "d1".into(), "d2".into()],
        };

        let batches = cs.into_batches(2);
        assert_eq!(batches.len(), 5); // 3 upsert batches + 2 delete batches

        let upserts: Vec<&str> = batches
            .iter()
            .flat_map(|b| b.upserts.iter().map(|r| r.id.as_str()))
            .collect();
        assert_eq!(upserts, vec!["u0", "u1", "u2", "u3", "u4"]);

        let deletes: Vec<&str> = batches
            .iter()
            .flat_map(|b| b.deletes.iter().map(String::as_str))
            .collect();
        assert_eq!(deletes, vec!["d0", "d1", "d2"]);

        // Upserts and deletes never share a batch
        assert!(batches.iter().all(|b| b.upserts.is_empty() || b.deletes.is_empty()));
    }

    #[test]
    fn test_into_batches_zero_size_clamps_to_one() {
        let cs = ChangeSet {
            upserts: vec![Record::new("a", json!({}))],
            deletes: vec![],
        };
        let batches = cs.into_batches(0);
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_cursor_roundtrip() {
        assert!(Cursor::initial().is_initial());
        let c = Cursor::at("offset:42");
        assert!(!c.is_initial());
        assert_eq!(c.value.as_deref(), Some("offset:42"));
    }

    #[test]
    fn test_record_serde() {
        let rec = Record::new("r1", json!({"n": 1}));
        let s = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&s).unwrap();
        assert_eq!(back, rec);
    }
}
