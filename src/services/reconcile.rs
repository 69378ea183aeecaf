//! Reconciliation of fetched records against rows already stored
//!
//! Every poll re-reads the last few periods, so most fetched records are
//! already present. Planning against the stored rows keeps the writes to
//! what actually changed and makes repeated polls idempotent.

use crate::domain::types::{CountRecord, RecordKey, StoredRecord};
use rustc_hash::FxHashMap;

/// One record per key; a later occurrence replaces an earlier one
pub fn dedup_by_timestamp(records: Vec<CountRecord>) -> Vec<CountRecord> {
    let mut index: FxHashMap<RecordKey, usize> = FxHashMap::default();
    let mut out: Vec<CountRecord> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.key()) {
            Some(&i) => out[i] = record,
            None => {
                index.insert(record.key(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Collapse duplicate stored rows for the same key
///
/// Keeps the row with the latest `inserted_at` (then the highest id). Returns
/// `(kept, duplicates)`.
pub fn dedup_stored(rows: Vec<StoredRecord>) -> (Vec<StoredRecord>, Vec<StoredRecord>) {
    let mut best: FxHashMap<RecordKey, StoredRecord> = FxHashMap::default();
    let mut duplicates = Vec::new();

    for row in rows {
        let key = row.record.key();
        match best.remove(&key) {
            None => {
                best.insert(key, row);
            }
            Some(current) => {
                let (keep, drop) = if (row.inserted_at, row.id) > (current.inserted_at, current.id) {
                    (row, current)
                } else {
                    (current, row)
                };
                duplicates.push(drop);
                best.insert(key, keep);
            }
        }
    }

    let mut kept: Vec<StoredRecord> = best.into_values().collect();
    kept.sort_by(|a, b| a.record.key().cmp(&b.record.key()));
    (kept, duplicates)
}

/// Writes needed to bring the store in line with a fetched set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    pub inserts: Vec<CountRecord>,
    pub updates: Vec<CountRecord>,
    pub unchanged: usize,
    /// Updates whose in or out total is lower than the stored row
    pub decreased: Vec<CountRecord>,
}

impl UpsertPlan {
    /// Records to send in one upsert, inserts first
    pub fn to_write(&self) -> Vec<CountRecord> {
        self.inserts.iter().chain(self.updates.iter()).cloned().collect()
    }

    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

/// Compare fetched records to stored rows by key
///
/// Fetched duplicates are collapsed first (last wins). Identical counts are
/// skipped; anything else is an update, including decreases, which are
/// also listed in `decreased`.
pub fn plan_upsert(fetched: Vec<CountRecord>, existing: &[StoredRecord]) -> UpsertPlan {
    let stored: FxHashMap<RecordKey, &CountRecord> =
        existing.iter().map(|s| (s.record.key(), &s.record)).collect();

    let mut plan = UpsertPlan::default();
    for record in dedup_by_timestamp(fetched) {
        match stored.get(&record.key()) {
            None => plan.inserts.push(record),
            Some(current) if current.same_content(&record) => plan.unchanged += 1,
            Some(current) => {
                if record.total_in() < current.total_in() || record.total_out() < current.total_out()
                {
                    plan.decreased.push(record.clone());
                }
                plan.updates.push(record);
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).single().unwrap()
    }

    fn rec(h: u32, in_count: u32) -> CountRecord {
        CountRecord::new("pc-01".into(), "store-1".into(), "org-1".into(), ts(h))
            .with_line(1, in_count, in_count / 2)
            .unwrap()
    }

    fn stored(h: u32, in_count: u32, id: i64, inserted_h: u32) -> StoredRecord {
        StoredRecord { id: Some(id), ..StoredRecord::new(rec(h, in_count)) }
            .with_inserted_at(ts(inserted_h))
    }

    #[test]
    fn test_dedup_last_occurrence_wins() {
        let out = dedup_by_timestamp(vec![rec(10, 5), rec(11, 1), rec(10, 9)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, ts(10));
        assert_eq!(out[0].total_in(), 9);
        assert_eq!(out[1].timestamp, ts(11));
    }

    #[test]
    fn test_dedup_stored_keeps_latest_insert() {
        let rows = vec![stored(10, 5, 1, 11), stored(10, 6, 2, 13), stored(11, 1, 3, 12)];
        let (kept, dupes) = dedup_stored(rows);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, Some(2));
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].id, Some(1));
    }

    #[test]
    fn test_dedup_stored_breaks_ties_by_id() {
        let (kept, dupes) = dedup_stored(vec![stored(10, 5, 7, 11), stored(10, 5, 4, 11)]);
        assert_eq!(kept[0].id, Some(7));
        assert_eq!(dupes[0].id, Some(4));
    }

    #[test]
    fn test_plan_classifies_records() {
        let existing = vec![stored(10, 5, 1, 11), stored(11, 8, 2, 12)];
        let plan = plan_upsert(vec![rec(10, 5), rec(11, 12), rec(12, 3)], &existing);

        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].timestamp, ts(11));
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].timestamp, ts(12));
        assert!(plan.decreased.is_empty());
        assert_eq!(plan.to_write().len(), 2);
    }

    #[test]
    fn test_plan_flags_decrease_but_still_updates() {
        let existing = vec![stored(10, 40, 1, 11)];
        let plan = plan_upsert(vec![rec(10, 2)], &existing);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.decreased.len(), 1);
    }

    #[test]
    fn test_plan_is_idempotent_after_apply() {
        let fetched = vec![rec(10, 5), rec(11, 12), rec(12, 3)];
        let existing = vec![stored(10, 5, 1, 11), stored(11, 8, 2, 12)];
        let first = plan_upsert(fetched.clone(), &existing);
        assert!(!first.is_noop());

        let applied: Vec<StoredRecord> =
            fetched.iter().cloned().map(StoredRecord::new).collect();
        let second = plan_upsert(fetched, &applied);
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 3);
    }
}
