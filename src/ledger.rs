//! The issue ledger: deduplicated upsert of anomaly occurrences.
//!
//! Every occurrence of an anomaly either increments the OPEN issue for its
//! (service, endpoint, type) key or creates a new one. Concurrent callers
//! for the same key are resolved with optimistic concurrency: the write
//! carries the version read, a rejected write means the snapshot was stale,
//! and the whole read-modify-write is reapplied against a fresh read.

use crate::{
    error::{Error, StoreError},
    model::{Issue, IssueKey},
    store::IssueStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Compute the incremented state of an existing OPEN issue.
///
/// Pure; the retry loop in [`IssueLedger::create_or_update`] decides when to
/// apply it.
fn bump(issue: &Issue, now: DateTime<Utc>) -> Issue {
    Issue {
        hit_count: issue.hit_count + 1,
        last_seen_at: now,
        ..issue.clone()
    }
}

/// The deduplication state machine over the issue store.
#[derive(Clone)]
pub struct IssueLedger {
    issues: Arc<dyn IssueStore>,
}

impl IssueLedger {
    pub fn new(issues: Arc<dyn IssueStore>) -> Self {
        Self { issues }
    }

    /// Record one occurrence of an anomaly for the given key.
    ///
    /// Exactly one of two effects happens: the existing OPEN issue's
    /// hit_count is incremented, or a single new OPEN issue is created with
    /// hit_count 1. Two concurrent calls for the same key can never both
    /// create.
    ///
    /// The loop is not bounded: a version conflict or unique-key violation
    /// always means another writer committed, the increment is commutative,
    /// and contention on one key is limited to concurrent occurrences of
    /// the same anomaly.
    pub async fn create_or_update(&self, key: &IssueKey) -> Result<Issue, Error> {
        loop {
            match self.issues.find_open_by_key(key).await? {
                Some(issue) => {
                    let next = bump(&issue, Utc::now());
                    match self.issues.update(&next).await {
                        Ok(updated) => return Ok(updated),
                        Err(StoreError::VersionConflict) => {
                            // Stale snapshot; re-read and reapply.
                            debug!("Version conflict incrementing issue {key}, retrying");
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                None => match self.issues.insert_open(key, Utc::now()).await {
                    Ok(issue) => return Ok(issue),
                    Err(StoreError::UniqueKeyViolation) => {
                        // A concurrent racer won the create; fall through to
                        // the increment path.
                        debug!("Concurrent create for issue {key}, switching to increment");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnomalyType, IssueStatus};
    use crate::store::MemoryIssueStore;

    fn key() -> IssueKey {
        IssueKey::new("orders", "/checkout", AnomalyType::SlowApi)
    }

    #[test]
    fn bump_increments_and_touches_last_seen() {
        let first_seen = Utc::now();
        let issue = Issue {
            id: "issue-1".into(),
            service_name: "orders".into(),
            endpoint: "/checkout".into(),
            issue_type: AnomalyType::SlowApi,
            status: IssueStatus::Open,
            hit_count: 3,
            first_seen_at: first_seen,
            last_seen_at: first_seen,
            resolved_at: None,
            resolved_by: None,
            version: 5,
        };

        let later = first_seen + chrono::Duration::seconds(30);
        let next = bump(&issue, later);
        assert_eq!(next.hit_count, 4);
        assert_eq!(next.last_seen_at, later);
        // Everything else is untouched, including the version carried for
        // the conditional write.
        assert_eq!(next.first_seen_at, first_seen);
        assert_eq!(next.version, 5);
        assert_eq!(next.id, "issue-1");
    }

    #[tokio::test]
    async fn first_occurrence_creates_open_issue() {
        let store = Arc::new(MemoryIssueStore::new());
        let ledger = IssueLedger::new(store);

        let issue = ledger.create_or_update(&key()).await.unwrap();
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.hit_count, 1);
    }

    #[tokio::test]
    async fn repeat_occurrences_increment_the_same_row() {
        let store = Arc::new(MemoryIssueStore::new());
        let ledger = IssueLedger::new(store.clone());

        let first = ledger.create_or_update(&key()).await.unwrap();
        let second = ledger.create_or_update(&key()).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.hit_count, 2);
    }

    #[tokio::test]
    async fn concurrent_upserts_converge_without_lost_increments() {
        let store = Arc::new(MemoryIssueStore::new());
        let ledger = IssueLedger::new(store.clone());
        let n = 50;

        let mut handles = Vec::new();
        for _ in 0..n {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .create_or_update(&key())
                    .await
                    .expect("upsert must succeed")
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let open = store
            .find_open_by_key(&key())
            .await
            .unwrap()
            .expect("one open issue must exist");
        assert_eq!(open.hit_count, n);

        // The invariant: exactly one OPEN issue for the key.
        let all = store
            .find_all(&Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(all.total, 1);
    }
}
