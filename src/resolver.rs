//! Terminal state transition for issues: OPEN → RESOLVED.

use crate::{
    error::{Error, StoreError},
    model::{Issue, IssueStatus},
    store::IssueStore,
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// Bound on version-conflict retries before surfacing a retryable Conflict.
const MAX_RESOLVE_ATTEMPTS: u32 = 3;

/// Fixed backoff between resolve attempts.
const RESOLVE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Compute the resolved state of an issue, or reject the transition.
///
/// Pure; fails with [`Error::AlreadyResolved`] if the row already left the
/// OPEN state. Resolution is terminal for a row, so this guard makes repeat
/// resolves fail without mutating anything.
fn apply_resolution(issue: &Issue, resolved_by: &str, now: DateTime<Utc>) -> Result<Issue, Error> {
    if issue.status == IssueStatus::Resolved {
        return Err(Error::AlreadyResolved);
    }
    Ok(Issue {
        status: IssueStatus::Resolved,
        resolved_at: Some(now),
        resolved_by: Some(resolved_by.to_owned()),
        ..issue.clone()
    })
}

/// Resolves issues with a bounded optimistic-concurrency retry.
#[derive(Clone)]
pub struct IssueResolver {
    issues: Arc<dyn IssueStore>,
}

impl IssueResolver {
    pub fn new(issues: Arc<dyn IssueStore>) -> Self {
        Self { issues }
    }

    /// Resolve the issue with the given id.
    ///
    /// Fails with `NotFound` if no such issue exists, `AlreadyResolved` if
    /// it already left the OPEN state, and `Conflict` if concurrent writers
    /// kept invalidating the snapshot for all [`MAX_RESOLVE_ATTEMPTS`]
    /// attempts; the caller may resubmit after a Conflict.
    pub async fn resolve(&self, issue_id: &str, resolved_by: &str) -> Result<Issue, Error> {
        let issue_id = issue_id.trim();
        if issue_id.is_empty() {
            return Err(Error::Validation("issue id must not be empty".into()));
        }
        let resolved_by = resolved_by.trim();
        if resolved_by.is_empty() {
            return Err(Error::Validation("resolvedBy must not be empty".into()));
        }

        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            // Re-read on every attempt: the check-and-transition must run
            // against a fresh snapshot after a conflict.
            let issue = self
                .issues
                .find_by_id(issue_id)
                .await?
                .ok_or_else(|| Error::NotFound(issue_id.to_owned()))?;

            let resolved = apply_resolution(&issue, resolved_by, Utc::now())?;

            match self.issues.update(&resolved).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict) => {
                    debug!("Version conflict resolving issue {issue_id} (attempt {attempt})");
                    if attempt < MAX_RESOLVE_ATTEMPTS {
                        tokio::time::sleep(RESOLVE_RETRY_BACKOFF).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(Error::Conflict)
    }
}
