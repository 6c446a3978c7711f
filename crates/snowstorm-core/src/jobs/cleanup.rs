//! Retention sweeper
//!
//! Removes records older than the configured horizon across all three
//! record kinds, one range delete per kind, gated by leader election.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::lock::LeaderElection;
use crate::store::{RecordKind, Store, StoreError};

/// Job name used for the sweeper's lock entry
pub const JOB_NAME: &str = "database_cleanup";

/// Range-delete seam, satisfied by the real store
#[async_trait]
pub trait RetentionStore: Send + Sync {
    async fn delete_older_than(
        &self,
        kind: RecordKind,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
impl RetentionStore for Store {
    async fn delete_older_than(
        &self,
        kind: RecordKind,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Store::delete_older_than(self, kind, cutoff).await
    }
}

/// Deletes records whose retention cursor falls at or before
/// `today - days`.
pub struct RetentionSweeper {
    days: i64,
}

impl RetentionSweeper {
    pub fn new(days: i64) -> Self {
        Self { days }
    }

    /// Run one sweep cycle.
    ///
    /// A failed delete on one record kind is logged and does not stop the
    /// sweep of the remaining kinds.
    pub async fn run<S: RetentionStore>(&self, election: &LeaderElection, store: &S) {
        if !election.acquire(JOB_NAME).await {
            return;
        }

        let cutoff = retention_cutoff(Utc::now(), self.days);
        info!(%cutoff, days = self.days, "Sweeping expired records");

        for kind in RecordKind::ALL {
            match store.delete_older_than(kind, cutoff).await {
                Ok(removed) => {
                    warn!(table = kind.table(), record_count = removed, "records removed");
                }
                Err(e) => {
                    warn!(table = kind.table(), error = %e, "Sweep failed for this record kind");
                }
            }
        }
    }
}

/// Midnight today minus the retention window, so a full day's worth of
/// records at the boundary is kept.
fn retention_cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| now.naive_utc())
        .and_utc();
    midnight - Duration::days(days)
}
