//! Relay side of the transactional outbox.

use crate::PostgresCaseStore;
use crate::rows::outbox_from_row;
use census_rm_core::error::StoreError;
use census_rm_core::store::{OutboxRecord, OutboxStore, StoreFuture};
use std::time::Duration;
use uuid::Uuid;

/// Lease length in milliseconds, saturating.
fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

impl OutboxStore for PostgresCaseStore {
    fn claim_pending(&self, limit: usize, lease: Duration) -> StoreFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            // SKIP LOCKED lets several relays claim disjoint batches.
            #[allow(clippy::cast_possible_wrap)] // Batch sizes are small, i64 is safe
            let rows = sqlx::query(
                r"
                UPDATE outbox_messages
                SET leased_until = now() + ($2::float8 * interval '1 millisecond')
                WHERE id IN (
                    SELECT id FROM outbox_messages
                    WHERE published_at IS NULL
                      AND (leased_until IS NULL OR leased_until <= now())
                    ORDER BY created_at
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, destination, routing_key, message_key, payload, created_at
                ",
            )
            .bind(limit as i64)
            .bind(lease_millis(lease))
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            let mut records = rows
                .iter()
                .map(outbox_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            records.sort_by_key(|record| record.created_at);

            if !records.is_empty() {
                tracing::debug!(claimed = records.len(), "Claimed outbox records");
            }
            Ok(records)
        })
    }

    fn mark_published(&self, ids: Vec<Uuid>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            sqlx::query(
                r"
                UPDATE outbox_messages
                SET published_at = now(), leased_until = NULL
                WHERE id = ANY($1)
                ",
            )
            .bind(&ids)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            metrics::counter!("case_store.outbox.published").increment(ids.len() as u64);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_expressed_in_milliseconds() {
        assert_eq!(lease_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(lease_millis(Duration::ZERO), 0);
    }

    #[test]
    fn huge_lease_saturates() {
        assert_eq!(lease_millis(Duration::MAX), i64::MAX);
    }
}
