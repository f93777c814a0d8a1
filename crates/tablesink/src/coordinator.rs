//! Transaction coordinator
//!
//! One message, one transaction:
//!
//! ```text
//! Received -> Provisioning -> Writing -> Committed
//! Received -> (Provisioning | Writing) -> RollingBack -> RolledBack
//! ```
//!
//! The write step runs inside a savepoint. When it fails, the savepoint is rolled back
//! and the outer transaction still commits, so the provisioned relation persists while
//! none of the message's rows do. A provisioning failure rolls back everything.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{Disposition, SinkError};
use crate::identifier::SafeIdentifier;
use crate::message::{TableMessage, WriteUnit};
use crate::{schema, writer};

/// Per-message processing states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Received,
    Provisioning,
    Writing,
    Committed,
    RollingBack,
    RolledBack,
}

impl WriteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteState::Received => "received",
            WriteState::Provisioning => "provisioning",
            WriteState::Writing => "writing",
            WriteState::Committed => "committed",
            WriteState::RollingBack => "rolling_back",
            WriteState::RolledBack => "rolled_back",
        }
    }
}

/// Terminal result of processing one message
#[derive(Debug)]
pub enum Outcome {
    /// All rows are visible in `relation`
    Committed { relation: SafeIdentifier, rows: u64 },
    /// None of the message's rows are visible; `failed_in` is the last state reached
    RolledBack {
        relation: SafeIdentifier,
        failed_in: WriteState,
        cause: SinkError,
    },
    /// Structurally empty; no transaction was opened
    Skipped { reason: SinkError },
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed { .. })
    }
}

/// Processes one decoded message to a terminal [`Outcome`]
#[async_trait]
pub trait WriteCoordinator: Send + Sync {
    async fn process(&self, message: &TableMessage) -> Outcome;
}

/// PostgreSQL-backed coordinator
#[derive(Clone)]
pub struct PgCoordinator {
    pool: PgPool,
    page_size: usize,
}

impl PgCoordinator {
    pub fn new(pool: PgPool, page_size: usize) -> Self {
        Self { pool, page_size }
    }

    async fn run(&self, unit: WriteUnit) -> Outcome {
        let relation = unit.relation.clone();

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                // Nothing to undo
                return Outcome::RolledBack {
                    failed_in: WriteState::Received,
                    cause: SinkError::from_store(relation.as_str(), e),
                    relation,
                };
            },
        };

        enter(WriteState::Provisioning);
        if let Err(cause) = schema::ensure(&mut tx, &unit.relation, &unit.columns).await {
            return abort(tx, relation, WriteState::Provisioning, cause).await;
        }

        enter(WriteState::Writing);
        let written = write_step(&mut tx, &unit, self.page_size).await;

        match written {
            Ok(rows) => match tx.commit().await {
                Ok(()) => {
                    enter(WriteState::Committed);
                    info!(rows, "Committed write unit");
                    Outcome::Committed { relation, rows }
                },
                Err(e) => {
                    let cause = SinkError::from_store(relation.as_str(), e);
                    warn!(error = %cause, "Commit failed");
                    Outcome::RolledBack {
                        relation,
                        failed_in: WriteState::Writing,
                        cause,
                    }
                },
            },
            Err(WriteFailure::Transaction(cause)) => {
                abort(tx, relation, WriteState::Writing, cause).await
            },
            Err(WriteFailure::Rows(cause)) => {
                // Keep the relation provisioned above
                let cause = match tx.commit().await {
                    Ok(()) => cause,
                    Err(e) => {
                        let commit_err = SinkError::from_store(relation.as_str(), e);
                        warn!(
                            relation = %relation,
                            error = %commit_err,
                            write_error = %cause,
                            "Commit after failed write did not succeed, relation not kept"
                        );
                        failed_write_cause(cause, commit_err)
                    },
                };
                enter(WriteState::RolledBack);
                warn!(error = %cause, kind = cause.kind(), "Write step failed, rows rolled back");
                Outcome::RolledBack {
                    relation,
                    failed_in: WriteState::Writing,
                    cause,
                }
            },
        }
    }
}

/// How the write step failed
enum WriteFailure {
    /// Rows were rolled back to the savepoint; the transaction is still usable
    Rows(SinkError),
    /// The savepoint itself failed; the transaction must be abandoned
    Transaction(SinkError),
}

/// Insert the unit's rows inside a savepoint, releasing or rolling it back
async fn write_step(
    conn: &mut PgConnection,
    unit: &WriteUnit,
    page_size: usize,
) -> Result<u64, WriteFailure> {
    let store_err =
        |e: sqlx::Error| WriteFailure::Transaction(SinkError::from_store(unit.relation.as_str(), e));

    let mut savepoint = conn.begin().await.map_err(store_err)?;

    match writer::write_rows(&mut savepoint, &unit.relation, &unit.columns, &unit.rows, page_size).await {
        Ok(rows) => {
            savepoint.commit().await.map_err(store_err)?;
            Ok(rows)
        },
        Err(cause) => {
            enter(WriteState::RollingBack);
            if let Err(e) = savepoint.rollback().await {
                warn!(error = %e, "Savepoint rollback failed, abandoning transaction");
                return Err(WriteFailure::Transaction(cause));
            }
            Err(WriteFailure::Rows(cause))
        },
    }
}

/// Cause to report when both the write and the follow-up commit failed
///
/// A transient commit failure wins so the message is retried instead of dropped.
fn failed_write_cause(write: SinkError, commit: SinkError) -> SinkError {
    match commit.disposition() {
        Disposition::Retry => commit,
        _ => write,
    }
}

#[async_trait]
impl WriteCoordinator for PgCoordinator {
    async fn process(&self, message: &TableMessage) -> Outcome {
        let unit = match message.to_write_unit() {
            Ok(unit) => unit,
            Err(reason) => {
                debug!(reason = %reason, "Skipping empty message");
                return Outcome::Skipped { reason };
            },
        };

        let span = info_span!("write_unit", relation = %unit.relation, rows = unit.row_count());
        async {
            enter(WriteState::Received);
            self.run(unit).await
        }
        .instrument(span)
        .await
    }
}

fn enter(state: WriteState) {
    debug!(state = state.as_str(), "Write unit state");
}

/// Roll back the whole transaction, provisioning included
async fn abort(
    tx: Transaction<'static, Postgres>,
    relation: SafeIdentifier,
    failed_in: WriteState,
    cause: SinkError,
) -> Outcome {
    enter(WriteState::RollingBack);
    if let Err(e) = tx.rollback().await {
        // The connection is discarded by the pool if the session is gone
        warn!(error = %e, "Rollback failed");
    }
    enter(WriteState::RolledBack);
    warn!(
        error = %cause,
        kind = cause.kind(),
        failed_in = failed_in.as_str(),
        "Write unit rolled back"
    );

    Outcome::RolledBack {
        relation,
        failed_in,
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn test_empty_message_skips_without_touching_the_store() {
        // Lazy pool pointing nowhere: any store access would fail with an IO error.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgresql://nobody@127.0.0.1:1/none")
            .unwrap();
        let coordinator = PgCoordinator::new(pool, 100);

        let msg = TableMessage::decode(br#"{"table_name":"","columns":[],"data":[]}"#).unwrap();
        match coordinator.process(&msg).await {
            Outcome::Skipped { reason } => assert_eq!(reason.kind(), "malformed"),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_rolls_back_as_unavailable() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgresql://nobody@127.0.0.1:1/none")
            .unwrap();
        let coordinator = PgCoordinator::new(pool, 100);

        let msg = TableMessage::new("t", ["x"], vec![vec![serde_json::json!("1")]]);
        match coordinator.process(&msg).await {
            Outcome::RolledBack { failed_in, cause, .. } => {
                assert_eq!(failed_in, WriteState::Received);
                assert!(matches!(cause, SinkError::StorageUnavailable(_)), "{:?}", cause);
            },
            other => panic!("expected rollback, got {:?}", other),
        }
    }

    #[test]
    fn test_transient_commit_failure_outranks_write_failure() {
        let write = || SinkError::ArityMismatch { row: 0, expected: 2, actual: 1 };

        let cause = failed_write_cause(write(), SinkError::StorageUnavailable(sqlx::Error::PoolClosed));
        assert!(matches!(cause, SinkError::StorageUnavailable(_)), "{:?}", cause);

        let cause = failed_write_cause(write(), SinkError::Storage(sqlx::Error::RowNotFound));
        assert!(matches!(cause, SinkError::ArityMismatch { .. }), "{:?}", cause);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(WriteState::RollingBack.as_str(), "rolling_back");
        assert_eq!(WriteState::Committed.as_str(), "committed");
    }
}
