//! Schema provisioning
//!
//! Destination relations are created on first sight with every column declared `TEXT`.
//! Existing relations are never altered; a column the relation lacks surfaces later as a
//! schema conflict in the writer.

use sqlx::{Connection, PgConnection};
use tracing::debug;

use crate::error::{sqlstate, sqlstate_of, Result, SinkError};
use crate::identifier::SafeIdentifier;

/// Declared type of every provisioned column
pub const COLUMN_TYPE: &str = "TEXT";

/// `CREATE TABLE IF NOT EXISTS "rel" ("a" TEXT, "b" TEXT)`
pub fn create_table_sql(relation: &SafeIdentifier, columns: &[SafeIdentifier]) -> String {
    let definitions = columns
        .iter()
        .map(|column| format!("{} {}", column.quoted(), COLUMN_TYPE))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        relation.quoted(),
        definitions
    )
}

/// Make sure `relation` exists, inside the caller's open transaction
///
/// The DDL runs in a savepoint. Two sessions racing on the same name can make
/// `IF NOT EXISTS` fail with a catalog unique violation or `duplicate_table`; the savepoint
/// is rolled back and the relation treated as present, leaving the outer transaction usable.
pub async fn ensure(
    conn: &mut PgConnection,
    relation: &SafeIdentifier,
    columns: &[SafeIdentifier],
) -> Result<()> {
    let sql = create_table_sql(relation, columns);
    let store_err = |e: sqlx::Error| SinkError::from_store(relation.as_str(), e);

    let mut savepoint = conn.begin().await.map_err(store_err)?;

    match sqlx::query(&sql).persistent(false).execute(&mut *savepoint).await {
        Ok(_) => {
            savepoint.commit().await.map_err(store_err)?;
            debug!(relation = %relation, columns = columns.len(), "Relation provisioned");
            Ok(())
        },
        Err(err) if is_creation_race(&err) => {
            savepoint.rollback().await.map_err(store_err)?;
            debug!(relation = %relation, "Relation created concurrently by another session");
            Ok(())
        },
        Err(err) => {
            savepoint.rollback().await.map_err(store_err)?;
            Err(store_err(err))
        },
    }
}

fn is_creation_race(err: &sqlx::Error) -> bool {
    sqlstate_of(err).is_some_and(|code| {
        code == sqlstate::UNIQUE_VIOLATION || code == sqlstate::DUPLICATE_TABLE
    })
}
