//! Batch writer
//!
//! Rows are inserted with multi-row parameterized `INSERT`s, one statement per page,
//! rather than one round trip per row. Every value is bound as text or NULL.

use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::debug;

use crate::error::{Result, SinkError};
use crate::identifier::{quoted_list, SafeIdentifier};

/// Default rows per INSERT statement
pub const DEFAULT_INSERT_PAGE_SIZE: usize = 100;

/// Bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Reject the batch if any row's length differs from the column count
pub fn check_arity(column_count: usize, rows: &[Vec<Option<String>>]) -> Result<()> {
    match rows.iter().position(|row| row.len() != column_count) {
        Some(row) => Err(SinkError::ArityMismatch {
            row,
            expected: column_count,
            actual: rows[row].len(),
        }),
        None => Ok(()),
    }
}

/// Rows per statement: the configured page size, capped by the bind parameter limit
pub fn rows_per_statement(page_size: usize, column_count: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / column_count.max(1);
    page_size.clamp(1, by_params.max(1))
}

/// `INSERT INTO "rel" ("a", "b") VALUES ($1, $2), ($3, $4), ...`
pub fn insert_statement<'a>(
    relation: &SafeIdentifier,
    columns: &[SafeIdentifier],
    rows: &'a [Vec<Option<String>>],
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        relation.quoted(),
        quoted_list(columns)
    ));

    builder.push_values(rows, |mut values, row| {
        for cell in row {
            values.push_bind(cell.as_deref());
        }
    });

    builder
}

/// Insert `rows` into `relation` on the caller's connection
///
/// Returns the number of rows written. Arity is validated before any statement is sent,
/// so a malformed batch never partially reaches the store.
pub async fn write_rows(
    conn: &mut PgConnection,
    relation: &SafeIdentifier,
    columns: &[SafeIdentifier],
    rows: &[Vec<Option<String>>],
    page_size: usize,
) -> Result<u64> {
    check_arity(columns.len(), rows)?;

    let per_statement = rows_per_statement(page_size, columns.len());
    let mut written = 0;

    for page in rows.chunks(per_statement) {
        let mut builder = insert_statement(relation, columns, page);
        let result = builder
            .build()
            .persistent(false)
            .execute(&mut *conn)
            .await
            .map_err(|e| SinkError::from_store(relation.as_str(), e))?;

        written += result.rows_affected();
        debug!(relation = %relation, page_rows = page.len(), "Inserted page");
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{sanitize, sanitize_all};

    fn row(cells: &[&str]) -> Vec<Option<String>> {
        cells.iter().map(|c| Some(c.to_string())).collect()
    }

    #[test]
    fn test_insert_statement_placeholders() {
        let rows = vec![row(&["east", "100"]), row(&["west", "200"])];
        let builder = insert_statement(
            &sanitize("Sales Q1"),
            &sanitize_all(&["Region", "Amount"]),
            &rows,
        );

        assert_eq!(
            builder.sql(),
            r#"INSERT INTO "Sales_Q1" ("Region", "Amount") VALUES ($1, $2), ($3, $4)"#
        );
    }

    #[test]
    fn test_insert_statement_with_nulls_keeps_placeholder_count() {
        let rows = vec![vec![None, Some("x".to_string())]];
        let builder = insert_statement(&sanitize("t"), &sanitize_all(&["a", "b"]), &rows);
        assert_eq!(builder.sql(), r#"INSERT INTO "t" ("a", "b") VALUES ($1, $2)"#);
    }

    #[test]
    fn test_check_arity_reports_first_bad_row() {
        let rows = vec![row(&["1", "2"]), row(&["1"]), row(&["1", "2", "3"])];
        match check_arity(2, &rows) {
            Err(SinkError::ArityMismatch { row, expected, actual }) => {
                assert_eq!((row, expected, actual), (1, 2, 1));
            },
            other => panic!("expected arity mismatch, got {:?}", other),
        }
        assert!(check_arity(2, &rows[..1]).is_ok());
    }

    #[test]
    fn test_rows_per_statement() {
        assert_eq!(rows_per_statement(100, 2), 100);
        assert_eq!(rows_per_statement(0, 2), 1);
        assert_eq!(rows_per_statement(100_000, 1), MAX_BIND_PARAMS);
        assert_eq!(rows_per_statement(100_000, 1000), 65);
        assert_eq!(rows_per_statement(10, 100_000), 1);
    }
}
