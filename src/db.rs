//! Analytical engine sessions.
//!
//! Thin helpers over the embedded engine: opening in-memory sessions with the
//! spatial extension loaded, registering in-memory columnar batches as temp
//! tables, and running queries with the failing fragment attached to errors.

use arrow::record_batch::RecordBatch;
use duckdb::vtab::arrow::{arrow_recordbatch_to_query_params, ArrowVTab};
use duckdb::Connection;

use crate::error::{LrsError, Result};

/// Open an in-memory session with the spatial extension loaded.
pub(crate) fn open_spatial() -> Result<Connection> {
    let conn = open_plain()?;
    conn.execute_batch("INSTALL spatial; LOAD spatial;")
        .map_err(|e| LrsError::engine(format!("failed to load spatial extension: {}", e), None))?;
    Ok(conn)
}

/// Open an in-memory session without extensions. Used for catalog-only work.
pub(crate) fn open_plain() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.register_table_function::<ArrowVTab>("arrow")
        .map_err(|e| LrsError::engine(format!("failed to register arrow scan: {}", e), None))?;
    Ok(conn)
}

/// Create a temp table from in-memory batches, one append per batch so row
/// order follows batch order.
pub(crate) fn register_batches(
    conn: &Connection,
    table: &str,
    batches: &[RecordBatch],
) -> Result<()> {
    if batches.is_empty() {
        return Err(LrsError::validation(format!(
            "no record batches to register as {}",
            table
        )));
    }

    for (i, batch) in batches.iter().enumerate() {
        let sql = if i == 0 {
            format!("CREATE TEMP TABLE {} AS SELECT * FROM arrow(?, ?)", table)
        } else {
            format!("INSERT INTO {} SELECT * FROM arrow(?, ?)", table)
        };
        let params = arrow_recordbatch_to_query_params(batch.clone());
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| LrsError::engine(e.to_string(), Some(sql.clone())))?;
        stmt.execute(params)
            .map_err(|e| LrsError::engine(e.to_string(), Some(sql.clone())))?;
    }

    Ok(())
}

/// Execute a statement, surfacing the failing fragment on error.
pub(crate) fn exec(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql)
        .map_err(|e| LrsError::engine(e.to_string(), Some(sql.to_string())))
}

/// Run a query and collect its result batches.
pub(crate) fn query_batches(conn: &Connection, sql: &str) -> Result<Vec<RecordBatch>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| LrsError::engine(e.to_string(), Some(sql.to_string())))?;
    let arrow = stmt
        .query_arrow([])
        .map_err(|e| LrsError::engine(e.to_string(), Some(sql.to_string())))?;
    Ok(arrow.collect())
}

/// Escape a string for embedding as a single-quoted SQL literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("01001"), "'01001'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
