//! Dataset source backed by the downloaded-datasets SQLite file.
//!
//! The Tableau downloader stores each dataset as a table named after it.
//! Filters and parameters of the originating view, when known, live in an
//! optional `dataset_context(dataset, kind, name, value)` table with `kind`
//! either `filter` or `parameter`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use tabreport_core::{Cell, DataSource, Dataset, ReportError, Result};

pub struct SqliteDatasetSource {
    path: PathBuf,
}

impl SqliteDatasetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataSource for SqliteDatasetSource {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn fetch(&self, source_ref: &str) -> Result<Dataset> {
        let path = self.path.clone();
        let table = source_ref.to_string();
        tokio::task::spawn_blocking(move || load_dataset(&path, &table))
            .await
            .map_err(|e| ReportError::DataFetch(format!("dataset load task failed: {e}")))?
    }
}

fn fetch_err(e: rusqlite::Error) -> ReportError {
    ReportError::DataFetch(e.to_string())
}

fn load_dataset(path: &Path, table: &str) -> Result<Dataset> {
    if !path.exists() {
        return Err(ReportError::DataFetch(format!(
            "datastore {} not found",
            path.display()
        )));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(fetch_err)?;

    if !object_exists(&conn, table)? {
        return Err(ReportError::DataFetch(format!("dataset '{table}' not found")));
    }

    let quoted = format!("\"{}\"", table.replace('"', "\"\""));
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM {quoted}"))
        .map_err(fetch_err)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut dataset = Dataset::new(table, columns);

    let mut blob_columns = Vec::new();
    let mut rows = stmt.query([]).map_err(fetch_err)?;
    while let Some(row) = rows.next().map_err(fetch_err)? {
        let mut cells = Vec::with_capacity(dataset.column_count());
        for i in 0..dataset.column_count() {
            let value = row.get_ref(i).map_err(fetch_err)?;
            if matches!(value, ValueRef::Blob(_)) && !blob_columns.contains(&i) {
                blob_columns.push(i);
            }
            cells.push(to_cell(value));
        }
        dataset.push_row(cells);
    }
    if !blob_columns.is_empty() {
        let names: Vec<&str> = blob_columns
            .iter()
            .map(|&i| dataset.columns[i].as_str())
            .collect();
        tracing::warn!(
            "⚠️ Dataset '{table}' has binary values in {}; they are shown as hex",
            names.join(", ")
        );
    }
    if dataset.is_empty() {
        return Err(ReportError::DataFetch(format!("dataset '{table}' is empty")));
    }

    if object_exists(&conn, "dataset_context")? {
        let mut stmt = conn
            .prepare(
                "SELECT kind, name, value FROM dataset_context WHERE dataset = ?1 ORDER BY rowid",
            )
            .map_err(fetch_err)?;
        let pairs = stmt
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                ))
            })
            .map_err(fetch_err)?;
        for pair in pairs {
            let (kind, name, value) = pair.map_err(fetch_err)?;
            match kind.as_str() {
                "filter" => dataset.filters.push((name, value)),
                "parameter" => dataset.parameters.push((name, value)),
                other => tracing::debug!("Ignoring dataset_context kind '{other}'"),
            }
        }
    }

    tracing::debug!(
        "📥 Loaded dataset '{table}': {} rows × {} columns",
        dataset.row_count(),
        dataset.column_count()
    );
    Ok(dataset)
}

fn object_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        params![name],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(fetch_err)
}

fn to_cell(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(i) => Cell::Int(i),
        ValueRef::Real(f) => Cell::Float(f),
        ValueRef::Text(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Cell::Text(format!("0x{}", hex::encode(bytes))),
    }
}
