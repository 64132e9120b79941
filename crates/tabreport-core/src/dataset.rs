//! Tabular dataset produced by the data-extraction collaborator.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ReportError, Result};

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Numeric view of the cell, used for totals/averages and Excel numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

/// Rows and columns of one downloaded Tableau view, plus the view context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Display title (usually the dataset/view name).
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Filters applied to the view when it was extracted.
    #[serde(default)]
    pub filters: Vec<(String, String)>,
    /// Workbook parameters in effect when it was extracted.
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
}

impl Dataset {
    pub fn new(title: &str, columns: Vec<String>) -> Self {
        Self {
            title: title.to_string(),
            columns,
            ..Default::default()
        }
    }

    /// Append a row. Short rows are padded with nulls so every row has one
    /// cell per column.
    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        if row.len() < self.columns.len() {
            row.resize(self.columns.len(), Cell::Null);
        }
        self.rows.push(row);
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Indices of columns whose non-null cells are all numeric (and at least one exists).
    pub fn numeric_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|&col| {
                let mut seen = false;
                for row in &self.rows {
                    match row.get(col) {
                        Some(Cell::Null) | None => {}
                        Some(cell) if cell.as_f64().is_some() => seen = true,
                        Some(_) => return false,
                    }
                }
                seen
            })
            .collect()
    }

    /// A copy holding only the named columns, in the order given.
    pub fn select_columns(&self, names: &[String]) -> Result<Dataset> {
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            let index = self
                .columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| {
                    ReportError::Render(format!(
                        "column '{name}' is not in dataset '{}' (has: {})",
                        self.title,
                        self.columns.join(", ")
                    ))
                })?;
            indices.push(index);
        }
        Ok(Dataset {
            title: self.title.clone(),
            columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| {
                    indices
                        .iter()
                        .map(|&i| row.get(i).cloned().unwrap_or(Cell::Null))
                        .collect()
                })
                .collect(),
            filters: self.filters.clone(),
            parameters: self.parameters.clone(),
        })
    }

    /// Sum and mean of a numeric column, skipping nulls.
    pub fn column_stats(&self, col: usize) -> Option<(f64, f64)> {
        let values: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|r| r.get(col).and_then(Cell::as_f64))
            .collect();
        if values.is_empty() {
            return None;
        }
        let total: f64 = values.iter().sum();
        Some((total, total / values.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales() -> Dataset {
        let mut ds = Dataset::new("sales", vec!["region".into(), "amount".into()]);
        ds.push_row(vec!["north".into(), Cell::Int(10)]);
        ds.push_row(vec!["south".into(), Cell::Float(5.5)]);
        ds.push_row(vec!["east".into()]);
        ds
    }

    #[test]
    fn test_push_row_pads_short_rows() {
        let ds = sales();
        assert_eq!(ds.rows[2].len(), 2);
        assert!(ds.rows[2][1].is_null());
    }

    #[test]
    fn test_numeric_columns_and_stats() {
        let ds = sales();
        assert_eq!(ds.numeric_columns(), vec![1]);
        let (total, avg) = ds.column_stats(1).unwrap();
        assert_eq!(total, 15.5);
        assert_eq!(avg, 7.75);
        assert!(ds.column_stats(0).is_none());
    }

    #[test]
    fn test_select_columns_reorders_and_rejects_unknown() {
        let ds = sales();
        let picked = ds.select_columns(&["amount".to_string(), "region".to_string()]).unwrap();
        assert_eq!(picked.columns, vec!["amount", "region"]);
        assert_eq!(picked.rows[0], vec![Cell::Int(10), Cell::from("north")]);
        assert_eq!(picked.row_count(), 3);

        let err = ds.select_columns(&["profit".to_string()]).unwrap_err();
        assert!(matches!(err, ReportError::Render(_)));
        assert!(err.to_string().contains("profit"));
    }

    #[test]
    fn test_cell_display() {
        assert_eq!(Cell::Null.to_string(), "");
        assert_eq!(Cell::Int(-3).to_string(), "-3");
        assert_eq!(Cell::Bool(true).to_string(), "true");
        assert_eq!(Cell::from("x").to_string(), "x");
    }
}
