//! CSV output, data only. Paper size, orientation, filters and parameters
//! do not apply to CSV.

use tabreport_core::{Dataset, ReportError, Result};

pub fn render_csv(dataset: &Dataset) -> Result<Vec<u8>> {
    // Flexible so rows wider than the header are written in full.
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    writer
        .write_record(&dataset.columns)
        .map_err(|e| ReportError::Render(format!("CSV header: {e}")))?;
    for row in &dataset.rows {
        writer
            .write_record(row.iter().map(|c| c.to_string()))
            .map_err(|e| ReportError::Render(format!("CSV row: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| ReportError::Render(format!("CSV flush: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabreport_core::Cell;

    #[test]
    fn test_quotes_and_nulls() {
        let mut ds = Dataset::new("t", vec!["name".into(), "note".into()]);
        ds.push_row(vec!["a,b".into(), Cell::Null]);
        ds.push_row(vec!["say \"hi\"".into(), Cell::Int(3)]);
        let out = String::from_utf8(render_csv(&ds).unwrap()).unwrap();
        assert_eq!(out, "name,note\n\"a,b\",\n\"say \"\"hi\"\"\",3\n");
    }

    #[test]
    fn test_wide_row_is_kept() {
        let mut ds = Dataset::new("t", vec!["a".into()]);
        ds.rows.push(vec![Cell::Int(1), Cell::Int(2)]);
        let out = String::from_utf8(render_csv(&ds).unwrap()).unwrap();
        assert_eq!(out, "a\n1,2\n");
    }
}
