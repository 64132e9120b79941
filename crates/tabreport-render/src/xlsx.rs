//! Excel output via rust_xlsxwriter.
//!
//! The workbook creation date is pinned so identical datasets produce
//! identical files. Paper size and orientation do not apply. Sheets:
//! Data, then Filters, Parameters and Summary when enabled.

use rust_xlsxwriter::{DocProperties, ExcelDateTime, Format, Workbook, Worksheet, XlsxError};
use tabreport_core::{Cell, Dataset, FormatOptions, ReportError, Result};

/// Worksheet limits: 1,048,576 rows (one used by the header) and 16,384 columns.
pub const MAX_DATA_ROWS: usize = 1_048_575;
pub const MAX_COLUMNS: usize = 16_384;

fn xlsx_err(e: XlsxError) -> ReportError {
    ReportError::Render(format!("Excel: {e}"))
}

pub fn render_xlsx(dataset: &Dataset, options: &FormatOptions) -> Result<Vec<u8>> {
    let width = dataset
        .rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(dataset.columns.len()))
        .max()
        .unwrap_or(0);
    if dataset.row_count() > MAX_DATA_ROWS {
        return Err(ReportError::Render(format!(
            "{} rows exceed the Excel sheet limit of {MAX_DATA_ROWS}",
            dataset.row_count()
        )));
    }
    if width > MAX_COLUMNS {
        return Err(ReportError::Render(format!(
            "{width} columns exceed the Excel sheet limit of {MAX_COLUMNS}"
        )));
    }

    let mut workbook = Workbook::new();
    let created = ExcelDateTime::from_ymd(2000, 1, 1).map_err(xlsx_err)?;
    let title = options.title_for(&dataset.title);
    let properties = DocProperties::new()
        .set_title(&title)
        .set_creation_datetime(&created);
    workbook.set_properties(&properties);

    let bold = Format::new().set_bold();

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Data").map_err(xlsx_err)?;
        for (col, name) in dataset.columns.iter().enumerate() {
            sheet
                .write_string_with_format(0, col as u16, name, &bold)
                .map_err(xlsx_err)?;
        }
        for (r, row) in dataset.rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                write_cell(sheet, (r + 1) as u32, c as u16, cell)?;
            }
        }
    }

    if options.include_filters {
        add_pairs_sheet(&mut workbook, "Filters", &dataset.filters, &bold)?;
    }
    if options.include_parameters {
        add_pairs_sheet(&mut workbook, "Parameters", &dataset.parameters, &bold)?;
    }
    if options.wants_summary() {
        add_summary_sheet(&mut workbook, dataset, options, &bold)?;
    }

    workbook.save_to_buffer().map_err(xlsx_err)
}

fn write_cell(sheet: &mut Worksheet, row: u32, col: u16, cell: &Cell) -> Result<()> {
    match cell {
        Cell::Null => {}
        Cell::Bool(b) => {
            sheet.write_boolean(row, col, *b).map_err(xlsx_err)?;
        }
        Cell::Int(_) | Cell::Float(_) => match cell.as_f64() {
            Some(v) => {
                sheet.write_number(row, col, v).map_err(xlsx_err)?;
            }
            // NaN / infinity are not valid Excel numbers; keep them as text.
            None => {
                sheet.write_string(row, col, cell.to_string()).map_err(xlsx_err)?;
            }
        },
        Cell::Text(s) => {
            sheet.write_string(row, col, s).map_err(xlsx_err)?;
        }
    }
    Ok(())
}

fn add_pairs_sheet(
    workbook: &mut Workbook,
    name: &str,
    pairs: &[(String, String)],
    bold: &Format,
) -> Result<()> {
    let sheet = workbook.add_worksheet();
    sheet.set_name(name).map_err(xlsx_err)?;
    sheet.write_string_with_format(0, 0, "Name", bold).map_err(xlsx_err)?;
    sheet.write_string_with_format(0, 1, "Value", bold).map_err(xlsx_err)?;
    for (i, (key, value)) in pairs.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_string(row, 0, key).map_err(xlsx_err)?;
        sheet.write_string(row, 1, value).map_err(xlsx_err)?;
    }
    Ok(())
}

fn add_summary_sheet(
    workbook: &mut Workbook,
    dataset: &Dataset,
    options: &FormatOptions,
    bold: &Format,
) -> Result<()> {
    let mut entries: Vec<(String, f64)> = Vec::new();
    if options.include_row_count {
        entries.push(("Total Rows".into(), dataset.row_count() as f64));
    }
    for col in dataset.numeric_columns() {
        let Some((total, average)) = dataset.column_stats(col) else {
            continue;
        };
        let name = &dataset.columns[col];
        if options.include_totals {
            entries.push((format!("Total {name}"), total));
        }
        if options.include_averages {
            entries.push((format!("Average {name}"), average));
        }
    }

    let sheet = workbook.add_worksheet();
    sheet.set_name("Summary").map_err(xlsx_err)?;
    sheet.write_string_with_format(0, 0, "Metric", bold).map_err(xlsx_err)?;
    sheet.write_string_with_format(0, 1, "Value", bold).map_err(xlsx_err)?;
    for (i, (label, value)) in entries.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_string(row, 0, label).map_err(xlsx_err)?;
        if value.is_finite() {
            sheet.write_number(row, 1, *value).map_err(xlsx_err)?;
        } else {
            sheet.write_string(row, 1, value.to_string()).map_err(xlsx_err)?;
        }
    }
    Ok(())
}
