//! # TabReport Render
//!
//! Converts a `Dataset` plus `FormatOptions` into a report payload.
//! Output is deterministic: the same input always yields the same bytes.
//!
//! ```text
//! render(dataset, options)
//!   ├── csv   → csv_writer  (data only)
//!   ├── excel → xlsx        (Data + optional Filters/Parameters sheets)
//!   ├── pdf   → layout → pdf     (paginated monospace table)
//!   └── png   → layout → raster  (same pages, stacked in one image)
//! ```

pub mod csv_writer;
pub mod layout;
pub mod pdf;
pub mod raster;
pub mod xlsx;

use chrono::{DateTime, Utc};
use tabreport_core::{Dataset, FileFormat, FormatOptions, Result};

/// A rendered report payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReport {
    pub format: FileFormat,
    pub bytes: Vec<u8>,
}

impl RenderedReport {
    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Render a dataset in the format selected by `options.file_format`.
///
/// `options.selected_columns`, when set, narrows and reorders the columns
/// for every format; naming a column the dataset lacks is a render error.
pub fn render(dataset: &Dataset, options: &FormatOptions) -> Result<RenderedReport> {
    let selected;
    let dataset = if options.selected_columns.is_empty() {
        dataset
    } else {
        selected = dataset.select_columns(&options.selected_columns)?;
        &selected
    };
    let bytes = match options.file_format {
        FileFormat::Csv => csv_writer::render_csv(dataset)?,
        FileFormat::Excel => xlsx::render_xlsx(dataset, options)?,
        FileFormat::Pdf => pdf::render_pdf(dataset, options)?,
        FileFormat::Png => raster::render_png(dataset, options)?,
    };
    tracing::debug!(
        "🖨️ Rendered '{}' as {} ({} rows, {} bytes)",
        dataset.title,
        options.file_format.as_str(),
        dataset.row_count(),
        bytes.len()
    );
    Ok(RenderedReport {
        format: options.file_format,
        bytes,
    })
}

/// Render with a format given by name. Unknown names fail with
/// `ReportError::UnsupportedFormat`.
pub fn render_format(
    dataset: &Dataset,
    format_name: &str,
    options: &FormatOptions,
) -> Result<RenderedReport> {
    let file_format = format_name.parse::<FileFormat>()?;
    render(
        dataset,
        &FormatOptions {
            file_format,
            ..options.clone()
        },
    )
}

/// Attachment filename: `<base>_<YYYYmmdd_HHMMSS>.<ext>` with unsafe characters replaced.
pub fn report_filename(base: &str, format: FileFormat, at: DateTime<Utc>) -> String {
    let mut safe: String = base
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if safe.is_empty() {
        safe = "report".into();
    }
    format!("{}_{}.{}", safe, at.format("%Y%m%d_%H%M%S"), format.extension())
}
