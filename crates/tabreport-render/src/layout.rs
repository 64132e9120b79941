//! Page layout shared by the PDF and PNG renderers.
//!
//! Lays a dataset out as fixed-width text lines. Nothing is clipped:
//! tables wider than the page are split into column groups, tables longer
//! than the page continue on the next page with the header repeated, and
//! cell text longer than its column wraps onto extra lines.

use std::collections::BTreeSet;
use std::ops::Range;

use tabreport_core::{Dataset, FormatOptions, ReportError, Result};

/// Widest a single column may get before its cells wrap.
pub const MAX_COLUMN_CHARS: usize = 40;
/// Narrowest line the layout will produce, whatever the page size.
pub const MIN_LINE_CHARS: usize = 16;
const SEPARATOR: &str = " | ";

/// One line of laid-out text.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub text: String,
    pub bold: bool,
}

impl Line {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bold: false,
        }
    }

    pub fn bold(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bold: true,
        }
    }

    fn blank() -> Self {
        Self::plain("")
    }
}

/// Text capacity of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub chars_per_line: usize,
    pub lines_per_page: usize,
}

pub type Page = Vec<Line>;

struct Pager {
    capacity: usize,
    pages: Vec<Page>,
    current: Page,
}

impl Pager {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pages: Vec::new(),
            current: Vec::new(),
        }
    }

    fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.current.len())
    }

    fn push(&mut self, line: Line) {
        if self.current.len() >= self.capacity {
            self.break_page();
        }
        self.current.push(line);
    }

    fn break_page(&mut self) {
        if !self.current.is_empty() {
            self.pages.push(std::mem::take(&mut self.current));
        }
    }

    /// Start a table header, moving to a new page if it would leave no room for a row.
    fn push_header(&mut self, header: &[Line]) {
        if header.len() + 1 > self.remaining() && !self.current.is_empty() {
            self.break_page();
        }
        for line in header {
            self.push(line.clone());
        }
    }

    fn finish(mut self) -> Vec<Page> {
        self.break_page();
        if self.pages.is_empty() {
            self.pages.push(Vec::new());
        }
        self.pages
    }
}

/// Lay out the whole report into pages.
pub fn layout(dataset: &Dataset, options: &FormatOptions, geometry: PageGeometry) -> Vec<Page> {
    let width = geometry.chars_per_line.max(MIN_LINE_CHARS);
    let mut pager = Pager::new(geometry.lines_per_page);

    let title = options.title_for(&dataset.title);
    for line in wrap(&title, width) {
        pager.push(Line::bold(line));
    }
    pager.push(Line::blank());

    if options.include_filters {
        push_pairs(&mut pager, "Filters", &dataset.filters, width);
    }
    if options.include_parameters {
        push_pairs(&mut pager, "Parameters", &dataset.parameters, width);
    }

    let columns = effective_columns(dataset);
    let cells: Vec<Vec<String>> = dataset
        .rows
        .iter()
        .map(|row| {
            (0..columns.len())
                .map(|i| row.get(i).map(|c| c.to_string()).unwrap_or_default())
                .collect()
        })
        .collect();
    let widths = column_widths(&columns, &cells, width.min(MAX_COLUMN_CHARS));
    let groups = column_groups(&widths, width);

    for (gi, group) in groups.iter().enumerate() {
        if gi > 0 {
            pager.break_page();
        }
        let group_widths = &widths[group.clone()];
        let mut header = Vec::new();
        if groups.len() > 1 {
            header.push(Line::bold(format!(
                "Columns {}-{} of {}",
                group.start + 1,
                group.end,
                columns.len()
            )));
        }
        header.extend(
            row_lines(&columns[group.clone()], group_widths)
                .into_iter()
                .map(Line::bold),
        );
        header.push(Line::plain(rule(group_widths)));
        pager.push_header(&header);

        for row in &cells {
            let lines = row_lines(&row[group.clone()], group_widths);
            // Keep a row on one page when it can fit on one.
            if lines.len() > pager.remaining() && lines.len() + header.len() <= pager.capacity {
                pager.break_page();
                pager.push_header(&header);
            }
            for line in lines {
                if pager.remaining() == 0 {
                    pager.break_page();
                    pager.push_header(&header);
                }
                pager.push(Line::plain(line));
            }
        }
    }

    if options.wants_summary() {
        push_summary(&mut pager, dataset, options, &columns, width);
    }
    pager.finish()
}

/// Whether the fixed-width fonts used for PDF and PNG can draw `c`.
pub fn is_drawable(c: char) -> bool {
    matches!(c, ' '..='~' | '\u{A0}'..='\u{FF}')
}

/// Refuse pages holding characters the fixed-width fonts cannot draw,
/// naming the offending code points.
pub fn ensure_drawable(pages: &[Page], format_name: &str) -> Result<()> {
    let missing: BTreeSet<char> = pages
        .iter()
        .flatten()
        .flat_map(|line| line.text.chars())
        .filter(|&c| !is_drawable(c))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    const SHOWN: usize = 8;
    let mut listed: Vec<String> = missing
        .iter()
        .take(SHOWN)
        .map(|&c| format!("U+{:04X} '{c}'", c as u32))
        .collect();
    if missing.len() > SHOWN {
        listed.push(format!("{} more", missing.len() - SHOWN));
    }
    Err(ReportError::Render(format!(
        "{format_name} output cannot draw {}; use csv or excel for this dataset",
        listed.join(", ")
    )))
}

fn push_pairs(pager: &mut Pager, heading: &str, pairs: &[(String, String)], width: usize) {
    pager.push(Line::bold(heading));
    if pairs.is_empty() {
        pager.push(Line::plain("  (none)"));
    }
    for (name, value) in pairs {
        for line in wrap(&format!("  {name}: {value}"), width) {
            pager.push(Line::plain(line));
        }
    }
    pager.push(Line::blank());
}

/// Row count plus totals and averages of numeric columns, as enabled.
fn push_summary(
    pager: &mut Pager,
    dataset: &Dataset,
    options: &FormatOptions,
    columns: &[String],
    width: usize,
) {
    let mut lines = vec![Line::blank(), Line::bold("Summary")];
    if options.include_row_count {
        lines.push(Line::plain(format!("Total Rows: {}", dataset.row_count())));
    }
    for col in dataset.numeric_columns() {
        let Some((total, average)) = dataset.column_stats(col) else {
            continue;
        };
        let name = &columns[col];
        let mut stats = Vec::new();
        if options.include_totals {
            stats.push(format!("Total {name}: {total:.2}"));
        }
        if options.include_averages {
            stats.push(format!("Average {name}: {average:.2}"));
        }
        for text in stats.iter().flat_map(|s| wrap(s, width)) {
            lines.push(Line::plain(text));
        }
    }
    if lines.len() > pager.remaining() && lines.len() <= pager.capacity {
        pager.break_page();
    }
    for line in lines {
        pager.push(line);
    }
}

/// Header names, extended with placeholders when rows are wider than the header.
fn effective_columns(dataset: &Dataset) -> Vec<String> {
    let width = dataset
        .rows
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .max(dataset.columns.len());
    (0..width)
        .map(|i| {
            dataset
                .columns
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("column {}", i + 1))
        })
        .collect()
}

fn column_widths(columns: &[String], cells: &[Vec<String>], max: usize) -> Vec<usize> {
    columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .map(|row| longest_line(&row[i]))
                .chain(std::iter::once(longest_line(name)))
                .max()
                .unwrap_or(1)
                .clamp(1, max.max(1))
        })
        .collect()
}

/// Greedily pack columns into groups that fit the line width.
fn column_groups(widths: &[usize], line_width: usize) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, &w) in widths.iter().enumerate() {
        if i == start {
            used = w;
            continue;
        }
        let needed = used + SEPARATOR.len() + w;
        if needed > line_width {
            groups.push(start..i);
            start = i;
            used = w;
        } else {
            used = needed;
        }
    }
    if start < widths.len() || groups.is_empty() {
        groups.push(start..widths.len());
    }
    groups
}

fn row_lines(cells: &[String], widths: &[usize]) -> Vec<String> {
    let wrapped: Vec<Vec<String>> = cells
        .iter()
        .zip(widths)
        .map(|(cell, &w)| wrap(cell, w))
        .collect();
    let height = wrapped.iter().map(Vec::len).max().unwrap_or(1);
    (0..height)
        .map(|li| {
            let parts: Vec<String> = wrapped
                .iter()
                .zip(widths)
                .map(|(lines, &w)| pad(lines.get(li).map(String::as_str).unwrap_or(""), w))
                .collect();
            parts.join(SEPARATOR).trim_end().to_string()
        })
        .collect()
}

fn rule(widths: &[usize]) -> String {
    widths
        .iter()
        .map(|&w| "-".repeat(w))
        .collect::<Vec<_>>()
        .join("-+-")
}

fn pad(text: &str, width: usize) -> String {
    let len = text.chars().count();
    let mut out = text.to_string();
    out.extend(std::iter::repeat_n(' ', width.saturating_sub(len)));
    out
}

fn longest_line(text: &str) -> usize {
    text.split('\n').map(|l| l.chars().count()).max().unwrap_or(0)
}

/// Hard-wrap text into chunks of at most `width` characters.
/// Control characters become spaces; explicit newlines are kept as breaks.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut out = Vec::new();
    for segment in text.split('\n') {
        let chars: Vec<char> = segment
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        if chars.is_empty() {
            out.push(String::new());
            continue;
        }
        for chunk in chars.chunks(width) {
            out.push(chunk.iter().collect());
        }
    }
    out
}
