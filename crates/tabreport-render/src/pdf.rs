//! Minimal PDF 1.4 writer.
//!
//! Emits the laid-out pages with the standard Courier fonts, so no font
//! embedding is needed and every character cell has the same width.

use std::fmt::Write as _;

use tabreport_core::{Dataset, FormatOptions, Result};

use crate::layout::{self, Line, PageGeometry};

const FONT_SIZE: f32 = 8.0;
const LEADING: f32 = 10.0;
const MARGIN: f32 = 36.0;
/// Courier advance width at `FONT_SIZE` (600/1000 em).
const CHAR_WIDTH: f32 = FONT_SIZE * 0.6;
const FOOTER_LINES: usize = 2;

/// Text capacity of a page at the given size in points.
pub fn geometry(page_width: f32, page_height: f32) -> PageGeometry {
    let chars = ((page_width - 2.0 * MARGIN) / CHAR_WIDTH).floor().max(1.0) as usize;
    let lines = ((page_height - 2.0 * MARGIN) / LEADING).floor().max(1.0) as usize;
    PageGeometry {
        chars_per_line: chars,
        lines_per_page: lines.saturating_sub(FOOTER_LINES).max(1),
    }
}

pub fn render_pdf(dataset: &Dataset, options: &FormatOptions) -> Result<Vec<u8>> {
    let (width, height) = options.page_points();
    let pages = layout::layout(dataset, options, geometry(width, height));
    layout::ensure_drawable(&pages, "PDF")?;
    let page_count = pages.len();

    let mut doc = PdfWriter::new();
    let page_ids: Vec<usize> = (0..page_count).map(|i| 5 + 2 * i).collect();

    doc.object(1, "<< /Type /Catalog /Pages 2 0 R >>");
    let kids = page_ids
        .iter()
        .map(|id| format!("{id} 0 R"))
        .collect::<Vec<_>>()
        .join(" ");
    doc.object(
        2,
        &format!("<< /Type /Pages /Kids [{kids}] /Count {page_count} >>"),
    );
    doc.object(
        3,
        "<< /Type /Font /Subtype /Type1 /BaseFont /Courier /Encoding /WinAnsiEncoding >>",
    );
    doc.object(
        4,
        "<< /Type /Font /Subtype /Type1 /BaseFont /Courier-Bold /Encoding /WinAnsiEncoding >>",
    );

    for (i, lines) in pages.iter().enumerate() {
        let page_id = page_ids[i];
        let content_id = page_id + 1;
        doc.object(
            page_id,
            &format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
                 /Resources << /Font << /F1 3 0 R /F2 4 0 R >> >> /Contents {content_id} 0 R >>",
                number(width),
                number(height)
            ),
        );
        let content = page_content(lines, i + 1, page_count, height);
        doc.stream(content_id, content.as_bytes());
    }

    Ok(doc.finish(1))
}

fn page_content(lines: &[Line], page_no: usize, page_count: usize, height: f32) -> String {
    let mut out = String::new();
    let top = height - MARGIN - FONT_SIZE;
    for (i, line) in lines.iter().enumerate() {
        if line.text.is_empty() {
            continue;
        }
        let font = if line.bold { "F2" } else { "F1" };
        let y = top - i as f32 * LEADING;
        let _ = writeln!(
            out,
            "BT /{font} {} Tf {} {} Td ({}) Tj ET",
            number(FONT_SIZE),
            number(MARGIN),
            number(y),
            escape(&line.text)
        );
    }
    let _ = writeln!(
        out,
        "BT /F1 {} Tf {} {} Td (Page {page_no} of {page_count}) Tj ET",
        number(FONT_SIZE),
        number(MARGIN),
        number(MARGIN - FONT_SIZE)
    );
    out
}

/// Escape a string literal and map it onto WinAnsi bytes written as octal.
/// Callers check [`layout::ensure_drawable`] first.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            '\u{A0}'..='\u{FF}' => {
                let _ = write!(out, "\\{:03o}", c as u32);
            }
            _ => out.push('?'),
        }
    }
    out
}

/// Format a coordinate without trailing zeros.
fn number(v: f32) -> String {
    let s = format!("{v:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

struct PdfWriter {
    buf: Vec<u8>,
    offsets: Vec<(usize, usize)>,
}

impl PdfWriter {
    fn new() -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");
        Self {
            buf,
            offsets: Vec::new(),
        }
    }

    fn object(&mut self, id: usize, body: &str) {
        self.offsets.push((id, self.buf.len()));
        self.buf
            .extend_from_slice(format!("{id} 0 obj\n{body}\nendobj\n").as_bytes());
    }

    fn stream(&mut self, id: usize, data: &[u8]) {
        self.offsets.push((id, self.buf.len()));
        self.buf.extend_from_slice(
            format!("{id} 0 obj\n<< /Length {} >>\nstream\n", data.len()).as_bytes(),
        );
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\nendstream\nendobj\n");
    }

    fn finish(mut self, root: usize) -> Vec<u8> {
        self.offsets.sort_by_key(|(id, _)| *id);
        let size = self.offsets.last().map(|(id, _)| id + 1).unwrap_or(1);
        let xref_at = self.buf.len();

        let mut xref = format!("xref\n0 {size}\n0000000000 65535 f \n");
        let mut next = 1;
        for &(id, offset) in &self.offsets {
            // Ids are dense, but keep the table valid if one is ever skipped.
            while next < id {
                xref.push_str("0000000000 65535 f \n");
                next += 1;
            }
            let _ = write!(xref, "{offset:010} 00000 n \n");
            next = id + 1;
        }
        let _ = write!(
            xref,
            "trailer\n<< /Size {size} /Root {root} 0 R >>\nstartxref\n{xref_at}\n%%EOF\n"
        );
        self.buf.extend_from_slice(xref.as_bytes());
        self.buf
    }
}
