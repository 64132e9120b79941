//! PNG snapshot of the report.
//!
//! Uses the same page layout as the PDF renderer, drawn with an 8x8 bitmap
//! font at one pixel per point. Pages are stacked top to bottom in a single
//! image, separated by a grey band.

use font8x8::{BASIC_FONTS, LATIN_FONTS, UnicodeFonts};
use tabreport_core::{Dataset, FormatOptions, ReportError, Result};

use crate::layout::{self, Line, PageGeometry};

/// Upper bound on stacked pages; larger reports should use PDF.
pub const MAX_PNG_PAGES: usize = 40;

const GLYPH: usize = 8;
const LINE_HEIGHT: usize = 10;
const MARGIN: usize = 24;
const PAGE_GAP: usize = 8;
const INK: [u8; 3] = [0x20, 0x20, 0x20];
const PAPER: [u8; 3] = [0xFF, 0xFF, 0xFF];
const GAP: [u8; 3] = [0xC8, 0xC8, 0xC8];

pub fn geometry(width: usize, height: usize) -> PageGeometry {
    PageGeometry {
        chars_per_line: (width.saturating_sub(2 * MARGIN) / GLYPH).max(1),
        lines_per_page: (height.saturating_sub(2 * MARGIN) / LINE_HEIGHT).max(1),
    }
}

pub fn render_png(dataset: &Dataset, options: &FormatOptions) -> Result<Vec<u8>> {
    let (w, h) = options.page_points();
    let (page_w, page_h) = (w.round() as usize, h.round() as usize);
    let pages = layout::layout(dataset, options, geometry(page_w, page_h));
    layout::ensure_drawable(&pages, "PNG")?;
    if pages.len() > MAX_PNG_PAGES {
        return Err(ReportError::Render(format!(
            "report needs {} pages, PNG output is limited to {MAX_PNG_PAGES}; use pdf instead",
            pages.len()
        )));
    }

    let height = pages.len() * page_h + (pages.len() - 1) * PAGE_GAP;
    let mut canvas = Canvas::new(page_w, height);
    for (i, page) in pages.iter().enumerate() {
        let top = i * (page_h + PAGE_GAP);
        if i > 0 {
            canvas.fill_rows(top - PAGE_GAP, PAGE_GAP, GAP);
        }
        draw_page(&mut canvas, page, top);
    }
    canvas.encode()
}

fn draw_page(canvas: &mut Canvas, lines: &[Line], top: usize) {
    for (li, line) in lines.iter().enumerate() {
        let y = top + MARGIN + li * LINE_HEIGHT;
        for (ci, c) in line.text.chars().enumerate() {
            let x = MARGIN + ci * GLYPH;
            canvas.glyph(x, y, c, line.bold);
        }
    }
}

struct Canvas {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Canvas {
    fn new(width: usize, height: usize) -> Self {
        let mut pixels = Vec::with_capacity(width * height * 3);
        for _ in 0..width * height {
            pixels.extend_from_slice(&PAPER);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    fn set(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        if x < self.width && y < self.height {
            let at = (y * self.width + x) * 3;
            self.pixels[at..at + 3].copy_from_slice(&rgb);
        }
    }

    fn fill_rows(&mut self, y: usize, rows: usize, rgb: [u8; 3]) {
        for row in y..(y + rows).min(self.height) {
            for x in 0..self.width {
                self.set(x, row, rgb);
            }
        }
    }

    fn glyph(&mut self, x: usize, y: usize, c: char, bold: bool) {
        let Some(bitmap) = BASIC_FONTS
            .get(c)
            .or_else(|| LATIN_FONTS.get(c))
            .or_else(|| BASIC_FONTS.get('?'))
        else {
            return;
        };
        for (dy, bits) in bitmap.iter().enumerate() {
            for dx in 0..GLYPH {
                if bits & (1 << dx) != 0 {
                    self.set(x + dx, y + dy, INK);
                    if bold {
                        self.set(x + dx + 1, y + dy, INK);
                    }
                }
            }
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let err = |e: png::EncodingError| ReportError::Render(format!("PNG encode failed: {e}"));
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, self.width as u32, self.height as u32);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().map_err(err)?;
            writer.write_image_data(&self.pixels).map_err(err)?;
            writer.finish().map_err(err)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabreport_core::{Cell, Orientation, PaperSize};

    fn decode(bytes: &[u8]) -> (u32, u32) {
        let decoder = png::Decoder::new(bytes);
        let reader = decoder.read_info().unwrap();
        let info = reader.info();
        (info.width, info.height)
    }

    fn numbers(rows: i64) -> Dataset {
        let mut ds = Dataset::new("numbers", vec!["n".into()]);
        for i in 0..rows {
            ds.push_row(vec![Cell::Int(i)]);
        }
        ds
    }

    #[test]
    fn test_single_page_dimensions() {
        let bytes = render_png(&numbers(5), &FormatOptions::default()).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(decode(&bytes), (612, 792));
    }

    #[test]
    fn test_landscape_and_stacked_pages() {
        let opts = FormatOptions {
            paper_size: PaperSize::A4,
            orientation: Orientation::Landscape,
            ..Default::default()
        };
        let (w, h) = decode(&render_png(&numbers(120), &opts).unwrap());
        assert_eq!(w, 842);
        // More than one A4 landscape page, stacked with a gap.
        assert!(h > 595);
        assert_eq!((h as usize + PAGE_GAP) % (595 + PAGE_GAP), 0);
    }

    #[test]
    fn test_too_many_pages() {
        let err = render_png(&numbers(5000), &FormatOptions::default()).unwrap_err();
        assert!(matches!(err, ReportError::Render(_)));
    }

    #[test]
    fn test_text_outside_latin1_is_refused() {
        let mut ds = numbers(2);
        ds.push_row(vec![Cell::Text("Ωmega".into())]);
        let err = render_png(&ds, &FormatOptions::default()).unwrap_err();
        assert!(err.to_string().contains("U+03A9"));
    }

    #[test]
    fn test_png_is_deterministic() {
        let ds = numbers(30);
        let opts = FormatOptions::default();
        assert_eq!(render_png(&ds, &opts).unwrap(), render_png(&ds, &opts).unwrap());
    }
}
