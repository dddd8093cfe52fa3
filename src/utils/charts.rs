//! Confusion-matrix heatmap rendering
//!
//! Produces an annotated SVG heatmap (blue scale, counts in each cell) and a
//! matching raster image for sinks that only accept bitmaps. The raster
//! carries the same title, counts and axis labels, drawn with a small
//! built-in bitmap font.

use std::path::Path;

use image::{Rgb, RgbImage};

use super::error::Result;
use super::metrics::ConfusionMatrix2x2;

/// Chart styling constants
const CELL_SIZE: f64 = 160.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_BOTTOM: f64 = 70.0;
const MARGIN_LEFT: f64 = 80.0;

const COLOR_TEXT: &str = "#2c3e50";
const COLOR_BORDER: &str = "#ffffff";

/// Lightest and darkest stops of the blue scale
const BLUES_LOW: [u8; 3] = [0xf7, 0xfb, 0xff];
const BLUES_HIGH: [u8; 3] = [0x08, 0x30, 0x6b];

/// Raster layout, in pixels
const RASTER_CELL: u32 = 64;
const RASTER_TOP: u32 = 28;
const RASTER_LEFT: u32 = 28;
const RASTER_RIGHT: u32 = 8;
const RASTER_BOTTOM: u32 = 40;

/// Glyphs are 3x5 cells, drawn at this many pixels per cell
const GLYPH_SCALE: u32 = 2;
const RASTER_TEXT: [u8; 3] = [0x2c, 0x3e, 0x50];
const RASTER_WHITE: [u8; 3] = [0xff, 0xff, 0xff];

/// A rendered figure, kept only until the sink has consumed it
#[derive(Debug, Clone)]
pub struct Figure {
    pub title: String,
    pub svg: String,
    pub raster: RgbImage,
}

impl Figure {
    /// Write `<stem>.svg` and `<stem>.png` into `dir`
    pub fn save(&self, dir: &Path, stem: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(format!("{}.svg", stem)), &self.svg)?;
        self.raster.save(dir.join(format!("{}.png", stem)))?;
        Ok(())
    }
}

/// Render the confusion matrix as an annotated heatmap.
///
/// Rows are the true label, columns the predicted label.
pub fn render_confusion_heatmap(cm: &ConfusionMatrix2x2, title: &str) -> Figure {
    let width = MARGIN_LEFT + 2.0 * CELL_SIZE + MARGIN_RIGHT;
    let height = MARGIN_TOP + 2.0 * CELL_SIZE + MARGIN_BOTTOM;
    let max = cm.max();

    let mut svg = String::new();

    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        width, height, width, height
    ));
    svg.push_str(&format!(
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        width, height
    ));

    // Title
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        MARGIN_LEFT + CELL_SIZE, COLOR_TEXT, escape_xml(title)
    ));

    for (row, col, count) in cm.iter() {
        let x = MARGIN_LEFT + col as f64 * CELL_SIZE;
        let y = MARGIN_TOP + row as f64 * CELL_SIZE;
        let fill = blues(count, max);
        let text_color = if is_dark(fill) { "#ffffff" } else { COLOR_TEXT };

        svg.push_str(&format!(
            r#"<rect x="{}" y="{}" width="{}" height="{}" fill="{}" stroke="{}" stroke-width="2"/>"#,
            x, y, CELL_SIZE, CELL_SIZE, hex(fill), COLOR_BORDER
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" dominant-baseline="middle" font-family="Arial, sans-serif" font-size="22" fill="{}">{}</text>"#,
            x + CELL_SIZE / 2.0, y + CELL_SIZE / 2.0, text_color, count
        ));
    }

    // Tick labels
    for i in 0..2 {
        let centre = i as f64 * CELL_SIZE + CELL_SIZE / 2.0;
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            MARGIN_LEFT + centre, MARGIN_TOP + 2.0 * CELL_SIZE + 18.0, COLOR_TEXT, i
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            MARGIN_LEFT - 8.0, MARGIN_TOP + centre + 4.0, COLOR_TEXT, i
        ));
    }

    // Axis labels
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Predicted</text>"#,
        MARGIN_LEFT + CELL_SIZE, height - 20.0, COLOR_TEXT
    ));
    svg.push_str(&format!(
        r#"<text x="25" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 25 {})">True</text>"#,
        MARGIN_TOP + CELL_SIZE, COLOR_TEXT, MARGIN_TOP + CELL_SIZE
    ));

    svg.push_str("</svg>");

    Figure {
        title: title.to_string(),
        svg,
        raster: render_raster(cm, title),
    }
}

/// Bitmap version of the heatmap, cells offset by the raster margins
fn render_raster(cm: &ConfusionMatrix2x2, title: &str) -> RgbImage {
    let width = RASTER_LEFT + 2 * RASTER_CELL + RASTER_RIGHT;
    let height = RASTER_TOP + 2 * RASTER_CELL + RASTER_BOTTOM;
    let max = cm.max();
    let mut raster = RgbImage::from_pixel(width, height, Rgb(RASTER_WHITE));

    for (row, col, count) in cm.iter() {
        let x0 = RASTER_LEFT + col as u32 * RASTER_CELL;
        let y0 = RASTER_TOP + row as u32 * RASTER_CELL;
        let fill = blues(count, max);
        for y in y0..y0 + RASTER_CELL {
            for x in x0..x0 + RASTER_CELL {
                raster.put_pixel(x, y, Rgb(fill));
            }
        }

        let text = count.to_string();
        let color = if is_dark(fill) { RASTER_WHITE } else { RASTER_TEXT };
        let scale = if text_width(&text, GLYPH_SCALE) <= RASTER_CELL - 4 { GLYPH_SCALE } else { 1 };
        let x = x0 + (RASTER_CELL.saturating_sub(text_width(&text, scale))) / 2;
        let y = y0 + (RASTER_CELL - 5 * scale) / 2;
        draw_text(&mut raster, &text, x, y, scale, color);
    }

    let centered = |text: &str, scale: u32| {
        (width.saturating_sub(text_width(text, scale))) / 2
    };
    draw_text(&mut raster, title, centered(title, GLYPH_SCALE), 8, GLYPH_SCALE, RASTER_TEXT);

    // Tick labels
    for i in 0..2u32 {
        let label = i.to_string();
        let centre = RASTER_LEFT + i * RASTER_CELL + RASTER_CELL / 2;
        let bottom = RASTER_TOP + 2 * RASTER_CELL + 4;
        draw_text(&mut raster, &label, centre - GLYPH_SCALE, bottom, GLYPH_SCALE, RASTER_TEXT);
        let middle = RASTER_TOP + i * RASTER_CELL + RASTER_CELL / 2 - 5 * GLYPH_SCALE / 2;
        draw_text(&mut raster, &label, RASTER_LEFT - 10, middle, GLYPH_SCALE, RASTER_TEXT);
    }

    // Axis labels: "Predicted" below, "True" stacked down the left edge
    let predicted_x = RASTER_LEFT + RASTER_CELL - text_width("Predicted", GLYPH_SCALE) / 2;
    draw_text(&mut raster, "Predicted", predicted_x, height - 14, GLYPH_SCALE, RASTER_TEXT);
    let true_y = RASTER_TOP + RASTER_CELL - (4 * 6 * GLYPH_SCALE) / 2;
    for (i, ch) in "True".chars().enumerate() {
        draw_glyph(&mut raster, ch, 4, true_y + i as u32 * 6 * GLYPH_SCALE, GLYPH_SCALE, RASTER_TEXT);
    }

    raster
}

fn text_width(text: &str, scale: u32) -> u32 {
    let chars = text.chars().count() as u32;
    (chars * 4 * scale).saturating_sub(scale)
}

fn draw_text(raster: &mut RgbImage, text: &str, x: u32, y: u32, scale: u32, color: [u8; 3]) {
    for (i, ch) in text.chars().enumerate() {
        draw_glyph(raster, ch, x + i as u32 * 4 * scale, y, scale, color);
    }
}

/// Draw one glyph; pixels outside the image are skipped
fn draw_glyph(raster: &mut RgbImage, ch: char, x: u32, y: u32, scale: u32, color: [u8; 3]) {
    let Some(rows) = glyph(ch) else {
        return;
    };
    for (dy, bits) in rows.iter().enumerate() {
        for dx in 0..3u32 {
            if bits & (0b100 >> dx) == 0 {
                continue;
            }
            for sy in 0..scale {
                for sx in 0..scale {
                    let px = x + dx * scale + sx;
                    let py = y + dy as u32 * scale + sy;
                    if px < raster.width() && py < raster.height() {
                        raster.put_pixel(px, py, Rgb(color));
                    }
                }
            }
        }
    }
}

/// 3x5 bitmap of an ASCII letter or digit, top row first. Lowercase letters
/// use the uppercase shape; anything else is blank.
fn glyph(ch: char) -> Option<[u8; 5]> {
    let rows = match ch.to_ascii_uppercase() {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b110, 0b001, 0b010, 0b100, 0b111],
        '3' => [0b110, 0b001, 0b010, 0b001, 0b110],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b110, 0b001, 0b110],
        '6' => [0b011, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b110],
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        _ => return None,
    };
    Some(rows)
}

/// Linear blend between the light and dark ends of the blue scale
fn blues(value: u64, max: u64) -> [u8; 3] {
    let t = if max > 0 { value as f64 / max as f64 } else { 0.0 };
    let mut out = [0u8; 3];
    for (i, channel) in out.iter_mut().enumerate() {
        let low = BLUES_LOW[i] as f64;
        let high = BLUES_HIGH[i] as f64;
        *channel = (low + (high - low) * t).round() as u8;
    }
    out
}

fn is_dark(rgb: [u8; 3]) -> bool {
    let luma = 0.299 * rgb[0] as f64 + 0.587 * rgb[1] as f64 + 0.114 * rgb[2] as f64;
    luma < 128.0
}

fn hex(rgb: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2])
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
