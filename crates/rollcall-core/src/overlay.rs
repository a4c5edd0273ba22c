//! Live-feed annotation: a box and a `name (confidence%)` caption per face.

use crate::types::{confidence_percent, BoundingBox, Recognition};
use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::sync::OnceLock;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const LINE_WIDTH: i32 = 2;
const CAPTION_SCALE: f32 = 16.0;
const CAPTION_PAD: u32 = 2;

static FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

fn caption_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_BYTES) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "overlay font unusable; drawing boxes only");
            None
        }
    })
    .as_ref()
}

/// Copy of `frame` with each recognition outlined and captioned, green when
/// known, red otherwise.
pub fn annotate(frame: &RgbImage, recognitions: &[Recognition]) -> RgbImage {
    let mut out = frame.clone();
    for rec in recognitions {
        let Some(edges) = visible_edges(&rec.bbox, out.width(), out.height()) else {
            continue;
        };
        let color = if rec.identity.is_known() {
            KNOWN_COLOR
        } else {
            UNKNOWN_COLOR
        };
        draw_box(&mut out, edges, color);
        if let Some(font) = caption_font() {
            let text = format!("{} ({:.2}%)", rec.identity, confidence_percent(rec.confidence));
            draw_caption(&mut out, font, &text, edges, color);
        }
    }
    out
}

/// Inclusive pixel edges of a box.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Edges {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

/// Edges clamped to the image, or `None` when the box does not intersect it.
fn visible_edges(bbox: &BoundingBox, width: u32, height: u32) -> Option<Edges> {
    let (x1, y1) = (bbox.x, bbox.y);
    let (x2, y2) = (bbox.x + bbox.width, bbox.y + bbox.height);
    if width == 0
        || height == 0
        || x2 < x1
        || y2 < y1
        || x2 < 0.0
        || y2 < 0.0
        || x1 >= width as f32
        || y1 >= height as f32
    {
        return None;
    }
    let clamp_x = |v: f32| (v.round() as i32).clamp(0, width as i32 - 1);
    let clamp_y = |v: f32| (v.round() as i32).clamp(0, height as i32 - 1);
    Some(Edges {
        left: clamp_x(x1),
        top: clamp_y(y1),
        right: clamp_x(x2),
        bottom: clamp_y(y2),
    })
}

fn draw_box(img: &mut RgbImage, edges: Edges, color: Rgb<u8>) {
    for inset in 0..LINE_WIDTH {
        let (left, top) = (edges.left + inset, edges.top + inset);
        let (right, bottom) = (edges.right - inset, edges.bottom - inset);
        if right < left || bottom < top {
            break;
        }
        let rect = Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
        draw_hollow_rect_mut(img, rect, color);
    }
}

/// Filled caption strip under the box, or above it when the frame ends first.
fn draw_caption(img: &mut RgbImage, font: &FontRef<'_>, text: &str, edges: Edges, color: Rgb<u8>) {
    let scale = PxScale::from(CAPTION_SCALE);
    let (text_w, text_h) = text_size(scale, font, text);
    let strip_w = text_w + 2 * CAPTION_PAD;
    let strip_h = (text_h + 2 * CAPTION_PAD).max(1);

    let below = edges.bottom + 1;
    let y = if below + strip_h as i32 <= img.height() as i32 {
        below
    } else {
        (edges.top - strip_h as i32).max(0)
    };

    draw_filled_rect_mut(img, Rect::at(edges.left, y).of_size(strip_w.max(1), strip_h), color);
    draw_text_mut(
        img,
        TEXT_COLOR,
        edges.left + CAPTION_PAD as i32,
        y + CAPTION_PAD as i32,
        scale,
        font,
        text,
    );
}
