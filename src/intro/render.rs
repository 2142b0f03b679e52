use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fontdue::layout::{
    CoordinateSystem, GlyphRasterConfig, HorizontalAlign, Layout, LayoutSettings, TextStyle,
    VerticalAlign, WrapStyle,
};
use fontdue::{Font, FontSettings};
use image::RgbaImage;

use super::layout::{element_alpha, IntroLayout, Rect, TextMeasure};
use crate::error_codes::{CodedError, MISSING_INPUT};

const FALLBACK_FONTS: [&str; 7] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\segoeui.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// The configured font, or the first common system font that exists.
pub fn resolve_font_path(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if !path.is_file() {
            return Err(anyhow!(CodedError::usage(
                MISSING_INPUT,
                format!("intro font not found: {}", path.display()),
            )));
        }
        return Ok(path.to_path_buf());
    }
    FALLBACK_FONTS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| {
            anyhow!(CodedError::usage(
                MISSING_INPUT,
                "no system font found; set intro.font_path in clipbatch.yaml",
            ))
        })
}

struct GlyphBitmap {
    width: usize,
    height: usize,
    bitmap: Vec<u8>,
}

pub struct TextPainter {
    font: Font,
    glyph_cache: HashMap<GlyphRasterConfig, GlyphBitmap>,
}

impl TextPainter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
        let font = Font::from_bytes(bytes, FontSettings::default())
            .map_err(|error| anyhow!("failed to parse font {}: {error}", path.display()))?;
        Ok(Self {
            font,
            glyph_cache: HashMap::new(),
        })
    }

    /// Logs characters the font has no glyph for; they render as the font's notdef box.
    pub fn warn_missing_glyphs(&self, text: &str) {
        let missing = text
            .chars()
            .filter(|c| !c.is_whitespace() && self.font.lookup_glyph_index(*c) == 0)
            .collect::<String>();
        if !missing.is_empty() {
            tracing::warn!(%missing, "font has no glyphs for some characters");
        }
    }

    fn draw_line(
        &mut self,
        frame: &mut [u8],
        width: u32,
        height: u32,
        x: f32,
        y: f32,
        text: &str,
        size: f32,
        color: [u8; 4],
    ) {
        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&LayoutSettings {
            x,
            y,
            max_width: None,
            max_height: None,
            horizontal_align: HorizontalAlign::Left,
            vertical_align: VerticalAlign::Top,
            line_height: 1.0,
            wrap_style: WrapStyle::Word,
            wrap_hard_breaks: false,
        });
        layout.append(&[&self.font], &TextStyle::new(text, size, 0));

        for glyph in layout.glyphs() {
            if glyph.width == 0 || glyph.height == 0 {
                continue;
            }
            let font = &self.font;
            let glyph_bitmap = self.glyph_cache.entry(glyph.key).or_insert_with(|| {
                let (_, bitmap) = font.rasterize_config(glyph.key);
                GlyphBitmap {
                    width: glyph.width,
                    height: glyph.height,
                    bitmap,
                }
            });

            blend_glyph(
                frame,
                width,
                height,
                glyph.x.round() as i32,
                glyph.y.round() as i32,
                glyph_bitmap,
                color,
            );
        }
    }
}

impl TextMeasure for TextPainter {
    fn text_width(&self, text: &str, size: f32) -> f32 {
        let mut width = 0.0;
        let mut previous = None;
        for c in text.chars() {
            if let Some(kern) = previous.and_then(|prev| self.font.horizontal_kern(prev, c, size)) {
                width += kern;
            }
            width += self.font.metrics(c, size).advance_width;
            previous = Some(c);
        }
        width
    }

    fn line_height(&self, size: f32) -> f32 {
        self.font
            .horizontal_line_metrics(size)
            .map(|metrics| metrics.new_line_size)
            .unwrap_or(size * 1.2)
    }
}

/// Background and placeholder panel; identical for every frame.
pub fn base_frame(layout: &IntroLayout) -> Vec<u8> {
    let mut frame = vec![0_u8; layout.width as usize * layout.height as usize * 4];
    for pixel in frame.chunks_exact_mut(4) {
        pixel.copy_from_slice(&[
            layout.background[0],
            layout.background[1],
            layout.background[2],
            255,
        ]);
    }
    fill_rect(&mut frame, layout.width, layout.height, layout.panel, layout.panel_color);
    frame
}

pub fn render_frame(painter: &mut TextPainter, layout: &IntroLayout, base: &[u8], t: f64) -> Vec<u8> {
    let mut frame = base.to_vec();
    for element in &layout.elements {
        let alpha = element_alpha(element.start, layout.fade_secs, t);
        if alpha <= 0.0 {
            continue;
        }
        let color = [
            element.color[0],
            element.color[1],
            element.color[2],
            (f32::from(element.color[3]) * alpha).round() as u8,
        ];
        for (index, line) in element.lines.iter().enumerate() {
            painter.draw_line(
                &mut frame,
                layout.width,
                layout.height,
                element.x,
                element.y + index as f32 * element.line_height,
                line,
                element.size,
                color,
            );
        }
    }
    frame
}

pub fn save_png(path: &Path, width: u32, height: u32, rgba: Vec<u8>) -> Result<()> {
    let image = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
        anyhow!(
            "failed to construct image buffer for {}x{} RGBA frame",
            width,
            height
        )
    })?;
    image
        .save(path)
        .with_context(|| format!("failed to write png {}", path.display()))
}

fn fill_rect(frame: &mut [u8], width: u32, height: u32, rect: Rect, color: [u8; 4]) {
    let x0 = (rect.x.max(0.0) as u32).min(width);
    let y0 = (rect.y.max(0.0) as u32).min(height);
    let x1 = ((rect.x + rect.w).max(0.0).round() as u32).min(width);
    let y1 = ((rect.y + rect.h).max(0.0).round() as u32).min(height);

    for yy in y0..y1 {
        let row_start = (yy * width * 4) as usize;
        for xx in x0..x1 {
            let idx = row_start + (xx * 4) as usize;
            blend_pixel(frame, idx, color);
        }
    }
}

fn blend_glyph(
    frame: &mut [u8],
    frame_width: u32,
    frame_height: u32,
    x: i32,
    y: i32,
    glyph: &GlyphBitmap,
    color: [u8; 4],
) {
    for row in 0..glyph.height {
        let py = y + row as i32;
        if py < 0 || py >= frame_height as i32 {
            continue;
        }

        for col in 0..glyph.width {
            let px = x + col as i32;
            if px < 0 || px >= frame_width as i32 {
                continue;
            }

            let mask = glyph.bitmap[row * glyph.width + col];
            if mask == 0 {
                continue;
            }

            let alpha = ((u16::from(mask) * u16::from(color[3])) / 255) as u8;
            let idx = ((py as u32 * frame_width + px as u32) * 4) as usize;
            blend_pixel(frame, idx, [color[0], color[1], color[2], alpha]);
        }
    }
}

fn blend_pixel(frame: &mut [u8], idx: usize, src: [u8; 4]) {
    let alpha = u16::from(src[3]);
    if alpha == 0 {
        return;
    }

    let inv_alpha = 255_u16.saturating_sub(alpha);
    for channel in 0..3 {
        let dst = u16::from(frame[idx + channel]);
        let src_c = u16::from(src[channel]);
        frame[idx + channel] = ((src_c * alpha + dst * inv_alpha + 127) / 255) as u8;
    }
    frame[idx + 3] = 255;
}
