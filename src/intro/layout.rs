use anyhow::{bail, Result};

use crate::config::{parse_hex_color, IntroConfig};

/// Font metrics needed by layout. Kept separate from rasterizing so layout can be
/// tested without a font file.
pub trait TextMeasure {
    fn text_width(&self, text: &str, size: f32) -> f32;
    fn line_height(&self, size: f32) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// One block of text that fades in as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TextElement {
    pub lines: Vec<String>,
    pub size: f32,
    pub line_height: f32,
    pub color: [u8; 4],
    pub x: f32,
    pub y: f32,
    pub start: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntroLayout {
    pub width: u32,
    pub height: u32,
    pub background: [u8; 4],
    pub panel_color: [u8; 4],
    pub panel: Rect,
    pub column: Rect,
    pub elements: Vec<TextElement>,
    pub fade_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChapterLine {
    Timed { label: String, time: String },
    Plain(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntroContent {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub chapters: Vec<ChapterLine>,
}

impl IntroContent {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.subtitle.is_none() && self.chapters.is_empty()
    }
}

/// Greedy word wrap. A single word wider than `max_width` keeps its own line.
pub fn wrap_text(measure: &dyn TextMeasure, text: &str, size: f32, max_width: f32) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            if current.is_empty() {
                current.push_str(word);
                continue;
            }
            let candidate = format!("{current} {word}");
            if measure.text_width(&candidate, size) <= max_width {
                current = candidate;
            } else {
                lines.push(std::mem::take(&mut current));
                current.push_str(word);
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }
    lines
}

fn fits(measure: &dyn TextMeasure, text: &str, size: f32, max_width: f32, max_height: f32) -> bool {
    let lines = wrap_text(measure, text, size, max_width);
    let too_wide = lines
        .iter()
        .any(|line| measure.text_width(line, size) > max_width);
    !too_wide && lines.len() as f32 * measure.line_height(size) <= max_height
}

/// Largest whole font size in `[min_size, max_size]` whose wrapped text fits the box.
/// Falls back to `min_size` when nothing fits.
pub fn fit_font_size(
    measure: &dyn TextMeasure,
    text: &str,
    min_size: f32,
    max_size: f32,
    max_width: f32,
    max_height: f32,
) -> f32 {
    let mut low = min_size.ceil() as i32;
    let mut high = max_size.floor() as i32;
    let mut best = min_size;
    while low <= high {
        let mid = low + (high - low) / 2;
        if fits(measure, text, mid as f32, max_width, max_height) {
            best = mid as f32;
            low = mid + 1;
        } else {
            high = mid - 1;
        }
    }
    best
}

/// `label ........ 1:05`, filling the gap with dots so the time ends at `max_width`.
/// The label is shortened with `...` when fewer than three dots would fit.
pub fn dot_fill(
    measure: &dyn TextMeasure,
    label: &str,
    time: &str,
    size: f32,
    max_width: f32,
) -> String {
    const MIN_DOTS: usize = 3;
    let dot_width = measure.text_width(".", size).max(0.01);
    let time_part = format!(" {time}");

    let mut label_chars = label.trim().chars().collect::<Vec<_>>();
    let mut truncated = false;
    loop {
        let shown = shown_label(&label_chars, truncated);
        let fixed = measure.text_width(&format!("{shown} "), size)
            + measure.text_width(&time_part, size);
        let dots = ((max_width - fixed) / dot_width).floor();
        if dots >= MIN_DOTS as f32 || label_chars.is_empty() {
            let dots = dots.max(MIN_DOTS as f32) as usize;
            let prefix = if shown.is_empty() {
                String::new()
            } else {
                format!("{shown} ")
            };
            return format!("{prefix}{}{time_part}", ".".repeat(dots));
        }
        label_chars.pop();
        while label_chars.last().is_some_and(|c| c.is_whitespace()) {
            label_chars.pop();
        }
        truncated = true;
    }
}

fn shown_label(chars: &[char], truncated: bool) -> String {
    let base = chars.iter().collect::<String>();
    if truncated && !base.is_empty() {
        format!("{base}...")
    } else {
        base
    }
}

/// Fade-in opacity of an element at time `t`.
pub fn element_alpha(start: f64, fade_secs: f64, t: f64) -> f32 {
    if t < start {
        return 0.0;
    }
    if fade_secs <= 0.0 {
        return 1.0;
    }
    ((t - start) / fade_secs).clamp(0.0, 1.0) as f32
}

/// Stacks elements top to bottom; element `i` starts fading in at `i * stagger_secs`.
struct ElementStack {
    elements: Vec<TextElement>,
    cursor: f32,
    x: f32,
    stagger_secs: f64,
}

impl ElementStack {
    fn push(&mut self, lines: Vec<String>, size: f32, line_height: f32, color: [u8; 4]) {
        let start = self.elements.len() as f64 * self.stagger_secs;
        let block_height = lines.len() as f32 * line_height;
        self.elements.push(TextElement {
            lines,
            size,
            line_height,
            color,
            x: self.x,
            y: self.cursor,
            start,
        });
        self.cursor += block_height;
    }
}

pub fn compute_layout(
    measure: &dyn TextMeasure,
    config: &IntroConfig,
    content: &IntroContent,
) -> Result<IntroLayout> {
    let width = config.width as f32;
    let height = config.height as f32;
    let panel_width = width * config.image_width_percentage / 100.0;
    let panel = Rect {
        x: width - panel_width,
        y: 0.0,
        w: panel_width,
        h: height,
    };
    let inset = config.margin + config.padding;
    let column = Rect {
        x: inset,
        y: inset,
        w: width - panel_width - config.margin - 2.0 * config.padding,
        h: height - 2.0 * inset,
    };
    if column.w <= 0.0 || column.h <= 0.0 {
        bail!(
            "intro text column has no room ({}x{}); reduce margin, padding or image_width_percentage",
            column.w,
            column.h
        );
    }

    let mut stack = ElementStack {
        elements: Vec::new(),
        cursor: column.y,
        x: column.x,
        stagger_secs: config.stagger_secs,
    };

    for (text, style) in [
        (content.title.as_deref(), &config.title),
        (content.subtitle.as_deref(), &config.subtitle),
    ] {
        let Some(text) = text.map(str::trim).filter(|text| !text.is_empty()) else {
            continue;
        };
        let box_height = style.box_height.min(column.h);
        let size = fit_font_size(measure, text, style.min_size, style.max_size, column.w, box_height);
        let lines = wrap_text(measure, text, size, column.w);
        stack.push(
            lines,
            size,
            measure.line_height(size),
            parse_hex_color(&style.color)?,
        );
        stack.cursor += config.element_gap;
    }

    let style = &config.timestamps;
    let color = parse_hex_color(&style.color)?;
    let line_height = measure.line_height(style.size) * style.line_spacing;
    for chapter in &content.chapters {
        let line = match chapter {
            ChapterLine::Timed { label, time } => {
                dot_fill(measure, label, time, style.size, column.w)
            }
            ChapterLine::Plain(text) => text.clone(),
        };
        stack.push(vec![line], style.size, line_height, color);
    }

    if stack.cursor > column.y + column.h {
        tracing::warn!(
            overflow = stack.cursor - (column.y + column.h),
            "intro text runs past the bottom margin"
        );
    }

    Ok(IntroLayout {
        width: config.width,
        height: config.height,
        background: parse_hex_color(&config.background)?,
        panel_color: parse_hex_color(&config.panel)?,
        panel,
        column,
        elements: stack.elements,
        fade_secs: config.fade_secs,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        compute_layout, dot_fill, element_alpha, fit_font_size, wrap_text, ChapterLine,
        IntroContent, TextMeasure,
    };
    use crate::config::IntroConfig;

    /// Every character is `0.5 * size` wide; lines are `1.2 * size` tall.
    pub(crate) struct Monospace;

    impl TextMeasure for Monospace {
        fn text_width(&self, text: &str, size: f32) -> f32 {
            text.chars().count() as f32 * size * 0.5
        }

        fn line_height(&self, size: f32) -> f32 {
            size * 1.2
        }
    }

    #[test]
    fn wraps_on_word_boundaries() {
        let lines = wrap_text(&Monospace, "alpha beta gamma delta", 10.0, 50.0);
        assert_eq!(lines, ["alpha beta", "gamma", "delta"]);
    }

    #[test]
    fn fit_finds_largest_size_that_fits_box() {
        // "Hello" at size s is 2.5s wide and 1.2s tall.
        let size = fit_font_size(&Monospace, "Hello", 10.0, 200.0, 250.0, 1000.0);
        assert_eq!(size, 100.0);

        // Height bound: two lines at size s need 2.4s.
        let size = fit_font_size(&Monospace, "Hello world", 10.0, 200.0, 250.0, 120.0);
        assert_eq!(size, 50.0);
    }

    #[test]
    fn fit_falls_back_to_min_size() {
        let size = fit_font_size(&Monospace, "unbreakablewordthatneverfits", 20.0, 80.0, 50.0, 50.0);
        assert_eq!(size, 20.0);
    }

    #[test]
    fn dot_fill_right_aligns_time() {
        // 30 columns at size 2 (1 unit per char).
        let line = dot_fill(&Monospace, "Intro", "0:08", 2.0, 30.0);
        assert_eq!(line, format!("Intro {} 0:08", ".".repeat(19)));
        assert_eq!(line.chars().count(), 30);
    }

    #[test]
    fn dot_fill_truncates_long_labels() {
        let line = dot_fill(&Monospace, "A very long chapter label", "12:34", 2.0, 20.0);
        assert_eq!(line, "A very... .... 12:34");
    }

    #[test]
    fn alpha_ramps_after_start() {
        assert_eq!(element_alpha(1.0, 0.5, 0.9), 0.0);
        assert_eq!(element_alpha(1.0, 0.5, 1.25), 0.5);
        assert_eq!(element_alpha(1.0, 0.5, 3.0), 1.0);
        assert_eq!(element_alpha(1.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn layout_staggers_elements_and_respects_panel() {
        let config = IntroConfig::default();
        let content = IntroContent {
            title: Some("Forklift Safety".to_owned()),
            subtitle: Some("Module 3".to_owned()),
            chapters: vec![
                ChapterLine::Timed {
                    label: "Pre-shift checks".to_owned(),
                    time: "0:08".to_owned(),
                },
                ChapterLine::Plain("Questions".to_owned()),
            ],
        };
        let layout = compute_layout(&Monospace, &config, &content).expect("layout should fit");

        assert_eq!(layout.panel.w, 672.0);
        assert_eq!(layout.panel.x + layout.panel.w, 1920.0);
        assert_eq!(layout.column.x, 90.0);
        assert_eq!(layout.column.w, 1920.0 - 672.0 - 40.0 - 100.0);
        assert_eq!(layout.elements.len(), 4);
        let starts = layout
            .elements
            .iter()
            .map(|element| element.start)
            .collect::<Vec<_>>();
        assert_eq!(starts, [0.0, 0.5, 1.0, 1.5]);
        assert!(layout.elements.windows(2).all(|pair| pair[0].y < pair[1].y));
        assert!(layout.elements[0].size >= layout.elements[1].size);
        assert!(layout.elements[2].lines[0].ends_with(" 0:08"));
        assert_eq!(layout.elements[3].lines, ["Questions"]);
    }

    #[test]
    fn layout_rejects_column_without_room() {
        let config = IntroConfig {
            margin: 600.0,
            padding: 200.0,
            ..IntroConfig::default()
        };
        assert!(compute_layout(&Monospace, &config, &IntroContent::default()).is_err());
    }
}
