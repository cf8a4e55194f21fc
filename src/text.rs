//! Text Fitter - Labels Along the Token Rim
//!
//! Produces glyph placements, not pixels. Coordinates are in pixels relative
//! to the token center, x to the right and y down. Each placement anchors the
//! glyph at the middle of its baseline.

use ab_glyph::{point, Font, FontArc, PxScale, ScaleFont};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use thiserror::Error;

/// Coverage bitmap for one glyph, positioned relative to the glyph origin
/// (left end of the baseline).
#[derive(Debug, Clone)]
pub struct GlyphMask {
    pub width: u32,
    pub height: u32,
    pub left: f32,
    pub top: f32,
    pub coverage: Vec<f32>,
}

impl GlyphMask {
    pub fn at(&self, x: u32, y: u32) -> f32 {
        if x >= self.width || y >= self.height {
            return 0.0;
        }
        self.coverage[(y * self.width + x) as usize]
    }
}

/// Measurement and rasterization for one font.
pub trait Typeface: Send + Sync {
    fn advance(&self, ch: char, size: f32) -> f32;
    fn ascent(&self, size: f32) -> f32;
    fn line_height(&self, size: f32) -> f32;
    fn rasterize(&self, ch: char, size: f32) -> Option<GlyphMask>;

    fn measure(&self, text: &str, size: f32) -> f32 {
        text.chars().map(|c| self.advance(c, size)).sum()
    }
}

/// A TrueType/OpenType font loaded through `ab_glyph`.
pub struct FontFace {
    font: FontArc,
}

impl FontFace {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ab_glyph::InvalidFont> {
        Ok(Self {
            font: FontArc::try_from_vec(data)?,
        })
    }
}

impl Typeface for FontFace {
    fn advance(&self, ch: char, size: f32) -> f32 {
        let scaled = self.font.as_scaled(PxScale::from(size));
        scaled.h_advance(self.font.glyph_id(ch))
    }

    fn ascent(&self, size: f32) -> f32 {
        self.font.as_scaled(PxScale::from(size)).ascent()
    }

    fn line_height(&self, size: f32) -> f32 {
        let scaled = self.font.as_scaled(PxScale::from(size));
        scaled.height() + scaled.line_gap()
    }

    fn rasterize(&self, ch: char, size: f32) -> Option<GlyphMask> {
        let glyph = self
            .font
            .glyph_id(ch)
            .with_scale_and_position(PxScale::from(size), point(0.0, 0.0));
        let outlined = self.font.outline_glyph(glyph)?;
        let bounds = outlined.px_bounds();
        let width = bounds.width().ceil().max(1.0) as u32;
        let height = bounds.height().ceil().max(1.0) as u32;
        let mut coverage = vec![0.0; (width * height) as usize];
        outlined.draw(|x, y, c| {
            if let Some(slot) = coverage.get_mut((y * width + x) as usize) {
                *slot = c;
            }
        });
        Some(GlyphMask {
            width,
            height,
            left: bounds.min.x,
            top: bounds.min.y,
            coverage,
        })
    }
}

/// Tunables for fitting a label to the rim. Sizes are in pixels; ratios are
/// relative to the token radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitConfig {
    #[serde(default = "default_start_ratio")]
    pub start_ratio: f32,
    #[serde(default)]
    pub initial_size: Option<f32>,
    #[serde(default = "default_min_font_size")]
    pub min_font_size: f32,
    #[serde(default = "default_shrink_step")]
    pub shrink_step: f32,
    #[serde(default = "default_max_arc_degrees")]
    pub max_arc_degrees: f32,
    #[serde(default = "default_straight_fraction")]
    pub straight_fraction: f32,
    #[serde(default = "default_baseline_ratio")]
    pub baseline_ratio: f32,
}

fn default_start_ratio() -> f32 { 0.18 }
fn default_min_font_size() -> f32 { 10.0 }
fn default_shrink_step() -> f32 { 2.0 }
fn default_max_arc_degrees() -> f32 { 160.0 }
fn default_straight_fraction() -> f32 { 0.12 }
fn default_baseline_ratio() -> f32 { 0.86 }

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            start_ratio: default_start_ratio(),
            initial_size: None,
            min_font_size: default_min_font_size(),
            shrink_step: default_shrink_step(),
            max_arc_degrees: default_max_arc_degrees(),
            straight_fraction: default_straight_fraction(),
            baseline_ratio: default_baseline_ratio(),
        }
    }
}

impl FitConfig {
    pub fn reminder() -> Self {
        Self {
            start_ratio: 0.27,
            ..Self::default()
        }
    }

    /// Reject tunables that would keep the shrink loop from making progress.
    pub fn check(&self) -> Result<(), String> {
        if self.min_font_size <= 0.0 {
            return Err(format!("minFontSize must be positive, got {}", self.min_font_size));
        }
        if self.shrink_step < 0.5 {
            return Err(format!("shrinkStep must be at least 0.5, got {}", self.shrink_step));
        }
        Ok(())
    }

    fn start_size(&self, radius: f32) -> f32 {
        self.initial_size
            .unwrap_or(radius * self.start_ratio)
            .max(self.min_font_size)
    }
}

/// Tunables for the wrapped ability text block. Ratios are relative to the
/// token diameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityConfig {
    #[serde(default = "default_ability_start")]
    pub start_ratio: f32,
    #[serde(default = "default_first_line")]
    pub first_line_ratio: f32,
    #[serde(default = "default_line_step")]
    pub line_step_ratio: f32,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f32,
    #[serde(default = "default_ability_min")]
    pub min_font_size: f32,
    #[serde(default = "default_top_ratio")]
    pub top_ratio: f32,
}

fn default_ability_start() -> f32 { 0.055 }
fn default_first_line() -> f32 { 0.52 }
fn default_line_step() -> f32 { 0.10 }
fn default_max_lines() -> usize { 4 }
fn default_shrink_factor() -> f32 { 0.9 }
fn default_ability_min() -> f32 { 6.0 }
fn default_top_ratio() -> f32 { 0.09 }

impl AbilityConfig {
    pub fn check(&self) -> Result<(), String> {
        if self.min_font_size <= 0.0 {
            return Err(format!("minFontSize must be positive, got {}", self.min_font_size));
        }
        if self.shrink_factor <= 0.0 || self.shrink_factor >= 1.0 {
            return Err(format!("shrinkFactor must be in (0, 1), got {}", self.shrink_factor));
        }
        if self.max_lines == 0 {
            return Err("maxLines must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for AbilityConfig {
    fn default() -> Self {
        Self {
            start_ratio: default_ability_start(),
            first_line_ratio: default_first_line(),
            line_step_ratio: default_line_step(),
            max_lines: default_max_lines(),
            shrink_factor: default_shrink_factor(),
            min_font_size: default_ability_min(),
            top_ratio: default_top_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    Straight,
    Arc,
    Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlyphPlacement {
    pub ch: char,
    pub x: f32,
    pub y: f32,
    /// Clockwise rotation in image space, radians.
    pub rotation: f32,
    pub advance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub glyphs: Vec<GlyphPlacement>,
    pub font_size: f32,
    pub mode: LayoutMode,
    pub span_degrees: f32,
}

impl TextLayout {
    fn empty(mode: LayoutMode, font_size: f32) -> Self {
        Self {
            glyphs: vec![],
            font_size,
            mode,
            span_degrees: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }
}

#[derive(Debug, Clone, Error)]
pub enum LayoutError {
    #[error("'{label}' spans {span_degrees:.1} degrees at the minimum size {font_size}px")]
    DoesNotFit {
        label: String,
        font_size: f32,
        span_degrees: f32,
        fallback: Box<TextLayout>,
    },

    #[error("text needs {lines} lines (max {max_lines}) at the minimum size {font_size}px")]
    TooManyLines {
        lines: usize,
        max_lines: usize,
        font_size: f32,
        fallback: Box<TextLayout>,
    },
}

impl LayoutError {
    /// The best layout found before giving up, for callers that accept overlap.
    pub fn fallback(&self) -> &TextLayout {
        match self {
            Self::DoesNotFit { fallback, .. } | Self::TooManyLines { fallback, .. } => fallback,
        }
    }
}

/// Fit `label` to a token of `radius` pixels.
///
/// Short labels are set straight and centered near the bottom. Longer ones
/// follow an arc at `radius * baseline_ratio`, shrinking by `shrink_step`
/// until the arc spans at most `max_arc_degrees`.
pub fn fit_label(
    label: &str,
    radius: f32,
    face: &dyn Typeface,
    config: &FitConfig,
) -> Result<TextLayout, LayoutError> {
    let mut size = config.start_size(radius);
    if label.is_empty() {
        return Ok(TextLayout::empty(LayoutMode::Straight, size));
    }

    let baseline = radius * config.baseline_ratio;
    let circumference = 2.0 * PI * radius;
    let max_span = config.max_arc_degrees.to_radians();

    loop {
        let advances: Vec<f32> = label.chars().map(|c| face.advance(c, size)).collect();
        let total: f32 = advances.iter().sum();

        if total <= config.straight_fraction * circumference {
            return Ok(straight_layout(label, &advances, total, baseline, size));
        }

        let span = total / baseline;
        let layout = arc_layout(label, &advances, span, baseline, size);
        if span <= max_span {
            return Ok(layout);
        }

        let next = size - config.shrink_step;
        if next < config.min_font_size || next >= size {
            return Err(LayoutError::DoesNotFit {
                label: label.to_string(),
                font_size: size,
                span_degrees: span.to_degrees(),
                fallback: Box::new(layout),
            });
        }
        size = next;
    }
}

/// Like [`fit_label`], but drops trailing characters (marking the cut with a
/// period) until the label fits. Returns the layout and the text actually set.
pub fn fit_label_truncated(
    label: &str,
    radius: f32,
    face: &dyn Typeface,
    config: &FitConfig,
) -> Result<(TextLayout, String), LayoutError> {
    let first_err = match fit_label(label, radius, face, config) {
        Ok(layout) => return Ok((layout, label.to_string())),
        Err(e) => e,
    };
    let chars: Vec<char> = label.chars().collect();
    for keep in (1..chars.len()).rev() {
        let mut candidate: String = chars[..keep].iter().collect::<String>().trim_end().to_string();
        candidate.push('.');
        if let Ok(layout) = fit_label(&candidate, radius, face, config) {
            return Ok((layout, candidate));
        }
    }
    Err(first_err)
}

fn straight_layout(
    label: &str,
    advances: &[f32],
    total: f32,
    baseline: f32,
    size: f32,
) -> TextLayout {
    let mut cursor = -total / 2.0;
    let glyphs = label
        .chars()
        .zip(advances)
        .map(|(ch, &advance)| {
            let placement = GlyphPlacement {
                ch,
                x: cursor + advance / 2.0,
                y: baseline,
                rotation: 0.0,
                advance,
            };
            cursor += advance;
            placement
        })
        .collect();
    TextLayout {
        glyphs,
        font_size: size,
        mode: LayoutMode::Straight,
        span_degrees: 0.0,
    }
}

fn arc_layout(label: &str, advances: &[f32], span: f32, baseline: f32, size: f32) -> TextLayout {
    // Angles are measured from straight down, positive toward the right.
    let mut consumed = 0.0;
    let glyphs = label
        .chars()
        .zip(advances)
        .map(|(ch, &advance)| {
            let theta = advance / baseline;
            let angle = -span / 2.0 + consumed + theta / 2.0;
            consumed += theta;
            GlyphPlacement {
                ch,
                x: baseline * angle.sin(),
                y: baseline * angle.cos(),
                rotation: -angle,
                advance,
            }
        })
        .collect();
    TextLayout {
        glyphs,
        font_size: size,
        mode: LayoutMode::Arc,
        span_degrees: span.to_degrees(),
    }
}

/// Wrap `text` into a centered block near the top of a token of `diameter`
/// pixels. Each line may be wider than the one above it.
pub fn fit_block(
    text: &str,
    diameter: f32,
    face: &dyn Typeface,
    config: &AbilityConfig,
) -> Result<TextLayout, LayoutError> {
    let mut size = (diameter * config.start_ratio).max(config.min_font_size);
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Ok(TextLayout::empty(LayoutMode::Block, size));
    }

    let first_width = diameter * config.first_line_ratio;
    let step = diameter * config.line_step_ratio;
    let top = -diameter / 2.0 + diameter * config.top_ratio;

    loop {
        let lines = wrap_words(&words, face, size, first_width, step);
        let layout = block_layout(&lines, face, size, top);
        if lines.len() <= config.max_lines {
            return Ok(layout);
        }
        let next = size * config.shrink_factor;
        if next < config.min_font_size || next >= size {
            return Err(LayoutError::TooManyLines {
                lines: lines.len(),
                max_lines: config.max_lines,
                font_size: size,
                fallback: Box::new(layout),
            });
        }
        size = next;
    }
}

fn wrap_words(
    words: &[&str],
    face: &dyn Typeface,
    size: f32,
    first_width: f32,
    step: f32,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut limit = first_width;
    for word in words {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", current, word)
        };
        if current.is_empty() || face.measure(&candidate, size) <= limit {
            current = candidate;
        } else {
            lines.push(std::mem::replace(&mut current, word.to_string()));
            limit += step;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn block_layout(lines: &[String], face: &dyn Typeface, size: f32, top: f32) -> TextLayout {
    let ascent = face.ascent(size);
    let line_height = face.line_height(size);
    let mut glyphs = Vec::new();
    for (row, line) in lines.iter().enumerate() {
        let baseline = top + ascent + row as f32 * line_height;
        let mut cursor = -face.measure(line, size) / 2.0;
        for ch in line.chars() {
            let advance = face.advance(ch, size);
            glyphs.push(GlyphPlacement {
                ch,
                x: cursor + advance / 2.0,
                y: baseline,
                rotation: 0.0,
                advance,
            });
            cursor += advance;
        }
    }
    TextLayout {
        glyphs,
        font_size: size,
        mode: LayoutMode::Block,
        span_degrees: 0.0,
    }
}
