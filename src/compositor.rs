//! Layer Compositor - From Components to a Token Bitmap
//!
//! Layers are drawn in the order the resolver declares them, each scaled to
//! the requested token size first, using alpha-over blending. Nothing here
//! touches the disk.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::components::{Anchor, AssetCache, AssetError, Component, ResolveError};
use crate::role::Role;
use crate::text::{
    fit_block, fit_label, fit_label_truncated, AbilityConfig, FitConfig, LayoutError, TextLayout,
    Typeface,
};

/// Leaf artwork exists for this many reminders.
pub const MAX_REMINDER_LEAVES: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Character,
    Reminder { label: String },
}

impl TokenKind {
    pub fn tag(&self) -> KindTag {
        match self {
            Self::Character => KindTag::Character,
            Self::Reminder { .. } => KindTag::Reminder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindTag {
    Character,
    Reminder,
}

/// Identity of one token within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId {
    pub role: String,
    pub kind: KindTag,
    pub index: usize,
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            KindTag::Character => "character",
            KindTag::Reminder => "reminder",
        };
        write!(f, "{} ({} #{})", self.role, kind, self.index)
    }
}

/// A request to render one token.
#[derive(Debug, Clone)]
pub struct TokenSpec {
    pub role: Arc<Role>,
    pub kind: TokenKind,
    pub index: usize,
    /// Reminder count of the role in this script; drives the leaf layers.
    pub reminder_count: usize,
    pub diameter: u32,
}

impl TokenSpec {
    pub fn character(role: Arc<Role>, index: usize, reminder_count: usize, diameter: u32) -> Self {
        Self {
            role,
            kind: TokenKind::Character,
            index,
            reminder_count,
            diameter,
        }
    }

    pub fn reminder(role: Arc<Role>, label: impl Into<String>, index: usize, diameter: u32) -> Self {
        Self {
            role,
            kind: TokenKind::Reminder {
                label: label.into(),
            },
            index,
            reminder_count: 0,
            diameter,
        }
    }

    pub fn id(&self) -> TokenId {
        TokenId {
            role: self.role.name.clone(),
            kind: self.kind.tag(),
            index: self.index,
        }
    }

    pub fn radius(&self) -> f32 {
        self.diameter as f32 / 2.0
    }

    /// Text set along the rim: the role name in capitals, or the reminder
    /// label with each word capitalized.
    pub fn label(&self) -> String {
        match &self.kind {
            TokenKind::Character => self.role.name.to_uppercase(),
            TokenKind::Reminder { label } => capitalize_words(label),
        }
    }
}

fn capitalize_words(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// A finished token bitmap.
#[derive(Debug, Clone)]
pub struct RenderedToken {
    pub id: TokenId,
    pub image: RgbaImage,
    /// Text that could not be set cleanly, and what was done about it.
    pub degraded: Vec<String>,
}

impl RenderedToken {
    pub fn new(id: TokenId, image: RgbaImage) -> Self {
        Self {
            id,
            image,
            degraded: vec![],
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_character(&self) -> bool {
        self.id.kind == KindTag::Character
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("{token}: {source}")]
    Resolve {
        token: TokenId,
        #[source]
        source: ResolveError,
    },

    #[error("{token}: {source}")]
    Asset {
        token: TokenId,
        #[source]
        source: AssetError,
    },

    #[error("{token}: {source}")]
    Layout {
        token: TokenId,
        #[source]
        source: LayoutError,
    },
}

impl TokenError {
    pub fn token(&self) -> &TokenId {
        match self {
            Self::Resolve { token, .. } | Self::Asset { token, .. } | Self::Layout { token, .. } => {
                token
            }
        }
    }
}

/// What to do when text cannot fit at the minimum size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Fail,
    Overlap,
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    #[serde(default = "default_role_diameter")]
    pub role_diameter: u32,
    #[serde(default = "default_reminder_diameter")]
    pub reminder_diameter: u32,
    #[serde(default = "default_true")]
    pub clip_to_circle: bool,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub role_name: FitConfig,
    #[serde(default = "FitConfig::reminder")]
    pub reminder_text: FitConfig,
    #[serde(default)]
    pub ability: AbilityConfig,
    #[serde(default = "default_dark")]
    pub role_name_color: [u8; 4],
    #[serde(default = "default_light")]
    pub reminder_text_color: [u8; 4],
    #[serde(default = "default_dark")]
    pub ability_color: [u8; 4],
}

fn default_role_diameter() -> u32 { 575 }
fn default_reminder_diameter() -> u32 { 325 }
fn default_true() -> bool { true }
fn default_dark() -> [u8; 4] { [0, 0, 0, 255] }
fn default_light() -> [u8; 4] { [0xEC, 0xEA, 0xED, 255] }

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            role_diameter: default_role_diameter(),
            reminder_diameter: default_reminder_diameter(),
            clip_to_circle: true,
            overflow: OverflowPolicy::Fail,
            role_name: FitConfig::default(),
            reminder_text: FitConfig::reminder(),
            ability: AbilityConfig::default(),
            role_name_color: default_dark(),
            reminder_text_color: default_light(),
            ability_color: default_dark(),
        }
    }
}

/// Stacks resolved components into a token bitmap.
pub struct Compositor<'a> {
    cache: &'a AssetCache,
    config: &'a TokenConfig,
}

impl<'a> Compositor<'a> {
    pub fn new(cache: &'a AssetCache, config: &'a TokenConfig) -> Self {
        Self { cache, config }
    }

    pub fn compose(
        &self,
        spec: &TokenSpec,
        components: &[Component],
    ) -> Result<RenderedToken, TokenError> {
        let id = spec.id();
        let size = spec.diameter.max(1);
        let mut canvas = RgbaImage::new(size, size);
        let mut degraded = Vec::new();

        for component in components {
            let drawn = match component.anchor {
                Anchor::FullBleed | Anchor::Fit { .. } => self
                    .cache
                    .image(&component.path)
                    .map(|art| draw_image(&mut canvas, art, component.anchor)),
                Anchor::Rim | Anchor::Block => match self.cache.face(&component.path) {
                    Ok(face) => {
                        self.draw_text(&mut canvas, spec, component.anchor, face.as_ref(), &mut degraded)
                            .map_err(|source| TokenError::Layout {
                                token: id.clone(),
                                source,
                            })?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };

            if let Err(source) = drawn {
                if component.slot.is_mandatory() {
                    return Err(TokenError::Asset { token: id, source });
                }
                warn!(token = %id, slot = %component.slot, error = %source, "skipping layer");
            }
        }

        if self.config.clip_to_circle {
            clip_to_circle(&mut canvas);
        }

        Ok(RenderedToken {
            id,
            image: canvas,
            degraded,
        })
    }

    fn draw_text(
        &self,
        canvas: &mut RgbaImage,
        spec: &TokenSpec,
        anchor: Anchor,
        face: &dyn Typeface,
        degraded: &mut Vec<String>,
    ) -> Result<(), LayoutError> {
        let (layout, color) = match anchor {
            Anchor::Block => {
                let fitted = fit_block(&spec.role.ability, spec.diameter as f32, face, &self.config.ability);
                (self.apply_policy(spec, fitted, None, face, degraded)?, self.config.ability_color)
            }
            _ => {
                let (fit, color) = match spec.kind {
                    TokenKind::Character => (&self.config.role_name, self.config.role_name_color),
                    TokenKind::Reminder { .. } => {
                        (&self.config.reminder_text, self.config.reminder_text_color)
                    }
                };
                let label = spec.label();
                let fitted = fit_label(&label, spec.radius(), face, fit);
                (self.apply_policy(spec, fitted, Some((&label, fit)), face, degraded)?, color)
            }
        };
        draw_layout(canvas, &layout, face, color);
        Ok(())
    }

    fn apply_policy(
        &self,
        spec: &TokenSpec,
        fitted: Result<TextLayout, LayoutError>,
        label: Option<(&str, &FitConfig)>,
        face: &dyn Typeface,
        degraded: &mut Vec<String>,
    ) -> Result<TextLayout, LayoutError> {
        let err = match fitted {
            Ok(layout) => return Ok(layout),
            Err(err) => err,
        };
        let token = spec.id();
        match (self.config.overflow, label) {
            (OverflowPolicy::Fail, _) => Err(err),
            (OverflowPolicy::Truncate, Some((text, fit))) => {
                let (layout, used) = fit_label_truncated(text, spec.radius(), face, fit)?;
                warn!(%token, label = text, truncated = %used, "label truncated");
                degraded.push(format!("truncated '{}' to '{}'", text, used));
                Ok(layout)
            }
            _ => {
                warn!(%token, error = %err, "drawing overlapping text");
                degraded.push(format!("overlap: {}", err));
                Ok(err.fallback().clone())
            }
        }
    }
}

fn draw_image(canvas: &mut RgbaImage, art: &RgbaImage, anchor: Anchor) {
    let size = canvas.width();
    match anchor {
        Anchor::Fit { width, height, offset_y } => {
            let box_w = (size as f32 * width).max(1.0);
            let box_h = (size as f32 * height).max(1.0);
            let scale = (box_w / art.width() as f32).min(box_h / art.height() as f32);
            let w = ((art.width() as f32 * scale).round() as u32).max(1);
            let h = ((art.height() as f32 * scale).round() as u32).max(1);
            let scaled = imageops::resize(art, w, h, FilterType::Lanczos3);
            let x = (size as i64 - w as i64) / 2;
            let y = (size as i64 - h as i64) / 2 + (offset_y * size as f32).round() as i64;
            imageops::overlay(canvas, &scaled, x, y);
        }
        _ => {
            if art.dimensions() == canvas.dimensions() {
                imageops::overlay(canvas, art, 0, 0);
            } else {
                let scaled = imageops::resize(art, size, canvas.height(), FilterType::Lanczos3);
                imageops::overlay(canvas, &scaled, 0, 0);
            }
        }
    }
}

/// Rasterize every glyph of `layout`, rotated about its baseline center.
pub fn draw_layout(canvas: &mut RgbaImage, layout: &TextLayout, face: &dyn Typeface, color: [u8; 4]) {
    let cx = canvas.width() as f32 / 2.0;
    let cy = canvas.height() as f32 / 2.0;
    for glyph in &layout.glyphs {
        if let Some(mask) = face.rasterize(glyph.ch, layout.font_size) {
            draw_glyph(
                canvas,
                &mask,
                (cx + glyph.x, cy + glyph.y),
                glyph.rotation,
                glyph.advance,
                color,
            );
        }
    }
}

fn draw_glyph(
    canvas: &mut RgbaImage,
    mask: &crate::text::GlyphMask,
    anchor: (f32, f32),
    rotation: f32,
    advance: f32,
    color: [u8; 4],
) {
    let (sin, cos) = rotation.sin_cos();
    let half = advance / 2.0;
    let to_canvas = |u: f32, v: f32| {
        let (lx, ly) = (u - half, v);
        (anchor.0 + lx * cos - ly * sin, anchor.1 + lx * sin + ly * cos)
    };

    let (w, h) = (mask.width as f32, mask.height as f32);
    let corners = [
        to_canvas(mask.left, mask.top),
        to_canvas(mask.left + w, mask.top),
        to_canvas(mask.left, mask.top + h),
        to_canvas(mask.left + w, mask.top + h),
    ];
    let min_x = corners.iter().map(|c| c.0).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let min_y = corners.iter().map(|c| c.1).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let max_x = (corners.iter().map(|c| c.0).fold(f32::MIN, f32::max).ceil().max(0.0) as u32)
        .min(canvas.width());
    let max_y = (corners.iter().map(|c| c.1).fold(f32::MIN, f32::max).ceil().max(0.0) as u32)
        .min(canvas.height());

    for py in min_y..max_y {
        for px in min_x..max_x {
            let dx = px as f32 + 0.5 - anchor.0;
            let dy = py as f32 + 0.5 - anchor.1;
            // inverse rotation back into glyph space
            let u = dx * cos + dy * sin + half;
            let v = -dx * sin + dy * cos;
            let coverage = sample(mask, u - mask.left - 0.5, v - mask.top - 0.5);
            if coverage > 0.0 {
                blend(canvas.get_pixel_mut(px, py), color, coverage);
            }
        }
    }
}

fn sample(mask: &crate::text::GlyphMask, x: f32, y: f32) -> f32 {
    if x <= -1.0 || y <= -1.0 || x >= mask.width as f32 || y >= mask.height as f32 {
        return 0.0;
    }
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let at = |xi: f32, yi: f32| {
        if xi < 0.0 || yi < 0.0 {
            0.0
        } else {
            mask.at(xi as u32, yi as u32)
        }
    };
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1.0, y0) * fx;
    let bottom = at(x0, y0 + 1.0) * (1.0 - fx) + at(x0 + 1.0, y0 + 1.0) * fx;
    top * (1.0 - fy) + bottom * fy
}

fn blend(dst: &mut Rgba<u8>, color: [u8; 4], coverage: f32) {
    let sa = color[3] as f32 / 255.0 * coverage.clamp(0.0, 1.0);
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        return;
    }
    for i in 0..3 {
        let c = (color[i] as f32 * sa + dst[i] as f32 * da * (1.0 - sa)) / out_a;
        dst[i] = c.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round() as u8;
}

/// Fade everything outside the inscribed circle, with a one pixel soft edge.
pub fn clip_to_circle(canvas: &mut RgbaImage) {
    let r = canvas.width().min(canvas.height()) as f32 / 2.0;
    let (cx, cy) = (canvas.width() as f32 / 2.0, canvas.height() as f32 / 2.0);
    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let d = ((x as f32 + 0.5 - cx).powi(2) + (y as f32 + 0.5 - cy).powi(2)).sqrt();
        let coverage = (r - d + 0.5).clamp(0.0, 1.0);
        if coverage < 1.0 {
            pixel[3] = (pixel[3] as f32 * coverage).round() as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{LayerSlot, Origin};
    use crate::role::RoleCategory;
    use crate::text::tests::BlockFace;
    use std::path::PathBuf;

    fn role(reminders: usize) -> Arc<Role> {
        Arc::new(Role {
            name: "Washerwoman".into(),
            ability: "You start knowing that 1 of 2 players is a particular Townsfolk.".into(),
            category: RoleCategory::Townsfolk,
            icon: None,
            first_night: true,
            other_nights: false,
            reminders: vec!["Townsfolk".into(); reminders],
            affects_setup: false,
            home_script: None,
        })
    }

    fn component(slot: LayerSlot, name: &str, anchor: Anchor) -> Component {
        Component {
            slot,
            path: PathBuf::from(name),
            origin: Origin::Default,
            anchor,
        }
    }

    fn assert_close(pixel: &Rgba<u8>, expected: [u8; 4]) {
        for i in 0..4 {
            assert!(
                (pixel[i] as i32 - expected[i] as i32).abs() <= 1,
                "{:?} != {:?}",
                pixel,
                expected
            );
        }
    }

    fn cache() -> AssetCache {
        let mut cache = AssetCache::new();
        cache.insert_image("bg.png", RgbaImage::from_pixel(40, 40, Rgba([200, 180, 150, 255])));
        cache.insert_image("icon.png", RgbaImage::from_pixel(10, 20, Rgba([0, 0, 255, 255])));
        cache.insert_face("font.ttf", Arc::new(BlockFace { advance_ratio: 0.6 }));
        cache
    }

    #[test]
    fn test_layers_scaled_to_requested_size() {
        let cache = cache();
        let config = TokenConfig {
            clip_to_circle: false,
            ..TokenConfig::default()
        };
        let spec = TokenSpec::character(role(1), 0, 1, 200);
        let components = vec![
            component(LayerSlot::TokenBackground, "bg.png", Anchor::FullBleed),
            component(LayerSlot::Icon, "icon.png", Anchor::Fit { width: 0.6, height: 0.5, offset_y: 0.075 }),
        ];
        let token = Compositor::new(&cache, &config).compose(&spec, &components).unwrap();
        assert_eq!((token.width(), token.height()), (200, 200));
        assert_close(token.image.get_pixel(0, 0), [200, 180, 150, 255]);
        // icon fits 120x100 box at 1:2, so 50x100, shifted down by 15
        assert_close(token.image.get_pixel(100, 115), [0, 0, 255, 255]);
        assert_close(token.image.get_pixel(60, 115), [200, 180, 150, 255]);
    }

    #[test]
    fn test_missing_mandatory_layer_fails_token() {
        let cache = cache();
        let config = TokenConfig::default();
        let spec = TokenSpec::character(role(0), 0, 0, 100);
        let components = vec![component(LayerSlot::TokenBackground, "absent.png", Anchor::FullBleed)];
        let err = Compositor::new(&cache, &config).compose(&spec, &components).unwrap_err();
        assert!(matches!(err, TokenError::Asset { .. }));
        assert_eq!(err.token().role, "Washerwoman");
    }

    #[test]
    fn test_missing_optional_layer_is_skipped() {
        let cache = cache();
        let config = TokenConfig::default();
        let spec = TokenSpec::character(role(1), 0, 1, 100);
        let components = vec![
            component(LayerSlot::TokenBackground, "bg.png", Anchor::FullBleed),
            component(LayerSlot::ReminderLeaf(1), "leaf.png", Anchor::FullBleed),
        ];
        assert!(Compositor::new(&cache, &config).compose(&spec, &components).is_ok());
    }

    #[test]
    fn test_text_is_drawn_and_circle_clipped() {
        let cache = cache();
        let config = TokenConfig::default();
        let spec = TokenSpec::reminder(role(1), "first reminder", 0, 300);
        let components = vec![
            component(LayerSlot::ReminderBackground, "bg.png", Anchor::FullBleed),
            component(LayerSlot::ReminderText, "font.ttf", Anchor::Rim),
        ];
        let token = Compositor::new(&cache, &config).compose(&spec, &components).unwrap();
        assert_eq!(token.image.get_pixel(0, 0)[3], 0);
        let light = token
            .image
            .pixels()
            .filter(|p| p[0] > 230 && p[1] > 230 && p[3] == 255)
            .count();
        assert!(light > 0);
        assert!(token.degraded.is_empty());
    }

    #[test]
    fn test_overflow_policy() {
        let cache = cache();
        let spec = TokenSpec::character(role(0), 0, 0, 60);
        let components = vec![component(LayerSlot::RoleName, "font.ttf", Anchor::Rim)];
        let mut config = TokenConfig::default();
        config.role_name.min_font_size = 30.0;

        let err = Compositor::new(&cache, &config).compose(&spec, &components).unwrap_err();
        assert!(matches!(err, TokenError::Layout { .. }));

        config.overflow = OverflowPolicy::Overlap;
        let token = Compositor::new(&cache, &config).compose(&spec, &components).unwrap();
        assert_eq!(token.degraded.len(), 1);

        config.overflow = OverflowPolicy::Truncate;
        let token = Compositor::new(&cache, &config).compose(&spec, &components).unwrap();
        assert!(token.degraded[0].starts_with("truncated"));
    }

    #[test]
    fn test_labels() {
        let spec = TokenSpec::reminder(role(0), "is the DEMON", 0, 10);
        assert_eq!(spec.label(), "Is The Demon");
        assert_eq!(TokenSpec::character(role(0), 0, 0, 10).label(), "WASHERWOMAN");
    }
}
