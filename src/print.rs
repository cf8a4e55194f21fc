//! Print Geometry
//!
//! Page size, printer margin and resolution for the sheets tokens are packed on.

use serde::{Deserialize, Serialize};

use crate::packer::GeometryError;

/// Standard paper sizes, in thousandths of an inch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperSize {
    Letter,
    Legal,
    A4,
}

impl PaperSize {
    fn mils(&self) -> (u32, u32) {
        match self {
            Self::Letter => (8_500, 11_000),
            Self::Legal => (8_500, 14_000),
            Self::A4 => (8_268, 11_693),
        }
    }
}

/// A printable page in pixels. Tokens are only placed inside the margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageGeometry {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_margin")]
    pub margin: u32,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

// 8.5"x11" at 300dpi, leaving 2402x3152 inside a 74px printer margin.
fn default_width() -> u32 { 2550 }
fn default_height() -> u32 { 3300 }
fn default_margin() -> u32 { 74 }
fn default_dpi() -> u32 { 300 }

impl Default for PageGeometry {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            margin: default_margin(),
            dpi: default_dpi(),
        }
    }
}

impl PageGeometry {
    /// Page for a paper size at `dpi` with a margin given in inches.
    pub fn paper(size: PaperSize, dpi: u32, margin_inches: f64) -> Result<Self, GeometryError> {
        let (w, h) = size.mils();
        let px = |mils: u32| ((mils as u64 * dpi as u64) / 1000) as u32;
        Self::from_user(px(w), px(h), (margin_inches * dpi as f64).round() as u32, dpi)
    }

    /// Create from user-supplied values with validation
    pub fn from_user(width: u32, height: u32, margin: u32, dpi: u32) -> Result<Self, GeometryError> {
        if !(72..=1200).contains(&dpi) {
            return Err(GeometryError::InvalidPage(format!(
                "DPI must be between 72 and 1200, got {}",
                dpi
            )));
        }
        let geometry = Self { width, height, margin, dpi };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.margin.saturating_mul(2) >= self.width || self.margin.saturating_mul(2) >= self.height {
            return Err(GeometryError::InvalidPage(format!(
                "margin {} leaves no printable area on a {}x{} page",
                self.margin, self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn printable_width(&self) -> u32 {
        self.width.saturating_sub(self.margin * 2)
    }

    pub fn printable_height(&self) -> u32 {
        self.height.saturating_sub(self.margin * 2)
    }
}
