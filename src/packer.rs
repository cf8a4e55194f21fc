//! Sheet Packer - Tokens onto Pages, in Script Order
//!
//! A single sequential pass. The cursor is a plain value that is stepped
//! forward for every placement; when it cannot take the next token the
//! packer moves from ACCEPTING to PAGE_FULL, finalizes the page and opens a
//! fresh one.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::compositor::{RenderedToken, TokenId};
use crate::print::PageGeometry;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error(
        "Token {token} is {width}x{height}px, larger than the printable area {printable_width}x{printable_height}px"
    )]
    TokenTooLarge {
        token: TokenId,
        width: u32,
        height: u32,
        printable_width: u32,
        printable_height: u32,
    },

    #[error("Invalid page geometry: {0}")]
    InvalidPage(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arrangement {
    /// Left-to-right rows, top-to-bottom, bounding boxes never overlap.
    #[default]
    Rows,
    /// Alternate rows inset by half a cell so round tokens nest together.
    Staggered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackerConfig {
    #[serde(default)]
    pub spacing_x: u32,
    #[serde(default)]
    pub spacing_y: u32,
    #[serde(default)]
    pub arrangement: Arrangement,
    /// Cell size for the staggered arrangement. Defaults to the largest token.
    #[serde(default)]
    pub cell_size: Option<u32>,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            spacing_x: 0,
            spacing_y: 0,
            arrangement: Arrangement::Rows,
            cell_size: None,
        }
    }
}

impl PackerConfig {
    pub fn with_spacing(spacing: u32) -> Self {
        Self {
            spacing_x: spacing,
            spacing_y: spacing,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Placement {
    pub token: RenderedToken,
    /// Top-left corner in page pixels, margin included.
    pub x: u32,
    pub y: u32,
}

impl Placement {
    pub fn right(&self) -> u32 {
        self.x + self.token.width()
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.token.height()
    }

    pub fn overlaps(&self, other: &Placement) -> bool {
        self.x < other.right() && other.x < self.right() && self.y < other.bottom() && other.y < self.bottom()
    }
}

/// A finalized sheet.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page number.
    pub number: usize,
    pub geometry: PageGeometry,
    pub placements: Vec<Placement>,
}

impl Page {
    fn new(number: usize, geometry: PageGeometry) -> Self {
        Self {
            number,
            geometry,
            placements: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackerState {
    Accepting,
    PageFull,
}

/// Printable-area geometry the cursor steps through.
#[derive(Debug, Clone, Copy)]
struct Grid {
    width: u32,
    height: u32,
    spacing_x: u32,
    spacing_y: u32,
    arrangement: Arrangement,
    cell: u32,
    inset: u32,
    pitch: u32,
}

impl Grid {
    fn new(geometry: &PageGeometry, config: &PackerConfig, cell: u32) -> Self {
        let width = geometry.printable_width();
        let stride = cell + config.spacing_x;
        let half = stride / 2;
        // odd rows only shift when the shifted row still holds a token
        let inset = if half + cell <= width { half } else { 0 };
        let pitch = if inset > 0 {
            let rise = ((stride as f64).powi(2) - (half as f64).powi(2)).sqrt();
            rise.ceil() as u32 + config.spacing_y
        } else {
            stride + config.spacing_y
        };
        Self {
            width,
            height: geometry.printable_height(),
            spacing_x: config.spacing_x,
            spacing_y: config.spacing_y,
            arrangement: config.arrangement,
            cell,
            inset,
            pitch,
        }
    }

    fn row_start(&self, row: u32) -> u32 {
        match self.arrangement {
            Arrangement::Staggered if row % 2 == 1 => self.inset,
            _ => 0,
        }
    }
}

/// Position of the next free slot within the printable area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub x: u32,
    pub y: u32,
    pub row_height: u32,
    pub row: u32,
}

impl Cursor {
    pub const ORIGIN: Cursor = Cursor {
        x: 0,
        y: 0,
        row_height: 0,
        row: 0,
    };

    /// Where a `w`x`h` token would go, and the cursor after it. `None` means
    /// the page is full.
    fn place(self, w: u32, h: u32, grid: &Grid) -> Option<((u32, u32), Cursor)> {
        match grid.arrangement {
            Arrangement::Rows => self.place_in_rows(w, h, grid),
            Arrangement::Staggered => self.place_staggered(w, h, grid),
        }
    }

    fn place_in_rows(self, w: u32, h: u32, grid: &Grid) -> Option<((u32, u32), Cursor)> {
        let mut c = self;
        if c.x > 0 && c.x + w > grid.width {
            c = Cursor {
                x: 0,
                y: c.y + c.row_height + grid.spacing_y,
                row_height: 0,
                row: c.row + 1,
            };
        }
        if c.x + w > grid.width || c.y + h > grid.height {
            return None;
        }
        let next = Cursor {
            x: c.x + w + grid.spacing_x,
            row_height: c.row_height.max(h),
            ..c
        };
        Some(((c.x, c.y), next))
    }

    fn place_staggered(self, w: u32, h: u32, grid: &Grid) -> Option<((u32, u32), Cursor)> {
        let d = grid.cell;
        let mut c = self;
        if c.x > grid.row_start(c.row) && c.x + d > grid.width {
            let row = c.row + 1;
            c = Cursor {
                x: grid.row_start(row),
                y: c.y + grid.pitch,
                row_height: 0,
                row,
            };
        }
        if c.x + d > grid.width || c.y + d > grid.height {
            return None;
        }
        let next = Cursor {
            x: c.x + d + grid.spacing_x,
            row_height: d,
            ..c
        };
        Some(((c.x + (d - w) / 2, c.y + (d - h) / 2), next))
    }

    fn fits_all(self, sizes: &[(u32, u32)], grid: &Grid) -> bool {
        let mut cursor = self;
        for &(w, h) in sizes {
            match cursor.place(w, h, grid) {
                Some((_, next)) => cursor = next,
                None => return false,
            }
        }
        true
    }
}

pub struct SheetPacker {
    geometry: PageGeometry,
    config: PackerConfig,
}

impl SheetPacker {
    pub fn new(geometry: PageGeometry, config: PackerConfig) -> Result<Self, GeometryError> {
        geometry.validate()?;
        Ok(Self { geometry, config })
    }

    pub fn geometry(&self) -> &PageGeometry {
        &self.geometry
    }

    /// How many `w`x`h` tokens one page holds in the row arrangement.
    pub fn page_capacity(&self, w: u32, h: u32) -> usize {
        let cols = (self.geometry.printable_width() + self.config.spacing_x) / (w + self.config.spacing_x).max(1);
        let rows = (self.geometry.printable_height() + self.config.spacing_y) / (h + self.config.spacing_y).max(1);
        (cols * rows) as usize
    }

    /// Place `tokens` in order. A character token starts a group that runs
    /// through the reminders after it. A group moves to a fresh page when the
    /// character and its first reminder would not both fit; the rest of a
    /// group may spill over a page break.
    pub fn pack(&self, tokens: Vec<RenderedToken>) -> Result<Vec<Page>, GeometryError> {
        let (pw, ph) = (self.geometry.printable_width(), self.geometry.printable_height());
        for token in &tokens {
            if token.width() > pw || token.height() > ph {
                return Err(GeometryError::TokenTooLarge {
                    token: token.id.clone(),
                    width: token.width(),
                    height: token.height(),
                    printable_width: pw,
                    printable_height: ph,
                });
            }
        }

        let largest = tokens.iter().map(|t| t.width().max(t.height())).max().unwrap_or(0);
        let cell = self.config.cell_size.unwrap_or(0).max(largest);
        if self.config.arrangement == Arrangement::Staggered && (cell > pw || cell > ph) {
            return Err(GeometryError::InvalidPage(format!(
                "cell size {} does not fit the printable area {}x{}",
                cell, pw, ph
            )));
        }
        let grid = Grid::new(&self.geometry, &self.config, cell);

        let sizes: Vec<(u32, u32, bool)> = tokens
            .iter()
            .map(|t| (t.width(), t.height(), t.is_character()))
            .collect();

        let mut pages = Vec::new();
        let mut page = Page::new(1, self.geometry);
        let mut cursor = Cursor::ORIGIN;

        for (i, token) in tokens.into_iter().enumerate() {
            let (w, h, is_character) = sizes[i];
            let mut state = PackerState::Accepting;

            if is_character && !page.is_empty() {
                let mut lead = vec![(w, h)];
                if let Some(&(nw, nh, false)) = sizes.get(i + 1) {
                    lead.push((nw, nh));
                }
                if !cursor.fits_all(&lead, &grid) {
                    state = PackerState::PageFull;
                }
            }

            let mut slot = None;
            if state == PackerState::Accepting {
                match cursor.place(w, h, &grid) {
                    Some(found) => slot = Some(found),
                    None => state = PackerState::PageFull,
                }
            }

            if state == PackerState::PageFull {
                let next_number = page.number + 1;
                let full = std::mem::replace(&mut page, Page::new(next_number, self.geometry));
                debug!(page = full.number, tokens = full.len(), "page finalized");
                pages.push(full);
                cursor = Cursor::ORIGIN;
                slot = cursor.place(w, h, &grid);
            }

            let ((x, y), next) = slot.ok_or_else(|| GeometryError::TokenTooLarge {
                token: token.id.clone(),
                width: w,
                height: h,
                printable_width: pw,
                printable_height: ph,
            })?;
            cursor = next;
            page.placements.push(Placement {
                token,
                x: x + self.geometry.margin,
                y: y + self.geometry.margin,
            });
        }

        if !page.is_empty() {
            debug!(page = page.number, tokens = page.len(), "page finalized");
            pages.push(page);
        }
        Ok(pages)
    }
}
