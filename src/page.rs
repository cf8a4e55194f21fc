//! Page Renderer
//!
//! Rasterizes finalized pages. Pure: same pages in, same pixels out.

use image::{imageops, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::packer::Page;

pub const WHITE: [u8; 4] = [255, 255, 255, 255];

#[derive(Debug, Clone)]
pub struct PageImage {
    pub number: usize,
    pub image: RgbaImage,
}

pub fn render_page(page: &Page, background: [u8; 4]) -> PageImage {
    let mut image = RgbaImage::from_pixel(page.geometry.width, page.geometry.height, Rgba(background));
    for placement in &page.placements {
        imageops::overlay(&mut image, &placement.token.image, placement.x as i64, placement.y as i64);
    }
    PageImage {
        number: page.number,
        image,
    }
}

/// Render every page, returned in page order.
pub fn render_pages(pages: &[Page], background: [u8; 4]) -> Vec<PageImage> {
    pages.par_iter().map(|page| render_page(page, background)).collect()
}
