//! botc-tokens - Token Composition and Sheet Layout
//!
//! Turns role definitions and layered artwork into round, printable tokens,
//! then packs them onto pages in script order.
//!
//! # Ground Rules
//! 1. Input is validated before anything renders
//! 2. A missing mandatory layer fails its token, a missing decoration does not
//! 3. Text that cannot fit is always reported
//! 4. Same inputs, same pixels
//! 5. A failed run writes no pages

pub mod components;
pub mod compositor;
pub mod config;
pub mod export;
pub mod manifest;
pub mod packer;
pub mod page;
pub mod pipeline;
pub mod print;
pub mod role;
pub mod text;
pub mod validation;

pub use components::{AssetCache, Component, ComponentResolver, LayerSlot, ResolveError};
pub use compositor::{Compositor, RenderedToken, TokenConfig, TokenError, TokenId, TokenKind, TokenSpec};
pub use config::EngineConfig;
pub use packer::{Arrangement, GeometryError, Page, PackerConfig, Placement, SheetPacker};
pub use page::{render_page, render_pages, PageImage};
pub use pipeline::{ErrorKind, PipelineError, TokenPipeline};
pub use print::PageGeometry;
pub use role::{Role, RoleCategory, RoleSet, Script, ScriptError};
pub use text::{fit_label, FitConfig, LayoutError, TextLayout, Typeface};
pub use validation::{ValidationReport, ValidationRule, ValidationViolation, ViolationSeverity};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
