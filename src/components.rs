//! Component System - Artwork Layers and Their Fallbacks
//!
//! A component search path is an ordered list of directories, most specific
//! first. Each directory may hold per-role folders (`<dir>/<role-id>/Icon.png`)
//! and a `defaults/` folder. A flat package with the assets directly in the
//! root is treated as a defaults folder.

use image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::compositor::{TokenKind, TokenSpec, MAX_REMINDER_LEAVES};
use crate::role::Role;
use crate::text::{FontFace, Typeface};
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static DECODE_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_decode_count() -> u32 {
    DECODE_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_decode_count() {
    DECODE_COUNT.store(0, Ordering::SeqCst);
}

pub const DEFAULTS_DIR: &str = "defaults";
pub const PACKAGE_MANIFEST: &str = "package.json";

const IMAGE_EXTENSIONS: &[&str] = &["png"];
const FONT_EXTENSIONS: &[&str] = &["ttf", "otf"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No {slot} component found for role '{role}'")]
    MissingMandatory { role: String, slot: LayerSlot },

    #[error("Component package {path} is invalid: {reason}")]
    InvalidPackage { path: PathBuf, reason: String },

    #[error("Component package {name} requires engine >= {required}, current is {current}")]
    EngineVersionMismatch {
        name: String,
        required: String,
        current: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum AssetError {
    #[error("Asset {0} was never loaded")]
    NotLoaded(PathBuf),

    #[error("Could not decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Asset {0} is not a {1}")]
    WrongKind(PathBuf, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerSlot {
    TokenBackground,
    ReminderBackground,
    ReminderLeaf(u8),
    Icon,
    FirstNightLeaf,
    OtherNightsLeaf,
    SetupFlower,
    AbilityText,
    RoleName,
    ReminderText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Font,
}

impl LayerSlot {
    /// File stem the slot is stored under.
    pub fn asset_name(&self) -> String {
        match self {
            Self::TokenBackground => "TokenBG".into(),
            Self::ReminderBackground => "ReminderBG".into(),
            Self::ReminderLeaf(n) => format!("Leaf{}", n),
            Self::Icon => "Icon".into(),
            Self::FirstNightLeaf => "LeafLeft".into(),
            Self::OtherNightsLeaf => "LeafRight".into(),
            Self::SetupFlower => "SetupFlower".into(),
            Self::AbilityText => "AbilityText".into(),
            Self::RoleName => "RoleName".into(),
            Self::ReminderText => "ReminderText".into(),
        }
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            Self::TokenBackground | Self::ReminderBackground | Self::Icon
        )
    }

    pub fn asset_kind(&self) -> AssetKind {
        match self {
            Self::AbilityText | Self::RoleName | Self::ReminderText => AssetKind::Font,
            _ => AssetKind::Image,
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self.asset_kind() {
            AssetKind::Image => IMAGE_EXTENSIONS,
            AssetKind::Font => FONT_EXTENSIONS,
        }
    }
}

impl fmt::Display for LayerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.asset_name())
    }
}

/// Where a layer sits on the token. Fractions are of the token diameter;
/// positive `offset_y` moves the layer down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anchor {
    FullBleed,
    Fit { width: f32, height: f32, offset_y: f32 },
    Rim,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    RoleSpecific,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub slot: LayerSlot,
    pub path: PathBuf,
    pub origin: Origin,
    pub anchor: Anchor,
}

/// Optional `package.json` at the root of a component directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default = "default_engine_min")]
    pub engine_min_version: String,
}

fn default_engine_min() -> String { "1.0.0".to_string() }

impl PackageManifest {
    pub fn load(dir: &Path) -> Result<Option<Self>, ResolveError> {
        let path = dir.join(PACKAGE_MANIFEST);
        if !path.is_file() {
            return Ok(None);
        }
        let invalid = |reason: String| ResolveError::InvalidPackage {
            path: path.clone(),
            reason,
        };
        let content = fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let manifest: Self = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        manifest.check_engine_version()?;
        Ok(Some(manifest))
    }

    fn check_engine_version(&self) -> Result<(), ResolveError> {
        let engine = semver::Version::parse(ENGINE_VERSION).map_err(|e| {
            ResolveError::InvalidPackage {
                path: PathBuf::from(PACKAGE_MANIFEST),
                reason: format!("engine version: {}", e),
            }
        })?;
        let required = semver::Version::parse(&self.engine_min_version).map_err(|e| {
            ResolveError::InvalidPackage {
                path: PathBuf::from(PACKAGE_MANIFEST),
                reason: format!("engineMinVersion: {}", e),
            }
        })?;
        if engine < required {
            return Err(ResolveError::EngineVersionMismatch {
                name: self.name.clone(),
                required: self.engine_min_version.clone(),
                current: ENGINE_VERSION.to_string(),
            });
        }
        Ok(())
    }
}

/// Maps a token request to the ordered components it is drawn from.
#[derive(Debug, Clone)]
pub struct ComponentResolver {
    search_path: Vec<PathBuf>,
}

impl ComponentResolver {
    /// Build a resolver, checking any package manifests along the way.
    pub fn new(search_path: Vec<PathBuf>) -> Result<Self, ResolveError> {
        for dir in &search_path {
            if let Some(manifest) = PackageManifest::load(dir)? {
                debug!(package = %manifest.name, version = %manifest.version, "component package");
            }
        }
        Ok(Self { search_path })
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Slots a token needs, in drawing order.
    pub fn slots_for(spec: &TokenSpec) -> Vec<LayerSlot> {
        let role = &spec.role;
        match &spec.kind {
            TokenKind::Character => {
                let mut slots = vec![LayerSlot::TokenBackground];
                let leaves = spec.reminder_count.min(MAX_REMINDER_LEAVES) as u8;
                slots.extend((1..=leaves).map(LayerSlot::ReminderLeaf));
                slots.push(LayerSlot::Icon);
                if role.first_night {
                    slots.push(LayerSlot::FirstNightLeaf);
                }
                if role.other_nights {
                    slots.push(LayerSlot::OtherNightsLeaf);
                }
                if role.affects_setup {
                    slots.push(LayerSlot::SetupFlower);
                }
                if !role.ability.trim().is_empty() {
                    slots.push(LayerSlot::AbilityText);
                }
                slots.push(LayerSlot::RoleName);
                slots
            }
            TokenKind::Reminder { .. } => vec![
                LayerSlot::ReminderBackground,
                LayerSlot::Icon,
                LayerSlot::ReminderText,
            ],
        }
    }

    /// Resolve every slot for `spec`. Optional slots with no asset are
    /// left out; a missing mandatory slot fails the token.
    pub fn resolve(&self, spec: &TokenSpec) -> Result<Vec<Component>, ResolveError> {
        let mut components = Vec::new();
        for slot in Self::slots_for(spec) {
            match self.locate(&spec.role, slot) {
                Some((path, origin)) => components.push(Component {
                    slot,
                    path,
                    origin,
                    anchor: anchor_for(slot, &spec.kind),
                }),
                None if slot.is_mandatory() => {
                    return Err(ResolveError::MissingMandatory {
                        role: spec.role.name.clone(),
                        slot,
                    })
                }
                None => debug!(role = %spec.role.name, %slot, "optional slot omitted"),
            }
        }
        Ok(components)
    }

    /// Role-specific assets win over defaults; within each tier the search
    /// path is walked in order.
    pub fn locate(&self, role: &Role, slot: LayerSlot) -> Option<(PathBuf, Origin)> {
        if slot == LayerSlot::Icon {
            if let Some(icon) = role.icon.as_ref().filter(|p| p.is_file()) {
                return Some((icon.clone(), Origin::RoleSpecific));
            }
        }

        let id = role.id();
        let role_specific = self
            .search_path
            .iter()
            .find_map(|dir| find_asset(&dir.join(&id), slot));
        if let Some(path) = role_specific {
            return Some((path, Origin::RoleSpecific));
        }

        self.search_path
            .iter()
            .find_map(|dir| {
                find_asset(&dir.join(DEFAULTS_DIR), slot).or_else(|| find_asset(dir, slot))
            })
            .map(|path| (path, Origin::Default))
    }
}

fn find_asset(dir: &Path, slot: LayerSlot) -> Option<PathBuf> {
    let stem = slot.asset_name();
    slot.extensions()
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

fn anchor_for(slot: LayerSlot, kind: &TokenKind) -> Anchor {
    match (slot, kind) {
        (LayerSlot::Icon, TokenKind::Character) => Anchor::Fit {
            width: 0.6,
            height: 0.5,
            offset_y: 0.075,
        },
        (LayerSlot::Icon, TokenKind::Reminder { .. }) => Anchor::Fit {
            width: 0.75,
            height: 0.75,
            offset_y: -0.075,
        },
        (LayerSlot::AbilityText, _) => Anchor::Block,
        (LayerSlot::RoleName | LayerSlot::ReminderText, _) => Anchor::Rim,
        _ => Anchor::FullBleed,
    }
}

#[derive(Clone)]
pub enum Asset {
    Image(Arc<RgbaImage>),
    Font(Arc<dyn Typeface>),
}

/// Decoded assets for one run. Filled by [`AssetCache::warm`] before
/// rendering starts and only read afterwards.
#[derive(Default)]
pub struct AssetCache {
    assets: HashMap<PathBuf, Asset>,
    failures: HashMap<PathBuf, AssetError>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_image(&mut self, path: impl Into<PathBuf>, image: RgbaImage) {
        self.assets.insert(path.into(), Asset::Image(Arc::new(image)));
    }

    pub fn insert_face(&mut self, path: impl Into<PathBuf>, face: Arc<dyn Typeface>) {
        self.assets.insert(path.into(), Asset::Font(face));
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Decode every component not already cached, in parallel. Failures are
    /// remembered per path and surface when a token asks for that asset.
    pub fn warm<'a, I>(&mut self, components: I)
    where
        I: IntoIterator<Item = &'a Component>,
    {
        let mut seen = HashSet::new();
        let pending: Vec<(PathBuf, AssetKind)> = components
            .into_iter()
            .filter(|c| !self.assets.contains_key(&c.path) && !self.failures.contains_key(&c.path))
            .filter(|c| seen.insert(c.path.clone()))
            .map(|c| (c.path.clone(), c.slot.asset_kind()))
            .collect();

        debug!(count = pending.len(), "decoding assets");
        let decoded: Vec<_> = pending
            .into_par_iter()
            .map(|(path, kind)| {
                let result = decode(&path, kind);
                (path, result)
            })
            .collect();

        for (path, result) in decoded {
            match result {
                Ok(asset) => {
                    self.assets.insert(path, asset);
                }
                Err(err) => {
                    warn!(error = %err, "asset failed to decode");
                    self.failures.insert(path, err);
                }
            }
        }
    }

    pub fn image(&self, path: &Path) -> Result<&Arc<RgbaImage>, AssetError> {
        match self.lookup(path)? {
            Asset::Image(image) => Ok(image),
            Asset::Font(_) => Err(AssetError::WrongKind(path.to_path_buf(), "image")),
        }
    }

    pub fn face(&self, path: &Path) -> Result<&Arc<dyn Typeface>, AssetError> {
        match self.lookup(path)? {
            Asset::Font(face) => Ok(face),
            Asset::Image(_) => Err(AssetError::WrongKind(path.to_path_buf(), "font")),
        }
    }

    fn lookup(&self, path: &Path) -> Result<&Asset, AssetError> {
        if let Some(err) = self.failures.get(path) {
            return Err(err.clone());
        }
        self.assets
            .get(path)
            .ok_or_else(|| AssetError::NotLoaded(path.to_path_buf()))
    }
}

fn decode(path: &Path, kind: AssetKind) -> Result<Asset, AssetError> {
    #[cfg(feature = "test-hooks")]
    DECODE_COUNT.fetch_add(1, Ordering::SeqCst);

    let failed = |reason: String| AssetError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    match kind {
        AssetKind::Image => {
            let image = image::open(path).map_err(|e| failed(e.to_string()))?;
            Ok(Asset::Image(Arc::new(image.to_rgba8())))
        }
        AssetKind::Font => {
            let bytes = fs::read(path).map_err(|e| failed(e.to_string()))?;
            let face = FontFace::from_bytes(bytes).map_err(|e| failed(e.to_string()))?;
            Ok(Asset::Font(Arc::new(face)))
        }
    }
}
