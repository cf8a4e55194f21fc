//! Export - Token and Page Files on Disk
//!
//! Naming, PNG encoding and writing, plus reading a directory of rendered
//! tokens back for the grouping step.

use image::{ImageError, ImageFormat, RgbaImage};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compositor::{KindTag, RenderedToken, TokenId, TokenKind, TokenSpec};
use crate::manifest::{OutputKind, RunManifest};
use crate::page::PageImage;
use crate::role::{collect_files, normalize_id, Script, ScriptError};

const UNSCRIPTED_DIR: &str = "custom";
const REMINDER_MARKER: &str = "Reminder";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("Failed to decode token {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("Failed to serialize manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    Scan(#[from] ScriptError),
}

/// Make a string safe as a file name on every platform.
pub fn format_filename(name: &str) -> String {
    name.trim()
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            '/' | '\\' | ':' => Some('-'),
            '?' => Some('Q'),
            c if c.is_alphanumeric() || "-_.()".contains(c) => Some(c),
            _ => None,
        })
        .collect()
}

/// Relative path of a token file: `<script>/<Category>/<Name>.png`, or
/// `<Name>-Reminder-<Label>.png` for reminders.
pub fn token_file(spec: &TokenSpec) -> PathBuf {
    let role = &spec.role;
    let script = role
        .home_script
        .as_deref()
        .map(format_filename)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNSCRIPTED_DIR.to_string());
    let name = match &spec.kind {
        TokenKind::Character => format_filename(&role.name),
        TokenKind::Reminder { label } => format!(
            "{}-{}-{}",
            format_filename(&role.name),
            REMINDER_MARKER,
            format_filename(label)
        ),
    };
    Path::new(&script)
        .join(role.category.as_str())
        .join(format!("{}.png", name))
}

/// Hands out file paths, suffixing `-2`, `-3`, ... on collision.
#[derive(Debug, Default)]
struct PathAllocator {
    used: HashSet<PathBuf>,
}

impl PathAllocator {
    fn allocate(&mut self, path: PathBuf) -> PathBuf {
        if self.used.insert(path.clone()) {
            return path;
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut n = 2;
        loop {
            let candidate = path.with_file_name(format!("{}-{}.png", stem, n));
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn encode_png(image: &RgbaImage, path: &Path) -> Result<Vec<u8>, ExportError> {
    let mut data = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .map_err(|source| ExportError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(data)
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ExportError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, data).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write each token next to its siblings under `out`. Specs and tokens are
/// paired in order.
pub fn write_tokens(
    out: &Path,
    specs: &[TokenSpec],
    tokens: &[RenderedToken],
    manifest: &mut RunManifest,
) -> Result<Vec<PathBuf>, ExportError> {
    let mut allocator = PathAllocator::default();
    let paths: Vec<PathBuf> = specs
        .iter()
        .map(|spec| allocator.allocate(out.join(token_file(spec))))
        .collect();

    let encoded = tokens
        .par_iter()
        .zip(paths.par_iter())
        .map(|(token, path)| encode_png(&token.image, path))
        .collect::<Result<Vec<_>, _>>()?;

    for (path, data) in paths.iter().zip(&encoded) {
        write_file(path, data)?;
        manifest.record(out, path, OutputKind::Token, data);
    }
    info!(count = paths.len(), dir = %out.display(), "wrote token files");
    Ok(paths)
}

/// Write pages as `<basename>_<n>.png`.
pub fn write_pages(
    out: &Path,
    basename: &str,
    pages: &[PageImage],
    manifest: &mut RunManifest,
) -> Result<Vec<PathBuf>, ExportError> {
    let basename = format_filename(basename);
    let encoded = pages
        .par_iter()
        .map(|page| {
            let path = out.join(format!("{}_{}.png", basename, page.number));
            encode_png(&page.image, &path).map(|data| (path, data))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut paths = Vec::with_capacity(encoded.len());
    for (path, data) in encoded {
        write_file(&path, &data)?;
        manifest.record(out, &path, OutputKind::Page, &data);
        paths.push(path);
    }
    info!(count = paths.len(), dir = %out.display(), "wrote pages");
    Ok(paths)
}

/// Token files may carry a `-N` collision suffix; the unsuffixed file is copy 1.
fn split_copy_suffix(stem: &str) -> (&str, u32) {
    match stem.rsplit_once('-') {
        Some((base, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => {
            (base, n.parse().unwrap_or(u32::MAX))
        }
        _ => (stem, 1),
    }
}

fn strip_copy_suffix(stem: &str) -> &str {
    split_copy_suffix(stem).0
}

/// Orders `Imp.png` before `Imp-2.png` before `Imp-10.png`, matching write order.
fn token_file_key(path: &Path) -> (PathBuf, String, u32, PathBuf) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (base, copy) = split_copy_suffix(&stem);
    (
        path.parent().map(Path::to_path_buf).unwrap_or_default(),
        base.to_string(),
        copy,
        path.to_path_buf(),
    )
}

/// Read previously rendered tokens and order them by `script`: each role's
/// character tokens, then its reminders. Roles with no files are skipped.
/// A role with fewer character files than its `copies` reuses them in turn.
pub fn load_token_dir(dir: &Path, script: &Script) -> Result<Vec<RenderedToken>, ExportError> {
    let mut files = Vec::new();
    collect_files(dir, "png", &mut files)?;
    files.sort_by_cached_key(|path| token_file_key(path));

    let mut characters: HashMap<String, Vec<PathBuf>> = HashMap::new();
    let mut reminders: Vec<(String, PathBuf)> = Vec::new();
    for path in files {
        let stem = match path.file_stem() {
            Some(stem) => stem.to_string_lossy().into_owned(),
            None => continue,
        };
        if stem.contains(REMINDER_MARKER) {
            reminders.push((normalize_id(&stem), path));
        } else {
            characters
                .entry(normalize_id(strip_copy_suffix(&stem)))
                .or_default()
                .push(path);
        }
    }

    let mut ordered: Vec<(TokenId, PathBuf)> = Vec::new();
    for entry in &script.entries {
        let prefix = format!("{}{}", entry.id, REMINDER_MARKER.to_lowercase());
        let own_reminders: Vec<&PathBuf> = reminders
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, path)| path)
            .collect();
        let mut own_characters = characters.remove(&entry.id).unwrap_or_default();
        let wanted = entry.copies as usize;
        if !own_characters.is_empty() && own_characters.len() < wanted {
            debug!(role = %entry.id, found = own_characters.len(), wanted, "repeating character files");
            own_characters = own_characters.iter().cycle().take(wanted).cloned().collect();
        }
        if own_characters.is_empty() && own_reminders.is_empty() {
            warn!(role = %entry.id, "no token files for scripted role");
            continue;
        }
        for (index, path) in own_characters.into_iter().enumerate() {
            ordered.push((token_id(&entry.id, KindTag::Character, index), path));
        }
        for (index, path) in own_reminders.into_iter().enumerate() {
            ordered.push((token_id(&entry.id, KindTag::Reminder, index), path.clone()));
        }
    }
    debug!(count = ordered.len(), dir = %dir.display(), "matched token files");

    ordered
        .into_par_iter()
        .map(|(id, path)| -> Result<RenderedToken, ExportError> {
            let image = image::open(&path)
                .map_err(|source| ExportError::Decode {
                    path: path.clone(),
                    source,
                })?
                .to_rgba8();
            Ok(RenderedToken::new(id, image))
        })
        .collect()
}

fn token_id(role: &str, kind: KindTag, index: usize) -> TokenId {
    TokenId {
        role: role.to_string(),
        kind,
        index,
    }
}
