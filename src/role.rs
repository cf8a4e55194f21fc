//! Roles and Scripts - Validated Once, Read-Only After
//!
//! Role definitions come from a directory of JSON files. Scripts come from an
//! externally produced JSON array. Both are parsed into explicit types here so
//! nothing downstream has to guess at their shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed role definition {path}: {source}")]
    MalformedRole {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed script: {0}")]
    MalformedScript(String),

    #[error("Duplicate role id '{0}'")]
    DuplicateRole(String),

    #[error("Script references unknown roles: {}", .0.join(", "))]
    UnknownRoles(Vec<String>),

    #[error("Invalid role definitions: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleCategory {
    #[serde(alias = "Townsfolk")]
    Townsfolk,
    #[serde(alias = "Outsider")]
    Outsider,
    #[serde(alias = "Minion")]
    Minion,
    #[serde(alias = "Demon")]
    Demon,
    #[serde(alias = "Traveller", alias = "traveler")]
    Traveller,
    #[serde(alias = "Fabled")]
    Fabled,
}

impl RoleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Townsfolk => "Townsfolk",
            Self::Outsider => "Outsider",
            Self::Minion => "Minion",
            Self::Demon => "Demon",
            Self::Traveller => "Traveller",
            Self::Fabled => "Fabled",
        }
    }
}

/// A character in the game, as described by its JSON definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub ability: String,
    #[serde(rename = "type")]
    pub category: RoleCategory,
    #[serde(default)]
    pub icon: Option<PathBuf>,
    #[serde(default)]
    pub first_night: bool,
    #[serde(default)]
    pub other_nights: bool,
    #[serde(default)]
    pub reminders: Vec<String>,
    #[serde(default)]
    pub affects_setup: bool,
    #[serde(default)]
    pub home_script: Option<String>,
}

impl Role {
    /// Normalized identity used to match script entries and component folders.
    pub fn id(&self) -> String {
        normalize_id(&self.name)
    }

    pub fn reminder_count(&self) -> usize {
        self.reminders.len()
    }

    /// Label for the `index`-th reminder token. Cycles through the declared
    /// labels so a raised reminder count still gets readable text.
    pub fn reminder_label(&self, index: usize) -> &str {
        if self.reminders.is_empty() {
            &self.name
        } else {
            &self.reminders[index % self.reminders.len()]
        }
    }
}

/// Lowercase and strip everything that is not alphanumeric, so "Fortune Teller",
/// "fortune_teller" and "fortuneteller" all name the same role.
pub fn normalize_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// All roles known to a run, keyed by normalized id.
#[derive(Debug, Default)]
pub struct RoleSet {
    roles: HashMap<String, Arc<Role>>,
}

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` file below `dir`. Icon paths are rewritten to be
    /// relative to the working directory. Any file that fails to parse aborts
    /// the load.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ScriptError> {
        let mut files = Vec::new();
        collect_files(dir, "json", &mut files)?;
        files.sort();

        let mut set = Self::new();
        for path in files {
            let content = fs::read_to_string(&path).map_err(|source| ScriptError::Io {
                path: path.clone(),
                source,
            })?;
            let mut role: Role = serde_json::from_str(&content).map_err(|source| {
                ScriptError::MalformedRole {
                    path: path.clone(),
                    source,
                }
            })?;
            if let (Some(icon), Some(parent)) = (role.icon.as_ref(), path.parent()) {
                role.icon = Some(parent.join(icon));
            }
            set.insert(role)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, role: Role) -> Result<(), ScriptError> {
        let id = role.id();
        if self.roles.contains_key(&id) {
            return Err(ScriptError::DuplicateRole(id));
        }
        self.roles.insert(id, Arc::new(role));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Role>> {
        self.roles.get(&normalize_id(id))
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Roles sorted by id, for deterministic iteration.
    pub fn iter_sorted(&self) -> Vec<&Arc<Role>> {
        let mut roles: Vec<_> = self.roles.values().collect();
        roles.sort_by_key(|r| r.id());
        roles
    }
}

pub(crate) fn collect_files(
    dir: &Path,
    extension: &str,
    out: &mut Vec<PathBuf>,
) -> Result<(), ScriptError> {
    let entries = fs::read_dir(dir).map_err(|source| ScriptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let path = entry
            .map_err(|source| ScriptError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        if path.is_dir() {
            collect_files(&path, extension, out)?;
        } else if path
            .extension()
            .map_or(false, |e| e.eq_ignore_ascii_case(extension))
        {
            out.push(path);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub id: String,
    #[serde(default = "default_copies")]
    pub copies: u32,
    #[serde(default)]
    pub reminders: Option<u32>,
}

fn default_copies() -> u32 { 1 }

/// The ordered role list chosen for a game.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Script {
    pub entries: Vec<ScriptEntry>,
}

/// A script entry bound to its role definition.
#[derive(Debug, Clone)]
pub struct ScriptedRole {
    pub role: Arc<Role>,
    pub copies: u32,
    pub reminder_count: usize,
}

impl Script {
    pub fn from_json(text: &str) -> Result<Self, ScriptError> {
        let doc: Value = serde_json::from_str(text)
            .map_err(|e| ScriptError::MalformedScript(e.to_string()))?;
        let items = doc
            .as_array()
            .ok_or_else(|| ScriptError::MalformedScript("expected a JSON array".into()))?;

        let mut entries = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();
        for (position, item) in items.iter().enumerate() {
            let entry = match item {
                Value::String(id) => ScriptEntry {
                    id: id.clone(),
                    copies: 1,
                    reminders: None,
                },
                Value::Object(map) => {
                    if map.get("id").and_then(Value::as_str) == Some("_meta") {
                        continue;
                    }
                    serde_json::from_value(item.clone()).map_err(|e| {
                        ScriptError::MalformedScript(format!("entry {}: {}", position, e))
                    })?
                }
                other => {
                    return Err(ScriptError::MalformedScript(format!(
                        "entry {}: expected string or object, found {}",
                        position, other
                    )))
                }
            };

            let id = normalize_id(&entry.id);
            if id.is_empty() {
                return Err(ScriptError::MalformedScript(format!(
                    "entry {}: empty role id",
                    position
                )));
            }
            if entry.copies == 0 {
                return Err(ScriptError::MalformedScript(format!(
                    "entry {}: copies must be at least 1",
                    position
                )));
            }
            if !seen.insert(id.clone()) {
                return Err(ScriptError::DuplicateRole(id));
            }
            entries.push(ScriptEntry { id, ..entry });
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Build a script from role ids in order, one copy each.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: ids
                .into_iter()
                .map(|id| ScriptEntry {
                    id: normalize_id(id.as_ref()),
                    copies: 1,
                    reminders: None,
                })
                .collect(),
        }
    }

    /// Apply per-role copy counts (e.g. roles that need several character tokens).
    /// A zero count is rejected: reminders always follow at least one character token.
    pub fn apply_copies(&mut self, copies: &HashMap<String, u32>) -> Result<(), ScriptError> {
        let mut normalized = HashMap::with_capacity(copies.len());
        for (key, count) in copies {
            if *count == 0 {
                return Err(ScriptError::MalformedScript(format!(
                    "copies for {}: must be at least 1",
                    key
                )));
            }
            normalized.insert(normalize_id(key), *count);
        }
        for entry in &mut self.entries {
            if let Some(count) = normalized.get(&entry.id) {
                entry.copies = *count;
            }
        }
        Ok(())
    }

    /// Bind every entry to a role. Every unknown id is reported at once.
    pub fn resolve(&self, roles: &RoleSet) -> Result<Vec<ScriptedRole>, ScriptError> {
        let mut resolved = Vec::with_capacity(self.entries.len());
        let mut unknown = Vec::new();
        for entry in &self.entries {
            match roles.get(&entry.id) {
                Some(role) => resolved.push(ScriptedRole {
                    role: Arc::clone(role),
                    copies: entry.copies,
                    reminder_count: entry
                        .reminders
                        .map(|r| r as usize)
                        .unwrap_or_else(|| role.reminder_count()),
                }),
                None => unknown.push(entry.id.clone()),
            }
        }
        if !unknown.is_empty() {
            return Err(ScriptError::UnknownRoles(unknown));
        }
        Ok(resolved)
    }
}
