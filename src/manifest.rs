//! Run Manifests - SHA-256 Over Everything Written
//!
//! A run writes `manifest.json` next to its outputs so a set of sheets can be
//! traced back to the engine version and configuration that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::export::ExportError;
use crate::ENGINE_VERSION;

pub const MANIFEST_FILE: &str = "manifest.json";

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Compact JSON with object keys in lexical order at every depth.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&sorted(value))
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

pub fn config_digest<T: Serialize>(config: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(canonical_json(config)?.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Token,
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the output directory, `/`-separated.
    pub path: String,
    pub kind: OutputKind,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub engine_version: String,
    pub config_digest: String,
    pub files: Vec<ManifestEntry>,
}

impl RunManifest {
    pub fn new<T: Serialize>(config: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
            config_digest: config_digest(config)?,
            files: Vec::new(),
        })
    }

    pub fn record(&mut self, root: &Path, path: &Path, kind: OutputKind, data: &[u8]) {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        self.files.push(ManifestEntry {
            path,
            kind,
            sha256: sha256_hex(data),
            bytes: data.len() as u64,
        });
    }

    /// Digest of the outputs alone. Run id and timestamp are excluded so two
    /// runs over the same inputs agree.
    pub fn content_digest(&self) -> Result<String, serde_json::Error> {
        let mut files = self.files.clone();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let content = serde_json::json!({
            "engineVersion": self.engine_version,
            "configDigest": self.config_digest,
            "files": files,
        });
        Ok(sha256_hex(canonical_json(&content)?.as_bytes()))
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        let path = dir.join(MANIFEST_FILE);
        let text = serde_json::to_string_pretty(self)?;
        fs::write(&path, text).map_err(|source| ExportError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
