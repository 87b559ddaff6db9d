//! File-based inputs: per-player stats documents and the bulk identity cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use mcstats_core::{clamp_name, PlayerId, StatSections, StatsDocument};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mcstats-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("stats directory not found: {0}")]
    MissingDirectory(PathBuf),
    #[error("file name is not a player uuid: {0}")]
    InvalidFileName(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

impl SourceError {
    /// Per-file problems that should be skipped rather than abort a pass.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            Self::InvalidFileName(_) | Self::Malformed { .. } | Self::Io { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Keys ending in one of these suffixes are dropped before hashing.
    pub strip_key_suffixes: Vec<String>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            strip_key_suffixes: vec!["_wall_banner".to_string()],
        }
    }
}

/// One parsed `<uuid>.json` stats file.
#[derive(Debug, Clone)]
pub struct RawStatsFile {
    pub player: PlayerId,
    pub path: PathBuf,
    pub document: StatsDocument,
}

/// A directory holding one stats document per player.
#[derive(Debug, Clone)]
pub struct StatsDirectory {
    root: PathBuf,
    options: ReaderOptions,
}

impl StatsDirectory {
    pub fn open(root: impl Into<PathBuf>, options: ReaderOptions) -> Result<Self, SourceError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SourceError::MissingDirectory(root));
        }
        Ok(Self { root, options })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists `*.json` files (sorted by name) and returns an iterator that reads
    /// and parses them one at a time.
    pub fn documents(&self) -> Result<StatsDocuments, SourceError> {
        let entries = fs::read_dir(&self.root).map_err(|source| SourceError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut paths = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect::<Vec<_>>();
        paths.sort();
        debug!(root = %self.root.display(), files = paths.len(), "listed stats files");
        Ok(StatsDocuments {
            paths: paths.into_iter(),
            options: self.options.clone(),
        })
    }
}

pub struct StatsDocuments {
    paths: std::vec::IntoIter<PathBuf>,
    options: ReaderOptions,
}

impl Iterator for StatsDocuments {
    type Item = Result<RawStatsFile, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        Some(read_stats_file(path, &self.options))
    }
}

fn read_stats_file(path: PathBuf, options: &ReaderOptions) -> Result<RawStatsFile, SourceError> {
    let player = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(PlayerId::parse)
        .ok_or_else(|| SourceError::InvalidFileName(path.clone()))?;
    let bytes = fs::read(&path).map_err(|source| SourceError::Io {
        path: path.clone(),
        source,
    })?;
    let document = parse_stats_document(&bytes, options).map_err(|message| {
        SourceError::Malformed {
            path: path.clone(),
            message,
        }
    })?;
    Ok(RawStatsFile {
        player,
        path,
        document,
    })
}

/// Accepts either `{"stats": {...}, "DataVersion": n}` or a bare section map.
/// Non-object sections and non-integer counters are ignored.
pub fn parse_stats_document(bytes: &[u8], options: &ReaderOptions) -> Result<StatsDocument, String> {
    let text = String::from_utf8_lossy(bytes);
    let root: JsonValue = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    let root = root
        .as_object()
        .ok_or_else(|| "top-level value is not an object".to_string())?;
    let sections = match root.get("stats").and_then(JsonValue::as_object) {
        Some(stats) => stats,
        None => root,
    };

    let mut out = StatSections::new();
    for (section, keys) in sections {
        let Some(keys) = keys.as_object() else {
            continue;
        };
        let entry = out.entry(section.clone()).or_default();
        for (key, value) in keys {
            if options
                .strip_key_suffixes
                .iter()
                .any(|suffix| key.ends_with(suffix.as_str()))
            {
                continue;
            }
            if let Some(counter) = json_counter(value) {
                entry.insert(key.clone(), counter);
            }
        }
    }
    Ok(StatsDocument::new(out))
}

/// Integer counters only; values past `i64::MAX` saturate.
fn json_counter(value: &JsonValue) -> Option<i64> {
    match value.as_i64() {
        Some(v) => Some(v),
        None => value.as_u64().map(|_| i64::MAX),
    }
}

#[derive(Debug, Deserialize)]
struct CacheEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
}

/// Bulk identity → name mapping, the first choice when naming a player.
#[derive(Debug, Clone, Default)]
pub struct IdentityCache {
    names: HashMap<PlayerId, String>,
}

impl IdentityCache {
    /// A missing file yields an empty cache; an unreadable or malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        if !path.is_file() {
            warn!(path = %path.display(), "identity cache not found; continuing without it");
            return Ok(Self::default());
        }
        let bytes = fs::read(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&bytes).map_err(|message| SourceError::Malformed {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, String> {
        let text = String::from_utf8_lossy(bytes);
        let value: JsonValue = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        let mut names = HashMap::new();
        let JsonValue::Array(items) = value else {
            return Ok(Self { names });
        };
        for item in items {
            let Ok(entry) = serde_json::from_value::<CacheEntry>(item) else {
                continue;
            };
            let (Some(name), Some(uuid)) = (entry.name, entry.uuid) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            if let Some(player) = PlayerId::parse(&uuid) {
                names.insert(player, clamp_name(&name));
            }
        }
        Ok(Self { names })
    }

    pub fn name_for(&self, player: &PlayerId) -> Option<&str> {
        self.names.get(player).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
