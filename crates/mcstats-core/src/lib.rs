//! Core domain model for the mcstats importer and name resolver.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mcstats-core";

/// Display names are capped at the game's username length.
pub const MAX_NAME_LEN: usize = 16;

/// Stable player identity, parsed from a stats file stem or an identity cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Accepts both dashed and undashed UUID text.
    pub fn parse(input: &str) -> Option<Self> {
        Uuid::parse_str(input.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Undashed lower-case hex, the form the identity service expects.
    pub fn simple_hex(&self) -> String {
        self.0.simple().to_string()
    }

    /// Deterministic placeholder name used when nothing better is known.
    pub fn fallback_name(&self) -> String {
        self.simple_hex()[..12].to_string()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

pub fn clamp_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Loading,
    Active,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loading" => Ok(Self::Loading),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// One snapshot generation. Mutated in place across scheduled imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub generated_at: DateTime<Utc>,
    pub status: RunStatus,
    pub note: Option<String>,
}

/// Provenance of a profile's display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameSource {
    Usercache,
    Mojang,
    Unknown,
    Fallback,
}

impl NameSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usercache => "usercache",
            Self::Mojang => "mojang",
            Self::Unknown => "unknown",
            Self::Fallback => "fallback",
        }
    }

    /// Lenient parse for values read back from the store.
    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            Some("usercache") => Self::Usercache,
            Some("mojang") => Self::Mojang,
            Some("fallback") => Self::Fallback,
            _ => Self::Unknown,
        }
    }

    /// Sources the resolver does not need to re-check until the freshness window expires.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Usercache | Self::Mojang)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Fallback | Self::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player: PlayerId,
    pub name: String,
    pub name_lc: String,
    pub name_source: NameSource,
    pub name_checked_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl PlayerProfile {
    pub fn new(
        player: PlayerId,
        name: &str,
        name_source: NameSource,
        name_checked_at: Option<DateTime<Utc>>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        let name = clamp_name(name);
        Self {
            player,
            name_lc: clamp_name(&name.to_lowercase()),
            name,
            name_source,
            name_checked_at,
            last_seen,
        }
    }
}

/// Name metadata already persisted for a player in the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownName {
    pub name: String,
    pub source: NameSource,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Static metric configuration. `divisor`/`decimals` only matter for presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDef {
    pub id: String,
    pub label: String,
    pub category: String,
    pub unit: String,
    #[serde(default = "default_divisor")]
    pub divisor: i64,
    #[serde(default)]
    pub decimals: i32,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_divisor() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

/// One weighted `(section, key)` lookup feeding a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSource {
    pub metric_id: String,
    pub section: String,
    pub key: String,
    pub weight: i64,
}

/// An enabled metric together with all of its weighted lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRule {
    pub metric_id: String,
    pub sort_order: i32,
    pub sources: Vec<MetricSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricValue {
    pub metric_id: String,
    pub player: PlayerId,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub metric_id: String,
    pub place: u32,
    pub player: PlayerId,
    pub value: i64,
    pub points: i64,
}

pub type StatSections = BTreeMap<String, BTreeMap<String, i64>>;

/// Normalized per-player statistics: `section -> key -> counter`.
///
/// Sections and keys are kept in sorted maps so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsDocument {
    pub sections: StatSections,
}

impl StatsDocument {
    pub fn new(sections: StatSections) -> Self {
        Self { sections }
    }

    /// Missing sections or keys read as zero.
    pub fn counter(&self, section: &str, key: &str) -> i64 {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// Compact JSON with sorted keys; the input of the content hash.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // A map of strings to integers always serializes.
        serde_json::to_vec(&self.sections).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_id_accepts_dashed_and_undashed() {
        let dashed = PlayerId::parse("069a79f4-44e9-4726-a5be-fca90e38aaf5").expect("dashed");
        let simple = PlayerId::parse("069a79f444e94726a5befca90e38aaf5").expect("simple");
        assert_eq!(dashed, simple);
        assert_eq!(dashed.fallback_name(), "069a79f444e9");
        assert!(PlayerId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn canonical_bytes_are_sorted_and_compact() {
        let mut sections = StatSections::new();
        sections
            .entry("minecraft:mined".into())
            .or_default()
            .insert("minecraft:stone".into(), 12);
        sections
            .entry("minecraft:custom".into())
            .or_default()
            .insert("minecraft:play_time".into(), 80000);
        let doc = StatsDocument::new(sections);
        assert_eq!(
            String::from_utf8(doc.canonical_bytes()).expect("utf8"),
            r#"{"minecraft:custom":{"minecraft:play_time":80000},"minecraft:mined":{"minecraft:stone":12}}"#
        );
        assert_eq!(doc.counter("minecraft:mined", "minecraft:dirt"), 0);
    }

    #[test]
    fn names_are_clamped_and_lowercased() {
        let profile = PlayerProfile::new(
            PlayerId(Uuid::nil()),
            "AVeryLongPlayerNameIndeed",
            NameSource::Usercache,
            None,
            Utc::now(),
        );
        assert_eq!(profile.name, "AVeryLongPlayerN");
        assert_eq!(profile.name_lc, "averylongplayern");
    }
}
