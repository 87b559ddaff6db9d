use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use mcstats_core::PlayerId;
use mcstats_source::ReaderOptions;

use crate::ImportError;

/// Buffer sizes at which the batched writer flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushThresholds {
    pub seen: usize,
    pub profiles: usize,
    pub changed: usize,
}

impl Default for FlushThresholds {
    fn default() -> Self {
        Self {
            seen: 2000,
            profiles: 2000,
            changed: 800,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub stats_dir: PathBuf,
    pub usercache_path: PathBuf,
    pub reader: ReaderOptions,
    pub play_time_section: String,
    pub play_time_key: String,
    pub min_play_ticks: i64,
    pub exclude: HashSet<PlayerId>,
    pub dry_run: bool,
    pub force_recompute: bool,
    pub lock_name: String,
    pub lock_timeout: Duration,
    pub awards_enabled: bool,
    pub points_metric: String,
    pub award_points: Vec<i64>,
    pub flush: FlushThresholds,
}

impl ImportConfig {
    pub fn new(stats_dir: impl Into<PathBuf>) -> Self {
        Self {
            stats_dir: stats_dir.into(),
            usercache_path: PathBuf::from("usercache.json"),
            reader: ReaderOptions::default(),
            play_time_section: "minecraft:custom".to_string(),
            play_time_key: "minecraft:play_time".to_string(),
            min_play_ticks: 72_000,
            exclude: HashSet::new(),
            dry_run: false,
            force_recompute: false,
            lock_name: "mc_stats_import".to_string(),
            lock_timeout: Duration::from_secs(5),
            awards_enabled: true,
            points_metric: "king".to_string(),
            award_points: vec![5, 3, 1],
            flush: FlushThresholds::default(),
        }
    }

    pub fn from_env() -> Result<Self, ImportError> {
        let stats_dir = std::env::var("MCSTATS_STATS_DIR")
            .map(PathBuf::from)
            .map_err(|_| ImportError::Config("MCSTATS_STATS_DIR is not set".to_string()))?;
        let mut config = Self::new(stats_dir);
        if let Ok(path) = std::env::var("MCSTATS_USERCACHE") {
            config.usercache_path = PathBuf::from(path);
        }
        config.min_play_ticks = env_parse("MCSTATS_MIN_PLAY_TICKS", config.min_play_ticks)?;
        if let Ok(raw) = std::env::var("MCSTATS_EXCLUDE_UUIDS") {
            config.exclude = parse_exclude_list(&raw)?;
        }
        config.dry_run = env_bool("MCSTATS_DRY_RUN", false);
        config.force_recompute = env_bool("MCSTATS_FORCE_RECOMPUTE", false);
        config.lock_name = std::env::var("MCSTATS_LOCK_NAME").unwrap_or(config.lock_name);
        config.lock_timeout =
            Duration::from_secs(env_parse("MCSTATS_LOCK_TIMEOUT_SECS", 5u64)?);
        config.awards_enabled = env_bool("MCSTATS_AWARDS_ENABLED", true);
        config.points_metric = std::env::var("MCSTATS_POINTS_METRIC").unwrap_or(config.points_metric);
        if let Ok(raw) = std::env::var("MCSTATS_AWARD_POINTS") {
            config.award_points = parse_award_points(&raw)?;
        }
        config.flush = FlushThresholds {
            seen: env_parse("MCSTATS_FLUSH_SEEN", config.flush.seen)?.max(1),
            profiles: env_parse("MCSTATS_FLUSH_PROFILES", config.flush.profiles)?.max(1),
            changed: env_parse("MCSTATS_FLUSH_CHANGED", config.flush.changed)?.max(1),
        };
        Ok(config)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ImportError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ImportError::Config(format!("{key} has an invalid value: {raw:?}"))),
        _ => Ok(default),
    }
}

/// Comma-separated points per place, e.g. `5,3,1`. Empty input keeps the default.
pub fn parse_award_points(raw: &str) -> Result<Vec<i64>, ImportError> {
    let points = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map_err(|_| ImportError::Config(format!("invalid award points entry {part:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if points.is_empty() {
        return Ok(vec![5, 3, 1]);
    }
    Ok(points)
}

pub fn parse_exclude_list(raw: &str) -> Result<HashSet<PlayerId>, ImportError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            PlayerId::parse(part)
                .ok_or_else(|| ImportError::Config(format!("invalid excluded uuid {part:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn award_points_parse_and_default() {
        assert_eq!(parse_award_points("10, 6,3,1").expect("points"), vec![10, 6, 3, 1]);
        assert_eq!(parse_award_points(" ").expect("points"), vec![5, 3, 1]);
        assert!(parse_award_points("5,three").is_err());
    }

    #[test]
    fn exclude_list_accepts_both_uuid_forms() {
        let set = parse_exclude_list(
            "069a79f4-44e9-4726-a5be-fca90e38aaf5, 069a79f444e94726a5befca90e38aaf5,,",
        )
        .expect("list");
        assert_eq!(set.len(), 1);
        assert!(parse_exclude_list("nope").is_err());
    }
}
