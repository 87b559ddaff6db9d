//! Import engine: streams per-player stats documents into the current run,
//! skipping unchanged documents by content hash, then cleans up departed
//! players, recomputes the points leaderboard and promotes the run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;

use chrono::{DateTime, Utc};
use mcstats_core::{KnownName, NameSource, PlayerId, PlayerProfile, Run, RunStatus};
use mcstats_source::{IdentityCache, SourceError, StatsDirectory};
use mcstats_storage::{CleanupCounts, StatsPayload, StatsStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod config;
pub mod hashing;
pub mod metrics;
pub mod ranking;
pub mod seed;
pub mod writer;

pub use config::{FlushThresholds, ImportConfig};
pub use metrics::MetricEvaluator;
pub use ranking::{points_metric_def, rank_metric, Standings};
pub use writer::{BatchWriter, FlushStats};

pub const CRATE_NAME: &str = "mcstats-import";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no enabled metrics with sources; seed metric_def and metric_source first")]
    NoEnabledMetrics,
    #[error("import lock {0:?} is held by another process")]
    LockHeld(String),
    #[error("import interrupted")]
    Interrupted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("compressing stats payload for {player}: {source}")]
    Compress {
        player: PlayerId,
        #[source]
        source: std::io::Error,
    },
}

impl ImportError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Source(SourceError::MissingDirectory(_)) => 2,
            Self::NoEnabledMetrics => 3,
            Self::LockHeld(_) => 10,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Run that was read (and, unless dry, written).
    pub run_id: Option<i64>,
    pub dry_run: bool,
    pub files: usize,
    pub parsed: usize,
    pub invalid_names: usize,
    pub malformed: usize,
    /// Second and later files naming an already handled player.
    pub duplicates: usize,
    pub excluded: usize,
    pub below_threshold: usize,
    pub kept: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub flush: FlushStats,
    pub cleanup: CleanupCounts,
    pub awards: usize,
    pub point_holders: usize,
}

pub struct ImportEngine<S> {
    store: S,
    config: ImportConfig,
}

impl<S: StatsStore> ImportEngine<S> {
    pub fn new(store: S, config: ImportConfig) -> Self {
        Self { store, config }
    }

    /// Runs one pass, treating Ctrl-C like any other failure.
    pub async fn run(&self) -> Result<ImportSummary, ImportError> {
        self.run_until(interrupt_signal()).await
    }

    /// Runs one pass that is abandoned as [`ImportError::Interrupted`] once `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<ImportSummary, ImportError>
    where
        F: Future<Output = ()>,
    {
        let span = info_span!("import", dry_run = self.config.dry_run);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner<F>(&self, shutdown: F) -> Result<ImportSummary, ImportError>
    where
        F: Future<Output = ()>,
    {
        let directory = StatsDirectory::open(self.config.stats_dir.clone(), self.config.reader.clone())
            .map_err(|err| ImportError::Config(err.to_string()))?;
        let names = match IdentityCache::load(&self.config.usercache_path) {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "identity cache unusable; continuing without it");
                IdentityCache::default()
            }
        };
        info!(
            stats_dir = %directory.root().display(),
            cached_names = names.len(),
            excluded = self.config.exclude.len(),
            "starting import"
        );

        let lock = self.config.lock_name.as_str();
        if !self
            .store
            .try_acquire_lock(lock, self.config.lock_timeout)
            .await?
        {
            warn!(
                lock,
                timeout_secs = self.config.lock_timeout.as_secs(),
                "import lock is held; another import is probably running"
            );
            return Err(ImportError::LockHeld(lock.to_string()));
        }

        let result = self.locked_pass(&directory, &names, shutdown).await;
        if let Err(err) = self.store.release_lock(lock).await {
            warn!(lock, error = %err, "releasing import lock failed");
        }
        result
    }

    async fn locked_pass<F>(
        &self,
        directory: &StatsDirectory,
        names: &IdentityCache,
        shutdown: F,
    ) -> Result<ImportSummary, ImportError>
    where
        F: Future<Output = ()>,
    {
        let evaluator = MetricEvaluator::new(
            self.store.enabled_metric_rules().await?,
            &self.config.points_metric,
        );
        if evaluator.is_empty() {
            error!("no enabled metrics found; seed metric_def and metric_source first");
            return Err(ImportError::NoEnabledMetrics);
        }
        info!(metrics = evaluator.rules().len(), "loaded metric rules");

        let run = self.prepare_run(Utc::now()).await?;
        let source_run = run.as_ref().map(|run| run.id);
        let target = if self.config.dry_run { None } else { source_run };
        if target.is_none() {
            info!(run_id = ?source_run, "dry run; nothing will be written");
        }

        let outcome = tokio::select! {
            biased;
            _ = shutdown => Err(ImportError::Interrupted),
            result = self.pass(source_run, target, directory, names, &evaluator) => result,
        };

        if let (Some(run_id), Err(err)) = (target, &outcome) {
            error!(run_id, error = %err, "import pass failed");
            let note = err.to_string();
            if let Err(mark) = self
                .store
                .set_run_status(run_id, RunStatus::Failed, Some(&note))
                .await
            {
                error!(run_id, error = %mark, "could not mark run as failed");
            }
        }
        outcome
    }

    /// Reuses the active run, else the latest run, else creates one. Dry runs only look.
    async fn prepare_run(&self, now: DateTime<Utc>) -> Result<Option<Run>, ImportError> {
        let existing = match self.store.active_run().await? {
            Some(run) => Some(run),
            None => self.store.latest_run().await?,
        };
        if self.config.dry_run {
            return Ok(existing);
        }
        let run = match existing {
            Some(run) => {
                self.store
                    .set_run_status(run.id, RunStatus::Loading, None)
                    .await?;
                run
            }
            None => self.store.create_run(RunStatus::Loading, now).await?,
        };
        info!(run_id = run.id, "importing into run in place");
        Ok(Some(run))
    }

    async fn pass(
        &self,
        source_run: Option<i64>,
        target: Option<i64>,
        directory: &StatsDirectory,
        names: &IdentityCache,
        evaluator: &MetricEvaluator,
    ) -> Result<ImportSummary, ImportError> {
        let now = Utc::now();
        let mut summary = ImportSummary {
            run_id: source_run,
            dry_run: target.is_none(),
            ..ImportSummary::default()
        };

        let stored_hashes = match source_run {
            Some(run_id) if !self.config.force_recompute => self.store.stored_hashes(run_id).await?,
            _ => HashMap::new(),
        };
        let known_names = match source_run {
            Some(run_id) => self.store.known_names(run_id).await?,
            None => HashMap::new(),
        };
        info!(
            hashes = stored_hashes.len(),
            profiles = known_names.len(),
            force_recompute = self.config.force_recompute,
            "loaded existing run state"
        );
        if let Some(run_id) = target {
            self.store.reset_seen(run_id).await?;
        }

        let mut writer = BatchWriter::new(
            &self.store,
            target,
            self.config.points_metric.clone(),
            self.config.flush,
        );
        let mut dry_values: BTreeMap<String, Vec<(PlayerId, i64)>> = BTreeMap::new();
        let mut handled: HashSet<PlayerId> = HashSet::new();

        for entry in directory.documents()? {
            summary.files += 1;
            let file = match entry {
                Ok(file) => file,
                Err(SourceError::InvalidFileName(path)) => {
                    summary.invalid_names += 1;
                    debug!(path = %path.display(), "skipping file without a player uuid");
                    continue;
                }
                Err(err) if err.is_per_record() => {
                    summary.malformed += 1;
                    warn!(error = %err, "skipping unreadable stats document");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            summary.parsed += 1;

            let player = file.player;
            if !handled.insert(player) {
                summary.duplicates += 1;
                warn!(%player, path = %file.path.display(), "skipping second stats document for player");
                continue;
            }
            if self.config.exclude.contains(&player) {
                summary.excluded += 1;
                continue;
            }
            let play_ticks = file
                .document
                .counter(&self.config.play_time_section, &self.config.play_time_key);
            if play_ticks < self.config.min_play_ticks {
                summary.below_threshold += 1;
                continue;
            }
            summary.kept += 1;

            writer.mark_seen(player).await?;
            writer
                .upsert_profile(profile_for(player, names, &known_names, now))
                .await?;

            let canonical = file.document.canonical_bytes();
            let hash = hashing::content_hash(&canonical);
            let changed = stored_hashes.get(&player) != Some(&hash);
            if !changed && target.is_some() {
                summary.unchanged += 1;
                continue;
            }

            let values = evaluator.evaluate(player, &file.document);
            if target.is_none() {
                for value in &values {
                    dry_values
                        .entry(value.metric_id.clone())
                        .or_default()
                        .push((player, value.value));
                }
            }
            if !changed {
                summary.unchanged += 1;
                continue;
            }

            summary.changed += 1;
            let gzip = hashing::compress_payload(&canonical)
                .map_err(|source| ImportError::Compress { player, source })?;
            writer
                .push_changed(
                    StatsPayload {
                        player,
                        gzip,
                        content_hash: hash,
                    },
                    values,
                    now,
                )
                .await?;
        }

        summary.flush = writer.finish(now).await?;
        info!(
            files = summary.files,
            kept = summary.kept,
            changed = summary.changed,
            unchanged = summary.unchanged,
            below_threshold = summary.below_threshold,
            malformed = summary.malformed,
            duplicates = summary.duplicates,
            "processed stats documents"
        );

        if let Some(run_id) = target {
            summary.cleanup = self.store.cleanup_unseen(run_id).await?;
            info!(
                run_id,
                profiles = summary.cleanup.profiles,
                payloads = summary.cleanup.payloads,
                metric_values = summary.cleanup.metric_values,
                awards = summary.cleanup.awards,
                "removed rows of players no longer present"
            );
        }

        if self.config.awards_enabled {
            let standings = self.standings(target, evaluator, &dry_values).await?;
            summary.awards = standings.awards.len();
            summary.point_holders = standings.totals.len();
            if let Some(run_id) = target {
                let def = points_metric_def(&self.config.points_metric);
                if self.store.ensure_metric_def(&def).await? {
                    info!(metric = %def.id, "created points metric definition");
                }
                self.store
                    .replace_awards(run_id, &def.id, &standings.totals, &standings.awards)
                    .await?;
            }
            info!(
                metric = %self.config.points_metric,
                points = ?self.config.award_points,
                awards = summary.awards,
                holders = summary.point_holders,
                leader = ?standings.leader().map(|t| t.player.to_string()),
                "recomputed points leaderboard"
            );
        }

        if let Some(run_id) = target {
            self.store.activate_run(run_id, Utc::now()).await?;
            info!(run_id, "import complete; run is active");
        }
        Ok(summary)
    }

    async fn standings(
        &self,
        target: Option<i64>,
        evaluator: &MetricEvaluator,
        dry_values: &BTreeMap<String, Vec<(PlayerId, i64)>>,
    ) -> Result<Standings, ImportError> {
        let mut awards = Vec::new();
        for metric_id in evaluator.metric_ids() {
            let values = match target {
                Some(run_id) => self.store.metric_values(run_id, metric_id).await?,
                None => dry_values.get(metric_id).cloned().unwrap_or_default(),
            };
            awards.extend(rank_metric(metric_id, &values, &self.config.award_points));
        }
        Ok(Standings::new(&self.config.points_metric, awards))
    }
}

/// Identity cache first, then the stored name, then a uuid-derived placeholder.
fn profile_for(
    player: PlayerId,
    names: &IdentityCache,
    known: &HashMap<PlayerId, KnownName>,
    now: DateTime<Utc>,
) -> PlayerProfile {
    if let Some(name) = names.name_for(&player).filter(|name| !name.is_empty()) {
        return PlayerProfile::new(player, name, NameSource::Usercache, Some(now), now);
    }
    if let Some(stored) = known.get(&player).filter(|stored| !stored.name.is_empty()) {
        return PlayerProfile::new(player, &stored.name, stored.source, stored.checked_at, now);
    }
    PlayerProfile::new(player, &player.fallback_name(), NameSource::Fallback, None, now)
}

async fn interrupt_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("cannot listen for Ctrl-C; interruption will not be handled");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(ImportError::Config("x".into()).exit_code(), 2);
        assert_eq!(ImportError::NoEnabledMetrics.exit_code(), 3);
        assert_eq!(ImportError::LockHeld("l".into()).exit_code(), 10);
        assert_eq!(ImportError::Interrupted.exit_code(), 130);
        assert_eq!(ImportError::Store(StoreError::UnknownRun(4)).exit_code(), 1);
    }

    #[test]
    fn profile_name_priority() {
        let now = Utc::now();
        let earlier = now - Duration::days(3);
        let player = PlayerId(Uuid::from_u128(0xabcdef));
        let cache = IdentityCache::from_json(
            format!(r#"[{{"name":"Notch","uuid":"{player}"}}]"#).as_bytes(),
        )
        .expect("cache");
        let mut known = HashMap::new();
        known.insert(
            player,
            KnownName {
                name: "OldName".into(),
                source: NameSource::Mojang,
                checked_at: Some(earlier),
            },
        );

        let from_cache = profile_for(player, &cache, &known, now);
        assert_eq!(from_cache.name, "Notch");
        assert_eq!(from_cache.name_source, NameSource::Usercache);
        assert_eq!(from_cache.name_checked_at, Some(now));

        let from_store = profile_for(player, &IdentityCache::default(), &known, now);
        assert_eq!(from_store.name, "OldName");
        assert_eq!(from_store.name_source, NameSource::Mojang);
        assert_eq!(from_store.name_checked_at, Some(earlier));

        let fallback = profile_for(player, &IdentityCache::default(), &HashMap::new(), now);
        assert_eq!(fallback.name, player.fallback_name());
        assert_eq!(fallback.name_source, NameSource::Fallback);
        assert_eq!(fallback.name_checked_at, None);
    }
}
