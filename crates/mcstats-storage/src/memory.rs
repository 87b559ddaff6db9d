//! In-process store with the same semantics as the PostgreSQL store.
//!
//! Handles created with [`MemoryStore::new_session`] share state but act as
//! separate sessions for locking, which is how concurrent importers are modelled.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcstats_core::{
    clamp_name, Award, KnownName, MetricDef, MetricRule, MetricSource, MetricValue, NameSource,
    PlayerId, PlayerProfile, Run, RunStatus,
};
use tokio::time::Instant;

use crate::{
    CandidateQuery, ChangedBatch, CleanupCounts, NameCandidate, StatsStore, StoreError,
    LOCK_POLL_INTERVAL,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Operations that can be made to fail once, for exercising failure paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    UpsertProfiles,
    WriteChanged,
    Cleanup,
    ReplaceAwards,
    RecordName,
}

impl MemoryOp {
    fn label(&self) -> &'static str {
        match self {
            Self::UpsertProfiles => "upsert_profiles",
            Self::WriteChanged => "write_changed",
            Self::Cleanup => "cleanup_unseen",
            Self::ReplaceAwards => "replace_awards",
            Self::RecordName => "record_resolved_name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub gzip: Vec<u8>,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub runs: BTreeMap<i64, Run>,
    pub active_run_id: Option<i64>,
    pub metric_defs: BTreeMap<String, MetricDef>,
    pub metric_sources: Vec<MetricSource>,
    pub profiles: BTreeMap<(i64, PlayerId), PlayerProfile>,
    pub payloads: BTreeMap<(i64, PlayerId), StoredPayload>,
    pub metric_values: BTreeMap<(i64, String, PlayerId), i64>,
    pub awards: Vec<(i64, Award)>,
    pub seen: BTreeSet<(i64, PlayerId)>,
    /// Number of mutating calls that reached the store.
    pub mutations: usize,
    /// Payload rows written by changed-batch flushes.
    pub payload_writes: usize,
    locks: HashMap<String, u64>,
    fail_once: HashSet<MemoryOp>,
}

impl MemoryState {
    pub fn profiles_for(&self, run_id: i64) -> Vec<&PlayerProfile> {
        self.profiles
            .iter()
            .filter(|((run, _), _)| *run == run_id)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn metric_value(&self, run_id: i64, metric_id: &str, player: PlayerId) -> Option<i64> {
        self.metric_values
            .get(&(run_id, metric_id.to_string(), player))
            .copied()
    }

    /// Whether any per-run table still references the player.
    pub fn has_rows_for(&self, run_id: i64, player: PlayerId) -> bool {
        self.profiles.contains_key(&(run_id, player))
            || self.payloads.contains_key(&(run_id, player))
            || self
                .metric_values
                .keys()
                .any(|(run, _, p)| *run == run_id && *p == player)
            || self
                .awards
                .iter()
                .any(|(run, a)| *run == run_id && a.player == player)
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    session: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Another handle on the same data with its own lock session.
    pub fn new_session(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> MemoryState {
        self.guard().clone()
    }

    /// The next call of `op` returns an error instead of mutating anything.
    pub fn fail_once(&self, op: MemoryOp) {
        self.guard().fail_once.insert(op);
    }

    fn guard(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate(&self, op: Option<MemoryOp>) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.guard();
        if let Some(op) = op {
            if state.fail_once.remove(&op) {
                return Err(StoreError::Injected(op.label()));
            }
        }
        state.mutations += 1;
        Ok(state)
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn try_acquire_lock(&self, name: &str, timeout: Duration) -> Result<bool, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.guard();
                match state.locks.get(name) {
                    Some(holder) if *holder != self.session => {}
                    _ => {
                        state.locks.insert(name.to_string(), self.session);
                        return Ok(true);
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn release_lock(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.guard();
        if state.locks.get(name) == Some(&self.session) {
            state.locks.remove(name);
        }
        Ok(())
    }

    async fn active_run(&self) -> Result<Option<Run>, StoreError> {
        let state = self.guard();
        Ok(state
            .active_run_id
            .and_then(|id| state.runs.get(&id))
            .cloned())
    }

    async fn latest_run(&self) -> Result<Option<Run>, StoreError> {
        Ok(self.guard().runs.values().next_back().cloned())
    }

    async fn run(&self, run_id: i64) -> Result<Option<Run>, StoreError> {
        Ok(self.guard().runs.get(&run_id).cloned())
    }

    async fn create_run(&self, status: RunStatus, at: DateTime<Utc>) -> Result<Run, StoreError> {
        let mut state = self.mutate(None)?;
        let id = state.runs.keys().next_back().copied().unwrap_or(0) + 1;
        let run = Run {
            id,
            generated_at: at,
            status,
            note: None,
        };
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn set_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        note: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.mutate(None)?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        run.status = status;
        run.note = note.map(str::to_string);
        Ok(())
    }

    async fn activate_run(&self, run_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.mutate(None)?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        run.status = RunStatus::Active;
        run.generated_at = at;
        run.note = None;
        state.active_run_id = Some(run_id);
        Ok(())
    }

    async fn enabled_metric_rules(&self) -> Result<Vec<MetricRule>, StoreError> {
        let state = self.guard();
        let mut defs: Vec<&MetricDef> = state.metric_defs.values().filter(|d| d.enabled).collect();
        defs.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.id.cmp(&b.id)));
        Ok(defs
            .into_iter()
            .filter_map(|def| {
                let mut sources: Vec<MetricSource> = state
                    .metric_sources
                    .iter()
                    .filter(|s| s.metric_id == def.id)
                    .cloned()
                    .collect();
                if sources.is_empty() {
                    return None;
                }
                sources.sort_by(|a, b| (&a.section, &a.key).cmp(&(&b.section, &b.key)));
                Some(MetricRule {
                    metric_id: def.id.clone(),
                    sort_order: def.sort_order,
                    sources,
                })
            })
            .collect())
    }

    async fn ensure_metric_def(&self, def: &MetricDef) -> Result<bool, StoreError> {
        let mut state = self.mutate(None)?;
        if state.metric_defs.contains_key(&def.id) {
            return Ok(false);
        }
        state.metric_defs.insert(def.id.clone(), def.clone());
        Ok(true)
    }

    async fn seed_metric(&self, def: &MetricDef, sources: &[MetricSource]) -> Result<(), StoreError> {
        let mut state = self.mutate(None)?;
        state.metric_defs.insert(def.id.clone(), def.clone());
        state.metric_sources.retain(|s| s.metric_id != def.id);
        state
            .metric_sources
            .extend(sources.iter().cloned().map(|mut s| {
                s.metric_id = def.id.clone();
                s
            }));
        Ok(())
    }

    async fn stored_hashes(&self, run_id: i64) -> Result<HashMap<PlayerId, String>, StoreError> {
        Ok(self
            .guard()
            .payloads
            .iter()
            .filter(|((run, _), _)| *run == run_id)
            .map(|((_, player), payload)| (*player, payload.content_hash.clone()))
            .collect())
    }

    async fn known_names(&self, run_id: i64) -> Result<HashMap<PlayerId, KnownName>, StoreError> {
        Ok(self
            .guard()
            .profiles
            .iter()
            .filter(|((run, _), p)| *run == run_id && !p.name.is_empty())
            .map(|((_, player), p)| {
                (
                    *player,
                    KnownName {
                        name: p.name.clone(),
                        source: p.name_source,
                        checked_at: p.name_checked_at,
                    },
                )
            })
            .collect())
    }

    async fn reset_seen(&self, run_id: i64) -> Result<(), StoreError> {
        let mut state = self.mutate(None)?;
        state.seen.retain(|(run, _)| *run != run_id);
        Ok(())
    }

    async fn mark_seen(&self, run_id: i64, players: &[PlayerId]) -> Result<(), StoreError> {
        let mut state = self.mutate(None)?;
        state.seen.extend(players.iter().map(|p| (run_id, *p)));
        Ok(())
    }

    async fn upsert_profiles(&self, run_id: i64, profiles: &[PlayerProfile]) -> Result<(), StoreError> {
        let mut state = self.mutate(Some(MemoryOp::UpsertProfiles))?;
        for profile in profiles {
            state
                .profiles
                .insert((run_id, profile.player), profile.clone());
        }
        Ok(())
    }

    async fn write_changed(
        &self,
        run_id: i64,
        batch: &ChangedBatch,
        keep_metric: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.mutate(Some(MemoryOp::WriteChanged))?;
        let players: HashSet<PlayerId> = batch.players().into_iter().collect();
        state.metric_values.retain(|(run, metric, player), _| {
            !(*run == run_id && players.contains(player) && metric != keep_metric)
        });
        for payload in &batch.payloads {
            state.payloads.insert(
                (run_id, payload.player),
                StoredPayload {
                    gzip: payload.gzip.clone(),
                    content_hash: payload.content_hash.clone(),
                    updated_at: at,
                },
            );
        }
        state.payload_writes += batch.payloads.len();
        for value in &batch.metric_values {
            state
                .metric_values
                .insert((run_id, value.metric_id.clone(), value.player), value.value);
        }
        Ok(())
    }

    async fn cleanup_unseen(&self, run_id: i64) -> Result<CleanupCounts, StoreError> {
        let mut guard = self.mutate(Some(MemoryOp::Cleanup))?;
        let state = &mut *guard;
        let seen: HashSet<PlayerId> = state
            .seen
            .iter()
            .filter(|(run, _)| *run == run_id)
            .map(|(_, p)| *p)
            .collect();
        let keep = |run: i64, player: &PlayerId| run != run_id || seen.contains(player);

        let mut counts = CleanupCounts::default();
        let before = state.profiles.len();
        state.profiles.retain(|(run, player), _| keep(*run, player));
        counts.profiles = (before - state.profiles.len()) as u64;
        let before = state.payloads.len();
        state.payloads.retain(|(run, player), _| keep(*run, player));
        counts.payloads = (before - state.payloads.len()) as u64;
        let before = state.metric_values.len();
        state
            .metric_values
            .retain(|(run, _, player), _| keep(*run, player));
        counts.metric_values = (before - state.metric_values.len()) as u64;
        let before = state.awards.len();
        state.awards.retain(|(run, award)| keep(*run, &award.player));
        counts.awards = (before - state.awards.len()) as u64;

        state.seen.retain(|(run, _)| *run != run_id);
        Ok(counts)
    }

    async fn metric_values(
        &self,
        run_id: i64,
        metric_id: &str,
    ) -> Result<Vec<(PlayerId, i64)>, StoreError> {
        let mut values: Vec<(PlayerId, i64)> = self
            .guard()
            .metric_values
            .iter()
            .filter(|((run, metric, _), value)| *run == run_id && metric == metric_id && **value > 0)
            .map(|((_, _, player), value)| (*player, *value))
            .collect();
        values.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(values)
    }

    async fn replace_awards(
        &self,
        run_id: i64,
        points_metric: &str,
        totals: &[MetricValue],
        awards: &[Award],
    ) -> Result<(), StoreError> {
        let mut state = self.mutate(Some(MemoryOp::ReplaceAwards))?;
        state
            .metric_values
            .retain(|(run, metric, _), _| !(*run == run_id && metric == points_metric));
        state.awards.retain(|(run, _)| *run != run_id);
        state
            .awards
            .extend(awards.iter().cloned().map(|a| (run_id, a)));
        for total in totals.iter().filter(|t| t.value > 0) {
            state
                .metric_values
                .insert((run_id, points_metric.to_string(), total.player), total.value);
        }
        Ok(())
    }

    async fn name_candidates(
        &self,
        run_id: i64,
        query: CandidateQuery,
    ) -> Result<Vec<NameCandidate>, StoreError> {
        let state = self.guard();
        let mut candidates: Vec<NameCandidate> = state
            .profiles
            .iter()
            .filter(|((run, _), _)| *run == run_id)
            .map(|(_, p)| p)
            .filter(|p| {
                !p.name_source.is_authoritative()
                    || p.name_checked_at.map_or(true, |at| at < query.stale_before)
            })
            .map(|p| NameCandidate {
                player: p.player,
                name: p.name.clone(),
                name_source: p.name_source,
                name_checked_at: p.name_checked_at,
            })
            .collect();
        // Placeholders first, then never-checked, then oldest check, then uuid.
        candidates.sort_by(|a, b| {
            (!a.name_source.is_placeholder(), a.name_checked_at, a.player).cmp(&(
                !b.name_source.is_placeholder(),
                b.name_checked_at,
                b.player,
            ))
        });
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    async fn record_resolved_name(
        &self,
        run_id: i64,
        player: PlayerId,
        name: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.mutate(Some(MemoryOp::RecordName))?;
        let Some(profile) = state.profiles.get_mut(&(run_id, player)) else {
            return Ok(false);
        };
        profile.name = clamp_name(name);
        profile.name_lc = clamp_name(&profile.name.to_lowercase());
        profile.name_source = NameSource::Mojang;
        profile.name_checked_at = Some(checked_at);
        Ok(true)
    }
}
