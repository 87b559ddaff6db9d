//! Relational store contract for the importer and name resolver, with a
//! PostgreSQL implementation and an in-process implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcstats_core::{
    Award, KnownName, MetricDef, MetricRule, MetricSource, MetricValue, NameSource, PlayerId,
    PlayerProfile, Run, RunStatus,
};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryOp, MemoryState, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "mcstats-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("run {0} does not exist")]
    UnknownRun(i64),
    #[error("invalid stored value: {0}")]
    Invalid(String),
    #[error("injected failure during {0}")]
    Injected(&'static str),
}

/// Compressed canonical document plus its content hash, written together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsPayload {
    pub player: PlayerId,
    pub gzip: Vec<u8>,
    pub content_hash: String,
}

/// One flush unit for identities whose document changed.
#[derive(Debug, Clone, Default)]
pub struct ChangedBatch {
    pub payloads: Vec<StatsPayload>,
    pub metric_values: Vec<MetricValue>,
}

impl ChangedBatch {
    pub fn players(&self) -> Vec<PlayerId> {
        self.payloads.iter().map(|p| p.player).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    pub profiles: u64,
    pub payloads: u64,
    pub metric_values: u64,
    pub awards: u64,
}

/// Selection criteria for profiles whose display name should be re-checked.
#[derive(Debug, Clone, Copy)]
pub struct CandidateQuery {
    pub limit: usize,
    pub stale_before: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCandidate {
    pub player: PlayerId,
    pub name: String,
    pub name_source: NameSource,
    pub name_checked_at: Option<DateTime<Utc>>,
}

/// Everything the import engine and the name resolver need from persistent state.
///
/// Every mutating method is its own atomic unit; no transaction spans calls.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Polls for the named cross-process lock until `timeout` elapses.
    async fn try_acquire_lock(&self, name: &str, timeout: Duration) -> Result<bool, StoreError>;
    async fn release_lock(&self, name: &str) -> Result<(), StoreError>;

    async fn active_run(&self) -> Result<Option<Run>, StoreError>;
    async fn latest_run(&self) -> Result<Option<Run>, StoreError>;
    async fn run(&self, run_id: i64) -> Result<Option<Run>, StoreError>;
    async fn create_run(&self, status: RunStatus, at: DateTime<Utc>) -> Result<Run, StoreError>;
    async fn set_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        note: Option<&str>,
    ) -> Result<(), StoreError>;
    /// Marks the run `active` and moves the singleton pointer in one transaction.
    async fn activate_run(&self, run_id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Enabled metrics that have at least one source, ordered by sort order then id.
    async fn enabled_metric_rules(&self) -> Result<Vec<MetricRule>, StoreError>;
    /// Inserts the definition only if the id is unknown. Returns whether a row was added.
    async fn ensure_metric_def(&self, def: &MetricDef) -> Result<bool, StoreError>;
    /// Upserts a definition and replaces its sources.
    async fn seed_metric(&self, def: &MetricDef, sources: &[MetricSource]) -> Result<(), StoreError>;

    async fn stored_hashes(&self, run_id: i64) -> Result<HashMap<PlayerId, String>, StoreError>;
    async fn known_names(&self, run_id: i64) -> Result<HashMap<PlayerId, KnownName>, StoreError>;

    async fn reset_seen(&self, run_id: i64) -> Result<(), StoreError>;
    async fn mark_seen(&self, run_id: i64, players: &[PlayerId]) -> Result<(), StoreError>;
    async fn upsert_profiles(&self, run_id: i64, profiles: &[PlayerProfile]) -> Result<(), StoreError>;
    /// Replaces payloads and metric rows for the batch's players. Metric rows of
    /// `keep_metric` are left alone.
    async fn write_changed(
        &self,
        run_id: i64,
        batch: &ChangedBatch,
        keep_metric: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Deletes every per-run row of identities without a seen marker, then clears the markers.
    async fn cleanup_unseen(&self, run_id: i64) -> Result<CleanupCounts, StoreError>;

    /// Positive values only, ordered by value descending then player ascending.
    async fn metric_values(
        &self,
        run_id: i64,
        metric_id: &str,
    ) -> Result<Vec<(PlayerId, i64)>, StoreError>;
    /// Replaces the points metric rows and all award rows of the run.
    async fn replace_awards(
        &self,
        run_id: i64,
        points_metric: &str,
        totals: &[MetricValue],
        awards: &[Award],
    ) -> Result<(), StoreError>;

    async fn name_candidates(
        &self,
        run_id: i64,
        query: CandidateQuery,
    ) -> Result<Vec<NameCandidate>, StoreError>;
    /// Returns false when the profile no longer exists.
    async fn record_resolved_name(
        &self,
        run_id: i64,
        player: PlayerId,
        name: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Lock acquisition re-tries at this interval until the caller's timeout.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);
