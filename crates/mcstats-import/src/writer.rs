use chrono::{DateTime, Utc};
use mcstats_core::{MetricValue, PlayerId, PlayerProfile};
use mcstats_storage::{ChangedBatch, StatsPayload, StatsStore, StoreError};
use tracing::debug;

use crate::config::FlushThresholds;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub seen_flushes: usize,
    pub profile_flushes: usize,
    pub changed_flushes: usize,
    pub seen_rows: usize,
    pub profile_rows: usize,
    pub changed_rows: usize,
}

/// Buffers seen markers, profile upserts and changed payloads, flushing each
/// buffer on its own threshold. Without a target run nothing reaches the store.
pub struct BatchWriter<'a, S: StatsStore + ?Sized> {
    store: &'a S,
    target: Option<i64>,
    keep_metric: String,
    thresholds: FlushThresholds,
    seen: Vec<PlayerId>,
    profiles: Vec<PlayerProfile>,
    changed: ChangedBatch,
    stats: FlushStats,
}

impl<'a, S: StatsStore + ?Sized> BatchWriter<'a, S> {
    pub fn new(
        store: &'a S,
        target: Option<i64>,
        keep_metric: impl Into<String>,
        thresholds: FlushThresholds,
    ) -> Self {
        Self {
            store,
            target,
            keep_metric: keep_metric.into(),
            thresholds,
            seen: Vec::new(),
            profiles: Vec::new(),
            changed: ChangedBatch::default(),
            stats: FlushStats::default(),
        }
    }

    pub async fn mark_seen(&mut self, player: PlayerId) -> Result<(), StoreError> {
        self.seen.push(player);
        if self.seen.len() >= self.thresholds.seen {
            self.flush_seen().await?;
        }
        Ok(())
    }

    pub async fn upsert_profile(&mut self, profile: PlayerProfile) -> Result<(), StoreError> {
        self.profiles.push(profile);
        if self.profiles.len() >= self.thresholds.profiles {
            self.flush_profiles().await?;
        }
        Ok(())
    }

    pub async fn push_changed(
        &mut self,
        payload: StatsPayload,
        values: Vec<MetricValue>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.changed.payloads.push(payload);
        self.changed.metric_values.extend(values);
        if self.changed.len() >= self.thresholds.changed {
            self.flush_changed(at).await?;
        }
        Ok(())
    }

    /// Flushes whatever is left and returns the flush counters.
    pub async fn finish(mut self, at: DateTime<Utc>) -> Result<FlushStats, StoreError> {
        self.flush_seen().await?;
        self.flush_profiles().await?;
        self.flush_changed(at).await?;
        Ok(self.stats)
    }

    async fn flush_seen(&mut self) -> Result<(), StoreError> {
        if self.seen.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.seen);
        if let Some(run_id) = self.target {
            self.store.mark_seen(run_id, &rows).await?;
            debug!(run_id, rows = rows.len(), "flushed seen markers");
        }
        self.stats.seen_flushes += 1;
        self.stats.seen_rows += rows.len();
        Ok(())
    }

    async fn flush_profiles(&mut self) -> Result<(), StoreError> {
        if self.profiles.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.profiles);
        if let Some(run_id) = self.target {
            self.store.upsert_profiles(run_id, &rows).await?;
            debug!(run_id, rows = rows.len(), "flushed profiles");
        }
        self.stats.profile_flushes += 1;
        self.stats.profile_rows += rows.len();
        Ok(())
    }

    async fn flush_changed(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.changed.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.changed);
        if let Some(run_id) = self.target {
            self.store
                .write_changed(run_id, &batch, &self.keep_metric, at)
                .await?;
            debug!(
                run_id,
                players = batch.len(),
                metric_rows = batch.metric_values.len(),
                "flushed changed batch"
            );
        }
        self.stats.changed_flushes += 1;
        self.stats.changed_rows += batch.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mcstats_core::{NameSource, RunStatus};
    use mcstats_storage::MemoryStore;
    use uuid::Uuid;

    use super::*;

    fn thresholds() -> FlushThresholds {
        FlushThresholds {
            seen: 2,
            profiles: 3,
            changed: 1,
        }
    }

    #[tokio::test]
    async fn buffers_flush_on_their_own_thresholds() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let run = store.create_run(RunStatus::Loading, now).await.expect("run");
        let mut writer = BatchWriter::new(&store, Some(run.id), "king", thresholds());

        for n in 1..=5u128 {
            let player = PlayerId(Uuid::from_u128(n));
            writer.mark_seen(player).await.expect("seen");
            writer
                .upsert_profile(PlayerProfile::new(player, "p", NameSource::Fallback, None, now))
                .await
                .expect("profile");
        }
        assert_eq!(store.snapshot().seen.len(), 4);
        assert_eq!(store.snapshot().profiles.len(), 3);

        let stats = writer.finish(now).await.expect("finish");
        assert_eq!(stats.seen_flushes, 3);
        assert_eq!(stats.profile_flushes, 2);
        assert_eq!(stats.changed_flushes, 0);
        assert_eq!(store.snapshot().seen.len(), 5);
        assert_eq!(store.snapshot().profiles.len(), 5);
    }

    #[tokio::test]
    async fn without_target_nothing_is_written() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut writer = BatchWriter::new(&store, None, "king", thresholds());
        let player = PlayerId(Uuid::from_u128(1));
        writer.mark_seen(player).await.expect("seen");
        writer
            .push_changed(
                StatsPayload {
                    player,
                    gzip: vec![1, 2, 3],
                    content_hash: "abc".into(),
                },
                Vec::new(),
                now,
            )
            .await
            .expect("changed");
        let stats = writer.finish(now).await.expect("finish");
        assert_eq!(stats.changed_rows, 1);
        assert_eq!(store.snapshot().mutations, 0);
    }
}
