use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcstats_core::{
    Award, KnownName, MetricDef, MetricRule, MetricSource, MetricValue, NameSource, PlayerId,
    PlayerProfile, Run, RunStatus,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    CandidateQuery, ChangedBatch, CleanupCounts, NameCandidate, StatsStore, StoreError,
    LOCK_POLL_INTERVAL,
};

/// Rows per multi-VALUES profile upsert; keeps bind parameters under the protocol limit.
const PROFILE_CHUNK: usize = 4000;

/// PostgreSQL-backed store. The advisory lock lives on a dedicated pooled
/// connection that is held for as long as the lock is.
pub struct PgStore {
    pool: PgPool,
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conn: Mutex::new(None),
        }
    }

    /// Applies the bundled schema migrations (tables and read-only views).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: row.try_get("id")?,
        generated_at: row.try_get("generated_at")?,
        status: status.parse().map_err(StoreError::Invalid)?,
        note: row.try_get("note")?,
    })
}

fn uuids(players: &[PlayerId]) -> Vec<Uuid> {
    players.iter().map(PlayerId::as_uuid).collect()
}

#[async_trait]
impl StatsStore for PgStore {
    async fn try_acquire_lock(&self, name: &str, timeout: Duration) -> Result<bool, StoreError> {
        let mut held = self.lock_conn.lock().await;
        if held.is_some() {
            return Ok(true);
        }
        let mut conn = self.pool.acquire().await?;
        let deadline = Instant::now() + timeout;
        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
                .bind(name)
                .fetch_one(&mut *conn)
                .await?;
            if acquired {
                debug!(lock = name, "advisory lock acquired");
                *held = Some(conn);
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn release_lock(&self, name: &str) -> Result<(), StoreError> {
        let Some(mut conn) = self.lock_conn.lock().await.take() else {
            return Ok(());
        };
        let released: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(name)
                .fetch_one(&mut *conn)
                .await;
        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(lock = name, "advisory lock was not held at release");
                Ok(())
            }
            Err(err) => {
                // Closing the session drops every advisory lock it holds.
                let _ = conn.detach().close().await;
                Err(err.into())
            }
        }
    }

    async fn active_run(&self) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT r.id, r.generated_at, r.status, r.note
              FROM site_state s
              JOIN import_run r ON r.id = s.active_run_id
             WHERE s.id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_run(&self) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            "SELECT id, generated_at, status, note FROM import_run ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn run(&self, run_id: i64) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT id, generated_at, status, note FROM import_run WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn create_run(&self, status: RunStatus, at: DateTime<Utc>) -> Result<Run, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO import_run (generated_at, status)
            VALUES ($1, $2)
            RETURNING id, generated_at, status, note
            "#,
        )
        .bind(at)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        run_from_row(&row)
    }

    async fn set_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        note: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE import_run SET status = $2, note = $3 WHERE id = $1")
            .bind(run_id)
            .bind(status.as_str())
            .bind(note)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownRun(run_id));
        }
        Ok(())
    }

    async fn activate_run(&self, run_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE import_run SET status = 'active', generated_at = $2, note = NULL WHERE id = $1",
        )
        .bind(run_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownRun(run_id));
        }
        sqlx::query(
            r#"
            INSERT INTO site_state (id, active_run_id) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET active_run_id = EXCLUDED.active_run_id
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn enabled_metric_rules(&self) -> Result<Vec<MetricRule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ms.metric_id, md.sort_order, ms.section, ms.mc_key, ms.weight
              FROM metric_source ms
              JOIN metric_def md ON md.id = ms.metric_id
             WHERE md.enabled
             ORDER BY md.sort_order ASC, ms.metric_id ASC, ms.section ASC, ms.mc_key ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules: Vec<MetricRule> = Vec::new();
        for row in rows {
            let source = MetricSource {
                metric_id: row.try_get("metric_id")?,
                section: row.try_get("section")?,
                key: row.try_get("mc_key")?,
                weight: row.try_get("weight")?,
            };
            match rules.last_mut() {
                Some(rule) if rule.metric_id == source.metric_id => rule.sources.push(source),
                _ => rules.push(MetricRule {
                    metric_id: source.metric_id.clone(),
                    sort_order: row.try_get("sort_order")?,
                    sources: vec![source],
                }),
            }
        }
        Ok(rules)
    }

    async fn ensure_metric_def(&self, def: &MetricDef) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO metric_def (id, label, category, unit, divisor, decimals, sort_order, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&def.id)
        .bind(&def.label)
        .bind(&def.category)
        .bind(&def.unit)
        .bind(def.divisor)
        .bind(def.decimals)
        .bind(def.sort_order)
        .bind(def.enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn seed_metric(&self, def: &MetricDef, sources: &[MetricSource]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO metric_def (id, label, category, unit, divisor, decimals, sort_order, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                label = EXCLUDED.label,
                category = EXCLUDED.category,
                unit = EXCLUDED.unit,
                divisor = EXCLUDED.divisor,
                decimals = EXCLUDED.decimals,
                sort_order = EXCLUDED.sort_order,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(&def.id)
        .bind(&def.label)
        .bind(&def.category)
        .bind(&def.unit)
        .bind(def.divisor)
        .bind(def.decimals)
        .bind(def.sort_order)
        .bind(def.enabled)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM metric_source WHERE metric_id = $1")
            .bind(&def.id)
            .execute(&mut *tx)
            .await?;
        if !sources.is_empty() {
            let sections: Vec<&str> = sources.iter().map(|s| s.section.as_str()).collect();
            let keys: Vec<&str> = sources.iter().map(|s| s.key.as_str()).collect();
            let weights: Vec<i64> = sources.iter().map(|s| s.weight).collect();
            sqlx::query(
                r#"
                INSERT INTO metric_source (metric_id, section, mc_key, weight)
                SELECT $1, t.section, t.mc_key, t.weight
                  FROM UNNEST($2::text[], $3::text[], $4::bigint[]) AS t(section, mc_key, weight)
                ON CONFLICT (metric_id, section, mc_key) DO UPDATE SET weight = EXCLUDED.weight
                "#,
            )
            .bind(&def.id)
            .bind(&sections)
            .bind(&keys)
            .bind(&weights)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn stored_hashes(&self, run_id: i64) -> Result<HashMap<PlayerId, String>, StoreError> {
        let rows = sqlx::query("SELECT uuid, stats_sha256 FROM player_stats WHERE run_id = $1")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let uuid: Uuid = row.try_get("uuid")?;
            let hash: String = row.try_get("stats_sha256")?;
            out.insert(PlayerId(uuid), hash.trim().to_string());
        }
        Ok(out)
    }

    async fn known_names(&self, run_id: i64) -> Result<HashMap<PlayerId, KnownName>, StoreError> {
        let rows = sqlx::query(
            "SELECT uuid, name, name_source, name_checked_at FROM player_profile WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            if name.is_empty() {
                continue;
            }
            let uuid: Uuid = row.try_get("uuid")?;
            let source: Option<String> = row.try_get("name_source")?;
            out.insert(
                PlayerId(uuid),
                KnownName {
                    name,
                    source: NameSource::from_db(source.as_deref()),
                    checked_at: row.try_get("name_checked_at")?,
                },
            );
        }
        Ok(out)
    }

    async fn reset_seen(&self, run_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM import_seen WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_seen(&self, run_id: i64, players: &[PlayerId]) -> Result<(), StoreError> {
        if players.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO import_seen (run_id, uuid)
            SELECT $1, t.uuid FROM UNNEST($2::uuid[]) AS t(uuid)
            ON CONFLICT (run_id, uuid) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(uuids(players))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_profiles(&self, run_id: i64, profiles: &[PlayerProfile]) -> Result<(), StoreError> {
        if profiles.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in profiles.chunks(PROFILE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO player_profile (run_id, uuid, name, name_lc, name_source, name_checked_at, last_seen) ",
            );
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(run_id)
                    .push_bind(p.player.as_uuid())
                    .push_bind(&p.name)
                    .push_bind(&p.name_lc)
                    .push_bind(p.name_source.as_str())
                    .push_bind(p.name_checked_at)
                    .push_bind(p.last_seen);
            });
            qb.push(
                r#"
                ON CONFLICT (run_id, uuid) DO UPDATE SET
                    name = EXCLUDED.name,
                    name_lc = EXCLUDED.name_lc,
                    name_source = EXCLUDED.name_source,
                    name_checked_at = EXCLUDED.name_checked_at,
                    last_seen = EXCLUDED.last_seen
                "#,
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_changed(
        &self,
        run_id: i64,
        batch: &ChangedBatch,
        keep_metric: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let players = uuids(&batch.players());
        let mut tx = self.pool.begin().await?;

        // Clear old rows first so metrics that dropped to zero disappear.
        sqlx::query(
            "DELETE FROM metric_value WHERE run_id = $1 AND uuid = ANY($2) AND metric_id <> $3",
        )
        .bind(run_id)
        .bind(&players)
        .bind(keep_metric)
        .execute(&mut *tx)
        .await?;

        let blobs: Vec<Vec<u8>> = batch.payloads.iter().map(|p| p.gzip.clone()).collect();
        let hashes: Vec<&str> = batch
            .payloads
            .iter()
            .map(|p| p.content_hash.as_str())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO player_stats (run_id, uuid, stats_gzip, stats_sha256, updated_at)
            SELECT $1, t.uuid, t.stats_gzip, t.stats_sha256, $5
              FROM UNNEST($2::uuid[], $3::bytea[], $4::text[]) AS t(uuid, stats_gzip, stats_sha256)
            ON CONFLICT (run_id, uuid) DO UPDATE SET
                stats_gzip = EXCLUDED.stats_gzip,
                stats_sha256 = EXCLUDED.stats_sha256,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(run_id)
        .bind(&players)
        .bind(&blobs)
        .bind(&hashes)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if !batch.metric_values.is_empty() {
            let metric_ids: Vec<&str> = batch
                .metric_values
                .iter()
                .map(|v| v.metric_id.as_str())
                .collect();
            let value_players: Vec<Uuid> = batch
                .metric_values
                .iter()
                .map(|v| v.player.as_uuid())
                .collect();
            let values: Vec<i64> = batch.metric_values.iter().map(|v| v.value).collect();
            sqlx::query(
                r#"
                INSERT INTO metric_value (run_id, metric_id, uuid, value)
                SELECT $1, t.metric_id, t.uuid, t.value
                  FROM UNNEST($2::text[], $3::uuid[], $4::bigint[]) AS t(metric_id, uuid, value)
                ON CONFLICT (run_id, metric_id, uuid) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(run_id)
            .bind(&metric_ids)
            .bind(&value_players)
            .bind(&values)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_unseen(&self, run_id: i64) -> Result<CleanupCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut counts = CleanupCounts::default();
        for (table, slot) in [
            ("player_profile", &mut counts.profiles),
            ("player_stats", &mut counts.payloads),
            ("metric_value", &mut counts.metric_values),
            ("metric_award", &mut counts.awards),
        ] {
            let sql = format!(
                "DELETE FROM {table} t WHERE t.run_id = $1 AND NOT EXISTS \
                 (SELECT 1 FROM import_seen s WHERE s.run_id = t.run_id AND s.uuid = t.uuid)"
            );
            *slot = sqlx::query(&sql)
                .bind(run_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        sqlx::query("DELETE FROM import_seen WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(counts)
    }

    async fn metric_values(
        &self,
        run_id: i64,
        metric_id: &str,
    ) -> Result<Vec<(PlayerId, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, value FROM metric_value
             WHERE run_id = $1 AND metric_id = $2 AND value > 0
             ORDER BY value DESC, uuid ASC
            "#,
        )
        .bind(run_id)
        .bind(metric_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let uuid: Uuid = row.try_get("uuid")?;
                let value: i64 = row.try_get("value")?;
                Ok((PlayerId(uuid), value))
            })
            .collect()
    }

    async fn replace_awards(
        &self,
        run_id: i64,
        points_metric: &str,
        totals: &[MetricValue],
        awards: &[Award],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM metric_value WHERE run_id = $1 AND metric_id = $2")
            .bind(run_id)
            .bind(points_metric)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM metric_award WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        if !awards.is_empty() {
            let metric_ids: Vec<&str> = awards.iter().map(|a| a.metric_id.as_str()).collect();
            let places: Vec<i32> = awards.iter().map(|a| a.place as i32).collect();
            let players: Vec<Uuid> = awards.iter().map(|a| a.player.as_uuid()).collect();
            let points: Vec<i64> = awards.iter().map(|a| a.points).collect();
            let values: Vec<i64> = awards.iter().map(|a| a.value).collect();
            sqlx::query(
                r#"
                INSERT INTO metric_award (run_id, metric_id, place, uuid, points, value)
                SELECT $1, t.metric_id, t.place, t.uuid, t.points, t.value
                  FROM UNNEST($2::text[], $3::int[], $4::uuid[], $5::bigint[], $6::bigint[])
                       AS t(metric_id, place, uuid, points, value)
                "#,
            )
            .bind(run_id)
            .bind(&metric_ids)
            .bind(&places)
            .bind(&players)
            .bind(&points)
            .bind(&values)
            .execute(&mut *tx)
            .await?;
        }

        let positive: Vec<&MetricValue> = totals.iter().filter(|t| t.value > 0).collect();
        if !positive.is_empty() {
            let players: Vec<Uuid> = positive.iter().map(|t| t.player.as_uuid()).collect();
            let values: Vec<i64> = positive.iter().map(|t| t.value).collect();
            sqlx::query(
                r#"
                INSERT INTO metric_value (run_id, metric_id, uuid, value)
                SELECT $1, $2, t.uuid, t.value FROM UNNEST($3::uuid[], $4::bigint[]) AS t(uuid, value)
                "#,
            )
            .bind(run_id)
            .bind(points_metric)
            .bind(&players)
            .bind(&values)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn name_candidates(
        &self,
        run_id: i64,
        query: CandidateQuery,
    ) -> Result<Vec<NameCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, name, name_source, name_checked_at
              FROM player_profile
             WHERE run_id = $1
               AND (name_source NOT IN ('mojang', 'usercache')
                    OR name_checked_at IS NULL
                    OR name_checked_at < $2)
             ORDER BY CASE WHEN name_source IN ('fallback', 'unknown') THEN 0 ELSE 1 END,
                      name_checked_at ASC NULLS FIRST,
                      uuid ASC
             LIMIT $3
            "#,
        )
        .bind(run_id)
        .bind(query.stale_before)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let uuid: Uuid = row.try_get("uuid")?;
                let source: Option<String> = row.try_get("name_source")?;
                Ok(NameCandidate {
                    player: PlayerId(uuid),
                    name: row.try_get("name")?,
                    name_source: NameSource::from_db(source.as_deref()),
                    name_checked_at: row.try_get("name_checked_at")?,
                })
            })
            .collect()
    }

    async fn record_resolved_name(
        &self,
        run_id: i64,
        player: PlayerId,
        name: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let name = mcstats_core::clamp_name(name);
        let result = sqlx::query(
            r#"
            UPDATE player_profile
               SET name = $3, name_lc = $4, name_source = 'mojang', name_checked_at = $5
             WHERE run_id = $1 AND uuid = $2
            "#,
        )
        .bind(run_id)
        .bind(player.as_uuid())
        .bind(&name)
        .bind(mcstats_core::clamp_name(&name.to_lowercase()))
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
