use std::time::Duration;

use mcstats_core::{MetricDef, MetricSource, NameSource, PlayerId, RunStatus};
use mcstats_import::{ImportConfig, ImportEngine, ImportError, ImportSummary};
use mcstats_storage::{MemoryOp, MemoryStore, StatsStore};
use tempfile::TempDir;

const ALICE: &str = "0000000a-0000-4000-8000-00000000000a";
const BOB: &str = "0000000b-0000-4000-8000-00000000000b";
const CAROL: &str = "0000000c-0000-4000-8000-00000000000c";

fn id(raw: &str) -> PlayerId {
    PlayerId::parse(raw).expect("uuid")
}

struct Fixture {
    stats: TempDir,
    aux: TempDir,
    store: MemoryStore,
}

impl Fixture {
    async fn new() -> Self {
        let store = MemoryStore::new();
        for (metric, section, key, sort_order) in [
            ("deaths", "minecraft:custom", "minecraft:deaths", 1),
            ("mined", "minecraft:mined", "minecraft:stone", 2),
        ] {
            let def = MetricDef {
                id: metric.to_string(),
                label: metric.to_string(),
                category: "Test".to_string(),
                unit: "".to_string(),
                divisor: 1,
                decimals: 0,
                sort_order,
                enabled: true,
            };
            let source = MetricSource {
                metric_id: metric.to_string(),
                section: section.to_string(),
                key: key.to_string(),
                weight: 1,
            };
            store.seed_metric(&def, &[source]).await.expect("seed");
        }
        Self {
            stats: tempfile::tempdir().expect("stats dir"),
            aux: tempfile::tempdir().expect("aux dir"),
            store,
        }
    }

    fn write(&self, player: &str, play_ticks: i64, deaths: i64, stone: i64) {
        let body = format!(
            r#"{{"stats":{{"minecraft:custom":{{"minecraft:play_time":{play_ticks},"minecraft:deaths":{deaths}}},"minecraft:mined":{{"minecraft:stone":{stone}}}}},"DataVersion":3465}}"#
        );
        std::fs::write(self.stats.path().join(format!("{player}.json")), body).expect("write stats");
    }

    fn remove(&self, player: &str) {
        std::fs::remove_file(self.stats.path().join(format!("{player}.json"))).expect("remove");
    }

    fn write_usercache(&self, entries: &[(&str, &str)]) {
        let items = entries
            .iter()
            .map(|(uuid, name)| format!(r#"{{"name":"{name}","uuid":"{uuid}","expiresOn":"2030-01-01 00:00:00 +0000"}}"#))
            .collect::<Vec<_>>()
            .join(",");
        std::fs::write(self.usercache_path(), format!("[{items}]")).expect("write usercache");
    }

    fn usercache_path(&self) -> std::path::PathBuf {
        self.aux.path().join("usercache.json")
    }

    fn config(&self) -> ImportConfig {
        let mut config = ImportConfig::new(self.stats.path());
        config.usercache_path = self.usercache_path();
        config.lock_timeout = Duration::ZERO;
        config.flush.seen = 2;
        config.flush.profiles = 2;
        config.flush.changed = 1;
        config
    }

    async fn import(&self) -> Result<ImportSummary, ImportError> {
        self.import_with(self.config()).await
    }

    async fn import_with(&self, config: ImportConfig) -> Result<ImportSummary, ImportError> {
        ImportEngine::new(self.store.clone(), config)
            .run_until(std::future::pending::<()>())
            .await
    }
}

#[tokio::test]
async fn second_pass_over_unchanged_input_rewrites_nothing() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.write(BOB, 90_000, 1, 40);

    let first = fx.import().await.expect("first import");
    assert_eq!(first.kept, 2);
    assert_eq!(first.changed, 2);
    let after_first = fx.store.snapshot();
    assert_eq!(after_first.payload_writes, 2);

    let second = fx.import().await.expect("second import");
    assert_eq!(second.changed, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.run_id, first.run_id);

    let after_second = fx.store.snapshot();
    assert_eq!(after_second.payload_writes, 2);
    assert_eq!(after_second.metric_values, after_first.metric_values);
    assert_eq!(after_second.payloads, after_first.payloads);
    assert_eq!(after_second.active_run_id, first.run_id);
}

#[tokio::test]
async fn below_threshold_player_leaves_no_rows() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.write(BOB, 36_000, 9, 900);

    let summary = fx.import().await.expect("import");
    assert_eq!(summary.below_threshold, 1);
    let run_id = summary.run_id.expect("run");
    let state = fx.store.snapshot();
    assert!(state.has_rows_for(run_id, id(ALICE)));
    assert!(!state.has_rows_for(run_id, id(BOB)));
}

#[tokio::test]
async fn excluded_player_leaves_no_rows() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    let mut config = fx.config();
    config.exclude.insert(id(ALICE));

    let summary = fx.import_with(config).await.expect("import");
    assert_eq!(summary.excluded, 1);
    assert!(!fx.store.snapshot().has_rows_for(summary.run_id.expect("run"), id(ALICE)));
}

#[tokio::test]
async fn removed_document_is_cleaned_up() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.write(BOB, 90_000, 5, 40);
    let first = fx.import().await.expect("first import");
    let run_id = first.run_id.expect("run");
    assert!(fx.store.snapshot().has_rows_for(run_id, id(BOB)));

    fx.remove(BOB);
    let second = fx.import().await.expect("second import");
    assert_eq!(second.cleanup.profiles, 1);
    assert_eq!(second.cleanup.payloads, 1);
    let state = fx.store.snapshot();
    assert!(!state.has_rows_for(run_id, id(BOB)));
    assert!(state.has_rows_for(run_id, id(ALICE)));
}

#[tokio::test]
async fn bad_files_are_skipped_without_failing_the_pass() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    std::fs::write(fx.stats.path().join(format!("{BOB}.json")), b"{ not json").expect("write");
    std::fs::write(fx.stats.path().join("notes.json"), b"{}").expect("write");

    let summary = fx.import().await.expect("import");
    assert_eq!(summary.files, 3);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.invalid_names, 1);
    assert_eq!(summary.kept, 1);
}

#[tokio::test]
async fn tied_values_share_first_place() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 5, 0);
    fx.write(BOB, 80_000, 5, 0);
    fx.write(CAROL, 80_000, 2, 0);

    let summary = fx.import().await.expect("import");
    let run_id = summary.run_id.expect("run");
    let state = fx.store.snapshot();

    let mut awards = state
        .awards
        .iter()
        .filter(|(run, award)| *run == run_id && award.metric_id == "deaths")
        .map(|(_, award)| (award.player, award.place, award.points))
        .collect::<Vec<_>>();
    awards.sort();
    assert_eq!(
        awards,
        vec![(id(ALICE), 1, 5), (id(BOB), 1, 5), (id(CAROL), 3, 1)]
    );
    assert_eq!(state.metric_value(run_id, "king", id(ALICE)), Some(5));
    assert_eq!(state.metric_value(run_id, "king", id(BOB)), Some(5));
    assert_eq!(state.metric_value(run_id, "king", id(CAROL)), Some(1));
    assert!(state.metric_defs.contains_key("king"));
    assert_eq!(summary.point_holders, 3);
}

#[tokio::test]
async fn metric_dropping_to_zero_loses_its_row_and_points() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.write(BOB, 90_000, 1, 40);

    let first = fx.import().await.expect("first import");
    let run_id = first.run_id.expect("run");
    let state = fx.store.snapshot();
    assert_eq!(state.metric_value(run_id, "deaths", id(ALICE)), Some(3));
    assert_eq!(state.metric_value(run_id, "king", id(ALICE)), Some(10));
    assert_eq!(state.metric_value(run_id, "king", id(BOB)), Some(6));

    fx.write(ALICE, 80_000, 0, 120);
    let second = fx.import().await.expect("second import");
    assert_eq!(second.changed, 1);
    assert_eq!(second.unchanged, 1);

    let state = fx.store.snapshot();
    assert_eq!(state.metric_value(run_id, "deaths", id(ALICE)), None);
    assert_eq!(state.metric_value(run_id, "mined", id(ALICE)), Some(120));
    assert_eq!(state.metric_value(run_id, "king", id(ALICE)), Some(5));
    assert_eq!(state.metric_value(run_id, "king", id(BOB)), Some(8));
    assert!(!state
        .awards
        .iter()
        .any(|(run, award)| *run == run_id && award.metric_id == "deaths" && award.player == id(ALICE)));
}

#[tokio::test]
async fn second_file_for_the_same_player_is_skipped() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.write(&id(ALICE).simple_hex(), 85_000, 4, 130);

    let summary = fx.import().await.expect("import");
    let run_id = summary.run_id.expect("run");
    assert_eq!(summary.parsed, 2);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.kept, 1);
    assert_eq!(summary.changed, 1);

    let state = fx.store.snapshot();
    assert_eq!(state.profiles_for(run_id).len(), 1);
    assert_eq!(state.payload_writes, 1);
    assert_eq!(state.active_run_id, Some(run_id));
}

#[tokio::test]
async fn awards_can_be_disabled() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 5, 10);
    let mut config = fx.config();
    config.awards_enabled = false;

    let summary = fx.import_with(config).await.expect("import");
    assert_eq!(summary.awards, 0);
    let state = fx.store.snapshot();
    assert!(state.awards.is_empty());
    assert!(!state.metric_defs.contains_key("king"));
}

#[tokio::test]
async fn every_kept_player_gets_a_name() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.write(BOB, 90_000, 1, 40);
    fx.write_usercache(&[(ALICE, "Alice")]);

    let summary = fx.import().await.expect("import");
    let state = fx.store.snapshot();
    let profiles = state.profiles_for(summary.run_id.expect("run"));
    assert_eq!(profiles.len(), 2);
    assert!(profiles.iter().all(|p| !p.name.is_empty()));

    let alice = profiles.iter().find(|p| p.player == id(ALICE)).expect("alice");
    assert_eq!(alice.name, "Alice");
    assert_eq!(alice.name_lc, "alice");
    assert_eq!(alice.name_source, NameSource::Usercache);
    let bob = profiles.iter().find(|p| p.player == id(BOB)).expect("bob");
    assert_eq!(bob.name, id(BOB).fallback_name());
    assert_eq!(bob.name_source, NameSource::Fallback);
}

#[tokio::test]
async fn lock_held_elsewhere_fails_fast_without_writes() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    let other = fx.store.new_session();
    assert!(other
        .try_acquire_lock("mc_stats_import", Duration::ZERO)
        .await
        .expect("lock"));
    let before = fx.store.snapshot().mutations;

    let err = fx.import().await.expect_err("lock is held");
    assert!(matches!(err, ImportError::LockHeld(_)));
    assert_eq!(err.exit_code(), 10);
    let state = fx.store.snapshot();
    assert_eq!(state.mutations, before);
    assert!(state.runs.is_empty());
}

#[tokio::test]
async fn failure_marks_run_failed_and_releases_lock() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.store.fail_once(MemoryOp::WriteChanged);

    let err = fx.import().await.expect_err("injected failure");
    assert!(matches!(err, ImportError::Store(_)));
    assert_eq!(err.exit_code(), 1);

    let state = fx.store.snapshot();
    assert_eq!(state.active_run_id, None);
    let run = state.runs.values().next().expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.note.as_deref().unwrap_or_default().contains("write_changed"));
    assert!(fx
        .store
        .new_session()
        .try_acquire_lock("mc_stats_import", Duration::ZERO)
        .await
        .expect("lock"));
}

#[tokio::test]
async fn failed_run_is_reused_and_promoted_by_next_pass() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.store.fail_once(MemoryOp::Cleanup);
    fx.import().await.expect_err("injected failure");

    let summary = fx.import().await.expect("retry");
    let state = fx.store.snapshot();
    assert_eq!(state.runs.len(), 1);
    assert_eq!(state.active_run_id, summary.run_id);
    assert_eq!(
        state.runs.values().next().map(|run| run.status),
        Some(RunStatus::Active)
    );
}

#[tokio::test]
async fn interruption_marks_run_failed() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);

    let err = ImportEngine::new(fx.store.clone(), fx.config())
        .run_until(std::future::ready(()))
        .await
        .expect_err("interrupted");
    assert!(matches!(err, ImportError::Interrupted));
    assert_eq!(err.exit_code(), 130);

    let state = fx.store.snapshot();
    assert_eq!(state.active_run_id, None);
    assert_eq!(
        state.runs.values().next().map(|run| run.status),
        Some(RunStatus::Failed)
    );
    assert!(fx
        .store
        .new_session()
        .try_acquire_lock("mc_stats_import", Duration::ZERO)
        .await
        .expect("lock"));
}

#[tokio::test]
async fn dry_run_computes_but_writes_nothing() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 5, 120);
    fx.write(BOB, 90_000, 2, 40);
    let before = fx.store.snapshot().mutations;
    let mut config = fx.config();
    config.dry_run = true;

    let summary = fx.import_with(config).await.expect("dry run");
    assert!(summary.dry_run);
    assert_eq!(summary.run_id, None);
    assert_eq!(summary.changed, 2);
    assert_eq!(summary.awards, 4);
    let state = fx.store.snapshot();
    assert_eq!(state.mutations, before);
    assert!(state.runs.is_empty());
}

#[tokio::test]
async fn force_recompute_rewrites_unchanged_documents() {
    let fx = Fixture::new().await;
    fx.write(ALICE, 80_000, 3, 120);
    fx.import().await.expect("first import");
    let mut config = fx.config();
    config.force_recompute = true;

    let summary = fx.import_with(config).await.expect("forced import");
    assert_eq!(summary.changed, 1);
    assert_eq!(fx.store.snapshot().payload_writes, 2);
}

#[tokio::test]
async fn no_enabled_metrics_stops_before_any_write() {
    let fx = Fixture::new().await;
    let empty = MemoryStore::new();
    fx.write(ALICE, 80_000, 3, 120);

    let err = ImportEngine::new(empty.clone(), fx.config())
        .run_until(std::future::pending::<()>())
        .await
        .expect_err("no metrics");
    assert!(matches!(err, ImportError::NoEnabledMetrics));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(empty.snapshot().mutations, 0);
}

#[tokio::test]
async fn missing_stats_directory_is_a_configuration_error() {
    let fx = Fixture::new().await;
    let mut config = fx.config();
    config.stats_dir = fx.aux.path().join("does-not-exist");

    let err = fx.import_with(config).await.expect_err("missing dir");
    assert!(matches!(err, ImportError::Config(_)));
    assert_eq!(err.exit_code(), 2);
}
