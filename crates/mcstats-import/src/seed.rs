use std::path::Path;

use anyhow::{bail, Context, Result};
use mcstats_core::{MetricDef, MetricSource};
use mcstats_storage::StatsStore;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
struct MetricSeedFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    metrics: Vec<MetricSeed>,
}

#[derive(Debug, Clone, Deserialize)]
struct MetricSeed {
    #[serde(flatten)]
    def: MetricDef,
    #[serde(default)]
    sources: Vec<SourceSeed>,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceSeed {
    section: String,
    key: String,
    #[serde(default = "default_weight")]
    weight: i64,
}

fn default_weight() -> i64 {
    1
}

/// A metric definition together with its weighted sources.
pub type SeededMetric = (MetricDef, Vec<MetricSource>);

pub fn parse_metric_seed(yaml: &str) -> Result<Vec<SeededMetric>> {
    let file: MetricSeedFile = serde_yaml::from_str(yaml).context("parsing metric seed yaml")?;
    let mut seen = std::collections::HashSet::new();
    let mut metrics = Vec::with_capacity(file.metrics.len());
    for seed in file.metrics {
        if seed.def.id.trim().is_empty() {
            bail!("metric with an empty id");
        }
        if !seen.insert(seed.def.id.clone()) {
            bail!("metric {} is defined twice", seed.def.id);
        }
        let sources = seed
            .sources
            .into_iter()
            .map(|source| MetricSource {
                metric_id: seed.def.id.clone(),
                section: source.section,
                key: source.key,
                weight: source.weight,
            })
            .collect();
        metrics.push((seed.def, sources));
    }
    Ok(metrics)
}

pub fn load_metric_seed(path: &Path) -> Result<Vec<SeededMetric>> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_metric_seed(&yaml).with_context(|| format!("loading {}", path.display()))
}

/// Upserts every metric in the file and replaces its sources. Returns the number seeded.
pub async fn seed_metrics<S: StatsStore + ?Sized>(store: &S, path: &Path) -> Result<usize> {
    let metrics = load_metric_seed(path)?;
    for (def, sources) in &metrics {
        store
            .seed_metric(def, sources)
            .await
            .with_context(|| format!("seeding metric {}", def.id))?;
        info!(metric = %def.id, sources = sources.len(), enabled = def.enabled, "seeded metric");
    }
    Ok(metrics.len())
}
