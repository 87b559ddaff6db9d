use mcstats_core::{MetricRule, MetricValue, PlayerId, StatsDocument};

/// Evaluates the configured metric rules against a player's document.
#[derive(Debug, Clone)]
pub struct MetricEvaluator {
    rules: Vec<MetricRule>,
}

impl MetricEvaluator {
    /// The synthetic points metric is derived from awards and never from sources.
    pub fn new(rules: Vec<MetricRule>, points_metric: &str) -> Self {
        Self {
            rules: rules
                .into_iter()
                .filter(|rule| rule.metric_id != points_metric)
                .collect(),
        }
    }

    pub fn rules(&self) -> &[MetricRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn metric_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.metric_id.as_str())
    }

    /// Values above zero only.
    pub fn evaluate(&self, player: PlayerId, document: &StatsDocument) -> Vec<MetricValue> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let value = rule_value(rule, document);
                (value > 0).then(|| MetricValue {
                    metric_id: rule.metric_id.clone(),
                    player,
                    value,
                })
            })
            .collect()
    }
}

fn rule_value(rule: &MetricRule, document: &StatsDocument) -> i64 {
    rule.sources.iter().fold(0i64, |total, source| {
        let counter = document.counter(&source.section, &source.key);
        total.saturating_add(source.weight.saturating_mul(counter))
    })
}

#[cfg(test)]
mod tests {
    use mcstats_core::{MetricSource, StatSections};
    use uuid::Uuid;

    use super::*;

    fn source(metric: &str, section: &str, key: &str, weight: i64) -> MetricSource {
        MetricSource {
            metric_id: metric.to_string(),
            section: section.to_string(),
            key: key.to_string(),
            weight,
        }
    }

    fn document() -> StatsDocument {
        let mut sections = StatSections::new();
        let mined = sections.entry("minecraft:mined".into()).or_default();
        mined.insert("minecraft:stone".into(), 40);
        mined.insert("minecraft:deepslate".into(), 2);
        sections
            .entry("minecraft:custom".into())
            .or_default()
            .insert("minecraft:deaths".into(), 3);
        StatsDocument::new(sections)
    }

    #[test]
    fn weighted_sum_skips_zero_and_points_metric() {
        let rules = vec![
            MetricRule {
                metric_id: "blocks".into(),
                sort_order: 1,
                sources: vec![
                    source("blocks", "minecraft:mined", "minecraft:stone", 1),
                    source("blocks", "minecraft:mined", "minecraft:deepslate", 5),
                    source("blocks", "minecraft:mined", "minecraft:obsidian", 100),
                ],
            },
            MetricRule {
                metric_id: "fishing".into(),
                sort_order: 2,
                sources: vec![source("fishing", "minecraft:custom", "minecraft:fish_caught", 1)],
            },
            MetricRule {
                metric_id: "king".into(),
                sort_order: 0,
                sources: vec![source("king", "minecraft:custom", "minecraft:deaths", 1)],
            },
        ];
        let evaluator = MetricEvaluator::new(rules, "king");
        let player = PlayerId(Uuid::from_u128(7));
        let values = evaluator.evaluate(player, &document());
        assert_eq!(
            values,
            vec![MetricValue {
                metric_id: "blocks".into(),
                player,
                value: 50,
            }]
        );
        assert_eq!(evaluator.metric_ids().collect::<Vec<_>>(), vec!["blocks", "fishing"]);
    }

    #[test]
    fn overflow_saturates() {
        let rule = MetricRule {
            metric_id: "huge".into(),
            sort_order: 0,
            sources: vec![source("huge", "minecraft:mined", "minecraft:stone", i64::MAX)],
        };
        assert_eq!(rule_value(&rule, &document()), i64::MAX);
    }
}
