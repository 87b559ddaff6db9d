//! Per-metric placings and the synthetic points leaderboard.
//!
//! Places use competition ranking: a player's place is one more than the
//! number of players with a strictly greater value, and tied players share
//! the better place and its points. A metric never yields more award rows than
//! there are point slots; a tie that overflows the slots is cut by ascending
//! uuid.

use std::collections::BTreeMap;

use mcstats_core::{Award, MetricDef, MetricValue, PlayerId};

/// Definition row ensured for the points leaderboard.
pub fn points_metric_def(id: &str) -> MetricDef {
    MetricDef {
        id: id.to_string(),
        label: "Server King".to_string(),
        category: "General".to_string(),
        unit: "Points".to_string(),
        divisor: 1,
        decimals: 0,
        sort_order: 0,
        enabled: true,
    }
}

/// Places and points for one metric, at most one row per point slot.
/// Non-positive values never place.
pub fn rank_metric(metric_id: &str, values: &[(PlayerId, i64)], points: &[i64]) -> Vec<Award> {
    let mut ordered: Vec<(PlayerId, i64)> =
        values.iter().copied().filter(|(_, value)| *value > 0).collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ordered.truncate(points.len());

    let mut awards = Vec::new();
    let mut place = 0usize;
    let mut previous = None;
    for (index, (player, value)) in ordered.into_iter().enumerate() {
        if previous != Some(value) {
            place = index + 1;
            previous = Some(value);
        }
        let Some(&slot_points) = points.get(place - 1) else {
            break;
        };
        if slot_points <= 0 {
            continue;
        }
        awards.push(Award {
            metric_id: metric_id.to_string(),
            place: place as u32,
            player,
            value,
            points: slot_points,
        });
    }
    awards
}

/// Sums awarded points per player. Zero totals are dropped.
pub fn points_totals(points_metric: &str, awards: &[Award]) -> Vec<MetricValue> {
    let mut totals: BTreeMap<PlayerId, i64> = BTreeMap::new();
    for award in awards {
        let total = totals.entry(award.player).or_default();
        *total = total.saturating_add(award.points);
    }
    totals
        .into_iter()
        .filter(|(_, value)| *value > 0)
        .map(|(player, value)| MetricValue {
            metric_id: points_metric.to_string(),
            player,
            value,
        })
        .collect()
}

/// Awards across metrics and the resulting points totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Standings {
    pub awards: Vec<Award>,
    pub totals: Vec<MetricValue>,
}

impl Standings {
    pub fn new(points_metric: &str, awards: Vec<Award>) -> Self {
        let totals = points_totals(points_metric, &awards);
        Self { awards, totals }
    }

    pub fn leader(&self) -> Option<&MetricValue> {
        self.totals
            .iter()
            .max_by(|a, b| a.value.cmp(&b.value).then_with(|| b.player.cmp(&a.player)))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn player(n: u128) -> PlayerId {
        PlayerId(Uuid::from_u128(n))
    }

    fn placings(awards: &[Award]) -> Vec<(PlayerId, u32, i64)> {
        awards.iter().map(|a| (a.player, a.place, a.points)).collect()
    }

    #[test]
    fn tie_at_the_top_shares_first_place() {
        let (a, b, c) = (player(1), player(2), player(3));
        let awards = rank_metric("deaths", &[(c, 2), (b, 5), (a, 5)], &[5, 3, 1]);
        assert_eq!(placings(&awards), vec![(a, 1, 5), (b, 1, 5), (c, 3, 1)]);
    }

    #[test]
    fn tie_on_last_slot_is_cut_by_uuid() {
        let players: Vec<PlayerId> = (1..=5).map(player).collect();
        let values = vec![
            (players[0], 90),
            (players[1], 80),
            (players[2], 70),
            (players[3], 70),
            (players[4], 60),
        ];
        let awards = rank_metric("mined", &values, &[5, 3, 1]);
        assert_eq!(
            placings(&awards),
            vec![
                (players[0], 1, 5),
                (players[1], 2, 3),
                (players[2], 3, 1),
            ]
        );
    }

    #[test]
    fn large_tie_never_exceeds_the_slot_count() {
        let values: Vec<(PlayerId, i64)> = (1..=50).rev().map(|n| (player(n), 1)).collect();
        let awards = rank_metric("joins", &values, &[5, 3, 1]);
        assert_eq!(
            placings(&awards),
            vec![(player(1), 1, 5), (player(2), 1, 5), (player(3), 1, 5)]
        );
        let standings = Standings::new("king", awards);
        assert_eq!(standings.totals.len(), 3);
    }

    #[test]
    fn zero_values_and_zero_slots_award_nothing() {
        let awards = rank_metric("walk", &[(player(1), 10), (player(2), 0)], &[0, 3]);
        assert!(awards.is_empty());
    }

    #[test]
    fn totals_sum_across_metrics() {
        let (a, b) = (player(1), player(2));
        let mut awards = rank_metric("deaths", &[(a, 9), (b, 4)], &[5, 3, 1]);
        awards.extend(rank_metric("mined", &[(b, 100), (a, 50)], &[5, 3, 1]));
        let standings = Standings::new("king", awards);
        assert_eq!(
            standings
                .totals
                .iter()
                .map(|t| (t.player, t.value))
                .collect::<Vec<_>>(),
            vec![(a, 8), (b, 8)]
        );
        assert_eq!(standings.leader().map(|t| t.player), Some(a));
    }
}
