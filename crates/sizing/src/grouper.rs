//! Propensity groups: equal-frequency bins over the score ranking and
//! KPI aggregation per bin.

use std::collections::BTreeMap;

use propensity_core::config::SortPolicy;
use propensity_core::{AudienceError, AudienceResult, GroupedVisitor, KpiSummary, ScoredVisitor};
use tracing::{debug, info};

/// `100 * num / den`, or `NaN` when the denominator is zero.
pub fn percentage(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        f64::NAN
    } else {
        100.0 * num / den
    }
}

/// Size of one group when splitting `num_visitors` into `num_groups`.
pub fn group_size(num_visitors: usize, num_groups: u32) -> usize {
    if num_groups == 0 {
        0
    } else {
        num_visitors / num_groups as usize
    }
}

/// Quantile bin of `position` among `count` positions, equal-frequency over
/// `num_groups` bins. Bin edges sit at `(count - 1) * i / num_groups`; a
/// position belongs to the first bin whose upper edge is not below it.
pub fn quantile_bin(position: usize, count: usize, num_groups: u32) -> u32 {
    if count <= 1 || position == 0 {
        return 0;
    }
    let g = num_groups as u128;
    let scaled = position as u128 * g;
    let span = (count - 1) as u128;
    let upper = scaled.div_ceil(span);
    (upper.max(1) - 1) as u32
}

pub struct PropensityGrouper {
    num_groups: u32,
    sort_policy: SortPolicy,
}

impl PropensityGrouper {
    pub fn new(num_groups: u32, sort_policy: SortPolicy) -> AudienceResult<Self> {
        if num_groups == 0 {
            return Err(AudienceError::Config("num_groups must be at least 1".into()));
        }
        Ok(Self {
            num_groups,
            sort_policy,
        })
    }

    /// Tag every visitor with a propensity group, group 0 holding the highest scores.
    ///
    /// The dataset must be ranked by descending score. Depending on the sort
    /// policy unranked input is either rejected or stable-sorted first, so
    /// equal scores keep their input order. Binning runs over the ascending
    /// rank and the bin numbers are then inverted, which puts the highest
    /// scores in group 0. Output is ordered by group number, and by
    /// descending score within a group.
    pub fn assign_groups(&self, mut dataset: Vec<ScoredVisitor>) -> AudienceResult<Vec<GroupedVisitor>> {
        if let Some(bad) = dataset.iter().find(|v| !v.score.is_finite()) {
            return Err(AudienceError::Config(format!(
                "visitor {} has a non-finite score",
                bad.visitor_id
            )));
        }
        let count = dataset.len();
        if count < self.num_groups as usize {
            return Err(AudienceError::Config(format!(
                "cannot split {count} visitors into {} groups",
                self.num_groups
            )));
        }

        if let Some(row) = first_unranked(&dataset) {
            match self.sort_policy {
                SortPolicy::RejectUnsorted => return Err(AudienceError::UnsortedInput { row }),
                SortPolicy::SortDescending => {
                    debug!(row, "dataset not ranked, sorting by descending score");
                    dataset.sort_by(|a, b| b.score.total_cmp(&a.score));
                }
            }
        }

        let mut grouped: Vec<GroupedVisitor> = dataset
            .into_iter()
            .enumerate()
            .map(|(row_number, visitor)| {
                let ascending_rank = count - 1 - row_number;
                let initial = quantile_bin(ascending_rank, count, self.num_groups);
                GroupedVisitor {
                    group_number: self.num_groups - initial - 1,
                    row_number,
                    visitor,
                }
            })
            .collect();
        grouped.sort_by_key(|g| g.group_number);

        info!(
            visitors = count,
            num_groups = self.num_groups,
            "assigned propensity groups"
        );
        Ok(grouped)
    }
}

fn first_unranked(dataset: &[ScoredVisitor]) -> Option<usize> {
    dataset
        .windows(2)
        .position(|pair| pair[1].score > pair[0].score)
        .map(|i| i + 1)
}

#[derive(Default)]
struct KpiAccumulator {
    total_visitors: u64,
    conversions: u64,
    min_score: Option<f64>,
    clicks: u64,
    views: u64,
    bounces: u64,
    revenue: f64,
}

impl KpiAccumulator {
    fn add(&mut self, visitor: &ScoredVisitor) {
        self.total_visitors += 1;
        self.clicks += visitor.product_clicks as u64;
        self.views += visitor.product_views as u64;
        self.bounces += visitor.bounces as u64;
        self.revenue += visitor.revenue;
        if visitor.label {
            self.conversions += 1;
            self.min_score = Some(match self.min_score {
                Some(current) => current.min(visitor.score),
                None => visitor.score,
            });
        }
    }

    fn finish(self, group_number: u32) -> KpiSummary {
        let total = self.total_visitors as f64;
        KpiSummary {
            group_number,
            total_visitors: self.total_visitors,
            conversions: self.conversions,
            min_score: self.min_score,
            conversion_rate: percentage(self.conversions as f64, total),
            ctr: percentage(self.clicks as f64, self.views as f64),
            bounce_rate: percentage(self.bounces as f64, total),
            clicks: self.clicks,
            views: self.views,
            bounces: self.bounces,
            revenue: self.revenue,
        }
    }
}

/// KPIs per propensity group, ascending by group number.
///
/// Conversions count visitors with a positive outcome label. Rates with a
/// zero denominator come out as `NaN`.
pub fn kpi_per_group(rows: &[GroupedVisitor]) -> Vec<KpiSummary> {
    let mut groups: BTreeMap<u32, KpiAccumulator> = BTreeMap::new();
    for row in rows {
        groups.entry(row.group_number).or_default().add(&row.visitor);
    }
    groups
        .into_iter()
        .map(|(group_number, acc)| acc.finish(group_number))
        .collect()
}

/// KPIs over an arbitrary slice of visitors, tagged with `group_number`.
pub fn kpi_for_slice<'a>(
    group_number: u32,
    visitors: impl IntoIterator<Item = &'a ScoredVisitor>,
) -> KpiSummary {
    let mut acc = KpiAccumulator::default();
    for visitor in visitors {
        acc.add(visitor);
    }
    acc.finish(group_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ranked(n: usize) -> Vec<ScoredVisitor> {
        (0..n)
            .map(|i| ScoredVisitor::new(format!("v{i}"), 1.0 - i as f64 / n as f64, i % 10 == 0))
            .collect()
    }

    fn sizes(rows: &[GroupedVisitor], num_groups: u32) -> Vec<usize> {
        (0..num_groups)
            .map(|g| rows.iter().filter(|r| r.group_number == g).count())
            .collect()
    }

    #[test]
    fn test_nine_thousand_visitors_three_groups() {
        let grouper = PropensityGrouper::new(3, SortPolicy::RejectUnsorted).unwrap();
        let rows = grouper.assign_groups(ranked(9000)).unwrap();

        assert_eq!(sizes(&rows, 3), vec![3000, 3000, 3000]);
        let min_top = rows
            .iter()
            .filter(|r| r.group_number == 0)
            .map(|r| r.visitor.score)
            .fold(f64::INFINITY, f64::min);
        let max_next = rows
            .iter()
            .filter(|r| r.group_number == 1)
            .map(|r| r.visitor.score)
            .fold(f64::NEG_INFINITY, f64::max);
        assert!(min_top > max_next);
        assert_eq!(rows[0].visitor.visitor_id, "v0");
    }

    #[test]
    fn test_groups_partition_dataset_with_sizes_within_one() {
        for (n, g) in [(10, 3), (7, 3), (4, 3), (3, 3), (101, 4), (5, 1), (1000, 7)] {
            let grouper = PropensityGrouper::new(g, SortPolicy::RejectUnsorted).unwrap();
            let rows = grouper.assign_groups(ranked(n)).unwrap();
            let group_sizes = sizes(&rows, g);

            assert_eq!(group_sizes.iter().sum::<usize>(), n);
            let max = *group_sizes.iter().max().unwrap();
            let min = *group_sizes.iter().min().unwrap();
            assert!(max - min <= 1, "n={n} g={g} sizes={group_sizes:?}");
            assert!(min > 0);

            let ids: HashSet<_> = rows.iter().map(|r| r.visitor.visitor_id.clone()).collect();
            assert_eq!(ids.len(), n);
        }
    }

    #[test]
    fn test_output_stays_ranked() {
        let grouper = PropensityGrouper::new(3, SortPolicy::RejectUnsorted).unwrap();
        let rows = grouper.assign_groups(ranked(10)).unwrap();
        assert!(rows.windows(2).all(|w| w[0].visitor.score >= w[1].visitor.score));
        assert!(rows.windows(2).all(|w| w[0].group_number <= w[1].group_number));
    }

    #[test]
    fn test_unsorted_input_rejected_or_sorted() {
        let mut data = ranked(6);
        data.swap(1, 4);

        let strict = PropensityGrouper::new(2, SortPolicy::RejectUnsorted).unwrap();
        assert!(matches!(
            strict.assign_groups(data.clone()),
            Err(AudienceError::UnsortedInput { row: 2 })
        ));

        let lenient = PropensityGrouper::new(2, SortPolicy::SortDescending).unwrap();
        let rows = lenient.assign_groups(data).unwrap();
        let top: Vec<_> = rows
            .iter()
            .filter(|r| r.group_number == 0)
            .map(|r| r.visitor.visitor_id.as_str())
            .collect();
        assert_eq!(top, vec!["v0", "v1", "v2"]);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let data = vec![
            ScoredVisitor::new("a", 0.9, false),
            ScoredVisitor::new("b", 0.5, false),
            ScoredVisitor::new("c", 0.5, false),
            ScoredVisitor::new("d", 0.5, false),
        ];
        let grouper = PropensityGrouper::new(2, SortPolicy::SortDescending).unwrap();
        let rows = grouper.assign_groups(data).unwrap();
        let order: Vec<_> = rows.iter().map(|r| r.visitor.visitor_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert_eq!(rows[1].group_number, 0);
        assert_eq!(rows[2].group_number, 1);
    }

    #[test]
    fn test_too_few_visitors_is_error() {
        let grouper = PropensityGrouper::new(3, SortPolicy::SortDescending).unwrap();
        assert!(grouper.assign_groups(ranked(2)).is_err());
        assert!(PropensityGrouper::new(0, SortPolicy::SortDescending).is_err());
    }

    #[test]
    fn test_kpi_per_group() {
        let mut data = ranked(6);
        for (i, v) in data.iter_mut().enumerate() {
            v.product_clicks = 1;
            v.product_views = 4;
            v.bounces = (i % 2) as u32;
            v.revenue = 10.0;
            v.label = i == 1 || i == 2 || i == 5;
        }
        let grouper = PropensityGrouper::new(2, SortPolicy::RejectUnsorted).unwrap();
        let rows = grouper.assign_groups(data).unwrap();
        let kpis = kpi_per_group(&rows);

        assert_eq!(kpis.len(), 2);
        let top = &kpis[0];
        assert_eq!(top.group_number, 0);
        assert_eq!(top.total_visitors, 3);
        assert_eq!(top.conversions, 2);
        assert!((top.conversion_rate - 200.0 / 3.0).abs() < 1e-9);
        assert!((top.ctr - 25.0).abs() < 1e-9);
        assert!((top.bounce_rate - 100.0 / 3.0).abs() < 1e-9);
        assert!((top.revenue - 30.0).abs() < 1e-9);
        assert_eq!(top.min_score, Some(1.0 - 2.0 / 6.0));
        assert_eq!(kpis[1].conversions, 1);
    }

    #[test]
    fn test_zero_views_gives_nan_ctr() {
        let kpi = kpi_for_slice(0, &[ScoredVisitor::new("x", 0.4, false)]);
        assert!(kpi.ctr.is_nan());
        assert_eq!(kpi.conversion_rate, 0.0);
        assert_eq!(kpi.min_score, None);

        let empty = kpi_for_slice(1, std::iter::empty());
        assert!(empty.conversion_rate.is_nan());
        assert!(empty.bounce_rate.is_nan());
    }

    #[test]
    fn test_quantile_bin_edges() {
        let bins: Vec<_> = (0..10).map(|p| quantile_bin(p, 10, 3)).collect();
        assert_eq!(bins, vec![0, 0, 0, 0, 1, 1, 1, 2, 2, 2]);
        assert_eq!(group_size(9000, 3), 3000);
    }
}
