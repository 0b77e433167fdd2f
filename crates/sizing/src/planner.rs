//! Sample size plans for both audience strategies, and the filters that
//! narrow a plan down to configurations a target population can support.

use std::collections::{BTreeMap, BTreeSet};

use propensity_core::{
    AudienceResult, AudienceStrategy, GroupedVisitor, KpiSummary, SampleSizePlan, StatRanges,
};
use tracing::{debug, info};

use crate::calculator::required_sample_size;
use crate::grouper::{group_size, kpi_for_slice};

/// Expands experiment parameter ranges into sample size plans.
pub struct SampleSizePlanner {
    ranges: StatRanges,
}

impl SampleSizePlanner {
    pub fn new(ranges: StatRanges) -> AudienceResult<Self> {
        ranges.validate()?;
        Ok(Self { ranges })
    }

    /// One row per (group, uplift, power, confidence), each group sized on its
    /// own conversion rate.
    pub fn plan_multi_group(&self, kpis: &[KpiSummary]) -> AudienceResult<Vec<SampleSizePlan>> {
        let mut rows = Vec::with_capacity(kpis.len() * self.ranges.combinations());
        for kpi in kpis {
            self.push_rows(&mut rows, kpi, AudienceStrategy::MultiGroup, None)?;
        }
        info!(rows = rows.len(), groups = kpis.len(), "planned multi-group sample sizes");
        Ok(rows)
    }

    /// One row per cumulative slice and (uplift, power, confidence).
    ///
    /// Slice `k` (1-based) holds the top `group_size * k` ranked visitors; its
    /// row carries `group_number = k - 1` and so covers groups `0..=k-1`.
    /// `ranked` must be ordered by descending score, as produced by
    /// [`crate::PropensityGrouper::assign_groups`].
    pub fn plan_single_group(
        &self,
        ranked: &[GroupedVisitor],
        num_groups: u32,
    ) -> AudienceResult<Vec<SampleSizePlan>> {
        let total = ranked.len();
        let slice_step = group_size(total, num_groups);
        let mut rows = Vec::with_capacity(num_groups as usize * self.ranges.combinations());

        for k in 1..=num_groups {
            let slice_len = (slice_step * k as usize).min(total);
            let slice = &ranked[..slice_len];
            let kpi = kpi_for_slice(k - 1, slice.iter().map(|r| &r.visitor));
            let min_propensity = slice
                .iter()
                .map(|r| r.visitor.score)
                .min_by(|a, b| a.total_cmp(b));
            let proportion = 100.0 * slice_len as f64 / total as f64;
            debug!(slice = k, slice_len, proportion, "single-group slice");

            let first = rows.len();
            self.push_rows(&mut rows, &kpi, AudienceStrategy::SingleGroup, Some(proportion))?;
            for row in &mut rows[first..] {
                row.group_min_propensity = min_propensity;
            }
        }
        info!(rows = rows.len(), slices = num_groups, "planned single-group sample sizes");
        Ok(rows)
    }

    fn push_rows(
        &self,
        rows: &mut Vec<SampleSizePlan>,
        kpi: &KpiSummary,
        strategy: AudienceStrategy,
        proportion: Option<f64>,
    ) -> AudienceResult<()> {
        for &uplift in &self.ranges.uplift_pct {
            for &power in &self.ranges.power_pct {
                for &ci_level in &self.ranges.confidence_pct {
                    rows.push(SampleSizePlan {
                        audience_strategy: strategy,
                        group_number: kpi.group_number,
                        group_size: kpi.total_visitors,
                        group_size_proportion: proportion,
                        group_min_propensity: kpi.min_score,
                        group_conv_rate: kpi.conversion_rate,
                        ctr: kpi.ctr,
                        revenue: kpi.revenue,
                        bounce_rate: kpi.bounce_rate,
                        uplift,
                        power,
                        ci_level,
                        required_sample_size: required_sample_size(
                            kpi.conversion_rate,
                            uplift,
                            power,
                            ci_level,
                        )?,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Both strategies' rows in one flat table, multi-group first.
pub fn combine_plans(multi: Vec<SampleSizePlan>, single: Vec<SampleSizePlan>) -> Vec<SampleSizePlan> {
    let mut combined = multi;
    combined.extend(single);
    combined
}

pub fn by_strategy(rows: &[SampleSizePlan], strategy: AudienceStrategy) -> Vec<SampleSizePlan> {
    rows.iter()
        .filter(|r| r.audience_strategy == strategy)
        .cloned()
        .collect()
}

/// Rows whose required size fits in `max_sample_size`. Undefined sizes are dropped.
pub fn feasible(rows: &[SampleSizePlan], max_sample_size: u64) -> Vec<SampleSizePlan> {
    rows.iter()
        .filter(|r| matches!(r.required_sample_size, Some(n) if n <= max_sample_size))
        .cloned()
        .collect()
}

/// Rows of configurations that still cover `num_groups` distinct groups.
pub fn complete_configurations(rows: &[SampleSizePlan], num_groups: u32) -> Vec<SampleSizePlan> {
    let mut groups: BTreeMap<(u64, u64, u64), BTreeSet<u32>> = BTreeMap::new();
    for row in rows {
        groups
            .entry(configuration_key(row))
            .or_default()
            .insert(row.group_number);
    }
    rows.iter()
        .filter(|r| groups[&configuration_key(r)].len() == num_groups as usize)
        .cloned()
        .collect()
}

fn configuration_key(row: &SampleSizePlan) -> (u64, u64, u64) {
    (row.uplift.to_bits(), row.power.to_bits(), row.ci_level.to_bits())
}

/// Rows for one experimental configuration, ascending by group number.
pub fn select_configuration(
    rows: &[SampleSizePlan],
    uplift: f64,
    power: f64,
    ci_level: f64,
) -> Vec<SampleSizePlan> {
    let mut selected: Vec<SampleSizePlan> = rows
        .iter()
        .filter(|r| r.matches(uplift, power, ci_level))
        .cloned()
        .collect();
    selected.sort_by_key(|r| r.group_number);
    selected
}
