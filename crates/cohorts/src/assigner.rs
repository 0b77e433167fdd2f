//! Randomized test/control/excluded partitions of propensity groups.

use std::collections::{BTreeMap, HashSet};

use propensity_core::{
    AudienceError, AudienceResult, AudienceStrategy, Cohort, CohortAssignment, GroupNames,
    GroupedVisitor, SampleSizePlan,
};
use rand::seq::index;
use tracing::{info, warn};

use crate::random::{CohortDraw, RandomSource, SeededSource};

/// Per-arm size scaled from the reference population to the target one:
/// `floor(required * target_size / reference_size)`.
pub fn scaled_size(required: u64, target_size: usize, reference_size: u64) -> u64 {
    (required as u128 * target_size as u128 / reference_size as u128) as u64
}

/// Indices into the target dataset drawn for each arm of one group.
struct Partition {
    control: Vec<usize>,
    test: Vec<usize>,
}

pub struct CohortAssigner<R = SeededSource> {
    source: R,
}

impl<R: RandomSource> CohortAssigner<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Split each planned propensity group of `target` into Test, Control and
    /// Excluded visitors.
    ///
    /// `plan` holds the rows of one experimental configuration. For
    /// [`AudienceStrategy::MultiGroup`] each row covers one group. For
    /// [`AudienceStrategy::SingleGroup`] there must be exactly one row and it
    /// covers groups `0..=group_number`. Target rows outside every planned
    /// group are returned as Excluded under their own group's name.
    ///
    /// An empty plan yields an empty table.
    pub fn create_cohorts(
        &self,
        plan: &[SampleSizePlan],
        target: &[GroupedVisitor],
        names: &GroupNames,
        strategy: AudienceStrategy,
    ) -> AudienceResult<Vec<CohortAssignment>> {
        if plan.is_empty() {
            warn!("no suitable sample size found, no cohorts generated");
            return Ok(Vec::new());
        }
        ensure_unique_visitors(target)?;
        let plan = ordered_plan(plan, strategy)?;

        let mut output = Vec::with_capacity(target.len());
        let mut covered = vec![false; target.len()];

        for row in &plan {
            let members: Vec<usize> = target
                .iter()
                .enumerate()
                .filter(|(_, v)| match strategy {
                    AudienceStrategy::MultiGroup => v.group_number == row.group_number,
                    AudienceStrategy::SingleGroup => v.group_number <= row.group_number,
                })
                .map(|(i, _)| i)
                .collect();
            let maudience = names.name(row.group_number)?;
            let partition = self.draw_partition(row, &members)?;

            let mut tags: BTreeMap<usize, Cohort> = BTreeMap::new();
            tags.extend(partition.control.iter().map(|&i| (i, Cohort::Control)));
            tags.extend(partition.test.iter().map(|&i| (i, Cohort::Test)));

            for wanted in [Some(Cohort::Control), Some(Cohort::Test), None] {
                for &i in &members {
                    if tags.get(&i).copied() == wanted {
                        output.push(tag(&target[i], maudience, wanted, strategy));
                        covered[i] = true;
                    }
                }
            }

            info!(
                group = row.group_number,
                maudience,
                size = members.len(),
                excluded = members.len() - partition.control.len() - partition.test.len(),
                wanted = partition.control.len(),
                control = partition.control.len(),
                test = partition.test.len(),
                "created cohorts for audience group"
            );
        }

        for (i, visitor) in target.iter().enumerate() {
            if !covered[i] {
                let maudience = names.name(visitor.group_number)?;
                output.push(tag(visitor, maudience, None, strategy));
            }
        }

        verify_partition(&output)?;
        info!(rows = output.len(), strategy = strategy.id(), "generated cohorts");
        Ok(output)
    }

    fn draw_partition(&self, row: &SampleSizePlan, members: &[usize]) -> AudienceResult<Partition> {
        let group_number = row.group_number;
        let required = row.required_sample_size.ok_or_else(|| {
            AudienceError::Config(format!(
                "plan for group {group_number} has an undefined required sample size"
            ))
        })?;
        if row.group_size == 0 {
            return Err(AudienceError::Config(format!(
                "plan for group {group_number} has an empty reference group"
            )));
        }

        let wanted = scaled_size(required, members.len(), row.group_size) as usize;
        if wanted.saturating_mul(2) > members.len() {
            return Err(AudienceError::PartitionInvariant {
                group_number,
                reason: format!(
                    "two arms of {wanted} visitors do not fit in a group of {}",
                    members.len()
                ),
            });
        }

        let mut rng = self.source.rng_for(group_number, CohortDraw::Control);
        let control: Vec<usize> = index::sample(&mut rng, members.len(), wanted)
            .into_iter()
            .map(|i| members[i])
            .collect();

        let drawn: HashSet<usize> = control.iter().copied().collect();
        let remaining: Vec<usize> = members
            .iter()
            .copied()
            .filter(|i| !drawn.contains(i))
            .collect();

        let mut rng = self.source.rng_for(group_number, CohortDraw::Test);
        let test: Vec<usize> = index::sample(&mut rng, remaining.len(), wanted)
            .into_iter()
            .map(|i| remaining[i])
            .collect();

        Ok(Partition { control, test })
    }
}

fn tag(
    visitor: &GroupedVisitor,
    maudience: &str,
    cohort: Option<Cohort>,
    strategy: AudienceStrategy,
) -> CohortAssignment {
    CohortAssignment {
        visitor: visitor.visitor.clone(),
        group_number: visitor.group_number,
        maudience: maudience.to_string(),
        cohort,
        audience_strategy: strategy,
    }
}

fn ensure_unique_visitors(target: &[GroupedVisitor]) -> AudienceResult<()> {
    let mut seen = HashSet::with_capacity(target.len());
    for row in target {
        if !seen.insert(row.visitor.visitor_id.as_str()) {
            return Err(AudienceError::DuplicateVisitor(row.visitor.visitor_id.clone()));
        }
    }
    Ok(())
}

fn ordered_plan(
    plan: &[SampleSizePlan],
    strategy: AudienceStrategy,
) -> AudienceResult<Vec<SampleSizePlan>> {
    if let Some(other) = plan.iter().find(|r| r.audience_strategy != strategy) {
        return Err(AudienceError::Config(format!(
            "plan row for group {} belongs to strategy {}, expected {}",
            other.group_number,
            other.audience_strategy.id(),
            strategy.id()
        )));
    }
    if strategy == AudienceStrategy::SingleGroup && plan.len() != 1 {
        return Err(AudienceError::Config(format!(
            "single-group cohorts need exactly one plan row, got {}",
            plan.len()
        )));
    }

    let mut ordered = plan.to_vec();
    ordered.sort_by_key(|r| r.group_number);
    if let Some(pair) = ordered.windows(2).find(|w| w[0].group_number == w[1].group_number) {
        return Err(AudienceError::Config(format!(
            "plan has more than one row for group {}; select a single configuration first",
            pair[0].group_number
        )));
    }
    Ok(ordered)
}

/// Check that no visitor is tagged twice and that every audience has equally
/// sized Test and Control arms.
pub fn verify_partition(rows: &[CohortAssignment]) -> AudienceResult<()> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut arms: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for row in rows {
        if !seen.insert(row.visitor.visitor_id.as_str()) {
            return Err(AudienceError::DuplicateVisitor(row.visitor.visitor_id.clone()));
        }
        let entry = arms.entry(row.maudience.as_str()).or_default();
        match row.cohort {
            Some(Cohort::Test) => entry.0 += 1,
            Some(Cohort::Control) => entry.1 += 1,
            None => {}
        }
    }
    for (maudience, (test, control)) in arms {
        if test != control {
            let group_number = rows
                .iter()
                .find(|r| r.maudience == maudience)
                .map(|r| r.group_number)
                .unwrap_or_default();
            return Err(AudienceError::PartitionInvariant {
                group_number,
                reason: format!("{maudience} has {test} test and {control} control visitors"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use propensity_core::config::SeedPolicy;
    use propensity_core::ScoredVisitor;

    fn target(sizes: &[usize]) -> Vec<GroupedVisitor> {
        let mut rows = Vec::new();
        for (group, &size) in sizes.iter().enumerate() {
            for i in 0..size {
                rows.push(GroupedVisitor {
                    group_number: group as u32,
                    row_number: rows.len(),
                    visitor: ScoredVisitor::new(format!("g{group}-{i}"), 0.5, false),
                });
            }
        }
        rows
    }

    fn plan_row(group_number: u32, group_size: u64, required: u64) -> SampleSizePlan {
        SampleSizePlan {
            audience_strategy: AudienceStrategy::MultiGroup,
            group_number,
            group_size,
            group_size_proportion: None,
            group_min_propensity: Some(0.5),
            group_conv_rate: 10.0,
            ctr: 5.0,
            revenue: 0.0,
            bounce_rate: 40.0,
            uplift: 20.0,
            power: 80.0,
            ci_level: 95.0,
            required_sample_size: Some(required),
        }
    }

    fn names() -> GroupNames {
        GroupNames::new(["High", "Medium", "Low"]).unwrap()
    }

    fn assigner(policy: SeedPolicy) -> CohortAssigner {
        CohortAssigner::new(SeededSource::new(88, policy))
    }

    fn ids(rows: &[CohortAssignment], maudience: &str, cohort: Option<Cohort>) -> HashSet<String> {
        rows.iter()
            .filter(|r| r.maudience == maudience && r.cohort == cohort)
            .map(|r| r.visitor.visitor_id.clone())
            .collect()
    }

    #[test]
    fn test_partition_invariants_hold_per_group() {
        let target = target(&[100, 100, 100]);
        let plan = vec![plan_row(0, 1000, 200), plan_row(1, 1000, 100), plan_row(2, 1000, 300)];
        let rows = assigner(SeedPolicy::Shared)
            .create_cohorts(&plan, &target, &names(), AudienceStrategy::MultiGroup)
            .unwrap();

        assert_eq!(rows.len(), 300);
        for (name, expected) in [("High", 20), ("Medium", 10), ("Low", 30)] {
            let test = ids(&rows, name, Some(Cohort::Test));
            let control = ids(&rows, name, Some(Cohort::Control));
            let excluded = ids(&rows, name, None);
            assert_eq!(test.len(), expected);
            assert_eq!(control.len(), expected);
            assert!(test.is_disjoint(&control));
            assert!(excluded.is_disjoint(&test) && excluded.is_disjoint(&control));
            assert_eq!(test.len() + control.len() + excluded.len(), 100);
        }
        assert!(rows.iter().all(|r| r.audience_strategy == AudienceStrategy::MultiGroup));
    }

    #[test]
    fn test_rows_ordered_control_test_excluded() {
        let target = target(&[20]);
        let rows = assigner(SeedPolicy::Shared)
            .create_cohorts(&[plan_row(0, 20, 5)], &target, &names(), AudienceStrategy::MultiGroup)
            .unwrap();
        let cohorts: Vec<_> = rows.iter().map(|r| r.cohort).collect();
        assert!(cohorts[..5].iter().all(|c| *c == Some(Cohort::Control)));
        assert!(cohorts[5..10].iter().all(|c| *c == Some(Cohort::Test)));
        assert!(cohorts[10..].iter().all(|c| c.is_none()));
    }

    #[test]
    fn test_same_seed_same_assignment() {
        let target = target(&[500, 500, 500]);
        let plan = vec![plan_row(0, 500, 100), plan_row(1, 500, 100), plan_row(2, 500, 100)];
        for policy in [SeedPolicy::Shared, SeedPolicy::Independent] {
            let first = assigner(policy)
                .create_cohorts(&plan, &target, &names(), AudienceStrategy::MultiGroup)
                .unwrap();
            let second = assigner(policy)
                .create_cohorts(&plan, &target, &names(), AudienceStrategy::MultiGroup)
                .unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_seed_policies_differ() {
        let target = target(&[500]);
        let plan = vec![plan_row(0, 500, 100)];
        let shared = assigner(SeedPolicy::Shared)
            .create_cohorts(&plan, &target, &names(), AudienceStrategy::MultiGroup)
            .unwrap();
        let independent = assigner(SeedPolicy::Independent)
            .create_cohorts(&plan, &target, &names(), AudienceStrategy::MultiGroup)
            .unwrap();
        assert_ne!(
            ids(&shared, "High", Some(Cohort::Test)),
            ids(&independent, "High", Some(Cohort::Test))
        );
    }

    #[test]
    fn test_required_size_scales_to_target_group() {
        // reference group of 3,000 needs 600 per arm; target group of 1,500 gets 300
        let target = target(&[1500]);
        let rows = assigner(SeedPolicy::Shared)
            .create_cohorts(&[plan_row(0, 3000, 600)], &target, &names(), AudienceStrategy::MultiGroup)
            .unwrap();
        assert_eq!(ids(&rows, "High", Some(Cohort::Test)).len(), 300);
        assert_eq!(scaled_size(1766, 2999, 3000), 1765);
    }

    #[test]
    fn test_oversized_draw_fails() {
        let target = target(&[100]);
        let err = assigner(SeedPolicy::Shared)
            .create_cohorts(&[plan_row(0, 50, 30)], &target, &names(), AudienceStrategy::MultiGroup)
            .unwrap_err();
        assert!(matches!(err, AudienceError::PartitionInvariant { group_number: 0, .. }));
    }

    #[test]
    fn test_empty_plan_gives_empty_output() {
        let rows = assigner(SeedPolicy::Shared)
            .create_cohorts(&[], &target(&[10]), &names(), AudienceStrategy::MultiGroup)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_unplanned_groups_are_excluded() {
        let target = target(&[10, 10, 10]);
        let rows = assigner(SeedPolicy::Shared)
            .create_cohorts(&[plan_row(0, 10, 2)], &target, &names(), AudienceStrategy::MultiGroup)
            .unwrap();
        assert_eq!(rows.len(), 30);
        assert_eq!(ids(&rows, "Low", None).len(), 10);
        assert_eq!(ids(&rows, "Medium", None).len(), 10);
    }

    #[test]
    fn test_single_group_uses_cumulative_slice() {
        let target = target(&[10, 10, 10]);
        let mut row = plan_row(1, 20, 4);
        row.audience_strategy = AudienceStrategy::SingleGroup;
        let rows = assigner(SeedPolicy::Shared)
            .create_cohorts(&[row], &target, &names(), AudienceStrategy::SingleGroup)
            .unwrap();

        let test = ids(&rows, "Medium", Some(Cohort::Test));
        let control = ids(&rows, "Medium", Some(Cohort::Control));
        assert_eq!(test.len(), 4);
        assert_eq!(control.len(), 4);
        assert_eq!(ids(&rows, "Medium", None).len(), 12);
        assert_eq!(ids(&rows, "Low", None).len(), 10);
        assert!(rows
            .iter()
            .filter(|r| r.cohort.is_some())
            .all(|r| r.group_number <= 1));
    }

    #[test]
    fn test_plan_shape_errors() {
        let target = target(&[10]);
        let a = assigner(SeedPolicy::Shared);
        let duplicated = vec![plan_row(0, 10, 1), plan_row(0, 10, 2)];
        assert!(matches!(
            a.create_cohorts(&duplicated, &target, &names(), AudienceStrategy::MultiGroup),
            Err(AudienceError::Config(_))
        ));
        assert!(matches!(
            a.create_cohorts(&[plan_row(0, 10, 1)], &target, &names(), AudienceStrategy::SingleGroup),
            Err(AudienceError::Config(_))
        ));
        let mut undefined = plan_row(0, 10, 1);
        undefined.required_sample_size = None;
        assert!(a
            .create_cohorts(&[undefined], &target, &names(), AudienceStrategy::MultiGroup)
            .is_err());
        let unnamed = GroupNames::new(Vec::<String>::new()).unwrap();
        assert!(matches!(
            a.create_cohorts(&[plan_row(0, 10, 1)], &target, &unnamed, AudienceStrategy::MultiGroup),
            Err(AudienceError::UnmappedGroup(0))
        ));
    }

    #[test]
    fn test_duplicate_visitor_is_fatal() {
        let mut target = target(&[10]);
        target[3].visitor.visitor_id = target[0].visitor.visitor_id.clone();
        assert!(matches!(
            assigner(SeedPolicy::Shared).create_cohorts(
                &[plan_row(0, 10, 2)],
                &target,
                &names(),
                AudienceStrategy::MultiGroup
            ),
            Err(AudienceError::DuplicateVisitor(_))
        ));
    }
}
