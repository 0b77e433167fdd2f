//! Cohort statistics: arm sizes, chi-squared significance of the conversion
//! difference between Test and Control, plus score summaries.

use std::collections::BTreeMap;

use propensity_core::{AudienceError, AudienceResult, Cohort, CohortAssignment};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmCounts {
    pub test: u64,
    pub control: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortSizes {
    pub overall: ArmCounts,
    pub conversions: ArmCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignificanceCheck {
    #[serde(rename = "statistically significant")]
    Significant,
    #[serde(rename = "not statistically significant")]
    NotSignificant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceVerdict {
    pub p_value: f64,
    /// Percent, e.g. 95.
    pub ci_level: f64,
    pub check: SignificanceCheck,
    pub control_overall: u64,
    pub test_overall: u64,
    pub control_conversions: u64,
    pub test_conversions: u64,
}

/// Score distribution of one (audience, cohort) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreStats {
    pub maudience: String,
    pub cohort: Option<Cohort>,
    pub score_count: u64,
    pub score_min: f64,
    pub score_mean: f64,
    pub score_median: f64,
    pub score_max: f64,
}

/// Arm sizes and conversions (positive outcome labels) of Test and Control.
pub fn overall_and_converted_sizes(rows: &[CohortAssignment]) -> CohortSizes {
    let mut sizes = CohortSizes::default();
    for row in rows {
        let (overall, converted) = match row.cohort {
            Some(Cohort::Test) => (&mut sizes.overall.test, &mut sizes.conversions.test),
            Some(Cohort::Control) => (&mut sizes.overall.control, &mut sizes.conversions.control),
            None => continue,
        };
        *overall += 1;
        if row.visitor.label {
            *converted += 1;
        }
    }
    sizes
}

/// Pearson chi-squared test of equal proportions across two samples,
/// without continuity correction.
///
/// When every visitor converted or none did the statistic is 0 and the
/// p-value 1.
pub fn proportions_chisquare(sizes: &CohortSizes) -> AudienceResult<ChiSquareTest> {
    let CohortSizes {
        overall,
        conversions,
    } = *sizes;
    if overall.test == 0 || overall.control == 0 {
        return Err(AudienceError::EmptyCohort(format!(
            "test has {} and control has {} visitors",
            overall.test, overall.control
        )));
    }
    if conversions.test > overall.test || conversions.control > overall.control {
        return Err(AudienceError::Config(
            "conversions exceed cohort size".to_string(),
        ));
    }

    let (n1, n2) = (overall.test as f64, overall.control as f64);
    let pooled = (conversions.test + conversions.control) as f64 / (n1 + n2);
    if pooled <= 0.0 || pooled >= 1.0 {
        return Ok(ChiSquareTest {
            statistic: 0.0,
            p_value: 1.0,
        });
    }

    let diff = conversions.test as f64 / n1 - conversions.control as f64 / n2;
    let statistic = diff * diff / (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2));
    let chi2 = ChiSquared::new(1.0).map_err(|e| AudienceError::Stats(e.to_string()))?;
    Ok(ChiSquareTest {
        statistic,
        p_value: chi2.sf(statistic),
    })
}

/// One verdict per confidence level (a proportion such as 0.95):
/// significant iff `p_value < 1 - level`.
pub fn significance(
    sizes: &CohortSizes,
    confidence_levels: &[f64],
) -> AudienceResult<Vec<SignificanceVerdict>> {
    let test = proportions_chisquare(sizes)?;
    let verdicts = confidence_levels
        .iter()
        .map(|&level| {
            let check = if test.p_value < 1.0 - level {
                SignificanceCheck::Significant
            } else {
                SignificanceCheck::NotSignificant
            };
            info!(p_value = test.p_value, ci_level = level, ?check, "significance check");
            SignificanceVerdict {
                p_value: test.p_value,
                ci_level: 100.0 * level,
                check,
                control_overall: sizes.overall.control,
                test_overall: sizes.overall.test,
                control_conversions: sizes.conversions.control,
                test_conversions: sizes.conversions.test,
            }
        })
        .collect();
    Ok(verdicts)
}

/// One row per check label, keeping its first p-value and highest confidence level.
pub fn collapse_verdicts(verdicts: &[SignificanceVerdict]) -> Vec<SignificanceVerdict> {
    let mut collapsed: Vec<SignificanceVerdict> = Vec::new();
    for verdict in verdicts {
        match collapsed.iter_mut().find(|v| v.check == verdict.check) {
            Some(existing) => existing.ci_level = existing.ci_level.max(verdict.ci_level),
            None => collapsed.push(verdict.clone()),
        }
    }
    collapsed
}

/// Score count, min, mean, median and max per (audience, cohort), ordered by audience.
pub fn cohort_score_stats(rows: &[CohortAssignment]) -> Vec<ScoreStats> {
    let mut cells: BTreeMap<(&str, Option<Cohort>), Vec<f64>> = BTreeMap::new();
    for row in rows {
        cells
            .entry((row.maudience.as_str(), row.cohort))
            .or_default()
            .push(row.visitor.score);
    }

    cells
        .into_iter()
        .map(|((maudience, cohort), mut scores)| {
            scores.sort_by(|a, b| a.total_cmp(b));
            let count = scores.len();
            let mid = count / 2;
            let median = if count % 2 == 0 {
                0.5 * (scores[mid - 1] + scores[mid])
            } else {
                scores[mid]
            };
            ScoreStats {
                maudience: maudience.to_string(),
                cohort,
                score_count: count as u64,
                score_min: scores[0],
                score_mean: scores.iter().sum::<f64>() / count as f64,
                score_median: median,
                score_max: scores[count - 1],
            }
        })
        .collect()
}

/// Significance reporting with a fixed set of confidence levels.
pub struct CohortStatsReporter {
    confidence_levels: Vec<f64>,
}

impl CohortStatsReporter {
    pub fn new(confidence_levels: Vec<f64>) -> AudienceResult<Self> {
        if let Some(bad) = confidence_levels.iter().find(|c| !(**c > 0.0 && **c < 1.0)) {
            return Err(AudienceError::Config(format!(
                "confidence levels are proportions in (0, 1), got {bad}"
            )));
        }
        Ok(Self { confidence_levels })
    }

    pub fn evaluate(&self, rows: &[CohortAssignment]) -> AudienceResult<(CohortSizes, Vec<SignificanceVerdict>)> {
        let sizes = overall_and_converted_sizes(rows);
        info!(
            control = sizes.overall.control,
            control_conversions = sizes.conversions.control,
            test = sizes.overall.test,
            test_conversions = sizes.conversions.test,
            "cohort sizes"
        );
        let verdicts = significance(&sizes, &self.confidence_levels)?;
        Ok((sizes, verdicts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propensity_core::{AudienceStrategy, ScoredVisitor};

    fn sizes(test: (u64, u64), control: (u64, u64)) -> CohortSizes {
        CohortSizes {
            overall: ArmCounts {
                test: test.0,
                control: control.0,
            },
            conversions: ArmCounts {
                test: test.1,
                control: control.1,
            },
        }
    }

    fn assignment(id: &str, score: f64, label: bool, maudience: &str, cohort: Option<Cohort>) -> CohortAssignment {
        CohortAssignment {
            visitor: ScoredVisitor::new(id, score, label),
            group_number: 0,
            maudience: maudience.to_string(),
            cohort,
            audience_strategy: AudienceStrategy::MultiGroup,
        }
    }

    #[test]
    fn test_chisquare_matches_reference() {
        let result = proportions_chisquare(&sizes((100, 5), (100, 2))).unwrap();
        assert!((result.statistic - 1.332346).abs() < 1e-5);
        assert!((result.p_value - 0.248388).abs() < 1e-5);
    }

    #[test]
    fn test_significance_per_level() {
        let verdicts = significance(&sizes((500, 60), (500, 30)), &[0.95, 0.99, 0.9999]).unwrap();
        assert_eq!(verdicts.len(), 3);
        assert!((verdicts[0].p_value - 0.000917).abs() < 1e-5);
        assert_eq!(verdicts[0].check, SignificanceCheck::Significant);
        assert_eq!(verdicts[1].check, SignificanceCheck::Significant);
        assert_eq!(verdicts[2].check, SignificanceCheck::NotSignificant);
        assert_eq!(verdicts[0].test_conversions, 60);
        assert_eq!(verdicts[0].control_overall, 500);

        let collapsed = collapse_verdicts(&verdicts);
        assert_eq!(collapsed.len(), 2);
        assert!((collapsed[0].ci_level - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_difference_not_significant() {
        let verdicts = significance(&sizes((500, 30), (500, 28)), &[0.95]).unwrap();
        assert_eq!(verdicts[0].check, SignificanceCheck::NotSignificant);
    }

    #[test]
    fn test_zero_conversions_do_not_raise() {
        let verdicts = significance(&sizes((50, 0), (50, 0)), &[0.95]).unwrap();
        assert_eq!(verdicts[0].p_value, 1.0);
        assert_eq!(verdicts[0].check, SignificanceCheck::NotSignificant);
    }

    #[test]
    fn test_empty_arm_is_error() {
        assert!(matches!(
            proportions_chisquare(&sizes((0, 0), (10, 1))),
            Err(AudienceError::EmptyCohort(_))
        ));
    }

    #[test]
    fn test_sizes_and_score_stats() {
        let rows = vec![
            assignment("a", 0.9, true, "High", Some(Cohort::Test)),
            assignment("b", 0.7, false, "High", Some(Cohort::Test)),
            assignment("c", 0.8, true, "High", Some(Cohort::Control)),
            assignment("d", 0.6, false, "High", Some(Cohort::Control)),
            assignment("e", 0.5, true, "High", None),
            assignment("f", 0.2, false, "Low", None),
        ];
        let counted = overall_and_converted_sizes(&rows);
        assert_eq!(counted, sizes((2, 1), (2, 1)));

        let stats = cohort_score_stats(&rows);
        assert_eq!(stats.len(), 4);
        let high_test = stats
            .iter()
            .find(|s| s.maudience == "High" && s.cohort == Some(Cohort::Test))
            .unwrap();
        assert_eq!(high_test.score_count, 2);
        assert!((high_test.score_mean - 0.8).abs() < 1e-9);
        assert!((high_test.score_median - 0.8).abs() < 1e-9);
        assert_eq!(high_test.score_min, 0.7);
        assert_eq!(stats.last().unwrap().maudience, "Low");
    }

    #[test]
    fn test_verdict_check_labels_serialize() {
        let json = serde_json::to_string(&SignificanceCheck::NotSignificant).unwrap();
        assert_eq!(json, "\"not statistically significant\"");
    }

    #[test]
    fn test_reporter_rejects_percent_levels() {
        assert!(CohortStatsReporter::new(vec![95.0]).is_err());
        assert!(CohortStatsReporter::new(vec![0.95]).is_ok());
    }
}
