//! Propensity Planner: sizes a propensity campaign on a reference period,
//! draws Test/Control cohorts on the target period and checks the outcome.

mod io;

use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use propensity_cohorts::profile::audience_profile;
use propensity_cohorts::stats::{cohort_score_stats, collapse_verdicts};
use propensity_cohorts::{CohortAssigner, CohortStatsReporter, SeededSource};
use propensity_core::config::CohortConfig;
use propensity_core::{AudienceStrategy, PlannerConfig, SampleSizePlan, ScoredVisitor};
use propensity_sizing::grouper::kpi_per_group;
use propensity_sizing::planner::{
    by_strategy, combine_plans, complete_configurations, feasible, select_configuration,
};
use propensity_sizing::{PropensityGrouper, SampleSizePlanner};
use tracing::{info, warn};

use crate::io::{CohortDocument, CohortInput, EvaluationDocument, PlanDocument};

const DEFAULT_LOG_FILTER: &str =
    "propensity_planner=info,propensity_cohorts=info,propensity_sizing=info";

#[derive(Parser, Debug)]
#[command(name = "propensity-planner")]
#[command(about = "Audience sizing and cohort assignment for propensity campaigns")]
#[command(version)]
struct Cli {
    /// Config file; environment variables prefixed PROPENSITY_PLANNER__ override it
    #[arg(short, long, env = "PROPENSITY_PLANNER_CONFIG")]
    config: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Number of propensity groups (overrides config)
    #[arg(long, global = true, env = "PROPENSITY_PLANNER__GROUPING__NUM_GROUPS")]
    num_groups: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group a scored reference dataset and compute sample sizes for both strategies
    Plan {
        /// Scored reference visitors (JSON array)
        #[arg(short, long)]
        reference: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Draw Test/Control cohorts on a scored target dataset
    Assign {
        /// Plan document written by `plan`
        #[arg(short, long)]
        plan: PathBuf,

        /// Scored target visitors (JSON array)
        #[arg(short, long)]
        target: PathBuf,

        /// Audience strategy: 1 = multi-group, 2 = single-group
        #[arg(long)]
        strategy: Option<u8>,

        /// Cumulative slice for the single-group strategy
        #[arg(long)]
        slice: Option<u32>,

        /// Minimum detectable uplift, percent
        #[arg(long)]
        uplift: Option<f64>,

        /// Statistical power, percent
        #[arg(long)]
        power: Option<f64>,

        /// Confidence level, percent
        #[arg(long)]
        ci_level: Option<f64>,

        /// Experiment seed
        #[arg(long, env = "PROPENSITY_PLANNER__COHORTS__EXPERIMENT_SEED")]
        seed: Option<u64>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Test whether Test and Control converted at different rates
    Evaluate {
        /// Cohort document written by `assign`, or a bare cohort table
        #[arg(short, long)]
        cohorts: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = PlannerConfig::load(cli.config.as_deref())?;
    if let Some(num_groups) = cli.num_groups {
        config.grouping.num_groups = num_groups;
    }

    match cli.command {
        Commands::Plan { reference, output } => {
            config.validate()?;
            cmd_plan(&config, &reference, output.as_deref())
        }
        Commands::Assign {
            plan,
            target,
            strategy,
            slice,
            uplift,
            power,
            ci_level,
            seed,
            output,
        } => {
            let cohorts = &mut config.cohorts;
            if let Some(strategy) = strategy {
                cohorts.audience_strategy = AudienceStrategy::try_from(strategy)?;
            }
            if let Some(slice) = slice {
                cohorts.single_group_slice = slice;
            }
            if let Some(uplift) = uplift {
                cohorts.uplift = uplift;
            }
            if let Some(power) = power {
                cohorts.power = power;
            }
            if let Some(ci_level) = ci_level {
                cohorts.ci_level = ci_level;
            }
            if let Some(seed) = seed {
                cohorts.experiment_seed = seed;
            }
            config.validate()?;
            cmd_assign(&config, &plan, &target, output.as_deref())
        }
        Commands::Evaluate { cohorts, output } => {
            config.validate()?;
            cmd_evaluate(&config, &cohorts, output.as_deref())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

fn cmd_plan(config: &PlannerConfig, reference: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let visitors: Vec<ScoredVisitor> = io::read_json(reference)?;
    io::write_json(output, &build_plan(config, visitors)?)
}

fn cmd_assign(
    config: &PlannerConfig,
    plan: &Path,
    target: &Path,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let plan_doc: PlanDocument = io::read_json(plan)?;
    let visitors: Vec<ScoredVisitor> = io::read_json(target)?;
    io::write_json(output, &build_cohorts(config, &plan_doc, visitors)?)
}

fn cmd_evaluate(config: &PlannerConfig, cohorts: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let input: CohortInput = io::read_json(cohorts)?;
    io::write_json(output, &build_evaluation(config, input)?)
}

/// Group the reference visitors and size both strategies on their KPIs.
fn build_plan(config: &PlannerConfig, visitors: Vec<ScoredVisitor>) -> anyhow::Result<PlanDocument> {
    let num_groups = config.grouping.num_groups;
    let reference_visitors = visitors.len() as u64;
    info!(visitors = reference_visitors, num_groups, "planning on reference dataset");

    let grouper = PropensityGrouper::new(num_groups, config.grouping.sort_policy)?;
    let grouped = grouper.assign_groups(visitors)?;
    let kpis = kpi_per_group(&grouped);

    let planner = SampleSizePlanner::new(config.ranges.clone())?;
    let multi = planner.plan_multi_group(&kpis)?;
    let single = planner.plan_single_group(&grouped, num_groups)?;
    let plans = combine_plans(multi, single);
    info!(rows = plans.len(), "sample size plan ready");

    let (run_id, generated_at) = io::new_run();
    Ok(PlanDocument {
        run_id,
        generated_at,
        num_groups,
        reference_visitors,
        kpis,
        plans,
    })
}

/// Plan rows of the selected configuration that leave room for both arms,
/// together with the per-arm bound they were checked against.
///
/// Multi-group needs a row for every group. Single-group keeps only the
/// configured cumulative slice. The bound is half the smallest reference
/// audience among the candidates; arms scale with target/reference size, so
/// a row within it always fits twice in the target audience.
fn select_feasible_plan(
    plan_doc: &PlanDocument,
    selected: &CohortConfig,
    num_groups: u32,
) -> (Vec<SampleSizePlan>, u64) {
    let strategy = selected.audience_strategy;
    let mut candidates = by_strategy(&plan_doc.plans, strategy);
    let groups_needed = match strategy {
        AudienceStrategy::MultiGroup => num_groups,
        AudienceStrategy::SingleGroup => {
            candidates.retain(|r| r.group_number == selected.single_group_slice);
            1
        }
    };
    let bound = candidates.iter().map(|r| r.group_size / 2).min().unwrap_or(0);
    let chosen = select_configuration(
        &complete_configurations(&feasible(&candidates, bound), groups_needed),
        selected.uplift,
        selected.power,
        selected.ci_level,
    );
    if chosen.is_empty() {
        warn!(
            uplift = selected.uplift,
            power = selected.power,
            ci_level = selected.ci_level,
            strategy = strategy.id(),
            bound,
            "selected configuration is not feasible"
        );
    }
    (chosen, bound)
}

/// Group the target visitors and draw cohorts from the feasible plan rows.
fn build_cohorts(
    config: &PlannerConfig,
    plan_doc: &PlanDocument,
    visitors: Vec<ScoredVisitor>,
) -> anyhow::Result<CohortDocument> {
    let num_groups = config.grouping.num_groups;
    let selected = &config.cohorts;
    if plan_doc.num_groups != num_groups {
        bail!(
            "plan {} was built for {} groups, configured for {num_groups}",
            plan_doc.run_id,
            plan_doc.num_groups
        );
    }

    let grouper = PropensityGrouper::new(num_groups, config.grouping.sort_policy)?;
    let target_rows = grouper.assign_groups(visitors)?;
    let (chosen, _) = select_feasible_plan(plan_doc, selected, num_groups);

    let assigner = CohortAssigner::new(SeededSource::new(
        selected.experiment_seed,
        selected.seed_policy,
    ));
    let cohorts = assigner.create_cohorts(
        &chosen,
        &target_rows,
        &config.grouping.group_names,
        selected.audience_strategy,
    )?;
    let score_stats = cohort_score_stats(&cohorts);
    let profiles = audience_profile(&cohorts);

    let (run_id, generated_at) = io::new_run();
    Ok(CohortDocument {
        run_id,
        generated_at,
        plan_run_id: plan_doc.run_id,
        audience_strategy: selected.audience_strategy,
        uplift: selected.uplift,
        power: selected.power,
        ci_level: selected.ci_level,
        selected_plan: chosen,
        cohorts,
        score_stats,
        profiles,
    })
}

fn build_evaluation(config: &PlannerConfig, input: CohortInput) -> anyhow::Result<EvaluationDocument> {
    let (cohort_run_id, rows) = input.into_parts();

    let reporter = CohortStatsReporter::new(config.significance.confidence_levels.clone())?;
    let (sizes, verdicts) = reporter.evaluate(&rows)?;
    let summary = collapse_verdicts(&verdicts);

    let (run_id, generated_at) = io::new_run();
    Ok(EvaluationDocument {
        run_id,
        generated_at,
        cohort_run_id,
        sizes,
        verdicts,
        summary,
    })
}
