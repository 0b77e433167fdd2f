//! JSON documents read and written by the planner.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use propensity_cohorts::profile::AudienceProfile;
use propensity_cohorts::stats::{CohortSizes, ScoreStats, SignificanceVerdict};
use propensity_core::{AudienceStrategy, CohortAssignment, KpiSummary, SampleSizePlan};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output of `plan`: reference KPIs and sample sizes for both strategies.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlanDocument {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub num_groups: u32,
    pub reference_visitors: u64,
    pub kpis: Vec<KpiSummary>,
    pub plans: Vec<SampleSizePlan>,
}

/// Output of `assign`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CohortDocument {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub plan_run_id: Uuid,
    pub audience_strategy: AudienceStrategy,
    pub uplift: f64,
    pub power: f64,
    pub ci_level: f64,
    /// Plan rows the cohorts were drawn from. Empty when nothing was feasible.
    pub selected_plan: Vec<SampleSizePlan>,
    pub cohorts: Vec<CohortAssignment>,
    pub score_stats: Vec<ScoreStats>,
    pub profiles: Vec<AudienceProfile>,
}

/// Output of `evaluate`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluationDocument {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub cohort_run_id: Option<Uuid>,
    pub sizes: CohortSizes,
    pub verdicts: Vec<SignificanceVerdict>,
    pub summary: Vec<SignificanceVerdict>,
}

/// `evaluate` accepts a full cohort document or the bare cohort table,
/// e.g. after outcome labels were joined in by a downstream export.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CohortInput {
    Document(Box<CohortDocument>),
    Table(Vec<CohortAssignment>),
}

impl CohortInput {
    pub fn into_parts(self) -> (Option<Uuid>, Vec<CohortAssignment>) {
        match self {
            CohortInput::Document(doc) => (Some(doc.run_id), doc.cohorts),
            CohortInput::Table(rows) => (None, rows),
        }
    }
}

pub fn new_run() -> (Uuid, DateTime<Utc>) {
    (Uuid::new_v4(), Utc::now())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

/// Pretty-printed JSON to `path`, or to stdout when no path is given.
pub fn write_json<T: Serialize>(path: Option<&Path>, value: &T) -> anyhow::Result<()> {
    let mut writer: Box<dyn Write> = match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    serde_json::to_writer_pretty(&mut writer, value)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
