//! Recalculation job queue: durable, priority-ordered, lease-based.

pub mod listener;
pub mod queue;
pub mod scheduler;
pub mod worker;

use chrono::NaiveDate;
use fleet_proto::Identity;
use serde::{Deserialize, Serialize};

/// Derived views the engine maintains. `refresh_single_view` jobs name one
/// of these in their reason field; anything else is rejected (view names
/// are interpolated into SQL).
pub const DERIVED_VIEWS: [&str; 3] = [
    "mv_daily_violations",
    "mv_driver_scores",
    "mv_vehicle_scores",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RecomputeViolations,
    RefreshSingleView,
    RefreshAllViews,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::RecomputeViolations => "recompute_violations",
            JobKind::RefreshSingleView => "refresh_single_view",
            JobKind::RefreshAllViews => "refresh_all_views",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recompute_violations" => Some(JobKind::RecomputeViolations),
            "refresh_single_view" => Some(JobKind::RefreshSingleView),
            "refresh_all_views" => Some(JobKind::RefreshAllViews),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Manual,
    ConfigurationChange,
    FormulaVersionChange,
}

impl JobTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            JobTrigger::Manual => "manual",
            JobTrigger::ConfigurationChange => "configuration_change",
            JobTrigger::FormulaVersionChange => "formula_version_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(JobTrigger::Manual),
            "configuration_change" => Some(JobTrigger::ConfigurationChange),
            "formula_version_change" => Some(JobTrigger::FormulaVersionChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// Optional bounds on what a recomputation touches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobScope {
    pub identity: Option<Identity>,
    pub tenant: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl JobScope {
    pub fn unbounded() -> Self {
        JobScope::default()
    }
}

/// A job as handed to the worker after a successful claim.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub trigger: JobTrigger,
    pub priority: i32,
    pub reason: Option<String>,
    pub scope: JobScope,
}

/// Insert shape; smaller priority values run first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    pub trigger: JobTrigger,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub scope: JobScope,
}

fn default_priority() -> i32 {
    2
}
