// enqueue-recalc: operator CLI for the recalculation queue.
//
// Examples:
//   enqueue-recalc --job-kind refresh_all_views --reason all
//   enqueue-recalc --job-kind recompute_violations --scope-identity 123456789012345
//   enqueue-recalc --job-kind refresh_single_view --reason mv_daily_violations

use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use engine::recalc::queue::{JobStore, PgJobStore};
use engine::recalc::{JobKind, JobScope, JobTrigger, NewJob};
use fleet_proto::Identity;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliJobKind {
    RecomputeViolations,
    RefreshSingleView,
    RefreshAllViews,
}

impl From<CliJobKind> for JobKind {
    fn from(kind: CliJobKind) -> JobKind {
        match kind {
            CliJobKind::RecomputeViolations => JobKind::RecomputeViolations,
            CliJobKind::RefreshSingleView => JobKind::RefreshSingleView,
            CliJobKind::RefreshAllViews => JobKind::RefreshAllViews,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTrigger {
    Manual,
    FormulaVersionChange,
}

impl From<CliTrigger> for JobTrigger {
    fn from(trigger: CliTrigger) -> JobTrigger {
        match trigger {
            CliTrigger::Manual => JobTrigger::Manual,
            CliTrigger::FormulaVersionChange => JobTrigger::FormulaVersionChange,
        }
    }
}

/// Enqueue a recalculation job.
#[derive(Debug, Parser)]
#[command(name = "enqueue-recalc")]
struct Args {
    #[arg(long, value_enum)]
    job_kind: CliJobKind,

    #[arg(long, value_enum, default_value = "manual")]
    trigger: CliTrigger,

    /// Limit recomputation to one device.
    #[arg(long)]
    scope_identity: Option<Identity>,

    /// Limit recomputation to one tenant.
    #[arg(long)]
    scope_tenant: Option<i64>,

    /// Inclusive start date (YYYY-MM-DD).
    #[arg(long)]
    scope_date_from: Option<NaiveDate>,

    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long)]
    scope_date_to: Option<NaiveDate>,

    /// For refresh_single_view: the view name. Free-form otherwise.
    #[arg(long)]
    reason: Option<String>,

    /// Smaller runs first.
    #[arg(long, default_value_t = 2)]
    priority: i32,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if matches!(args.job_kind, CliJobKind::RefreshSingleView) && args.reason.is_none() {
        eprintln!("error: --reason (the view name) is required for refresh_single_view");
        std::process::exit(2);
    }

    let config_path = fleet_infra::config::config_path();
    let cfg: engine::EngineConfig = match engine::config::load_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: cannot load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    let pool = match fleet_infra::db::create_pool(&cfg.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("error: database connection failed: {e}");
            std::process::exit(1);
        }
    };

    let job = NewJob {
        kind: args.job_kind.into(),
        trigger: args.trigger.into(),
        priority: args.priority,
        reason: args.reason,
        scope: JobScope {
            identity: args.scope_identity,
            tenant: args.scope_tenant,
            date_from: args.scope_date_from,
            date_to: args.scope_date_to,
        },
    };

    match PgJobStore::new(pool).enqueue(job).await {
        Ok(id) => println!("enqueued job id={id}"),
        Err(e) => {
            eprintln!("error: enqueue failed: {e}");
            std::process::exit(1);
        }
    }
}
