use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use cmr_pipeline::{
    maybe_build_scheduler, report_runs_markdown, run_all, IntegrationPipeline, PipelineConfig,
    TenantRegistry,
};
use cmr_sources::FixtureCatalogProvider;
use cmr_storage::{
    connect_pool, run_migrations, CatalogProvider, MemoryMetricsRepository, MetricsRepository,
    PgCatalogProvider, PgMetricsRepository,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "cmr")]
#[command(about = "Catalog Metrics Reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one tenant for one date.
    Run {
        #[arg(long)]
        tenant: String,
        /// Reporting date (YYYY-MM-DD); defaults to the previous UTC day.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Reconcile every enabled tenant for one date.
    RunAll {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print a markdown digest of the latest runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Start the cron scheduler and block until interrupted.
    Schedule,
    /// Apply pending database migrations.
    Migrate,
}

fn default_date() -> Result<NaiveDate> {
    Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(1))
        .context("computing previous UTC day")
}

/// Fixture-only registries run without a database; anything else gets the
/// Postgres-backed catalog and repository.
async fn build_pipeline(
    config: &PipelineConfig,
    registry: &TenantRegistry,
) -> Result<IntegrationPipeline> {
    let fixture_only = registry
        .tenants
        .iter()
        .filter(|t| t.enabled)
        .all(|t| t.mode == "fixture");

    let (catalog, repository): (Arc<dyn CatalogProvider>, Arc<dyn MetricsRepository>) =
        if fixture_only {
            warn!("all enabled tenants are fixture-mode; using in-memory persistence");
            (
                Arc::new(FixtureCatalogProvider::new(
                    config.workspace_root.join("fixtures"),
                )),
                Arc::new(MemoryMetricsRepository::new()),
            )
        } else {
            let pool = connect_pool(&config.database_url).await?;
            (
                Arc::new(PgCatalogProvider::new(pool.clone())),
                Arc::new(PgMetricsRepository::new(pool)),
            )
        };

    IntegrationPipeline::new(config.clone(), catalog, repository)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Run { tenant, date } => {
            let registry = TenantRegistry::load(&config.workspace_root).await?;
            let Some(tenant_cfg) = registry.find(&tenant) else {
                bail!("unknown tenant {tenant}");
            };
            let date = match date {
                Some(date) => date,
                None => default_date()?,
            };
            let pipeline = build_pipeline(&config, &registry).await?;
            let result = pipeline.run(tenant_cfg, date).await;
            println!(
                "run {} for {} {}: {} (processed={} matched={} unmatched={} aggregated={})",
                result.run_id,
                result.tenant_id,
                result.metrics_date,
                if result.success { "done" } else { "FAILED" },
                result.stats.total_processed,
                result.stats.matched,
                result.stats.unmatched,
                result.stats.aggregated,
            );
            for error in &result.errors {
                eprintln!("  - {error}");
            }
            if !result.success {
                bail!("run failed for {tenant}");
            }
        }
        Commands::RunAll { date } => {
            let registry = TenantRegistry::load(&config.workspace_root).await?;
            let date = match date {
                Some(date) => date,
                None => default_date()?,
            };
            let pipeline = build_pipeline(&config, &registry).await?;
            let results = run_all(&pipeline, &registry, date).await;
            let failed = results.iter().filter(|r| !r.success).count();
            for result in &results {
                println!(
                    "{}: {} (matched={} unmatched={})",
                    result.tenant_id,
                    if result.success { "done" } else { "FAILED" },
                    result.stats.matched,
                    result.stats.unmatched,
                );
            }
            if failed > 0 {
                bail!("{failed} of {} runs failed", results.len());
            }
        }
        Commands::Report { runs } => {
            let markdown = report_runs_markdown(runs, &config.reports_dir)?;
            println!("{markdown}");
        }
        Commands::Schedule => {
            let registry = TenantRegistry::load(&config.workspace_root).await?;
            let pipeline = Arc::new(build_pipeline(&config, &registry).await?);
            let mut sched_config = config.clone();
            sched_config.scheduler_enabled = true;
            let Some(scheduler) =
                maybe_build_scheduler(&sched_config, pipeline, registry).await?
            else {
                bail!("scheduler did not start");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.run_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
