use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use spimex_core::DateRange;
use spimex_sync::{BulletinPipeline, Database, PipelineConfig, RunSummary, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "spimex-cli")]
#[command(about = "Loads SPIMEX oil product trading results into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, parse and store every bulletin in the range (default).
    Sync(SyncArgs),
    /// Print the bulletin links found for a range.
    Locate {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Parse one downloaded bulletin and print its rows as JSON.
    Parse {
        file: PathBuf,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Apply the embedded database migrations.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    start: Option<NaiveDate>,
    #[arg(long)]
    end: Option<NaiveDate>,
    /// Run everything except the database writes.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn range(&self) -> Result<DateRange> {
        let defaults = spimex_sync::default_range();
        Ok(DateRange::new(
            self.start.unwrap_or(defaults.start()),
            self.end.unwrap_or(defaults.end()),
        )?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let range = args.range()?;
            let summary = if args.dry_run {
                spimex_sync::run_dry_from_env(range).await?
            } else {
                spimex_sync::run_sync_from_env(range).await?
            };
            print_summary(&summary);
        }
        Commands::Locate { start, end } => {
            let range = DateRange::new(start, end)?;
            let pipeline = BulletinPipeline::new(PipelineConfig::from_env()?)?;
            let outcome = pipeline.locate(range).await;
            for link in &outcome.links {
                println!("{}\t{}", link.trade_date, link.url);
            }
            info!(links = outcome.links.len(), pages = outcome.pages_read, stop = ?outcome.stop, "locate finished");
        }
        Commands::Parse { file, date } => {
            let records = spimex_adapters::parse_bulletin(&file, date, Utc::now().naive_utc())
                .with_context(|| format!("parsing {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let db = Database::connect(&config.db)
                .await
                .context("connecting to postgres")?;
            db.migrate().await.context("applying migrations")?;
            db.close().await;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} located={} persisted={} failed={} rows={} report={}",
        summary.run_id,
        summary.located,
        summary.persisted_bulletins,
        summary.failed_bulletins,
        summary.persisted_rows,
        summary
            .report_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_without_dates_uses_default_range() {
        let cli = Cli::try_parse_from(["spimex-cli", "sync", "--dry-run"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert!(args.dry_run);
        assert_eq!(args.range().unwrap(), spimex_sync::default_range());
    }

    #[test]
    fn inverted_sync_range_is_rejected() {
        let cli = Cli::try_parse_from(["spimex-cli", "sync", "--start", "2024-02-01", "--end", "2024-01-01"])
            .unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert!(args.range().is_err());
    }

    #[test]
    fn parse_requires_a_date() {
        assert!(Cli::try_parse_from(["spimex-cli", "parse", "oil_xls_20240115.xls"]).is_err());
        let cli = Cli::try_parse_from(["spimex-cli", "parse", "oil_xls_20240115.xls", "--date", "2024-01-15"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Parse { .. })));
    }
}
