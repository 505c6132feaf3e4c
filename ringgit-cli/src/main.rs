//! Ringgit CLI: provisioning, scrape and load commands.
//!
//! Commands:
//! - `setup-tables`: create missing warehouse tables from schema descriptors
//! - `scrape-bonds`: bring the local bond-yield files up to date
//! - `load-pricecatcher`: append new price-catcher transactions to the warehouse
//! - `status`: report vehicle-file dates and the price-catcher watermark

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ringgit_core::bonds::{run_scrape, BnmClient, ScrapeOptions, VehicleStore};
use ringgit_core::calendar::today_in;
use ringgit_core::config::{load_env_file, Settings};
use ringgit_core::logging::{init_logging, LOAD_PRICECATCHER_LOG, SCRAPE_BONDS_LOG, SETUP_TABLES_LOG};
use ringgit_core::pricecatcher::{run_load, DataGovClient, LoadOptions};
use ringgit_core::schema::provision_tables;
use ringgit_core::warehouse;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "ringgit",
    about = "Ringgit CLI: warehouse provisioning, bond-yield scrape and price-catcher load"
)]
struct Cli {
    /// Path to a TOML settings file. Defaults to ./ringgit.toml if present.
    #[arg(long, global = true, env = "RINGGIT_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file. Defaults to ./.env if present.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Append logs to this file instead of the job's default log file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create warehouse tables from *_schema.json descriptors, skipping existing ones.
    SetupTables {
        /// Descriptor directory. Overrides schemas.dir.
        #[arg(long)]
        schemas_dir: Option<PathBuf>,
    },
    /// Scrape bond yields since the latest local datapoint and merge them in.
    ScrapeBonds {
        /// Directory of the vehicle JSON files. Overrides bonds.vehicles_dir.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Directory for yearly raw snapshots. Overrides bonds.snapshot_dir.
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Skip the pauses between batches and years.
        #[arg(long, default_value_t = false)]
        no_delay: bool,
    },
    /// Load price-catcher snapshots newer than the stored watermark.
    LoadPricecatcher {
        /// Maximum rows per load batch. Overrides pricecatcher.batch_rows.
        #[arg(long)]
        batch_rows: Option<usize>,
    },
    /// Report the latest date of each vehicle file and the price-catcher watermark.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    load_env_file(cli.env_file.as_deref())?;
    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply_process_env()?;

    let default_log = match &cli.command {
        Commands::SetupTables { schemas_dir } => {
            if let Some(dir) = schemas_dir {
                settings.schemas.dir = dir.clone();
            }
            Some(SETUP_TABLES_LOG)
        }
        Commands::ScrapeBonds {
            data_dir,
            snapshot_dir,
            ..
        } => {
            if let Some(dir) = data_dir {
                settings.bonds.vehicles_dir = dir.clone();
            }
            if let Some(dir) = snapshot_dir {
                settings.bonds.snapshot_dir = dir.clone();
            }
            Some(SCRAPE_BONDS_LOG)
        }
        Commands::LoadPricecatcher { batch_rows } => {
            if let Some(rows) = batch_rows {
                settings.pricecatcher.batch_rows = *rows;
            }
            Some(LOAD_PRICECATCHER_LOG)
        }
        Commands::Status => None,
    };
    settings.validate()?;

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| default_log.and_then(|name| settings.log_file(name)));
    init_logging(&settings.logging.level, log_file.as_deref())?;

    match cli.command {
        Commands::SetupTables { .. } => run_setup_tables(&settings),
        Commands::ScrapeBonds { no_delay, .. } => run_scrape_bonds(&settings, no_delay),
        Commands::LoadPricecatcher { .. } => run_load_pricecatcher(&settings),
        Commands::Status => run_status(&settings),
    }
}

fn run_setup_tables(settings: &Settings) -> Result<()> {
    let wh = warehouse::open(&settings.warehouse)?;
    let report = provision_tables(wh.as_ref(), &settings.schemas.dir)
        .with_context(|| format!("provisioning from {}", settings.schemas.dir.display()))?;

    println!(
        "Tables: {} created, {} already present, {} failed",
        report.successful.len(),
        report.exists.len(),
        report.failed.len()
    );
    if report.has_failures() {
        for table in &report.failed {
            eprintln!("Failed: {table}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_scrape_bonds(settings: &Settings, no_delay: bool) -> Result<()> {
    let bonds = &settings.bonds;
    let source = BnmClient::from_settings(bonds)?;
    let store = VehicleStore::new(&bonds.vehicles_dir, bonds.vehicles.clone());
    let mut options = ScrapeOptions::from_settings(bonds);
    if no_delay {
        options = options.without_delays();
    }

    let today = today_in(settings.timezone()?);
    let summary = run_scrape(&source, &store, &options, bonds.floor_date, today)?;

    println!("Watermark:        {}", summary.watermark);
    for year in &summary.years {
        println!(
            "  {}: {} requests, {} failed, {:.3}s -> {}",
            year.year,
            year.requests,
            year.failed,
            year.elapsed_secs,
            year.snapshot.display()
        );
    }
    for (file, n) in &summary.appended {
        println!("  {file}: +{n}");
    }
    if summary.unrouted > 0 {
        println!("  unmapped records dropped: {}", summary.unrouted);
    }
    println!("Records appended: {}", summary.total_appended());
    Ok(())
}

fn run_load_pricecatcher(settings: &Settings) -> Result<()> {
    let pc = &settings.pricecatcher;
    let wh = warehouse::open(&settings.warehouse)?;
    let source = DataGovClient::new(&pc.base_url, Duration::from_secs(pc.timeout_secs))?;
    let today = today_in(settings.timezone()?);

    let summary = run_load(&source, wh.as_ref(), &LoadOptions::from_settings(settings), today)?;
    if summary.up_to_date {
        println!("Data is up to date ({})", summary.new_watermark);
        return Ok(());
    }
    println!(
        "Months: {} attempted, {} unavailable",
        summary.months_attempted, summary.months_missing
    );
    println!("Rows loaded:  {} in {} batches", summary.rows_loaded, summary.batches);
    println!(
        "Watermark:    {} -> {}",
        summary.previous_watermark, summary.new_watermark
    );
    Ok(())
}

fn run_status(settings: &Settings) -> Result<()> {
    let bonds = &settings.bonds;
    let store = VehicleStore::new(&bonds.vehicles_dir, bonds.vehicles.clone());

    println!("Vehicle files ({}):", store.dir().display());
    for vehicle in store.vehicles() {
        let state = if !store.path(&vehicle.file).exists() {
            "missing".to_string()
        } else {
            match store.file_latest(&vehicle.file) {
                Some(date) => date.to_string(),
                None => "empty or unreadable".to_string(),
            }
        };
        println!("  {:<40} {state}", vehicle.file);
    }

    let wh = warehouse::open(&settings.warehouse)?;
    let pc = &settings.pricecatcher;
    match wh.read_watermark(&settings.warehouse.meta_table, &pc.table) {
        Ok(Some(date)) => println!("{} watermark ({}): {date}", pc.table, wh.name()),
        Ok(None) => println!("{} watermark ({}): none", pc.table, wh.name()),
        Err(e) => bail!("could not read watermark from {}: {e}", wh.name()),
    }
    Ok(())
}
