//! CLI entry point for the county statistics pipeline.
//!
//! Provides subcommands for aggregating each source dataset to counties,
//! merging two aggregated tables, and correlating two merged columns.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use county_stats::config::{JoinPolicy, PipelineConfig};
use county_stats::output::{print_json, print_pretty, write_table};
use county_stats::pipeline::datasets::{DatasetKind, DatasetSchema};
use county_stats::pipeline::runner::{correlate_file, merge_files, run_all, run_dataset};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "county_stats")]
#[command(about = "Aggregate county-level census and mobility data and correlate them", long_about = None)]
struct Cli {
    /// JSON config file (defaults to $COUNTY_STATS_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Date of the dated source files, e.g. 2020-04-23
    #[arg(short, long, global = true)]
    date: Option<NaiveDate>,

    /// Directory that source and output paths are relative to
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate one source dataset to counties and write its table
    Aggregate {
        #[arg(value_enum)]
        dataset: DatasetKind,

        /// Output CSV, relative to the data directory
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Join two aggregated county tables
    Merge {
        /// Table whose keys survive under left-with-missing
        #[arg(long)]
        primary: PathBuf,

        #[arg(long)]
        secondary: PathBuf,

        /// Merged CSV (defaults to the configured merge output)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, value_enum)]
        policy: Option<JoinPolicy>,

        /// Drop merged rows with any missing field
        #[arg(long)]
        drop_missing: Option<bool>,
    },
    /// Rank-correlate two columns of a merged table
    Correlate {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = "proportion_male")]
        x: String,

        #[arg(short, long, default_value = "proportion_stayed_at_home")]
        y: String,

        /// CSV file to append the result to
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Aggregate census and mobility, merge them, and correlate
    Run,
    /// List the built-in dataset schemas
    Datasets,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/county_stats.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("county_stats.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Aggregate { dataset, output } => {
            if let Some(output) = output {
                config.dataset_mut(dataset).output_file_path = Some(output);
            }
            let (table, path) = run_dataset(&config, dataset)
                .with_context(|| format!("aggregating {dataset:?} data"))?;
            info!(
                counties = table.len(),
                accepted = table.quality.accepted,
                skipped = table.quality.skipped,
                output = %path.display(),
                "Aggregation written"
            );
        }
        Commands::Merge {
            primary,
            secondary,
            output,
            policy,
            drop_missing,
        } => {
            if let Some(drop_missing) = drop_missing {
                config.merge.drop_missing = drop_missing;
            }
            let policy = policy.unwrap_or(config.merge.join_policy);
            let (merged, report) = merge_files(&config, &primary, &secondary, policy)
                .context("merging county tables")?;

            let output = match output {
                Some(path) => path,
                None => config.merge_output_path()?,
            };
            write_table(&output, &merged.to_table(), &config.merge_normalizer())?;
            info!(
                rows = merged.len(),
                matched = report.matched,
                output = %output.display(),
                "Merged table written"
            );
        }
        Commands::Correlate {
            input,
            x,
            y,
            report,
        } => {
            let result = correlate_file(&input, &x, &y, report.as_deref())
                .with_context(|| format!("correlating {x} with {y} in {}", input.display()))?;
            print_pretty(&result);
            print_json(&result)?;
        }
        Commands::Run => {
            let result = run_all(&config).context("running the full pipeline")?;
            info!(
                "correlation of {} with {}, rho = {:.4} p = {:.4} (n = {})",
                result.x, result.y, result.coefficient, result.p_value, result.sample_size
            );
            print_json(&result)?;
        }
        Commands::Datasets => {
            for kind in DatasetKind::ALL {
                let schema = DatasetSchema::for_kind(kind);
                let columns: Vec<String> = config
                    .column_mapping(&schema)
                    .iter()
                    .map(|(field, column)| format!("{field}={column}"))
                    .collect();
                info!(
                    dataset = schema.name,
                    key_mode = ?config.normalizer(&schema).mode(),
                    source = schema.default_source,
                    header = %schema.output_header().join(","),
                    columns = %columns.join(" "),
                    "Dataset"
                );
            }
        }
    }

    Ok(())
}

/// Loads the config file (if any) and applies command-line overrides.
fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("COUNTY_STATS_CONFIG").map(PathBuf::from));

    let mut config = match path {
        Some(path) => PipelineConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(date) = cli.date {
        config.date_suffix = Some(date);
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}
