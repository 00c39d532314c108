use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use prevalence_atlas::config::Settings;
use prevalence_atlas::domain::{AgeBand, Diagnostics, PathologyLevel, Sex};
use prevalence_atlas::pipeline::aggregate::{FilterSpec, GeoLevel};
use prevalence_atlas::{logging, metrics, AtlasPipeline, PipelineCache, PipelineError};

#[derive(Parser)]
#[command(name = "prevalence_atlas")]
#[command(about = "Disease prevalence pipeline: load, harmonize, aggregate")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to $ATLAS_CONFIG or atlas.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Read the pre-cleaned artifact instead of the raw CSV
    #[arg(long, global = true)]
    use_cleaned: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Filter flags shared by every query; repeat a flag to select several values
#[derive(Args, Debug, Default)]
struct FilterArgs {
    #[arg(long = "region")]
    regions: Vec<String>,
    #[arg(long = "year")]
    years: Vec<i32>,
    /// male, female or both
    #[arg(long = "sex", value_parser = parse_sex)]
    sexes: Vec<Sex>,
    /// Canonical band label such as 40-44, 95+ or unknown
    #[arg(long = "age", value_parser = parse_age_band)]
    age_bands: Vec<AgeBand>,
    /// top, intermediate or leaf
    #[arg(long = "pathology-level", value_parser = parse_level)]
    pathology_level: Option<PathologyLevel>,
    /// Pathology code; descendants are included
    #[arg(long = "pathology")]
    pathologies: Vec<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> FilterSpec {
        let mut filter = FilterSpec::all();
        if !self.regions.is_empty() {
            filter = filter.with_regions(&self.regions);
        }
        if !self.years.is_empty() {
            filter = filter.with_years(self.years.iter().copied());
        }
        if !self.sexes.is_empty() {
            filter = filter.with_sexes(self.sexes.iter().copied());
        }
        if !self.age_bands.is_empty() {
            filter = filter.with_age_bands(self.age_bands.iter().copied());
        }
        if let Some(level) = self.pathology_level {
            filter = filter.with_level(level);
        }
        if !self.pathologies.is_empty() {
            filter = filter.with_pathologies(self.pathologies.iter().cloned());
        }
        filter
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Total patients, distinct pathologies and year range
    Summary {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Choropleth data by department or region
    Geo {
        #[arg(long, default_value = "region")]
        level: GeoLevel,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Pathology treemap
    Hierarchy {
        /// Print the flat ids/parents/labels/values projection
        #[arg(long)]
        columns: bool,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Correlation of prevalence rates between top-level categories
    Correlation {
        /// Categories to correlate (comma-separated); defaults to the largest ones
        #[arg(long, value_delimiter = ',')]
        codes: Vec<String>,
        /// How many categories to pick when --codes is absent
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Also list the strongest pairs
        #[arg(long)]
        pairs: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Patients and prevalence rate per year
    Timeseries {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Write the harmonized table as a pre-cleaned artifact
    Clean {
        /// Destination (defaults to data.cleaned_artifact)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write the data quality report
    Report {
        #[arg(long)]
        out: PathBuf,
    },
}

fn parse_sex(s: &str) -> std::result::Result<Sex, String> {
    Sex::ALL
        .into_iter()
        .find(|sex| sex.as_str() == s.trim().to_lowercase())
        .ok_or_else(|| format!("expected male, female or both, got '{}'", s))
}

fn parse_age_band(s: &str) -> std::result::Result<AgeBand, String> {
    AgeBand::parse_canonical(s.trim()).ok_or_else(|| format!("not a canonical age band: '{}'", s))
}

fn parse_level(s: &str) -> std::result::Result<PathologyLevel, String> {
    match s.trim().to_lowercase().as_str() {
        "top" | "1" => Ok(PathologyLevel::Top),
        "intermediate" | "2" => Ok(PathologyLevel::Intermediate),
        "leaf" | "3" => Ok(PathologyLevel::Leaf),
        other => Err(format!("expected top, intermediate or leaf, got '{}'", other)),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_badge(diagnostics: &Diagnostics) {
    let rows = diagnostics.warning_rows();
    if rows > 0 {
        eprintln!(
            "⚠️  {} rows excluded or unresolved ({} coercion, {} unmapped sex, {} unresolved geography)",
            rows,
            diagnostics.load.excluded_total(),
            diagnostics.unmapped_sex,
            diagnostics.geo_unresolved_rows()
        );
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => {
            let mut s = Settings::from_path(path)?;
            s.apply_overrides(|name| std::env::var(name).ok())?;
            s
        }
        None => Settings::load()?,
    };
    if cli.use_cleaned {
        settings.data.use_cleaned = true;
    }
    Ok(settings)
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = load_settings(&cli).context("loading settings")?;
    let _guard = logging::init_logging(&settings.logging).context("initializing logging")?;
    metrics::init_metrics(settings.metrics.addr.as_deref()).context("initializing metrics")?;

    if matches!(cli.command, Commands::Clean { .. }) {
        settings.data.use_cleaned = false;
    }
    let pipeline = AtlasPipeline::from_settings(&settings).context("building pipeline")?;
    let cache = PipelineCache::new();

    let table = pipeline.prepared(&cache)?;
    print_badge(&table.diagnostics);

    match cli.command {
        Commands::Summary { filter } => {
            print_json(&*pipeline.summary(&cache, &filter.to_filter())?)?;
        }
        Commands::Geo { level, filter } => {
            print_json(&*pipeline.geo_aggregate(&cache, &filter.to_filter(), level)?)?;
        }
        Commands::Hierarchy { columns, filter } => {
            let tree = pipeline.hierarchy_aggregate(&cache, &filter.to_filter())?;
            if columns {
                print_json(&tree.to_columns())?;
            } else {
                print_json(&*tree)?;
            }
        }
        Commands::Correlation {
            codes,
            top,
            pairs,
            filter,
        } => {
            let filter = filter.to_filter();
            let codes = if codes.is_empty() {
                pipeline
                    .top_categories(&cache, &filter, top)?
                    .iter()
                    .map(|c| c.code.clone())
                    .collect()
            } else {
                codes
            };
            let matrix = pipeline.correlation_matrix(&cache, &filter, &codes)?;
            match pairs {
                Some(n) => print_json(&matrix.strongest_pairs(n))?,
                None => print_json(&*matrix)?,
            }
        }
        Commands::Timeseries { filter } => {
            print_json(&*pipeline.prevalence_timeseries(&cache, &filter.to_filter())?)?;
        }
        Commands::Clean { out } => {
            let out = out.unwrap_or_else(|| settings.data.cleaned_artifact.clone());
            pipeline.write_clean_artifact(&cache, &out)?;
            println!("✅ Wrote {} rows to {}", table.len(), out.display());
        }
        Commands::Report { out } => {
            let report = pipeline.quality_report(&cache)?;
            report.write_report(&out)?;
            println!("✅ Wrote data quality report to {}", out.display());
        }
    }

    info!("Done");
    Ok(())
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<PipelineError>() {
                Some(pipeline_error) if pipeline_error.is_fatal() => {
                    error!("Pipeline halted: {}", pipeline_error);
                    eprintln!("⛔ Data cannot be displayed: {}", pipeline_error);
                }
                _ => {
                    error!("Command failed: {:#}", e);
                    eprintln!("❌ {:#}", e);
                }
            }
            ExitCode::FAILURE
        }
    }
}
