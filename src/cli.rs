use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use crate::application_state::ApplicationState;
use crate::classification::Dimension;
use crate::consts::DEFAULT_CONFIG_PATH;
use crate::errors::AppError;
use crate::histogram::HistogramMetric;
use crate::report::{Render, ReportFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// YAML configuration file, overridden by RECONSTRUCTOR__* variables
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: ActionRunner,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ActionRunner {
    /// Load a single capture file as is
    Load {
        path: PathBuf,

        /// Drop the flows already in storage instead of refusing to load
        #[arg(long)]
        replace: bool,
    },

    /// Merge the configured captures into one timeline
    Merge,

    /// Classify stored flows and print the report
    Classify {
        /// Dimension to classify along, repeatable; all when omitted
        #[arg(short, long = "dimension", value_enum)]
        dimensions: Vec<Dimension>,

        #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },

    /// Bin stored flows by duration or volume
    Histogram {
        #[arg(short, long, value_enum)]
        metric: HistogramMetric,

        #[arg(short, long)]
        bins: Option<usize>,

        #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },

    /// Fastest flows by bytes per second
    TopRates {
        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },
}

impl ActionRunner {
    pub async fn run() -> Result<(), AppError> {
        let cli = Cli::parse();
        cli.command.execute(&cli.config).await
    }

    async fn execute(&self, config_path: &str) -> Result<(), AppError> {
        let state = ApplicationState::from_config_path(config_path)?;

        match self {
            Self::Load { path, replace } => {
                let summary = state.load(path, *replace).await?;
                info!(
                    "{} flows loaded, {} ipv6 and {} malformed lines skipped",
                    summary.inserted, summary.ipv6_skipped, summary.malformed
                );
            }
            Self::Merge => {
                let summary = state.merge().await?;
                for file in &summary.files {
                    info!(
                        "{}: {} inserted, {} merged{}",
                        file.name,
                        file.inserted,
                        file.merged,
                        if file.missing { " (missing)" } else { "" }
                    );
                }
            }
            Self::Classify { dimensions, format } => {
                let report = state.classify(dimensions).await?;
                println!("{}", report.render(*format)?);
            }
            Self::Histogram {
                metric,
                bins,
                format,
            } => {
                let histogram = state.histogram(*metric, *bins).await?;
                println!("{}", histogram.render(*format)?);
            }
            Self::TopRates { limit, format } => {
                let top = state.top_rates(*limit).await?;
                println!("{}", top.render(*format)?);
            }
        }

        Ok(())
    }
}
