pub mod types;
pub mod config;
pub mod error;
pub mod data;
pub mod geocode;
pub mod boundary;
pub mod processing;
pub mod render;
pub mod pipeline;
pub mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use types::Mode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Geocode a mobility CSV and write the marker map
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// CSV file to analyse
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        #[arg(short, long, value_enum, default_value_t = Mode::WithinRegion)]
        mode: Mode,
        /// Circle size factor (0.1 to 1.0)
        #[arg(long)]
        size: Option<f64>,
        /// Circle color, e.g. #0000FF
        #[arg(long)]
        color: Option<String>,
        /// Region outline width (1 to 10)
        #[arg(long)]
        region_width: Option<u8>,
        /// Region outline color, e.g. #FF0000
        #[arg(long)]
        region_color: Option<String>,
    },
    /// Serve the upload form
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            config,
            input,
            mode,
            size,
            color,
            region_width,
            region_color,
        } => {
            let app_config = config::AppConfig::load_or_default(&config)?;

            // Flags override the configured style for this run only
            let mut style = app_config.style.clone();
            if let Some(v) = size {
                style.marker_scale = v;
            }
            if let Some(v) = color {
                style.marker_color = v;
            }
            if let Some(v) = region_width {
                style.region_width = v;
            }
            if let Some(v) = region_color {
                style.region_color = v;
            }
            let request = pipeline::RenderRequest {
                mode,
                style: render::MapStyle::from_config(&style, mode)?,
            };

            let geocoder = geocode::from_config(&app_config.geocoder)?;
            let boundaries = boundary::from_config(&app_config.region, &app_config.geocoder);
            let ctx = pipeline::PipelineContext {
                config: &app_config,
                geocoder: geocoder.as_ref(),
                boundaries: Some(boundaries.as_ref() as &dyn boundary::BoundarySource),
            };

            let file = File::open(&input)
                .with_context(|| format!("Failed to open CSV file: {:?}", input))?;
            let report = pipeline::run(BufReader::new(file), &request, &ctx)?;

            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            if report.skipped_blank > 0 {
                eprintln!("warning: {} rows without a place were ignored", report.skipped_blank);
            }
            println!(
                "Map with {} places written to {}",
                report.places.len(),
                report.output.display()
            );
        }
        Commands::Serve { config } => {
            let app_config = config::AppConfig::load_or_default(&config)?;
            let geocoder = geocode::from_config(&app_config.geocoder)?;
            let boundaries = boundary::from_config(&app_config.region, &app_config.geocoder);

            server::start_server(app_config, geocoder, boundaries).await?;
        }
    }

    Ok(())
}
