use crate::boundary::BoundarySource;
use crate::config::AppConfig;
use crate::data;
use crate::error::PipelineError;
use crate::geocode::Geocoder;
use crate::processing;
use crate::render::{self, MapStyle};
use crate::types::{AggregatedPlace, Mode};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::PathBuf;
use tracing::info;

/// Services a run depends on, injected by the caller.
pub struct PipelineContext<'a> {
    pub config: &'a AppConfig,
    pub geocoder: &'a dyn Geocoder,
    pub boundaries: Option<&'a dyn BoundarySource>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub mode: Mode,
    pub style: MapStyle,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub output: PathBuf,
    pub places: Vec<AggregatedPlace>,
    pub unlocated: BTreeSet<String>,
    pub warnings: Vec<String>,
    pub skipped_blank: usize,
}

/// Ingest, aggregate, render, write. Nothing is written unless every earlier step succeeds.
pub fn run<R: Read>(
    input: R,
    request: &RenderRequest,
    ctx: &PipelineContext,
) -> Result<RunReport, PipelineError> {
    let mode = request.mode;
    info!("Starting {} run", mode);

    let table = data::read_table(input)?;
    let extracted = data::extract_records(&table, mode, &ctx.config.input)?;

    let aggregation = processing::aggregate(
        &extracted.records,
        mode,
        &ctx.config.region.qualifier,
        ctx.geocoder,
    );

    let document = render::build_map(
        &aggregation.places,
        mode,
        &request.style,
        &ctx.config.region.name,
        ctx.boundaries,
    )?;

    let rendered = render::write_map(
        &ctx.config.output.dir,
        ctx.config.output.file_name(mode),
        document.html,
    )?;

    let mut warnings = Vec::new();
    if !aggregation.unlocated.is_empty() {
        let names: Vec<&str> = aggregation.unlocated.iter().map(String::as_str).collect();
        warnings.push(format!("Could not locate: {}", names.join(", ")));
    }
    warnings.extend(document.warnings);

    info!(
        "Rendered {} places ({} not located)",
        aggregation.places.len(),
        aggregation.unlocated.len()
    );

    Ok(RunReport {
        output: rendered.path,
        places: aggregation.places,
        unlocated: aggregation.unlocated,
        warnings,
        skipped_blank: extracted.skipped_blank,
    })
}
