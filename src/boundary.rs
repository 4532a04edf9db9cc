use crate::config::{GeocoderConfig, RegionConfig};
use anyhow::{anyhow, Context, Result};
use geo::MultiPolygon;
use geojson::GeoJson;
use shapefile::Reader;
use std::convert::TryInto;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use ureq::{Agent, AgentBuilder};

/// A named administrative outline.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Looks up a region outline by exact name. `Ok(None)` when the name is absent.
pub trait BoundarySource {
    fn fetch_boundary(&self, name: &str) -> Result<Option<Boundary>>;
}

/// Remote datasets are fetched with the geocoder's user agent and timeout.
pub fn from_config(
    config: &RegionConfig,
    http: &GeocoderConfig,
) -> Box<dyn BoundarySource + Send + Sync> {
    let is_shapefile = Path::new(&config.boundary)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.eq_ignore_ascii_case("shp"))
        .unwrap_or(false);

    if is_shapefile {
        Box::new(ShapefileBoundarySource {
            path: PathBuf::from(&config.boundary),
            name_field: config.name_property.clone(),
        })
    } else {
        Box::new(GeoJsonBoundarySource::new(
            &config.boundary,
            &config.name_property,
            http,
        ))
    }
}

/// A GeoJSON FeatureCollection at a URL or on disk.
pub struct GeoJsonBoundarySource {
    pub location: String,
    pub name_property: String,
    agent: Agent,
    timeout: Duration,
}

impl GeoJsonBoundarySource {
    pub fn new(location: &str, name_property: &str, http: &GeocoderConfig) -> Self {
        GeoJsonBoundarySource {
            location: location.to_string(),
            name_property: name_property.to_string(),
            agent: AgentBuilder::new().user_agent(&http.user_agent).build(),
            timeout: Duration::from_secs(http.timeout_secs),
        }
    }

    fn load(&self) -> Result<GeoJson> {
        if self.location.starts_with("http://") || self.location.starts_with("https://") {
            info!("Fetching boundaries from {}", self.location);
            let reader = self
                .agent
                .get(&self.location)
                .timeout(self.timeout)
                .call()
                .with_context(|| format!("Failed to fetch boundaries: {}", self.location))?
                .into_reader();
            GeoJson::from_reader(BufReader::new(reader)).context("Failed to parse boundary GeoJSON")
        } else {
            info!("Loading boundaries from {}", self.location);
            let file = File::open(&self.location)
                .with_context(|| format!("Failed to open boundary file: {}", self.location))?;
            GeoJson::from_reader(BufReader::new(file)).context("Failed to parse boundary GeoJSON")
        }
    }
}

impl BoundarySource for GeoJsonBoundarySource {
    fn fetch_boundary(&self, name: &str) -> Result<Option<Boundary>> {
        let collection = match self.load()? {
            GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(anyhow!("Boundary GeoJSON must be a FeatureCollection")),
        };
        find_feature(collection, &self.name_property, name)
    }
}

fn find_feature(
    collection: geojson::FeatureCollection,
    name_property: &str,
    name: &str,
) -> Result<Option<Boundary>> {
    for feature in collection.features {
        let matches = feature
            .properties
            .as_ref()
            .and_then(|props| props.get(name_property))
            .and_then(|v| v.as_str())
            .map_or(false, |v| v == name);
        if !matches {
            continue;
        }

        let geometry = match feature.geometry {
            Some(geom) => {
                let geom: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;
                match geom {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => continue, // Skip points/lines
                }
            }
            None => continue,
        };

        return Ok(Some(Boundary {
            name: name.to_string(),
            geometry,
        }));
    }

    Ok(None)
}

/// Polygons from a local shapefile, matched on a dBase character field.
pub struct ShapefileBoundarySource {
    pub path: PathBuf,
    pub name_field: String,
}

impl BoundarySource for ShapefileBoundarySource {
    fn fetch_boundary(&self, name: &str) -> Result<Option<Boundary>> {
        info!("Loading boundaries from {:?}", self.path);
        let mut reader = Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open Shapefile: {:?}", self.path))?;

        for result in reader.iter_shapes_and_records() {
            let (shape, record) = result?;

            let matches = match record.get(&self.name_field) {
                Some(shapefile::dbase::FieldValue::Character(Some(s))) => s.trim() == name,
                _ => false,
            };
            if !matches {
                continue;
            }

            let geometry: MultiPolygon<f64> = match shape {
                shapefile::Shape::Polygon(polygon) => polygon
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?,
                shapefile::Shape::PolygonM(polygon) => polygon
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?,
                shapefile::Shape::PolygonZ(polygon) => polygon
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?,
                _ => continue, // Skip non-polygon shapes
            };

            return Ok(Some(Boundary {
                name: name.to_string(),
                geometry,
            }));
        }

        Ok(None)
    }
}
