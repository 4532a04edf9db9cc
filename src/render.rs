use crate::boundary::{Boundary, BoundarySource};
use crate::config::StyleConfig;
use crate::error::PipelineError;
use crate::types::{AggregatedPlace, Mode};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MARKER_SCALE_RANGE: (f64, f64) = (0.1, 1.0);
pub const REGION_WIDTH_RANGE: (u8, u8) = (1, 10);
const FILL_OPACITY: f64 = 0.6;

/// Fixed initial view for each mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub center: [f64; 2],
    pub zoom: u8,
}

impl Viewport {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::WithinRegion => Viewport { center: [47.0, 5.0], zoom: 8 },
            Mode::CrossRegion => Viewport { center: [46.6, 2.4], zoom: 6 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexColor([u8; 3]);

impl HexColor {
    /// Accepts `#RRGGBB` or `#RGB`.
    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::Style(format!("'{s}' is not a hex color"));
        let hex = s.trim().strip_prefix('#').ok_or_else(invalid)?;
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let channel = |i: usize, len: usize| {
            let v = u8::from_str_radix(&hex[i * len..(i + 1) * len], 16).unwrap_or(0);
            if len == 1 { v * 17 } else { v }
        };
        match hex.len() {
            6 => Ok(HexColor([channel(0, 2), channel(1, 2), channel(2, 2)])),
            3 => Ok(HexColor([channel(0, 1), channel(1, 1), channel(2, 1)])),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "#{r:02x}{g:02x}{b:02x}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryStyle {
    pub width: u8,
    pub color: HexColor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapStyle {
    pub marker_scale: f64,
    pub marker_color: HexColor,
    /// Only used in within-region mode
    pub boundary: Option<BoundaryStyle>,
}

impl MapStyle {
    pub fn new(
        marker_scale: f64,
        marker_color: &str,
        boundary: Option<(u8, &str)>,
    ) -> Result<Self, PipelineError> {
        let (min, max) = MARKER_SCALE_RANGE;
        if !(min..=max).contains(&marker_scale) {
            return Err(PipelineError::Style(format!(
                "marker size {marker_scale} must be between {min} and {max}"
            )));
        }

        let boundary = match boundary {
            Some((width, color)) => {
                let (min, max) = REGION_WIDTH_RANGE;
                if !(min..=max).contains(&width) {
                    return Err(PipelineError::Style(format!(
                        "region line width {width} must be between {min} and {max}"
                    )));
                }
                Some(BoundaryStyle { width, color: HexColor::parse(color)? })
            }
            None => None,
        };

        Ok(MapStyle {
            marker_scale,
            marker_color: HexColor::parse(marker_color)?,
            boundary,
        })
    }

    pub fn from_config(config: &StyleConfig, mode: Mode) -> Result<Self, PipelineError> {
        let boundary = match mode {
            Mode::WithinRegion => Some((config.region_width, config.region_color.as_str())),
            Mode::CrossRegion => None,
        };
        Self::new(config.marker_scale, &config.marker_color, boundary)
    }
}

#[derive(Debug, Serialize)]
struct MarkerData {
    lat: f64,
    lon: f64,
    radius: f64,
    label: String,
}

#[derive(Debug, Serialize)]
struct BoundaryData {
    geometry: geojson::Geometry,
    color: String,
    weight: u8,
}

#[derive(Debug, Serialize)]
struct MapData {
    #[serde(flatten)]
    viewport: Viewport,
    color: String,
    fill_opacity: f64,
    markers: Vec<MarkerData>,
    boundary: Option<BoundaryData>,
}

fn map_data(
    places: &[AggregatedPlace],
    mode: Mode,
    style: &MapStyle,
    boundary: Option<&Boundary>,
) -> MapData {
    let mut ordered: Vec<&AggregatedPlace> = places.iter().collect();
    // Largest first so smaller circles stay on top
    ordered.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

    let markers = ordered
        .into_iter()
        .map(|p| MarkerData {
            lat: p.point.y(),
            lon: p.point.x(),
            radius: p.count as f64 * style.marker_scale,
            label: p.label(),
        })
        .collect();

    let boundary = match (boundary, style.boundary) {
        (Some(b), Some(s)) => Some(BoundaryData {
            geometry: geojson::Geometry::new(geojson::Value::from(&b.geometry)),
            color: s.color.to_string(),
            weight: s.width,
        }),
        _ => None,
    };

    MapData {
        viewport: Viewport::for_mode(mode),
        color: style.marker_color.to_string(),
        fill_opacity: FILL_OPACITY,
        markers,
        boundary,
    }
}

/// Produces a self-contained Leaflet page with one circle per place.
pub fn render_map(
    places: &[AggregatedPlace],
    mode: Mode,
    style: &MapStyle,
    title: &str,
    boundary: Option<&Boundary>,
) -> Result<String> {
    let data = map_data(places, mode, style, boundary);
    // Escaped so the payload cannot close the script element
    let json = serde_json::to_string(&data)
        .context("Failed to serialize map data")?
        .replace('<', "\\u003c");

    Ok(MAP_TEMPLATE
        .replace("{{TITLE}}", &escape_html(title))
        .replace("{{DATA}}", &json))
}

#[derive(Debug, Clone)]
pub struct MapDocument {
    pub html: String,
    pub boundary_drawn: bool,
    pub warnings: Vec<String>,
}

/// Fetches the region outline when the mode needs one, then renders.
pub fn build_map(
    places: &[AggregatedPlace],
    mode: Mode,
    style: &MapStyle,
    region_name: &str,
    source: Option<&dyn BoundarySource>,
) -> Result<MapDocument> {
    let mut warnings = Vec::new();

    let boundary = match (mode, source) {
        (Mode::WithinRegion, Some(source)) if style.boundary.is_some() => {
            match source.fetch_boundary(region_name) {
                Ok(Some(b)) => Some(b),
                Ok(None) => {
                    info!("Region {:?} not found in boundary dataset, skipping outline", region_name);
                    None
                }
                Err(e) => {
                    warn!("Failed to load region boundary: {:#}", e);
                    warnings.push(format!("The region boundary could not be loaded: {e:#}"));
                    None
                }
            }
        }
        _ => None,
    };

    let title = match mode {
        Mode::WithinRegion => format!("Mobility - {region_name}"),
        Mode::CrossRegion => "Mobility - cross-region".to_string(),
    };

    let html = render_map(places, mode, style, &title, boundary.as_ref())?;
    Ok(MapDocument {
        html,
        boundary_drawn: boundary.is_some(),
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct RenderedMap {
    pub path: PathBuf,
    pub document: String,
}

/// Writes the document to its fixed file name, replacing any previous render.
pub fn write_map(dir: &Path, file_name: &str, html: String) -> Result<RenderedMap> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory: {:?}", dir))?;
    let path = dir.join(file_name);
    fs::write(&path, &html).with_context(|| format!("Failed to write map: {:?}", path))?;
    info!("Map written to {:?}", path);
    Ok(RenderedMap { path, document: html })
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const MAP_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>{{TITLE}}</title>
  <link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css" />
  <script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
  <style>
    html, body { height: 100%; margin: 0; }
    #map { position: absolute; inset: 0; }
  </style>
</head>
<body>
  <div id="map"></div>
  <script>
    const data = {{DATA}};
    const map = L.map("map").setView(data.center, data.zoom);
    L.tileLayer("https://tile.openstreetmap.org/{z}/{x}/{y}.png", {
      maxZoom: 18,
      attribution: "&copy; OpenStreetMap contributors",
    }).addTo(map);

    if (data.boundary) {
      L.geoJSON(data.boundary.geometry, {
        style: { color: data.boundary.color, weight: data.boundary.weight, fillOpacity: 0 },
      }).addTo(map);
    }

    for (const m of data.markers) {
      const label = document.createElement("span");
      label.textContent = m.label;
      L.circleMarker([m.lat, m.lon], {
        radius: m.radius,
        color: data.color,
        fill: true,
        fillColor: data.color,
        fillOpacity: data.fill_opacity,
      }).bindPopup(label).addTo(map);
    }
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoPoint, PlaceKey};
    use anyhow::anyhow;
    use geo::{polygon, MultiPolygon};
    use serde_json::Value;

    fn place(name: &str, destination: Option<&str>, count: u32, lat: f64, lon: f64) -> AggregatedPlace {
        AggregatedPlace {
            key: PlaceKey {
                place: name.to_lowercase(),
                destination: destination.map(str::to_lowercase),
            },
            name: name.to_string(),
            destination: destination.map(str::to_string),
            count,
            point: GeoPoint::new(lon, lat),
        }
    }

    fn region() -> Boundary {
        Boundary {
            name: "Bourgogne-Franche-Comté".to_string(),
            geometry: MultiPolygon::new(vec![polygon![
                (x: 3.0, y: 46.0),
                (x: 7.0, y: 46.0),
                (x: 7.0, y: 48.5),
                (x: 3.0, y: 46.0),
            ]]),
        }
    }

    struct FixedSource(Result<Option<Boundary>, String>);

    impl BoundarySource for FixedSource {
        fn fetch_boundary(&self, _name: &str) -> Result<Option<Boundary>> {
            self.0.clone().map_err(|e| anyhow!(e))
        }
    }

    fn within_style() -> MapStyle {
        MapStyle::new(0.4, "#0000FF", Some((3, "#FF0000"))).unwrap()
    }

    #[test]
    fn test_hex_color() {
        assert_eq!(HexColor::parse("#0000FF").unwrap().to_string(), "#0000ff");
        assert_eq!(HexColor::parse("#f00").unwrap().to_string(), "#ff0000");
        assert!(HexColor::parse("0000FF").is_err());
        assert!(HexColor::parse("#00GG00").is_err());
        assert!(HexColor::parse("#ff00").is_err());
        assert!(HexColor::parse("#ffé").is_err());
    }

    #[test]
    fn test_style_ranges() {
        assert!(MapStyle::new(0.05, "#000000", None).is_err());
        assert!(MapStyle::new(1.5, "#000000", None).is_err());
        assert!(MapStyle::new(0.1, "#000000", Some((0, "#000000"))).is_err());
        assert!(MapStyle::new(1.0, "#000000", Some((11, "#000000"))).is_err());
        let err = MapStyle::new(0.4, "blue", None).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_style_from_config() {
        let config = StyleConfig::default();
        assert!(MapStyle::from_config(&config, Mode::WithinRegion).unwrap().boundary.is_some());
        assert!(MapStyle::from_config(&config, Mode::CrossRegion).unwrap().boundary.is_none());
    }

    #[test]
    fn test_marker_data() {
        let places = vec![
            place("Besançon", None, 1, 47.24, 6.02),
            place("Dijon", None, 5, 47.32, 5.04),
        ];
        let data = map_data(&places, Mode::WithinRegion, &within_style(), Some(&region()));
        let json = serde_json::to_value(&data).unwrap();

        assert_eq!(json["center"], serde_json::json!([47.0, 5.0]));
        assert_eq!(json["zoom"], 8);
        assert_eq!(json["color"], "#0000ff");
        let markers = json["markers"].as_array().unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0]["label"], "Dijon (5)");
        assert_eq!(markers[0]["lat"], 47.32);
        assert_eq!(markers[0]["lon"], 5.04);
        assert!((markers[0]["radius"].as_f64().unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(markers[1]["label"], "Besançon (1)");
        assert_eq!(json["boundary"]["color"], "#ff0000");
        assert_eq!(json["boundary"]["weight"], 3);
        assert_eq!(json["boundary"]["geometry"]["type"], "MultiPolygon");
    }

    #[test]
    fn test_cross_region_has_no_boundary() {
        let places = vec![place("Dijon", Some("Lyon"), 2, 47.32, 5.04)];
        let style = MapStyle::new(0.4, "#0000FF", None).unwrap();
        let data = map_data(&places, Mode::CrossRegion, &style, Some(&region()));
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["boundary"], Value::Null);
        assert_eq!(json["zoom"], 6);
        assert_eq!(json["markers"][0]["label"], "Dijon → Lyon (2)");
    }

    #[test]
    fn test_labels_cannot_break_out_of_script() {
        let places = vec![place("</script><b>", None, 1, 47.0, 5.0)];
        let html = render_map(&places, Mode::WithinRegion, &within_style(), "A & B", None).unwrap();
        assert!(!html.contains("</script><b>"));
        assert!(html.contains("<title>A &amp; B</title>"));
    }

    #[test]
    fn test_missing_region_is_silent() {
        let source = FixedSource(Ok(None));
        let doc = build_map(&[], Mode::WithinRegion, &within_style(), "Bretagne", Some(&source as &dyn BoundarySource)).unwrap();
        assert!(!doc.boundary_drawn);
        assert!(doc.warnings.is_empty());
    }

    #[test]
    fn test_boundary_fetch_failure_is_reported() {
        let source = FixedSource(Err("connection refused".to_string()));
        let doc = build_map(&[], Mode::WithinRegion, &within_style(), "Bourgogne-Franche-Comté", Some(&source as &dyn BoundarySource)).unwrap();
        assert!(!doc.boundary_drawn);
        assert_eq!(doc.warnings.len(), 1);
    }

    #[test]
    fn test_boundary_drawn_within_region_only() {
        let source = FixedSource(Ok(Some(region())));
        let doc = build_map(&[], Mode::WithinRegion, &within_style(), "Bourgogne-Franche-Comté", Some(&source as &dyn BoundarySource)).unwrap();
        assert!(doc.boundary_drawn);
        assert!(doc.html.contains("\"boundary\":{"));

        let style = MapStyle::new(0.4, "#0000FF", None).unwrap();
        let doc = build_map(&[], Mode::CrossRegion, &style, "Bourgogne-Franche-Comté", Some(&source as &dyn BoundarySource)).unwrap();
        assert!(!doc.boundary_drawn);
        assert!(doc.html.contains("\"boundary\":null"));
    }

    #[test]
    fn test_write_map_overwrites() {
        let dir = std::env::temp_dir().join(format!("mobility-map-render-{}", std::process::id()));
        write_map(&dir, "map.html", "first".to_string()).unwrap();
        let rendered = write_map(&dir, "map.html", "second".to_string()).unwrap();
        assert_eq!(fs::read_to_string(&rendered.path).unwrap(), "second");
        assert_eq!(rendered.document, "second");
    }
}
