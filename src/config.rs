use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

use crate::types::Mode;

pub const API_KEY_ENV: &str = "GEOCODER_API_KEY";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub geocoder: GeocoderConfig,
    pub region: RegionConfig,
    pub style: StyleConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InputConfig {
    pub place_column: String,
    pub destination_column: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            place_column: "Ville".to_string(),
            destination_column: "Destination".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenCage,
    Nominatim,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeocoderConfig {
    pub provider: Provider,
    /// Overrides the provider's public endpoint
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        GeocoderConfig {
            provider: Provider::OpenCage,
            endpoint: None,
            api_key: None,
            user_agent: concat!("mobility-map/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegionConfig {
    /// Exact feature name in the boundary dataset
    pub name: String,
    /// Appended to within-region geocoding queries
    pub qualifier: String,
    /// URL or local path of a GeoJSON FeatureCollection, or a local .shp file
    pub boundary: String,
    pub name_property: String,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            name: "Bourgogne-Franche-Comté".to_string(),
            qualifier: "Bourgogne Franche Comté, France".to_string(),
            boundary: "https://raw.githubusercontent.com/gregoiredavid/france-geojson/master/regions.geojson".to_string(),
            name_property: "nom".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StyleConfig {
    pub marker_scale: f64,
    pub marker_color: String, // Hex code
    pub region_width: u8,
    pub region_color: String, // Hex code
}

impl Default for StyleConfig {
    fn default() -> Self {
        StyleConfig {
            marker_scale: 0.4,
            marker_color: "#0000FF".to_string(),
            region_width: 3,
            region_color: "#FF0000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub within_region_file: String,
    pub cross_region_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: PathBuf::from("output"),
            within_region_file: "carte_bfc_nombre_mobilite_24_25.html".to_string(),
            cross_region_file: "carte_mobilite_inter_regions.html".to_string(),
        }
    }
}

impl OutputConfig {
    pub fn file_name(&self, mode: Mode) -> &str {
        match mode {
            Mode::WithinRegion => &self.within_region_file,
            Mode::CrossRegion => &self.cross_region_file,
        }
    }

    pub fn path_for(&self, mode: Mode) -> PathBuf {
        self.dir.join(self.file_name(mode))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { port: 8501 }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config = Self::from_toml(&content)?;
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.geocoder.api_key = Some(key);
            }
        }
        Ok(config)
    }

    /// Falls back to built-in defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        tracing::info!("No config file at {:?}, using defaults", path);
        let mut config = AppConfig::default();
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            config.geocoder.api_key = Some(key);
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.input.place_column, "Ville");
        assert_eq!(config.region.name_property, "nom");
        assert_eq!(config.style.region_width, 3);
        assert_eq!(config.output.dir, PathBuf::from("output"));
        assert_eq!(
            config.output.file_name(Mode::WithinRegion),
            "carte_bfc_nombre_mobilite_24_25.html"
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r##"
            [geocoder]
            provider = "nominatim"

            [style]
            marker_color = "#00ff00"

            [output]
            dir = "out"
            "##,
        )
        .unwrap();
        assert_eq!(config.geocoder.provider, Provider::Nominatim);
        assert_eq!(config.geocoder.timeout_secs, 30);
        assert_eq!(config.style.marker_color, "#00ff00");
        assert_eq!(config.style.marker_scale, 0.4);
        assert_eq!(
            config.output.path_for(Mode::CrossRegion),
            PathBuf::from("out").join("carte_mobilite_inter_regions.html")
        );
        assert_eq!(config.server.port, 8501);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = AppConfig::from_toml(include_str!("../config.toml")).unwrap();
        assert_eq!(config.region.name, "Bourgogne-Franche-Comté");
        assert_eq!(config.output.dir, PathBuf::from("output"));
        assert_eq!(config.geocoder.api_key, None);
    }

    #[test]
    fn test_rejects_unknown_provider() {
        assert!(AppConfig::from_toml("[geocoder]\nprovider = \"bing\"\n").is_err());
    }
}
