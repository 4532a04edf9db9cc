use geo::Point;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Resolved coordinates. x is longitude, y is latitude.
pub type GeoPoint = Point<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Mode {
    /// Counts per city inside one region, with a boundary overlay
    #[value(name = "within")]
    WithinRegion,
    /// Counts per (destination, place) pair, no boundary
    #[value(name = "cross")]
    CrossRegion,
}

impl Mode {
    pub fn slug(&self) -> &'static str {
        match self {
            Mode::WithinRegion => "within",
            Mode::CrossRegion => "cross",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "within" => Ok(Mode::WithinRegion),
            "cross" => Ok(Mode::CrossRegion),
            other => Err(format!("Unknown mode: {other}")),
        }
    }
}

/// One input row, reduced to the columns the mode needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub place: String,
    pub destination: Option<String>,
}

/// Grouping identity: trimmed and case-folded place (and destination).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaceKey {
    pub place: String,
    pub destination: Option<String>,
}

impl PlaceKey {
    pub fn from_record(record: &RawRecord) -> Self {
        PlaceKey {
            place: normalize(&record.place),
            destination: record.destination.as_deref().map(normalize),
        }
    }

    pub fn display_place(&self) -> String {
        title_case(&self.place)
    }

    pub fn display_destination(&self) -> Option<String> {
        self.destination.as_deref().map(title_case)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedPlace {
    pub key: PlaceKey,
    pub name: String,
    pub destination: Option<String>,
    pub count: u32,
    pub point: GeoPoint,
}

impl AggregatedPlace {
    pub fn label(&self) -> String {
        match &self.destination {
            Some(dest) => format!("{} → {} ({})", self.name, dest, self.count),
            None => format!("{} ({})", self.name, self.count),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub places: Vec<AggregatedPlace>,
    /// Original names of places the geocoder could not locate
    pub unlocated: BTreeSet<String>,
}

pub fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Upper-cases every letter that follows a non-letter, lower-cases the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}
