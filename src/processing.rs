use crate::geocode::Geocoder;
use crate::types::{AggregatedPlace, Aggregation, Mode, PlaceKey, RawRecord};
use std::collections::BTreeMap;
use tracing::{info, warn};

struct Group<'a> {
    count: u32,
    /// First-seen spelling, reported when the place cannot be located
    original: &'a str,
}

/// Counts records per place, then geocodes each distinct place once.
pub fn aggregate(
    records: &[RawRecord],
    mode: Mode,
    qualifier: &str,
    geocoder: &dyn Geocoder,
) -> Aggregation {
    let mut groups: BTreeMap<PlaceKey, Group> = BTreeMap::new();
    for record in records {
        groups
            .entry(PlaceKey::from_record(record))
            .or_insert_with(|| Group {
                count: 0,
                original: record.place.trim(),
            })
            .count += 1;
    }

    info!(
        "Grouped {} records into {} places, geocoding...",
        records.len(),
        groups.len()
    );

    let mut aggregation = Aggregation::default();
    for (key, group) in groups {
        let name = key.display_place();
        let destination = key.display_destination();

        let context = match mode {
            Mode::WithinRegion => qualifier,
            Mode::CrossRegion => destination.as_deref().unwrap_or(""),
        };

        match geocoder.resolve(&name, context) {
            Some(point) => aggregation.places.push(AggregatedPlace {
                name,
                destination,
                count: group.count,
                point,
                key,
            }),
            None => {
                aggregation.unlocated.insert(group.original.to_string());
            }
        }
    }

    if !aggregation.unlocated.is_empty() {
        warn!(
            "Could not locate {} places: {:?}",
            aggregation.unlocated.len(),
            aggregation.unlocated
        );
    }

    aggregation
}
