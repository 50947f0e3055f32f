use crate::config::Area;
use crate::models::{BridgeRecord, Coordinate};
use crate::providers::osm::OsmElement;
use std::collections::{BTreeMap, HashMap};

const NAME_KEYS: [&str; 3] = ["name", "bridge:name", "official_name"];
const CITY_KEYS: [&str; 5] = [
    "addr:city",
    "city",
    "addr:municipality",
    "addr:suburb",
    "addr:district",
];

/// Convert Overpass elements of one area into bridge records
pub fn bridges_from_elements(elements: &[OsmElement], area: &Area) -> Vec<BridgeRecord> {
    elements
        .iter()
        .filter_map(|element| bridge_from_element(element, &area.name))
        .collect()
}

fn bridge_from_element(element: &OsmElement, area_name: &str) -> Option<BridgeRecord> {
    let tags = element.tags.as_ref()?;

    let coordinate = match (element.latitude(), element.longitude()) {
        (Some(lat), Some(lon)) => Coordinate::new(lat, lon),
        _ => {
            tracing::debug!(key = %element.external_key(), "Skipping bridge without coordinates");
            return None;
        }
    };
    if !coordinate.is_valid() {
        return None;
    }

    let name = NAME_KEYS.iter().find_map(|k| element.tag(k)).cloned();
    let city = CITY_KEYS
        .iter()
        .find_map(|k| element.tag(k))
        .cloned()
        .or_else(|| Some(area_name.to_string()));

    // Sorted so unchanged tags serialize identically across imports
    let sorted: BTreeMap<&String, &String> = tags.iter().collect();
    let tags_json = match serde_json::to_string(&sorted) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(
                key = %element.external_key(),
                error = %e,
                "Failed to serialize bridge tags"
            );
            None
        }
    };

    Some(BridgeRecord {
        external_key: element.external_key(),
        name,
        city,
        coordinate,
        bridge_type: element
            .tag("bridge")
            .or_else(|| element.tag("man_made"))
            .cloned(),
        tags: tags_json,
    })
}

/// Deduplicate by external key across areas. The first record wins unless a
/// later duplicate carries a name the first one lacks.
pub fn dedup_bridges(records: Vec<BridgeRecord>) -> Vec<BridgeRecord> {
    let mut order = Vec::new();
    let mut by_key: HashMap<String, BridgeRecord> = HashMap::new();

    for record in records {
        match by_key.get_mut(&record.external_key) {
            Some(existing) => {
                if existing.name.is_none() && record.name.is_some() {
                    *existing = record;
                }
            }
            None => {
                order.push(record.external_key.clone());
                by_key.insert(record.external_key.clone(), record);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}
