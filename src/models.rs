use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in meters (haversine)
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lon = (other.lon - self.lon).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);

        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }

    /// Feed-side bridge identifier: coordinates rounded to 4 decimals (~10 m)
    pub fn site_key(&self) -> String {
        format!("{:.4},{:.4}", self.lat, self.lon)
    }
}

/// A bridge as stored, identified by its OSM key (e.g. "way/123")
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema, FromRow)]
pub struct Bridge {
    pub external_key: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    /// Street carried by the bridge, found while enriching
    pub street_name: Option<String>,
    /// Water the bridge crosses, found while enriching
    pub water_name: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl Bridge {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }

    /// Human readable label, falling back to city and finally coordinates
    pub fn label(&self) -> String {
        match (&self.name, &self.city) {
            (Some(name), Some(city)) => format!("{name}, {city}"),
            (Some(name), None) => name.clone(),
            (None, Some(city)) => format!("Bridge in {city}"),
            (None, None) => format!("Bridge at {:.5}, {:.5}", self.lat, self.lon),
        }
    }
}

/// Supplementary reference attached to an opening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OpeningLink {
    pub url: Option<String>,
    pub description: Option<String>,
}

/// A stored opening event. Status is never stored; see `timeline::classify`.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct OpeningEvent {
    pub id: i64,
    /// Feed-side bridge identifier
    pub site_key: String,
    pub site: Coordinate,
    pub record_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub operator_status: Option<String>,
    pub links: Vec<OpeningLink>,
}

/// Candidate bridge produced by the geo importer
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRecord {
    pub external_key: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub coordinate: Coordinate,
    pub bridge_type: Option<String>,
    /// OSM tags serialized as JSON
    pub tags: Option<String>,
}

/// Candidate opening produced by the feed normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct OpeningRecord {
    pub site: Coordinate,
    pub record_id: Option<String>,
    pub record_version: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub operator_status: Option<String>,
    pub links: Vec<OpeningLink>,
}

impl OpeningRecord {
    pub fn site_key(&self) -> String {
        self.site.site_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn distance_between_amsterdam_and_rotterdam() {
        let amsterdam = Coordinate::new(52.3676, 4.9041);
        let rotterdam = Coordinate::new(51.9244, 4.4777);

        let d = amsterdam.distance_to(&rotterdam);
        assert!((d - 57_000.0).abs() < 1_000.0, "distance was {d}");
    }

    #[test]
    fn distance_to_self_is_zero() {
        let c = Coordinate::new(52.0, 5.0);
        assert_eq!(c.distance_to(&c), 0.0);
    }

    #[test]
    fn site_key_rounds_to_four_decimals() {
        assert_eq!(Coordinate::new(52.370_04, 4.889_96).site_key(), "52.3700,4.8900");
    }

    #[test]
    fn invalid_coordinates() {
        assert!(!Coordinate::new(91.0, 4.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 4.0).is_valid());
        assert!(Coordinate::new(-90.0, 180.0).is_valid());
    }

    #[test]
    fn label_falls_back_to_city_then_coordinates() {
        let mut bridge = Bridge {
            external_key: "way/1".to_string(),
            name: Some("Magere Brug".to_string()),
            address: None,
            neighborhood: None,
            city: Some("Amsterdam".to_string()),
            street_name: None,
            water_name: None,
            lat: 52.3634,
            lon: 4.9023,
        };
        assert_eq!(bridge.label(), "Magere Brug, Amsterdam");

        bridge.name = None;
        assert_eq!(bridge.label(), "Bridge in Amsterdam");

        bridge.city = None;
        assert_eq!(bridge.label(), "Bridge at 52.36340, 4.90230");
    }
}
