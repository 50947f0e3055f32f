use crate::models::Coordinate;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Street-level detail
const ZOOM: u8 = 18;

#[derive(Debug, Clone)]
pub struct NominatimClient {
    client: reqwest::Client,
    url: String,
}

/// Best-effort description of the place at a coordinate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Place {
    pub display_name: Option<String>,
    pub street: Option<String>,
    pub neighborhood: Option<String>,
    pub water: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    #[serde(default)]
    address: HashMap<String, String>,
    error: Option<String>,
}

impl NominatimClient {
    pub fn new(url: &str, user_agent: &str, timeout: Duration) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| GeocodeError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn reverse(&self, coordinate: Coordinate) -> Result<Place, GeocodeError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("lat", coordinate.lat.to_string()),
                ("lon", coordinate.lon.to_string()),
                ("format", "json".to_string()),
                ("addressdetails", "1".to_string()),
                ("zoom", ZOOM.to_string()),
            ])
            .send()
            .await
            .map_err(GeocodeError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let body: ReverseResponse = response
            .json()
            .await
            .map_err(|e| GeocodeError::Parse(e.to_string()))?;

        Ok(place_from_response(body))
    }
}

fn place_from_response(body: ReverseResponse) -> Place {
    // Nominatim answers "Unable to geocode" with a 200 and an error field
    if let Some(error) = &body.error {
        tracing::debug!(error = %error, "Nominatim found no place");
        return Place::default();
    }

    let first = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| body.address.get(*k))
            .find(|v| !v.trim().is_empty())
            .cloned()
    };

    Place {
        street: first(&["road", "pedestrian"]),
        neighborhood: first(&["neighbourhood", "suburb", "district"]),
        water: first(&["water", "waterway"]),
        city: first(&["city", "town", "village"]),
        display_name: body.display_name.clone().filter(|d| !d.trim().is_empty()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Geocoding request timed out")]
    Timeout,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl GeocodeError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GeocodeError::Timeout
        } else {
            GeocodeError::Network(e.to_string())
        }
    }
}
