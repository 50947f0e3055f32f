use crate::config::{Area, BoundingBox};
use crate::models::Coordinate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Server-side query timeout; the HTTP client timeout must exceed it
const QUERY_TIMEOUT_SECS: u64 = 300;

/// Search radius for streets and waterways around a bridge
const NEARBY_RADIUS_M: u32 = 50;
const NEARBY_QUERY_TIMEOUT_SECS: u64 = 10;
const NEARBY_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct OsmClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

/// Named features next to a bridge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NearbyNames {
    pub street: Option<String>,
    pub water: Option<String>,
}

impl OsmClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, OsmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OsmError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            timeout,
        })
    }

    /// Fetch every bridge feature (ways and nodes) inside an area
    pub async fn fetch_bridges(&self, area: &Area) -> Result<Vec<OsmElement>, OsmError> {
        tracing::info!(area = %area.name, "Fetching bridges...");
        let elements = self
            .query_overpass(&bridge_query(&area.bounding_box), self.timeout)
            .await?;
        tracing::info!(area = %area.name, count = elements.len(), "Fetched bridges");
        Ok(elements)
    }

    /// Names of the closest street and waterway around a coordinate
    pub async fn nearby_names(&self, coordinate: Coordinate) -> Result<NearbyNames, OsmError> {
        let elements = self
            .query_overpass(&nearby_query(coordinate), NEARBY_REQUEST_TIMEOUT)
            .await?;
        Ok(nearby_from_elements(&elements))
    }

    /// Execute an Overpass query and return elements
    async fn query_overpass(
        &self,
        query: &str,
        timeout: Duration,
    ) -> Result<Vec<OsmElement>, OsmError> {
        let response = self.execute_request(query, timeout).await?;

        let parsed: OverpassResponse = serde_json::from_str(&response).map_err(|e| {
            tracing::error!(
                error = %e,
                body_preview = %response.chars().take(500).collect::<String>(),
                "Failed to parse Overpass response"
            );
            OsmError::ParseError(e.to_string())
        })?;

        Ok(parsed.elements)
    }

    /// Execute a single HTTP request
    async fn execute_request(&self, query: &str, timeout: Duration) -> Result<String, OsmError> {
        tracing::debug!(query = %query, "Executing Overpass query");

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(format!("data={}", urlencoding::encode(query)))
            .send()
            .await
            .map_err(OsmError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(OsmError::from_reqwest)?;

        if !status.is_success() {
            tracing::error!(
                status = %status,
                body_preview = %text.chars().take(200).collect::<String>(),
                "Overpass API error"
            );
            return Err(OsmError::NetworkError(format!(
                "HTTP {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        Ok(text)
    }
}

/// Bridges tagged on ways (with their center) and on single nodes
fn bridge_query(bounding_box: &BoundingBox) -> String {
    let bounds = bounding_box.to_overpass_string();
    format!(
        r#"[out:json][timeout:{QUERY_TIMEOUT_SECS}];
(
way["bridge"]["bridge"!="no"]({bounds});
way["man_made"="bridge"]({bounds});
node["bridge"]["bridge"!="no"]({bounds});
);
out center;"#
    )
}

/// Named highways and waterways within `NEARBY_RADIUS_M`, tags only
fn nearby_query(at: Coordinate) -> String {
    let around = format!("around:{NEARBY_RADIUS_M},{},{}", at.lat, at.lon);
    format!(
        r#"[out:json][timeout:{NEARBY_QUERY_TIMEOUT_SECS}];
(
way["highway"]["name"]({around});
way["waterway"]["name"]({around});
);
out tags;"#
    )
}

/// First named street and first named waterway, in response order. A way
/// tagged as both counts as a street.
fn nearby_from_elements(elements: &[OsmElement]) -> NearbyNames {
    let mut names = NearbyNames::default();
    for element in elements {
        let Some(name) = element.tag("name") else {
            continue;
        };
        if element.tag("highway").is_some() {
            names.street.get_or_insert_with(|| name.clone());
        } else if element.tag("waterway").is_some() {
            names.water.get_or_insert_with(|| name.clone());
        }
    }
    names
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverpassResponse {
    pub elements: Vec<OsmElement>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OsmElement {
    #[serde(rename = "type")]
    pub element_type: String,
    pub id: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub center: Option<Center>,
    pub tags: Option<HashMap<String, String>>,
}

impl OsmElement {
    /// Get the latitude, preferring center for ways/relations
    pub fn latitude(&self) -> Option<f64> {
        self.lat.or_else(|| self.center.as_ref().map(|c| c.lat))
    }

    /// Get the longitude, preferring center for ways/relations
    pub fn longitude(&self) -> Option<f64> {
        self.lon.or_else(|| self.center.as_ref().map(|c| c.lon))
    }

    /// Get a non-empty tag value
    pub fn tag(&self, key: &str) -> Option<&String> {
        self.tags
            .as_ref()
            .and_then(|t| t.get(key))
            .filter(|v| !v.trim().is_empty())
    }

    /// Stable key, e.g. "way/123"
    pub fn external_key(&self) -> String {
        format!("{}/{}", self.element_type, self.id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Center {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum OsmError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Overpass request timed out")]
    Timeout,
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl OsmError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OsmError::Timeout
        } else {
            OsmError::NetworkError(e.to_string())
        }
    }
}
