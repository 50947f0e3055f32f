use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_FEED_URL: &str = "https://opendata.ndw.nu/brugopeningen.xml.gz";
const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub overpass: OverpassConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    #[serde(default = "default_feed_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverpassConfig {
    #[serde(default = "default_overpass_url")]
    pub url: String,
    /// Must exceed the `[timeout:...]` of the Overpass query itself
    #[serde(default = "default_overpass_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_areas")]
    pub areas: Vec<Area>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "default_nominatim_url")]
    pub url: String,
    /// Nominatim's usage policy requires an identifying User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_geocoder_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_request_interval")]
    pub request_interval_ms: u64,
    /// Upper bound of bridges enriched per run; unlimited when absent
    #[serde(default)]
    pub max_per_run: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_opening_interval")]
    pub opening_sync_hours: u64,
    #[serde(default = "default_weekly_interval")]
    pub geo_import_hours: u64,
    #[serde(default = "default_weekly_interval")]
    pub enrichment_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Area {
    pub name: String,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Returns bbox as Overpass API format string: "south,west,north,east"
    pub fn to_overpass_string(&self) -> String {
        format!("{},{},{},{}", self.south, self.west, self.north, self.east)
    }

    fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.south)
            && (-90.0..=90.0).contains(&self.north)
            && (-180.0..=180.0).contains(&self.west)
            && (-180.0..=180.0).contains(&self.east)
            && self.south < self.north
            && self.west < self.east
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl OverpassConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GeocoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

impl ScheduleConfig {
    pub fn opening_sync_interval(&self) -> Duration {
        hours(self.opening_sync_hours)
    }

    pub fn geo_import_interval(&self) -> Duration {
        hours(self.geo_import_hours)
    }

    pub fn enrichment_interval(&self) -> Duration {
        hours(self.enrichment_hours)
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 60 * 60)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for area in &self.overpass.areas {
            if !area.bounding_box.is_valid() {
                return Err(ConfigError::Invalid(format!(
                    "area '{}' has an invalid bounding box",
                    area.name
                )));
            }
        }

        if self.schedule.opening_sync_hours == 0
            || self.schedule.geo_import_hours == 0
            || self.schedule.enrichment_hours == 0
        {
            return Err(ConfigError::Invalid(
                "schedule intervals must be at least one hour".to_string(),
            ));
        }

        if self.feed.timeout_secs == 0
            || self.overpass.timeout_secs == 0
            || self.geocoder.timeout_secs == 0
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            feed: FeedConfig::default(),
            overpass: OverpassConfig::default(),
            geocoder: GeocoderConfig::default(),
            schedule: ScheduleConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            timeout_secs: default_feed_timeout(),
        }
    }
}

impl Default for OverpassConfig {
    fn default() -> Self {
        Self {
            url: default_overpass_url(),
            timeout_secs: default_overpass_timeout(),
            areas: default_areas(),
        }
    }
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            url: default_nominatim_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_geocoder_timeout(),
            request_interval_ms: default_request_interval(),
            max_per_run: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            opening_sync_hours: default_opening_interval(),
            geo_import_hours: default_weekly_interval(),
            enrichment_hours: default_weekly_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
            cors_permissive: false,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/bridgeping.db")
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_feed_timeout() -> u64 {
    60
}

fn default_overpass_url() -> String {
    DEFAULT_OVERPASS_URL.to_string()
}

fn default_overpass_timeout() -> u64 {
    320
}

fn default_nominatim_url() -> String {
    DEFAULT_NOMINATIM_URL.to_string()
}

fn default_user_agent() -> String {
    "BridgePing/1.0".to_string()
}

fn default_geocoder_timeout() -> u64 {
    10
}

fn default_request_interval() -> u64 {
    1000
}

fn default_opening_interval() -> u64 {
    6
}

fn default_weekly_interval() -> u64 {
    7 * 24
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

/// Major Dutch cities with movable bridges
fn default_areas() -> Vec<Area> {
    [
        ("Amsterdam", 52.3, 4.7, 52.45, 5.1),
        ("Rotterdam", 51.85, 4.3, 52.0, 4.65),
        ("Den Haag", 52.0, 4.2, 52.15, 4.45),
        ("Utrecht", 52.0, 5.0, 52.15, 5.2),
        ("Eindhoven", 51.4, 5.4, 51.5, 5.55),
        ("Groningen", 53.15, 6.45, 53.3, 6.65),
        ("Haarlem", 52.35, 4.55, 52.42, 4.7),
        ("Alkmaar", 52.6, 4.7, 52.65, 4.8),
        ("Zaandam", 52.4, 4.75, 52.5, 4.9),
    ]
    .into_iter()
    .map(|(name, south, west, north, east)| Area {
        name: name.to_string(),
        bounding_box: BoundingBox {
            south,
            west,
            north,
            east,
        },
    })
    .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();

        assert_eq!(config.feed.url, DEFAULT_FEED_URL);
        assert_eq!(config.schedule.opening_sync_interval(), Duration::from_secs(6 * 3600));
        assert_eq!(config.schedule.geo_import_interval(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.overpass.areas.len(), 9);
        assert!(!config.server.cors_permissive);
    }

    #[test]
    fn areas_replace_the_default_list() {
        let yaml = r#"
overpass:
  areas:
    - name: Leiden
      bounding_box: { south: 52.13, west: 4.45, north: 52.18, east: 4.52 }
feed:
  timeout_secs: 15
"#;
        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.overpass.areas.len(), 1);
        assert_eq!(config.overpass.areas[0].name, "Leiden");
        assert_eq!(
            config.overpass.areas[0].bounding_box.to_overpass_string(),
            "52.13,4.45,52.18,4.52"
        );
        assert_eq!(config.feed.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn inverted_bounding_box_is_rejected() {
        let yaml = r#"
overpass:
  areas:
    - name: Broken
      bounding_box: { south: 53.0, west: 4.0, north: 52.0, east: 5.0 }
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let yaml = "schedule:\n  opening_sync_hours: 0\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_path: /tmp/bridges.db").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/bridges.db"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = Config::load("/nonexistent/bridgeping.yaml");
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
