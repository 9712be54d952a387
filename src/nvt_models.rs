// Data model for the live vehicle map: raw feed records as served by the backend,
// their sanitized renderable form, and route metadata used for coloring.
//
// API shapes consumed:
// - GET {api}/routes                -> RouteRow[]
// - GET {api}/vehicles              -> VehicleRecord[] (polled)
// - GET {api}/routes/{id}/streets   -> GeoJSON LineString collection
// - GET {api}/routes/{id}/streets/bbox -> [minX, minY, maxX, maxY]

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Data Structures
// ============================================================================

/// A vehicle position exactly as it arrives from the feed.
///
/// Numeric and identifier fields are kept as raw JSON values: a single record with a
/// string latitude or a null id must not fail decoding of the whole batch. The
/// sanitizer in `nvt_features` decides what is renderable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleRecord {
    pub id: Value,
    pub route_id: Value,
    pub lat: Value,
    pub lon: Value,
    pub speed: Value,
    pub heading: Value,
    pub ts: Value,
    pub feed: Value,
    pub label: Value,
    pub license_plate: Value,
    pub trip_id: Value,
    pub current_status: Value,
    pub stop_id: Value,
    pub current_stop_sequence: Value,
    pub occupancy_status: Value,
    pub occupancy_percentage: Value,
}

/// Sanitized properties attached to every rendered vehicle point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleProperties {
    pub id: String,
    pub route_id: String,
    /// Meters per second.
    pub speed: f64,
    /// Degrees clockwise from north.
    pub heading: f64,
    /// Seconds since the epoch.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stop_sequence: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_percentage: Option<f64>,
    /// Resolved route color (`#RRGGBB`), or `None` to let the renderer fall back.
    pub color: Option<String>,
    pub in_service: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderableVehicleFeature {
    pub lon: f64,
    pub lat: f64,
    pub properties: VehicleProperties,
}

impl RenderableVehicleFeature {
    pub fn id(&self) -> &str {
        &self.properties.id
    }
}

/// One poll's worth of renderable vehicles. Superseded wholesale on every refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleCollection {
    pub features: Vec<RenderableVehicleFeature>,
}

impl VehicleCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn find(&self, vehicle_id: &str) -> Option<&RenderableVehicleFeature> {
        self.features.iter().find(|f| f.id() == vehicle_id)
    }

    /// Converts the collection into the GeoJSON pushed into the map source.
    pub fn to_geojson(&self) -> geojson::FeatureCollection {
        let features = self
            .features
            .iter()
            .map(|f| {
                let properties = match serde_json::to_value(&f.properties) {
                    Ok(Value::Object(map)) => Some(map),
                    _ => None,
                };
                geojson::Feature {
                    bbox: None,
                    geometry: Some(geojson::Geometry::new(geojson::Value::Point(vec![
                        f.lon, f.lat,
                    ]))),
                    id: Some(geojson::feature::Id::String(f.properties.id.clone())),
                    properties,
                    foreign_members: None,
                }
            })
            .collect();

        geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRow {
    pub route_id: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub color: Option<String>,
    pub text_color: Option<String>,
    #[serde(rename = "type")]
    pub route_type: Option<i32>,
}

impl RouteRow {
    /// Short name when the feed has one, else the route id.
    pub fn display_name(&self) -> &str {
        self.short_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.route_id)
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum NVTError {
    NetworkError(String),
    ParseError(String),
    FileError(String),
    ConfigError(String),
    RuntimeError(String),
}

impl std::fmt::Display for NVTError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NVTError::NetworkError(e) => write!(f, "Network error: {}", e),
            NVTError::ParseError(e) => write!(f, "Parse error: {}", e),
            NVTError::FileError(e) => write!(f, "File error: {}", e),
            NVTError::ConfigError(e) => write!(f, "Config error: {}", e),
            NVTError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
        }
    }
}

impl std::error::Error for NVTError {}

pub type Result<T> = std::result::Result<T, NVTError>;

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
