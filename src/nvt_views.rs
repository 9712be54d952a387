// Popup content for a vehicle: unit conversion, compass headings, relative times and
// the GTFS-RT occupancy / movement label tables.

use crate::nvt_models::VehicleProperties;
use crate::nvt_surface::PopupContent;

pub const SPEED_UNIT_KEY: &str = "speed_unit";

const MPS_TO_MPH: f64 = 2.236936;
const MPS_TO_KMH: f64 = 3.6;

const COMPASS_POINTS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];

const OCCUPANCY_LABELS: [&str; 9] = [
    "Empty",
    "Many seats available",
    "Few seats available",
    "Standing room only",
    "Crushed standing room only",
    "Full",
    "Not accepting passengers",
    "No data available",
    "Not boardable",
];

const STATUS_LABELS: [&str; 3] = ["Incoming at", "Stopped at", "In transit to"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedUnit {
    #[default]
    Mph,
    Kmh,
}

impl SpeedUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedUnit::Mph => "mph",
            SpeedUnit::Kmh => "kmh",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mph" => Some(SpeedUnit::Mph),
            "kmh" | "km/h" => Some(SpeedUnit::Kmh),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpeedUnit::Mph => "mph",
            SpeedUnit::Kmh => "km/h",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            SpeedUnit::Mph => SpeedUnit::Kmh,
            SpeedUnit::Kmh => SpeedUnit::Mph,
        }
    }

    pub fn from_mps(&self, mps: f64) -> f64 {
        match self {
            SpeedUnit::Mph => mps * MPS_TO_MPH,
            SpeedUnit::Kmh => mps * MPS_TO_KMH,
        }
    }
}

/// 8-way compass point for a heading in degrees.
pub fn compass_point(heading: f64) -> &'static str {
    if !heading.is_finite() {
        return COMPASS_POINTS[0];
    }
    let normalized = heading.rem_euclid(360.0);
    let idx = (normalized / 45.0).round() as usize % COMPASS_POINTS.len();
    COMPASS_POINTS[idx]
}

/// `{s}s ago` under a minute, `{m}m ago` under an hour, `{h}h ago` beyond.
/// Empty for a zero timestamp.
pub fn time_ago(ts: i64, now: i64) -> String {
    if ts == 0 {
        return String::new();
    }
    let s = (now - ts).max(0);
    if s < 60 {
        return format!("{}s ago", s);
    }
    let m = s / 60;
    if m < 60 {
        return format!("{}m ago", m);
    }
    format!("{}h ago", m / 60)
}

pub fn occupancy_label(code: i64) -> Option<&'static str> {
    usize::try_from(code)
        .ok()
        .and_then(|i| OCCUPANCY_LABELS.get(i).copied())
}

pub fn status_label(code: i64) -> Option<&'static str> {
    usize::try_from(code)
        .ok()
        .and_then(|i| STATUS_LABELS.get(i).copied())
}

/// Builds the popup for one vehicle.
pub fn vehicle_popup(props: &VehicleProperties, unit: SpeedUnit, now: i64) -> PopupContent {
    let title = format!("Vehicle {}", props.label.as_deref().unwrap_or(&props.id));
    let mut lines = vec![format!("Route {}", props.route_id)];

    match &props.trip_id {
        Some(trip) => lines.push(format!("Trip {}", trip)),
        None => lines.push("Not in service".to_string()),
    }

    lines.push(format!(
        "{:.1} {} {}",
        unit.from_mps(props.speed),
        unit.label(),
        compass_point(props.heading)
    ));

    if let Some(status) = props.current_status.and_then(status_label) {
        match &props.stop_id {
            Some(stop) => lines.push(format!("{} stop {}", status, stop)),
            None => lines.push(status.to_string()),
        }
    }

    if let Some(seq) = props.current_stop_sequence {
        lines.push(format!("Stop sequence {}", seq));
    }

    if let Some(occupancy) = props.occupancy_status.and_then(occupancy_label) {
        match props.occupancy_percentage {
            Some(pct) => lines.push(format!("{} ({:.0}%)", occupancy, pct)),
            None => lines.push(occupancy.to_string()),
        }
    }

    if let Some(plate) = &props.license_plate {
        lines.push(format!("Plate {}", plate));
    }

    if let Some(feed) = &props.feed {
        lines.push(format!("Feed {}", feed));
    }

    let ago = time_ago(props.ts, now);
    if !ago.is_empty() {
        lines.push(format!("Updated {}", ago));
    }

    PopupContent { title, lines }
}
