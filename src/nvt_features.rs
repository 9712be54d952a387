// Turns raw vehicle records into the point collection the map renders.

use crate::nvt_colors::RouteColorResolver;
use crate::nvt_models::{RenderableVehicleFeature, VehicleCollection, VehicleProperties, VehicleRecord};
use log::debug;
use serde_json::Value;

const UNKNOWN_ID: &str = "unknown";

fn finite_number(v: &Value) -> Option<f64> {
    v.as_f64().filter(|n| n.is_finite())
}

fn integer(v: &Value) -> Option<i64> {
    v.as_i64()
        .or_else(|| finite_number(v).filter(|n| n.fract() == 0.0).map(|n| n as i64))
}

/// Non-empty string content. Numbers are accepted as identifiers, zero is not.
fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

fn valid_position(record: &VehicleRecord) -> Option<(f64, f64)> {
    let lat = finite_number(&record.lat)?;
    let lon = finite_number(&record.lon)?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

/// Drops records without a usable position and fills defaults on the rest.
///
/// `now` (epoch seconds) stands in for missing timestamps. Color and service status
/// are left for [`build_collection`].
pub fn sanitize_records(records: &[VehicleRecord], now: i64) -> Vec<RenderableVehicleFeature> {
    let features: Vec<RenderableVehicleFeature> = records
        .iter()
        .filter_map(|record| {
            let (lat, lon) = valid_position(record)?;

            let properties = VehicleProperties {
                id: text(&record.id).unwrap_or_else(|| UNKNOWN_ID.to_string()),
                route_id: text(&record.route_id).unwrap_or_else(|| UNKNOWN_ID.to_string()),
                speed: finite_number(&record.speed).unwrap_or(0.0),
                heading: finite_number(&record.heading).unwrap_or(0.0),
                ts: finite_number(&record.ts).map(|t| t as i64).unwrap_or(now),
                feed: text(&record.feed),
                label: text(&record.label),
                license_plate: text(&record.license_plate),
                trip_id: text(&record.trip_id),
                current_status: integer(&record.current_status),
                stop_id: text(&record.stop_id),
                current_stop_sequence: integer(&record.current_stop_sequence),
                occupancy_status: integer(&record.occupancy_status),
                occupancy_percentage: finite_number(&record.occupancy_percentage),
                color: None,
                in_service: false,
            };

            Some(RenderableVehicleFeature { lon, lat, properties })
        })
        .collect();

    let dropped = records.len() - features.len();
    if dropped > 0 {
        debug!("dropped {} vehicle records with unusable coordinates", dropped);
    }

    features
}

/// Sanitizes `records` and attaches service status and route color.
///
/// Service status comes only from the trip id; the color is resolved from the route
/// id regardless of status, so an out-of-service vehicle still carries its route color.
pub fn build_collection(
    records: &[VehicleRecord],
    resolver: &RouteColorResolver,
    now: i64,
) -> VehicleCollection {
    let features = sanitize_records(records, now)
        .into_iter()
        .map(|mut feature| {
            let props = &mut feature.properties;
            props.in_service = props.trip_id.is_some();
            props.color = resolver.resolve_color(&props.route_id);
            feature
        })
        .collect();

    VehicleCollection { features }
}
