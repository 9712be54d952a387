// Backend data layer: routes table, live vehicle snapshot and per-route geometry.

use crate::nvt_models::{NVTError, Result, RouteRow, VehicleRecord};
use crate::nvt_surface::Bounds;
use futures::future::BoxFuture;
use geojson::FeatureCollection;
use log::{debug, warn};
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// `{api_base}/routes/{route_id}/{tail...}` with each segment escaped.
pub fn route_url(api_base: &str, route_id: &str, tail: &[&str]) -> Result<Url> {
    let mut url = Url::parse(api_base)
        .map_err(|e| NVTError::ConfigError(format!("Invalid API base '{}': {}", api_base, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| NVTError::ConfigError(format!("API base '{}' cannot hold a path", api_base)))?;
        segments.pop_if_empty().push("routes").push(route_id).extend(tail);
    }
    Ok(url)
}

fn endpoint(api_base: &str, path: &[&str]) -> Result<Url> {
    let mut url = Url::parse(api_base)
        .map_err(|e| NVTError::ConfigError(format!("Invalid API base '{}': {}", api_base, e)))?;
    url.path_segments_mut()
        .map_err(|_| NVTError::ConfigError(format!("API base '{}' cannot hold a path", api_base)))?
        .pop_if_empty()
        .extend(path);
    Ok(url)
}

/// Everything the map needs from the backend.
pub trait TransitApi: Send + Sync {
    fn routes(&self) -> BoxFuture<'_, Result<Vec<RouteRow>>>;
    fn vehicles(&self) -> BoxFuture<'_, Result<Vec<VehicleRecord>>>;
    fn route_shape(&self, route_id: String) -> BoxFuture<'_, Result<FeatureCollection>>;
    fn route_streets(&self, route_id: String) -> BoxFuture<'_, Result<FeatureCollection>>;
    fn route_bbox(&self, route_id: String) -> BoxFuture<'_, Result<Bounds>>;
}

pub struct HttpTransitApi {
    client: reqwest::Client,
    api_base: String,
}

impl HttpTransitApi {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NVTError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;
        endpoint(api_base, &[])?;
        Ok(Self {
            client,
            api_base: api_base.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| NVTError::NetworkError(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(NVTError::NetworkError(format!(
                "API returned error {} for {}",
                response.status(),
                url
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| NVTError::NetworkError(format!("Failed to read response: {}", e)))?;

        serde_json::from_str(&body)
            .map_err(|e| NVTError::ParseError(format!("Invalid JSON from {}: {}", url, e)))
    }
}

/// Vehicle snapshots are read leniently: anything but an array is treated as empty.
pub fn decode_vehicles(body: serde_json::Value) -> Vec<VehicleRecord> {
    match body {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("skipping undecodable vehicle: {}", e);
                    None
                }
            })
            .collect(),
        other => {
            warn!("vehicles endpoint returned non-array body ({})", json_kind(&other));
            Vec::new()
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl TransitApi for HttpTransitApi {
    fn routes(&self) -> BoxFuture<'_, Result<Vec<RouteRow>>> {
        Box::pin(async move {
            let url = endpoint(&self.api_base, &["routes"])?;
            self.get_json(url).await
        })
    }

    fn vehicles(&self) -> BoxFuture<'_, Result<Vec<VehicleRecord>>> {
        Box::pin(async move {
            let url = endpoint(&self.api_base, &["vehicles"])?;
            let body: serde_json::Value = self.get_json(url).await?;
            Ok(decode_vehicles(body))
        })
    }

    fn route_shape(&self, route_id: String) -> BoxFuture<'_, Result<FeatureCollection>> {
        Box::pin(async move {
            let url = route_url(&self.api_base, &route_id, &["shape"])?;
            self.get_json(url).await
        })
    }

    fn route_streets(&self, route_id: String) -> BoxFuture<'_, Result<FeatureCollection>> {
        Box::pin(async move {
            let url = route_url(&self.api_base, &route_id, &["streets"])?;
            self.get_json(url).await
        })
    }

    fn route_bbox(&self, route_id: String) -> BoxFuture<'_, Result<Bounds>> {
        Box::pin(async move {
            let url = route_url(&self.api_base, &route_id, &["streets", "bbox"])?;
            let raw: [f64; 4] = self.get_json(url).await?;
            Bounds::from_array(raw).ok_or_else(|| {
                NVTError::ParseError(format!("Invalid bbox for route {}: {:?}", route_id, raw))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_url_escapes_segments() {
        let url = route_url("http://api.test", "agency:R5", &["streets.mvt"]).unwrap();
        assert_eq!(url.as_str(), "http://api.test/routes/agency:R5/streets.mvt");

        let url = route_url("http://api.test/v1", "a/b c", &["bbox"]).unwrap();
        assert_eq!(url.as_str(), "http://api.test/v1/routes/a%2Fb%20c/bbox");
    }

    #[test]
    fn test_route_url_rejects_bad_base() {
        assert!(matches!(
            route_url("not a url", "R5", &["bbox"]),
            Err(NVTError::ConfigError(_))
        ));
    }

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(
            endpoint("http://api.test/", &["vehicles"]).unwrap().as_str(),
            "http://api.test/vehicles"
        );
    }

    #[test]
    fn test_decode_vehicles_is_lenient() {
        assert!(decode_vehicles(json!({"detail": "oops"})).is_empty());
        assert!(decode_vehicles(json!(null)).is_empty());

        let records = decode_vehicles(json!([
            {"id": "v1", "lat": 39.3, "lon": -76.6},
            "junk",
            {"id": 7}
        ]));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, json!("v1"));
    }

    #[test]
    fn test_http_api_rejects_bad_base() {
        assert!(HttpTransitApi::new("::", Duration::from_secs(1)).is_err());
    }
}
