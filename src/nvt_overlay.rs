// Street geometry overlay for the selected route. Vector tiles are tried first; if the
// tile source has not attached by the fallback check, the full line collection is
// fetched and drawn as GeoJSON instead.

use crate::nvt_api::route_url;
use crate::nvt_colors::DEFAULT_ROUTE_COLOR;
use crate::nvt_layers::LayerRegistry;
use crate::nvt_surface::{Bounds, LayerKind, LayerSpec, MapSurface, SourceSpec, SourceStatus};
use geo::BoundingRect;
use geo_types::{Coord, LineString, MultiLineString};
use log::{debug, info, warn};
use serde_json::json;
use std::time::Duration;

pub const ROUTE_TILES_SOURCE_ID: &str = "route-streets-tiles";
pub const ROUTE_TILES_LAYER_ID: &str = "route-streets-tiles-layer";
pub const ROUTE_SOURCE_ID: &str = "route-streets-src";
pub const ROUTE_LAYER_ID: &str = "route-streets-layer";

const TILE_SOURCE_LAYER: &str = "streets";
const TILE_MIN_ZOOM: u8 = 5;
const TILE_MAX_ZOOM: u8 = 16;
const LINE_WIDTH: f64 = 4.0;
const LINE_OPACITY: f64 = 0.85;
const FIT_PADDING: f64 = 40.0;

/// Work the loader needs the data layer or the timer to do for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayRequest {
    Bbox { route_id: String, generation: u64 },
    Streets { route_id: String, generation: u64 },
    FallbackCheck { generation: u64, after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectedRoute {
    route_id: String,
    color: String,
}

pub struct RouteOverlayLoader {
    api_base: String,
    fallback_delay: Duration,
    selected: Option<SelectedRoute>,
    generation: u64,
}

impl RouteOverlayLoader {
    pub fn new(api_base: &str, fallback_delay: Duration) -> Self {
        Self {
            api_base: api_base.to_string(),
            fallback_delay,
            selected: None,
            generation: 0,
        }
    }

    pub fn selected_route(&self) -> Option<&str> {
        self.selected.as_ref().map(|s| s.route_id.as_str())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn tile_template(&self, route_id: &str) -> Option<String> {
        match route_url(&self.api_base, route_id, &["streets.mvt"]) {
            Ok(url) => Some(format!("{}/{{z}}/{{x}}/{{y}}", url)),
            Err(e) => {
                warn!("cannot build tile url for route {}: {}", route_id, e);
                None
            }
        }
    }

    fn line_paint(color: &str) -> serde_json::Value {
        json!({
            "line-color": color,
            "line-width": LINE_WIDTH,
            "line-opacity": LINE_OPACITY,
        })
    }

    fn teardown(&self, registry: &mut LayerRegistry, map: &mut dyn MapSurface) {
        registry.remove_layer(map, ROUTE_TILES_LAYER_ID);
        registry.remove_source(map, ROUTE_TILES_SOURCE_ID);
        registry.remove_layer(map, ROUTE_LAYER_ID);
        registry.remove_source(map, ROUTE_SOURCE_ID);
    }

    /// Records a selection without touching the map; drawn by the next [`reload`](Self::reload).
    pub fn remember(&mut self, route_id: &str, color: Option<String>) {
        self.generation += 1;
        self.selected = Some(SelectedRoute {
            route_id: route_id.to_string(),
            color: color.unwrap_or_else(|| DEFAULT_ROUTE_COLOR.to_string()),
        });
    }

    /// Replaces whatever overlay is on the map with `route_id`'s streets.
    pub fn select_route(
        &mut self,
        registry: &mut LayerRegistry,
        map: &mut dyn MapSurface,
        route_id: &str,
        color: Option<String>,
    ) -> Vec<OverlayRequest> {
        info!("selecting route {}", route_id);
        self.remember(route_id, color);
        self.reload(registry, map)
    }

    /// Tears down and redraws the current selection, e.g. after a style swap.
    pub fn reload(
        &mut self,
        registry: &mut LayerRegistry,
        map: &mut dyn MapSurface,
    ) -> Vec<OverlayRequest> {
        self.teardown(registry, map);
        let Some(selected) = self.selected.clone() else {
            return Vec::new();
        };
        self.generation += 1;

        if let Some(template) = self.tile_template(&selected.route_id) {
            registry.ensure_source(
                map,
                ROUTE_TILES_SOURCE_ID,
                SourceSpec::VectorTiles {
                    tiles: vec![template],
                    min_zoom: TILE_MIN_ZOOM,
                    max_zoom: TILE_MAX_ZOOM,
                },
            );
            registry.ensure_layer(
                map,
                LayerSpec {
                    id: ROUTE_TILES_LAYER_ID.to_string(),
                    source: ROUTE_TILES_SOURCE_ID.to_string(),
                    source_layer: Some(TILE_SOURCE_LAYER.to_string()),
                    kind: LayerKind::Line,
                    paint: Self::line_paint(&selected.color),
                },
            );
        }

        vec![
            OverlayRequest::Bbox {
                route_id: selected.route_id.clone(),
                generation: self.generation,
            },
            OverlayRequest::FallbackCheck {
                generation: self.generation,
                after: self.fallback_delay,
            },
        ]
    }

    pub fn clear_route(&mut self, registry: &mut LayerRegistry, map: &mut dyn MapSurface) {
        self.teardown(registry, map);
        self.selected = None;
        self.generation += 1;
    }

    fn is_current(&self, generation: u64) -> bool {
        if generation != self.generation || self.selected.is_none() {
            debug!("ignoring overlay response for generation {}", generation);
            return false;
        }
        true
    }

    pub fn on_bbox(&mut self, map: &mut dyn MapSurface, generation: u64, bounds: Bounds) {
        if self.is_current(generation) {
            map.fit_bounds(bounds, FIT_PADDING);
        }
    }

    /// Falls back to full geometry when the tile source failed to attach.
    pub fn on_fallback_check(
        &mut self,
        registry: &mut LayerRegistry,
        map: &mut dyn MapSurface,
        generation: u64,
    ) -> Option<OverlayRequest> {
        if !self.is_current(generation) {
            return None;
        }
        match map.source_status(ROUTE_TILES_SOURCE_ID) {
            SourceStatus::Loaded | SourceStatus::Loading => None,
            status => {
                let route_id = self.selected_route()?.to_string();
                info!("route {} tiles {:?}, falling back to full geometry", route_id, status);
                registry.remove_layer(map, ROUTE_TILES_LAYER_ID);
                registry.remove_source(map, ROUTE_TILES_SOURCE_ID);
                Some(OverlayRequest::Streets {
                    route_id,
                    generation,
                })
            }
        }
    }

    pub fn on_streets(
        &mut self,
        registry: &mut LayerRegistry,
        map: &mut dyn MapSurface,
        generation: u64,
        streets: geojson::FeatureCollection,
    ) {
        if !self.is_current(generation) {
            return;
        }
        let color = self
            .selected
            .as_ref()
            .map(|s| s.color.clone())
            .unwrap_or_else(|| DEFAULT_ROUTE_COLOR.to_string());
        let bounds = streets_bounds(&streets);

        registry.remove_layer(map, ROUTE_LAYER_ID);
        registry.remove_source(map, ROUTE_SOURCE_ID);
        registry.ensure_source(map, ROUTE_SOURCE_ID, SourceSpec::GeoJson(streets));
        registry.ensure_layer(
            map,
            LayerSpec {
                id: ROUTE_LAYER_ID.to_string(),
                source: ROUTE_SOURCE_ID.to_string(),
                source_layer: None,
                kind: LayerKind::Line,
                paint: Self::line_paint(&color),
            },
        );

        match bounds {
            Some(b) => map.fit_bounds(b, FIT_PADDING),
            None => debug!("route geometry has no coordinates, camera left in place"),
        }
    }
}

fn to_line_string(positions: &[Vec<f64>]) -> LineString<f64> {
    positions
        .iter()
        .filter(|p| p.len() >= 2 && p[0].is_finite() && p[1].is_finite())
        .map(|p| Coord { x: p[0], y: p[1] })
        .collect()
}

fn collect_lines(value: &geojson::Value, out: &mut Vec<LineString<f64>>) {
    match value {
        geojson::Value::LineString(positions) => out.push(to_line_string(positions)),
        geojson::Value::MultiLineString(lines) => {
            out.extend(lines.iter().map(|l| to_line_string(l)));
        }
        geojson::Value::GeometryCollection(geometries) => {
            for g in geometries {
                collect_lines(&g.value, out);
            }
        }
        _ => {}
    }
}

/// Bounding box over every coordinate of every line in the collection.
pub fn streets_bounds(streets: &geojson::FeatureCollection) -> Option<Bounds> {
    let mut lines = Vec::new();
    for feature in &streets.features {
        if let Some(geometry) = &feature.geometry {
            collect_lines(&geometry.value, &mut lines);
        }
    }
    lines.retain(|l| !l.0.is_empty());

    let rect = MultiLineString::new(lines).bounding_rect()?;
    Some(Bounds {
        min_lng: rect.min().x,
        min_lat: rect.min().y,
        max_lng: rect.max().x,
        max_lat: rect.max().y,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvt_surface::MapScene;

    fn line_feature(coords: Vec<Vec<f64>>) -> geojson::Feature {
        geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::LineString(coords))),
            id: None,
            properties: None,
            foreign_members: None,
        }
    }

    fn streets() -> geojson::FeatureCollection {
        geojson::FeatureCollection {
            bbox: None,
            features: vec![
                line_feature(vec![vec![-76.7, 39.2], vec![-76.6, 39.3]]),
                line_feature(vec![vec![-76.5, 39.25], vec![-76.55, 39.4]]),
            ],
            foreign_members: None,
        }
    }

    fn loader() -> RouteOverlayLoader {
        RouteOverlayLoader::new("http://api.test", Duration::from_millis(2500))
    }

    #[test]
    fn test_bounds_span_all_lines() {
        let b = streets_bounds(&streets()).unwrap();
        assert_eq!(b.min_lng, -76.7);
        assert_eq!(b.max_lng, -76.5);
        assert_eq!(b.min_lat, 39.2);
        assert_eq!(b.max_lat, 39.4);
    }

    #[test]
    fn test_bounds_of_empty_geometry() {
        let empty = geojson::FeatureCollection {
            bbox: None,
            features: vec![line_feature(vec![])],
            foreign_members: None,
        };
        assert!(streets_bounds(&empty).is_none());
    }

    #[test]
    fn test_select_route_adds_tiles_and_requests_bbox() {
        let mut map = MapScene::new(true);
        let mut registry = LayerRegistry::default();
        let mut loader = loader();

        let requests = loader.select_route(&mut registry, &mut map, "agency:R5", None);
        let generation = loader.generation();
        assert_eq!(
            requests,
            vec![
                OverlayRequest::Bbox {
                    route_id: "agency:R5".to_string(),
                    generation
                },
                OverlayRequest::FallbackCheck {
                    generation,
                    after: Duration::from_millis(2500)
                },
            ]
        );
        match map.source(ROUTE_TILES_SOURCE_ID) {
            Some(SourceSpec::VectorTiles { tiles, .. }) => assert_eq!(
                tiles[0],
                "http://api.test/routes/agency:R5/streets.mvt/{z}/{x}/{y}"
            ),
            other => panic!("unexpected source {:?}", other),
        }
        assert!(map.has_layer(ROUTE_TILES_LAYER_ID));

        // tiles attached: no fallback
        assert!(loader
            .on_fallback_check(&mut registry, &mut map, generation)
            .is_none());
    }

    #[test]
    fn test_reselect_tears_down_previous_overlay() {
        let mut map = MapScene::new(true);
        let mut registry = LayerRegistry::default();
        let mut loader = loader();

        loader.select_route(&mut registry, &mut map, "R1", Some("#FF0000".to_string()));
        loader.select_route(&mut registry, &mut map, "R1", Some("#FF0000".to_string()));
        loader.select_route(&mut registry, &mut map, "R2", None);

        let route_layers = map
            .layers()
            .iter()
            .filter(|l| l.id == ROUTE_TILES_LAYER_ID)
            .count();
        assert_eq!(route_layers, 1);
        assert_eq!(loader.selected_route(), Some("R2"));
        assert_eq!(map.conflicts(), 0);
    }

    #[test]
    fn test_fallback_fetches_full_geometry_and_fits_camera() {
        let mut map = MapScene::new(false);
        let mut registry = LayerRegistry::default();
        let mut loader = loader();

        loader.select_route(&mut registry, &mut map, "R5", Some("#2563EB".to_string()));
        let generation = loader.generation();

        let request = loader.on_fallback_check(&mut registry, &mut map, generation);
        assert_eq!(
            request,
            Some(OverlayRequest::Streets {
                route_id: "R5".to_string(),
                generation
            })
        );
        assert!(!map.has_source(ROUTE_TILES_SOURCE_ID));

        loader.on_streets(&mut registry, &mut map, generation, streets());
        assert!(map.has_layer(ROUTE_LAYER_ID));
        assert_eq!(
            map.layer(ROUTE_LAYER_ID).unwrap().paint["line-color"],
            json!("#2563EB")
        );
        assert_eq!(map.last_fit().unwrap().max_lat, 39.4);
        assert_eq!(map.conflicts(), 0);
    }

    #[test]
    fn test_stale_responses_are_ignored() {
        let mut map = MapScene::new(false);
        let mut registry = LayerRegistry::default();
        let mut loader = loader();

        loader.select_route(&mut registry, &mut map, "R1", None);
        let old = loader.generation();
        loader.select_route(&mut registry, &mut map, "R2", None);

        loader.on_bbox(&mut map, old, Bounds::from_array([0.0, 0.0, 1.0, 1.0]).unwrap());
        assert!(map.last_fit().is_none());
        assert!(loader.on_fallback_check(&mut registry, &mut map, old).is_none());
        loader.on_streets(&mut registry, &mut map, old, streets());
        assert!(!map.has_layer(ROUTE_LAYER_ID));
    }

    #[test]
    fn test_clear_route_removes_everything() {
        let mut map = MapScene::new(true);
        let mut registry = LayerRegistry::default();
        let mut loader = loader();

        loader.select_route(&mut registry, &mut map, "R1", None);
        loader.clear_route(&mut registry, &mut map);
        assert!(loader.selected_route().is_none());
        assert!(!map.has_layer(ROUTE_TILES_LAYER_ID));
        assert!(!map.has_source(ROUTE_TILES_SOURCE_ID));
        assert!(loader.reload(&mut registry, &mut map).is_empty());
    }
}
