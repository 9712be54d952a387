// Map layer lifecycle: keeps the vehicle source/layer alive across data refreshes and
// destructive style swaps, and owns the registry of every custom source and layer
// placed on the map.

use crate::nvt_colors::{IN_SERVICE_FALLBACK_GREEN, NOT_IN_SERVICE_GRAY};
use crate::nvt_config::StyleKey;
use crate::nvt_models::VehicleProperties;
use crate::nvt_surface::{
    BindTarget, BindingId, CameraEase, LayerKind, LayerSpec, MapNotification, MapSurface,
    PointerEventKind, SourceSpec,
};
use log::{debug, info};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const VEHICLE_SOURCE_ID: &str = "vehicles-src";
pub const VEHICLE_LAYER_ID: &str = "vehicles-layer";

pub const VEHICLE_RADIUS: f64 = 6.0;
pub const VEHICLE_STROKE_WIDTH: f64 = 1.5;
pub const VEHICLE_STROKE_COLOR: &str = "#000000";

const EXTRUDED_PITCH: f64 = 60.0;
const EXTRUDED_BEARING: f64 = -17.6;
const CAMERA_EASE_MS: u64 = 1000;

// ============================================================================
// Vehicle styling
// ============================================================================

/// Fill color for a vehicle point: gray without a trip, else the route color, else green.
pub fn vehicle_fill_color(props: &VehicleProperties) -> &str {
    let has_trip = props.trip_id.as_deref().is_some_and(|t| !t.is_empty());
    if !has_trip {
        return NOT_IN_SERVICE_GRAY;
    }
    match props.color.as_deref() {
        Some(color) if !color.is_empty() => color,
        _ => IN_SERVICE_FALLBACK_GREEN,
    }
}

/// The same rule as [`vehicle_fill_color`], as a style-spec paint object.
pub fn vehicle_paint() -> Value {
    json!({
        "circle-radius": VEHICLE_RADIUS,
        "circle-stroke-width": VEHICLE_STROKE_WIDTH,
        "circle-stroke-color": VEHICLE_STROKE_COLOR,
        "circle-color": [
            "case",
            ["any",
                ["!", ["has", "trip_id"]],
                ["==", ["to-string", ["get", "trip_id"]], ""]],
            NOT_IN_SERVICE_GRAY,
            ["all",
                ["has", "color"],
                ["!=", ["to-string", ["get", "color"]], ""]],
            ["get", "color"],
            IN_SERVICE_FALLBACK_GREEN
        ]
    })
}

fn vehicle_layer() -> LayerSpec {
    LayerSpec {
        id: VEHICLE_LAYER_ID.to_string(),
        source: VEHICLE_SOURCE_ID.to_string(),
        source_layer: None,
        kind: LayerKind::Circle,
        paint: vehicle_paint(),
    }
}

fn empty_collection() -> geojson::FeatureCollection {
    geojson::FeatureCollection {
        bbox: None,
        features: vec![],
        foreign_members: None,
    }
}

// ============================================================================
// Layer registry
// ============================================================================

/// Intended set of custom sources and layers, reconciled against the engine on
/// every mutation so that adds and removals never hit an engine conflict.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    sources: BTreeSet<String>,
    layers: BTreeMap<String, LayerSpec>,
}

impl LayerRegistry {
    pub fn ensure_source(&mut self, map: &mut dyn MapSurface, id: &str, spec: SourceSpec) {
        self.sources.insert(id.to_string());
        if !map.has_source(id) {
            map.add_source(id, spec);
        }
    }

    pub fn ensure_layer(&mut self, map: &mut dyn MapSurface, layer: LayerSpec) {
        let id = layer.id.clone();
        if !map.has_layer(&id) {
            map.add_layer(layer.clone());
        }
        self.layers.insert(id, layer);
    }

    pub fn remove_layer(&mut self, map: &mut dyn MapSurface, id: &str) {
        self.layers.remove(id);
        if map.has_layer(id) {
            map.remove_layer(id);
        }
    }

    /// Removes a source along with any registered layer still drawing from it.
    pub fn remove_source(&mut self, map: &mut dyn MapSurface, id: &str) {
        let dependents: Vec<String> = self
            .layers
            .values()
            .filter(|l| l.source == id)
            .map(|l| l.id.clone())
            .collect();
        for layer_id in dependents {
            self.remove_layer(map, &layer_id);
        }

        self.sources.remove(id);
        if map.has_source(id) {
            map.remove_source(id);
        }
    }

    /// Pushes new data into an existing GeoJSON source. `false` when the engine lost it.
    pub fn update_source_data(
        &mut self,
        map: &mut dyn MapSurface,
        id: &str,
        data: geojson::FeatureCollection,
    ) -> bool {
        map.has_source(id) && map.set_source_data(id, data)
    }

    /// Registered sources and layers the engine no longer has.
    pub fn missing_on_engine(&self, map: &dyn MapSurface) -> Vec<String> {
        self.sources
            .iter()
            .filter(|id| !map.has_source(id))
            .chain(self.layers.keys().filter(|id| !map.has_layer(id)))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Style change latch
// ============================================================================

/// Resolves at most once per style change request, whichever completion source
/// (engine notification or fallback check) gets there first.
#[derive(Debug)]
pub struct StyleLatch {
    request: u64,
    fired: AtomicBool,
}

impl StyleLatch {
    fn new(request: u64) -> Self {
        Self {
            request,
            fired: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> u64 {
        self.request
    }

    /// `true` only for the first caller.
    pub fn try_resolve(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleState {
    pub key: StyleKey,
    pub map_ready: bool,
}

/// A pending style load; the caller schedules a fallback check after `fallback_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleRequest {
    pub request: u64,
    pub fallback_after: Duration,
}

pub struct MapLayerLifecycle {
    state: LifecycleState,
    style: StyleState,
    registry: LayerRegistry,
    latch: Option<StyleLatch>,
    next_request: u64,
    vehicle_bindings: Vec<BindingId>,
    latest: Option<geojson::FeatureCollection>,
    fallback_delay: Duration,
}

impl MapLayerLifecycle {
    pub fn new(initial_style: StyleKey, fallback_delay: Duration) -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            style: StyleState {
                key: initial_style,
                map_ready: false,
            },
            registry: LayerRegistry::default(),
            latch: None,
            next_request: 1,
            vehicle_bindings: Vec::new(),
            latest: None,
            fallback_delay,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn style(&self) -> StyleState {
        self.style
    }

    pub fn is_ready(&self) -> bool {
        self.state == LifecycleState::Ready
    }

    pub fn registry_mut(&mut self) -> &mut LayerRegistry {
        &mut self.registry
    }

    fn begin_style_load(&mut self, map: &mut dyn MapSurface, url: &str) -> StyleRequest {
        let request = self.next_request;
        self.next_request += 1;

        self.state = LifecycleState::Loading;
        self.style.map_ready = false;
        self.latch = Some(StyleLatch::new(request));
        map.set_style(url);

        StyleRequest {
            request,
            fallback_after: self.fallback_delay,
        }
    }

    /// Loads the initial style on a freshly constructed map.
    pub fn attach(&mut self, map: &mut dyn MapSurface, url: &str) -> StyleRequest {
        info!("loading initial style '{}'", self.style.key.as_str());
        self.begin_style_load(map, url)
    }

    /// Swaps the basemap. Returns `None` when `key` is already the active, loaded style.
    pub fn change_style(
        &mut self,
        map: &mut dyn MapSurface,
        key: StyleKey,
        url: &str,
    ) -> Option<StyleRequest> {
        if key == self.style.key && self.state == LifecycleState::Ready {
            return None;
        }
        info!("switching style to '{}'", key.as_str());
        self.style.key = key;
        Some(self.begin_style_load(map, url))
    }

    /// Handles a style notification from the engine. Returns `true` when it moved
    /// the lifecycle to `Ready`.
    pub fn on_notification(
        &mut self,
        map: &mut dyn MapSurface,
        notification: MapNotification,
    ) -> bool {
        if self.state != LifecycleState::Loading || !map.is_style_loaded() {
            debug!("ignoring {:?} in state {:?}", notification, self.state);
            return false;
        }
        let first = self.latch.as_ref().is_some_and(StyleLatch::try_resolve);
        if !first {
            debug!("suppressed duplicate {:?}", notification);
            return false;
        }
        self.on_ready(map);
        true
    }

    /// Fallback for a style load whose notifications never arrived.
    pub fn on_style_fallback(&mut self, map: &mut dyn MapSurface, request: u64) -> bool {
        let Some(latch) = self.latch.as_ref() else {
            return false;
        };
        if latch.request() != request {
            debug!("stale style fallback check {}", request);
            return false;
        }
        if !map.is_style_loaded() {
            debug!("style {} still loading at fallback check", request);
            return false;
        }
        if !latch.try_resolve() {
            return false;
        }
        info!("style {} resolved by fallback check", request);
        self.on_ready(map);
        true
    }

    fn on_ready(&mut self, map: &mut dyn MapSurface) {
        let lost = self.registry.missing_on_engine(map);
        if !lost.is_empty() {
            debug!("style load dropped {:?}", lost);
        }

        self.state = LifecycleState::Ready;
        self.style.map_ready = true;
        self.recreate_vehicle_layer(map);
        self.apply_style_treatment(map);
    }

    fn apply_style_treatment(&self, map: &mut dyn MapSurface) {
        if self.style.key == StyleKey::ThreeD {
            map.set_building_extrusion(true);
            map.ease_to(CameraEase {
                pitch: EXTRUDED_PITCH,
                bearing: EXTRUDED_BEARING,
                duration_ms: CAMERA_EASE_MS,
            });
        } else {
            map.set_building_extrusion(false);
            map.ease_to(CameraEase {
                pitch: 0.0,
                bearing: 0.0,
                duration_ms: CAMERA_EASE_MS,
            });
        }
    }

    fn recreate_vehicle_layer(&mut self, map: &mut dyn MapSurface) {
        for binding in self.vehicle_bindings.drain(..) {
            map.unbind(binding);
        }

        self.registry.remove_layer(map, VEHICLE_LAYER_ID);
        self.registry.remove_source(map, VEHICLE_SOURCE_ID);

        let data = self.latest.clone().unwrap_or_else(empty_collection);
        self.registry
            .ensure_source(map, VEHICLE_SOURCE_ID, SourceSpec::GeoJson(data));
        self.registry.ensure_layer(map, vehicle_layer());

        let layer = BindTarget::Layer(VEHICLE_LAYER_ID.to_string());
        for kind in [
            PointerEventKind::Enter,
            PointerEventKind::Move,
            PointerEventKind::Leave,
            PointerEventKind::Click,
        ] {
            self.vehicle_bindings.push(map.bind(layer.clone(), kind));
        }
        self.vehicle_bindings
            .push(map.bind(BindTarget::Map, PointerEventKind::Click));
    }

    /// Applies a fresh vehicle collection. Before the map is ready the data is only
    /// remembered and goes in when the layer is created.
    pub fn refresh(&mut self, map: &mut dyn MapSurface, data: geojson::FeatureCollection) {
        self.latest = Some(data.clone());
        if self.state != LifecycleState::Ready {
            return;
        }
        if !self
            .registry
            .update_source_data(map, VEHICLE_SOURCE_ID, data)
        {
            debug!("vehicle source missing on refresh, recreating layer");
            self.recreate_vehicle_layer(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvt_surface::MapScene;

    fn props(trip: Option<&str>, color: Option<&str>) -> VehicleProperties {
        VehicleProperties {
            id: "v1".to_string(),
            route_id: "R5".to_string(),
            speed: 0.0,
            heading: 0.0,
            ts: 0,
            feed: None,
            label: None,
            license_plate: None,
            trip_id: trip.map(str::to_string),
            current_status: None,
            stop_id: None,
            current_stop_sequence: None,
            occupancy_status: None,
            occupancy_percentage: None,
            color: color.map(str::to_string),
            in_service: trip.is_some_and(|t| !t.is_empty()),
        }
    }

    fn point_collection(n: usize) -> geojson::FeatureCollection {
        let features = (0..n)
            .map(|i| geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::Point(vec![
                    i as f64, 0.0,
                ]))),
                id: None,
                properties: None,
                foreign_members: None,
            })
            .collect();
        geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }

    fn ready_lifecycle(map: &mut MapScene, key: StyleKey) -> MapLayerLifecycle {
        let mut lifecycle = MapLayerLifecycle::new(key, Duration::from_millis(1500));
        lifecycle.attach(map, "style-a");
        map.finish_style_load();
        for n in map.take_notifications() {
            lifecycle.on_notification(map, n);
        }
        lifecycle
    }

    #[test]
    fn test_fill_color_rule() {
        assert_eq!(vehicle_fill_color(&props(None, Some("#2563EB"))), NOT_IN_SERVICE_GRAY);
        assert_eq!(vehicle_fill_color(&props(Some(""), Some("#2563EB"))), NOT_IN_SERVICE_GRAY);
        assert_eq!(vehicle_fill_color(&props(Some("t1"), Some("#2563EB"))), "#2563EB");
        assert_eq!(vehicle_fill_color(&props(Some("t1"), Some(""))), IN_SERVICE_FALLBACK_GREEN);
        assert_eq!(vehicle_fill_color(&props(Some("t1"), None)), IN_SERVICE_FALLBACK_GREEN);
    }

    #[test]
    fn test_paint_has_fixed_stroke_and_radius() {
        let paint = vehicle_paint();
        assert_eq!(paint["circle-stroke-color"], json!("#000000"));
        assert_eq!(paint["circle-radius"], json!(VEHICLE_RADIUS));
        assert_eq!(paint["circle-color"][0], json!("case"));
    }

    #[test]
    fn test_latch_resolves_once() {
        let latch = StyleLatch::new(1);
        assert!(latch.try_resolve());
        assert!(!latch.try_resolve());
    }

    #[test]
    fn test_uninitialized_to_ready() {
        let mut map = MapScene::new(true);
        let mut lifecycle = MapLayerLifecycle::new(StyleKey::Streets, Duration::from_millis(10));
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        lifecycle.attach(&mut map, "style-a");
        assert_eq!(lifecycle.state(), LifecycleState::Loading);
        assert!(!lifecycle.style().map_ready);

        map.finish_style_load();
        let transitions: Vec<bool> = map
            .take_notifications()
            .into_iter()
            .map(|n| lifecycle.on_notification(&mut map, n))
            .collect();
        assert_eq!(transitions, vec![true, false]);
        assert!(lifecycle.is_ready());
        assert!(map.has_source(VEHICLE_SOURCE_ID));
        assert!(map.has_layer(VEHICLE_LAYER_ID));
        assert_eq!(map.binding_count(), 5);
        assert_eq!(map.conflicts(), 0);
    }

    #[test]
    fn test_notification_before_style_loaded_is_ignored() {
        let mut map = MapScene::new(true);
        let mut lifecycle = MapLayerLifecycle::new(StyleKey::Streets, Duration::from_millis(10));
        lifecycle.attach(&mut map, "style-a");
        assert!(!lifecycle.on_notification(&mut map, MapNotification::StyleData));
        assert_eq!(lifecycle.state(), LifecycleState::Loading);
    }

    #[test]
    fn test_fallback_check_resolves_silent_style_load() {
        let mut map = MapScene::new(true);
        let mut lifecycle = MapLayerLifecycle::new(StyleKey::Streets, Duration::from_millis(10));
        let request = lifecycle.attach(&mut map, "style-a");

        assert!(!lifecycle.on_style_fallback(&mut map, request.request));
        map.finish_style_load_silently();
        assert!(lifecycle.on_style_fallback(&mut map, request.request));
        assert!(lifecycle.is_ready());
        // a late notification is a no-op
        assert!(!lifecycle.on_notification(&mut map, MapNotification::StyleLoad));
        assert!(!lifecycle.on_style_fallback(&mut map, request.request));
    }

    #[test]
    fn test_stale_fallback_is_ignored() {
        let mut map = MapScene::new(true);
        let mut lifecycle = ready_lifecycle(&mut map, StyleKey::Streets);
        let old = 1;
        let new = lifecycle
            .change_style(&mut map, StyleKey::Dark, "style-b")
            .unwrap();
        assert_ne!(old, new.request);
        map.finish_style_load_silently();
        assert!(!lifecycle.on_style_fallback(&mut map, old));
        assert!(lifecycle.on_style_fallback(&mut map, new.request));
    }

    #[test]
    fn test_repeated_style_swaps_keep_exactly_one_vehicle_layer() {
        let mut map = MapScene::new(true);
        let mut lifecycle = ready_lifecycle(&mut map, StyleKey::Streets);

        for (i, key) in [StyleKey::Dark, StyleKey::ThreeD, StyleKey::Light, StyleKey::Dark]
            .into_iter()
            .enumerate()
        {
            lifecycle.refresh(&mut map, point_collection(i + 1));
            lifecycle.change_style(&mut map, key, &format!("style-{}", i));
            // data arriving mid-swap is remembered
            lifecycle.refresh(&mut map, point_collection(i + 2));
            map.finish_style_load();
            for n in map.take_notifications() {
                lifecycle.on_notification(&mut map, n);
            }
            assert!(lifecycle.is_ready());
            let vehicle_layers = map
                .layers()
                .iter()
                .filter(|l| l.id == VEHICLE_LAYER_ID)
                .count();
            assert_eq!(vehicle_layers, 1);
            assert_eq!(map.source_count(), 1);
            assert_eq!(
                map.source_data(VEHICLE_SOURCE_ID).unwrap().features.len(),
                i + 2
            );
            assert_eq!(map.binding_count(), 5);
        }
        assert_eq!(map.conflicts(), 0);
    }

    #[test]
    fn test_same_style_while_ready_is_noop() {
        let mut map = MapScene::new(true);
        let mut lifecycle = ready_lifecycle(&mut map, StyleKey::Streets);
        assert!(lifecycle
            .change_style(&mut map, StyleKey::Streets, "style-a")
            .is_none());
    }

    #[test]
    fn test_three_d_treatment() {
        let mut map = MapScene::new(true);
        let mut lifecycle = ready_lifecycle(&mut map, StyleKey::ThreeD);
        assert!(map.extrusion());
        assert_eq!(map.camera().pitch, EXTRUDED_PITCH);

        lifecycle.change_style(&mut map, StyleKey::Light, "style-b");
        map.finish_style_load();
        for n in map.take_notifications() {
            lifecycle.on_notification(&mut map, n);
        }
        assert!(!map.extrusion());
        assert_eq!(map.camera().pitch, 0.0);
        assert_eq!(map.camera().bearing, 0.0);
    }

    #[test]
    fn test_refresh_updates_in_place() {
        let mut map = MapScene::new(true);
        let mut lifecycle = ready_lifecycle(&mut map, StyleKey::Streets);
        lifecycle.refresh(&mut map, point_collection(3));
        assert_eq!(map.source_data(VEHICLE_SOURCE_ID).unwrap().features.len(), 3);
        assert_eq!(map.binding_count(), 5);
    }

    #[test]
    fn test_refresh_recreates_missing_source() {
        let mut map = MapScene::new(true);
        let mut lifecycle = ready_lifecycle(&mut map, StyleKey::Streets);
        map.remove_layer(VEHICLE_LAYER_ID);
        map.remove_source(VEHICLE_SOURCE_ID);

        lifecycle.refresh(&mut map, point_collection(2));
        assert!(map.has_layer(VEHICLE_LAYER_ID));
        assert_eq!(map.source_data(VEHICLE_SOURCE_ID).unwrap().features.len(), 2);
        assert_eq!(map.binding_count(), 5);
        assert_eq!(map.conflicts(), 0);
    }

    #[test]
    fn test_registry_removal_is_idempotent() {
        let mut map = MapScene::new(true);
        let mut registry = LayerRegistry::default();
        registry.remove_layer(&mut map, "absent");
        registry.remove_source(&mut map, "absent");
        registry.ensure_source(&mut map, "s", SourceSpec::GeoJson(point_collection(0)));
        registry.ensure_source(&mut map, "s", SourceSpec::GeoJson(point_collection(0)));
        assert_eq!(map.conflicts(), 0);
        assert!(registry.missing_on_engine(&map).is_empty());
    }
}
