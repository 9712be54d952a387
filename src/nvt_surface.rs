// The map-engine capability the core drives, plus `MapScene`, an in-memory engine
// that tracks sources, layers, bindings, camera and popup the way a style-based
// renderer does (a style swap wipes every custom source and layer, but not the
// event bindings registered on the map object).

use log::warn;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

// ============================================================================
// Geometry and specs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl Bounds {
    /// Builds bounds from `[minX, minY, maxX, maxY]`, rejecting inverted or non-finite boxes.
    pub fn from_array(b: [f64; 4]) -> Option<Self> {
        if b.iter().any(|v| !v.is_finite()) || b[0] > b[2] || b[1] > b[3] {
            return None;
        }
        Some(Self {
            min_lng: b[0],
            min_lat: b[1],
            max_lng: b[2],
            max_lat: b[3],
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    GeoJson(geojson::FeatureCollection),
    VectorTiles {
        tiles: Vec<String>,
        min_zoom: u8,
        max_zoom: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Missing,
    Loading,
    Loaded,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Circle,
    Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub id: String,
    pub source: String,
    pub source_layer: Option<String>,
    pub kind: LayerKind,
    /// Paint properties in style-spec form.
    pub paint: Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraEase {
    pub pitch: f64,
    pub bearing: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum BindTarget {
    Layer(String),
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PointerEventKind {
    Enter,
    Move,
    Leave,
    Click,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingId(pub u64);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopupContent {
    pub title: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapNotification {
    Load,
    StyleLoad,
    StyleData,
}

// ============================================================================
// Capability
// ============================================================================

/// Rendering engine operations. Adding something that exists or removing something
/// absent is an engine error; callers are expected to check first.
pub trait MapSurface {
    fn has_source(&self, id: &str) -> bool;
    fn add_source(&mut self, id: &str, spec: SourceSpec);
    /// Replaces a GeoJSON source's data. Returns `false` when the source is absent.
    fn set_source_data(&mut self, id: &str, data: geojson::FeatureCollection) -> bool;
    fn remove_source(&mut self, id: &str);
    fn source_status(&self, id: &str) -> SourceStatus;

    fn has_layer(&self, id: &str) -> bool;
    fn add_layer(&mut self, layer: LayerSpec);
    fn remove_layer(&mut self, id: &str);

    fn set_style(&mut self, url: &str);
    fn is_style_loaded(&self) -> bool;
    fn set_building_extrusion(&mut self, enabled: bool);

    fn ease_to(&mut self, camera: CameraEase);
    fn fit_bounds(&mut self, bounds: Bounds, padding: f64);

    fn bind(&mut self, target: BindTarget, kind: PointerEventKind) -> BindingId;
    fn unbind(&mut self, id: BindingId);

    fn open_popup(&mut self, at: LngLat, content: PopupContent);
    fn move_popup(&mut self, at: LngLat);
    fn set_popup_content(&mut self, content: PopupContent);
    fn close_popup(&mut self);
    fn has_popup(&self) -> bool;
}

// ============================================================================
// In-memory engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub pitch: f64,
    pub bearing: f64,
}

pub struct MapScene {
    style_url: Option<String>,
    style_loaded: bool,
    sources: BTreeMap<String, (SourceSpec, SourceStatus)>,
    layers: Vec<LayerSpec>,
    bindings: BTreeMap<BindingId, (BindTarget, PointerEventKind)>,
    next_binding: u64,
    popup: Option<(LngLat, PopupContent)>,
    extrusion: bool,
    camera: CameraState,
    last_fit: Option<Bounds>,
    pending: VecDeque<MapNotification>,
    vector_tiles_supported: bool,
    conflicts: usize,
}

impl MapScene {
    pub fn new(vector_tiles_supported: bool) -> Self {
        Self {
            style_url: None,
            style_loaded: false,
            sources: BTreeMap::new(),
            layers: Vec::new(),
            bindings: BTreeMap::new(),
            next_binding: 1,
            popup: None,
            extrusion: false,
            camera: CameraState {
                pitch: 0.0,
                bearing: 0.0,
            },
            last_fit: None,
            pending: VecDeque::new(),
            vector_tiles_supported,
            conflicts: 0,
        }
    }

    /// Marks the requested style as arrived. Like real engines, the arrival is
    /// announced twice: once as a style load and once as generic style data.
    pub fn finish_style_load(&mut self) {
        if self.style_url.is_none() || self.style_loaded {
            return;
        }
        self.style_loaded = true;
        self.pending.push_back(MapNotification::StyleLoad);
        self.pending.push_back(MapNotification::StyleData);
    }

    /// Marks the style loaded without announcing it.
    pub fn finish_style_load_silently(&mut self) {
        self.style_loaded = self.style_url.is_some();
    }

    pub fn take_notifications(&mut self) -> Vec<MapNotification> {
        self.pending.drain(..).collect()
    }

    pub fn source(&self, id: &str) -> Option<&SourceSpec> {
        self.sources.get(id).map(|(spec, _)| spec)
    }

    pub fn source_data(&self, id: &str) -> Option<&geojson::FeatureCollection> {
        match self.source(id) {
            Some(SourceSpec::GeoJson(fc)) => Some(fc),
            _ => None,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn layer(&self, id: &str) -> Option<&LayerSpec> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_bound(&self, target: &BindTarget, kind: PointerEventKind) -> bool {
        self.bindings.values().any(|(t, k)| t == target && *k == kind)
    }

    pub fn popup(&self) -> Option<&(LngLat, PopupContent)> {
        self.popup.as_ref()
    }

    pub fn extrusion(&self) -> bool {
        self.extrusion
    }

    pub fn camera(&self) -> CameraState {
        self.camera
    }

    pub fn last_fit(&self) -> Option<Bounds> {
        self.last_fit
    }

    /// Number of engine calls that would have thrown on a real renderer.
    pub fn conflicts(&self) -> usize {
        self.conflicts
    }

    fn conflict(&mut self, what: &str, id: &str) {
        warn!("map engine rejected {} '{}'", what, id);
        self.conflicts += 1;
    }
}

impl MapSurface for MapScene {
    fn has_source(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    fn add_source(&mut self, id: &str, spec: SourceSpec) {
        if self.sources.contains_key(id) {
            self.conflict("add of existing source", id);
            return;
        }
        let status = match &spec {
            SourceSpec::GeoJson(_) => SourceStatus::Loaded,
            SourceSpec::VectorTiles { .. } if self.vector_tiles_supported => SourceStatus::Loaded,
            SourceSpec::VectorTiles { .. } => SourceStatus::Errored,
        };
        self.sources.insert(id.to_string(), (spec, status));
    }

    fn set_source_data(&mut self, id: &str, data: geojson::FeatureCollection) -> bool {
        match self.sources.get_mut(id) {
            Some((SourceSpec::GeoJson(fc), _)) => {
                *fc = data;
                true
            }
            _ => false,
        }
    }

    fn remove_source(&mut self, id: &str) {
        if self.layers.iter().any(|l| l.source == id) {
            self.conflict("removal of in-use source", id);
            return;
        }
        if self.sources.remove(id).is_none() {
            self.conflict("removal of missing source", id);
        }
    }

    fn source_status(&self, id: &str) -> SourceStatus {
        self.sources
            .get(id)
            .map(|(_, status)| *status)
            .unwrap_or(SourceStatus::Missing)
    }

    fn has_layer(&self, id: &str) -> bool {
        self.layers.iter().any(|l| l.id == id)
    }

    fn add_layer(&mut self, layer: LayerSpec) {
        if self.has_layer(&layer.id) {
            self.conflict("add of existing layer", &layer.id);
            return;
        }
        if !self.sources.contains_key(&layer.source) {
            self.conflict("layer with missing source", &layer.id);
            return;
        }
        self.layers.push(layer);
    }

    fn remove_layer(&mut self, id: &str) {
        let before = self.layers.len();
        self.layers.retain(|l| l.id != id);
        if self.layers.len() == before {
            self.conflict("removal of missing layer", id);
        }
    }

    fn set_style(&mut self, url: &str) {
        self.style_url = Some(url.to_string());
        self.style_loaded = false;
        self.sources.clear();
        self.layers.clear();
        self.extrusion = false;
    }

    fn is_style_loaded(&self) -> bool {
        self.style_loaded
    }

    fn set_building_extrusion(&mut self, enabled: bool) {
        self.extrusion = enabled;
    }

    fn ease_to(&mut self, camera: CameraEase) {
        self.camera = CameraState {
            pitch: camera.pitch,
            bearing: camera.bearing,
        };
    }

    fn fit_bounds(&mut self, bounds: Bounds, _padding: f64) {
        self.last_fit = Some(bounds);
    }

    fn bind(&mut self, target: BindTarget, kind: PointerEventKind) -> BindingId {
        let id = BindingId(self.next_binding);
        self.next_binding += 1;
        self.bindings.insert(id, (target, kind));
        id
    }

    fn unbind(&mut self, id: BindingId) {
        self.bindings.remove(&id);
    }

    fn open_popup(&mut self, at: LngLat, content: PopupContent) {
        self.popup = Some((at, content));
    }

    fn move_popup(&mut self, at: LngLat) {
        if let Some((pos, _)) = self.popup.as_mut() {
            *pos = at;
        }
    }

    fn set_popup_content(&mut self, content: PopupContent) {
        if let Some((_, c)) = self.popup.as_mut() {
            *c = content;
        }
    }

    fn close_popup(&mut self) {
        self.popup = None;
    }

    fn has_popup(&self) -> bool {
        self.popup.is_some()
    }
}
