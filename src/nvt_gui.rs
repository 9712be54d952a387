// Desktop live map using egui/eframe. The map surface keeps its engine state in a
// `MapScene` and paints it over a Web Mercator viewport.
use crate::nvt_api::HttpTransitApi;
use crate::nvt_colors::parse_hex_color;
use crate::nvt_config::{FilePreferenceStore, NvtConfig, StyleKey};
use crate::nvt_controllers::{AppEvent, Dispatcher, NVTController, PointerEvent};
use crate::nvt_layers::{VEHICLE_LAYER_ID, VEHICLE_RADIUS, VEHICLE_STROKE_WIDTH, vehicle_fill_color};
use crate::nvt_models::{RenderableVehicleFeature, Result, VehicleProperties};
use crate::nvt_surface::{
    BindTarget, BindingId, Bounds, CameraEase, LayerKind, LayerSpec, LngLat, MapScene,
    MapSurface, PointerEventKind, PopupContent, SourceSpec, SourceStatus,
};
use eframe::egui;
use egui::{Color32, Pos2, Rect, RichText, Sense, Stroke, Ui, Vec2};
use log::debug;
use std::f64::consts::PI;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};

const TILE_SIZE: f64 = 256.0;
const MIN_ZOOM: f64 = 1.0;
const MAX_ZOOM: f64 = 19.0;
const SCROLL_ZOOM_RATE: f64 = 0.002;
const MAX_MERCATOR_LAT: f64 = 85.051_128;

// ============================================================================
// Web Mercator viewport
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub center: LngLat,
    pub zoom: f64,
    pub size: Vec2,
}

/// World pixel coordinates of `p` at `zoom`.
fn world_px(p: LngLat, zoom: f64) -> (f64, f64) {
    let scale = TILE_SIZE * 2f64.powf(zoom);
    let lat = p.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let x = (p.lng + 180.0) / 360.0 * scale;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * scale;
    (x, y)
}

fn from_world_px(x: f64, y: f64, zoom: f64) -> LngLat {
    let scale = TILE_SIZE * 2f64.powf(zoom);
    let lng = x / scale * 360.0 - 180.0;
    let n = PI * (1.0 - 2.0 * y / scale);
    let lat = n.sinh().atan().to_degrees();
    LngLat::new(lng, lat)
}

impl Viewport {
    pub fn project(&self, p: LngLat, rect: Rect) -> Pos2 {
        let (cx, cy) = world_px(self.center, self.zoom);
        let (x, y) = world_px(p, self.zoom);
        rect.center() + Vec2::new((x - cx) as f32, (y - cy) as f32)
    }

    pub fn unproject(&self, pos: Pos2, rect: Rect) -> LngLat {
        let (cx, cy) = world_px(self.center, self.zoom);
        let d = pos - rect.center();
        from_world_px(cx + d.x as f64, cy + d.y as f64, self.zoom)
    }

    pub fn pan(&mut self, delta: Vec2) {
        let (cx, cy) = world_px(self.center, self.zoom);
        self.center = from_world_px(cx - delta.x as f64, cy - delta.y as f64, self.zoom);
    }

    pub fn zoom_by(&mut self, delta: f64) {
        self.zoom = (self.zoom + delta).clamp(MIN_ZOOM, MAX_ZOOM);
    }

    /// Centers on `bounds` at the largest zoom that keeps them inside the padded viewport.
    pub fn fit(&mut self, bounds: Bounds, padding: f64) {
        let (x0, y0) = world_px(LngLat::new(bounds.min_lng, bounds.max_lat), 0.0);
        let (x1, y1) = world_px(LngLat::new(bounds.max_lng, bounds.min_lat), 0.0);
        let (cx, cy) = ((x0 + x1) / 2.0, (y0 + y1) / 2.0);
        self.center = from_world_px(cx, cy, 0.0);

        let w = (self.size.x as f64 - 2.0 * padding).max(1.0);
        let h = (self.size.y as f64 - 2.0 * padding).max(1.0);
        let dx = (x1 - x0).abs();
        let dy = (y1 - y0).abs();
        if dx <= f64::EPSILON && dy <= f64::EPSILON {
            return;
        }
        let zoom = (w / dx.max(f64::EPSILON))
            .min(h / dy.max(f64::EPSILON))
            .log2();
        self.zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
    }
}

// ============================================================================
// Map surface
// ============================================================================

/// Engine state plus the camera the painter draws with. Vector tile sources report
/// `Errored` since this surface has no MVT decoder.
pub struct EguiMap {
    scene: MapScene,
    viewport: Viewport,
}

impl EguiMap {
    pub fn new(center: LngLat, zoom: f64) -> Self {
        Self {
            scene: MapScene::new(false),
            viewport: Viewport {
                center,
                zoom,
                size: Vec2::new(800.0, 600.0),
            },
        }
    }

    pub fn scene(&self) -> &MapScene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut MapScene {
        &mut self.scene
    }
}

impl MapSurface for EguiMap {
    fn has_source(&self, id: &str) -> bool {
        self.scene.has_source(id)
    }

    fn add_source(&mut self, id: &str, spec: SourceSpec) {
        self.scene.add_source(id, spec)
    }

    fn set_source_data(&mut self, id: &str, data: geojson::FeatureCollection) -> bool {
        self.scene.set_source_data(id, data)
    }

    fn remove_source(&mut self, id: &str) {
        self.scene.remove_source(id)
    }

    fn source_status(&self, id: &str) -> SourceStatus {
        self.scene.source_status(id)
    }

    fn has_layer(&self, id: &str) -> bool {
        self.scene.has_layer(id)
    }

    fn add_layer(&mut self, layer: LayerSpec) {
        self.scene.add_layer(layer)
    }

    fn remove_layer(&mut self, id: &str) {
        self.scene.remove_layer(id)
    }

    fn set_style(&mut self, url: &str) {
        self.scene.set_style(url)
    }

    fn is_style_loaded(&self) -> bool {
        self.scene.is_style_loaded()
    }

    fn set_building_extrusion(&mut self, enabled: bool) {
        self.scene.set_building_extrusion(enabled)
    }

    fn ease_to(&mut self, ease: CameraEase) {
        self.scene.ease_to(ease)
    }

    fn fit_bounds(&mut self, bounds: Bounds, padding: f64) {
        self.scene.fit_bounds(bounds, padding);
        self.viewport.fit(bounds, padding);
    }

    fn bind(&mut self, target: BindTarget, kind: PointerEventKind) -> BindingId {
        self.scene.bind(target, kind)
    }

    fn unbind(&mut self, binding: BindingId) {
        self.scene.unbind(binding)
    }

    fn open_popup(&mut self, at: LngLat, content: PopupContent) {
        self.scene.open_popup(at, content)
    }

    fn move_popup(&mut self, at: LngLat) {
        self.scene.move_popup(at)
    }

    fn set_popup_content(&mut self, content: PopupContent) {
        self.scene.set_popup_content(content)
    }

    fn close_popup(&mut self) {
        self.scene.close_popup()
    }

    fn has_popup(&self) -> bool {
        self.scene.has_popup()
    }
}

// ============================================================================
// Application State
// ============================================================================

pub struct NVTApp {
    controller: NVTController,
    map: EguiMap,
    dispatcher: Dispatcher,
    events: Receiver<AppEvent>,
    hovered: Option<String>,
    map_rect: Rect,
}

impl NVTApp {
    pub fn new(cc: &eframe::CreationContext<'_>, config: NvtConfig) -> Result<Self> {
        let (tx, rx) = channel();
        let api = HttpTransitApi::new(&config.api_base, config.request_timeout)?;
        let ctx = cc.egui_ctx.clone();
        let dispatcher =
            Dispatcher::new(Arc::new(api), tx)?.with_repaint(move || ctx.request_repaint());
        dispatcher.start_polling(config.poll_interval);

        let prefs = FilePreferenceStore::open(FilePreferenceStore::default_path());
        let mut map = EguiMap::new(config.initial_center, config.initial_zoom);
        let mut controller = NVTController::new(config, Box::new(prefs));
        dispatcher.dispatch(controller.start(&mut map));

        Ok(Self {
            controller,
            map,
            dispatcher,
            events: rx,
            hovered: None,
            map_rect: Rect::from_min_size(Pos2::ZERO, Vec2::new(800.0, 600.0)),
        })
    }

    fn apply(&mut self, event: AppEvent) {
        let commands = self.controller.handle(&mut self.map, event);
        self.dispatcher.dispatch(commands);
    }

    /// Drains background results and engine notifications.
    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
        if !self.map.is_style_loaded() {
            self.map.scene_mut().finish_style_load();
        }
        for notification in self.map.scene_mut().take_notifications() {
            self.apply(AppEvent::Map(notification));
        }
    }
}

impl eframe::App for NVTApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.pump();

        if ctx.input(|i| i.key_pressed(egui::Key::Escape)) {
            self.apply(AppEvent::EscapePressed);
        }

        let mut pending = Vec::new();

        egui::SidePanel::left("controls")
            .resizable(false)
            .min_width(220.0)
            .show(ctx, |ui| {
                self.show_controls(ui, &mut pending);
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| {
                self.show_map(ui, &mut pending);
            });

        self.show_popup(ctx, &mut pending);

        for event in pending {
            self.apply(event);
        }
    }
}

// ============================================================================
// Panels
// ============================================================================

impl NVTApp {
    fn show_controls(&self, ui: &mut Ui, pending: &mut Vec<AppEvent>) {
        ui.heading("🚌 NVT Live Map");
        ui.separator();

        let current = self.controller.style_key();
        egui::ComboBox::from_label("Basemap")
            .selected_text(current.as_str())
            .show_ui(ui, |ui| {
                for key in self.controller.config().available_styles() {
                    if ui.selectable_label(key == current, key.as_str()).clicked() {
                        pending.push(AppEvent::SelectStyle(key));
                    }
                }
            });

        let selected = self.controller.selected_route().map(str::to_string);
        let selected_text = selected
            .as_deref()
            .and_then(|id| self.controller.routes().iter().find(|r| r.route_id == id))
            .map(|r| r.display_name().to_string())
            .or_else(|| selected.clone())
            .unwrap_or_else(|| "None".to_string());

        egui::ComboBox::from_label("Route")
            .selected_text(selected_text)
            .show_ui(ui, |ui| {
                if ui.selectable_label(selected.is_none(), "None").clicked() {
                    pending.push(AppEvent::SelectRoute(None));
                }
                let mut routes: Vec<_> = self.controller.routes().iter().collect();
                routes.sort_by(|a, b| a.display_name().cmp(b.display_name()));
                for route in routes {
                    let label = match &route.long_name {
                        Some(long) if !long.is_empty() => {
                            format!("{} - {}", route.display_name(), long)
                        }
                        _ => route.display_name().to_string(),
                    };
                    let is_selected = selected.as_deref() == Some(route.route_id.as_str());
                    if ui.selectable_label(is_selected, label).clicked() {
                        pending.push(AppEvent::SelectRoute(Some(route.route_id.clone())));
                    }
                }
            });

        let unit = self.controller.speed_unit();
        if ui
            .button(format!("Speed unit: {}", unit.label()))
            .on_hover_text("Toggle between mph and km/h")
            .clicked()
        {
            pending.push(AppEvent::SetSpeedUnit(unit.toggled()));
        }

        ui.separator();

        let vehicles = self.controller.vehicles();
        let in_service = vehicles
            .features
            .iter()
            .filter(|f| f.properties.in_service)
            .count();
        if vehicles.is_empty() {
            ui.label(RichText::new("No vehicles reported").weak());
        } else {
            ui.label(format!("Vehicles: {}", vehicles.len()));
        }
        ui.label(format!("In service: {}", in_service));
        ui.label(format!("Map: {:?}", self.controller.lifecycle_state()));
        if let Some(id) = self.controller.pinned_vehicle() {
            ui.label(RichText::new(format!("📌 Pinned: {}", id)).strong());
        }
        if self.map.scene().extrusion() {
            ui.label(RichText::new("3D buildings").weak());
        }
    }

    fn show_map(&mut self, ui: &mut Ui, pending: &mut Vec<AppEvent>) {
        let (response, painter) = ui.allocate_painter(ui.available_size(), Sense::click_and_drag());
        let rect = response.rect;
        self.map_rect = rect;
        self.map.viewport.size = rect.size();

        if response.dragged() {
            self.map.viewport.pan(response.drag_delta());
        }
        if response.hovered() {
            let scroll = ui.ctx().input(|i| i.smooth_scroll_delta.y) as f64;
            if scroll != 0.0 {
                self.map.viewport.zoom_by(scroll * SCROLL_ZOOM_RATE);
            }
        }

        let dark = self.controller.style_key() == StyleKey::Dark;
        painter.rect_filled(rect, 0.0, background(dark));
        paint_graticule(&painter, &self.map.viewport, rect, dark);

        let scene = self.map.scene();
        for layer in scene.layers() {
            match layer.kind {
                LayerKind::Line => paint_lines(&painter, scene, layer, &self.map.viewport, rect),
                LayerKind::Circle => {}
            }
        }
        let vehicles = vehicle_features(scene);
        for vehicle in &vehicles {
            let pos = self.map.viewport.project(LngLat::new(vehicle.lon, vehicle.lat), rect);
            painter.circle(
                pos,
                VEHICLE_RADIUS as f32,
                color32(vehicle_fill_color(&vehicle.properties)),
                Stroke::new(VEHICLE_STROKE_WIDTH as f32, Color32::BLACK),
            );
        }

        let pointer = response.hover_pos();
        let hit = pointer.and_then(|pos| hit_test(&vehicles, &self.map.viewport, rect, pos));
        let layer = BindTarget::Layer(VEHICLE_LAYER_ID.to_string());

        if let Some(pos) = pointer {
            let at = self.map.viewport.unproject(pos, rect);
            let kind = match (&self.hovered, &hit) {
                (None, Some(_)) => Some(PointerEventKind::Enter),
                (Some(_), Some(_)) => Some(PointerEventKind::Move),
                (Some(_), None) => Some(PointerEventKind::Leave),
                (None, None) => None,
            };
            if let Some(kind) = kind {
                if scene.is_bound(&layer, kind) {
                    pending.push(AppEvent::Pointer(PointerEvent {
                        target: layer.clone(),
                        kind,
                        at,
                        hit: hit.clone(),
                    }));
                }
            }

            if response.clicked() {
                if hit.is_some() && scene.is_bound(&layer, PointerEventKind::Click) {
                    pending.push(AppEvent::Pointer(PointerEvent {
                        target: layer.clone(),
                        kind: PointerEventKind::Click,
                        at,
                        hit: hit.clone(),
                    }));
                }
                if scene.is_bound(&BindTarget::Map, PointerEventKind::Click) {
                    pending.push(AppEvent::Pointer(PointerEvent {
                        target: BindTarget::Map,
                        kind: PointerEventKind::Click,
                        at,
                        hit: hit.clone(),
                    }));
                }
            }
        } else if self.hovered.is_some() && scene.is_bound(&layer, PointerEventKind::Leave) {
            pending.push(AppEvent::Pointer(PointerEvent {
                target: layer,
                kind: PointerEventKind::Leave,
                at: self.map.viewport.center,
                hit: None,
            }));
        }

        self.hovered = hit.map(|v| v.id().to_string());
    }

    fn show_popup(&mut self, ctx: &egui::Context, pending: &mut Vec<AppEvent>) {
        let Some((at, content)) = self.map.scene().popup().cloned() else {
            return;
        };
        let anchor = self.map.viewport.project(at, self.map_rect);
        let mut closed = false;

        egui::Area::new(egui::Id::new("vehicle_popup"))
            .fixed_pos(anchor + Vec2::new(12.0, -12.0))
            .order(egui::Order::Foreground)
            .show(ctx, |ui| {
                egui::Frame::popup(ui.style()).show(ui, |ui| {
                    ui.horizontal(|ui| {
                        ui.label(RichText::new(&content.title).strong());
                        if ui.small_button("✖").clicked() {
                            closed = true;
                        }
                    });
                    for line in &content.lines {
                        ui.label(line);
                    }
                });
            });

        if closed {
            self.map.close_popup();
            pending.push(AppEvent::PopupClosed);
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn color32(hex: &str) -> Color32 {
    match parse_hex_color(hex) {
        Some((r, g, b)) => Color32::from_rgb(r, g, b),
        None => Color32::from_rgb(100, 100, 100),
    }
}

fn background(dark: bool) -> Color32 {
    if dark {
        Color32::from_rgb(30, 32, 38)
    } else {
        Color32::from_rgb(236, 234, 228)
    }
}

fn paint_graticule(painter: &egui::Painter, viewport: &Viewport, rect: Rect, dark: bool) {
    let step = match viewport.zoom {
        z if z >= 12.0 => 0.01,
        z if z >= 9.0 => 0.1,
        z if z >= 6.0 => 1.0,
        _ => 10.0,
    };
    let color = if dark {
        Color32::from_rgb(48, 50, 58)
    } else {
        Color32::from_rgb(220, 218, 210)
    };
    let stroke = Stroke::new(1.0, color);
    let top_left = viewport.unproject(rect.left_top(), rect);
    let bottom_right = viewport.unproject(rect.right_bottom(), rect);

    let mut lng = (top_left.lng / step).floor() * step;
    while lng <= bottom_right.lng {
        let x = viewport.project(LngLat::new(lng, top_left.lat), rect).x;
        painter.line_segment([Pos2::new(x, rect.top()), Pos2::new(x, rect.bottom())], stroke);
        lng += step;
    }
    let mut lat = (bottom_right.lat / step).floor() * step;
    while lat <= top_left.lat {
        let y = viewport.project(LngLat::new(top_left.lng, lat), rect).y;
        painter.line_segment([Pos2::new(rect.left(), y), Pos2::new(rect.right(), y)], stroke);
        lat += step;
    }
}

fn line_positions(value: &geojson::Value) -> Vec<&Vec<Vec<f64>>> {
    match value {
        geojson::Value::LineString(line) => vec![line],
        geojson::Value::MultiLineString(lines) => lines.iter().collect(),
        geojson::Value::GeometryCollection(geometries) => geometries
            .iter()
            .flat_map(|g| line_positions(&g.value))
            .collect(),
        _ => Vec::new(),
    }
}

fn paint_lines(
    painter: &egui::Painter,
    scene: &MapScene,
    layer: &LayerSpec,
    viewport: &Viewport,
    rect: Rect,
) {
    let Some(data) = scene.source_data(&layer.source) else {
        return;
    };
    let width = layer
        .paint
        .get("line-width")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(2.0) as f32;
    let opacity = layer
        .paint
        .get("line-opacity")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(1.0);
    let base = color32(
        layer
            .paint
            .get("line-color")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default(),
    );
    let color = Color32::from_rgba_unmultiplied(
        base.r(),
        base.g(),
        base.b(),
        (opacity.clamp(0.0, 1.0) * 255.0) as u8,
    );

    for feature in &data.features {
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        for line in line_positions(&geometry.value) {
            let points: Vec<Pos2> = line
                .iter()
                .filter(|p| p.len() >= 2)
                .map(|p| viewport.project(LngLat::new(p[0], p[1]), rect))
                .collect();
            if points.len() >= 2 {
                painter.add(egui::Shape::line(points, Stroke::new(width, color)));
            }
        }
    }
}

/// Vehicles as the engine currently holds them in the vehicle source.
fn vehicle_features(scene: &MapScene) -> Vec<RenderableVehicleFeature> {
    let Some(layer) = scene.layer(VEHICLE_LAYER_ID) else {
        return Vec::new();
    };
    let Some(data) = scene.source_data(&layer.source) else {
        return Vec::new();
    };
    data.features
        .iter()
        .filter_map(|feature| {
            let point = match &feature.geometry.as_ref()?.value {
                geojson::Value::Point(p) if p.len() >= 2 => (p[0], p[1]),
                _ => return None,
            };
            let properties = serde_json::Value::Object(feature.properties.clone()?);
            match serde_json::from_value::<VehicleProperties>(properties) {
                Ok(properties) => Some(RenderableVehicleFeature {
                    lon: point.0,
                    lat: point.1,
                    properties,
                }),
                Err(e) => {
                    debug!("unreadable vehicle feature: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Topmost vehicle whose marker covers `pos`.
fn hit_test(
    vehicles: &[RenderableVehicleFeature],
    viewport: &Viewport,
    rect: Rect,
    pos: Pos2,
) -> Option<RenderableVehicleFeature> {
    let reach = (VEHICLE_RADIUS + VEHICLE_STROKE_WIDTH) as f32;
    vehicles
        .iter()
        .rev()
        .find(|v| viewport.project(LngLat::new(v.lon, v.lat), rect).distance(pos) <= reach)
        .cloned()
}

// ============================================================================
// Public entry point
// ============================================================================

pub fn run_gui(config: NvtConfig) -> std::result::Result<(), eframe::Error> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 800.0])
            .with_min_inner_size([800.0, 600.0]),
        ..Default::default()
    };

    eframe::run_native(
        "NVT Live Map",
        options,
        Box::new(|cc| Ok(Box::new(NVTApp::new(cc, config)?))),
    )
}
