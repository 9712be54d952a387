// Wiring for the live map: the controller turns events into map mutations plus
// follow-up commands, and the dispatcher runs those commands off the UI thread.

use crate::nvt_api::TransitApi;
use crate::nvt_colors::RouteColorResolver;
use crate::nvt_config::{NvtConfig, PreferenceStore, StyleKey};
use crate::nvt_features::build_collection;
use crate::nvt_layers::{LifecycleState, MapLayerLifecycle, StyleRequest, VEHICLE_LAYER_ID};
use crate::nvt_models::{
    NVTError, RenderableVehicleFeature, Result, RouteRow, VehicleCollection, VehicleRecord,
    unix_now,
};
use crate::nvt_overlay::{OverlayRequest, RouteOverlayLoader};
use crate::nvt_popup::{PopupInteractionController, PopupState};
use crate::nvt_surface::{
    BindTarget, Bounds, LngLat, MapNotification, MapSurface, PointerEventKind,
};
use crate::nvt_views::{SPEED_UNIT_KEY, SpeedUnit};
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_stream::wrappers::IntervalStream;

// ============================================================================
// Events and commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Routes,
    Vehicles,
    RouteBbox,
    RouteStreets,
}

/// A pointer event the map surface delivered through one of its bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerEvent {
    pub target: BindTarget,
    pub kind: PointerEventKind,
    pub at: LngLat,
    /// Topmost vehicle under the pointer, if any.
    pub hit: Option<RenderableVehicleFeature>,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    Tick,
    RoutesLoaded { seq: u64, rows: Vec<RouteRow> },
    VehiclesLoaded { seq: u64, records: Vec<VehicleRecord> },
    FetchFailed { what: FetchKind, error: String },
    Map(MapNotification),
    StyleFallback { request: u64 },
    RouteBbox { generation: u64, bbox: Bounds },
    RouteStreets { generation: u64, collection: geojson::FeatureCollection },
    OverlayFallback { generation: u64 },
    Pointer(PointerEvent),
    EscapePressed,
    PopupClosed,
    SelectRoute(Option<String>),
    SelectStyle(StyleKey),
    SetSpeedUnit(SpeedUnit),
}

#[derive(Debug, Clone)]
pub enum Command {
    FetchRoutes { seq: u64 },
    FetchVehicles { seq: u64 },
    FetchRouteBbox { route_id: String, generation: u64 },
    FetchRouteStreets { route_id: String, generation: u64 },
    Schedule { after: Duration, event: AppEvent },
}

fn style_fallback(request: StyleRequest) -> Command {
    Command::Schedule {
        after: request.fallback_after,
        event: AppEvent::StyleFallback {
            request: request.request,
        },
    }
}

fn overlay_commands(requests: Vec<OverlayRequest>) -> Vec<Command> {
    requests
        .into_iter()
        .map(|request| match request {
            OverlayRequest::Bbox {
                route_id,
                generation,
            } => Command::FetchRouteBbox {
                route_id,
                generation,
            },
            OverlayRequest::Streets {
                route_id,
                generation,
            } => Command::FetchRouteStreets {
                route_id,
                generation,
            },
            OverlayRequest::FallbackCheck { generation, after } => Command::Schedule {
                after,
                event: AppEvent::OverlayFallback { generation },
            },
        })
        .collect()
}

// ============================================================================
// Controller
// ============================================================================

/// Owns every piece of map state. Only the UI thread calls into it.
pub struct NVTController {
    config: NvtConfig,
    lifecycle: MapLayerLifecycle,
    resolver: RouteColorResolver,
    overlay: RouteOverlayLoader,
    popup: PopupInteractionController,
    prefs: Box<dyn PreferenceStore>,
    next_seq: u64,
    routes_seq: u64,
    vehicles_seq: u64,
    routes: Vec<RouteRow>,
    records: Vec<VehicleRecord>,
    vehicles: VehicleCollection,
    clock: fn() -> i64,
}

impl NVTController {
    pub fn new(config: NvtConfig, prefs: Box<dyn PreferenceStore>) -> Self {
        let unit = prefs
            .get(SPEED_UNIT_KEY)
            .and_then(|v| SpeedUnit::parse(&v))
            .unwrap_or_default();
        Self {
            lifecycle: MapLayerLifecycle::new(config.initial_style, config.style_fallback_delay),
            resolver: RouteColorResolver::default(),
            overlay: RouteOverlayLoader::new(&config.api_base, config.overlay_fallback_delay),
            popup: PopupInteractionController::new(unit),
            prefs,
            next_seq: 0,
            routes_seq: 0,
            vehicles_seq: 0,
            routes: Vec::new(),
            records: Vec::new(),
            vehicles: VehicleCollection::default(),
            clock: unix_now,
            config,
        }
    }

    /// Replaces the wall clock used for timestamps and "ago" labels.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &NvtConfig {
        &self.config
    }

    pub fn routes(&self) -> &[RouteRow] {
        &self.routes
    }

    pub fn vehicles(&self) -> &VehicleCollection {
        &self.vehicles
    }

    pub fn selected_route(&self) -> Option<&str> {
        self.overlay.selected_route()
    }

    pub fn style_key(&self) -> StyleKey {
        self.lifecycle.style().key
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn popup_state(&self) -> PopupState {
        self.popup.state()
    }

    pub fn pinned_vehicle(&self) -> Option<&str> {
        self.popup.pin_state().pinned_vehicle_id.as_deref()
    }

    pub fn speed_unit(&self) -> SpeedUnit {
        self.popup.unit()
    }

    fn stamp(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Loads the initial style and issues the first data fetches.
    pub fn start(&mut self, map: &mut dyn MapSurface) -> Vec<Command> {
        let url = self.config.style_url(self.config.initial_style);
        let request = self.lifecycle.attach(map, &url);
        let routes = self.stamp();
        let vehicles = self.stamp();
        vec![
            style_fallback(request),
            Command::FetchRoutes { seq: routes },
            Command::FetchVehicles { seq: vehicles },
        ]
    }

    pub fn handle(&mut self, map: &mut dyn MapSurface, event: AppEvent) -> Vec<Command> {
        match event {
            AppEvent::Tick => {
                let seq = self.stamp();
                vec![Command::FetchVehicles { seq }]
            }
            AppEvent::RoutesLoaded { seq, rows } => {
                if seq <= self.routes_seq {
                    debug!("discarding stale routes response {} (have {})", seq, self.routes_seq);
                    return Vec::new();
                }
                self.routes_seq = seq;
                self.resolver.rebuild(&rows);
                info!("loaded {} routes ({} color keys)", rows.len(), self.resolver.len());
                self.routes = rows;
                self.render(map);
                Vec::new()
            }
            AppEvent::VehiclesLoaded { seq, records } => {
                if seq <= self.vehicles_seq {
                    debug!(
                        "discarding stale vehicles response {} (have {})",
                        seq, self.vehicles_seq
                    );
                    return Vec::new();
                }
                self.vehicles_seq = seq;
                self.records = records;
                self.render(map);
                Vec::new()
            }
            AppEvent::FetchFailed { what, error } => {
                warn!("{:?} fetch failed, keeping last state: {}", what, error);
                Vec::new()
            }
            AppEvent::Map(notification) => {
                if self.lifecycle.on_notification(map, notification) {
                    self.on_style_ready(map)
                } else {
                    Vec::new()
                }
            }
            AppEvent::StyleFallback { request } => {
                if self.lifecycle.on_style_fallback(map, request) {
                    self.on_style_ready(map)
                } else {
                    Vec::new()
                }
            }
            AppEvent::RouteBbox { generation, bbox } => {
                self.overlay.on_bbox(map, generation, bbox);
                Vec::new()
            }
            AppEvent::RouteStreets {
                generation,
                collection,
            } => {
                self.overlay
                    .on_streets(self.lifecycle.registry_mut(), map, generation, collection);
                Vec::new()
            }
            AppEvent::OverlayFallback { generation } => self
                .overlay
                .on_fallback_check(self.lifecycle.registry_mut(), map, generation)
                .map(|request| overlay_commands(vec![request]))
                .unwrap_or_default(),
            AppEvent::Pointer(pointer) => {
                self.on_pointer(map, pointer);
                Vec::new()
            }
            AppEvent::EscapePressed => {
                self.popup.on_escape(map);
                Vec::new()
            }
            AppEvent::PopupClosed => {
                self.popup.on_popup_closed(map);
                Vec::new()
            }
            AppEvent::SelectRoute(Some(route_id)) => {
                let color = self.resolver.resolve_color(&route_id);
                if self.lifecycle.is_ready() {
                    overlay_commands(self.overlay.select_route(
                        self.lifecycle.registry_mut(),
                        map,
                        &route_id,
                        color,
                    ))
                } else {
                    debug!("map not ready, route {} drawn once style loads", route_id);
                    self.overlay.remember(&route_id, color);
                    Vec::new()
                }
            }
            AppEvent::SelectRoute(None) => {
                self.overlay.clear_route(self.lifecycle.registry_mut(), map);
                Vec::new()
            }
            AppEvent::SelectStyle(key) => {
                let url = self.config.style_url(key);
                self.lifecycle
                    .change_style(map, key, &url)
                    .map(|request| vec![style_fallback(request)])
                    .unwrap_or_default()
            }
            AppEvent::SetSpeedUnit(unit) => {
                if let Err(e) = self.prefs.set(SPEED_UNIT_KEY, unit.as_str()) {
                    warn!("could not persist speed unit: {}", e);
                }
                self.popup.set_unit(map, unit, (self.clock)());
                Vec::new()
            }
        }
    }

    fn render(&mut self, map: &mut dyn MapSurface) {
        let now = (self.clock)();
        self.vehicles = build_collection(&self.records, &self.resolver, now);
        self.lifecycle.refresh(map, self.vehicles.to_geojson());
        self.popup.on_refresh(map, &self.vehicles, now);
    }

    fn on_style_ready(&mut self, map: &mut dyn MapSurface) -> Vec<Command> {
        overlay_commands(self.overlay.reload(self.lifecycle.registry_mut(), map))
    }

    fn on_pointer(&mut self, map: &mut dyn MapSurface, pointer: PointerEvent) {
        let now = (self.clock)();
        match (&pointer.target, pointer.kind) {
            (BindTarget::Map, PointerEventKind::Click) => {
                self.popup.on_map_click(map, pointer.hit.is_some());
            }
            (BindTarget::Layer(layer), kind) if layer == VEHICLE_LAYER_ID => match kind {
                PointerEventKind::Enter | PointerEventKind::Move => {
                    if let Some(vehicle) = &pointer.hit {
                        self.popup
                            .on_vehicle_hover(map, &vehicle.properties, pointer.at, now);
                    }
                }
                PointerEventKind::Leave => self.popup.on_vehicle_leave(map),
                PointerEventKind::Click => {
                    if let Some(vehicle) = &pointer.hit {
                        self.popup.on_vehicle_click(map, vehicle, now);
                    }
                }
            },
            (target, kind) => debug!("unhandled pointer {:?} on {:?}", kind, target),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Runs commands on a tokio runtime and posts the resulting events back to the UI thread.
pub struct Dispatcher {
    runtime: Runtime,
    api: Arc<dyn TransitApi>,
    events: Sender<AppEvent>,
    repaint: Arc<dyn Fn() + Send + Sync>,
}

fn post(events: &Sender<AppEvent>, repaint: &Arc<dyn Fn() + Send + Sync>, event: AppEvent) {
    if events.send(event).is_err() {
        debug!("event receiver gone, dropping event");
        return;
    }
    repaint();
}

impl Dispatcher {
    pub fn new(api: Arc<dyn TransitApi>, events: Sender<AppEvent>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| NVTError::RuntimeError(format!("Failed to start async runtime: {}", e)))?;
        Ok(Self {
            runtime,
            api,
            events,
            repaint: Arc::new(|| {}),
        })
    }

    /// Called after every posted event, e.g. to wake an idle UI.
    pub fn with_repaint<F>(mut self, repaint: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.repaint = Arc::new(repaint);
        self
    }

    /// Posts `Tick` every `every`, starting one interval from now.
    pub fn start_polling(&self, every: Duration) {
        let events = self.events.clone();
        let repaint = self.repaint.clone();
        self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticks = IntervalStream::new(tokio::time::interval_at(start, every));
            while ticks.next().await.is_some() {
                if events.send(AppEvent::Tick).is_err() {
                    debug!("event receiver gone, stopping poll");
                    break;
                }
                repaint();
            }
        });
    }

    pub fn dispatch(&self, commands: Vec<Command>) {
        for command in commands {
            self.dispatch_one(command);
        }
    }

    fn dispatch_one(&self, command: Command) {
        let api = self.api.clone();
        let events = self.events.clone();
        let repaint = self.repaint.clone();

        self.runtime.spawn(async move {
            let event = match command {
                Command::FetchRoutes { seq } => match api.routes().await {
                    Ok(rows) => AppEvent::RoutesLoaded { seq, rows },
                    Err(e) => failed(FetchKind::Routes, e),
                },
                Command::FetchVehicles { seq } => match api.vehicles().await {
                    Ok(records) => AppEvent::VehiclesLoaded { seq, records },
                    Err(e) => failed(FetchKind::Vehicles, e),
                },
                Command::FetchRouteBbox {
                    route_id,
                    generation,
                } => match api.route_bbox(route_id).await {
                    Ok(bbox) => AppEvent::RouteBbox { generation, bbox },
                    Err(e) => failed(FetchKind::RouteBbox, e),
                },
                Command::FetchRouteStreets {
                    route_id,
                    generation,
                } => match api.route_streets(route_id).await {
                    Ok(collection) => AppEvent::RouteStreets {
                        generation,
                        collection,
                    },
                    Err(e) => failed(FetchKind::RouteStreets, e),
                },
                Command::Schedule { after, event } => {
                    tokio::time::sleep(after).await;
                    event
                }
            };
            post(&events, &repaint, event);
        });
    }
}

fn failed(what: FetchKind, error: NVTError) -> AppEvent {
    AppEvent::FetchFailed {
        what,
        error: error.to_string(),
    }
}
