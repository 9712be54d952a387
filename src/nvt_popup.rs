// Hover preview vs pinned detail popup, kept in step with live vehicle refreshes.

use crate::nvt_models::{RenderableVehicleFeature, VehicleCollection, VehicleProperties};
use crate::nvt_surface::{LngLat, MapSurface};
use crate::nvt_views::{SpeedUnit, vehicle_popup};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupState {
    Idle,
    Hovering,
    Pinned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinState {
    pub pinned: bool,
    pub pinned_vehicle_id: Option<String>,
}

pub struct PopupInteractionController {
    pin: PinState,
    hovering: bool,
    shown: Option<VehicleProperties>,
    unit: SpeedUnit,
}

impl PopupInteractionController {
    pub fn new(unit: SpeedUnit) -> Self {
        Self {
            pin: PinState::default(),
            hovering: false,
            shown: None,
            unit,
        }
    }

    pub fn state(&self) -> PopupState {
        if self.pin.pinned {
            PopupState::Pinned
        } else if self.hovering {
            PopupState::Hovering
        } else {
            PopupState::Idle
        }
    }

    pub fn pin_state(&self) -> &PinState {
        &self.pin
    }

    pub fn unit(&self) -> SpeedUnit {
        self.unit
    }

    fn show(
        &mut self,
        map: &mut dyn MapSurface,
        props: &VehicleProperties,
        at: LngLat,
        now: i64,
    ) {
        let content = vehicle_popup(props, self.unit, now);
        if map.has_popup() {
            map.move_popup(at);
            map.set_popup_content(content);
        } else {
            map.open_popup(at, content);
        }
        self.shown = Some(props.clone());
    }

    /// Pointer entered or moved over a vehicle. Ignored while a popup is pinned.
    pub fn on_vehicle_hover(
        &mut self,
        map: &mut dyn MapSurface,
        vehicle: &VehicleProperties,
        pointer: LngLat,
        now: i64,
    ) {
        if self.pin.pinned {
            return;
        }
        self.hovering = true;
        self.show(map, vehicle, pointer, now);
    }

    pub fn on_vehicle_leave(&mut self, map: &mut dyn MapSurface) {
        if self.pin.pinned {
            return;
        }
        self.hovering = false;
        self.shown = None;
        if map.has_popup() {
            map.close_popup();
        }
    }

    /// Pins `vehicle`, releasing any earlier pin.
    pub fn on_vehicle_click(
        &mut self,
        map: &mut dyn MapSurface,
        vehicle: &RenderableVehicleFeature,
        now: i64,
    ) {
        debug!("pinning vehicle {}", vehicle.id());
        self.pin = PinState {
            pinned: true,
            pinned_vehicle_id: Some(vehicle.id().to_string()),
        };
        self.hovering = false;
        self.show(
            map,
            &vehicle.properties,
            LngLat::new(vehicle.lon, vehicle.lat),
            now,
        );
    }

    /// Map-wide click. Clicks that landed on a vehicle are handled by the layer click.
    pub fn on_map_click(&mut self, map: &mut dyn MapSurface, hit_vehicle: bool) {
        if !hit_vehicle {
            self.release(map);
        }
    }

    pub fn on_escape(&mut self, map: &mut dyn MapSurface) {
        self.release(map);
    }

    /// The user closed the popup through the engine's own close control.
    pub fn on_popup_closed(&mut self, map: &mut dyn MapSurface) {
        self.release(map);
    }

    fn release(&mut self, map: &mut dyn MapSurface) {
        if self.pin.pinned {
            debug!("releasing pinned vehicle {:?}", self.pin.pinned_vehicle_id);
        }
        self.pin = PinState::default();
        self.hovering = false;
        self.shown = None;
        if map.has_popup() {
            map.close_popup();
        }
    }

    /// Follows the pinned vehicle into a fresh collection. A vehicle missing from the
    /// feed keeps its last popup as-is.
    pub fn on_refresh(
        &mut self,
        map: &mut dyn MapSurface,
        vehicles: &VehicleCollection,
        now: i64,
    ) {
        let Some(id) = self.pin.pinned_vehicle_id.clone() else {
            return;
        };
        match vehicles.find(&id) {
            Some(vehicle) => {
                let at = LngLat::new(vehicle.lon, vehicle.lat);
                self.show(map, &vehicle.properties, at, now);
            }
            None => debug!("pinned vehicle {} absent from refresh", id),
        }
    }

    /// Changes the speed unit and re-renders any open popup.
    pub fn set_unit(&mut self, map: &mut dyn MapSurface, unit: SpeedUnit, now: i64) {
        self.unit = unit;
        if let Some(props) = &self.shown {
            if map.has_popup() {
                map.set_popup_content(vehicle_popup(props, unit, now));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvt_surface::MapScene;

    fn vehicle(id: &str, lon: f64, lat: f64) -> RenderableVehicleFeature {
        RenderableVehicleFeature {
            lon,
            lat,
            properties: VehicleProperties {
                id: id.to_string(),
                route_id: "R5".to_string(),
                speed: 10.0,
                heading: 0.0,
                ts: 1000,
                feed: None,
                label: None,
                license_plate: None,
                trip_id: Some("t1".to_string()),
                current_status: None,
                stop_id: None,
                current_stop_sequence: None,
                occupancy_status: None,
                occupancy_percentage: None,
                color: None,
                in_service: true,
            },
        }
    }

    fn collection(vehicles: Vec<RenderableVehicleFeature>) -> VehicleCollection {
        VehicleCollection { features: vehicles }
    }

    fn pinned(map: &mut MapScene) -> PopupInteractionController {
        let mut popup = PopupInteractionController::new(SpeedUnit::Mph);
        popup.on_vehicle_click(map, &vehicle("v1", -76.6, 39.3), 1000);
        popup
    }

    fn assert_released(popup: &PopupInteractionController, map: &MapScene) {
        assert_eq!(popup.state(), PopupState::Idle);
        assert_eq!(popup.pin_state(), &PinState::default());
        assert!(map.popup().is_none());
    }

    #[test]
    fn test_hover_shows_and_leave_removes() {
        let mut map = MapScene::new(true);
        let mut popup = PopupInteractionController::new(SpeedUnit::Mph);
        let v = vehicle("v1", -76.6, 39.3);

        popup.on_vehicle_hover(&mut map, &v.properties, LngLat::new(-76.61, 39.31), 1000);
        assert_eq!(popup.state(), PopupState::Hovering);
        assert_eq!(map.popup().unwrap().0, LngLat::new(-76.61, 39.31));

        let other = vehicle("v2", -76.5, 39.2);
        popup.on_vehicle_hover(&mut map, &other.properties, LngLat::new(-76.5, 39.2), 1000);
        assert_eq!(map.popup().unwrap().0, LngLat::new(-76.5, 39.2));
        assert_eq!(map.popup().unwrap().1.title, "Vehicle v2");

        popup.on_vehicle_leave(&mut map);
        assert_released(&popup, &map);
    }

    #[test]
    fn test_click_pins_and_hover_is_ignored() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        assert_eq!(popup.state(), PopupState::Pinned);
        assert_eq!(popup.pin_state().pinned_vehicle_id.as_deref(), Some("v1"));
        assert_eq!(map.popup().unwrap().0, LngLat::new(-76.6, 39.3));

        let other = vehicle("v2", 0.0, 0.0);
        popup.on_vehicle_hover(&mut map, &other.properties, LngLat::new(0.0, 0.0), 1000);
        popup.on_vehicle_leave(&mut map);
        assert_eq!(map.popup().unwrap().1.title, "Vehicle v1");
    }

    #[test]
    fn test_pinning_another_vehicle_replaces_pin() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        popup.on_vehicle_click(&mut map, &vehicle("v2", 1.0, 2.0), 1000);
        assert_eq!(popup.pin_state().pinned_vehicle_id.as_deref(), Some("v2"));
        assert_eq!(map.popup().unwrap().0, LngLat::new(1.0, 2.0));
    }

    #[test]
    fn test_empty_map_click_unpins() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        popup.on_map_click(&mut map, true);
        assert_eq!(popup.state(), PopupState::Pinned);
        popup.on_map_click(&mut map, false);
        assert_released(&popup, &map);
    }

    #[test]
    fn test_escape_unpins() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        popup.on_escape(&mut map);
        assert_released(&popup, &map);
    }

    #[test]
    fn test_popup_close_unpins() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        map.close_popup();
        popup.on_popup_closed(&mut map);
        assert_released(&popup, &map);
    }

    #[test]
    fn test_refresh_follows_pinned_vehicle() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        let mut moved = vehicle("v1", -76.55, 39.35);
        moved.properties.ts = 1100;
        popup.on_refresh(&mut map, &collection(vec![vehicle("v9", 0.0, 0.0), moved]), 1110);

        let (at, content) = map.popup().unwrap();
        assert_eq!(*at, LngLat::new(-76.55, 39.35));
        assert!(content.lines.contains(&"Updated 10s ago".to_string()));
    }

    #[test]
    fn test_refresh_without_pinned_vehicle_leaves_popup() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        let before = map.popup().cloned();
        popup.on_refresh(&mut map, &collection(vec![vehicle("v2", 5.0, 5.0)]), 2000);
        assert_eq!(map.popup().cloned(), before);
        assert_eq!(popup.state(), PopupState::Pinned);
    }

    #[test]
    fn test_unit_change_rerenders_open_popup() {
        let mut map = MapScene::new(true);
        let mut popup = pinned(&mut map);
        popup.set_unit(&mut map, SpeedUnit::Kmh, 1000);
        assert!(map.popup().unwrap().1.lines.contains(&"36.0 km/h N".to_string()));
    }
}
