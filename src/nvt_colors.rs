// Route color resolution: server colors from the routes table, unprefixed id matching,
// and a deterministic hashed palette for routes the server knows nothing about.

use crate::nvt_models::RouteRow;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::HashMap;

/// Used for routes whose server color is missing or malformed.
pub const DEFAULT_ROUTE_COLOR: &str = "#3B82F6";
/// Fill for vehicles without an active trip.
pub const NOT_IN_SERVICE_GRAY: &str = "#9CA3AF";
/// Replacement for route colors too close to `NOT_IN_SERVICE_GRAY`.
pub const NEAR_GRAY_REMAP: &str = "#64748B";
/// Fill for in-service vehicles whose route resolved to no color.
pub const IN_SERVICE_FALLBACK_GREEN: &str = "#22C55E";

/// Euclidean RGB distance under which a color reads as the out-of-service gray.
const GRAY_COLLISION_DISTANCE: f64 = 32.0;

const ROUTE_PALETTE: [&str; 12] = [
    "#E6194B", "#3CB44B", "#FFE119", "#4363D8", "#F58231", "#911EB4", "#46F0F0", "#F032E6",
    "#BCF60C", "#FABEBE", "#008080", "#E6BEFF",
];

lazy_static! {
    static ref HEX_COLOR: Regex = Regex::new(r"^[0-9A-Fa-f]{6}$").unwrap();
}

// ============================================================================
// Color normalization
// ============================================================================

pub fn parse_hex_color(hex: &str) -> Option<(u8, u8, u8)> {
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if !HEX_COLOR.is_match(hex) {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

fn color_distance(a: (u8, u8, u8), b: (u8, u8, u8)) -> f64 {
    let dr = a.0 as f64 - b.0 as f64;
    let dg = a.1 as f64 - b.1 as f64;
    let db = a.2 as f64 - b.2 as f64;
    (dr * dr + dg * dg + db * db).sqrt()
}

/// Normalizes a server color into `#RRGGBB`.
///
/// Accepts the value with or without a leading `#`. Anything that is not exactly six
/// hex digits becomes [`DEFAULT_ROUTE_COLOR`]. Colors a rider could mistake for the
/// out-of-service gray are moved to [`NEAR_GRAY_REMAP`].
pub fn normalize_color(raw: Option<&str>) -> String {
    let Some(rgb) = raw.and_then(parse_hex_color) else {
        return DEFAULT_ROUTE_COLOR.to_string();
    };

    let gray = parse_hex_color(NOT_IN_SERVICE_GRAY).unwrap_or((156, 163, 175));
    if color_distance(rgb, gray) < GRAY_COLLISION_DISTANCE {
        return NEAR_GRAY_REMAP.to_string();
    }

    format!("#{:02X}{:02X}{:02X}", rgb.0, rgb.1, rgb.2)
}

/// The part of a route id after its first `:`, or the whole id.
pub fn unprefixed(route_id: &str) -> &str {
    route_id
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(route_id)
}

// ============================================================================
// Fallback coloring
// ============================================================================

/// Color source for routes missing from the index.
pub trait FallbackColor: Send {
    fn color_for(&self, route_id: &str) -> String;
}

/// Polynomial string hash, base 31, wrapping in 32 bits over UTF-16 code units.
pub fn route_hash(route_id: &str) -> u32 {
    route_id
        .encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as u32))
}

pub struct HashedPalette {
    palette: Vec<String>,
}

impl HashedPalette {
    pub fn new(palette: Vec<String>) -> Self {
        Self { palette }
    }
}

impl Default for HashedPalette {
    fn default() -> Self {
        Self::new(ROUTE_PALETTE.iter().map(|c| c.to_string()).collect())
    }
}

impl FallbackColor for HashedPalette {
    fn color_for(&self, route_id: &str) -> String {
        if self.palette.is_empty() {
            return DEFAULT_ROUTE_COLOR.to_string();
        }
        let idx = route_hash(route_id) as usize % self.palette.len();
        self.palette[idx].clone()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Owns the route color index. Rebuilt wholesale from every routes response.
pub struct RouteColorResolver {
    index: HashMap<String, String>,
    fallback: Box<dyn FallbackColor>,
}

impl Default for RouteColorResolver {
    fn default() -> Self {
        Self::new(Box::new(HashedPalette::default()))
    }
}

impl RouteColorResolver {
    pub fn new(fallback: Box<dyn FallbackColor>) -> Self {
        Self {
            index: HashMap::new(),
            fallback,
        }
    }

    /// Replaces the index with colors from `rows`. Raw ids take precedence over
    /// unprefixed aliases; among aliases the first row wins.
    pub fn rebuild(&mut self, rows: &[RouteRow]) {
        let mut index = HashMap::with_capacity(rows.len() * 2);

        for row in rows.iter().filter(|r| !r.route_id.is_empty()) {
            index.insert(row.route_id.clone(), normalize_color(row.color.as_deref()));
        }

        for row in rows.iter().filter(|r| !r.route_id.is_empty()) {
            let short = unprefixed(&row.route_id);
            if short != row.route_id && !short.is_empty() {
                index
                    .entry(short.to_string())
                    .or_insert_with(|| normalize_color(row.color.as_deref()));
            }
        }

        debug!("route color index rebuilt: {} rows, {} keys", rows.len(), index.len());
        self.index = index;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn resolve_color(&self, route_id: &str) -> Option<String> {
        if let Some(color) = self.index.get(route_id) {
            return Some(color.clone());
        }
        if let Some(color) = self.index.get(unprefixed(route_id)) {
            return Some(color.clone());
        }
        if route_id.is_empty() || route_id.eq_ignore_ascii_case("unknown") {
            return None;
        }
        Some(self.fallback.color_for(route_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(route_id: &str, color: &str) -> RouteRow {
        RouteRow {
            route_id: route_id.to_string(),
            color: Some(color.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_accepts_hash_and_bare() {
        assert_eq!(normalize_color(Some("#2563eb")), "#2563EB");
        assert_eq!(normalize_color(Some("2563EB")), "#2563EB");
    }

    #[test]
    fn test_normalize_invalid_is_default_blue() {
        assert_eq!(normalize_color(None), DEFAULT_ROUTE_COLOR);
        assert_eq!(normalize_color(Some("")), DEFAULT_ROUTE_COLOR);
        assert_eq!(normalize_color(Some("#12345")), DEFAULT_ROUTE_COLOR);
        assert_eq!(normalize_color(Some("GGGGGG")), DEFAULT_ROUTE_COLOR);
    }

    #[test]
    fn test_normalize_takes_one_hash_and_no_padding() {
        assert_eq!(normalize_color(Some("##2563EB")), DEFAULT_ROUTE_COLOR);
        assert_eq!(normalize_color(Some(" #2563EB")), DEFAULT_ROUTE_COLOR);
        assert_eq!(normalize_color(Some("2563EB ")), DEFAULT_ROUTE_COLOR);
        assert_eq!(parse_hex_color("##2563EB"), None);
        assert_eq!(parse_hex_color("#2563EB"), Some((0x25, 0x63, 0xEB)));
    }

    #[test]
    fn test_normalize_remaps_gray_collisions() {
        assert_eq!(normalize_color(Some(NOT_IN_SERVICE_GRAY)), NEAR_GRAY_REMAP);
        assert_eq!(normalize_color(Some("A0A6B0")), NEAR_GRAY_REMAP);
        assert_eq!(normalize_color(Some("000000")), "#000000");
    }

    #[test]
    fn test_unprefixed() {
        assert_eq!(unprefixed("agency:R1"), "R1");
        assert_eq!(unprefixed("a:b:c"), "b:c");
        assert_eq!(unprefixed("R1"), "R1");
    }

    #[test]
    fn test_route_hash_matches_java_style_hash() {
        assert_eq!(route_hash(""), 0);
        assert_eq!(route_hash("a"), 97);
        assert_eq!(route_hash("ab"), 97 * 31 + 98);
        // wraps instead of overflowing
        let long = "x".repeat(64);
        let _ = route_hash(&long);
    }

    #[test]
    fn test_resolve_prefixed_and_unprefixed_agree() {
        let mut resolver = RouteColorResolver::default();
        resolver.rebuild(&[row("agency:R1", "FF0000")]);
        assert_eq!(resolver.resolve_color("R1"), Some("#FF0000".to_string()));
        assert_eq!(resolver.resolve_color("agency:R1"), Some("#FF0000".to_string()));
        assert_eq!(resolver.resolve_color("other:R1"), Some("#FF0000".to_string()));
    }

    #[test]
    fn test_raw_id_beats_alias() {
        let mut resolver = RouteColorResolver::default();
        resolver.rebuild(&[row("agency:R1", "FF0000"), row("R1", "00FF00")]);
        assert_eq!(resolver.resolve_color("R1"), Some("#00FF00".to_string()));
    }

    #[test]
    fn test_unknown_and_empty_resolve_to_none() {
        let resolver = RouteColorResolver::default();
        assert_eq!(resolver.resolve_color(""), None);
        assert_eq!(resolver.resolve_color("UNKNOWN"), None);
        assert_eq!(resolver.resolve_color("unknown"), None);
    }

    #[test]
    fn test_hashed_fallback_is_deterministic() {
        let resolver = RouteColorResolver::default();
        let first = resolver.resolve_color("R42");
        assert!(first.is_some());
        for _ in 0..5 {
            assert_eq!(resolver.resolve_color("R42"), first);
        }
        let expected = ROUTE_PALETTE[route_hash("R42") as usize % ROUTE_PALETTE.len()];
        assert_eq!(first.as_deref(), Some(expected));
    }

    #[test]
    fn test_rebuild_discards_stale_entries() {
        let mut resolver = RouteColorResolver::default();
        resolver.rebuild(&[row("R1", "FF0000")]);
        resolver.rebuild(&[row("R2", "00FF00")]);
        assert_eq!(resolver.len(), 1);
        assert_ne!(resolver.resolve_color("R1"), Some("#FF0000".to_string()));
    }

    #[test]
    fn test_custom_fallback_is_swappable() {
        struct Always;
        impl FallbackColor for Always {
            fn color_for(&self, _route_id: &str) -> String {
                "#123456".to_string()
            }
        }
        let resolver = RouteColorResolver::new(Box::new(Always));
        assert_eq!(resolver.resolve_color("anything"), Some("#123456".to_string()));
    }
}
