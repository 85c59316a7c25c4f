#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Patchmap Geometry Utilities
//!
//! Pure polygon/multipolygon algebra over SRID 4326 (WGS84 degrees) with
//! GeoJSON as the wire format. Every operation here is fail-closed: an
//! internal geometry failure must never grant area that may already belong
//! to a competing claim, so `difference` degrades to EMPTY and `union`
//! degrades to a conservative cover of both inputs.
//!
//! Area is spherical (Chamberlain–Duquette, m^2) converted to km^2, matching
//! the geography-based computation in the database.

use std::panic::{catch_unwind, AssertUnwindSafe};

use geo::{BooleanOps, ChamberlainDuquetteArea};
use geo_types::{MultiPolygon, Polygon};
use geojson::GeoJson;

/// Remaining area at or below this is treated as sold out.
pub const SOLD_OUT_EPSILON_KM2: f64 = 1e-6;

const M2_PER_KM2: f64 = 1_000_000.0;

/// Spherical area of a multipolygon in km^2. Zero for empty input.
pub fn area_km2(geometry: &MultiPolygon<f64>) -> f64 {
    if geometry.0.is_empty() {
        return 0.0;
    }
    geometry.chamberlain_duquette_unsigned_area() / M2_PER_KM2
}

/// True when a geometry is empty or covers no meaningful area.
pub fn is_effectively_empty(geometry: &MultiPolygon<f64>) -> bool {
    geometry.0.is_empty() || area_km2(geometry) <= SOLD_OUT_EPSILON_KM2
}

/// Geometric union of two multipolygons.
///
/// The boolean pipeline can panic on degenerate rings. The fallback is a
/// plain concatenation of both inputs: it may double-count interior area but
/// it always covers everything either input covers, so an availability
/// computation built on it never over-grants.
pub fn union(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    if a.0.is_empty() {
        return b.clone();
    }
    if b.0.is_empty() {
        return a.clone();
    }
    match catch_unwind(AssertUnwindSafe(|| a.union(b))) {
        Ok(merged) => merged,
        Err(_) => {
            tracing::warn!("geometry union failed, falling back to conservative cover");
            let mut polys: Vec<Polygon<f64>> = a.0.clone();
            polys.extend(b.0.iter().cloned());
            MultiPolygon::new(polys)
        }
    }
}

/// Geometric subtraction `a - b`.
///
/// Fail closed: on internal failure the result is EMPTY, never the unclipped
/// `a`, so a geometry error reads as "nothing left to buy".
pub fn difference(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    if a.0.is_empty() {
        return MultiPolygon::new(vec![]);
    }
    if b.0.is_empty() {
        return a.clone();
    }
    match catch_unwind(AssertUnwindSafe(|| a.difference(b))) {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("geometry difference failed, failing closed to empty");
            MultiPolygon::new(vec![])
        }
    }
}

/// Area of `a ∩ b` in km^2.
///
/// Fail closed for disjointness checking: on internal failure the inputs are
/// treated as overlapping by the smaller of their areas.
pub fn intersection_area_km2(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> f64 {
    if a.0.is_empty() || b.0.is_empty() {
        return 0.0;
    }
    match catch_unwind(AssertUnwindSafe(|| a.intersection(b))) {
        Ok(overlap) => area_km2(&overlap),
        Err(_) => {
            tracing::warn!("geometry intersection failed, assuming overlap");
            area_km2(a).min(area_km2(b))
        }
    }
}

/// Normalize arbitrary GeoJSON input into a single MultiPolygon.
///
/// Accepts a Geometry, Feature, or FeatureCollection; any Polygon or
/// MultiPolygon members are unioned into one MultiPolygon. Non-areal members
/// are ignored. Degenerate rings are cleaned best-effort by running each
/// piece through the boolean pipeline; a piece that cannot be cleaned is
/// dropped. Returns None when nothing areal survives.
pub fn normalize(input: &GeoJson) -> Option<MultiPolygon<f64>> {
    let collection = match geojson::quick_collection(input) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable GeoJSON input treated as empty");
            return None;
        }
    };

    let mut result = MultiPolygon::new(vec![]);
    for geometry in collection {
        let piece = match geometry {
            geo_types::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
            geo_types::Geometry::MultiPolygon(mp) => mp,
            _ => continue,
        };
        let Some(cleaned) = clean(&piece) else {
            continue;
        };
        result = union(&result, &cleaned);
    }

    if result.0.is_empty() {
        None
    } else {
        Some(result)
    }
}

/// Parse a GeoJSON string into a normalized MultiPolygon.
pub fn from_geojson_str(raw: &str) -> Option<MultiPolygon<f64>> {
    let parsed: GeoJson = raw.parse().ok()?;
    normalize(&parsed)
}

/// Serialize a MultiPolygon back to a GeoJSON geometry.
pub fn to_geojson(geometry: &MultiPolygon<f64>) -> geojson::Geometry {
    geojson::Geometry::new(geojson::Value::from(geometry))
}

/// Re-node a multipolygon through the boolean pipeline to resolve
/// self-intersections. None when the pipeline rejects it outright.
fn clean(piece: &MultiPolygon<f64>) -> Option<MultiPolygon<f64>> {
    let empty = MultiPolygon::new(vec![]);
    match catch_unwind(AssertUnwindSafe(|| piece.union(&empty))) {
        Ok(cleaned) if !cleaned.0.is_empty() => Some(cleaned),
        Ok(_) => None,
        Err(_) => {
            tracing::warn!("degenerate ring could not be cleaned, dropping piece");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{Coord, LineString};

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        let ring = LineString::new(vec![
            Coord { x: x0, y: y0 },
            Coord { x: x1, y: y0 },
            Coord { x: x1, y: y1 },
            Coord { x: x0, y: y1 },
            Coord { x: x0, y: y0 },
        ]);
        MultiPolygon::new(vec![Polygon::new(ring, vec![])])
    }

    #[test]
    fn test_area_empty_is_zero() {
        assert_eq!(area_km2(&MultiPolygon::new(vec![])), 0.0);
    }

    #[test]
    fn test_area_positive_for_square() {
        // Roughly 1.1 km x 1.1 km near the equator
        let sq = square(0.0, 0.0, 0.01, 0.01);
        let area = area_km2(&sq);
        assert!(area > 1.0 && area < 1.5, "unexpected area {area}");
    }

    #[test]
    fn test_difference_removes_claimed_area() {
        let region = square(0.0, 0.0, 0.02, 0.01);
        let claimed = square(0.0, 0.0, 0.01, 0.01);
        let remaining = difference(&region, &claimed);

        let full = area_km2(&region);
        let left = area_km2(&remaining);
        assert!((left - full / 2.0).abs() < full * 0.01);
    }

    #[test]
    fn test_difference_of_full_claim_is_empty() {
        let region = square(0.0, 0.0, 0.01, 0.01);
        let remaining = difference(&region, &region);
        assert!(is_effectively_empty(&remaining));
    }

    #[test]
    fn test_union_covers_both_inputs() {
        let a = square(0.0, 0.0, 0.01, 0.01);
        let b = square(0.005, 0.0, 0.015, 0.01);
        let merged = union(&a, &b);

        let merged_area = area_km2(&merged);
        assert!(merged_area >= area_km2(&a));
        assert!(merged_area >= area_km2(&b));
        // Overlap must not be double counted by the happy path
        assert!(merged_area < area_km2(&a) + area_km2(&b));
    }

    #[test]
    fn test_union_with_empty_is_identity() {
        let a = square(0.0, 0.0, 0.01, 0.01);
        let empty = MultiPolygon::new(vec![]);
        assert!((area_km2(&union(&a, &empty)) - area_km2(&a)).abs() < 1e-9);
        assert!((area_km2(&union(&empty, &a)) - area_km2(&a)).abs() < 1e-9);
    }

    #[test]
    fn test_intersection_area_of_disjoint_is_zero() {
        let a = square(0.0, 0.0, 0.01, 0.01);
        let b = square(0.02, 0.02, 0.03, 0.03);
        assert!(intersection_area_km2(&a, &b) <= SOLD_OUT_EPSILON_KM2);
    }

    #[test]
    fn test_intersection_area_of_nested_is_inner() {
        let outer = square(0.0, 0.0, 0.02, 0.02);
        let inner = square(0.005, 0.005, 0.015, 0.015);
        let overlap = intersection_area_km2(&outer, &inner);
        assert!((overlap - area_km2(&inner)).abs() < area_km2(&inner) * 0.01);
    }

    #[test]
    fn test_normalize_polygon_geometry() {
        let raw = r#"{"type":"Polygon","coordinates":[[[0,0],[0.01,0],[0.01,0.01],[0,0.01],[0,0]]]}"#;
        let normalized = from_geojson_str(raw).unwrap();
        assert_eq!(normalized.0.len(), 1);
        assert!(area_km2(&normalized) > 1.0);
    }

    #[test]
    fn test_normalize_feature_collection_unions_members() {
        let raw = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[0.01,0],[0.01,0.01],[0,0.01],[0,0]]]}},
            {"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0.02,0],[0.03,0],[0.03,0.01],[0.02,0.01],[0.02,0]]]}}
        ]}"#;
        let normalized = from_geojson_str(raw).unwrap();
        assert_eq!(normalized.0.len(), 2);
    }

    #[test]
    fn test_normalize_rejects_empty_and_invalid() {
        assert!(from_geojson_str("not geojson").is_none());
        assert!(from_geojson_str(r#"{"type":"FeatureCollection","features":[]}"#).is_none());
        // Point input has no areal member
        assert!(from_geojson_str(r#"{"type":"Point","coordinates":[0,0]}"#).is_none());
    }

    #[test]
    fn test_normalize_area_round_trip_is_stable() {
        let raw = r#"{"type":"Polygon","coordinates":[[[0,0],[0.01,0],[0.01,0.01],[0,0.01],[0,0]]]}"#;
        let first = from_geojson_str(raw).unwrap();
        let rendered = to_geojson(&first).to_string();
        let second = from_geojson_str(&rendered).unwrap();
        assert!((area_km2(&first) - area_km2(&second)).abs() < 1e-9);
    }

    #[test]
    fn test_geojson_round_trip_shape() {
        let sq = square(0.0, 0.0, 0.01, 0.01);
        let gj = to_geojson(&sq);
        assert!(matches!(gj.value, geojson::Value::MultiPolygon(_)));
    }
}
