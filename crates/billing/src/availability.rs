//! Availability resolver
//!
//! The single authoritative computation for "what can still be bought" in a
//! region for a given category and slot. Every pricing and checkout decision
//! calls through here rather than re-deriving availability locally, so the
//! preview a buyer saw and the purchase the reconciler validates can never
//! diverge in logic.
//!
//! The heavy lifting (union of live competitor claims, difference against
//! the region boundary, geography-based area) runs server-side in the
//! `remaining_region_geometry` SQL function; this service parses the result
//! and applies the fail-closed defaults.

use geo_types::MultiPolygon;
use sqlx::PgPool;
use uuid::Uuid;

use patchmap_geo::SOLD_OUT_EPSILON_KM2;

use crate::error::{BillingError, BillingResult};

/// Outcome of a remaining-area computation.
#[derive(Debug, Clone)]
pub struct RemainingArea {
    /// The purchasable sub-geometry, None when sold out.
    pub geometry: Option<MultiPolygon<f64>>,
    /// GeoJSON rendering of the same geometry, suitable for metadata and
    /// ledger writes without re-serializing.
    pub geojson: Option<String>,
    pub area_km2: f64,
    pub sold_out: bool,
}

impl RemainingArea {
    fn sold_out() -> Self {
        Self {
            geometry: None,
            geojson: None,
            area_km2: 0.0,
            sold_out: true,
        }
    }
}

#[derive(Clone)]
pub struct AvailabilityService {
    pool: PgPool,
}

impl AvailabilityService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Remaining purchasable geometry for (region, category, slot).
    ///
    /// `exclude_business` drops that business's own claims from the blocker
    /// set, which is how an owner previews or re-prices an upgrade of its
    /// existing placement.
    ///
    /// Failure semantics: an unknown region is a `NotFound` error; every
    /// geometry-level failure resolves to sold-out with zero area. Nothing
    /// in this path may ever report "available" on error.
    pub async fn remaining(
        &self,
        region_id: Uuid,
        category_id: Uuid,
        slot: i32,
        exclude_business: Option<Uuid>,
    ) -> BillingResult<RemainingArea> {
        let row: Option<(Option<String>, Option<f64>)> = sqlx::query_as(
            "SELECT geojson, area_km2 FROM remaining_region_geometry($1, $2, $3, $4)",
        )
        .bind(region_id)
        .bind(category_id)
        .bind(slot)
        .bind(exclude_business)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(
                region_id = %region_id,
                category_id = %category_id,
                slot = slot,
                error = %e,
                "Remaining-area query failed, failing closed to sold out"
            );
            // Sentinel row: sold out, not missing-region
            Some((None, Some(0.0)))
        });

        let (geojson, area_km2) = match row {
            Some(r) => r,
            None => {
                return Err(BillingError::NotFound(format!(
                    "region {region_id} not found"
                )))
            }
        };

        let area_km2 = area_km2.unwrap_or(0.0).max(0.0);

        let Some(geojson) = geojson else {
            return Ok(RemainingArea::sold_out());
        };

        if area_km2 <= SOLD_OUT_EPSILON_KM2 {
            return Ok(RemainingArea::sold_out());
        }

        match patchmap_geo::from_geojson_str(&geojson) {
            Some(geometry) if !patchmap_geo::is_effectively_empty(&geometry) => {
                let rendered = patchmap_geo::to_geojson(&geometry).to_string();
                Ok(RemainingArea {
                    geometry: Some(geometry),
                    geojson: Some(rendered),
                    area_km2,
                    sold_out: false,
                })
            }
            _ => {
                tracing::error!(
                    region_id = %region_id,
                    category_id = %category_id,
                    slot = slot,
                    "Remaining geometry unparseable or empty, failing closed to sold out"
                );
                Ok(RemainingArea::sold_out())
            }
        }
    }
}
