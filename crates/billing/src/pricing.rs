//! Pricing engine
//!
//! Converts remaining area into a monthly charge. Rates are resolved
//! per (category, slot) with a fallback to the global default, so
//! differentiated tier rates can be introduced without changing the formula
//! shape. All arithmetic is in minor units (pence).

use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

/// Rate and floor for one placement tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateCard {
    pub rate_pence_per_km2: i64,
    pub minimum_monthly_pence: i64,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            // £15.00 per km^2 per month, £5.00 floor
            rate_pence_per_km2: 1_500,
            minimum_monthly_pence: 500,
        }
    }
}

/// Pricing configuration. Overrides are keyed by (category, slot).
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub currency: String,
    default: RateCard,
    overrides: HashMap<(Uuid, i32), RateCard>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            currency: "gbp".to_string(),
            default: RateCard::default(),
            overrides: HashMap::new(),
        }
    }
}

impl PricingConfig {
    pub fn new(default: RateCard, currency: String) -> Self {
        Self {
            currency,
            default,
            overrides: HashMap::new(),
        }
    }

    /// Resolve from the environment.
    ///
    /// `SPONSOR_RATE_PENCE_PER_KM2` / `SPONSOR_MIN_MONTHLY_PENCE` set the
    /// global default; `SPONSOR_RATE_OVERRIDES` is an optional JSON map of
    /// `"<category-uuid>:<slot>"` to a rate card.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("SPONSOR_RATE_PENCE_PER_KM2") {
            if let Ok(rate) = raw.parse::<i64>() {
                config.default.rate_pence_per_km2 = rate;
            }
        }
        if let Ok(raw) = std::env::var("SPONSOR_MIN_MONTHLY_PENCE") {
            if let Ok(min) = raw.parse::<i64>() {
                config.default.minimum_monthly_pence = min;
            }
        }
        if let Ok(currency) = std::env::var("SPONSOR_CURRENCY") {
            config.currency = currency.to_lowercase();
        }

        if let Ok(raw) = std::env::var("SPONSOR_RATE_OVERRIDES") {
            match serde_json::from_str::<HashMap<String, RateCard>>(&raw) {
                Ok(parsed) => {
                    for (key, card) in parsed {
                        match parse_override_key(&key) {
                            Some(scope) => {
                                config.overrides.insert(scope, card);
                            }
                            None => {
                                tracing::warn!(key = %key, "Ignoring malformed rate override key");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse SPONSOR_RATE_OVERRIDES, using defaults");
                }
            }
        }

        config
    }

    pub fn with_override(mut self, category_id: Uuid, slot: i32, card: RateCard) -> Self {
        self.overrides.insert((category_id, slot), card);
        self
    }

    /// The rate card in effect for a placement.
    pub fn rate_for(&self, category_id: Uuid, slot: i32) -> RateCard {
        self.overrides
            .get(&(category_id, slot))
            .copied()
            .unwrap_or(self.default)
    }

    /// Monthly price in pence: `max(minimum, area * rate)` with standard
    /// rounding to the minor unit. Monotone in area; the floor keeps slivers
    /// of remaining area from producing near-zero recurring charges.
    pub fn monthly_price_pence(&self, area_km2: f64, category_id: Uuid, slot: i32) -> i64 {
        let card = self.rate_for(category_id, slot);
        let area = area_km2.max(0.0);
        let by_area = (area * card.rate_pence_per_km2 as f64).round() as i64;
        by_area.max(card.minimum_monthly_pence)
    }

    /// Total for an N-month commitment. No discounting.
    pub fn commitment_total_pence(&self, monthly_pence: i64, months: u32) -> i64 {
        monthly_pence * i64::from(months)
    }
}

fn parse_override_key(key: &str) -> Option<(Uuid, i32)> {
    let (category, slot) = key.split_once(':')?;
    Some((category.parse().ok()?, slot.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: i64, min: i64) -> PricingConfig {
        PricingConfig::new(
            RateCard {
                rate_pence_per_km2: rate,
                minimum_monthly_pence: min,
            },
            "gbp".to_string(),
        )
    }

    #[test]
    fn test_floor_applies_to_zero_area() {
        let pricing = config(1500, 500);
        let category = Uuid::new_v4();
        assert_eq!(pricing.monthly_price_pence(0.0, category, 1), 500);
    }

    #[test]
    fn test_rate_applies_above_floor() {
        // 6 km^2 at £15/km^2 with £5 floor = £90.00
        let pricing = config(1500, 500);
        let category = Uuid::new_v4();
        assert_eq!(pricing.monthly_price_pence(6.0, category, 1), 9_000);
    }

    #[test]
    fn test_fractional_area_rounds_to_penny() {
        let pricing = config(1500, 500);
        let category = Uuid::new_v4();
        // 0.333 km^2 * 1500 = 499.5 -> 500 after rounding, equal to the floor
        assert_eq!(pricing.monthly_price_pence(0.333, category, 1), 500);
        // 0.3334 * 1500 = 500.1 -> 500
        assert_eq!(pricing.monthly_price_pence(0.3334, category, 1), 500);
    }

    #[test]
    fn test_monotone_in_area() {
        let pricing = config(1500, 500);
        let category = Uuid::new_v4();
        let mut last = 0;
        for area in [0.0, 0.1, 0.5, 1.0, 3.3, 6.0, 10.0, 250.0] {
            let price = pricing.monthly_price_pence(area, category, 1);
            assert!(price >= last, "price regressed at area {area}");
            last = price;
        }
    }

    #[test]
    fn test_negative_area_clamps_to_floor() {
        let pricing = config(1500, 500);
        let category = Uuid::new_v4();
        assert_eq!(pricing.monthly_price_pence(-4.0, category, 1), 500);
    }

    #[test]
    fn test_override_beats_default() {
        let category = Uuid::new_v4();
        let pricing = config(1500, 500).with_override(
            category,
            1,
            RateCard {
                rate_pence_per_km2: 3_000,
                minimum_monthly_pence: 1_000,
            },
        );

        assert_eq!(pricing.monthly_price_pence(2.0, category, 1), 6_000);
        // Other slots fall back to the default card
        assert_eq!(pricing.monthly_price_pence(2.0, category, 2), 3_000);
        // Other categories untouched
        assert_eq!(pricing.monthly_price_pence(2.0, Uuid::new_v4(), 1), 3_000);
    }

    #[test]
    fn test_commitment_total_has_no_discount() {
        let pricing = config(1500, 500);
        assert_eq!(pricing.commitment_total_pence(9_000, 12), 108_000);
        assert_eq!(pricing.commitment_total_pence(9_000, 1), 9_000);
    }

    #[test]
    fn test_override_key_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_override_key(&format!("{id}:2")),
            Some((id, 2))
        );
        assert_eq!(parse_override_key("nonsense"), None);
        assert_eq!(parse_override_key("not-a-uuid:1"), None);
    }
}
