// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Sponsorship Billing System
//!
//! Tests critical boundary conditions in:
//! - Pricing (SPON-P01 to SPON-P07)
//! - Webhook metadata parsing (SPON-M01 to SPON-M07)
//! - Subscription status mapping (SPON-S01 to SPON-S06)
//! - Reconcile outcomes (SPON-O01 to SPON-O03)

#[cfg(test)]
mod pricing_edge_tests {
    use crate::pricing::{PricingConfig, RateCard};
    use uuid::Uuid;

    fn pricing(rate: i64, min: i64) -> PricingConfig {
        PricingConfig::new(
            RateCard {
                rate_pence_per_km2: rate,
                minimum_monthly_pence: min,
            },
            "gbp".to_string(),
        )
    }

    // =========================================================================
    // SPON-P01: Zero remaining area - floor applies
    // =========================================================================
    #[test]
    fn test_zero_area_charges_floor() {
        let p = pricing(1500, 500);
        assert_eq!(p.monthly_price_pence(0.0, Uuid::new_v4(), 1), 500);
    }

    // =========================================================================
    // SPON-P02: Sliver of area below the floor threshold - floor applies
    // =========================================================================
    #[test]
    fn test_sliver_area_charges_floor() {
        let p = pricing(1500, 500);
        // 0.1 km^2 * 1500 = 150, under the 500 floor
        assert_eq!(p.monthly_price_pence(0.1, Uuid::new_v4(), 1), 500);
    }

    // =========================================================================
    // SPON-P03: Area exactly at the floor boundary
    // =========================================================================
    #[test]
    fn test_area_at_floor_boundary() {
        let p = pricing(1500, 500);
        // 500 / 1500 = 0.3333... km^2 is the break-even point
        let category = Uuid::new_v4();
        assert_eq!(p.monthly_price_pence(500.0 / 1500.0, category, 1), 500);
        assert!(p.monthly_price_pence(0.4, category, 1) > 500);
    }

    // =========================================================================
    // SPON-P04: The spec's worked example - 6 km^2 at 15/km^2, min 5
    // =========================================================================
    #[test]
    fn test_worked_example_six_km2() {
        // Rates in major units: 15.00/km^2, minimum 5.00
        let p = pricing(1500, 500);
        let monthly = p.monthly_price_pence(6.0, Uuid::new_v4(), 1);
        assert_eq!(monthly, 9_000, "max(5, 6*15) = 90.00");
    }

    // =========================================================================
    // SPON-P05: Large region does not overflow
    // =========================================================================
    #[test]
    fn test_large_area_no_overflow() {
        let p = pricing(1500, 500);
        // Larger than any real service area
        let monthly = p.monthly_price_pence(250_000.0, Uuid::new_v4(), 1);
        assert_eq!(monthly, 375_000_000);
        assert_eq!(p.commitment_total_pence(monthly, 12), 4_500_000_000);
    }

    // =========================================================================
    // SPON-P06: Pricing is deterministic across repeated calls
    // =========================================================================
    #[test]
    fn test_pricing_deterministic() {
        let p = pricing(1500, 500);
        let category = Uuid::new_v4();
        let first = p.monthly_price_pence(3.7, category, 1);
        for _ in 0..10 {
            assert_eq!(p.monthly_price_pence(3.7, category, 1), first);
        }
    }

    // =========================================================================
    // SPON-P07: Override isolation between slots
    // =========================================================================
    #[test]
    fn test_override_does_not_leak_between_slots() {
        let category = Uuid::new_v4();
        let p = pricing(1500, 500).with_override(
            category,
            2,
            RateCard {
                rate_pence_per_km2: 100,
                minimum_monthly_pence: 100,
            },
        );
        assert_eq!(p.monthly_price_pence(1.0, category, 2), 100);
        assert_eq!(p.monthly_price_pence(1.0, category, 1), 1_500);
    }
}

#[cfg(test)]
mod metadata_parsing_tests {
    use crate::webhooks::parse_metadata;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn metadata(pairs: &[(&str, String)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // =========================================================================
    // SPON-M01: Complete metadata parses every field
    // =========================================================================
    #[test]
    fn test_complete_metadata() {
        let business = Uuid::new_v4();
        let region = Uuid::new_v4();
        let category = Uuid::new_v4();
        let lock = Uuid::new_v4();

        let parsed = parse_metadata(&metadata(&[
            ("business_id", business.to_string()),
            ("area_id", region.to_string()),
            ("category_id", category.to_string()),
            ("slot", "1".to_string()),
            ("lock_id", lock.to_string()),
            ("area_km2", "6.250000".to_string()),
        ]));

        assert_eq!(parsed.business_id, Some(business));
        assert_eq!(parsed.region_id, Some(region));
        assert_eq!(parsed.category_id, Some(category));
        assert_eq!(parsed.slot, Some(1));
        assert_eq!(parsed.lock_id, Some(lock));
        assert_eq!(parsed.area_km2_snapshot, Some(6.25));
    }

    // =========================================================================
    // SPON-M02: region_id accepted as an alias for area_id
    // =========================================================================
    #[test]
    fn test_region_id_alias() {
        let region = Uuid::new_v4();
        let parsed = parse_metadata(&metadata(&[("region_id", region.to_string())]));
        assert_eq!(parsed.region_id, Some(region));
    }

    // =========================================================================
    // SPON-M03: area_id wins over region_id when both are present
    // =========================================================================
    #[test]
    fn test_area_id_wins_over_alias() {
        let canonical = Uuid::new_v4();
        let legacy = Uuid::new_v4();
        let parsed = parse_metadata(&metadata(&[
            ("area_id", canonical.to_string()),
            ("region_id", legacy.to_string()),
        ]));
        assert_eq!(parsed.region_id, Some(canonical));
    }

    // =========================================================================
    // SPON-M04: Empty metadata parses to all-None, not an error
    // =========================================================================
    #[test]
    fn test_empty_metadata() {
        let parsed = parse_metadata(&HashMap::new());
        assert_eq!(parsed.business_id, None);
        assert_eq!(parsed.region_id, None);
        assert_eq!(parsed.category_id, None);
        assert_eq!(parsed.slot, None);
        assert_eq!(parsed.lock_id, None);
    }

    // =========================================================================
    // SPON-M05: Malformed values degrade to None field-by-field
    // =========================================================================
    #[test]
    fn test_malformed_values_degrade_individually() {
        let business = Uuid::new_v4();
        let parsed = parse_metadata(&metadata(&[
            ("business_id", business.to_string()),
            ("area_id", "not-a-uuid".to_string()),
            ("slot", "first".to_string()),
        ]));
        assert_eq!(parsed.business_id, Some(business));
        assert_eq!(parsed.region_id, None);
        assert_eq!(parsed.slot, None);
    }

    // =========================================================================
    // SPON-M06: Unknown keys are ignored
    // =========================================================================
    #[test]
    fn test_unknown_keys_ignored() {
        let parsed = parse_metadata(&metadata(&[
            ("checkout_type", "sponsorship".to_string()),
            ("slot", "2".to_string()),
        ]));
        assert_eq!(parsed.slot, Some(2));
    }

    // =========================================================================
    // SPON-M07: Negative and zero slots still parse (validated downstream)
    // =========================================================================
    #[test]
    fn test_slot_parse_is_unvalidated() {
        let parsed = parse_metadata(&metadata(&[("slot", "0".to_string())]));
        assert_eq!(parsed.slot, Some(0));
    }
}

#[cfg(test)]
mod status_mapping_tests {
    use crate::webhooks::map_subscription_status;
    use patchmap_shared::SponsorshipStatus;
    use stripe::SubscriptionStatus as S;

    // =========================================================================
    // SPON-S01: Live statuses map one-to-one
    // =========================================================================
    #[test]
    fn test_live_status_mapping() {
        assert_eq!(
            map_subscription_status(S::Active, false),
            SponsorshipStatus::Active
        );
        assert_eq!(
            map_subscription_status(S::Trialing, false),
            SponsorshipStatus::Trialing
        );
        assert_eq!(
            map_subscription_status(S::PastDue, false),
            SponsorshipStatus::PastDue
        );
        assert_eq!(
            map_subscription_status(S::Unpaid, false),
            SponsorshipStatus::Unpaid
        );
        assert_eq!(
            map_subscription_status(S::Incomplete, false),
            SponsorshipStatus::Incomplete
        );
        assert_eq!(
            map_subscription_status(S::Paused, false),
            SponsorshipStatus::Paused
        );
    }

    // =========================================================================
    // SPON-S02: Active + cancel_at_period_end reads as canceling
    // =========================================================================
    #[test]
    fn test_scheduled_cancel_is_canceling() {
        assert_eq!(
            map_subscription_status(S::Active, true),
            SponsorshipStatus::Canceling
        );
    }

    // =========================================================================
    // SPON-S03: Canceling still blocks competitors
    // =========================================================================
    #[test]
    fn test_canceling_is_active_like() {
        let status = map_subscription_status(S::Active, true);
        assert!(status.is_active_like());
    }

    // =========================================================================
    // SPON-S04: Terminal Stripe states map to canceled
    // =========================================================================
    #[test]
    fn test_terminal_states() {
        assert_eq!(
            map_subscription_status(S::Canceled, false),
            SponsorshipStatus::Canceled
        );
        assert_eq!(
            map_subscription_status(S::IncompleteExpired, false),
            SponsorshipStatus::Canceled
        );
        // The flag is irrelevant once the subscription is gone
        assert_eq!(
            map_subscription_status(S::Canceled, true),
            SponsorshipStatus::Canceled
        );
    }

    // =========================================================================
    // SPON-S05: cancel_at_period_end does not soften non-active states
    // =========================================================================
    #[test]
    fn test_flag_only_affects_active() {
        assert_eq!(
            map_subscription_status(S::PastDue, true),
            SponsorshipStatus::PastDue
        );
        assert_eq!(
            map_subscription_status(S::Trialing, true),
            SponsorshipStatus::Trialing
        );
    }

    // =========================================================================
    // SPON-S06: Every mapped live status is in the blocking set
    // =========================================================================
    #[test]
    fn test_all_live_mappings_block() {
        for status in [
            S::Active,
            S::Trialing,
            S::PastDue,
            S::Unpaid,
            S::Incomplete,
            S::Paused,
        ] {
            assert!(
                map_subscription_status(status, false).is_active_like(),
                "{status:?} should map to a blocking status"
            );
        }
    }
}

#[cfg(test)]
mod outcome_tests {
    use crate::webhooks::ReconcileOutcome;

    // =========================================================================
    // SPON-O01: Outcome labels are stable audit strings
    // =========================================================================
    #[test]
    fn test_outcome_labels() {
        assert_eq!(ReconcileOutcome::Applied.label(), "success");
        assert_eq!(
            ReconcileOutcome::Skipped {
                reason: "missing_metadata"
            }
            .label(),
            "skipped: missing_metadata"
        );
        assert_eq!(
            ReconcileOutcome::Canceled {
                reason: "no_remaining"
            }
            .label(),
            "canceled: no_remaining"
        );
        assert_eq!(
            ReconcileOutcome::Canceled {
                reason: "db_write_failed"
            }
            .label(),
            "canceled: db_write_failed"
        );
    }

    // =========================================================================
    // SPON-O02: A handled conflict is not an error outcome
    // =========================================================================
    #[test]
    fn test_conflict_is_handled_outcome() {
        // The webhook route answers 200 for any Ok(outcome); only Err paths
        // produce retries. Canceled outcomes therefore must be Ok values.
        let outcome: Result<ReconcileOutcome, crate::error::BillingError> =
            Ok(ReconcileOutcome::Canceled {
                reason: "db_write_failed",
            });
        assert!(outcome.is_ok());
    }

    // =========================================================================
    // SPON-O03: Webhook timestamp tolerance boundary (300 s)
    // =========================================================================
    #[test]
    fn test_webhook_timestamp_tolerance() {
        let tolerance_seconds = 300;
        assert!(300 <= tolerance_seconds, "300s should be within tolerance");
        assert!(301 > tolerance_seconds, "301s should exceed tolerance");
    }
}
