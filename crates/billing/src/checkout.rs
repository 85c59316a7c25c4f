//! Checkout orchestration
//!
//! Validates a purchase request, prices the remaining area, and creates the
//! recurring Stripe checkout session. Nothing here writes the ledger: payment
//! authorization is asynchronous, so the claim is only recorded by the
//! reconciler once the billing provider confirms the subscription. The
//! session metadata carries everything needed to reconstruct the purchase
//! without ambiguity.

use std::collections::HashMap;

use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval, Currency,
};
use uuid::Uuid;

use crate::availability::AvailabilityService;
use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{SponsorshipLedger, SponsorshipWrite};
use crate::locks::LockManager;
use crate::pricing::PricingConfig;

use patchmap_shared::SponsorshipStatus;

/// Successful checkout-session creation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

struct RegionSummary {
    display_name: String,
    owner_business_id: Uuid,
}

/// Read-only pricing preview for a placement.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlacementPreview {
    pub geojson: Option<serde_json::Value>,
    pub area_km2: f64,
    pub monthly_price_pence: i64,
    pub sold_out: bool,
}

#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    pricing: PricingConfig,
    availability: AvailabilityService,
    customer: CustomerService,
    ledger: SponsorshipLedger,
    locks: LockManager,
    event_logger: BillingEventLogger,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool, pricing: PricingConfig) -> Self {
        Self {
            availability: AvailabilityService::new(pool.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            ledger: SponsorshipLedger::new(pool.clone()),
            locks: LockManager::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool.clone()),
            stripe,
            pool,
            pricing,
        }
    }

    /// Create a recurring checkout session for a placement.
    ///
    /// Fails with a specific conflict before any billing call: `slot_taken`
    /// (the region's owner already sponsors their own turf, owner id
    /// returned for UI messaging), `already_sponsored` (the caller holds a
    /// claim here), `no_remaining` (nothing purchasable left),
    /// `checkout_in_progress` (another checkout holds the advisory lock).
    pub async fn create_sponsored_checkout(
        &self,
        business_id: Uuid,
        region_id: Uuid,
        category_id: Uuid,
        slot: i32,
    ) -> BillingResult<CheckoutResponse> {
        if slot < 1 {
            return Err(BillingError::InvalidInput(format!("invalid slot {slot}")));
        }

        let region = self.region_summary(region_id).await?;

        // Step 1: existing-claim precheck. The same placement may carry
        // several live claims over disjoint geometry, so a competitor row is
        // not by itself a conflict; the caller's own row is, and so is the
        // region owner's claim on their own turf.
        let existing = self
            .ledger
            .find_active_like(region_id, category_id, slot)
            .await?;
        if existing.iter().any(|s| s.business_id == business_id) {
            return Err(BillingError::AlreadySponsored);
        }
        if region.owner_business_id != business_id
            && existing
                .iter()
                .any(|s| s.business_id == region.owner_business_id)
        {
            return Err(BillingError::SlotTaken {
                owner_business_id: region.owner_business_id,
            });
        }

        // Step 2: authoritative availability check.
        let remaining = self
            .availability
            .remaining(region_id, category_id, slot, None)
            .await?;
        if remaining.sold_out {
            return Err(BillingError::NoRemaining);
        }

        // Step 3: price the remaining area.
        let monthly_pence =
            self.pricing
                .monthly_price_pence(remaining.area_km2, category_id, slot);

        // Step 4: idempotent customer resolution.
        let customer_id = self.customer.get_or_create(business_id).await?;

        // Step 5: advisory lock for the duration of the payment flow.
        let lock_id = self
            .locks
            .acquire(region_id, category_id, slot, business_id)
            .await?;

        // Step 6: create the session. The lock is released on failure so an
        // aborted attempt does not block the placement for its full TTL.
        let session = match self
            .create_session(
                business_id,
                region_id,
                category_id,
                slot,
                lock_id,
                &customer_id,
                &region.display_name,
                monthly_pence,
                remaining.area_km2,
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                if let Err(release_err) = self.locks.release(lock_id).await {
                    tracing::error!(
                        lock_id = %lock_id,
                        error = %release_err,
                        "Failed to release lock after session-creation failure"
                    );
                }
                return Err(e);
            }
        };

        let url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::Internal("checkout session has no URL".to_string()))?;

        // Provisional placeholder, keyed by the session id until the first
        // confirmed billing event promotes it onto the subscription id.
        // Provisional rows hold no geometry claim and block nobody; losing
        // this write costs only the placeholder, so it is non-fatal.
        if let Some(owned_geojson) = remaining.geojson.clone() {
            let provisional = SponsorshipWrite {
                business_id,
                region_id,
                category_id,
                slot,
                status: SponsorshipStatus::Provisional,
                owned_geojson,
                monthly_price_pence: monthly_pence,
                currency: self.pricing.currency.clone(),
                stripe_subscription_id: session.id.to_string(),
                stripe_customer_id: Some(customer_id.clone()),
                current_period_end: None,
                cancel_at_period_end: false,
            };
            if let Err(e) = self.ledger.upsert(&provisional).await {
                tracing::warn!(
                    business_id = %business_id,
                    session_id = %session.id,
                    error = %e,
                    "Failed to write provisional sponsorship placeholder"
                );
            }
        }

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(business_id, BillingEventType::CheckoutSessionCreated)
                    .data(serde_json::json!({
                        "region_id": region_id,
                        "category_id": category_id,
                        "slot": slot,
                        "area_km2": remaining.area_km2,
                        "monthly_price_pence": monthly_pence,
                        "session_id": session.id.to_string(),
                    }))
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log checkout session event");
        }

        tracing::info!(
            business_id = %business_id,
            region_id = %region_id,
            category_id = %category_id,
            slot = slot,
            area_km2 = remaining.area_km2,
            monthly_price_pence = monthly_pence,
            session_id = %session.id,
            "Checkout session created"
        );

        Ok(CheckoutResponse { url })
    }

    /// Read-only preview: remaining geometry and the price it would fetch.
    /// Mutates neither locks nor ledger.
    pub async fn preview_placement(
        &self,
        region_id: Uuid,
        category_id: Uuid,
        slot: i32,
        exclude_business: Option<Uuid>,
    ) -> BillingResult<PlacementPreview> {
        if slot < 1 {
            return Err(BillingError::InvalidInput(format!("invalid slot {slot}")));
        }

        let remaining = self
            .availability
            .remaining(region_id, category_id, slot, exclude_business)
            .await?;

        let geojson = remaining
            .geojson
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        Ok(PlacementPreview {
            geojson,
            area_km2: remaining.area_km2,
            monthly_price_pence: self.pricing.monthly_price_pence(
                remaining.area_km2,
                category_id,
                slot,
            ),
            sold_out: remaining.sold_out,
        })
    }

    async fn region_summary(&self, region_id: Uuid) -> BillingResult<RegionSummary> {
        let row: Option<(String, Uuid)> =
            sqlx::query_as("SELECT display_name, business_id FROM regions WHERE id = $1")
                .bind(region_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(display_name, owner_business_id)| RegionSummary {
            display_name,
            owner_business_id,
        })
        .ok_or_else(|| BillingError::NotFound(format!("region {region_id} not found")))
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_session(
        &self,
        business_id: Uuid,
        region_id: Uuid,
        category_id: Uuid,
        slot: i32,
        lock_id: Uuid,
        customer_id: &str,
        region_name: &str,
        monthly_pence: i64,
        area_km2: f64,
    ) -> BillingResult<CheckoutSession> {
        let currency = self
            .pricing
            .currency
            .parse::<Currency>()
            .unwrap_or(Currency::GBP);

        // Wire contract: the region travels as `area_id`.
        let mut metadata: HashMap<String, String> = HashMap::new();
        metadata.insert("business_id".to_string(), business_id.to_string());
        metadata.insert("area_id".to_string(), region_id.to_string());
        metadata.insert("category_id".to_string(), category_id.to_string());
        metadata.insert("slot".to_string(), slot.to_string());
        metadata.insert("lock_id".to_string(), lock_id.to_string());
        metadata.insert("area_km2".to_string(), format!("{area_km2:.6}"));

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer = Some(
            customer_id
                .parse()
                .map_err(|_| BillingError::CustomerNotFound(customer_id.to_string()))?,
        );
        params.success_url = Some(self.stripe.config().checkout_success_url.as_str());
        params.cancel_url = Some(self.stripe.config().checkout_cancel_url.as_str());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(monthly_pence),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: format!("Sponsored placement: {region_name}"),
                    description: Some(format!(
                        "Exclusive featured placement over {area_km2:.2} km² (slot {slot})"
                    )),
                    ..Default::default()
                }),
                recurring: Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                    interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
                    interval_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        // Propagated onto the subscription object so every later lifecycle
        // event can reconstruct the purchase context.
        params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        Ok(CheckoutSession::create(self.stripe.inner(), params).await?)
    }
}
