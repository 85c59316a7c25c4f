//! Stripe webhook handling
//!
//! The billing event reconciler. Events arrive out of order and may be
//! duplicated, so processing is idempotent twice over: an atomic claim on
//! the Stripe event id, and ledger writes keyed on the subscription id.
//!
//! The availability check at checkout time and the eventual ledger write are
//! separated by however long the buyer spends in the external payment flow,
//! so every subscription confirmation re-validates against the *current*
//! world state here. When the world changed underneath the buyer, the
//! subscription is canceled rather than double-selling geometry: a handled
//! conflict is an expected outcome and still answers 200 to Stripe.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Subscription, SubscriptionId, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use patchmap_shared::SponsorshipStatus;

use crate::availability::AvailabilityService;
use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices::{InvoiceService, InvoiceUpsert};
use crate::ledger::{LedgerWriteError, SponsorshipLedger, SponsorshipWrite};
use crate::locks::LockManager;
use crate::pricing::PricingConfig;

type HmacSha256 = Hmac<Sha256>;

/// How a handled event was resolved. Conflicts are outcomes, not errors:
/// they are recorded against the event and answered with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Skipped { reason: &'static str },
    Canceled { reason: &'static str },
}

impl ReconcileOutcome {
    pub fn label(&self) -> String {
        match self {
            ReconcileOutcome::Applied => "success".to_string(),
            ReconcileOutcome::Skipped { reason } => format!("skipped: {reason}"),
            ReconcileOutcome::Canceled { reason } => format!("canceled: {reason}"),
        }
    }
}

/// Fully-typed purchase context recovered from subscription metadata.
/// Downstream code never sees raw metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutContext {
    pub business_id: Uuid,
    pub region_id: Uuid,
    pub category_id: Uuid,
    pub slot: i32,
    pub lock_id: Option<Uuid>,
}

/// Raw metadata fields before completeness is decided. The wire keys are
/// `business_id`, `area_id` (region), `category_id`, `slot`, `lock_id`;
/// `region_id` is accepted as an alias for `area_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialContext {
    pub business_id: Option<Uuid>,
    pub region_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub slot: Option<i32>,
    pub lock_id: Option<Uuid>,
    pub area_km2_snapshot: Option<f64>,
}

pub fn parse_metadata(metadata: &HashMap<String, String>) -> PartialContext {
    let uuid_of = |key: &str| metadata.get(key).and_then(|v| v.parse::<Uuid>().ok());

    PartialContext {
        business_id: uuid_of("business_id"),
        region_id: uuid_of("area_id").or_else(|| uuid_of("region_id")),
        category_id: uuid_of("category_id"),
        slot: metadata.get("slot").and_then(|v| v.parse().ok()),
        lock_id: uuid_of("lock_id"),
        area_km2_snapshot: metadata.get("area_km2").and_then(|v| v.parse().ok()),
    }
}

/// Map a Stripe subscription state onto the ledger's status set.
/// `cancel_at_period_end` on a live subscription reads as `canceling`.
pub fn map_subscription_status(
    status: stripe::SubscriptionStatus,
    cancel_at_period_end: bool,
) -> SponsorshipStatus {
    use stripe::SubscriptionStatus as S;
    match status {
        S::Canceled | S::IncompleteExpired => SponsorshipStatus::Canceled,
        S::Active if cancel_at_period_end => SponsorshipStatus::Canceling,
        S::Active => SponsorshipStatus::Active,
        S::Trialing => SponsorshipStatus::Trialing,
        S::PastDue => SponsorshipStatus::PastDue,
        S::Unpaid => SponsorshipStatus::Unpaid,
        S::Incomplete => SponsorshipStatus::Incomplete,
        S::Paused => SponsorshipStatus::Paused,
    }
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    pricing: PricingConfig,
    availability: AvailabilityService,
    customer: CustomerService,
    invoices: InvoiceService,
    ledger: SponsorshipLedger,
    locks: LockManager,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, pricing: PricingConfig) -> Self {
        Self {
            availability: AvailabilityService::new(pool.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            invoices: InvoiceService::new(pool.clone()),
            ledger: SponsorshipLedger::new(pool.clone()),
            locks: LockManager::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool.clone()),
            stripe,
            pool,
            pricing,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the SDK's verification first, then a manual check of the
    /// `t=...,v1=...` signature header against the raw body. Verification
    /// happens before any data access; failures are a hard 400.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        // Replay tolerance: 5 minutes
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > 300 {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Uses INSERT...ON CONFLICT...RETURNING to atomically claim exclusive
    /// processing rights on the event id, so two concurrent deliveries of
    /// the same event cannot both run. Events stuck in `processing` for over
    /// 30 minutes can be re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<ReconcileOutcome> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event, already claimed or processed"
            );
            return Ok(ReconcileOutcome::Skipped {
                reason: "duplicate_event",
            });
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(outcome) => (outcome.label(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(&processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            // The audit row matters for idempotency forensics; a stuck
            // 'processing' row will be re-claimable after the timeout.
            tracing::error!(
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to update webhook audit record"
            );
        }

        result
    }

    async fn process_event_internal(&self, event: &Event) -> BillingResult<ReconcileOutcome> {
        let event_id = event.id.to_string();

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event, &event_id).await
            }

            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event)?;
                self.apply_subscription(&subscription, &event_id).await
            }

            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                self.handle_subscription_deleted(&subscription, &event_id)
                    .await
            }

            EventType::InvoiceFinalized => {
                self.handle_invoice(event, &event_id, "open", BillingEventType::InvoiceFinalized)
                    .await
            }
            EventType::InvoicePaid => {
                self.handle_invoice(event, &event_id, "paid", BillingEventType::InvoicePaid)
                    .await
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice(
                    event,
                    &event_id,
                    "payment_failed",
                    BillingEventType::InvoiceFailed,
                )
                .await
            }
            EventType::InvoiceVoided => {
                self.handle_invoice(event, &event_id, "void", BillingEventType::InvoiceVoided)
                    .await
            }

            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(ReconcileOutcome::Skipped {
                    reason: "unhandled_event_type",
                })
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: &Event,
        event_id: &str,
    ) -> BillingResult<ReconcileOutcome> {
        let session = match &event.data.object {
            EventObject::CheckoutSession(session) => session.clone(),
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let Some(subscription_ref) = session.subscription else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session completed without a subscription, skipping"
            );
            return Ok(ReconcileOutcome::Skipped {
                reason: "no_subscription",
            });
        };

        let subscription_id: SubscriptionId = subscription_ref.id().parse().map_err(|_| {
            BillingError::SubscriptionNotFound(subscription_ref.id().to_string())
        })?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &subscription_id, &[]).await?;

        // Promote the provisional placeholder written at session creation
        // onto the real subscription id, so the upsert below lands on the
        // same row instead of orphaning the placeholder.
        let session_key = session.id.to_string();
        let promote = sqlx::query(
            r#"
            UPDATE sponsorships
            SET stripe_subscription_id = $1, updated_at = NOW()
            WHERE stripe_subscription_id = $2 AND status = 'provisional'
            "#,
        )
        .bind(subscription.id.as_str())
        .bind(&session_key)
        .execute(&self.pool)
        .await;

        match promote {
            Ok(_) => {}
            Err(e) if crate::error::is_unique_violation(&e) => {
                // Subscription events arrived first and already created the
                // confirmed row; the placeholder is obsolete.
                self.ledger.mark_canceled(&session_key).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.apply_subscription(&subscription, event_id).await
    }

    /// Apply a subscription's current state to the ledger.
    ///
    /// This is the mandatory re-check: availability is resolved against the
    /// current world, not the preview the buyer priced against. Exactly one
    /// of three things happens: the claim is written, the event is skipped
    /// (incomplete context), or the subscription is canceled (sold out or
    /// ledger rejection).
    async fn apply_subscription(
        &self,
        subscription: &Subscription,
        event_id: &str,
    ) -> BillingResult<ReconcileOutcome> {
        let subscription_id = subscription.id.to_string();

        let ctx = match self.resolve_context(subscription).await? {
            Some(ctx) => ctx,
            None => {
                // Never write a row with a null region/slot; unconstrainable
                // rows have caused data-integrity incidents before.
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Subscription context incomplete, skipping ledger write"
                );
                self.log_event(
                    BillingEventBuilder::unattributed(BillingEventType::ReconcileSkipped)
                        .data(serde_json::json!({"reason": "missing_metadata"}))
                        .stripe_event(event_id)
                        .stripe_subscription(subscription_id)
                        .actor_type(ActorType::Stripe),
                )
                .await;
                return Ok(ReconcileOutcome::Skipped {
                    reason: "missing_metadata",
                });
            }
        };

        let status =
            map_subscription_status(subscription.status, subscription.cancel_at_period_end);

        if status == SponsorshipStatus::Canceled {
            self.ledger.mark_canceled(&subscription_id).await?;
            self.release_lock(ctx.lock_id).await;
            self.log_event(
                BillingEventBuilder::new(ctx.business_id, BillingEventType::SponsorshipCanceled)
                    .data(serde_json::json!({"source": "subscription_state"}))
                    .stripe_event(event_id)
                    .stripe_subscription(subscription_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await;
            return Ok(ReconcileOutcome::Applied);
        }

        // A replayed or late event must not disturb a settled claim. A row
        // this reconciler already hard-canceled stays canceled even when an
        // older "updated" event arrives after the deletion was processed; an
        // existing live claim keeps its geometry and price, only syncing
        // status fields. Fresh geometry is derived exactly once, at first
        // confirmation.
        let existing = self.ledger.find_by_subscription(&subscription_id).await?;
        let live_row = match &existing {
            Some(row) if row.status() == Some(SponsorshipStatus::Canceled) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Stale event for a canceled sponsorship, skipping"
                );
                return Ok(ReconcileOutcome::Skipped {
                    reason: "already_canceled",
                });
            }
            Some(row) if row.status().map(|s| s.is_active_like()).unwrap_or(false) => {
                Some(row.clone())
            }
            _ => None,
        };

        let (owned_geojson, area_km2, monthly_price_pence) = match live_row {
            Some(row) => {
                // Status-only refresh of a confirmed claim.
                (row.owned_geojson.clone(), None, row.monthly_price_pence)
            }
            None => {
                // First confirmation: re-check availability against the
                // current world, not the preview the buyer priced against.
                // The buyer's own claims are excluded so a promoted
                // placeholder cannot block itself.
                let remaining = match self
                    .availability
                    .remaining(
                        ctx.region_id,
                        ctx.category_id,
                        ctx.slot,
                        Some(ctx.business_id),
                    )
                    .await
                {
                    Ok(remaining) => remaining,
                    Err(BillingError::NotFound(detail)) => {
                        // Region vanished mid-flight; fail closed.
                        tracing::error!(
                            subscription_id = %subscription_id,
                            detail = %detail,
                            "Region missing at reconcile time, canceling subscription"
                        );
                        return self
                            .cancel_conflicting(&ctx, &subscription_id, event_id, "no_remaining")
                            .await;
                    }
                    Err(e) => return Err(e),
                };

                if remaining.sold_out {
                    // Two concurrent buyers both completed payment; this one
                    // lost.
                    return self
                        .cancel_conflicting(&ctx, &subscription_id, event_id, "no_remaining")
                        .await;
                }

                let Some(owned_geojson) = remaining.geojson.clone() else {
                    return self
                        .cancel_conflicting(&ctx, &subscription_id, event_id, "no_remaining")
                        .await;
                };

                let monthly_price_pence = self.pricing.monthly_price_pence(
                    remaining.area_km2,
                    ctx.category_id,
                    ctx.slot,
                );
                (owned_geojson, Some(remaining.area_km2), monthly_price_pence)
            }
        };

        let write = SponsorshipWrite {
            business_id: ctx.business_id,
            region_id: ctx.region_id,
            category_id: ctx.category_id,
            slot: ctx.slot,
            status,
            owned_geojson,
            monthly_price_pence,
            currency: self.pricing.currency.clone(),
            stripe_subscription_id: subscription_id.clone(),
            stripe_customer_id: Some(customer_id_of(subscription)),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            cancel_at_period_end: subscription.cancel_at_period_end,
        };

        // area_km2 is only Some on first confirmation
        let billing_event_type = if area_km2.is_some() {
            BillingEventType::SponsorshipConfirmed
        } else {
            BillingEventType::SponsorshipUpdated
        };

        match self.ledger.upsert(&write).await {
            Ok(sponsorship_db_id) => {
                self.release_lock(ctx.lock_id).await;
                self.log_event(
                    BillingEventBuilder::new(ctx.business_id, billing_event_type)
                    .data(serde_json::json!({
                        "sponsorship_id": sponsorship_db_id,
                        "region_id": ctx.region_id,
                        "category_id": ctx.category_id,
                        "slot": ctx.slot,
                        "status": status.as_str(),
                        "area_km2": area_km2,
                        "monthly_price_pence": monthly_price_pence,
                    }))
                    .stripe_event(event_id)
                    .stripe_subscription(subscription_id.clone())
                    .actor_type(ActorType::Stripe),
                )
                .await;

                tracing::info!(
                    business_id = %ctx.business_id,
                    region_id = %ctx.region_id,
                    slot = ctx.slot,
                    subscription_id = %subscription_id,
                    status = %status,
                    area_km2 = ?area_km2,
                    "Sponsorship reconciled"
                );
                Ok(ReconcileOutcome::Applied)
            }
            Err(LedgerWriteError::Conflict { detail }) => {
                // The constraint is the last line of defense against
                // double-selling; retrying would conflict again.
                tracing::warn!(
                    business_id = %ctx.business_id,
                    subscription_id = %subscription_id,
                    detail = %detail,
                    "Ledger rejected write, canceling subscription"
                );
                self.cancel_conflicting(&ctx, &subscription_id, event_id, "db_write_failed")
                    .await
            }
            Err(LedgerWriteError::Database(detail)) => Err(BillingError::Database(detail)),
        }
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: &Subscription,
        event_id: &str,
    ) -> BillingResult<ReconcileOutcome> {
        let subscription_id = subscription.id.to_string();

        let marked = self.ledger.mark_canceled(&subscription_id).await?;
        let partial = parse_metadata(&subscription.metadata);
        self.release_lock(partial.lock_id).await;

        let builder = match partial.business_id {
            Some(business_id) => {
                BillingEventBuilder::new(business_id, BillingEventType::SponsorshipCanceled)
            }
            None => BillingEventBuilder::unattributed(BillingEventType::SponsorshipCanceled),
        };
        self.log_event(
            builder
                .data(serde_json::json!({
                    "source": "subscription_deleted",
                    "row_updated": marked,
                }))
                .stripe_event(event_id)
                .stripe_subscription(subscription_id.clone())
                .actor_type(ActorType::Stripe),
        )
        .await;

        tracing::info!(
            subscription_id = %subscription_id,
            row_updated = marked,
            "Subscription deleted, sponsorship canceled"
        );
        Ok(ReconcileOutcome::Applied)
    }

    async fn handle_invoice(
        &self,
        event: &Event,
        event_id: &str,
        status: &str,
        billing_event_type: BillingEventType,
    ) -> BillingResult<ReconcileOutcome> {
        let invoice = extract_invoice(event)?;
        let upsert = InvoiceUpsert::from_stripe(&invoice, status);

        let mut link = self.invoices.upsert(&upsert).await?;

        // Ordering hazard: the invoice can arrive before the subscription
        // confirmation created the sponsorship row. Fetch the subscription,
        // run the subscription path, then retry the link. Bounded: one
        // fetch, and a failure degrades to an unlinked invoice.
        if link.sponsorship_id.is_none() {
            if let Some(sub_id_str) = upsert.stripe_subscription_id.clone() {
                match sub_id_str.parse::<SubscriptionId>() {
                    Ok(sub_id) => {
                        match Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await {
                            Ok(subscription) => {
                                let outcome =
                                    self.apply_subscription(&subscription, event_id).await?;
                                tracing::info!(
                                    invoice_id = %upsert.stripe_invoice_id,
                                    subscription_id = %sub_id_str,
                                    outcome = %outcome.label(),
                                    "Backfilled subscription for early invoice"
                                );
                                link = self.invoices.upsert(&upsert).await?;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    invoice_id = %upsert.stripe_invoice_id,
                                    subscription_id = %sub_id_str,
                                    error = %e,
                                    "Could not fetch subscription to backfill invoice link"
                                );
                            }
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            invoice_id = %upsert.stripe_invoice_id,
                            subscription_id = %sub_id_str,
                            "Unparseable subscription id on invoice"
                        );
                    }
                }
            }
        }

        let builder = match link.business_id {
            Some(business_id) => BillingEventBuilder::new(business_id, billing_event_type),
            None => BillingEventBuilder::unattributed(billing_event_type),
        };
        self.log_event(
            builder
                .data(serde_json::json!({
                    "amount_due_pence": upsert.amount_due_pence,
                    "amount_paid_pence": upsert.amount_paid_pence,
                    "status": status,
                    "linked": link.sponsorship_id.is_some(),
                }))
                .stripe_event(event_id)
                .stripe_invoice(&upsert.stripe_invoice_id)
                .actor_type(ActorType::Stripe),
        )
        .await;

        tracing::info!(
            invoice_id = %upsert.stripe_invoice_id,
            status = status,
            linked = link.sponsorship_id.is_some(),
            "Invoice reconciled"
        );
        Ok(ReconcileOutcome::Applied)
    }

    /// Resolve the typed purchase context from subscription metadata, with a
    /// customer-id fallback for the business so subscriptions created
    /// through an alternate flow still resolve. Region, category, and slot
    /// can only come from metadata; without them the context is incomplete.
    async fn resolve_context(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Option<CheckoutContext>> {
        let partial = parse_metadata(&subscription.metadata);

        let business_id = match partial.business_id {
            Some(id) => Some(id),
            None => {
                self.customer
                    .business_for_customer(&customer_id_of(subscription))
                    .await?
            }
        };

        let (Some(business_id), Some(region_id), Some(category_id), Some(slot)) =
            (business_id, partial.region_id, partial.category_id, partial.slot)
        else {
            return Ok(None);
        };

        Ok(Some(CheckoutContext {
            business_id,
            region_id,
            category_id,
            slot,
            lock_id: partial.lock_id,
        }))
    }

    /// Conflict rollback: cancel the Stripe subscription, mark any ledger
    /// row for it canceled, release the lock, and record the outcome.
    async fn cancel_conflicting(
        &self,
        ctx: &CheckoutContext,
        subscription_id: &str,
        event_id: &str,
        reason: &'static str,
    ) -> BillingResult<ReconcileOutcome> {
        self.cancel_subscription_best_effort(subscription_id).await;
        self.ledger.mark_canceled(subscription_id).await?;
        self.release_lock(ctx.lock_id).await;

        self.log_event(
            BillingEventBuilder::new(ctx.business_id, BillingEventType::ReconcileConflict)
                .data(serde_json::json!({
                    "reason": reason,
                    "region_id": ctx.region_id,
                    "category_id": ctx.category_id,
                    "slot": ctx.slot,
                }))
                .stripe_event(event_id)
                .stripe_subscription(subscription_id.to_string())
                .actor_type(ActorType::Stripe),
        )
        .await;

        tracing::warn!(
            business_id = %ctx.business_id,
            region_id = %ctx.region_id,
            slot = ctx.slot,
            subscription_id = %subscription_id,
            reason = reason,
            "Subscription canceled by reconciler"
        );

        Ok(ReconcileOutcome::Canceled { reason })
    }

    /// Best-effort Stripe-side cancellation with bounded backoff. A failure
    /// here must not fail the triggering event; the audit log is the
    /// fallback for manual cleanup.
    async fn cancel_subscription_best_effort(&self, subscription_id: &str) {
        let parsed: SubscriptionId = match subscription_id.parse() {
            Ok(id) => id,
            Err(_) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    "Unparseable subscription id, cannot cancel on Stripe"
                );
                return;
            }
        };

        let strategy = tokio_retry::strategy::ExponentialBackoff::from_millis(200)
            .factor(2)
            .take(3);

        let result = tokio_retry::Retry::spawn(strategy, || async {
            Subscription::cancel(
                self.stripe.inner(),
                &parsed,
                stripe::CancelSubscription::default(),
            )
            .await
        })
        .await;

        match result {
            Ok(_) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Stripe subscription canceled"
                );
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "MANUAL CLEANUP NEEDED: failed to cancel Stripe subscription after retries"
                );
            }
        }
    }

    async fn release_lock(&self, lock_id: Option<Uuid>) {
        if let Some(lock_id) = lock_id {
            if let Err(e) = self.locks.release(lock_id).await {
                tracing::error!(
                    lock_id = %lock_id,
                    error = %e,
                    "Failed to release checkout lock"
                );
            }
        }
    }

    async fn log_event(&self, builder: BillingEventBuilder) {
        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log billing event");
        }
    }
}

fn extract_subscription(event: &Event) -> BillingResult<Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<stripe::Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn customer_id_of(subscription: &Subscription) -> String {
    match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    }
}
