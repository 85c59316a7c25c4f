//! User-initiated subscription actions
//!
//! A user cancel only schedules cancellation at the current period's end:
//! the geometry stays reserved and exclusive until the paid period actually
//! ends, and the business can change its mind before then. Hard cancels
//! (conflict rollback) live in the reconciler, not here.

use sqlx::PgPool;
use stripe::{SubscriptionId, UpdateSubscription};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{Sponsorship, SponsorshipLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    Cancel,
    Reactivate,
}

impl CancelAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancel" => Some(CancelAction::Cancel),
            "reactivate" => Some(CancelAction::Reactivate),
            _ => None,
        }
    }
}

/// Result of a cancel/reactivate toggle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancelToggleResult {
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<time::OffsetDateTime>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    ledger: SponsorshipLedger,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            stripe,
            ledger: SponsorshipLedger::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool),
        }
    }

    /// Toggle cancel-at-period-end for the business's placement.
    ///
    /// The ledger flips `active <-> canceling` first, then the flag is synced
    /// to Stripe on the same subscription. A Stripe failure rolls the ledger
    /// back so the two never disagree in the blocking direction.
    pub async fn toggle_cancel_at_period_end(
        &self,
        business_id: Uuid,
        region_id: Uuid,
        slot: i32,
        action: CancelAction,
    ) -> BillingResult<CancelToggleResult> {
        let cancel = action == CancelAction::Cancel;

        let row = self
            .ledger
            .set_cancel_at_period_end(business_id, region_id, slot, cancel)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "no active sponsorship for business {business_id} in region {region_id} slot {slot}"
                ))
            })?;

        if let Err(e) = self.sync_flag_to_stripe(&row, cancel).await {
            tracing::error!(
                business_id = %business_id,
                subscription_id = %row.stripe_subscription_id,
                error = %e,
                "Failed to sync cancel flag to Stripe, rolling back ledger"
            );
            self.ledger
                .set_cancel_at_period_end(business_id, region_id, slot, !cancel)
                .await?;
            return Err(e);
        }

        let (event_type, status) = if cancel {
            (BillingEventType::CancelScheduled, "canceling")
        } else {
            (BillingEventType::CancelReverted, "active")
        };

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(business_id, event_type)
                    .data(serde_json::json!({
                        "region_id": region_id,
                        "slot": slot,
                        "current_period_end": row.current_period_end.map(|t| t.to_string()),
                    }))
                    .stripe_subscription(row.stripe_subscription_id.clone())
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log cancel toggle event");
        }

        tracing::info!(
            business_id = %business_id,
            region_id = %region_id,
            slot = slot,
            cancel_at_period_end = cancel,
            "Sponsorship cancel flag toggled"
        );

        Ok(CancelToggleResult {
            status: status.to_string(),
            cancel_at_period_end: cancel,
            current_period_end: row.current_period_end,
        })
    }

    async fn sync_flag_to_stripe(&self, row: &Sponsorship, cancel: bool) -> BillingResult<()> {
        let subscription_id: SubscriptionId = row.stripe_subscription_id.parse().map_err(|_| {
            BillingError::SubscriptionNotFound(row.stripe_subscription_id.clone())
        })?;

        stripe::Subscription::update(
            self.stripe.inner(),
            &subscription_id,
            UpdateSubscription {
                cancel_at_period_end: Some(cancel),
                ..Default::default()
            },
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_action_parse() {
        assert_eq!(CancelAction::parse("cancel"), Some(CancelAction::Cancel));
        assert_eq!(
            CancelAction::parse("reactivate"),
            Some(CancelAction::Reactivate)
        );
        assert_eq!(CancelAction::parse("delete"), None);
    }
}
