//! Billing event audit log
//!
//! Every billing mutation and reconciler outcome is recorded in
//! `billing_events`. Webhook-driven cancellations are not user-facing in the
//! moment, so this trail is what an operator audits after the fact.
//! Logging failures are warned about and never propagated.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    CheckoutSessionCreated,
    SponsorshipConfirmed,
    SponsorshipUpdated,
    SponsorshipCanceled,
    CancelScheduled,
    CancelReverted,
    ReconcileSkipped,
    ReconcileConflict,
    InvoiceFinalized,
    InvoicePaid,
    InvoiceFailed,
    InvoiceVoided,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::CheckoutSessionCreated => "checkout_session_created",
            BillingEventType::SponsorshipConfirmed => "sponsorship_confirmed",
            BillingEventType::SponsorshipUpdated => "sponsorship_updated",
            BillingEventType::SponsorshipCanceled => "sponsorship_canceled",
            BillingEventType::CancelScheduled => "cancel_scheduled",
            BillingEventType::CancelReverted => "cancel_reverted",
            BillingEventType::ReconcileSkipped => "reconcile_skipped",
            BillingEventType::ReconcileConflict => "reconcile_conflict",
            BillingEventType::InvoiceFinalized => "invoice_finalized",
            BillingEventType::InvoicePaid => "invoice_paid",
            BillingEventType::InvoiceFailed => "invoice_failed",
            BillingEventType::InvoiceVoided => "invoice_voided",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    User,
    Stripe,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Stripe => "stripe",
            ActorType::System => "system",
        }
    }
}

/// Builder for a single audit record.
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    business_id: Option<Uuid>,
    event_type: BillingEventType,
    data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_invoice_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(business_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            business_id: Some(business_id),
            event_type,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_invoice_id: None,
            actor_type: ActorType::System,
        }
    }

    /// For outcomes where no business could be resolved (e.g. skipped events
    /// with incomplete metadata).
    pub fn unattributed(event_type: BillingEventType) -> Self {
        Self {
            business_id: None,
            event_type,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_invoice_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn stripe_event(mut self, id: &str) -> Self {
        self.stripe_event_id = Some(id.to_string());
        self
    }

    pub fn stripe_subscription(mut self, id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(id.into());
        self
    }

    pub fn stripe_invoice(mut self, id: &str) -> Self {
        self.stripe_invoice_id = Some(id.to_string());
        self
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }
}

/// Writes audit records. Cheap to clone, holds only the pool.
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (business_id, event_type, data, stripe_event_id,
                 stripe_subscription_id, stripe_invoice_id, actor_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(builder.business_id)
        .bind(builder.event_type.as_str())
        .bind(&builder.data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_subscription_id)
        .bind(&builder.stripe_invoice_id)
        .bind(builder.actor_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
