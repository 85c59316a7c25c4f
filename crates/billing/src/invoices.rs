//! Invoice records
//!
//! Billing-cycle records linked to a sponsorship, upserted from Stripe
//! invoice lifecycle events and keyed by the external invoice id. An invoice
//! has its own lifecycle: it persists after the sponsorship is canceled.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of an invoice upsert. `sponsorship_id` is None when the invoice
/// arrived before the subscription-confirmation event created the row; the
/// caller backfills and retries the link.
#[derive(Debug, Clone)]
pub struct InvoiceLink {
    pub invoice_id: Uuid,
    pub sponsorship_id: Option<Uuid>,
    pub business_id: Option<Uuid>,
}

/// Fields extracted from a Stripe invoice, already unwrapped from the SDK's
/// optional-everything shape.
#[derive(Debug, Clone)]
pub struct InvoiceUpsert {
    pub stripe_invoice_id: String,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub amount_due_pence: i64,
    pub amount_paid_pence: i64,
    pub currency: String,
    pub status: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
}

impl InvoiceUpsert {
    pub fn from_stripe(invoice: &stripe::Invoice, status: &str) -> Self {
        let stripe_subscription_id = match &invoice.subscription {
            Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
            Some(stripe::Expandable::Object(s)) => Some(s.id.to_string()),
            None => None,
        };
        let stripe_customer_id = match &invoice.customer {
            Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
            Some(stripe::Expandable::Object(c)) => Some(c.id.to_string()),
            None => None,
        };

        Self {
            stripe_invoice_id: invoice.id.to_string(),
            stripe_subscription_id,
            stripe_customer_id,
            amount_due_pence: invoice.amount_due.unwrap_or(0),
            amount_paid_pence: invoice.amount_paid.unwrap_or(0),
            currency: invoice
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "gbp".to_string()),
            status: status.to_string(),
            period_start: invoice
                .period_start
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
            period_end: invoice
                .period_end
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
            hosted_invoice_url: invoice.hosted_invoice_url.clone(),
            invoice_pdf_url: invoice.invoice_pdf.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InvoiceService {
    pool: PgPool,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the record, resolving the sponsorship and business links from
    /// the subscription id (preferred) or customer id. Replaying the same
    /// event is a no-op beyond refreshing status fields.
    pub async fn upsert(&self, upsert: &InvoiceUpsert) -> BillingResult<InvoiceLink> {
        let row: (Uuid, Option<Uuid>, Option<Uuid>) = sqlx::query_as(
            r#"
            INSERT INTO invoices
                (business_id, sponsorship_id, stripe_invoice_id,
                 amount_due_pence, amount_paid_pence, currency, status,
                 period_start, period_end, hosted_invoice_url, invoice_pdf_url)
            SELECT
                COALESCE(s.business_id, b.id),
                s.id,
                $1, $2, $3, $4, $5, $6, $7, $8, $9
            FROM (SELECT 1) AS one
            LEFT JOIN sponsorships s ON s.stripe_subscription_id = $10
            LEFT JOIN businesses b ON b.stripe_customer_id = $11
            ON CONFLICT (stripe_invoice_id) DO UPDATE SET
                status = EXCLUDED.status,
                amount_due_pence = EXCLUDED.amount_due_pence,
                amount_paid_pence = EXCLUDED.amount_paid_pence,
                sponsorship_id = COALESCE(invoices.sponsorship_id, EXCLUDED.sponsorship_id),
                business_id = COALESCE(invoices.business_id, EXCLUDED.business_id),
                hosted_invoice_url = COALESCE(EXCLUDED.hosted_invoice_url, invoices.hosted_invoice_url),
                invoice_pdf_url = COALESCE(EXCLUDED.invoice_pdf_url, invoices.invoice_pdf_url),
                updated_at = NOW()
            RETURNING id, sponsorship_id, business_id
            "#,
        )
        .bind(&upsert.stripe_invoice_id)
        .bind(upsert.amount_due_pence)
        .bind(upsert.amount_paid_pence)
        .bind(&upsert.currency)
        .bind(&upsert.status)
        .bind(upsert.period_start)
        .bind(upsert.period_end)
        .bind(&upsert.hosted_invoice_url)
        .bind(&upsert.invoice_pdf_url)
        .bind(&upsert.stripe_subscription_id)
        .bind(&upsert.stripe_customer_id)
        .fetch_one(&self.pool)
        .await?;

        let (invoice_id, sponsorship_id, business_id) = row;

        tracing::debug!(
            invoice_id = %invoice_id,
            stripe_invoice_id = %upsert.stripe_invoice_id,
            status = %upsert.status,
            linked = sponsorship_id.is_some(),
            "Invoice upserted"
        );

        Ok(InvoiceLink {
            invoice_id,
            sponsorship_id,
            business_id,
        })
    }
}
