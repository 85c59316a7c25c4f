//! Core domain types shared across crates

use serde::{Deserialize, Serialize};

/// Lifecycle of a sponsorship claim.
///
/// Any status in the "active-like" set counts as a live, geometry-blocking
/// claim. `Canceling` stays active-like: the business has paid through the
/// current period, so its geometry remains reserved until period end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SponsorshipStatus {
    /// Checkout session created, not yet confirmed by the billing provider.
    Provisional,
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Incomplete,
    Paused,
    /// Cancellation scheduled at period end; still blocks competitors.
    Canceling,
    /// Terminal. Geometry released.
    Canceled,
}

/// Statuses that block competitors, in SQL-literal form.
///
/// Must stay in sync with the `NOT IN ('canceled', 'provisional')` predicates
/// in the schema's partial indexes and constraint trigger.
pub const ACTIVE_LIKE_STATUSES: &[SponsorshipStatus] = &[
    SponsorshipStatus::Active,
    SponsorshipStatus::Trialing,
    SponsorshipStatus::PastDue,
    SponsorshipStatus::Unpaid,
    SponsorshipStatus::Incomplete,
    SponsorshipStatus::Paused,
    SponsorshipStatus::Canceling,
];

impl SponsorshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SponsorshipStatus::Provisional => "provisional",
            SponsorshipStatus::Active => "active",
            SponsorshipStatus::Trialing => "trialing",
            SponsorshipStatus::PastDue => "past_due",
            SponsorshipStatus::Unpaid => "unpaid",
            SponsorshipStatus::Incomplete => "incomplete",
            SponsorshipStatus::Paused => "paused",
            SponsorshipStatus::Canceling => "canceling",
            SponsorshipStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisional" => Some(SponsorshipStatus::Provisional),
            "active" => Some(SponsorshipStatus::Active),
            "trialing" => Some(SponsorshipStatus::Trialing),
            "past_due" => Some(SponsorshipStatus::PastDue),
            "unpaid" => Some(SponsorshipStatus::Unpaid),
            "incomplete" => Some(SponsorshipStatus::Incomplete),
            "paused" => Some(SponsorshipStatus::Paused),
            "canceling" => Some(SponsorshipStatus::Canceling),
            "canceled" => Some(SponsorshipStatus::Canceled),
            _ => None,
        }
    }

    /// True when the status counts as a live claim on geometry.
    pub fn is_active_like(&self) -> bool {
        !matches!(
            self,
            SponsorshipStatus::Provisional | SponsorshipStatus::Canceled
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SponsorshipStatus::Canceled)
    }
}

impl std::fmt::Display for SponsorshipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_like_set() {
        assert!(SponsorshipStatus::Active.is_active_like());
        assert!(SponsorshipStatus::Canceling.is_active_like());
        assert!(SponsorshipStatus::PastDue.is_active_like());
        assert!(!SponsorshipStatus::Provisional.is_active_like());
        assert!(!SponsorshipStatus::Canceled.is_active_like());
        assert_eq!(ACTIVE_LIKE_STATUSES.len(), 7);
        assert!(ACTIVE_LIKE_STATUSES.iter().all(|s| s.is_active_like()));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            SponsorshipStatus::Provisional,
            SponsorshipStatus::Active,
            SponsorshipStatus::Trialing,
            SponsorshipStatus::PastDue,
            SponsorshipStatus::Unpaid,
            SponsorshipStatus::Incomplete,
            SponsorshipStatus::Paused,
            SponsorshipStatus::Canceling,
            SponsorshipStatus::Canceled,
        ] {
            assert_eq!(SponsorshipStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SponsorshipStatus::parse("bogus"), None);
    }
}
