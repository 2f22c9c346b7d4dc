//! Admission control for billable jobs, keyed per user.
//!
//! Counters are read-modify-written without locking: two generations finishing
//! at the same moment for one user may be counted once.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::storage::{
    Entitlement, EntitlementProvider, StorageResult, UsageRecord, UsageStore,
};

pub mod plan;

pub use plan::{PlanCatalog, PlanLimits, PlanTier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaRejection {
    NoCredits,
    DailyLimitReached { limit: u32 },
    PeriodLimitReached { limit: u32 },
    UnableToVerify,
}

impl fmt::Display for QuotaRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaRejection::NoCredits => {
                write!(f, "No credits available. Upgrade your plan to generate images.")
            }
            QuotaRejection::DailyLimitReached { limit } => write!(
                f,
                "Daily limit of {limit} generations reached. Try again tomorrow."
            ),
            QuotaRejection::PeriodLimitReached { limit } => write!(
                f,
                "All {limit} generations of your current plan period are used. They renew with your subscription."
            ),
            QuotaRejection::UnableToVerify => {
                write!(f, "Unable to verify your usage right now. Please try again.")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<QuotaRejection>,
    pub tier: PlanTier,
    pub daily_used: u32,
    pub daily_limit: u32,
    pub period_used: u32,
    pub period_limit: u32,
}

impl QuotaDecision {
    fn unverified() -> Self {
        Self {
            allowed: false,
            reason: Some(QuotaRejection::UnableToVerify),
            tier: PlanTier::Free,
            daily_used: 0,
            daily_limit: 0,
            period_used: 0,
            period_limit: 0,
        }
    }

    pub fn remaining_today(&self) -> u32 {
        self.daily_limit.saturating_sub(self.daily_used)
    }
}

/// Counters after lazy resets, plus what they were resolved against.
struct UsageSnapshot {
    record: UsageRecord,
    existed: bool,
    reset_applied: bool,
    entitlement: Option<Entitlement>,
    tier: PlanTier,
}

/// Zeroes the daily counter on a new calendar day (UTC) and the period counter
/// once the stored period end has passed. Returns whether anything changed.
pub fn apply_resets(record: &mut UsageRecord, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    let today = now.date_naive();
    if record.last_reset_date != today {
        record.daily_count = 0;
        record.last_reset_date = today;
        changed = true;
    }
    if record.period_end.is_some_and(|end| end <= now) {
        record.period_count = 0;
        record.period_end = None;
        changed = true;
    }
    changed
}

pub fn decide(record: &UsageRecord, tier: PlanTier) -> QuotaDecision {
    let limits = tier.limits();
    let reason = if limits.daily == 0 || limits.period == 0 {
        Some(QuotaRejection::NoCredits)
    } else if record.daily_count >= limits.daily {
        Some(QuotaRejection::DailyLimitReached {
            limit: limits.daily,
        })
    } else if record.period_count >= limits.period {
        Some(QuotaRejection::PeriodLimitReached {
            limit: limits.period,
        })
    } else {
        None
    };

    QuotaDecision {
        allowed: reason.is_none(),
        reason,
        tier,
        daily_used: record.daily_count,
        daily_limit: limits.daily,
        period_used: record.period_count,
        period_limit: limits.period,
    }
}

#[derive(Clone)]
pub struct UsageQuotaGate {
    usage: Arc<dyn UsageStore>,
    entitlements: Arc<dyn EntitlementProvider>,
    catalog: PlanCatalog,
}

impl UsageQuotaGate {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        entitlements: Arc<dyn EntitlementProvider>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            usage,
            entitlements,
            catalog,
        }
    }

    pub async fn can_generate(&self, user_id: &str) -> QuotaDecision {
        self.can_generate_at(user_id, Utc::now()).await
    }

    /// Admission check. A storage failure rejects rather than letting the
    /// request through.
    pub async fn can_generate_at(&self, user_id: &str, now: DateTime<Utc>) -> QuotaDecision {
        let snapshot = match self.load(user_id, now).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    operation = "can_generate",
                    user_id,
                    error = %err,
                    "usage or entitlement lookup failed"
                );
                return QuotaDecision::unverified();
            }
        };

        if snapshot.existed && snapshot.reset_applied {
            if let Err(err) = self.usage.upsert_usage(&snapshot.record).await {
                warn!(
                    operation = "persist_reset",
                    collaborator = "usage_store",
                    user_id,
                    error = %err,
                    "failed to persist usage reset"
                );
            }
        }

        let decision = decide(&snapshot.record, snapshot.tier);
        debug!(
            user_id,
            tier = decision.tier.as_str(),
            allowed = decision.allowed,
            daily_used = decision.daily_used,
            period_used = decision.period_used,
            "quota decision"
        );
        decision
    }

    pub async fn increment_usage(&self, user_id: &str) -> StorageResult<UsageRecord> {
        self.increment_usage_at(user_id, Utc::now()).await
    }

    /// Counts one successful generation against both counters.
    pub async fn increment_usage_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<UsageRecord> {
        let UsageSnapshot {
            mut record,
            entitlement,
            ..
        } = self.load(user_id, now).await?;

        record.daily_count = record.daily_count.saturating_add(1);
        record.period_count = record.period_count.saturating_add(1);
        if let Some(entitlement) = entitlement {
            if entitlement.expires_at.is_some() {
                record.period_end = entitlement.expires_at;
            }
            record.plan_id = Some(entitlement.product_id);
        }

        self.usage.upsert_usage(&record).await?;
        Ok(record)
    }

    async fn load(&self, user_id: &str, now: DateTime<Utc>) -> StorageResult<UsageSnapshot> {
        let stored = self.usage.get_usage(user_id).await?;
        let existed = stored.is_some();
        let mut record = stored.unwrap_or_else(|| UsageRecord::empty(user_id, now.date_naive()));

        // an unreadable entitlement rejects; the stored plan_id is not a fallback
        let entitlement = self.entitlements.active_entitlement(user_id).await?;
        let product_id = entitlement.as_ref().map(|e| e.product_id.clone());
        let tier = self.catalog.resolve(product_id.as_deref());
        let reset_applied = apply_resets(&mut record, now);

        Ok(UsageSnapshot {
            record,
            existed,
            reset_applied,
            entitlement,
            tier,
        })
    }
}
