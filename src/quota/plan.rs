use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub daily: u32,
    pub period: u32,
}

/// Subscription tier, resolved once from the entitlement's product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Weekly,
    Monthly,
    Yearly,
}

impl PlanTier {
    pub fn limits(self) -> PlanLimits {
        match self {
            PlanTier::Free => PlanLimits { daily: 0, period: 0 },
            PlanTier::Weekly => PlanLimits { daily: 15, period: 60 },
            PlanTier::Monthly => PlanLimits { daily: 20, period: 300 },
            PlanTier::Yearly => PlanLimits { daily: 30, period: 4000 },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Weekly => "weekly",
            PlanTier::Monthly => "monthly",
            PlanTier::Yearly => "yearly",
        }
    }
}

/// Product id → tier lookup.
///
/// Explicit ids always win. Unknown ids fall back to the billing-period token
/// in the id (`week`, `month`, `year`/`annual`), and anything else is `Free`.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    explicit: HashMap<String, PlanTier>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let explicit = [
            ("pro_weekly", PlanTier::Weekly),
            ("pro_monthly", PlanTier::Monthly),
            ("pro_yearly", PlanTier::Yearly),
            ("premium_weekly", PlanTier::Weekly),
            ("premium_monthly", PlanTier::Monthly),
            ("premium_annual", PlanTier::Yearly),
        ]
        .into_iter()
        .map(|(id, tier)| (id.to_string(), tier))
        .collect();
        Self { explicit }
    }
}

impl PlanCatalog {
    pub fn empty() -> Self {
        Self {
            explicit: HashMap::new(),
        }
    }

    pub fn with_product(mut self, product_id: &str, tier: PlanTier) -> Self {
        self.explicit.insert(product_id.to_ascii_lowercase(), tier);
        self
    }

    pub fn resolve(&self, product_id: Option<&str>) -> PlanTier {
        let Some(product_id) = product_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return PlanTier::Free;
        };
        let normalized = product_id.to_ascii_lowercase();
        if let Some(tier) = self.explicit.get(&normalized) {
            return *tier;
        }
        if normalized.contains("week") {
            PlanTier::Weekly
        } else if normalized.contains("month") {
            PlanTier::Monthly
        } else if normalized.contains("year") || normalized.contains("annual") {
            PlanTier::Yearly
        } else {
            PlanTier::Free
        }
    }
}
