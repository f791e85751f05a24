//! Tier Catalog
//!
//! The flat-fee accounting tiers, keyed by monthly transaction volume.
//! The catalog is built once and shared read-only; tests can build their own.

use serde::{Deserialize, Serialize};

/// A pricing tier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    /// Stable identifier, also used as the Stripe price lookup key
    pub id: String,
    pub name: String,
    pub description: String,
    pub tagline: String,

    /// Monthly price in cents
    pub monthly_price: i64,

    /// Human-readable band, e.g. "50–100"
    pub transaction_range: String,
    pub transaction_min: u32,
    pub transaction_max: u32,

    pub features: Vec<String>,

    #[serde(default)]
    pub recommended: bool,
}

impl Tier {
    /// Whether a monthly transaction count falls inside this tier's band
    pub const fn covers(&self, transactions: u32) -> bool {
        transactions >= self.transaction_min && transactions <= self.transaction_max
    }
}

/// Immutable list of tiers
#[derive(Clone, Debug)]
pub struct TierCatalog {
    tiers: Vec<Tier>,
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl TierCatalog {
    /// Build a catalog from an explicit tier list.
    ///
    /// Later duplicates of an id are dropped so lookups stay unambiguous.
    pub fn new(tiers: Vec<Tier>) -> Self {
        let mut unique: Vec<Tier> = Vec::with_capacity(tiers.len());
        for tier in tiers {
            if unique.iter().any(|t| t.id == tier.id) {
                tracing::warn!(tier_id = %tier.id, "Duplicate tier id ignored");
                continue;
            }
            unique.push(tier);
        }
        Self { tiers: unique }
    }

    /// The published tiers
    pub fn standard() -> Self {
        Self::new(vec![
            tier(
                "startups",
                "Startups",
                "Perfect for early-stage businesses getting their financials in order",
                "Bookkeeping built for founders who focus on growth",
                25_000, // $250
                (50, 100),
                false,
                &[
                    "Invoice Customers / Generate Donation Receipts",
                    "Pay Bills & Attach Receipts",
                    "Reimburse Expenses",
                    "Reconcile Bank & Credit Cards",
                    "View Monthly Financial Statements",
                    "Forecast Financial Flow Dashboard",
                    "Monthly QBO Financial Statements",
                    "Interactive Dashboard Access",
                ],
            ),
            tier(
                "emerging-growth",
                "Emerging Growth",
                "For growing businesses ready to scale without complexity",
                "Scale without scaling complexity",
                50_000, // $500
                (100, 300),
                true,
                &[
                    "All Startups tier features",
                    "Priority support response",
                    "Quarterly financial review calls",
                    "Custom reporting templates",
                    "Multi-entity support (up to 2)",
                    "Advanced forecasting tools",
                ],
            ),
            tier(
                "scale",
                "Scale",
                "Enterprise-grade financials with transparent pricing",
                "Enterprise-grade financials, transparent pricing",
                100_000, // $1,000
                (300, 600),
                false,
                &[
                    "All Emerging Growth tier features",
                    "Dedicated account manager",
                    "Monthly strategic planning sessions",
                    "Custom workflow automation",
                    "Multi-entity support (up to 5)",
                    "CFO-level advisory services",
                    "Tax planning consultation",
                ],
            ),
            tier(
                "enterprise",
                "Enterprise",
                "Dedicated financial infrastructure for serious businesses",
                "Dedicated financial infrastructure for serious businesses",
                250_000, // $2,500
                (600, 1200),
                false,
                &[
                    "All Scale tier features",
                    "White-glove onboarding",
                    "Unlimited multi-entity support",
                    "Custom integration development",
                    "Weekly strategic advisory calls",
                    "Board-ready financial packages",
                    "Audit preparation support",
                    "Dedicated team (bookkeeper + advisor)",
                ],
            ),
        ])
    }

    /// Look up a tier by id
    pub fn get(&self, id: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// First tier whose transaction band contains `transactions`
    pub fn for_transaction_count(&self, transactions: u32) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.covers(transactions))
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[allow(clippy::too_many_arguments)]
fn tier(
    id: &str,
    name: &str,
    description: &str,
    tagline: &str,
    monthly_price: i64,
    (min, max): (u32, u32),
    recommended: bool,
    features: &[&str],
) -> Tier {
    Tier {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        tagline: tagline.into(),
        monthly_price,
        transaction_range: format!("{min}–{}", group_thousands(max)),
        transaction_min: min,
        transaction_max: max,
        features: features.iter().map(|f| (*f).to_string()).collect(),
        recommended,
    }
}

fn group_thousands(n: u32) -> String {
    if n < 1000 {
        n.to_string()
    } else {
        format!("{},{:03}", n / 1000, n % 1000)
    }
}
