//! Compensation plan constants
//!
//! Per-rank prices and percentages plus the level table. The standard plan
//! is what production runs; tests build their own where they need to.

use serde::Serialize;

use crate::income::ranks::Rank;
use crate::types::{Amount, BasisPoints, Result, UplineError};

/// Number of upline levels paid level income
pub const LEVEL_DEPTH: usize = 6;

/// Default number of heap ancestors paid global income
pub const GLOBAL_DEPTH: u32 = 3;

/// Economics of a single rank
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankTier {
    pub rank: Rank,
    /// Activation price
    pub price: Amount,
    /// Paid to the direct sponsor
    pub referral: BasisPoints,
    /// Paid to each global-cycle ancestor
    pub global: BasisPoints,
    /// Added to the rank's pool bucket
    pub pool: BasisPoints,
    /// Active direct referrals needed to release locked global/pool income
    pub unlock_referrals: u32,
}

/// Full compensation plan
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomePlan {
    pub tiers: Vec<RankTier>,
    /// Level income for upline levels 1..=LEVEL_DEPTH
    pub levels: [BasisPoints; LEVEL_DEPTH],
    pub global_depth: u32,
}

impl IncomePlan {
    /// The production plan
    pub fn standard() -> Self {
        let tier = |rank: Rank, price_units: i64, unlock_referrals: u32| RankTier {
            rank,
            price: Amount::from_units(price_units),
            referral: BasisPoints::percent(25),
            global: BasisPoints::percent(5),
            pool: BasisPoints::percent(5),
            unlock_referrals,
        };

        Self {
            tiers: vec![
                tier(Rank::Azurite, 10, 2),
                tier(Rank::Benitoite, 20, 2),
                tier(Rank::Crystals, 40, 3),
                tier(Rank::Diamond, 80, 3),
                tier(Rank::Emerald, 160, 4),
                tier(Rank::Feldspar, 320, 4),
            ],
            levels: [
                BasisPoints::percent(10),
                BasisPoints::percent(5),
                BasisPoints::percent(3),
                BasisPoints::percent(2),
                BasisPoints::percent(1),
                BasisPoints::percent(1),
            ],
            global_depth: GLOBAL_DEPTH,
        }
    }

    /// Tier definition for a rank
    pub fn tier(&self, rank: Rank) -> Result<&RankTier> {
        self.tiers
            .iter()
            .find(|t| t.rank == rank)
            .ok_or_else(|| UplineError::Config(format!("No plan tier for rank {rank}")))
    }

    /// Level income percentage for a 1-based upline level
    pub fn level(&self, level: usize) -> Option<BasisPoints> {
        level.checked_sub(1).and_then(|i| self.levels.get(i)).copied()
    }

    /// Total share of an activation paid out for a rank
    pub fn payout_share(&self, rank: Rank) -> Result<BasisPoints> {
        let tier = self.tier(rank)?;
        let levels: u32 = self.levels.iter().map(|b| b.value()).sum();
        Ok(BasisPoints(
            tier.referral.value() + levels + tier.global.value() * self.global_depth + tier.pool.value(),
        ))
    }

    /// Reject plans that pay out more than an activation brings in
    pub fn validate(&self) -> Result<()> {
        for rank in Rank::ALL {
            let tier = self.tier(rank)?;
            if !tier.price.is_positive() {
                return Err(UplineError::Config(format!("Rank {rank} has no price")));
            }
            let share = self.payout_share(rank)?;
            if share > BasisPoints::FULL {
                return Err(UplineError::Config(format!(
                    "Rank {rank} pays out {share}, more than 100%"
                )));
            }
        }
        Ok(())
    }
}

impl Default for IncomePlan {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_plan_is_valid() {
        let plan = IncomePlan::standard();
        plan.validate().unwrap();
        // 25 + 22 + 3*5 + 5
        assert_eq!(plan.payout_share(Rank::Azurite).unwrap(), BasisPoints::percent(67));
    }

    #[test]
    fn test_prices_double() {
        let plan = IncomePlan::standard();
        let prices: Vec<i64> = Rank::ALL
            .iter()
            .map(|r| plan.tier(*r).unwrap().price.cents())
            .collect();
        assert_eq!(prices, vec![1000, 2000, 4000, 8000, 16000, 32000]);
    }

    #[test]
    fn test_level_lookup_is_one_based() {
        let plan = IncomePlan::standard();
        assert_eq!(plan.level(0), None);
        assert_eq!(plan.level(1), Some(BasisPoints::percent(10)));
        assert_eq!(plan.level(6), Some(BasisPoints::percent(1)));
        assert_eq!(plan.level(7), None);
    }

    #[test]
    fn test_overpaying_plan_rejected() {
        let mut plan = IncomePlan::standard();
        plan.tiers[2].referral = BasisPoints::percent(90);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_missing_tier_rejected() {
        let mut plan = IncomePlan::standard();
        plan.tiers.pop();
        assert!(matches!(plan.validate(), Err(UplineError::Config(_))));
    }
}
