//! Income and income-pool document schemas
//!
//! `IncomeDoc` is the commission ledger. Global and pool income that lands
//! behind the direct-referral gate also gets an `IncomePoolDoc`, which is
//! what a claim releases.

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;
use crate::income::Rank;
use crate::types::{new_id, Amount};

/// Collection name for incomes
pub const INCOME_COLLECTION: &str = "incomes";

/// Collection name for lock-gated income entries
pub const INCOME_POOL_COLLECTION: &str = "income_pools";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IncomeKind {
    /// Direct sponsor commission
    Referral,
    /// Upline commission by level
    Level,
    /// Global-cycle ancestor commission
    Global,
    /// Share of a rank pool
    Pool,
}

impl IncomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IncomeKind::Referral => "referral",
            IncomeKind::Level => "level",
            IncomeKind::Global => "global",
            IncomeKind::Pool => "pool",
        }
    }

    /// Kinds that are held behind the direct-referral gate
    pub fn is_gated(self) -> bool {
        matches!(self, IncomeKind::Global | IncomeKind::Pool)
    }
}

impl fmt::Display for IncomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "referral" => Ok(IncomeKind::Referral),
            "level" => Ok(IncomeKind::Level),
            "global" => Ok(IncomeKind::Global),
            "pool" => Ok(IncomeKind::Pool),
            other => Err(format!("unknown income kind: {other}")),
        }
    }
}

/// Commission record
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IncomeDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub recipient_id: String,

    /// Member whose activation produced this income (None for pool shares)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    pub kind: IncomeKind,

    /// Upline level for level income, heap distance for global income
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,

    pub rank: Rank,

    pub amount: Amount,

    /// Credited to the locked balance
    #[serde(default)]
    pub locked: bool,
}

impl IncomeDoc {
    pub fn new(recipient_id: &str, kind: IncomeKind, rank: Rank, amount: Amount, locked: bool) -> Self {
        Self {
            id: new_id(),
            metadata: Metadata::new(),
            recipient_id: recipient_id.to_string(),
            source_user_id: None,
            transaction_id: None,
            kind,
            level: None,
            rank,
            amount,
            locked,
        }
    }

    pub fn from_activation(mut self, source_user_id: &str, transaction_id: &str) -> Self {
        self.source_user_id = Some(source_user_id.to_string());
        self.transaction_id = Some(transaction_id.to_string());
        self
    }

    pub fn at_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }
}

impl IntoIndexes for IncomeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "recipient_id": 1, "kind": 1, "metadata.created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("recipient_kind_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "transaction_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("transaction_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
        ]
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolEntryStatus {
    #[default]
    Locked,
    Claimed,
}

/// Lock-gated income entry
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IncomePoolDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub user_id: String,

    /// The income record this entry holds back
    pub income_id: String,

    pub rank: Rank,

    pub kind: IncomeKind,

    pub amount: Amount,

    /// Active direct referrals needed before the entry can be claimed
    pub required_referrals: u32,

    #[serde(default)]
    pub status: PoolEntryStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime>,
}

impl IncomePoolDoc {
    /// Lock entry for an income credited to the locked balance
    pub fn lock(income: &IncomeDoc, required_referrals: u32) -> Self {
        Self {
            id: new_id(),
            metadata: Metadata::new(),
            user_id: income.recipient_id.clone(),
            income_id: income.id.clone(),
            rank: income.rank,
            kind: income.kind,
            amount: income.amount,
            required_referrals,
            status: PoolEntryStatus::Locked,
            claimed_at: None,
        }
    }

    /// Whether a member with `active_directs` may claim this entry
    pub fn is_claimable_with(&self, active_directs: u32) -> bool {
        self.status == PoolEntryStatus::Locked && active_directs >= self.required_referrals
    }
}

impl IntoIndexes for IncomePoolDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "user_id": 1, "status": 1 },
            Some(
                IndexOptions::builder()
                    .name("user_status_index".to_string())
                    .build(),
            ),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_gate() {
        let income = IncomeDoc::new("u1", IncomeKind::Pool, Rank::Crystals, Amount::from_units(4), true);
        let mut entry = IncomePoolDoc::lock(&income, 3);

        assert!(!entry.is_claimable_with(2));
        assert!(entry.is_claimable_with(3));

        entry.status = PoolEntryStatus::Claimed;
        assert!(!entry.is_claimable_with(10));
    }

    #[test]
    fn test_gated_kinds() {
        assert!(IncomeKind::Global.is_gated());
        assert!(IncomeKind::Pool.is_gated());
        assert!(!IncomeKind::Referral.is_gated());
        assert!(!IncomeKind::Level.is_gated());
    }
}
