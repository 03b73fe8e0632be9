//! User document schema
//!
//! Credentials, sponsor pointer, rank, balances and referral counters.

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::auth::PermissionLevel;
use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;
use crate::income::Rank;
use crate::types::{new_id, Amount};

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// Wallet balances held on the user document
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    /// Spendable and withdrawable
    #[serde(default)]
    pub available: Amount,
    /// Global/pool income waiting on the direct-referral gate
    #[serde(default)]
    pub locked: Amount,
    /// Held for withdrawals that have not completed
    #[serde(default)]
    pub pending: Amount,
    /// Every income ever credited, locked or not
    #[serde(default)]
    pub total_earnings: Amount,
    #[serde(default)]
    pub total_withdrawn: Amount,
}

/// Signed changes to a user's balances, applied atomically
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceDelta {
    pub available: Amount,
    pub locked: Amount,
    pub pending: Amount,
    pub total_earnings: Amount,
    pub total_withdrawn: Amount,
}

impl BalanceDelta {
    pub fn credit_available(amount: Amount) -> Self {
        Self {
            available: amount,
            ..Self::default()
        }
    }

    pub fn debit_available(amount: Amount) -> Self {
        Self {
            available: -amount,
            ..Self::default()
        }
    }

    /// Income credit, either spendable or held behind the referral gate
    pub fn earn(amount: Amount, locked: bool) -> Self {
        if locked {
            Self {
                locked: amount,
                total_earnings: amount,
                ..Self::default()
            }
        } else {
            Self {
                available: amount,
                total_earnings: amount,
                ..Self::default()
            }
        }
    }

    /// Move funds available -> pending for a withdrawal request
    pub fn hold_for_withdrawal(amount: Amount) -> Self {
        Self {
            available: -amount,
            pending: amount,
            ..Self::default()
        }
    }

    /// Move funds pending -> available when a withdrawal is rejected
    pub fn refund_withdrawal(amount: Amount) -> Self {
        Self {
            available: amount,
            pending: -amount,
            ..Self::default()
        }
    }

    /// Drop pending funds once a payout succeeded
    pub fn settle_withdrawal(amount: Amount) -> Self {
        Self {
            pending: -amount,
            total_withdrawn: amount,
            ..Self::default()
        }
    }

    /// Move funds locked -> available
    pub fn release_locked(amount: Amount) -> Self {
        Self {
            available: amount,
            locked: -amount,
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Field name / delta pairs for `$inc` updates
    pub fn fields(&self) -> [(&'static str, Amount); 5] {
        [
            ("available", self.available),
            ("locked", self.locked),
            ("pending", self.pending),
            ("total_earnings", self.total_earnings),
            ("total_withdrawn", self.total_withdrawn),
        ]
    }
}

impl Balances {
    /// Apply a delta, refusing to take any held balance below zero
    pub fn apply(&self, delta: &BalanceDelta) -> Option<Balances> {
        let next = Balances {
            available: self.available.checked_add(delta.available)?,
            locked: self.locked.checked_add(delta.locked)?,
            pending: self.pending.checked_add(delta.pending)?,
            total_earnings: self.total_earnings.checked_add(delta.total_earnings)?,
            total_withdrawn: self.total_withdrawn.checked_add(delta.total_withdrawn)?,
        };
        if next.available.is_negative() || next.locked.is_negative() || next.pending.is_negative() {
            return None;
        }
        Some(next)
    }
}

/// Signed changes to referral counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub direct_referrals: i32,
    pub active_direct_referrals: i32,
    pub team_size: i32,
}

/// User document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    /// Login identifier (email)
    pub identifier: String,

    pub display_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    /// Where payouts are sent unless a withdrawal names another destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_address: Option<String>,

    /// Argon2 password hash
    pub password_hash: String,

    #[serde(default = "default_permission")]
    pub permission_level: PermissionLevel,

    /// Increment to invalidate all issued tokens
    #[serde(default)]
    pub token_version: u32,

    /// False when blocked by an admin
    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Shareable code new members sign up with
    pub referral_code: String,

    #[serde(default)]
    pub sponsor_id: Option<String>,

    /// Highest activated rank, None until the first activation
    #[serde(default)]
    pub rank: Option<Rank>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime>,

    #[serde(default)]
    pub balances: Balances,

    #[serde(default)]
    pub direct_referrals: u32,

    /// Direct referrals that have activated at least one rank
    #[serde(default)]
    pub active_direct_referrals: u32,

    /// Members within the tracked downline depth
    #[serde(default)]
    pub team_size: u32,
}

fn default_permission() -> PermissionLevel {
    PermissionLevel::Member
}

fn default_true() -> bool {
    true
}

impl UserDoc {
    /// Create a new member document
    pub fn new(
        identifier: String,
        display_name: String,
        password_hash: String,
        referral_code: String,
        sponsor_id: Option<String>,
    ) -> Self {
        Self {
            id: new_id(),
            metadata: Metadata::new(),
            identifier,
            display_name,
            phone: None,
            payout_address: None,
            password_hash,
            permission_level: PermissionLevel::Member,
            token_version: 1,
            is_active: true,
            referral_code,
            sponsor_id,
            rank: None,
            activated_at: None,
            balances: Balances::default(),
            direct_referrals: 0,
            active_direct_referrals: 0,
            team_size: 0,
        }
    }

    /// Has activated a rank and is not blocked
    pub fn is_qualified(&self) -> bool {
        self.is_active && self.rank.is_some()
    }

    /// Qualified and holding at least `rank`
    pub fn holds_rank(&self, rank: Rank) -> bool {
        self.is_active && self.rank.is_some_and(|r| r >= rank)
    }

    pub fn is_admin(&self) -> bool {
        self.permission_level >= PermissionLevel::Admin
    }
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "identifier": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("identifier_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "referral_code": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("referral_code_unique".to_string())
                        .build(),
                ),
            ),
            // Downline walks query by sponsor
            (
                doc! { "sponsor_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("sponsor_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "rank": 1, "is_active": 1 },
                Some(
                    IndexOptions::builder()
                        .name("rank_active_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balances_never_go_negative() {
        let balances = Balances {
            available: Amount::from_units(5),
            ..Balances::default()
        };

        let ok = balances
            .apply(&BalanceDelta::debit_available(Amount::from_units(5)))
            .unwrap();
        assert_eq!(ok.available, Amount::ZERO);

        assert!(balances
            .apply(&BalanceDelta::debit_available(Amount::from_cents(501)))
            .is_none());
    }

    #[test]
    fn test_withdrawal_hold_and_refund() {
        let balances = Balances {
            available: Amount::from_units(50),
            ..Balances::default()
        };
        let held = balances
            .apply(&BalanceDelta::hold_for_withdrawal(Amount::from_units(20)))
            .unwrap();
        assert_eq!(held.available, Amount::from_units(30));
        assert_eq!(held.pending, Amount::from_units(20));

        let refunded = held
            .apply(&BalanceDelta::refund_withdrawal(Amount::from_units(20)))
            .unwrap();
        assert_eq!(refunded, balances);
    }

    #[test]
    fn test_locked_earning_counts_toward_total() {
        let balances = Balances::default()
            .apply(&BalanceDelta::earn(Amount::from_units(3), true))
            .unwrap();
        assert_eq!(balances.locked, Amount::from_units(3));
        assert_eq!(balances.available, Amount::ZERO);
        assert_eq!(balances.total_earnings, Amount::from_units(3));
    }

    #[test]
    fn test_qualification() {
        let mut user = UserDoc::new(
            "a@example.com".into(),
            "A".into(),
            "hash".into(),
            "UPAAAAAA".into(),
            None,
        );
        assert!(!user.is_qualified());

        user.rank = Some(Rank::Benitoite);
        assert!(user.is_qualified());
        assert!(user.holds_rank(Rank::Azurite));
        assert!(!user.holds_rank(Rank::Crystals));

        user.is_active = false;
        assert!(!user.holds_rank(Rank::Azurite));
    }
}
