//! JSON views of stored documents
//!
//! Timestamps go out as RFC 3339 strings and internal fields such as the
//! password hash never leave the server.

use bson::DateTime;
use serde::Serialize;

use crate::auth::PermissionLevel;
use crate::db::schemas::{
    IncomeDoc, IncomeKind, IncomePoolDoc, PayoutQueueDoc, PoolEntryStatus, RankPoolDoc,
    TransactionDoc, TransactionKind, TransactionStatus, UserDoc, WithdrawalDoc, WithdrawalStatus,
};
use crate::income::{PoolSummary, Rank};
use crate::types::Amount;

pub fn rfc3339(at: Option<DateTime>) -> Option<String> {
    at.and_then(|d| d.try_to_rfc3339_string().ok())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesView {
    pub available: Amount,
    pub locked: Amount,
    pub pending: Amount,
    pub total_earnings: Amount,
    pub total_withdrawn: Amount,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub identifier: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_address: Option<String>,
    pub permission_level: PermissionLevel,
    pub is_active: bool,
    pub referral_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sponsor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<Rank>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<String>,
    pub balances: BalancesView,
    pub direct_referrals: u32,
    pub active_direct_referrals: u32,
    pub team_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&UserDoc> for UserView {
    fn from(user: &UserDoc) -> Self {
        let b = &user.balances;
        Self {
            id: user.id.clone(),
            identifier: user.identifier.clone(),
            display_name: user.display_name.clone(),
            phone: user.phone.clone(),
            payout_address: user.payout_address.clone(),
            permission_level: user.permission_level,
            is_active: user.is_active,
            referral_code: user.referral_code.clone(),
            sponsor_id: user.sponsor_id.clone(),
            rank: user.rank,
            activated_at: rfc3339(user.activated_at),
            balances: BalancesView {
                available: b.available,
                locked: b.locked,
                pending: b.pending,
                total_earnings: b.total_earnings,
                total_withdrawn: b.total_withdrawn,
            },
            direct_referrals: user.direct_referrals,
            active_direct_referrals: user.active_direct_referrals,
            team_size: user.team_size,
            created_at: rfc3339(user.metadata.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: String,
    pub kind: TransactionKind,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_id: Option<String>,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<Rank>,
    pub status: TransactionStatus,
    pub distributed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&TransactionDoc> for TransactionView {
    fn from(tx: &TransactionDoc) -> Self {
        Self {
            id: tx.id.clone(),
            kind: tx.kind,
            user_id: tx.user_id.clone(),
            counterparty_id: tx.counterparty_id.clone(),
            amount: tx.amount,
            rank: tx.rank,
            status: tx.status,
            distributed: tx.distributed,
            note: tx.note.clone(),
            reference: tx.reference.clone(),
            created_at: rfc3339(tx.metadata.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeView {
    pub id: String,
    pub kind: IncomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    pub rank: Rank,
    pub amount: Amount,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&IncomeDoc> for IncomeView {
    fn from(income: &IncomeDoc) -> Self {
        Self {
            id: income.id.clone(),
            kind: income.kind,
            level: income.level,
            rank: income.rank,
            amount: income.amount,
            locked: income.locked,
            source_user_id: income.source_user_id.clone(),
            transaction_id: income.transaction_id.clone(),
            created_at: rfc3339(income.metadata.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntryView {
    pub id: String,
    pub kind: IncomeKind,
    pub rank: Rank,
    pub amount: Amount,
    pub required_referrals: u32,
    pub status: PoolEntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<String>,
}

impl From<&IncomePoolDoc> for PoolEntryView {
    fn from(entry: &IncomePoolDoc) -> Self {
        Self {
            id: entry.id.clone(),
            kind: entry.kind,
            rank: entry.rank,
            amount: entry.amount,
            required_referrals: entry.required_referrals,
            status: entry.status,
            created_at: rfc3339(entry.metadata.created_at),
            claimed_at: rfc3339(entry.claimed_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolView {
    pub active_direct_referrals: u32,
    pub locked: Amount,
    pub claimable: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_threshold: Option<u32>,
    pub entries: Vec<PoolEntryView>,
}

impl From<&PoolSummary> for PoolView {
    fn from(summary: &PoolSummary) -> Self {
        Self {
            active_direct_referrals: summary.active_direct_referrals,
            locked: summary.locked,
            claimable: summary.claimable,
            next_threshold: summary.next_threshold,
            entries: summary.entries.iter().map(PoolEntryView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalView {
    pub id: String,
    pub user_id: String,
    pub amount: Amount,
    pub fee: Amount,
    pub net_amount: Amount,
    pub destination: String,
    pub status: WithdrawalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<&WithdrawalDoc> for WithdrawalView {
    fn from(w: &WithdrawalDoc) -> Self {
        Self {
            id: w.id.clone(),
            user_id: w.user_id.clone(),
            amount: w.amount,
            fee: w.fee,
            net_amount: w.net_amount,
            destination: w.destination.clone(),
            status: w.status,
            reason: w.reason.clone(),
            payout_reference: w.payout_reference.clone(),
            created_at: rfc3339(w.metadata.created_at),
            processed_at: rfc3339(w.processed_at),
            completed_at: rfc3339(w.completed_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutView {
    pub id: String,
    pub withdrawal_id: String,
    pub user_id: String,
    pub amount: Amount,
    pub destination: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&PayoutQueueDoc> for PayoutView {
    fn from(entry: &PayoutQueueDoc) -> Self {
        Self {
            id: entry.id.clone(),
            withdrawal_id: entry.withdrawal_id.clone(),
            user_id: entry.user_id.clone(),
            amount: entry.amount,
            destination: entry.destination.clone(),
            attempts: entry.attempts,
            next_attempt_at: rfc3339(Some(entry.next_attempt_at)),
            last_error: entry.last_error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankPoolView {
    pub rank: Rank,
    pub balance: Amount,
    pub total_distributed: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accrued_at: Option<String>,
}

impl From<&RankPoolDoc> for RankPoolView {
    fn from(pool: &RankPoolDoc) -> Self {
        Self {
            rank: pool.rank,
            balance: pool.balance,
            total_distributed: pool.total_distributed,
            last_accrued_at: rfc3339(pool.last_accrued_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_view_hides_password() {
        let mut user = UserDoc::new(
            "v@example.com".into(),
            "V".into(),
            "$argon2id$secret".into(),
            "UPVVVVVV".into(),
            None,
        );
        user.metadata.created_at = Some(DateTime::from_millis(0));

        let json = serde_json::to_value(UserView::from(&user)).unwrap();
        assert!(json.get("passwordHash").is_none());
        assert!(!json.to_string().contains("argon2"));
        assert_eq!(json["referralCode"], "UPVVVVVV");
        assert_eq!(json["permissionLevel"], "MEMBER");
        assert_eq!(json["balances"]["totalEarnings"], 0);
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_withdrawal_view() {
        let w = WithdrawalDoc::new("u1", Amount::from_units(20), Amount::from_units(1), "acct".into());
        let json = serde_json::to_value(WithdrawalView::from(&w)).unwrap();
        assert_eq!(json["netAmount"], 1900);
        assert_eq!(json["status"], "pending");
        assert!(json.get("completedAt").is_none());
    }
}
