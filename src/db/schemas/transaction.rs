//! Transaction document schema
//!
//! Record of a money movement. Immutable once created, except that an
//! activation is flagged `distributed` after its commissions are paid.

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;
use crate::income::Rank;
use crate::types::{new_id, Amount};

/// Collection name for transactions
pub const TRANSACTION_COLLECTION: &str = "transactions";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Rank purchase, debited from available balance
    Activation,
    /// Admin credit
    Topup,
    /// Member to member
    Transfer,
    /// Completed payout
    Withdrawal,
    /// Withdrawal funds returned to available
    Refund,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[default]
    Completed,
    Pending,
    Failed,
}

/// Transaction document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransactionDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub kind: TransactionKind,

    /// Owner (payer for activations and transfers)
    pub user_id: String,

    /// Receiving side of a transfer, or the admin behind a topup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_id: Option<String>,

    pub amount: Amount,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<Rank>,

    #[serde(default)]
    pub status: TransactionStatus,

    /// Commissions for this activation have been paid
    #[serde(default)]
    pub distributed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Related document, e.g. the withdrawal behind a payout or refund
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl TransactionDoc {
    fn base(kind: TransactionKind, user_id: &str, amount: Amount) -> Self {
        Self {
            id: new_id(),
            metadata: Metadata::new(),
            kind,
            user_id: user_id.to_string(),
            counterparty_id: None,
            amount,
            rank: None,
            status: TransactionStatus::Completed,
            distributed: false,
            note: None,
            reference: None,
        }
    }

    pub fn activation(user_id: &str, rank: Rank, price: Amount) -> Self {
        Self {
            rank: Some(rank),
            ..Self::base(TransactionKind::Activation, user_id, price)
        }
    }

    pub fn topup(user_id: &str, admin_id: &str, amount: Amount, note: Option<String>) -> Self {
        Self {
            counterparty_id: Some(admin_id.to_string()),
            note,
            ..Self::base(TransactionKind::Topup, user_id, amount)
        }
    }

    pub fn transfer(from_id: &str, to_id: &str, amount: Amount, note: Option<String>) -> Self {
        Self {
            counterparty_id: Some(to_id.to_string()),
            note,
            ..Self::base(TransactionKind::Transfer, from_id, amount)
        }
    }

    pub fn withdrawal(user_id: &str, withdrawal_id: &str, amount: Amount) -> Self {
        Self {
            reference: Some(withdrawal_id.to_string()),
            ..Self::base(TransactionKind::Withdrawal, user_id, amount)
        }
    }

    pub fn refund(user_id: &str, withdrawal_id: &str, amount: Amount, reason: &str) -> Self {
        Self {
            reference: Some(withdrawal_id.to_string()),
            note: Some(reason.to_string()),
            ..Self::base(TransactionKind::Refund, user_id, amount)
        }
    }

    /// An activation whose commissions have not been paid yet
    pub fn awaits_distribution(&self) -> bool {
        self.kind == TransactionKind::Activation && !self.distributed
    }
}

impl IntoIndexes for TransactionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "user_id": 1, "metadata.created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("user_history_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "counterparty_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("counterparty_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
            // Distribution retry scans undistributed activations
            (
                doc! { "kind": 1, "distributed": 1 },
                Some(
                    IndexOptions::builder()
                        .name("distribution_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
