//! Withdrawal and payout queue document schemas
//!
//! A withdrawal moves `pending -> processing -> completed | rejected`.
//! Processing withdrawals own exactly one payout queue entry, which carries
//! the retry state and is deleted when the withdrawal turns terminal.

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;
use crate::types::{new_id, Amount};

/// Collection name for withdrawals
pub const WITHDRAWAL_COLLECTION: &str = "withdrawals";

/// Collection name for payout queue entries
pub const PAYOUT_QUEUE_COLLECTION: &str = "payout_queue";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WithdrawalStatus::Completed | WithdrawalStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "processing" => Ok(WithdrawalStatus::Processing),
            "completed" => Ok(WithdrawalStatus::Completed),
            "rejected" => Ok(WithdrawalStatus::Rejected),
            other => Err(format!("unknown withdrawal status: {other}")),
        }
    }
}

/// Withdrawal request
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WithdrawalDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub user_id: String,

    /// Gross amount held from the member's balance
    pub amount: Amount,

    pub fee: Amount,

    /// What the payout gateway is asked to send
    pub net_amount: Amount,

    pub destination: String,

    #[serde(default)]
    pub status: WithdrawalStatus,

    /// Rejection reason or last payout error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Gateway reference of the completed payout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime>,
}

impl WithdrawalDoc {
    pub fn new(user_id: &str, amount: Amount, fee: Amount, destination: String) -> Self {
        Self {
            id: new_id(),
            metadata: Metadata::new(),
            user_id: user_id.to_string(),
            amount,
            fee,
            net_amount: amount - fee,
            destination,
            status: WithdrawalStatus::Pending,
            reason: None,
            payout_reference: None,
            processed_at: None,
            completed_at: None,
        }
    }
}

impl IntoIndexes for WithdrawalDoc {
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
                doc! { "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

/// Disbursement attempt state for a processing withdrawal
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PayoutQueueDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub withdrawal_id: String,

    pub user_id: String,

    /// Net amount to disburse
    pub amount: Amount,

    pub destination: String,

    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,

    pub next_attempt_at: DateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PayoutQueueDoc {
    /// Queue entry due immediately
    pub fn for_withdrawal(withdrawal: &WithdrawalDoc, now: DateTime) -> Self {
        Self {
            id: new_id(),
            metadata: Metadata::at(now),
            withdrawal_id: withdrawal.id.clone(),
            user_id: withdrawal.user_id.clone(),
            amount: withdrawal.net_amount,
            destination: withdrawal.destination.clone(),
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime) -> bool {
        self.next_attempt_at.timestamp_millis() <= now.timestamp_millis()
    }
}

impl IntoIndexes for PayoutQueueDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "withdrawal_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("withdrawal_unique".to_string())
                        .build(),
                ),
            ),
            // Sweep reads due entries oldest first
            (
                doc! { "next_attempt_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("due_index".to_string())
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
    fn test_net_amount() {
        let w = WithdrawalDoc::new("u1", Amount::from_units(100), Amount::from_units(5), "addr".into());
        assert_eq!(w.net_amount, Amount::from_units(95));
        assert_eq!(w.status, WithdrawalStatus::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!WithdrawalStatus::Pending.is_terminal());
        assert!(!WithdrawalStatus::Processing.is_terminal());
        assert!(WithdrawalStatus::Completed.is_terminal());
        assert!(WithdrawalStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_queue_entry_due() {
        let w = WithdrawalDoc::new("u1", Amount::from_units(10), Amount::ZERO, "addr".into());
        let now = DateTime::from_millis(1_000_000);
        let mut entry = PayoutQueueDoc::for_withdrawal(&w, now);
        assert!(entry.is_due(now));

        entry.next_attempt_at = DateTime::from_millis(1_060_000);
        assert!(!entry.is_due(now));
        assert!(entry.is_due(DateTime::from_millis(1_060_000)));
    }
}
