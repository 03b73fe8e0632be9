//! Global cycle and rank pool document schemas
//!
//! Each rank keeps a sequential counter. Positions fill a binary structure
//! in order, so position `p` sits below `p / 2`.

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;
use crate::income::Rank;
use crate::types::{new_id, Amount};

/// Collection name for per-rank counters
pub const GLOBAL_CYCLE_COLLECTION: &str = "global_cycles";

/// Collection name for assigned positions
pub const GLOBAL_POSITION_COLLECTION: &str = "global_positions";

/// Collection name for rank pool buckets
pub const RANK_POOL_COLLECTION: &str = "rank_pools";

/// Per-rank position counter, keyed by rank
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GlobalCycleDoc {
    #[serde(rename = "_id")]
    pub rank: Rank,

    #[serde(default)]
    pub metadata: Metadata,

    /// Last assigned position (positions start at 1)
    #[serde(default)]
    pub last_position: i64,
}

impl IntoIndexes for GlobalCycleDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        Vec::new()
    }
}

/// A member's slot in a rank's global cycle
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GlobalPositionDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub rank: Rank,

    pub position: i64,

    pub user_id: String,

    /// Activation that earned this slot; one slot per activation
    pub transaction_id: String,
}

impl GlobalPositionDoc {
    pub fn new(rank: Rank, position: i64, user_id: &str, transaction_id: &str) -> Self {
        Self {
            id: new_id(),
            metadata: Metadata::new(),
            rank,
            position,
            user_id: user_id.to_string(),
            transaction_id: transaction_id.to_string(),
        }
    }
}

/// Heap ancestors of a position, nearest first, at most `depth` of them
pub fn ancestor_positions(position: i64, depth: u32) -> Vec<i64> {
    let mut ancestors = Vec::new();
    let mut current = position;
    while ancestors.len() < depth as usize && current > 1 {
        current /= 2;
        ancestors.push(current);
    }
    ancestors
}

impl IntoIndexes for GlobalPositionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "rank": 1, "position": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("rank_position_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "transaction_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("transaction_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

/// Per-rank pool bucket, fed by activations and drained by accrual
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RankPoolDoc {
    #[serde(rename = "_id")]
    pub rank: Rank,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub balance: Amount,

    /// Everything ever paid out of this bucket
    #[serde(default)]
    pub total_distributed: Amount,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accrued_at: Option<DateTime>,
}

impl RankPoolDoc {
    pub fn empty(rank: Rank) -> Self {
        Self {
            rank,
            metadata: Metadata::new(),
            balance: Amount::ZERO,
            total_distributed: Amount::ZERO,
            last_accrued_at: None,
        }
    }
}

impl IntoIndexes for RankPoolDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestor_positions(1, 3), Vec::<i64>::new());
        assert_eq!(ancestor_positions(2, 3), vec![1]);
        assert_eq!(ancestor_positions(7, 3), vec![3, 1]);
        assert_eq!(ancestor_positions(13, 3), vec![6, 3, 1]);
        assert_eq!(ancestor_positions(27, 3), vec![13, 6, 3]);
        assert_eq!(ancestor_positions(27, 1), vec![13]);
    }
}
