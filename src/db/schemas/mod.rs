//! Database schemas for Upline
//!
//! MongoDB document structures for members, money movements, commissions,
//! withdrawals and the payout queue.

mod global_cycle;
mod income;
mod metadata;
mod transaction;
mod user;
mod withdrawal;

pub use global_cycle::{
    ancestor_positions, GlobalCycleDoc, GlobalPositionDoc, RankPoolDoc, GLOBAL_CYCLE_COLLECTION,
    GLOBAL_POSITION_COLLECTION, RANK_POOL_COLLECTION,
};
pub use income::{
    IncomeDoc, IncomeKind, IncomePoolDoc, PoolEntryStatus, INCOME_COLLECTION,
    INCOME_POOL_COLLECTION,
};
pub use metadata::Metadata;
pub use transaction::{TransactionDoc, TransactionKind, TransactionStatus, TRANSACTION_COLLECTION};
pub use user::{BalanceDelta, Balances, CounterDelta, UserDoc, USER_COLLECTION};
pub use withdrawal::{
    PayoutQueueDoc, WithdrawalDoc, WithdrawalStatus, PAYOUT_QUEUE_COLLECTION,
    WITHDRAWAL_COLLECTION,
};
