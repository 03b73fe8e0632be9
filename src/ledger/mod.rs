//! Persistence seam for balances, commissions and withdrawals
//!
//! Services read through [`Ledger`] and write exclusively through
//! [`Ledger::commit`], which applies a [`LedgerBatch`] of guarded operations
//! all-or-nothing. A failed state guard surfaces as `Conflict` (callers
//! re-read and retry), a failed balance guard as `InsufficientFunds`.
//!
//! Two implementations:
//! - [`MongoLedger`]: each batch runs in a client-session transaction
//! - [`MemoryLedger`]: batches apply to a scratch copy under one write lock
//!   (dev mode and tests)

mod memory;
mod mongo;

pub use memory::MemoryLedger;
pub use mongo::MongoLedger;

use async_trait::async_trait;
use bson::DateTime;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::schemas::{
    BalanceDelta, CounterDelta, GlobalPositionDoc, IncomeDoc, IncomeKind, IncomePoolDoc,
    PayoutQueueDoc, PoolEntryStatus, RankPoolDoc, TransactionDoc, UserDoc, WithdrawalDoc,
    WithdrawalStatus,
};
use crate::db::MongoClient;
use crate::income::Rank;
use crate::types::{Amount, Result};

/// Attempts a service makes before giving up on a conflicting commit
pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// One guarded write inside a batch
#[derive(Debug, Clone)]
pub enum LedgerOp {
    /// Fails with Conflict on duplicate id, identifier or referral code
    InsertUser(UserDoc),
    /// Fails with InsufficientFunds if any held balance would go negative
    AdjustBalance { user_id: String, delta: BalanceDelta },
    /// Fails with Conflict if a counter would go negative
    UpdateCounters { user_id: String, delta: CounterDelta },
    /// Fails with Conflict unless the user still holds `from`
    SetRank {
        user_id: String,
        from: Option<Rank>,
        to: Rank,
        at: DateTime,
    },
    InsertTransaction(TransactionDoc),
    /// Fails with Conflict if the activation was already distributed
    MarkDistributed { transaction_id: String },
    InsertIncome(IncomeDoc),
    InsertPoolEntry(IncomePoolDoc),
    /// Fails with Conflict unless the entry is still locked
    ReleasePoolEntry { entry_id: String, at: DateTime },
    InsertWithdrawal(WithdrawalDoc),
    /// Fails with Conflict unless the withdrawal is in `from`
    TransitionWithdrawal {
        withdrawal_id: String,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
        reason: Option<String>,
        payout_reference: Option<String>,
        at: DateTime,
    },
    /// Fails with Conflict if the withdrawal already has an entry
    EnqueuePayout(PayoutQueueDoc),
    /// Leases a due entry to one sweep. Fails with Conflict unless the entry
    /// still has `expected_attempts` and `expected_next_attempt_at`; stores
    /// `lease_until` as the next attempt time
    ClaimPayout {
        entry_id: String,
        expected_attempts: u32,
        expected_next_attempt_at: DateTime,
        lease_until: DateTime,
    },
    /// Fails with Conflict unless the entry still has `expected_attempts`;
    /// stores `expected_attempts + 1`
    ReschedulePayout {
        entry_id: String,
        expected_attempts: u32,
        next_attempt_at: DateTime,
        last_error: String,
    },
    /// Fails with Conflict if the entry is already gone
    RemovePayout { entry_id: String },
    /// Upserts the bucket; fails with Conflict if the balance would go negative
    AdjustRankPool {
        rank: Rank,
        balance: Amount,
        distributed: Amount,
        accrued_at: Option<DateTime>,
    },
}

/// Ordered set of writes committed atomically
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    ops: Vec<LedgerOp>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: LedgerOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Balance adjustment; zero deltas are dropped
    pub fn adjust_balance(&mut self, user_id: &str, delta: BalanceDelta) -> &mut Self {
        if !delta.is_zero() {
            self.ops.push(LedgerOp::AdjustBalance {
                user_id: user_id.to_string(),
                delta,
            });
        }
        self
    }

    pub fn update_counters(&mut self, user_id: &str, delta: CounterDelta) -> &mut Self {
        if delta != CounterDelta::default() {
            self.ops.push(LedgerOp::UpdateCounters {
                user_id: user_id.to_string(),
                delta,
            });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<LedgerOp> {
        self.ops
    }
}

/// 1-based page selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

/// Largest page any listing returns
pub const MAX_PAGE_SIZE: u32 = 100;

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn skip(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.limit as u64
    }

    /// Apply this page to an already-ordered list
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.skip() as usize)
            .take(self.limit as usize)
            .cloned()
            .collect()
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// One page of results plus the unpaged total
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let total_pages = total.div_ceil(request.limit.max(1) as u64) as u32;
        Self {
            items,
            total,
            page: request.page,
            limit: request.limit,
            total_pages,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
            total_pages: self.total_pages,
        }
    }
}

/// Admin user listing filter
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub page: PageRequest,
    /// Case-insensitive match on identifier, display name or referral code
    pub search: Option<String>,
    pub rank: Option<Rank>,
    pub is_active: Option<bool>,
}

/// Withdrawal listing filter
#[derive(Debug, Clone, Default)]
pub struct WithdrawalQuery {
    pub page: PageRequest,
    pub user_id: Option<String>,
    pub status: Option<WithdrawalStatus>,
}

/// Profile and admin edits; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub payout_address: Option<String>,
    pub is_active: Option<bool>,
    /// Increment `token_version`, invalidating issued tokens
    pub bump_token_version: bool,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.phone.is_none()
            && self.payout_address.is_none()
            && self.is_active.is_none()
            && !self.bump_token_version
    }

    /// Apply to an in-memory copy
    pub fn apply_to(&self, user: &mut UserDoc) {
        if let Some(name) = &self.display_name {
            user.display_name = name.clone();
        }
        if let Some(phone) = &self.phone {
            user.phone = Some(phone.clone());
        }
        if let Some(address) = &self.payout_address {
            user.payout_address = Some(address.clone());
        }
        if let Some(active) = self.is_active {
            user.is_active = active;
        }
        if self.bump_token_version {
            user.token_version += 1;
        }
    }
}

/// Platform totals for the admin dashboard
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub users: u64,
    /// Users holding a rank
    pub activated_users: u64,
    pub blocked_users: u64,
    pub total_available: Amount,
    pub total_locked: Amount,
    pub total_pending: Amount,
    pub total_earnings: Amount,
    pub total_withdrawn: Amount,
    pub pending_withdrawals: u64,
    pub queued_payouts: u64,
    pub undistributed_activations: u64,
    pub rank_pool_balance: Amount,
}

/// Storage used by every service
#[async_trait]
pub trait Ledger: Send + Sync {
    // Users

    async fn user(&self, id: &str) -> Result<Option<UserDoc>>;

    async fn user_by_identifier(&self, identifier: &str) -> Result<Option<UserDoc>>;

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<UserDoc>>;

    /// Users sponsored by `sponsor_id`, oldest first
    async fn direct_referrals(&self, sponsor_id: &str) -> Result<Vec<UserDoc>>;

    /// Unblocked users holding `rank` or higher
    async fn users_at_or_above(&self, rank: Rank) -> Result<Vec<UserDoc>>;

    /// Newest first
    async fn list_users(&self, query: &UserQuery) -> Result<Page<UserDoc>>;

    /// Apply a non-financial patch; NotFound if the user is missing
    async fn update_user(&self, id: &str, patch: &UserPatch) -> Result<UserDoc>;

    // Transactions

    async fn transaction(&self, id: &str) -> Result<Option<TransactionDoc>>;

    /// Transactions where the user is owner or counterparty, newest first
    async fn transactions_for(&self, user_id: &str, page: PageRequest) -> Result<Page<TransactionDoc>>;

    /// Activations with `distributed == false`, oldest first
    async fn undistributed_activations(&self, limit: usize) -> Result<Vec<TransactionDoc>>;

    // Commissions

    /// Newest first
    async fn incomes_for(
        &self,
        user_id: &str,
        kind: Option<IncomeKind>,
        page: PageRequest,
    ) -> Result<Page<IncomeDoc>>;

    /// Oldest first
    async fn pool_entries_for(
        &self,
        user_id: &str,
        status: Option<PoolEntryStatus>,
    ) -> Result<Vec<IncomePoolDoc>>;

    // Withdrawals and payouts

    async fn withdrawal(&self, id: &str) -> Result<Option<WithdrawalDoc>>;

    /// Newest first
    async fn withdrawals(&self, query: &WithdrawalQuery) -> Result<Page<WithdrawalDoc>>;

    /// Entries with `next_attempt_at <= now`, earliest first
    async fn due_payouts(&self, now: DateTime, limit: usize) -> Result<Vec<PayoutQueueDoc>>;

    /// Whole queue, earliest first
    async fn payout_queue(&self, page: PageRequest) -> Result<Page<PayoutQueueDoc>>;

    // Global cycle

    /// Position assigned to an activation, if any
    async fn global_position(&self, transaction_id: &str) -> Result<Option<GlobalPositionDoc>>;

    /// Holders of the given positions in a rank's cycle
    async fn positions_at(&self, rank: Rank, positions: &[i64]) -> Result<Vec<GlobalPositionDoc>>;

    /// Next sequential position for `rank`. Returns the existing position if
    /// this activation already has one; a failed allocation may leave a gap.
    async fn allocate_global_position(
        &self,
        rank: Rank,
        user_id: &str,
        transaction_id: &str,
    ) -> Result<GlobalPositionDoc>;

    async fn rank_pools(&self) -> Result<Vec<RankPoolDoc>>;

    async fn stats(&self) -> Result<LedgerStats>;

    /// Apply every operation or none
    async fn commit(&self, batch: LedgerBatch) -> Result<()>;
}

/// Which backend `open` ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Mongo,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Mongo => "mongodb",
            StorageKind::Memory => "memory",
        }
    }

    /// Survives a restart
    pub fn is_durable(self) -> bool {
        matches!(self, StorageKind::Mongo)
    }
}

/// Connect to MongoDB; in dev mode an unreachable server falls back to memory
pub async fn open(uri: &str, db_name: &str, dev_mode: bool) -> Result<(Arc<dyn Ledger>, StorageKind)> {
    match MongoClient::new(uri, db_name).await {
        Ok(client) => {
            let ledger = MongoLedger::open(client).await?;
            info!("MongoDB ledger ready");
            Ok((Arc::new(ledger), StorageKind::Mongo))
        }
        Err(e) if dev_mode => {
            warn!("MongoDB connection failed (dev mode, using in-memory ledger): {}", e);
            Ok((Arc::new(MemoryLedger::new()), StorageKind::Memory))
        }
        Err(e) => Err(e),
    }
}

/// Run a read-compute-commit cycle, retrying on Conflict
pub async fn with_conflict_retry<T, F, Fut>(operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Err(e) if e.is_conflict() && tries < MAX_COMMIT_ATTEMPTS => {
                debug!(operation, attempt = tries, error = %e, "Commit conflict, retrying");
            }
            other => return other,
        }
    }
}
