//! In-memory ledger for dev mode and tests
//!
//! A commit clones the store, applies every operation to the clone and
//! swaps it in only when all of them succeed, all under one write lock.

use async_trait::async_trait;
use bson::DateTime;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    Ledger, LedgerBatch, LedgerOp, LedgerStats, Page, PageRequest, UserPatch, UserQuery,
    WithdrawalQuery,
};
use crate::db::schemas::{
    GlobalPositionDoc, IncomeDoc, IncomeKind, IncomePoolDoc, PayoutQueueDoc, PoolEntryStatus,
    RankPoolDoc, TransactionDoc, UserDoc, WithdrawalDoc, WithdrawalStatus,
};
use crate::income::Rank;
use crate::types::{Amount, Result, UplineError};

#[derive(Debug, Clone, Default)]
struct Store {
    users: HashMap<String, UserDoc>,
    /// Insertion order doubles as creation order for the history collections
    transactions: Vec<TransactionDoc>,
    incomes: Vec<IncomeDoc>,
    pool_entries: Vec<IncomePoolDoc>,
    withdrawals: Vec<WithdrawalDoc>,
    payouts: Vec<PayoutQueueDoc>,
    cycles: HashMap<Rank, i64>,
    positions: Vec<GlobalPositionDoc>,
    rank_pools: HashMap<Rank, RankPoolDoc>,
}

impl Store {
    fn user_mut(&mut self, id: &str) -> Result<&mut UserDoc> {
        self.users
            .get_mut(id)
            .ok_or_else(|| UplineError::NotFound(format!("User {id} not found")))
    }

    fn apply(&mut self, op: LedgerOp) -> Result<()> {
        match op {
            LedgerOp::InsertUser(user) => {
                let taken = self.users.values().any(|u| {
                    u.id == user.id
                        || u.identifier == user.identifier
                        || u.referral_code == user.referral_code
                });
                if taken {
                    return Err(UplineError::Conflict("User already exists".into()));
                }
                self.users.insert(user.id.clone(), user);
            }

            LedgerOp::AdjustBalance { user_id, delta } => {
                let user = self.user_mut(&user_id)?;
                user.balances = user.balances.apply(&delta).ok_or_else(|| {
                    UplineError::InsufficientFunds(format!("Balance of {user_id} is too low"))
                })?;
                user.metadata.touch(DateTime::now());
            }

            LedgerOp::UpdateCounters { user_id, delta } => {
                let user = self.user_mut(&user_id)?;
                let bump = |value: u32, by: i32| -> Result<u32> {
                    u32::try_from(value as i64 + by as i64)
                        .map_err(|_| UplineError::Conflict(format!("Counter underflow for {user_id}")))
                };
                user.direct_referrals = bump(user.direct_referrals, delta.direct_referrals)?;
                user.active_direct_referrals =
                    bump(user.active_direct_referrals, delta.active_direct_referrals)?;
                user.team_size = bump(user.team_size, delta.team_size)?;
            }

            LedgerOp::SetRank {
                user_id,
                from,
                to,
                at,
            } => {
                let user = self.user_mut(&user_id)?;
                if user.rank != from {
                    return Err(UplineError::Conflict(format!("Rank of {user_id} changed")));
                }
                user.rank = Some(to);
                if user.activated_at.is_none() {
                    user.activated_at = Some(at);
                }
                user.metadata.touch(at);
            }

            LedgerOp::InsertTransaction(tx) => {
                if self.transactions.iter().any(|t| t.id == tx.id) {
                    return Err(UplineError::Conflict("Duplicate transaction".into()));
                }
                self.transactions.push(tx);
            }

            LedgerOp::MarkDistributed { transaction_id } => {
                let tx = self
                    .transactions
                    .iter_mut()
                    .find(|t| t.id == transaction_id)
                    .ok_or_else(|| UplineError::NotFound(format!("Transaction {transaction_id} not found")))?;
                if tx.distributed {
                    return Err(UplineError::Conflict(format!(
                        "Transaction {transaction_id} already distributed"
                    )));
                }
                tx.distributed = true;
            }

            LedgerOp::InsertIncome(income) => self.incomes.push(income),

            LedgerOp::InsertPoolEntry(entry) => self.pool_entries.push(entry),

            LedgerOp::ReleasePoolEntry { entry_id, at } => {
                let entry = self
                    .pool_entries
                    .iter_mut()
                    .find(|e| e.id == entry_id && e.status == PoolEntryStatus::Locked)
                    .ok_or_else(|| UplineError::Conflict(format!("Pool entry {entry_id} not locked")))?;
                entry.status = PoolEntryStatus::Claimed;
                entry.claimed_at = Some(at);
                entry.metadata.touch(at);
            }

            LedgerOp::InsertWithdrawal(withdrawal) => self.withdrawals.push(withdrawal),

            LedgerOp::TransitionWithdrawal {
                withdrawal_id,
                from,
                to,
                reason,
                payout_reference,
                at,
            } => {
                let withdrawal = self
                    .withdrawals
                    .iter_mut()
                    .find(|w| w.id == withdrawal_id && w.status == from)
                    .ok_or_else(|| {
                        UplineError::Conflict(format!("Withdrawal {withdrawal_id} is not {from}"))
                    })?;
                withdrawal.status = to;
                if reason.is_some() {
                    withdrawal.reason = reason;
                }
                if payout_reference.is_some() {
                    withdrawal.payout_reference = payout_reference;
                }
                match to {
                    WithdrawalStatus::Completed => withdrawal.completed_at = Some(at),
                    WithdrawalStatus::Processing | WithdrawalStatus::Rejected => {
                        withdrawal.processed_at = Some(at)
                    }
                    WithdrawalStatus::Pending => {}
                }
                withdrawal.metadata.touch(at);
            }

            LedgerOp::EnqueuePayout(entry) => {
                if self.payouts.iter().any(|p| p.withdrawal_id == entry.withdrawal_id) {
                    return Err(UplineError::Conflict(format!(
                        "Withdrawal {} already queued",
                        entry.withdrawal_id
                    )));
                }
                self.payouts.push(entry);
            }

            LedgerOp::ClaimPayout {
                entry_id,
                expected_attempts,
                expected_next_attempt_at,
                lease_until,
            } => {
                let entry = self
                    .payouts
                    .iter_mut()
                    .find(|p| {
                        p.id == entry_id
                            && p.attempts == expected_attempts
                            && p.next_attempt_at == expected_next_attempt_at
                    })
                    .ok_or_else(|| UplineError::Conflict(format!("Payout {entry_id} already claimed")))?;
                entry.next_attempt_at = lease_until;
            }

            LedgerOp::ReschedulePayout {
                entry_id,
                expected_attempts,
                next_attempt_at,
                last_error,
            } => {
                let entry = self
                    .payouts
                    .iter_mut()
                    .find(|p| p.id == entry_id && p.attempts == expected_attempts)
                    .ok_or_else(|| UplineError::Conflict(format!("Payout {entry_id} changed")))?;
                entry.attempts = expected_attempts + 1;
                entry.next_attempt_at = next_attempt_at;
                entry.last_error = Some(last_error);
            }

            LedgerOp::RemovePayout { entry_id } => {
                let before = self.payouts.len();
                self.payouts.retain(|p| p.id != entry_id);
                if self.payouts.len() == before {
                    return Err(UplineError::Conflict(format!("Payout {entry_id} already removed")));
                }
            }

            LedgerOp::AdjustRankPool {
                rank,
                balance,
                distributed,
                accrued_at,
            } => {
                let bucket = self
                    .rank_pools
                    .entry(rank)
                    .or_insert_with(|| RankPoolDoc::empty(rank));
                let next = bucket.balance + balance;
                if next.is_negative() {
                    return Err(UplineError::Conflict(format!("Rank pool {rank} drained")));
                }
                bucket.balance = next;
                bucket.total_distributed += distributed;
                if accrued_at.is_some() {
                    bucket.last_accrued_at = accrued_at;
                }
            }
        }
        Ok(())
    }
}

/// Ledger held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryLedger {
    store: RwLock<Store>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T: Clone>(items: impl Iterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.reverse();
    out
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn user(&self, id: &str) -> Result<Option<UserDoc>> {
        Ok(self.store.read().await.users.get(id).cloned())
    }

    async fn user_by_identifier(&self, identifier: &str) -> Result<Option<UserDoc>> {
        let store = self.store.read().await;
        Ok(store
            .users
            .values()
            .find(|u| u.identifier.eq_ignore_ascii_case(identifier))
            .cloned())
    }

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<UserDoc>> {
        let store = self.store.read().await;
        Ok(store
            .users
            .values()
            .find(|u| u.referral_code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn direct_referrals(&self, sponsor_id: &str) -> Result<Vec<UserDoc>> {
        let store = self.store.read().await;
        let mut users: Vec<UserDoc> = store
            .users
            .values()
            .filter(|u| u.sponsor_id.as_deref() == Some(sponsor_id))
            .cloned()
            .collect();
        users.sort_by(|a, b| {
            (a.metadata.created_millis(), &a.id).cmp(&(b.metadata.created_millis(), &b.id))
        });
        Ok(users)
    }

    async fn users_at_or_above(&self, rank: Rank) -> Result<Vec<UserDoc>> {
        let store = self.store.read().await;
        let mut users: Vec<UserDoc> = store
            .users
            .values()
            .filter(|u| u.holds_rank(rank))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    async fn list_users(&self, query: &UserQuery) -> Result<Page<UserDoc>> {
        let store = self.store.read().await;
        let search = query.search.as_ref().map(|s| s.to_lowercase());
        let mut users: Vec<UserDoc> = store
            .users
            .values()
            .filter(|u| query.rank.is_none_or(|r| u.rank == Some(r)))
            .filter(|u| query.is_active.is_none_or(|a| u.is_active == a))
            .filter(|u| {
                search.as_ref().is_none_or(|s| {
                    u.identifier.to_lowercase().contains(s)
                        || u.display_name.to_lowercase().contains(s)
                        || u.referral_code.to_lowercase().contains(s)
                })
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| {
            (b.metadata.created_millis(), &b.id).cmp(&(a.metadata.created_millis(), &a.id))
        });
        Ok(Page::new(query.page.slice(&users), users.len() as u64, query.page))
    }

    async fn update_user(&self, id: &str, patch: &UserPatch) -> Result<UserDoc> {
        let mut store = self.store.write().await;
        let user = store.user_mut(id)?;
        patch.apply_to(user);
        user.metadata.touch(DateTime::now());
        Ok(user.clone())
    }

    async fn transaction(&self, id: &str) -> Result<Option<TransactionDoc>> {
        let store = self.store.read().await;
        Ok(store.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn transactions_for(&self, user_id: &str, page: PageRequest) -> Result<Page<TransactionDoc>> {
        let store = self.store.read().await;
        let txs = newest_first(
            store
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id || t.counterparty_id.as_deref() == Some(user_id))
                .cloned(),
        );
        Ok(Page::new(page.slice(&txs), txs.len() as u64, page))
    }

    async fn undistributed_activations(&self, limit: usize) -> Result<Vec<TransactionDoc>> {
        let store = self.store.read().await;
        Ok(store
            .transactions
            .iter()
            .filter(|t| t.awaits_distribution())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn incomes_for(
        &self,
        user_id: &str,
        kind: Option<IncomeKind>,
        page: PageRequest,
    ) -> Result<Page<IncomeDoc>> {
        let store = self.store.read().await;
        let incomes = newest_first(
            store
                .incomes
                .iter()
                .filter(|i| i.recipient_id == user_id && kind.is_none_or(|k| i.kind == k))
                .cloned(),
        );
        Ok(Page::new(page.slice(&incomes), incomes.len() as u64, page))
    }

    async fn pool_entries_for(
        &self,
        user_id: &str,
        status: Option<PoolEntryStatus>,
    ) -> Result<Vec<IncomePoolDoc>> {
        let store = self.store.read().await;
        Ok(store
            .pool_entries
            .iter()
            .filter(|e| e.user_id == user_id && status.is_none_or(|s| e.status == s))
            .cloned()
            .collect())
    }

    async fn withdrawal(&self, id: &str) -> Result<Option<WithdrawalDoc>> {
        let store = self.store.read().await;
        Ok(store.withdrawals.iter().find(|w| w.id == id).cloned())
    }

    async fn withdrawals(&self, query: &WithdrawalQuery) -> Result<Page<WithdrawalDoc>> {
        let store = self.store.read().await;
        let withdrawals = newest_first(
            store
                .withdrawals
                .iter()
                .filter(|w| query.user_id.as_ref().is_none_or(|u| &w.user_id == u))
                .filter(|w| query.status.is_none_or(|s| w.status == s))
                .cloned(),
        );
        Ok(Page::new(
            query.page.slice(&withdrawals),
            withdrawals.len() as u64,
            query.page,
        ))
    }

    async fn due_payouts(&self, now: DateTime, limit: usize) -> Result<Vec<PayoutQueueDoc>> {
        let store = self.store.read().await;
        let mut due: Vec<PayoutQueueDoc> = store
            .payouts
            .iter()
            .filter(|p| p.is_due(now))
            .cloned()
            .collect();
        // Stable sort keeps enqueue order among equal deadlines
        due.sort_by_key(|p| p.next_attempt_at.timestamp_millis());
        due.truncate(limit);
        Ok(due)
    }

    async fn payout_queue(&self, page: PageRequest) -> Result<Page<PayoutQueueDoc>> {
        let store = self.store.read().await;
        let mut queue = store.payouts.clone();
        queue.sort_by_key(|p| p.next_attempt_at.timestamp_millis());
        Ok(Page::new(page.slice(&queue), queue.len() as u64, page))
    }

    async fn global_position(&self, transaction_id: &str) -> Result<Option<GlobalPositionDoc>> {
        let store = self.store.read().await;
        Ok(store
            .positions
            .iter()
            .find(|p| p.transaction_id == transaction_id)
            .cloned())
    }

    async fn positions_at(&self, rank: Rank, positions: &[i64]) -> Result<Vec<GlobalPositionDoc>> {
        let store = self.store.read().await;
        Ok(store
            .positions
            .iter()
            .filter(|p| p.rank == rank && positions.contains(&p.position))
            .cloned()
            .collect())
    }

    async fn allocate_global_position(
        &self,
        rank: Rank,
        user_id: &str,
        transaction_id: &str,
    ) -> Result<GlobalPositionDoc> {
        let mut store = self.store.write().await;
        if let Some(existing) = store
            .positions
            .iter()
            .find(|p| p.transaction_id == transaction_id)
        {
            return Ok(existing.clone());
        }

        let counter = store.cycles.entry(rank).or_insert(0);
        *counter += 1;
        let position = GlobalPositionDoc::new(rank, *counter, user_id, transaction_id);
        store.positions.push(position.clone());
        Ok(position)
    }

    async fn rank_pools(&self) -> Result<Vec<RankPoolDoc>> {
        let store = self.store.read().await;
        let mut pools: Vec<RankPoolDoc> = store.rank_pools.values().cloned().collect();
        pools.sort_by_key(|p| p.rank);
        Ok(pools)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let store = self.store.read().await;
        let users = store.users.values();
        Ok(LedgerStats {
            users: store.users.len() as u64,
            activated_users: users.clone().filter(|u| u.rank.is_some()).count() as u64,
            blocked_users: users.clone().filter(|u| !u.is_active).count() as u64,
            total_available: users.clone().map(|u| u.balances.available).sum(),
            total_locked: users.clone().map(|u| u.balances.locked).sum(),
            total_pending: users.clone().map(|u| u.balances.pending).sum(),
            total_earnings: users.clone().map(|u| u.balances.total_earnings).sum(),
            total_withdrawn: users.map(|u| u.balances.total_withdrawn).sum(),
            pending_withdrawals: store
                .withdrawals
                .iter()
                .filter(|w| w.status == WithdrawalStatus::Pending)
                .count() as u64,
            queued_payouts: store.payouts.len() as u64,
            undistributed_activations: store
                .transactions
                .iter()
                .filter(|t| t.awaits_distribution())
                .count() as u64,
            rank_pool_balance: store.rank_pools.values().map(|p| p.balance).sum::<Amount>(),
        })
    }

    async fn commit(&self, batch: LedgerBatch) -> Result<()> {
        let mut store = self.store.write().await;
        let mut scratch = store.clone();
        for op in batch.into_ops() {
            scratch.apply(op)?;
        }
        *store = scratch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{BalanceDelta, CounterDelta};

    fn member(identifier: &str, code: &str) -> UserDoc {
        UserDoc::new(
            identifier.into(),
            identifier.into(),
            "hash".into(),
            code.into(),
            None,
        )
    }

    async fn seeded() -> (MemoryLedger, UserDoc) {
        let ledger = MemoryLedger::new();
        let user = member("a@example.com", "UPAAAAAA");
        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::InsertUser(user.clone()))
            .adjust_balance(&user.id, BalanceDelta::credit_available(Amount::from_units(10)));
        ledger.commit(batch).await.unwrap();
        (ledger, user)
    }

    #[tokio::test]
    async fn test_failed_op_rolls_back_batch() {
        let (ledger, user) = seeded().await;

        let mut batch = LedgerBatch::new();
        batch
            .adjust_balance(&user.id, BalanceDelta::credit_available(Amount::from_units(5)))
            .adjust_balance(&user.id, BalanceDelta::debit_available(Amount::from_units(100)));
        let err = ledger.commit(batch).await.unwrap_err();
        assert!(matches!(err, UplineError::InsufficientFunds(_)));

        let stored = ledger.user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(10));
    }

    #[tokio::test]
    async fn test_duplicate_identifier_conflicts() {
        let (ledger, _) = seeded().await;
        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::InsertUser(member("a@example.com", "UPBBBBBB")));
        assert!(ledger.commit(batch).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_rank_guard() {
        let (ledger, user) = seeded().await;
        let set = |from| {
            let mut batch = LedgerBatch::new();
            batch.push(LedgerOp::SetRank {
                user_id: user.id.clone(),
                from,
                to: Rank::Azurite,
                at: DateTime::now(),
            });
            batch
        };

        ledger.commit(set(None)).await.unwrap();
        // Second activation with a stale read
        assert!(ledger.commit(set(None)).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_counter_underflow_conflicts() {
        let (ledger, user) = seeded().await;
        let mut batch = LedgerBatch::new();
        batch.update_counters(
            &user.id,
            CounterDelta {
                team_size: -1,
                ..CounterDelta::default()
            },
        );
        assert!(ledger.commit(batch).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_global_position_is_idempotent_per_transaction() {
        let ledger = MemoryLedger::new();
        let first = ledger
            .allocate_global_position(Rank::Azurite, "u1", "tx1")
            .await
            .unwrap();
        let again = ledger
            .allocate_global_position(Rank::Azurite, "u1", "tx1")
            .await
            .unwrap();
        let second = ledger
            .allocate_global_position(Rank::Azurite, "u2", "tx2")
            .await
            .unwrap();
        let other_rank = ledger
            .allocate_global_position(Rank::Benitoite, "u3", "tx3")
            .await
            .unwrap();

        assert_eq!(first.position, 1);
        assert_eq!(again.position, 1);
        assert_eq!(second.position, 2);
        assert_eq!(other_rank.position, 1);

        let found = ledger.positions_at(Rank::Azurite, &[1, 2]).await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_due_payouts_ordering() {
        let ledger = MemoryLedger::new();
        let now = DateTime::from_millis(10_000);
        let w1 = WithdrawalDoc::new("u1", Amount::from_units(20), Amount::ZERO, "a".into());
        let w2 = WithdrawalDoc::new("u1", Amount::from_units(20), Amount::ZERO, "a".into());
        let mut late = PayoutQueueDoc::for_withdrawal(&w1, now);
        late.next_attempt_at = DateTime::from_millis(20_000);
        let early = PayoutQueueDoc::for_withdrawal(&w2, DateTime::from_millis(5_000));

        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::EnqueuePayout(late.clone()))
            .push(LedgerOp::EnqueuePayout(early.clone()));
        ledger.commit(batch).await.unwrap();

        let due = ledger.due_payouts(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, early.id);

        let all = ledger.due_payouts(DateTime::from_millis(30_000), 10).await.unwrap();
        assert_eq!(all.iter().map(|p| p.id.clone()).collect::<Vec<_>>(), vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn test_claim_payout_leases_once() {
        let ledger = MemoryLedger::new();
        let now = DateTime::from_millis(10_000);
        let w = WithdrawalDoc::new("u1", Amount::from_units(20), Amount::ZERO, "a".into());
        let entry = PayoutQueueDoc::for_withdrawal(&w, now);
        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::EnqueuePayout(entry.clone()));
        ledger.commit(batch).await.unwrap();

        let claim = || {
            let mut batch = LedgerBatch::new();
            batch.push(LedgerOp::ClaimPayout {
                entry_id: entry.id.clone(),
                expected_attempts: 0,
                expected_next_attempt_at: entry.next_attempt_at,
                lease_until: DateTime::from_millis(70_000),
            });
            batch
        };

        ledger.commit(claim()).await.unwrap();
        // A sweep holding the same stale read loses
        assert!(ledger.commit(claim()).await.unwrap_err().is_conflict());

        assert!(ledger.due_payouts(DateTime::from_millis(69_999), 10).await.unwrap().is_empty());
        let expired = ledger.due_payouts(DateTime::from_millis(70_000), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let (ledger, _) = seeded().await;
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.users, 1);
        assert_eq!(stats.activated_users, 0);
        assert_eq!(stats.total_available, Amount::from_units(10));
    }
}
