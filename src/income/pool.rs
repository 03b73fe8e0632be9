//! Rank pool accrual and lock-gated claims
//!
//! Activations feed a bucket per rank. Accrual splits each bucket evenly
//! between active members holding that rank or higher; the cents that do
//! not divide evenly stay in the bucket for the next run. Pool shares, like
//! global income, sit in the locked balance until the member has enough
//! active direct referrals, and are released by an explicit claim.

use bson::DateTime;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::schemas::{
    BalanceDelta, IncomeDoc, IncomeKind, IncomePoolDoc, PoolEntryStatus, UserDoc,
};
use crate::income::plan::IncomePlan;
use crate::income::Rank;
use crate::ledger::{with_conflict_retry, Ledger, LedgerBatch, LedgerOp};
use crate::types::{Amount, Result, UplineError};

/// What accrual did for one rank
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankAccrual {
    pub rank: Rank,
    pub holders: usize,
    pub share: Amount,
    pub distributed: Amount,
    pub remainder: Amount,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrualReport {
    pub ranks: Vec<RankAccrual>,
    pub total_distributed: Amount,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResult {
    pub released: Amount,
    pub entries: usize,
    /// Still locked after this claim
    pub remaining_locked: Amount,
}

/// Locked income overview for one member
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub active_direct_referrals: u32,
    pub locked: Amount,
    /// Part of `locked` a claim would release now
    pub claimable: Amount,
    /// Smallest referral count that would release anything more
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_threshold: Option<u32>,
    pub entries: Vec<IncomePoolDoc>,
}

/// Rank pool bookkeeping
#[derive(Clone)]
pub struct PoolService {
    ledger: Arc<dyn Ledger>,
    plan: Arc<IncomePlan>,
}

impl PoolService {
    pub fn new(ledger: Arc<dyn Ledger>, plan: Arc<IncomePlan>) -> Self {
        Self { ledger, plan }
    }

    /// Split every non-empty rank bucket between its eligible holders
    pub async fn accrue(&self, now: DateTime) -> Result<AccrualReport> {
        let mut report = AccrualReport::default();

        for bucket in self.ledger.rank_pools().await? {
            if !bucket.balance.is_positive() {
                continue;
            }
            let rank = bucket.rank;
            if let Some(accrual) =
                with_conflict_retry("pool_accrual", || self.accrue_rank(rank, now)).await?
            {
                report.total_distributed += accrual.distributed;
                report.ranks.push(accrual);
            }
        }

        info!(
            ranks = report.ranks.len(),
            distributed = %report.total_distributed,
            "Pool accrual finished"
        );
        Ok(report)
    }

    async fn accrue_rank(&self, rank: Rank, now: DateTime) -> Result<Option<RankAccrual>> {
        let Some(bucket) = self
            .ledger
            .rank_pools()
            .await?
            .into_iter()
            .find(|p| p.rank == rank)
        else {
            return Ok(None);
        };

        let holders = self.ledger.users_at_or_above(rank).await?;
        if holders.is_empty() {
            debug!(rank = %rank, "No pool holders, bucket carried over");
            return Ok(None);
        }

        let (share, remainder) = bucket.balance.split_even(holders.len() as u64);
        if !share.is_positive() {
            debug!(rank = %rank, balance = %bucket.balance, "Pool share rounds to zero");
            return Ok(None);
        }
        let distributed = share.times(holders.len() as u64);
        let unlock = self.plan.tier(rank)?.unlock_referrals;

        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::AdjustRankPool {
            rank,
            balance: -distributed,
            distributed,
            accrued_at: Some(now),
        });
        for holder in &holders {
            let locked = holder.active_direct_referrals < unlock;
            let income = IncomeDoc::new(&holder.id, IncomeKind::Pool, rank, share, locked);
            batch.adjust_balance(&holder.id, BalanceDelta::earn(share, locked));
            if locked {
                batch.push(LedgerOp::InsertPoolEntry(IncomePoolDoc::lock(&income, unlock)));
            }
            batch.push(LedgerOp::InsertIncome(income));
        }

        self.ledger.commit(batch).await?;

        debug!(rank = %rank, holders = holders.len(), share = %share, "Rank pool accrued");
        Ok(Some(RankAccrual {
            rank,
            holders: holders.len(),
            share,
            distributed,
            remainder,
        }))
    }

    /// Release every locked entry the member now qualifies for
    pub async fn claim(&self, user_id: &str, now: DateTime) -> Result<ClaimResult> {
        with_conflict_retry("pool_claim", || self.try_claim(user_id, now)).await
    }

    async fn try_claim(&self, user_id: &str, now: DateTime) -> Result<ClaimResult> {
        let user = self.load_user(user_id).await?;
        if !user.is_active {
            return Err(UplineError::Forbidden("Account is blocked".into()));
        }

        let locked = self
            .ledger
            .pool_entries_for(user_id, Some(PoolEntryStatus::Locked))
            .await?;
        if locked.is_empty() {
            return Err(UplineError::NothingToClaim);
        }

        let current = user.active_direct_referrals;
        let (claimable, remaining): (Vec<_>, Vec<_>) =
            locked.into_iter().partition(|e| e.is_claimable_with(current));

        if claimable.is_empty() {
            let required = remaining
                .iter()
                .map(|e| e.required_referrals)
                .min()
                .unwrap_or_default();
            return Err(UplineError::ClaimLocked { required, current });
        }

        let released: Amount = claimable.iter().map(|e| e.amount).sum();
        let mut batch = LedgerBatch::new();
        for entry in &claimable {
            batch.push(LedgerOp::ReleasePoolEntry {
                entry_id: entry.id.clone(),
                at: now,
            });
        }
        batch.adjust_balance(user_id, BalanceDelta::release_locked(released));
        self.ledger.commit(batch).await?;

        info!(user_id, released = %released, entries = claimable.len(), "Locked income claimed");

        Ok(ClaimResult {
            released,
            entries: claimable.len(),
            remaining_locked: remaining.iter().map(|e| e.amount).sum(),
        })
    }

    /// Locked entries and what a claim would release right now
    pub async fn summary(&self, user_id: &str) -> Result<PoolSummary> {
        let user = self.load_user(user_id).await?;
        let entries = self
            .ledger
            .pool_entries_for(user_id, Some(PoolEntryStatus::Locked))
            .await?;
        let current = user.active_direct_referrals;

        Ok(PoolSummary {
            active_direct_referrals: current,
            locked: entries.iter().map(|e| e.amount).sum(),
            claimable: entries
                .iter()
                .filter(|e| e.is_claimable_with(current))
                .map(|e| e.amount)
                .sum(),
            next_threshold: entries
                .iter()
                .map(|e| e.required_referrals)
                .filter(|r| *r > current)
                .min(),
            entries,
        })
    }

    async fn load_user(&self, user_id: &str) -> Result<UserDoc> {
        self.ledger
            .user(user_id)
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("User {user_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::CounterDelta;
    use crate::ledger::MemoryLedger;

    fn holder(n: usize, rank: Rank) -> UserDoc {
        let mut user = UserDoc::new(
            format!("p{n}@example.com"),
            format!("Holder {n}"),
            "hash".into(),
            format!("UP{n:06}"),
            None,
        );
        user.rank = Some(rank);
        user
    }

    async fn ledger_with(users: &[UserDoc], bucket: Option<(Rank, Amount)>) -> Arc<MemoryLedger> {
        let ledger = Arc::new(MemoryLedger::new());
        let mut batch = LedgerBatch::new();
        for u in users {
            batch.push(LedgerOp::InsertUser(u.clone()));
        }
        if let Some((rank, balance)) = bucket {
            batch.push(LedgerOp::AdjustRankPool {
                rank,
                balance,
                distributed: Amount::ZERO,
                accrued_at: None,
            });
        }
        ledger.commit(batch).await.unwrap();
        ledger
    }

    fn service(ledger: Arc<MemoryLedger>) -> PoolService {
        PoolService::new(ledger, Arc::new(IncomePlan::standard()))
    }

    #[tokio::test]
    async fn test_accrual_splits_and_keeps_remainder() {
        let low = holder(1, Rank::Azurite);
        let mid = holder(2, Rank::Benitoite);
        let high = holder(3, Rank::Feldspar);
        let ledger = ledger_with(
            &[low.clone(), mid.clone(), high.clone()],
            Some((Rank::Benitoite, Amount::from_cents(101))),
        )
        .await;

        let report = service(ledger.clone()).accrue(DateTime::now()).await.unwrap();
        assert_eq!(report.ranks.len(), 1);
        assert_eq!(report.ranks[0].holders, 2);
        assert_eq!(report.ranks[0].share, Amount::from_cents(50));
        assert_eq!(report.total_distributed, Amount::from_cents(100));

        let pools = ledger.rank_pools().await.unwrap();
        assert_eq!(pools[0].balance, Amount::from_cents(1));
        assert_eq!(pools[0].total_distributed, Amount::from_cents(100));

        // Below the bucket's rank: nothing
        let low = ledger.user(&low.id).await.unwrap().unwrap();
        assert_eq!(low.balances.total_earnings, Amount::ZERO);

        // No direct referrals yet: the share is locked
        let high = ledger.user(&high.id).await.unwrap().unwrap();
        assert_eq!(high.balances.locked, Amount::from_cents(50));
        assert_eq!(high.balances.available, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_accrual_without_holders_keeps_bucket() {
        let ledger = ledger_with(&[], Some((Rank::Diamond, Amount::from_units(3)))).await;
        let report = service(ledger.clone()).accrue(DateTime::now()).await.unwrap();
        assert!(report.ranks.is_empty());
        assert_eq!(ledger.rank_pools().await.unwrap()[0].balance, Amount::from_units(3));
    }

    #[tokio::test]
    async fn test_claim_gating() {
        let member = holder(1, Rank::Azurite);
        let ledger = ledger_with(&[member.clone()], Some((Rank::Azurite, Amount::from_units(2)))).await;
        let pool = service(ledger.clone());

        assert!(matches!(
            pool.claim(&member.id, DateTime::now()).await,
            Err(UplineError::NothingToClaim)
        ));

        pool.accrue(DateTime::now()).await.unwrap();

        let err = pool.claim(&member.id, DateTime::now()).await.unwrap_err();
        assert!(matches!(err, UplineError::ClaimLocked { required: 2, current: 0 }));

        let mut batch = LedgerBatch::new();
        batch.update_counters(
            &member.id,
            CounterDelta {
                active_direct_referrals: 2,
                ..CounterDelta::default()
            },
        );
        ledger.commit(batch).await.unwrap();

        let summary = pool.summary(&member.id).await.unwrap();
        assert_eq!(summary.claimable, Amount::from_units(2));

        let claimed = pool.claim(&member.id, DateTime::now()).await.unwrap();
        assert_eq!(claimed.released, Amount::from_units(2));
        assert_eq!(claimed.remaining_locked, Amount::ZERO);

        let stored = ledger.user(&member.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(2));
        assert_eq!(stored.balances.locked, Amount::ZERO);

        assert!(matches!(
            pool.claim(&member.id, DateTime::now()).await,
            Err(UplineError::NothingToClaim)
        ));
    }

    #[tokio::test]
    async fn test_unlocked_holder_is_paid_directly() {
        let mut member = holder(1, Rank::Crystals);
        member.active_direct_referrals = 3;
        let ledger = ledger_with(&[member.clone()], Some((Rank::Crystals, Amount::from_units(1)))).await;

        service(ledger.clone()).accrue(DateTime::now()).await.unwrap();

        let stored = ledger.user(&member.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(1));
        assert!(ledger
            .pool_entries_for(&member.id, None)
            .await
            .unwrap()
            .is_empty());
    }
}
