//! Per-activation commission distribution
//!
//! An activation pays, out of the rank price:
//! - referral income to the direct sponsor
//! - level income to uplines 1..=6 that hold the activated rank or higher
//! - global income to the nearest ancestors of the activator's slot in the
//!   rank's global cycle, locked until the recipient has enough active
//!   direct referrals
//! - a contribution to the rank's pool bucket
//!
//! Shares owed to unqualified members are not paid. Distribution commits
//! together with the transaction's `distributed` flag, so it happens once.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::schemas::{
    ancestor_positions, BalanceDelta, IncomeDoc, IncomeKind, IncomePoolDoc, TransactionDoc,
    TransactionKind, UserDoc,
};
use crate::income::plan::{IncomePlan, LEVEL_DEPTH};
use crate::income::Rank;
use crate::ledger::{with_conflict_retry, Ledger, LedgerBatch, LedgerOp};
use crate::team::walk_upline;
use crate::types::{Amount, Result, UplineError};

/// A single commission owed to a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    pub recipient_id: String,
    pub kind: IncomeKind,
    /// Upline level or global-cycle distance
    pub level: Option<u32>,
    pub amount: Amount,
    /// Held behind the referral gate
    pub locked: bool,
    /// Active direct referrals needed to release a locked credit
    pub required_referrals: u32,
}

/// Everything one activation pays out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credits {
    pub incomes: Vec<Credit>,
    /// Added to the rank's pool bucket
    pub pool_contribution: Amount,
}

impl Credits {
    pub fn total_paid(&self) -> Amount {
        self.incomes.iter().map(|c| c.amount).sum()
    }

    pub fn total_locked(&self) -> Amount {
        self.incomes.iter().filter(|c| c.locked).map(|c| c.amount).sum()
    }
}

/// Compute the credits for activating `rank`.
///
/// `upline` is the activator's sponsor chain, nearest first. `global` holds
/// the global-cycle ancestors with their distance (1 = parent slot).
pub fn compute_credits(
    plan: &IncomePlan,
    rank: Rank,
    activator_id: &str,
    upline: &[UserDoc],
    global: &[(u32, UserDoc)],
) -> Result<Credits> {
    let tier = plan.tier(rank)?;
    let price = tier.price;
    let mut incomes = Vec::new();

    let mut push = |recipient: &UserDoc,
                    kind: IncomeKind,
                    level: Option<u32>,
                    amount: Amount,
                    locked: bool,
                    required: u32| {
        if amount.is_positive() {
            incomes.push(Credit {
                recipient_id: recipient.id.clone(),
                kind,
                level,
                amount,
                locked,
                required_referrals: required,
            });
        }
    };

    if let Some(sponsor) = upline.first().filter(|s| s.is_qualified()) {
        push(sponsor, IncomeKind::Referral, None, price.percent_floor(tier.referral), false, 0);
    }

    for (i, upline_user) in upline.iter().take(LEVEL_DEPTH).enumerate() {
        let level = i + 1;
        let Some(bps) = plan.level(level) else { break };
        if upline_user.holds_rank(rank) {
            push(upline_user, IncomeKind::Level, Some(level as u32), price.percent_floor(bps), false, 0);
        }
    }

    for (distance, ancestor) in global {
        if ancestor.id == activator_id || !ancestor.is_qualified() {
            continue;
        }
        let locked = ancestor.active_direct_referrals < tier.unlock_referrals;
        push(
            ancestor,
            IncomeKind::Global,
            Some(*distance),
            price.percent_floor(tier.global),
            locked,
            tier.unlock_referrals,
        );
    }

    Ok(Credits {
        incomes,
        pool_contribution: price.percent_floor(tier.pool),
    })
}

/// Outcome of one distribution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub transaction_id: String,
    pub rank: Rank,
    /// Nothing was written because an earlier run already paid out
    pub already_distributed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_position: Option<i64>,
    pub incomes: usize,
    pub total_paid: Amount,
    pub total_locked: Amount,
    pub pool_contribution: Amount,
}

impl DistributionSummary {
    fn already(tx: &TransactionDoc, rank: Rank) -> Self {
        Self {
            transaction_id: tx.id.clone(),
            rank,
            already_distributed: true,
            global_position: None,
            incomes: 0,
            total_paid: Amount::ZERO,
            total_locked: Amount::ZERO,
            pool_contribution: Amount::ZERO,
        }
    }
}

/// Result of a retry sweep over undistributed activations
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRun {
    pub scanned: usize,
    pub distributed: usize,
    pub failed: usize,
    pub total_paid: Amount,
}

/// Pays commissions for activation transactions
#[derive(Clone)]
pub struct DistributionEngine {
    ledger: Arc<dyn Ledger>,
    plan: Arc<IncomePlan>,
}

impl DistributionEngine {
    pub fn new(ledger: Arc<dyn Ledger>, plan: Arc<IncomePlan>) -> Self {
        Self { ledger, plan }
    }

    /// Distribute one activation. Safe to call repeatedly.
    pub async fn distribute(&self, transaction_id: &str) -> Result<DistributionSummary> {
        with_conflict_retry("distribute", || self.try_distribute(transaction_id)).await
    }

    async fn try_distribute(&self, transaction_id: &str) -> Result<DistributionSummary> {
        let tx = self
            .ledger
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("Transaction {transaction_id} not found")))?;

        if tx.kind != TransactionKind::Activation {
            return Err(UplineError::BadRequest(format!(
                "Transaction {transaction_id} is not an activation"
            )));
        }
        let rank = tx.rank.ok_or_else(|| {
            UplineError::Internal(format!("Activation {transaction_id} has no rank"))
        })?;

        if tx.distributed {
            debug!(transaction_id, "Activation already distributed");
            return Ok(DistributionSummary::already(&tx, rank));
        }

        let activator = self
            .ledger
            .user(&tx.user_id)
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("User {} not found", tx.user_id)))?;

        let position = self
            .ledger
            .allocate_global_position(rank, &activator.id, &tx.id)
            .await?;
        let upline = walk_upline(self.ledger.as_ref(), &activator, LEVEL_DEPTH).await?;
        let global = self.global_ancestors(rank, position.position).await?;

        let credits = compute_credits(&self.plan, rank, &activator.id, &upline, &global)?;

        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::MarkDistributed {
            transaction_id: tx.id.clone(),
        });
        for credit in &credits.incomes {
            let mut income = IncomeDoc::new(&credit.recipient_id, credit.kind, rank, credit.amount, credit.locked)
                .from_activation(&activator.id, &tx.id);
            if let Some(level) = credit.level {
                income = income.at_level(level);
            }

            batch.adjust_balance(&credit.recipient_id, BalanceDelta::earn(credit.amount, credit.locked));
            if credit.locked {
                batch.push(LedgerOp::InsertPoolEntry(IncomePoolDoc::lock(
                    &income,
                    credit.required_referrals,
                )));
            }
            batch.push(LedgerOp::InsertIncome(income));
        }
        if credits.pool_contribution.is_positive() {
            batch.push(LedgerOp::AdjustRankPool {
                rank,
                balance: credits.pool_contribution,
                distributed: Amount::ZERO,
                accrued_at: None,
            });
        }

        self.ledger.commit(batch).await?;

        let summary = DistributionSummary {
            transaction_id: tx.id.clone(),
            rank,
            already_distributed: false,
            global_position: Some(position.position),
            incomes: credits.incomes.len(),
            total_paid: credits.total_paid(),
            total_locked: credits.total_locked(),
            pool_contribution: credits.pool_contribution,
        };

        info!(
            transaction_id = %summary.transaction_id,
            user_id = %activator.id,
            rank = %rank,
            position = position.position,
            incomes = summary.incomes,
            paid = %summary.total_paid,
            locked = %summary.total_locked,
            "Activation distributed"
        );

        Ok(summary)
    }

    /// Global-cycle ancestors of `position` with their distance
    async fn global_ancestors(&self, rank: Rank, position: i64) -> Result<Vec<(u32, UserDoc)>> {
        let ancestors = ancestor_positions(position, self.plan.global_depth);
        let holders = self.ledger.positions_at(rank, &ancestors).await?;

        let mut out = Vec::with_capacity(ancestors.len());
        for (i, slot) in ancestors.iter().enumerate() {
            let Some(holder) = holders.iter().find(|h| h.position == *slot) else {
                // Gap left by a lost allocation race
                continue;
            };
            if let Some(user) = self.ledger.user(&holder.user_id).await? {
                out.push((i as u32 + 1, user));
            }
        }
        Ok(out)
    }

    /// Retry activations whose distribution never committed
    pub async fn distribute_pending(&self, limit: usize) -> Result<PendingRun> {
        let pending = self.ledger.undistributed_activations(limit).await?;
        let mut run = PendingRun {
            scanned: pending.len(),
            ..PendingRun::default()
        };

        for tx in pending {
            match self.distribute(&tx.id).await {
                Ok(summary) => {
                    if !summary.already_distributed {
                        run.distributed += 1;
                        run.total_paid += summary.total_paid;
                    }
                }
                Err(e) => {
                    run.failed += 1;
                    warn!(transaction_id = %tx.id, error = %e, "Distribution retry failed");
                }
            }
        }

        if run.scanned > 0 {
            info!(
                scanned = run.scanned,
                distributed = run.distributed,
                failed = run.failed,
                "Pending distributions processed"
            );
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::PoolEntryStatus;
    use crate::ledger::{MemoryLedger, PageRequest};

    fn user(n: usize, sponsor: Option<&UserDoc>, rank: Option<Rank>) -> UserDoc {
        let mut user = UserDoc::new(
            format!("u{n}@example.com"),
            format!("User {n}"),
            "hash".into(),
            format!("UP{n:06}"),
            sponsor.map(|s| s.id.clone()),
        );
        user.rank = rank;
        user
    }

    #[test]
    fn test_credits_for_full_upline() {
        let plan = IncomePlan::standard();
        let mut upline = Vec::new();
        for n in 0..7 {
            upline.push(user(n, None, Some(Rank::Feldspar)));
        }

        let credits = compute_credits(&plan, Rank::Azurite, "activator", &upline, &[]).unwrap();

        // Price 10.00: referral 2.50, levels 1.00 .50 .30 .20 .10 .10
        let amounts: Vec<i64> = credits.incomes.iter().map(|c| c.amount.cents()).collect();
        assert_eq!(amounts, vec![250, 100, 50, 30, 20, 10, 10]);
        assert_eq!(credits.incomes[0].kind, IncomeKind::Referral);
        assert_eq!(credits.incomes[0].recipient_id, upline[0].id);
        assert_eq!(credits.incomes[6].level, Some(6));
        assert_eq!(credits.pool_contribution, Amount::from_cents(50));
        assert_eq!(credits.total_paid(), Amount::from_cents(470));
    }

    #[test]
    fn test_unqualified_uplines_are_skipped() {
        let plan = IncomePlan::standard();
        let sponsor = user(1, None, None);
        let low_rank = user(2, None, Some(Rank::Azurite));
        let mut blocked = user(3, None, Some(Rank::Feldspar));
        blocked.is_active = false;
        let qualified = user(4, None, Some(Rank::Crystals));

        let credits = compute_credits(
            &plan,
            Rank::Crystals,
            "activator",
            &[sponsor, low_rank, blocked, qualified.clone()],
            &[],
        )
        .unwrap();

        // Only level 4 qualifies: 2% of 40.00
        assert_eq!(credits.incomes.len(), 1);
        assert_eq!(credits.incomes[0].recipient_id, qualified.id);
        assert_eq!(credits.incomes[0].level, Some(4));
        assert_eq!(credits.incomes[0].amount, Amount::from_cents(80));
    }

    #[test]
    fn test_global_income_lock_gate() {
        let plan = IncomePlan::standard();
        let mut gated = user(1, None, Some(Rank::Azurite));
        gated.active_direct_referrals = 1;
        let mut unlocked = user(2, None, Some(Rank::Azurite));
        unlocked.active_direct_referrals = 2;

        let credits = compute_credits(
            &plan,
            Rank::Azurite,
            "activator",
            &[],
            &[(1, gated.clone()), (2, unlocked.clone())],
        )
        .unwrap();

        assert_eq!(credits.incomes.len(), 2);
        assert!(credits.incomes[0].locked);
        assert_eq!(credits.incomes[0].required_referrals, 2);
        assert_eq!(credits.incomes[0].amount, Amount::from_cents(50));
        assert!(!credits.incomes[1].locked);
        assert_eq!(credits.total_locked(), Amount::from_cents(50));
    }

    /// Insert users and one activation for `activator`
    async fn setup(users: &[UserDoc], activator: &UserDoc, rank: Rank) -> (Arc<MemoryLedger>, TransactionDoc) {
        let ledger = Arc::new(MemoryLedger::new());
        let tx = TransactionDoc::activation(&activator.id, rank, IncomePlan::standard().tier(rank).unwrap().price);
        let mut batch = LedgerBatch::new();
        for u in users {
            batch.push(LedgerOp::InsertUser(u.clone()));
        }
        batch.push(LedgerOp::InsertTransaction(tx.clone()));
        ledger.commit(batch).await.unwrap();
        (ledger, tx)
    }

    #[tokio::test]
    async fn test_distribute_credits_balances_once() {
        let sponsor = user(1, None, Some(Rank::Azurite));
        let activator = user(2, Some(&sponsor), Some(Rank::Azurite));
        let (ledger, tx) = setup(&[sponsor.clone(), activator.clone()], &activator, Rank::Azurite).await;
        let engine = DistributionEngine::new(ledger.clone(), Arc::new(IncomePlan::standard()));

        let summary = engine.distribute(&tx.id).await.unwrap();
        assert!(!summary.already_distributed);
        assert_eq!(summary.global_position, Some(1));
        // Referral 2.50 + level 1 1.00
        assert_eq!(summary.total_paid, Amount::from_cents(350));

        let again = engine.distribute(&tx.id).await.unwrap();
        assert!(again.already_distributed);

        let stored = ledger.user(&sponsor.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_cents(350));
        assert_eq!(stored.balances.total_earnings, Amount::from_cents(350));

        let incomes = ledger
            .incomes_for(&sponsor.id, None, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(incomes.total, 2);

        let pools = ledger.rank_pools().await.unwrap();
        assert_eq!(pools[0].balance, Amount::from_cents(50));
        assert!(ledger.transaction(&tx.id).await.unwrap().unwrap().distributed);
    }

    #[tokio::test]
    async fn test_global_ancestor_gets_locked_income() {
        let first = user(1, None, Some(Rank::Azurite));
        let second = user(2, None, Some(Rank::Azurite));
        let ledger = Arc::new(MemoryLedger::new());
        let plan = Arc::new(IncomePlan::standard());
        let price = plan.tier(Rank::Azurite).unwrap().price;

        let tx1 = TransactionDoc::activation(&first.id, Rank::Azurite, price);
        let tx2 = TransactionDoc::activation(&second.id, Rank::Azurite, price);
        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::InsertUser(first.clone()))
            .push(LedgerOp::InsertUser(second.clone()))
            .push(LedgerOp::InsertTransaction(tx1.clone()))
            .push(LedgerOp::InsertTransaction(tx2.clone()));
        ledger.commit(batch).await.unwrap();

        let engine = DistributionEngine::new(ledger.clone(), plan);
        let run = engine.distribute_pending(10).await.unwrap();
        assert_eq!(run.scanned, 2);
        assert_eq!(run.distributed, 2);
        assert_eq!(run.failed, 0);

        // Position 2 sits under position 1
        let stored = ledger.user(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.locked, Amount::from_cents(50));
        assert_eq!(stored.balances.available, Amount::ZERO);

        let entries = ledger
            .pool_entries_for(&first.id, Some(PoolEntryStatus::Locked))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, IncomeKind::Global);
        assert_eq!(entries[0].required_referrals, 2);

        assert!(ledger.undistributed_activations(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_activation() {
        let member = user(1, None, None);
        let ledger = Arc::new(MemoryLedger::new());
        let topup = TransactionDoc::topup(&member.id, "admin", Amount::from_units(5), None);
        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::InsertUser(member))
            .push(LedgerOp::InsertTransaction(topup.clone()));
        ledger.commit(batch).await.unwrap();

        let engine = DistributionEngine::new(ledger, Arc::new(IncomePlan::standard()));
        let err = engine.distribute(&topup.id).await.unwrap_err();
        assert!(matches!(err, UplineError::BadRequest(_)));
    }
}
