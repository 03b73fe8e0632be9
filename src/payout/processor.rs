//! Payout queue sweep
//!
//! A sweep first leases each due entry with a guarded `ClaimPayout` write,
//! which pushes its next attempt past the lease. Only the sweep that wins the
//! claim calls the gateway; a concurrent sweep sees a conflict and skips the
//! entry. Success completes the withdrawal; failure either reschedules with
//! exponential backoff or, once the attempt budget is spent, rejects the
//! withdrawal and refunds the held amount. If the process dies mid-payout the
//! entry becomes due again when the lease runs out.

use bson::DateTime;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::schemas::{
    BalanceDelta, PayoutQueueDoc, TransactionDoc, WithdrawalDoc, WithdrawalStatus,
};
use crate::ledger::{Ledger, LedgerBatch, LedgerOp};
use crate::payout::gateway::{PayoutGateway, PayoutRequest};
use crate::types::{Result, UplineError};
use crate::withdrawal::rejection_ops;

/// Default number of attempts before a payout is refunded
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff unit
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Default entries taken per sweep
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default time a claimed entry stays hidden from other sweeps
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

// 2^16 minutes is already past a month
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempts`-th failure: `2^attempts * base`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(MAX_BACKOFF_EXPONENT);
        self.backoff_base.saturating_mul(factor)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn next_attempt_at(&self, attempts: u32, now: DateTime) -> DateTime {
        let delay = i64::try_from(self.delay_for(attempts).as_millis()).unwrap_or(i64::MAX);
        DateTime::from_millis(now.timestamp_millis().saturating_add(delay))
    }
}

/// What happened to one queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed,
    Retried,
    Refunded,
    Stale,
    /// Another sweep holds the claim
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub refunded: usize,
    pub stale: usize,
    pub skipped: usize,
    /// Entries whose ledger write failed; they stay queued
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: SweepOutcome) {
        match outcome {
            SweepOutcome::Completed => self.completed += 1,
            SweepOutcome::Retried => self.retried += 1,
            SweepOutcome::Refunded => self.refunded += 1,
            SweepOutcome::Stale => self.stale += 1,
            SweepOutcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct PayoutProcessor {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PayoutGateway>,
    policy: RetryPolicy,
    batch_size: usize,
    claim_lease: Duration,
}

impl PayoutProcessor {
    pub fn new(ledger: Arc<dyn Ledger>, gateway: Arc<dyn PayoutGateway>) -> Self {
        Self {
            ledger,
            gateway,
            policy: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Must outlast a gateway call, or a slow send can be claimed twice
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Process every entry due at `now`, oldest first
    pub async fn sweep(&self, now: DateTime) -> Result<SweepReport> {
        let due = self.ledger.due_payouts(now, self.batch_size).await?;
        let mut report = SweepReport::default();
        if due.is_empty() {
            debug!("No payouts due");
            return Ok(report);
        }

        for entry in due {
            report.processed += 1;
            match self.process(&entry, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    report.errors += 1;
                    error!(
                        entry_id = %entry.id,
                        withdrawal_id = %entry.withdrawal_id,
                        error = %e,
                        "Failed to record payout outcome"
                    );
                }
            }
        }

        info!(
            gateway = self.gateway.name(),
            processed = report.processed,
            completed = report.completed,
            retried = report.retried,
            refunded = report.refunded,
            stale = report.stale,
            skipped = report.skipped,
            errors = report.errors,
            "Payout sweep finished"
        );
        Ok(report)
    }

    pub async fn process(&self, entry: &PayoutQueueDoc, now: DateTime) -> Result<SweepOutcome> {
        let withdrawal = match self.ledger.withdrawal(&entry.withdrawal_id).await? {
            Some(w) if w.status == WithdrawalStatus::Processing => w,
            other => {
                warn!(
                    entry_id = %entry.id,
                    withdrawal_id = %entry.withdrawal_id,
                    status = ?other.map(|w| w.status),
                    "Dropping stale payout entry"
                );
                let mut batch = LedgerBatch::new();
                batch.push(LedgerOp::RemovePayout {
                    entry_id: entry.id.clone(),
                });
                match self.ledger.commit(batch).await {
                    // Another sweep removed it already
                    Ok(()) | Err(UplineError::Conflict(_)) => return Ok(SweepOutcome::Stale),
                    Err(e) => return Err(e),
                }
            }
        };

        if !self.claim(entry, now).await? {
            debug!(entry_id = %entry.id, "Payout claimed by another sweep");
            return Ok(SweepOutcome::Skipped);
        }

        let request = PayoutRequest::from_entry(entry);
        match self.gateway.send(&request).await {
            Ok(receipt) => {
                self.complete(entry, &withdrawal, &receipt.reference, now).await?;
                info!(
                    withdrawal_id = %withdrawal.id,
                    amount = %entry.amount,
                    reference = %receipt.reference,
                    attempt = request.attempt,
                    "Payout completed"
                );
                Ok(SweepOutcome::Completed)
            }
            Err(e) => {
                let attempts = entry.attempts + 1;
                let message = e.to_string();
                if self.policy.is_exhausted(attempts) {
                    self.refund(entry, &withdrawal, attempts, &message, now).await?;
                    warn!(
                        withdrawal_id = %withdrawal.id,
                        attempts,
                        error = %message,
                        "Payout failed permanently, withdrawal refunded"
                    );
                    Ok(SweepOutcome::Refunded)
                } else {
                    let next_attempt_at = self.policy.next_attempt_at(attempts, now);
                    let mut batch = LedgerBatch::new();
                    batch.push(LedgerOp::ReschedulePayout {
                        entry_id: entry.id.clone(),
                        expected_attempts: entry.attempts,
                        next_attempt_at,
                        last_error: message.clone(),
                    });
                    self.ledger.commit(batch).await?;
                    warn!(
                        withdrawal_id = %withdrawal.id,
                        attempts,
                        next_attempt_at = %next_attempt_at,
                        error = %message,
                        "Payout failed, rescheduled"
                    );
                    Ok(SweepOutcome::Retried)
                }
            }
        }
    }

    /// Lease the entry to this sweep; false if another sweep got there first
    async fn claim(&self, entry: &PayoutQueueDoc, now: DateTime) -> Result<bool> {
        let lease = i64::try_from(self.claim_lease.as_millis()).unwrap_or(i64::MAX);
        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::ClaimPayout {
            entry_id: entry.id.clone(),
            expected_attempts: entry.attempts,
            expected_next_attempt_at: entry.next_attempt_at,
            lease_until: DateTime::from_millis(now.timestamp_millis().saturating_add(lease)),
        });
        match self.ledger.commit(batch).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn complete(
        &self,
        entry: &PayoutQueueDoc,
        withdrawal: &WithdrawalDoc,
        reference: &str,
        now: DateTime,
    ) -> Result<()> {
        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::TransitionWithdrawal {
                withdrawal_id: withdrawal.id.clone(),
                from: WithdrawalStatus::Processing,
                to: WithdrawalStatus::Completed,
                reason: None,
                payout_reference: Some(reference.to_string()),
                at: now,
            })
            .adjust_balance(&withdrawal.user_id, BalanceDelta::settle_withdrawal(withdrawal.amount))
            .push(LedgerOp::RemovePayout {
                entry_id: entry.id.clone(),
            })
            .push(LedgerOp::InsertTransaction(TransactionDoc::withdrawal(
                &withdrawal.user_id,
                &withdrawal.id,
                withdrawal.amount,
            )));
        self.ledger.commit(batch).await
    }

    async fn refund(
        &self,
        entry: &PayoutQueueDoc,
        withdrawal: &WithdrawalDoc,
        attempts: u32,
        last_error: &str,
        now: DateTime,
    ) -> Result<()> {
        let reason = format!("Payout failed after {attempts} attempts: {last_error}");
        let mut batch = LedgerBatch::new();
        rejection_ops(&mut batch, withdrawal, WithdrawalStatus::Processing, &reason, now);
        batch.push(LedgerOp::RemovePayout {
            entry_id: entry.id.clone(),
        });
        self.ledger.commit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{TransactionKind, UserDoc};
    use crate::ledger::{MemoryLedger, PageRequest};
    use crate::payout::gateway::PayoutReceipt;
    use crate::types::Amount;
    use crate::withdrawal::{WithdrawalService, WithdrawalSettings};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of outcomes; succeeds once the script runs out
    #[derive(Default)]
    struct ScriptedGateway {
        script: Mutex<VecDeque<std::result::Result<String, String>>>,
        calls: Mutex<Vec<PayoutRequest>>,
        delay: Duration,
    }

    impl ScriptedGateway {
        fn failing(times: usize) -> Self {
            let gateway = Self::default();
            {
                let mut script = gateway.script.lock().unwrap();
                for _ in 0..times {
                    script.push_back(Err("gateway timeout".into()));
                }
            }
            gateway
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PayoutGateway for ScriptedGateway {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
            self.calls.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Err(message)) => Err(UplineError::Payout(message)),
                Some(Ok(reference)) => Ok(PayoutReceipt { reference }),
                None => Ok(PayoutReceipt {
                    reference: format!("ref-{}", request.withdrawal_id),
                }),
            }
        }
    }

    fn at(seconds: i64) -> DateTime {
        DateTime::from_millis(1_700_000_000_000 + seconds * 1000)
    }

    /// A member with 50.00 who asked for 20.00, approved at t=0
    async fn queued() -> (Arc<MemoryLedger>, UserDoc, WithdrawalDoc) {
        let ledger = Arc::new(MemoryLedger::new());
        let mut user = UserDoc::new(
            "p@example.com".into(),
            "P".into(),
            "hash".into(),
            "UPPPPPPP".into(),
            None,
        );
        user.payout_address = Some("acct-9".into());
        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::InsertUser(user.clone()))
            .adjust_balance(&user.id, BalanceDelta::credit_available(Amount::from_units(50)));
        ledger.commit(batch).await.unwrap();

        let withdrawals = WithdrawalService::new(
            ledger.clone(),
            WithdrawalSettings {
                auto_approve: true,
                ..Default::default()
            },
        );
        let w = withdrawals
            .request(&user.id, Amount::from_units(20), None, at(0))
            .await
            .unwrap();
        (ledger, user, w)
    }

    fn processor(ledger: Arc<MemoryLedger>, gateway: Arc<ScriptedGateway>) -> PayoutProcessor {
        PayoutProcessor::new(ledger, gateway)
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for(3), Duration::from_secs(480));
        assert_eq!(policy.next_attempt_at(1, at(0)), at(120));

        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        // Absurd attempt counts saturate instead of overflowing
        assert!(policy.delay_for(200) >= policy.delay_for(16));
    }

    #[tokio::test]
    async fn test_successful_payout_settles() {
        let (ledger, user, w) = queued().await;
        let gateway = Arc::new(ScriptedGateway::default());

        let report = processor(ledger.clone(), gateway.clone()).sweep(at(0)).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(gateway.calls.lock().unwrap()[0].amount, Amount::from_units(19));

        let done = ledger.withdrawal(&w.id).await.unwrap().unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);
        assert_eq!(done.payout_reference.as_deref(), Some(format!("ref-{}", w.id).as_str()));
        assert!(done.completed_at.is_some());

        let stored = ledger.user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(30));
        assert_eq!(stored.balances.pending, Amount::ZERO);
        assert_eq!(stored.balances.total_withdrawn, Amount::from_units(20));

        assert!(ledger.due_payouts(at(10_000), 10).await.unwrap().is_empty());
        let history = ledger.transactions_for(&user.id, PageRequest::default()).await.unwrap();
        assert!(history.items.iter().any(|t| t.kind == TransactionKind::Withdrawal));
    }

    #[tokio::test]
    async fn test_failure_reschedules_with_backoff() {
        let (ledger, _user, w) = queued().await;
        let gateway = Arc::new(ScriptedGateway::failing(1));
        let processor = processor(ledger.clone(), gateway.clone());

        let report = processor.sweep(at(0)).await.unwrap();
        assert_eq!(report.retried, 1);

        // Not due until 2^1 minutes later
        assert!(ledger.due_payouts(at(119), 10).await.unwrap().is_empty());
        let due = ledger.due_payouts(at(120), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert!(due[0].last_error.as_deref().unwrap().contains("gateway timeout"));

        // Nothing due in between means no extra gateway calls
        processor.sweep(at(60)).await.unwrap();
        assert_eq!(gateway.call_count(), 1);

        let report = processor.sweep(at(120)).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(gateway.calls.lock().unwrap()[1].attempt, 2);
        let done = ledger.withdrawal(&w.id).await.unwrap().unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);
    }

    #[tokio::test]
    async fn test_third_failure_refunds() {
        let (ledger, user, w) = queued().await;
        let gateway = Arc::new(ScriptedGateway::failing(5));
        let processor = processor(ledger.clone(), gateway.clone());

        assert_eq!(processor.sweep(at(0)).await.unwrap().retried, 1);
        assert_eq!(processor.sweep(at(120)).await.unwrap().retried, 1);
        // Second failure waits 2^2 minutes
        assert_eq!(processor.sweep(at(300)).await.unwrap().processed, 0);
        let report = processor.sweep(at(360)).await.unwrap();
        assert_eq!(report.refunded, 1);
        assert_eq!(gateway.call_count(), 3);

        let rejected = ledger.withdrawal(&w.id).await.unwrap().unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
        assert!(rejected.reason.as_deref().unwrap().contains("after 3 attempts"));

        let stored = ledger.user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(50));
        assert_eq!(stored.balances.pending, Amount::ZERO);
        assert_eq!(stored.balances.total_withdrawn, Amount::ZERO);

        // Queue is empty and the gateway is never called again
        processor.sweep(at(100_000)).await.unwrap();
        assert_eq!(gateway.call_count(), 3);

        let history = ledger.transactions_for(&user.id, PageRequest::default()).await.unwrap();
        assert!(history.items.iter().any(|t| t.kind == TransactionKind::Refund));
    }

    #[tokio::test]
    async fn test_stale_entry_removed() {
        let (ledger, _user, w) = queued().await;

        // Someone settled the withdrawal out of band
        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::TransitionWithdrawal {
            withdrawal_id: w.id.clone(),
            from: WithdrawalStatus::Processing,
            to: WithdrawalStatus::Completed,
            reason: None,
            payout_reference: Some("manual".into()),
            at: at(0),
        });
        ledger.commit(batch).await.unwrap();

        let gateway = Arc::new(ScriptedGateway::default());
        let report = processor(ledger.clone(), gateway.clone()).sweep(at(0)).await.unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(gateway.call_count(), 0);
        assert!(ledger.due_payouts(at(0), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_pay_once() {
        let (ledger, user, w) = queued().await;
        let gateway = Arc::new(ScriptedGateway::slow(Duration::from_millis(50)));
        let first = processor(ledger.clone(), gateway.clone());
        let second = processor(ledger.clone(), gateway.clone());

        let (a, b) = tokio::join!(first.sweep(at(0)), second.sweep(at(0)));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(gateway.call_count(), 1);
        assert_eq!(a.completed + b.completed, 1);
        assert_eq!(a.errors + b.errors, 0);

        let done = ledger.withdrawal(&w.id).await.unwrap().unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);
        let stored = ledger.user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.total_withdrawn, Amount::from_units(20));
    }

    #[tokio::test]
    async fn test_claimed_entry_hidden_until_lease_expires() {
        let (ledger, _user, _w) = queued().await;
        let entry = ledger.due_payouts(at(0), 10).await.unwrap().remove(0);

        // A sweep that died after claiming, before recording an outcome
        let crashed = processor(ledger.clone(), Arc::new(ScriptedGateway::default()))
            .with_claim_lease(Duration::from_secs(600));
        assert!(crashed.claim(&entry, at(0)).await.unwrap());
        assert!(!crashed.claim(&entry, at(0)).await.unwrap());

        let gateway = Arc::new(ScriptedGateway::default());
        let processor = processor(ledger.clone(), gateway.clone());
        assert_eq!(processor.sweep(at(599)).await.unwrap().processed, 0);
        assert_eq!(gateway.call_count(), 0);

        let report = processor.sweep(at(600)).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(gateway.calls.lock().unwrap()[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_lost_claim_is_skipped() {
        let (ledger, _user, w) = queued().await;
        let entry = ledger.due_payouts(at(0), 10).await.unwrap().remove(0);
        let gateway = Arc::new(ScriptedGateway::default());
        let processor = processor(ledger.clone(), gateway.clone());

        assert!(processor.claim(&entry, at(0)).await.unwrap());
        // Same snapshot again: the claim guard fails and nothing is sent
        let outcome = processor.process(&entry, at(0)).await.unwrap();
        assert_eq!(outcome, SweepOutcome::Skipped);
        assert_eq!(gateway.call_count(), 0);

        let pending = ledger.withdrawal(&w.id).await.unwrap().unwrap();
        assert_eq!(pending.status, WithdrawalStatus::Processing);
    }

    #[tokio::test]
    async fn test_custom_policy_single_attempt() {
        let (ledger, _user, w) = queued().await;
        let gateway = Arc::new(ScriptedGateway::failing(1));
        let processor = processor(ledger.clone(), gateway).with_policy(RetryPolicy {
            max_attempts: 1,
            backoff_base: Duration::from_secs(1),
        });

        let report = processor.sweep(at(0)).await.unwrap();
        assert_eq!(report.refunded, 1);
        let rejected = ledger.withdrawal(&w.id).await.unwrap().unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
    }
}
