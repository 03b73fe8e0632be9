//! Withdrawal lifecycle: request, approve, reject, cancel

use bson::DateTime;
use std::sync::Arc;
use tracing::info;

use crate::db::schemas::{
    BalanceDelta, Metadata, PayoutQueueDoc, TransactionDoc, WithdrawalDoc, WithdrawalStatus,
};
use crate::ledger::{Ledger, LedgerBatch, LedgerOp, Page, PageRequest, WithdrawalQuery};
use crate::types::{Amount, Result, UplineError};
use crate::withdrawal::fees::{FeeQuote, FeeSchedule};

/// Reason recorded when a member withdraws their own request
pub const CANCELLED_BY_MEMBER: &str = "Cancelled by member";

#[derive(Debug, Clone, Copy, Default)]
pub struct WithdrawalSettings {
    pub fees: FeeSchedule,
    /// Skip admin review and queue payouts immediately
    pub auto_approve: bool,
}

/// Refund a withdrawal's gross amount and mark it rejected
pub fn rejection_ops(
    batch: &mut LedgerBatch,
    withdrawal: &WithdrawalDoc,
    from: WithdrawalStatus,
    reason: &str,
    now: DateTime,
) {
    batch
        .push(LedgerOp::TransitionWithdrawal {
            withdrawal_id: withdrawal.id.clone(),
            from,
            to: WithdrawalStatus::Rejected,
            reason: Some(reason.to_string()),
            payout_reference: None,
            at: now,
        })
        .adjust_balance(&withdrawal.user_id, BalanceDelta::refund_withdrawal(withdrawal.amount))
        .push(LedgerOp::InsertTransaction(TransactionDoc::refund(
            &withdrawal.user_id,
            &withdrawal.id,
            withdrawal.amount,
            reason,
        )));
}

#[derive(Clone)]
pub struct WithdrawalService {
    ledger: Arc<dyn Ledger>,
    settings: WithdrawalSettings,
}

impl WithdrawalService {
    pub fn new(ledger: Arc<dyn Ledger>, settings: WithdrawalSettings) -> Self {
        Self { ledger, settings }
    }

    pub fn quote(&self, amount: Amount) -> Result<FeeQuote> {
        self.settings.fees.quote(amount)
    }

    /// Hold `amount` and create a withdrawal for it
    pub async fn request(
        &self,
        user_id: &str,
        amount: Amount,
        destination: Option<String>,
        now: DateTime,
    ) -> Result<WithdrawalDoc> {
        let user = self
            .ledger
            .user(user_id)
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("User {user_id} not found")))?;
        if !user.is_active {
            return Err(UplineError::Forbidden("Account is blocked".into()));
        }

        let destination = destination
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .or_else(|| user.payout_address.clone().filter(|a| !a.trim().is_empty()))
            .ok_or_else(|| UplineError::BadRequest("No payout destination on file".into()))?;

        let quote = self.quote(amount)?;
        if user.balances.available < quote.amount {
            return Err(UplineError::InsufficientFunds(format!(
                "Available balance {} is below {}",
                user.balances.available, quote.amount
            )));
        }

        let mut withdrawal = WithdrawalDoc::new(user_id, quote.amount, quote.fee, destination);
        withdrawal.metadata = Metadata::at(now);

        let mut batch = LedgerBatch::new();
        batch.adjust_balance(user_id, BalanceDelta::hold_for_withdrawal(quote.amount));
        if self.settings.auto_approve {
            withdrawal.status = WithdrawalStatus::Processing;
            withdrawal.processed_at = Some(now);
            batch.push(LedgerOp::EnqueuePayout(PayoutQueueDoc::for_withdrawal(&withdrawal, now)));
        }
        batch.push(LedgerOp::InsertWithdrawal(withdrawal.clone()));

        // The balance guard catches a concurrent spend between read and commit
        self.ledger.commit(batch).await?;

        info!(
            withdrawal_id = %withdrawal.id,
            user_id,
            amount = %withdrawal.amount,
            fee = %withdrawal.fee,
            status = %withdrawal.status,
            "Withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// Pending -> processing, queueing the payout
    pub async fn approve(&self, withdrawal_id: &str, now: DateTime) -> Result<WithdrawalDoc> {
        let withdrawal = self.load_in(withdrawal_id, WithdrawalStatus::Pending).await?;

        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::TransitionWithdrawal {
                withdrawal_id: withdrawal.id.clone(),
                from: WithdrawalStatus::Pending,
                to: WithdrawalStatus::Processing,
                reason: None,
                payout_reference: None,
                at: now,
            })
            .push(LedgerOp::EnqueuePayout(PayoutQueueDoc::for_withdrawal(&withdrawal, now)));
        self.ledger.commit(batch).await?;

        info!(withdrawal_id, net = %withdrawal.net_amount, "Withdrawal approved");
        self.reload(withdrawal_id).await
    }

    /// Pending -> rejected, refunding the held amount
    pub async fn reject(&self, withdrawal_id: &str, reason: &str, now: DateTime) -> Result<WithdrawalDoc> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(UplineError::BadRequest("A rejection reason is required".into()));
        }
        let withdrawal = self.load_in(withdrawal_id, WithdrawalStatus::Pending).await?;

        let mut batch = LedgerBatch::new();
        rejection_ops(&mut batch, &withdrawal, WithdrawalStatus::Pending, reason, now);
        self.ledger.commit(batch).await?;

        info!(withdrawal_id, refunded = %withdrawal.amount, reason, "Withdrawal rejected");
        self.reload(withdrawal_id).await
    }

    /// Member withdraws their own pending request
    pub async fn cancel(&self, user_id: &str, withdrawal_id: &str, now: DateTime) -> Result<WithdrawalDoc> {
        self.get_for(user_id, withdrawal_id).await?;
        self.reject(withdrawal_id, CANCELLED_BY_MEMBER, now).await
    }

    /// A member's own withdrawal; other members' ids read as missing
    pub async fn get_for(&self, user_id: &str, withdrawal_id: &str) -> Result<WithdrawalDoc> {
        self.ledger
            .withdrawal(withdrawal_id)
            .await?
            .filter(|w| w.user_id == user_id)
            .ok_or_else(|| UplineError::NotFound(format!("Withdrawal {withdrawal_id} not found")))
    }

    pub async fn list_for(&self, user_id: &str, page: PageRequest) -> Result<Page<WithdrawalDoc>> {
        self.ledger
            .withdrawals(&WithdrawalQuery {
                page,
                user_id: Some(user_id.to_string()),
                status: None,
            })
            .await
    }

    pub async fn list(&self, query: &WithdrawalQuery) -> Result<Page<WithdrawalDoc>> {
        self.ledger.withdrawals(query).await
    }

    async fn load_in(&self, withdrawal_id: &str, status: WithdrawalStatus) -> Result<WithdrawalDoc> {
        let withdrawal = self.reload(withdrawal_id).await?;
        if withdrawal.status != status {
            return Err(UplineError::Conflict(format!(
                "Withdrawal {withdrawal_id} is {}",
                withdrawal.status
            )));
        }
        Ok(withdrawal)
    }

    async fn reload(&self, withdrawal_id: &str) -> Result<WithdrawalDoc> {
        self.ledger
            .withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("Withdrawal {withdrawal_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::UserDoc;
    use crate::ledger::MemoryLedger;

    async fn funded(available: Amount) -> (Arc<MemoryLedger>, UserDoc) {
        let ledger = Arc::new(MemoryLedger::new());
        let mut user = UserDoc::new(
            "w@example.com".into(),
            "W".into(),
            "hash".into(),
            "UPWWWWWW".into(),
            None,
        );
        user.payout_address = Some("acct-001".into());
        let mut batch = LedgerBatch::new();
        batch
            .push(LedgerOp::InsertUser(user.clone()))
            .adjust_balance(&user.id, BalanceDelta::credit_available(available));
        ledger.commit(batch).await.unwrap();
        (ledger, user)
    }

    fn service(ledger: Arc<MemoryLedger>, auto_approve: bool) -> WithdrawalService {
        WithdrawalService::new(
            ledger,
            WithdrawalSettings {
                fees: FeeSchedule::default(),
                auto_approve,
            },
        )
    }

    #[tokio::test]
    async fn test_request_holds_funds() {
        let (ledger, user) = funded(Amount::from_units(50)).await;
        let withdrawals = service(ledger.clone(), false);

        let w = withdrawals
            .request(&user.id, Amount::from_units(20), None, DateTime::now())
            .await
            .unwrap();
        assert_eq!(w.status, WithdrawalStatus::Pending);
        assert_eq!(w.destination, "acct-001");
        assert_eq!(w.fee, Amount::from_units(1));
        assert_eq!(w.net_amount, Amount::from_units(19));

        let stored = ledger.user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(30));
        assert_eq!(stored.balances.pending, Amount::from_units(20));
        assert!(ledger.due_payouts(DateTime::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_cannot_overdraw() {
        let (ledger, user) = funded(Amount::from_units(15)).await;
        let err = service(ledger.clone(), false)
            .request(&user.id, Amount::from_units(20), None, DateTime::now())
            .await
            .unwrap_err();
        assert!(matches!(err, UplineError::InsufficientFunds(_)));

        let stored = ledger.user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(15));
        assert_eq!(stored.balances.pending, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_auto_approve_enqueues() {
        let (ledger, user) = funded(Amount::from_units(50)).await;
        let now = DateTime::now();
        let w = service(ledger.clone(), true)
            .request(&user.id, Amount::from_units(20), Some("other".into()), now)
            .await
            .unwrap();
        assert_eq!(w.status, WithdrawalStatus::Processing);

        let due = ledger.due_payouts(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].withdrawal_id, w.id);
        assert_eq!(due[0].amount, Amount::from_units(19));
        assert_eq!(due[0].destination, "other");
    }

    #[tokio::test]
    async fn test_reject_refunds() {
        let (ledger, user) = funded(Amount::from_units(50)).await;
        let withdrawals = service(ledger.clone(), false);
        let w = withdrawals
            .request(&user.id, Amount::from_units(20), None, DateTime::now())
            .await
            .unwrap();

        let rejected = withdrawals.reject(&w.id, "KYC missing", DateTime::now()).await.unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("KYC missing"));

        let stored = ledger.user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.available, Amount::from_units(50));
        assert_eq!(stored.balances.pending, Amount::ZERO);

        // Terminal: cannot be approved or rejected again
        assert!(withdrawals.approve(&w.id, DateTime::now()).await.unwrap_err().is_conflict());
        assert!(withdrawals
            .reject(&w.id, "again", DateTime::now())
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_cancel_only_own() {
        let (ledger, user) = funded(Amount::from_units(50)).await;
        let withdrawals = service(ledger.clone(), false);
        let w = withdrawals
            .request(&user.id, Amount::from_units(10), None, DateTime::now())
            .await
            .unwrap();

        let err = withdrawals.cancel("someone-else", &w.id, DateTime::now()).await.unwrap_err();
        assert!(matches!(err, UplineError::NotFound(_)));

        let cancelled = withdrawals.cancel(&user.id, &w.id, DateTime::now()).await.unwrap();
        assert_eq!(cancelled.reason.as_deref(), Some(CANCELLED_BY_MEMBER));

        let history = ledger
            .transactions_for(&user.id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(history.total, 1);
    }

    #[tokio::test]
    async fn test_approve_queues_payout() {
        let (ledger, user) = funded(Amount::from_units(50)).await;
        let withdrawals = service(ledger.clone(), false);
        let w = withdrawals
            .request(&user.id, Amount::from_units(10), None, DateTime::now())
            .await
            .unwrap();

        let now = DateTime::now();
        let approved = withdrawals.approve(&w.id, now).await.unwrap();
        assert_eq!(approved.status, WithdrawalStatus::Processing);
        assert!(approved.processed_at.is_some());
        assert_eq!(ledger.due_payouts(now, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_destination() {
        let (ledger, user) = funded(Amount::from_units(50)).await;
        ledger
            .update_user(
                &user.id,
                &crate::ledger::UserPatch {
                    payout_address: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = service(ledger, false)
            .request(&user.id, Amount::from_units(10), Some("  ".into()), DateTime::now())
            .await
            .unwrap_err();
        assert!(matches!(err, UplineError::BadRequest(_)));
    }
}
