//! MongoDB ledger
//!
//! Every batch runs inside one client-session transaction. Guards are
//! expressed as filter predicates; an update that matches nothing aborts
//! the transaction. Requires a replica set (transactions are not available
//! on a standalone server).

use async_trait::async_trait;
use bson::{doc, Bson, DateTime, Document};
use futures_util::StreamExt;
use mongodb::error::{TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::ReturnDocument;
use mongodb::ClientSession;
use tracing::{debug, warn};

use super::{
    Ledger, LedgerBatch, LedgerOp, LedgerStats, Page, PageRequest, UserPatch, UserQuery,
    WithdrawalQuery,
};
use crate::db::mongo::map_write_error;
use crate::db::schemas::{
    GlobalCycleDoc, GlobalPositionDoc, IncomeDoc, IncomeKind, IncomePoolDoc, PayoutQueueDoc,
    PoolEntryStatus, RankPoolDoc, TransactionDoc, TransactionKind, UserDoc, WithdrawalDoc,
    WithdrawalStatus, GLOBAL_CYCLE_COLLECTION, GLOBAL_POSITION_COLLECTION, INCOME_COLLECTION,
    INCOME_POOL_COLLECTION, PAYOUT_QUEUE_COLLECTION, RANK_POOL_COLLECTION,
    TRANSACTION_COLLECTION, USER_COLLECTION, WITHDRAWAL_COLLECTION,
};
use crate::db::{MongoClient, MongoCollection};
use crate::income::Rank;
use crate::types::{Amount, Result, UplineError};

/// Balance fields that may never go negative
const GUARDED_BALANCES: [&str; 3] = ["available", "locked", "pending"];

/// Ledger backed by MongoDB collections
#[derive(Clone)]
pub struct MongoLedger {
    client: MongoClient,
    users: MongoCollection<UserDoc>,
    transactions: MongoCollection<TransactionDoc>,
    incomes: MongoCollection<IncomeDoc>,
    pool_entries: MongoCollection<IncomePoolDoc>,
    withdrawals: MongoCollection<WithdrawalDoc>,
    payouts: MongoCollection<PayoutQueueDoc>,
    cycles: MongoCollection<GlobalCycleDoc>,
    positions: MongoCollection<GlobalPositionDoc>,
    rank_pools: MongoCollection<RankPoolDoc>,
}

impl MongoLedger {
    /// Open every collection, applying indexes
    pub async fn open(client: MongoClient) -> Result<Self> {
        Ok(Self {
            users: client.collection(USER_COLLECTION).await?,
            transactions: client.collection(TRANSACTION_COLLECTION).await?,
            incomes: client.collection(INCOME_COLLECTION).await?,
            pool_entries: client.collection(INCOME_POOL_COLLECTION).await?,
            withdrawals: client.collection(WITHDRAWAL_COLLECTION).await?,
            payouts: client.collection(PAYOUT_QUEUE_COLLECTION).await?,
            cycles: client.collection(GLOBAL_CYCLE_COLLECTION).await?,
            positions: client.collection(GLOBAL_POSITION_COLLECTION).await?,
            rank_pools: client.collection(RANK_POOL_COLLECTION).await?,
            client,
        })
    }

    async fn apply(&self, op: LedgerOp, session: &mut ClientSession) -> Result<()> {
        let now = DateTime::now();

        match op {
            LedgerOp::InsertUser(user) => self.users.insert_in(&user, session).await,

            LedgerOp::AdjustBalance { user_id, delta } => {
                let mut filter = doc! { "_id": &user_id };
                let mut inc = Document::new();
                for (field, amount) in delta.fields() {
                    if amount.is_zero() {
                        continue;
                    }
                    inc.insert(format!("balances.{field}"), amount.cents());
                    if amount.is_negative() && GUARDED_BALANCES.contains(&field) {
                        filter.insert(
                            format!("balances.{field}"),
                            doc! { "$gte": -amount.cents() },
                        );
                    }
                }

                let result = self
                    .users
                    .inner()
                    .update_one(filter, doc! { "$inc": inc, "$set": { "metadata.updated_at": now } })
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;

                if result.matched_count == 0 {
                    return Err(match self.user_in(&user_id, session).await? {
                        Some(_) => UplineError::InsufficientFunds(format!(
                            "Balance of {user_id} is too low"
                        )),
                        None => UplineError::NotFound(format!("User {user_id} not found")),
                    });
                }
                Ok(())
            }

            LedgerOp::UpdateCounters { user_id, delta } => {
                let mut filter = doc! { "_id": &user_id };
                let mut inc = Document::new();
                for (field, by) in [
                    ("direct_referrals", delta.direct_referrals),
                    ("active_direct_referrals", delta.active_direct_referrals),
                    ("team_size", delta.team_size),
                ] {
                    if by == 0 {
                        continue;
                    }
                    inc.insert(field, by as i64);
                    if by < 0 {
                        filter.insert(field, doc! { "$gte": -(by as i64) });
                    }
                }

                let result = self
                    .users
                    .inner()
                    .update_one(filter, doc! { "$inc": inc })
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.matched_count, || format!("Counters of {user_id} changed"))
            }

            LedgerOp::SetRank {
                user_id,
                from,
                to,
                at,
            } => {
                let from = from.map(|r| Bson::String(r.as_str().to_string())).unwrap_or(Bson::Null);
                let mut set = doc! { "rank": to.as_str(), "metadata.updated_at": at };
                if from == Bson::Null {
                    set.insert("activated_at", at);
                }

                let result = self
                    .users
                    .inner()
                    .update_one(doc! { "_id": &user_id, "rank": from }, doc! { "$set": set })
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.matched_count, || format!("Rank of {user_id} changed"))
            }

            LedgerOp::InsertTransaction(tx) => self.transactions.insert_in(&tx, session).await,

            LedgerOp::MarkDistributed { transaction_id } => {
                let result = self
                    .transactions
                    .inner()
                    .update_one(
                        doc! { "_id": &transaction_id, "distributed": false },
                        doc! { "$set": { "distributed": true, "metadata.updated_at": now } },
                    )
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.matched_count, || {
                    format!("Transaction {transaction_id} already distributed")
                })
            }

            LedgerOp::InsertIncome(income) => self.incomes.insert_in(&income, session).await,

            LedgerOp::InsertPoolEntry(entry) => self.pool_entries.insert_in(&entry, session).await,

            LedgerOp::ReleasePoolEntry { entry_id, at } => {
                let result = self
                    .pool_entries
                    .inner()
                    .update_one(
                        doc! { "_id": &entry_id, "status": "locked" },
                        doc! { "$set": {
                            "status": "claimed",
                            "claimed_at": at,
                            "metadata.updated_at": at,
                        } },
                    )
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.matched_count, || format!("Pool entry {entry_id} not locked"))
            }

            LedgerOp::InsertWithdrawal(withdrawal) => {
                self.withdrawals.insert_in(&withdrawal, session).await
            }

            LedgerOp::TransitionWithdrawal {
                withdrawal_id,
                from,
                to,
                reason,
                payout_reference,
                at,
            } => {
                let mut set = doc! { "status": to.as_str(), "metadata.updated_at": at };
                if let Some(reason) = reason {
                    set.insert("reason", reason);
                }
                if let Some(reference) = payout_reference {
                    set.insert("payout_reference", reference);
                }
                match to {
                    WithdrawalStatus::Completed => {
                        set.insert("completed_at", at);
                    }
                    WithdrawalStatus::Processing | WithdrawalStatus::Rejected => {
                        set.insert("processed_at", at);
                    }
                    WithdrawalStatus::Pending => {}
                }

                let result = self
                    .withdrawals
                    .inner()
                    .update_one(
                        doc! { "_id": &withdrawal_id, "status": from.as_str() },
                        doc! { "$set": set },
                    )
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.matched_count, || {
                    format!("Withdrawal {withdrawal_id} is not {from}")
                })
            }

            LedgerOp::EnqueuePayout(entry) => self.payouts.insert_in(&entry, session).await,

            LedgerOp::ClaimPayout {
                entry_id,
                expected_attempts,
                expected_next_attempt_at,
                lease_until,
            } => {
                let result = self
                    .payouts
                    .inner()
                    .update_one(
                        doc! {
                            "_id": &entry_id,
                            "attempts": expected_attempts as i64,
                            "next_attempt_at": expected_next_attempt_at,
                        },
                        doc! { "$set": {
                            "next_attempt_at": lease_until,
                            "metadata.updated_at": now,
                        } },
                    )
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.matched_count, || format!("Payout {entry_id} already claimed"))
            }

            LedgerOp::ReschedulePayout {
                entry_id,
                expected_attempts,
                next_attempt_at,
                last_error,
            } => {
                let result = self
                    .payouts
                    .inner()
                    .update_one(
                        doc! { "_id": &entry_id, "attempts": expected_attempts as i64 },
                        doc! { "$set": {
                            "attempts": (expected_attempts + 1) as i64,
                            "next_attempt_at": next_attempt_at,
                            "last_error": last_error,
                            "metadata.updated_at": now,
                        } },
                    )
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.matched_count, || format!("Payout {entry_id} changed"))
            }

            LedgerOp::RemovePayout { entry_id } => {
                let result = self
                    .payouts
                    .inner()
                    .delete_one(doc! { "_id": &entry_id })
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;
                require_match(result.deleted_count, || format!("Payout {entry_id} already removed"))
            }

            LedgerOp::AdjustRankPool {
                rank,
                balance,
                distributed,
                accrued_at,
            } => {
                let mut filter = doc! { "_id": rank.as_str() };
                if balance.is_negative() {
                    filter.insert("balance", doc! { "$gte": -balance.cents() });
                }
                let mut set = doc! { "metadata.updated_at": now };
                if let Some(at) = accrued_at {
                    set.insert("last_accrued_at", at);
                }

                let result = self
                    .rank_pools
                    .inner()
                    .update_one(
                        filter,
                        doc! {
                            "$inc": {
                                "balance": balance.cents(),
                                "total_distributed": distributed.cents(),
                            },
                            "$set": set,
                            "$setOnInsert": {
                                "metadata.is_deleted": false,
                                "metadata.created_at": now,
                            },
                        },
                    )
                    // A draining update must never create the bucket
                    .upsert(!balance.is_negative())
                    .session(&mut *session)
                    .await
                    .map_err(map_txn_error)?;

                let touched = result.matched_count + u64::from(result.upserted_id.is_some());
                require_match(touched, || format!("Rank pool {rank} drained"))
            }
        }
    }

    async fn user_in(&self, id: &str, session: &mut ClientSession) -> Result<Option<UserDoc>> {
        self.users
            .inner()
            .find_one(doc! { "_id": id })
            .session(&mut *session)
            .await
            .map_err(map_txn_error)
    }

    async fn page<T>(
        collection: &MongoCollection<T>,
        filter: Document,
        sort: Document,
        page: PageRequest,
    ) -> Result<Page<T>>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Unpin + Send + Sync,
        T: crate::db::IntoIndexes,
    {
        let total = collection.count(filter.clone()).await?;
        let items = collection
            .find_sorted(filter, sort, page.skip(), page.limit as i64)
            .await?;
        Ok(Page::new(items, total, page))
    }
}

/// Transient transaction failures are conflicts the caller can retry
fn map_txn_error(err: mongodb::error::Error) -> UplineError {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR)
        || err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    {
        UplineError::Conflict(format!("Transaction aborted: {}", err))
    } else {
        map_write_error(err)
    }
}

fn require_match(count: u64, message: impl FnOnce() -> String) -> Result<()> {
    if count == 0 {
        Err(UplineError::Conflict(message()))
    } else {
        Ok(())
    }
}

/// Escape user input for a `$regex` match
fn escape_regex(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn rank_list(ranks: impl Iterator<Item = Rank>) -> Vec<Bson> {
    ranks.map(|r| Bson::String(r.as_str().to_string())).collect()
}

fn sum_of(totals: &Document, key: &str) -> Amount {
    match totals.get(key) {
        Some(Bson::Int64(v)) => Amount::from_cents(*v),
        Some(Bson::Int32(v)) => Amount::from_cents(*v as i64),
        _ => Amount::ZERO,
    }
}

#[async_trait]
impl Ledger for MongoLedger {
    async fn user(&self, id: &str) -> Result<Option<UserDoc>> {
        self.users.find_one(doc! { "_id": id }).await
    }

    async fn user_by_identifier(&self, identifier: &str) -> Result<Option<UserDoc>> {
        self.users
            .find_one(doc! { "identifier": identifier.to_lowercase() })
            .await
    }

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<UserDoc>> {
        self.users
            .find_one(doc! { "referral_code": code.to_uppercase() })
            .await
    }

    async fn direct_referrals(&self, sponsor_id: &str) -> Result<Vec<UserDoc>> {
        self.users
            .find_sorted(
                doc! { "sponsor_id": sponsor_id },
                doc! { "metadata.created_at": 1, "_id": 1 },
                0,
                0,
            )
            .await
    }

    async fn users_at_or_above(&self, rank: Rank) -> Result<Vec<UserDoc>> {
        // Ranks are stored as names, so range queries go through $in
        self.users
            .find_sorted(
                doc! { "rank": { "$in": rank_list(rank.at_or_above()) }, "is_active": true },
                doc! { "_id": 1 },
                0,
                0,
            )
            .await
    }

    async fn list_users(&self, query: &UserQuery) -> Result<Page<UserDoc>> {
        let mut filter = Document::new();
        if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = escape_regex(search);
            filter.insert(
                "$or",
                vec![
                    doc! { "identifier": { "$regex": &pattern, "$options": "i" } },
                    doc! { "display_name": { "$regex": &pattern, "$options": "i" } },
                    doc! { "referral_code": { "$regex": &pattern, "$options": "i" } },
                ],
            );
        }
        if let Some(rank) = query.rank {
            filter.insert("rank", rank.as_str());
        }
        if let Some(active) = query.is_active {
            filter.insert("is_active", active);
        }

        Self::page(
            &self.users,
            filter,
            doc! { "metadata.created_at": -1, "_id": -1 },
            query.page,
        )
        .await
    }

    async fn update_user(&self, id: &str, patch: &UserPatch) -> Result<UserDoc> {
        let mut set = doc! { "metadata.updated_at": DateTime::now() };
        if let Some(name) = &patch.display_name {
            set.insert("display_name", name);
        }
        if let Some(phone) = &patch.phone {
            set.insert("phone", phone);
        }
        if let Some(address) = &patch.payout_address {
            set.insert("payout_address", address);
        }
        if let Some(active) = patch.is_active {
            set.insert("is_active", active);
        }
        let mut update = doc! { "$set": set };
        if patch.bump_token_version {
            update.insert("$inc", doc! { "token_version": 1i64 });
        }

        self.users
            .inner()
            .find_one_and_update(doc! { "_id": id, "metadata.is_deleted": { "$ne": true } }, update)
            .return_document(ReturnDocument::After)
            .await
            .map_err(map_write_error)?
            .ok_or_else(|| UplineError::NotFound(format!("User {id} not found")))
    }

    async fn transaction(&self, id: &str) -> Result<Option<TransactionDoc>> {
        self.transactions.find_one(doc! { "_id": id }).await
    }

    async fn transactions_for(&self, user_id: &str, page: PageRequest) -> Result<Page<TransactionDoc>> {
        Self::page(
            &self.transactions,
            doc! { "$or": [ { "user_id": user_id }, { "counterparty_id": user_id } ] },
            doc! { "metadata.created_at": -1, "_id": -1 },
            page,
        )
        .await
    }

    async fn undistributed_activations(&self, limit: usize) -> Result<Vec<TransactionDoc>> {
        let kind = bson::to_bson(&TransactionKind::Activation)?;
        self.transactions
            .find_sorted(
                doc! { "kind": kind, "distributed": false },
                doc! { "metadata.created_at": 1 },
                0,
                limit as i64,
            )
            .await
    }

    async fn incomes_for(
        &self,
        user_id: &str,
        kind: Option<IncomeKind>,
        page: PageRequest,
    ) -> Result<Page<IncomeDoc>> {
        let mut filter = doc! { "recipient_id": user_id };
        if let Some(kind) = kind {
            filter.insert("kind", kind.as_str());
        }
        Self::page(
            &self.incomes,
            filter,
            doc! { "metadata.created_at": -1, "_id": -1 },
            page,
        )
        .await
    }

    async fn pool_entries_for(
        &self,
        user_id: &str,
        status: Option<PoolEntryStatus>,
    ) -> Result<Vec<IncomePoolDoc>> {
        let mut filter = doc! { "user_id": user_id };
        if let Some(status) = status {
            filter.insert("status", bson::to_bson(&status)?);
        }
        self.pool_entries
            .find_sorted(filter, doc! { "metadata.created_at": 1 }, 0, 0)
            .await
    }

    async fn withdrawal(&self, id: &str) -> Result<Option<WithdrawalDoc>> {
        self.withdrawals.find_one(doc! { "_id": id }).await
    }

    async fn withdrawals(&self, query: &WithdrawalQuery) -> Result<Page<WithdrawalDoc>> {
        let mut filter = Document::new();
        if let Some(user_id) = &query.user_id {
            filter.insert("user_id", user_id);
        }
        if let Some(status) = query.status {
            filter.insert("status", status.as_str());
        }
        Self::page(
            &self.withdrawals,
            filter,
            doc! { "metadata.created_at": -1, "_id": -1 },
            query.page,
        )
        .await
    }

    async fn due_payouts(&self, now: DateTime, limit: usize) -> Result<Vec<PayoutQueueDoc>> {
        self.payouts
            .find_sorted(
                doc! { "next_attempt_at": { "$lte": now } },
                doc! { "next_attempt_at": 1, "metadata.created_at": 1 },
                0,
                limit as i64,
            )
            .await
    }

    async fn payout_queue(&self, page: PageRequest) -> Result<Page<PayoutQueueDoc>> {
        Self::page(&self.payouts, doc! {}, doc! { "next_attempt_at": 1 }, page).await
    }

    async fn global_position(&self, transaction_id: &str) -> Result<Option<GlobalPositionDoc>> {
        self.positions
            .find_one(doc! { "transaction_id": transaction_id })
            .await
    }

    async fn positions_at(&self, rank: Rank, positions: &[i64]) -> Result<Vec<GlobalPositionDoc>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        self.positions
            .find_many(doc! { "rank": rank.as_str(), "position": { "$in": positions.to_vec() } })
            .await
    }

    async fn allocate_global_position(
        &self,
        rank: Rank,
        user_id: &str,
        transaction_id: &str,
    ) -> Result<GlobalPositionDoc> {
        if let Some(existing) = self.global_position(transaction_id).await? {
            return Ok(existing);
        }

        let now = DateTime::now();
        let cycle = self
            .cycles
            .inner()
            .find_one_and_update(
                doc! { "_id": rank.as_str() },
                doc! {
                    "$inc": { "last_position": 1i64 },
                    "$set": { "metadata.updated_at": now },
                    "$setOnInsert": { "metadata.is_deleted": false, "metadata.created_at": now },
                },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(map_write_error)?
            .ok_or_else(|| UplineError::Internal(format!("Global cycle {rank} missing after upsert")))?;

        let position = GlobalPositionDoc::new(rank, cycle.last_position, user_id, transaction_id);
        match self.positions.inner().insert_one(&position).await {
            Ok(_) => {
                debug!(rank = %rank, position = position.position, user_id, "Global position allocated");
                Ok(position)
            }
            Err(e) => match map_write_error(e) {
                // A concurrent distribution of the same activation won
                UplineError::Conflict(_) => {
                    warn!(rank = %rank, skipped = cycle.last_position, "Global position lost race, slot left empty");
                    self.global_position(transaction_id).await?.ok_or_else(|| {
                        UplineError::Conflict(format!("Global position race for {transaction_id}"))
                    })
                }
                other => Err(other),
            },
        }
    }

    async fn rank_pools(&self) -> Result<Vec<RankPoolDoc>> {
        let mut pools = self.rank_pools.find_many(doc! {}).await?;
        pools.sort_by_key(|p| p.rank);
        Ok(pools)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let pipeline = vec![
            doc! { "$match": { "metadata.is_deleted": { "$ne": true } } },
            doc! { "$group": {
                "_id": Bson::Null,
                "available": { "$sum": "$balances.available" },
                "locked": { "$sum": "$balances.locked" },
                "pending": { "$sum": "$balances.pending" },
                "total_earnings": { "$sum": "$balances.total_earnings" },
                "total_withdrawn": { "$sum": "$balances.total_withdrawn" },
            } },
        ];
        let mut cursor = self.users.inner().aggregate(pipeline).await?;
        let totals = cursor.next().await.transpose()?.unwrap_or_default();

        let activation = bson::to_bson(&TransactionKind::Activation)?;
        let rank_pool_balance = self.rank_pools().await?.iter().map(|p| p.balance).sum();

        Ok(LedgerStats {
            users: self.users.count(doc! {}).await?,
            activated_users: self.users.count(doc! { "rank": { "$ne": Bson::Null } }).await?,
            blocked_users: self.users.count(doc! { "is_active": false }).await?,
            total_available: sum_of(&totals, "available"),
            total_locked: sum_of(&totals, "locked"),
            total_pending: sum_of(&totals, "pending"),
            total_earnings: sum_of(&totals, "total_earnings"),
            total_withdrawn: sum_of(&totals, "total_withdrawn"),
            pending_withdrawals: self
                .withdrawals
                .count(doc! { "status": WithdrawalStatus::Pending.as_str() })
                .await?,
            queued_payouts: self.payouts.count(doc! {}).await?,
            undistributed_activations: self
                .transactions
                .count(doc! { "kind": activation, "distributed": false })
                .await?,
            rank_pool_balance,
        })
    }

    async fn commit(&self, batch: LedgerBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut session = self.client.start_session().await?;
        session.start_transaction().await.map_err(map_txn_error)?;

        for op in batch.into_ops() {
            if let Err(e) = self.apply(op, &mut session).await {
                if let Err(abort) = session.abort_transaction().await {
                    warn!(error = %abort, "Failed to abort transaction");
                }
                return Err(e);
            }
        }

        session.commit_transaction().await.map_err(map_txn_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("a.b"), "a\\.b");
        assert_eq!(escape_regex("UP(1)"), "UP\\(1\\)");
        assert_eq!(escape_regex("plain"), "plain");
    }

    #[test]
    fn test_rank_list_covers_higher_ranks() {
        let ranks = rank_list(Rank::Emerald.at_or_above());
        assert_eq!(
            ranks,
            vec![Bson::String("emerald".into()), Bson::String("feldspar".into())]
        );
    }

    #[test]
    fn test_sum_of_handles_int_widths() {
        let totals = doc! { "a": 5i32, "b": 7i64 };
        assert_eq!(sum_of(&totals, "a"), Amount::from_cents(5));
        assert_eq!(sum_of(&totals, "b"), Amount::from_cents(7));
        assert_eq!(sum_of(&totals, "c"), Amount::ZERO);
    }
}
