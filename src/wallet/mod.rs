//! Accounts and wallet movements
//!
//! Signup places a member under their sponsor and bumps the team counters
//! of the upline. Activation buys the next rank from the available balance
//! and hands the resulting transaction to the distribution engine.

use bson::DateTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::{check_password_strength, hash_password, verify_password, PermissionLevel};
use crate::db::schemas::{BalanceDelta, CounterDelta, Metadata, TransactionDoc, UserDoc};
use crate::income::{DistributionEngine, DistributionSummary, IncomePlan, Rank};
use crate::ledger::{Ledger, LedgerBatch, LedgerOp, UserPatch};
use crate::team::{walk_upline, MAX_DEPTH};
use crate::types::{Amount, Result, UplineError};

/// Every referral code starts with this
pub const REFERRAL_CODE_PREFIX: &str = "UP";
const REFERRAL_CODE_LEN: usize = 6;
const REFERRAL_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MAX_CODE_ATTEMPTS: usize = 5;

const MAX_IDENTIFIER_LEN: usize = 254;
const MAX_DISPLAY_NAME_LEN: usize = 64;
const MAX_NOTE_LEN: usize = 200;

/// `UP` plus six random upper-case alphanumerics
pub fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..REFERRAL_CODE_LEN)
        .map(|_| REFERRAL_CODE_CHARSET[rng.gen_range(0..REFERRAL_CODE_CHARSET.len())] as char)
        .collect();
    format!("{REFERRAL_CODE_PREFIX}{suffix}")
}

fn normalize_identifier(identifier: &str) -> Result<String> {
    let identifier = identifier.trim().to_lowercase();
    let valid = identifier.len() <= MAX_IDENTIFIER_LEN
        && identifier
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(UplineError::BadRequest("A valid email address is required".into()));
    }
    Ok(identifier)
}

fn normalize_display_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(UplineError::BadRequest("Display name is required".into()));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(UplineError::BadRequest(format!(
            "Display name is limited to {MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn normalize_note(note: Option<String>) -> Result<Option<String>> {
    let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    if note.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTE_LEN) {
        return Err(UplineError::BadRequest(format!(
            "Note is limited to {MAX_NOTE_LEN} characters"
        )));
    }
    Ok(note)
}

fn require_positive(amount: Amount) -> Result<()> {
    if !amount.is_positive() {
        return Err(UplineError::BadRequest("Amount must be positive".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub identifier: String,
    pub password: String,
    pub display_name: String,
    /// Sponsor's referral code
    #[serde(default)]
    pub referral_code: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub payout_address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    pub rank: Rank,
    pub price: Amount,
    pub transaction_id: String,
    /// None when distribution failed and was left for the retry job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<DistributionSummary>,
}

#[derive(Clone)]
pub struct WalletService {
    ledger: Arc<dyn Ledger>,
    plan: Arc<IncomePlan>,
    distribution: DistributionEngine,
    require_sponsor: bool,
}

impl WalletService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        plan: Arc<IncomePlan>,
        distribution: DistributionEngine,
        require_sponsor: bool,
    ) -> Self {
        Self {
            ledger,
            plan,
            distribution,
            require_sponsor,
        }
    }

    pub async fn user(&self, user_id: &str) -> Result<UserDoc> {
        self.ledger
            .user(user_id)
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("User {user_id} not found")))
    }

    async fn active_user(&self, user_id: &str) -> Result<UserDoc> {
        let user = self.user(user_id).await?;
        if !user.is_active {
            return Err(UplineError::Forbidden("Account is blocked".into()));
        }
        Ok(user)
    }

    async fn unused_referral_code(&self) -> Result<String> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_referral_code();
            if self.ledger.user_by_referral_code(&code).await?.is_none() {
                return Ok(code);
            }
            debug!(code, "Referral code collision");
        }
        Err(UplineError::Internal("Could not allocate a referral code".into()))
    }

    /// Create a member under the sponsor named by `referral_code`
    pub async fn signup(&self, request: SignupRequest, now: DateTime) -> Result<UserDoc> {
        let identifier = normalize_identifier(&request.identifier)?;
        let display_name = normalize_display_name(&request.display_name)?;
        check_password_strength(&request.password)?;

        let sponsor = match request
            .referral_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            Some(code) => {
                let sponsor = self
                    .ledger
                    .user_by_referral_code(code)
                    .await?
                    .ok_or_else(|| UplineError::BadRequest(format!("Unknown referral code {code}")))?;
                if !sponsor.is_active {
                    return Err(UplineError::BadRequest("Sponsor account is blocked".into()));
                }
                Some(sponsor)
            }
            None if self.require_sponsor => {
                return Err(UplineError::BadRequest("A referral code is required".into()));
            }
            None => None,
        };

        if self.ledger.user_by_identifier(&identifier).await?.is_some() {
            return Err(UplineError::Conflict("Identifier already registered".into()));
        }

        let password_hash = hash_password(&request.password)?;
        let referral_code = self.unused_referral_code().await?;
        let mut user = UserDoc::new(
            identifier,
            display_name,
            password_hash,
            referral_code,
            sponsor.as_ref().map(|s| s.id.clone()),
        );
        user.phone = request.phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
        user.metadata = Metadata::at(now);

        let upline = walk_upline(self.ledger.as_ref(), &user, MAX_DEPTH).await?;
        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::InsertUser(user.clone()));
        for (i, ancestor) in upline.iter().enumerate() {
            batch.update_counters(
                &ancestor.id,
                CounterDelta {
                    direct_referrals: i32::from(i == 0),
                    team_size: 1,
                    ..CounterDelta::default()
                },
            );
        }
        // Identifier or code uniqueness is re-checked by the commit
        self.ledger.commit(batch).await?;

        info!(
            user_id = %user.id,
            referral_code = %user.referral_code,
            sponsor_id = ?user.sponsor_id,
            upline = upline.len(),
            "Member signed up"
        );
        Ok(user)
    }

    /// Check credentials; the same error covers unknown users and bad passwords
    pub async fn authenticate(&self, identifier: &str, password: &str) -> Result<UserDoc> {
        let invalid = || UplineError::Unauthorized("Invalid credentials".into());
        let user = self
            .ledger
            .user_by_identifier(identifier.trim())
            .await?
            .ok_or_else(invalid)?;
        if !verify_password(password, &user.password_hash)? {
            return Err(invalid());
        }
        if !user.is_active {
            return Err(UplineError::Forbidden("Account is blocked".into()));
        }
        Ok(user)
    }

    /// Buy the next rank. `rank`, if given, must be that next rank.
    pub async fn activate(&self, user_id: &str, rank: Option<Rank>, now: DateTime) -> Result<Activation> {
        let user = self.active_user(user_id).await?;
        let next = Rank::next_for(user.rank)
            .ok_or_else(|| UplineError::BadRequest("Already at the highest rank".into()))?;
        if let Some(requested) = rank {
            if requested != next {
                return Err(UplineError::BadRequest(format!(
                    "Ranks activate in order; next is {next}"
                )));
            }
        }

        let price = self.plan.tier(next)?.price;
        if user.balances.available < price {
            return Err(UplineError::InsufficientFunds(format!(
                "{next} costs {price}, available {}",
                user.balances.available
            )));
        }

        let mut tx = TransactionDoc::activation(user_id, next, price);
        tx.metadata = Metadata::at(now);

        let mut batch = LedgerBatch::new();
        batch
            .adjust_balance(user_id, BalanceDelta::debit_available(price))
            .push(LedgerOp::SetRank {
                user_id: user_id.to_string(),
                from: user.rank,
                to: next,
                at: now,
            });
        if user.rank.is_none() {
            if let Some(sponsor_id) = &user.sponsor_id {
                batch.update_counters(
                    sponsor_id,
                    CounterDelta {
                        active_direct_referrals: 1,
                        ..CounterDelta::default()
                    },
                );
            }
        }
        batch.push(LedgerOp::InsertTransaction(tx.clone()));
        self.ledger.commit(batch).await?;

        info!(user_id, rank = %next, price = %price, transaction_id = %tx.id, "Rank activated");

        let distribution = match self.distribution.distribute(&tx.id).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(
                    transaction_id = %tx.id,
                    error = %e,
                    "Distribution failed, left for retry"
                );
                None
            }
        };

        Ok(Activation {
            rank: next,
            price,
            transaction_id: tx.id,
            distribution,
        })
    }

    /// Admin credit to a member's available balance
    pub async fn topup(
        &self,
        admin_id: &str,
        user_id: &str,
        amount: Amount,
        note: Option<String>,
        now: DateTime,
    ) -> Result<TransactionDoc> {
        require_positive(amount)?;
        let note = normalize_note(note)?;
        self.user(user_id).await?;

        let mut tx = TransactionDoc::topup(user_id, admin_id, amount, note);
        tx.metadata = Metadata::at(now);

        let mut batch = LedgerBatch::new();
        batch
            .adjust_balance(user_id, BalanceDelta::credit_available(amount))
            .push(LedgerOp::InsertTransaction(tx.clone()));
        self.ledger.commit(batch).await?;

        info!(admin_id, user_id, amount = %amount, "Balance topped up");
        Ok(tx)
    }

    /// Move available funds to the member owning `to_referral_code`
    pub async fn transfer(
        &self,
        from_id: &str,
        to_referral_code: &str,
        amount: Amount,
        note: Option<String>,
        now: DateTime,
    ) -> Result<TransactionDoc> {
        require_positive(amount)?;
        let note = normalize_note(note)?;
        let sender = self.active_user(from_id).await?;

        let recipient = self
            .ledger
            .user_by_referral_code(to_referral_code.trim())
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("No member with code {to_referral_code}")))?;
        if recipient.id == sender.id {
            return Err(UplineError::BadRequest("Cannot transfer to yourself".into()));
        }
        if !recipient.is_active {
            return Err(UplineError::BadRequest("Recipient account is blocked".into()));
        }
        if sender.balances.available < amount {
            return Err(UplineError::InsufficientFunds(format!(
                "Available balance {} is below {amount}",
                sender.balances.available
            )));
        }

        let mut tx = TransactionDoc::transfer(from_id, &recipient.id, amount, note);
        tx.metadata = Metadata::at(now);

        let mut batch = LedgerBatch::new();
        batch
            .adjust_balance(from_id, BalanceDelta::debit_available(amount))
            .adjust_balance(&recipient.id, BalanceDelta::credit_available(amount))
            .push(LedgerOp::InsertTransaction(tx.clone()));
        self.ledger.commit(batch).await?;

        info!(from_id, to_id = %recipient.id, amount = %amount, "Balance transferred");
        Ok(tx)
    }

    pub async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> Result<UserDoc> {
        let patch = UserPatch {
            display_name: update
                .display_name
                .as_deref()
                .map(normalize_display_name)
                .transpose()?,
            phone: update.phone.map(|p| p.trim().to_string()),
            payout_address: update.payout_address.map(|a| a.trim().to_string()),
            ..UserPatch::default()
        };
        if patch.is_empty() {
            return self.user(user_id).await;
        }
        self.ledger.update_user(user_id, &patch).await
    }

    /// Block or unblock; blocking also revokes issued tokens
    pub async fn set_active(&self, user_id: &str, is_active: bool) -> Result<UserDoc> {
        let user = self
            .ledger
            .update_user(
                user_id,
                &UserPatch {
                    is_active: Some(is_active),
                    bump_token_version: !is_active,
                    ..UserPatch::default()
                },
            )
            .await?;
        info!(user_id, is_active, "Account status changed");
        Ok(user)
    }

    /// Invalidate every token issued to the member
    pub async fn force_logout(&self, user_id: &str) -> Result<UserDoc> {
        let user = self
            .ledger
            .update_user(
                user_id,
                &UserPatch {
                    bump_token_version: true,
                    ..UserPatch::default()
                },
            )
            .await?;
        info!(user_id, token_version = user.token_version, "Sessions revoked");
        Ok(user)
    }

    /// Create the root admin if no account uses `identifier` yet
    pub async fn seed_admin(&self, identifier: &str, password: &str, now: DateTime) -> Result<UserDoc> {
        let identifier = normalize_identifier(identifier)?;
        if let Some(existing) = self.ledger.user_by_identifier(&identifier).await? {
            if !existing.is_admin() {
                warn!(identifier, "Admin identifier belongs to a member account");
            }
            return Ok(existing);
        }
        check_password_strength(password)?;

        let mut admin = UserDoc::new(
            identifier,
            "Administrator".into(),
            hash_password(password)?,
            self.unused_referral_code().await?,
            None,
        );
        admin.permission_level = PermissionLevel::Admin;
        admin.metadata = Metadata::at(now);

        let mut batch = LedgerBatch::new();
        batch.push(LedgerOp::InsertUser(admin.clone()));
        self.ledger.commit(batch).await?;

        info!(user_id = %admin.id, identifier = %admin.identifier, "Root admin created");
        Ok(admin)
    }
}
