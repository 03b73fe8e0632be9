//! HTTP server and shared application state

pub mod http;

pub use http::run;

use std::sync::Arc;
use std::time::Instant;

use crate::auth::{extract_token_from_header, Claims, JwtValidator, PermissionLevel};
use crate::config::Args;
use crate::db::schemas::UserDoc;
use crate::income::{DistributionEngine, IncomePlan, PoolService};
use crate::ledger::{Ledger, StorageKind};
use crate::payout::{JobRunner, PayoutGateway, PayoutProcessor};
use crate::team::TeamService;
use crate::types::{Result, UplineError};
use crate::wallet::WalletService;
use crate::withdrawal::WithdrawalService;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub ledger: Arc<dyn Ledger>,
    pub plan: Arc<IncomePlan>,
    pub jwt: JwtValidator,
    pub wallet: WalletService,
    pub withdrawals: WithdrawalService,
    pub pool: PoolService,
    pub distribution: DistributionEngine,
    pub team: TeamService,
    pub payouts: Arc<PayoutProcessor>,
    /// Manual and scheduled job entry point
    pub jobs: JobRunner,
    pub storage: StorageKind,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every service over one ledger
    pub fn new(
        args: Args,
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PayoutGateway>,
        storage: StorageKind,
    ) -> Result<Self> {
        let plan = Arc::new(IncomePlan::standard());
        plan.validate()?;
        let jwt = args.jwt_validator()?;

        let distribution = DistributionEngine::new(Arc::clone(&ledger), Arc::clone(&plan));
        let pool = PoolService::new(Arc::clone(&ledger), Arc::clone(&plan));
        let wallet = WalletService::new(
            Arc::clone(&ledger),
            Arc::clone(&plan),
            distribution.clone(),
            args.auth.require_sponsor,
        );
        let withdrawals = WithdrawalService::new(Arc::clone(&ledger), args.withdrawal_settings());
        let payouts = Arc::new(
            PayoutProcessor::new(Arc::clone(&ledger), gateway)
                .with_policy(args.retry_policy())
                .with_batch_size(args.payouts.payout_batch_size)
                .with_claim_lease(args.payout_claim_lease()),
        );
        let jobs = JobRunner::new(Arc::clone(&payouts), pool.clone(), distribution.clone());
        let team = TeamService::new(Arc::clone(&ledger));

        Ok(Self {
            args,
            ledger,
            plan,
            jwt,
            wallet,
            withdrawals,
            pool,
            distribution,
            team,
            payouts,
            jobs,
            storage,
            started_at: Instant::now(),
        })
    }
}

/// The authenticated member behind a request
#[derive(Debug, Clone)]
pub struct Session {
    pub user: UserDoc,
    pub claims: Claims,
}

/// Resolve the bearer token into a session with at least `required` permission.
///
/// The member is reloaded on every request so blocking and forced logout take
/// effect without waiting for token expiry. Permission comes from the stored
/// member, not the token.
pub async fn authorize(
    state: &AppState,
    auth_header: Option<&str>,
    required: PermissionLevel,
) -> Result<Session> {
    let token = extract_token_from_header(auth_header)
        .ok_or_else(|| UplineError::Unauthorized("No token provided".into()))?;
    let claims = state.jwt.verify_token(token).into_claims()?;

    let user = state
        .ledger
        .user(&claims.sub)
        .await?
        .ok_or_else(|| UplineError::Unauthorized("Account no longer exists".into()))?;

    if claims.version != user.token_version {
        return Err(UplineError::Unauthorized("Session has been revoked".into()));
    }
    if !user.is_active {
        return Err(UplineError::Forbidden("Account is blocked".into()));
    }
    if user.permission_level < required {
        return Err(UplineError::Forbidden(format!(
            "Requires {required} permission"
        )));
    }

    Ok(Session { user, claims })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenInput;
    use crate::ledger::{LedgerBatch, LedgerOp, MemoryLedger};
    use crate::payout::LoggingPayoutGateway;
    use clap::Parser;
    use tokio_test::{assert_err, assert_ok};

    async fn state_with(users: &[UserDoc]) -> AppState {
        let ledger = Arc::new(MemoryLedger::new());
        let mut batch = LedgerBatch::new();
        for user in users {
            batch.push(LedgerOp::InsertUser(user.clone()));
        }
        ledger.commit(batch).await.unwrap();

        let args = Args::try_parse_from(["upline", "--dev-mode"]).unwrap();
        AppState::new(
            args,
            ledger,
            Arc::new(LoggingPayoutGateway),
            StorageKind::Memory,
        )
        .unwrap()
    }

    fn member(identifier: &str) -> UserDoc {
        UserDoc::new(
            identifier.into(),
            "Member".into(),
            "hash".into(),
            format!("UP{:0>6}", identifier.len()),
            None,
        )
    }

    fn bearer(state: &AppState, user: &UserDoc, version: u32) -> String {
        let token = state
            .jwt
            .generate_token(TokenInput {
                user_id: user.id.clone(),
                identifier: user.identifier.clone(),
                permission_level: user.permission_level,
                version,
            })
            .unwrap();
        format!("Bearer {token}")
    }

    #[tokio::test]
    async fn test_authorize_member() {
        let user = member("a@example.com");
        let state = state_with(&[user.clone()]).await;
        let header = bearer(&state, &user, user.token_version);

        let session = assert_ok!(authorize(&state, Some(&header), PermissionLevel::Member).await);
        assert_eq!(session.user.id, user.id);

        let err = assert_err!(authorize(&state, Some(&header), PermissionLevel::Admin).await);
        assert!(matches!(err, UplineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_missing_or_revoked_token() {
        let user = member("b@example.com");
        let state = state_with(&[user.clone()]).await;

        let err = assert_err!(authorize(&state, None, PermissionLevel::Member).await);
        assert!(matches!(err, UplineError::Unauthorized(_)));

        let stale = bearer(&state, &user, user.token_version + 1);
        let err = assert_err!(authorize(&state, Some(&stale), PermissionLevel::Member).await);
        assert!(matches!(err, UplineError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_blocked_member() {
        let mut user = member("c@example.com");
        user.is_active = false;
        let state = state_with(&[user.clone()]).await;
        let header = bearer(&state, &user, user.token_version);

        let err = assert_err!(authorize(&state, Some(&header), PermissionLevel::Member).await);
        assert!(matches!(err, UplineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_admin_permission_comes_from_stored_member() {
        let mut admin = member("root@example.com");
        admin.permission_level = PermissionLevel::Admin;
        let state = state_with(&[admin.clone()]).await;

        // A token minted with a lower level still resolves to the stored admin
        let token = state
            .jwt
            .generate_token(TokenInput {
                user_id: admin.id.clone(),
                identifier: admin.identifier.clone(),
                permission_level: PermissionLevel::Member,
                version: admin.token_version,
            })
            .unwrap();
        let header = format!("Bearer {token}");
        assert_ok!(authorize(&state, Some(&header), PermissionLevel::Admin).await);
    }
}
