//! Configuration for Upline
//!
//! CLI arguments with environment variable fallbacks. A `.env` file is
//! loaded by the binaries before parsing.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::jwt::MIN_SECRET_LEN;
use crate::auth::JwtValidator;
use crate::payout::{
    HttpPayoutGateway, LoggingPayoutGateway, PayoutGateway, RetryPolicy, SchedulerIntervals,
};
use crate::types::{Amount, BasisPoints, UplineError};
use crate::withdrawal::{FeeSchedule, WithdrawalSettings};

/// Upline - referral commission and payout backend
#[derive(Parser, Debug, Clone)]
#[command(name = "upline")]
#[command(about = "Referral commission, withdrawal and payout backend")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory fallback, dev JWT secret, logging payout gateway)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "upline")]
    pub mongodb_db: String,

    /// Authentication configuration
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Withdrawal rules
    #[command(flatten)]
    pub withdrawals: WithdrawalArgs,

    /// Payout gateway and retry policy
    #[command(flatten)]
    pub payouts: PayoutArgs,

    /// Periodic jobs
    #[command(flatten)]
    pub scheduler: SchedulerArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct AuthArgs {
    /// JWT secret for token signing (required in production, at least 32 characters)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds
    #[arg(long, env = "JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Root admin login, created at startup if missing
    #[arg(long, env = "ADMIN_IDENTIFIER")]
    pub admin_identifier: Option<String>,

    /// Root admin password
    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// Reject signups without a sponsor referral code
    #[arg(long, env = "REQUIRE_SPONSOR", default_value = "true", action = clap::ArgAction::Set)]
    pub require_sponsor: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct WithdrawalArgs {
    /// Smallest gross withdrawal, in cents
    #[arg(long, env = "MIN_WITHDRAWAL_CENTS", default_value = "1000")]
    pub min_withdrawal_cents: i64,

    /// Percentage fee in basis points (500 = 5%)
    #[arg(long, env = "WITHDRAWAL_FEE_BPS", default_value = "500")]
    pub withdrawal_fee_bps: u32,

    /// Flat fee added to every withdrawal, in cents
    #[arg(long, env = "WITHDRAWAL_FLAT_FEE_CENTS", default_value = "0")]
    pub withdrawal_flat_fee_cents: i64,

    /// Queue withdrawals for payout without admin approval
    #[arg(long, env = "AUTO_APPROVE_WITHDRAWALS", default_value = "false")]
    pub auto_approve_withdrawals: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct PayoutArgs {
    /// Disbursement API endpoint; unset uses the logging gateway (dev mode only)
    #[arg(long, env = "PAYOUT_URL")]
    pub payout_url: Option<String>,

    /// Bearer key for the disbursement API
    #[arg(long, env = "PAYOUT_API_KEY")]
    pub payout_api_key: Option<String>,

    /// Failed attempts before a withdrawal is refunded
    #[arg(long, env = "PAYOUT_MAX_ATTEMPTS", default_value = "3")]
    pub payout_max_attempts: u32,

    /// Backoff unit; attempt n waits 2^n of these
    #[arg(long, env = "PAYOUT_BACKOFF_BASE_SECS", default_value = "60")]
    pub payout_backoff_base_secs: u64,

    /// Queue entries taken per sweep
    #[arg(long, env = "PAYOUT_BATCH_SIZE", default_value = "50")]
    pub payout_batch_size: usize,

    /// Gateway request timeout in milliseconds
    #[arg(long, env = "PAYOUT_TIMEOUT_MS", default_value = "15000")]
    pub payout_timeout_ms: u64,

    /// How long a sweep holds a queue entry while paying it
    #[arg(long, env = "PAYOUT_CLAIM_LEASE_SECS", default_value = "300")]
    pub payout_claim_lease_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct SchedulerArgs {
    /// Run the periodic jobs inside the server process
    #[arg(long, env = "SCHEDULER_ENABLED", default_value = "true", action = clap::ArgAction::Set)]
    pub scheduler_enabled: bool,

    #[arg(long, env = "PAYOUT_SWEEP_INTERVAL_SECS", default_value = "60")]
    pub payout_sweep_interval_secs: u64,

    #[arg(long, env = "POOL_ACCRUAL_INTERVAL_SECS", default_value = "3600")]
    pub pool_accrual_interval_secs: u64,

    #[arg(long, env = "DISTRIBUTION_RETRY_INTERVAL_SECS", default_value = "300")]
    pub distribution_retry_interval_secs: u64,
}

impl Args {
    /// Token validator; dev mode without a secret uses the fixed dev one
    pub fn jwt_validator(&self) -> Result<JwtValidator, UplineError> {
        match &self.auth.jwt_secret {
            Some(secret) => JwtValidator::new(secret.clone(), self.auth.jwt_expiry_seconds),
            None if self.dev_mode => Ok(JwtValidator::new_dev()),
            None => Err(UplineError::Config("JWT secret not configured".into())),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn withdrawal_settings(&self) -> WithdrawalSettings {
        WithdrawalSettings {
            fees: FeeSchedule {
                minimum: Amount::from_cents(self.withdrawals.min_withdrawal_cents),
                percent: BasisPoints(self.withdrawals.withdrawal_fee_bps),
                flat: Amount::from_cents(self.withdrawals.withdrawal_flat_fee_cents),
            },
            auto_approve: self.withdrawals.auto_approve_withdrawals,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.payouts.payout_max_attempts,
            backoff_base: Duration::from_secs(self.payouts.payout_backoff_base_secs),
        }
    }

    pub fn payout_timeout(&self) -> Duration {
        Duration::from_millis(self.payouts.payout_timeout_ms)
    }

    pub fn payout_claim_lease(&self) -> Duration {
        Duration::from_secs(self.payouts.payout_claim_lease_secs)
    }

    /// HTTP gateway when PAYOUT_URL is set, the logging one in dev mode otherwise
    pub fn payout_gateway(&self) -> Result<Arc<dyn PayoutGateway>, UplineError> {
        match &self.payouts.payout_url {
            Some(url) => Ok(Arc::new(HttpPayoutGateway::new(
                url.clone(),
                self.payouts.payout_api_key.clone(),
                self.payout_timeout(),
            )?)),
            None if self.dev_mode => Ok(Arc::new(LoggingPayoutGateway)),
            None => Err(UplineError::Config("PAYOUT_URL is required in production mode".into())),
        }
    }

    pub fn scheduler_intervals(&self) -> SchedulerIntervals {
        SchedulerIntervals {
            payout_sweep: Duration::from_secs(self.scheduler.payout_sweep_interval_secs),
            pool_accrual: Duration::from_secs(self.scheduler.pool_accrual_interval_secs),
            distribution_retry: Duration::from_secs(self.scheduler.distribution_retry_interval_secs),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            match &self.auth.jwt_secret {
                None => return Err("JWT_SECRET is required in production mode".to_string()),
                Some(s) if s.len() < MIN_SECRET_LEN => {
                    return Err(format!("JWT_SECRET must be at least {MIN_SECRET_LEN} characters"));
                }
                Some(_) => {}
            }
            if self.payouts.payout_url.is_none() {
                return Err("PAYOUT_URL is required in production mode".to_string());
            }
        }

        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("LOG_FORMAT must be text or json, got {}", self.log_format));
        }

        if self.auth.admin_identifier.is_some() != self.auth.admin_password.is_some() {
            return Err("ADMIN_IDENTIFIER and ADMIN_PASSWORD must be set together".to_string());
        }

        let w = &self.withdrawals;
        if w.min_withdrawal_cents <= 0 {
            return Err("MIN_WITHDRAWAL_CENTS must be positive".to_string());
        }
        if w.withdrawal_fee_bps >= 10_000 {
            return Err("WITHDRAWAL_FEE_BPS must be below 10000".to_string());
        }
        if w.withdrawal_flat_fee_cents < 0 {
            return Err("WITHDRAWAL_FLAT_FEE_CENTS cannot be negative".to_string());
        }
        // The smallest allowed withdrawal must leave something after fees
        if self.withdrawal_settings().fees.quote(Amount::from_cents(w.min_withdrawal_cents)).is_err() {
            return Err("Fees consume the whole minimum withdrawal".to_string());
        }

        let p = &self.payouts;
        if p.payout_max_attempts == 0 {
            return Err("PAYOUT_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if p.payout_backoff_base_secs == 0 {
            return Err("PAYOUT_BACKOFF_BASE_SECS must be at least 1".to_string());
        }
        if p.payout_batch_size == 0 {
            return Err("PAYOUT_BATCH_SIZE must be at least 1".to_string());
        }
        if self.payout_claim_lease() <= self.payout_timeout() {
            return Err("PAYOUT_CLAIM_LEASE_SECS must outlast PAYOUT_TIMEOUT_MS".to_string());
        }

        let s = &self.scheduler;
        if s.payout_sweep_interval_secs == 0
            || s.pool_accrual_interval_secs == 0
            || s.distribution_retry_interval_secs == 0
        {
            return Err("Scheduler intervals must be at least 1 second".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["upline"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_dev_defaults_validate() {
        let args = parse(&["--dev-mode"]);
        assert!(args.validate().is_ok());
        assert!(args.jwt_validator().is_ok());
        assert_eq!(args.payout_gateway().unwrap().name(), "logging");
        assert_eq!(args.withdrawal_settings().fees, FeeSchedule::default());
        assert_eq!(args.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_production_needs_secret_and_gateway() {
        let args = parse(&[]);
        assert!(args.validate().unwrap_err().contains("JWT_SECRET"));

        let args = parse(&["--jwt-secret", "short"]);
        assert!(args.validate().unwrap_err().contains("32"));

        let secret = "s".repeat(40);
        let args = parse(&["--jwt-secret", &secret]);
        assert!(args.validate().unwrap_err().contains("PAYOUT_URL"));

        let args = parse(&["--jwt-secret", &secret, "--payout-url", "https://pay.example.com/v1/payouts"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_rejects_inconsistent_settings() {
        assert!(parse(&["--dev-mode", "--log-format", "xml"]).validate().is_err());
        assert!(parse(&["--dev-mode", "--admin-identifier", "root@example.com"])
            .validate()
            .is_err());
        assert!(parse(&["--dev-mode", "--withdrawal-fee-bps", "10000"]).validate().is_err());
        assert!(parse(&["--dev-mode", "--payout-max-attempts", "0"]).validate().is_err());
        assert!(parse(&["--dev-mode", "--payout-claim-lease-secs", "15"])
            .validate()
            .unwrap_err()
            .contains("PAYOUT_CLAIM_LEASE_SECS"));
        assert!(parse(&["--dev-mode", "--min-withdrawal-cents", "100", "--withdrawal-flat-fee-cents", "100"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_require_sponsor_can_be_disabled() {
        assert!(parse(&["--dev-mode"]).auth.require_sponsor);
        assert!(!parse(&["--dev-mode", "--require-sponsor", "false"]).auth.require_sponsor);
    }
}
