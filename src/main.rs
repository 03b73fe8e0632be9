//! Upline - referral commission and payout backend

use bson::DateTime;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use upline::{
    config::Args,
    ledger,
    logging::{init_tracing, LogFormat},
    payout::Scheduler,
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    init_tracing(&args.log_level, LogFormat::parse(&args.log_format));

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Upline - commissions and payouts");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {} (db: {})", args.mongodb_uri, args.mongodb_db);
    info!(
        "Withdrawals: min {} cents, fee {} bps + {} cents, auto-approve {}",
        args.withdrawals.min_withdrawal_cents,
        args.withdrawals.withdrawal_fee_bps,
        args.withdrawals.withdrawal_flat_fee_cents,
        args.withdrawals.auto_approve_withdrawals
    );
    info!(
        "Payouts: {} (max {} attempts, backoff base {}s)",
        args.payouts.payout_url.as_deref().unwrap_or("logging gateway"),
        args.payouts.payout_max_attempts,
        args.payouts.payout_backoff_base_secs
    );
    info!("======================================");

    let (ledger, storage) = match ledger::open(&args.mongodb_uri, &args.mongodb_db, args.dev_mode).await {
        Ok(opened) => opened,
        Err(e) => {
            error!("MongoDB connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let gateway = args.payout_gateway()?;
    info!("Payout gateway: {}", gateway.name());

    let state = Arc::new(AppState::new(args.clone(), ledger, gateway, storage)?);

    if let (Some(identifier), Some(password)) = (
        args.auth.admin_identifier.as_deref(),
        args.auth.admin_password.as_deref(),
    ) {
        match state.wallet.seed_admin(identifier, password, DateTime::now()).await {
            Ok(admin) => info!(user_id = %admin.id, "Root admin ready"),
            Err(e) => warn!("Failed to seed root admin: {}", e),
        }
    }

    if args.scheduler.scheduler_enabled {
        let scheduler = Arc::new(Scheduler::new(state.jobs.clone(), args.scheduler_intervals()));
        scheduler.start().await;
    } else {
        info!("Scheduler disabled - run upline-cron from an external scheduler");
    }

    if let Err(e) = server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
