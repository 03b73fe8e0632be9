//! Upline Cron - run scheduled jobs once and exit
//!
//! For deployments that trigger jobs from an external scheduler instead of
//! the server's in-process loops.
//!
//! Usage:
//!   upline-cron --job payout-sweep
//!   upline-cron --job all
//!
//! Reads the same environment as the server (MONGODB_URI, PAYOUT_URL, ...).
//! Prints one JSON report per job on stdout; exits non-zero if any job failed.

use bson::DateTime;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use upline::{
    config::Args,
    ledger,
    logging::{init_tracing, LogFormat},
    payout::Job,
    server::AppState,
};

#[derive(Parser, Debug)]
#[command(name = "upline-cron")]
#[command(about = "Run Upline background jobs once")]
#[command(version)]
struct CronArgs {
    /// payout-sweep, pool-accrual, distribute or all
    #[arg(long, env = "CRON_JOB", default_value = "all")]
    job: String,

    #[command(flatten)]
    server: Args,
}

fn selected_jobs(name: &str) -> Result<Vec<Job>, String> {
    if name == "all" {
        return Ok(Job::ALL.to_vec());
    }
    name.parse::<Job>().map(|job| vec![job])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = CronArgs::parse();
    let args = cli.server;

    init_tracing(&args.log_level, LogFormat::parse(&args.log_format));

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let jobs = match selected_jobs(&cli.job) {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let (ledger, storage) = ledger::open(&args.mongodb_uri, &args.mongodb_db, args.dev_mode).await?;
    let gateway = args.payout_gateway()?;
    let state = Arc::new(AppState::new(args, ledger, gateway, storage)?);

    let mut failed = false;
    for job in jobs {
        info!(job = %job, "Running job");
        match state.jobs.run(job, DateTime::now()).await {
            Ok(report) => {
                let line = serde_json::json!({ "job": job.as_str(), "report": report });
                println!("{}", line);
            }
            Err(e) => {
                error!(job = %job, "Job failed: {}", e);
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
