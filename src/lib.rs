//! Upline - referral commission and payout backend
//!
//! Members join under a sponsor, activate ranks and earn commissions from the
//! activations below them. Earnings are withdrawn through a payout queue.
//!
//! ## Services
//!
//! - **Income**: commission distribution per activation, rank pools, locked income claims
//! - **Wallet**: signup, activation, admin top-up, member transfers
//! - **Withdrawal**: fee quotes, balance holds, approve/reject/cancel
//! - **Payout**: gateway calls with bounded retry, refund on exhaustion, job scheduling
//! - **Team**: bounded upline/downline traversal
//! - **Ledger**: atomic guarded writes over MongoDB or memory

pub mod auth;
pub mod config;
pub mod db;
pub mod income;
pub mod ledger;
pub mod logging;
pub mod payout;
pub mod routes;
pub mod server;
pub mod team;
pub mod types;
pub mod wallet;
pub mod withdrawal;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{Result, UplineError};
