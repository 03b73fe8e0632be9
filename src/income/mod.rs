//! Commission calculation
//!
//! - `ranks`: rank tiers and activation order
//! - `plan`: prices and percentage tables
//! - `engine`: referral, level and global income per activation
//! - `pool`: rank pool accrual and lock-gated claims

pub mod engine;
pub mod plan;
pub mod pool;
pub mod ranks;

pub use engine::{compute_credits, Credit, Credits, DistributionEngine, DistributionSummary, PendingRun};
pub use plan::{IncomePlan, RankTier, GLOBAL_DEPTH, LEVEL_DEPTH};
pub use pool::{AccrualReport, ClaimResult, PoolService, PoolSummary, RankAccrual};
pub use ranks::Rank;
