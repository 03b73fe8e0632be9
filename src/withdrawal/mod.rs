//! Withdrawal requests
//!
//! A request moves the gross amount from available to pending and creates
//! a `pending` withdrawal. Approval queues it for payout; rejection (or the
//! member cancelling) returns the funds.

pub mod fees;
pub mod service;

pub use fees::{FeeQuote, FeeSchedule};
pub use service::{rejection_ops, WithdrawalService, WithdrawalSettings};
