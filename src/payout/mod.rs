//! Payout processing
//!
//! - `gateway`: the disbursement client seam
//! - `processor`: queue sweep with retry, backoff and refund
//! - `scheduler`: interval loops and one-shot job runs

pub mod gateway;
pub mod processor;
pub mod scheduler;

pub use gateway::{
    HttpPayoutGateway, LoggingPayoutGateway, PayoutGateway, PayoutReceipt, PayoutRequest,
    DEFAULT_GATEWAY_TIMEOUT,
};
pub use processor::{PayoutProcessor, RetryPolicy, SweepOutcome, SweepReport};
pub use scheduler::{Job, JobReport, JobRunner, Scheduler, SchedulerIntervals};
