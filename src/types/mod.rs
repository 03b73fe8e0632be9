//! Shared types for Upline

pub mod error;
pub mod money;

pub use error::{Result, UplineError};
pub use money::{Amount, BasisPoints};

/// Generate a new opaque document identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
