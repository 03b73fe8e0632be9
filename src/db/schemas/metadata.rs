//! Common metadata embedded in every document
//!
//! Creation/update timestamps plus the soft-delete marker that
//! `MongoCollection` filters on.

use bson::DateTime;
use serde::{Deserialize, Serialize};

/// Common metadata for all documents
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,
}

impl Metadata {
    /// Metadata stamped with the current time
    pub fn new() -> Self {
        Self::at(DateTime::now())
    }

    /// Metadata stamped with a given time (used by services that run on an injected clock)
    pub fn at(now: DateTime) -> Self {
        Self {
            is_deleted: false,
            deleted_at: None,
            updated_at: Some(now),
            created_at: Some(now),
        }
    }

    /// Record a modification
    pub fn touch(&mut self, now: DateTime) {
        self.updated_at = Some(now);
    }

    /// Creation time in milliseconds, 0 when unknown
    pub fn created_millis(&self) -> i64 {
        self.created_at.map(|d| d.timestamp_millis()).unwrap_or(0)
    }
}
