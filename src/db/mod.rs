//! MongoDB persistence
//!
//! Client/collection wrappers plus the document schemas.

pub mod mongo;
pub mod schemas;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection};
