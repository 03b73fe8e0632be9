//! MongoDB client and collection wrapper
//!
//! Typed collections apply their schema indexes on open and hide
//! soft-deleted documents from reads.

use bson::{doc, Document};
use futures_util::StreamExt;
use mongodb::{options::IndexOptions, Client, ClientSession, Collection, IndexModel};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

use crate::types::UplineError;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and ping the database
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, UplineError> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast instead of hanging on an unreachable server
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| UplineError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| UplineError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>, UplineError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Start a session for a multi-document transaction
    pub async fn start_session(&self) -> Result<ClientSession, UplineError> {
        self.client
            .start_session()
            .await
            .map_err(|e| UplineError::Database(format!("Failed to start session: {}", e)))
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
{
    /// Open a collection and apply indexes
    pub async fn new(
        client: &Client,
        db_name: &str,
        collection_name: &str,
    ) -> Result<Self, UplineError> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    async fn apply_indexes(&self) -> Result<(), UplineError> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| UplineError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Insert inside a transaction; metadata is kept as the caller stamped it
    pub async fn insert_in(&self, item: &T, session: &mut ClientSession) -> Result<(), UplineError> {
        self.inner
            .insert_one(item)
            .session(session)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    /// Find one live document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, UplineError> {
        self.inner
            .find_one(live(filter))
            .await
            .map_err(|e| UplineError::Database(format!("Find failed: {}", e)))
    }

    /// Find live documents by filter
    pub async fn find_many(&self, filter: Document) -> Result<Vec<T>, UplineError> {
        self.find_sorted(filter, doc! {}, 0, 0).await
    }

    /// Find live documents with sort, skip and limit (0 means unbounded)
    pub async fn find_sorted(
        &self,
        filter: Document,
        sort: Document,
        skip: u64,
        limit: i64,
    ) -> Result<Vec<T>, UplineError> {
        let mut find = self.inner.find(live(filter));
        if !sort.is_empty() {
            find = find.sort(sort);
        }
        if skip > 0 {
            find = find.skip(skip);
        }
        if limit > 0 {
            find = find.limit(limit);
        }

        let cursor = find
            .await
            .map_err(|e| UplineError::Database(format!("Find failed: {}", e)))?;

        let results: Vec<T> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    /// Count live documents
    pub async fn count(&self, filter: Document) -> Result<u64, UplineError> {
        self.inner
            .count_documents(live(filter))
            .await
            .map_err(|e| UplineError::Database(format!("Count failed: {}", e)))
    }

    /// Get the underlying collection for advanced operations
    pub fn inner(&self) -> &Collection<T> {
        &self.inner
    }
}

/// Exclude soft-deleted documents
fn live(mut filter: Document) -> Document {
    filter.insert("metadata.is_deleted", doc! { "$ne": true });
    filter
}

/// Duplicate keys inside a transaction are conflicts, not outages
pub(crate) fn map_write_error(err: mongodb::error::Error) -> UplineError {
    use mongodb::error::{ErrorKind, WriteFailure};

    let duplicate = match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::Command(ce) => ce.code == 11000,
        _ => false,
    };

    if duplicate {
        UplineError::Conflict("Duplicate key".into())
    } else {
        UplineError::Database(format!("Write failed: {}", err))
    }
}
