//! `MongoDB` backend.
//!
//! The database is the default database named in the connection string.
//! Every collection is keyed on `_id`. Server-side transactions are killed
//! after 60 seconds, so [`Txn`]s on this backend rotate at that boundary.

use std::time::Duration;

use async_trait::async_trait;
use ferry_storage_models::{
    ListPrimaryKeysResponse, ListTablesResponse, StorageType, TruncateRequest, TruncateResponse,
    UpsertRequest, UpsertResponse,
};
use mongodb::bson::{Document, doc};
use mongodb::options::{UpdateOneModel, WriteModel};
use mongodb::{Client, ClientSession, Database};
use tokio_util::sync::CancellationToken;

use crate::txn::{Operation, Session, Txn};
use crate::wire::{assign_record_document, decode_upsert_records};
use crate::{Storage, StorageError};

/// Maximum age of a server-side transaction.
pub const TRANSACTION_LIFETIME: Duration = Duration::from_secs(60);

const PRIMARY_KEY: &str = "_id";

/// A `MongoDB` connection.
#[derive(Debug, Clone)]
pub struct Mongo {
    client: Client,
    database: Database,
}

impl Mongo {
    /// Creates a client for `dns`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] if the connection string cannot
    /// be parsed or resolved, and [`StorageError::Configuration`] if it
    /// names no default database.
    pub async fn connect(dns: &str) -> Result<Self, StorageError> {
        let client = Client::with_uri_str(dns)
            .await
            .map_err(|e| StorageError::connection(StorageType::Mongo, e))?;
        Self::from_client(client)
    }

    fn from_client(client: Client) -> Result<Self, StorageError> {
        let database = client
            .default_database()
            .ok_or_else(|| StorageError::Configuration {
                message: "MongoDB connection string does not name a database".to_string(),
            })?;
        Ok(Self { client, database })
    }
}

#[async_trait]
impl Storage for Mongo {
    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.client.shutdown().await;
        Ok(())
    }

    async fn list_tables(&self) -> Result<ListTablesResponse, StorageError> {
        let names = self.database.list_collection_names().await?;
        Ok(ListTablesResponse {
            table_set: names.into_iter().collect(),
        })
    }

    async fn list_primary_keys(&self) -> Result<ListPrimaryKeysResponse, StorageError> {
        let names = self.database.list_collection_names().await?;
        Ok(ListPrimaryKeysResponse {
            pk_set: names
                .into_iter()
                .map(|name| (name, vec![PRIMARY_KEY.to_string()]))
                .collect(),
        })
    }

    async fn truncate(&self, request: &TruncateRequest) -> Result<TruncateResponse, StorageError> {
        truncate_collections(&self.database, request, None).await
    }

    async fn upsert(&self, request: &UpsertRequest) -> Result<UpsertResponse, StorageError> {
        upsert_documents(&self.client, &self.database, request, None).await
    }

    async fn start_tx(&self, cancel: CancellationToken) -> Result<Txn, StorageError> {
        let session = self.client.start_session().await?;
        Ok(Txn::start(
            MongoSession {
                client: self.client.clone(),
                database: self.database.clone(),
                session,
            },
            Some(TRANSACTION_LIFETIME),
            cancel,
        ))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Mongo
    }
}

/// One client session running a sequence of server-side transactions.
pub struct MongoSession {
    client: Client,
    database: Database,
    session: ClientSession,
}

#[async_trait]
impl Session for MongoSession {
    async fn begin(&mut self) -> Result<(), StorageError> {
        self.session.start_transaction().await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.session.commit_transaction().await?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StorageError> {
        self.session.abort_transaction().await?;
        Ok(())
    }

    async fn apply(&mut self, operation: &Operation) -> Result<UpsertResponse, StorageError> {
        match operation {
            Operation::Upsert(request) => {
                upsert_documents(
                    &self.client,
                    &self.database,
                    request,
                    Some(&mut self.session),
                )
                .await
            }
            Operation::Truncate(request) => {
                truncate_collections(&self.database, request, Some(&mut self.session)).await?;
                Ok(UpsertResponse::default())
            }
        }
    }
}

async fn truncate_collections(
    database: &Database,
    request: &TruncateRequest,
    mut session: Option<&mut ClientSession>,
) -> Result<TruncateResponse, StorageError> {
    for table in &request.tables {
        let collection = database.collection::<Document>(table);
        let action = collection.delete_many(doc! {});
        let result = match session.as_deref_mut() {
            Some(session) => action.session(session).await,
            None => action.await,
        };
        let deleted = result.map_err(|e| StorageError::Truncate {
            table: table.clone(),
            source: Box::new(e.into()),
        })?;
        log::debug!("Truncated {table}: {} documents", deleted.deleted_count);
    }
    Ok(TruncateResponse {})
}

async fn upsert_documents(
    client: &Client,
    database: &Database,
    request: &UpsertRequest,
    session: Option<&mut ClientSession>,
) -> Result<UpsertResponse, StorageError> {
    let records = decode_upsert_records(request)?;
    if records.is_empty() {
        return Ok(UpsertResponse::default());
    }

    let namespace = database.collection::<Document>(&request.table).namespace();
    let mut models = Vec::with_capacity(records.len());
    for record in &records {
        let mut document = Document::new();
        assign_record_document(record, &mut document)?;
        let (filter, update) = upsert_parts(document);
        models.push(WriteModel::UpdateOne(
            UpdateOneModel::builder()
                .namespace(namespace.clone())
                .filter(filter)
                .update(update)
                .upsert(true)
                .build(),
        ));
    }

    let action = client.bulk_write(models);
    let result = match session {
        Some(session) => action.session(session).await?,
        None => action.await?,
    };

    Ok(UpsertResponse {
        matched_count: u64::try_from(result.matched_count).unwrap_or_default(),
        upserted_count: u64::try_from(result.upserted_count).unwrap_or_default(),
    })
}

/// Builds the filter and update document for upserting `document`.
///
/// Documents carrying `_id` match on it alone; documents without one match
/// on every field, so re-sending an identical document is idempotent.
fn upsert_parts(document: Document) -> (Document, Document) {
    let filter = document.get(PRIMARY_KEY).map_or_else(
        || document.clone(),
        |id| doc! { "_id": id.clone() },
    );
    (filter, doc! { "$set": document })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lazy_client() -> Mongo {
        // Client construction does not contact the server.
        Mongo::connect("mongodb://localhost:27017/ferry").await.unwrap()
    }

    #[test]
    fn filters_on_id_when_present() {
        let (filter, update) = upsert_parts(doc! { "_id": 5, "name": "a" });
        assert_eq!(filter, doc! { "_id": 5 });
        assert_eq!(update, doc! { "$set": { "_id": 5, "name": "a" } });
    }

    #[test]
    fn filters_on_whole_document_without_id() {
        let (filter, update) = upsert_parts(doc! { "name": "a", "n": 1 });
        assert_eq!(filter, doc! { "name": "a", "n": 1 });
        assert_eq!(update, doc! { "$set": { "name": "a", "n": 1 } });
    }

    #[tokio::test]
    async fn uses_default_database_from_connection_string() {
        let mongo = lazy_client().await;
        assert_eq!(mongo.database.name(), "ferry");
        assert_eq!(mongo.storage_type(), StorageType::Mongo);
    }

    #[tokio::test]
    async fn requires_a_database_name() {
        let client = Client::with_uri_str("mongodb://localhost:27017").await.unwrap();
        assert!(matches!(
            Mongo::from_client(client),
            Err(StorageError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn empty_truncate_succeeds_without_contacting_server() {
        let mongo = lazy_client().await;
        mongo.truncate(&TruncateRequest::default()).await.unwrap();
    }

    #[tokio::test]
    async fn zero_record_upsert_succeeds_without_contacting_server() {
        let mongo = lazy_client().await;
        let response = mongo
            .upsert(&UpsertRequest::new("things", b"[]".to_vec()))
            .await
            .unwrap();
        assert_eq!(response, UpsertResponse::default());
    }
}
