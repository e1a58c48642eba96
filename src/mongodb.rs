//! MongoDB as a document and change log source.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{ClientOptions, FullDocumentType};
use mongodb::Client as MongoClient;
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::full_sync::DocumentSource;
use crate::incremental_sync::{ChangeEvent, ChangeLogSource, ChangeOp, ChangeStream};

pub struct MongoSource {
    client: MongoClient,
    database: String,
}

/// Connect to the source deployment. Change streams require a replica set.
pub async fn connect(uri: &str, database: &str) -> anyhow::Result<MongoSource> {
    let mut options = ClientOptions::parse(uri)
        .await
        .context("failed to parse the MongoDB connection string")?;
    options.server_selection_timeout = Some(Duration::from_secs(10));
    options.connect_timeout = Some(Duration::from_secs(10));
    let client =
        MongoClient::with_options(options).context("failed to create the MongoDB client")?;
    info!(database, "connected to MongoDB");
    Ok(MongoSource {
        client,
        database: database.to_string(),
    })
}

#[async_trait]
impl DocumentSource for MongoSource {
    async fn collection_documents(
        &self,
        collection: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Document>>> {
        let cursor = self
            .client
            .database(&self.database)
            .collection::<Document>(collection)
            .find(doc! {})
            .await
            .with_context(|| format!("failed to scan collection '{collection}'"))?;
        Ok(cursor.map_err(anyhow::Error::from).boxed())
    }
}

#[async_trait]
impl ChangeLogSource for MongoSource {
    async fn open(&self, from: Option<Checkpoint>) -> anyhow::Result<Box<dyn ChangeStream>> {
        // UpdateLookup makes update events carry the whole document, which
        // the mapper needs to rebuild every derived row.
        let database = self.client.database(&self.database);
        let mut watch = database
            .watch()
            .full_document(FullDocumentType::UpdateLookup);
        if let Some(from) = from {
            watch = watch.start_at_operation_time(from.into());
        }
        let stream = watch.await.context("failed to open the change stream")?;
        Ok(Box::new(MongoEventStream { inner: stream }))
    }

    async fn latest_position(&self) -> anyhow::Result<Checkpoint> {
        let entry = self
            .client
            .database("local")
            .collection::<Document>("oplog.rs")
            .find_one(doc! {})
            .sort(doc! { "$natural": -1 })
            .await
            .context("failed to read the oplog head")?
            .context("the oplog is empty; is the source a replica set member?")?;
        match entry.get("ts") {
            Some(Bson::Timestamp(ts)) => Ok(Checkpoint::from(*ts)),
            other => anyhow::bail!("oplog head has an unexpected ts field: {other:?}"),
        }
    }
}

struct MongoEventStream {
    inner: mongodb::change_stream::ChangeStream<ChangeStreamEvent<Document>>,
}

#[async_trait]
impl ChangeStream for MongoEventStream {
    async fn next_event(&mut self) -> anyhow::Result<Option<ChangeEvent>> {
        let Some(event) = self
            .inner
            .next()
            .await
            .transpose()
            .context("the change stream failed")?
        else {
            return Ok(None);
        };
        decode_event(event).map(Some)
    }
}

fn decode_event(event: ChangeStreamEvent<Document>) -> anyhow::Result<ChangeEvent> {
    let position = match event.cluster_time {
        Some(ts) => Checkpoint::from(ts),
        None => anyhow::bail!("change event carries no cluster time"),
    };
    let collection = event.ns.as_ref().and_then(|ns| ns.coll.clone());
    let op = match event.operation_type {
        OperationType::Insert | OperationType::Update | OperationType::Replace => {
            match (collection, event.full_document) {
                (Some(collection), Some(document)) => ChangeOp::Upsert {
                    collection,
                    document,
                },
                // The document vanished before the lookup ran; the delete
                // event that follows will clean up.
                _ => ChangeOp::Skip,
            }
        }
        OperationType::Delete => {
            let id = event
                .document_key
                .as_ref()
                .and_then(|key| key.get("_id"))
                .cloned();
            match (collection, id) {
                (Some(collection), Some(id)) => ChangeOp::Delete { collection, id },
                _ => ChangeOp::Skip,
            }
        }
        other => {
            debug!(operation = ?other, "ignoring change stream operation");
            ChangeOp::Skip
        }
    };
    Ok(ChangeEvent { op, position })
}
