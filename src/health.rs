//! Operational status of a running sync.

use std::sync::Arc;

use serde::Serialize;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::full_sync::{ImportSnapshot, ImportStatus};

/// A point-in-time view of the pipeline, serializable for logs or probes.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Last durable change log position, if any.
    pub checkpoint: Option<String>,
    /// Seconds behind the change log head, when the head is known.
    pub lag_seconds: Option<i64>,
    pub collections: Vec<ImportSnapshot>,
}

pub struct HealthProbe {
    store: Arc<dyn CheckpointStore>,
    stream_id: String,
    import: Arc<ImportStatus>,
}

impl HealthProbe {
    pub fn new(store: Arc<dyn CheckpointStore>, stream_id: String, import: Arc<ImportStatus>) -> Self {
        HealthProbe {
            store,
            stream_id,
            import,
        }
    }

    /// Snapshot the pipeline. `head` is the change log head, when the caller
    /// has one to compare against.
    pub async fn status(&self, head: Option<Checkpoint>) -> anyhow::Result<Status> {
        let checkpoint = self.store.last_known(&self.stream_id).await?;
        let lag_seconds = match (checkpoint, head) {
            (Some(checkpoint), Some(head)) => Some(checkpoint.lag_seconds(&head)),
            _ => None,
        };
        Ok(Status {
            checkpoint: checkpoint.map(|c| c.to_cli_string()),
            lag_seconds,
            collections: self.import.snapshot(),
        })
    }
}
