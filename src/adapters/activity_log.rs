use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An audit entry describing an action taken on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub performed_by: Option<Uuid>,
    pub description: String,
    pub metadata: serde_json::Value,
}

impl ActivityEntry {
    pub fn new(
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Uuid,
        performed_by: Option<Uuid>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id,
            performed_by,
            description: description.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Inserted,
    Error,
}

/// Fire-and-forget audit trail. The status is only consulted to decide
/// whether follow-up syncs should run.
#[async_trait]
pub trait ActivityLogger: Send + Sync {
    async fn log(&self, entry: ActivityEntry) -> LogStatus;
}

/// Writes activity entries to the tracing stream under the `activity` target.
#[derive(Debug, Clone, Default)]
pub struct TracingActivityLogger;

#[async_trait]
impl ActivityLogger for TracingActivityLogger {
    async fn log(&self, entry: ActivityEntry) -> LogStatus {
        match serde_json::to_string(&entry.metadata) {
            Ok(metadata) => {
                tracing::info!(
                    target: "activity",
                    action = %entry.action,
                    entity_type = %entry.entity_type,
                    entity_id = %entry.entity_id,
                    performed_by = ?entry.performed_by,
                    %metadata,
                    "{}",
                    entry.description
                );
                LogStatus::Inserted
            }
            Err(e) => {
                tracing::warn!(error = %e, action = %entry.action, "could not serialize activity metadata");
                LogStatus::Error
            }
        }
    }
}
