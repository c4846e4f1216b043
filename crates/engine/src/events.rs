//! Status-change events and terminal notifications.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use db::models::{ExecutionError, ExecutionRecord, ExecutionStatus};
use nodes::collaborators::{HttpClient, HttpRequest};

/// Published whenever an execution pauses or reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.id,
            status: record.status,
            error: record.error.clone(),
            at: Utc::now(),
        }
    }
}

/// Event bus using a tokio broadcast channel.
/// All subscribers receive all events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Told about every terminal transition.  Failures never affect the
/// execution.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: &ExecutionRecord, url: &str) -> anyhow::Result<()>;
}

/// POSTs a JSON summary of the execution to the target's `notify_url`.
pub struct WebhookNotifier {
    http: Arc<dyn HttpClient>,
}

impl WebhookNotifier {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, record: &ExecutionRecord, url: &str) -> anyhow::Result<()> {
        let request = HttpRequest {
            method: "POST".into(),
            url: url.to_owned(),
            headers: [("content-type".to_owned(), "application/json".to_owned())].into(),
            body: Some(json!({
                "executionId": record.id,
                "targetId": record.target.id,
                "status": record.status,
                "error": record.error,
                "completedAt": record.completed_at,
            })),
        };

        let response = self.http.send(request).await?;
        if !response.is_success() {
            anyhow::bail!("notification endpoint answered HTTP {}", response.status);
        }
        debug!(execution_id = %record.id, url, "terminal notification delivered");
        Ok(())
    }
}

/// Fire-and-forget delivery on a detached task.
pub(crate) fn spawn_notification(
    notifier: Arc<dyn Notifier>,
    record: ExecutionRecord,
    url: String,
) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&record, &url).await {
            warn!(execution_id = %record.id, url = %url, error = %e, "terminal notification failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::{ExecutionTarget, NewExecution, TargetKind, TriggerKind};
    use nodes::mock::MockHttpClient;

    fn finished() -> ExecutionRecord {
        let mut record = ExecutionRecord::new(NewExecution {
            target: ExecutionTarget { kind: TargetKind::Workflow, id: Uuid::new_v4() },
            tenant_id: Uuid::nil(),
            triggered_by: None,
            trigger_kind: TriggerKind::Manual,
            input_data: json!({}),
        });
        record.apply_status(ExecutionStatus::Running, None);
        record.apply_status(ExecutionStatus::Completed, None);
        record
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let event = ExecutionEvent::from_record(&finished());
        bus.publish(event.clone());

        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn webhook_posts_execution_summary() {
        let http = Arc::new(MockHttpClient::default());
        let notifier = WebhookNotifier::new(http.clone());
        let record = finished();

        notifier.notify(&record, "https://hooks.example.test/done").await.unwrap();

        let sent = http.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "POST");
        let body = sent[0].body.as_ref().unwrap();
        assert_eq!(body["status"], "completed");
        assert_eq!(body["executionId"], json!(record.id));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let notifier = WebhookNotifier::new(Arc::new(MockHttpClient::responding(500, json!({}))));
        assert!(notifier.notify(&finished(), "https://hooks.example.test").await.is_err());
    }
}
