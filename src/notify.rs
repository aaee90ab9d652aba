//! Customer notifications on status changes.
//!
//! The core hands a [`NotificationPayload`] to a [`Notifier`] on a spawned
//! task after a write has committed. Delivery errors are logged by the
//! caller and never surface to staff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::models::VehicleStatus;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of the SMS webhook call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub status: VehicleStatus,
    pub plate_number: String,
    pub service_type: String,
    pub phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_number: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification endpoint returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Posts the payload as JSON to a webhook (the SMS gateway bridge).
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let resp = self.client.post(&self.endpoint).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(plate = %payload.plate_number, status = %payload.status, "notification sent");
        Ok(())
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        debug!(plate = %payload.plate_number, status = %payload.status, "notifications disabled, skipping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_uses_webhook_field_names() {
        let payload = NotificationPayload {
            status: VehicleStatus::Waiting,
            plate_number: "ABC-1234".into(),
            service_type: "Wash + Wax".into(),
            phone_number: "+639171234567".into(),
            queue_number: Some(3),
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "status": "waiting",
                "plateNumber": "ABC-1234",
                "serviceType": "Wash + Wax",
                "phoneNumber": "+639171234567",
                "queueNumber": 3
            })
        );
    }

    #[test]
    fn test_queue_number_omitted_when_absent() {
        let payload = NotificationPayload {
            status: VehicleStatus::PaymentPending,
            plate_number: "ABC-1234".into(),
            service_type: "Wash".into(),
            phone_number: "+639171234567".into(),
            queue_number: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("queueNumber").is_none());
        assert_eq!(value["status"], "payment-pending");
    }

    #[tokio::test]
    async fn test_noop_notifier_succeeds() {
        let payload = NotificationPayload {
            status: VehicleStatus::InProgress,
            plate_number: "X1".into(),
            service_type: String::new(),
            phone_number: "+639171234567".into(),
            queue_number: None,
        };
        assert!(NoopNotifier.notify(&payload).await.is_ok());
    }
}
