//! Delivery of status transitions to an HTTP endpoint.

use build_agent_client::{BoundedRetryingClient, ClientRequest, Method, RetryConfig};
use build_agent_session::SessionEvent;
use tokio::sync::mpsc;

/// Responses of the callback endpoint are not used past this size.
pub const MAX_CALLBACK_RESPONSE: usize = 64 * 1024;

/// Where status transitions are posted.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub url: String,
    pub retry: RetryConfig,
}

impl CallbackConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry: RetryConfig::default(),
        }
    }
}

/// POST every event from `events` to `url` as JSON, one at a time and in
/// order. Runs until the feed closes.
pub async fn forward_status(
    client: BoundedRetryingClient,
    url: String,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to serialize status event: {e}");
                continue;
            }
        };
        let request = ClientRequest::new(Method::POST, url.as_str())
            .header("content-type", "application/json")
            .body(body);

        match client.invoke(&request, MAX_CALLBACK_RESPONSE).await {
            Ok(response) if (200..300).contains(&response.status) => {
                tracing::debug!(
                    context = %event.context,
                    task_id = event.event.task_id,
                    status = %event.event.new_status,
                    "Status delivered"
                );
            }
            Ok(response) => tracing::warn!(
                context = %event.context,
                status = response.status,
                "Status callback rejected: {}",
                response.text()
            ),
            Err(e) => tracing::error!(context = %event.context, "Status callback failed: {e}"),
        }
    }
    tracing::debug!("Status feed closed");
}
