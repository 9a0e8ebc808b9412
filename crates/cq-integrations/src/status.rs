//! Fire-and-forget status push over HTTP.

use std::time::Duration;

use cq_core::{ChangeInfo, StatusPayload, StatusSink};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{normalize_base_url, IntegrationError, Result};

/// Posts every status update as JSON to a fixed URL. Each update is its own
/// background task; delivery failures are logged and dropped.
#[derive(Debug, Clone)]
pub struct HttpStatusSink {
    client: Client,
    url: String,
    runtime: Handle,
}

impl HttpStatusSink {
    /// Must be called from inside a tokio runtime.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|e| IntegrationError::NoRuntime(e.to_string()))?;
        let client = Client::builder()
            .user_agent(concat!("commit-queue/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: normalize_base_url(url)?,
            runtime,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Body of one status POST.
pub(crate) fn status_body(pending: &ChangeInfo, payload: &StatusPayload) -> Value {
    json!({
        "issue": pending.issue,
        "patchset": pending.patchset,
        "owner": pending.owner,
        "verification": payload.verification,
        "payload": payload.payload,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

impl StatusSink for HttpStatusSink {
    fn send(&self, pending: &ChangeInfo, payload: StatusPayload) {
        let body = status_body(pending, &payload);
        let request = self.client.post(&self.url).json(&body);
        let issue = pending.issue;
        let verification = payload.verification;
        self.runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(issue, verification = %verification, "Status pushed");
                }
                Ok(response) => {
                    warn!(
                        issue,
                        verification = %verification,
                        status = response.status().as_u16(),
                        "Status push rejected"
                    );
                }
                Err(e) => {
                    warn!(issue, verification = %verification, error = %e, "Status push failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn change() -> ChangeInfo {
        ChangeInfo {
            issue: 77,
            patchset: 4,
            owner: "dev@example.org".to_string(),
            reviewers: Vec::new(),
            description: "Tidy".to_string(),
            base_url: "https://git.example.org/p.git".to_string(),
            relpath: String::new(),
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn body_identifies_the_change() {
        let payload = StatusPayload::new("tests", json!({ "state": "running" }));
        let body = status_body(&change(), &payload);
        assert_eq!(body["issue"], 77);
        assert_eq!(body["patchset"], 4);
        assert_eq!(body["verification"], "tests");
        assert_eq!(body["payload"]["state"], "running");
    }

    #[test]
    fn construction_needs_a_runtime() {
        assert!(matches!(
            HttpStatusSink::new("https://status.example.org/push", Duration::from_secs(5)),
            Err(IntegrationError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_does_not_block_or_panic() {
        // Port 9 (discard) on loopback is closed in test environments.
        let sink = HttpStatusSink::new("http://127.0.0.1:9/status", Duration::from_millis(200))
            .unwrap();
        sink.send(
            &change(),
            StatusPayload::new("commit-queue", json!({ "state": "failed" })),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
