use chrono::{DateTime, Utc};
use linch_core::ExtensionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::policy::RiskLevel;

/// A request asking the host UI to confirm a sensitive permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub id: Uuid,
    pub extension: ExtensionId,
    pub permission: String,
    pub description: String,
    pub level: RiskLevel,
    pub created_at: DateTime<Utc>,
    /// Auto-deny after this many seconds.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationResponse {
    Approved,
    Denied,
    TimedOut,
}

impl ConfirmationResponse {
    pub fn is_approved(self) -> bool {
        self == ConfirmationResponse::Approved
    }
}

pub type ConfirmationReceiver =
    mpsc::Receiver<(ConfirmationRequest, oneshot::Sender<ConfirmationResponse>)>;

/// Forwards permission confirmation requests to whoever listens (a UI, a CLI
/// prompt, a test) and waits for the answer.
///
/// Nobody listening means denied.
pub struct ConfirmationGate {
    request_tx: mpsc::Sender<(ConfirmationRequest, oneshot::Sender<ConfirmationResponse>)>,
    request_rx: Mutex<Option<ConfirmationReceiver>>,
    timeout: Duration,
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl ConfirmationGate {
    pub fn new(timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            request_tx: tx,
            request_rx: Mutex::new(Some(rx)),
            timeout,
        }
    }

    /// Take the receiver. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<ConfirmationReceiver> {
        self.request_rx.lock().take()
    }

    /// Ask for confirmation. Resolves when answered, dropped, or timed out.
    pub async fn request_confirmation(
        &self,
        extension: &ExtensionId,
        permission: &str,
        description: &str,
        level: RiskLevel,
    ) -> ConfirmationResponse {
        if self.request_rx.lock().is_some() {
            warn!(extension = %extension, permission, "no confirmation listener, denying");
            return ConfirmationResponse::Denied;
        }

        let request = ConfirmationRequest {
            id: Uuid::new_v4(),
            extension: extension.clone(),
            permission: permission.to_string(),
            description: description.to_string(),
            level,
            created_at: Utc::now(),
            timeout_secs: self.timeout.as_secs(),
        };

        info!(
            request_id = %request.id,
            extension = %extension,
            permission,
            level = %level,
            "requesting permission confirmation"
        );

        let (response_tx, response_rx) = oneshot::channel();
        if self.request_tx.send((request, response_tx)).await.is_err() {
            return ConfirmationResponse::Denied;
        }

        match tokio::time::timeout(self.timeout, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => ConfirmationResponse::Denied,
            Err(_) => {
                info!(extension = %extension, permission, "confirmation request timed out");
                ConfirmationResponse::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denies_without_listener() {
        let gate = ConfirmationGate::new(Duration::from_secs(1));
        let resp = gate
            .request_confirmation(&"x".into(), "system:admin", "", RiskLevel::Critical)
            .await;
        assert_eq!(resp, ConfirmationResponse::Denied);
    }

    #[tokio::test]
    async fn listener_approves() {
        let gate = ConfirmationGate::new(Duration::from_secs(5));
        let mut rx = gate.take_receiver().unwrap();
        tokio::spawn(async move {
            while let Some((req, tx)) = rx.recv().await {
                let answer = if req.permission == "filesystem:read" {
                    ConfirmationResponse::Approved
                } else {
                    ConfirmationResponse::Denied
                };
                let _ = tx.send(answer);
            }
        });

        let ext: ExtensionId = "x".into();
        assert!(
            gate.request_confirmation(&ext, "filesystem:read", "", RiskLevel::High)
                .await
                .is_approved()
        );
        assert!(
            !gate
                .request_confirmation(&ext, "system:admin", "", RiskLevel::Critical)
                .await
                .is_approved()
        );
    }

    #[tokio::test]
    async fn silent_listener_times_out() {
        let gate = ConfirmationGate::new(Duration::from_millis(50));
        let _rx = gate.take_receiver().unwrap();
        let resp = gate
            .request_confirmation(&"x".into(), "system:config", "", RiskLevel::High)
            .await;
        assert_eq!(resp, ConfirmationResponse::TimedOut);
    }

    #[test]
    fn receiver_taken_once() {
        let gate = ConfirmationGate::default();
        assert!(gate.take_receiver().is_some());
        assert!(gate.take_receiver().is_none());
    }
}
